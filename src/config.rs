use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("Invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Contents of `config.toml`. Every field is optional in the file.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub connection: ConnectionConfig,
    pub shell: ShellSettings,
}

/// Defaults for the command line connection flags
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    pub host: Option<String>,
    pub user: Option<String>,
    pub port: u16,
    pub release: Option<String>,
    pub insecure: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: None,
            user: None,
            port: 443,
            release: None,
            insecure: false,
        }
    }
}

/// Tuning knobs the commands read at run time
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ShellSettings {
    /// Task and guest process polling period
    pub poll_interval_ms: u64,
    /// Upper bound for tracked tasks; unset waits forever
    pub task_timeout_secs: Option<u64>,
    /// Pause between a host reboot and the first readiness check
    pub reboot_grace_secs: u64,
    pub default_guest_user: String,
    /// Local names skipped by `upload_directory`
    pub upload_exclude: String,
}

impl Default for ShellSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            task_timeout_secs: None,
            reboot_grace_secs: 180,
            default_guest_user: "root".to_string(),
            upload_exclude: r"^\.svn$|^\.git$".to_string(),
        }
    }
}

impl ShellSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_secs.map(Duration::from_secs)
    }

    pub fn reboot_grace(&self) -> Duration {
        Duration::from_secs(self.reboot_grace_secs)
    }
}

impl Config {
    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Read `path`; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                log::info!("Loading configuration from {}", path.display());
                Self::from_toml(&content)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No configuration at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Io { path: path.to_path_buf(), source }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml("[shell]\npoll_interval_ms = 250\n\n[connection]\nhost = \"vc.lab\"\n").unwrap();
        assert_eq!(config.shell.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.shell.reboot_grace_secs, 180);
        assert_eq!(config.shell.default_guest_user, "root");
        assert_eq!(config.connection.host.as_deref(), Some("vc.lab"));
        assert_eq!(config.connection.port, 443);
        assert!(config.shell.task_timeout().is_none());
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(Config::from_toml("[shell]\npoll_interval_ms = \"fast\""), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_load_missing_and_present_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        assert_eq!(Config::load(&path).unwrap(), Config::default());

        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[shell]\ntask_timeout_secs = 30").unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.shell.task_timeout(), Some(Duration::from_secs(30)));
    }
}
