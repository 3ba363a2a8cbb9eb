use std::path::PathBuf;
use directories::ProjectDirs;

/// Where vshell looks for its files
#[derive(Debug, Clone)]
pub struct PathManager {
    /// Directory for configuration files
    pub config_dir: PathBuf,
}

impl PathManager {
    /// Use the platform config directory when there is one, the current directory otherwise
    pub fn new() -> Self {
        match ProjectDirs::from("", "", "vshell") {
            Some(proj_dirs) => Self {
                config_dir: proj_dirs.config_dir().to_path_buf(),
            },
            None => {
                log::info!("Using fallback directories for configuration");
                Self {
                    config_dir: PathBuf::from("."),
                }
            }
        }
    }

    /// Get the default configuration file path
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }
}

impl Default for PathManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_file_name() {
        let paths = PathManager::new();
        assert!(paths.config_file().ends_with("config.toml"));
    }
}
