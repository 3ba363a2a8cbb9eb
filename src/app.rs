use std::path::PathBuf;
use crate::config::ConnectionConfig;

#[derive(clap::Parser, Debug)]
#[command(version, about = "Interactive shell for a virtualization management server", long_about = "Interactive shell for a virtualization management server. The inventory is browsed like a file system and every command operates on paths. Without a server, --simulate starts against a small in-memory inventory.")]
pub struct App {
    /// Server to connect to, as [user[:password]@]host[:port]
    #[arg(env = "VSHELL_TARGET")]
    pub target: Option<String>,

    /// Server to connect to
    #[arg(short = 'H', long, env = "VSHELL_HOST")]
    pub host: Option<String>,

    /// Username for the management API
    #[arg(short, long, env = "VSHELL_USER")]
    pub user: Option<String>,

    /// Password; prompted for when missing
    #[arg(short, long, env = "VSHELL_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// HTTPS port
    #[arg(long, env = "VSHELL_PORT")]
    pub port: Option<u16>,

    /// API release used in request paths
    #[arg(long, env = "VSHELL_RELEASE")]
    pub release: Option<String>,

    /// Accept invalid server certificates
    #[arg(short = 'k', long, default_value_t = false, env = "VSHELL_INSECURE")]
    pub insecure: bool,

    /// Run against the built-in in-memory inventory instead of a server
    #[arg(long, default_value_t = false)]
    pub simulate: bool,

    /// Configuration file. Defaults to config.toml in the platform config directory
    #[arg(short, long, env = "VSHELL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Command to run before the prompt; may be repeated
    #[arg(short, long = "execute")]
    pub execute: Vec<String>,
}

/// Pieces of a `[user[:password]@]host[:port]` target
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TargetSpec {
    pub user: Option<String>,
    pub password: Option<String>,
    pub host: String,
    pub port: Option<u16>,
}

impl TargetSpec {
    pub fn parse(s: &str) -> Result<Self, String> {
        let (credentials, address) = match s.rsplit_once('@') {
            Some((credentials, address)) => (Some(credentials), address),
            None => (None, s),
        };
        let (user, password) = match credentials {
            Some(c) => match c.split_once(':') {
                Some((user, password)) => (Some(user.to_string()), Some(password.to_string())),
                None => (Some(c.to_string()), None),
            },
            None => (None, None),
        };
        let (host, port) = match address.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse().map_err(|_| format!("invalid port in {}", s))?;
                (host, Some(port))
            }
            None => (address, None),
        };
        if host.is_empty() {
            return Err(format!("no host in {}", s));
        }
        Ok(Self {
            user,
            password,
            host: host.to_string(),
            port,
        })
    }
}

impl App {
    /// Connection settings: flags win over the target argument, which wins over the file
    pub fn connection(&self, file: &ConnectionConfig) -> Result<(ConnectionConfig, Option<String>), String> {
        let target = self.target.as_deref().map(TargetSpec::parse).transpose()?.unwrap_or_default();
        let host = self.host.clone()
            .or_else(|| (!target.host.is_empty()).then(|| target.host.clone()))
            .or_else(|| file.host.clone());
        let merged = ConnectionConfig {
            host,
            user: self.user.clone().or(target.user).or_else(|| file.user.clone()),
            port: self.port.or(target.port).unwrap_or(file.port),
            release: self.release.clone().or_else(|| file.release.clone()),
            insecure: self.insecure || file.insecure,
        };
        Ok((merged, self.password.clone().or(target.password)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_target_spec() {
        assert_eq!(TargetSpec::parse("vc.lab").unwrap(), TargetSpec { host: "vc.lab".to_string(), ..Default::default() });
        let spec = TargetSpec::parse("admin:s3cr:et@vc.lab:8443").unwrap();
        assert_eq!(spec.user.as_deref(), Some("admin"));
        assert_eq!(spec.password.as_deref(), Some("s3cr:et"));
        assert_eq!(spec.host, "vc.lab");
        assert_eq!(spec.port, Some(8443));
        assert!(TargetSpec::parse("vc.lab:https").is_err());
        assert!(TargetSpec::parse("root@").is_err());
    }

    #[test]
    fn test_flags_override_target_and_file() {
        let file = ConnectionConfig {
            host: Some("file.lab".to_string()),
            user: Some("file-user".to_string()),
            port: 9443,
            ..Default::default()
        };
        let app = App::try_parse_from(["vshell", "root:pw@vc.lab", "--user", "ops"]).unwrap();
        let (merged, password) = app.connection(&file).unwrap();
        assert_eq!(merged.host.as_deref(), Some("vc.lab"));
        assert_eq!(merged.user.as_deref(), Some("ops"));
        assert_eq!(merged.port, 9443);
        assert_eq!(password.as_deref(), Some("pw"));

        let app = App::try_parse_from(["vshell", "--simulate"]).unwrap();
        let (merged, password) = app.connection(&file).unwrap();
        assert_eq!(merged.host.as_deref(), Some("file.lab"));
        assert!(password.is_none());
    }
}
