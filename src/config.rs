//! Configuration loading and defaults.
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [session]
//! namespace = "/tmp/ns.remux"          # local sockets for plumb/editor ports
//! server = "remuxd"                     # remote program spoken to over ssh
//! pass_env = ["TERM"]                   # variables forwarded to remote shells
//!
//! [logging]
//! level = "info"
//!
//! [[remote]]
//! host = "dev1"
//! prefixes = ["/n/dev1"]               # paths routed to this host
//! # command = ["ssh", "-o", "BatchMode=yes", "dev1", "remuxd"]  # override
//! ```
//!
//! Every `[[remote]]` block names one host and the path prefixes that route
//! to it. The default transport command is `ssh <host> <server>`.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Remote hosts and their routed prefixes.
    #[serde(default, rename = "remote")]
    pub remotes: Vec<RemoteConfig>,
}

/// Session-layer settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Directory holding the plumb/editor service sockets.
    #[serde(default = "default_namespace")]
    pub namespace: PathBuf,
    /// Program to run on the remote host (default `remuxd`).
    #[serde(default = "default_server")]
    pub server: String,
    /// Environment variables forwarded to remote commands.
    #[serde(default = "default_pass_env")]
    pub pass_env: Vec<String>,
}

/// One remote host.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    /// Host identifier, handed to ssh.
    pub host: String,
    /// Path prefixes routed to this host.
    #[serde(default)]
    pub prefixes: Vec<String>,
    /// Full transport command override; empty means `ssh <host> <server>`.
    #[serde(default)]
    pub command: Vec<String>,
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Tracing filter (default `info`).
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_namespace() -> PathBuf {
    PathBuf::from("/tmp/ns.remux")
}

fn default_server() -> String {
    "remuxd".to_string()
}

fn default_pass_env() -> Vec<String> {
    vec!["TERM".to_string()]
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            namespace: default_namespace(),
            server: default_server(),
            pass_env: default_pass_env(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Config, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
        toml::from_str(&text).map_err(|e| format!("cannot parse {}: {e}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_remotes_with_defaults() {
        let config: Config = toml::from_str(
            r#"
            [[remote]]
            host = "dev1"
            prefixes = ["/n/dev1"]

            [[remote]]
            host = "dev2"
            prefixes = ["/n/dev2", "/build"]
            command = ["ssh", "-p", "2222", "dev2", "remuxd"]
            "#,
        )
        .unwrap();

        assert_eq!(config.remotes.len(), 2);
        assert_eq!(config.remotes[0].host, "dev1");
        assert!(config.remotes[0].command.is_empty());
        assert_eq!(config.remotes[1].prefixes.len(), 2);
        assert_eq!(config.session.server, "remuxd");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn empty_config_is_valid() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.remotes.is_empty());
        assert_eq!(config.session.namespace, PathBuf::from("/tmp/ns.remux"));
    }
}
