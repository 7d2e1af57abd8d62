//! Layered configuration for the naming server binary (§4.8): built-in
//! defaults, overridden by an optional TOML file, overridden by explicit
//! CLI flags. Uses the `clap`/`serde`/`toml` trio already present in
//! `nfs-mamont`'s own dependency table.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

use crate::replication::DEFAULT_REPLICATION_THRESHOLD;

fn default_client_bind() -> SocketAddr {
    "127.0.0.1:8080".parse().unwrap()
}

fn default_registration_bind() -> SocketAddr {
    "127.0.0.1:8081".parse().unwrap()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Values as they may appear in an optional TOML config file. Every
/// field is optional: an absent field falls through to the built-in
/// default, or is overridden by a CLI flag.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    client_bind: Option<SocketAddr>,
    registration_bind: Option<SocketAddr>,
    replication_threshold: Option<u64>,
    log_level: Option<String>,
}

/// CLI flags for the naming server binary. Any flag present here takes
/// precedence over both the TOML file and the built-in defaults.
#[derive(Debug, Parser)]
#[command(name = "naming-server", about = "Naming service coordination core")]
pub struct Cli {
    /// Path to an optional TOML configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Bind address for the client-facing service endpoint (§6.1).
    #[arg(long)]
    pub client_bind: Option<SocketAddr>,

    /// Bind address for the storage registration endpoint (§6.2).
    #[arg(long)]
    pub registration_bind: Option<SocketAddr>,

    /// Access-count threshold at which a file is replicated (§4.5).
    #[arg(long)]
    pub replication_threshold: Option<u64>,

    /// `tracing-subscriber` `EnvFilter` directive, e.g. `info` or `debug`.
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Fully resolved configuration, after merging defaults, file, and CLI
/// flags in that precedence order.
#[derive(Debug, Clone)]
pub struct NamingConfig {
    pub client_bind: SocketAddr,
    pub registration_bind: SocketAddr,
    pub replication_threshold: u64,
    pub log_level: String,
}

impl Default for NamingConfig {
    fn default() -> Self {
        NamingConfig {
            client_bind: default_client_bind(),
            registration_bind: default_registration_bind(),
            replication_threshold: DEFAULT_REPLICATION_THRESHOLD,
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("failed to parse config file {path}: {source}")]
    Parse { path: PathBuf, source: toml::de::Error },
}

impl NamingConfig {
    /// Resolves a [`NamingConfig`] from CLI flags, loading `cli.config`
    /// if given. CLI flags always win over file values; file values
    /// always win over built-in defaults.
    pub fn resolve(cli: &Cli) -> Result<NamingConfig, ConfigError> {
        let file = match &cli.config {
            Some(path) => Self::load_file(path)?,
            None => FileConfig::default(),
        };

        let defaults = NamingConfig::default();
        Ok(NamingConfig {
            client_bind: cli.client_bind.or(file.client_bind).unwrap_or(defaults.client_bind),
            registration_bind: cli
                .registration_bind
                .or(file.registration_bind)
                .unwrap_or(defaults.registration_bind),
            replication_threshold: cli
                .replication_threshold
                .or(file.replication_threshold)
                .unwrap_or(defaults.replication_threshold),
            log_level: cli
                .log_level
                .clone()
                .or(file.log_level)
                .unwrap_or(defaults.log_level),
        })
    }

    fn load_file(path: &PathBuf) -> Result<FileConfig, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.clone(), source })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse { path: path.clone(), source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_cli() -> Cli {
        Cli {
            config: None,
            client_bind: None,
            registration_bind: None,
            replication_threshold: None,
            log_level: None,
        }
    }

    #[test]
    fn resolves_to_defaults_with_no_file_or_flags() {
        let resolved = NamingConfig::resolve(&bare_cli()).unwrap();
        assert_eq!(resolved.client_bind, default_client_bind());
        assert_eq!(resolved.replication_threshold, DEFAULT_REPLICATION_THRESHOLD);
        assert_eq!(resolved.log_level, "info");
    }

    #[test]
    fn cli_flag_overrides_default() {
        let mut cli = bare_cli();
        cli.replication_threshold = Some(5);
        let resolved = NamingConfig::resolve(&cli).unwrap();
        assert_eq!(resolved.replication_threshold, 5);
    }

    #[test]
    fn file_values_apply_but_cli_flag_still_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("naming.toml");
        std::fs::write(&path, "replication_threshold = 7\nlog_level = \"debug\"\n").unwrap();

        let mut cli = bare_cli();
        cli.config = Some(path);
        cli.replication_threshold = Some(42);
        let resolved = NamingConfig::resolve(&cli).unwrap();
        assert_eq!(resolved.replication_threshold, 42);
        assert_eq!(resolved.log_level, "debug");
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let mut cli = bare_cli();
        cli.config = Some(PathBuf::from("/nonexistent/naming.toml"));
        assert!(matches!(NamingConfig::resolve(&cli), Err(ConfigError::Read { .. })));
    }
}
