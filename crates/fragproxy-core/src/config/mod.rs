//! Configuration management for fragproxy
//!
//! Provides a strongly-typed configuration system with TOML support.
//! All fields have sane defaults so a `Config::default()` is a valid,
//! runnable configuration on its own.

use crate::error::{Error, Result};
use crate::fragment::FragmentMethod;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Domain matching strictness for the file-backed blacklist oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// Exact/suffix matching only.
    Strict,
    /// Exact/suffix matching plus substring containment.
    Loose,
}

impl Default for MatchMode {
    fn default() -> Self {
        Self::Strict
    }
}

/// Which blacklist oracle variant backs fragmentation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlacklistMode {
    /// Load a static domain list from disk.
    File,
    /// Start empty and probe domains on demand.
    Auto,
    /// Fragment every domain unconditionally.
    None,
}

impl Default for BlacklistMode {
    fn default() -> Self {
        Self::File
    }
}

/// Main configuration structure.
///
/// Immutable once loaded: `ConnectionCore` and `Supervisor` only ever read
/// from a shared `Arc<Config>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener bind address.
    pub host: String,
    /// Listener bind port.
    pub port: u16,
    /// Optional source-interface address for origin-side binding.
    pub out_host: Option<String>,
    /// Default fragmentation method, unless overridden by a rule.
    pub fragment_method: FragmentMethod,
    /// Domain matching strictness for the file-backed oracle.
    pub domain_matching: MatchMode,
    /// Which blacklist oracle variant to construct.
    pub blacklist_mode: BlacklistMode,
    /// Path to the blacklist file (used by `BlacklistMode::File` and
    /// `BlacklistMode::Auto`, which appends newly discovered domains to it).
    pub blacklist_file: PathBuf,
    /// Optional path to a JSON rules file.
    pub rules_file: Option<PathBuf>,
    /// Optional path for the periodic JSON stats snapshot.
    pub stats_file: Option<PathBuf>,
    /// Optional path for the plain-text access log.
    pub log_access_file: Option<PathBuf>,
    /// Optional path for the plain-text error log.
    pub log_error_file: Option<PathBuf>,
    /// Bound to wait for an origin TCP connect, in seconds.
    pub connect_timeout_secs: f64,
    /// Bound to wait for the client's first chunk(s), in seconds.
    pub initial_read_timeout_secs: f64,
    /// Suppress periodic console statistics.
    pub quiet: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8881,
            out_host: None,
            fragment_method: FragmentMethod::Random,
            domain_matching: MatchMode::Strict,
            blacklist_mode: BlacklistMode::File,
            blacklist_file: PathBuf::from("blacklist.txt"),
            rules_file: None,
            stats_file: None,
            log_access_file: None,
            log_error_file: None,
            connect_timeout_secs: 5.0,
            initial_read_timeout_secs: 5.0,
            quiet: false,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|_| Error::ConfigNotFound {
            path: path.display().to_string(),
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate the configuration, rejecting values the core cannot act on.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(Error::config_value("port", "must be between 1 and 65535"));
        }
        if self.connect_timeout_secs <= 0.0 {
            return Err(Error::config_value(
                "connect_timeout_secs",
                "must be positive",
            ));
        }
        if self.initial_read_timeout_secs <= 0.0 {
            return Err(Error::config_value(
                "initial_read_timeout_secs",
                "must be positive",
            ));
        }
        if self.blacklist_mode == BlacklistMode::File && !self.blacklist_file.exists() {
            return Err(Error::BlacklistLoadMissing {
                path: self.blacklist_file.display().to_string(),
            });
        }
        Ok(())
    }

    /// Bound to wait for an origin TCP connect.
    pub fn connect_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.connect_timeout_secs)
    }

    /// Bound to wait for the client's first chunk(s).
    pub fn initial_read_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.initial_read_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_well_formed() {
        let config = Config::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8881);
        assert_eq!(config.fragment_method, FragmentMethod::Random);
        assert_eq!(config.domain_matching, MatchMode::Strict);
    }

    #[test]
    fn validate_rejects_zero_port() {
        let mut config = Config::default();
        config.port = 0;
        config.blacklist_mode = BlacklistMode::None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_nonpositive_timeouts() {
        let mut config = Config::default();
        config.blacklist_mode = BlacklistMode::None;
        config.connect_timeout_secs = 0.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.blacklist_mode = BlacklistMode::None;
        config.initial_read_timeout_secs = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_requires_blacklist_file_in_file_mode() {
        let mut config = Config::default();
        config.blacklist_mode = BlacklistMode::File;
        config.blacklist_file = PathBuf::from("/nonexistent/fragproxy-blacklist.txt");
        assert!(matches!(
            config.validate(),
            Err(Error::BlacklistLoadMissing { .. })
        ));
    }

    #[test]
    fn validate_passes_in_none_mode_without_blacklist_file() {
        let mut config = Config::default();
        config.blacklist_mode = BlacklistMode::None;
        config.blacklist_file = PathBuf::from("/nonexistent/fragproxy-blacklist.txt");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn toml_roundtrip_preserves_fields() {
        let mut config = Config::default();
        config.blacklist_mode = BlacklistMode::None;
        config.port = 9000;
        config.fragment_method = FragmentMethod::Sni;

        let toml = config.to_toml().unwrap();
        let parsed = Config::from_toml(&toml).unwrap();
        assert_eq!(parsed.port, 9000);
        assert_eq!(parsed.fragment_method, FragmentMethod::Sni);
    }

    #[test]
    fn toml_parse_minimal_uses_defaults_for_missing_fields() {
        let toml_content = r#"
port = 9090
"#;
        let config = Config::from_toml(toml_content).unwrap();
        assert_eq!(config.port, 9090);
        assert_eq!(config.host, "127.0.0.1");
    }

    #[test]
    fn toml_parse_invalid_is_an_error() {
        let invalid_toml = "this is not [valid toml";
        assert!(Config::from_toml(invalid_toml).is_err());
    }
}
