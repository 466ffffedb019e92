//! Error types for fragproxy-core
//!
//! Centralized error handling using `thiserror` for ergonomic error definitions.

use thiserror::Error;

/// Main error type for fragproxy-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or unrecognized HTTP request line
    #[error("failed to parse HTTP request: {0}")]
    HttpParse(String),

    /// Blacklist file was configured but does not exist on disk
    #[error("blacklist file not found: {path}")]
    BlacklistLoadMissing {
        /// Path to the missing blacklist file
        path: String,
    },

    /// Rules file failed to parse
    #[error("failed to parse rules file '{path}': {message}")]
    RulesParse {
        /// Path to the rules file
        path: String,
        /// Parse error message
        message: String,
    },

    /// DNS resolution failed
    #[error("DNS resolution failed for '{host}': {reason}")]
    DnsResolution {
        /// Host that failed to resolve
        host: String,
        /// Failure reason
        reason: String,
    },

    /// Outbound TCP connect failed or timed out
    #[error("failed to connect to {host}:{port}: {reason}")]
    ConnectFailed {
        /// Target host
        host: String,
        /// Target port
        port: u16,
        /// Failure reason
        reason: String,
    },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Configuration file not found
    #[error("configuration file not found: {path}")]
    ConfigNotFound {
        /// Path to the missing config file
        path: String,
    },

    /// Invalid configuration value
    #[error("invalid configuration value for '{key}': {message}")]
    ConfigValue {
        /// Configuration key
        key: String,
        /// Error message
        message: String,
    },

    /// The local listener could not be bound, usually because the port is in use
    #[error("failed to bind proxy listener on {host}:{port}: {reason}")]
    BindFailed {
        /// Bind host
        host: String,
        /// Bind port
        port: u16,
        /// Underlying reason
        reason: String,
    },

    /// I/O error wrapper
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a config value error
    pub fn config_value(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConfigValue {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Create an HTTP parse error
    pub fn http_parse(message: impl Into<String>) -> Self {
        Self::HttpParse(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::http_parse("missing CRLF");
        assert!(err.to_string().contains("missing CRLF"));

        let err = Error::config_value("fragment_method", "unknown method 'foo'");
        assert!(err.to_string().contains("fragment_method"));
        assert!(err.to_string().contains("foo"));
    }

    #[test]
    fn test_blacklist_missing_message() {
        let err = Error::BlacklistLoadMissing {
            path: "blacklist.txt".to_string(),
        };
        assert!(err.to_string().contains("blacklist.txt"));
    }
}
