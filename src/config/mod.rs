//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files
//! - Environment variables
//! - CLI arguments (for the demo binary)

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{JingleError, Result};
use crate::transport::IBB_NS;

/// Main configuration struct
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Session configuration
    #[serde(default)]
    pub session: SessionConfig,

    /// Transport selection configuration
    #[serde(default)]
    pub transports: TransportsConfig,

    /// In-band bytestream configuration
    #[serde(default)]
    pub ibb: IbbConfig,
}

impl Config {
    /// Default config file location (`<config dir>/jingle/config.toml`)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("jingle").join("config.toml"))
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| JingleError::Config(format!("Failed to read config file: {e}")))?;

        toml::from_str(&content)
            .map_err(|e| JingleError::Config(format!("Failed to parse config: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("JINGLE_ACK_TIMEOUT_SECS") {
            if let Ok(val) = val.parse() {
                config.session.ack_timeout_secs = val;
            }
        }
        if let Ok(val) = std::env::var("JINGLE_MAX_CONTENTS") {
            if let Ok(val) = val.parse() {
                config.session.max_contents = val;
            }
        }
        if let Ok(val) = std::env::var("JINGLE_IBB_BLOCK_SIZE") {
            if let Ok(val) = val.parse() {
                config.ibb.block_size = val;
            }
        }
        if let Ok(val) = std::env::var("JINGLE_TRANSPORTS") {
            let preference: Vec<String> = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            if !preference.is_empty() {
                config.transports.preference = preference;
            }
        }

        config
    }

    /// Merge with another config (other takes precedence where it differs
    /// from the defaults)
    pub fn merge(self, other: Self) -> Self {
        let session_default = SessionConfig::default();
        let ibb_default = IbbConfig::default();
        Self {
            session: SessionConfig {
                ack_timeout_secs: if other.session.ack_timeout_secs != session_default.ack_timeout_secs {
                    other.session.ack_timeout_secs
                } else {
                    self.session.ack_timeout_secs
                },
                max_contents: if other.session.max_contents != session_default.max_contents {
                    other.session.max_contents
                } else {
                    self.session.max_contents
                },
            },
            transports: if other.transports != TransportsConfig::default() {
                other.transports
            } else {
                self.transports
            },
            ibb: IbbConfig {
                block_size: if other.ibb.block_size != ibb_default.block_size {
                    other.ibb.block_size
                } else {
                    self.ibb.block_size
                },
                max_block_size: if other.ibb.max_block_size != ibb_default.max_block_size {
                    other.ibb.max_block_size
                } else {
                    self.ibb.max_block_size
                },
            },
        }
    }

    /// Check values that would make sessions unusable
    pub fn validate(&self) -> Result<()> {
        if self.ibb.block_size == 0 || self.ibb.max_block_size == 0 {
            return Err(JingleError::Config("ibb block size must be positive".into()));
        }
        if self.session.max_contents == 0 {
            return Err(JingleError::Config("max_contents must be positive".into()));
        }
        if self.transports.preference.is_empty() {
            return Err(JingleError::Config("at least one transport must be preferred".into()));
        }
        Ok(())
    }

    /// Serialize to TOML
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Seconds to wait for a request acknowledgement before treating it as failed
    pub ack_timeout_secs: u64,

    /// Maximum contents per session; further content-add is rejected
    pub max_contents: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ack_timeout_secs: 30,
            max_contents: 32,
        }
    }
}

/// Transport selection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportsConfig {
    /// Transport namespaces, most preferred first
    pub preference: Vec<String>,
}

impl Default for TransportsConfig {
    fn default() -> Self {
        Self {
            preference: vec![IBB_NS.to_string()],
        }
    }
}

/// In-band bytestream configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IbbConfig {
    /// Block size offered for local transports
    pub block_size: usize,

    /// Largest block size accepted from a peer
    pub max_block_size: usize,
}

impl Default for IbbConfig {
    fn default() -> Self {
        Self {
            block_size: 4096,
            max_block_size: 65535,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.session.ack_timeout_secs, 30);
        assert_eq!(config.transports.preference, vec![IBB_NS.to_string()]);
        assert_eq!(config.ibb.block_size, 4096);
        tokio_test::assert_ok!(config.validate());
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
            [session]
            ack_timeout_secs = 5
            max_contents = 4

            [ibb]
            block_size = 1024
            max_block_size = 2048
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.session.ack_timeout_secs, 5);
        assert_eq!(config.session.max_contents, 4);
        assert_eq!(config.ibb.block_size, 1024);
        // missing section falls back to defaults
        assert_eq!(config.transports, TransportsConfig::default());
    }

    #[test]
    fn test_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[ibb]\nblock_size = 512\nmax_block_size = 512").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.ibb.block_size, 512);
        assert!(Config::from_file("/nonexistent/jingle.toml").is_err());
    }

    #[test]
    fn test_merge_prefers_non_default() {
        let base = Config {
            session: SessionConfig {
                ack_timeout_secs: 10,
                ..Default::default()
            },
            ..Default::default()
        };
        let overlay = Config {
            ibb: IbbConfig {
                block_size: 256,
                ..Default::default()
            },
            ..Default::default()
        };

        let merged = base.merge(overlay);
        assert_eq!(merged.session.ack_timeout_secs, 10);
        assert_eq!(merged.ibb.block_size, 256);
    }

    #[test]
    fn test_validate_rejects_empty_preference() {
        let mut config = Config::default();
        config.transports.preference.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_roundtrip_is_readable() {
        let text = Config::default().to_toml().unwrap();
        assert!(text.contains("[session]"));
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed, Config::default());
    }
}
