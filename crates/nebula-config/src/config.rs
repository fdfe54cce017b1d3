//! Configuration structs with sensible defaults and RON persistence.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Listener settings.
    pub network: NetworkConfig,
    /// Per-session transport tuning.
    pub session: SessionSettings,
    /// Logging settings.
    pub log: LogConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind the listener to.
    pub bind_address: String,
    /// Listener port.
    pub port: u16,
    /// Maximum number of concurrent sessions.
    pub max_connections: usize,
    /// Disable Nagle's algorithm on accepted sockets.
    pub nodelay: bool,
}

/// Smallest receive ceiling that still holds one maximum-length packet.
pub const MIN_RECV_CEILING: usize = u16::MAX as usize;

/// Session transport tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionSettings {
    /// Initial receive buffer size in bytes.
    pub recv_buffer_size: usize,
    /// Free space (bytes) below which the receive buffer compacts.
    pub recv_low_water: usize,
    /// Upper bound for receive buffer growth in bytes.
    pub max_recv_buffer_size: usize,
    /// Maximum queued outbound chunks per session (`None` = unbounded).
    pub max_send_queue: Option<usize>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive (e.g., "debug", "info,nebula_net=trace").
    pub log_level: String,
    /// Also write JSON logs to the log directory.
    pub file_logging: bool,
}

// --- Default implementations ---

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 7777,
            max_connections: 256,
            nodelay: true,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            recv_buffer_size: 4096,
            recv_low_water: 1024,
            max_recv_buffer_size: 1024 * 1024,
            max_send_queue: None,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            file_logging: false,
        }
    }
}

// --- Load / Save ---

impl Config {
    /// Platform config directory for the server, e.g.
    /// `~/.config/nebula-server` on Linux. Falls back to `./config`.
    pub fn default_dir() -> PathBuf {
        dirs::config_dir()
            .map(|dir| dir.join("nebula-server"))
            .unwrap_or_else(|| PathBuf::from("config"))
    }

    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join("config.ron");

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join("config.ron");
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Parsed listener address.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr = format!("{}:{}", self.network.bind_address, self.network.port);
        addr.parse()
            .map_err(|source| ConfigError::InvalidAddress { addr, source })
    }

    /// Check that every setting is usable by the listener and sessions.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bind_addr()?;

        if self.network.max_connections == 0 {
            return Err(invalid("network.max_connections", "must be at least 1"));
        }

        let session = &self.session;
        if session.recv_buffer_size == 0 {
            return Err(invalid("session.recv_buffer_size", "must be at least 1"));
        }
        if session.recv_low_water > session.recv_buffer_size {
            return Err(invalid(
                "session.recv_low_water",
                format!(
                    "{} exceeds recv_buffer_size {}",
                    session.recv_low_water, session.recv_buffer_size
                ),
            ));
        }
        if session.max_recv_buffer_size < MIN_RECV_CEILING {
            return Err(invalid(
                "session.max_recv_buffer_size",
                format!(
                    "{} cannot hold a {MIN_RECV_CEILING}-byte packet",
                    session.max_recv_buffer_size
                ),
            ));
        }
        if session.max_recv_buffer_size < session.recv_buffer_size {
            return Err(invalid(
                "session.max_recv_buffer_size",
                format!(
                    "{} is below recv_buffer_size {}",
                    session.max_recv_buffer_size, session.recv_buffer_size
                ),
            ));
        }
        if session.max_send_queue == Some(0) {
            return Err(invalid(
                "session.max_send_queue",
                "must be at least 1 (or None for unbounded)",
            ));
        }

        Ok(())
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_serializes() {
        let config = Config::default();
        let ron_str =
            ron::ser::to_string_pretty(&config, ron::ser::PrettyConfig::new().depth_limit(3))
                .unwrap();
        assert!(!ron_str.is_empty());
        assert!(ron_str.contains("port: 7777"));
        assert!(ron_str.contains("recv_buffer_size: 4096"));
    }

    #[test]
    fn test_config_roundtrip() {
        let mut config = Config::default();
        config.session.max_send_queue = Some(512);
        let ron_str = ron::to_string(&config).unwrap();
        let deserialized: Config = ron::from_str(&ron_str).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_missing_section_uses_default() {
        // Config missing the `session` section entirely
        let ron_str = "(network: (port: 9000), log: ())";
        let config: Config = ron::from_str(ron_str).unwrap();
        assert_eq!(config.session, SessionSettings::default());
        assert_eq!(config.network.port, 9000);
        assert_eq!(config.network.max_connections, 256);
    }

    #[test]
    fn test_extra_field_ignored() {
        let ron_str = "(future_setting: true)";
        let result: Result<Config, _> = ron::from_str(ron_str);
        assert!(result.is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.network.port = 9100;
        config.network.bind_address = "127.0.0.1".to_string();
        config.session.recv_buffer_size = 8192;

        config.save(dir.path()).unwrap();
        let loaded = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, Config::default());
        assert!(dir.path().join("config.ron").exists());
    }

    #[test]
    fn test_invalid_ron_produces_error() {
        let result: Result<Config, _> = ron::from_str("{{not valid}}");
        assert!(result.is_err());
    }

    #[test]
    fn test_bind_addr_parses() {
        let mut config = Config::default();
        config.network.bind_address = "127.0.0.1".to_string();
        config.network.port = 4000;
        assert_eq!(
            config.bind_addr().unwrap(),
            "127.0.0.1:4000".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_bad_bind_address_rejected() {
        let mut config = Config::default();
        config.network.bind_address = "not-an-ip".to_string();
        assert!(matches!(
            config.bind_addr(),
            Err(ConfigError::InvalidAddress { .. })
        ));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_ceiling_below_max_packet_rejected() {
        let mut config = Config::default();
        config.session.max_recv_buffer_size = 4096;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "session.max_recv_buffer_size",
                ..
            })
        ));

        config.session.max_recv_buffer_size = MIN_RECV_CEILING;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_low_water_above_buffer_rejected() {
        let mut config = Config::default();
        config.session.recv_low_water = config.session.recv_buffer_size + 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "session.recv_low_water",
                ..
            })
        ));
    }

    #[test]
    fn test_zero_send_queue_rejected() {
        let mut config = Config::default();
        config.session.max_send_queue = Some(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "session.max_send_queue",
                ..
            })
        ));
    }
}
