//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files
//! - `PAIRLINK_*` environment variables
//!
//! Key material and listener settings are validated up front:
//! a bad bind address or absent identity is a startup failure, not
//! something discovered on the first connection.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::crypto::{derive_passphrase_key, KeyPair, SessionMode};
use crate::error::{LinkError, Result};

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub listen: ListenConfig,

    /// Host identity configuration
    #[serde(default)]
    pub identity: IdentityConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| LinkError::Config(format!("Failed to read config file: {e}")))?;

        toml::from_str(&content)
            .map_err(|e| LinkError::Config(format!("Failed to parse config: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("PAIRLINK_HOST") {
            config.listen.host = host;
        }
        if let Ok(port) = std::env::var("PAIRLINK_PORT") {
            if let Ok(port) = port.parse() {
                config.listen.port = port;
            }
        }
        if let Ok(key) = std::env::var("PAIRLINK_PUBLIC_KEY") {
            config.identity.public_key = Some(key);
        }
        if let Ok(key) = std::env::var("PAIRLINK_SECRET_KEY") {
            config.identity.secret_key = Some(key);
        }
        if let Ok(passphrase) = std::env::var("PAIRLINK_PASSPHRASE") {
            config.identity.passphrase = Some(passphrase);
        }

        config
    }

    /// Merge with another config (other takes precedence)
    pub fn merge(self, other: Self) -> Self {
        let defaults = ListenConfig::default();
        Self {
            listen: ListenConfig {
                host: if other.listen.host != defaults.host {
                    other.listen.host
                } else {
                    self.listen.host
                },
                port: if other.listen.port != defaults.port {
                    other.listen.port
                } else {
                    self.listen.port
                },
            },
            identity: IdentityConfig {
                public_key: other.identity.public_key.or(self.identity.public_key),
                secret_key: other.identity.secret_key.or(self.identity.secret_key),
                passphrase: other.identity.passphrase.or(self.identity.passphrase),
            },
        }
    }

    /// Resolve the protocol mode from the configured key material.
    ///
    /// A stored X25519 secret selects key-exchange mode; otherwise a
    /// passphrase selects pre-shared-key mode. Neither is a fatal
    /// configuration error.
    pub fn session_mode(&self) -> Result<SessionMode> {
        if let Some(secret) = &self.identity.secret_key {
            let pair = KeyPair::from_base64(self.identity.public_key.as_deref(), secret)
                .map_err(|e| LinkError::Config(format!("Invalid stored key pair: {e}")))?;
            return Ok(SessionMode::Exchange(pair));
        }

        if let Some(passphrase) = &self.identity.passphrase {
            let key = derive_passphrase_key(passphrase)
                .map_err(|e| LinkError::Config(format!("Invalid passphrase: {e}")))?;
            return Ok(SessionMode::Psk(key));
        }

        Err(LinkError::Config(
            "no key material: set identity.secret_key or identity.passphrase".to_string(),
        ))
    }
}

/// TCP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    /// Address to bind to
    pub host: String,

    /// Port to listen on (0 picks an ephemeral port)
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8888,
        }
    }
}

impl ListenConfig {
    /// Parse the bind address; an unparseable host is a fatal config error.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|_| LinkError::Config(format!("Invalid bind address: {}", self.host)))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Host identity configuration.
///
/// Either a persisted X25519 key pair (key-exchange mode, primary) or a
/// shared passphrase (pre-shared-key mode).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Base64 public key (optional; checked against the secret when present)
    pub public_key: Option<String>,

    /// Base64 X25519 secret key
    pub secret_key: Option<String>,

    /// Shared passphrase for pre-shared-key mode
    pub passphrase: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.listen.port, 8888);
        assert_eq!(config.listen.host, "0.0.0.0");
        assert!(config.identity.secret_key.is_none());
    }

    #[test]
    fn test_socket_addr_parses() {
        let listen = ListenConfig {
            host: "127.0.0.1".to_string(),
            port: 9000,
        };
        assert_eq!(listen.socket_addr().unwrap().port(), 9000);
    }

    #[test]
    fn test_invalid_host_is_config_error() {
        let listen = ListenConfig {
            host: "not an address".to_string(),
            port: 9000,
        };
        assert!(matches!(
            listen.socket_addr(),
            Err(LinkError::Config(_))
        ));
    }

    #[test]
    fn test_config_from_toml() {
        let kp = KeyPair::generate();
        let toml = format!(
            r#"
            [listen]
            host = "127.0.0.1"
            port = 9090

            [identity]
            public_key = "{}"
            secret_key = "{}"
            "#,
            kp.public_key_base64(),
            kp.secret_key_base64()
        );

        let config: Config = toml::from_str(&toml).unwrap();
        assert_eq!(config.listen.port, 9090);
        assert!(matches!(
            config.session_mode().unwrap(),
            SessionMode::Exchange(_)
        ));
    }

    #[test]
    fn test_config_from_file() {
        let kp = KeyPair::generate();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[identity]\nsecret_key = \"{}\"",
            kp.secret_key_base64()
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.listen.port, 8888);
        assert!(config.identity.secret_key.is_some());
    }

    #[test]
    fn test_missing_key_material_is_fatal() {
        let config = Config::default();
        assert!(matches!(
            config.session_mode(),
            Err(LinkError::Config(_))
        ));
    }

    #[test]
    fn test_corrupt_key_material_is_fatal() {
        let config = Config {
            identity: IdentityConfig {
                secret_key: Some("!!not base64!!".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            config.session_mode(),
            Err(LinkError::Config(_))
        ));
    }

    #[test]
    fn test_merge_prefers_other() {
        let kp = KeyPair::generate();
        let base = Config {
            listen: ListenConfig {
                host: "127.0.0.1".to_string(),
                port: 7000,
            },
            identity: IdentityConfig {
                secret_key: Some(kp.secret_key_base64()),
                ..Default::default()
            },
        };
        let overlay = Config {
            listen: ListenConfig {
                host: "0.0.0.0".to_string(),
                port: 7001,
            },
            ..Default::default()
        };

        let merged = base.merge(overlay);
        assert_eq!(merged.listen.port, 7001);
        // Host stayed: overlay's host equals the default
        assert_eq!(merged.listen.host, "127.0.0.1");
        assert!(merged.identity.secret_key.is_some());
    }
}
