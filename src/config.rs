//! Configuration module with TOML parsing and validation.
//!
//! All runtime values are externalized: listener ports and bind address,
//! the control-channel HMAC key, the state device path, and the
//! certificate-issuance keys (domains, key seed, DNS server and update
//! key). CLI flags and environment variables override the file.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Main proxy configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Public listener configuration
    pub server: ServerConfig,
    /// Control channel configuration
    pub control: ControlConfig,
    /// Persistent state device
    pub store: StoreConfig,
    /// Certificate issuance settings
    pub issuance: IssuanceConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Public listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address for the public listeners (default: 0.0.0.0)
    pub bind_address: String,
    /// Public TLS port (default: 443)
    pub frontend_port: u16,
    /// Plaintext redirect port (default: 80)
    pub redirect_port: u16,
    /// TLS handshake deadline in seconds
    pub handshake_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            frontend_port: 443,
            redirect_port: 80,
            handshake_timeout_secs: 10,
        }
    }
}

impl ServerConfig {
    pub fn frontend_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.bind_address, self.frontend_port).parse()
    }

    pub fn redirect_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.bind_address, self.redirect_port).parse()
    }
}

/// Control channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Bind address for the private control listener (default: 127.0.0.1)
    pub bind_address: String,
    /// Control listener port
    pub configuration_port: u16,
    /// HMAC key authenticating control requests, treated as opaque bytes
    pub key: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            configuration_port: 4433,
            key: String::new(),
        }
    }
}

impl ControlConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.bind_address, self.configuration_port).parse()
    }
}

/// Persistent state device
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Block device (or backing file) holding the routing table
    pub device_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            device_path: PathBuf::from("/var/lib/snigate/state.img"),
        }
    }
}

/// Certificate issuance settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IssuanceConfig {
    /// Apex domains to provision certificates for; the first is the
    /// default chain
    pub domains: Vec<String>,
    /// Global seed combined with each domain for issuer-side derivation
    pub key_seed: String,
    /// DNS update key as `[algorithm:]name:base64-secret`
    pub dns_key: String,
    /// Issuance DNS server address
    pub dns_server: String,
    /// Issuance DNS server port (conventionally 53)
    pub dns_port: u16,
    /// ACME directory URL
    pub acme_directory: String,
    /// Contact email for the ACME account
    pub contact: Option<String>,
}

impl Default for IssuanceConfig {
    fn default() -> Self {
        Self {
            domains: Vec::new(),
            key_seed: String::new(),
            dns_key: String::new(),
            dns_server: String::new(),
            dns_port: 53,
            acme_directory: "https://acme-v02.api.letsencrypt.org/directory".to_string(),
            contact: None,
        }
    }
}

impl IssuanceConfig {
    pub fn dns_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.dns_server, self.dns_port).parse()
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Emit JSON log lines
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl ProxyConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Validate the configuration before startup.
    pub fn validate(&self) -> Result<()> {
        if self.control.key.is_empty() {
            bail!("control.key must be set (HMAC key for the control channel)");
        }
        if self.issuance.domains.is_empty() {
            bail!("issuance.domains must list at least one domain");
        }
        if self.issuance.dns_server.is_empty() {
            bail!("issuance.dns_server must be set");
        }
        if self.issuance.dns_key.is_empty() {
            bail!("issuance.dns_key must be set");
        }
        self.server
            .frontend_addr()
            .context("invalid server.bind_address/frontend_port")?;
        self.server
            .redirect_addr()
            .context("invalid server.bind_address/redirect_port")?;
        self.control
            .socket_addr()
            .context("invalid control.bind_address/configuration_port")?;
        self.issuance
            .dns_addr()
            .context("invalid issuance.dns_server/dns_port")?;
        if self.server.handshake_timeout_secs == 0 {
            bail!("server.handshake_timeout_secs must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProxyConfig::default();
        assert_eq!(config.server.frontend_port, 443);
        assert_eq!(config.server.redirect_port, 80);
        assert_eq!(config.server.handshake_timeout_secs, 10);
        assert_eq!(config.issuance.dns_port, 53);
        assert_eq!(config.control.bind_address, "127.0.0.1");
    }

    #[test]
    fn test_parse_minimal_toml() {
        let toml_content = r#"
[server]
frontend_port = 8443

[control]
configuration_port = 9443
key = "hunter2"

[issuance]
domains = ["example.org"]
key_seed = "seed"
dns_key = "update.example:c2VjcmV0"
dns_server = "192.0.2.53"
"#;
        let config: ProxyConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.server.frontend_port, 8443);
        assert_eq!(config.server.redirect_port, 80);
        assert_eq!(config.control.configuration_port, 9443);
        assert_eq!(config.issuance.domains, vec!["example.org"]);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_requires_key_and_domains() {
        let mut config = ProxyConfig::default();
        assert!(config.validate().is_err());

        config.control.key = "k".to_string();
        assert!(config.validate().is_err());

        config.issuance.domains = vec!["example.org".to_string()];
        config.issuance.dns_server = "192.0.2.53".to_string();
        config.issuance.dns_key = "update.example:c2VjcmV0".to_string();
        config.validate().unwrap();
    }

    #[test]
    fn test_socket_addr_helpers() {
        let config = ProxyConfig {
            control: ControlConfig {
                key: "k".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(config.server.frontend_addr().unwrap().port(), 443);
        assert_eq!(config.control.socket_addr().unwrap().port(), 4433);
    }
}
