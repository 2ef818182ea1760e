//! Client configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use spice_core::{
    ChannelConfig, ConnectionMode, ConnectionOptions, HostAuthOptions, SpiceError, Target,
    VerifyOps,
};
use thiserror::Error;

/// A config value the client cannot act on.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown connection mode {0:?}; expected any, secure or unsecure")]
    UnknownMode(String),

    #[error("invalid host subject: {0}")]
    Subject(#[from] SpiceError),
}

/// Top-level configuration for the command-line client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub network: NetworkConfig,
    pub security: SecurityConfig,
    pub logging: LoggingConfig,
}

/// Where to connect and how long to wait.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub host: String,
    /// Plain port; 0 means none.
    pub port: u16,
    /// TLS port; 0 means none.
    pub secure_port: u16,
    /// Deadline for connect and link of one channel, in milliseconds.
    pub connect_timeout_ms: u64,
    /// Deadline for each migration shadow, in milliseconds.
    pub migrate_timeout_ms: u64,
    /// Initial send window before the server sets one.
    pub ack_window: u32,
}

/// Transport choice and host certificate policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// "any", "secure" or "unsecure".
    pub mode: String,
    /// PEM bundle of trusted roots.
    pub ca_file: String,
    /// Expected certificate subject, e.g. `C=IL,O=Example,CN=host`.
    pub host_subject: String,
    /// Check the certificate against the target host name.
    pub verify_hostname: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or `tracing` filter directive.
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        let channel = ChannelConfig::default();
        Self {
            host: "127.0.0.1".into(),
            port: 5900,
            secure_port: 0,
            connect_timeout_ms: channel.connect_timeout.as_millis() as u64,
            migrate_timeout_ms: channel.migrate_connect_timeout.as_millis() as u64,
            ack_window: channel.ack_window,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            mode: "any".into(),
            ca_file: String::new(),
            host_subject: String::new(),
            verify_hostname: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl ClientConfig {
    /// Load from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the default config to a file.
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    pub fn target(&self) -> Target {
        let port = |p: u16| (p != 0).then_some(p);
        Target::new(
            self.network.host.clone(),
            port(self.network.port),
            port(self.network.secure_port),
        )
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            ack_window: self.network.ack_window,
            connect_timeout: Duration::from_millis(self.network.connect_timeout_ms),
            migrate_connect_timeout: Duration::from_millis(self.network.migrate_timeout_ms),
            ..ChannelConfig::default()
        }
    }

    pub fn connection_options(&self) -> Result<ConnectionOptions, ConfigError> {
        let mode = match self.security.mode.as_str() {
            "any" => ConnectionMode::Any,
            "secure" => ConnectionMode::Secure,
            "unsecure" => ConnectionMode::Unsecure,
            other => return Err(ConfigError::UnknownMode(other.to_string())),
        };

        let mut host_auth = HostAuthOptions::default();
        if !self.security.ca_file.is_empty() {
            host_auth.ca_file = Some(PathBuf::from(&self.security.ca_file));
        }
        if !self.security.host_subject.is_empty() {
            host_auth.set_cert_subject(&self.security.host_subject)?;
            host_auth.verify |= VerifyOps::SUBJECT;
        } else if self.security.verify_hostname {
            host_auth.verify |= VerifyOps::HOSTNAME;
        }

        Ok(ConnectionOptions {
            default_mode: mode,
            host_auth,
            ..ConnectionOptions::default()
        })
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let text = toml::to_string_pretty(&ClientConfig::default()).unwrap();
        assert!(text.contains("secure_port"));
        assert!(text.contains("[security]"));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let cfg: ClientConfig = toml::from_str("[network]\nhost = \"spice.local\"\n").unwrap();
        assert_eq!(cfg.network.host, "spice.local");
        assert_eq!(cfg.network.port, 5900);
        assert_eq!(cfg.security.mode, "any");
    }

    #[test]
    fn zero_ports_are_absent() {
        let mut cfg = ClientConfig::default();
        cfg.network.port = 0;
        cfg.network.secure_port = 5901;
        let target = cfg.target();
        assert_eq!(target.port, None);
        assert_eq!(target.sport, Some(5901));
    }

    #[test]
    fn subject_overrides_hostname_check() {
        let mut cfg = ClientConfig::default();
        cfg.security.mode = "secure".into();
        cfg.security.host_subject = "O=Example,CN=host".into();
        let opts = cfg.connection_options().unwrap();
        assert_eq!(opts.default_mode, ConnectionMode::Secure);
        assert_eq!(opts.host_auth.verify, VerifyOps::SUBJECT);
        assert_eq!(opts.host_auth.host_subject.len(), 2);
    }

    #[test]
    fn unknown_mode_is_rejected() {
        let mut cfg = ClientConfig::default();
        cfg.security.mode = "maybe".into();
        assert!(matches!(
            cfg.connection_options(),
            Err(ConfigError::UnknownMode(m)) if m == "maybe"
        ));
    }
}
