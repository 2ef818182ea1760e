//! Engine configuration: per-channel tuning and connection options.
//!
//! Every struct has a `Default` matching the stock client, so callers
//! only override what they need.

use std::collections::HashMap;
use std::time::Duration;

use crate::codec::DEFAULT_MAX_MESSAGE_SIZE;
use crate::message::ChannelType;
use crate::transport::HostAuthOptions;

/// Initial send window until the server sends SET_ACK.
pub const DEFAULT_ACK_WINDOW: u32 = 20;

/// Tuning shared by every channel of a session.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Messages that may be in flight before an ack is required.
    pub ack_window: u32,
    /// Largest accepted message body.
    pub max_message_size: usize,
    /// Deadline for TCP connect, TLS and link of one connection.
    pub connect_timeout: Duration,
    /// Deadline for each migration shadow to link.
    pub migrate_connect_timeout: Duration,
    /// How often a migration abort re-disconnects shadows while waiting.
    pub abort_poll_interval: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            ack_window: DEFAULT_ACK_WINDOW,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            connect_timeout: Duration::from_secs(10),
            migrate_connect_timeout: Duration::from_secs(10),
            abort_poll_interval: Duration::from_millis(10),
        }
    }
}

/// Which transports a channel may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionMode {
    Unsecure,
    Secure,
    /// Unsecure first, TLS when the server demands it.
    #[default]
    Any,
}

impl ConnectionMode {
    pub fn allow_unsecure(self) -> bool {
        matches!(self, ConnectionMode::Unsecure | ConnectionMode::Any)
    }

    pub fn allow_secure(self) -> bool {
        matches!(self, ConnectionMode::Secure | ConnectionMode::Any)
    }
}

/// Connection policy of a session.
#[derive(Debug, Clone, Default)]
pub struct ConnectionOptions {
    pub default_mode: ConnectionMode,
    /// Per-type overrides of `default_mode`.
    pub overrides: HashMap<ChannelType, ConnectionMode>,
    pub host_auth: HostAuthOptions,
}

impl ConnectionOptions {
    pub fn mode_for(&self, channel_type: ChannelType) -> ConnectionMode {
        self.overrides
            .get(&channel_type)
            .copied()
            .unwrap_or(self.default_mode)
    }
}

/// Where a session connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    /// Plain port, if the server listens on one.
    pub port: Option<u16>,
    /// TLS port, if the server listens on one.
    pub sport: Option<u16>,
}

impl Target {
    pub fn new(host: impl Into<String>, port: Option<u16>, sport: Option<u16>) -> Self {
        Self {
            host: host.into(),
            port,
            sport,
        }
    }
}
