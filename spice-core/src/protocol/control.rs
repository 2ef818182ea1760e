//! Bodies of the control messages every channel exchanges.
//!
//! # Wire Protocol
//!
//! ```text
//! Server ──[SET_ACK {generation, window}]────► Client
//! Client ──[ACK_SYNC {generation}]───────────► Server
//!
//! Server ──[PING {id, timestamp}]────────────► Client
//! Client ──[PONG {id, timestamp}]────────────► Server
//!
//! Server ──[MIGRATE {flags}]─────────────────► Client
//! Client ──[MIGRATE_FLUSH_MARK]──────────────► Server   (NEED_FLUSH)
//! Server ──[MIGRATE_DATA …]──────────────────► Client   (NEED_DATA_TRANSFER)
//! Client ──[MIGRATE_DATA …]──────────────────► Destination
//! ```

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::SpiceError;
use crate::message::ChannelType;

use super::{decode, encode};

// ── SET_ACK / ACK_SYNC ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetAck {
    pub generation: u32,
    pub window: u32,
}

impl SetAck {
    pub const SIZE: usize = 8;

    pub fn decode(bytes: &[u8]) -> Result<Self, SpiceError> {
        decode(bytes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckSync {
    pub generation: u32,
}

impl AckSync {
    pub fn encode(&self) -> Result<Vec<u8>, SpiceError> {
        encode(self)
    }
}

// ── PING / PONG ──────────────────────────────────────────────────

/// Body of PING; PONG echoes it back unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub id: u32,
    pub timestamp: u64,
}

impl Ping {
    pub const SIZE: usize = 12;

    pub fn decode(bytes: &[u8]) -> Result<Self, SpiceError> {
        decode(bytes)
    }

    pub fn encode(&self) -> Result<Vec<u8>, SpiceError> {
        encode(self)
    }
}

// ── MIGRATE ──────────────────────────────────────────────────────

bitflags! {
    /// Flags carried by MIGRATE.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MigrateFlags: u32 {
        /// Flush every pending message and send MIGRATE_FLUSH_MARK.
        const NEED_FLUSH         = 1 << 0;
        /// The next message from the source is MIGRATE_DATA.
        const NEED_DATA_TRANSFER = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Migrate {
    pub flags: u32,
}

impl Migrate {
    pub const SIZE: usize = 4;

    pub fn decode(bytes: &[u8]) -> Result<Self, SpiceError> {
        decode(bytes)
    }

    /// Unknown bits are dropped.
    pub fn flags(&self) -> MigrateFlags {
        MigrateFlags::from_bits_truncate(self.flags)
    }
}

// ── DISCONNECTING ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disconnecting {
    pub time_stamp: u64,
    pub reason: u32,
}

impl Disconnecting {
    pub const SIZE: usize = 12;

    pub fn decode(bytes: &[u8]) -> Result<Self, SpiceError> {
        decode(bytes)
    }

    pub fn encode(&self) -> Result<Vec<u8>, SpiceError> {
        encode(self)
    }
}

// ── NOTIFY ───────────────────────────────────────────────────────

/// Severity of a NOTIFY message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifySeverity {
    Info,
    Warn,
    Error,
}

impl NotifySeverity {
    /// Unknown values are treated as informational.
    pub fn from_wire(value: u32) -> Self {
        match value {
            1 => NotifySeverity::Warn,
            2 => NotifySeverity::Error,
            _ => NotifySeverity::Info,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct NotifyFixed {
    time_stamp: u64,
    severity: u32,
    visibility: u32,
    what: u32,
    message_len: u32,
}

/// A server notification with its text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notify {
    pub time_stamp: u64,
    pub severity: NotifySeverity,
    pub visibility: u32,
    pub what: u32,
    pub message: String,
}

impl Notify {
    /// Size of the fixed part preceding the message text.
    pub const FIXED_SIZE: usize = 24;

    pub fn decode(bytes: &[u8]) -> Result<Self, SpiceError> {
        let fixed: NotifyFixed = decode(bytes)?;
        let text = &bytes[Self::FIXED_SIZE..];
        let len = fixed.message_len as usize;
        if len > text.len() {
            return Err(SpiceError::protocol(format!(
                "notify message length {len} exceeds body ({} bytes)",
                text.len()
            )));
        }
        let message = String::from_utf8_lossy(&text[..len])
            .trim_end_matches('\0')
            .to_string();
        Ok(Self {
            time_stamp: fixed.time_stamp,
            severity: NotifySeverity::from_wire(fixed.severity),
            visibility: fixed.visibility,
            what: fixed.what,
            message,
        })
    }
}

// ── WAIT_FOR_CHANNELS ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct WaitEntryRaw {
    channel_type: u8,
    channel_id: u8,
    serial: u64,
}

/// One barrier entry: wait until `(channel_type, channel_id)` has
/// processed message `serial`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitEntry {
    pub channel_type: ChannelType,
    pub channel_id: u8,
    pub serial: u64,
}

impl WaitEntry {
    pub const SIZE: usize = 10;
}

/// Parse a WAIT_FOR_CHANNELS body. A channel type outside the known
/// range is a protocol violation.
pub fn decode_wait_for_channels(bytes: &[u8]) -> Result<Vec<WaitEntry>, SpiceError> {
    let (&count, rest) = bytes
        .split_first()
        .ok_or_else(|| SpiceError::protocol("empty wait-for-channels body"))?;
    let count = count as usize;
    if rest.len() < count * WaitEntry::SIZE {
        return Err(SpiceError::protocol(format!(
            "wait-for-channels lists {count} entries but carries {} bytes",
            rest.len()
        )));
    }
    rest.chunks_exact(WaitEntry::SIZE)
        .take(count)
        .map(|chunk| {
            let raw: WaitEntryRaw = decode(chunk)?;
            let channel_type = ChannelType::try_from(raw.channel_type).map_err(|_| {
                SpiceError::protocol(format!("wait for unknown channel type {}", raw.channel_type))
            })?;
            Ok(WaitEntry {
                channel_type,
                channel_id: raw.channel_id,
                serial: raw.serial,
            })
        })
        .collect()
}

/// Encode a WAIT_FOR_CHANNELS body; used by test servers.
pub fn encode_wait_for_channels(entries: &[WaitEntry]) -> Result<Vec<u8>, SpiceError> {
    let count = u8::try_from(entries.len())
        .map_err(|_| SpiceError::Encoding("too many wait entries".into()))?;
    let mut out = vec![count];
    for e in entries {
        out.extend(encode(&WaitEntryRaw {
            channel_type: e.channel_type as u8,
            channel_id: e.channel_id,
            serial: e.serial,
        })?);
    }
    Ok(out)
}
