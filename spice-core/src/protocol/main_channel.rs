//! Main channel message numbering and bodies.
//!
//! # Wire Protocol
//!
//! ```text
//! Server ──[INIT]────────────────────────────► Client
//! Client ──[ATTACH_CHANNELS]─────────────────► Server
//! Server ──[CHANNELS_LIST]───────────────────► Client   (one link per entry)
//!
//! Server ──[MIGRATE_BEGIN {port, sport, host}]► Client
//! Client ──[MIGRATE_CONNECTED | MIGRATE_CONNECT_ERROR]► Server
//! ```

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::SpiceError;
use crate::message::ChannelType;

use super::{decode, encode, read_cstr};

// ── Message types ────────────────────────────────────────────────

/// Messages the server sends on the main channel.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MainMessage {
    MigrateBegin = 101,
    MigrateCancel = 102,
    Init = 103,
    ChannelsList = 104,
    MouseMode = 105,
    MultiMediaTime = 106,
    AgentConnected = 107,
    AgentDisconnected = 108,
    AgentData = 109,
    AgentToken = 110,
}

impl MainMessage {
    pub fn min_size(self) -> usize {
        match self {
            MainMessage::MigrateBegin => MigrationBegin::FIXED_SIZE,
            MainMessage::MigrateCancel | MainMessage::AgentConnected | MainMessage::AgentData => 0,
            MainMessage::Init => Init::SIZE,
            MainMessage::ChannelsList => 4,
            MainMessage::MouseMode => MouseMode::SIZE,
            MainMessage::MultiMediaTime
            | MainMessage::AgentDisconnected
            | MainMessage::AgentToken => 4,
        }
    }
}

/// Messages the client sends on the main channel.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MainClientMessage {
    ClientInfo = 101,
    MigrateConnected = 102,
    MigrateConnectError = 103,
    AttachChannels = 104,
    MouseModeRequest = 105,
    AgentStart = 106,
}

bitflags! {
    /// Mouse modes a server supports or a client requests.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MouseModes: u32 {
        const SERVER = 1 << 0;
        const CLIENT = 1 << 1;
    }
}

// ── Bodies ───────────────────────────────────────────────────────

/// MIGRATE_BEGIN: where the destination host listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationBegin {
    pub port: u16,
    pub sport: u16,
    pub host: String,
}

#[derive(Serialize, Deserialize)]
struct MigrationBeginFixed {
    port: u16,
    sport: u16,
}

impl MigrationBegin {
    pub const FIXED_SIZE: usize = 4;

    pub fn decode(bytes: &[u8]) -> Result<Self, SpiceError> {
        let fixed: MigrationBeginFixed = decode(bytes)?;
        let host = read_cstr(&bytes[Self::FIXED_SIZE..])?;
        if host.is_empty() {
            return Err(SpiceError::protocol("migrate begin without host"));
        }
        Ok(Self {
            port: fixed.port,
            sport: fixed.sport,
            host,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, SpiceError> {
        let mut out = encode(&MigrationBeginFixed {
            port: self.port,
            sport: self.sport,
        })?;
        out.extend_from_slice(self.host.as_bytes());
        out.push(0);
        Ok(out)
    }
}

/// INIT: session parameters sent once after the main channel links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Init {
    pub session_id: u32,
    pub display_channels_hint: u32,
    pub supported_mouse_modes: u32,
    pub current_mouse_mode: u32,
    pub agent_connected: u32,
    pub agent_tokens: u32,
    pub multi_media_time: u32,
    pub ram_hint: u32,
}

impl Init {
    pub const SIZE: usize = 32;

    pub fn decode(bytes: &[u8]) -> Result<Self, SpiceError> {
        decode(bytes)
    }

    pub fn encode(&self) -> Result<Vec<u8>, SpiceError> {
        encode(self)
    }
}

/// One CHANNELS_LIST entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelEntry {
    pub channel_type: u8,
    pub channel_id: u8,
}

impl ChannelEntry {
    /// `None` for channel types this engine does not know.
    pub fn channel_type(&self) -> Option<ChannelType> {
        ChannelType::try_from(self.channel_type).ok()
    }
}

pub fn decode_channels_list(bytes: &[u8]) -> Result<Vec<ChannelEntry>, SpiceError> {
    let num: u32 = decode(bytes)?;
    let rest = &bytes[4..];
    let num = num as usize;
    if rest.len() < num * 2 {
        return Err(SpiceError::protocol(format!(
            "channels list announces {num} entries but carries {} bytes",
            rest.len()
        )));
    }
    rest.chunks_exact(2).take(num).map(decode).collect()
}

pub fn encode_channels_list(entries: &[ChannelEntry]) -> Result<Vec<u8>, SpiceError> {
    let mut out = encode(&(entries.len() as u32))?;
    for e in entries {
        out.extend(encode(e)?);
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MouseMode {
    pub supported_modes: u32,
    pub current_mode: u32,
}

impl MouseMode {
    pub const SIZE: usize = 8;

    pub fn decode(bytes: &[u8]) -> Result<Self, SpiceError> {
        decode(bytes)
    }
}

/// Body of MOUSE_MODE_REQUEST.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MouseModeRequest {
    pub mode: u32,
}

/// Body of CLIENT_INFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub cache_size: u64,
}

/// Body of AGENT_START.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStart {
    pub num_tokens: u32,
}

/// Read the single `u32` carried by MULTI_MEDIA_TIME, AGENT_DISCONNECTED
/// and AGENT_TOKEN.
pub fn decode_u32(bytes: &[u8]) -> Result<u32, SpiceError> {
    decode(bytes)
}
