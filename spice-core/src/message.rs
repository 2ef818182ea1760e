//! Channel identities, message type numbering and message containers.
//!
//! Uses proper enums with `TryFrom`; no panics on unknown values.
//! Type numbers below [`FIRST_AVAIL_MESSAGE`] are engine control messages
//! shared by every channel; numbers from it upward belong to the
//! channel type's own handler table.

use std::fmt;

use bytes::Bytes;
use serde::Serialize;

use crate::error::SpiceError;
use crate::header::{DataHeader, parse_sub_list};
use crate::protocol;

/// First message type number available to a concrete channel type.
pub const FIRST_AVAIL_MESSAGE: u16 = 101;

// ── ChannelType ──────────────────────────────────────────────────

/// The kinds of channel multiplexed by a session.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelType {
    Main = 1,
    Display = 2,
    Inputs = 3,
    Cursor = 4,
    Playback = 5,
    Record = 6,
    Tunnel = 7,
}

impl ChannelType {
    /// One past the highest channel type number.
    pub const END: u8 = 8;

    pub const ALL: [ChannelType; 7] = [
        ChannelType::Main,
        ChannelType::Display,
        ChannelType::Inputs,
        ChannelType::Cursor,
        ChannelType::Playback,
        ChannelType::Record,
        ChannelType::Tunnel,
    ];
}

impl TryFrom<u8> for ChannelType {
    type Error = SpiceError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ChannelType::Main),
            2 => Ok(ChannelType::Display),
            3 => Ok(ChannelType::Inputs),
            4 => Ok(ChannelType::Cursor),
            5 => Ok(ChannelType::Playback),
            6 => Ok(ChannelType::Record),
            7 => Ok(ChannelType::Tunnel),
            _ => Err(SpiceError::UnknownVariant {
                type_name: "ChannelType",
                value: value as u64,
            }),
        }
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelType::Main => "main",
            ChannelType::Display => "display",
            ChannelType::Inputs => "inputs",
            ChannelType::Cursor => "cursor",
            ChannelType::Playback => "playback",
            ChannelType::Record => "record",
            ChannelType::Tunnel => "tunnel",
        };
        f.write_str(s)
    }
}

// ── ChannelIdentity ──────────────────────────────────────────────

/// Immutable `(type, id)` pair naming a channel within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelIdentity {
    pub channel_type: ChannelType,
    pub id: u8,
}

impl ChannelIdentity {
    pub const MAIN: ChannelIdentity = ChannelIdentity {
        channel_type: ChannelType::Main,
        id: 0,
    };

    pub fn new(channel_type: ChannelType, id: u8) -> Self {
        Self { channel_type, id }
    }

    pub fn is_main(&self) -> bool {
        self.channel_type == ChannelType::Main
    }
}

impl fmt::Display for ChannelIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.channel_type, self.id)
    }
}

// ── Control messages ─────────────────────────────────────────────

/// Control messages every channel accepts from the server.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlMessage {
    Migrate = 1,
    MigrateData = 2,
    SetAck = 3,
    Ping = 4,
    WaitForChannels = 5,
    Disconnecting = 6,
    Notify = 7,
    /// Ack-bunch: the peer consumed everything sent so far.
    Ack = 8,
}

impl ControlMessage {
    pub const ALL: [ControlMessage; 8] = [
        ControlMessage::Migrate,
        ControlMessage::MigrateData,
        ControlMessage::SetAck,
        ControlMessage::Ping,
        ControlMessage::WaitForChannels,
        ControlMessage::Disconnecting,
        ControlMessage::Notify,
        ControlMessage::Ack,
    ];

    /// Smallest body the engine accepts for this control message.
    pub fn min_size(self) -> usize {
        match self {
            ControlMessage::Migrate => protocol::control::Migrate::SIZE,
            ControlMessage::MigrateData => 0,
            ControlMessage::SetAck => protocol::control::SetAck::SIZE,
            ControlMessage::Ping => protocol::control::Ping::SIZE,
            ControlMessage::WaitForChannels => 1,
            ControlMessage::Disconnecting => protocol::control::Disconnecting::SIZE,
            ControlMessage::Notify => protocol::control::Notify::FIXED_SIZE,
            ControlMessage::Ack => 0,
        }
    }
}

impl TryFrom<u16> for ControlMessage {
    type Error = SpiceError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ControlMessage::Migrate),
            2 => Ok(ControlMessage::MigrateData),
            3 => Ok(ControlMessage::SetAck),
            4 => Ok(ControlMessage::Ping),
            5 => Ok(ControlMessage::WaitForChannels),
            6 => Ok(ControlMessage::Disconnecting),
            7 => Ok(ControlMessage::Notify),
            8 => Ok(ControlMessage::Ack),
            _ => Err(SpiceError::UnknownVariant {
                type_name: "ControlMessage",
                value: value as u64,
            }),
        }
    }
}

/// Control messages every channel can send to the server.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientControl {
    AckSync = 1,
    Ack = 2,
    Pong = 3,
    MigrateFlushMark = 4,
    MigrateData = 5,
    Disconnecting = 6,
}

impl ClientControl {
    /// Returns `true` if `msg_type` is an engine control type rather
    /// than a channel message.
    pub fn is_control(msg_type: u16) -> bool {
        msg_type < FIRST_AVAIL_MESSAGE
    }
}

// ── Incoming messages ────────────────────────────────────────────

/// One message as seen by a handler: a type and an owned body.
///
/// Sub-messages share the serial of the compound message that carried
/// them.
#[derive(Debug, Clone)]
pub struct InMessage {
    msg_type: u16,
    serial: u64,
    data: Bytes,
}

impl InMessage {
    pub fn new(msg_type: u16, serial: u64, data: Bytes) -> Self {
        Self {
            msg_type,
            serial,
            data,
        }
    }

    pub fn msg_type(&self) -> u16 {
        self.msg_type
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Hand the body over, e.g. to forward it unchanged.
    pub fn into_data(self) -> Bytes {
        self.data
    }
}

/// A fully received message: header plus exactly `size` bytes of body.
#[derive(Debug, Clone)]
pub struct CompoundMessage {
    header: DataHeader,
    body: Bytes,
}

impl CompoundMessage {
    pub fn new(header: DataHeader, body: Bytes) -> Self {
        Self { header, body }
    }

    pub fn header(&self) -> &DataHeader {
        &self.header
    }

    pub fn serial(&self) -> u64 {
        self.header.serial
    }

    pub fn msg_type(&self) -> u16 {
        self.header.msg_type
    }

    /// The outer message. When a sub-list is present its payload ends
    /// where the list region starts.
    pub fn outer(&self) -> InMessage {
        let end = match self.header.sub_list {
            0 => self.body.len(),
            n => (n as usize).min(self.body.len()),
        };
        InMessage::new(self.header.msg_type, self.header.serial, self.body.slice(..end))
    }

    /// The sub-messages listed in the body, in list order.
    pub fn sub_messages(&self) -> Result<Vec<InMessage>, SpiceError> {
        if self.header.sub_list == 0 {
            return Ok(Vec::new());
        }
        let spans = parse_sub_list(&self.body, self.header.sub_list)?;
        Ok(spans
            .into_iter()
            .map(|s| InMessage::new(s.msg_type, self.header.serial, self.body.slice(s.payload)))
            .collect())
    }

    /// Every sub-message in list order, then the outer message.
    pub fn dispatch_order(&self) -> Result<Vec<InMessage>, SpiceError> {
        let mut order = self.sub_messages()?;
        order.push(self.outer());
        Ok(order)
    }
}

// ── Outgoing messages ────────────────────────────────────────────

/// A message waiting in a channel's outgoing queue.
///
/// The serial is assigned by the channel worker at transmission time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutMessage {
    msg_type: u16,
    body: Vec<u8>,
}

impl OutMessage {
    pub fn new(msg_type: u16, body: Vec<u8>) -> Self {
        Self { msg_type, body }
    }

    /// A message with no body.
    pub fn empty(msg_type: u16) -> Self {
        Self::new(msg_type, Vec::new())
    }

    /// Marshal a fixed-layout body.
    pub fn encode<T: Serialize>(msg_type: u16, body: &T) -> Result<Self, SpiceError> {
        Ok(Self::new(msg_type, protocol::encode(body)?))
    }

    pub fn control(kind: ClientControl, body: Vec<u8>) -> Self {
        Self::new(kind as u16, body)
    }

    pub fn msg_type(&self) -> u16 {
        self.msg_type
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Engine control messages bypass the ack window.
    pub fn is_control(&self) -> bool {
        ClientControl::is_control(self.msg_type)
    }
}

/// An [`OutMessage`] stamped with its channel serial, ready for the codec.
#[derive(Debug, Clone)]
pub struct OutFrame {
    pub serial: u64,
    pub message: OutMessage,
}
