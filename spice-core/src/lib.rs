//! # spice-core
//!
//! Client-side channel engine for the SPICE remote-display protocol.
//!
//! This crate contains:
//! - **Wire types**: `DataHeader`, sub-message lists, `CompoundMessage`, `OutMessage`
//! - **Protocol bodies**: control messages shared by every channel, main-channel messages
//! - **Codec**: `WireCodec` for framed I/O via `tokio_util`
//! - **Link**: the per-connection handshake with capability exchange and ticket sealing
//! - **Transport**: `Peer` over plain TCP or TLS, with host certificate verification
//! - **Channel**: worker-driven channels with ack-windowed flow control and dispatch tables
//! - **Migration**: shadow connections swapped into live channels without a gap
//! - **Session**: main channel, channel registry and cross-channel synchronization
//! - **Error**: `SpiceError`, a typed, `thiserror`-based error hierarchy

pub mod capabilities;
pub mod channel;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod header;
pub mod link;
pub mod message;
pub mod migrate;
pub mod protocol;
pub mod session;
pub mod sync;
pub mod transport;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use capabilities::{Capabilities, CapabilitySet};
pub use channel::{Channel, ChannelEnv, ChannelState, ChannelStats, Poster};
pub use codec::WireCodec;
pub use config::{ChannelConfig, ConnectionMode, ConnectionOptions, Target};
pub use dispatch::{ChannelContext, ChannelHandler, HandlerTable};
pub use error::{ErrorCode, SpiceError};
pub use events::{ClientEvent, EventSink, event_channel};
pub use header::{DataHeader, HEADER_SIZE};
pub use link::{LinkError, RsaTicketSealer, TicketSealer};
pub use message::{ChannelIdentity, ChannelType, InMessage, OutMessage};
pub use migrate::Migration;
pub use session::{ChannelFactory, ChannelRegistry, Session, SessionInfo, SessionOptions};
pub use sync::SyncTable;
pub use transport::{HostAuthOptions, Peer, VerifyOps};
