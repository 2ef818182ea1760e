//! Per-channel-type message dispatch.
//!
//! A [`HandlerTable`] maps message types to either an engine control
//! route or a channel handler, each with a minimum body size. Lookup
//! fails closed: an unregistered type or a short body is a protocol
//! violation that ends the channel.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

use crate::capabilities::Capabilities;
use crate::error::SpiceError;
use crate::message::{ChannelIdentity, ControlMessage, FIRST_AVAIL_MESSAGE, InMessage, OutMessage};

/// A channel handler function.
pub type HandlerFn<S> = fn(&mut S, &mut ChannelContext<'_>, &InMessage) -> Result<(), SpiceError>;

/// Where a message type goes.
pub enum Route<S> {
    /// Handled by the engine itself.
    Control(ControlMessage),
    Handler(HandlerFn<S>),
}

impl<S> Clone for Route<S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S> Copy for Route<S> {}

impl<S> fmt::Debug for Route<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Control(c) => write!(f, "Control({c:?})"),
            Route::Handler(_) => f.write_str("Handler"),
        }
    }
}

struct Entry<S> {
    min_size: usize,
    route: Route<S>,
}

/// Message type → route table for one channel type.
pub struct HandlerTable<S> {
    entries: HashMap<u16, Entry<S>>,
}

impl<S> Default for HandlerTable<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> HandlerTable<S> {
    /// A table with every engine control message pre-registered.
    pub fn new() -> Self {
        let entries = ControlMessage::ALL
            .into_iter()
            .map(|c| {
                (
                    c as u16,
                    Entry {
                        min_size: c.min_size(),
                        route: Route::Control(c),
                    },
                )
            })
            .collect();
        Self { entries }
    }

    /// Register a channel handler for `msg_type`.
    ///
    /// Types below [`FIRST_AVAIL_MESSAGE`] belong to the engine and are
    /// rejected.
    pub fn register(
        &mut self,
        msg_type: u16,
        min_size: usize,
        handler: HandlerFn<S>,
    ) -> Result<&mut Self, SpiceError> {
        if msg_type < FIRST_AVAIL_MESSAGE {
            return Err(SpiceError::protocol(format!(
                "message type {msg_type} is reserved for control messages"
            )));
        }
        self.entries.insert(
            msg_type,
            Entry {
                min_size,
                route: Route::Handler(handler),
            },
        );
        Ok(self)
    }

    /// Route for `msg`, checking its type and body size.
    pub fn lookup(&self, msg: &InMessage) -> Result<Route<S>, SpiceError> {
        let entry = self.entries.get(&msg.msg_type()).ok_or_else(|| {
            SpiceError::protocol(format!("unhandled message type {}", msg.msg_type()))
        })?;
        if msg.size() < entry.min_size {
            return Err(SpiceError::protocol(format!(
                "message type {} body of {} bytes, need {}",
                msg.msg_type(),
                msg.size(),
                entry.min_size
            )));
        }
        Ok(entry.route)
    }

    pub fn contains(&self, msg_type: u16) -> bool {
        self.entries.contains_key(&msg_type)
    }
}

// ── ChannelContext ───────────────────────────────────────────────

/// What a handler sees of its channel while it runs.
pub struct ChannelContext<'a> {
    identity: ChannelIdentity,
    local: &'a Capabilities,
    remote: &'a Capabilities,
    outgoing: Vec<OutMessage>,
}

impl<'a> ChannelContext<'a> {
    pub fn new(identity: ChannelIdentity, local: &'a Capabilities, remote: &'a Capabilities) -> Self {
        Self {
            identity,
            local,
            remote,
            outgoing: Vec::new(),
        }
    }

    pub fn identity(&self) -> ChannelIdentity {
        self.identity
    }

    /// Queue a message on this channel, after anything already queued.
    pub fn post(&mut self, msg: OutMessage) {
        self.outgoing.push(msg);
    }

    /// Marshal `body` and queue it.
    pub fn post_encoded<T: Serialize>(&mut self, msg_type: u16, body: &T) -> Result<(), SpiceError> {
        self.post(OutMessage::encode(msg_type, body)?);
        Ok(())
    }

    /// Whether this side declared channel capability `bit`.
    pub fn test_capability(&self, bit: u32) -> bool {
        self.local.channel.test(bit)
    }

    /// Whether this side declared common capability `bit`.
    pub fn test_common_capability(&self, bit: u32) -> bool {
        self.local.common.test(bit)
    }

    /// Capabilities the server announced at link time.
    pub fn remote_capabilities(&self) -> &Capabilities {
        self.remote
    }

    pub fn take_outgoing(&mut self) -> Vec<OutMessage> {
        std::mem::take(&mut self.outgoing)
    }
}

// ── ChannelHandler ───────────────────────────────────────────────

/// Behavior of one concrete channel type.
///
/// State lives in the implementor and survives reconnects and
/// migration; the engine drives the callbacks from the channel worker.
pub trait ChannelHandler: Send + 'static {
    /// Routes for this channel type's messages.
    fn handler_table() -> HandlerTable<Self>
    where
        Self: Sized;

    /// Capability bits this side declares at link time.
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// The channel linked and is ready to exchange messages.
    fn on_connect(&mut self, _ctx: &mut ChannelContext<'_>) -> Result<(), SpiceError> {
        Ok(())
    }

    /// The channel lost its transport.
    fn on_disconnect(&mut self, _identity: ChannelIdentity) {}

    /// The channel now talks to the migration destination.
    fn on_migrate(&mut self, _ctx: &mut ChannelContext<'_>) -> Result<(), SpiceError> {
        Ok(())
    }
}
