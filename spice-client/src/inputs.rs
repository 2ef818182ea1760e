//! Inputs channel: keyboard and mouse forwarding.
//!
//! The handler tracks the keyboard modifier state reported by the
//! server and the mouse-motion budget; the encoders build the
//! messages the application posts on the channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};
use spice_core::dispatch::HandlerFn;
use spice_core::{
    Channel, ChannelContext, ChannelEnv, ChannelFactory, ChannelHandler, ChannelIdentity,
    ChannelType, HandlerTable, InMessage, OutMessage, SpiceError, protocol,
};
use tracing::{debug, trace};

/// Motions the server acknowledges with one MOUSE_MOTION_ACK.
pub const MOTION_ACK_BUNCH: u32 = 4;

/// Server → client message types.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputsMessage {
    Init = 101,
    KeyModifiers = 102,
    MouseMotionAck = 111,
}

/// Client → server message types.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputsClientMessage {
    KeyDown = 101,
    KeyUp = 102,
    KeyModifiers = 103,
    MouseMotion = 111,
    MousePosition = 112,
    MousePress = 113,
    MouseRelease = 114,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyModifiers {
    pub modifiers: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyCode {
    pub code: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MouseMotion {
    pub dx: i32,
    pub dy: i32,
    pub buttons_state: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MousePosition {
    pub x: u32,
    pub y: u32,
    pub buttons_state: u16,
    pub display_id: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MouseButton {
    pub button: u8,
    pub buttons_state: u16,
}

// ── Encoders ─────────────────────────────────────────────────────

pub fn key_down(code: u32) -> Result<OutMessage, SpiceError> {
    OutMessage::encode(InputsClientMessage::KeyDown as u16, &KeyCode { code })
}

pub fn key_up(code: u32) -> Result<OutMessage, SpiceError> {
    OutMessage::encode(InputsClientMessage::KeyUp as u16, &KeyCode { code })
}

pub fn mouse_position(x: u32, y: u32, buttons_state: u16) -> Result<OutMessage, SpiceError> {
    OutMessage::encode(
        InputsClientMessage::MousePosition as u16,
        &MousePosition {
            x,
            y,
            buttons_state,
            display_id: 0,
        },
    )
}

pub fn mouse_press(button: u8, buttons_state: u16) -> Result<OutMessage, SpiceError> {
    OutMessage::encode(
        InputsClientMessage::MousePress as u16,
        &MouseButton {
            button,
            buttons_state,
        },
    )
}

pub fn mouse_release(button: u8, buttons_state: u16) -> Result<OutMessage, SpiceError> {
    OutMessage::encode(
        InputsClientMessage::MouseRelease as u16,
        &MouseButton {
            button,
            buttons_state,
        },
    )
}

// ── State ────────────────────────────────────────────────────────

/// Input state shared between the handler and the application.
#[derive(Debug, Default)]
pub struct InputsState {
    modifiers: AtomicU32,
    /// Relative motions sent and not yet covered by an ack.
    unacked_motions: AtomicU32,
}

impl InputsState {
    pub fn modifiers(&self) -> u16 {
        self.modifiers.load(Ordering::SeqCst) as u16
    }

    pub fn unacked_motions(&self) -> u32 {
        self.unacked_motions.load(Ordering::SeqCst)
    }

    /// Build a relative motion if the server has room for it.
    pub fn motion(&self, dx: i32, dy: i32, buttons_state: u16) -> Result<Option<OutMessage>, SpiceError> {
        if self.unacked_motions() >= MOTION_ACK_BUNCH * 2 {
            trace!(dx, dy, "motion dropped; waiting for ack");
            return Ok(None);
        }
        self.unacked_motions.fetch_add(1, Ordering::SeqCst);
        let msg = OutMessage::encode(
            InputsClientMessage::MouseMotion as u16,
            &MouseMotion {
                dx,
                dy,
                buttons_state,
            },
        )?;
        Ok(Some(msg))
    }
}

// ── Handler ──────────────────────────────────────────────────────

pub struct InputsChannel {
    state: Arc<InputsState>,
}

impl InputsChannel {
    pub fn new(state: Arc<InputsState>) -> Self {
        Self { state }
    }
}

fn handle_modifiers(s: &mut InputsChannel, _ctx: &mut ChannelContext<'_>, msg: &InMessage) -> Result<(), SpiceError> {
    let KeyModifiers { modifiers } = protocol::decode(msg.data())?;
    debug!(modifiers, "keyboard modifiers");
    s.state.modifiers.store(modifiers as u32, Ordering::SeqCst);
    Ok(())
}

fn handle_motion_ack(s: &mut InputsChannel, _ctx: &mut ChannelContext<'_>, _msg: &InMessage) -> Result<(), SpiceError> {
    let _ = s
        .state
        .unacked_motions
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
            Some(n.saturating_sub(MOTION_ACK_BUNCH))
        });
    Ok(())
}

impl ChannelHandler for InputsChannel {
    fn handler_table() -> HandlerTable<Self> {
        let mut table = HandlerTable::new();
        let routes: [(InputsMessage, usize, HandlerFn<Self>); 3] = [
            (InputsMessage::Init, 2, handle_modifiers),
            (InputsMessage::KeyModifiers, 2, handle_modifiers),
            (InputsMessage::MouseMotionAck, 0, handle_motion_ack),
        ];
        for (ty, min_size, f) in routes {
            table
                .register(ty as u16, min_size, f)
                .expect("inputs message types are above the control range");
        }
        table
    }

    fn on_disconnect(&mut self, identity: ChannelIdentity) {
        debug!(channel = %identity, "inputs channel down");
        self.state.unacked_motions.store(0, Ordering::SeqCst);
    }
}

/// Builds inputs channels that all share one [`InputsState`].
pub struct InputsFactory {
    state: Arc<InputsState>,
}

impl InputsFactory {
    pub fn new(state: Arc<InputsState>) -> Self {
        Self { state }
    }
}

impl ChannelFactory for InputsFactory {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Inputs
    }

    fn create(&self, id: u8, env: Arc<ChannelEnv>) -> Channel {
        let identity = ChannelIdentity::new(ChannelType::Inputs, id);
        Channel::new(identity, InputsChannel::new(self.state.clone()), env)
    }
}

// ── Tests ────────────────────────────────────────────────────────
