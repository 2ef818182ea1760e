//! Connection state of a channel and its observable counters.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use tokio::sync::watch;

/// Lifecycle of one channel.
///
/// ```text
/// Passive ──► Connecting ──► Connected ──► Disconnected ──► Connecting …
///    └────────────┴──────────────┴──────────────┴──────► Terminated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelState {
    #[default]
    Passive,
    Connecting,
    Connected,
    Disconnected,
    /// Permanent; the channel never runs again.
    Terminated,
}

impl ChannelState {
    /// `true` while a worker owns the channel.
    pub fn is_active(self) -> bool {
        matches!(self, ChannelState::Connecting | ChannelState::Connected)
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelState::Passive => "passive",
            ChannelState::Connecting => "connecting",
            ChannelState::Connected => "connected",
            ChannelState::Disconnected => "disconnected",
            ChannelState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Snapshot of a channel's traffic and flow-control counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    /// Serial of the last message written.
    pub last_serial: u64,
    pub window: u32,
    pub unacked: u32,
}

/// State shared between a channel handle and its worker. Only the
/// worker writes, except for the final transition to `Terminated`.
#[derive(Debug)]
pub(crate) struct ChannelShared {
    state: watch::Sender<ChannelState>,
    sent: AtomicU64,
    received: AtomicU64,
    last_serial: AtomicU64,
    window: AtomicU32,
    unacked: AtomicU32,
}

impl ChannelShared {
    pub(crate) fn new(window: u32) -> Self {
        let (state, _) = watch::channel(ChannelState::Passive);
        Self {
            state,
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            last_serial: AtomicU64::new(0),
            window: AtomicU32::new(window),
            unacked: AtomicU32::new(0),
        }
    }

    pub(crate) fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    /// Move to `next` unless the channel is already terminated.
    pub(crate) fn set_state(&self, next: ChannelState) {
        self.state.send_if_modified(|s| {
            if *s == ChannelState::Terminated || *s == next {
                return false;
            }
            *s = next;
            true
        });
    }

    pub(crate) fn record_sent(&self, serial: u64) {
        self.sent.fetch_add(1, Ordering::Relaxed);
        self.last_serial.store(serial, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_window(&self, window: u32, unacked: u32) {
        self.window.store(window, Ordering::Relaxed);
        self.unacked.store(unacked, Ordering::Relaxed);
    }

    pub(crate) fn stats(&self) -> ChannelStats {
        ChannelStats {
            messages_sent: self.sent.load(Ordering::Relaxed),
            messages_received: self.received.load(Ordering::Relaxed),
            last_serial: self.last_serial.load(Ordering::Relaxed),
            window: self.window.load(Ordering::Relaxed),
            unacked: self.unacked.load(Ordering::Relaxed),
        }
    }
}
