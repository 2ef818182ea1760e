//! Application-facing events.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::ErrorCode;

/// What the engine reports to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    Connected,
    /// Clean, peer-initiated or requested disconnect.
    Disconnected,
    ConnectionError(ErrorCode),
    /// Every migration shadow linked to the destination.
    MigrationConnected,
    MigrationError,
}

/// Sending half of the application event stream.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<ClientEvent>,
}

impl EventSink {
    pub fn emit(&self, event: ClientEvent) {
        debug!(?event, "client event");
        if self.tx.send(event).is_err() {
            warn!(?event, "event receiver dropped");
        }
    }
}

/// Create an event sink and its receiver.
pub fn event_channel() -> (EventSink, mpsc::UnboundedReceiver<ClientEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSink { tx }, rx)
}

/// Gates disconnect reporting to one event per episode.
///
/// [`arm`](Self::arm) on every successful connect; the first
/// [`notify`](Self::notify) after that reports, later ones are dropped.
#[derive(Debug, Default)]
pub struct DisconnectNotifier {
    armed: AtomicBool,
}

impl DisconnectNotifier {
    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Report the end of an episode. `None` means a clean disconnect.
    /// Returns `true` if this call emitted the event.
    pub fn notify(&self, sink: &EventSink, code: Option<ErrorCode>) -> bool {
        if !self.armed.swap(false, Ordering::SeqCst) {
            return false;
        }
        let event = match code {
            Some(code) => ClientEvent::ConnectionError(code),
            None => ClientEvent::Disconnected,
        };
        info!(?event, "connection episode ended");
        sink.emit(event);
        true
    }
}
