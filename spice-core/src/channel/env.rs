//! Session-wide context shared by every channel worker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info};

use crate::config::{ChannelConfig, ConnectionOptions, Target};
use crate::error::ErrorCode;
use crate::events::{DisconnectNotifier, EventSink};
use crate::link::TicketSealer;
use crate::message::ChannelIdentity;
use crate::migrate::Migration;
use crate::sync::SyncTable;
use crate::transport::ShutdownHandle;

/// Everything a channel needs beyond its own handler.
pub struct ChannelEnv {
    pub config: ChannelConfig,
    pub options: ConnectionOptions,
    pub sync: SyncTable,
    pub migration: Migration,
    pub events: EventSink,
    target: Mutex<Target>,
    connection_id: AtomicU32,
    password: String,
    sealer: Arc<dyn TicketSealer>,
    notifier: DisconnectNotifier,
    transports: Mutex<HashMap<ChannelIdentity, ShutdownHandle>>,
}

impl std::fmt::Debug for ChannelEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelEnv")
            .field("target", &self.target())
            .field("connection_id", &self.connection_id())
            .finish_non_exhaustive()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl ChannelEnv {
    pub fn new(
        config: ChannelConfig,
        options: ConnectionOptions,
        target: Target,
        password: impl Into<String>,
        sealer: Arc<dyn TicketSealer>,
        events: EventSink,
    ) -> Self {
        let migration = Migration::new(config.abort_poll_interval);
        Self {
            config,
            options,
            sync: SyncTable::new(),
            migration,
            events,
            target: Mutex::new(target),
            connection_id: AtomicU32::new(0),
            password: password.into(),
            sealer,
            notifier: DisconnectNotifier::default(),
            transports: Mutex::new(HashMap::new()),
        }
    }

    pub fn target(&self) -> Target {
        lock(&self.target).clone()
    }

    pub fn set_target(&self, target: Target) {
        info!(host = %target.host, port = ?target.port, sport = ?target.sport, "session target changed");
        *lock(&self.target) = target;
    }

    /// Session id allocated by the server; 0 until INIT arrives.
    pub fn connection_id(&self) -> u32 {
        self.connection_id.load(Ordering::SeqCst)
    }

    pub fn set_connection_id(&self, id: u32) {
        self.connection_id.store(id, Ordering::SeqCst);
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn sealer(&self) -> &dyn TicketSealer {
        self.sealer.as_ref()
    }

    // ── Disconnect episodes ──────────────────────────────────────

    /// Start a new episode: the next channel failure is reported.
    pub fn arm_disconnect(&self) {
        self.notifier.arm();
    }

    pub(crate) fn register_transport(&self, identity: ChannelIdentity, handle: ShutdownHandle) {
        lock(&self.transports).insert(identity, handle);
    }

    pub(crate) fn unregister_transport(&self, identity: ChannelIdentity) {
        lock(&self.transports).remove(&identity);
    }

    /// Shut every live channel transport; workers then exit on their own.
    pub fn shutdown_transports(&self) {
        let handles: Vec<_> = lock(&self.transports).values().cloned().collect();
        debug!(count = handles.len(), "shutting down channel transports");
        for h in handles {
            h.shutdown();
        }
    }

    /// The application ended the episode itself; report a clean
    /// disconnect without touching the transports.
    pub(crate) fn report_disconnect(&self) {
        self.notifier.notify(&self.events, None);
    }

    /// A channel lost its connection. The first loss of an episode is
    /// reported and takes every other channel down with it.
    pub(crate) fn channel_down(&self, identity: ChannelIdentity, code: Option<ErrorCode>) {
        if self.notifier.notify(&self.events, code) {
            info!(channel = %identity, ?code, "session connection lost");
            self.shutdown_transports();
        }
    }
}
