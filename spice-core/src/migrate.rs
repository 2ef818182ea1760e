//! Live migration of a session to another host.
//!
//! On MIGRATE_BEGIN the coordinator opens one *shadow* connection per
//! registered channel to the destination while the source keeps
//! serving. Once every shadow is linked the server is told so, and each
//! channel later swaps its live transport for its shadow when the
//! source sends MIGRATE. Any shadow failure discards the whole set and
//! the source connection is left untouched.
//!
//! ## Locking
//!
//! One mutex guards the shadow list and the running/aborting/connected
//! flags; `changed` is signalled whenever the connect task finishes or
//! an abort completes. Nothing awaits while holding the lock.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capabilities::Capabilities;
use crate::channel::{self, ChannelEnv, Poster};
use crate::config::Target;
use crate::error::SpiceError;
use crate::events::ClientEvent;
use crate::message::{ChannelIdentity, OutMessage};
use crate::protocol::main_channel::{MainClientMessage, MigrationBegin};
use crate::transport::{Peer, ShutdownHandle};

/// A channel taking part in migrations.
#[derive(Debug)]
struct Shadow {
    identity: ChannelIdentity,
    caps: Arc<Capabilities>,
    peer: Option<Peer>,
    shut: Option<ShutdownHandle>,
    valid: bool,
}

impl Shadow {
    fn disconnect(&mut self) {
        if let Some(shut) = &self.shut {
            shut.shutdown();
        }
        self.valid = false;
    }

    fn close(&mut self) {
        if let Some(mut peer) = self.peer.take() {
            peer.close();
        }
        self.shut = None;
        self.valid = false;
    }
}

#[derive(Debug, Default)]
struct MigrationState {
    shadows: Vec<Shadow>,
    target: Option<Target>,
    running: bool,
    aborting: bool,
    connected: bool,
    pending: usize,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl MigrationState {
    fn close_shadows(&mut self) {
        for s in &mut self.shadows {
            s.close();
        }
        self.pending = 0;
    }
}

/// Coordinator for shadow connections.
#[derive(Debug)]
pub struct Migration {
    state: Mutex<MigrationState>,
    changed: Notify,
    poll_interval: Duration,
}

impl Migration {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            state: Mutex::new(MigrationState::default()),
            changed: Notify::new(),
            poll_interval,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MigrationState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a live channel. The first registered channel connects
    /// first, so the session registers main before anything else.
    pub fn add_channel(&self, identity: ChannelIdentity, caps: Arc<Capabilities>) {
        let mut st = self.lock();
        if st.shadows.iter().any(|s| s.identity == identity) {
            return;
        }
        st.shadows.push(Shadow {
            identity,
            caps,
            peer: None,
            shut: None,
            valid: false,
        });
    }

    /// Forget every registered channel. Only legal while idle.
    pub fn clear_channels(&self) {
        let mut st = self.lock();
        if st.running {
            warn!("clearing migration channels while a migration runs");
        }
        st.close_shadows();
        st.shadows.clear();
    }

    pub fn channels(&self) -> Vec<ChannelIdentity> {
        self.lock().shadows.iter().map(|s| s.identity).collect()
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    /// Every shadow is linked and waiting to be swapped in.
    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    /// Start migrating to the destination in `begin`. Any migration
    /// already in progress is aborted first.
    ///
    /// The outcome is posted on `main` as MIGRATE_CONNECTED or
    /// MIGRATE_CONNECT_ERROR and reported as a [`ClientEvent`].
    pub async fn start(env: &Arc<ChannelEnv>, main: Poster, begin: &MigrationBegin) {
        let migration = &env.migration;
        migration.abort().await;

        let target = Target::new(
            begin.host.clone(),
            (begin.port != 0).then_some(begin.port),
            (begin.sport != 0).then_some(begin.sport),
        );
        info!(host = %target.host, port = ?target.port, sport = ?target.sport, "migration started");

        let mut st = migration.lock();
        st.target = Some(target.clone());
        st.running = true;
        st.connected = false;
        st.cancel = CancellationToken::new();
        let cancel = st.cancel.clone();
        let env = env.clone();
        st.task = Some(tokio::spawn(async move {
            let result = connect_all(&env, &target, &cancel).await;
            env.migration.finish_connect(&env, &main, result);
        }));
    }

    /// Record the outcome of the connect task and wake abort waiters.
    fn finish_connect(&self, env: &ChannelEnv, main: &Poster, result: Result<(), SpiceError>) {
        let outcome = {
            let mut st = self.lock();
            let outcome = if st.aborting {
                debug!("migration connect aborted");
                st.close_shadows();
                None
            } else {
                // A failed swap cancels the run without going through abort.
                let result = match result {
                    Ok(()) if st.cancel.is_cancelled() => Err(SpiceError::Aborted),
                    r => r,
                };
                match result {
                    Ok(()) => {
                        st.connected = true;
                        info!(shadows = st.pending, "migration destination connected");
                        Some((MainClientMessage::MigrateConnected, ClientEvent::MigrationConnected))
                    }
                    Err(e) => {
                        warn!(error = %e, "migration connect failed; discarding shadows");
                        st.close_shadows();
                        Some((MainClientMessage::MigrateConnectError, ClientEvent::MigrationError))
                    }
                }
            };
            st.running = false;
            outcome
        };
        self.changed.notify_waiters();

        if let Some((msg, event)) = outcome {
            if let Err(e) = main.post_reply(OutMessage::empty(msg as u16)) {
                debug!(error = %e, "main channel gone; migration result not posted");
            }
            env.events.emit(event);
        }
    }

    /// Swap `live` with the linked shadow for `identity`.
    ///
    /// Returns the destination target once the last shadow has been
    /// swapped in; the shadow set is torn down at that point. Any
    /// failure discards the whole set and leaves `live` untouched.
    pub fn swap_peer(
        &self,
        identity: ChannelIdentity,
        live: &mut Peer,
    ) -> Result<Option<Target>, SpiceError> {
        let result = {
            let mut st = self.lock();
            let result = Self::swap_locked(&mut st, identity, live);
            if let Err(e) = &result {
                warn!(channel = %identity, error = %e, "migration swap failed; discarding shadows");
                st.cancel.cancel();
                st.close_shadows();
                st.connected = false;
                st.target = None;
            }
            result
        };
        if result.is_err() {
            self.changed.notify_waiters();
        }
        result
    }

    fn swap_locked(
        st: &mut MigrationState,
        identity: ChannelIdentity,
        live: &mut Peer,
    ) -> Result<Option<Target>, SpiceError> {
        if st.running {
            return Err(SpiceError::protocol("migrate while shadows are still connecting"));
        }
        if !st.connected {
            return Err(SpiceError::protocol("migrate without a connected destination"));
        }
        let Some(shadow) = st
            .shadows
            .iter_mut()
            .find(|s| s.identity == identity && s.valid)
        else {
            return Err(SpiceError::protocol(format!("no valid migration shadow for {identity}")));
        };
        let Some(mut peer) = shadow.peer.take() else {
            return Err(SpiceError::protocol(format!("migration shadow for {identity} has no transport")));
        };

        live.swap(&mut peer);
        // `peer` now holds the source connection.
        peer.close();
        shadow.shut = None;
        shadow.valid = false;
        st.pending = st.pending.saturating_sub(1);
        debug!(channel = %identity, pending = st.pending, "transport swapped to migration destination");

        if st.pending > 0 {
            return Ok(None);
        }
        info!("migration complete");
        st.close_shadows();
        st.connected = false;
        Ok(st.target.take())
    }

    /// Abort any migration in progress and discard its shadows.
    ///
    /// Returns once the connect task has exited. Concurrent callers all
    /// wait for the same completion.
    pub async fn abort(&self) {
        let already_aborting = {
            let mut st = self.lock();
            if !st.aborting {
                st.aborting = true;
                st.cancel.cancel();
                false
            } else {
                true
            }
        };
        if already_aborting {
            self.wait_aborted().await;
            return;
        }

        loop {
            let notified = self.changed.notified();
            {
                let mut st = self.lock();
                for s in &mut st.shadows {
                    s.disconnect();
                }
                if !st.running {
                    break;
                }
            }
            let _ = tokio::time::timeout(self.poll_interval, notified).await;
        }

        let task = {
            let mut st = self.lock();
            st.close_shadows();
            st.connected = false;
            st.target = None;
            st.task.take()
        };
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "migration task panicked");
            }
        }

        self.lock().aborting = false;
        self.changed.notify_waiters();
    }

    async fn wait_aborted(&self) {
        loop {
            let notified = self.changed.notified();
            if !self.lock().aborting {
                return;
            }
            let _ = tokio::time::timeout(self.poll_interval, notified).await;
        }
    }

    fn snapshot(&self) -> Vec<(ChannelIdentity, Arc<Capabilities>)> {
        self.lock()
            .shadows
            .iter()
            .map(|s| (s.identity, s.caps.clone()))
            .collect()
    }

    fn install(&self, identity: ChannelIdentity, peer: Peer) -> Result<(), SpiceError> {
        let mut st = self.lock();
        if st.aborting {
            return Err(SpiceError::Aborted);
        }
        let Some(shadow) = st.shadows.iter_mut().find(|s| s.identity == identity) else {
            return Err(SpiceError::MigrationConnectError(format!(
                "{identity} was unregistered during migration"
            )));
        };
        shadow.shut = Some(peer.shutdown_handle());
        shadow.peer = Some(peer);
        shadow.valid = true;
        st.pending += 1;
        Ok(())
    }
}

/// Link every registered channel to `target`, main first.
async fn connect_all(
    env: &ChannelEnv,
    target: &Target,
    cancel: &CancellationToken,
) -> Result<(), SpiceError> {
    let shadows = env.migration.snapshot();
    let connection_id = env.connection_id();

    for (identity, caps) in shadows {
        let deadline = env.config.migrate_connect_timeout;
        let linked = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SpiceError::Aborted),
            r = channel::establish(env, target, identity, &caps, connection_id, deadline) => r,
        };
        let (peer, _remote) = linked.map_err(|e| match e {
            SpiceError::Aborted => e,
            e => SpiceError::MigrationConnectError(format!("{identity}: {e}")),
        })?;
        debug!(channel = %identity, "migration shadow linked");
        env.migration.install(identity, peer)?;
    }
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────
