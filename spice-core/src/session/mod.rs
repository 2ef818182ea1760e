//! A client session: the main channel plus every channel it announced.
//!
//! The session owns the main [`Channel`], the channels created from
//! CHANNELS_LIST, the factory registry, and the driver task that runs
//! migration requests in the order the server sent them.

mod main_channel;
pub mod registry;

pub use main_channel::SessionInfo;
pub use registry::{ChannelFactory, ChannelRegistry};

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::capabilities::Capabilities;
use crate::channel::{Channel, ChannelEnv, ChannelState, Poster};
use crate::config::{ChannelConfig, ConnectionOptions, Target};
use crate::error::SpiceError;
use crate::events::{ClientEvent, event_channel};
use crate::link::{RsaTicketSealer, TicketSealer};
use crate::message::{ChannelIdentity, OutMessage};
use crate::migrate::Migration;
use crate::protocol::control::WaitEntry;

use main_channel::{MainChannel, MigrationRequest};

/// Everything a session needs besides its target and password.
pub struct SessionOptions {
    pub config: ChannelConfig,
    pub connection: ConnectionOptions,
    pub sealer: Arc<dyn TicketSealer>,
    /// Capabilities the main channel declares.
    pub main_caps: Capabilities,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            config: ChannelConfig::default(),
            connection: ConnectionOptions::default(),
            sealer: Arc::new(RsaTicketSealer),
            main_caps: Capabilities::default(),
        }
    }
}

/// State the main channel handler shares with the session handle.
pub(crate) struct SessionShared {
    registry: ChannelRegistry,
    channels: Mutex<Vec<Arc<Channel>>>,
    info: Mutex<SessionInfo>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl SessionShared {
    fn channel(&self, identity: ChannelIdentity) -> Option<Arc<Channel>> {
        lock(&self.channels)
            .iter()
            .find(|c| c.identity() == identity)
            .cloned()
    }

    fn add_channel(&self, channel: Arc<Channel>) {
        lock(&self.channels).push(channel);
    }

    fn take_channels(&self) -> Vec<Arc<Channel>> {
        std::mem::take(&mut *lock(&self.channels))
    }

    fn update_info(&self, f: impl FnOnce(&mut SessionInfo)) {
        f(&mut lock(&self.info));
    }
}

pub struct Session {
    env: Arc<ChannelEnv>,
    shared: Arc<SessionShared>,
    main: Channel,
    driver: JoinHandle<()>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("target", &self.env.target())
            .field("main", &self.main)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session for `target`. Must be called inside a tokio
    /// runtime. Application events arrive on the returned receiver.
    pub fn new(
        target: Target,
        password: impl Into<String>,
        registry: ChannelRegistry,
        options: SessionOptions,
    ) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (events, events_rx) = event_channel();
        let env = Arc::new(ChannelEnv::new(
            options.config,
            options.connection,
            target,
            password,
            options.sealer,
            events,
        ));
        let shared = Arc::new(SessionShared {
            registry,
            channels: Mutex::new(Vec::new()),
            info: Mutex::new(SessionInfo::default()),
        });

        let (migrate_tx, migrate_rx) = mpsc::unbounded_channel();
        let handler = MainChannel::new(env.clone(), shared.clone(), migrate_tx, options.main_caps);
        let main = Channel::new(ChannelIdentity::MAIN, handler, env.clone());
        let driver = tokio::spawn(drive_migration(env.clone(), main.poster(), migrate_rx));

        (
            Self {
                env,
                shared,
                main,
                driver,
            },
            events_rx,
        )
    }

    pub fn env(&self) -> &Arc<ChannelEnv> {
        &self.env
    }

    pub fn main(&self) -> &Channel {
        &self.main
    }

    pub fn info(&self) -> SessionInfo {
        *lock(&self.shared.info)
    }

    /// Start a new connection episode. A session whose main channel is
    /// already connecting or connected is left alone.
    pub async fn connect(&self) -> Result<(), SpiceError> {
        if self.main.state().is_active() {
            return Ok(());
        }
        for channel in self.shared.take_channels() {
            channel.abort().await;
        }
        self.env.migration.abort().await;
        self.env.migration.clear_channels();
        self.env.sync.reset();
        self.env.arm_disconnect();
        info!(host = %self.env.target().host, "connecting session");
        self.main.connect()
    }

    /// Close every channel cleanly. The application gets one
    /// [`ClientEvent::Disconnected`] for the episode.
    pub async fn disconnect(&self) {
        self.env.report_disconnect();
        self.env.migration.abort().await;
        self.env.sync.abort();
        let channels: Vec<_> = lock(&self.shared.channels).clone();
        for channel in channels {
            channel.disconnect().await;
        }
        self.main.disconnect().await;
        debug!("session disconnected");
    }

    /// Stop the session for good. Safe from any state; repeated calls
    /// return once everything has exited.
    pub async fn abort(&self) {
        self.env.sync.abort();
        self.main.abort().await;
        for channel in self.shared.take_channels() {
            channel.abort().await;
        }
        self.env.migration.abort().await;
        self.driver.abort();
        debug!("session aborted");
    }

    /// Every channel created from CHANNELS_LIST, main excluded.
    pub fn channels(&self) -> Vec<Arc<Channel>> {
        lock(&self.shared.channels).clone()
    }

    pub fn channel(&self, identity: ChannelIdentity) -> Option<Arc<Channel>> {
        self.shared.channel(identity)
    }

    /// Identities and states of main and every other channel.
    pub fn channel_states(&self) -> Vec<(ChannelIdentity, ChannelState)> {
        std::iter::once((self.main.identity(), self.main.state()))
            .chain(self.channels().iter().map(|c| (c.identity(), c.state())))
            .collect()
    }

    /// Wait until each listed channel dispatched up to its serial.
    pub async fn wait_for_channels(&self, entries: &[WaitEntry]) -> Result<(), SpiceError> {
        self.env.sync.wait(entries).await
    }

    pub fn post_main(&self, msg: OutMessage) -> Result<(), SpiceError> {
        self.main.post_message(msg)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// Run migration requests one at a time, in arrival order.
async fn drive_migration(
    env: Arc<ChannelEnv>,
    main: Poster,
    mut requests: mpsc::UnboundedReceiver<MigrationRequest>,
) {
    while let Some(request) = requests.recv().await {
        match request {
            MigrationRequest::Begin(begin) => Migration::start(&env, main.clone(), &begin).await,
            MigrationRequest::Cancel => env.migration.abort().await,
        }
    }
}
