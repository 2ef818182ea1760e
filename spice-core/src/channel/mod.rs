//! Channels: one typed, independently connected stream of a session.
//!
//! A [`Channel`] is a handle. Each [`connect`](Channel::connect) spawns
//! a worker task that owns the transport for that connection; the
//! handle only enqueues commands, requests aborts and reads state.
//!
//! Per-type behavior comes from a [`ChannelHandler`]; its state is kept
//! across reconnects and migration.

pub mod ack;
mod connect;
pub mod env;
pub mod queue;
pub mod state;
mod worker;

pub(crate) use connect::establish;
pub use env::ChannelEnv;
pub use state::{ChannelState, ChannelStats};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::capabilities::Capabilities;
use crate::dispatch::ChannelHandler;
use crate::error::SpiceError;
use crate::message::{ChannelIdentity, OutMessage};

use state::ChannelShared;
use worker::RunArgs;

/// Requests a channel handle sends to its worker.
#[derive(Debug)]
pub enum Command {
    Post(OutMessage),
    /// Engine reply sent ahead of application messages and outside
    /// the ack window.
    Reply(OutMessage),
    /// Close the connection of the given run.
    Disconnect(u64),
}

/// Cheap cloneable handle for posting messages to a channel.
#[derive(Debug, Clone)]
pub struct Poster {
    identity: ChannelIdentity,
    tx: mpsc::UnboundedSender<Command>,
}

impl Poster {
    pub fn identity(&self) -> ChannelIdentity {
        self.identity
    }

    pub fn post(&self, msg: OutMessage) -> Result<(), SpiceError> {
        self.tx.send(Command::Post(msg))?;
        Ok(())
    }

    /// Post on the control lane so the message never takes a window slot.
    pub(crate) fn post_reply(&self, msg: OutMessage) -> Result<(), SpiceError> {
        self.tx.send(Command::Reply(msg))?;
        Ok(())
    }
}

type Launcher = Box<dyn Fn(RunArgs) -> JoinHandle<()> + Send + Sync>;

struct Run {
    generation: u64,
    cancel: CancellationToken,
    exited: watch::Receiver<bool>,
}

impl Run {
    fn is_running(&self) -> bool {
        !*self.exited.borrow()
    }
}

pub struct Channel {
    identity: ChannelIdentity,
    env: Arc<ChannelEnv>,
    shared: Arc<ChannelShared>,
    caps: Arc<Capabilities>,
    tx: mpsc::UnboundedSender<Command>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Command>>>,
    launcher: Launcher,
    run: StdMutex<Option<Run>>,
    generation: AtomicU64,
    terminating: AtomicBool,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("identity", &self.identity)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Channel {
    /// Create a passive channel driven by `handler`.
    pub fn new<H: ChannelHandler>(identity: ChannelIdentity, handler: H, env: Arc<ChannelEnv>) -> Self {
        let caps = Arc::new(handler.capabilities());
        let handler = Arc::new(Mutex::new(handler));
        let table = Arc::new(H::handler_table());
        let launcher: Launcher = Box::new(move |args| {
            tokio::spawn(worker::run(handler.clone(), table.clone(), args))
        });
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            identity,
            shared: Arc::new(ChannelShared::new(env.config.ack_window)),
            env,
            caps,
            tx,
            rx: Arc::new(Mutex::new(rx)),
            launcher,
            run: StdMutex::new(None),
            generation: AtomicU64::new(0),
            terminating: AtomicBool::new(false),
        }
    }

    pub fn identity(&self) -> ChannelIdentity {
        self.identity
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ChannelState> {
        self.shared.subscribe()
    }

    pub fn stats(&self) -> ChannelStats {
        self.shared.stats()
    }

    pub fn poster(&self) -> Poster {
        Poster {
            identity: self.identity,
            tx: self.tx.clone(),
        }
    }

    fn lock_run(&self) -> std::sync::MutexGuard<'_, Option<Run>> {
        self.run.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start connecting. A channel that is already connecting or
    /// connected is left alone.
    pub fn connect(&self) -> Result<(), SpiceError> {
        if self.terminating.load(Ordering::SeqCst) || self.state() == ChannelState::Terminated {
            return Err(SpiceError::Aborted);
        }
        let mut run = self.lock_run();
        if self.terminating.load(Ordering::SeqCst) {
            return Err(SpiceError::Aborted);
        }
        // A worker that already published Disconnected only has its
        // locks left to release; the next run waits for them.
        if run.as_ref().is_some_and(Run::is_running) && self.state().is_active() {
            return Ok(());
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        let (exited_tx, exited_rx) = watch::channel(false);
        self.shared.set_state(ChannelState::Connecting);
        debug!(channel = %self.identity, generation, "starting channel worker");

        (self.launcher)(RunArgs {
            identity: self.identity,
            generation,
            env: self.env.clone(),
            shared: self.shared.clone(),
            caps: self.caps.clone(),
            commands: self.rx.clone(),
            cancel: cancel.clone(),
            exited: exited_tx,
        });
        *run = Some(Run {
            generation,
            cancel,
            exited: exited_rx,
        });
        Ok(())
    }

    /// Queue `msg` behind everything posted before it.
    pub fn post_message(&self, msg: OutMessage) -> Result<(), SpiceError> {
        if self.state() == ChannelState::Terminated {
            return Err(SpiceError::ChannelClosed);
        }
        self.tx.send(Command::Post(msg))?;
        Ok(())
    }

    /// Close the current connection cleanly and wait for the worker.
    pub async fn disconnect(&self) {
        let exited = {
            let run = self.lock_run();
            match run.as_ref() {
                Some(r) if r.is_running() => {
                    let _ = self.tx.send(Command::Disconnect(r.generation));
                    Some(r.exited.clone())
                }
                _ => None,
            }
        };
        if let Some(mut exited) = exited {
            let _ = exited.wait_for(|done| *done).await;
        }
    }

    /// Stop the channel for good. Every caller returns only after the
    /// worker has exited; repeated and concurrent calls are harmless.
    pub async fn abort(&self) {
        self.terminating.store(true, Ordering::SeqCst);
        let exited = {
            let run = self.lock_run();
            run.as_ref().map(|r| {
                r.cancel.cancel();
                r.exited.clone()
            })
        };
        if let Some(mut exited) = exited {
            let _ = exited.wait_for(|done| *done).await;
        }
        self.shared.set_state(ChannelState::Terminated);
    }

    /// Wait until the channel reaches a state matching `pred`.
    pub async fn wait_for_state(
        &self,
        pred: impl FnMut(&ChannelState) -> bool,
    ) -> Result<ChannelState, SpiceError> {
        let mut rx = self.subscribe();
        let state = rx.wait_for(pred).await.map_err(|_| SpiceError::ChannelClosed)?;
        Ok(*state)
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Some(run) = self.lock_run().take() {
            run.cancel.cancel();
        }
    }
}
