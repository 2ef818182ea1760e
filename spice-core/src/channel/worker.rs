//! The per-channel worker task.
//!
//! One worker runs per connection attempt. It owns the transport, the
//! outgoing queue and the ack window, and is the only task that reads,
//! writes or changes the channel's state. Its loop multiplexes three
//! sources:
//!
//! - the abort token,
//! - the command channel (posted messages, disconnect requests),
//! - transport readiness (queued writes and inbound messages).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};

use futures::{Sink, SinkExt, Stream, StreamExt, future::poll_fn};
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc, watch};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::capabilities::Capabilities;
use crate::codec::WireCodec;
use crate::dispatch::{ChannelContext, ChannelHandler, HandlerTable, Route};
use crate::error::SpiceError;
use crate::events::ClientEvent;
use crate::message::{
    ChannelIdentity, ClientControl, CompoundMessage, ControlMessage, InMessage, OutFrame,
    OutMessage,
};
use crate::protocol::control::{
    AckSync, Disconnecting, Migrate, MigrateFlags, Notify, NotifySeverity, Ping, SetAck,
    decode_wait_for_channels,
};
use crate::transport::{Peer, io_error};

use super::Command;
use super::ack::{AckWindow, ReceiveAck};
use super::connect::establish;
use super::env::ChannelEnv;
use super::queue::OutgoingQueue;
use super::state::{ChannelShared, ChannelState};

type Transport = Framed<Peer, WireCodec>;

/// Everything one worker run needs from its channel handle.
pub(crate) struct RunArgs {
    pub identity: ChannelIdentity,
    pub generation: u64,
    pub env: Arc<ChannelEnv>,
    pub shared: Arc<ChannelShared>,
    pub caps: Arc<Capabilities>,
    pub commands: Arc<Mutex<mpsc::UnboundedReceiver<Command>>>,
    pub cancel: CancellationToken,
    pub exited: watch::Sender<bool>,
}

/// Run one connection of a channel from connect to exit.
pub(crate) async fn run<H: ChannelHandler>(
    handler: Arc<Mutex<H>>,
    table: Arc<HandlerTable<H>>,
    args: RunArgs,
) {
    let RunArgs {
        identity,
        generation,
        env,
        shared,
        caps,
        commands,
        cancel,
        exited,
    } = args;

    {
        let mut handler: OwnedMutexGuard<H> = handler.lock_owned().await;
        let mut commands = commands.lock_owned().await;

        let mut worker = Worker {
            identity,
            generation,
            env: &env,
            shared: &shared,
            caps: &caps,
            remote: Capabilities::default(),
            handler: &mut *handler,
            table: &table,
            commands: &mut commands,
            cancel: &cancel,
            queue: OutgoingQueue::new(),
            ack: AckWindow::new(env.config.ack_window),
            recv_ack: ReceiveAck::default(),
            serial: 0,
        };
        let result = worker.run().await;
        worker.finish(result);
    }

    // Handler and command locks are released before anyone may start
    // the next run.
    let _ = exited.send(true);
}

/// Resolve `fut` unless the worker is aborted first.
async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T, SpiceError>>,
) -> Result<T, SpiceError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SpiceError::Aborted),
        r = fut => r,
    }
}

/// I/O errors on an established connection that mean "peer went away"
/// are reported as a disconnect.
fn normalize(err: SpiceError) -> SpiceError {
    match err {
        SpiceError::Connection(e) => io_error(e),
        other => other,
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

enum Event {
    Abort,
    Command(Option<Command>),
    Io(Result<Option<CompoundMessage>, SpiceError>),
}

struct Worker<'a, H> {
    identity: ChannelIdentity,
    generation: u64,
    env: &'a ChannelEnv,
    shared: &'a ChannelShared,
    caps: &'a Capabilities,
    remote: Capabilities,
    handler: &'a mut H,
    table: &'a HandlerTable<H>,
    commands: &'a mut mpsc::UnboundedReceiver<Command>,
    cancel: &'a CancellationToken,
    queue: OutgoingQueue,
    ack: AckWindow,
    recv_ack: ReceiveAck,
    /// Serial of the last message written on this connection.
    serial: u64,
}

impl<H: ChannelHandler> Worker<'_, H> {
    async fn run(&mut self) -> Result<(), SpiceError> {
        let target = self.env.target();
        let connection_id = if self.identity.is_main() {
            0
        } else {
            self.env.connection_id()
        };
        let (peer, remote) = cancellable(
            self.cancel,
            establish(
                self.env,
                &target,
                self.identity,
                self.caps,
                connection_id,
                self.env.config.connect_timeout,
            ),
        )
        .await?;
        self.remote = remote;
        self.env.register_transport(self.identity, peer.shutdown_handle());

        let mut framed = Framed::new(peer, WireCodec::new(self.env.config.max_message_size));
        self.shared.set_state(ChannelState::Connected);
        info!(channel = %self.identity, host = %target.host, secure = framed.get_ref().is_secure(), "channel connected");
        if self.identity.is_main() {
            self.env.events.emit(ClientEvent::Connected);
        }

        let mut ctx = ChannelContext::new(self.identity, self.caps, &self.remote);
        self.handler.on_connect(&mut ctx)?;
        self.queue.extend(ctx.take_outgoing());

        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Event::Abort,
                cmd = self.commands.recv() => Event::Command(cmd),
                io = poll_fn(|cx| {
                    poll_io(&mut framed, &mut self.queue, &mut self.ack, &mut self.serial, self.shared, cx)
                }) => Event::Io(io),
            };

            match event {
                Event::Abort => return Err(SpiceError::Aborted),
                Event::Command(None) => return Err(SpiceError::Aborted),
                Event::Command(Some(Command::Post(msg))) => {
                    trace!(channel = %self.identity, msg_type = msg.msg_type(), "message queued");
                    self.queue.push(msg);
                }
                Event::Command(Some(Command::Reply(msg))) => {
                    trace!(channel = %self.identity, msg_type = msg.msg_type(), "engine reply queued");
                    self.queue.push_control(msg);
                }
                Event::Command(Some(Command::Disconnect(generation))) => {
                    if generation == self.generation {
                        return self.close_gracefully(&mut framed).await;
                    }
                    debug!(channel = %self.identity, generation, "stale disconnect request ignored");
                }
                Event::Io(Ok(Some(msg))) => self.handle_message(&mut framed, msg).await?,
                Event::Io(Ok(None)) => return Err(SpiceError::Disconnected),
                Event::Io(Err(e)) => return Err(normalize(e)),
            }
        }
    }

    /// Tear down after the loop ends and publish the outcome.
    fn finish(&mut self, result: Result<(), SpiceError>) {
        self.env.unregister_transport(self.identity);
        if !self.queue.is_empty() {
            debug!(channel = %self.identity, dropped = self.queue.len(), "discarding unsent messages");
            self.queue.clear();
        }
        self.handler.on_disconnect(self.identity);

        match result {
            Ok(()) => {
                info!(channel = %self.identity, "channel disconnected");
                self.shared.set_state(ChannelState::Disconnected);
            }
            Err(SpiceError::Aborted) => {
                debug!(channel = %self.identity, "channel aborted");
                self.shared.set_state(ChannelState::Terminated);
            }
            Err(SpiceError::Disconnected) => {
                info!(channel = %self.identity, "peer closed the channel");
                self.shared.set_state(ChannelState::Disconnected);
                self.env.channel_down(self.identity, None);
            }
            Err(e) => {
                error!(channel = %self.identity, error = %e, "channel failed");
                self.shared.set_state(ChannelState::Disconnected);
                self.env.channel_down(self.identity, e.code());
            }
        }
    }

    async fn close_gracefully(&mut self, framed: &mut Transport) -> Result<(), SpiceError> {
        let body = Disconnecting {
            time_stamp: now_millis(),
            reason: 0,
        }
        .encode()?;
        self.queue.push(OutMessage::control(ClientControl::Disconnecting, body));
        let deadline = self.env.config.connect_timeout;
        let flush = async {
            self.write_all_pending(framed).await?;
            <Transport as SinkExt<OutFrame>>::close(framed)
                .await
                .map_err(normalize)
        };
        let outcome = tokio::time::timeout(deadline, flush).await;
        match outcome {
            Ok(Ok(())) | Ok(Err(SpiceError::Disconnected)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(channel = %self.identity, "timed out flushing before disconnect");
                Ok(())
            }
        }
    }

    /// Write every queued message regardless of the ack window.
    async fn write_all_pending(&mut self, framed: &mut Transport) -> Result<(), SpiceError> {
        let messages = self.queue.drain_all();
        self.write_now(framed, messages).await
    }

    /// Write `messages` in order, bypassing the queue, and flush.
    async fn write_now(
        &mut self,
        framed: &mut Transport,
        messages: Vec<OutMessage>,
    ) -> Result<(), SpiceError> {
        for message in messages {
            self.serial += 1;
            let serial = self.serial;
            cancellable(self.cancel, async {
                framed.feed(OutFrame { serial, message }).await.map_err(normalize)
            })
            .await?;
            self.shared.record_sent(serial);
        }
        cancellable(self.cancel, async {
            <Transport as SinkExt<OutFrame>>::flush(framed)
                .await
                .map_err(normalize)
        })
        .await
    }

    // ── Inbound ──────────────────────────────────────────────────

    async fn handle_message(
        &mut self,
        framed: &mut Transport,
        compound: CompoundMessage,
    ) -> Result<(), SpiceError> {
        self.shared.record_received();
        let serial = compound.serial();
        let msg_type = compound.msg_type();
        trace!(channel = %self.identity, serial, msg_type, "message received");

        for msg in compound.dispatch_order()? {
            match self.table.lookup(&msg)? {
                Route::Control(control) => self.handle_control(framed, control, &msg).await?,
                Route::Handler(handler) => {
                    let mut ctx = ChannelContext::new(self.identity, self.caps, &self.remote);
                    handler(self.handler, &mut ctx, &msg)?;
                    self.queue.extend(ctx.take_outgoing());
                }
            }
        }

        self.env.sync.update(self.identity, serial);
        // The window counts messages after the SET_ACK that armed it.
        if msg_type != ControlMessage::SetAck as u16 && self.recv_ack.on_message() {
            self.queue.push(OutMessage::control(ClientControl::Ack, Vec::new()));
        }
        Ok(())
    }

    async fn handle_control(
        &mut self,
        framed: &mut Transport,
        control: ControlMessage,
        msg: &InMessage,
    ) -> Result<(), SpiceError> {
        match control {
            ControlMessage::SetAck => {
                let set = SetAck::decode(msg.data())?;
                debug!(channel = %self.identity, generation = set.generation, window = set.window, "set ack");
                let reply = AckSync {
                    generation: set.generation,
                }
                .encode()?;
                self.queue.push(OutMessage::control(ClientControl::AckSync, reply));
                self.ack.set_window(set.window);
                self.recv_ack.arm(set.window);
                self.shared.record_window(self.ack.window(), self.ack.unacked());
            }
            ControlMessage::Ack => {
                self.ack.on_ack();
                self.shared.record_window(self.ack.window(), self.ack.unacked());
            }
            ControlMessage::Ping => {
                let ping = Ping::decode(msg.data())?;
                trace!(channel = %self.identity, id = ping.id, "ping");
                self.queue.push(OutMessage::control(ClientControl::Pong, msg.data().to_vec()));
            }
            ControlMessage::WaitForChannels => {
                let entries = decode_wait_for_channels(msg.data())?;
                debug!(channel = %self.identity, count = entries.len(), "waiting for channels");
                cancellable(self.cancel, self.env.sync.wait(&entries)).await?;
            }
            ControlMessage::Disconnecting => {
                let d = Disconnecting::decode(msg.data())?;
                info!(channel = %self.identity, reason = d.reason, time_stamp = d.time_stamp, "server is disconnecting");
            }
            ControlMessage::Notify => {
                let n = Notify::decode(msg.data())?;
                match n.severity {
                    NotifySeverity::Info => info!(channel = %self.identity, what = n.what, "server notify: {}", n.message),
                    NotifySeverity::Warn => warn!(channel = %self.identity, what = n.what, "server notify: {}", n.message),
                    NotifySeverity::Error => error!(channel = %self.identity, what = n.what, "server notify: {}", n.message),
                }
            }
            ControlMessage::MigrateData => {
                warn!(channel = %self.identity, "migrate data outside a migration; ignored");
            }
            ControlMessage::Migrate => self.handle_migrate(framed, msg).await?,
        }
        Ok(())
    }

    /// Move this channel onto its migration shadow without a gap.
    async fn handle_migrate(&mut self, framed: &mut Transport, msg: &InMessage) -> Result<(), SpiceError> {
        let flags = Migrate::decode(msg.data())?.flags();
        info!(channel = %self.identity, ?flags, "migrating channel");

        if flags.contains(MigrateFlags::NEED_FLUSH) {
            // The mark follows everything the source was owed.
            self.write_all_pending(framed).await?;
            let mark = OutMessage::control(ClientControl::MigrateFlushMark, Vec::new());
            self.write_now(framed, vec![mark]).await?;
        } else {
            // Replies belong to the source; held messages wait for the
            // destination and its window.
            let replies = self.queue.drain_control();
            self.write_now(framed, replies).await?;
        }

        let data = if flags.contains(MigrateFlags::NEED_DATA_TRANSFER) {
            let next = cancellable(self.cancel, async {
                match framed.next().await {
                    Some(Ok(m)) => Ok(m),
                    Some(Err(e)) => Err(normalize(e)),
                    None => Err(SpiceError::Disconnected),
                }
            })
            .await?;
            if next.msg_type() != ControlMessage::MigrateData as u16 {
                return Err(SpiceError::protocol(format!(
                    "expected migrate data, got message type {}",
                    next.msg_type()
                )));
            }
            self.shared.record_received();
            Some(next.outer().into_data())
        } else {
            None
        };

        if let Some(target) = self.env.migration.swap_peer(self.identity, framed.get_mut())? {
            self.env.set_target(target);
        }
        framed.read_buffer_mut().clear();

        if let Some(data) = data {
            self.queue
                .push(OutMessage::control(ClientControl::MigrateData, data.to_vec()));
        }
        let mut ctx = ChannelContext::new(self.identity, self.caps, &self.remote);
        self.handler.on_migrate(&mut ctx)?;
        self.queue.extend(ctx.take_outgoing());
        info!(channel = %self.identity, "channel migrated");
        Ok(())
    }
}

/// Drive queued writes as far as the window and socket allow, then
/// poll for the next inbound message.
///
/// A message is taken off the queue only after the sink reported it
/// can accept it, so dropping this poll between wakeups loses nothing.
fn poll_io(
    framed: &mut Transport,
    queue: &mut OutgoingQueue,
    ack: &mut AckWindow,
    serial: &mut u64,
    shared: &ChannelShared,
    cx: &mut Context<'_>,
) -> Poll<Result<Option<CompoundMessage>, SpiceError>> {
    while queue.has_sendable(ack) {
        match <Transport as Sink<OutFrame>>::poll_ready(Pin::new(&mut *framed), cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => break,
        }
        let Some(message) = queue.pop_sendable(ack) else {
            break;
        };
        *serial += 1;
        let frame = OutFrame {
            serial: *serial,
            message,
        };
        if let Err(e) = <Transport as Sink<OutFrame>>::start_send(Pin::new(&mut *framed), frame) {
            return Poll::Ready(Err(e));
        }
        shared.record_sent(*serial);
    }
    shared.record_window(ack.window(), ack.unacked());

    if let Poll::Ready(Err(e)) = <Transport as Sink<OutFrame>>::poll_flush(Pin::new(&mut *framed), cx) {
        return Poll::Ready(Err(e));
    }

    match Pin::new(&mut *framed).poll_next(cx) {
        Poll::Ready(Some(Ok(msg))) => Poll::Ready(Ok(Some(msg))),
        Poll::Ready(Some(Err(e))) => Poll::Ready(Err(e)),
        Poll::Ready(None) => Poll::Ready(Ok(None)),
        Poll::Pending => Poll::Pending,
    }
}
