//! The main channel: session setup, channel discovery and migration.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::capabilities::Capabilities;
use crate::channel::ChannelEnv;
use crate::dispatch::{ChannelContext, ChannelHandler, HandlerFn, HandlerTable};
use crate::error::SpiceError;
use crate::message::{ChannelIdentity, ChannelType, InMessage, OutMessage};
use crate::protocol::main_channel::{
    AgentStart, Init, MainClientMessage, MainMessage, MigrationBegin, MouseMode, MouseModeRequest,
    MouseModes, decode_channels_list, decode_u32,
};

use super::SessionShared;

/// Requests the main channel hands to the session's migration driver.
#[derive(Debug)]
pub(crate) enum MigrationRequest {
    Begin(MigrationBegin),
    Cancel,
}

/// What the main channel learned about the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionInfo {
    pub session_id: u32,
    pub display_channels_hint: u32,
    pub supported_mouse_modes: MouseModes,
    pub mouse_mode: MouseModes,
    pub agent_connected: bool,
    pub agent_tokens: u32,
    /// Bytes of agent data received this connection.
    pub agent_data: u64,
    pub multi_media_time: u32,
    pub ram_hint: u32,
}

pub(crate) struct MainChannel {
    env: Arc<ChannelEnv>,
    shared: Arc<SessionShared>,
    migrate: mpsc::UnboundedSender<MigrationRequest>,
    caps: Arc<Capabilities>,
}

impl MainChannel {
    pub(crate) fn new(
        env: Arc<ChannelEnv>,
        shared: Arc<SessionShared>,
        migrate: mpsc::UnboundedSender<MigrationRequest>,
        caps: Capabilities,
    ) -> Self {
        Self {
            env,
            shared,
            migrate,
            caps: Arc::new(caps),
        }
    }

    fn set_mouse_mode(&mut self, ctx: &mut ChannelContext<'_>, mode: MouseMode) -> Result<(), SpiceError> {
        let supported = MouseModes::from_bits_truncate(mode.supported_modes);
        let current = MouseModes::from_bits_truncate(mode.current_mode);
        self.shared.update_info(|info| {
            info.supported_mouse_modes = supported;
            info.mouse_mode = current;
        });
        if supported.contains(MouseModes::CLIENT) && current != MouseModes::CLIENT {
            debug!(?current, "requesting client mouse mode");
            ctx.post_encoded(
                MainClientMessage::MouseModeRequest as u16,
                &MouseModeRequest {
                    mode: MouseModes::CLIENT.bits(),
                },
            )?;
        }
        Ok(())
    }

    fn start_agent(ctx: &mut ChannelContext<'_>) -> Result<(), SpiceError> {
        ctx.post_encoded(
            MainClientMessage::AgentStart as u16,
            &AgentStart { num_tokens: u32::MAX },
        )
    }

    /// Create, or reconnect, the channel announced as `identity`.
    fn attach(&self, identity: ChannelIdentity) {
        let channel = match self.shared.channel(identity) {
            Some(existing) => existing,
            None => {
                let Some(channel) = self.shared.registry.create(identity, self.env.clone()) else {
                    warn!(channel = %identity, "no factory for channel type; skipped");
                    return;
                };
                let channel = Arc::new(channel);
                self.shared.add_channel(channel.clone());
                channel
            }
        };
        if let Err(e) = channel.connect() {
            warn!(channel = %identity, error = %e, "channel not started");
            return;
        }
        self.env
            .migration
            .add_channel(identity, Arc::new(channel.capabilities().clone()));
    }
}

fn handle_migrate_begin(s: &mut MainChannel, _ctx: &mut ChannelContext<'_>, msg: &InMessage) -> Result<(), SpiceError> {
    let begin = MigrationBegin::decode(msg.data())?;
    info!(host = %begin.host, port = begin.port, sport = begin.sport, "server requested migration");
    s.migrate.send(MigrationRequest::Begin(begin))?;
    Ok(())
}

fn handle_migrate_cancel(s: &mut MainChannel, _ctx: &mut ChannelContext<'_>, _msg: &InMessage) -> Result<(), SpiceError> {
    info!("server cancelled migration");
    s.migrate.send(MigrationRequest::Cancel)?;
    Ok(())
}

fn handle_init(s: &mut MainChannel, ctx: &mut ChannelContext<'_>, msg: &InMessage) -> Result<(), SpiceError> {
    let init = Init::decode(msg.data())?;
    info!(session_id = init.session_id, agent = init.agent_connected != 0, "session initialised");
    s.env.set_connection_id(init.session_id);
    s.shared.update_info(|info| {
        info.session_id = init.session_id;
        info.display_channels_hint = init.display_channels_hint;
        info.multi_media_time = init.multi_media_time;
        info.ram_hint = init.ram_hint;
        info.agent_tokens = init.agent_tokens;
        info.agent_connected = init.agent_connected != 0;
    });
    s.set_mouse_mode(
        ctx,
        MouseMode {
            supported_modes: init.supported_mouse_modes,
            current_mode: init.current_mouse_mode,
        },
    )?;
    if init.agent_connected != 0 {
        MainChannel::start_agent(ctx)?;
    }
    ctx.post(OutMessage::empty(MainClientMessage::AttachChannels as u16));
    Ok(())
}

fn handle_channels_list(s: &mut MainChannel, _ctx: &mut ChannelContext<'_>, msg: &InMessage) -> Result<(), SpiceError> {
    let entries = decode_channels_list(msg.data())?;
    debug!(count = entries.len(), "channels list");
    for entry in entries {
        match entry.channel_type() {
            Some(ChannelType::Main) => warn!("server listed a second main channel; skipped"),
            Some(ty) => s.attach(ChannelIdentity::new(ty, entry.channel_id)),
            None => warn!(channel_type = entry.channel_type, "unknown channel type; skipped"),
        }
    }
    Ok(())
}

fn handle_mouse_mode(s: &mut MainChannel, ctx: &mut ChannelContext<'_>, msg: &InMessage) -> Result<(), SpiceError> {
    let mode = MouseMode::decode(msg.data())?;
    s.set_mouse_mode(ctx, mode)
}

fn handle_multi_media_time(s: &mut MainChannel, _ctx: &mut ChannelContext<'_>, msg: &InMessage) -> Result<(), SpiceError> {
    let time = decode_u32(msg.data())?;
    s.shared.update_info(|info| info.multi_media_time = time);
    Ok(())
}

fn handle_agent_connected(s: &mut MainChannel, ctx: &mut ChannelContext<'_>, _msg: &InMessage) -> Result<(), SpiceError> {
    info!("agent connected");
    s.shared.update_info(|info| info.agent_connected = true);
    MainChannel::start_agent(ctx)
}

fn handle_agent_disconnected(s: &mut MainChannel, _ctx: &mut ChannelContext<'_>, msg: &InMessage) -> Result<(), SpiceError> {
    let error = decode_u32(msg.data())?;
    info!(error, "agent disconnected");
    s.shared.update_info(|info| info.agent_connected = false);
    Ok(())
}

fn handle_agent_data(s: &mut MainChannel, _ctx: &mut ChannelContext<'_>, msg: &InMessage) -> Result<(), SpiceError> {
    let size = msg.size() as u64;
    s.shared.update_info(|info| info.agent_data += size);
    Ok(())
}

fn handle_agent_token(s: &mut MainChannel, _ctx: &mut ChannelContext<'_>, msg: &InMessage) -> Result<(), SpiceError> {
    let tokens = decode_u32(msg.data())?;
    s.shared
        .update_info(|info| info.agent_tokens = info.agent_tokens.saturating_add(tokens));
    Ok(())
}

impl ChannelHandler for MainChannel {
    fn handler_table() -> HandlerTable<Self> {
        let routes: [(MainMessage, HandlerFn<Self>); 10] = [
            (MainMessage::MigrateBegin, handle_migrate_begin),
            (MainMessage::MigrateCancel, handle_migrate_cancel),
            (MainMessage::Init, handle_init),
            (MainMessage::ChannelsList, handle_channels_list),
            (MainMessage::MouseMode, handle_mouse_mode),
            (MainMessage::MultiMediaTime, handle_multi_media_time),
            (MainMessage::AgentConnected, handle_agent_connected),
            (MainMessage::AgentDisconnected, handle_agent_disconnected),
            (MainMessage::AgentData, handle_agent_data),
            (MainMessage::AgentToken, handle_agent_token),
        ];
        let mut table = HandlerTable::new();
        for (ty, f) in routes {
            table
                .register(ty as u16, ty.min_size(), f)
                .expect("main message types are above the control range");
        }
        table
    }

    fn capabilities(&self) -> Capabilities {
        (*self.caps).clone()
    }

    fn on_connect(&mut self, _ctx: &mut ChannelContext<'_>) -> Result<(), SpiceError> {
        self.env
            .migration
            .add_channel(ChannelIdentity::MAIN, self.caps.clone());
        Ok(())
    }

    fn on_disconnect(&mut self, _identity: ChannelIdentity) {
        if let Err(e) = self.migrate.send(MigrationRequest::Cancel) {
            debug!(error = %e, "migration driver gone; cancel not delivered");
        }
        self.env.set_connection_id(0);
        self.shared.update_info(|info| {
            info.session_id = 0;
            info.agent_connected = false;
            info.agent_tokens = 0;
            info.agent_data = 0;
        });
    }
}


// ── Tests ────────────────────────────────────────────────────────
