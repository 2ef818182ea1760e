//! SPICE client entry point.
//!
//! ```text
//! spice-client --host <h> --port <p>     Connect to a server
//! spice-client --config <path>           Use custom config TOML
//! spice-client --gen-config              Dump default config and exit
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use spice_core::{ChannelRegistry, ClientEvent, RsaTicketSealer, Session, SessionOptions};
use spice_client::config::ClientConfig;
use spice_client::inputs::{InputsFactory, InputsState};

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "spice-client", about = "SPICE remote display client")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "spice-client.toml")]
    config: PathBuf,

    /// Server host (overrides config).
    #[arg(long)]
    host: Option<String>,

    /// Plain port (overrides config).
    #[arg(short, long)]
    port: Option<u16>,

    /// TLS port (overrides config).
    #[arg(short, long)]
    secure_port: Option<u16>,

    /// Session password.
    #[arg(long, env = "SPICE_PASSWORD", default_value = "")]
    password: String,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&ClientConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let mut config = ClientConfig::load(&cli.config);
    if let Some(host) = cli.host {
        config.network.host = host;
    }
    if let Some(port) = cli.port {
        config.network.port = port;
    }
    if let Some(sport) = cli.secure_port {
        config.network.secure_port = sport;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("spice-client v{}", env!("CARGO_PKG_VERSION"));

    // ── 1. Session ──────────────────────────────────────────────

    let inputs = Arc::new(InputsState::default());
    let mut registry = ChannelRegistry::new();
    registry.register(InputsFactory::new(inputs.clone()));

    let options = SessionOptions {
        config: config.channel_config(),
        connection: config.connection_options()?,
        sealer: Arc::new(RsaTicketSealer),
        ..SessionOptions::default()
    };
    let target = config.target();
    info!(host = %target.host, port = ?target.port, sport = ?target.sport, "target");
    let (session, mut events) = Session::new(target, cli.password, registry, options);
    session.connect().await?;

    // ── 2. Event loop ───────────────────────────────────────────

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                session.disconnect().await;
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    ClientEvent::Connected => {
                        let info = session.info();
                        info!(session_id = info.session_id, "connected");
                    }
                    ClientEvent::MigrationConnected => info!("migration destination ready"),
                    ClientEvent::MigrationError => warn!("migration failed; staying on source"),
                    ClientEvent::Disconnected => {
                        info!("disconnected");
                        break;
                    }
                    ClientEvent::ConnectionError(code) => {
                        error!(%code, "connection error");
                        break;
                    }
                }
            }
        }
    }

    // ── 3. Shutdown ─────────────────────────────────────────────

    for (identity, state) in session.channel_states() {
        info!(channel = %identity, ?state, "final state");
    }
    info!(modifiers = inputs.modifiers(), "shutting down");
    session.abort().await;

    Ok(())
}
