//! lancall peer
//!
//! Runs one call engine with a silent audio device. Useful for checking
//! discovery and call setup against another peer on the same LAN:
//!
//! ```text
//! lancall --name Alice --role Buyer
//! lancall --name Bob --call 192.168.1.30 --call-port 5060
//! ```

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use lancall_call_engine::logging::parse_level;
use lancall_call_engine::{
    setup_logging, CallEngineBuilder, CallEventHandler, CallState, EngineConfig, LogFormat, LoggingConfig, PeerRecord,
    SilentAudioDevice, StaticIdentity,
};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Peer-to-peer LAN voice call peer", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "LANCALL_CONFIG")]
    config: Option<PathBuf>,

    /// Local signaling port (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Display name to announce
    #[arg(short, long, default_value = "lancall")]
    name: String,

    /// Role tag to announce
    #[arg(short, long, default_value = "Peer")]
    role: String,

    /// Call this address once started
    #[arg(long)]
    call: Option<IpAddr>,

    /// Signaling port of the peer to call; looked up in the peer list when omitted
    #[arg(long)]
    call_port: Option<u16>,

    /// Answer incoming calls automatically
    #[arg(long)]
    auto_answer: bool,

    /// Hang up connected calls after this many seconds (0 keeps them open)
    #[arg(long, default_value = "0")]
    call_duration: u64,

    /// Log level for lancall itself (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log level for tokio and other dependencies
    #[arg(long, default_value = "warn")]
    dependency_log_level: String,

    /// Emit JSON logs
    #[arg(long)]
    json: bool,
}

enum Prompt {
    Incoming { name: String, address: IpAddr },
    State(CallState),
}

/// Prints what the engine reports and forwards what needs a reaction
struct ConsoleHandler {
    prompts: mpsc::UnboundedSender<Prompt>,
}

#[async_trait]
impl CallEventHandler for ConsoleHandler {
    async fn on_state_changed(&self, state: CallState, message: String) {
        info!("📞 [{}] {}", state, message);
        let _ = self.prompts.send(Prompt::State(state));
    }

    async fn on_incoming_call(&self, name: String, address: IpAddr) {
        info!("🔔 Incoming call from {} ({})", name, address);
        let _ = self.prompts.send(Prompt::Incoming { name, address });
    }

    async fn on_peers_changed(&self, peers: Vec<PeerRecord>) {
        info!("👥 {} peer(s) on the LAN", peers.len());
        for peer in peers {
            info!("   {} ({}) at {}", peer.display_name, peer.role, peer.signaling_addr());
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let format = if args.json { LogFormat::Json } else { LogFormat::Pretty };
    let logging = LoggingConfig::new(parse_level(&args.log_level)?)
        .with_dependency_level(parse_level(&args.dependency_log_level)?)
        .with_format(format);
    setup_logging(&logging)?;
    info!("Starting lancall v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(port) = args.port {
        config.signaling_port = port;
    }

    let (prompts_tx, mut prompts) = mpsc::unbounded_channel();
    let engine = CallEngineBuilder::new()
        .with_config(config)
        .with_identity(Arc::new(StaticIdentity::new(args.name.clone(), args.role.clone())))
        .with_audio_device(Arc::new(SilentAudioDevice::new()))
        .with_event_handler(Arc::new(ConsoleHandler { prompts: prompts_tx }))
        .build()
        .await
        .context("starting call engine")?;

    info!(
        "{} listening for calls on {} (discovery {})",
        args.name,
        engine.local_signaling_addr(),
        engine.discovery_addr()
    );

    if let Some(address) = args.call {
        let placed = match args.call_port {
            Some(port) => engine.place_call(address, port),
            None => engine.call_peer(address),
        };
        if let Err(e) = placed {
            warn!("Could not call {}: {}", address, e);
        }
    }

    let duration = Duration::from_secs(args.call_duration);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            prompt = prompts.recv() => match prompt {
                Some(Prompt::Incoming { name, address }) if args.auto_answer => {
                    info!("Auto-answering {} ({})", name, address);
                    if let Err(e) = engine.answer().await {
                        warn!("Answer failed: {}", e);
                    }
                }
                Some(Prompt::State(CallState::Connected)) if !duration.is_zero() => {
                    tokio::time::sleep(duration).await;
                    if engine.state() == CallState::Connected {
                        if let Err(e) = engine.hang_up().await {
                            warn!("Hang up failed: {}", e);
                        }
                    }
                }
                Some(_) => {}
                None => break,
            }
        }
    }

    engine.shutdown().await;
    Ok(())
}
