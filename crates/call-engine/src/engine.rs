//! # Call Engine Facade
//!
//! [`CallEngine`] wires the peer directory, discovery service, signaling
//! engine and media transport together and exposes the commands an
//! application needs: place a call, answer, decline, hang up and toggle
//! speaker routing, plus an observable `(state, status)` pair and the current
//! peer list.
//!
//! ## Lifecycle
//!
//! 1. [`CallEngineBuilder::build`] binds the signaling, media and discovery
//!    sockets. A failed bind is fatal: the event handler sees
//!    `"Initialization failed: <reason>"` and the error is returned.
//! 2. The signaling listener and the discovery loops start immediately.
//! 3. [`CallEngine::shutdown`] hangs up any call, stops every loop and
//!    releases all sockets. It is safe to call more than once.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use lancall_call_engine::{CallEngineBuilder, EngineConfig, StaticIdentity};
//!
//! # async fn example() -> lancall_call_engine::Result<()> {
//! let engine = CallEngineBuilder::new()
//!     .with_config(EngineConfig::default().with_signaling_port(5060))
//!     .with_identity(Arc::new(StaticIdentity::new("Alice", "Buyer")))
//!     .build()
//!     .await?;
//!
//! let mut status = engine.subscribe();
//! engine.place_call("192.168.1.30".parse().unwrap(), 5060)?;
//!
//! while status.changed().await.is_ok() {
//!     println!("{}", status.borrow().message);
//! }
//!
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audio::{AudioDevice, SilentAudioDevice};
use crate::config::EngineConfig;
use crate::directory::{PeerDirectory, PeerRecord};
use crate::discovery::{DiscoveryContext, DiscoveryService};
use crate::error::{EngineError, Result};
use crate::events::{CallEventHandler, EngineEvent, NoopEventHandler};
use crate::identity::{IdentityProvider, StaticIdentity};
use crate::media::{MediaStats, MediaTransport};
use crate::probe::{PingProbe, ReachabilityProbe};
use crate::signaling::{SignalingDeps, SignalingEngine};
use crate::state::{CallSession, CallState, CallStatus, SharedCallState};
use crate::tasks::TaskSet;

/// Builder for [`CallEngine`]
pub struct CallEngineBuilder {
    config: EngineConfig,
    identity: Arc<dyn IdentityProvider>,
    audio: Arc<dyn AudioDevice>,
    handler: Arc<dyn CallEventHandler>,
    probe: Arc<dyn ReachabilityProbe>,
}

impl CallEngineBuilder {
    /// Builder with default configuration and collaborators: an anonymous
    /// identity, a silent audio device, no event handler and a ping probe
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            identity: Arc::new(StaticIdentity::new("Anonymous", "")),
            audio: Arc::new(SilentAudioDevice::new()),
            handler: Arc::new(NoopEventHandler),
            probe: Arc::new(PingProbe),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the local signaling port
    pub fn with_signaling_port(mut self, port: u16) -> Self {
        self.config.signaling_port = port;
        self
    }

    pub fn with_identity(mut self, identity: Arc<dyn IdentityProvider>) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_audio_device(mut self, audio: Arc<dyn AudioDevice>) -> Self {
        self.audio = audio;
        self
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn CallEventHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn ReachabilityProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Bind all sockets and start the engine
    pub async fn build(self) -> Result<CallEngine> {
        let handler = self.handler.clone();
        match CallEngine::start(self).await {
            Ok(engine) => Ok(engine),
            Err(e) => {
                error!("Call engine failed to start: {}", e);
                handler
                    .on_state_changed(CallState::Idle, format!("Initialization failed: {}", e))
                    .await;
                Err(e)
            }
        }
    }
}

impl Default for CallEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A running call engine
pub struct CallEngine {
    config: EngineConfig,
    state: Arc<SharedCallState>,
    directory: Arc<PeerDirectory>,
    signaling: Arc<SignalingEngine>,
    media: Arc<MediaTransport>,
    discovery: DiscoveryService,
    audio: Arc<dyn AudioDevice>,
    tasks: Arc<TaskSet>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    dispatcher_cancel: CancellationToken,
    speaker: AtomicBool,
    shut_down: AtomicBool,
}

impl CallEngine {
    /// Start an engine on `signaling_port` with default collaborators
    pub async fn init(signaling_port: u16) -> Result<Self> {
        CallEngineBuilder::new().with_signaling_port(signaling_port).build().await
    }

    /// Shorthand for [`CallEngineBuilder::new`]
    pub fn builder() -> CallEngineBuilder {
        CallEngineBuilder::new()
    }

    async fn start(builder: CallEngineBuilder) -> Result<Self> {
        let CallEngineBuilder {
            config,
            identity,
            audio,
            handler,
            probe,
        } = builder;
        config.validate()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let state = Arc::new(SharedCallState::new(events_tx.clone()));
        let directory = Arc::new(PeerDirectory::new());
        let tasks = Arc::new(TaskSet::new("engine"));
        let local_identity = identity.local_identity();

        let media = Arc::new(MediaTransport::bind(&config, audio.clone(), tasks.token()).await?);
        let signaling = SignalingEngine::bind(
            &config,
            SignalingDeps {
                state: state.clone(),
                directory: directory.clone(),
                media: media.clone(),
                events: events_tx.clone(),
                identity: local_identity.clone(),
                tasks: tasks.clone(),
            },
        )
        .await?;
        let discovery = DiscoveryService::bind(&config)?;

        let dispatcher_cancel = CancellationToken::new();
        let dispatcher = tokio::spawn(dispatch_events(events_rx, handler, dispatcher_cancel.clone()));

        let mut local_ips = vec![signaling.advertised_ip()];
        local_ips.extend(config.local_ip);
        if !config.bind_ip.is_unspecified() {
            local_ips.push(config.bind_ip);
        }
        local_ips.dedup();

        let context = Arc::new(DiscoveryContext {
            directory: directory.clone(),
            probe,
            identity,
            local_identity: local_identity.clone(),
            local_ips,
            signaling_port: signaling.local_addr().port(),
            events: events_tx,
        });

        signaling.start()?;
        discovery.start(context, &config, &tasks)?;

        info!(
            "🚀 Call engine started for {} (signaling {}, media {}, discovery {})",
            local_identity.display_name,
            signaling.local_addr(),
            media.local_addr(),
            discovery.local_addr()
        );

        Ok(Self {
            config,
            state,
            directory,
            signaling,
            media,
            discovery,
            audio,
            tasks,
            dispatcher: Mutex::new(Some(dispatcher)),
            dispatcher_cancel,
            speaker: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        })
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            Err(EngineError::Shutdown)
        } else {
            Ok(())
        }
    }

    /// Call `address` on signaling port `port`
    pub fn place_call(&self, address: IpAddr, port: u16) -> Result<CallSession> {
        self.ensure_running()?;
        self.signaling.place_call(address, port)
    }

    /// Call a discovered peer on the port it announced
    pub fn call_peer(&self, address: IpAddr) -> Result<CallSession> {
        let peer = self.directory.lookup(&address).ok_or_else(|| EngineError::UnknownPeer {
            address: address.to_string(),
        })?;
        self.place_call(peer.address, peer.signaling_port)
    }

    /// Accept the ringing call
    pub async fn answer(&self) -> Result<()> {
        self.ensure_running()?;
        self.signaling.answer().await
    }

    /// Reject the ringing call
    pub async fn decline(&self) -> Result<()> {
        self.ensure_running()?;
        self.signaling.decline().await
    }

    /// End the current call, cancel a dial attempt, or decline a ringing call
    pub async fn hang_up(&self) -> Result<()> {
        self.ensure_running()?;
        self.signaling.hang_up().await
    }

    /// Flip playback between earpiece and loudspeaker; returns the new
    /// routing (`true` = speaker)
    pub fn toggle_speaker_routing(&self) -> bool {
        let speaker = !self.speaker.fetch_xor(true, Ordering::SeqCst);
        self.audio.set_speaker_routing(speaker);
        debug!("Speaker routing: {}", if speaker { "speaker" } else { "earpiece" });
        speaker
    }

    pub fn speaker_routing(&self) -> bool {
        self.speaker.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> CallState {
        self.state.state()
    }

    /// Latest `(state, status message)` pair
    pub fn status(&self) -> CallStatus {
        self.state.status()
    }

    /// Watch every status change
    pub fn subscribe(&self) -> watch::Receiver<CallStatus> {
        self.state.subscribe()
    }

    /// Known peers, ordered by display name
    pub fn peers(&self) -> Vec<PeerRecord> {
        self.directory.snapshot()
    }

    pub fn lookup_peer(&self, address: &IpAddr) -> Option<PeerRecord> {
        self.directory.lookup(address)
    }

    /// Active session, if any
    pub fn current_call(&self) -> Option<CallSession> {
        self.state.session()
    }

    /// Time since the current call connected
    pub fn call_duration(&self) -> Option<Duration> {
        let connected_at = self.state.session()?.connected_at?;
        (Utc::now() - connected_at).to_std().ok()
    }

    /// Packet counters of the current or most recent call
    pub fn media_stats(&self) -> Arc<MediaStats> {
        self.media.stats()
    }

    pub fn local_signaling_addr(&self) -> SocketAddr {
        self.signaling.local_addr()
    }

    pub fn media_addr(&self) -> SocketAddr {
        self.media.local_addr()
    }

    pub fn discovery_addr(&self) -> SocketAddr {
        self.discovery.local_addr()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Stop every loop and close every socket. Later calls are no-ops.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            debug!("Call engine already shut down");
            return;
        }
        info!("Shutting down call engine");

        if self.state.state() != CallState::Idle {
            if let Err(e) = self.signaling.hang_up().await {
                debug!("Hang up during shutdown: {}", e);
            }
        }

        let timeout = self.config.shutdown_timeout();
        self.media.close().await;
        self.tasks.shutdown(timeout).await;
        self.signaling.close();
        self.discovery.close();

        self.dispatcher_cancel.cancel();
        let dispatcher = self.dispatcher.lock().take();
        if let Some(dispatcher) = dispatcher {
            if tokio::time::timeout(timeout, dispatcher).await.is_err() {
                warn!("Event dispatcher did not finish within {:?}", timeout);
            }
        }
        info!("Call engine stopped");
    }
}

impl Drop for CallEngine {
    fn drop(&mut self) {
        self.tasks.token().cancel();
        self.dispatcher_cancel.cancel();
    }
}

/// Forward engine events to the application handler, in order.
///
/// Events queued before cancellation are still delivered.
async fn dispatch_events(
    mut events: mpsc::UnboundedReceiver<EngineEvent>,
    handler: Arc<dyn CallEventHandler>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Some(event) => deliver(handler.as_ref(), event).await,
                None => break,
            },
            _ = cancel.cancelled() => {
                while let Ok(event) = events.try_recv() {
                    deliver(handler.as_ref(), event).await;
                }
                break;
            }
        }
    }
    debug!("Event dispatcher stopped");
}

async fn deliver(handler: &dyn CallEventHandler, event: EngineEvent) {
    match event {
        EngineEvent::StateChanged { state, message } => handler.on_state_changed(state, message).await,
        EngineEvent::IncomingCall { name, address } => handler.on_incoming_call(name, address).await,
        EngineEvent::PeersChanged { peers } => handler.on_peers_changed(peers).await,
    }
}
