//! Shared helpers for the call engine integration tests

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use lancall_call_engine::{
    AudioDevice, AudioFormat, CallEngine, CallEngineBuilder, CallEventHandler, CallState, CallStatus,
    EngineConfig, EngineError, NoopProbe, PeerRecord, Result, StaticIdentity,
};
use lancall_wire_core::{SignalingHeaders, SignalingMessage};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};

pub const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
pub const WAIT: Duration = Duration::from_secs(3);

/// A port that was free a moment ago
pub fn free_udp_port() -> u16 {
    std::net::UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Loopback-only config with ephemeral sockets and quick timers
pub fn test_config() -> EngineConfig {
    EngineConfig::default()
        .with_bind_ip(LOCALHOST)
        .with_local_ip(LOCALHOST)
        .with_broadcast_ip(LOCALHOST)
        .with_signaling_port(0)
        .with_media_port(free_udp_port())
        .with_discovery_port(0)
        .with_announce_interval(Duration::from_millis(100))
        .with_reap_interval(Duration::from_millis(100))
        .with_peer_ttl(Duration::from_millis(500))
        .with_invite_retries(5, Duration::from_millis(200))
}

/// Configs for two engines whose media ports point at each other
pub fn paired_configs() -> (EngineConfig, EngineConfig) {
    let a = free_udp_port();
    let b = free_udp_port();
    (
        test_config().with_media_port(a).with_peer_media_port(b),
        test_config().with_media_port(b).with_peer_media_port(a),
    )
}

pub async fn start_engine(
    name: &str,
    config: EngineConfig,
    audio: Arc<dyn AudioDevice>,
    handler: Arc<dyn CallEventHandler>,
) -> CallEngine {
    CallEngineBuilder::new()
        .with_config(config)
        .with_identity(Arc::new(StaticIdentity::new(name, "Tester")))
        .with_audio_device(audio)
        .with_event_handler(handler)
        .with_probe(Arc::new(NoopProbe))
        .build()
        .await
        .unwrap()
}

/// Wait until the published status reaches `state`
pub async fn wait_for_state(status: &mut watch::Receiver<CallStatus>, state: CallState) -> CallStatus {
    tokio::time::timeout(WAIT, status.wait_for(|s| s.state == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", state))
        .unwrap()
        .clone()
}

/// Poll `condition` until it holds
pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Something the event handler saw
#[derive(Debug, Clone, PartialEq)]
pub enum Seen {
    State(CallState, String),
    Incoming(String, IpAddr),
    Peers(Vec<PeerRecord>),
}

/// Handler that forwards every callback to a channel
pub struct RecordingHandler {
    tx: mpsc::UnboundedSender<Seen>,
}

impl RecordingHandler {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Seen>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl CallEventHandler for RecordingHandler {
    async fn on_state_changed(&self, state: CallState, message: String) {
        let _ = self.tx.send(Seen::State(state, message));
    }

    async fn on_incoming_call(&self, name: String, address: IpAddr) {
        let _ = self.tx.send(Seen::Incoming(name, address));
    }

    async fn on_peers_changed(&self, peers: Vec<PeerRecord>) {
        let _ = self.tx.send(Seen::Peers(peers));
    }
}

pub async fn next_seen(rx: &mut mpsc::UnboundedReceiver<Seen>) -> Seen {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("no event in time")
        .expect("handler channel closed")
}

/// Audio device whose capture and playback ends are driven by the test
#[derive(Debug, Default)]
pub struct ChannelAudioDevice {
    capture_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    playback_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    fail_open: AtomicBool,
    closes: AtomicUsize,
    speaker: AtomicBool,
}

impl ChannelAudioDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let device = Self::default();
        device.fail_open.store(true, Ordering::SeqCst);
        Arc::new(device)
    }

    /// Sender feeding the engine's capture stream, once a call is up
    pub fn capture(&self) -> Option<mpsc::Sender<Bytes>> {
        self.capture_tx.lock().clone()
    }

    /// Receiver of what the engine plays back
    pub fn take_playback(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.playback_rx.lock().take()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn speaker(&self) -> bool {
        self.speaker.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioDevice for ChannelAudioDevice {
    async fn open_capture(&self, _format: &AudioFormat) -> Result<mpsc::Receiver<Bytes>> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(EngineError::audio("microphone unavailable"));
        }
        let (tx, rx) = mpsc::channel(16);
        *self.capture_tx.lock() = Some(tx);
        Ok(rx)
    }

    async fn open_playback(&self, _format: &AudioFormat) -> Result<mpsc::Sender<Bytes>> {
        let (tx, rx) = mpsc::channel(16);
        *self.playback_rx.lock() = Some(rx);
        Ok(tx)
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.capture_tx.lock().take();
    }

    fn set_speaker_routing(&self, speaker: bool) {
        self.speaker.store(speaker, Ordering::SeqCst);
    }
}

/// A hand-driven signaling peer on a raw loopback socket
pub struct RawPeer {
    pub socket: UdpSocket,
}

impl RawPeer {
    pub async fn bind() -> Self {
        Self {
            socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    pub fn headers(&self, call_id: &str, cseq: &str) -> SignalingHeaders {
        SignalingHeaders {
            via: format!("SIP/2.0/UDP {}", self.addr()),
            from: "\"Raw\" <sip:127.0.0.1>".to_string(),
            to: "<sip:127.0.0.1>".to_string(),
            call_id: call_id.to_string(),
            cseq: cseq.to_string(),
        }
    }

    pub async fn send(&self, message: &SignalingMessage, to: SocketAddr) {
        self.socket.send_to(message.encode().as_bytes(), to).await.unwrap();
    }

    pub async fn invite(&self, call_id: &str, to: SocketAddr) {
        let invite = SignalingMessage::invite("127.0.0.1", self.headers(call_id, "1 INVITE"));
        self.send(&invite, to).await;
    }

    pub async fn bye(&self, call_id: &str, to: SocketAddr) {
        let bye = SignalingMessage::bye("127.0.0.1", self.headers(call_id, "2 BYE"));
        self.send(&bye, to).await;
    }

    /// Next signaling message, or `None` if nothing arrives within `within`
    pub async fn recv_within(&self, within: Duration) -> Option<SignalingMessage> {
        let mut buf = vec![0u8; 4096];
        let (len, _) = tokio::time::timeout(within, self.socket.recv_from(&mut buf)).await.ok()?.ok()?;
        Some(SignalingMessage::from_bytes(&buf[..len]).unwrap())
    }

    pub async fn recv(&self) -> SignalingMessage {
        self.recv_within(WAIT).await.expect("no signaling message in time")
    }
}
