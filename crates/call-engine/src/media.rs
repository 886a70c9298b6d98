//! Per-call audio transport
//!
//! While a call is `Connected`, two loops run on the media socket:
//!
//! - **send**: capture chunk -> media packet -> remote `ip:media_port`
//! - **receive**: datagram -> media packet -> playback
//!
//! Sequence number and timestamp start at zero for every call. Packets are
//! played in arrival order; there is no jitter buffer and loss is not
//! concealed.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use lancall_wire_core::{decode_media, MediaPacket};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::audio::{AudioDevice, AudioFormat};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::net::{bind_udp, SocketSlot, MAX_DATAGRAM_SIZE};
use crate::state::{CallSession, CallState, CallStatus};
use crate::tasks::TaskSet;

/// Packet counters for the current call
#[derive(Debug, Default)]
pub struct MediaStats {
    pub packets_sent: AtomicU64,
    pub packets_received: AtomicU64,
    /// Datagrams dropped as malformed or from a stranger
    pub packets_dropped: AtomicU64,
}

impl MediaStats {
    /// `(sent, received, dropped)`
    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.packets_sent.load(Ordering::Relaxed),
            self.packets_received.load(Ordering::Relaxed),
            self.packets_dropped.load(Ordering::Relaxed),
        )
    }
}

struct ActiveMedia {
    call_id: String,
    tasks: TaskSet,
    stats: Arc<MediaStats>,
}

/// Media socket owner and per-call loop controller
pub struct MediaTransport {
    socket: SocketSlot,
    audio: Arc<dyn AudioDevice>,
    format: AudioFormat,
    shutdown_timeout: std::time::Duration,
    parent: CancellationToken,
    active: Mutex<Option<ActiveMedia>>,
    last_stats: parking_lot::Mutex<Arc<MediaStats>>,
}

impl MediaTransport {
    /// Bind the media socket
    pub async fn bind(config: &EngineConfig, audio: Arc<dyn AudioDevice>, parent: CancellationToken) -> Result<Self> {
        let socket = SocketSlot::new("media", bind_udp("media", config.media_addr()).await?);
        info!("Media socket bound to {}", socket.local_addr());

        Ok(Self {
            socket,
            audio,
            format: config.audio,
            shutdown_timeout: config.shutdown_timeout(),
            parent,
            active: Mutex::new(None),
            last_stats: parking_lot::Mutex::new(Arc::new(MediaStats::default())),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    /// Counters of the current (or most recent) call
    pub fn stats(&self) -> Arc<MediaStats> {
        self.last_stats.lock().clone()
    }

    /// Start streaming for `session`.
    ///
    /// `status` gates both loops: they exit as soon as the call leaves
    /// `Connected`. Any loops still running for a previous call are stopped
    /// first.
    pub async fn start(&self, session: &CallSession, status: watch::Receiver<CallStatus>) -> Result<()> {
        let socket = self.socket.get()?;
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            debug!("Stopping leftover media for call {}", previous.call_id);
            self.teardown(previous).await;
        }

        let capture = match self.audio.open_capture(&self.format).await {
            Ok(capture) => capture,
            Err(e) => {
                self.audio.close().await;
                return Err(e);
            }
        };
        let playback = match self.audio.open_playback(&self.format).await {
            Ok(playback) => playback,
            Err(e) => {
                self.audio.close().await;
                return Err(e);
            }
        };

        let stale = discard_pending(&socket);
        if stale > 0 {
            debug!("Discarded {} media datagram(s) received between calls", stale);
        }

        let ssrc: u32 = rand::random();
        let stats = Arc::new(MediaStats::default());
        *self.last_stats.lock() = stats.clone();
        let tasks = TaskSet::with_token("media", self.parent.child_token());
        let remote = session.remote_media_addr();

        tasks.spawn(
            format!("media-send-{}", session.call_id),
            send_loop(
                socket.clone(),
                capture,
                remote,
                ssrc,
                self.format,
                stats.clone(),
                status.clone(),
                tasks.token(),
            ),
        );
        tasks.spawn(
            format!("media-recv-{}", session.call_id),
            receive_loop(socket, playback, remote, stats.clone(), status, tasks.token()),
        );

        info!("🎙️ Media started for call {} -> {} (ssrc {:08x})", session.call_id, remote, ssrc);
        *active = Some(ActiveMedia {
            call_id: session.call_id.clone(),
            tasks,
            stats,
        });
        Ok(())
    }

    /// Stop the loops and release the audio device; no-op when idle
    pub async fn stop(&self) {
        let previous = self.active.lock().await.take();
        if let Some(previous) = previous {
            let call_id = previous.call_id.clone();
            self.teardown(previous).await;
            info!("Media stopped for call {}", call_id);
        }
    }

    /// Stop any call and release the media socket
    pub async fn close(&self) {
        self.stop().await;
        self.socket.close();
    }

    async fn teardown(&self, media: ActiveMedia) {
        media.tasks.shutdown(self.shutdown_timeout).await;
        self.audio.close().await;
        let (sent, received, dropped) = media.stats.snapshot();
        debug!(
            "Call {} media totals: sent={} received={} dropped={}",
            media.call_id, sent, received, dropped
        );
    }
}

/// Read and drop whatever is already queued on the socket
fn discard_pending(socket: &UdpSocket) -> usize {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut discarded = 0;
    while socket.try_recv_from(&mut buf).is_ok() {
        discarded += 1;
    }
    discarded
}

/// Resolves once the call is no longer `Connected`
async fn left_connected(mut status: watch::Receiver<CallStatus>) {
    loop {
        let state = status.borrow_and_update().state;
        if state != CallState::Connected {
            return;
        }
        if status.changed().await.is_err() {
            return;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn send_loop(
    socket: Arc<UdpSocket>,
    mut capture: mpsc::Receiver<Bytes>,
    remote: SocketAddr,
    ssrc: u32,
    format: AudioFormat,
    stats: Arc<MediaStats>,
    status: watch::Receiver<CallStatus>,
    cancel: CancellationToken,
) {
    let mut sequence_number: u16 = 0;
    let mut timestamp: u32 = 0;
    let ended = left_connected(status);
    tokio::pin!(ended);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = &mut ended => break,
            chunk = capture.recv() => {
                let Some(chunk) = chunk else {
                    debug!("Capture stream ended");
                    break;
                };

                let len = chunk.len();
                let packet = MediaPacket::new(chunk, sequence_number, timestamp, ssrc);
                match socket.send_to(&packet.encode(), remote).await {
                    Ok(_) => {
                        stats.packets_sent.fetch_add(1, Ordering::Relaxed);
                        trace!("Sent media seq={} ts={} ({} bytes)", sequence_number, timestamp, len);
                    }
                    Err(e) => warn!("Media send to {} failed: {}", remote, e),
                }

                sequence_number = sequence_number.wrapping_add(1);
                timestamp = timestamp.wrapping_add(format.timestamp_increment(len));
            }
        }
    }
    debug!("Media send loop stopped");
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    playback: mpsc::Sender<Bytes>,
    remote: SocketAddr,
    stats: Arc<MediaStats>,
    status: watch::Receiver<CallStatus>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let ended = left_connected(status);
    tokio::pin!(ended);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = &mut ended => break,
            result = socket.recv_from(&mut buf) => {
                let (len, src) = match result {
                    Ok(received) => received,
                    Err(e) => {
                        if cancel.is_cancelled() {
                            break;
                        }
                        warn!("Media receive error: {}", e);
                        continue;
                    }
                };

                if src.ip() != remote.ip() {
                    stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
                    trace!("Dropping media from unexpected source {}", src);
                    continue;
                }

                let packet = match decode_media(&buf[..len]) {
                    Ok(packet) => packet,
                    Err(e) => {
                        stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
                        trace!("Dropping media datagram from {}: {}", src, e);
                        continue;
                    }
                };

                stats.packets_received.fetch_add(1, Ordering::Relaxed);
                trace!("Received media seq={} ts={}", packet.sequence_number, packet.timestamp);
                if playback.send(packet.payload).await.is_err() {
                    debug!("Playback sink closed");
                    break;
                }
            }
        }
    }
    debug!("Media receive loop stopped");
}
