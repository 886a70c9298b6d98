//! LAN peer discovery
//!
//! Three loops share one broadcast-enabled socket on the discovery port:
//!
//! - **listener**: parses `DISCOVER:` datagrams into the [`PeerDirectory`]
//!   and probes peers the first time they show up
//! - **broadcaster**: announces this engine every announce interval
//! - **reaper**: evicts peers silent for longer than the TTL
//!
//! All three stop when the engine's cancellation token fires.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lancall_wire_core::Announcement;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::EngineConfig;
use crate::directory::{PeerDirectory, UpsertOutcome};
use crate::error::Result;
use crate::events::EngineEvent;
use crate::identity::{effective_role, IdentityProvider, LocalIdentity};
use crate::net::{bind_broadcast, SocketSlot, MAX_DATAGRAM_SIZE};
use crate::probe::ReachabilityProbe;
use crate::tasks::TaskSet;

/// Everything the discovery loops need besides the socket
pub struct DiscoveryContext {
    pub directory: Arc<PeerDirectory>,
    pub probe: Arc<dyn ReachabilityProbe>,
    pub identity: Arc<dyn IdentityProvider>,
    pub local_identity: LocalIdentity,
    /// Addresses this host is known by (besides loopback)
    pub local_ips: Vec<IpAddr>,
    /// Our own bound signaling port, as announced
    pub signaling_port: u16,
    pub events: mpsc::UnboundedSender<EngineEvent>,
}

impl DiscoveryContext {
    /// Whether a datagram from `src` announcing `port` is our own broadcast
    /// coming back
    fn is_own(&self, src: IpAddr, port: u16) -> bool {
        port == self.signaling_port && (src.is_loopback() || self.local_ips.contains(&src))
    }

    /// Apply one received datagram to the directory.
    ///
    /// Returns `None` for our own or malformed datagrams.
    pub fn handle_datagram(&self, data: &[u8], src: SocketAddr, now: Instant) -> Option<UpsertOutcome> {
        let announcement = match Announcement::from_bytes(data) {
            Ok(announcement) => announcement,
            Err(e) => {
                trace!("Ignoring discovery datagram from {}: {}", src, e);
                return None;
            }
        };

        if self.is_own(src.ip(), announcement.signaling_port) {
            return None;
        }

        let outcome = self.directory.upsert(
            src.ip(),
            announcement.signaling_port,
            &announcement.display_name,
            &announcement.role,
            now,
        );

        if outcome == UpsertOutcome::Changed {
            info!(
                "👋 Discovered {} ({}) at {}:{}",
                announcement.display_name,
                announcement.role,
                src.ip(),
                announcement.signaling_port
            );
            self.probe.probe(src.ip());
            self.notify_peers_changed();
        }

        Some(outcome)
    }

    /// Announcement carrying the current effective role
    pub fn announcement(&self) -> Announcement {
        Announcement::new(
            self.signaling_port,
            self.local_identity.display_name.clone(),
            effective_role(&self.local_identity, self.identity.as_ref()),
        )
    }

    /// Evict stale peers; notifies observers if any were removed
    pub fn reap(&self, now: Instant, ttl: Duration) -> bool {
        let removed = self.directory.evict_stale(now, ttl);
        if removed {
            debug!("Evicted stale peers, {} remaining", self.directory.len());
            self.notify_peers_changed();
        }
        removed
    }

    fn notify_peers_changed(&self) {
        let _ = self.events.send(EngineEvent::PeersChanged {
            peers: self.directory.snapshot(),
        });
    }
}

/// Owner of the discovery socket
pub struct DiscoveryService {
    socket: SocketSlot,
}

impl DiscoveryService {
    /// Bind the discovery socket; failure is fatal to engine startup
    pub fn bind(config: &EngineConfig) -> Result<Self> {
        let socket = SocketSlot::new("discovery", bind_broadcast("discovery", config.discovery_addr())?);
        info!("Discovery listening on {}", socket.local_addr());
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    /// Spawn listener, broadcaster and reaper on `tasks`
    pub fn start(&self, ctx: Arc<DiscoveryContext>, config: &EngineConfig, tasks: &TaskSet) -> Result<()> {
        let socket = self.socket.get()?;
        let broadcast_addr = SocketAddr::new(config.broadcast_ip, self.local_addr().port());

        tasks.spawn(
            "discovery-listener",
            listen_loop(socket.clone(), ctx.clone(), tasks.token()),
        );
        tasks.spawn(
            "discovery-broadcaster",
            broadcast_loop(
                socket,
                ctx.clone(),
                broadcast_addr,
                config.announce_interval(),
                tasks.token(),
            ),
        );
        tasks.spawn(
            "discovery-reaper",
            reap_loop(ctx, config.reap_interval(), config.peer_ttl(), tasks.token()),
        );
        Ok(())
    }

    /// Release the discovery socket
    pub fn close(&self) {
        self.socket.close();
    }
}

async fn listen_loop(socket: Arc<UdpSocket>, ctx: Arc<DiscoveryContext>, cancel: CancellationToken) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok((len, src)) => {
                    ctx.handle_datagram(&buf[..len], src, Instant::now());
                }
                Err(e) => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    warn!("Discovery receive error: {}", e);
                }
            }
        }
    }
    debug!("Discovery listener stopped");
}

async fn broadcast_loop(
    socket: Arc<UdpSocket>,
    ctx: Arc<DiscoveryContext>,
    target: SocketAddr,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let text = ctx.announcement().encode();
                match socket.send_to(text.as_bytes(), target).await {
                    Ok(_) => trace!("Announced '{}' to {}", text, target),
                    Err(e) => warn!("Discovery broadcast to {} failed: {}", target, e),
                }
            }
        }
    }
    debug!("Discovery broadcaster stopped");
}

async fn reap_loop(ctx: Arc<DiscoveryContext>, interval: Duration, ttl: Duration, cancel: CancellationToken) {
    let start = tokio::time::Instant::now() + interval;
    let mut ticker = tokio::time::interval_at(start, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                ctx.reap(Instant::now(), ttl);
            }
        }
    }
    debug!("Discovery reaper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::StaticIdentity;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingProbe {
        probed: Mutex<Vec<IpAddr>>,
    }

    impl ReachabilityProbe for RecordingProbe {
        fn probe(&self, address: IpAddr) {
            self.probed.lock().push(address);
        }
    }

    fn context(
        probe: Arc<RecordingProbe>,
        identity: Arc<StaticIdentity>,
    ) -> (DiscoveryContext, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = DiscoveryContext {
            directory: Arc::new(PeerDirectory::new()),
            probe,
            local_identity: identity.local_identity(),
            identity,
            local_ips: vec!["192.168.1.20".parse().unwrap()],
            signaling_port: 5060,
            events: tx,
        };
        (ctx, rx)
    }

    fn src(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_announcement_populates_directory() {
        let probe = Arc::new(RecordingProbe::default());
        let (ctx, mut rx) = context(probe.clone(), Arc::new(StaticIdentity::new("Bob", "Seller")));

        let outcome = ctx.handle_datagram(b"DISCOVER:5060|Alice|Buyer", src("192.168.1.30:50000"), Instant::now());
        assert_eq!(outcome, Some(UpsertOutcome::Changed));

        let record = ctx.directory.lookup(&"192.168.1.30".parse().unwrap()).unwrap();
        assert_eq!(record.signaling_port, 5060);
        assert_eq!(record.display_name, "Alice");
        assert_eq!(record.role, "Buyer");

        assert_eq!(probe.probed.lock().len(), 1);
        assert!(matches!(rx.try_recv(), Ok(EngineEvent::PeersChanged { peers }) if peers.len() == 1));
    }

    #[test]
    fn test_repeat_announcement_does_not_probe_again() {
        let probe = Arc::new(RecordingProbe::default());
        let (ctx, mut rx) = context(probe.clone(), Arc::new(StaticIdentity::new("Bob", "Seller")));
        let now = Instant::now();

        ctx.handle_datagram(b"DISCOVER:5060|Alice|Buyer", src("192.168.1.30:50000"), now);
        let _ = rx.try_recv();
        let outcome = ctx.handle_datagram(b"DISCOVER:5060|Alice|Buyer", src("192.168.1.30:50000"), now);

        assert_eq!(outcome, Some(UpsertOutcome::Refreshed));
        assert_eq!(probe.probed.lock().len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_own_and_malformed_datagrams_ignored() {
        let probe = Arc::new(RecordingProbe::default());
        let (ctx, _rx) = context(probe.clone(), Arc::new(StaticIdentity::new("Bob", "Seller")));
        let now = Instant::now();

        assert_eq!(ctx.handle_datagram(b"DISCOVER:5060|Bob|Seller", src("192.168.1.20:50000"), now), None);
        assert_eq!(ctx.handle_datagram(b"DISCOVER:5060|Bob|Seller", src("127.0.0.1:50000"), now), None);
        assert_eq!(ctx.handle_datagram(b"garbage", src("192.168.1.31:50000"), now), None);
        assert_eq!(ctx.handle_datagram(b"DISCOVER:x|A|B", src("192.168.1.31:50000"), now), None);
        assert!(ctx.directory.is_empty());
        assert!(probe.probed.lock().is_empty());
    }

    #[test]
    fn test_announcement_uses_active_mode() {
        let identity = Arc::new(StaticIdentity::new("Bob", "Buyer"));
        let (ctx, _rx) = context(Arc::new(RecordingProbe::default()), identity.clone());
        assert_eq!(ctx.announcement().encode(), "DISCOVER:5060|Bob|Buyer");

        identity.set_active_mode(Some("Seller".to_string()));
        assert_eq!(ctx.announcement().encode(), "DISCOVER:5060|Bob|Seller");
    }

    #[test]
    fn test_reap_notifies_only_on_removal() {
        let (ctx, mut rx) = context(
            Arc::new(RecordingProbe::default()),
            Arc::new(StaticIdentity::new("Bob", "Seller")),
        );
        let t0 = Instant::now();
        let ttl = Duration::from_secs(12);

        ctx.handle_datagram(b"DISCOVER:5060|Alice|Buyer", src("192.168.1.30:50000"), t0);
        let _ = rx.try_recv();

        assert!(!ctx.reap(t0 + Duration::from_secs(5), ttl));
        assert!(rx.try_recv().is_err());

        assert!(ctx.reap(t0 + Duration::from_secs(13), ttl));
        assert!(matches!(rx.try_recv(), Ok(EngineEvent::PeersChanged { peers }) if peers.is_empty()));
    }
}
