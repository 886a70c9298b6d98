//! Engine configuration
//!
//! All fields have defaults matching the LAN protocol constants, so an empty
//! TOML document is a valid configuration.
//!
//! ```rust
//! use lancall_call_engine::config::EngineConfig;
//!
//! let config = EngineConfig::from_toml_str(r#"
//!     signaling_port = 6060
//!     invite_attempts = 3
//! "#).unwrap();
//!
//! assert_eq!(config.signaling_port, 6060);
//! assert_eq!(config.invite_attempts, 3);
//! assert_eq!(config.media_port, 5004);
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::audio::AudioFormat;
use crate::error::{EngineError, Result};

pub const DEFAULT_SIGNALING_PORT: u16 = 5060;
pub const DEFAULT_MEDIA_PORT: u16 = 5004;
pub const DEFAULT_DISCOVERY_PORT: u16 = 50000;

/// Call engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Interface address every socket binds to
    pub bind_ip: IpAddr,
    /// Local signaling port (0 picks an ephemeral port)
    pub signaling_port: u16,
    /// Local media port
    pub media_port: u16,
    /// Media port on the remote peer; defaults to `media_port`
    pub peer_media_port: Option<u16>,
    /// Discovery port shared by every peer on the LAN
    pub discovery_port: u16,
    /// Destination of discovery announcements
    pub broadcast_ip: IpAddr,
    /// Announce period
    pub announce_interval_ms: u64,
    /// Stale-peer sweep period
    pub reap_interval_ms: u64,
    /// Inactivity threshold after which a peer is evicted
    pub peer_ttl_ms: u64,
    /// Number of INVITE transmissions before giving up
    pub invite_attempts: u32,
    /// Spacing between INVITE transmissions
    pub invite_interval_ms: u64,
    /// Address advertised in signaling headers; detected when unset
    pub local_ip: Option<IpAddr>,
    /// PCM format exchanged with the audio device
    pub audio: AudioFormat,
    /// Upper bound on waiting for loops to finish during shutdown
    pub shutdown_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            signaling_port: DEFAULT_SIGNALING_PORT,
            media_port: DEFAULT_MEDIA_PORT,
            peer_media_port: None,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            broadcast_ip: IpAddr::V4(Ipv4Addr::BROADCAST),
            announce_interval_ms: 3_000,
            reap_interval_ms: 5_000,
            peer_ttl_ms: 12_000,
            invite_attempts: 5,
            invite_interval_ms: 1_000,
            local_ip: None,
            audio: AudioFormat::default(),
            shutdown_timeout_ms: 2_000,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML document; missing fields take their defaults
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| EngineError::config(format!("invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| EngineError::config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.invite_attempts == 0 {
            return Err(EngineError::config("invite_attempts must be at least 1"));
        }
        if self.invite_interval_ms == 0 || self.announce_interval_ms == 0 || self.reap_interval_ms == 0 {
            return Err(EngineError::config("intervals must be non-zero"));
        }
        if self.peer_ttl_ms <= self.announce_interval_ms {
            return Err(EngineError::config(
                "peer_ttl_ms must exceed announce_interval_ms or live peers get evicted",
            ));
        }
        if self.audio.bytes_per_frame() == 0 {
            return Err(EngineError::config("audio frame size must be non-zero"));
        }
        Ok(())
    }

    pub fn with_bind_ip(mut self, ip: IpAddr) -> Self {
        self.bind_ip = ip;
        self
    }

    pub fn with_signaling_port(mut self, port: u16) -> Self {
        self.signaling_port = port;
        self
    }

    pub fn with_media_port(mut self, port: u16) -> Self {
        self.media_port = port;
        self
    }

    pub fn with_peer_media_port(mut self, port: u16) -> Self {
        self.peer_media_port = Some(port);
        self
    }

    pub fn with_discovery_port(mut self, port: u16) -> Self {
        self.discovery_port = port;
        self
    }

    pub fn with_broadcast_ip(mut self, ip: IpAddr) -> Self {
        self.broadcast_ip = ip;
        self
    }

    pub fn with_local_ip(mut self, ip: IpAddr) -> Self {
        self.local_ip = Some(ip);
        self
    }

    pub fn with_announce_interval(mut self, interval: Duration) -> Self {
        self.announce_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_peer_ttl(mut self, ttl: Duration) -> Self {
        self.peer_ttl_ms = ttl.as_millis() as u64;
        self
    }

    /// Set the INVITE retry policy
    pub fn with_invite_retries(mut self, attempts: u32, interval: Duration) -> Self {
        self.invite_attempts = attempts;
        self.invite_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_audio_format(mut self, format: AudioFormat) -> Self {
        self.audio = format;
        self
    }

    pub fn signaling_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.signaling_port)
    }

    pub fn media_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.media_port)
    }

    pub fn discovery_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.discovery_port)
    }

    /// Port that outgoing media is sent to on the remote peer
    pub fn remote_media_port(&self) -> u16 {
        self.peer_media_port.unwrap_or(self.media_port)
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    pub fn peer_ttl(&self) -> Duration {
        Duration::from_millis(self.peer_ttl_ms)
    }

    pub fn invite_interval(&self) -> Duration {
        Duration::from_millis(self.invite_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}
