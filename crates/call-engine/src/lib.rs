//! # lancall call engine
//!
//! Peer-to-peer voice calls on a local network, without a call server:
//!
//! - **Discovery**: every engine broadcasts `DISCOVER:<port>|<name>|<role>`
//!   and keeps a [`PeerDirectory`] of who else is on the LAN
//! - **Signaling**: a four-message SIP-shaped protocol (INVITE, 200 OK,
//!   603 Decline, BYE) drives the `Idle`/`Dialing`/`Ringing`/`Connected`
//!   state machine
//! - **Media**: raw PCM in RTP-style datagrams, exchanged with an
//!   application-supplied [`AudioDevice`]
//!
//! [`CallEngine`] ties these together; applications observe it through a
//! [`CallEventHandler`] or a watch channel of [`CallStatus`].

pub mod audio;
pub mod config;
pub mod directory;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod events;
pub mod identity;
pub mod logging;
pub mod media;
pub mod net;
pub mod probe;
pub mod signaling;
pub mod state;
pub mod tasks;

// Re-export commonly used types
pub use audio::{AudioDevice, AudioFormat, SilentAudioDevice};
pub use config::EngineConfig;
pub use directory::{PeerDirectory, PeerRecord, UpsertOutcome};
pub use engine::{CallEngine, CallEngineBuilder};
pub use error::{EngineError, Result};
pub use events::{CallEventHandler, EngineEvent, NoopEventHandler};
pub use identity::{IdentityProvider, LocalIdentity, StaticIdentity};
pub use logging::{setup_logging, LogFormat, LoggingConfig};
pub use media::MediaStats;
pub use probe::{NoopProbe, PingProbe, ReachabilityProbe};
pub use state::{CallDirection, CallSession, CallState, CallStatus};

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::{
        AudioDevice, AudioFormat, CallDirection, CallEngine, CallEngineBuilder, CallEventHandler, CallSession,
        CallState, CallStatus, EngineConfig, EngineError, IdentityProvider, PeerRecord, Result, StaticIdentity,
    };
}
