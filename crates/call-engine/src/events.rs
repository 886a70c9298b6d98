//! Engine events and the observer interface
//!
//! Components report through [`EngineEvent`]s on an internal channel; the
//! engine's dispatcher forwards them to the application's
//! [`CallEventHandler`] one at a time, in order.

use std::net::IpAddr;

use async_trait::async_trait;

use crate::directory::PeerRecord;
use crate::state::CallState;

/// Internal notification emitted by the engine components
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Call state moved; `message` is the human-readable status
    StateChanged { state: CallState, message: String },
    /// An INVITE was accepted into `Ringing`
    IncomingCall { name: String, address: IpAddr },
    /// Peers appeared, moved or were evicted
    PeersChanged { peers: Vec<PeerRecord> },
}

/// Application callbacks for UI and notification rendering.
///
/// Every method defaults to a no-op. Callbacks run on the engine's
/// dispatcher task, so a slow handler delays later events but never blocks
/// the network loops.
///
/// ```rust
/// use lancall_call_engine::{CallEventHandler, CallState};
/// use async_trait::async_trait;
/// use std::net::IpAddr;
///
/// struct Banner;
///
/// #[async_trait]
/// impl CallEventHandler for Banner {
///     async fn on_incoming_call(&self, name: String, address: IpAddr) {
///         println!("{} ({}) is calling", name, address);
///     }
///
///     async fn on_state_changed(&self, state: CallState, message: String) {
///         println!("[{}] {}", state, message);
///     }
/// }
/// ```
#[async_trait]
pub trait CallEventHandler: Send + Sync {
    async fn on_state_changed(&self, _state: CallState, _message: String) {}

    async fn on_incoming_call(&self, _name: String, _address: IpAddr) {}

    async fn on_peers_changed(&self, _peers: Vec<PeerRecord>) {}
}

/// Handler that ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventHandler;

#[async_trait]
impl CallEventHandler for NoopEventHandler {}
