//! Call state and session bookkeeping
//!
//! There is exactly one [`SharedCallState`] per engine. It holds the current
//! [`CallState`] and the active [`CallSession`] under a single lock, so every
//! transition is a compare-and-set: concurrent commands racing on the same
//! state (e.g. answer vs. decline) see exactly one winner.
//!
//! Each successful transition publishes the new `(state, status)` pair on a
//! watch channel and queues a [`EngineEvent::StateChanged`] while the lock is
//! still held, so observers see transitions in the order they happened.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::info;

use crate::events::EngineEvent;

/// Call state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CallState {
    /// No call in progress
    #[default]
    Idle,
    /// Outgoing INVITE sent, waiting for an answer
    Dialing,
    /// Incoming INVITE received, waiting for the user
    Ringing,
    /// Call established, media flowing
    Connected,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallState::Idle => "Idle",
            CallState::Dialing => "Dialing",
            CallState::Ringing => "Ringing",
            CallState::Connected => "Connected",
        };
        f.write_str(name)
    }
}

/// Who initiated the call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// State of one call attempt, from dial/ring to teardown
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSession {
    /// Call-ID header value shared by both peers
    pub call_id: String,
    pub direction: CallDirection,
    /// Remote peer address
    pub remote_ip: IpAddr,
    /// Remote signaling port
    pub remote_signaling_port: u16,
    /// Remote media port
    pub remote_media_port: u16,
    /// Remote display name ("Unknown" if not in the peer directory)
    pub peer_name: String,
    /// When the session was created
    pub created_at: DateTime<Utc>,
    /// When the call reached `Connected`
    pub connected_at: Option<DateTime<Utc>>,
}

impl CallSession {
    pub fn remote_signaling_addr(&self) -> SocketAddr {
        SocketAddr::new(self.remote_ip, self.remote_signaling_port)
    }

    pub fn remote_media_addr(&self) -> SocketAddr {
        SocketAddr::new(self.remote_ip, self.remote_media_port)
    }
}

/// Observable `(state, status message)` pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallStatus {
    pub state: CallState,
    pub message: String,
}

impl Default for CallStatus {
    fn default() -> Self {
        Self {
            state: CallState::Idle,
            message: "Idle".to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct CallContext {
    state: CallState,
    session: Option<CallSession>,
}

/// The engine's single call state holder
#[derive(Debug)]
pub struct SharedCallState {
    inner: Mutex<CallContext>,
    status_tx: watch::Sender<CallStatus>,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl SharedCallState {
    pub fn new(events: mpsc::UnboundedSender<EngineEvent>) -> Self {
        let (status_tx, _) = watch::channel(CallStatus::default());
        Self {
            inner: Mutex::new(CallContext::default()),
            status_tx,
            events,
        }
    }

    pub fn state(&self) -> CallState {
        self.inner.lock().state
    }

    /// Copy of the active session, if any
    pub fn session(&self) -> Option<CallSession> {
        self.inner.lock().session.clone()
    }

    /// Current state and session, read atomically
    pub fn snapshot(&self) -> (CallState, Option<CallSession>) {
        let ctx = self.inner.lock();
        (ctx.state, ctx.session.clone())
    }

    /// Latest published status
    pub fn status(&self) -> CallStatus {
        self.status_tx.borrow().clone()
    }

    /// Watch state/status changes
    pub fn subscribe(&self) -> watch::Receiver<CallStatus> {
        self.status_tx.subscribe()
    }

    /// Open a new session: `Idle` -> `to`.
    ///
    /// Fails with the current state if a session is already active.
    pub fn begin(&self, to: CallState, session: CallSession, message: impl Into<String>) -> Result<(), CallState> {
        let mut ctx = self.inner.lock();
        if ctx.state != CallState::Idle {
            return Err(ctx.state);
        }
        ctx.state = to;
        ctx.session = Some(session);
        self.publish(to, message.into());
        Ok(())
    }

    /// `from` -> `to` for whatever session is active.
    ///
    /// Returns the session as it was after the transition (or the closed
    /// session when `to` is `Idle`), or `None` if the state was not `from`.
    pub fn transition(&self, from: CallState, to: CallState, message: impl Into<String>) -> Option<CallSession> {
        self.transition_if(|_| true, from, to, message.into())
    }

    /// `from` -> `to`, only if the active session has `call_id`
    pub fn transition_call(
        &self,
        call_id: &str,
        from: CallState,
        to: CallState,
        message: impl Into<String>,
    ) -> Option<CallSession> {
        self.transition_if(|s| s.call_id == call_id, from, to, message.into())
    }

    fn transition_if<F>(&self, matches: F, from: CallState, to: CallState, message: String) -> Option<CallSession>
    where
        F: Fn(&CallSession) -> bool,
    {
        let mut ctx = self.inner.lock();
        if ctx.state != from || !ctx.session.as_ref().map_or(false, |s| matches(s)) {
            return None;
        }

        ctx.state = to;
        let session = if to == CallState::Idle {
            ctx.session.take()
        } else {
            if to == CallState::Connected {
                if let Some(session) = ctx.session.as_mut() {
                    session.connected_at.get_or_insert_with(Utc::now);
                }
            }
            ctx.session.clone()
        };

        self.publish(to, message);
        session
    }

    fn publish(&self, state: CallState, message: String) {
        info!("📞 Call state -> {} ({})", state, message);
        self.status_tx.send_replace(CallStatus {
            state,
            message: message.clone(),
        });
        // The receiver only disappears during shutdown.
        let _ = self.events.send(EngineEvent::StateChanged { state, message });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn session(call_id: &str) -> CallSession {
        CallSession {
            call_id: call_id.to_string(),
            direction: CallDirection::Incoming,
            remote_ip: "10.0.0.5".parse().unwrap(),
            remote_signaling_port: 5060,
            remote_media_port: 5004,
            peer_name: "Alice".to_string(),
            created_at: Utc::now(),
            connected_at: None,
        }
    }

    fn shared() -> (SharedCallState, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SharedCallState::new(tx), rx)
    }

    #[test]
    fn test_begin_requires_idle() {
        let (state, _rx) = shared();
        assert!(state.begin(CallState::Ringing, session("a"), "Incoming call from Alice").is_ok());
        assert_eq!(state.begin(CallState::Dialing, session("b"), "Calling"), Err(CallState::Ringing));
        assert_eq!(state.session().unwrap().call_id, "a");
    }

    #[test]
    fn test_return_to_idle_clears_session() {
        let (state, _rx) = shared();
        state.begin(CallState::Dialing, session("a"), "Calling Alice...").unwrap();

        let closed = state.transition(CallState::Dialing, CallState::Idle, "No Answer").unwrap();
        assert_eq!(closed.call_id, "a");
        assert_eq!(state.state(), CallState::Idle);
        assert!(state.session().is_none());
        assert_eq!(state.status().message, "No Answer");
    }

    #[test]
    fn test_transition_checks_call_id() {
        let (state, _rx) = shared();
        state.begin(CallState::Dialing, session("a"), "Calling").unwrap();

        assert!(state
            .transition_call("other", CallState::Dialing, CallState::Connected, "Connected")
            .is_none());
        let connected = state
            .transition_call("a", CallState::Dialing, CallState::Connected, "Connected")
            .unwrap();
        assert!(connected.connected_at.is_some());
    }

    #[test]
    fn test_events_follow_transition_order() {
        let (state, mut rx) = shared();
        state.begin(CallState::Ringing, session("a"), "Incoming call from Alice").unwrap();
        state.transition(CallState::Ringing, CallState::Connected, "Connected").unwrap();
        state.transition(CallState::Connected, CallState::Idle, "Call Ended").unwrap();

        let mut seen = Vec::new();
        while let Ok(EngineEvent::StateChanged { state, .. }) = rx.try_recv() {
            seen.push(state);
        }
        assert_eq!(seen, vec![CallState::Ringing, CallState::Connected, CallState::Idle]);
    }

    #[test]
    fn test_racing_transitions_have_one_winner() {
        let (state, _rx) = shared();
        let state = Arc::new(state);
        state.begin(CallState::Ringing, session("a"), "Incoming").unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let state = state.clone();
                std::thread::spawn(move || {
                    let to = if i % 2 == 0 { CallState::Connected } else { CallState::Idle };
                    state.transition(CallState::Ringing, to, "race").is_some()
                })
            })
            .collect();

        let winners = handles.into_iter().map(|h| h.join().unwrap()).filter(|won| *won).count();
        assert_eq!(winners, 1);
        assert_ne!(state.state(), CallState::Ringing);
    }
}
