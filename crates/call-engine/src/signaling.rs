//! Signaling engine
//!
//! Drives the call state machine over the dedicated signaling socket.
//!
//! ```text
//!            place_call               Ok                 hang_up / Bye
//!   Idle ──────────────▶ Dialing ─────────▶ Connected ─────────────────▶ Idle
//!     │                   │ Decline / retries exhausted + Bye / hang_up + Bye
//!     │                   └───────────────────────────────────────────▶ Idle
//!     │   Invite                    answer
//!     └──────────▶ Ringing ───────────────────▶ Connected
//!                   │ decline / Bye
//!                   └─────────────────────────────────────────────────▶ Idle
//! ```
//!
//! Every transition goes through [`SharedCallState`], so commands racing with
//! each other or with the listener have exactly one winner, and only the
//! winner sends the corresponding message.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use lancall_wire_core::{SignalingHeaders, SignalingKind, SignalingMessage};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::directory::PeerDirectory;
use crate::error::{EngineError, Result};
use crate::events::EngineEvent;
use crate::identity::LocalIdentity;
use crate::media::MediaTransport;
use crate::net::{bind_udp, detect_local_ip, SocketSlot, MAX_DATAGRAM_SIZE};
use crate::state::{CallDirection, CallSession, CallState, CallStatus, SharedCallState};
use crate::tasks::TaskSet;

/// Name shown for callers missing from the peer directory
pub const UNKNOWN_CALLER: &str = "Unknown";

const INVITE_CSEQ: u32 = 1;
const BYE_CSEQ: u32 = 2;

/// Components the signaling engine drives
pub struct SignalingDeps {
    pub state: Arc<SharedCallState>,
    pub directory: Arc<PeerDirectory>,
    pub media: Arc<MediaTransport>,
    pub events: mpsc::UnboundedSender<EngineEvent>,
    pub identity: LocalIdentity,
    pub tasks: Arc<TaskSet>,
}

/// Call setup and teardown over UDP
pub struct SignalingEngine {
    socket: SocketSlot,
    state: Arc<SharedCallState>,
    directory: Arc<PeerDirectory>,
    media: Arc<MediaTransport>,
    events: mpsc::UnboundedSender<EngineEvent>,
    identity: LocalIdentity,
    advertised_ip: IpAddr,
    remote_media_port: u16,
    invite_attempts: u32,
    invite_interval: Duration,
    tasks: Arc<TaskSet>,
    /// Headers of the INVITE currently ringing, echoed in the answer
    ringing_invite: Mutex<Option<SignalingHeaders>>,
}

impl SignalingEngine {
    /// Bind the signaling socket
    pub async fn bind(config: &EngineConfig, deps: SignalingDeps) -> Result<Arc<Self>> {
        let socket = SocketSlot::new("signaling", bind_udp("signaling", config.signaling_addr()).await?);
        let advertised_ip = advertised_ip(config);
        info!(
            "Signaling bound to {} (advertising {})",
            socket.local_addr(),
            advertised_ip
        );

        Ok(Arc::new(Self {
            socket,
            state: deps.state,
            directory: deps.directory,
            media: deps.media,
            events: deps.events,
            identity: deps.identity,
            advertised_ip,
            remote_media_port: config.remote_media_port(),
            invite_attempts: config.invite_attempts,
            invite_interval: config.invite_interval(),
            tasks: deps.tasks,
            ringing_invite: Mutex::new(None),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    /// Address written into Via/From/Call-ID
    pub fn advertised_ip(&self) -> IpAddr {
        self.advertised_ip
    }

    /// Spawn the listener loop
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let socket = self.socket.get()?;
        let engine = self.clone();
        let cancel = self.tasks.token();
        self.tasks.spawn("signaling-listener", async move {
            engine.listen_loop(socket, cancel).await;
        });
        Ok(())
    }

    /// Release the signaling socket
    pub fn close(&self) {
        self.socket.close();
    }

    /// `Idle` -> `Dialing`: start calling `address:port`.
    ///
    /// INVITE is retransmitted in the background until the peer answers,
    /// declines, the attempt is cancelled, or the retries run out.
    pub fn place_call(self: &Arc<Self>, address: IpAddr, port: u16) -> Result<CallSession> {
        let peer_name = self
            .directory
            .display_name(&address)
            .unwrap_or_else(|| address.to_string());
        let session = CallSession {
            call_id: self.new_call_id(),
            direction: CallDirection::Outgoing,
            remote_ip: address,
            remote_signaling_port: port,
            remote_media_port: self.remote_media_port,
            peer_name: peer_name.clone(),
            created_at: Utc::now(),
            connected_at: None,
        };

        self.state
            .begin(CallState::Dialing, session.clone(), format!("Calling {}...", peer_name))
            .map_err(|state| EngineError::invalid_state(state, "a call is already in progress"))?;

        let engine = self.clone();
        let retry = session.clone();
        let status = self.state.subscribe();
        self.tasks.spawn(format!("invite-{}", session.call_id), async move {
            engine.invite_loop(retry, status).await;
        });

        Ok(session)
    }

    /// `Ringing` -> `Connected`: accept the incoming call and start media
    pub async fn answer(&self) -> Result<()> {
        let session = self
            .state
            .transition(CallState::Ringing, CallState::Connected, "Connected")
            .ok_or_else(|| EngineError::invalid_state(self.state.state(), "no incoming call to answer"))?;

        let headers = self.response_headers(&session);
        self.send(&SignalingMessage::ok(headers), session.remote_signaling_addr())
            .await;
        self.start_media(&session).await
    }

    /// `Ringing` -> `Idle`: reject the incoming call
    pub async fn decline(&self) -> Result<()> {
        let session = self
            .state
            .transition(CallState::Ringing, CallState::Idle, "Call Declined")
            .ok_or_else(|| EngineError::invalid_state(self.state.state(), "no incoming call to decline"))?;

        let headers = self.response_headers(&session);
        self.send(&SignalingMessage::decline(headers), session.remote_signaling_addr())
            .await;
        Ok(())
    }

    /// End whatever call is in progress.
    ///
    /// Connected calls are torn down with BYE, dialing attempts are cancelled
    /// with BYE and ringing calls are declined.
    pub async fn hang_up(&self) -> Result<()> {
        match self.state.state() {
            CallState::Connected => {
                let session = self
                    .state
                    .transition(CallState::Connected, CallState::Idle, "Call Ended")
                    .ok_or_else(|| EngineError::invalid_state(self.state.state(), "call ended concurrently"))?;
                self.send_bye(&session).await;
                self.media.stop().await;
                Ok(())
            }
            CallState::Dialing => {
                let session = self
                    .state
                    .transition(CallState::Dialing, CallState::Idle, "Call Cancelled")
                    .ok_or_else(|| EngineError::invalid_state(self.state.state(), "call attempt ended concurrently"))?;
                self.send_bye(&session).await;
                Ok(())
            }
            CallState::Ringing => self.decline().await,
            CallState::Idle => Err(EngineError::invalid_state(CallState::Idle, "no call to hang up")),
        }
    }

    async fn invite_loop(&self, session: CallSession, mut status: watch::Receiver<CallStatus>) {
        let target = session.remote_signaling_addr();
        let invite = SignalingMessage::invite(
            session.remote_ip.to_string(),
            self.request_headers(&session, INVITE_CSEQ, SignalingKind::Invite),
        );

        for attempt in 1..=self.invite_attempts {
            if !self.is_dialing(&session.call_id) {
                return;
            }
            debug!(
                "Sending INVITE to {} (attempt {}/{})",
                target, attempt, self.invite_attempts
            );
            self.send(&invite, target).await;

            let deadline = tokio::time::Instant::now() + self.invite_interval;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => break,
                    changed = status.changed() => {
                        if changed.is_err() || !self.is_dialing(&session.call_id) {
                            return;
                        }
                    }
                }
            }
        }

        if self
            .state
            .transition_call(&session.call_id, CallState::Dialing, CallState::Idle, "No Answer")
            .is_some()
        {
            info!(
                "No answer from {} after {} INVITE(s)",
                target, self.invite_attempts
            );
            // The callee may still be ringing.
            self.send_bye(&session).await;
        }
    }

    fn is_dialing(&self, call_id: &str) -> bool {
        self.is_in(CallState::Dialing, call_id)
    }

    fn is_connected(&self, call_id: &str) -> bool {
        self.is_in(CallState::Connected, call_id)
    }

    fn is_in(&self, state: CallState, call_id: &str) -> bool {
        match self.state.snapshot() {
            (current, Some(session)) => current == state && session.call_id == call_id,
            _ => false,
        }
    }

    async fn listen_loop(&self, socket: Arc<UdpSocket>, cancel: CancellationToken) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = socket.recv_from(&mut buf) => match result {
                    Ok((len, src)) => match SignalingMessage::from_bytes(&buf[..len]) {
                        Ok(message) => {
                            debug!("Received {} from {}", message, src);
                            self.handle_message(message, src).await;
                        }
                        Err(e) => debug!("Dropping signaling datagram from {}: {}", src, e),
                    },
                    Err(e) => {
                        if cancel.is_cancelled() {
                            break;
                        }
                        warn!("Signaling receive error: {}", e);
                    }
                }
            }
        }
        debug!("Signaling listener stopped");
    }

    /// Apply one received message to the state machine
    pub async fn handle_message(&self, message: SignalingMessage, src: SocketAddr) {
        match message.kind {
            SignalingKind::Invite => self.on_invite(message.headers, src).await,
            SignalingKind::Ok => self.on_ok(message.headers, src).await,
            SignalingKind::Decline => self.on_decline(message.headers, src),
            SignalingKind::Bye => self.on_bye(message.headers, src).await,
        }
    }

    async fn on_invite(&self, headers: SignalingHeaders, src: SocketAddr) {
        let (state, current) = self.state.snapshot();
        if let Some(current) = current {
            let retransmit = current.remote_ip == src.ip() && current.call_id == headers.call_id;
            if retransmit && state == CallState::Connected {
                // Our 200 OK was lost; the caller is still waiting for it.
                debug!("Re-sending 200 OK for call {}", current.call_id);
                self.send(&SignalingMessage::ok(headers), current.remote_signaling_addr())
                    .await;
            } else if !retransmit {
                info!("Ignoring INVITE from {} while {}", src, state);
            }
            return;
        }

        let peer_name = self
            .directory
            .display_name(&src.ip())
            .unwrap_or_else(|| UNKNOWN_CALLER.to_string());
        let call_id = if headers.call_id.is_empty() {
            self.new_call_id()
        } else {
            headers.call_id.clone()
        };
        let session = CallSession {
            call_id,
            direction: CallDirection::Incoming,
            remote_ip: src.ip(),
            remote_signaling_port: src.port(),
            remote_media_port: self.remote_media_port,
            peer_name: peer_name.clone(),
            created_at: Utc::now(),
            connected_at: None,
        };

        let begun = {
            let mut ringing = self.ringing_invite.lock();
            let begun = self
                .state
                .begin(CallState::Ringing, session, format!("Incoming call from {}", peer_name));
            if begun.is_ok() {
                *ringing = Some(headers);
            }
            begun
        };

        match begun {
            Ok(()) => {
                let _ = self.events.send(EngineEvent::IncomingCall {
                    name: peer_name,
                    address: src.ip(),
                });
            }
            Err(state) => info!("Ignoring INVITE from {} while {}", src, state),
        }
    }

    async fn on_ok(&self, headers: SignalingHeaders, src: SocketAddr) {
        let Some(session) = self.session_from(&headers, src, CallState::Dialing) else {
            self.on_stray_ok(headers, src).await;
            return;
        };

        let Some(session) =
            self.state
                .transition_call(&session.call_id, CallState::Dialing, CallState::Connected, "Connected")
        else {
            return;
        };

        info!("✅ {} answered call {}", session.peer_name, session.call_id);
        if let Err(e) = self.start_media(&session).await {
            warn!("Call {} failed after answer: {}", session.call_id, e);
        }
    }

    /// A 200 OK that answers no live call attempt.
    ///
    /// Acks to our BYE and repeats for the connected call are dropped. An
    /// answer to an INVITE we already gave up on gets a BYE so the callee
    /// does not stay connected to nobody.
    async fn on_stray_ok(&self, headers: SignalingHeaders, src: SocketAddr) {
        let answers_invite = headers.cseq.ends_with(SignalingKind::Invite.as_str());
        if !answers_invite || headers.call_id.is_empty() || self.is_connected(&headers.call_id) {
            debug!("Ignoring 200 OK from {}", src);
            return;
        }

        info!("Tearing down late answer from {} for call {}", src, headers.call_id);
        let bye = SignalingMessage::bye(
            src.ip().to_string(),
            self.headers_for(src.ip(), &headers.call_id, BYE_CSEQ, SignalingKind::Bye),
        );
        self.send(&bye, src).await;
    }

    fn on_decline(&self, headers: SignalingHeaders, src: SocketAddr) {
        let Some(session) = self.session_from(&headers, src, CallState::Dialing) else {
            debug!("Ignoring 603 Decline from {}", src);
            return;
        };

        if self
            .state
            .transition_call(&session.call_id, CallState::Dialing, CallState::Idle, "Call Rejected")
            .is_some()
        {
            info!("❌ {} declined call {}", session.peer_name, session.call_id);
        }
    }

    async fn on_bye(&self, headers: SignalingHeaders, src: SocketAddr) {
        let (state, message) = match self.state.state() {
            CallState::Connected => (CallState::Connected, "Call Ended"),
            CallState::Ringing => (CallState::Ringing, "Call Cancelled"),
            other => {
                debug!("Ignoring BYE from {} while {}", src, other);
                return;
            }
        };
        let Some(session) = self.session_from(&headers, src, state) else {
            debug!("Ignoring BYE from {}", src);
            return;
        };

        let Some(session) = self
            .state
            .transition_call(&session.call_id, state, CallState::Idle, message)
        else {
            return;
        };

        self.send(&SignalingMessage::ok(headers), session.remote_signaling_addr())
            .await;
        if state == CallState::Connected {
            self.media.stop().await;
        }
    }

    /// Active session in `state` that `src` and `headers` belong to
    fn session_from(&self, headers: &SignalingHeaders, src: SocketAddr, state: CallState) -> Option<CallSession> {
        let (current, session) = self.state.snapshot();
        let session = session?;
        let same_call = headers.call_id.is_empty() || headers.call_id == session.call_id;
        (current == state && session.remote_ip == src.ip() && same_call).then_some(session)
    }

    async fn start_media(&self, session: &CallSession) -> Result<()> {
        match self.media.start(session, self.state.subscribe()).await {
            Ok(()) => {
                // The call may have ended while media was starting up.
                if !self.is_connected(&session.call_id) {
                    self.media.stop().await;
                }
                Ok(())
            }
            Err(e) => {
                error!("Media start failed for call {}: {}", session.call_id, e);
                if self
                    .state
                    .transition_call(&session.call_id, CallState::Connected, CallState::Idle, "Call Failed")
                    .is_some()
                {
                    self.send_bye(session).await;
                }
                Err(e)
            }
        }
    }

    async fn send_bye(&self, session: &CallSession) {
        let bye = SignalingMessage::bye(
            session.remote_ip.to_string(),
            self.request_headers(session, BYE_CSEQ, SignalingKind::Bye),
        );
        self.send(&bye, session.remote_signaling_addr()).await;
    }

    /// Best-effort send; failures are logged, never surfaced
    async fn send(&self, message: &SignalingMessage, target: SocketAddr) -> bool {
        let socket = match self.socket.get() {
            Ok(socket) => socket,
            Err(_) => {
                debug!("Signaling socket closed, not sending {}", message);
                return false;
            }
        };

        match socket.send_to(message.encode().as_bytes(), target).await {
            Ok(_) => {
                debug!("Sent {} to {}", message, target);
                true
            }
            Err(e) => {
                warn!("Failed to send {} to {}: {}", message, target, e);
                false
            }
        }
    }

    fn request_headers(&self, session: &CallSession, cseq: u32, kind: SignalingKind) -> SignalingHeaders {
        self.headers_for(session.remote_ip, &session.call_id, cseq, kind)
    }

    fn headers_for(&self, remote_ip: IpAddr, call_id: &str, cseq: u32, kind: SignalingKind) -> SignalingHeaders {
        SignalingHeaders {
            via: format!("SIP/2.0/UDP {}", self.via_addr()),
            from: format!("\"{}\" <sip:{}>", self.identity.display_name, self.advertised_ip),
            to: format!("<sip:{}>", remote_ip),
            call_id: call_id.to_string(),
            cseq: format!("{} {}", cseq, kind.as_str()),
        }
    }

    /// Headers for a response to the ringing INVITE
    fn response_headers(&self, session: &CallSession) -> SignalingHeaders {
        match self.ringing_invite.lock().take() {
            Some(headers) if headers.call_id == session.call_id => headers,
            _ => self.request_headers(session, INVITE_CSEQ, SignalingKind::Invite),
        }
    }

    fn via_addr(&self) -> SocketAddr {
        SocketAddr::new(self.advertised_ip, self.local_addr().port())
    }

    fn new_call_id(&self) -> String {
        format!("{}@{}", Uuid::new_v4().simple(), self.advertised_ip)
    }
}

/// Address peers should reach us at
fn advertised_ip(config: &EngineConfig) -> IpAddr {
    if let Some(ip) = config.local_ip {
        return ip;
    }
    if !config.bind_ip.is_unspecified() {
        return config.bind_ip;
    }
    detect_local_ip().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}
