//! Socket helpers shared by the engine components

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::debug;

use crate::error::{EngineError, Result};

/// Largest datagram any loop expects to receive
pub const MAX_DATAGRAM_SIZE: usize = 65_536;

/// Bind a plain UDP socket for `component`
pub async fn bind_udp(component: &'static str, addr: SocketAddr) -> Result<UdpSocket> {
    UdpSocket::bind(addr)
        .await
        .map_err(|source| EngineError::Bind { component, addr, source })
}

/// Bind a broadcast-capable UDP socket that other local processes may share
pub fn bind_broadcast(component: &'static str, addr: SocketAddr) -> Result<UdpSocket> {
    let bind_err = |source: std::io::Error| EngineError::Bind { component, addr, source };

    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP)).map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.set_broadcast(true).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;

    UdpSocket::from_std(socket.into()).map_err(bind_err)
}

/// A component's exclusively owned socket.
///
/// Loops hold clones of the inner `Arc` while running; `close` drops the
/// owner's reference so the socket is released once the loops have exited.
#[derive(Debug)]
pub struct SocketSlot {
    component: &'static str,
    local_addr: SocketAddr,
    socket: Mutex<Option<Arc<UdpSocket>>>,
}

impl SocketSlot {
    pub fn new(component: &'static str, socket: UdpSocket) -> Self {
        let local_addr = socket
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
        Self {
            component,
            local_addr,
            socket: Mutex::new(Some(Arc::new(socket))),
        }
    }

    /// Address the socket was bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared handle to the open socket
    pub fn get(&self) -> Result<Arc<UdpSocket>> {
        self.socket.lock().clone().ok_or(EngineError::Shutdown)
    }

    pub fn is_closed(&self) -> bool {
        self.socket.lock().is_none()
    }

    /// Release the owner's handle; returns false if already closed
    pub fn close(&self) -> bool {
        let closed = self.socket.lock().take().is_some();
        if closed {
            debug!("Closed {} socket {}", self.component, self.local_addr);
        }
        closed
    }
}

/// Address of the interface that routes off-host.
///
/// Connecting a UDP socket only selects a route; nothing is sent.
pub fn detect_local_ip() -> Option<IpAddr> {
    let socket = std::net::UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)).ok()?;
    socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9)).ok()?;
    socket
        .local_addr()
        .ok()
        .map(|addr| addr.ip())
        .filter(|ip| !ip.is_unspecified())
}
