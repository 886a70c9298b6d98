//! Best-effort reachability probe
//!
//! Fired once when a peer is first seen (or changes port). The result is
//! never consumed; the probe only nudges the OS into resolving the route and
//! ARP entry before the first INVITE goes out.

use std::net::IpAddr;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, trace};

/// Fire-and-forget reachability check
pub trait ReachabilityProbe: Send + Sync {
    /// Start probing `address`; must not block
    fn probe(&self, address: IpAddr);
}

/// Runs one system `ping` per probe with its output discarded
#[derive(Debug, Default, Clone, Copy)]
pub struct PingProbe;

impl ReachabilityProbe for PingProbe {
    fn probe(&self, address: IpAddr) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            trace!("No runtime, skipping probe of {}", address);
            return;
        };

        handle.spawn(async move {
            let status = Command::new("ping")
                .arg("-c")
                .arg("1")
                .arg("-W")
                .arg("1")
                .arg(address.to_string())
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .status()
                .await;

            match status {
                Ok(status) => trace!("Probe of {} finished: {}", address, status),
                Err(e) => debug!("Probe of {} could not run: {}", address, e),
            }
        });
    }
}

/// Probe that does nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProbe;

impl ReachabilityProbe for NoopProbe {
    fn probe(&self, _address: IpAddr) {}
}
