//! Discovery announcement format
//!
//! Peers announce themselves by broadcasting `DISCOVER:<port>|<name>|<role>`
//! as plain ASCII, where `<port>` is the sender's signaling port.

use std::fmt;

use crate::error::{Result, WireError};

/// Prefix of every announcement datagram
pub const DISCOVER_PREFIX: &str = "DISCOVER:";

/// A peer's presence announcement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    /// Port the peer accepts signaling on
    pub signaling_port: u16,
    /// Human-readable name
    pub display_name: String,
    /// Role tag (e.g. "Buyer", "Seller")
    pub role: String,
}

impl Announcement {
    pub fn new(signaling_port: u16, display_name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            signaling_port,
            display_name: display_name.into(),
            role: role.into(),
        }
    }

    /// Render the announcement as wire text
    pub fn encode(&self) -> String {
        format!(
            "{}{}|{}|{}",
            DISCOVER_PREFIX, self.signaling_port, self.display_name, self.role
        )
    }

    /// Parse announcement text.
    ///
    /// The name may not contain `|`; anything after the second separator is
    /// taken as the role.
    pub fn parse(text: &str) -> Result<Self> {
        let body = text
            .trim()
            .strip_prefix(DISCOVER_PREFIX)
            .ok_or_else(|| WireError::announcement("missing DISCOVER: prefix"))?;

        let mut fields = body.splitn(3, '|');
        let port = fields
            .next()
            .ok_or_else(|| WireError::announcement("missing port"))?;
        let signaling_port = port
            .trim()
            .parse::<u16>()
            .map_err(|_| WireError::announcement(format!("invalid port '{}'", port)))?;
        let display_name = fields
            .next()
            .ok_or_else(|| WireError::announcement("missing display name"))?;
        let role = fields
            .next()
            .ok_or_else(|| WireError::announcement("missing role"))?;

        Ok(Self::new(signaling_port, display_name, role))
    }

    /// Parse a raw datagram
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data).map_err(|_| WireError::NotText)?;
        Self::parse(text)
    }
}

impl fmt::Display for Announcement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}
