//! Signaling message codec
//!
//! Call control uses a minimal SIP-shaped text protocol carried in single UDP
//! datagrams. Four messages exist:
//!
//! ```text
//! INVITE sip:<host> SIP/2.0      request, opens a call
//! BYE sip:<host> SIP/2.0         request, ends or cancels a call
//! SIP/2.0 200 OK                 response, accepts an INVITE or acks a BYE
//! SIP/2.0 603 Decline            response, rejects an INVITE
//! ```
//!
//! Each start line is followed by `Via`, `From`, `To`, `Call-ID`, `CSeq` and
//! `Content-Length` header lines and a blank line. Classification looks only
//! at the start line; header values are carried through untouched.

use std::fmt;

use crate::error::{Result, WireError};

/// Protocol version token used on every start line
pub const SIP_VERSION: &str = "SIP/2.0";

const HEADER_VIA: &str = "Via";
const HEADER_FROM: &str = "From";
const HEADER_TO: &str = "To";
const HEADER_CALL_ID: &str = "Call-ID";
const HEADER_CSEQ: &str = "CSeq";
const HEADER_CONTENT_LENGTH: &str = "Content-Length";

/// The four signaling message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalingKind {
    /// Call request
    Invite,
    /// 200 OK, answers an Invite or acknowledges a Bye
    Ok,
    /// 603 Decline, rejects an Invite
    Decline,
    /// Call teardown request
    Bye,
}

impl SignalingKind {
    /// Whether this kind is sent as a request line
    pub fn is_request(&self) -> bool {
        matches!(self, SignalingKind::Invite | SignalingKind::Bye)
    }

    /// Method token for requests, status text for responses
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalingKind::Invite => "INVITE",
            SignalingKind::Bye => "BYE",
            SignalingKind::Ok => "200 OK",
            SignalingKind::Decline => "603 Decline",
        }
    }
}

impl fmt::Display for SignalingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Header values carried by every signaling message.
///
/// Values are opaque: they are written and read back verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignalingHeaders {
    pub via: String,
    pub from: String,
    pub to: String,
    pub call_id: String,
    pub cseq: String,
}

/// One signaling datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingMessage {
    /// Message kind
    pub kind: SignalingKind,
    /// Request target host (requests only)
    pub target: Option<String>,
    /// Header block
    pub headers: SignalingHeaders,
}

impl SignalingMessage {
    /// Build an INVITE addressed to `host`
    pub fn invite(host: impl Into<String>, headers: SignalingHeaders) -> Self {
        Self {
            kind: SignalingKind::Invite,
            target: Some(host.into()),
            headers,
        }
    }

    /// Build a BYE addressed to `host`
    pub fn bye(host: impl Into<String>, headers: SignalingHeaders) -> Self {
        Self {
            kind: SignalingKind::Bye,
            target: Some(host.into()),
            headers,
        }
    }

    /// Build a 200 OK response
    pub fn ok(headers: SignalingHeaders) -> Self {
        Self {
            kind: SignalingKind::Ok,
            target: None,
            headers,
        }
    }

    /// Build a 603 Decline response
    pub fn decline(headers: SignalingHeaders) -> Self {
        Self {
            kind: SignalingKind::Decline,
            target: None,
            headers,
        }
    }

    /// Render the message as wire text
    pub fn encode(&self) -> String {
        let start_line = if self.kind.is_request() {
            format!(
                "{} sip:{} {}",
                self.kind.as_str(),
                self.target.as_deref().unwrap_or_default(),
                SIP_VERSION
            )
        } else {
            format!("{} {}", SIP_VERSION, self.kind.as_str())
        };

        let h = &self.headers;
        format!(
            "{start_line}\r\n\
             {HEADER_VIA}: {}\r\n\
             {HEADER_FROM}: {}\r\n\
             {HEADER_TO}: {}\r\n\
             {HEADER_CALL_ID}: {}\r\n\
             {HEADER_CSEQ}: {}\r\n\
             {HEADER_CONTENT_LENGTH}: 0\r\n\
             \r\n",
            h.via, h.from, h.to, h.call_id, h.cseq
        )
    }

    /// Parse wire text into a message.
    ///
    /// The kind comes from the start line alone. Unknown header lines are
    /// skipped and missing ones are left empty.
    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text.lines();
        let first_line = lines.next().unwrap_or_default().trim();
        let kind = classify(first_line).ok_or_else(|| WireError::UnknownSignaling {
            first_line: first_line.to_string(),
        })?;

        let target = if kind.is_request() {
            request_target(first_line)
        } else {
            None
        };

        let mut headers = SignalingHeaders::default();
        for line in lines {
            let line = line.trim_end();
            if line.is_empty() {
                break;
            }
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim().to_string();
            let name = name.trim();
            if name.eq_ignore_ascii_case(HEADER_VIA) {
                headers.via = value;
            } else if name.eq_ignore_ascii_case(HEADER_FROM) {
                headers.from = value;
            } else if name.eq_ignore_ascii_case(HEADER_TO) {
                headers.to = value;
            } else if name.eq_ignore_ascii_case(HEADER_CALL_ID) {
                headers.call_id = value;
            } else if name.eq_ignore_ascii_case(HEADER_CSEQ) {
                headers.cseq = value;
            }
        }

        Ok(Self {
            kind,
            target,
            headers,
        })
    }

    /// Parse a raw datagram
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data).map_err(|_| WireError::NotText)?;
        Self::parse(text)
    }
}

impl fmt::Display for SignalingMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            Some(target) => write!(f, "{} sip:{}", self.kind.as_str(), target),
            None => write!(f, "{} {}", SIP_VERSION, self.kind.as_str()),
        }
    }
}

/// Classify a signaling datagram by its first line.
///
/// Returns `None` for anything that is not one of the four known start lines.
pub fn decode_signaling(text: &str) -> Option<SignalingKind> {
    classify(text.lines().next().unwrap_or_default().trim())
}

fn classify(first_line: &str) -> Option<SignalingKind> {
    if first_line.starts_with("INVITE ") {
        Some(SignalingKind::Invite)
    } else if first_line.starts_with("BYE ") {
        Some(SignalingKind::Bye)
    } else if first_line.starts_with("SIP/2.0 200") {
        Some(SignalingKind::Ok)
    } else if first_line.starts_with("SIP/2.0 603") {
        Some(SignalingKind::Decline)
    } else {
        None
    }
}

fn request_target(first_line: &str) -> Option<String> {
    let uri = first_line.split_whitespace().nth(1)?;
    let host = uri.strip_prefix("sip:").unwrap_or(uri);
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}
