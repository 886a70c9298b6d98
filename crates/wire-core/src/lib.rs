//! Wire formats for the lancall peer-to-peer call engine
//!
//! This crate has no I/O. It encodes and decodes the three datagram formats
//! exchanged between peers:
//!
//! - [`media`]: RTP-style audio packets (12-byte header + raw PCM)
//! - [`signaling`]: SIP-style call control text (INVITE / 200 OK / 603 / BYE)
//! - [`discovery`]: broadcast presence announcements
//!
//! # Example
//!
//! ```rust
//! use lancall_wire_core::{decode_media, encode_media};
//!
//! let datagram = encode_media(&[1, 2, 3, 4], 7, 320, 0xCAFE);
//! let packet = decode_media(&datagram).unwrap();
//! assert_eq!(packet.sequence_number, 7);
//! assert_eq!(packet.payload.as_ref(), &[1, 2, 3, 4]);
//! ```

pub mod discovery;
pub mod error;
pub mod media;
pub mod signaling;

pub use discovery::{Announcement, DISCOVER_PREFIX};
pub use error::{Result, WireError};
pub use media::{decode_media, encode_media, MediaPacket, MEDIA_HEADER_LEN, MEDIA_PAYLOAD_TYPE};
pub use signaling::{decode_signaling, SignalingHeaders, SignalingKind, SignalingMessage};
