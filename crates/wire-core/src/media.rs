//! Media packet codec
//!
//! Audio travels in RTP-shaped datagrams: a fixed 12-byte header followed by
//! raw PCM bytes. The header never carries CSRCs, padding or extensions, and
//! the payload type is fixed since there is no codec negotiation.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC   |M|     PT      |       sequence number         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           timestamp                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    synchronization source                     |
//! +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
//! |                        raw PCM payload                        |
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, WireError};

/// Size of the fixed media header
pub const MEDIA_HEADER_LEN: usize = 12;

/// First header byte: version 2, no padding, no extension, no CSRCs
pub const MEDIA_VERSION_BYTE: u8 = 0x80;

/// Payload type used for raw PCM audio
pub const MEDIA_PAYLOAD_TYPE: u8 = 96;

/// A decoded media datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaPacket {
    /// Per-session sequence number
    pub sequence_number: u16,
    /// Per-session sample timestamp
    pub timestamp: u32,
    /// Source identifier of the sender
    pub ssrc: u32,
    /// Raw audio bytes
    pub payload: Bytes,
}

impl MediaPacket {
    /// Create a packet from its parts
    pub fn new(payload: impl Into<Bytes>, sequence_number: u16, timestamp: u32, ssrc: u32) -> Self {
        Self {
            sequence_number,
            timestamp,
            ssrc,
            payload: payload.into(),
        }
    }

    /// Serialize this packet to wire bytes
    pub fn encode(&self) -> Bytes {
        encode_media(&self.payload, self.sequence_number, self.timestamp, self.ssrc)
    }
}

/// Wrap an audio chunk in a media header
pub fn encode_media(payload: &[u8], sequence_number: u16, timestamp: u32, ssrc: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(MEDIA_HEADER_LEN + payload.len());
    buf.put_u8(MEDIA_VERSION_BYTE);
    buf.put_u8(MEDIA_PAYLOAD_TYPE);
    buf.put_u16(sequence_number);
    buf.put_u32(timestamp);
    buf.put_u32(ssrc);
    buf.put_slice(payload);
    buf.freeze()
}

/// Split a media datagram into header fields and payload.
///
/// Only the length is checked. Version and payload type bytes are not
/// validated, and a datagram of exactly [`MEDIA_HEADER_LEN`] bytes yields an
/// empty payload.
pub fn decode_media(data: &[u8]) -> Result<MediaPacket> {
    if data.len() < MEDIA_HEADER_LEN {
        return Err(WireError::MediaTooShort {
            len: data.len(),
            min: MEDIA_HEADER_LEN,
        });
    }

    let sequence_number = u16::from_be_bytes([data[2], data[3]]);
    let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

    Ok(MediaPacket {
        sequence_number,
        timestamp,
        ssrc,
        payload: Bytes::copy_from_slice(&data[MEDIA_HEADER_LEN..]),
    })
}
