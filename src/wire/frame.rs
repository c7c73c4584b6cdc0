/*!
Frame header and the build/parse pair.

`build` produces a complete frame in one allocation sized to the final frame;
`parse` validates version, length and CRC, then hands back a borrowed payload
view. Neither touches payload contents.
*/

use super::crc::wire_crc;
use super::{CRC_LEN, HEADER_LEN, MAX_PAYLOAD, MsgType, PROTO_VERSION, WireError};

/// Parsed frame header.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub proto_ver: u8,
    /// Raw message-type byte. Unknown values parse fine; the consumer
    /// decides whether to route or drop them.
    pub msg_type: u8,
    pub seq: u16,
    pub payload_len: u16,
}

impl FrameHeader {
    /// Typed view of `msg_type`, if it is a known discriminator.
    pub fn typed(&self) -> Option<MsgType> {
        MsgType::try_from(self.msg_type).ok()
    }
}

/// Build a complete frame: header, payload, CRC trailer.
pub fn build(msg_type: MsgType, seq: u16, payload: &[u8]) -> Result<Vec<u8>, WireError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(WireError::PayloadTooLarge(payload.len()));
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len() + CRC_LEN);
    frame.push(PROTO_VERSION);
    frame.push(msg_type.into());
    frame.extend_from_slice(&seq.to_le_bytes());
    frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    frame.extend_from_slice(payload);

    let crc = wire_crc(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    Ok(frame)
}

/// Parse and validate one frame, returning the header and a payload view.
///
/// Trailing bytes beyond the framed length are ignored (the transport may
/// deliver padded buffers).
pub fn parse(bytes: &[u8]) -> Result<(FrameHeader, &[u8]), WireError> {
    if bytes.len() < HEADER_LEN + CRC_LEN {
        return Err(WireError::Truncated {
            have: bytes.len(),
            need: HEADER_LEN + CRC_LEN,
        });
    }
    if bytes[0] != PROTO_VERSION {
        return Err(WireError::BadVersion(bytes[0]));
    }

    let header = FrameHeader {
        proto_ver: bytes[0],
        msg_type: bytes[1],
        seq: u16::from_le_bytes([bytes[2], bytes[3]]),
        payload_len: u16::from_le_bytes([bytes[4], bytes[5]]),
    };

    let framed_len = HEADER_LEN + header.payload_len as usize + CRC_LEN;
    if bytes.len() < framed_len {
        return Err(WireError::Truncated {
            have: bytes.len(),
            need: framed_len,
        });
    }

    let crc_at = HEADER_LEN + header.payload_len as usize;
    let computed = wire_crc(&bytes[..crc_at]);
    let received = u16::from_le_bytes([bytes[crc_at], bytes[crc_at + 1]]);
    if computed != received {
        return Err(WireError::BadCrc { computed, received });
    }

    Ok((header, &bytes[HEADER_LEN..crc_at]))
}
