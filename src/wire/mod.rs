/*!
Framed wire protocol shared with the operator tablet.

Frame layout (all multi-byte fields little-endian):

```text
+-----------+----------+--------+--------------+---------+--------+
| proto_ver | msg_type | seq    | payload_len  | payload | crc    |
| u8 (=1)   | u8       | u16 LE | u16 LE       | bytes   | u16 LE |
+-----------+----------+--------+--------------+---------+--------+
```

The CRC is CRC-16/IBM-3740 (CCITT-FALSE) over header || payload. Maximum
payload is 512 bytes, so a frame never exceeds 520 bytes.

The codec builds and parses frames; it never interprets payload bytes.
Command/ACK payload layouts live in `dispatch`, telemetry in `telemetry`.

Submodules:
- crc: the wire CRC-16 variant (distinct from the field-bus CRC).
- frame: header type, `build` and `parse`.
*/

pub mod crc;
pub mod frame;

pub use frame::{FrameHeader, build, parse};

use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

/// Pinned protocol version carried in every frame.
pub const PROTO_VERSION: u8 = 1;

/// Header length in bytes: version + type + seq + payload_len.
pub const HEADER_LEN: usize = 6;

/// CRC trailer length in bytes.
pub const CRC_LEN: usize = 2;

/// Maximum payload carried by one frame.
pub const MAX_PAYLOAD: usize = 512;

/// Maximum total frame size: header + payload + CRC.
pub const MAX_FRAME: usize = HEADER_LEN + MAX_PAYLOAD + CRC_LEN;

/// Top-level message discriminator.
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum MsgType {
    Telemetry = 0x01,
    Command = 0x10,
    Ack = 0x11,
    Event = 0x20,
}

/// Frame codec failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("payload of {0} bytes exceeds the {MAX_PAYLOAD}-byte limit")]
    PayloadTooLarge(usize),
    #[error("unsupported protocol version {0}")]
    BadVersion(u8),
    #[error("frame truncated: have {have} bytes, need {need}")]
    Truncated { have: usize, need: usize },
    #[error("frame CRC mismatch: computed {computed:#06x}, received {received:#06x}")]
    BadCrc { computed: u16, received: u16 },
}

/// Shared monotonic sequence counter for outbound frames (telemetry, events
/// and ACKs draw from one series so an observer can order them).
#[derive(Default)]
pub struct FrameSeq(std::sync::atomic::AtomicU16);

impl FrameSeq {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next sequence number; wraps at u16.
    pub fn next(&self) -> u16 {
        self.0.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }
}

/// Device-info record served to the transport on connect (12 bytes LE).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub fw_major: u8,
    pub fw_minor: u8,
    pub fw_patch: u8,
    pub build_id: u32,
    pub cap_bits: u32,
}

/// Capability bit: the firmware enforces the session lease of `session`.
pub const DEVCAP_SESSION_LEASE: u32 = 1 << 0;

impl DeviceInfo {
    pub fn encode(&self) -> [u8; 12] {
        let mut out = [0u8; 12];
        out[0] = PROTO_VERSION;
        out[1] = self.fw_major;
        out[2] = self.fw_minor;
        out[3] = self.fw_patch;
        out[4..8].copy_from_slice(&self.build_id.to_le_bytes());
        out[8..12].copy_from_slice(&self.cap_bits.to_le_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_info_layout() {
        let info = DeviceInfo {
            fw_major: 2,
            fw_minor: 1,
            fw_patch: 7,
            build_id: 0x1234_5678,
            cap_bits: DEVCAP_SESSION_LEASE,
        };
        let bytes = info.encode();
        assert_eq!(bytes[0], 1);
        assert_eq!(&bytes[1..4], &[2, 1, 7]);
        assert_eq!(&bytes[4..8], &0x1234_5678u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &1u32.to_le_bytes());
    }

    #[test]
    fn msg_type_round_trip() {
        for raw in [0x01u8, 0x10, 0x11, 0x20] {
            let t = MsgType::try_from(raw).unwrap();
            assert_eq!(u8::from(t), raw);
        }
        assert!(MsgType::try_from(0x02u8).is_err());
    }
}
