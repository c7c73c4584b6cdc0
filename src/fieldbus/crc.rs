/*!
CRC-16 variant used on the field bus.

CRC-16/MODBUS: reflected polynomial 0xA001, initial value 0xFFFF, no final
XOR. Appended little-endian after the function body.

Deliberately separate from `wire::crc` (CCITT-FALSE); the two protocols use
different algorithms and must not share an implementation point.
*/

use crc::{CRC_16_MODBUS, Crc};

const BUS_CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// CRC-16/MODBUS over `bytes`.
#[inline]
pub fn bus_crc(bytes: &[u8]) -> u16 {
    BUS_CRC16.checksum(bytes)
}

/// True when `frame` ends in a valid CRC trailer for its leading bytes.
#[inline]
pub fn trailer_ok(frame: &[u8]) -> bool {
    if frame.len() < 3 {
        return false;
    }
    let (body, trailer) = frame.split_at(frame.len() - 2);
    bus_crc(body) == u16::from_le_bytes([trailer[0], trailer[1]])
}
