/*!
CRC-16 variant used by the wire framing.

CRC-16/IBM-3740, better known as CCITT-FALSE: polynomial 0x1021, initial
value 0xFFFF, no input/output reflection, no final XOR. Computed over
header || payload and appended little-endian.

This is NOT the CRC used on the field bus (`fieldbus::crc` is the reflected
MODBUS variant). The two live in separately named constants on purpose; do
not merge them behind a parameter.
*/

use crc::{CRC_16_IBM_3740, Crc};

const WIRE_CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// CRC-16/CCITT-FALSE over `bytes`.
#[inline]
pub fn wire_crc(bytes: &[u8]) -> u16 {
    WIRE_CRC16.checksum(bytes)
}
