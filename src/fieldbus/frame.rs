/*!
Field-bus request encoding and response validation.

Requests are fixed-size (8 bytes for read-holding and write-single); the
write-multiple body is variable. Responses are validated in strict order:
length, exception bit, CRC, then address/function echo. Register payloads
are big-endian on the bus.
*/

use super::crc::{bus_crc, trailer_ok};
use super::{
    ADDR_MAX, ADDR_MIN, BusError, FN_READ_HOLDING, FN_WRITE_MULTIPLE, FN_WRITE_SINGLE,
    MAX_READ_COUNT,
};

/// Largest response the master ever expects: read of 16 registers
/// (addr + fn + count byte + 32 data bytes + CRC).
pub const MAX_RESPONSE: usize = 3 + 2 * MAX_READ_COUNT as usize + 2;

/// Exception code meaning "illegal data address".
const EXC_ILLEGAL_ADDR: u8 = 0x02;

/// Fixed request length for read-holding and write-single.
pub const REQUEST_LEN: usize = 8;

fn check_addr(addr: u8) -> Result<(), BusError> {
    if (ADDR_MIN..=ADDR_MAX).contains(&addr) {
        Ok(())
    } else {
        Err(BusError::InvalidAddr(addr))
    }
}

/// Write the CRC trailer over `frame[..len-2]` into the last two bytes.
fn seal(frame: &mut [u8]) {
    let at = frame.len() - 2;
    let crc = bus_crc(&frame[..at]);
    frame[at..].copy_from_slice(&crc.to_le_bytes());
}

/// Encode a read-holding request for `count` registers starting at `start`.
///
/// Requests are stack-allocated; the poller issues these at up to 3.3 Hz per
/// controller and must not touch the heap.
pub fn encode_read_holding(addr: u8, start: u16, count: u8) -> Result<[u8; REQUEST_LEN], BusError> {
    check_addr(addr)?;
    if count == 0 || count > MAX_READ_COUNT {
        return Err(BusError::InvalidReg);
    }
    let mut frame = [0u8; REQUEST_LEN];
    frame[0] = addr;
    frame[1] = FN_READ_HOLDING;
    frame[2..4].copy_from_slice(&start.to_be_bytes());
    frame[4..6].copy_from_slice(&(count as u16).to_be_bytes());
    seal(&mut frame);
    Ok(frame)
}

/// Encode a write-single request.
pub fn encode_write_single(addr: u8, reg: u16, value: u16) -> Result<[u8; REQUEST_LEN], BusError> {
    check_addr(addr)?;
    let mut frame = [0u8; REQUEST_LEN];
    frame[0] = addr;
    frame[1] = FN_WRITE_SINGLE;
    frame[2..4].copy_from_slice(&reg.to_be_bytes());
    frame[4..6].copy_from_slice(&value.to_be_bytes());
    seal(&mut frame);
    Ok(frame)
}

/// Encode a write-multiple request for consecutive registers.
///
/// Off the hot path (configuration writes only), so a heap buffer is fine
/// here.
pub fn encode_write_multiple(addr: u8, start: u16, values: &[u16]) -> Result<Vec<u8>, BusError> {
    check_addr(addr)?;
    if values.is_empty() || values.len() > MAX_READ_COUNT as usize {
        return Err(BusError::InvalidReg);
    }
    let mut frame = vec![0u8; 9 + 2 * values.len()];
    frame[0] = addr;
    frame[1] = FN_WRITE_MULTIPLE;
    frame[2..4].copy_from_slice(&start.to_be_bytes());
    frame[4..6].copy_from_slice(&(values.len() as u16).to_be_bytes());
    frame[6] = (2 * values.len()) as u8;
    for (i, v) in values.iter().enumerate() {
        frame[7 + 2 * i..9 + 2 * i].copy_from_slice(&v.to_be_bytes());
    }
    seal(&mut frame);
    Ok(frame)
}

/// Expected response length for a read-holding of `count` registers.
pub fn read_response_len(count: u8) -> usize {
    3 + 2 * count as usize + 2
}

/// Echo responses (write-single) are a byte-for-byte copy of the request.
pub const ECHO_RESPONSE_LEN: usize = 8;

/// Reject exception responses before any other interpretation.
///
/// An exception frame is addr + (fn | 0x80) + code + CRC. The "illegal data
/// address" code maps to `InvalidReg`; everything else surfaces the raw code.
fn check_exception(response: &[u8], function: u8) -> Result<(), BusError> {
    if response.len() >= 2 && response[1] == (function | 0x80) {
        if response.len() < 5 || !trailer_ok(&response[..5]) {
            return Err(BusError::Frame);
        }
        let code = response[2];
        return Err(if code == EXC_ILLEGAL_ADDR {
            BusError::InvalidReg
        } else {
            BusError::Exception(code)
        });
    }
    Ok(())
}

/// Validate a read-holding response and decode `count` registers into `out`.
pub fn decode_read_response(
    addr: u8,
    count: u8,
    response: &[u8],
    out: &mut [u16],
) -> Result<(), BusError> {
    check_exception(response, FN_READ_HOLDING)?;

    let expect = read_response_len(count);
    if response.len() < expect {
        return Err(BusError::Frame);
    }
    let response = &response[..expect];
    if !trailer_ok(response) {
        return Err(BusError::Crc);
    }
    if response[0] != addr || response[1] != FN_READ_HOLDING {
        return Err(BusError::Frame);
    }
    if response[2] != 2 * count {
        return Err(BusError::Frame);
    }

    for (i, slot) in out.iter_mut().take(count as usize).enumerate() {
        let at = 3 + 2 * i;
        *slot = u16::from_be_bytes([response[at], response[at + 1]]);
    }
    Ok(())
}

/// Validate a write echo: the device must return the first six request bytes
/// unchanged (plus its own CRC).
pub fn check_write_echo(request: &[u8], response: &[u8]) -> Result<(), BusError> {
    check_exception(response, request[1])?;

    if response.len() < ECHO_RESPONSE_LEN {
        return Err(BusError::Frame);
    }
    let response = &response[..ECHO_RESPONSE_LEN];
    if !trailer_ok(response) {
        return Err(BusError::Crc);
    }
    if response[..6] != request[..6] {
        return Err(BusError::Frame);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_request_bytes() {
        let frame = encode_read_holding(1, 0, 6).unwrap();
        assert_eq!(frame, [0x01, 0x03, 0x00, 0x00, 0x00, 0x06, 0xC5, 0xC8]);
    }

    #[test]
    fn mode_read_request_bytes() {
        let frame = encode_read_holding(1, 13, 1).unwrap();
        assert_eq!(frame, [0x01, 0x03, 0x00, 0x0D, 0x00, 0x01, 0x15, 0xC9]);
    }

    #[test]
    fn write_single_bytes() {
        // Set SV on controller 2 to -50.0 C (x10 = -500 = 0xFE0C).
        let frame = encode_write_single(2, 5, (-500i16) as u16).unwrap();
        assert_eq!(frame, [0x02, 0x06, 0x00, 0x05, 0xFE, 0x0C, 0xD9, 0x9D]);
    }

    #[test]
    fn addr_and_count_limits() {
        assert_eq!(encode_read_holding(0, 0, 1), Err(BusError::InvalidAddr(0)));
        assert_eq!(
            encode_read_holding(248, 0, 1),
            Err(BusError::InvalidAddr(248))
        );
        assert_eq!(encode_read_holding(1, 0, 0), Err(BusError::InvalidReg));
        assert_eq!(encode_read_holding(1, 0, 17), Err(BusError::InvalidReg));
        assert!(encode_read_holding(247, 0xFFFF, 16).is_ok());
    }

    #[test]
    fn decode_read_response_registers() {
        // Six registers from address 1: pv=-500, three zeros, status=1, sv=-500.
        let response = [
            0x01, 0x03, 0x0C, 0xFE, 0x0C, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0xFE,
            0x0C, 0x17, 0x53,
        ];
        let mut regs = [0u16; 6];
        decode_read_response(1, 6, &response, &mut regs).unwrap();
        assert_eq!(regs[0] as i16, -500);
        assert_eq!(regs[4], 1);
        assert_eq!(regs[5] as i16, -500);
    }

    #[test]
    fn decode_rejects_bad_crc_and_echo() {
        let mut response = [
            0x01, 0x03, 0x0C, 0xFE, 0x0C, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0xFE,
            0x0C, 0x17, 0x53,
        ];
        let mut regs = [0u16; 6];

        let mut bad = response;
        bad[4] ^= 0xFF;
        assert_eq!(
            decode_read_response(1, 6, &bad, &mut regs),
            Err(BusError::Crc)
        );

        // Address echo mismatch (recompute CRC so only the echo is wrong).
        response[0] = 0x02;
        let crc = bus_crc(&response[..15]);
        response[15..17].copy_from_slice(&crc.to_le_bytes());
        assert_eq!(
            decode_read_response(1, 6, &response, &mut regs),
            Err(BusError::Frame)
        );
    }

    #[test]
    fn exception_response_maps_by_code() {
        // addr 1, fn 0x83, code 2 (illegal data address).
        let exc = [0x01, 0x83, 0x02, 0xC0, 0xF1];
        let mut regs = [0u16; 1];
        assert_eq!(
            decode_read_response(1, 1, &exc, &mut regs),
            Err(BusError::InvalidReg)
        );

        let mut other = [0x01, 0x83, 0x04, 0x00, 0x00];
        let crc = bus_crc(&other[..3]);
        other[3..5].copy_from_slice(&crc.to_le_bytes());
        assert_eq!(
            decode_read_response(1, 1, &other, &mut regs),
            Err(BusError::Exception(0x04))
        );
    }

    #[test]
    fn write_echo_validation() {
        let request = encode_write_single(2, 5, (-500i16) as u16).unwrap();
        assert!(check_write_echo(&request, &request).is_ok());

        let mut wrong = request.clone();
        wrong[3] = 0x06;
        let crc = bus_crc(&wrong[..6]);
        wrong[6..8].copy_from_slice(&crc.to_le_bytes());
        assert_eq!(check_write_echo(&request, &wrong), Err(BusError::Frame));

        assert_eq!(
            check_write_echo(&request, &request[..5]),
            Err(BusError::Frame)
        );
    }

    #[test]
    fn write_multiple_layout() {
        let frame = encode_write_multiple(3, 0x10, &[1, 2]).unwrap();
        assert_eq!(frame[0], 3);
        assert_eq!(frame[1], FN_WRITE_MULTIPLE);
        assert_eq!(&frame[2..4], &[0x00, 0x10]);
        assert_eq!(&frame[4..6], &[0x00, 0x02]);
        assert_eq!(frame[6], 4);
        assert_eq!(&frame[7..11], &[0x00, 0x01, 0x00, 0x02]);
        assert!(trailer_ok(&frame));
    }
}
