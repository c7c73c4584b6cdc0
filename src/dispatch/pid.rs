/*!
Controller commands (0x0020-0x0031): setpoint, mode, forced refresh and raw
register access.

The controller argument is the bus address (1-3). Register values in ACK
data travel little-endian like everything else on the wire, regardless of
the big-endian field-bus representation.
*/

use crate::fieldbus::MAX_READ_COUNT;
use crate::hal::Instant;
use crate::poller::CONTROLLER_ADDRS;

use super::{BodyReader, CmdResult, DETAIL_OUT_OF_RANGE, Dispatcher, Reject};

fn check_ctrl(ctrl: u8) -> Result<u8, Reject> {
    if CONTROLLER_ADDRS.contains(&ctrl) {
        Ok(ctrl)
    } else {
        Err(Reject::invalid_args(DETAIL_OUT_OF_RANGE))
    }
}

/// SET_SV: `ctrl:u8, sv:i16` with read-back verify.
pub(super) fn set_sv(d: &Dispatcher, body: &mut BodyReader) -> CmdResult {
    let ctrl = check_ctrl(body.u8()?)?;
    let sv = body.i16()?;
    d.poller.set_sv(ctrl, sv)?;
    Ok(Vec::new())
}

/// SET_MODE: `ctrl:u8, mode:u8 (0-3)` with exact read-back verify.
pub(super) fn set_mode(d: &Dispatcher, body: &mut BodyReader) -> CmdResult {
    let ctrl = check_ctrl(body.u8()?)?;
    let mode = body.u8()?;
    if mode > 3 {
        return Err(Reject::invalid_args(DETAIL_OUT_OF_RANGE));
    }
    d.poller.set_mode(ctrl, mode)?;
    Ok(Vec::new())
}

/// FORCE_REFRESH: `ctrl:u8`, immediate poll outside the cadence.
pub(super) fn force_refresh(d: &Dispatcher, body: &mut BodyReader, now: Instant) -> CmdResult {
    let ctrl = check_ctrl(body.u8()?)?;
    d.poller.force_poll(ctrl, now)?;
    Ok(Vec::new())
}

/// READ_REGISTERS: `ctrl:u8, start:u16, count:u8 (1-16)`; ACK data carries
/// the values.
pub(super) fn read_registers(d: &Dispatcher, body: &mut BodyReader) -> CmdResult {
    let ctrl = check_ctrl(body.u8()?)?;
    let start = body.u16()?;
    let count = body.u8()?;
    if !(1..=MAX_READ_COUNT).contains(&count) {
        return Err(Reject::invalid_args(DETAIL_OUT_OF_RANGE));
    }
    let mut regs = [0u16; MAX_READ_COUNT as usize];
    d.poller.read_registers(ctrl, start, count, &mut regs)?;
    let mut data = Vec::with_capacity(count as usize * 2);
    for reg in &regs[..count as usize] {
        data.extend_from_slice(&reg.to_le_bytes());
    }
    Ok(data)
}

/// WRITE_REGISTER: `ctrl:u8, reg:u16, value:u16`; ACK data carries the
/// verified value.
pub(super) fn write_register(d: &Dispatcher, body: &mut BodyReader) -> CmdResult {
    let ctrl = check_ctrl(body.u8()?)?;
    let reg = body.u16()?;
    let value = body.u16()?;
    let verified = d.poller.write_register(ctrl, reg, value)?;
    Ok(verified.to_le_bytes().to_vec())
}
