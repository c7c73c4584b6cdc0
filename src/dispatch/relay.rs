/*!
Manual relay commands (0x0001-0x0002).

Both delegate to the machine, which applies the per-state output policy;
the ACK data is the resulting output byte so the tablet can update its
mirror without waiting for the next telemetry frame.
*/

use super::{BodyReader, CmdResult, Dispatcher};

/// SET_RELAY: `idx:u8 (1-8), state:u8 (0 off, 1 on, 2 toggle)`.
pub(super) fn set_relay(d: &Dispatcher, body: &mut BodyReader) -> CmdResult {
    let idx = body.u8()?;
    let state = body.u8()?;
    let bits = d.machine.manual_relay(idx, state)?;
    Ok(vec![bits])
}

/// SET_RELAY_MASK: `mask:u8, values:u8`.
pub(super) fn set_relay_mask(d: &Dispatcher, body: &mut BodyReader) -> CmdResult {
    let mask = body.u8()?;
    let values = body.u8()?;
    let bits = d.machine.manual_relay_mask(mask, values)?;
    Ok(vec![bits])
}
