/*!
Configuration commands (0x0040-0x0041 idle polling, 0x0070-0x0073
capabilities and safety gates).

These are the only command paths that touch persistent storage, which keeps
the key/value surface on the dispatcher task as required by the concurrency
model.
*/

use crate::hal::Instant;
use crate::safety::{CapabilityLevel, GateId, Subsystem};

use super::{BodyReader, CmdResult, DETAIL_OUT_OF_RANGE, Dispatcher, Reject};

/// SET_IDLE_TIMEOUT: `minutes:u8` (0 disables); persists and counts as
/// activity.
pub(super) fn set_idle_timeout(d: &Dispatcher, body: &mut BodyReader, now: Instant) -> CmdResult {
    let minutes = body.u8()?;
    d.poller.set_idle_timeout(minutes, now);
    Ok(Vec::new())
}

/// GET_IDLE_TIMEOUT: ACK data `{enabled:u8, minutes:u8}`.
pub(super) fn get_idle_timeout(d: &Dispatcher) -> CmdResult {
    let (enabled, minutes) = d.poller.idle_timeout();
    Ok(vec![enabled as u8, minutes])
}

/// GET_CAPABILITIES: ACK data is the 8-byte capability vector.
pub(super) fn get_capabilities(d: &Dispatcher) -> CmdResult {
    Ok(d.gates.capabilities_vector().to_vec())
}

/// SET_CAPABILITY: `subsys:u8, level:u8`; the E-stop subsystem is pinned.
pub(super) fn set_capability(d: &Dispatcher, body: &mut BodyReader) -> CmdResult {
    let subsys = Subsystem::try_from(body.u8()?)
        .map_err(|_| Reject::invalid_args(DETAIL_OUT_OF_RANGE))?;
    let level = CapabilityLevel::try_from(body.u8()?)
        .map_err(|_| Reject::invalid_args(DETAIL_OUT_OF_RANGE))?;
    d.gates.set_capability(subsys, level)?;
    Ok(Vec::new())
}

/// GET_SAFETY_GATES: ACK data `{enable_mask:u16, status_mask:u16}`.
pub(super) fn get_safety_gates(d: &Dispatcher) -> CmdResult {
    let inputs = d.machine.current_gate_inputs();
    let mut data = Vec::with_capacity(4);
    data.extend_from_slice(&d.gates.enable_mask().to_le_bytes());
    data.extend_from_slice(&d.gates.status_mask(&inputs).to_le_bytes());
    Ok(data)
}

/// SET_SAFETY_GATE: `gate_id:u8, enabled:u8`; the ESTOP gate is pinned.
pub(super) fn set_safety_gate(d: &Dispatcher, body: &mut BodyReader) -> CmdResult {
    let gate =
        GateId::try_from(body.u8()?).map_err(|_| Reject::invalid_args(DETAIL_OUT_OF_RANGE))?;
    let enabled = body.u8()? != 0;
    d.gates.set_gate(gate, enabled)?;
    Ok(Vec::new())
}
