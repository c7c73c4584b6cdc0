/*!
Session and run lifecycle commands (0x0100-0x0105) plus service and clear
commands (0x0110-0x0113).

Every command here except OPEN_SESSION carries the session id and is
rejected with REJECTED_POLICY / session_invalid unless it names the open,
Live session.
*/

use crate::hal::Instant;
use crate::machine::{PauseMode, RunMode, StopMode};

use super::{BodyReader, CmdResult, DETAIL_OUT_OF_RANGE, Dispatcher, Reject};

/// OPEN_SESSION: `nonce:u32`; ACK data `{id:u32, lease_ms:u16}`.
pub(super) fn open_session(d: &Dispatcher, body: &mut BodyReader, now: Instant) -> CmdResult {
    let nonce = body.u32()?;
    let (id, lease_ms) = d.session.open(nonce, now)?;
    let mut data = Vec::with_capacity(6);
    data.extend_from_slice(&id.to_le_bytes());
    data.extend_from_slice(&lease_ms.to_le_bytes());
    Ok(data)
}

/// KEEPALIVE: `id:u32`. The one command that does not reset the poller's
/// activity timer.
pub(super) fn keepalive(d: &Dispatcher, body: &mut BodyReader, now: Instant) -> CmdResult {
    let id = body.u32()?;
    d.session.keepalive(id, now)?;
    Ok(Vec::new())
}

/// START_RUN: `id:u32, mode:u8, target:i16, duration_ms:u32`.
pub(super) fn start_run(d: &Dispatcher, body: &mut BodyReader, now: Instant) -> CmdResult {
    let id = body.u32()?;
    let mode = body.u8()?;
    let target_x10 = body.i16()?;
    let duration_ms = body.u32()?;
    d.require_session(id)?;
    let mode = RunMode::try_from(mode).map_err(|_| Reject::invalid_args(DETAIL_OUT_OF_RANGE))?;
    d.machine.start_run(now, mode, target_x10, duration_ms)?;
    Ok(Vec::new())
}

/// STOP_RUN: `id:u32, stop_mode:u8`.
pub(super) fn stop_run(d: &Dispatcher, body: &mut BodyReader, now: Instant) -> CmdResult {
    let id = body.u32()?;
    let stop_mode = body.u8()?;
    d.require_session(id)?;
    let stop_mode =
        StopMode::try_from(stop_mode).map_err(|_| Reject::invalid_args(DETAIL_OUT_OF_RANGE))?;
    d.machine.stop_run(now, stop_mode)?;
    Ok(Vec::new())
}

/// PAUSE_RUN: `id:u32, pause_mode:u8`.
pub(super) fn pause_run(d: &Dispatcher, body: &mut BodyReader, now: Instant) -> CmdResult {
    let id = body.u32()?;
    let pause_mode = body.u8()?;
    d.require_session(id)?;
    let pause_mode =
        PauseMode::try_from(pause_mode).map_err(|_| Reject::invalid_args(DETAIL_OUT_OF_RANGE))?;
    d.machine.pause(now, pause_mode)?;
    Ok(Vec::new())
}

/// RESUME_RUN: `id:u32`.
pub(super) fn resume_run(d: &Dispatcher, body: &mut BodyReader, now: Instant) -> CmdResult {
    let id = body.u32()?;
    d.require_session(id)?;
    d.machine.resume(now)?;
    Ok(Vec::new())
}

/// ENABLE_SERVICE: `id:u32`, IDLE only.
pub(super) fn enable_service(d: &Dispatcher, body: &mut BodyReader, now: Instant) -> CmdResult {
    let id = body.u32()?;
    d.require_session(id)?;
    d.machine.enable_service(now)?;
    Ok(Vec::new())
}

/// DISABLE_SERVICE: `id:u32`, back to IDLE with all outputs off.
pub(super) fn disable_service(d: &Dispatcher, body: &mut BodyReader, now: Instant) -> CmdResult {
    let id = body.u32()?;
    d.require_session(id)?;
    d.machine.disable_service(now)?;
    Ok(Vec::new())
}

/// CLEAR_ESTOP: `id:u32`; requires the chain released.
pub(super) fn clear_estop(d: &Dispatcher, body: &mut BodyReader, now: Instant) -> CmdResult {
    let id = body.u32()?;
    d.require_session(id)?;
    d.machine.clear_estop(now)?;
    Ok(Vec::new())
}

/// CLEAR_FAULT: `id:u32`; requires the fault cause resolved.
pub(super) fn clear_fault(d: &Dispatcher, body: &mut BodyReader, now: Instant) -> CmdResult {
    let id = body.u32()?;
    d.require_session(id)?;
    d.machine.clear_fault(now)?;
    Ok(Vec::new())
}
