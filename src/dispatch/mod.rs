/*!
Command dispatch: route a parsed COMMAND frame, produce an ACK.

Orchestration
=============
1. Parse the frame (`wire::parse`); anything that fails to parse is dropped
   silently (protocol errors never become state changes).
2. Extract `cmd_id` and `flags` from the payload; a body too short for even
   that is dropped.
3. Reset the poller's activity timestamp (every command except KEEPALIVE;
   without this exception the slow-poll mode would be unreachable while the
   tablet is connected).
4. Route to the family handler; map its error into the wire status/detail
   pair; frame and send the ACK.

Families (one submodule each, mirroring the command-id blocks):
- relay: 0x000x manual relay control
- pid: 0x002x/0x003x controller setpoint, mode and raw register access
- config: 0x004x idle polling, 0x007x capabilities and safety gates
- session_ctrl: 0x010x session and run lifecycle, 0x011x service/clear

Every lower-layer error type converts into `Reject` exactly here; nothing
below this module knows about wire status codes.

ACK payload: `acked_seq:u16, cmd_id:u16, status:u8, detail:u16, data...`.
ACKs for OPEN_SESSION, START_RUN and STOP_RUN use the reliable notification
path.
*/

mod config;
mod pid;
mod relay;
mod session_ctrl;

use std::sync::Arc;

use log::{debug, trace};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::fieldbus::BusError;
use crate::hal::{Clock, Transport};
use crate::machine::{Machine, MachineError};
use crate::poller::PidPoller;
use crate::safety::{GateError, GateId, SafetyGates};
use crate::session::{Session, SessionError};
use crate::wire::{self, FrameSeq, MsgType};

/// Wire command identifiers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum CmdId {
    SetRelay = 0x0001,
    SetRelayMask = 0x0002,
    SetSv = 0x0020,
    SetMode = 0x0021,
    ForceRefresh = 0x0022,
    ReadRegisters = 0x0030,
    WriteRegister = 0x0031,
    SetIdleTimeout = 0x0040,
    GetIdleTimeout = 0x0041,
    GetCapabilities = 0x0070,
    SetCapability = 0x0071,
    GetSafetyGates = 0x0072,
    SetSafetyGate = 0x0073,
    OpenSession = 0x0100,
    Keepalive = 0x0101,
    StartRun = 0x0102,
    StopRun = 0x0103,
    PauseRun = 0x0104,
    ResumeRun = 0x0105,
    EnableService = 0x0110,
    DisableService = 0x0111,
    ClearEstop = 0x0112,
    ClearFault = 0x0113,
}

/// ACK status byte.
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum AckStatus {
    Ok = 0,
    RejectedPolicy = 1,
    InvalidArgs = 2,
    Busy = 3,
    HwFault = 4,
    NotReady = 5,
    TimeoutDownstream = 6,
}

/// ACK detail subcodes.
pub const DETAIL_NONE: u16 = 0x0000;
pub const DETAIL_SESSION_INVALID: u16 = 0x0001;
pub const DETAIL_INTERLOCK_OPEN: u16 = 0x0002;
pub const DETAIL_ESTOP: u16 = 0x0003;
pub const DETAIL_CONTROLLER_OFFLINE: u16 = 0x0004;
pub const DETAIL_OUT_OF_RANGE: u16 = 0x0005;

/// A command rejection, carrying exactly what the ACK will say.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Reject {
    pub status: AckStatus,
    pub detail: u16,
}

impl Reject {
    pub const fn new(status: AckStatus, detail: u16) -> Self {
        Self { status, detail }
    }

    pub const fn invalid_args(detail: u16) -> Self {
        Self::new(AckStatus::InvalidArgs, detail)
    }

    pub const fn policy(detail: u16) -> Self {
        Self::new(AckStatus::RejectedPolicy, detail)
    }
}

/// Handler result: ACK data bytes on success.
pub type CmdResult = Result<Vec<u8>, Reject>;

impl From<MachineError> for Reject {
    fn from(err: MachineError) -> Self {
        match err {
            MachineError::Busy(_) => Reject::new(AckStatus::Busy, DETAIL_NONE),
            MachineError::GateBlocked(GateId::Estop) => Reject::policy(DETAIL_ESTOP),
            MachineError::GateBlocked(_) => Reject::policy(DETAIL_INTERLOCK_OPEN),
            MachineError::WrongState(_) => Reject::policy(DETAIL_NONE),
            MachineError::EstopActive => Reject::new(AckStatus::NotReady, DETAIL_ESTOP),
            MachineError::DoorOpen => Reject::new(AckStatus::NotReady, DETAIL_INTERLOCK_OPEN),
            MachineError::FaultNotResolved(cause) => {
                let detail = match cause {
                    crate::machine::FaultCause::DoorOpen => DETAIL_INTERLOCK_OPEN,
                    crate::machine::FaultCause::Pid(_) => DETAIL_CONTROLLER_OFFLINE,
                };
                Reject::new(AckStatus::NotReady, detail)
            }
            MachineError::RelayPolicy => Reject::policy(DETAIL_INTERLOCK_OPEN),
            MachineError::InvalidChannel | MachineError::InvalidRelayState => {
                Reject::invalid_args(DETAIL_OUT_OF_RANGE)
            }
        }
    }
}

impl From<BusError> for Reject {
    fn from(err: BusError) -> Self {
        match err {
            BusError::VerifyMismatch { .. } => Reject::new(AckStatus::HwFault, DETAIL_NONE),
            BusError::InvalidAddr(_) | BusError::InvalidReg => {
                Reject::invalid_args(DETAIL_OUT_OF_RANGE)
            }
            // Timeouts, CRC noise, exceptions, a congested line: the
            // controller did not deliver.
            _ => Reject::new(AckStatus::TimeoutDownstream, DETAIL_CONTROLLER_OFFLINE),
        }
    }
}

impl From<SessionError> for Reject {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::InvalidSession => Reject::policy(DETAIL_SESSION_INVALID),
            SessionError::Entropy => Reject::new(AckStatus::HwFault, DETAIL_NONE),
        }
    }
}

impl From<GateError> for Reject {
    fn from(_err: GateError) -> Self {
        // Pinned E-stop capability/gate: the argument itself is invalid.
        Reject::invalid_args(DETAIL_NONE)
    }
}

/// Little-endian cursor over a command body. Running short anywhere is an
/// INVALID_ARGS rejection.
pub(crate) struct BodyReader<'a> {
    body: &'a [u8],
    at: usize,
}

impl<'a> BodyReader<'a> {
    pub fn new(body: &'a [u8]) -> Self {
        Self { body, at: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Reject> {
        if self.at + n > self.body.len() {
            return Err(Reject::invalid_args(DETAIL_NONE));
        }
        let slice = &self.body[self.at..self.at + n];
        self.at += n;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8, Reject> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, Reject> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn i16(&mut self) -> Result<i16, Reject> {
        Ok(self.u16()? as i16)
    }

    pub fn u32(&mut self) -> Result<u32, Reject> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

/// The command dispatcher. Event-driven: the transport calls
/// `handle_frame` for every inbound frame.
pub struct Dispatcher {
    pub(crate) session: Arc<Session>,
    pub(crate) machine: Arc<Machine>,
    pub(crate) poller: Arc<PidPoller>,
    pub(crate) gates: Arc<SafetyGates>,
    transport: Arc<dyn Transport>,
    seq: Arc<FrameSeq>,
    clock: Arc<dyn Clock>,
}

impl Dispatcher {
    pub fn new(
        session: Arc<Session>,
        machine: Arc<Machine>,
        poller: Arc<PidPoller>,
        gates: Arc<SafetyGates>,
        transport: Arc<dyn Transport>,
        seq: Arc<FrameSeq>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            session,
            machine,
            poller,
            gates,
            transport,
            seq,
            clock,
        }
    }

    /// Process one inbound frame; sends the ACK (if any) before returning.
    pub fn handle_frame(&self, bytes: &[u8]) {
        let (header, payload) = match wire::parse(bytes) {
            Ok(parsed) => parsed,
            Err(err) => {
                debug!("dispatch: dropping unparseable frame: {err}");
                return;
            }
        };
        if header.typed() != Some(MsgType::Command) {
            return;
        }
        if payload.len() < 4 {
            // Too short to name a command; nothing to ACK.
            debug!("dispatch: dropping command frame with {}-byte payload", payload.len());
            return;
        }
        let cmd_raw = u16::from_le_bytes([payload[0], payload[1]]);
        // payload[2..4] is the reserved flags word.
        let body = &payload[4..];
        let now = self.clock.now();

        let cmd = CmdId::try_from(cmd_raw).ok();
        if cmd != Some(CmdId::Keepalive) {
            // Any command but KEEPALIVE counts as operator activity.
            self.poller.touch_activity(now);
        }

        let result = match cmd {
            None => {
                debug!("dispatch: unknown command {cmd_raw:#06x}");
                Err(Reject::invalid_args(DETAIL_NONE))
            }
            Some(cmd) => self.route(cmd, body, now),
        };

        let (status, detail, data) = match result {
            Ok(data) => (AckStatus::Ok, DETAIL_NONE, data),
            Err(reject) => (reject.status, reject.detail, Vec::new()),
        };
        trace!("dispatch: cmd {cmd_raw:#06x} -> {status:?} detail {detail:#06x}");

        let ack = ack_payload(header.seq, cmd_raw, status, detail, &data);
        let reliable = matches!(
            cmd,
            Some(CmdId::OpenSession) | Some(CmdId::StartRun) | Some(CmdId::StopRun)
        );
        match wire::build(MsgType::Ack, self.seq.next(), &ack) {
            Ok(frame) => self.transport.send_event(&frame, reliable),
            Err(err) => debug!("dispatch: ACK build failed: {err}"),
        }
    }

    fn route(&self, cmd: CmdId, body: &[u8], now: crate::hal::Instant) -> CmdResult {
        let mut body = BodyReader::new(body);
        match cmd {
            CmdId::SetRelay => relay::set_relay(self, &mut body),
            CmdId::SetRelayMask => relay::set_relay_mask(self, &mut body),
            CmdId::SetSv => pid::set_sv(self, &mut body),
            CmdId::SetMode => pid::set_mode(self, &mut body),
            CmdId::ForceRefresh => pid::force_refresh(self, &mut body, now),
            CmdId::ReadRegisters => pid::read_registers(self, &mut body),
            CmdId::WriteRegister => pid::write_register(self, &mut body),
            CmdId::SetIdleTimeout => config::set_idle_timeout(self, &mut body, now),
            CmdId::GetIdleTimeout => config::get_idle_timeout(self),
            CmdId::GetCapabilities => config::get_capabilities(self),
            CmdId::SetCapability => config::set_capability(self, &mut body),
            CmdId::GetSafetyGates => config::get_safety_gates(self),
            CmdId::SetSafetyGate => config::set_safety_gate(self, &mut body),
            CmdId::OpenSession => session_ctrl::open_session(self, &mut body, now),
            CmdId::Keepalive => session_ctrl::keepalive(self, &mut body, now),
            CmdId::StartRun => session_ctrl::start_run(self, &mut body, now),
            CmdId::StopRun => session_ctrl::stop_run(self, &mut body, now),
            CmdId::PauseRun => session_ctrl::pause_run(self, &mut body, now),
            CmdId::ResumeRun => session_ctrl::resume_run(self, &mut body, now),
            CmdId::EnableService => session_ctrl::enable_service(self, &mut body, now),
            CmdId::DisableService => session_ctrl::disable_service(self, &mut body, now),
            CmdId::ClearEstop => session_ctrl::clear_estop(self, &mut body, now),
            CmdId::ClearFault => session_ctrl::clear_fault(self, &mut body, now),
        }
    }

    /// Gate for commands whose body carries a session id.
    pub(crate) fn require_session(&self, id: u32) -> Result<(), Reject> {
        if self.session.validate(id) {
            Ok(())
        } else {
            Err(Reject::policy(DETAIL_SESSION_INVALID))
        }
    }
}

fn ack_payload(acked_seq: u16, cmd_id: u16, status: AckStatus, detail: u16, data: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(7 + data.len());
    payload.extend_from_slice(&acked_seq.to_le_bytes());
    payload.extend_from_slice(&cmd_id.to_le_bytes());
    payload.push(status.into());
    payload.extend_from_slice(&detail.to_le_bytes());
    payload.extend_from_slice(data);
    payload
}

/// Decoded ACK payload, shared by tests and the simulator binary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AckView {
    pub acked_seq: u16,
    pub cmd_id: u16,
    pub status: u8,
    pub detail: u16,
    pub data: Vec<u8>,
}

impl AckView {
    pub fn decode(payload: &[u8]) -> Option<Self> {
        if payload.len() < 7 {
            return None;
        }
        Some(Self {
            acked_seq: u16::from_le_bytes([payload[0], payload[1]]),
            cmd_id: u16::from_le_bytes([payload[2], payload[3]]),
            status: payload[4],
            detail: u16::from_le_bytes([payload[5], payload[6]]),
            data: payload[7..].to_vec(),
        })
    }
}
