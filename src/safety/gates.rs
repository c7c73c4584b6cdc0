/*!
Safety gates: the boolean preconditions for starting or continuing a run.

Each gate is a pure predicate over the current inputs. A gate can be
bypassed (its enable bit cleared) by the operator for commissioning work;
bypass state is runtime-only and resets to enabled at every boot. The
E-stop gate can never be bypassed and is evaluated regardless of its enable
bit.

Probe-error window: a PV at or beyond +500.0 C is a broken or shorted
sensor on any controller; a PV at or below -300.0 C is physically
impossible everywhere except the cryo chamber sensor (controller 1), which
legitimately reads deep negative values.
*/

use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::machine::inputs::DiSnapshot;

use super::capability::Subsystem;

/// Gate identifiers, also the bit positions in the gate masks.
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum GateId {
    Estop = 0,
    DoorClosed = 1,
    HmiLive = 2,
    Pid1Online = 3,
    Pid1NoProbeErr = 4,
    Pid2Online = 5,
    Pid2NoProbeErr = 6,
    Pid3Online = 7,
    Pid3NoProbeErr = 8,
}

pub const ALL_GATES: [GateId; 9] = [
    GateId::Estop,
    GateId::DoorClosed,
    GateId::HmiLive,
    GateId::Pid1Online,
    GateId::Pid1NoProbeErr,
    GateId::Pid2Online,
    GateId::Pid2NoProbeErr,
    GateId::Pid3Online,
    GateId::Pid3NoProbeErr,
];

bitflags! {
    /// One bit per gate; used for both the enable mask and the status mask.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct GateMask: u16 {
        const ESTOP = 1 << 0;
        const DOOR_CLOSED = 1 << 1;
        const HMI_LIVE = 1 << 2;
        const PID1_ONLINE = 1 << 3;
        const PID1_NO_PROBE_ERR = 1 << 4;
        const PID2_ONLINE = 1 << 5;
        const PID2_NO_PROBE_ERR = 1 << 6;
        const PID3_ONLINE = 1 << 7;
        const PID3_NO_PROBE_ERR = 1 << 8;
    }
}

impl GateMask {
    pub fn of(gate: GateId) -> GateMask {
        GateMask::from_bits_truncate(1 << u8::from(gate))
    }

    /// Every defined gate enabled; the boot state.
    pub fn all_enabled() -> GateMask {
        GateMask::all()
    }
}

/// PV at or above this is a probe error on every controller (x10 units).
pub const PROBE_ERR_HIGH_X10: i16 = 5000;

/// PV at or below this is a probe error on controllers 2 and 3.
pub const PROBE_ERR_LOW_X10: i16 = -3000;

/// Minimal controller view the predicates need.
#[derive(Copy, Clone, Debug, Default)]
pub struct PidGateView {
    /// Online or Stale; Stale data still counts as linked.
    pub linked: bool,
    pub pv_x10: i16,
}

/// Everything the gate predicates read, sampled at one point in time.
#[derive(Copy, Clone, Debug)]
pub struct GateInputs {
    pub di: DiSnapshot,
    pub session_live: bool,
    /// Indexed by controller number - 1.
    pub pids: [PidGateView; 3],
}

impl GateId {
    /// The subsystem whose capability level governs this gate, if any.
    pub fn subsystem(self) -> Option<Subsystem> {
        match self {
            GateId::Estop => Some(Subsystem::DiEstop),
            GateId::DoorClosed => Some(Subsystem::DiDoor),
            GateId::HmiLive => None,
            GateId::Pid1Online | GateId::Pid1NoProbeErr => Some(Subsystem::Pid1),
            GateId::Pid2Online | GateId::Pid2NoProbeErr => Some(Subsystem::Pid2),
            GateId::Pid3Online | GateId::Pid3NoProbeErr => Some(Subsystem::Pid3),
        }
    }

    /// Controller number (1-3) for the PID gates.
    pub fn pid_number(self) -> Option<u8> {
        match self {
            GateId::Pid1Online | GateId::Pid1NoProbeErr => Some(1),
            GateId::Pid2Online | GateId::Pid2NoProbeErr => Some(2),
            GateId::Pid3Online | GateId::Pid3NoProbeErr => Some(3),
            _ => None,
        }
    }
}

/// True when `pv` is inside the physically plausible window for controller
/// `pid_number` (1-3).
pub fn probe_ok(pid_number: u8, pv_x10: i16) -> bool {
    if pv_x10 >= PROBE_ERR_HIGH_X10 {
        return false;
    }
    // The cryo chamber sensor (controller 1) legitimately reads deep
    // negative; the low-side window applies to the heater zones only.
    pid_number == 1 || pv_x10 > PROBE_ERR_LOW_X10
}

/// Pure predicate: does `gate` pass on these inputs?
pub fn gate_passes(gate: GateId, inputs: &GateInputs) -> bool {
    match gate {
        GateId::Estop => !inputs.di.estop_pressed(),
        GateId::DoorClosed => inputs.di.door_closed(),
        GateId::HmiLive => inputs.session_live,
        GateId::Pid1Online => inputs.pids[0].linked,
        GateId::Pid2Online => inputs.pids[1].linked,
        GateId::Pid3Online => inputs.pids[2].linked,
        GateId::Pid1NoProbeErr => probe_ok(1, inputs.pids[0].pv_x10),
        GateId::Pid2NoProbeErr => probe_ok(2, inputs.pids[1].pv_x10),
        GateId::Pid3NoProbeErr => probe_ok(3, inputs.pids[2].pv_x10),
    }
}
