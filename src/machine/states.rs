/*!
Machine states and transition metadata.

State values are wire-visible (telemetry `machine_state` byte) and must not
be renumbered.
*/

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::events::Severity;
use crate::safety::GateId;

/// Top-level machine state.
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum MachineState {
    Idle = 0,
    Precool = 1,
    Running = 2,
    Stopping = 3,
    EStop = 4,
    Fault = 5,
    Service = 6,
    Paused = 7,
}

impl MachineState {
    /// States in which a run context exists.
    #[inline]
    pub fn in_run(self) -> bool {
        matches!(
            self,
            MachineState::Precool
                | MachineState::Running
                | MachineState::Paused
                | MachineState::Stopping
        )
    }

    /// Severity of the STATE_CHANGED event announcing arrival here.
    pub fn entry_severity(self) -> Severity {
        match self {
            MachineState::EStop => Severity::Critical,
            MachineState::Fault => Severity::Alarm,
            MachineState::Stopping => Severity::Warn,
            _ => Severity::Info,
        }
    }
}

/// Why the machine latched FAULT. Clearing requires the cause's condition
/// to be gone, not just the operator's say-so.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FaultCause {
    DoorOpen,
    /// A Required controller's online or probe gate blocked mid-run.
    Pid(GateId),
}

impl FaultCause {
    /// One-byte code carried in fault event payloads.
    pub fn code(self) -> u8 {
        match self {
            FaultCause::DoorOpen => 1,
            FaultCause::Pid(gate) => 0x10 | u8::from(gate),
        }
    }
}
