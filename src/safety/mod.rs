/*!
Safety gate framework.

Two layers decide whether a run may start or continue:
- capability levels (`capability`): persistent, per-subsystem declarations
  of what hardware is fitted and whether its faults matter;
- gates (`gates`): runtime boolean preconditions, each individually
  bypassable until the next restart.

This module owns both: the in-memory capability mirror (loaded from the
key/value store at construction, written through on mutation) and the gate
enable mask (runtime-only, reset to all-enabled at every boot). Evaluation
is pure over a `GateInputs` snapshot the caller assembles, so the machine
tick and the command dispatcher see identical semantics.

Pinned rules: DI_ESTOP capability is Required forever; the ESTOP gate can
never be disabled and is evaluated even if the mask somehow said otherwise.
*/

pub mod capability;
pub mod gates;

pub use capability::{ALL_SUBSYSTEMS, CapabilityLevel, Subsystem};
pub use gates::{ALL_GATES, GateId, GateInputs, GateMask, PidGateView, gate_passes, probe_ok};

use std::sync::{Arc, Mutex};

use log::{info, warn};
use thiserror::Error;

use crate::hal::{KvStore, lock};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GateError {
    #[error("the E-stop capability level is pinned to Required")]
    PinnedCapability,
    #[error("the E-stop gate cannot be bypassed")]
    PinnedGate,
}

struct SafetyInner {
    /// Indexed by `Subsystem as usize`.
    levels: [CapabilityLevel; 7],
    enabled: GateMask,
}

/// The safety-gate component.
pub struct SafetyGates {
    kv: Arc<dyn KvStore>,
    inner: Mutex<SafetyInner>,
}

impl SafetyGates {
    /// Load capability levels from storage; gate bypasses always boot
    /// enabled.
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        let mut levels = [CapabilityLevel::NotPresent; 7];
        for subsys in ALL_SUBSYSTEMS {
            let level = match subsys.kv_key() {
                None => subsys.default_level(),
                Some(key) => kv
                    .read(capability::KV_NS, key)
                    .and_then(|v| v.first().copied())
                    .and_then(|b| CapabilityLevel::try_from(b).ok())
                    .unwrap_or_else(|| subsys.default_level()),
            };
            levels[u8::from(subsys) as usize] = level;
        }
        info!("safety: capability levels {levels:?}");
        Self {
            kv,
            inner: Mutex::new(SafetyInner {
                levels,
                enabled: GateMask::all_enabled(),
            }),
        }
    }

    // -------------- Capability levels --------------

    pub fn capability(&self, subsys: Subsystem) -> CapabilityLevel {
        lock(&self.inner).levels[u8::from(subsys) as usize]
    }

    /// Persist and apply a capability change. The E-stop level is pinned.
    pub fn set_capability(
        &self,
        subsys: Subsystem,
        level: CapabilityLevel,
    ) -> Result<(), GateError> {
        let key = subsys.kv_key().ok_or(GateError::PinnedCapability)?;
        self.kv.write(capability::KV_NS, key, &[level.into()]);
        lock(&self.inner).levels[u8::from(subsys) as usize] = level;
        info!("safety: capability {subsys:?} set to {level:?}");
        Ok(())
    }

    /// Wire capability vector: one level byte per subsystem id, last byte
    /// reserved.
    pub fn capabilities_vector(&self) -> [u8; 8] {
        let inner = lock(&self.inner);
        let mut out = [0u8; 8];
        for (i, level) in inner.levels.iter().enumerate() {
            out[i] = (*level).into();
        }
        out
    }

    // -------------- Gate bypass --------------

    /// Enable or bypass a gate (runtime only). The ESTOP gate is pinned.
    pub fn set_gate(&self, gate: GateId, enabled: bool) -> Result<(), GateError> {
        if gate == GateId::Estop && !enabled {
            return Err(GateError::PinnedGate);
        }
        let mut inner = lock(&self.inner);
        inner.enabled.set(GateMask::of(gate), enabled);
        drop(inner);
        if enabled {
            info!("safety: gate {gate:?} enabled");
        } else {
            warn!("safety: gate {gate:?} BYPASSED until restart");
        }
        Ok(())
    }

    pub fn enable_mask(&self) -> u16 {
        lock(&self.inner).enabled.bits()
    }

    pub fn gate_enabled(&self, gate: GateId) -> bool {
        lock(&self.inner).enabled.contains(GateMask::of(gate))
    }

    /// Bypass summary for the alarm word, by gate category.
    pub fn door_bypassed(&self) -> bool {
        !self.gate_enabled(GateId::DoorClosed)
    }

    pub fn hmi_bypassed(&self) -> bool {
        !self.gate_enabled(GateId::HmiLive)
    }

    pub fn any_pid_bypassed(&self) -> bool {
        let inner = lock(&self.inner);
        let pid_gates = GateMask::PID1_ONLINE
            | GateMask::PID1_NO_PROBE_ERR
            | GateMask::PID2_ONLINE
            | GateMask::PID2_NO_PROBE_ERR
            | GateMask::PID3_ONLINE
            | GateMask::PID3_NO_PROBE_ERR;
        !inner.enabled.contains(pid_gates)
    }

    // -------------- Evaluation --------------

    /// Status mask: a gate's bit is 1 unless its condition actively blocks.
    /// Bypassed gates and gates of NotPresent subsystems read 1.
    pub fn status_mask(&self, inputs: &GateInputs) -> u16 {
        let inner = lock(&self.inner);
        let mut status = GateMask::empty();
        for gate in ALL_GATES {
            let bypassed = !inner.enabled.contains(GateMask::of(gate)) && gate != GateId::Estop;
            let not_present = gate
                .subsystem()
                .is_some_and(|s| inner.levels[u8::from(s) as usize] == CapabilityLevel::NotPresent);
            if gate_passes(gate, inputs) || bypassed || not_present {
                status |= GateMask::of(gate);
            }
        }
        status.bits()
    }

    /// The run-start decision: the first blocking gate, in fixed priority
    /// order, or `None` when a run may start.
    pub fn can_start_run(&self, inputs: &GateInputs) -> Option<GateId> {
        if self.estop_blocks(inputs) {
            return Some(GateId::Estop);
        }
        if self.door_blocks(inputs) {
            return Some(GateId::DoorClosed);
        }
        if self.hmi_blocks(inputs) {
            return Some(GateId::HmiLive);
        }
        self.required_pid_block(inputs)
    }

    /// E-stop is evaluated regardless of the enable mask.
    pub fn estop_blocks(&self, inputs: &GateInputs) -> bool {
        !gate_passes(GateId::Estop, inputs)
    }

    /// Door blocks only when fitted (capability not NotPresent) and not
    /// bypassed.
    pub fn door_blocks(&self, inputs: &GateInputs) -> bool {
        self.capability(Subsystem::DiDoor) != CapabilityLevel::NotPresent
            && self.gate_enabled(GateId::DoorClosed)
            && !gate_passes(GateId::DoorClosed, inputs)
    }

    pub fn hmi_blocks(&self, inputs: &GateInputs) -> bool {
        self.gate_enabled(GateId::HmiLive) && !gate_passes(GateId::HmiLive, inputs)
    }

    /// First Required-capability PID whose online or probe gate blocks.
    /// This is the during-run filter: Optional and NotPresent controllers
    /// never abort a cycle.
    pub fn required_pid_block(&self, inputs: &GateInputs) -> Option<GateId> {
        const PID_GATES: [(Subsystem, GateId, GateId); 3] = [
            (Subsystem::Pid1, GateId::Pid1Online, GateId::Pid1NoProbeErr),
            (Subsystem::Pid2, GateId::Pid2Online, GateId::Pid2NoProbeErr),
            (Subsystem::Pid3, GateId::Pid3Online, GateId::Pid3NoProbeErr),
        ];
        for (subsys, online, probe) in PID_GATES {
            if self.capability(subsys) != CapabilityLevel::Required {
                continue;
            }
            if self.gate_enabled(online) && !gate_passes(online, inputs) {
                return Some(online);
            }
            if self.gate_enabled(probe) && !gate_passes(probe, inputs) {
                return Some(probe);
            }
        }
        None
    }

    /// Probe-error flags for the alarm word, independent of capability.
    pub fn probe_error_flags(&self, inputs: &GateInputs) -> [bool; 3] {
        [
            !probe_ok(1, inputs.pids[0].pv_x10),
            !probe_ok(2, inputs.pids[1].pv_x10),
            !probe_ok(3, inputs.pids[2].pv_x10),
        ]
    }
}
