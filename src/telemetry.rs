/*!
Telemetry producer: one TELEMETRY frame every 100 ms.

Each tick, in order: drive the session expiry sweep, recompute the alarm
word, assemble the payload from the component mirrors, and send it if the
transport has a subscriber. The computation always runs so the alarm word
stays current while nobody is listening.

Payload layout (little-endian):

```text
timestamp_ms:u32  di_bits:u16  ro_bits:u16  alarm_bits:u32
controller_count:u8
per controller: { id:u8 pv_x10:i16 sv_x10:i16 op_x10:u16 mode:u8 age_ms:u16 }
extended run state: 16 bytes, see `EXT_STATE_LEN`
```

The extended block is exactly 16 bytes and every byte is written. Partial
serialization of this block is how a telemetry consumer ends up decoding
garbage run state, so `run_state_ext` returns a fixed array by construction.

The machine contributes the run portion and the poller the idle-poll flags;
the two are combined behind `RunStateProvider` by the control unit so this
module never reaches into the machine directly.
*/

use std::sync::{Arc, Mutex};

use bitflags::bitflags;
use log::debug;

use crate::hal::{Instant, Transport, lock};
use crate::poller::{ControllerState, PidPoller};
use crate::safety::{GateInputs, SafetyGates};
use crate::session::{Session, SessionState};
use crate::wire::{self, FrameSeq, MsgType};

/// Telemetry period.
pub const TELEMETRY_INTERVAL_MS: u64 = 100;

/// Extended run-state block length; all 16 bytes are always written.
pub const EXT_STATE_LEN: usize = 16;

/// An Online controller reporting PV at or above this raises the over-temp
/// alarm bit (x10 units: 60.0 C, well above any legitimate jar-heater
/// setpoint).
pub const OVER_TEMP_X10: i16 = 600;

bitflags! {
    /// Published alarm word. Real-time state, not latched.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct AlarmBits: u32 {
        const ESTOP = 1 << 0;
        const DOOR_OPEN = 1 << 1;
        const OVER_TEMP = 1 << 2;
        const FIELD_BUS = 1 << 3;
        const POWER = 1 << 4;
        const HMI_STALE = 1 << 5;
        const PID1_FAULT = 1 << 6;
        const PID2_FAULT = 1 << 7;
        const PID3_FAULT = 1 << 8;
        const GATE_DOOR_BYPASSED = 1 << 9;
        const GATE_HMI_BYPASSED = 1 << 10;
        const GATE_PID_BYPASSED = 1 << 11;
        const PID1_PROBE_ERR = 1 << 12;
        const PID2_PROBE_ERR = 1 << 13;
        const PID3_PROBE_ERR = 1 << 14;
    }
}

/// Single-method seam for the 16-byte extended run state (machine + poller
/// numbers, combined by the control unit).
pub trait RunStateProvider: Send + Sync {
    fn run_state_ext(&self, now: Instant) -> [u8; EXT_STATE_LEN];
}

/// Read-only mirrors sampled by the telemetry tick: the last DI snapshot
/// (from the machine tick), the relay byte, and the gate-input view.
pub trait MirrorView: Send + Sync {
    fn di_bits(&self) -> u8;
    fn ro_bits(&self) -> u8;
    fn gate_inputs(&self) -> GateInputs;
}

/// The telemetry producer.
pub struct TelemetryProducer {
    session: Arc<Session>,
    poller: Arc<PidPoller>,
    gates: Arc<SafetyGates>,
    mirrors: Arc<dyn MirrorView>,
    run_state: Arc<dyn RunStateProvider>,
    transport: Arc<dyn Transport>,
    seq: Arc<FrameSeq>,
    alarm: Mutex<AlarmBits>,
}

impl TelemetryProducer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: Arc<Session>,
        poller: Arc<PidPoller>,
        gates: Arc<SafetyGates>,
        mirrors: Arc<dyn MirrorView>,
        run_state: Arc<dyn RunStateProvider>,
        transport: Arc<dyn Transport>,
        seq: Arc<FrameSeq>,
    ) -> Self {
        Self {
            session,
            poller,
            gates,
            mirrors,
            run_state,
            transport,
            seq,
            alarm: Mutex::new(AlarmBits::empty()),
        }
    }

    /// One 100 ms telemetry tick.
    pub fn tick(&self, now: Instant) {
        // 1. Session expiry rides on this tick.
        self.session.tick(now);

        // 2. Alarm word.
        let alarm = self.compute_alarms();
        *lock(&self.alarm) = alarm;

        // 3-5. Assemble and send, but only when someone is listening.
        if !self.transport.subscribed() {
            return;
        }
        let payload = self.build_payload(now, alarm);
        match wire::build(MsgType::Telemetry, self.seq.next(), &payload) {
            Ok(frame) => self.transport.send_telemetry(&frame),
            Err(err) => debug!("telemetry: frame build failed: {err}"),
        }
    }

    /// Current alarm word, as of the last tick.
    pub fn alarm_bits(&self) -> u32 {
        lock(&self.alarm).bits()
    }

    fn compute_alarms(&self) -> AlarmBits {
        let inputs = self.mirrors.gate_inputs();
        let records = self.poller.records();
        let mut alarm = AlarmBits::empty();

        if inputs.di.estop_pressed() {
            alarm |= AlarmBits::ESTOP;
        }
        if !inputs.di.door_closed() {
            alarm |= AlarmBits::DOOR_OPEN;
        }
        if self.session.state() == SessionState::Stale {
            alarm |= AlarmBits::HMI_STALE;
        }

        let pid_fault = [
            AlarmBits::PID1_FAULT,
            AlarmBits::PID2_FAULT,
            AlarmBits::PID3_FAULT,
        ];
        for (rec, fault_bit) in records.iter().zip(pid_fault) {
            if rec.state != ControllerState::Online {
                alarm |= fault_bit;
            }
            if rec.state == ControllerState::Online && rec.pv_x10 >= OVER_TEMP_X10 {
                alarm |= AlarmBits::OVER_TEMP;
            }
        }
        // The bus itself is considered dead only when every controller is.
        if records
            .iter()
            .all(|rec| rec.state == ControllerState::Offline)
        {
            alarm |= AlarmBits::FIELD_BUS;
        }

        let probe_bits = [
            AlarmBits::PID1_PROBE_ERR,
            AlarmBits::PID2_PROBE_ERR,
            AlarmBits::PID3_PROBE_ERR,
        ];
        for (flag, bit) in self.gates.probe_error_flags(&inputs).into_iter().zip(probe_bits) {
            if flag {
                alarm |= bit;
            }
        }

        if self.gates.door_bypassed() {
            alarm |= AlarmBits::GATE_DOOR_BYPASSED;
        }
        if self.gates.hmi_bypassed() {
            alarm |= AlarmBits::GATE_HMI_BYPASSED;
        }
        if self.gates.any_pid_bypassed() {
            alarm |= AlarmBits::GATE_PID_BYPASSED;
        }
        alarm
    }

    fn build_payload(&self, now: Instant, alarm: AlarmBits) -> Vec<u8> {
        let records = self.poller.records();
        let mut payload = Vec::with_capacity(13 + records.len() * 10 + EXT_STATE_LEN);

        payload.extend_from_slice(&(now.as_millis() as u32).to_le_bytes());
        payload.extend_from_slice(&(self.mirrors.di_bits() as u16).to_le_bytes());
        payload.extend_from_slice(&(self.mirrors.ro_bits() as u16).to_le_bytes());
        payload.extend_from_slice(&alarm.bits().to_le_bytes());
        payload.push(records.len() as u8);

        for rec in records.iter() {
            payload.push(rec.addr);
            payload.extend_from_slice(&rec.pv_x10.to_le_bytes());
            payload.extend_from_slice(&rec.sv_x10.to_le_bytes());
            payload.extend_from_slice(&rec.output_x10.to_le_bytes());
            payload.push(rec.mode);
            payload.extend_from_slice(&rec.age_ms_clamped(now).to_le_bytes());
        }

        payload.extend_from_slice(&self.run_state.run_state_ext(now));
        payload
    }
}

/// Decoded telemetry payload, shared by tests and the simulator binary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TelemetryView {
    pub timestamp_ms: u32,
    pub di_bits: u16,
    pub ro_bits: u16,
    pub alarm_bits: u32,
    pub controllers: Vec<ControllerEntry>,
    pub machine_state: u8,
    pub run_elapsed_ms: u32,
    pub run_remaining_ms: u32,
    pub target_temp_x10: i16,
    pub recipe_step: u8,
    pub interlock_bits: u8,
    pub lazy_poll_active: u8,
    pub idle_timeout_min: u8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerEntry {
    pub id: u8,
    pub pv_x10: i16,
    pub sv_x10: i16,
    pub op_x10: u16,
    pub mode: u8,
    pub age_ms: u16,
}

impl TelemetryView {
    /// Decode a telemetry payload. Returns `None` on any length mismatch.
    pub fn decode(payload: &[u8]) -> Option<Self> {
        if payload.len() < 13 {
            return None;
        }
        let le16 = |at: usize| u16::from_le_bytes([payload[at], payload[at + 1]]);
        let le32 = |at: usize| {
            u32::from_le_bytes([
                payload[at],
                payload[at + 1],
                payload[at + 2],
                payload[at + 3],
            ])
        };

        let count = payload[12] as usize;
        let ext_at = 13 + count * 10;
        if payload.len() < ext_at + EXT_STATE_LEN {
            return None;
        }

        let mut controllers = Vec::with_capacity(count);
        for i in 0..count {
            let at = 13 + i * 10;
            controllers.push(ControllerEntry {
                id: payload[at],
                pv_x10: le16(at + 1) as i16,
                sv_x10: le16(at + 3) as i16,
                op_x10: le16(at + 5),
                mode: payload[at + 7],
                age_ms: le16(at + 8),
            });
        }

        let ext = &payload[ext_at..ext_at + EXT_STATE_LEN];
        Some(Self {
            timestamp_ms: le32(0),
            di_bits: le16(4),
            ro_bits: le16(6),
            alarm_bits: le32(8),
            controllers,
            machine_state: ext[0],
            run_elapsed_ms: u32::from_le_bytes([ext[1], ext[2], ext[3], ext[4]]),
            run_remaining_ms: u32::from_le_bytes([ext[5], ext[6], ext[7], ext[8]]),
            target_temp_x10: u16::from_le_bytes([ext[9], ext[10]]) as i16,
            recipe_step: ext[11],
            interlock_bits: ext[12],
            lazy_poll_active: ext[13],
            idle_timeout_min: ext[14],
        })
    }
}
