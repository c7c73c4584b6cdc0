/*!
Machine state: the authoritative process sequencer.

One tick every 50 ms: sample the digital inputs, re-evaluate the
interlocks, run the current state's handler, then clamp the relay outputs
to the state's invariants. Commands (start/stop/pause/resume, service mode,
E-stop and fault clearing, manual relay control) arrive from the dispatcher
between ticks and are policy-checked against the same state table.

Output invariants, held at every tick exit (SERVICE is exempt; it exists
for manual actuation):
- E-stop asserted => state E_STOP and power channels 1-5 off.
- MOTOR_START on only in RUNNING.
- MAIN_CONTACTOR on only in PRECOOL / RUNNING / STOPPING.
- DOOR_LOCK on exactly in PRECOOL / RUNNING / STOPPING.

The component owns `machine_state` (lock-order slot 4). While holding it,
it may read the poller cache (slot 3) and write the relay mirror (slot 1).
Events are collected under the lock and emitted after it drops so no lock
is ever held while calling into the transport.

State machine:

```text
IDLE -> PRECOOL -> RUNNING -> STOPPING -> IDLE
          |          |  ^        ^
          |          v  |        |
          +------> PAUSED -------+        any state --> E_STOP
          (door open / required PID lost) --> FAULT
IDLE <-> SERVICE
```
*/

pub mod inputs;
pub mod outputs;
pub mod run;
pub mod states;

pub use inputs::DiSnapshot;
pub use outputs::{RelayBank, RelayBits};
pub use run::{PauseMode, RunContext, RunMode, StopMode};
pub use states::{FaultCause, MachineState};

use std::sync::{Arc, Mutex};

use log::{error, info, warn};
use thiserror::Error;

use crate::events::{Event, EventId, EventSink, EventSource, Severity};
use crate::hal::{DigitalInputs, Instant, lock};
use crate::poller::PidPoller;
use crate::safety::{GateId, GateInputs, PidGateView, SafetyGates, gate_passes};
use crate::session::{Session, SessionState};

/// Machine tick period.
pub const TICK_INTERVAL_MS: u64 = 50;

/// Precool completes when the chamber PV is within this band of target.
pub const PRECOOL_TOLERANCE_X10: i16 = 50;

/// Precool proceeds (with a warning) after this long regardless.
pub const PRECOOL_TIMEOUT_MS: u64 = 5 * 60_000;

/// Dwell in STOPPING before returning to IDLE.
pub const STOPPING_SOAK_MS: u64 = 30_000;

/// The chamber temperature controller (the one precool watches).
pub const CHAMBER_PID_INDEX: usize = 0;

/// Policy rejections from the machine state.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MachineError {
    #[error("a run is already active (state {0:?})")]
    Busy(MachineState),
    #[error("safety gate {0:?} blocks the run")]
    GateBlocked(GateId),
    #[error("command not valid in state {0:?}")]
    WrongState(MachineState),
    #[error("E-stop input is still asserted")]
    EstopActive,
    #[error("door must be closed")]
    DoorOpen,
    #[error("fault condition not resolved")]
    FaultNotResolved(FaultCause),
    #[error("relay change conflicts with the current state")]
    RelayPolicy,
    #[error("relay channel out of range")]
    InvalidChannel,
    #[error("unknown relay state argument")]
    InvalidRelayState,
}

/// Snapshot of the run portion of the extended telemetry state.
#[derive(Copy, Clone, Debug, Default)]
pub struct RunStatus {
    pub state: u8,
    pub elapsed_ms: u32,
    pub remaining_ms: u32,
    pub target_x10: i16,
    pub recipe_step: u8,
}

struct MachineInner {
    state: MachineState,
    run: Option<RunContext>,
    fault: Option<FaultCause>,
    di: DiSnapshot,
    di_available: bool,
    phase_entered: Instant,
    paused_from: Option<MachineState>,
}

/// The machine-state component.
pub struct Machine {
    relays: Arc<RelayBank>,
    di: Arc<dyn DigitalInputs>,
    poller: Arc<PidPoller>,
    session: Arc<Session>,
    gates: Arc<SafetyGates>,
    events: Arc<dyn EventSink>,
    inner: Mutex<MachineInner>,
}

impl Machine {
    pub fn new(
        relays: Arc<RelayBank>,
        di: Arc<dyn DigitalInputs>,
        poller: Arc<PidPoller>,
        session: Arc<Session>,
        gates: Arc<SafetyGates>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            relays,
            di,
            poller,
            session,
            gates,
            events,
            inner: Mutex::new(MachineInner {
                state: MachineState::Idle,
                run: None,
                fault: None,
                di: DiSnapshot::safe_default(),
                di_available: true,
                phase_entered: Instant::ZERO,
                paused_from: None,
            }),
        }
    }

    // -------------- Periodic tick --------------

    /// One 50 ms control tick.
    pub fn tick(&self, now: Instant) {
        let snapshot = DiSnapshot::from_raw(self.di.read());
        let inputs = self.assemble_inputs(snapshot);

        self.with_inner(|this, inner, events| {
            if inner.di_available && !snapshot.expander_available() {
                warn!("machine: input expander unavailable, substituting safe defaults");
            }
            inner.di_available = snapshot.expander_available();
            inner.di = snapshot;

            // The E-stop chain preempts everything.
            if snapshot.estop_pressed() {
                if inner.state != MachineState::EStop {
                    error!("machine: E-STOP asserted in state {:?}", inner.state);
                    this.transition(inner, events, now, MachineState::EStop);
                    events.push(Event::new(
                        EventId::EstopAsserted,
                        Severity::Critical,
                        EventSource::Machine,
                        &[],
                    ));
                }
                this.enforce_invariants(inner);
                return;
            }

            match inner.state {
                MachineState::Idle
                | MachineState::EStop
                | MachineState::Fault
                | MachineState::Service => {}
                MachineState::Precool => this.tick_precool(inner, events, now, &inputs),
                MachineState::Running => this.tick_running(inner, events, now, &inputs),
                MachineState::Paused => this.tick_paused(inner, events, now, &inputs),
                MachineState::Stopping => this.tick_stopping(inner, events, now),
            }

            this.enforce_invariants(inner);
        });
    }

    fn tick_precool(
        &self,
        inner: &mut MachineInner,
        events: &mut Vec<Event>,
        now: Instant,
        inputs: &GateInputs,
    ) {
        if self.gates.door_blocks(inputs) {
            self.fault(inner, events, now, FaultCause::DoorOpen);
            return;
        }
        if let Some(gate) = self.gates.required_pid_block(inputs) {
            self.fault(inner, events, now, FaultCause::Pid(gate));
            return;
        }

        let Some(run) = inner.run else {
            // A run context always exists here; recover to IDLE if not.
            self.transition(inner, events, now, MachineState::Idle);
            return;
        };

        let chamber = inputs.pids[CHAMBER_PID_INDEX];
        let delta = (chamber.pv_x10 as i32 - run.target_x10 as i32).unsigned_abs();
        let reached = run.mode == RunMode::DryRun
            || (chamber.linked && delta <= PRECOOL_TOLERANCE_X10 as u32);
        let timed_out = now.millis_since(inner.phase_entered) > PRECOOL_TIMEOUT_MS;

        if reached || timed_out {
            if timed_out && !reached {
                warn!(
                    "machine: precool timed out after {PRECOOL_TIMEOUT_MS} ms \
                     (chamber at {} x0.1C, target {} x0.1C), proceeding",
                    chamber.pv_x10, run.target_x10
                );
            }
            events.push(Event::new(
                EventId::PrecoolComplete,
                Severity::Info,
                EventSource::Machine,
                &[],
            ));
            if run.mode == RunMode::PrecoolOnly {
                self.transition(inner, events, now, MachineState::Stopping);
                events.push(run_stopped_event(StopMode::Normal));
            } else {
                self.transition(inner, events, now, MachineState::Running);
            }
        }
    }

    fn tick_running(
        &self,
        inner: &mut MachineInner,
        events: &mut Vec<Event>,
        now: Instant,
        inputs: &GateInputs,
    ) {
        if self.gates.door_blocks(inputs) {
            self.fault(inner, events, now, FaultCause::DoorOpen);
            return;
        }
        if let Some(gate) = self.gates.required_pid_block(inputs) {
            self.fault(inner, events, now, FaultCause::Pid(gate));
            return;
        }
        // Operator liveness lost: controlled stop, not a fault.
        if self.gates.hmi_blocks(inputs) {
            warn!("machine: operator session lost, stopping gracefully");
            self.transition(inner, events, now, MachineState::Stopping);
            events.push(run_stopped_event(StopMode::Normal));
            return;
        }
        if inner.run.is_some_and(|run| run.duration_done(now)) {
            info!("machine: run duration complete");
            self.transition(inner, events, now, MachineState::Stopping);
            events.push(run_stopped_event(StopMode::Normal));
        }
    }

    fn tick_paused(
        &self,
        inner: &mut MachineInner,
        events: &mut Vec<Event>,
        now: Instant,
        inputs: &GateInputs,
    ) {
        // The door may legitimately be open while paused; only a Required
        // controller failure aborts from here.
        if let Some(gate) = self.gates.required_pid_block(inputs) {
            self.fault(inner, events, now, FaultCause::Pid(gate));
        }
    }

    fn tick_stopping(&self, inner: &mut MachineInner, events: &mut Vec<Event>, now: Instant) {
        if now.millis_since(inner.phase_entered) >= STOPPING_SOAK_MS {
            info!("machine: stop soak complete");
            self.transition(inner, events, now, MachineState::Idle);
        }
    }

    // -------------- Run commands --------------

    /// START_RUN: IDLE only, all gates must allow.
    pub fn start_run(
        &self,
        now: Instant,
        mode: RunMode,
        target_x10: i16,
        duration_ms: u32,
    ) -> Result<(), MachineError> {
        let inputs = self.assemble_inputs(self.di_snapshot());
        self.with_inner(|this, inner, events| {
            if inner.state != MachineState::Idle {
                return Err(MachineError::Busy(inner.state));
            }
            if let Some(gate) = this.gates.can_start_run(&inputs) {
                return Err(MachineError::GateBlocked(gate));
            }
            info!(
                "machine: starting run mode={mode:?} target={target_x10} x0.1C \
                 duration={duration_ms} ms"
            );
            inner.run = Some(RunContext::new(mode, target_x10, duration_ms, now));
            this.transition(inner, events, now, MachineState::Precool);
            events.push(Event::new(
                EventId::RunStarted,
                Severity::Info,
                EventSource::Machine,
                &[mode.into()],
            ));
            Ok(())
        })
    }

    /// STOP_RUN from any run phase.
    pub fn stop_run(&self, now: Instant, stop_mode: StopMode) -> Result<(), MachineError> {
        self.with_inner(|this, inner, events| {
            if !inner.state.in_run() {
                return Err(MachineError::WrongState(inner.state));
            }
            match stop_mode {
                StopMode::Normal => {
                    if inner.state != MachineState::Stopping {
                        this.transition(inner, events, now, MachineState::Stopping);
                        events.push(run_stopped_event(StopMode::Normal));
                    }
                }
                StopMode::Abort => {
                    warn!("machine: run aborted by operator");
                    this.transition(inner, events, now, MachineState::Idle);
                    events.push(run_stopped_event(StopMode::Abort));
                }
            }
            Ok(())
        })
    }

    /// PAUSE_RUN from PRECOOL or RUNNING.
    pub fn pause(&self, now: Instant, pause_mode: PauseMode) -> Result<(), MachineError> {
        self.with_inner(|this, inner, events| {
            if !matches!(inner.state, MachineState::Precool | MachineState::Running) {
                return Err(MachineError::WrongState(inner.state));
            }
            inner.paused_from = Some(inner.state);
            if let Some(run) = inner.run.as_mut() {
                run.pause_mode = Some(pause_mode);
            }
            this.transition(inner, events, now, MachineState::Paused);
            Ok(())
        })
    }

    /// RESUME_RUN back to the pre-pause state; the door must be closed.
    pub fn resume(&self, now: Instant) -> Result<(), MachineError> {
        let inputs = self.assemble_inputs(self.di_snapshot());
        self.with_inner(|this, inner, events| {
            if inner.state != MachineState::Paused {
                return Err(MachineError::WrongState(inner.state));
            }
            if this.gates.door_blocks(&inputs) {
                return Err(MachineError::DoorOpen);
            }
            let target = inner.paused_from.take().unwrap_or(MachineState::Running);
            this.transition(inner, events, now, target);
            Ok(())
        })
    }

    // -------------- Service / clear commands --------------

    pub fn enable_service(&self, now: Instant) -> Result<(), MachineError> {
        self.with_inner(|this, inner, events| {
            if inner.state != MachineState::Idle {
                return Err(MachineError::WrongState(inner.state));
            }
            this.transition(inner, events, now, MachineState::Service);
            events.push(Event::new(
                EventId::ServiceEntered,
                Severity::Info,
                EventSource::Machine,
                &[],
            ));
            Ok(())
        })
    }

    pub fn disable_service(&self, now: Instant) -> Result<(), MachineError> {
        self.with_inner(|this, inner, events| {
            if inner.state != MachineState::Service {
                return Err(MachineError::WrongState(inner.state));
            }
            // Leaving service turns every output off, light included.
            this.relays.apply(|_| RelayBits::empty());
            this.transition(inner, events, now, MachineState::Idle);
            events.push(Event::new(
                EventId::ServiceExited,
                Severity::Info,
                EventSource::Machine,
                &[],
            ));
            Ok(())
        })
    }

    /// CLEAR_ESTOP: allowed once the chain is released.
    pub fn clear_estop(&self, now: Instant) -> Result<(), MachineError> {
        self.with_inner(|this, inner, events| {
            if inner.state != MachineState::EStop {
                return Err(MachineError::WrongState(inner.state));
            }
            if inner.di.estop_pressed() {
                return Err(MachineError::EstopActive);
            }
            info!("machine: E-stop cleared by operator");
            this.transition(inner, events, now, MachineState::Idle);
            events.push(Event::new(
                EventId::EstopCleared,
                Severity::Info,
                EventSource::Machine,
                &[],
            ));
            Ok(())
        })
    }

    /// CLEAR_FAULT: allowed once the recorded cause's condition is gone.
    pub fn clear_fault(&self, now: Instant) -> Result<(), MachineError> {
        let inputs = self.assemble_inputs(self.di_snapshot());
        self.with_inner(|this, inner, events| {
            if inner.state != MachineState::Fault {
                return Err(MachineError::WrongState(inner.state));
            }
            if let Some(cause) = inner.fault {
                let resolved = match cause {
                    FaultCause::DoorOpen => !this.gates.door_blocks(&inputs),
                    FaultCause::Pid(gate) => gate_passes(gate, &inputs),
                };
                if !resolved {
                    return Err(MachineError::FaultNotResolved(cause));
                }
            }
            info!("machine: fault cleared by operator");
            inner.fault = None;
            this.transition(inner, events, now, MachineState::Idle);
            events.push(Event::new(
                EventId::FaultCleared,
                Severity::Info,
                EventSource::Machine,
                &[],
            ));
            Ok(())
        })
    }

    // -------------- Manual relay control --------------

    /// SET_RELAY: `state` is 0 off, 1 on, 2 toggle. Returns the new output
    /// byte.
    pub fn manual_relay(&self, idx: u8, state: u8) -> Result<u8, MachineError> {
        let channel = RelayBits::from_channel(idx).ok_or(MachineError::InvalidChannel)?;
        self.with_inner(|this, inner, _events| {
            let on = match state {
                0 => false,
                1 => true,
                2 => !this.relays.is_on(channel),
                _ => return Err(MachineError::InvalidRelayState),
            };
            if !relay_change_allowed(inner.state, channel, on) {
                return Err(MachineError::RelayPolicy);
            }
            Ok(this.relays.set(channel, on))
        })
    }

    /// SET_RELAY_MASK: `new = (cur & !mask) | (values & mask)`.
    pub fn manual_relay_mask(&self, mask: u8, values: u8) -> Result<u8, MachineError> {
        self.with_inner(|this, inner, _events| {
            let cur = this.relays.bits();
            let next = (cur & !mask) | (values & mask);
            let changed = cur ^ next;
            for idx in 1..=8u8 {
                let bit = 1 << (idx - 1);
                if changed & bit != 0 {
                    let channel = RelayBits::from_channel(idx).ok_or(MachineError::InvalidChannel)?;
                    if !relay_change_allowed(inner.state, channel, next & bit != 0) {
                        return Err(MachineError::RelayPolicy);
                    }
                }
            }
            Ok(this.relays.set_masked(mask, values))
        })
    }

    // -------------- Views --------------

    pub fn state(&self) -> MachineState {
        lock(&self.inner).state
    }

    pub fn fault_cause(&self) -> Option<FaultCause> {
        lock(&self.inner).fault
    }

    /// Most recent DI sample (from the last tick).
    pub fn di_snapshot(&self) -> DiSnapshot {
        lock(&self.inner).di
    }

    /// Interlock byte for telemetry: bit 0 E-stop, 1 door open, 2 LN2
    /// absent, 3 motor fault (reserved, always 0), 4 HMI stale.
    pub fn interlock_bits(&self) -> u8 {
        let inner = lock(&self.inner);
        let mut bits = 0u8;
        if inner.di.estop_pressed() {
            bits |= 1 << 0;
        }
        if !inner.di.door_closed() {
            bits |= 1 << 1;
        }
        if !inner.di.ln2_present() {
            bits |= 1 << 2;
        }
        if self.session.state() == SessionState::Stale {
            bits |= 1 << 4;
        }
        bits
    }

    /// Run numbers for the extended telemetry state.
    pub fn run_status(&self, now: Instant) -> RunStatus {
        let inner = lock(&self.inner);
        let mut status = RunStatus {
            state: inner.state.into(),
            ..RunStatus::default()
        };
        if let Some(run) = inner.run.as_ref() {
            status.elapsed_ms = run.elapsed_ms(now).min(u32::MAX as u64) as u32;
            status.remaining_ms = run.remaining_ms(now).min(u32::MAX as u64) as u32;
            status.target_x10 = run.target_x10;
            status.recipe_step = run.recipe_step;
        }
        status
    }

    /// Assemble the gate-input snapshot from a DI sample plus the session
    /// and poller mirrors.
    pub fn assemble_inputs(&self, di: DiSnapshot) -> GateInputs {
        let records = self.poller.records();
        let mut pids = [PidGateView::default(); 3];
        for (view, rec) in pids.iter_mut().zip(records.iter()) {
            view.linked = rec.state.is_linked();
            view.pv_x10 = rec.pv_x10;
        }
        GateInputs {
            di,
            session_live: self.session.is_live(),
            pids,
        }
    }

    /// Gate inputs from the last tick's DI sample (dispatcher paths).
    pub fn current_gate_inputs(&self) -> GateInputs {
        self.assemble_inputs(self.di_snapshot())
    }

    // -------------- Internals --------------

    /// Run `f` under the state lock, then emit whatever events it queued.
    fn with_inner<R>(&self, f: impl FnOnce(&Self, &mut MachineInner, &mut Vec<Event>) -> R) -> R {
        let mut events = Vec::new();
        let result = {
            let mut inner = lock(&self.inner);
            f(self, &mut inner, &mut events)
        };
        for event in events {
            self.events.emit(event);
        }
        result
    }

    /// Latch a fault and force the outputs safe.
    fn fault(
        &self,
        inner: &mut MachineInner,
        events: &mut Vec<Event>,
        now: Instant,
        cause: FaultCause,
    ) {
        error!("machine: FAULT in state {:?}: {cause:?}", inner.state);
        inner.fault = Some(cause);
        self.transition(inner, events, now, MachineState::Fault);
        let (id, data) = match cause {
            FaultCause::DoorOpen => (EventId::RunAborted, [cause.code()]),
            FaultCause::Pid(_) => (EventId::FaultRaised, [cause.code()]),
        };
        events.push(Event::new(id, Severity::Alarm, EventSource::Machine, &data));
    }

    /// Commit a state change: entry actions, bookkeeping, STATE_CHANGED.
    fn transition(
        &self,
        inner: &mut MachineInner,
        events: &mut Vec<Event>,
        now: Instant,
        new: MachineState,
    ) {
        let old = inner.state;
        if old == new {
            return;
        }

        // Run-timer bookkeeping around PAUSED.
        if new == MachineState::Paused {
            if let Some(run) = inner.run.as_mut() {
                run.pause(now);
            }
        } else if old == MachineState::Paused {
            if let Some(run) = inner.run.as_mut() {
                run.resume(now);
            }
        }

        self.apply_entry_actions(inner, new);

        inner.state = new;
        inner.phase_entered = now;
        if new == MachineState::Idle {
            inner.run = None;
            inner.paused_from = None;
        }

        info!("machine: {old:?} -> {new:?}");
        events.push(Event::new(
            EventId::StateChanged,
            new.entry_severity(),
            EventSource::Machine,
            &[old.into(), new.into()],
        ));
    }

    /// One-shot output actions on arrival in `new`.
    fn apply_entry_actions(&self, inner: &MachineInner, new: MachineState) {
        match new {
            MachineState::Idle => {
                // Power down, unlock; the chamber light is operator territory.
                self.relays.apply(|mut bits| {
                    bits.remove(RelayBits::POWER | RelayBits::DOOR_LOCK);
                    bits
                });
            }
            MachineState::Precool => {
                let dry = inner
                    .run
                    .as_ref()
                    .is_some_and(|run| run.mode == RunMode::DryRun);
                self.relays.apply(|mut bits| {
                    bits.insert(
                        RelayBits::DOOR_LOCK
                            | RelayBits::HEATER_1
                            | RelayBits::HEATER_2
                            | RelayBits::MAIN_CONTACTOR,
                    );
                    bits.set(RelayBits::LN2_VALVE, !dry);
                    bits.remove(RelayBits::MOTOR_START);
                    bits
                });
            }
            MachineState::Running => {
                // Coming from PRECOOL these bits are already set; coming
                // back from PAUSED this restores the power posture the
                // pause clamp released (contactor, lock, cooling).
                let dry = inner
                    .run
                    .as_ref()
                    .is_some_and(|run| run.mode == RunMode::DryRun);
                self.relays.apply(|mut bits| {
                    bits.insert(
                        RelayBits::MOTOR_START
                            | RelayBits::MAIN_CONTACTOR
                            | RelayBits::DOOR_LOCK,
                    );
                    bits.set(RelayBits::LN2_VALVE, !dry);
                    bits
                });
            }
            MachineState::Stopping => {
                self.relays.apply(|mut bits| {
                    bits.remove(
                        RelayBits::MOTOR_START
                            | RelayBits::HEATER_1
                            | RelayBits::HEATER_2
                            | RelayBits::LN2_VALVE,
                    );
                    // DOOR_LOCK and MAIN_CONTACTOR stay on through the soak.
                    bits
                });
            }
            MachineState::Paused => {
                let stop_cooling = inner
                    .run
                    .as_ref()
                    .and_then(|run| run.pause_mode)
                    .is_some_and(|m| m == PauseMode::StopCooling);
                self.relays.apply(|mut bits| {
                    bits.remove(RelayBits::MOTOR_START | RelayBits::DOOR_LOCK);
                    if stop_cooling {
                        bits.remove(RelayBits::LN2_VALVE);
                    }
                    bits
                });
            }
            MachineState::EStop | MachineState::Fault => {
                self.relays.apply(|mut bits| {
                    bits.remove(RelayBits::POWER | RelayBits::DOOR_LOCK);
                    bits
                });
            }
            MachineState::Service => {
                // No automatic output changes.
            }
        }
    }

    /// Clamp the outputs to the state invariants (every tick, SERVICE
    /// exempt).
    fn enforce_invariants(&self, inner: &MachineInner) {
        let state = inner.state;
        if state == MachineState::Service {
            return;
        }
        self.relays.apply(|mut bits| {
            if state != MachineState::Running {
                bits.remove(RelayBits::MOTOR_START);
            }
            let powered = matches!(
                state,
                MachineState::Precool | MachineState::Running | MachineState::Stopping
            );
            if !powered {
                bits.remove(RelayBits::MAIN_CONTACTOR);
            }
            bits.set(RelayBits::DOOR_LOCK, powered);
            if matches!(state, MachineState::EStop | MachineState::Fault) {
                bits.remove(RelayBits::POWER);
            }
            bits
        });
    }
}

impl crate::telemetry::MirrorView for Machine {
    fn di_bits(&self) -> u8 {
        self.di_snapshot().raw()
    }

    fn ro_bits(&self) -> u8 {
        self.relays.bits()
    }

    fn gate_inputs(&self) -> GateInputs {
        self.current_gate_inputs()
    }
}

fn run_stopped_event(mode: StopMode) -> Event {
    Event::new(
        EventId::RunStopped,
        Severity::Info,
        EventSource::Machine,
        &[mode.into()],
    )
}

/// Policy for manual relay changes outside SERVICE: the state invariants may
/// not be violated by command.
pub(crate) fn relay_change_allowed(state: MachineState, channel: RelayBits, on: bool) -> bool {
    if state == MachineState::Service {
        return true;
    }
    let powered_phase = matches!(
        state,
        MachineState::Precool | MachineState::Running | MachineState::Stopping
    );
    if channel == RelayBits::MOTOR_START {
        !on || state == MachineState::Running
    } else if channel == RelayBits::MAIN_CONTACTOR {
        !on || powered_phase
    } else if channel == RelayBits::DOOR_LOCK {
        // Locked exactly in the powered run phases; manual changes would be
        // undone by the clamp, so reject them outright.
        on == powered_phase
    } else {
        // Heaters, LN2, light, spare: free except in the latched safe
        // states, where nothing may be powered on.
        !on || !matches!(state, MachineState::EStop | MachineState::Fault)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventId;
    use crate::fieldbus::BusMaster;
    use crate::hal::Clock;
    use crate::test_utils::{
        CollectingSink, FakeClock, MemKv, ScriptedInputs, SimFieldBus, SpyRelays,
    };

    struct Fixture {
        clock: Arc<FakeClock>,
        inputs: Arc<ScriptedInputs>,
        relays_hw: Arc<SpyRelays>,
        bus: Arc<SimFieldBus>,
        sink: Arc<CollectingSink>,
        session: Arc<Session>,
        poller: Arc<PidPoller>,
        machine: Machine,
    }

    fn fixture() -> Fixture {
        let clock = FakeClock::new();
        let inputs = ScriptedInputs::new();
        let relays_hw = SpyRelays::new();
        let bus = SimFieldBus::new();
        let sink = CollectingSink::new();
        let kv = MemKv::new();

        let master = Arc::new(BusMaster::new(bus.clone(), clock.clone()));
        let poller = Arc::new(PidPoller::new(master, kv.clone(), sink.clone()));
        let session = Arc::new(Session::new(sink.clone()));
        let gates = Arc::new(SafetyGates::new(kv));
        let relays = Arc::new(RelayBank::new(relays_hw.clone()));
        let machine = Machine::new(
            relays,
            inputs.clone(),
            poller.clone(),
            session.clone(),
            gates,
            sink.clone(),
        );
        Fixture {
            clock,
            inputs,
            relays_hw,
            bus,
            sink,
            session,
            poller,
            machine,
        }
    }

    impl Fixture {
        /// Bring all three simulated controllers Online.
        fn poll_all(&self) {
            for addr in 1..=3 {
                self.poller.force_poll(addr, self.clock.now()).unwrap();
            }
        }

        /// Open a live operator session.
        fn live_session(&self) -> u32 {
            self.session.open(0x1234, self.clock.now()).unwrap().0
        }

        /// One machine tick at the current simulated time.
        fn tick(&self) {
            self.machine.tick(self.clock.now());
        }

        fn tick_after(&self, ms: u64) {
            self.clock.advance(ms);
            self.tick();
        }

        fn ro(&self) -> u8 {
            self.relays_hw.last()
        }

        /// Standard ready posture: session live, controllers polled, one
        /// tick to latch the DI snapshot.
        fn ready(&self) -> u32 {
            let id = self.live_session();
            self.poll_all();
            self.tick();
            id
        }
    }

    const CONTACTOR: u8 = 0x01;
    const MOTOR: u8 = 0x02;
    const HEATERS: u8 = 0x0C;
    const LN2: u8 = 0x10;
    const LOCK: u8 = 0x20;

    #[test]
    fn normal_run_walks_the_full_state_sequence() {
        let f = fixture();
        f.ready();

        f.machine
            .start_run(f.clock.now(), RunMode::Normal, -500, 1000)
            .unwrap();
        assert_eq!(f.machine.state(), MachineState::Precool);
        // Precool posture: lock, LN2, heaters, contactor; motor off.
        assert_eq!(f.ro(), CONTACTOR | HEATERS | LN2 | LOCK);

        // Chamber not yet cold: stays in precool.
        f.tick_after(50);
        assert_eq!(f.machine.state(), MachineState::Precool);

        // Chamber reaches target (within 5.0 C).
        f.bus.set_pv(1, -460);
        f.poll_all();
        f.tick_after(50);
        assert_eq!(f.machine.state(), MachineState::Running);
        assert_eq!(f.ro() & MOTOR, MOTOR);

        // Duration elapses: controlled stop.
        f.tick_after(1100);
        assert_eq!(f.machine.state(), MachineState::Stopping);
        let ro = f.ro();
        assert_eq!(ro & (MOTOR | HEATERS | LN2), 0);
        assert_eq!(ro & (CONTACTOR | LOCK), CONTACTOR | LOCK);

        // Soak, then idle with everything released.
        f.tick_after(STOPPING_SOAK_MS);
        assert_eq!(f.machine.state(), MachineState::Idle);
        assert_eq!(f.ro() & (CONTACTOR | MOTOR | HEATERS | LN2 | LOCK), 0);

        let ids = f.sink.ids();
        let expect = [
            EventId::StateChanged,
            EventId::RunStarted,
            EventId::PrecoolComplete,
            EventId::StateChanged,
            EventId::StateChanged,
            EventId::RunStopped,
            EventId::StateChanged,
        ];
        let tail: Vec<_> = ids
            .iter()
            .copied()
            .filter(|id| {
                !matches!(
                    id,
                    EventId::Rs485DeviceOnline | EventId::PollModeChanged
                )
            })
            .collect();
        assert_eq!(tail, expect);
    }

    #[test]
    fn start_run_requires_idle_and_open_gates() {
        let f = fixture();
        f.ready();

        f.inputs.set_door_closed(false);
        f.tick();
        assert_eq!(
            f.machine.start_run(f.clock.now(), RunMode::Normal, 0, 0),
            Err(MachineError::GateBlocked(crate::safety::GateId::DoorClosed))
        );

        f.inputs.set_door_closed(true);
        f.tick();
        f.machine
            .start_run(f.clock.now(), RunMode::Normal, 0, 0)
            .unwrap();
        assert_eq!(
            f.machine.start_run(f.clock.now(), RunMode::Normal, 0, 0),
            Err(MachineError::Busy(MachineState::Precool))
        );
    }

    #[test]
    fn estop_preempts_within_one_tick_and_requires_release_to_clear() {
        let f = fixture();
        f.ready();
        f.machine
            .start_run(f.clock.now(), RunMode::DryRun, 0, 0)
            .unwrap();
        f.tick_after(50);
        assert_eq!(f.machine.state(), MachineState::Running);

        f.inputs.set_estop_pressed(true);
        f.tick_after(50);
        assert_eq!(f.machine.state(), MachineState::EStop);
        // Power channels 1-5 off, lock released.
        assert_eq!(f.ro() & 0x3F, 0);
        assert!(f.sink.ids().contains(&EventId::EstopAsserted));

        // Clear while still pressed: refused.
        assert_eq!(
            f.machine.clear_estop(f.clock.now()),
            Err(MachineError::EstopActive)
        );

        f.inputs.set_estop_pressed(false);
        f.tick_after(50);
        f.machine.clear_estop(f.clock.now()).unwrap();
        assert_eq!(f.machine.state(), MachineState::Idle);
        assert!(f.sink.ids().contains(&EventId::EstopCleared));
    }

    #[test]
    fn door_open_during_run_faults_and_clears_only_when_closed() {
        let f = fixture();
        f.ready();
        f.machine
            .start_run(f.clock.now(), RunMode::Normal, -500, 0)
            .unwrap();

        f.inputs.set_door_closed(false);
        f.tick_after(50);
        assert_eq!(f.machine.state(), MachineState::Fault);
        assert_eq!(f.machine.fault_cause(), Some(FaultCause::DoorOpen));
        assert_eq!(f.ro() & 0x3F, 0);
        assert!(f.sink.ids().contains(&EventId::RunAborted));

        // Door still open: refuse the clear.
        assert_eq!(
            f.machine.clear_fault(f.clock.now()),
            Err(MachineError::FaultNotResolved(FaultCause::DoorOpen))
        );

        f.inputs.set_door_closed(true);
        f.tick_after(50);
        f.machine.clear_fault(f.clock.now()).unwrap();
        assert_eq!(f.machine.state(), MachineState::Idle);
    }

    #[test]
    fn required_pid_loss_mid_run_faults() {
        let f = fixture();
        f.ready();
        f.machine
            .start_run(f.clock.now(), RunMode::DryRun, 0, 0)
            .unwrap();
        f.tick_after(50);
        assert_eq!(f.machine.state(), MachineState::Running);

        // Controller 2 is Required by default; three failed polls take it
        // Offline.
        f.bus.set_online(2, false);
        for _ in 0..3 {
            let _ = f.poller.force_poll(2, f.clock.now());
        }
        f.tick_after(50);
        assert_eq!(f.machine.state(), MachineState::Fault);
        assert!(matches!(
            f.machine.fault_cause(),
            Some(FaultCause::Pid(crate::safety::GateId::Pid2Online))
        ));
        assert!(f.sink.ids().contains(&EventId::FaultRaised));
    }

    #[test]
    fn optional_pid_loss_does_not_abort() {
        let f = fixture();
        f.ready();
        f.machine
            .start_run(f.clock.now(), RunMode::DryRun, 0, 0)
            .unwrap();
        f.tick_after(50);

        // Controller 1 defaults to Optional.
        f.bus.set_online(1, false);
        for _ in 0..3 {
            let _ = f.poller.force_poll(1, f.clock.now());
        }
        f.tick_after(50);
        assert_eq!(f.machine.state(), MachineState::Running);
    }

    #[test]
    fn pause_freezes_the_run_timer_and_resume_needs_the_door() {
        let f = fixture();
        f.ready();
        f.machine
            .start_run(f.clock.now(), RunMode::DryRun, 0, 60_000)
            .unwrap();
        f.tick_after(50);
        assert_eq!(f.machine.state(), MachineState::Running);

        f.clock.advance(1000);
        f.machine
            .pause(f.clock.now(), PauseMode::KeepCooling)
            .unwrap();
        assert_eq!(f.machine.state(), MachineState::Paused);
        // Motor off and door unlocked while paused.
        f.tick();
        assert_eq!(f.ro() & (MOTOR | LOCK), 0);
        let frozen = f.machine.run_status(f.clock.now()).elapsed_ms;

        // Door open while paused is fine, but blocks resume.
        f.inputs.set_door_closed(false);
        f.tick_after(5000);
        assert_eq!(f.machine.state(), MachineState::Paused);
        assert_eq!(f.machine.resume(f.clock.now()), Err(MachineError::DoorOpen));
        assert_eq!(f.machine.run_status(f.clock.now()).elapsed_ms, frozen);

        f.inputs.set_door_closed(true);
        f.tick_after(50);
        f.machine.resume(f.clock.now()).unwrap();
        assert_eq!(f.machine.state(), MachineState::Running);
        // The power posture released by the pause comes back with the run.
        assert_eq!(f.ro() & (MOTOR | CONTACTOR | LOCK), MOTOR | CONTACTOR | LOCK);
        // Timer resumes from where it froze.
        let status = f.machine.run_status(f.clock.now());
        assert_eq!(status.elapsed_ms, frozen);
    }

    #[test]
    fn stop_cooling_pause_closes_the_ln2_valve() {
        let f = fixture();
        f.ready();
        f.machine
            .start_run(f.clock.now(), RunMode::Normal, -500, 0)
            .unwrap();
        assert_eq!(f.ro() & LN2, LN2);
        f.machine
            .pause(f.clock.now(), PauseMode::StopCooling)
            .unwrap();
        assert_eq!(f.ro() & LN2, 0);

        // Resume returns to the pre-pause state (Precool here).
        f.machine.resume(f.clock.now()).unwrap();
        assert_eq!(f.machine.state(), MachineState::Precool);
    }

    #[test]
    fn session_loss_triggers_graceful_stop_not_fault() {
        let f = fixture();
        f.ready();
        f.machine
            .start_run(f.clock.now(), RunMode::DryRun, 0, 0)
            .unwrap();
        f.tick_after(50);
        assert_eq!(f.machine.state(), MachineState::Running);

        // Lease lapses.
        f.clock.advance(4000);
        f.session.tick(f.clock.now());
        assert!(!f.session.is_live());
        f.tick();
        assert_eq!(f.machine.state(), MachineState::Stopping);
        assert_ne!(f.machine.state(), MachineState::Fault);
    }

    #[test]
    fn precool_only_run_skips_running() {
        let f = fixture();
        f.ready();
        f.machine
            .start_run(f.clock.now(), RunMode::PrecoolOnly, -400, 0)
            .unwrap();
        f.bus.set_pv(1, -380);
        f.poll_all();
        f.tick_after(50);
        assert_eq!(f.machine.state(), MachineState::Stopping);
    }

    #[test]
    fn dry_run_skips_precool_and_keeps_ln2_shut() {
        let f = fixture();
        f.ready();
        f.machine
            .start_run(f.clock.now(), RunMode::DryRun, 0, 0)
            .unwrap();
        assert_eq!(f.ro() & LN2, 0);
        f.tick_after(50);
        assert_eq!(f.machine.state(), MachineState::Running);
        assert_eq!(f.ro() & LN2, 0);
    }

    #[test]
    fn precool_timeout_proceeds_anyway() {
        let f = fixture();
        f.ready();
        f.machine
            .start_run(f.clock.now(), RunMode::Normal, -500, 0)
            .unwrap();
        // Chamber never gets cold; the five-minute budget expires.
        f.tick_after(PRECOOL_TIMEOUT_MS + 100);
        assert_eq!(f.machine.state(), MachineState::Running);
    }

    #[test]
    fn abort_stop_goes_straight_to_idle() {
        let f = fixture();
        f.ready();
        f.machine
            .start_run(f.clock.now(), RunMode::Normal, -500, 0)
            .unwrap();
        f.machine.stop_run(f.clock.now(), StopMode::Abort).unwrap();
        assert_eq!(f.machine.state(), MachineState::Idle);
        assert_eq!(f.ro() & 0x3F, 0);
        // The run context is gone.
        assert_eq!(f.machine.run_status(f.clock.now()).target_x10, 0);
    }

    #[test]
    fn service_mode_allows_free_relay_control_and_exit_clears() {
        let f = fixture();
        f.ready();
        f.machine.enable_service(f.clock.now()).unwrap();
        assert_eq!(f.machine.state(), MachineState::Service);

        // Motor on in service: allowed, and the tick clamp leaves it alone.
        f.machine.manual_relay(2, 1).unwrap();
        f.tick_after(50);
        assert_eq!(f.ro() & MOTOR, MOTOR);

        f.machine.disable_service(f.clock.now()).unwrap();
        assert_eq!(f.machine.state(), MachineState::Idle);
        assert_eq!(f.ro(), 0);
    }

    #[test]
    fn relay_policy_blocks_unsafe_manual_writes() {
        let f = fixture();
        f.ready();
        // Motor and contactor cannot be forced on from IDLE.
        assert_eq!(f.machine.manual_relay(2, 1), Err(MachineError::RelayPolicy));
        assert_eq!(f.machine.manual_relay(1, 1), Err(MachineError::RelayPolicy));
        // The chamber light is free.
        let bits = f.machine.manual_relay(7, 1).unwrap();
        assert_eq!(bits & 0x40, 0x40);
        // Toggle flips it back.
        let bits = f.machine.manual_relay(7, 2).unwrap();
        assert_eq!(bits & 0x40, 0);

        assert_eq!(f.machine.manual_relay(0, 1), Err(MachineError::InvalidChannel));
        assert_eq!(f.machine.manual_relay(9, 1), Err(MachineError::InvalidChannel));
        assert_eq!(f.machine.manual_relay(7, 3), Err(MachineError::InvalidRelayState));
    }

    #[test]
    fn relay_mask_applies_only_within_policy() {
        let f = fixture();
        f.ready();
        // Light and LN2 via mask: fine in IDLE.
        let bits = f.machine.manual_relay_mask(0x50, 0x50).unwrap();
        assert_eq!(bits & 0x50, 0x50);
        // Including the motor bit fails the whole request.
        assert_eq!(
            f.machine.manual_relay_mask(0x02, 0x02),
            Err(MachineError::RelayPolicy)
        );
    }

    #[test]
    fn absent_expander_reads_safe_defaults() {
        let f = fixture();
        f.ready();
        f.inputs.set_raw(None);
        f.tick_after(50);
        // Safe defaults: no E-stop, door closed; machine stays calm.
        assert_eq!(f.machine.state(), MachineState::Idle);
        let di = f.machine.di_snapshot();
        assert!(!di.estop_pressed());
        assert!(di.door_closed());
        assert!(!di.expander_available());
    }

    #[test]
    fn interlock_bits_reflect_inputs_and_session() {
        let f = fixture();
        f.ready();
        f.inputs.set_door_closed(false);
        f.inputs.set_ln2_present(false);
        f.tick_after(50);
        let bits = f.machine.interlock_bits();
        assert_eq!(bits & 0x02, 0x02);
        assert_eq!(bits & 0x04, 0x04);
        assert_eq!(bits & 0x01, 0);

        // Stale session raises the HMI bit.
        f.clock.advance(4000);
        f.session.tick(f.clock.now());
        assert_eq!(f.machine.interlock_bits() & 0x10, 0x10);
    }
}
