/*!
Control unit: the facade owning every component, plus the tick scheduler.

Construction wires the dependency graph explicitly (no globals): the bus
master wraps the serial surface, the poller wraps the master, the machine
takes the relay bank, inputs, poller, session and gates, and telemetry
observes everything through narrow read-only seams. Events flow from the
producers through `EventRouter`, which frames them and hands them to the
transport; nothing here ever calls the transport while a component lock is
held.

Scheduling
==========
`service(now)` runs the periodic work that is due, in fixed priority order:

1. machine tick (50 ms), so interlocks run before anything else
2. field-bus poller (own cadence, 300/2000 ms per §poller)
3. telemetry tick (100 ms; the session expiry sweep rides on it)

A host loop calls `service` at a few-millisecond cadence (or sleeps until
the returned next-due instant); tests drive it with a manual clock. Late
ticks reschedule from `now`: the control loop degrades by stretching, not
by bursting.

The command dispatcher is event-driven: the transport delivers inbound
frames to `on_command` and disconnects to `on_disconnect`.
*/

use std::sync::{Arc, Mutex};

use log::debug;

use crate::dispatch::Dispatcher;
use crate::events::{Event, EventSink};
use crate::fieldbus::BusMaster;
use crate::hal::{BusSerial, Clock, DigitalInputs, Instant, KvStore, RelayOutputs, Transport, lock};
use crate::machine::{Machine, RelayBank, TICK_INTERVAL_MS};
use crate::poller::PidPoller;
use crate::safety::SafetyGates;
use crate::session::Session;
use crate::telemetry::{
    EXT_STATE_LEN, RunStateProvider, TELEMETRY_INTERVAL_MS, TelemetryProducer,
};
use crate::wire::{self, DEVCAP_SESSION_LEASE, DeviceInfo, FrameSeq, MsgType};

/// Firmware identity served in the device-info record.
pub const FW_MAJOR: u8 = 2;
pub const FW_MINOR: u8 = 4;
pub const FW_PATCH: u8 = 0;
pub const FW_BUILD_ID: u32 = 0x2607_1501;

/// The hardware surfaces a control unit is assembled from.
pub struct Hardware {
    pub clock: Arc<dyn Clock>,
    pub inputs: Arc<dyn DigitalInputs>,
    pub relays: Arc<dyn RelayOutputs>,
    pub bus: Arc<dyn BusSerial>,
    pub kv: Arc<dyn KvStore>,
    pub transport: Arc<dyn Transport>,
}

/// Frames events and forwards them to the transport's notification channel.
struct EventRouter {
    transport: Arc<dyn Transport>,
    seq: Arc<FrameSeq>,
}

impl EventSink for EventRouter {
    fn emit(&self, event: Event) {
        let payload = event.to_payload();
        match wire::build(MsgType::Event, self.seq.next(), &payload) {
            Ok(frame) => self.transport.send_event(&frame, event.wants_reliable()),
            Err(err) => debug!("events: frame build failed: {err}"),
        }
    }
}

/// Combines the machine's run numbers with the poller's idle-poll flags
/// into the 16-byte extended telemetry block.
struct RunStateBridge {
    machine: Arc<Machine>,
    poller: Arc<PidPoller>,
}

impl RunStateProvider for RunStateBridge {
    fn run_state_ext(&self, now: Instant) -> [u8; EXT_STATE_LEN] {
        let status = self.machine.run_status(now);
        let (_, idle_min) = self.poller.idle_timeout();
        let mut out = [0u8; EXT_STATE_LEN];
        out[0] = status.state;
        out[1..5].copy_from_slice(&status.elapsed_ms.to_le_bytes());
        out[5..9].copy_from_slice(&status.remaining_ms.to_le_bytes());
        out[9..11].copy_from_slice(&status.target_x10.to_le_bytes());
        out[11] = status.recipe_step;
        out[12] = self.machine.interlock_bits();
        out[13] = self.poller.slow_poll_active() as u8;
        out[14] = idle_min;
        // out[15] reserved, stays zero.
        out
    }
}

struct Schedule {
    next_machine: Instant,
    next_telemetry: Instant,
}

/// The assembled control unit.
pub struct ControlUnit {
    session: Arc<Session>,
    gates: Arc<SafetyGates>,
    machine: Arc<Machine>,
    poller: Arc<PidPoller>,
    relays: Arc<RelayBank>,
    telemetry: TelemetryProducer,
    dispatcher: Dispatcher,
    schedule: Mutex<Schedule>,
}

impl ControlUnit {
    pub fn new(hw: Hardware) -> Self {
        let seq = Arc::new(FrameSeq::new());
        let events: Arc<dyn EventSink> = Arc::new(EventRouter {
            transport: hw.transport.clone(),
            seq: seq.clone(),
        });

        let master = Arc::new(BusMaster::new(hw.bus, hw.clock.clone()));
        let poller = Arc::new(PidPoller::new(master, hw.kv.clone(), events.clone()));
        let session = Arc::new(Session::new(events.clone()));
        let gates = Arc::new(SafetyGates::new(hw.kv));
        let relays = Arc::new(RelayBank::new(hw.relays));
        let machine = Arc::new(Machine::new(
            relays.clone(),
            hw.inputs,
            poller.clone(),
            session.clone(),
            gates.clone(),
            events,
        ));

        let bridge = Arc::new(RunStateBridge {
            machine: machine.clone(),
            poller: poller.clone(),
        });
        let telemetry = TelemetryProducer::new(
            session.clone(),
            poller.clone(),
            gates.clone(),
            machine.clone(),
            bridge,
            hw.transport.clone(),
            seq.clone(),
        );
        let dispatcher = Dispatcher::new(
            session.clone(),
            machine.clone(),
            poller.clone(),
            gates.clone(),
            hw.transport,
            seq,
            hw.clock,
        );

        Self {
            session,
            gates,
            machine,
            poller,
            relays,
            telemetry,
            dispatcher,
            schedule: Mutex::new(Schedule {
                next_machine: Instant::ZERO,
                next_telemetry: Instant::ZERO,
            }),
        }
    }

    /// Run all periodic work that is due; returns the next due instant.
    pub fn service(&self, now: Instant) -> Instant {
        let (machine_due, telemetry_due) = {
            let mut schedule = lock(&self.schedule);
            let machine_due = now >= schedule.next_machine;
            if machine_due {
                schedule.next_machine = now.add_millis(TICK_INTERVAL_MS);
            }
            let telemetry_due = now >= schedule.next_telemetry;
            if telemetry_due {
                schedule.next_telemetry = now.add_millis(TELEMETRY_INTERVAL_MS);
            }
            (machine_due, telemetry_due)
        };

        if machine_due {
            self.machine.tick(now);
        }
        let poller_next = self.poller.service(now);
        if telemetry_due {
            self.telemetry.tick(now);
        }

        let schedule = lock(&self.schedule);
        schedule
            .next_machine
            .min(schedule.next_telemetry)
            .min(poller_next)
    }

    /// Inbound command frame from the transport.
    pub fn on_command(&self, bytes: &[u8]) {
        self.dispatcher.handle_frame(bytes);
    }

    /// Transport disconnect: the session dies immediately.
    pub fn on_disconnect(&self) {
        self.session.force_expire();
    }

    /// The 12-byte device-info record the transport serves on connect.
    pub fn device_info(&self) -> [u8; 12] {
        DeviceInfo {
            fw_major: FW_MAJOR,
            fw_minor: FW_MINOR,
            fw_patch: FW_PATCH,
            build_id: FW_BUILD_ID,
            cap_bits: DEVCAP_SESSION_LEASE,
        }
        .encode()
    }

    // Component access for integration and tests.

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub fn poller(&self) -> &PidPoller {
        &self.poller
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn gates(&self) -> &SafetyGates {
        &self.gates
    }

    pub fn relays(&self) -> &RelayBank {
        &self.relays
    }

    /// Current alarm word (recomputed every telemetry tick).
    pub fn alarm_bits(&self) -> u32 {
        self.telemetry.alarm_bits()
    }
}
