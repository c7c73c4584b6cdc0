/*!
Host simulator for the cryomill controller core.

Assembles a `ControlUnit` against simulated hardware (a thermal model of
the chamber behind three register-level PID controllers, an in-memory
key/value store, a console transport) and drives a scripted operator
session: open a session, start a short run, keep it alive, and report the
state transitions as they happen.

Simulated time advances 10 ms per loop iteration with a short real sleep,
so a full run (precool, run, 30 s stop soak) completes in a few wall-clock
seconds. Run with `RUST_LOG=info` (or `debug`) for the component logs.
*/

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use log::info;

use cryomill::dispatch::AckView;
use cryomill::hal::{BusSerial, Clock, DigitalInputs, Instant, KvStore, RelayOutputs, Transport};
use cryomill::machine::RelayBits;
use cryomill::telemetry::TelemetryView;
use cryomill::wire::{self, MsgType};
use cryomill::{ControlUnit, Hardware, MachineState};

/// Simulated-time clock, advanced by the main loop.
struct SimClock {
    now_ms: Mutex<u64>,
}

impl Clock for SimClock {
    fn now(&self) -> Instant {
        Instant::from_millis(*self.now_ms.lock().unwrap())
    }

    fn sleep(&self, ms: u64) {
        *self.now_ms.lock().unwrap() += ms;
    }
}

/// All inputs healthy: E-stop released, door closed, LN2 present.
struct HealthyInputs;

impl DigitalInputs for HealthyInputs {
    fn read(&self) -> Option<u8> {
        Some(0x07)
    }
}

/// Relay expander that logs edges and feeds the thermal model.
struct SimRelays {
    bits: AtomicU8,
}

impl RelayOutputs for SimRelays {
    fn write(&self, bits: u8) {
        let old = self.bits.swap(bits, Ordering::Relaxed);
        if old != bits {
            info!("relays: {old:#04x} -> {bits:#04x}");
        }
    }
}

/// Shared thermal state of the chamber.
struct Plant {
    pv_x10: Mutex<i16>,
    sv_x10: Mutex<i16>,
    mode: Mutex<u8>,
}

impl Plant {
    /// One 10 ms step: pull toward -190 C while the LN2 valve is open,
    /// drift back toward ambient otherwise.
    fn step(&self, ln2_open: bool) {
        let mut pv = self.pv_x10.lock().unwrap();
        let target = if ln2_open { -1900 } else { 200 };
        let rate = if ln2_open { 8 } else { 1 };
        if *pv < target {
            *pv = (*pv + rate).min(target);
        } else if *pv > target {
            *pv = (*pv - rate).max(target);
        }
    }
}

/// Field-bus surface: three controllers sharing the one simulated chamber.
struct SimBus {
    plant: Arc<Plant>,
    extra: Mutex<HashMap<(u8, u16), u16>>,
}

impl SimBus {
    fn read_reg(&self, addr: u8, reg: u16) -> u16 {
        match reg {
            0 => {
                let pv = *self.plant.pv_x10.lock().unwrap();
                // The heater-zone controllers read near ambient.
                if addr == 1 { pv as u16 } else { 250 }
            }
            5 => *self.plant.sv_x10.lock().unwrap() as u16,
            13 => *self.plant.mode.lock().unwrap() as u16,
            r if r < 20 => 0,
            r => *self.extra.lock().unwrap().get(&(addr, r)).unwrap_or(&0),
        }
    }

    fn write_reg(&self, addr: u8, reg: u16, value: u16) {
        match reg {
            5 => *self.plant.sv_x10.lock().unwrap() = value as i16,
            13 => *self.plant.mode.lock().unwrap() = value as u8,
            r => {
                self.extra.lock().unwrap().insert((addr, r), value);
            }
        }
    }
}

impl BusSerial for SimBus {
    fn transact(&self, tx: &[u8], rx: &mut [u8], _deadline_ms: u64) -> Option<usize> {
        use cryomill::fieldbus::crc::{bus_crc, trailer_ok};
        if tx.len() < 8 || !trailer_ok(tx) {
            return None;
        }
        let (addr, function) = (tx[0], tx[1]);
        if !(1..=3).contains(&addr) {
            return None;
        }
        let mut response = match function {
            0x03 => {
                let start = u16::from_be_bytes([tx[2], tx[3]]);
                let count = u16::from_be_bytes([tx[4], tx[5]]);
                let mut body = vec![addr, function, (count * 2) as u8];
                for i in 0..count {
                    body.extend_from_slice(&self.read_reg(addr, start + i).to_be_bytes());
                }
                body
            }
            0x06 => {
                let reg = u16::from_be_bytes([tx[2], tx[3]]);
                let value = u16::from_be_bytes([tx[4], tx[5]]);
                self.write_reg(addr, reg, value);
                tx[..6].to_vec()
            }
            _ => return None,
        };
        let crc = bus_crc(&response);
        response.extend_from_slice(&crc.to_le_bytes());
        let n = response.len().min(rx.len());
        rx[..n].copy_from_slice(&response[..n]);
        Some(n)
    }
}

/// In-memory stand-in for the non-volatile store.
struct MemKv {
    map: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl KvStore for MemKv {
    fn read(&self, ns: &str, key: &str) -> Option<Vec<u8>> {
        self.map
            .lock()
            .unwrap()
            .get(&(ns.to_string(), key.to_string()))
            .cloned()
    }

    fn write(&self, ns: &str, key: &str, value: &[u8]) {
        self.map
            .lock()
            .unwrap()
            .insert((ns.to_string(), key.to_string()), value.to_vec());
    }
}

/// Console transport: decodes outbound frames and remembers the last ACK.
struct ConsoleTransport {
    last_ack: Mutex<Option<AckView>>,
    last_state: Mutex<Option<u8>>,
}

impl Transport for ConsoleTransport {
    fn send_telemetry(&self, frame: &[u8]) {
        let Ok((_, payload)) = wire::parse(frame) else {
            return;
        };
        let Some(view) = TelemetryView::decode(payload) else {
            return;
        };
        let mut last_state = self.last_state.lock().unwrap();
        if *last_state != Some(view.machine_state) {
            *last_state = Some(view.machine_state);
            let chamber = view.controllers.first();
            info!(
                "telemetry: state={} pv={} sv={} ro={:#04x} alarms={:#06x}",
                view.machine_state,
                chamber.map(|c| c.pv_x10).unwrap_or(0),
                chamber.map(|c| c.sv_x10).unwrap_or(0),
                view.ro_bits,
                view.alarm_bits,
            );
        }
    }

    fn send_event(&self, frame: &[u8], reliable: bool) {
        let Ok((header, payload)) = wire::parse(frame) else {
            return;
        };
        match header.typed() {
            Some(MsgType::Ack) => {
                *self.last_ack.lock().unwrap() = AckView::decode(payload);
            }
            Some(MsgType::Event) if payload.len() >= 4 => {
                let id = u16::from_le_bytes([payload[0], payload[1]]);
                info!(
                    "event: id={id:#06x} severity={} reliable={reliable}",
                    payload[2]
                );
            }
            _ => {}
        }
    }

    fn subscribed(&self) -> bool {
        true
    }
}

/// Tablet-side command builder.
struct Operator {
    seq: u16,
}

impl Operator {
    fn send(&mut self, unit: &ControlUnit, transport: &ConsoleTransport, cmd_id: u16, body: &[u8]) -> Option<AckView> {
        let mut payload = Vec::with_capacity(4 + body.len());
        payload.extend_from_slice(&cmd_id.to_le_bytes());
        payload.extend_from_slice(&0u16.to_le_bytes());
        payload.extend_from_slice(body);
        self.seq = self.seq.wrapping_add(1);
        let frame = wire::build(MsgType::Command, self.seq, &payload).ok()?;
        unit.on_command(&frame);
        transport.last_ack.lock().unwrap().take()
    }
}

fn main() {
    env_logger::init();

    let clock = Arc::new(SimClock {
        now_ms: Mutex::new(0),
    });
    let plant = Arc::new(Plant {
        pv_x10: Mutex::new(200),
        sv_x10: Mutex::new(0),
        mode: Mutex::new(0),
    });
    let relays = Arc::new(SimRelays {
        bits: AtomicU8::new(0),
    });
    let bus = Arc::new(SimBus {
        plant: plant.clone(),
        extra: Mutex::new(HashMap::new()),
    });
    let transport = Arc::new(ConsoleTransport {
        last_ack: Mutex::new(None),
        last_state: Mutex::new(None),
    });

    let unit = ControlUnit::new(Hardware {
        clock: clock.clone(),
        inputs: Arc::new(HealthyInputs),
        relays: relays.clone(),
        bus: bus.clone(),
        kv: Arc::new(MemKv {
            map: Mutex::new(HashMap::new()),
        }),
        transport: transport.clone(),
    });
    info!("device info: {:02x?}", unit.device_info());

    // Let the poller find the controllers, then run the operator script.
    let mut operator = Operator { seq: 0 };
    let mut session_id = 0u32;
    let mut started = false;
    let mut last_keepalive = Instant::ZERO;

    for _ in 0..20_000u32 {
        let now = clock.now();
        unit.service(now);
        plant.step(relays.bits.load(Ordering::Relaxed) & RelayBits::LN2_VALVE.bits() != 0);

        if session_id == 0 && now.as_millis() > 1500 {
            let ack = operator
                .send(&unit, &transport, 0x0100, &0xA5A5_0001u32.to_le_bytes())
                .expect("OPEN_SESSION ack");
            session_id = u32::from_le_bytes(ack.data[0..4].try_into().unwrap());
            info!("operator: session {session_id:#010x} (lease {} ms)", 3000);
            last_keepalive = now;
        }

        if session_id != 0 && !started && now.as_millis() > 2000 {
            // -30.0 C target, 5 s of milling.
            let mut body = Vec::new();
            body.extend_from_slice(&session_id.to_le_bytes());
            body.push(0);
            body.extend_from_slice(&(-300i16).to_le_bytes());
            body.extend_from_slice(&5000u32.to_le_bytes());
            let ack = operator
                .send(&unit, &transport, 0x0102, &body)
                .expect("START_RUN ack");
            info!("operator: START_RUN -> status {}", ack.status);
            started = ack.status == 0;
        }

        if session_id != 0 && now.millis_since(last_keepalive) >= 1000 {
            operator.send(&unit, &transport, 0x0101, &session_id.to_le_bytes());
            last_keepalive = now;
        }

        if started && unit.machine().state() == MachineState::Idle {
            info!("run complete, chamber at {} x0.1C", *plant.pv_x10.lock().unwrap());
            break;
        }

        clock.sleep(10);
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
}
