//! Shared test utilities: mock hardware surfaces and a full-unit harness.
//!
//! These helpers de-duplicate fixture construction across the component
//! tests and the end-to-end scenarios. They intentionally support just what
//! the test suite needs:
//!
//! - `FakeClock`: manually advanced millisecond clock; `sleep` advances it
//!   so paced code (the bus inter-frame gap) runs instantly under test.
//! - `ScriptedInputs`: settable digital-input byte, or "expander absent".
//! - `SpyRelays`: records every byte written to the relay expander.
//! - `MemKv`: in-memory key/value store that survives a harness "restart".
//! - `SimFieldBus`: register-level models of the three PID controllers
//!   behind a byte-accurate field-bus surface (CRC checked both ways), with
//!   per-controller failure injection.
//! - `RecordingTransport`: captures telemetry and notification frames.
//! - `Harness`: a fully wired `ControlUnit` over all of the above, with a
//!   deterministic scheduler pump and tablet-side frame builders.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::dispatch::AckView;
use crate::events::EventId;
use crate::fieldbus::crc::{bus_crc, trailer_ok};
use crate::hal::{BusSerial, Clock, DigitalInputs, Instant, KvStore, RelayOutputs, Transport};
use crate::telemetry::TelemetryView;
use crate::unit::{ControlUnit, Hardware};
use crate::wire::{self, MsgType};

// -------------- Clock --------------

/// Manually advanced clock shared by the harness and the unit under test.
pub struct FakeClock {
    now_ms: Mutex<u64>,
}

impl FakeClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            now_ms: Mutex::new(0),
        })
    }

    pub fn advance(&self, ms: u64) {
        *self.now_ms.lock().unwrap() += ms;
    }

    pub fn set(&self, ms: u64) {
        *self.now_ms.lock().unwrap() = ms;
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        Instant::from_millis(*self.now_ms.lock().unwrap())
    }

    fn sleep(&self, ms: u64) {
        // Sleeping advances simulated time instead of blocking.
        self.advance(ms);
    }
}

// -------------- Digital inputs --------------

/// Scripted input expander. `None` simulates an absent expander.
pub struct ScriptedInputs {
    bits: Mutex<Option<u8>>,
}

impl ScriptedInputs {
    /// Starts all-safe: E-stop released, door closed, LN2 present.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            bits: Mutex::new(Some(0x07)),
        })
    }

    pub fn set_raw(&self, bits: Option<u8>) {
        *self.bits.lock().unwrap() = bits;
    }

    fn update(&self, bit: u8, set: bool) {
        let mut guard = self.bits.lock().unwrap();
        let cur = guard.unwrap_or(0x07);
        *guard = Some(if set { cur | bit } else { cur & !bit });
    }

    /// Press (true) or release (false) the E-stop chain (active low).
    pub fn set_estop_pressed(&self, pressed: bool) {
        self.update(0x01, !pressed);
    }

    pub fn set_door_closed(&self, closed: bool) {
        self.update(0x02, closed);
    }

    pub fn set_ln2_present(&self, present: bool) {
        self.update(0x04, present);
    }
}

impl DigitalInputs for ScriptedInputs {
    fn read(&self) -> Option<u8> {
        *self.bits.lock().unwrap()
    }
}

// -------------- Relay outputs --------------

/// Records every byte pushed to the relay expander.
pub struct SpyRelays {
    pub writes: Mutex<Vec<u8>>,
}

impl SpyRelays {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            writes: Mutex::new(Vec::new()),
        })
    }

    pub fn last(&self) -> u8 {
        self.writes.lock().unwrap().last().copied().unwrap_or(0)
    }
}

impl RelayOutputs for SpyRelays {
    fn write(&self, bits: u8) {
        self.writes.lock().unwrap().push(bits);
    }
}

// -------------- Key/value store --------------

/// In-memory persistent store. Keep the `Arc` across a harness restart to
/// model flash surviving a reboot.
pub struct MemKv {
    map: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl MemKv {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            map: Mutex::new(HashMap::new()),
        })
    }
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

// -------------- Simulated field bus --------------

/// Register-level model of one PID controller.
pub struct SimPid {
    pub addr: u8,
    pub pv_x10: i16,
    pub sv_x10: i16,
    pub mv1_x10: u16,
    pub status: u16,
    pub mode: u8,
    /// When false the controller never answers (timeout).
    pub online: bool,
    /// Added to every SV write, to exercise the verify path.
    pub sv_write_offset: i16,
    /// When true, MODE writes are silently ignored (verify mismatch).
    pub mode_write_ignored: bool,
    /// Registers outside the standard map, for raw read/write tests.
    pub extra: HashMap<u16, u16>,
}

impl SimPid {
    fn new(addr: u8) -> Self {
        Self {
            addr,
            pv_x10: 200, // 20.0 C ambient
            sv_x10: 0,
            mv1_x10: 0,
            status: 0,
            mode: 0,
            online: true,
            sv_write_offset: 0,
            mode_write_ignored: false,
            extra: HashMap::new(),
        }
    }

    fn read_reg(&self, reg: u16) -> Option<u16> {
        match reg {
            0 => Some(self.pv_x10 as u16),
            1 => Some(self.mv1_x10),
            2 | 3 => Some(0),
            4 => Some(self.status),
            5 => Some(self.sv_x10 as u16),
            13 => Some(self.mode as u16),
            r if r < 20 => Some(0),
            r => self.extra.get(&r).copied(),
        }
    }

    fn write_reg(&mut self, reg: u16, value: u16) -> bool {
        match reg {
            5 => {
                self.sv_x10 = (value as i16).wrapping_add(self.sv_write_offset);
                true
            }
            13 => {
                if !self.mode_write_ignored {
                    self.mode = value as u8;
                }
                true
            }
            r if (20..100).contains(&r) => {
                self.extra.insert(r, value);
                true
            }
            _ => false,
        }
    }
}

/// Byte-accurate simulation of the half-duplex bus with three controllers.
pub struct SimFieldBus {
    pids: Mutex<Vec<SimPid>>,
    /// When true, responses carry a corrupted CRC trailer.
    pub corrupt_response_crc: Mutex<bool>,
    /// Count of transactions seen, for cadence assertions.
    pub transactions: Mutex<u32>,
}

impl SimFieldBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pids: Mutex::new(vec![SimPid::new(1), SimPid::new(2), SimPid::new(3)]),
            corrupt_response_crc: Mutex::new(false),
            transactions: Mutex::new(0),
        })
    }

    pub fn with_pid<R>(&self, addr: u8, f: impl FnOnce(&mut SimPid) -> R) -> R {
        let mut pids = self.pids.lock().unwrap();
        let pid = pids
            .iter_mut()
            .find(|p| p.addr == addr)
            .expect("unknown sim controller");
        f(pid)
    }

    pub fn set_pv(&self, addr: u8, pv_x10: i16) {
        self.with_pid(addr, |p| p.pv_x10 = pv_x10);
    }

    pub fn set_online(&self, addr: u8, online: bool) {
        self.with_pid(addr, |p| p.online = online);
    }

    pub fn transaction_count(&self) -> u32 {
        *self.transactions.lock().unwrap()
    }

    fn respond(&self, tx: &[u8]) -> Option<Vec<u8>> {
        if tx.len() < 4 || !trailer_ok(tx) {
            // A garbled request is never answered.
            return None;
        }
        let addr = tx[0];
        let function = tx[1];
        let mut pids = self.pids.lock().unwrap();
        let pid = pids.iter_mut().find(|p| p.addr == addr)?;
        if !pid.online {
            return None;
        }

        let mut response = match function {
            0x03 => {
                if tx.len() < 8 {
                    return None;
                }
                let start = u16::from_be_bytes([tx[2], tx[3]]);
                let count = u16::from_be_bytes([tx[4], tx[5]]);
                let mut body = vec![addr, function, (count * 2) as u8];
                for i in 0..count {
                    match pid.read_reg(start + i) {
                        Some(value) => body.extend_from_slice(&value.to_be_bytes()),
                        None => return Some(exception(addr, function, 0x02)),
                    }
                }
                body
            }
            0x06 => {
                if tx.len() < 8 {
                    return None;
                }
                let reg = u16::from_be_bytes([tx[2], tx[3]]);
                let value = u16::from_be_bytes([tx[4], tx[5]]);
                if !pid.write_reg(reg, value) {
                    return Some(exception(addr, function, 0x02));
                }
                // Echo response mirrors the request bytes.
                tx[..6].to_vec()
            }
            _ => return Some(exception(addr, function, 0x01)),
        };

        let crc = bus_crc(&response);
        response.extend_from_slice(&crc.to_le_bytes());
        if *self.corrupt_response_crc.lock().unwrap() {
            let at = response.len() - 1;
            response[at] ^= 0xFF;
        }
        Some(response)
    }
}

fn exception(addr: u8, function: u8, code: u8) -> Vec<u8> {
    let mut frame = vec![addr, function | 0x80, code];
    let crc = bus_crc(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

impl BusSerial for SimFieldBus {
    fn transact(&self, tx: &[u8], rx: &mut [u8], _deadline_ms: u64) -> Option<usize> {
        *self.transactions.lock().unwrap() += 1;
        let response = self.respond(tx)?;
        let n = response.len().min(rx.len());
        rx[..n].copy_from_slice(&response[..n]);
        Some(n)
    }
}

// -------------- Event sink --------------

/// Collects raw events for component-level tests (below the wire framing).
pub struct CollectingSink {
    pub events: Mutex<Vec<crate::events::Event>>,
}

impl CollectingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn ids(&self) -> Vec<EventId> {
        self.events.lock().unwrap().iter().map(|e| e.id).collect()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

impl crate::events::EventSink for CollectingSink {
    fn emit(&self, event: crate::events::Event) {
        self.events.lock().unwrap().push(event);
    }
}

// -------------- Transport --------------

/// Captures everything the unit sends to the tablet.
pub struct RecordingTransport {
    pub telemetry: Mutex<Vec<Vec<u8>>>,
    /// Notification frames (ACKs and events) with their reliable flag.
    pub notifications: Mutex<Vec<(Vec<u8>, bool)>>,
    pub subscribed: Mutex<bool>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            telemetry: Mutex::new(Vec::new()),
            notifications: Mutex::new(Vec::new()),
            subscribed: Mutex::new(true),
        })
    }

    pub fn set_subscribed(&self, on: bool) {
        *self.subscribed.lock().unwrap() = on;
    }
}

impl Transport for RecordingTransport {
    fn send_telemetry(&self, frame: &[u8]) {
        self.telemetry.lock().unwrap().push(frame.to_vec());
    }

    fn send_event(&self, frame: &[u8], reliable: bool) {
        self.notifications
            .lock()
            .unwrap()
            .push((frame.to_vec(), reliable));
    }

    fn subscribed(&self) -> bool {
        *self.subscribed.lock().unwrap()
    }
}

// -------------- Full-unit harness --------------

/// A complete control unit over mock hardware, plus tablet-side helpers.
pub struct Harness {
    pub clock: Arc<FakeClock>,
    pub inputs: Arc<ScriptedInputs>,
    pub relays: Arc<SpyRelays>,
    pub bus: Arc<SimFieldBus>,
    pub kv: Arc<MemKv>,
    pub transport: Arc<RecordingTransport>,
    pub unit: ControlUnit,
    cmd_seq: Mutex<u16>,
}

impl Harness {
    pub fn new() -> Self {
        let clock = FakeClock::new();
        let inputs = ScriptedInputs::new();
        let relays = SpyRelays::new();
        let bus = SimFieldBus::new();
        let kv = MemKv::new();
        let transport = RecordingTransport::new();
        let unit = Self::build_unit(&clock, &inputs, &relays, &bus, &kv, &transport);
        Self {
            clock,
            inputs,
            relays,
            bus,
            kv,
            transport,
            unit,
            cmd_seq: Mutex::new(0),
        }
    }

    fn build_unit(
        clock: &Arc<FakeClock>,
        inputs: &Arc<ScriptedInputs>,
        relays: &Arc<SpyRelays>,
        bus: &Arc<SimFieldBus>,
        kv: &Arc<MemKv>,
        transport: &Arc<RecordingTransport>,
    ) -> ControlUnit {
        ControlUnit::new(Hardware {
            clock: clock.clone(),
            inputs: inputs.clone(),
            relays: relays.clone(),
            bus: bus.clone(),
            kv: kv.clone(),
            transport: transport.clone(),
        })
    }

    /// Simulate a reboot: fresh unit and transport, same flash and plant.
    pub fn restart(&mut self) {
        self.transport = RecordingTransport::new();
        self.unit = Self::build_unit(
            &self.clock,
            &self.inputs,
            &self.relays,
            &self.bus,
            &self.kv,
            &self.transport,
        );
    }

    /// Pump the scheduler across `ms` of simulated time, in 10 ms steps.
    pub fn advance(&self, ms: u64) {
        let steps = ms.div_ceil(10);
        for _ in 0..steps {
            self.unit.service(self.clock.now());
            self.clock.advance(10);
        }
    }

    /// Let the poller bring every simulated controller Online.
    pub fn warm_up(&self) {
        self.advance(1200);
    }

    /// Build and deliver one command frame; returns the decoded ACK.
    pub fn send(&self, cmd_id: u16, body: &[u8]) -> AckView {
        let mut payload = Vec::with_capacity(4 + body.len());
        payload.extend_from_slice(&cmd_id.to_le_bytes());
        payload.extend_from_slice(&0u16.to_le_bytes());
        payload.extend_from_slice(body);

        let seq = {
            let mut guard = self.cmd_seq.lock().unwrap();
            *guard = guard.wrapping_add(1);
            *guard
        };
        let frame = wire::build(MsgType::Command, seq, &payload).expect("command frame");
        self.unit.on_command(&frame);
        self.last_ack().expect("no ACK recorded")
    }

    /// The most recent ACK notification, decoded.
    pub fn last_ack(&self) -> Option<AckView> {
        let notifications = self.transport.notifications.lock().unwrap();
        notifications.iter().rev().find_map(|(frame, _)| {
            let (header, payload) = wire::parse(frame).ok()?;
            if header.typed() == Some(MsgType::Ack) {
                AckView::decode(payload)
            } else {
                None
            }
        })
    }

    /// Whether the most recent ACK rode the reliable path.
    pub fn last_ack_reliable(&self) -> Option<bool> {
        let notifications = self.transport.notifications.lock().unwrap();
        notifications.iter().rev().find_map(|(frame, reliable)| {
            let (header, _) = wire::parse(frame).ok()?;
            (header.typed() == Some(MsgType::Ack)).then_some(*reliable)
        })
    }

    /// All event ids seen so far, in emission order.
    pub fn event_ids(&self) -> Vec<EventId> {
        let notifications = self.transport.notifications.lock().unwrap();
        notifications
            .iter()
            .filter_map(|(frame, _)| {
                let (header, payload) = wire::parse(frame).ok()?;
                if header.typed() != Some(MsgType::Event) || payload.len() < 4 {
                    return None;
                }
                EventId::try_from(u16::from_le_bytes([payload[0], payload[1]])).ok()
            })
            .collect()
    }

    /// The most recent telemetry payload, decoded.
    pub fn last_telemetry(&self) -> Option<TelemetryView> {
        let telemetry = self.transport.telemetry.lock().unwrap();
        let frame = telemetry.last()?;
        let (header, payload) = wire::parse(frame).ok()?;
        (header.typed() == Some(MsgType::Telemetry))
            .then(|| TelemetryView::decode(payload))
            .flatten()
    }

    // ---- Tablet-side command builders ----

    pub fn open_session(&self) -> u32 {
        let ack = self.send(0x0100, &0xC0FF_EE01u32.to_le_bytes());
        assert_eq!(ack.status, 0, "OPEN_SESSION rejected: {ack:?}");
        u32::from_le_bytes([ack.data[0], ack.data[1], ack.data[2], ack.data[3]])
    }

    pub fn keepalive(&self, id: u32) -> AckView {
        self.send(0x0101, &id.to_le_bytes())
    }

    pub fn start_run(&self, id: u32, mode: u8, target_x10: i16, duration_ms: u32) -> AckView {
        let mut body = Vec::new();
        body.extend_from_slice(&id.to_le_bytes());
        body.push(mode);
        body.extend_from_slice(&target_x10.to_le_bytes());
        body.extend_from_slice(&duration_ms.to_le_bytes());
        self.send(0x0102, &body)
    }

    pub fn stop_run(&self, id: u32, stop_mode: u8) -> AckView {
        let mut body = Vec::new();
        body.extend_from_slice(&id.to_le_bytes());
        body.push(stop_mode);
        self.send(0x0103, &body)
    }
}
