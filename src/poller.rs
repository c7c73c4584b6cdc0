/*!
PID controller poller.

Maintains one live record per configured controller (bus addresses 1-3) by
polling them round-robin over the field bus:

- one read of the six-register block starting at 0: PV, MV1, MV2, MVFB,
  STATUS, SV;
- one separate read of register 13 (MODE). If only the MODE sub-read fails
  the poll still counts as a success and the previous mode is kept.

Record state ladder:
- success → Online (emits RS485_DEVICE_ONLINE when arriving from Unknown or
  Offline);
- one error while Online → Stale;
- three consecutive errors from Online/Stale → Offline (emits
  RS485_DEVICE_OFFLINE);
- an Online record whose data age exceeds the staleness threshold drops to
  Stale without an error.

Cadence: 300 ms between controllers normally; 2000 ms in slow mode. Slow
mode engages when an operator idle timeout is configured and no command
(KEEPALIVE excepted) has arrived within it; any other command snaps the
poller back to fast. The idle timeout persists under `pid_ctrl/idle_timeout`.

The poller owns `poller_cache` (lock-order slot 3) and calls into the bus
master (slot 2); the cache lock is never held across a bus transaction.
*/

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};

use crate::events::{Event, EventId, EventSink, EventSource, Severity};
use crate::fieldbus::{BusError, BusMaster};
use crate::hal::{Instant, KvStore, lock};

/// Configured controller addresses, in poll order.
pub const CONTROLLER_ADDRS: [u8; 3] = [1, 2, 3];

/// Register map shared by all three controllers.
pub const REG_BLOCK_START: u16 = 0;
pub const REG_BLOCK_LEN: u8 = 6;
pub const REG_PV: usize = 0;
pub const REG_MV1: usize = 1;
pub const REG_STATUS: usize = 4;
pub const REG_SV_OFFSET: usize = 5;
pub const REG_SV: u16 = 5;
pub const REG_MODE: u16 = 13;

/// Gap between consecutive controller polls.
pub const FAST_INTERVAL_MS: u64 = 300;
pub const SLOW_INTERVAL_MS: u64 = 2000;

/// Age beyond which an Online record degrades to Stale.
pub const STALE_THRESHOLD_FAST_MS: u64 = 2000;
pub const STALE_THRESHOLD_SLOW_MS: u64 = 3 * SLOW_INTERVAL_MS;

/// Consecutive errors before a controller is declared Offline.
pub const OFFLINE_ERROR_THRESHOLD: u32 = 3;

/// Setpoint write-verify tolerance, in x10 degree units (0.15 C rounds down
/// to one count).
pub const SV_VERIFY_TOLERANCE_X10: u16 = 1;

/// Persistent idle-timeout location.
const KV_NS: &str = "pid_ctrl";
const KV_IDLE_TIMEOUT: &str = "idle_timeout";

/// Link state of one controller record.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ControllerState {
    /// Never answered since boot.
    Unknown,
    Online,
    /// Recent data exists but the last poll failed or aged out.
    Stale,
    Offline,
}

impl ControllerState {
    /// Online and Stale both count as "linked" for gate evaluation; Stale is
    /// an aging signal, not a loss signal.
    #[inline]
    pub fn is_linked(self) -> bool {
        matches!(self, ControllerState::Online | ControllerState::Stale)
    }
}

/// Live record for one controller.
#[derive(Copy, Clone, Debug)]
pub struct ControllerRecord {
    pub addr: u8,
    pub state: ControllerState,
    pub last_update: Instant,
    pub pv_x10: i16,
    pub sv_x10: i16,
    pub output_x10: u16,
    pub status_flags: u16,
    pub mode: u8,
    pub consec_errors: u32,
    pub total_polls: u32,
    pub total_errors: u32,
}

impl ControllerRecord {
    fn new(addr: u8) -> Self {
        Self {
            addr,
            state: ControllerState::Unknown,
            last_update: Instant::ZERO,
            pv_x10: 0,
            sv_x10: 0,
            output_x10: 0,
            status_flags: 0,
            mode: 0,
            consec_errors: 0,
            total_polls: 0,
            total_errors: 0,
        }
    }

    /// Data age, clamped to u16 for the telemetry entry.
    pub fn age_ms_clamped(&self, now: Instant) -> u16 {
        now.millis_since(self.last_update).min(u16::MAX as u64) as u16
    }
}

struct Cache {
    records: [ControllerRecord; 3],
    cursor: usize,
    next_poll: Instant,
    slow_active: bool,
}

/// The poller component.
pub struct PidPoller {
    master: Arc<BusMaster>,
    kv: Arc<dyn KvStore>,
    events: Arc<dyn EventSink>,
    cache: Mutex<Cache>,
    /// Configured idle timeout in minutes; 0 disables slow mode.
    idle_timeout_min: AtomicU64,
    /// Millisecond timestamp of the last non-KEEPALIVE command.
    last_activity_ms: AtomicU64,
}

impl PidPoller {
    pub fn new(master: Arc<BusMaster>, kv: Arc<dyn KvStore>, events: Arc<dyn EventSink>) -> Self {
        let timeout = kv
            .read(KV_NS, KV_IDLE_TIMEOUT)
            .and_then(|v| v.first().copied())
            .unwrap_or(0);
        Self {
            master,
            kv,
            events,
            cache: Mutex::new(Cache {
                records: [
                    ControllerRecord::new(CONTROLLER_ADDRS[0]),
                    ControllerRecord::new(CONTROLLER_ADDRS[1]),
                    ControllerRecord::new(CONTROLLER_ADDRS[2]),
                ],
                cursor: 0,
                next_poll: Instant::ZERO,
                slow_active: false,
            }),
            idle_timeout_min: AtomicU64::new(timeout as u64),
            last_activity_ms: AtomicU64::new(0),
        }
    }

    // -------------- Scheduling --------------

    /// Poll the next controller if its slot is due. Returns the next due
    /// time so the scheduler can sleep precisely.
    pub fn service(&self, now: Instant) -> Instant {
        let due = {
            let cache = lock(&self.cache);
            now >= cache.next_poll
        };

        if due {
            let idx = {
                let mut cache = lock(&self.cache);
                let idx = cache.cursor;
                cache.cursor = (cache.cursor + 1) % cache.records.len();
                idx
            };
            // Bus transaction happens with the cache lock released.
            let _ = self.poll_index(idx, now);

            let slow = self.update_mode(now);
            let interval = if slow {
                SLOW_INTERVAL_MS
            } else {
                FAST_INTERVAL_MS
            };
            let mut cache = lock(&self.cache);
            cache.next_poll = now.add_millis(interval);
        }

        self.sweep_staleness(now);
        lock(&self.cache).next_poll
    }

    /// Poll one controller immediately, bypassing the cadence.
    pub fn force_poll(&self, addr: u8, now: Instant) -> Result<(), BusError> {
        let idx = Self::index_of(addr).ok_or(BusError::InvalidAddr(addr))?;
        let result = self.poll_index(idx, now);
        // A forced refresh is operator activity; recompute the mode so slow
        // polling disengages without waiting for the next scheduled slot.
        self.update_mode(now);
        let mut cache = lock(&self.cache);
        cache.next_poll = now;
        drop(cache);
        result
    }

    /// Record operator activity (every command except KEEPALIVE).
    pub fn touch_activity(&self, now: Instant) {
        self.last_activity_ms.store(now.as_millis(), Ordering::Relaxed);
    }

    pub fn slow_poll_active(&self) -> bool {
        lock(&self.cache).slow_active
    }

    // -------------- Idle-timeout configuration --------------

    /// Persist and apply a new idle timeout (minutes; 0 disables).
    pub fn set_idle_timeout(&self, minutes: u8, now: Instant) {
        self.kv.write(KV_NS, KV_IDLE_TIMEOUT, &[minutes]);
        self.idle_timeout_min.store(minutes as u64, Ordering::Relaxed);
        self.touch_activity(now);
        info!("poller: idle timeout set to {minutes} min");
    }

    /// `(enabled, minutes)` for GET_IDLE_TIMEOUT.
    pub fn idle_timeout(&self) -> (bool, u8) {
        let minutes = self.idle_timeout_min.load(Ordering::Relaxed) as u8;
        (minutes > 0, minutes)
    }

    // -------------- Setpoint / mode writes --------------

    /// Write a setpoint and verify by read-back within ±0.15 C.
    pub fn set_sv(&self, addr: u8, sv_x10: i16) -> Result<(), BusError> {
        let idx = Self::index_of(addr).ok_or(BusError::InvalidAddr(addr))?;
        self.master.write_single(addr, REG_SV, sv_x10 as u16)?;
        let mut read_back = [0u16; 1];
        self.master.read_holding(addr, REG_SV, 1, &mut read_back)?;
        let got = read_back[0] as i16;
        if sv_x10.abs_diff(got) > SV_VERIFY_TOLERANCE_X10 {
            warn!(
                "poller: SV verify mismatch on controller {addr}: wrote {sv_x10}, read {got}"
            );
            return Err(BusError::VerifyMismatch {
                wrote: sv_x10 as u16,
                read_back: got as u16,
            });
        }
        let mut cache = lock(&self.cache);
        cache.records[idx].sv_x10 = got;
        Ok(())
    }

    /// Write the controller mode register and verify by exact read-back.
    pub fn set_mode(&self, addr: u8, mode: u8) -> Result<(), BusError> {
        let idx = Self::index_of(addr).ok_or(BusError::InvalidAddr(addr))?;
        self.master.write_single(addr, REG_MODE, mode as u16)?;
        let mut read_back = [0u16; 1];
        self.master.read_holding(addr, REG_MODE, 1, &mut read_back)?;
        if read_back[0] != mode as u16 {
            warn!(
                "poller: mode verify mismatch on controller {addr}: wrote {mode}, read {}",
                read_back[0]
            );
            return Err(BusError::VerifyMismatch {
                wrote: mode as u16,
                read_back: read_back[0],
            });
        }
        let mut cache = lock(&self.cache);
        cache.records[idx].mode = mode;
        Ok(())
    }

    /// Raw register read for the diagnostic command path.
    pub fn read_registers(
        &self,
        addr: u8,
        start: u16,
        count: u8,
        out: &mut [u16],
    ) -> Result<(), BusError> {
        self.master.read_holding(addr, start, count, out)
    }

    /// Raw register write with read-back; returns the verified value.
    pub fn write_register(&self, addr: u8, reg: u16, value: u16) -> Result<u16, BusError> {
        self.master.write_single(addr, reg, value)?;
        let mut read_back = [0u16; 1];
        self.master.read_holding(addr, reg, 1, &mut read_back)?;
        if read_back[0] != value {
            return Err(BusError::VerifyMismatch {
                wrote: value,
                read_back: read_back[0],
            });
        }
        Ok(read_back[0])
    }

    // -------------- Views --------------

    /// Copy of all records, for gates and telemetry.
    pub fn records(&self) -> [ControllerRecord; 3] {
        lock(&self.cache).records
    }

    /// Record for a single controller address.
    pub fn record(&self, addr: u8) -> Option<ControllerRecord> {
        Self::index_of(addr).map(|idx| lock(&self.cache).records[idx])
    }

    // -------------- Internals --------------

    fn index_of(addr: u8) -> Option<usize> {
        CONTROLLER_ADDRS.iter().position(|&a| a == addr)
    }

    /// One complete poll of `records[idx]`: block read, mode sub-read,
    /// record update.
    fn poll_index(&self, idx: usize, now: Instant) -> Result<(), BusError> {
        let addr = CONTROLLER_ADDRS[idx];
        let mut block = [0u16; REG_BLOCK_LEN as usize];
        let block_result = self
            .master
            .read_holding(addr, REG_BLOCK_START, REG_BLOCK_LEN, &mut block);

        match block_result {
            Ok(()) => {
                // A failed MODE sub-read is not a poll failure; keep the
                // previous mode.
                let mut mode_reg = [0u16; 1];
                let mode = self
                    .master
                    .read_holding(addr, REG_MODE, 1, &mut mode_reg)
                    .ok()
                    .map(|_| mode_reg[0] as u8);

                let mut cache = lock(&self.cache);
                let rec = &mut cache.records[idx];
                let prior = rec.state;
                rec.total_polls += 1;
                rec.consec_errors = 0;
                rec.pv_x10 = block[REG_PV] as i16;
                rec.output_x10 = block[REG_MV1];
                rec.status_flags = block[REG_STATUS];
                rec.sv_x10 = block[REG_SV_OFFSET] as i16;
                if let Some(mode) = mode {
                    rec.mode = mode;
                }
                rec.last_update = now;
                rec.state = ControllerState::Online;
                drop(cache);

                if matches!(prior, ControllerState::Unknown | ControllerState::Offline) {
                    info!("poller: controller {addr} online");
                    self.events.emit(Event::new(
                        EventId::Rs485DeviceOnline,
                        Severity::Info,
                        EventSource::Poller,
                        &[addr],
                    ));
                }
                Ok(())
            }
            Err(err) => {
                let mut cache = lock(&self.cache);
                let rec = &mut cache.records[idx];
                let prior = rec.state;
                rec.total_polls += 1;
                rec.total_errors += 1;
                rec.consec_errors += 1;
                let (went_offline, total_errors) = if rec.consec_errors
                    >= OFFLINE_ERROR_THRESHOLD
                    && prior.is_linked()
                {
                    rec.state = ControllerState::Offline;
                    (true, rec.total_errors)
                } else {
                    if prior == ControllerState::Online {
                        rec.state = ControllerState::Stale;
                    }
                    (false, rec.total_errors)
                };
                drop(cache);

                if went_offline {
                    warn!(
                        "poller: controller {addr} offline after {OFFLINE_ERROR_THRESHOLD} \
                         consecutive errors ({total_errors} total): {err}"
                    );
                    self.events.emit(Event::new(
                        EventId::Rs485DeviceOffline,
                        Severity::Warn,
                        EventSource::Poller,
                        &[addr],
                    ));
                } else {
                    debug!("poller: controller {addr} poll failed: {err}");
                }
                Err(err)
            }
        }
    }

    /// Recompute fast/slow mode; returns true when slow. Logs and emits on
    /// every transition.
    fn update_mode(&self, now: Instant) -> bool {
        let timeout_min = self.idle_timeout_min.load(Ordering::Relaxed);
        let idle_ms = now
            .as_millis()
            .saturating_sub(self.last_activity_ms.load(Ordering::Relaxed));
        let slow = timeout_min > 0 && idle_ms > timeout_min * 60_000;

        let mut cache = lock(&self.cache);
        if cache.slow_active != slow {
            cache.slow_active = slow;
            drop(cache);
            info!(
                "poller: {} polling (idle {idle_ms} ms, timeout {timeout_min} min)",
                if slow { "slow" } else { "fast" }
            );
            self.events.emit(Event::new(
                EventId::PollModeChanged,
                Severity::Info,
                EventSource::Poller,
                &[slow as u8],
            ));
        }
        slow
    }

    /// Degrade Online records whose data has aged out.
    fn sweep_staleness(&self, now: Instant) {
        let mut cache = lock(&self.cache);
        let threshold = if cache.slow_active {
            STALE_THRESHOLD_SLOW_MS
        } else {
            STALE_THRESHOLD_FAST_MS
        };
        for rec in cache.records.iter_mut() {
            if rec.state == ControllerState::Online
                && now.millis_since(rec.last_update) > threshold
            {
                debug!("poller: controller {} stale (no data for {threshold}+ ms)", rec.addr);
                rec.state = ControllerState::Stale;
            }
        }
    }
}
