/*!
Hardware surfaces consumed by the control core.

The core never talks to a peripheral directly; every piece of hardware is
reached through one of the traits below. Production firmware implements them
over the real I/O expanders, the half-duplex UART, non-volatile storage and
the wireless link. Tests and the bundled simulator implement them in memory.

Surfaces:
- `Clock`: monotonic milliseconds since boot, plus a bounded sleep.
- `DigitalInputs`: one 8-bit snapshot of the input expander; `None` when the
  expander does not answer (the caller substitutes safe defaults).
- `RelayOutputs`: drives the 8-bit relay bank in one write.
- `BusSerial`: one half-duplex request/response exchange on the field bus.
  The implementation owns direction control, receive-buffer flushing and
  trailing-byte accumulation; the caller owns framing, pacing and CRC.
- `KvStore`: small persistent values under `(namespace, key)`.
- `Transport`: outbound framed channels of the wireless link plus the
  subscription signal. Inbound command frames arrive by the host calling
  `ControlUnit::on_command`.

Notes:
- All traits take `&self`; implementations use interior mutability where they
  need state. Every shared handle in the core is an `Arc<dyn Trait>`.
- Time is a plain millisecond counter (`Instant`) rather than
  `std::time::Instant` so tests can drive it forward deterministically.
*/

use std::sync::{Mutex, MutexGuard};

/// A point on the monotonic millisecond clock.
///
/// Wraps a `u64`, so rollover is not a practical concern (584 million years).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Instant(u64);

impl Instant {
    pub const ZERO: Instant = Instant(0);

    #[inline]
    pub const fn from_millis(ms: u64) -> Self {
        Instant(ms)
    }

    #[inline]
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    /// Milliseconds elapsed since `earlier`, saturating to 0 if `earlier` is
    /// in the future (callers compare instants from the same clock, but a
    /// negative delta must never underflow).
    #[inline]
    pub const fn millis_since(self, earlier: Instant) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    #[inline]
    pub const fn add_millis(self, ms: u64) -> Instant {
        Instant(self.0.saturating_add(ms))
    }
}

/// Monotonic time source.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    /// Block the calling task for `ms` milliseconds.
    ///
    /// The field-bus master uses this for the inter-frame gap and the busy
    /// back-off. Simulated clocks advance themselves here instead of
    /// sleeping so tests stay instantaneous.
    fn sleep(&self, ms: u64);
}

/// `Clock` backed by `std::time::Instant`, for the real scheduler loop.
pub struct WallClock {
    epoch: std::time::Instant,
}

impl WallClock {
    pub fn new() -> Self {
        Self {
            epoch: std::time::Instant::now(),
        }
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for WallClock {
    fn now(&self) -> Instant {
        Instant::from_millis(self.epoch.elapsed().as_millis() as u64)
    }

    fn sleep(&self, ms: u64) {
        std::thread::sleep(std::time::Duration::from_millis(ms));
    }
}

/// Digital-input expander: 8 input bits per read.
pub trait DigitalInputs: Send + Sync {
    /// `None` when the expander is absent or not answering.
    fn read(&self) -> Option<u8>;
}

/// Relay-output expander: 8 output bits per write.
pub trait RelayOutputs: Send + Sync {
    fn write(&self, bits: u8);
}

/// Half-duplex request/response exchange on the field bus.
pub trait BusSerial: Send + Sync {
    /// Transmit `tx`, then receive into `rx` until the device stops sending
    /// or `deadline_ms` elapses (measured from transmit completion).
    ///
    /// Returns the number of bytes received, or `None` on timeout with
    /// nothing received. Partial receptions are returned as-is; the caller
    /// validates length and CRC.
    fn transact(&self, tx: &[u8], rx: &mut [u8], deadline_ms: u64) -> Option<usize>;
}

/// Persistent key/value storage with per-key atomicity.
pub trait KvStore: Send + Sync {
    fn read(&self, ns: &str, key: &str) -> Option<Vec<u8>>;
    fn write(&self, ns: &str, key: &str, value: &[u8]);
}

/// Outbound side of the wireless link.
pub trait Transport: Send + Sync {
    /// Telemetry channel (unreliable, latest-wins).
    fn send_telemetry(&self, frame: &[u8]);

    /// Notification channel for ACKs and events. `reliable` selects the
    /// acknowledged path where the link distinguishes them.
    fn send_event(&self, frame: &[u8], reliable: bool);

    /// True while the peer is subscribed to telemetry.
    fn subscribed(&self) -> bool;
}

/// Lock a component mutex, recovering the guard if a previous holder
/// panicked. Component state stays internally consistent across a poisoned
/// lock because every mutation completes before the guard drops.
#[inline]
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
