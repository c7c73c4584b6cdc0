/*!
Transaction sequencer for the half-duplex bus.

One transaction at a time, serialized by the line mutex (lock-order slot 2,
below `poller_cache` and `machine_state`):

1. Acquire the line, bounded by `BUS_ACQUIRE_TIMEOUT_MS` (else `Busy`).
2. Honor the inter-frame gap since the previous transaction completed.
3. Hand the request to the serial surface, which owns direction control,
   receive flushing and trailing-byte accumulation; the 100 ms response
   deadline starts at transmit completion.
4. Validate: length, exception bit, CRC, address/function echo.

The serial exchange blocks for at most gap + deadline, so total bus
occupancy per transaction is bounded and two transactions never overlap.
*/

use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use log::trace;

use crate::hal::{BusSerial, Clock, Instant};

use super::frame::{
    self, ECHO_RESPONSE_LEN, MAX_RESPONSE, check_write_echo, decode_read_response,
    encode_read_holding, encode_write_single, read_response_len,
};
use super::{BUS_ACQUIRE_TIMEOUT_MS, BusError, INTER_FRAME_GAP_MS, RESPONSE_TIMEOUT_MS};

struct LineState {
    /// Completion time of the previous transaction, for gap pacing.
    last_done: Instant,
}

/// Request/response master. Shared across the poller and the command
/// dispatcher; every public call is one complete, validated transaction.
pub struct BusMaster {
    port: Arc<dyn BusSerial>,
    clock: Arc<dyn Clock>,
    line: Mutex<LineState>,
}

impl BusMaster {
    pub fn new(port: Arc<dyn BusSerial>, clock: Arc<dyn Clock>) -> Self {
        Self {
            port,
            clock,
            line: Mutex::new(LineState {
                last_done: Instant::ZERO,
            }),
        }
    }

    /// Read `out.len().min(count)` holding registers starting at `start`.
    pub fn read_holding(
        &self,
        addr: u8,
        start: u16,
        count: u8,
        out: &mut [u16],
    ) -> Result<(), BusError> {
        let request = encode_read_holding(addr, start, count)?;
        let mut response = [0u8; MAX_RESPONSE];
        let got = self.exchange(&request, read_response_len(count), &mut response)?;
        decode_read_response(addr, count, &response[..got], out)
    }

    /// Write one holding register and validate the device's echo.
    pub fn write_single(&self, addr: u8, reg: u16, value: u16) -> Result<(), BusError> {
        let request = encode_write_single(addr, reg, value)?;
        let mut response = [0u8; MAX_RESPONSE];
        let got = self.exchange(&request, ECHO_RESPONSE_LEN, &mut response)?;
        check_write_echo(&request, &response[..got])
    }

    /// Write consecutive holding registers (configuration path).
    pub fn write_multiple(&self, addr: u8, start: u16, values: &[u16]) -> Result<(), BusError> {
        let request = frame::encode_write_multiple(addr, start, values)?;
        let mut response = [0u8; MAX_RESPONSE];
        // Write-multiple acknowledgements echo addr/fn/start/count (6 bytes + CRC).
        let got = self.exchange(&request, ECHO_RESPONSE_LEN, &mut response)?;
        check_write_echo(&request, &response[..got])
    }

    /// One paced exchange on the line. Returns received byte count.
    fn exchange(
        &self,
        request: &[u8],
        expected_min: usize,
        response: &mut [u8],
    ) -> Result<usize, BusError> {
        let mut line = self.acquire()?;

        let now = self.clock.now();
        let quiet = now.millis_since(line.last_done);
        if quiet < INTER_FRAME_GAP_MS {
            self.clock.sleep(INTER_FRAME_GAP_MS - quiet);
        }

        let result = self.port.transact(request, response, RESPONSE_TIMEOUT_MS);
        line.last_done = self.clock.now();

        match result {
            Some(n) => {
                trace!(
                    "bus: {} -> {} bytes (expected >= {})",
                    request.len(),
                    n,
                    expected_min
                );
                Ok(n)
            }
            None => {
                trace!("bus: {} byte request timed out", request.len());
                Err(BusError::Timeout)
            }
        }
    }

    /// Take the line mutex, waiting up to the acquire budget.
    fn acquire(&self) -> Result<MutexGuard<'_, LineState>, BusError> {
        let mut waited = 0u64;
        loop {
            match self.line.try_lock() {
                Ok(guard) => return Ok(guard),
                Err(TryLockError::Poisoned(poisoned)) => return Ok(poisoned.into_inner()),
                Err(TryLockError::WouldBlock) => {
                    if waited >= BUS_ACQUIRE_TIMEOUT_MS {
                        return Err(BusError::Busy);
                    }
                    self.clock.sleep(1);
                    waited += 1;
                }
            }
        }
    }
}
