/*!
Half-duplex field-bus master reaching the PID temperature controllers.

Framing (distinct from the tablet wire protocol in `wire`):

```text
+---------+----------+---------------------+--------+
| address | function | function body       | crc    |
| u8      | u8       | bytes (big-endian)  | u16 LE |
+---------+----------+---------------------+--------+
```

The CRC is the reflected MODBUS variant (polynomial 0xA001 reflected, init
0xFFFF), a different algorithm from the wire CRC; keep the two apart.
Register values travel big-endian inside the body, as the controllers expect.

Functions: 0x03 read-holding, 0x06 write-single, 0x10 write-multiple. A
device signals an exception by echoing the function code with the high bit
set, followed by a one-byte exception code.

Submodules:
- crc: the MODBUS CRC-16 variant.
- frame: request encoding and response validation.
- master: the transaction sequencer (pacing, deadline, mutex).
*/

pub mod crc;
pub mod frame;
pub mod master;

pub use master::BusMaster;

use thiserror::Error;

/// Lowest and highest valid device addresses on the bus.
pub const ADDR_MIN: u8 = 1;
pub const ADDR_MAX: u8 = 247;

/// Function codes understood by the controllers.
pub const FN_READ_HOLDING: u8 = 0x03;
pub const FN_WRITE_SINGLE: u8 = 0x06;
pub const FN_WRITE_MULTIPLE: u8 = 0x10;

/// Minimum quiet time between transactions.
pub const INTER_FRAME_GAP_MS: u64 = 5;

/// Response deadline, measured from transmit completion.
pub const RESPONSE_TIMEOUT_MS: u64 = 100;

/// How long a caller waits for the bus mutex before reporting `Busy`.
pub const BUS_ACQUIRE_TIMEOUT_MS: u64 = 500;

/// Most registers one read-holding request may ask for.
pub const MAX_READ_COUNT: u8 = 16;

/// Field-bus failures.
///
/// A single failed transaction never implies the device is offline; the
/// poller applies its consecutive-error threshold before degrading a
/// controller record.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("no response within the deadline")]
    Timeout,
    #[error("response CRC mismatch")]
    Crc,
    #[error("device exception {0:#04x}")]
    Exception(u8),
    #[error("device address {0} outside 1..=247")]
    InvalidAddr(u8),
    #[error("register or count rejected by the device")]
    InvalidReg,
    #[error("malformed response frame")]
    Frame,
    #[error("bus busy: mutex not acquired in {BUS_ACQUIRE_TIMEOUT_MS} ms")]
    Busy,
    #[error("bus master not initialized")]
    NotInit,
    #[error("write verify mismatch: wrote {wrote:#06x}, read back {read_back:#06x}")]
    VerifyMismatch { wrote: u16, read_back: u16 },
}
