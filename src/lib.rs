#![doc = r#"
Cryomill controller core.

Embedded control plane for a cryogenic shaker ball mill: the controller owns
eight relay outputs, eight digital inputs, three PID temperature controllers
on a half-duplex field bus, and a framed binary protocol to an operator
tablet. This crate is the hardware-independent core; the traits in `hal`
are the seam to real drivers, to the simulator binary, and to the test
harness.

Modules:
- hal: hardware surface traits (clock, inputs, relays, serial bus, storage,
  transport) and the millisecond `Instant`
- wire: framed tablet protocol (header + payload + CRC-16/CCITT-FALSE)
- fieldbus: half-duplex request/response master (CRC-16/MODBUS)
- session: single operator session with a keepalive lease
- safety: capability levels and bypassable safety gates
- machine: the process state machine, relay bank and input snapshot
- poller: round-robin PID controller poller with fast/slow cadence
- telemetry: 10 Hz telemetry producer and the alarm word
- events: event catalog and the sink seam
- dispatch: command routing and ACK production
- unit: the `ControlUnit` facade and tick scheduler

In tests, shared mock hardware and a full-unit harness are available under
`crate::test_utils`.
"#]

pub mod dispatch;
pub mod events;
pub mod fieldbus;
pub mod hal;
pub mod machine;
pub mod poller;
pub mod safety;
pub mod session;
pub mod telemetry;
pub mod unit;
pub mod wire;

// Re-export commonly used types at the crate root for convenience.
pub use hal::Instant;
pub use machine::MachineState;
pub use unit::{ControlUnit, Hardware};

// Shared test utilities (only compiled for tests)
#[cfg(test)]
pub mod test_utils;
