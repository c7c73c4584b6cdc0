/*!
Event catalog and the sink seam.

Events are produced by the machine state, the poller and the session layer,
never by the periodic telemetry tick. Producers hand an `Event` to an
`EventSink`; the control unit's sink frames it (`msg_type = EVENT`) and
forwards it to the transport, preferring the reliable notification path for
ALARM and CRITICAL severities.

Wire payload: `{event_id:u16 LE, severity:u8, source:u8, data bytes}`.
*/

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Catalog of event identifiers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum EventId {
    StateChanged = 0x0001,
    RunStarted = 0x0002,
    RunStopped = 0x0003,
    RunAborted = 0x0004,
    PrecoolComplete = 0x0005,
    EstopAsserted = 0x0006,
    EstopCleared = 0x0007,
    FaultRaised = 0x0008,
    FaultCleared = 0x0009,
    ServiceEntered = 0x000A,
    ServiceExited = 0x000B,
    Rs485DeviceOnline = 0x0020,
    Rs485DeviceOffline = 0x0021,
    PollModeChanged = 0x0022,
    SessionStale = 0x0030,
}

/// Event severity, ascending.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Severity {
    Info = 0,
    Warn = 1,
    Alarm = 2,
    Critical = 3,
}

/// Producing component, for the wire `source` byte.
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum EventSource {
    Machine = 1,
    Poller = 2,
    Session = 3,
}

/// One emitted event. `data` is small and event-specific (state pairs,
/// controller addresses); events are rare enough that a heap buffer is fine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub id: EventId,
    pub severity: Severity,
    pub source: EventSource,
    pub data: Vec<u8>,
}

impl Event {
    pub fn new(id: EventId, severity: Severity, source: EventSource, data: &[u8]) -> Self {
        Self {
            id,
            severity,
            source,
            data: data.to_vec(),
        }
    }

    /// Serialize to the EVENT frame payload.
    pub fn to_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(4 + self.data.len());
        payload.extend_from_slice(&u16::from(self.id).to_le_bytes());
        payload.push(self.severity.into());
        payload.push(self.source.into());
        payload.extend_from_slice(&self.data);
        payload
    }

    /// ALARM and CRITICAL events prefer the reliable notification path.
    pub fn wants_reliable(&self) -> bool {
        self.severity >= Severity::Alarm
    }
}

/// Seam between event producers and the transport glue. Implementations must
/// not call back into the producer while handling `emit` (producers hold
/// their own lock at the call site).
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Sink that drops everything; placeholder for headless construction.
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _event: Event) {}
}
