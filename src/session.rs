/*!
Single operator session with a keepalive lease.

The tablet opens a session with a client nonce, then must keep it alive at
least every `lease_ms`. The telemetry tick drives expiry: a session whose
lease (plus grace) has lapsed drops from Live to Stale, which raises the
HMI-stale alarm bit and makes the machine state begin a graceful stop of any
active run. A KEEPALIVE revives a Stale session; a transport disconnect
destroys it outright.

Exactly one session exists at a time; a new OPEN_SESSION replaces the old
one (the tablet reconnecting is the common case).

Session ids are nonzero random u32 values drawn from OS entropy; zero is
reserved for "no session" on the wire.
*/

use std::sync::Mutex;

use log::{info, warn};
use thiserror::Error;

use crate::events::{Event, EventId, EventSink, EventSource, Severity};
use crate::hal::{Instant, lock};

/// Default lease duration handed to the client on open.
pub const DEFAULT_LEASE_MS: u16 = 3000;

/// Slack beyond the lease before a Live session is declared Stale.
pub const GRACE_MS: u64 = 500;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    None,
    Live,
    Stale,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session id does not match the open session")]
    InvalidSession,
    #[error("entropy source unavailable")]
    Entropy,
}

struct SessionInner {
    id: u32,
    client_nonce: u32,
    lease_ms: u16,
    last_keepalive: Instant,
    state: SessionState,
}

/// The session component. One per control unit.
pub struct Session {
    inner: Mutex<SessionInner>,
    events: std::sync::Arc<dyn EventSink>,
}

impl Session {
    pub fn new(events: std::sync::Arc<dyn EventSink>) -> Self {
        Self {
            inner: Mutex::new(SessionInner {
                id: 0,
                client_nonce: 0,
                lease_ms: DEFAULT_LEASE_MS,
                last_keepalive: Instant::ZERO,
                state: SessionState::None,
            }),
            events,
        }
    }

    /// Open (or replace) the session. Returns `(id, lease_ms)`.
    pub fn open(&self, nonce: u32, now: Instant) -> Result<(u32, u16), SessionError> {
        let id = random_nonzero_id()?;
        let mut inner = lock(&self.inner);
        if inner.state != SessionState::None {
            info!(
                "session: replacing session {:#010x} with a new open",
                inner.id
            );
        }
        inner.id = id;
        inner.client_nonce = nonce;
        inner.lease_ms = DEFAULT_LEASE_MS;
        inner.last_keepalive = now;
        inner.state = SessionState::Live;
        info!("session: opened {id:#010x} (nonce {nonce:#010x})");
        Ok((id, DEFAULT_LEASE_MS))
    }

    /// Refresh the lease. Revives a Stale session.
    pub fn keepalive(&self, id: u32, now: Instant) -> Result<(), SessionError> {
        let mut inner = lock(&self.inner);
        if inner.state == SessionState::None || inner.id != id {
            return Err(SessionError::InvalidSession);
        }
        if inner.state == SessionState::Stale {
            info!("session: {id:#010x} revived by keepalive");
        }
        inner.state = SessionState::Live;
        inner.last_keepalive = now;
        Ok(())
    }

    /// Expiry sweep, called once per telemetry period. Returns liveness.
    pub fn tick(&self, now: Instant) -> bool {
        let mut inner = lock(&self.inner);
        if inner.state == SessionState::Live {
            let budget = inner.lease_ms as u64 + GRACE_MS;
            let silent = now.millis_since(inner.last_keepalive);
            if silent > budget {
                warn!(
                    "session: {:#010x} stale after {silent} ms without keepalive",
                    inner.id
                );
                inner.state = SessionState::Stale;
                let id = inner.id;
                drop(inner);
                self.events.emit(Event::new(
                    EventId::SessionStale,
                    Severity::Warn,
                    EventSource::Session,
                    &id.to_le_bytes(),
                ));
                return false;
            }
        }
        inner.state == SessionState::Live
    }

    /// Called on transport disconnect: the session is gone, not just stale.
    pub fn force_expire(&self) {
        let mut inner = lock(&self.inner);
        if inner.state != SessionState::None {
            info!("session: {:#010x} force-expired on disconnect", inner.id);
        }
        inner.id = 0;
        inner.client_nonce = 0;
        inner.state = SessionState::None;
    }

    pub fn is_live(&self) -> bool {
        lock(&self.inner).state == SessionState::Live
    }

    pub fn state(&self) -> SessionState {
        lock(&self.inner).state
    }

    /// True only for the open, Live session's id. Commands carrying a
    /// session id gate on this.
    pub fn validate(&self, id: u32) -> bool {
        let inner = lock(&self.inner);
        inner.state == SessionState::Live && inner.id == id && id != 0
    }

    /// The client nonce presented at open, for diagnostics.
    pub fn client_nonce(&self) -> u32 {
        lock(&self.inner).client_nonce
    }
}

/// Draw a random nonzero session id from OS entropy.
fn random_nonzero_id() -> Result<u32, SessionError> {
    // Zero is reserved; redraw on the (1 in 2^32) collision.
    for _ in 0..4 {
        let mut bytes = [0u8; 4];
        getrandom::getrandom(&mut bytes).map_err(|_| SessionError::Entropy)?;
        let id = u32::from_le_bytes(bytes);
        if id != 0 {
            return Ok(id);
        }
    }
    Err(SessionError::Entropy)
}
