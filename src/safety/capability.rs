/*!
Subsystem capability levels.

The operator declares, per subsystem, how its faults are treated:
- NotPresent: hardware not fitted; related gates never block.
- Optional: monitored and reported, but never blocks or aborts a run.
- Required: a fault blocks run start and aborts a running cycle.

Levels persist in the `safety` namespace, one byte per subsystem, and load
at boot with per-subsystem defaults. The E-stop input is pinned Required and
is never stored or mutated.
*/

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Persistent namespace for capability levels.
pub const KV_NS: &str = "safety";

/// How a subsystem's faults are treated.
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum CapabilityLevel {
    NotPresent = 0,
    Optional = 1,
    Required = 2,
}

/// Subsystems with a configurable capability level.
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Subsystem {
    Pid1 = 0,
    Pid2 = 1,
    Pid3 = 2,
    DiEstop = 3,
    DiDoor = 4,
    DiLn2 = 5,
    DiMotor = 6,
}

/// Iteration order matches the wire capability vector.
pub const ALL_SUBSYSTEMS: [Subsystem; 7] = [
    Subsystem::Pid1,
    Subsystem::Pid2,
    Subsystem::Pid3,
    Subsystem::DiEstop,
    Subsystem::DiDoor,
    Subsystem::DiLn2,
    Subsystem::DiMotor,
];

impl Subsystem {
    /// Persistent key; `None` for the pinned E-stop subsystem, which is
    /// never stored.
    pub fn kv_key(self) -> Option<&'static str> {
        match self {
            Subsystem::Pid1 => Some("cap_pid1"),
            Subsystem::Pid2 => Some("cap_pid2"),
            Subsystem::Pid3 => Some("cap_pid3"),
            Subsystem::DiEstop => None,
            Subsystem::DiDoor => Some("cap_di_door"),
            Subsystem::DiLn2 => Some("cap_di_ln2"),
            Subsystem::DiMotor => Some("cap_di_motor"),
        }
    }

    /// Boot default when no persisted value exists.
    pub fn default_level(self) -> CapabilityLevel {
        match self {
            Subsystem::Pid1 => CapabilityLevel::Optional,
            Subsystem::Pid2 => CapabilityLevel::Required,
            Subsystem::Pid3 => CapabilityLevel::Required,
            Subsystem::DiEstop => CapabilityLevel::Required,
            Subsystem::DiDoor => CapabilityLevel::Required,
            Subsystem::DiLn2 => CapabilityLevel::Optional,
            Subsystem::DiMotor => CapabilityLevel::NotPresent,
        }
    }

    /// The PID controller bus address behind this subsystem, if any.
    pub fn pid_addr(self) -> Option<u8> {
        match self {
            Subsystem::Pid1 => Some(1),
            Subsystem::Pid2 => Some(2),
            Subsystem::Pid3 => Some(3),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_safety_matrix() {
        assert_eq!(Subsystem::Pid1.default_level(), CapabilityLevel::Optional);
        assert_eq!(Subsystem::Pid2.default_level(), CapabilityLevel::Required);
        assert_eq!(Subsystem::Pid3.default_level(), CapabilityLevel::Required);
        assert_eq!(Subsystem::DiEstop.default_level(), CapabilityLevel::Required);
        assert_eq!(Subsystem::DiDoor.default_level(), CapabilityLevel::Required);
        assert_eq!(Subsystem::DiLn2.default_level(), CapabilityLevel::Optional);
        assert_eq!(
            Subsystem::DiMotor.default_level(),
            CapabilityLevel::NotPresent
        );
    }

    #[test]
    fn estop_has_no_storage_key() {
        assert_eq!(Subsystem::DiEstop.kv_key(), None);
        for s in ALL_SUBSYSTEMS {
            if s != Subsystem::DiEstop {
                assert!(s.kv_key().is_some());
            }
        }
    }

    #[test]
    fn wire_ids_round_trip() {
        for (i, s) in ALL_SUBSYSTEMS.iter().enumerate() {
            assert_eq!(u8::from(*s) as usize, i);
            assert_eq!(Subsystem::try_from(i as u8).unwrap(), *s);
        }
        assert!(Subsystem::try_from(7u8).is_err());
    }
}
