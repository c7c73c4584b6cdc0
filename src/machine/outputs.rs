/*!
Relay bank: the eight output channels and their cached mirror.

Channel map (channel N is bit N-1 of the hardware byte):
1. MAIN_CONTACTOR   - three-phase power to the drive
2. MOTOR_START      - shaker motor run signal
3. HEATER_1         - jar heater zone 1
4. HEATER_2         - jar heater zone 2
5. LN2_VALVE        - liquid-nitrogen solenoid
6. DOOR_LOCK        - chamber door solenoid lock
7. CHAMBER_LIGHT    - operator light
8. unused

Every write goes through the cached mirror under the `relay_mirror` mutex
(lock-order slot 1): mutate the mirror, push the full byte to hardware, and
publish the same byte to telemetry. The hardware is never read back; the
mirror is authoritative.
*/

use std::sync::{Arc, Mutex};

use bitflags::bitflags;

use crate::hal::{RelayOutputs, lock};

bitflags! {
    /// Relay channels by function. Channel N on the silkscreen is bit N-1.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct RelayBits: u8 {
        const MAIN_CONTACTOR = 1 << 0;
        const MOTOR_START = 1 << 1;
        const HEATER_1 = 1 << 2;
        const HEATER_2 = 1 << 3;
        const LN2_VALVE = 1 << 4;
        const DOOR_LOCK = 1 << 5;
        const CHAMBER_LIGHT = 1 << 6;
        const SPARE = 1 << 7;
    }
}

impl RelayBits {
    /// Channels that switch power: contactor, motor, heaters, LN2 valve.
    /// These are the bits forced off by every safe-state entry.
    pub const POWER: RelayBits = RelayBits::MAIN_CONTACTOR
        .union(RelayBits::MOTOR_START)
        .union(RelayBits::HEATER_1)
        .union(RelayBits::HEATER_2)
        .union(RelayBits::LN2_VALVE);

    /// Map a wire channel index (1-8) to its bit.
    pub fn from_channel(idx: u8) -> Option<RelayBits> {
        if (1..=8).contains(&idx) {
            RelayBits::from_bits(1 << (idx - 1))
        } else {
            None
        }
    }
}

/// Owner of the relay mirror and the hardware write path.
pub struct RelayBank {
    hw: Arc<dyn RelayOutputs>,
    mirror: Mutex<RelayBits>,
}

impl RelayBank {
    /// All channels start off; the expander powers up cleared.
    pub fn new(hw: Arc<dyn RelayOutputs>) -> Self {
        let bank = Self {
            hw,
            mirror: Mutex::new(RelayBits::empty()),
        };
        bank.hw.write(0);
        bank
    }

    /// Apply an edit to the mirror and push the result to hardware.
    /// Returns the new byte. No-op edits (the tick clamp re-asserting an
    /// already-correct state) skip the hardware write.
    pub fn apply(&self, edit: impl FnOnce(RelayBits) -> RelayBits) -> u8 {
        let mut mirror = lock(&self.mirror);
        let next = edit(*mirror);
        let bits = next.bits();
        if next != *mirror {
            *mirror = next;
            self.hw.write(bits);
        }
        bits
    }

    /// Set or clear the named channels.
    pub fn set(&self, channels: RelayBits, on: bool) -> u8 {
        self.apply(|mut cur| {
            cur.set(channels, on);
            cur
        })
    }

    /// Masked update: `new = (cur & !mask) | (values & mask)`.
    pub fn set_masked(&self, mask: u8, values: u8) -> u8 {
        self.apply(|cur| RelayBits::from_bits_truncate((cur.bits() & !mask) | (values & mask)))
    }

    /// Toggle the named channels.
    pub fn toggle(&self, channels: RelayBits) -> u8 {
        self.apply(|cur| cur ^ channels)
    }

    /// Current mirror byte, as published in telemetry.
    pub fn bits(&self) -> u8 {
        lock(&self.mirror).bits()
    }

    pub fn is_on(&self, channel: RelayBits) -> bool {
        lock(&self.mirror).contains(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct SpyRelays {
        writes: StdMutex<Vec<u8>>,
    }

    impl RelayOutputs for SpyRelays {
        fn write(&self, bits: u8) {
            self.writes.lock().unwrap().push(bits);
        }
    }

    fn bank() -> (Arc<SpyRelays>, RelayBank) {
        let spy = Arc::new(SpyRelays {
            writes: StdMutex::new(Vec::new()),
        });
        let bank = RelayBank::new(spy.clone());
        (spy, bank)
    }

    #[test]
    fn channel_mapping() {
        assert_eq!(RelayBits::from_channel(1), Some(RelayBits::MAIN_CONTACTOR));
        assert_eq!(RelayBits::from_channel(6), Some(RelayBits::DOOR_LOCK));
        assert_eq!(RelayBits::from_channel(8), Some(RelayBits::SPARE));
        assert_eq!(RelayBits::from_channel(0), None);
        assert_eq!(RelayBits::from_channel(9), None);
    }

    #[test]
    fn every_mutation_reaches_hardware() {
        let (spy, bank) = bank();
        bank.set(RelayBits::CHAMBER_LIGHT, true);
        bank.set(RelayBits::DOOR_LOCK | RelayBits::LN2_VALVE, true);
        bank.set(RelayBits::CHAMBER_LIGHT, false);
        let writes = spy.writes.lock().unwrap();
        // Construction write plus three mutations.
        assert_eq!(*writes, vec![0x00, 0x40, 0x70, 0x30]);
        assert_eq!(bank.bits(), 0x30);
    }

    #[test]
    fn masked_update_semantics() {
        let (_, bank) = bank();
        bank.set_masked(0xFF, 0b0000_0101);
        // Only masked channels change.
        bank.set_masked(0b0000_0001, 0b0000_0000);
        assert_eq!(bank.bits(), 0b0000_0100);
        // Values outside the mask are ignored.
        bank.set_masked(0b0000_0010, 0b1111_1111);
        assert_eq!(bank.bits(), 0b0000_0110);
    }

    #[test]
    fn toggle_flips_only_named_channels() {
        let (_, bank) = bank();
        bank.set(RelayBits::HEATER_1, true);
        bank.toggle(RelayBits::HEATER_1 | RelayBits::HEATER_2);
        assert!(!bank.is_on(RelayBits::HEATER_1));
        assert!(bank.is_on(RelayBits::HEATER_2));
    }

    #[test]
    fn power_group_covers_channels_1_to_5() {
        assert_eq!(RelayBits::POWER.bits(), 0b0001_1111);
    }
}
