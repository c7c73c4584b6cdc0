/*!
Digital-input snapshot.

One 8-bit read of the input expander per machine tick:
- bit 0: E-stop chain, active LOW (0 = pressed / chain broken)
- bit 1: door switch, HIGH = closed
- bit 2: LN2 supply present, HIGH = present
- bit 3: motor-fault input, reserved (no hardware drives it today)
- bits 4-7: unused

When the expander does not answer, the snapshot substitutes 0x07: E-stop
released, door closed, LN2 present. An absent expander must not strand the
machine in E_STOP; the capability levels decide whether the door and LN2
inputs matter at all.
*/

use bitflags::bitflags;

bitflags! {
    /// Raw input bits as read from the expander.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct DiBits: u8 {
        /// E-stop chain intact (active-low input: set = not pressed).
        const ESTOP_N = 1 << 0;
        /// Door switch: set = closed.
        const DOOR_CLOSED = 1 << 1;
        /// LN2 supply: set = present.
        const LN2_PRESENT = 1 << 2;
        /// Reserved motor-fault input.
        const MOTOR_FAULT = 1 << 3;
    }
}

/// Substitute when the expander is unavailable: E-stop released, door
/// closed, LN2 present.
pub const DI_SAFE_DEFAULT: u8 = 0x07;

/// One sampled snapshot of the digital inputs.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DiSnapshot {
    bits: DiBits,
    available: bool,
}

impl DiSnapshot {
    /// Build from a raw expander read; `None` means the expander did not
    /// answer and the safe default is substituted.
    pub fn from_raw(raw: Option<u8>) -> Self {
        match raw {
            Some(bits) => Self {
                bits: DiBits::from_bits_truncate(bits),
                available: true,
            },
            None => Self {
                bits: DiBits::from_bits_truncate(DI_SAFE_DEFAULT),
                available: false,
            },
        }
    }

    /// Snapshot that reads as all-safe; the state before the first tick.
    pub fn safe_default() -> Self {
        Self::from_raw(Some(DI_SAFE_DEFAULT))
    }

    #[inline]
    pub fn estop_pressed(&self) -> bool {
        // Active low: the bit reads 0 when the chain is broken.
        !self.bits.contains(DiBits::ESTOP_N)
    }

    #[inline]
    pub fn door_closed(&self) -> bool {
        self.bits.contains(DiBits::DOOR_CLOSED)
    }

    #[inline]
    pub fn ln2_present(&self) -> bool {
        self.bits.contains(DiBits::LN2_PRESENT)
    }

    /// Reserved; reported in telemetry as raw state but never acted on.
    #[inline]
    pub fn motor_fault(&self) -> bool {
        self.bits.contains(DiBits::MOTOR_FAULT)
    }

    #[inline]
    pub fn raw(&self) -> u8 {
        self.bits.bits()
    }

    /// False when the snapshot is the substituted safe default.
    #[inline]
    pub fn expander_available(&self) -> bool {
        self.available
    }
}
