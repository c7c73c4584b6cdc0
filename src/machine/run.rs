/*!
Run context: parameters and timing of the active cycle.

Created on IDLE→PRECOOL, cleared on arrival back in IDLE. The elapsed
counter is segmented so time spent PAUSED does not advance it: the context
accumulates completed segments in `elapsed_base_ms` and measures the open
segment from `segment_start`.
*/

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::hal::Instant;

/// How the run behaves once precool completes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum RunMode {
    Normal = 0,
    /// Exercise the mechanics without cryogen: precool is skipped and the
    /// LN2 valve stays shut.
    DryRun = 1,
    /// Cool the chamber, then go straight to the stop soak.
    PrecoolOnly = 2,
}

/// STOP_RUN argument.
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum StopMode {
    /// Controlled stop through the STOPPING soak.
    Normal = 0,
    /// Straight to IDLE with outputs safe; no soak.
    Abort = 1,
}

/// PAUSE_RUN argument.
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum PauseMode {
    /// Keep the LN2 valve open so the chamber holds temperature.
    KeepCooling = 0,
    /// Close the LN2 valve for a longer interruption.
    StopCooling = 1,
}

/// Parameters and timers of the current run.
#[derive(Copy, Clone, Debug)]
pub struct RunContext {
    pub mode: RunMode,
    pub target_x10: i16,
    /// 0 means run until stopped.
    pub duration_ms: u32,
    pub recipe_step: u8,
    pub started: Instant,
    pub pause_mode: Option<PauseMode>,
    elapsed_base_ms: u64,
    /// `None` while paused.
    segment_start: Option<Instant>,
}

impl RunContext {
    pub fn new(mode: RunMode, target_x10: i16, duration_ms: u32, now: Instant) -> Self {
        Self {
            mode,
            target_x10,
            duration_ms,
            recipe_step: 0,
            started: now,
            pause_mode: None,
            elapsed_base_ms: 0,
            segment_start: Some(now),
        }
    }

    /// Active run time, excluding paused intervals.
    pub fn elapsed_ms(&self, now: Instant) -> u64 {
        let open = self
            .segment_start
            .map(|start| now.millis_since(start))
            .unwrap_or(0);
        self.elapsed_base_ms + open
    }

    /// Remaining run time; 0 for an indefinite run.
    pub fn remaining_ms(&self, now: Instant) -> u64 {
        (self.duration_ms as u64).saturating_sub(self.elapsed_ms(now))
    }

    /// True once a bounded run has consumed its duration.
    pub fn duration_done(&self, now: Instant) -> bool {
        self.duration_ms > 0 && self.elapsed_ms(now) >= self.duration_ms as u64
    }

    /// Freeze the elapsed counter (entering PAUSED).
    pub fn pause(&mut self, now: Instant) {
        if let Some(start) = self.segment_start.take() {
            self.elapsed_base_ms += now.millis_since(start);
        }
    }

    /// Reopen the elapsed counter (leaving PAUSED).
    pub fn resume(&mut self, now: Instant) {
        if self.segment_start.is_none() {
            self.segment_start = Some(now);
        }
        self.pause_mode = None;
    }

    pub fn is_paused(&self) -> bool {
        self.segment_start.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Instant {
        Instant::from_millis(v)
    }

    #[test]
    fn elapsed_freezes_across_pause() {
        let mut run = RunContext::new(RunMode::Normal, -500, 10_000, ms(1000));
        assert_eq!(run.elapsed_ms(ms(1000)), 0);
        assert_eq!(run.elapsed_ms(ms(3000)), 2000);

        run.pause(ms(3000));
        assert!(run.is_paused());
        // Time passes; elapsed does not.
        assert_eq!(run.elapsed_ms(ms(9000)), 2000);

        run.resume(ms(9000));
        assert!(!run.is_paused());
        assert_eq!(run.elapsed_ms(ms(10_000)), 3000);
        assert_eq!(run.remaining_ms(ms(10_000)), 7000);
    }

    #[test]
    fn double_pause_and_resume_are_idempotent() {
        let mut run = RunContext::new(RunMode::Normal, 0, 0, ms(0));
        run.pause(ms(100));
        run.pause(ms(200));
        assert_eq!(run.elapsed_ms(ms(500)), 100);
        run.resume(ms(500));
        run.resume(ms(600));
        assert_eq!(run.elapsed_ms(ms(700)), 300);
    }

    #[test]
    fn indefinite_run_never_finishes() {
        let run = RunContext::new(RunMode::Normal, 0, 0, ms(0));
        assert!(!run.duration_done(ms(u64::MAX / 2)));
        assert_eq!(run.remaining_ms(ms(1000)), 0);
    }

    #[test]
    fn bounded_run_finishes_exactly_at_duration() {
        let run = RunContext::new(RunMode::Normal, 0, 1000, ms(0));
        assert!(!run.duration_done(ms(999)));
        assert!(run.duration_done(ms(1000)));
    }

    #[test]
    fn wire_modes_round_trip() {
        assert_eq!(RunMode::try_from(0u8).unwrap(), RunMode::Normal);
        assert_eq!(RunMode::try_from(2u8).unwrap(), RunMode::PrecoolOnly);
        assert!(RunMode::try_from(3u8).is_err());
        assert_eq!(StopMode::try_from(1u8).unwrap(), StopMode::Abort);
        assert_eq!(PauseMode::try_from(1u8).unwrap(), PauseMode::StopCooling);
    }
}
