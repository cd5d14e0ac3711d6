//! Wall-clock pacing for the execution loop.
//!
//! Emulated time advances in CPU cycles; real time advances on its own. The
//! [`Pacer`] accumulates a "should have elapsed" target from executed cycles
//! and holds the loop back whenever it runs ahead of the wall clock. Sleeps
//! are only useful above the OS sleep granularity, which varies by host, so
//! it is measured once at startup into a [`TimingProfile`].

use std::time::{Duration, Instant};

/// How far the wall clock may run ahead of emulated time before the
/// backlog is abandoned (the host is too slow to keep up; catching up
/// would make the machine sprint).
const CATCH_UP_LIMIT: Duration = Duration::from_millis(100);

/// One-time measurement of host timing behaviour.
///
/// `sleep_granularity` is the shortest sleep the host can actually deliver.
/// Requesting anything shorter oversleeps, so the pacer spins instead for
/// leads below this value.
#[derive(Debug, Clone, Copy)]
pub struct TimingProfile {
    /// Measured cost of a minimal `thread::sleep` call.
    pub sleep_granularity: Duration,
}

impl TimingProfile {
    /// Measure the host's sleep granularity by timing repeated short sleeps.
    ///
    /// Call once at startup; the result is passed into each pacer rather
    /// than re-measured or kept in global state.
    #[must_use]
    pub fn calibrate() -> Self {
        const SAMPLES: u32 = 16;
        let start = Instant::now();
        for _ in 0..SAMPLES {
            std::thread::sleep(Duration::from_millis(1));
        }
        let per_sleep = start.elapsed() / SAMPLES;
        Self {
            sleep_granularity: per_sleep.max(Duration::from_millis(1)),
        }
    }

    /// Build a profile with a known granularity (tests, deterministic hosts).
    #[must_use]
    pub const fn assume(sleep_granularity: Duration) -> Self {
        Self { sleep_granularity }
    }
}

/// Regulates the execution loop against the wall clock.
///
/// The caller reports executed cycles along with the current per-cycle
/// duration; the pacer sleeps or spins whenever emulated time runs ahead of
/// real time. A per-cycle duration of zero means unregulated: the loop runs
/// flat out and the pacer only keeps its anchor fresh.
#[derive(Debug)]
pub struct Pacer {
    profile: TimingProfile,
    /// Wall-clock anchor for the current regulation window.
    origin: Instant,
    /// Emulated time accumulated since `origin`.
    target: Duration,
}

impl Pacer {
    #[must_use]
    pub fn new(profile: TimingProfile) -> Self {
        Self {
            profile,
            origin: Instant::now(),
            target: Duration::ZERO,
        }
    }

    /// Re-anchor to "now", discarding any accumulated lead or backlog.
    ///
    /// Call after any suspension that should not be paid back, e.g. a halt
    /// instruction or a clock-rate change.
    pub fn restart(&mut self) {
        self.origin = Instant::now();
        self.target = Duration::ZERO;
    }

    /// Account for `cycles` executed cycles of `nanos_per_cycle` each and
    /// hold the loop back if emulated time is ahead of the wall clock.
    pub fn advance(&mut self, cycles: u64, nanos_per_cycle: u64) {
        if nanos_per_cycle == 0 {
            // Unregulated: keep the anchor current so a later switch to a
            // real clock rate doesn't inherit a huge backlog.
            self.target = self.origin.elapsed();
            return;
        }

        self.target += Duration::from_nanos(cycles * nanos_per_cycle);
        let elapsed = self.origin.elapsed();

        if self.target > elapsed {
            let lead = self.target - elapsed;
            if lead >= self.profile.sleep_granularity {
                std::thread::sleep(lead);
            } else {
                // Lead too small for a sleep to land accurately; spin it off.
                while self.origin.elapsed() < self.target {
                    std::hint::spin_loop();
                }
            }
        } else if elapsed - self.target > CATCH_UP_LIMIT {
            self.target = elapsed;
        }
    }
}
