//! Fixed-step simulation clocks.
//!
//! ```text
//!  wall-clock frames:  |--f1--|----f2----|-f3-|------f4------|
//!  fixed ticks:        |  T1  |  T2  |  T3  |  T4  |  T5  |
//!                               ^ accumulator carries the remainder
//! ```
//!
//! [`SimulationClock`] turns measured frame time into a whole number of fixed
//! steps. [`NetworkServerSimulationClock`] is the client's running estimate of
//! the server's world time, used only as a steering target.
//!
//! All bookkeeping is done in integer nanoseconds via [`Duration`] so a given
//! sequence of frame times always produces the same tick sequence.

use std::time::Duration;

use tracing::{debug, trace};

use crate::core::tick::SimulationTickNumber;

/// Steering parameters for [`SimulationClock::update_steered`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockSteering {
    /// Fraction of the discrepancy corrected per update.
    pub correction_fraction: f64,
    /// Discrepancy ignored below this fraction of one tick.
    pub threshold_fraction: f64,
}

impl Default for ClockSteering {
    fn default() -> Self {
        Self {
            correction_fraction: 0.1,
            threshold_fraction: 0.1,
        }
    }
}

/// Result of one clock update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockUpdate {
    /// Tick that was current before the update.
    pub start: SimulationTickNumber,
    /// Number of fixed steps to run this update.
    pub steps: u32,
    /// The clock was hard-set onto the remote estimate.
    pub snapped: bool,
}

impl ClockUpdate {
    /// True if this update performs at least one simulation step.
    pub fn is_next_simulation(&self) -> bool {
        self.steps > 0
    }

    /// Ticks to simulate this update, in order.
    pub fn ticks(&self) -> impl Iterator<Item = SimulationTickNumber> {
        let start = self.start;
        (1..=self.steps as u64).map(move |i| start + i)
    }
}

// =============================================================================
// LOCAL SIMULATION CLOCK
// =============================================================================

/// Accumulator clock that advances in whole fixed steps.
#[derive(Debug, Clone)]
pub struct SimulationClock {
    step: Duration,
    max_steps_per_update: u32,
    tick: SimulationTickNumber,
    accumulator: Duration,
    is_next_simulation: bool,
    synced: bool,
}

impl SimulationClock {
    /// Create a clock at tick zero.
    pub fn new(step: Duration, max_steps_per_update: u32) -> Self {
        debug_assert!(!step.is_zero(), "fixed step must be positive");
        Self {
            step,
            max_steps_per_update: max_steps_per_update.max(1),
            tick: SimulationTickNumber::ZERO,
            accumulator: Duration::ZERO,
            is_next_simulation: false,
            synced: false,
        }
    }

    /// Fixed step duration.
    pub fn fixed_step(&self) -> Duration {
        self.step
    }

    /// Last simulated tick.
    pub fn tick(&self) -> SimulationTickNumber {
        self.tick
    }

    /// True if the last update performed at least one step.
    pub fn is_next_simulation(&self) -> bool {
        self.is_next_simulation
    }

    /// Time accumulated towards the next tick.
    pub fn current_tick_time_elapsed(&self) -> Duration {
        self.accumulator
    }

    /// Progress through the current tick in `[0, 1)`.
    pub fn tick_ratio(&self) -> f32 {
        (self.accumulator.as_secs_f64() / self.step.as_secs_f64()) as f32
    }

    /// Simulated time: completed ticks plus the accumulator.
    pub fn world_time(&self) -> Duration {
        tick_time(self.tick, self.step) + self.accumulator
    }

    /// True once the clock has been hard-set onto a remote time.
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Largest frame time accepted by a single update.
    pub fn max_elapsed(&self) -> Duration {
        self.step * self.max_steps_per_update
    }

    /// Advance by measured frame time and return the steps to run.
    pub fn update(&mut self, elapsed: Duration) -> ClockUpdate {
        let start = self.tick;
        let elapsed = elapsed.min(self.max_elapsed());
        self.accumulator += elapsed;

        let whole = (self.accumulator.as_nanos() / self.step.as_nanos()) as u32;
        let steps = whole.min(self.max_steps_per_update);
        self.accumulator -= self.step * steps;
        self.tick += steps as u64;
        self.is_next_simulation = steps > 0;

        if steps > 1 {
            trace!(steps, tick = self.tick.get(), "catching up");
        }

        ClockUpdate {
            start,
            steps,
            snapped: false,
        }
    }

    /// Advance by frame time nudged towards `target` world time.
    ///
    /// The first call with a target snaps onto it. Later calls correct a
    /// fraction of the discrepancy once it exceeds the threshold.
    pub fn update_steered(
        &mut self,
        elapsed: Duration,
        target: Option<Duration>,
        steering: ClockSteering,
    ) -> ClockUpdate {
        let Some(target) = target else {
            return self.update(elapsed);
        };

        if !self.synced {
            let start = self.tick;
            self.hard_set(target);
            return ClockUpdate {
                start,
                steps: 0,
                snapped: true,
            };
        }

        let local = self.world_time() + elapsed;
        let discrepancy = target.as_nanos() as i128 - local.as_nanos() as i128;
        let threshold = (self.step.as_nanos() as f64 * steering.threshold_fraction) as i128;

        let mut adjusted = elapsed.as_nanos() as i128;
        if discrepancy.abs() > threshold {
            adjusted += (discrepancy as f64 * steering.correction_fraction) as i128;
        }
        let adjusted = adjusted.clamp(0, self.max_elapsed().as_nanos() as i128);

        self.update(Duration::from_nanos(adjusted as u64))
    }

    /// Jump directly to `world_time`, marking the clock synced.
    pub fn hard_set(&mut self, world_time: Duration) {
        let step = self.step.as_nanos();
        let nanos = world_time.as_nanos();
        self.tick = SimulationTickNumber::new((nanos / step) as u64);
        self.accumulator = Duration::from_nanos((nanos % step) as u64);
        self.is_next_simulation = false;
        self.synced = true;
        debug!(tick = self.tick.get(), "simulation clock hard-set");
    }
}

/// Start time of `tick`.
pub fn tick_time(tick: SimulationTickNumber, step: Duration) -> Duration {
    Duration::from_nanos((tick.get() as u128 * step.as_nanos()) as u64)
}

// =============================================================================
// REMOTE CLOCK ESTIMATE
// =============================================================================

/// Client-side estimate of the server's world time.
///
/// Refreshed from every tick the server announces and advanced locally
/// between announcements. Jittery by nature; only used as a target.
#[derive(Debug, Clone)]
pub struct NetworkServerSimulationClock {
    step: Duration,
    last_tick: Option<SimulationTickNumber>,
    since_announcement: Duration,
    latency: Duration,
}

impl NetworkServerSimulationClock {
    /// Create an estimate with nothing heard yet.
    pub fn new(step: Duration) -> Self {
        Self {
            step,
            last_tick: None,
            since_announcement: Duration::ZERO,
            latency: Duration::ZERO,
        }
    }

    /// Newest tick announced by the server.
    pub fn last_server_tick(&self) -> Option<SimulationTickNumber> {
        self.last_tick
    }

    /// One-way latency added on top of announced times.
    pub fn latency(&self) -> Duration {
        self.latency
    }

    /// Set the one-way latency estimate.
    pub fn set_latency(&mut self, latency: Duration) {
        self.latency = latency;
    }

    /// True once any tick has been announced.
    pub fn is_synced(&self) -> bool {
        self.last_tick.is_some()
    }

    /// Record a tick announced by the server. Stale or repeated ticks are ignored.
    pub fn on_server_tick(&mut self, tick: SimulationTickNumber) -> bool {
        if self.last_tick.map_or(false, |last| tick <= last) {
            return false;
        }
        self.last_tick = Some(tick);
        self.since_announcement = Duration::ZERO;
        true
    }

    /// Advance the estimate by local frame time.
    pub fn advance(&mut self, elapsed: Duration) {
        if self.last_tick.is_some() {
            self.since_announcement += elapsed;
        }
    }

    /// Estimated current server world time.
    pub fn estimated_world_time(&self) -> Option<Duration> {
        self.last_tick
            .map(|tick| tick_time(tick, self.step) + self.since_announcement + self.latency)
    }

    /// Estimated current server tick.
    pub fn estimated_tick(&self) -> Option<SimulationTickNumber> {
        self.estimated_world_time().map(|time| {
            SimulationTickNumber::new((time.as_nanos() / self.step.as_nanos()) as u64)
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const STEP: Duration = Duration::from_millis(20);

    #[test]
    fn test_accumulates_partial_frames() {
        let mut clock = SimulationClock::new(STEP, 5);

        let update = clock.update(Duration::from_millis(15));
        assert_eq!(update.steps, 0);
        assert!(!clock.is_next_simulation());
        assert_eq!(clock.current_tick_time_elapsed(), Duration::from_millis(15));

        let update = clock.update(Duration::from_millis(15));
        assert_eq!(update.steps, 1);
        assert!(clock.is_next_simulation());
        assert_eq!(clock.tick().get(), 1);
        assert_eq!(clock.current_tick_time_elapsed(), Duration::from_millis(10));
        assert!((clock.tick_ratio() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_elapsed_clamped_to_max_steps() {
        let mut clock = SimulationClock::new(STEP, 5);
        let update = clock.update(Duration::from_secs(10));
        assert_eq!(update.steps, 5);
        assert_eq!(clock.tick().get(), 5);
        assert_eq!(clock.current_tick_time_elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_update_ticks_iterator() {
        let mut clock = SimulationClock::new(STEP, 5);
        clock.update(Duration::from_millis(20));
        let update = clock.update(Duration::from_millis(60));
        let ticks: Vec<u64> = update.ticks().map(|t| t.get()).collect();
        assert_eq!(ticks, vec![2, 3, 4]);
    }

    #[test]
    fn test_first_target_snaps() {
        let mut clock = SimulationClock::new(STEP, 5);
        let update = clock.update_steered(
            Duration::from_millis(5),
            Some(Duration::from_millis(1010)),
            ClockSteering::default(),
        );
        assert!(update.snapped);
        assert_eq!(update.steps, 0);
        assert!(clock.is_synced());
        assert_eq!(clock.tick().get(), 50);
        assert_eq!(clock.current_tick_time_elapsed(), Duration::from_millis(10));
    }

    #[test]
    fn test_steering_corrects_ten_percent() {
        let mut clock = SimulationClock::new(STEP, 5);
        clock.hard_set(Duration::from_millis(1000));

        // Local would land on 1010 ms, target is 1110 ms: 100 ms behind.
        clock.update_steered(
            Duration::from_millis(10),
            Some(Duration::from_millis(1110)),
            ClockSteering::default(),
        );
        assert_eq!(clock.world_time(), Duration::from_millis(1020));
    }

    #[test]
    fn test_steering_ignores_small_discrepancy() {
        let mut clock = SimulationClock::new(STEP, 5);
        clock.hard_set(Duration::from_millis(1000));

        // 1 ms off is under 10% of a 20 ms tick.
        clock.update_steered(
            Duration::from_millis(10),
            Some(Duration::from_millis(1011)),
            ClockSteering::default(),
        );
        assert_eq!(clock.world_time(), Duration::from_millis(1010));
    }

    #[test]
    fn test_steering_never_runs_backwards() {
        let mut clock = SimulationClock::new(STEP, 5);
        clock.hard_set(Duration::from_millis(5000));
        let before = clock.world_time();

        clock.update_steered(
            Duration::from_millis(10),
            Some(Duration::from_millis(1000)),
            ClockSteering::default(),
        );
        assert_eq!(clock.world_time(), before);
    }

    #[test]
    fn test_server_clock_ignores_stale_ticks() {
        let mut server = NetworkServerSimulationClock::new(STEP);
        assert_eq!(server.estimated_world_time(), None);
        server.advance(Duration::from_millis(100));

        assert!(server.on_server_tick(SimulationTickNumber::new(10)));
        server.advance(Duration::from_millis(5));
        assert!(!server.on_server_tick(SimulationTickNumber::new(9)));
        assert!(!server.on_server_tick(SimulationTickNumber::new(10)));
        assert_eq!(server.estimated_world_time(), Some(Duration::from_millis(205)));

        server.set_latency(Duration::from_millis(30));
        assert_eq!(server.estimated_tick(), Some(SimulationTickNumber::new(11)));
    }

    proptest! {
        #[test]
        fn prop_chunking_does_not_change_tick_count(
            chunks in proptest::collection::vec(1u64..=40, 1..64),
        ) {
            // Chunk sizes in ms stay under the 5-step cap of 100 ms.
            let total: u64 = chunks.iter().sum();
            let step_ms = 20u64;
            let padded = total + (step_ms - total % step_ms) % step_ms;

            let mut chunked = SimulationClock::new(STEP, 5);
            let mut steps = 0u64;
            for ms in &chunks {
                steps += chunked.update(Duration::from_millis(*ms)).steps as u64;
            }
            let pad = padded - total;
            if pad > 0 {
                steps += chunked.update(Duration::from_millis(pad)).steps as u64;
            }

            prop_assert_eq!(steps, padded / step_ms);
            prop_assert_eq!(chunked.tick().get(), padded / step_ms);
            prop_assert_eq!(chunked.current_tick_time_elapsed(), Duration::ZERO);
        }
    }
}
