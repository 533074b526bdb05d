//! Render-Time Interpolation
//!
//! The renderer runs between simulation ticks and needs a transform for
//! every entity at an arbitrary moment. Two time bases are used:
//!
//! - **Local predicted** entities blend the last two predicted states by the
//!   progress through the current tick.
//! - **Remote** entities are drawn a fixed delay in the past so that, despite
//!   jitter and loss, two server states usually bracket the render time.
//!
//! When the bracketing snapshots are not adjacent (a lost update), the ratio
//! is stretched over the actual gap:
//!
//! ```text
//!  ratio = clamp(((expected_from - actual_from) + within) / (actual_to - actual_from), 0, 1)
//! ```

use std::time::Duration;

use glam::{Quat, Vec3};

use crate::core::snapshot_store::{Snapshot, SnapshotStore};
use crate::core::tick::SimulationTickNumber;
use crate::game::movement::MovementData;

/// Transform handed to the renderer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderTransform {
    /// World position.
    pub position: Vec3,
    /// World rotation.
    pub rotation: Quat,
}

impl From<&MovementData> for RenderTransform {
    fn from(data: &MovementData) -> Self {
        Self {
            position: data.position,
            rotation: data.rotation(),
        }
    }
}

/// Blend ratio between two snapshots that may not be adjacent.
pub fn interpolation_ratio(
    expected_from: SimulationTickNumber,
    actual_from: SimulationTickNumber,
    actual_to: SimulationTickNumber,
    within_tick: f32,
) -> f32 {
    let span = actual_to - actual_from;
    if span <= 0 {
        return 0.0;
    }
    let offset = (expected_from - actual_from) as f32;
    ((offset + within_tick) / span as f32).clamp(0.0, 1.0)
}

/// Linear position, spherical rotation.
pub fn interpolate_movement(from: &MovementData, to: &MovementData, ratio: f32) -> RenderTransform {
    RenderTransform {
        position: from.position.lerp(to.position, ratio),
        rotation: from.rotation().slerp(to.rotation(), ratio),
    }
}

/// Transform of a locally predicted entity, `tick_ratio` of the way from the
/// second-newest to the newest predicted state.
pub fn interpolate_local(
    predicted: &SnapshotStore<MovementData>,
    tick_ratio: f32,
) -> Option<RenderTransform> {
    let to = predicted.get_from_end(0)?;
    let from = predicted.get_from_end(1).unwrap_or(to);
    Some(interpolate_movement(&from.data, &to.data, tick_ratio.clamp(0.0, 1.0)))
}

/// Delayed time at which remote entities are drawn.
pub fn remote_render_time(now: Duration, delay: Duration, step: Duration) -> Duration {
    now.saturating_sub(delay + step)
}

/// Split a world time into its tick and the fraction through that tick.
pub fn tick_and_ratio(time: Duration, step: Duration) -> (SimulationTickNumber, f32) {
    let step_nanos = step.as_nanos().max(1);
    let nanos = time.as_nanos();
    let tick = SimulationTickNumber::new((nanos / step_nanos) as u64);
    let within = (nanos % step_nanos) as f64 / step_nanos as f64;
    (tick, within as f32)
}

/// Bracketing snapshots for a remote render time.
fn bracket(
    store: &SnapshotStore<MovementData>,
    expected_from: SimulationTickNumber,
) -> Option<(&Snapshot<MovementData>, &Snapshot<MovementData>)> {
    let from = store.closest_at_or_before(expected_from);
    let to = store.closest_at_or_after(expected_from.next());
    match (from, to) {
        (Some(from), Some(to)) => Some((from, to)),
        (Some(only), None) | (None, Some(only)) => Some((only, only)),
        (None, None) => None,
    }
}

/// Transform of a remote entity at `render_time`.
pub fn interpolate_remote(
    store: &SnapshotStore<MovementData>,
    render_time: Duration,
    step: Duration,
) -> Option<RenderTransform> {
    let (expected_from, within) = tick_and_ratio(render_time, step);
    let (from, to) = bracket(store, expected_from)?;
    let ratio = interpolation_ratio(expected_from, from.tick, to.tick, within);
    Some(interpolate_movement(&from.data, &to.data, ratio))
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const STEP: Duration = Duration::from_millis(100);

    fn t(n: u64) -> SimulationTickNumber {
        SimulationTickNumber::new(n)
    }

    fn at_x(x: f32) -> MovementData {
        MovementData::at(Vec3::new(x, 0.0, 0.0), true)
    }

    #[test]
    fn test_ratio_adjacent() {
        assert!((interpolation_ratio(t(5), t(5), t(6), 0.25) - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_ratio_across_gap() {
        // Snapshot 6 lost: blending 5 -> 7 at 6.5 is three quarters of the way.
        assert!((interpolation_ratio(t(6), t(5), t(7), 0.5) - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_ratio_clamped() {
        assert_eq!(interpolation_ratio(t(9), t(5), t(7), 0.5), 1.0);
        assert_eq!(interpolation_ratio(t(5), t(5), t(5), 0.5), 0.0);
    }

    #[test]
    fn test_local_uses_last_two() {
        let mut store = SnapshotStore::new(8);
        store.add(t(1), at_x(0.0));
        store.add(t(2), at_x(1.0));
        store.add(t(3), at_x(3.0));

        let transform = interpolate_local(&store, 0.5).unwrap();
        assert!((transform.position.x - 2.0).abs() < 1e-6);

        assert!(interpolate_local(&SnapshotStore::new(2), 0.5).is_none());
    }

    #[test]
    fn test_local_single_entry() {
        let mut store = SnapshotStore::new(8);
        store.add(t(1), at_x(4.0));
        assert_eq!(interpolate_local(&store, 0.7).unwrap().position.x, 4.0);
    }

    #[test]
    fn test_remote_render_time() {
        let now = Duration::from_millis(1000);
        let render = remote_render_time(now, Duration::from_millis(100), STEP);
        assert_eq!(render, Duration::from_millis(800));
        assert_eq!(remote_render_time(Duration::from_millis(50), Duration::from_millis(100), STEP), Duration::ZERO);
    }

    #[test]
    fn test_remote_interpolates_across_loss() {
        let mut store = SnapshotStore::new(8);
        store.add(t(5), at_x(0.0));
        store.add(t(7), at_x(2.0));

        // 6.5 ticks
        let transform = interpolate_remote(&store, Duration::from_millis(650), STEP).unwrap();
        assert!((transform.position.x - 1.5).abs() < 1e-5);
    }

    #[test]
    fn test_remote_holds_last_without_newer_data() {
        let mut store = SnapshotStore::new(8);
        store.add(t(3), at_x(1.0));
        store.add(t(4), at_x(2.0));

        let transform = interpolate_remote(&store, Duration::from_millis(900), STEP).unwrap();
        assert_eq!(transform.position.x, 2.0);
    }

    #[test]
    fn test_rotation_slerps() {
        let from = MovementData { yaw: 0.0, ..at_x(0.0) };
        let to = MovementData {
            yaw: std::f32::consts::FRAC_PI_2,
            ..at_x(0.0)
        };
        let halfway = interpolate_movement(&from, &to, 0.5);
        let expected = Quat::from_rotation_y(std::f32::consts::FRAC_PI_4);
        assert!(halfway.rotation.angle_between(expected) < 1e-4);
    }
}
