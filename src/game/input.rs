//! Input Capture and Pending Input Tracking
//!
//! Input devices are polled once per rendered frame, but movement consumes
//! exactly one [`InputCommandSet`] per simulation tick. [`InputCapture`]
//! bridges the two by writing every poll into the command set of the tick
//! that will consume it next:
//!
//! ```text
//!  frame:   render   render   sim(T)   render   sim(T+1)+sim(T+2)
//!  target:  T        T        T        T+1      T+2 (T+1 gap-filled)
//! ```
//!
//! Movement axes are last-value-wins across polls; the jump button is OR'd
//! so a press shorter than a tick is not lost.
//!
//! [`PendingInputs`] holds every command the server has not yet applied.

use std::collections::VecDeque;

use glam::Vec2;
use tracing::{trace, warn};

use crate::core::snapshot_store::SnapshotStore;
use crate::core::tick::{PlayerInputSequenceNumber, SimulationTickNumber};

// =============================================================================
// INPUT TYPES
// =============================================================================

/// Everything the local player asked for during one tick.
///
/// Camera fields never leave the client.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct InputCommandSet {
    /// Sequence number issued when this tick's command was first created.
    pub sequence: PlayerInputSequenceNumber,
    /// Tick that consumes this command.
    pub tick: SimulationTickNumber,
    /// Desired movement on the ground plane (x, z), length at most 1.
    pub move_input: Vec2,
    /// Jump was pressed at some point during the tick.
    pub jump_pressed: bool,
    /// Camera look delta.
    pub camera_look: Vec2,
    /// Camera lock bits, opaque to the simulation.
    pub camera_lock: u8,
}

impl InputCommandSet {
    /// Movement input clamped to unit length.
    #[inline]
    pub fn clamped_move(&self) -> Vec2 {
        self.move_input.clamp_length_max(1.0)
    }
}

/// One poll of the input devices.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct InputSample {
    /// Movement axes.
    pub move_input: Vec2,
    /// Jump button held down this poll.
    pub jump_pressed: bool,
    /// Camera look delta.
    pub camera_look: Vec2,
    /// Camera lock flags.
    pub camera_lock: u8,
}

impl InputSample {
    /// Sample with only movement.
    pub fn movement(x: f32, z: f32) -> Self {
        Self {
            move_input: Vec2::new(x, z),
            ..Self::default()
        }
    }

    /// Same sample with the jump button down.
    pub fn with_jump(mut self) -> Self {
        self.jump_pressed = true;
        self
    }
}

// =============================================================================
// INPUT CAPTURE
// =============================================================================

/// Per-tick input history for the local player.
#[derive(Debug, Clone)]
pub struct InputCapture {
    history: SnapshotStore<InputCommandSet>,
    last_sequence: PlayerInputSequenceNumber,
}

impl InputCapture {
    /// Create a capture keeping `capacity` ticks of history.
    pub fn new(capacity: usize) -> Self {
        Self {
            history: SnapshotStore::new(capacity),
            last_sequence: PlayerInputSequenceNumber::NONE,
        }
    }

    /// Last sequence number issued.
    pub fn last_sequence(&self) -> PlayerInputSequenceNumber {
        self.last_sequence
    }

    /// Tick a poll made now should be written to.
    pub fn target_tick(current: SimulationTickNumber, is_next_simulation: bool) -> SimulationTickNumber {
        if is_next_simulation {
            current
        } else {
            current.next()
        }
    }

    /// Drop all history and restart sequence numbering after `last`.
    pub fn reset(&mut self, last: PlayerInputSequenceNumber) {
        self.history.clear();
        self.last_sequence = last;
    }

    /// Create command sets for every tick up to `tick` that has none yet.
    ///
    /// New entries carry the previous movement forward with jump cleared and
    /// receive fresh sequence numbers in tick order.
    fn ensure_through(&mut self, tick: SimulationTickNumber) {
        let mut next = match self.history.latest() {
            Ok(latest) if latest.tick >= tick => return,
            Ok(latest) => latest.tick.next(),
            Err(_) => tick,
        };

        while next <= tick {
            self.last_sequence = self.last_sequence.next();
            let (entry, created) = self.history.get_or_create_carried(next);
            debug_assert!(created);
            entry.data.sequence = self.last_sequence;
            entry.data.tick = next;
            entry.data.jump_pressed = false;
            trace!(tick = next.get(), seq = self.last_sequence.get(), "input command created");
            next = next.next();
        }
    }

    /// Fold one device poll into the command set for the upcoming tick.
    pub fn sample(
        &mut self,
        current: SimulationTickNumber,
        is_next_simulation: bool,
        sample: &InputSample,
    ) -> InputCommandSet {
        let mut target = Self::target_tick(current, is_next_simulation);
        if let Ok(latest) = self.history.latest() {
            target = target.max(latest.tick);
        }
        self.ensure_through(target);

        match self.history.find_mut(target) {
            Some(entry) => {
                let command = &mut entry.data;
                command.move_input = sample.move_input;
                command.jump_pressed |= sample.jump_pressed;
                command.camera_look = sample.camera_look;
                command.camera_lock = sample.camera_lock;
                *command
            }
            None => {
                debug_assert!(false, "input command for {} missing after creation", target);
                InputCommandSet::default()
            }
        }
    }

    /// Command set consumed by `tick`, creating a carried-forward one if the
    /// devices were not polled for it.
    pub fn command_for_tick(&mut self, tick: SimulationTickNumber) -> InputCommandSet {
        self.ensure_through(tick);
        if let Some(entry) = self.history.find(tick) {
            return entry.data;
        }
        // Older than retained history.
        self.history
            .closest_at_or_after(tick)
            .map(|entry| entry.data)
            .unwrap_or_default()
    }

    /// Stored command set for `tick`, if any.
    pub fn find(&self, tick: SimulationTickNumber) -> Option<&InputCommandSet> {
        self.history.find(tick).map(|entry| &entry.data)
    }
}

// =============================================================================
// PENDING INPUTS
// =============================================================================

/// Inputs sent to the server but not yet applied there, oldest first.
#[derive(Debug, Clone)]
pub struct PendingInputs {
    inputs: VecDeque<InputCommandSet>,
    capacity: usize,
}

impl PendingInputs {
    /// Create an empty list holding at most `capacity` inputs.
    pub fn new(capacity: usize) -> Self {
        Self {
            inputs: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    /// Number of pending inputs.
    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    /// True if every input has been acknowledged.
    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Append an input. When full the oldest input is dropped and returned.
    pub fn push(&mut self, input: InputCommandSet) -> Option<InputCommandSet> {
        if let Some(last) = self.inputs.back() {
            if input.sequence <= last.sequence {
                // Already pending.
                return None;
            }
        }
        let dropped = if self.inputs.len() >= self.capacity {
            let dropped = self.inputs.pop_front();
            if let Some(old) = &dropped {
                warn!(seq = old.sequence.get(), "pending input list full, dropping oldest");
            }
            dropped
        } else {
            None
        };
        self.inputs.push_back(input);
        dropped
    }

    /// Remove every input with sequence `<= last_applied`. Returns how many went.
    pub fn acknowledge(&mut self, last_applied: PlayerInputSequenceNumber) -> usize {
        let mut removed = 0;
        while let Some(front) = self.inputs.front() {
            if front.sequence > last_applied {
                break;
            }
            self.inputs.pop_front();
            removed += 1;
        }
        removed
    }

    /// Iterate oldest to newest.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &InputCommandSet> + ExactSizeIterator {
        self.inputs.iter()
    }

    /// The newest `count` inputs, oldest first.
    pub fn newest(&self, count: usize) -> impl Iterator<Item = &InputCommandSet> {
        let skip = self.inputs.len().saturating_sub(count);
        self.inputs.iter().skip(skip)
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.inputs.clear();
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn t(n: u64) -> SimulationTickNumber {
        SimulationTickNumber::new(n)
    }

    fn command(seq: u32) -> InputCommandSet {
        InputCommandSet {
            sequence: PlayerInputSequenceNumber::new(seq),
            tick: t(seq as u64),
            ..InputCommandSet::default()
        }
    }

    #[test]
    fn test_target_tick() {
        assert_eq!(InputCapture::target_tick(t(5), false), t(6));
        assert_eq!(InputCapture::target_tick(t(5), true), t(5));
    }

    #[test]
    fn test_polls_accumulate_into_one_command() {
        let mut capture = InputCapture::new(32);

        let first = capture.sample(t(5), false, &InputSample::movement(1.0, 0.0).with_jump());
        let second = capture.sample(t(5), false, &InputSample::movement(0.0, 1.0));

        assert_eq!(first.sequence, second.sequence);
        assert_eq!(second.tick, t(6));
        assert_eq!(second.move_input, Vec2::new(0.0, 1.0));
        assert!(second.jump_pressed, "jump press survives a later poll without it");
        assert_eq!(capture.last_sequence().get(), 1);
    }

    #[test]
    fn test_camera_fields_copied_verbatim() {
        let mut capture = InputCapture::new(32);
        let sample = InputSample {
            camera_look: Vec2::new(0.25, -0.5),
            camera_lock: 0xA5,
            ..InputSample::default()
        };
        capture.sample(t(5), false, &sample);
        let command = capture.sample(
            t(5),
            false,
            &InputSample {
                camera_lock: 0x5A,
                ..sample
            },
        );
        assert_eq!(command.camera_look, Vec2::new(0.25, -0.5));
        assert_eq!(command.camera_lock, 0x5A, "lock bits are last-value-wins");
    }

    #[test]
    fn test_simulation_update_targets_current_tick() {
        let mut capture = InputCapture::new(32);
        capture.sample(t(5), false, &InputSample::movement(1.0, 0.0));
        // Clock advanced onto tick 6: the same command is still the target.
        let command = capture.sample(t(6), true, &InputSample::movement(0.5, 0.0));
        assert_eq!(command.tick, t(6));
        assert_eq!(command.sequence.get(), 1);

        let next = capture.sample(t(6), false, &InputSample::default());
        assert_eq!(next.tick, t(7));
        assert_eq!(next.sequence.get(), 2);
    }

    #[test]
    fn test_gap_ticks_filled_in_order() {
        let mut capture = InputCapture::new(32);
        capture.sample(t(1), true, &InputSample::movement(1.0, 0.0).with_jump());
        let latest = capture.sample(t(4), true, &InputSample::movement(0.0, -1.0));

        assert_eq!(latest.sequence.get(), 4);
        let gap = capture.find(t(2)).unwrap();
        assert_eq!(gap.sequence.get(), 2);
        assert_eq!(gap.move_input, Vec2::new(1.0, 0.0));
        assert!(!gap.jump_pressed, "one-shot jump is not carried forward");
        assert_eq!(capture.find(t(3)).unwrap().sequence.get(), 3);
    }

    #[test]
    fn test_command_for_unpolled_tick() {
        let mut capture = InputCapture::new(32);
        capture.sample(t(1), true, &InputSample::movement(1.0, 0.0));
        let command = capture.command_for_tick(t(2));
        assert_eq!(command.tick, t(2));
        assert_eq!(command.sequence.get(), 2);
        assert_eq!(command.move_input, Vec2::new(1.0, 0.0));

        // Asking again returns the same command.
        assert_eq!(capture.command_for_tick(t(2)), command);
    }

    #[test]
    fn test_clamped_move() {
        let command = InputCommandSet {
            move_input: Vec2::new(3.0, 4.0),
            ..InputCommandSet::default()
        };
        assert!((command.clamped_move().length() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_pending_acknowledge_removes_once() {
        let mut pending = PendingInputs::new(16);
        for seq in 1..=5 {
            pending.push(command(seq));
        }

        assert_eq!(pending.acknowledge(PlayerInputSequenceNumber::new(3)), 3);
        assert_eq!(pending.acknowledge(PlayerInputSequenceNumber::new(3)), 0);
        assert_eq!(pending.acknowledge(PlayerInputSequenceNumber::new(2)), 0);
        let left: Vec<u32> = pending.iter().map(|c| c.sequence.get()).collect();
        assert_eq!(left, vec![4, 5]);
    }

    #[test]
    fn test_pending_overflow_drops_oldest() {
        let mut pending = PendingInputs::new(2);
        pending.push(command(1));
        pending.push(command(2));
        let dropped = pending.push(command(3));
        assert_eq!(dropped.map(|c| c.sequence.get()), Some(1));
        assert_eq!(pending.len(), 2);
    }

    #[test]
    fn test_pending_ignores_duplicates() {
        let mut pending = PendingInputs::new(8);
        pending.push(command(1));
        pending.push(command(1));
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_newest_for_redundancy() {
        let mut pending = PendingInputs::new(8);
        for seq in 1..=5 {
            pending.push(command(seq));
        }
        let newest: Vec<u32> = pending.newest(3).map(|c| c.sequence.get()).collect();
        assert_eq!(newest, vec![3, 4, 5]);
        assert_eq!(pending.newest(10).count(), 5);
    }
}
