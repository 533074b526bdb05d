//! Client-Side Prediction and Resimulation
//!
//! The locally controlled entity is simulated ahead of the server. Every tick
//! the client predicts one more [`MovementData`] from its own input and keeps
//! that input pending until the server reports it applied.
//!
//! ```text
//!  authoritative:  A1  A2  A3            (server, confirmed)
//!  pending:                I4  I5  I6    (sent, not yet applied)
//!
//!  resimulate:     snap to A3, refresh grounded,
//!                  predicted = [A2, A3],
//!                  replay I4 I5 I6 -> [A2, A3, P4, P5, P6]
//! ```
//!
//! Resimulation runs synchronously, only when the server acknowledges a new
//! input. Mispredictions are detected and counted; correction is the
//! snap-and-replay above with no smoothing.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::core::snapshot_store::SnapshotStore;
use crate::core::tick::{PlayerInputSequenceNumber, SimulationTickNumber};
use crate::game::input::{InputCommandSet, PendingInputs};
use crate::game::movement::{restore_physics, simulate_movement_tick, MovementConfig, MovementData};
use crate::game::physics::CharacterPhysics;

/// Distance above which a confirmed prediction counts as wrong.
pub const MISPREDICTION_TOLERANCE: f32 = 1e-3;

/// Acknowledgement carried by every server state message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputAcknowledgement {
    /// Newest input the server has seen.
    pub last_received: PlayerInputSequenceNumber,
    /// Newest input folded into authoritative state.
    pub last_applied: PlayerInputSequenceNumber,
}

/// Counters for the prediction pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PredictionStats {
    /// Ticks predicted ahead of the server.
    pub predicted_ticks: u64,
    /// Resimulation passes run.
    pub resimulations: u64,
    /// Inputs replayed across all resimulations.
    pub replayed_inputs: u64,
    /// Confirmed predictions that disagreed with the server.
    pub mispredictions: u64,
    /// Largest disagreement seen (units).
    pub max_position_error: f32,
}

/// Prediction state for one locally controlled entity.
#[derive(Debug)]
pub struct LocalPlayerPrediction<P> {
    physics: P,
    predicted: SnapshotStore<MovementData>,
    pending: PendingInputs,
    ack: InputAcknowledgement,
    config: MovementConfig,
    dt: f32,
    stats: PredictionStats,
}

impl<P: CharacterPhysics> LocalPlayerPrediction<P> {
    /// Create a predictor driving `physics`.
    pub fn new(
        physics: P,
        predicted: SnapshotStore<MovementData>,
        pending_capacity: usize,
        config: MovementConfig,
        dt: f32,
    ) -> Self {
        Self {
            physics,
            predicted,
            pending: PendingInputs::new(pending_capacity),
            ack: InputAcknowledgement::default(),
            config,
            dt,
            stats: PredictionStats::default(),
        }
    }

    /// Predicted movement, oldest first.
    pub fn predicted(&self) -> &SnapshotStore<MovementData> {
        &self.predicted
    }

    /// Inputs not yet applied by the server.
    pub fn pending(&self) -> &PendingInputs {
        &self.pending
    }

    /// Newest acknowledgement processed.
    pub fn acknowledgement(&self) -> InputAcknowledgement {
        self.ack
    }

    /// Pipeline counters.
    pub fn stats(&self) -> PredictionStats {
        self.stats
    }

    /// The character controller.
    pub fn physics(&self) -> &P {
        &self.physics
    }

    /// Give the store back, e.g. to return it to a pool.
    pub fn into_parts(self) -> (P, SnapshotStore<MovementData>) {
        (self.physics, self.predicted)
    }

    /// Newest predicted state, falling back to the newest confirmed one.
    fn base_state(&self, authoritative: &SnapshotStore<MovementData>) -> MovementData {
        self.predicted
            .latest()
            .or_else(|_| authoritative.latest())
            .map(|s| s.data)
            .unwrap_or_else(|_| MovementData::at(self.physics.position(), self.physics.is_grounded()))
    }

    /// Predict `input.tick` from the newest known state and record `input` as pending.
    pub fn predict_tick(
        &mut self,
        input: &InputCommandSet,
        authoritative: &SnapshotStore<MovementData>,
    ) -> MovementData {
        let mut data = self.base_state(authoritative);
        simulate_movement_tick(&mut data, input, &mut self.physics, &self.config, self.dt);

        if self.predicted.latest().map_or(false, |last| last.tick > input.tick) {
            // Clock was pulled back past a predicted tick; start the list over.
            self.predicted.clear();
        }
        self.predicted.add(input.tick, data);
        self.pending.push(*input);
        self.stats.predicted_ticks += 1;

        #[cfg(feature = "debug-tracing")]
        trace!(tick = input.tick.get(), seq = input.sequence.get(), x = data.position.x, "predicted");

        data
    }

    /// Process an acknowledgement. Returns `true` if it applied a new input,
    /// meaning a resimulation is due.
    pub fn acknowledge(&mut self, ack: InputAcknowledgement) -> bool {
        if ack.last_received > self.ack.last_received {
            self.ack.last_received = ack.last_received;
        }
        if ack.last_applied <= self.ack.last_applied {
            return false;
        }
        let removed = self.pending.acknowledge(ack.last_applied);
        self.ack.last_applied = ack.last_applied;
        trace!(
            seq = ack.last_applied.get(),
            removed,
            pending = self.pending.len(),
            "inputs acknowledged"
        );
        true
    }

    /// Compare the server's state for the newest applied input with what was
    /// predicted for it. Returns the position error if it exceeds tolerance.
    pub fn detect_misprediction(&mut self, authoritative: &SnapshotStore<MovementData>) -> Option<f32> {
        let seq = self.ack.last_applied;
        let confirmed = authoritative.iter().find(|s| s.data.input_sequence == seq)?;
        let predicted = self
            .predicted
            .iter()
            .rev()
            .find(|s| s.data.input_sequence == seq)?;

        let error = predicted.data.position.distance(confirmed.data.position);
        if error <= MISPREDICTION_TOLERANCE {
            return None;
        }
        self.stats.mispredictions += 1;
        self.stats.max_position_error = self.stats.max_position_error.max(error);
        debug!(seq = seq.get(), error, "misprediction");
        Some(error)
    }

    /// Rewind to the newest authoritative state and replay every pending input.
    pub fn resimulate(&mut self, authoritative: &SnapshotStore<MovementData>) {
        let Ok(newest) = authoritative.latest() else {
            return;
        };
        let mut newest = newest.data;

        // 1-2. Snap the controller and refresh grounded without moving.
        restore_physics(&mut newest, &mut self.physics);

        // 3. Seed with the last two confirmed states on the client timeline.
        let current_tick = self
            .predicted
            .latest()
            .map(|s| s.tick)
            .unwrap_or(SimulationTickNumber::ZERO);
        let base_tick = self
            .pending
            .iter()
            .next()
            .map(|first| first.tick.prev())
            .unwrap_or(current_tick);

        self.predicted.clear();
        if let Some(older) = authoritative.get_from_end(1) {
            self.predicted.add(base_tick.prev(), older.data);
        }
        self.predicted.add(base_tick, newest);

        // 4. Replay.
        let mut data = newest;
        let mut replayed = 0u64;
        for input in self.pending.iter() {
            simulate_movement_tick(&mut data, input, &mut self.physics, &self.config, self.dt);
            self.predicted.add(input.tick, data);
            replayed += 1;
        }

        self.stats.resimulations += 1;
        self.stats.replayed_inputs += replayed;
        debug!(
            from_seq = self.ack.last_applied.get(),
            replayed,
            x = data.position.x,
            "resimulated"
        );
    }

    /// Forget everything predicted and pending, e.g. after a respawn.
    pub fn reset(&mut self, state: MovementData) {
        let mut state = state;
        restore_physics(&mut state, &mut self.physics);
        self.predicted.clear();
        self.pending.clear();
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::physics::{KinematicCharacter, KinematicSettings};
    use glam::{Vec2, Vec3};

    const DT: f32 = 1.0 / 30.0;

    fn t(n: u64) -> SimulationTickNumber {
        SimulationTickNumber::new(n)
    }

    fn seq(n: u32) -> PlayerInputSequenceNumber {
        PlayerInputSequenceNumber::new(n)
    }

    fn input(n: u32, x: f32, z: f32) -> InputCommandSet {
        InputCommandSet {
            sequence: seq(n),
            tick: t(n as u64),
            move_input: Vec2::new(x, z),
            ..InputCommandSet::default()
        }
    }

    fn predictor() -> LocalPlayerPrediction<KinematicCharacter> {
        LocalPlayerPrediction::new(
            KinematicCharacter::new(KinematicSettings::default(), Vec3::ZERO),
            SnapshotStore::new(64),
            64,
            MovementConfig::default(),
            DT,
        )
    }

    fn spawn_store() -> SnapshotStore<MovementData> {
        let mut store = SnapshotStore::new(64);
        store.add(t(0), MovementData::at(Vec3::ZERO, true));
        store
    }

    #[test]
    fn test_three_tick_prediction_then_correction() {
        let mut authoritative = spawn_store();
        let mut prediction = predictor();

        let mut expected_x = 0.0f32;
        for (n, d) in [(1u32, 0.15f32), (2, 0.2775), (3, 0.385875)] {
            let data = prediction.predict_tick(&input(n, 1.0, 0.0), &authoritative);
            expected_x += d * 8.5 * DT;
            assert!((data.position.x - expected_x).abs() < 1e-5, "tick {}", n);
        }
        assert_eq!(prediction.pending().len(), 3);

        // Server confirms inputs 1 and 2 but lands slightly further along.
        let p1 = prediction.predicted().find(t(1)).unwrap().data;
        let mut a2 = prediction.predicted().find(t(2)).unwrap().data;
        a2.position.x += 0.05;
        authoritative.add(t(1), p1);
        authoritative.add(t(2), a2);

        let new_ack = prediction.acknowledge(InputAcknowledgement {
            last_received: seq(3),
            last_applied: seq(2),
        });
        assert!(new_ack);
        assert_eq!(prediction.pending().len(), 1);

        let error = prediction.detect_misprediction(&authoritative).unwrap();
        assert!((error - 0.05).abs() < 1e-5);

        prediction.resimulate(&authoritative);

        let predicted: Vec<MovementData> = prediction.predicted().iter().map(|s| s.data).collect();
        assert_eq!(predicted.len(), 3);
        assert_eq!(predicted[0], p1);
        assert_eq!(predicted[1], a2);

        // Only input 3 replayed, from the corrected base.
        let replayed = predicted[2];
        assert_eq!(replayed.input_sequence, seq(3));
        let expected = a2.position.x + 0.385875 * 8.5 * DT;
        assert!((replayed.position.x - expected).abs() < 1e-5);
        assert!((replayed.move_direction.x - 0.385875).abs() < 1e-5);

        let stats = prediction.stats();
        assert_eq!(stats.resimulations, 1);
        assert_eq!(stats.replayed_inputs, 1);
        assert_eq!(stats.mispredictions, 1);
    }

    #[test]
    fn test_stale_ack_does_not_resimulate() {
        let authoritative = spawn_store();
        let mut prediction = predictor();
        for n in 1..=3 {
            prediction.predict_tick(&input(n, 0.0, 1.0), &authoritative);
        }

        assert!(prediction.acknowledge(InputAcknowledgement {
            last_received: seq(3),
            last_applied: seq(2),
        }));
        assert!(!prediction.acknowledge(InputAcknowledgement {
            last_received: seq(3),
            last_applied: seq(2),
        }));
        assert!(!prediction.acknowledge(InputAcknowledgement {
            last_received: seq(2),
            last_applied: seq(1),
        }));
        assert_eq!(prediction.acknowledgement().last_received, seq(3));
        assert_eq!(prediction.pending().len(), 1);
    }

    #[test]
    fn test_full_ack_leaves_last_two_authoritative() {
        let mut authoritative = spawn_store();
        let mut prediction = predictor();
        for n in 1..=2 {
            prediction.predict_tick(&input(n, 1.0, 0.0), &authoritative);
        }

        let a1 = MovementData {
            input_sequence: seq(1),
            ..MovementData::at(Vec3::new(0.1, 0.0, 0.0), true)
        };
        let a2 = MovementData {
            input_sequence: seq(2),
            ..MovementData::at(Vec3::new(0.3, 0.0, 0.0), true)
        };
        authoritative.add(t(1), a1);
        authoritative.add(t(2), a2);

        prediction.acknowledge(InputAcknowledgement {
            last_received: seq(2),
            last_applied: seq(2),
        });
        assert!(prediction.pending().is_empty());
        prediction.resimulate(&authoritative);

        let predicted = prediction.predicted();
        assert_eq!(predicted.len(), 2);
        assert_eq!(predicted.get_from_end(1).unwrap().data, a1);
        assert_eq!(predicted.get_from_end(0).unwrap().data, a2);
        assert_eq!(prediction.physics().position(), a2.position);
    }

    #[test]
    fn test_resimulation_is_deterministic() {
        let run = || {
            let mut authoritative = spawn_store();
            let mut prediction = predictor();
            let inputs = [
                input(1, 1.0, 0.0),
                input(2, 1.0, 0.5),
                InputCommandSet {
                    jump_pressed: true,
                    ..input(3, 0.0, 1.0)
                },
                input(4, -1.0, 0.0),
                input(5, -0.3, -0.7),
            ];
            for i in &inputs {
                prediction.predict_tick(i, &authoritative);
            }
            authoritative.add(
                t(1),
                MovementData {
                    input_sequence: seq(1),
                    ..MovementData::at(Vec3::new(0.04, 0.0, 0.01), true)
                },
            );
            prediction.acknowledge(InputAcknowledgement {
                last_received: seq(5),
                last_applied: seq(1),
            });
            prediction.resimulate(&authoritative);
            prediction
                .predicted()
                .iter()
                .map(|s| (s.data.position.to_array(), s.data.physics_velocity.to_array()))
                .map(|(p, v)| (p.map(f32::to_bits), v.map(f32::to_bits)))
                .collect::<Vec<_>>()
        };

        let first = run();
        assert_eq!(first.len(), 2 + 4);
        assert_eq!(first, run());
    }

    #[test]
    fn test_resimulate_without_history_is_noop() {
        let mut prediction = predictor();
        prediction.resimulate(&SnapshotStore::new(4));
        assert_eq!(prediction.stats().resimulations, 0);
    }
}
