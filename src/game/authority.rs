//! Server Authority
//!
//! The server runs the same movement state machine as the client but never
//! predicts. Each controlled entity has a small queue of received inputs;
//! one is consumed per tick, oldest first. If the queue runs dry the last
//! consumed command is repeated (without its jump) so the character keeps
//! moving smoothly, and the applied sequence number does not advance.

use std::collections::VecDeque;

use tracing::{trace, warn};

use crate::core::snapshot_store::SnapshotStore;
use crate::core::tick::{PlayerInputSequenceNumber, SimulationTickNumber};
use crate::game::input::InputCommandSet;
use crate::game::movement::{simulate_movement_tick, MovementConfig, MovementData};
use crate::game::physics::CharacterPhysics;
use crate::game::prediction::InputAcknowledgement;

/// What happened to a received input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Queued for a future tick.
    Queued,
    /// Already queued or applied.
    Duplicate,
    /// Queued, and the oldest queued input was dropped to make room.
    DroppedOldest,
}

// =============================================================================
// INPUT QUEUE
// =============================================================================

/// Received, not yet applied inputs for one player, sorted by sequence.
#[derive(Debug, Clone)]
pub struct PlayerInputQueue {
    queue: VecDeque<InputCommandSet>,
    backlog: usize,
    last_received: PlayerInputSequenceNumber,
    last_applied: PlayerInputSequenceNumber,
    last_command: InputCommandSet,
}

impl PlayerInputQueue {
    /// Create a queue holding at most `backlog` inputs.
    pub fn new(backlog: usize) -> Self {
        let backlog = backlog.max(1);
        Self {
            queue: VecDeque::with_capacity(backlog + 1),
            backlog,
            last_received: PlayerInputSequenceNumber::NONE,
            last_applied: PlayerInputSequenceNumber::NONE,
            last_command: InputCommandSet::default(),
        }
    }

    /// Queued input count.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Acknowledgement to report to the owning client.
    pub fn acknowledgement(&self) -> InputAcknowledgement {
        InputAcknowledgement {
            last_received: self.last_received,
            last_applied: self.last_applied,
        }
    }

    /// Queue an input, tagging it with the tick it arrived on.
    pub fn enqueue(&mut self, mut input: InputCommandSet, received_at: SimulationTickNumber) -> EnqueueOutcome {
        if input.sequence <= self.last_applied {
            return EnqueueOutcome::Duplicate;
        }
        let position = self.queue.partition_point(|queued| queued.sequence < input.sequence);
        if self
            .queue
            .get(position)
            .map_or(false, |queued| queued.sequence == input.sequence)
        {
            return EnqueueOutcome::Duplicate;
        }

        input.tick = received_at;
        input.camera_look = Default::default();
        input.camera_lock = 0;
        self.queue.insert(position, input);
        if input.sequence > self.last_received {
            self.last_received = input.sequence;
        }

        if self.queue.len() > self.backlog {
            if let Some(dropped) = self.queue.pop_front() {
                warn!(seq = dropped.sequence.get(), "input backlog full, dropping oldest");
            }
            return EnqueueOutcome::DroppedOldest;
        }
        EnqueueOutcome::Queued
    }

    /// Command for the next tick and whether it is a fresh input.
    pub fn next_command(&mut self) -> (InputCommandSet, bool) {
        match self.queue.pop_front() {
            Some(input) => {
                self.last_applied = input.sequence;
                self.last_command = input;
                (input, true)
            }
            None => {
                let carried = InputCommandSet {
                    jump_pressed: false,
                    sequence: self.last_applied,
                    ..self.last_command
                };
                (carried, false)
            }
        }
    }
}

// =============================================================================
// AUTHORITATIVE MOVEMENT
// =============================================================================

/// Server-side movement for one entity.
#[derive(Debug)]
pub struct AuthoritativeMovement<P> {
    physics: P,
    inputs: PlayerInputQueue,
    config: MovementConfig,
    dt: f32,
}

impl<P: CharacterPhysics> AuthoritativeMovement<P> {
    /// Create authority state driving `physics`.
    pub fn new(physics: P, backlog: usize, config: MovementConfig, dt: f32) -> Self {
        Self {
            physics,
            inputs: PlayerInputQueue::new(backlog),
            config,
            dt,
        }
    }

    /// The input queue.
    pub fn inputs(&self) -> &PlayerInputQueue {
        &self.inputs
    }

    /// The input queue, mutably.
    pub fn inputs_mut(&mut self) -> &mut PlayerInputQueue {
        &mut self.inputs
    }

    /// The character controller.
    pub fn physics(&self) -> &P {
        &self.physics
    }

    /// Consume one input and append the resulting authoritative state for `tick`.
    pub fn step(&mut self, tick: SimulationTickNumber, history: &mut SnapshotStore<MovementData>) -> MovementData {
        let mut data = history
            .latest()
            .map(|s| s.data)
            .unwrap_or_else(|_| MovementData::at(self.physics.position(), self.physics.is_grounded()));

        let (command, fresh) = self.inputs.next_command();
        simulate_movement_tick(&mut data, &command, &mut self.physics, &self.config, self.dt);
        history.add(tick, data);

        trace!(
            tick = tick.get(),
            seq = command.sequence.get(),
            fresh,
            x = data.position.x,
            z = data.position.z,
            "authoritative step"
        );
        data
    }
}

// =============================================================================
// TESTS
// =============================================================================
