//! Movement State Machine
//!
//! Advances one character by exactly one fixed tick from one committed
//! [`InputCommandSet`]. The same code runs for client prediction, client
//! resimulation and server authority, so everything here must be a pure
//! function of (previous state, input, physics state, config, dt).
//!
//! Per tick:
//! 1. Blend move direction towards the input (inertia).
//! 2. Derive the move-input velocity from max run speed.
//! 3. Hand the velocity to the character controller.
//! 4. Face the move direction above a small epsilon.
//! 5. Jump, with a grace window after leaving the ground.
//! 6. Take one physics step and record the result.

use glam::{Quat, Vec2, Vec3};
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::core::hash::StateHasher;
use crate::core::tick::PlayerInputSequenceNumber;
use crate::game::input::InputCommandSet;
use crate::game::physics::{CharacterPhysics, PhysicsStep};

// =============================================================================
// CONFIG
// =============================================================================

/// Movement tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MovementConfig {
    /// Top horizontal speed (units/s).
    pub max_run_speed: f32,
    /// Weight of the previous direction in the per-tick blend.
    pub inertia: f32,
    /// Direction length below which facing is left unchanged.
    pub facing_epsilon: f32,
    /// Seconds after leaving the ground a jump is still accepted. `<= 0` requires ground.
    pub jump_reaction_threshold: f32,
    /// Vertical speed applied by a jump (units/s).
    pub jump_speed: f32,
}

impl Default for MovementConfig {
    fn default() -> Self {
        Self {
            max_run_speed: 8.5,
            inertia: 0.85,
            facing_epsilon: 0.001,
            jump_reaction_threshold: 0.15,
            jump_speed: 7.0,
        }
    }
}

impl MovementConfig {
    /// Check ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..1.0).contains(&self.inertia) {
            return Err(ConfigError::Invalid {
                field: "movement.inertia",
                reason: "must be in 0..1".to_string(),
            });
        }
        if self.max_run_speed < 0.0 {
            return Err(ConfigError::Invalid {
                field: "movement.max_run_speed",
                reason: "must not be negative".to_string(),
            });
        }
        if self.facing_epsilon < 0.0 {
            return Err(ConfigError::Invalid {
                field: "movement.facing_epsilon",
                reason: "must not be negative".to_string(),
            });
        }
        Ok(())
    }
}

// =============================================================================
// MOVEMENT DATA
// =============================================================================

/// Movement state of one entity at one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MovementData {
    /// Inertia-smoothed direction on the ground plane, length at most 1.
    pub move_direction: Vec3,
    /// `move_direction * max_run_speed`.
    pub current_move_input_velocity: Vec3,
    /// Position after the tick's physics step.
    pub position: Vec3,
    /// Facing angle around +Y (radians, 0 faces +Z).
    pub yaw: f32,
    /// Grounded after the tick's physics step.
    pub is_grounded: bool,
    /// Linear velocity reported by physics.
    pub physics_velocity: Vec3,
    /// Remaining jump grace time (seconds).
    pub jump_reaction_remaining: f32,
    /// Input that produced this state.
    pub input_sequence: PlayerInputSequenceNumber,
}

impl MovementData {
    /// Resting state at `position`.
    pub fn at(position: Vec3, is_grounded: bool) -> Self {
        Self {
            position,
            is_grounded,
            ..Self::default()
        }
    }

    /// Facing as a quaternion.
    pub fn rotation(&self) -> Quat {
        Quat::from_rotation_y(self.yaw)
    }

    /// Fraction of max run speed currently requested, in `[0, 1]`.
    pub fn move_speed_fraction(&self) -> f32 {
        self.move_direction.length().min(1.0)
    }

    /// Record a physics step.
    pub fn record_step(&mut self, step: &PhysicsStep) {
        self.position = step.position;
        self.physics_velocity = step.velocity;
        self.is_grounded = step.is_grounded;
    }

    /// Add every field to a state hash.
    pub fn hash_into(&self, hasher: &mut StateHasher) {
        hasher.update_vec3(self.move_direction);
        hasher.update_vec3(self.current_move_input_velocity);
        hasher.update_vec3(self.position);
        hasher.update_f32(self.yaw);
        hasher.update_bool(self.is_grounded);
        hasher.update_vec3(self.physics_velocity);
        hasher.update_f32(self.jump_reaction_remaining);
        hasher.update_u32(self.input_sequence.get());
    }
}

/// Map a ground-plane input (x, z) to a world direction.
#[inline]
pub fn input_direction(move_input: Vec2) -> Vec3 {
    let clamped = move_input.clamp_length_max(1.0);
    Vec3::new(clamped.x, 0.0, clamped.y)
}

// =============================================================================
// STATE MACHINE
// =============================================================================

/// Steps 1-5: update `data` from `input` and prime the character's velocity.
///
/// Returns the velocity to step physics with.
pub fn apply_movement_input(
    data: &mut MovementData,
    input: &InputCommandSet,
    physics: &dyn CharacterPhysics,
    config: &MovementConfig,
    dt: f32,
) -> Vec3 {
    // 1. Inertia blend
    let target = input_direction(input.move_input);
    data.move_direction = data.move_direction * config.inertia + target * (1.0 - config.inertia);

    // 2. Input velocity
    data.current_move_input_velocity = data.move_direction * config.max_run_speed;

    // 3. Horizontal from input, vertical from physics
    let mut velocity = Vec3::new(
        data.current_move_input_velocity.x,
        physics.velocity().y,
        data.current_move_input_velocity.z,
    );

    // 4. Facing
    let horizontal = Vec2::new(data.move_direction.x, data.move_direction.z);
    if horizontal.length() > config.facing_epsilon {
        data.yaw = horizontal.x.atan2(horizontal.y);
    }

    // 5. Jump
    let grounded = physics.is_grounded();
    let can_jump = if config.jump_reaction_threshold <= 0.0 {
        grounded
    } else {
        if grounded {
            data.jump_reaction_remaining = config.jump_reaction_threshold;
        } else {
            data.jump_reaction_remaining -= dt;
        }
        data.jump_reaction_remaining > 0.0
    };
    if input.jump_pressed && can_jump {
        velocity.y = config.jump_speed;
        data.jump_reaction_remaining = 0.0;
    }

    data.input_sequence = input.sequence;
    velocity
}

/// Run one full tick: the state machine plus exactly one physics step of `dt`.
pub fn simulate_movement_tick(
    data: &mut MovementData,
    input: &InputCommandSet,
    physics: &mut dyn CharacterPhysics,
    config: &MovementConfig,
    dt: f32,
) -> PhysicsStep {
    let velocity = apply_movement_input(data, input, &*physics, config, dt);
    physics.set_velocity(velocity);
    let step = physics.step(velocity, dt);
    data.record_step(&step);
    step
}

/// Put the character controller into the state recorded in `data`.
///
/// Teleports, restores velocity and takes a zero-length step so the
/// controller's grounded flag matches the restored position.
pub fn restore_physics(data: &mut MovementData, physics: &mut dyn CharacterPhysics) {
    physics.teleport(data.position);
    physics.set_velocity(data.physics_velocity);
    let step = physics.step(data.physics_velocity, 0.0);
    data.is_grounded = step.is_grounded;
}

// =============================================================================
// TESTS
// =============================================================================
