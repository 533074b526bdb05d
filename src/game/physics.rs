//! Character physics adapter.
//!
//! The movement state machine never touches a physics engine directly. It
//! talks to a [`CharacterPhysics`] implementation, which wraps whatever
//! character controller the host uses. [`KinematicCharacter`] is the built-in
//! implementation: a capsule-less point mass over a flat, optionally bounded,
//! ground plane with gravity.
//!
//! A step with `dt == 0.0` must not move the character; it only refreshes the
//! grounded state against the current position.

use glam::Vec3;
use serde::{Deserialize, Serialize};

/// Outcome of one physics step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhysicsStep {
    /// Position after the step.
    pub position: Vec3,
    /// Linear velocity after the step.
    pub velocity: Vec3,
    /// Standing on ground after the step.
    pub is_grounded: bool,
}

/// Narrow interface onto a physics engine's character controller.
pub trait CharacterPhysics {
    /// Move with `velocity` for `dt` seconds.
    fn step(&mut self, velocity: Vec3, dt: f32) -> PhysicsStep;

    /// Current linear velocity.
    fn velocity(&self) -> Vec3;

    /// Overwrite the linear velocity.
    fn set_velocity(&mut self, velocity: Vec3);

    /// Grounded state as of the last step.
    fn is_grounded(&self) -> bool;

    /// Current position.
    fn position(&self) -> Vec3;

    /// Move instantly, without sweeping.
    fn teleport(&mut self, position: Vec3);
}

/// Parameters for [`KinematicCharacter`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KinematicSettings {
    /// Downward acceleration (units/s²).
    pub gravity: f32,
    /// Height of the ground plane.
    pub ground_height: f32,
    /// Half-size of the square ground area around the origin. `None` is unbounded.
    pub ground_half_extent: Option<f32>,
}

impl Default for KinematicSettings {
    fn default() -> Self {
        Self {
            gravity: 20.0,
            ground_height: 0.0,
            ground_half_extent: None,
        }
    }
}

const GROUND_EPSILON: f32 = 1e-4;

/// Deterministic point-mass character over a flat ground plane.
#[derive(Debug, Clone, PartialEq)]
pub struct KinematicCharacter {
    settings: KinematicSettings,
    position: Vec3,
    velocity: Vec3,
    grounded: bool,
}

impl KinematicCharacter {
    /// Create a character at `position`, grounded if it is resting on the ground.
    pub fn new(settings: KinematicSettings, position: Vec3) -> Self {
        let mut character = Self {
            settings,
            position,
            velocity: Vec3::ZERO,
            grounded: false,
        };
        character.grounded = character.touching_ground();
        character
    }

    fn above_ground_area(&self, position: Vec3) -> bool {
        match self.settings.ground_half_extent {
            Some(extent) => position.x.abs() <= extent && position.z.abs() <= extent,
            None => true,
        }
    }

    fn touching_ground(&self) -> bool {
        self.above_ground_area(self.position)
            && (self.position.y - self.settings.ground_height).abs() <= GROUND_EPSILON
    }
}

impl CharacterPhysics for KinematicCharacter {
    fn step(&mut self, velocity: Vec3, dt: f32) -> PhysicsStep {
        if dt <= 0.0 {
            self.velocity = velocity;
            self.grounded = self.touching_ground();
            return PhysicsStep {
                position: self.position,
                velocity: self.velocity,
                is_grounded: self.grounded,
            };
        }

        let mut velocity = velocity;
        if self.grounded && velocity.y <= 0.0 {
            velocity.y = 0.0;
        } else {
            velocity.y -= self.settings.gravity * dt;
        }

        let mut position = self.position + velocity * dt;
        let ground = self.settings.ground_height;
        let landed = self.above_ground_area(position)
            && position.y <= ground
            && self.position.y >= ground - GROUND_EPSILON;
        if landed {
            position.y = ground;
            velocity.y = velocity.y.max(0.0);
        }

        self.position = position;
        self.velocity = velocity;
        self.grounded = landed && velocity.y <= 0.0;

        PhysicsStep {
            position,
            velocity,
            is_grounded: self.grounded,
        }
    }

    fn velocity(&self) -> Vec3 {
        self.velocity
    }

    fn set_velocity(&mut self, velocity: Vec3) {
        self.velocity = velocity;
    }

    fn is_grounded(&self) -> bool {
        self.grounded
    }

    fn position(&self) -> Vec3 {
        self.position
    }

    fn teleport(&mut self, position: Vec3) {
        self.position = position;
    }
}
