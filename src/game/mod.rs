//! Game Simulation Module
//!
//! Character movement and everything that keeps client and server copies of
//! it in agreement.
//!
//! ## Module Structure
//!
//! - `physics`: Character controller interface and a kinematic implementation
//! - `movement`: Movement state and the per-tick movement state machine
//! - `input`: Input capture, command sets, pending input list
//! - `entity`: Network entity ids, ownership, registry
//! - `prediction`: Client-side prediction and resimulation
//! - `authority`: Server input queues and authoritative stepping
//! - `interpolation`: Render transforms for local and remote entities
//! - `tick`: Server and client update loops

pub mod authority;
pub mod entity;
pub mod input;
pub mod interpolation;
pub mod movement;
pub mod physics;
pub mod prediction;
pub mod tick;

// Re-export key types
pub use authority::{AuthoritativeMovement, EnqueueOutcome, PlayerInputQueue};
pub use entity::{EntityOwner, EntityRegistry, NetworkEntity, NetworkEntityId, PlayerId};
pub use input::{InputCapture, InputCommandSet, InputSample, PendingInputs};
pub use interpolation::RenderTransform;
pub use movement::{MovementConfig, MovementData};
pub use physics::{CharacterPhysics, KinematicCharacter, KinematicSettings, PhysicsStep};
pub use prediction::{InputAcknowledgement, LocalPlayerPrediction, PredictionStats};
pub use tick::{ClientEntity, ClientFrame, ClientSimulation, PhysicsFactory, ServerSimulation};
