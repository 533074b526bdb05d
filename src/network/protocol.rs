//! Protocol Messages
//!
//! Wire format for client-server communication. Messages are encoded with
//! bincode for the transport and can be rendered as JSON for debugging.
//! Enums are externally tagged so both encodings work.
//!
//! Every message names the delivery class it must be sent with:
//!
//! | Message                         | Class            |
//! |---------------------------------|------------------|
//! | join / leave / spawn / despawn  | reliable-ordered |
//! | input / state                   | unreliable       |
//! | clock-sync request and reply    | unreliable       |

use glam::{Vec2, Vec3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::tick::{PlayerInputSequenceNumber, SimulationTickNumber};
use crate::game::entity::{EntityOwner, NetworkEntityId, PlayerId};
use crate::game::input::InputCommandSet;
use crate::game::movement::MovementData;
use crate::game::prediction::InputAcknowledgement;

/// Protocol version string exchanged on join.
pub const PROTOCOL_VERSION: &str = "stepline/1";

/// Encoding and decoding failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Binary encode/decode failed.
    #[error("Binary codec error: {0}")]
    Binary(#[from] bincode::Error),

    /// JSON encode/decode failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Delivery guarantees offered by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryClass {
    /// May drop, reorder or duplicate.
    Unreliable,
    /// May drop; anything older than the newest delivered is discarded.
    UnreliableSequenced,
    /// Always arrives, in any order.
    ReliableUnordered,
    /// Always arrives, in send order.
    ReliableOrdered,
    /// Only the newest is guaranteed; older ones may be skipped.
    ReliableSequenced,
}

impl DeliveryClass {
    /// True if the transport must not lose the message.
    pub fn is_reliable(self) -> bool {
        matches!(
            self,
            Self::ReliableUnordered | Self::ReliableOrdered | Self::ReliableSequenced
        )
    }

    /// True if messages older than the newest delivered are discarded.
    pub fn is_sequenced(self) -> bool {
        matches!(self, Self::UnreliableSequenced | Self::ReliableSequenced)
    }
}

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientMessage {
    /// Ask to join the simulation.
    Join {
        /// Client protocol version.
        protocol_version: String,
    },

    /// Leaving; the server despawns the player's entity.
    Leave,

    /// Newest pending inputs, oldest first.
    Input(InputBatch),

    /// Clock-sync request.
    ClockSyncRequest {
        /// Client's local time when sent (ns), echoed back.
        client_time_ns: u64,
    },
}

/// Redundant batch of player inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputBatch {
    /// Inputs in sequence order.
    pub inputs: Vec<PlayerInput>,
}

/// One player input on the wire. The server tags the tick on receipt.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlayerInput {
    /// Input sequence number.
    pub sequence: PlayerInputSequenceNumber,
    /// Movement on the ground plane.
    pub move_input: Vec2,
    /// Jump requested.
    pub jump: bool,
}

impl From<&InputCommandSet> for PlayerInput {
    fn from(command: &InputCommandSet) -> Self {
        Self {
            sequence: command.sequence,
            move_input: command.move_input,
            jump: command.jump_pressed,
        }
    }
}

impl PlayerInput {
    /// Command set as seen by the server; tick and camera fields are left empty.
    pub fn to_command(&self) -> InputCommandSet {
        InputCommandSet {
            sequence: self.sequence,
            move_input: self.move_input,
            jump_pressed: self.jump,
            ..InputCommandSet::default()
        }
    }
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerMessage {
    /// Join succeeded.
    JoinAccepted {
        /// Assigned player id.
        player_id: PlayerId,
        /// Entity the player controls.
        entity_id: NetworkEntityId,
        /// Server tick at acceptance.
        tick: SimulationTickNumber,
    },

    /// Join refused.
    JoinRejected {
        /// Why.
        reason: String,
    },

    /// An entity appeared.
    Spawn(EntitySpawn),

    /// An entity went away.
    Despawn {
        /// Removed entity.
        entity_id: NetworkEntityId,
    },

    /// Per-tick authoritative state.
    State(StateUpdate),

    /// Clock-sync reply.
    ClockSyncResponse {
        /// Echo of the request's client time.
        client_time_ns: u64,
        /// Server world time when replying (ns).
        server_world_time_ns: u64,
        /// Server tick when replying.
        server_tick: SimulationTickNumber,
    },

    /// Server is going away.
    Shutdown {
        /// Why.
        reason: String,
    },
}

/// Spawn notice with initial state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySpawn {
    /// New entity.
    pub entity_id: NetworkEntityId,
    /// Controller.
    pub owner: EntityOwner,
    /// Tick of `state`.
    pub tick: SimulationTickNumber,
    /// Initial movement state.
    pub state: EntityUpdate,
}

/// Authoritative state for one tick, addressed to one client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateUpdate {
    /// Server tick this state belongs to.
    pub tick: SimulationTickNumber,
    /// Input acknowledgement for the receiving client.
    pub ack: InputAcknowledgement,
    /// Every entity's state at `tick`.
    pub entities: Vec<EntityUpdate>,
}

/// One entity's movement state on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EntityUpdate {
    /// Entity.
    pub entity_id: NetworkEntityId,
    /// Position.
    pub position: Vec3,
    /// Facing (radians).
    pub yaw: f32,
    /// Fraction of max run speed, for animation.
    pub move_speed_fraction: f32,
    /// Smoothed move direction.
    pub move_direction: Vec3,
    /// Move-input velocity.
    pub current_move_input_velocity: Vec3,
    /// Physics linear velocity.
    pub physics_velocity: Vec3,
    /// Grounded.
    pub is_grounded: bool,
    /// Jump grace time left.
    pub jump_reaction_remaining: f32,
    /// Input that produced this state.
    pub input_sequence: PlayerInputSequenceNumber,
}

impl EntityUpdate {
    /// Wire form of `data`.
    pub fn from_movement(entity_id: NetworkEntityId, data: &MovementData) -> Self {
        Self {
            entity_id,
            position: data.position,
            yaw: data.yaw,
            move_speed_fraction: data.move_speed_fraction(),
            move_direction: data.move_direction,
            current_move_input_velocity: data.current_move_input_velocity,
            physics_velocity: data.physics_velocity,
            is_grounded: data.is_grounded,
            jump_reaction_remaining: data.jump_reaction_remaining,
            input_sequence: data.input_sequence,
        }
    }

    /// Movement state carried by this update.
    pub fn to_movement(&self) -> MovementData {
        MovementData {
            move_direction: self.move_direction,
            current_move_input_velocity: self.current_move_input_velocity,
            position: self.position,
            yaw: self.yaw,
            is_grounded: self.is_grounded,
            physics_velocity: self.physics_velocity,
            jump_reaction_remaining: self.jump_reaction_remaining,
            input_sequence: self.input_sequence,
        }
    }
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Delivery class this message must use.
    pub fn delivery_class(&self) -> DeliveryClass {
        match self {
            Self::Join { .. } | Self::Leave => DeliveryClass::ReliableOrdered,
            Self::Input(_) | Self::ClockSyncRequest { .. } => DeliveryClass::Unreliable,
        }
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(s)?)
    }

    /// Serialize to binary.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from binary.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(bincode::deserialize(data)?)
    }
}

impl ServerMessage {
    /// Delivery class this message must use.
    pub fn delivery_class(&self) -> DeliveryClass {
        match self {
            Self::State(_) | Self::ClockSyncResponse { .. } => DeliveryClass::Unreliable,
            Self::JoinAccepted { .. }
            | Self::JoinRejected { .. }
            | Self::Spawn(_)
            | Self::Despawn { .. }
            | Self::Shutdown { .. } => DeliveryClass::ReliableOrdered,
        }
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(s)?)
    }

    /// Serialize to binary.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from binary.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(bincode::deserialize(data)?)
    }
}
