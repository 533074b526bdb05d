//! Networked Entities and the Entity Registry
//!
//! Every simulated object shared between client and server is a
//! [`NetworkEntity`] identified by a [`NetworkEntityId`] assigned at spawn.
//! The [`EntityRegistry`] owns each entity's identity, its authoritative
//! movement history and a role-specific component (server authority state
//! or client prediction state), so processors look everything up in one
//! place instead of chasing per-component maps.
//!
//! BTreeMap keeps iteration order stable across runs.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::core::pool::SnapshotPool;
use crate::core::snapshot_store::SnapshotStore;
use crate::core::tick::SimulationTickNumber;
use crate::game::movement::MovementData;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Globally unique entity id, shared by the client and server copies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NetworkEntityId(pub [u8; 16]);

impl NetworkEntityId {
    /// Fresh random id.
    pub fn random() -> Self {
        Self(*Uuid::new_v4().as_bytes())
    }

    /// Create from raw bytes.
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Convert to UUID string.
    pub fn to_uuid_string(&self) -> String {
        Uuid::from_bytes(self.0).to_string()
    }

    /// Short hex prefix for logs.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

/// Connected player identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PlayerId(pub [u8; 16]);

impl PlayerId {
    /// Fresh random id.
    pub fn random() -> Self {
        Self(*Uuid::new_v4().as_bytes())
    }

    /// Create from raw bytes.
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Convert to UUID string.
    pub fn to_uuid_string(&self) -> String {
        Uuid::from_bytes(self.0).to_string()
    }

    /// Get raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

/// Who controls an entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityOwner {
    /// Driven by a player's input.
    Player(PlayerId),
    /// Driven by the server alone.
    Server,
}

/// Identity and acknowledgement state of a networked entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NetworkEntity {
    /// Id assigned at spawn.
    pub id: NetworkEntityId,
    /// Controlling party.
    pub owner: EntityOwner,
    /// Newest server tick whose state the owner has confirmed.
    pub last_acknowledged_server_tick: SimulationTickNumber,
}

impl NetworkEntity {
    /// New entity with nothing acknowledged.
    pub fn new(id: NetworkEntityId, owner: EntityOwner) -> Self {
        Self {
            id,
            owner,
            last_acknowledged_server_tick: SimulationTickNumber::ZERO,
        }
    }

    /// True if `player` controls this entity.
    pub fn is_owned_by(&self, player: PlayerId) -> bool {
        self.owner == EntityOwner::Player(player)
    }

    /// Raise the acknowledged tick. Older ticks are ignored.
    pub fn acknowledge_server_tick(&mut self, tick: SimulationTickNumber) -> bool {
        if tick > self.last_acknowledged_server_tick {
            self.last_acknowledged_server_tick = tick;
            true
        } else {
            false
        }
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Everything stored for one entity.
#[derive(Debug)]
pub struct EntityRecord<C> {
    /// Identity.
    pub entity: NetworkEntity,
    /// Authoritative movement history.
    pub movement: SnapshotStore<MovementData>,
    /// Role-specific state.
    pub component: C,
}

/// Single owner of all entity state for one process role.
#[derive(Debug)]
pub struct EntityRegistry<C> {
    records: BTreeMap<NetworkEntityId, EntityRecord<C>>,
    pool: SnapshotPool<MovementData>,
}

impl<C> EntityRegistry<C> {
    /// Create a registry whose movement stores hold `snapshot_capacity` ticks.
    pub fn new(snapshot_capacity: usize) -> Self {
        Self {
            records: BTreeMap::new(),
            pool: SnapshotPool::new(snapshot_capacity),
        }
    }

    /// Number of entities.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True if there are no entities.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// True if `id` is registered.
    pub fn contains(&self, id: NetworkEntityId) -> bool {
        self.records.contains_key(&id)
    }

    /// Register an entity, taking a movement store from the pool.
    ///
    /// Re-spawning an existing id replaces its component and keeps its history.
    pub fn spawn(&mut self, entity: NetworkEntity, component: C) -> &mut EntityRecord<C> {
        match self.records.entry(entity.id) {
            Entry::Occupied(occupied) => {
                let record = occupied.into_mut();
                record.entity.owner = entity.owner;
                record.component = component;
                record
            }
            Entry::Vacant(vacant) => {
                debug!(entity = %entity.id.short(), "entity spawned");
                vacant.insert(EntityRecord {
                    entity,
                    movement: self.pool.acquire(),
                    component,
                })
            }
        }
    }

    /// Remove an entity, returning its store to the pool.
    pub fn despawn(&mut self, id: NetworkEntityId) -> Option<(NetworkEntity, C)> {
        let record = self.records.remove(&id)?;
        debug!(entity = %id.short(), "entity despawned");
        self.pool.release(record.movement);
        Some((record.entity, record.component))
    }

    /// Full record.
    pub fn get(&self, id: NetworkEntityId) -> Option<&EntityRecord<C>> {
        self.records.get(&id)
    }

    /// Full record, mutably.
    pub fn get_mut(&mut self, id: NetworkEntityId) -> Option<&mut EntityRecord<C>> {
        self.records.get_mut(&id)
    }

    /// Identity of an entity.
    pub fn entity(&self, id: NetworkEntityId) -> Option<&NetworkEntity> {
        self.records.get(&id).map(|r| &r.entity)
    }

    /// Authoritative movement history of an entity.
    pub fn movement(&self, id: NetworkEntityId) -> Option<&SnapshotStore<MovementData>> {
        self.records.get(&id).map(|r| &r.movement)
    }

    /// Authoritative movement history of an entity, mutably.
    pub fn movement_mut(&mut self, id: NetworkEntityId) -> Option<&mut SnapshotStore<MovementData>> {
        self.records.get_mut(&id).map(|r| &mut r.movement)
    }

    /// Role component of an entity.
    pub fn component(&self, id: NetworkEntityId) -> Option<&C> {
        self.records.get(&id).map(|r| &r.component)
    }

    /// Role component of an entity, mutably.
    pub fn component_mut(&mut self, id: NetworkEntityId) -> Option<&mut C> {
        self.records.get_mut(&id).map(|r| &mut r.component)
    }

    /// Ids in stable order.
    pub fn ids(&self) -> impl Iterator<Item = NetworkEntityId> + '_ {
        self.records.keys().copied()
    }

    /// Records in id order.
    pub fn iter(&self) -> impl Iterator<Item = &EntityRecord<C>> {
        self.records.values()
    }

    /// Records in id order, mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut EntityRecord<C>> {
        self.records.values_mut()
    }

    /// Entity controlled by `player`, if any.
    pub fn owned_by(&self, player: PlayerId) -> Option<NetworkEntityId> {
        self.records
            .values()
            .find(|r| r.entity.is_owned_by(player))
            .map(|r| r.entity.id)
    }

    /// Take an extra store from the pool, e.g. for predicted history.
    pub fn acquire_store(&mut self) -> SnapshotStore<MovementData> {
        self.pool.acquire()
    }

    /// Return a store taken with [`acquire_store`](Self::acquire_store).
    pub fn release_store(&mut self, store: SnapshotStore<MovementData>) {
        self.pool.release(store);
    }

    /// Idle stores in the pool.
    pub fn pooled_stores(&self) -> usize {
        self.pool.idle()
    }
}

// =============================================================================
// TESTS
// =============================================================================
