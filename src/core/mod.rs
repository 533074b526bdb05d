//! Core simulation primitives.
//!
//! Tick counters, the ring-buffer snapshot history and the fixed-step
//! clocks. Nothing here knows about movement or networking.

pub mod clock;
pub mod hash;
pub mod pool;
pub mod ring_buffer;
pub mod snapshot_store;
pub mod tick;

// Re-export core types
pub use clock::{ClockSteering, ClockUpdate, NetworkServerSimulationClock, SimulationClock};
pub use hash::{compute_state_hash, StateHash, StateHasher};
pub use pool::SnapshotPool;
pub use ring_buffer::{RingBuffer, SnapshotError};
pub use snapshot_store::{Snapshot, SnapshotStore};
pub use tick::{PlayerInputSequenceNumber, SimulationTickNumber};
