//! # Stepline
//!
//! Fixed-tick netcode core for an authoritative server with client-side
//! prediction, server reconciliation and snapshot interpolation.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          STEPLINE                            │
//! ├──────────────────────────────────────────────────────────────┤
//! │  config.rs          - Netcode tunables (JSON)                │
//! │                                                              │
//! │  core/              - Simulation primitives                  │
//! │  ├── tick.rs        - Tick and input sequence numbers        │
//! │  ├── ring_buffer.rs - Fixed-capacity overwrite-oldest buffer │
//! │  ├── snapshot_store - Tick-ordered snapshot history          │
//! │  ├── pool.rs        - Reusable snapshot stores               │
//! │  ├── clock.rs       - Fixed-step and server-estimate clocks  │
//! │  └── hash.rs        - State hashing for determinism checks   │
//! │                                                              │
//! │  game/              - Movement and its replication           │
//! │  ├── physics.rs     - Character controller seam              │
//! │  ├── movement.rs    - Per-tick movement state machine        │
//! │  ├── input.rs       - Input capture and pending inputs       │
//! │  ├── entity.rs      - Network entities and registry          │
//! │  ├── prediction.rs  - Prediction and resimulation            │
//! │  ├── authority.rs   - Server input queues                    │
//! │  ├── interpolation  - Render transforms                      │
//! │  └── tick.rs        - Server and client update loops         │
//! │                                                              │
//! │  network/           - Messages and connections               │
//! │  ├── protocol.rs    - Wire messages                          │
//! │  ├── transport.rs   - Transport seam and simulated link      │
//! │  ├── session.rs     - Server session                         │
//! │  ├── client.rs      - Client handshake and input upload      │
//! │  └── server.rs      - Local match driver                     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Determinism
//!
//! Given the same starting state and the same ordered inputs, the movement
//! state machine produces bit-identical results. Entity collections iterate
//! in id order (`BTreeMap`), clock accounting uses integer nanoseconds, and
//! the simulated network draws all randomness from a seeded generator.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod core;
pub mod game;
pub mod network;

// Re-export commonly used types
pub use config::{ConfigError, NetcodeConfig};
pub use crate::core::clock::{NetworkServerSimulationClock, SimulationClock};
pub use crate::core::snapshot_store::{Snapshot, SnapshotStore};
pub use crate::core::tick::{PlayerInputSequenceNumber, SimulationTickNumber};
pub use game::movement::{MovementConfig, MovementData};
pub use game::tick::{ClientSimulation, ServerSimulation};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default simulation tick rate (Hz)
pub const DEFAULT_TICK_RATE: u32 = 30;

/// Default seconds of history kept per snapshot store
pub const DEFAULT_SNAPSHOT_RETENTION_SECS: u32 = 5;
