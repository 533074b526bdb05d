//! Network Layer
//!
//! Wire messages, the transport seam, and the glue that drives the game
//! loops from received messages. Nothing here affects simulation results;
//! all movement logic runs through `game/`.

pub mod client;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;

pub use client::{ClientConnection, ConnectionError, ConnectionPhase, SessionInfo};
pub use protocol::{ClientMessage, DeliveryClass, EntityUpdate, ServerMessage, StateUpdate, PROTOCOL_VERSION};
pub use server::{run_local_match, MatchConfig, MatchReport, ServerError};
pub use session::{ConnectionId, ServerSession, SessionError};
pub use transport::{LinkConfig, SimulatedEndpoint, SimulatedNetwork, Transport, TransportError};
