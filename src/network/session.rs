//! Server Session
//!
//! Owns the authoritative simulation and every client connection. One call
//! to [`ServerSession::update`] per frame:
//!
//! ```text
//! poll connections ──► join / leave / input / clock sync
//!        │
//! advance clock ──► for each due tick: step entities, send State to each peer
//!        │
//! drop closed connections ──► despawn entity, broadcast Despawn
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::NetcodeConfig;
use crate::core::tick::SimulationTickNumber;
use crate::game::entity::{EntityOwner, NetworkEntityId, PlayerId};
use crate::game::physics::CharacterPhysics;
use crate::game::tick::{PhysicsFactory, ServerSimulation};
use crate::network::protocol::{
    ClientMessage, EntitySpawn, EntityUpdate, ProtocolError, ServerMessage, StateUpdate, PROTOCOL_VERSION,
};
use crate::network::transport::{Transport, TransportError};

/// Server-local connection handle.
pub type ConnectionId = u32;

/// Failures talking to one connection.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Message could not be encoded or decoded.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Transport failed.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// No such connection.
    #[error("Unknown connection {0}")]
    UnknownConnection(ConnectionId),
}

/// A joined player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinedPlayer {
    /// Player identity.
    pub player_id: PlayerId,
    /// Entity the player controls.
    pub entity_id: NetworkEntityId,
}

struct Peer<T> {
    transport: T,
    player: Option<JoinedPlayer>,
    closing: bool,
}

/// Summary of one session update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionUpdate {
    /// Ticks simulated.
    pub ticks: Vec<SimulationTickNumber>,
    /// Messages decoded.
    pub messages_received: usize,
    /// Players that left or were dropped.
    pub departed: Vec<PlayerId>,
}

/// Authoritative server with its connections.
pub struct ServerSession<T, P> {
    simulation: ServerSimulation<P>,
    peers: BTreeMap<ConnectionId, Peer<T>>,
    next_connection: ConnectionId,
    max_players: usize,
}

impl<T: Transport, P: CharacterPhysics> ServerSession<T, P> {
    /// Create a session accepting up to `max_players`.
    pub fn new(config: NetcodeConfig, max_players: usize, spawn_physics: PhysicsFactory<P>) -> Self {
        Self {
            simulation: ServerSimulation::new(config, spawn_physics),
            peers: BTreeMap::new(),
            next_connection: 0,
            max_players,
        }
    }

    /// The authoritative simulation.
    pub fn simulation(&self) -> &ServerSimulation<P> {
        &self.simulation
    }

    /// Open connections, joined or not.
    pub fn connection_count(&self) -> usize {
        self.peers.len()
    }

    /// Joined players, by connection.
    pub fn players(&self) -> impl Iterator<Item = (ConnectionId, JoinedPlayer)> + '_ {
        self.peers.iter().filter_map(|(id, peer)| peer.player.map(|p| (*id, p)))
    }

    fn player_count(&self) -> usize {
        self.players().count()
    }

    /// Take ownership of a new connection. It must send `Join` before playing.
    pub fn accept(&mut self, transport: T) -> ConnectionId {
        let id = self.next_connection;
        self.next_connection = self.next_connection.wrapping_add(1);
        self.peers.insert(
            id,
            Peer {
                transport,
                player: None,
                closing: false,
            },
        );
        debug!(connection = id, "connection accepted");
        id
    }

    /// Send one message to one connection.
    pub fn send_to(&mut self, connection: ConnectionId, message: &ServerMessage) -> Result<(), SessionError> {
        let peer = self
            .peers
            .get_mut(&connection)
            .ok_or(SessionError::UnknownConnection(connection))?;
        let bytes = message.to_bytes()?;
        peer.transport.send(bytes, message.delivery_class())?;
        Ok(())
    }

    /// Send to every joined connection except `except`.
    fn broadcast(&mut self, message: &ServerMessage, except: Option<ConnectionId>) {
        let targets: Vec<ConnectionId> = self
            .players()
            .map(|(id, _)| id)
            .filter(|id| Some(*id) != except)
            .collect();
        for target in targets {
            self.send_or_drop(target, message);
        }
    }

    /// Send, marking the connection for removal on failure.
    fn send_or_drop(&mut self, connection: ConnectionId, message: &ServerMessage) {
        if let Err(err) = self.send_to(connection, message) {
            warn!(connection, error = %err, "send failed, dropping connection");
            if let Some(peer) = self.peers.get_mut(&connection) {
                peer.closing = true;
            }
        }
    }

    /// Process input, run due ticks and publish their state.
    pub fn update(&mut self, elapsed: Duration) -> SessionUpdate {
        let mut report = SessionUpdate::default();

        // 1. Drain connections
        for (connection, message) in self.poll_connections() {
            report.messages_received += 1;
            self.handle_message(connection, message);
        }

        // 2. Simulate and publish
        let update = self.simulation.advance_clock(elapsed);
        for tick in update.ticks() {
            self.simulation.run_tick(tick);
            self.publish_state(tick);
            report.ticks.push(tick);
        }

        // 3. Departures
        report.departed = self.remove_closed();
        report
    }

    fn poll_connections(&mut self) -> Vec<(ConnectionId, ClientMessage)> {
        let mut received = Vec::new();
        for (id, peer) in self.peers.iter_mut() {
            loop {
                match peer.transport.poll() {
                    Ok(Some(bytes)) => match ClientMessage::from_bytes(&bytes) {
                        Ok(message) => received.push((*id, message)),
                        Err(err) => warn!(connection = *id, error = %err, "undecodable message"),
                    },
                    Ok(None) => break,
                    Err(err) => {
                        debug!(connection = *id, error = %err, "connection lost");
                        peer.closing = true;
                        break;
                    }
                }
            }
        }
        received
    }

    fn handle_message(&mut self, connection: ConnectionId, message: ClientMessage) {
        let player = match self.peers.get(&connection) {
            Some(peer) if !peer.closing => peer.player,
            _ => return,
        };

        match message {
            ClientMessage::Join { protocol_version } => self.handle_join(connection, player, &protocol_version),
            ClientMessage::Leave => {
                if let Some(peer) = self.peers.get_mut(&connection) {
                    peer.closing = true;
                }
            }
            ClientMessage::Input(batch) => {
                let Some(player) = player else {
                    debug!(connection, "input before join ignored");
                    return;
                };
                for input in &batch.inputs {
                    self.simulation.receive_input(player.entity_id, input.to_command());
                }
            }
            ClientMessage::ClockSyncRequest { client_time_ns } => {
                let clock = self.simulation.clock();
                let reply = ServerMessage::ClockSyncResponse {
                    client_time_ns,
                    server_world_time_ns: clock.world_time().as_nanos() as u64,
                    server_tick: clock.tick(),
                };
                self.send_or_drop(connection, &reply);
            }
        }
    }

    fn handle_join(&mut self, connection: ConnectionId, existing: Option<JoinedPlayer>, version: &str) {
        let tick = self.simulation.tick();
        if let Some(player) = existing {
            // Retransmitted join; repeat the answer.
            let accepted = ServerMessage::JoinAccepted {
                player_id: player.player_id,
                entity_id: player.entity_id,
                tick,
            };
            self.send_or_drop(connection, &accepted);
            return;
        }

        let rejection = if version != PROTOCOL_VERSION {
            Some(format!("protocol version {} not supported", version))
        } else if self.player_count() >= self.max_players {
            Some("session full".to_string())
        } else {
            None
        };
        if let Some(reason) = rejection {
            info!(connection, %reason, "join rejected");
            self.send_or_drop(connection, &ServerMessage::JoinRejected { reason });
            if let Some(peer) = self.peers.get_mut(&connection) {
                peer.closing = true;
            }
            return;
        }

        let player_id = PlayerId::random();
        let entity_id = self.simulation.spawn(EntityOwner::Player(player_id));
        let joined = JoinedPlayer { player_id, entity_id };
        if let Some(peer) = self.peers.get_mut(&connection) {
            peer.player = Some(joined);
        }
        info!(
            connection,
            player = %player_id.to_uuid_string(),
            entity = %entity_id.short(),
            "player joined"
        );

        self.send_or_drop(
            connection,
            &ServerMessage::JoinAccepted {
                player_id,
                entity_id,
                tick,
            },
        );

        // Newcomer learns about everything; everyone else learns about the newcomer.
        for spawn in self.spawn_messages() {
            let is_new = matches!(&spawn, ServerMessage::Spawn(s) if s.entity_id == entity_id);
            self.send_or_drop(connection, &spawn);
            if is_new {
                self.broadcast(&spawn, Some(connection));
            }
        }
    }

    fn spawn_messages(&self) -> Vec<ServerMessage> {
        let tick = self.simulation.tick();
        self.simulation
            .registry()
            .iter()
            .filter_map(|record| {
                let latest = record.movement.latest().ok()?;
                Some(ServerMessage::Spawn(EntitySpawn {
                    entity_id: record.entity.id,
                    owner: record.entity.owner,
                    tick: latest.tick.min(tick),
                    state: EntityUpdate::from_movement(record.entity.id, &latest.data),
                }))
            })
            .collect()
    }

    fn publish_state(&mut self, tick: SimulationTickNumber) {
        let entities: Vec<EntityUpdate> = self
            .simulation
            .entity_states()
            .iter()
            .map(|(id, data)| EntityUpdate::from_movement(*id, data))
            .collect();

        let targets: Vec<(ConnectionId, JoinedPlayer)> = self.players().collect();
        for (connection, player) in targets {
            let ack = self
                .simulation
                .acknowledgement(player.entity_id)
                .unwrap_or_default();
            let message = ServerMessage::State(StateUpdate {
                tick,
                ack,
                entities: entities.clone(),
            });
            self.send_or_drop(connection, &message);
        }
    }

    fn remove_closed(&mut self) -> Vec<PlayerId> {
        let closed: Vec<ConnectionId> = self
            .peers
            .iter()
            .filter(|(_, peer)| peer.closing || !peer.transport.is_connected())
            .map(|(id, _)| *id)
            .collect();

        let mut departed = Vec::new();
        for connection in closed {
            let Some(mut peer) = self.peers.remove(&connection) else {
                continue;
            };
            peer.transport.close();
            if let Some(player) = peer.player {
                self.simulation.despawn(player.entity_id);
                self.broadcast(
                    &ServerMessage::Despawn {
                        entity_id: player.entity_id,
                    },
                    None,
                );
                info!(player = %player.player_id.to_uuid_string(), "player left");
                departed.push(player.player_id);
            }
        }
        departed
    }

    /// Tell every connection the server is going away and close them all.
    pub fn shutdown(&mut self, reason: &str) {
        let message = ServerMessage::Shutdown {
            reason: reason.to_string(),
        };
        let ids: Vec<ConnectionId> = self.peers.keys().copied().collect();
        for id in ids {
            self.send_or_drop(id, &message);
        }
        info!(connections = self.peers.len(), reason, "session shut down");
        self.peers.clear();
    }
}

// =============================================================================
// TESTS
// =============================================================================
