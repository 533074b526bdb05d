//! Client Connection
//!
//! Drives a [`ClientSimulation`] over a [`Transport`]:
//!
//! ```text
//! Joining ──JoinAccepted──► ClockSyncing ──ClockSyncResponse──► Connected
//!    │                          │
//!    └─ join timeout            └─ no response after N attempts
//! ```
//!
//! The outcome of the handshake is also delivered through the
//! `oneshot::Receiver` returned by [`ClientConnection::connect`].

use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::NetcodeConfig;
use crate::game::entity::{NetworkEntityId, PlayerId};
use crate::game::input::InputSample;
use crate::game::physics::CharacterPhysics;
use crate::game::tick::{ClientFrame, ClientSimulation, PhysicsFactory};
use crate::network::protocol::{ClientMessage, InputBatch, PlayerInput, ProtocolError, ServerMessage, PROTOCOL_VERSION};
use crate::network::transport::{Transport, TransportError};

/// Connection failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConnectionError {
    /// The server closed the connection or shut down.
    #[error("Disconnected")]
    Disconnected,

    /// Transport failed.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Clock sync got no answer.
    #[error("Clock sync timed out after {attempts} attempts")]
    HandshakeTimeout {
        /// Requests sent.
        attempts: u32,
    },

    /// The server refused to let us join.
    #[error("Join rejected: {0}")]
    JoinRejected(String),

    /// The server never answered the join.
    #[error("Join timed out")]
    JoinTimeout,

    /// Message could not be encoded or decoded.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl From<ProtocolError> for ConnectionError {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(err.to_string())
    }
}

/// Handshake stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// `Join` sent, waiting for an answer.
    Joining,
    /// Joined, estimating the server clock.
    ClockSyncing,
    /// Simulating.
    Connected,
    /// Finished, successfully or not.
    Closed,
}

/// What the client learned during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    /// Assigned player id.
    pub player_id: PlayerId,
    /// Entity this client controls.
    pub entity_id: NetworkEntityId,
    /// Measured round trip of the clock-sync exchange.
    pub round_trip: Duration,
}

/// Resolves once the handshake completes or fails.
pub type ConnectReceiver = oneshot::Receiver<Result<SessionInfo, ConnectionError>>;

/// Client end of a connection.
pub struct ClientConnection<T, P> {
    transport: T,
    simulation: ClientSimulation<P>,
    config: NetcodeConfig,
    phase: ConnectionPhase,
    local_time: Duration,
    phase_elapsed: Duration,
    sync_attempts: u32,
    joined: Option<(PlayerId, NetworkEntityId)>,
    info: Option<SessionInfo>,
    notify: Option<oneshot::Sender<Result<SessionInfo, ConnectionError>>>,
}

impl<T: Transport, P: CharacterPhysics> ClientConnection<T, P> {
    /// Send `Join` and start the handshake.
    pub fn connect(
        mut transport: T,
        config: NetcodeConfig,
        spawn_physics: PhysicsFactory<P>,
    ) -> Result<(Self, ConnectReceiver), ConnectionError> {
        let join = ClientMessage::Join {
            protocol_version: PROTOCOL_VERSION.to_string(),
        };
        transport.send(join.to_bytes()?, join.delivery_class())?;

        let (notify, receiver) = oneshot::channel();
        let connection = Self {
            transport,
            simulation: ClientSimulation::new(config.clone(), spawn_physics),
            config,
            phase: ConnectionPhase::Joining,
            local_time: Duration::ZERO,
            phase_elapsed: Duration::ZERO,
            sync_attempts: 0,
            joined: None,
            info: None,
            notify: Some(notify),
        };
        Ok((connection, receiver))
    }

    /// Handshake stage.
    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    /// Handshake result, once connected.
    pub fn info(&self) -> Option<SessionInfo> {
        self.info
    }

    /// The client simulation.
    pub fn simulation(&self) -> &ClientSimulation<P> {
        &self.simulation
    }

    fn send(&mut self, message: &ClientMessage) -> Result<(), ConnectionError> {
        self.transport.send(message.to_bytes()?, message.delivery_class())?;
        Ok(())
    }

    fn send_clock_sync(&mut self) -> Result<(), ConnectionError> {
        self.sync_attempts += 1;
        self.phase_elapsed = Duration::ZERO;
        let request = ClientMessage::ClockSyncRequest {
            client_time_ns: self.local_time.as_nanos() as u64,
        };
        debug!(attempt = self.sync_attempts, "clock sync request");
        self.send(&request)
    }

    fn fail(&mut self, err: ConnectionError) -> ConnectionError {
        if self.phase != ConnectionPhase::Closed {
            warn!(error = %err, phase = ?self.phase, "connection failed");
        }
        self.phase = ConnectionPhase::Closed;
        if let Some(notify) = self.notify.take() {
            let _ = notify.send(Err(err.clone()));
        }
        err
    }

    /// Advance by one rendered frame.
    ///
    /// Returns the simulated frame once connected, `None` while the
    /// handshake is still running.
    pub fn update(&mut self, elapsed: Duration, sample: &InputSample) -> Result<Option<ClientFrame>, ConnectionError> {
        if self.phase == ConnectionPhase::Closed {
            return Err(ConnectionError::Disconnected);
        }
        self.local_time += elapsed;
        self.phase_elapsed += elapsed;

        // 1. Inbox
        loop {
            let bytes = match self.transport.poll() {
                Ok(Some(bytes)) => bytes,
                Ok(None) => break,
                Err(TransportError::Disconnected) => return Err(self.fail(ConnectionError::Disconnected)),
                Err(err) => return Err(self.fail(err.into())),
            };
            let message = match ServerMessage::from_bytes(&bytes) {
                Ok(message) => message,
                Err(err) => {
                    warn!(error = %err, "undecodable server message");
                    continue;
                }
            };
            if let Err(err) = self.handle_message(message) {
                return Err(self.fail(err));
            }
        }

        // 2. Handshake timers
        match self.phase {
            ConnectionPhase::Joining if self.phase_elapsed >= self.config.join_timeout() => {
                return Err(self.fail(ConnectionError::JoinTimeout));
            }
            ConnectionPhase::ClockSyncing if self.phase_elapsed >= self.config.clock_sync_retry() => {
                if self.sync_attempts >= self.config.clock_sync_attempts {
                    let attempts = self.sync_attempts;
                    return Err(self.fail(ConnectionError::HandshakeTimeout { attempts }));
                }
                if let Err(err) = self.send_clock_sync() {
                    return Err(self.fail(err));
                }
            }
            _ => {}
        }

        if self.phase != ConnectionPhase::Connected {
            return Ok(None);
        }

        // 3. Simulate and send inputs
        let frame = self.simulation.frame(elapsed, sample);
        if !frame.predicted.is_empty() {
            let inputs: Vec<PlayerInput> = self
                .simulation
                .inputs_to_send(self.config.input_redundancy)
                .iter()
                .map(PlayerInput::from)
                .collect();
            if let Err(err) = self.send(&ClientMessage::Input(InputBatch { inputs })) {
                return Err(self.fail(err));
            }
        }
        Ok(Some(frame))
    }

    fn handle_message(&mut self, message: ServerMessage) -> Result<(), ConnectionError> {
        match message {
            ServerMessage::JoinAccepted {
                player_id,
                entity_id,
                tick,
            } => {
                if self.phase != ConnectionPhase::Joining {
                    return Ok(());
                }
                info!(player = %player_id.to_uuid_string(), entity = %entity_id.short(), tick = tick.get(), "joined");
                self.joined = Some((player_id, entity_id));
                self.simulation.set_local_entity(entity_id);
                self.phase = ConnectionPhase::ClockSyncing;
                self.send_clock_sync()?;
            }
            ServerMessage::JoinRejected { reason } => {
                return Err(ConnectionError::JoinRejected(reason));
            }
            ServerMessage::Spawn(spawn) => {
                self.simulation
                    .spawn(spawn.entity_id, spawn.owner, spawn.tick, spawn.state.to_movement());
            }
            ServerMessage::Despawn { entity_id } => {
                self.simulation.despawn(entity_id);
            }
            ServerMessage::State(update) => {
                let entities = update.entities.iter().map(|e| (e.entity_id, e.to_movement()));
                self.simulation.apply_server_state(update.tick, update.ack, entities);
            }
            ServerMessage::ClockSyncResponse {
                client_time_ns,
                server_world_time_ns,
                server_tick,
            } => self.on_clock_sync(client_time_ns, server_world_time_ns, server_tick.get()),
            ServerMessage::Shutdown { reason } => {
                info!(%reason, "server shut down");
                return Err(ConnectionError::Disconnected);
            }
        }
        Ok(())
    }

    fn on_clock_sync(&mut self, client_time_ns: u64, server_world_time_ns: u64, server_tick: u64) {
        let sent = Duration::from_nanos(client_time_ns);
        let Some(round_trip) = self.local_time.checked_sub(sent) else {
            return;
        };
        let one_way = round_trip / 2;

        match self.phase {
            ConnectionPhase::ClockSyncing => {
                self.simulation
                    .hard_sync(Duration::from_nanos(server_world_time_ns), one_way);
                let Some((player_id, entity_id)) = self.joined else {
                    return;
                };
                let info = SessionInfo {
                    player_id,
                    entity_id,
                    round_trip,
                };
                self.info = Some(info);
                self.phase = ConnectionPhase::Connected;
                info!(
                    rtt_ms = round_trip.as_secs_f64() * 1000.0,
                    server_tick,
                    attempts = self.sync_attempts,
                    "clock synced"
                );
                if let Some(notify) = self.notify.take() {
                    let _ = notify.send(Ok(info));
                }
            }
            ConnectionPhase::Connected => {
                // Late answer to an earlier attempt: refresh latency only.
                self.simulation.set_latency(one_way);
            }
            _ => {}
        }
    }

    /// Announce departure. The transport stays open so `Leave` is delivered.
    pub fn leave(&mut self) -> Result<(), ConnectionError> {
        if self.phase == ConnectionPhase::Closed {
            return Ok(());
        }
        self.send(&ClientMessage::Leave)?;
        self.phase = ConnectionPhase::Closed;
        if let Some(notify) = self.notify.take() {
            let _ = notify.send(Err(ConnectionError::Disconnected));
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::physics::{KinematicCharacter, KinematicSettings};
    use crate::network::session::ServerSession;
    use crate::network::transport::{LinkConfig, SimulatedEndpoint, SimulatedNetwork};

    type Client = ClientConnection<SimulatedEndpoint, KinematicCharacter>;

    fn physics() -> PhysicsFactory<KinematicCharacter> {
        Box::new(|p| KinematicCharacter::new(KinematicSettings::default(), p))
    }

    fn frame_time() -> Duration {
        Duration::from_millis(16)
    }

    #[test]
    fn test_handshake_completes() {
        let net = SimulatedNetwork::new(1);
        let config = NetcodeConfig::default();
        let mut server: ServerSession<SimulatedEndpoint, KinematicCharacter> =
            ServerSession::new(config.clone(), 4, physics());
        let (client_end, server_end) = net.connect(LinkConfig {
            latency_ms: 20,
            jitter_ms: 0,
            ..LinkConfig::perfect()
        });
        server.accept(server_end);
        let (mut client, mut receiver): (Client, _) =
            ClientConnection::connect(client_end, config, physics()).unwrap();

        for _ in 0..20 {
            net.advance(frame_time());
            server.update(frame_time());
            client.update(frame_time(), &InputSample::movement(1.0, 0.0)).unwrap();
        }

        assert_eq!(client.phase(), ConnectionPhase::Connected);
        let info = receiver.try_recv().unwrap().unwrap();
        assert!(info.round_trip >= Duration::from_millis(40));
        assert!(client.simulation().clock().is_synced());
        assert_eq!(client.simulation().local_entity(), Some(info.entity_id));
        assert!(client.simulation().prediction_stats().predicted_ticks > 0);
    }

    #[test]
    fn test_join_rejected() {
        let net = SimulatedNetwork::new(2);
        let config = NetcodeConfig::default();
        let mut server: ServerSession<SimulatedEndpoint, KinematicCharacter> =
            ServerSession::new(config.clone(), 0, physics());
        let (client_end, server_end) = net.connect(LinkConfig::perfect());
        server.accept(server_end);
        let (mut client, mut receiver): (Client, _) =
            ClientConnection::connect(client_end, config, physics()).unwrap();

        server.update(Duration::ZERO);
        let err = client.update(frame_time(), &InputSample::default()).unwrap_err();
        assert!(matches!(err, ConnectionError::JoinRejected(_)));
        assert!(matches!(receiver.try_recv().unwrap(), Err(ConnectionError::JoinRejected(_))));
        assert_eq!(client.phase(), ConnectionPhase::Closed);
    }

    #[test]
    fn test_join_timeout() {
        let net = SimulatedNetwork::new(3);
        let config = NetcodeConfig {
            join_timeout_ms: 100,
            ..NetcodeConfig::default()
        };
        let (client_end, _server_end) = net.connect(LinkConfig::perfect());
        let (mut client, _receiver): (Client, _) =
            ClientConnection::connect(client_end, config, physics()).unwrap();

        let mut result = Ok(None);
        for _ in 0..10 {
            result = client.update(Duration::from_millis(20), &InputSample::default());
            if result.is_err() {
                break;
            }
        }
        assert_eq!(result.unwrap_err(), ConnectionError::JoinTimeout);
    }

    #[test]
    fn test_clock_sync_gives_up() {
        let net = SimulatedNetwork::new(4);
        let config = NetcodeConfig {
            clock_sync_attempts: 3,
            clock_sync_retry_ms: 50,
            ..NetcodeConfig::default()
        };
        let mut server: ServerSession<SimulatedEndpoint, KinematicCharacter> =
            ServerSession::new(config.clone(), 4, physics());
        // Every unreliable message is lost; reliable join still gets through.
        let (client_end, server_end) = net.connect(LinkConfig {
            loss: 1.0,
            ..LinkConfig::perfect()
        });
        server.accept(server_end);
        let (mut client, _receiver): (Client, _) =
            ClientConnection::connect(client_end, config, physics()).unwrap();

        let mut outcome = None;
        for _ in 0..20 {
            server.update(Duration::from_millis(25));
            if let Err(err) = client.update(Duration::from_millis(25), &InputSample::default()) {
                outcome = Some(err);
                break;
            }
        }
        assert_eq!(outcome, Some(ConnectionError::HandshakeTimeout { attempts: 3 }));
    }

    #[test]
    fn test_leave_marks_closed() {
        let net = SimulatedNetwork::new(5);
        let (client_end, _server_end) = net.connect(LinkConfig::perfect());
        let (mut client, _receiver): (Client, _) =
            ClientConnection::connect(client_end, NetcodeConfig::default(), physics()).unwrap();
        client.leave().unwrap();
        assert_eq!(client.phase(), ConnectionPhase::Closed);
        assert!(matches!(
            client.update(frame_time(), &InputSample::default()),
            Err(ConnectionError::Disconnected)
        ));
    }
}
