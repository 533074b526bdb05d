//! Local Match Driver
//!
//! Runs one authoritative [`ServerSession`] and a set of scripted
//! [`ClientConnection`]s over a [`SimulatedNetwork`] on a fixed frame
//! cadence. Everything lives on the current task; the frame loop is paced by
//! a tokio interval, while every component is advanced by the nominal frame
//! time so a run is reproducible for a given seed.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::config::{ConfigError, NetcodeConfig};
use crate::core::hash::{compute_state_hash, StateHash};
use crate::core::tick::SimulationTickNumber;
use crate::game::entity::PlayerId;
use crate::game::input::InputSample;
use crate::game::physics::{KinematicCharacter, KinematicSettings};
use crate::game::prediction::PredictionStats;
use crate::game::tick::PhysicsFactory;
use crate::network::client::{ClientConnection, ConnectReceiver, ConnectionError};
use crate::network::session::ServerSession;
use crate::network::transport::{LinkConfig, SimulatedEndpoint, SimulatedNetwork};

/// Local match configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    /// Shared netcode tunables.
    pub netcode: NetcodeConfig,
    /// Behaviour of every client link.
    pub link: LinkConfig,
    /// Character controller parameters.
    pub physics: KinematicSettings,
    /// Number of scripted clients.
    pub clients: usize,
    /// Render frame interval (ms).
    pub frame_ms: u64,
    /// Match length (ms).
    pub duration_ms: u64,
    /// Seed for the simulated network.
    pub seed: u64,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            netcode: NetcodeConfig::default(),
            link: LinkConfig::default(),
            physics: KinematicSettings::default(),
            clients: 2,
            frame_ms: 16,
            duration_ms: 10_000,
            seed: 0x5EED,
        }
    }
}

impl MatchConfig {
    /// Check ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.netcode.validate()?;
        if self.frame_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "frame_ms",
                reason: "must be positive".into(),
            });
        }
        if self.clients == 0 {
            return Err(ConfigError::Invalid {
                field: "clients",
                reason: "at least one client is required".into(),
            });
        }
        Ok(())
    }

    /// Frame interval.
    pub fn frame(&self) -> Duration {
        Duration::from_millis(self.frame_ms)
    }
}

/// Match driver errors.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Configuration rejected.
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// A client failed to connect or was dropped.
    #[error("Client {index} failed: {source}")]
    Client {
        /// Client index.
        index: usize,
        /// Cause.
        source: ConnectionError,
    },
}

/// Outcome for one client.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientReport {
    /// Assigned player id, if the client joined.
    pub player_id: Option<PlayerId>,
    /// Prediction counters.
    pub stats: PredictionStats,
    /// Distance between the client's newest prediction and the server's
    /// newest state at the end of the match.
    pub final_position_error: Option<f32>,
}

/// Outcome of a match.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchReport {
    /// Last server tick.
    pub server_tick: SimulationTickNumber,
    /// Frames run.
    pub frames: u64,
    /// One entry per client, in connection order.
    pub clients: Vec<ClientReport>,
    /// Hash of every client-controlled entity's final state, in connection order.
    pub state_hash: StateHash,
}

/// Scripted input for client `index` on frame `frame`: walk in a slow circle
/// and jump now and then.
pub fn scripted_input(index: usize, frame: u64) -> InputSample {
    let phase = frame as f32 * 0.02 + index as f32 * 1.7;
    let sample = InputSample::movement(phase.cos(), phase.sin());
    if (frame + index as u64 * 11) % 90 == 0 {
        sample.with_jump()
    } else {
        sample
    }
}

type LocalClient = ClientConnection<SimulatedEndpoint, KinematicCharacter>;

fn kinematic(settings: KinematicSettings) -> PhysicsFactory<KinematicCharacter> {
    Box::new(move |position| KinematicCharacter::new(settings, position))
}

/// Run a full match on the current task.
#[instrument(skip(config), fields(clients = config.clients, seed = config.seed))]
pub async fn run_local_match(config: MatchConfig) -> Result<MatchReport, ServerError> {
    config.validate()?;
    let frame = config.frame();
    let network = SimulatedNetwork::new(config.seed);
    let mut session: ServerSession<SimulatedEndpoint, KinematicCharacter> =
        ServerSession::new(config.netcode.clone(), config.clients, kinematic(config.physics));

    let mut clients: Vec<(LocalClient, Option<ConnectReceiver>)> = Vec::with_capacity(config.clients);
    for index in 0..config.clients {
        let (client_end, server_end) = network.connect(config.link);
        session.accept(server_end);
        let (client, receiver) = ClientConnection::connect(client_end, config.netcode.clone(), kinematic(config.physics))
            .map_err(|source| ServerError::Client { index, source })?;
        clients.push((client, Some(receiver)));
    }

    let frames = config.duration_ms / config.frame_ms;
    let mut ticker = interval(frame);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(frames, frame_ms = config.frame_ms, "match started");
    for frame_index in 0..frames {
        ticker.tick().await;

        network.advance(frame);
        session.update(frame);

        for (index, (client, receiver)) in clients.iter_mut().enumerate() {
            client
                .update(frame, &scripted_input(index, frame_index))
                .map_err(|source| ServerError::Client { index, source })?;

            if let Some(rx) = receiver {
                match rx.try_recv() {
                    Ok(Ok(joined)) => {
                        info!(
                            index,
                            player = %joined.player_id.to_uuid_string(),
                            rtt_ms = joined.round_trip.as_millis() as u64,
                            "client connected"
                        );
                        *receiver = None;
                    }
                    Ok(Err(source)) => return Err(ServerError::Client { index, source }),
                    Err(_) => {}
                }
            }
        }

        if frame_index % 120 == 0 {
            debug!(
                frame = frame_index,
                tick = session.simulation().tick().get(),
                in_flight = network.in_flight(),
                "match progress"
            );
        }
    }

    let report = build_report(&session, &clients, frames);

    // Let departures reach the server before shutting down.
    for (index, (client, _)) in clients.iter_mut().enumerate() {
        if let Err(err) = client.leave() {
            warn!(index, error = %err, "leave failed");
        }
    }
    network.advance(Duration::from_millis(config.link.latency_ms + config.link.jitter_ms + 1));
    let departures = session.update(Duration::ZERO);
    session.shutdown("match over");

    info!(
        tick = report.server_tick.get(),
        departed = departures.departed.len(),
        hash = %hex::encode(&report.state_hash[..8]),
        "match finished"
    );
    Ok(report)
}

fn build_report(
    session: &ServerSession<SimulatedEndpoint, KinematicCharacter>,
    clients: &[(LocalClient, Option<ConnectReceiver>)],
    frames: u64,
) -> MatchReport {
    let server = session.simulation();
    let authoritative: Vec<_> = clients
        .iter()
        .map(|(client, _)| {
            let entity = client.info().map(|info| info.entity_id)?;
            server.registry().movement(entity)?.latest().ok().map(|s| s.data)
        })
        .collect();

    let reports = clients
        .iter()
        .zip(&authoritative)
        .map(|((client, _), confirmed)| {
            let simulation = client.simulation();
            let predicted = simulation
                .local_prediction()
                .and_then(|p| p.predicted().latest().ok().map(|s| s.data.position));
            ClientReport {
                player_id: client.info().map(|info| info.player_id),
                stats: simulation.prediction_stats(),
                final_position_error: match (predicted, confirmed) {
                    (Some(predicted), Some(confirmed)) => Some(predicted.distance(confirmed.position)),
                    _ => None,
                },
            }
        })
        .collect();

    let state_hash = compute_state_hash(server.tick(), |hasher| {
        for data in authoritative.iter().flatten() {
            data.hash_into(hasher);
        }
    });

    MatchReport {
        server_tick: server.tick(),
        frames,
        clients: reports,
        state_hash,
    }
}

/// True if every client finished the handshake.
pub fn all_connected(clients: &[ClientReport]) -> bool {
    clients.iter().all(|c| c.player_id.is_some())
}

// =============================================================================
// TESTS
// =============================================================================
