//! Simulation Update Loops
//!
//! One loop per process role, both single-threaded:
//!
//! - [`ServerSimulation`] advances a fixed-rate clock and, for each tick,
//!   steps every entity from its queued input. Its state is authoritative.
//! - [`ClientSimulation`] runs once per rendered frame: apply server state,
//!   resimulate what was acknowledged, advance the steered clock, capture
//!   input, predict the local entity for every due tick, then interpolate
//!   every entity for rendering.
//!
//! Neither loop knows about messages or transports; the `network` layer
//! feeds them decoded state and input.

use std::collections::BTreeSet;
use std::time::Duration;

use glam::Vec3;
use tracing::{debug, trace};

use crate::config::NetcodeConfig;
use crate::core::clock::{ClockUpdate, NetworkServerSimulationClock, SimulationClock};
use crate::core::hash::{compute_state_hash, StateHash};
use crate::core::snapshot_store::SnapshotStore;
use crate::core::tick::SimulationTickNumber;
use crate::game::authority::{AuthoritativeMovement, EnqueueOutcome};
use crate::game::entity::{EntityOwner, EntityRegistry, NetworkEntity, NetworkEntityId};
use crate::game::input::{InputCapture, InputCommandSet, InputSample};
use crate::game::interpolation::{interpolate_local, interpolate_remote, remote_render_time, RenderTransform};
use crate::game::movement::MovementData;
use crate::game::physics::CharacterPhysics;
use crate::game::prediction::{InputAcknowledgement, LocalPlayerPrediction, PredictionStats};

/// Builds a character controller at a spawn position.
pub type PhysicsFactory<P> = Box<dyn Fn(Vec3) -> P>;

/// Spacing between consecutive spawn points.
const SPAWN_SPACING: f32 = 2.0;

/// Spawn point for the `index`th entity.
pub fn spawn_point(index: u32) -> Vec3 {
    Vec3::new(0.0, 0.0, index as f32 * SPAWN_SPACING)
}

/// Write one authoritative state into a history that only accepts
/// non-decreasing ticks. Late states overwrite a stored tick or are dropped.
pub fn record_authoritative(
    history: &mut SnapshotStore<MovementData>,
    tick: SimulationTickNumber,
    data: MovementData,
) -> bool {
    match history.latest() {
        Ok(latest) if latest.tick > tick => match history.find_mut(tick) {
            Some(existing) => {
                existing.data = data;
                true
            }
            None => false,
        },
        Ok(latest) if latest.tick == tick => {
            if let Ok(latest) = history.latest_mut() {
                latest.data = data;
            }
            true
        }
        _ => {
            history.add(tick, data);
            true
        }
    }
}

// =============================================================================
// SERVER
// =============================================================================

/// Authoritative fixed-rate simulation.
pub struct ServerSimulation<P> {
    config: NetcodeConfig,
    clock: SimulationClock,
    registry: EntityRegistry<AuthoritativeMovement<P>>,
    spawn_physics: PhysicsFactory<P>,
    spawned: u32,
}

impl<P: CharacterPhysics> ServerSimulation<P> {
    /// Create an empty simulation at tick zero.
    pub fn new(config: NetcodeConfig, spawn_physics: PhysicsFactory<P>) -> Self {
        Self {
            clock: SimulationClock::new(config.fixed_step(), config.max_steps_per_update),
            registry: EntityRegistry::new(config.snapshot_capacity()),
            config,
            spawn_physics,
            spawned: 0,
        }
    }

    /// Configuration in use.
    pub fn config(&self) -> &NetcodeConfig {
        &self.config
    }

    /// The simulation clock.
    pub fn clock(&self) -> &SimulationClock {
        &self.clock
    }

    /// Last simulated tick.
    pub fn tick(&self) -> SimulationTickNumber {
        self.clock.tick()
    }

    /// All entity state.
    pub fn registry(&self) -> &EntityRegistry<AuthoritativeMovement<P>> {
        &self.registry
    }

    /// Spawn an entity at the next spawn point.
    pub fn spawn(&mut self, owner: EntityOwner) -> NetworkEntityId {
        let id = NetworkEntityId::random();
        let position = spawn_point(self.spawned);
        self.spawned += 1;

        let physics = (self.spawn_physics)(position);
        let grounded = physics.is_grounded();
        let authority = AuthoritativeMovement::new(
            physics,
            self.config.server_input_backlog,
            self.config.movement,
            self.config.fixed_step_secs(),
        );
        let tick = self.clock.tick();
        let record = self.registry.spawn(NetworkEntity::new(id, owner), authority);
        record.movement.add(tick, MovementData::at(position, grounded));

        debug!(entity = %id.short(), ?owner, x = position.x, z = position.z, "spawned");
        id
    }

    /// Remove an entity.
    pub fn despawn(&mut self, id: NetworkEntityId) -> bool {
        self.registry.despawn(id).is_some()
    }

    /// Queue an input for `id`, tagged with the current tick.
    pub fn receive_input(&mut self, id: NetworkEntityId, input: InputCommandSet) -> Option<EnqueueOutcome> {
        let tick = self.clock.tick();
        let authority = self.registry.component_mut(id)?;
        Some(authority.inputs_mut().enqueue(input, tick))
    }

    /// Acknowledgement to send to the owner of `id`.
    pub fn acknowledgement(&self, id: NetworkEntityId) -> Option<InputAcknowledgement> {
        self.registry.component(id).map(|a| a.inputs().acknowledgement())
    }

    /// Advance the clock by frame time. Run the returned ticks with [`run_tick`](Self::run_tick).
    pub fn advance_clock(&mut self, elapsed: Duration) -> ClockUpdate {
        self.clock.update(elapsed)
    }

    /// Step every entity once for `tick`.
    pub fn run_tick(&mut self, tick: SimulationTickNumber) {
        for record in self.registry.iter_mut() {
            record.component.step(tick, &mut record.movement);
        }
        trace!(tick = tick.get(), entities = self.registry.len(), "server tick");
    }

    /// Advance the clock and run every due tick.
    pub fn update(&mut self, elapsed: Duration) -> ClockUpdate {
        let update = self.advance_clock(elapsed);
        for tick in update.ticks() {
            self.run_tick(tick);
        }
        update
    }

    /// Newest state of every entity, in id order.
    pub fn entity_states(&self) -> Vec<(NetworkEntityId, MovementData)> {
        self.registry
            .iter()
            .filter_map(|record| record.movement.latest().ok().map(|s| (record.entity.id, s.data)))
            .collect()
    }

    /// Hash of every entity's newest state.
    pub fn state_hash(&self) -> StateHash {
        hash_entities(self.tick(), &self.entity_states())
    }
}

/// Hash a set of entity states at `tick`.
pub fn hash_entities(tick: SimulationTickNumber, states: &[(NetworkEntityId, MovementData)]) -> StateHash {
    compute_state_hash(tick, |hasher| {
        for (id, data) in states {
            hasher.update_uuid(&id.0);
            data.hash_into(hasher);
        }
    })
}

// =============================================================================
// CLIENT
// =============================================================================

/// Client-side role of an entity.
#[derive(Debug)]
pub enum ClientEntity<P> {
    /// Controlled here and predicted.
    Local(Box<LocalPlayerPrediction<P>>),
    /// Controlled elsewhere and interpolated.
    Remote,
}

/// Output of one client frame.
#[derive(Debug, Clone, Default)]
pub struct ClientFrame {
    /// Ticks simulated this frame.
    pub ticks: Vec<SimulationTickNumber>,
    /// Commands predicted this frame, in tick order.
    pub predicted: Vec<InputCommandSet>,
    /// Render transforms, in id order.
    pub render: Vec<(NetworkEntityId, RenderTransform)>,
}

/// Client simulation: prediction for the local entity, interpolation for the rest.
pub struct ClientSimulation<P> {
    config: NetcodeConfig,
    clock: SimulationClock,
    server_clock: NetworkServerSimulationClock,
    capture: InputCapture,
    registry: EntityRegistry<ClientEntity<P>>,
    local: Option<NetworkEntityId>,
    resimulate: BTreeSet<NetworkEntityId>,
    spawn_physics: PhysicsFactory<P>,
}

impl<P: CharacterPhysics> ClientSimulation<P> {
    /// Create a client with nothing spawned and an unsynced clock.
    pub fn new(config: NetcodeConfig, spawn_physics: PhysicsFactory<P>) -> Self {
        let step = config.fixed_step();
        Self {
            clock: SimulationClock::new(step, config.max_steps_per_update),
            server_clock: NetworkServerSimulationClock::new(step),
            capture: InputCapture::new(config.snapshot_capacity()),
            registry: EntityRegistry::new(config.snapshot_capacity()),
            local: None,
            resimulate: BTreeSet::new(),
            spawn_physics,
            config,
        }
    }

    /// Local simulation clock.
    pub fn clock(&self) -> &SimulationClock {
        &self.clock
    }

    /// Estimate of the server clock.
    pub fn server_clock(&self) -> &NetworkServerSimulationClock {
        &self.server_clock
    }

    /// All entity state.
    pub fn registry(&self) -> &EntityRegistry<ClientEntity<P>> {
        &self.registry
    }

    /// Entity controlled by this client.
    pub fn local_entity(&self) -> Option<NetworkEntityId> {
        self.local
    }

    /// Predictor of the local entity.
    pub fn local_prediction(&self) -> Option<&LocalPlayerPrediction<P>> {
        match self.registry.component(self.local?)? {
            ClientEntity::Local(prediction) => Some(&**prediction),
            ClientEntity::Remote => None,
        }
    }

    /// Prediction counters of the local entity.
    pub fn prediction_stats(&self) -> PredictionStats {
        self.local_prediction().map(|p| p.stats()).unwrap_or_default()
    }

    /// Declare which entity this client controls.
    pub fn set_local_entity(&mut self, id: NetworkEntityId) {
        self.local = Some(id);
        let known = self.registry.get(id).and_then(|record| {
            let latest = record.movement.latest().ok()?;
            Some((record.entity.owner, latest.tick, latest.data))
        });
        if let Some((owner, tick, data)) = known {
            self.spawn(id, owner, tick, data);
        }
    }

    /// Snap the clock onto the server's time. Used once per connection.
    pub fn hard_sync(&mut self, server_world_time: Duration, one_way_latency: Duration) {
        self.clock.hard_set(server_world_time + one_way_latency);
        self.server_clock.set_latency(one_way_latency);
        let last = self.capture.last_sequence();
        self.capture.reset(last);
    }

    /// Refresh the latency used for steering.
    pub fn set_latency(&mut self, one_way_latency: Duration) {
        self.server_clock.set_latency(one_way_latency);
    }

    /// Register an entity announced by the server.
    pub fn spawn(&mut self, id: NetworkEntityId, owner: EntityOwner, tick: SimulationTickNumber, data: MovementData) {
        let component = if self.local == Some(id) {
            let mut physics = (self.spawn_physics)(data.position);
            physics.set_velocity(data.physics_velocity);
            let predicted = self.registry.acquire_store();
            ClientEntity::Local(Box::new(LocalPlayerPrediction::new(
                physics,
                predicted,
                self.config.client_pending_input_capacity,
                self.config.movement,
                self.config.fixed_step_secs(),
            )))
        } else {
            ClientEntity::Remote
        };

        let replaced = self
            .registry
            .component_mut(id)
            .map(|existing| std::mem::replace(existing, ClientEntity::Remote));
        if let Some(ClientEntity::Local(old)) = replaced {
            let (_, store) = (*old).into_parts();
            self.registry.release_store(store);
        }
        let record = self.registry.spawn(NetworkEntity::new(id, owner), component);
        record_authoritative(&mut record.movement, tick, data);
    }

    /// Remove an entity. Unknown ids are ignored.
    pub fn despawn(&mut self, id: NetworkEntityId) {
        if let Some((_, ClientEntity::Local(prediction))) = self.registry.despawn(id) {
            let (_, store) = (*prediction).into_parts();
            self.registry.release_store(store);
        }
        self.resimulate.remove(&id);
    }

    /// Apply one authoritative state message.
    ///
    /// Updates for unknown entities are ignored. A new input acknowledgement
    /// marks the local entity for resimulation, which runs at the start of
    /// the following [`frame`](Self::frame) call of the same update.
    pub fn apply_server_state(
        &mut self,
        tick: SimulationTickNumber,
        ack: InputAcknowledgement,
        updates: impl IntoIterator<Item = (NetworkEntityId, MovementData)>,
    ) {
        self.server_clock.on_server_tick(tick);

        for (id, data) in updates {
            let Some(record) = self.registry.get_mut(id) else {
                continue;
            };
            if record_authoritative(&mut record.movement, tick, data) {
                record.entity.acknowledge_server_tick(tick);
            }
        }

        let Some(local) = self.local else {
            return;
        };
        let Some(record) = self.registry.get_mut(local) else {
            return;
        };
        if let ClientEntity::Local(prediction) = &mut record.component {
            if prediction.acknowledge(ack) {
                prediction.detect_misprediction(&record.movement);
                self.resimulate.insert(local);
            }
        }
    }

    /// Run every entity that needs it through one resimulation.
    fn run_resimulations(&mut self) {
        let due = std::mem::take(&mut self.resimulate);
        for id in due {
            let Some(record) = self.registry.get_mut(id) else {
                continue;
            };
            if let ClientEntity::Local(prediction) = &mut record.component {
                prediction.resimulate(&record.movement);
            }
        }
    }

    /// One rendered frame.
    pub fn frame(&mut self, elapsed: Duration, sample: &InputSample) -> ClientFrame {
        let mut frame = ClientFrame::default();

        // 1. Reconcile
        self.run_resimulations();

        // 2. Clock
        self.server_clock.advance(elapsed);
        let update = self.clock.update_steered(
            elapsed,
            self.server_clock.estimated_world_time(),
            self.config.clock_steering(),
        );

        // 3. Input for the upcoming tick
        self.capture.sample(self.clock.tick(), update.is_next_simulation(), sample);

        // 4. Predict
        for tick in update.ticks() {
            frame.ticks.push(tick);
            let Some(local) = self.local else {
                continue;
            };
            let command = self.capture.command_for_tick(tick);
            let Some(record) = self.registry.get_mut(local) else {
                continue;
            };
            if let ClientEntity::Local(prediction) = &mut record.component {
                prediction.predict_tick(&command, &record.movement);
                frame.predicted.push(command);
            }
        }

        // 5. Render
        frame.render = self.render_transforms();
        frame
    }

    /// Interpolated transform of every entity at the current clock time.
    pub fn render_transforms(&self) -> Vec<(NetworkEntityId, RenderTransform)> {
        let step = self.clock.fixed_step();
        let remote_time = remote_render_time(self.clock.world_time(), self.config.remote_render_delay(), step);
        let tick_ratio = self.clock.tick_ratio();

        self.registry
            .iter()
            .filter_map(|record| {
                let transform = match &record.component {
                    ClientEntity::Local(prediction) => interpolate_local(prediction.predicted(), tick_ratio)
                        .or_else(|| record.movement.latest().ok().map(|s| RenderTransform::from(&s.data))),
                    ClientEntity::Remote => interpolate_remote(&record.movement, remote_time, step),
                };
                transform.map(|t| (record.entity.id, t))
            })
            .collect()
    }

    /// Newest `count` pending inputs of the local entity, oldest first.
    pub fn inputs_to_send(&self, count: usize) -> Vec<InputCommandSet> {
        self.local_prediction()
            .map(|p| p.pending().newest(count).copied().collect())
            .unwrap_or_default()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::entity::PlayerId;
    use crate::game::physics::{KinematicCharacter, KinematicSettings};

    fn kinematic() -> PhysicsFactory<KinematicCharacter> {
        Box::new(|position| KinematicCharacter::new(KinematicSettings::default(), position))
    }

    fn config() -> NetcodeConfig {
        NetcodeConfig::default()
    }

    #[test]
    fn test_record_authoritative_ordering() {
        let mut history = SnapshotStore::new(8);
        let t = SimulationTickNumber::new;
        assert!(record_authoritative(&mut history, t(2), MovementData::at(Vec3::X, true)));
        assert!(record_authoritative(&mut history, t(4), MovementData::at(Vec3::Y, true)));
        // Duplicate: last value wins.
        assert!(record_authoritative(&mut history, t(4), MovementData::at(Vec3::Z, true)));
        // Late but stored tick: overwritten.
        assert!(record_authoritative(&mut history, t(2), MovementData::at(Vec3::ONE, true)));
        // Late and never stored: dropped.
        assert!(!record_authoritative(&mut history, t(3), MovementData::default()));

        assert_eq!(history.len(), 2);
        assert_eq!(history.find(t(4)).unwrap().data.position, Vec3::Z);
        assert_eq!(history.find(t(2)).unwrap().data.position, Vec3::ONE);
    }

    #[test]
    fn test_server_steps_queued_input() {
        let mut server = ServerSimulation::new(config(), kinematic());
        let player = PlayerId::new([1; 16]);
        let id = server.spawn(EntityOwner::Player(player));

        let input = InputCommandSet {
            sequence: crate::core::tick::PlayerInputSequenceNumber::new(1),
            move_input: glam::Vec2::new(1.0, 0.0),
            ..InputCommandSet::default()
        };
        assert_eq!(server.receive_input(id, input), Some(EnqueueOutcome::Queued));

        let update = server.update(config().fixed_step());
        assert_eq!(update.steps, 1);
        let (_, state) = server.entity_states()[0];
        assert!((state.position.x - 0.15 * 8.5 / 30.0).abs() < 1e-5);
        assert_eq!(server.acknowledgement(id).unwrap().last_applied.get(), 1);
    }

    #[test]
    fn test_server_hash_deterministic() {
        let run = || {
            let mut server = ServerSimulation::new(config(), kinematic());
            let id = server.spawn(EntityOwner::Server);
            for seq in 1..=10u32 {
                server.receive_input(
                    id,
                    InputCommandSet {
                        sequence: crate::core::tick::PlayerInputSequenceNumber::new(seq),
                        move_input: glam::Vec2::new((seq as f32).sin(), (seq as f32).cos()),
                        jump_pressed: seq == 4,
                        ..InputCommandSet::default()
                    },
                );
                server.update(config().fixed_step());
            }
            // Ids are random; hash positions only.
            let states: Vec<_> = server
                .entity_states()
                .into_iter()
                .map(|(_, data)| (NetworkEntityId::new([0; 16]), data))
                .collect();
            hash_entities(server.tick(), &states)
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_client_predicts_local_and_ignores_unknown() {
        let mut client = ClientSimulation::new(config(), kinematic());
        let id = NetworkEntityId::new([1; 16]);
        let player = PlayerId::new([2; 16]);
        client.set_local_entity(id);
        client.spawn(id, EntityOwner::Player(player), SimulationTickNumber::ZERO, MovementData::at(Vec3::ZERO, true));
        client.hard_sync(Duration::ZERO, Duration::ZERO);

        // Update for an entity we never heard of is ignored.
        client.apply_server_state(
            SimulationTickNumber::new(1),
            InputAcknowledgement::default(),
            vec![(NetworkEntityId::new([9; 16]), MovementData::default())],
        );

        let step = config().fixed_step();
        let mut predicted = 0;
        for _ in 0..3 {
            let frame = client.frame(step, &InputSample::movement(1.0, 0.0));
            predicted += frame.predicted.len();
            assert_eq!(frame.render.len(), 1);
        }
        assert_eq!(predicted, 3);
        assert_eq!(client.inputs_to_send(2).len(), 2);
        assert_eq!(client.prediction_stats().predicted_ticks, 3);
    }

    #[test]
    fn test_client_resimulates_once_per_frame() {
        let mut client = ClientSimulation::new(config(), kinematic());
        let id = NetworkEntityId::new([1; 16]);
        client.set_local_entity(id);
        client.spawn(id, EntityOwner::Server, SimulationTickNumber::ZERO, MovementData::at(Vec3::ZERO, true));
        client.hard_sync(Duration::ZERO, Duration::ZERO);

        let step = config().fixed_step();
        for _ in 0..3 {
            client.frame(step, &InputSample::movement(1.0, 0.0));
        }

        let seq = crate::core::tick::PlayerInputSequenceNumber::new;
        for (tick, applied) in [(1u64, 1u32), (2, 2)] {
            client.apply_server_state(
                SimulationTickNumber::new(tick),
                InputAcknowledgement {
                    last_received: seq(3),
                    last_applied: seq(applied),
                },
                vec![(id, MovementData { input_sequence: seq(applied), ..MovementData::at(Vec3::ZERO, true) })],
            );
        }
        assert_eq!(client.prediction_stats().resimulations, 0);
        client.frame(Duration::ZERO, &InputSample::default());

        let stats = client.prediction_stats();
        assert_eq!(stats.resimulations, 1, "two acks in one frame, one replay");
        assert_eq!(client.local_prediction().unwrap().pending().len(), 1);
    }

    #[test]
    fn test_remote_render_blends_across_lost_tick() {
        let config = NetcodeConfig {
            tick_rate: 10,
            ..NetcodeConfig::default()
        };
        let mut client = ClientSimulation::new(config, kinematic());
        let remote = NetworkEntityId::new([3; 16]);
        let at_x = |x: f32| MovementData::at(Vec3::new(x, 0.0, 0.0), true);
        client.spawn(remote, EntityOwner::Server, SimulationTickNumber::new(20), at_x(20.0));
        for tick in (21..=28u64).filter(|&tick| tick != 26) {
            client.apply_server_state(
                SimulationTickNumber::new(tick),
                InputAcknowledgement::default(),
                vec![(remote, at_x(tick as f32))],
            );
        }

        // 2.75 s minus 100 ms delay minus one tick renders tick 25.5, with
        // tick 26 missing: a quarter of the way from 25 to 27.
        client.hard_sync(Duration::from_millis(2_750), Duration::ZERO);
        let render = client.render_transforms();
        assert_eq!(render.len(), 1);
        assert_eq!(render[0].0, remote);
        assert!((render[0].1.position.x - 25.5).abs() < 1e-4, "x = {}", render[0].1.position.x);
    }

    #[test]
    fn test_despawn_returns_stores() {
        let mut client = ClientSimulation::new(config(), kinematic());
        let id = NetworkEntityId::new([1; 16]);
        client.set_local_entity(id);
        client.spawn(id, EntityOwner::Server, SimulationTickNumber::ZERO, MovementData::default());
        client.despawn(id);
        assert_eq!(client.registry().pooled_stores(), 2);
        client.despawn(id);
    }
}
