//! Transport Abstraction and In-Process Simulated Link
//!
//! The simulation core only needs to send a payload with a
//! [`DeliveryClass`] and poll for received payloads without blocking.
//! [`SimulatedNetwork`] provides connected endpoint pairs with configurable
//! latency, jitter, loss and duplication so the full prediction pipeline can
//! be exercised deterministically in one process:
//!
//! ```text
//!  ClientEndpoint ──send──▶ [ in flight: deliver_at, order ] ──poll──▶ ServerEndpoint
//!                 ◀──poll── [ in flight: deliver_at, order ] ◀──send──
//! ```
//!
//! Only unreliable classes are ever lost or duplicated. Reliable-ordered
//! messages never overtake each other. Sequenced classes discard anything
//! older than the newest delivered message of the same class.
//!
//! Everything is single-threaded (`Rc<RefCell<_>>`); time only moves when
//! [`SimulatedNetwork::advance`] is called.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

use crate::network::protocol::DeliveryClass;

/// Transport failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The connection is closed.
    #[error("Connection closed")]
    Disconnected,

    /// The payload cannot be sent.
    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        /// Payload size.
        size: usize,
        /// Allowed size.
        max: usize,
    },
}

/// Non-blocking message transport for one connection.
pub trait Transport {
    /// Queue a payload for delivery.
    fn send(&mut self, payload: Vec<u8>, class: DeliveryClass) -> Result<(), TransportError>;

    /// Next received payload, if any has arrived. Fails once the
    /// connection is closed and nothing sent before closing remains.
    fn poll(&mut self) -> Result<Option<Vec<u8>>, TransportError>;

    /// True until either side closes.
    fn is_connected(&self) -> bool;

    /// Close the connection. Payloads this side already sent still arrive.
    fn close(&mut self);
}

// =============================================================================
// LINK CONFIG
// =============================================================================

/// Behaviour of a simulated link, applied in both directions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// One-way base latency (ms).
    pub latency_ms: u64,
    /// Extra random latency, uniform in `0..=jitter_ms`.
    pub jitter_ms: u64,
    /// Probability an unreliable message is lost.
    pub loss: f64,
    /// Probability an unreliable message is delivered twice.
    pub duplicate: f64,
    /// Largest payload accepted.
    pub max_payload: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            latency_ms: 40,
            jitter_ms: 10,
            loss: 0.02,
            duplicate: 0.01,
            max_payload: 64 * 1024,
        }
    }
}

impl LinkConfig {
    /// Zero-latency lossless link.
    pub fn perfect() -> Self {
        Self {
            latency_ms: 0,
            jitter_ms: 0,
            loss: 0.0,
            duplicate: 0.0,
            ..Self::default()
        }
    }
}

// =============================================================================
// SIMULATED NETWORK
// =============================================================================

#[derive(Debug)]
struct InFlight {
    deliver_at: Duration,
    order: u64,
    class: DeliveryClass,
    payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct Direction {
    in_flight: Vec<InFlight>,
    last_ordered_at: Duration,
    newest_sequenced: HashMap<DeliveryClass, u64>,
}

#[derive(Debug)]
struct Link {
    config: LinkConfig,
    connected: bool,
    /// Index 0 carries client -> server, 1 carries server -> client.
    directions: [Direction; 2],
}

#[derive(Debug)]
struct NetworkState {
    now: Duration,
    next_order: u64,
    rng: StdRng,
    links: Vec<Link>,
}

/// Shared clock and RNG for a set of simulated links.
#[derive(Debug, Clone)]
pub struct SimulatedNetwork {
    state: Rc<RefCell<NetworkState>>,
}

impl SimulatedNetwork {
    /// Create a network whose RNG is seeded with `seed`.
    pub fn new(seed: u64) -> Self {
        Self {
            state: Rc::new(RefCell::new(NetworkState {
                now: Duration::ZERO,
                next_order: 0,
                rng: StdRng::seed_from_u64(seed),
                links: Vec::new(),
            })),
        }
    }

    /// Current network time.
    pub fn now(&self) -> Duration {
        self.state.borrow().now
    }

    /// Let time pass; messages due by then become receivable.
    pub fn advance(&self, elapsed: Duration) {
        self.state.borrow_mut().now += elapsed;
    }

    /// Messages currently in flight across all links.
    pub fn in_flight(&self) -> usize {
        self.state
            .borrow()
            .links
            .iter()
            .flat_map(|link| link.directions.iter())
            .map(|direction| direction.in_flight.len())
            .sum()
    }

    /// Create a connected client/server endpoint pair.
    pub fn connect(&self, config: LinkConfig) -> (SimulatedEndpoint, SimulatedEndpoint) {
        let mut state = self.state.borrow_mut();
        let link = state.links.len();
        state.links.push(Link {
            config,
            connected: true,
            directions: [Direction::default(), Direction::default()],
        });
        drop(state);

        let client = SimulatedEndpoint {
            network: self.state.clone(),
            link,
            outgoing: 0,
        };
        let server = SimulatedEndpoint {
            network: self.state.clone(),
            link,
            outgoing: 1,
        };
        (client, server)
    }
}

/// One side of a simulated link.
#[derive(Debug)]
pub struct SimulatedEndpoint {
    network: Rc<RefCell<NetworkState>>,
    link: usize,
    outgoing: usize,
}

impl SimulatedEndpoint {
    fn incoming(&self) -> usize {
        1 - self.outgoing
    }
}

impl Transport for SimulatedEndpoint {
    fn send(&mut self, mut payload: Vec<u8>, class: DeliveryClass) -> Result<(), TransportError> {
        let mut guard = self.network.borrow_mut();
        let state = &mut *guard;
        let link = &mut state.links[self.link];
        if !link.connected {
            return Err(TransportError::Disconnected);
        }
        let config = link.config;
        if payload.len() > config.max_payload {
            return Err(TransportError::PayloadTooLarge {
                size: payload.len(),
                max: config.max_payload,
            });
        }

        let copies = if class.is_reliable() {
            1
        } else if state.rng.gen_bool(config.loss.clamp(0.0, 1.0)) {
            trace!(?class, "simulated loss");
            0
        } else if state.rng.gen_bool(config.duplicate.clamp(0.0, 1.0)) {
            2
        } else {
            1
        };

        let direction = &mut link.directions[self.outgoing];
        for copy in 0..copies {
            let jitter = if config.jitter_ms > 0 {
                state.rng.gen_range(0..=config.jitter_ms)
            } else {
                0
            };
            let mut deliver_at = state.now + Duration::from_millis(config.latency_ms + jitter);
            if class == DeliveryClass::ReliableOrdered {
                deliver_at = deliver_at.max(direction.last_ordered_at);
                direction.last_ordered_at = deliver_at;
            }
            let order = state.next_order;
            state.next_order += 1;
            let bytes = if copy + 1 < copies {
                payload.clone()
            } else {
                std::mem::take(&mut payload)
            };
            direction.in_flight.push(InFlight {
                deliver_at,
                order,
                class,
                payload: bytes,
            });
        }
        Ok(())
    }

    fn poll(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let mut guard = self.network.borrow_mut();
        let state = &mut *guard;
        let now = state.now;
        let link = &mut state.links[self.link];
        let connected = link.connected;
        let direction = &mut link.directions[self.incoming()];
        if !connected && direction.in_flight.is_empty() {
            return Err(TransportError::Disconnected);
        }

        loop {
            let next = direction
                .in_flight
                .iter()
                .enumerate()
                .filter(|(_, m)| m.deliver_at <= now)
                .min_by_key(|(_, m)| (m.deliver_at, m.order))
                .map(|(i, _)| i);
            let Some(index) = next else {
                return Ok(None);
            };
            let message = direction.in_flight.swap_remove(index);

            if message.class.is_sequenced() {
                let newest = direction.newest_sequenced.entry(message.class).or_insert(0);
                if message.order < *newest {
                    trace!(class = ?message.class, "stale sequenced message discarded");
                    continue;
                }
                *newest = message.order;
            }
            return Ok(Some(message.payload));
        }
    }

    fn is_connected(&self) -> bool {
        self.network.borrow().links[self.link].connected
    }

    fn close(&mut self) {
        let incoming = self.incoming();
        let mut state = self.network.borrow_mut();
        let link = &mut state.links[self.link];
        link.connected = false;
        // Anything already sent by this side still arrives.
        link.directions[incoming].in_flight.clear();
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(endpoint: &mut SimulatedEndpoint) -> Vec<u8> {
        let mut received = Vec::new();
        while let Some(payload) = endpoint.poll().unwrap() {
            received.push(payload[0]);
        }
        received
    }

    #[test]
    fn test_latency_holds_messages() {
        let network = SimulatedNetwork::new(1);
        let (mut client, mut server) = network.connect(LinkConfig {
            latency_ms: 50,
            jitter_ms: 0,
            ..LinkConfig::perfect()
        });

        client.send(vec![1], DeliveryClass::Unreliable).unwrap();
        network.advance(Duration::from_millis(49));
        assert_eq!(server.poll().unwrap(), None);
        network.advance(Duration::from_millis(1));
        assert_eq!(server.poll().unwrap(), Some(vec![1]));
        assert_eq!(network.in_flight(), 0);
    }

    #[test]
    fn test_reliable_ordered_survives_loss_and_jitter() {
        let network = SimulatedNetwork::new(7);
        let (mut client, mut server) = network.connect(LinkConfig {
            latency_ms: 20,
            jitter_ms: 30,
            loss: 1.0,
            ..LinkConfig::default()
        });

        for i in 0..20u8 {
            client.send(vec![i], DeliveryClass::ReliableOrdered).unwrap();
        }
        network.advance(Duration::from_secs(1));
        assert_eq!(drain(&mut server), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_unreliable_total_loss() {
        let network = SimulatedNetwork::new(7);
        let (mut client, mut server) = network.connect(LinkConfig {
            loss: 1.0,
            ..LinkConfig::perfect()
        });
        client.send(vec![1], DeliveryClass::Unreliable).unwrap();
        assert_eq!(server.poll().unwrap(), None);
    }

    #[test]
    fn test_duplicates_only_unreliable() {
        let network = SimulatedNetwork::new(3);
        let (mut client, mut server) = network.connect(LinkConfig {
            duplicate: 1.0,
            ..LinkConfig::perfect()
        });
        client.send(vec![1], DeliveryClass::Unreliable).unwrap();
        client.send(vec![2], DeliveryClass::ReliableUnordered).unwrap();
        assert_eq!(drain(&mut server), vec![1, 1, 2]);
    }

    #[test]
    fn test_sequenced_discards_older() {
        let network = SimulatedNetwork::new(11);
        let (mut client, mut server) = network.connect(LinkConfig::perfect());

        client.send(vec![1], DeliveryClass::UnreliableSequenced).unwrap();
        client.send(vec![2], DeliveryClass::UnreliableSequenced).unwrap();
        // Deliver 2 first by polling after reordering in flight.
        {
            let mut state = network.state.borrow_mut();
            let direction = &mut state.links[0].directions[0];
            direction.in_flight[0].deliver_at = Duration::from_millis(5);
        }
        assert_eq!(server.poll().unwrap(), Some(vec![2]));
        network.advance(Duration::from_millis(5));
        assert_eq!(server.poll().unwrap(), None);
    }

    #[test]
    fn test_both_directions() {
        let network = SimulatedNetwork::new(5);
        let (mut client, mut server) = network.connect(LinkConfig::perfect());
        server.send(vec![9], DeliveryClass::ReliableOrdered).unwrap();
        client.send(vec![8], DeliveryClass::ReliableOrdered).unwrap();
        assert_eq!(client.poll().unwrap(), Some(vec![9]));
        assert_eq!(server.poll().unwrap(), Some(vec![8]));
    }

    #[test]
    fn test_close_disconnects_both_ends() {
        let network = SimulatedNetwork::new(5);
        let (mut client, mut server) = network.connect(LinkConfig::perfect());
        client.send(vec![1], DeliveryClass::ReliableOrdered).unwrap();
        server.close();

        assert!(!client.is_connected());
        assert_eq!(client.send(vec![2], DeliveryClass::Unreliable), Err(TransportError::Disconnected));
        assert_eq!(server.poll(), Err(TransportError::Disconnected));
    }

    #[test]
    fn test_close_flushes_sent_messages() {
        let network = SimulatedNetwork::new(5);
        let (mut client, mut server) = network.connect(LinkConfig {
            latency_ms: 10,
            ..LinkConfig::perfect()
        });
        server.send(vec![7], DeliveryClass::ReliableOrdered).unwrap();
        server.close();

        assert_eq!(client.poll(), Ok(None));
        network.advance(Duration::from_millis(10));
        assert_eq!(client.poll(), Ok(Some(vec![7])));
        assert_eq!(client.poll(), Err(TransportError::Disconnected));
    }

    #[test]
    fn test_payload_limit() {
        let network = SimulatedNetwork::new(5);
        let (mut client, _server) = network.connect(LinkConfig {
            max_payload: 4,
            ..LinkConfig::perfect()
        });
        assert!(matches!(
            client.send(vec![0; 5], DeliveryClass::Unreliable),
            Err(TransportError::PayloadTooLarge { size: 5, max: 4 })
        ));
    }
}
