//! State Hashing for Determinism Checks
//!
//! Prediction and resimulation are only sound if replaying the same inputs
//! from the same base state produces bit-identical results. This module
//! hashes simulation state so two runs can be compared cheaply:
//! - Client vs server agreement on a confirmed tick
//! - Replay of a recorded input script
//! - Regression checks in tests
//!
//! Floats are hashed by bit pattern, so `-0.0` and `0.0` hash differently.

use glam::Vec3;
use sha2::{Digest, Sha256};

use crate::core::tick::SimulationTickNumber;

/// Hash output type (256 bits / 32 bytes)
pub type StateHash = [u8; 32];

/// Deterministic hasher for simulation state.
///
/// Wraps SHA-256. Order of updates is significant.
pub struct StateHasher {
    hasher: Sha256,
}

impl StateHasher {
    /// Create a new hasher with domain separator.
    pub fn new(domain: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(domain);
        Self { hasher }
    }

    /// Create hasher for movement state.
    pub fn for_movement_state() -> Self {
        Self::new(b"STEPLINE_MOVEMENT_V1")
    }

    /// Update with a u8 value.
    #[inline]
    pub fn update_u8(&mut self, value: u8) {
        self.hasher.update([value]);
    }

    /// Update with a u32 value (little-endian).
    #[inline]
    pub fn update_u32(&mut self, value: u32) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Update with a u64 value (little-endian).
    #[inline]
    pub fn update_u64(&mut self, value: u64) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Update with an f32 bit pattern.
    #[inline]
    pub fn update_f32(&mut self, value: f32) {
        self.update_u32(value.to_bits());
    }

    /// Update with a Vec3.
    #[inline]
    pub fn update_vec3(&mut self, value: Vec3) {
        self.update_f32(value.x);
        self.update_f32(value.y);
        self.update_f32(value.z);
    }

    /// Update with a boolean.
    #[inline]
    pub fn update_bool(&mut self, value: bool) {
        self.update_u8(value as u8);
    }

    /// Update with a UUID (16 bytes).
    #[inline]
    pub fn update_uuid(&mut self, uuid: &[u8; 16]) {
        self.hasher.update(uuid);
    }

    /// Finalize and return the hash.
    pub fn finalize(self) -> StateHash {
        self.hasher.finalize().into()
    }
}

/// Hash the state of one tick.
///
/// The tick goes in first; the closure adds the state itself.
pub fn compute_state_hash<F>(tick: SimulationTickNumber, add_state: F) -> StateHash
where
    F: FnOnce(&mut StateHasher),
{
    let mut hasher = StateHasher::for_movement_state();
    hasher.update_u64(tick.get());
    add_state(&mut hasher);
    hasher.finalize()
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_hasher_determinism() {
        let make_hash = || {
            let mut hasher = StateHasher::for_movement_state();
            hasher.update_u32(100);
            hasher.update_vec3(Vec3::new(1.0, 2.0, 3.0));
            hasher.update_f32(0.5);
            hasher.update_bool(true);
            hasher.finalize()
        };

        assert_eq!(make_hash(), make_hash());
    }

    #[test]
    fn test_hash_order_matters() {
        let hash1 = {
            let mut h = StateHasher::new(b"test");
            h.update_f32(1.0);
            h.update_f32(2.0);
            h.finalize()
        };

        let hash2 = {
            let mut h = StateHasher::new(b"test");
            h.update_f32(2.0);
            h.update_f32(1.0);
            h.finalize()
        };

        assert_ne!(hash1, hash2);
    }

    #[test]
    fn test_signed_zero_distinguished() {
        let hash = |value: f32| {
            let mut h = StateHasher::for_movement_state();
            h.update_f32(value);
            h.finalize()
        };
        assert_ne!(hash(0.0), hash(-0.0));
    }

    #[test]
    fn test_domain_separation() {
        let hash = |domain: &[u8]| {
            let mut h = StateHasher::new(domain);
            h.update_u32(1234);
            h.finalize()
        };
        assert_ne!(hash(b"DOMAIN_A"), hash(b"DOMAIN_B"));
    }

    #[test]
    fn test_compute_state_hash() {
        let tick = SimulationTickNumber::new(100);
        let hash = compute_state_hash(tick, |h| h.update_vec3(Vec3::new(5.0, 0.0, 1.0)));
        let again = compute_state_hash(tick, |h| h.update_vec3(Vec3::new(5.0, 0.0, 1.0)));
        assert_eq!(hash, again);

        let later = compute_state_hash(tick.next(), |h| h.update_vec3(Vec3::new(5.0, 0.0, 1.0)));
        assert_ne!(hash, later);
    }
}
