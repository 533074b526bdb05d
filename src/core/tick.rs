//! Tick and input sequence counters.
//!
//! Both counters are thin newtypes so a tick can never be confused with an
//! input sequence number at a call site. Ticks are 64-bit and never wrap in
//! practice. Input sequence numbers are 32-bit and compared with plain
//! ordering, so they saturate instead of wrapping back to the "none"
//! sentinel; at 30 Hz the range lasts about four and a half years of
//! continuous input.

use std::fmt;
use std::ops::{Add, AddAssign, Sub};

use serde::{Deserialize, Serialize};

// =============================================================================
// SIMULATION TICK NUMBER
// =============================================================================

/// Monotonically increasing fixed-step simulation counter.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SimulationTickNumber(pub u64);

impl SimulationTickNumber {
    /// The first simulation tick.
    pub const ZERO: Self = Self(0);

    /// Create a tick number.
    #[inline]
    pub const fn new(tick: u64) -> Self {
        Self(tick)
    }

    /// Raw value.
    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The tick after this one.
    #[inline]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// The tick before this one, saturating at zero.
    #[inline]
    pub const fn prev(self) -> Self {
        Self(self.0.saturating_sub(1))
    }
}

impl Add<u64> for SimulationTickNumber {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u64) -> Self {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for SimulationTickNumber {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl Sub<u64> for SimulationTickNumber {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: u64) -> Self {
        Self(self.0.saturating_sub(rhs))
    }
}

/// Difference of two ticks, in tick units.
impl Sub for SimulationTickNumber {
    type Output = i64;

    #[inline]
    fn sub(self, rhs: Self) -> i64 {
        self.0 as i64 - rhs.0 as i64
    }
}

impl fmt::Display for SimulationTickNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// =============================================================================
// PLAYER INPUT SEQUENCE NUMBER
// =============================================================================

/// Per-player counter, one per genuinely new input command set.
///
/// Zero is reserved for "nothing issued yet", so acknowledgements of zero
/// never remove a real input.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct PlayerInputSequenceNumber(pub u32);

impl PlayerInputSequenceNumber {
    /// Sentinel for "no input yet".
    pub const NONE: Self = Self(0);

    /// Create a sequence number.
    #[inline]
    pub const fn new(seq: u32) -> Self {
        Self(seq)
    }

    /// Raw value.
    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// The following sequence number. Saturates at `u32::MAX`.
    #[inline]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// True if at least one input has been issued.
    #[inline]
    pub const fn is_some(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for PlayerInputSequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seq{}", self.0)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_arithmetic() {
        let a = SimulationTickNumber::new(10);
        let b = a + 5;
        assert_eq!(b.get(), 15);
        assert_eq!(b - a, 5);
        assert_eq!(a - b, -5);
        assert_eq!(a.next().get(), 11);
        assert_eq!(SimulationTickNumber::ZERO.prev(), SimulationTickNumber::ZERO);
        assert!(a < b);
    }

    #[test]
    fn test_sequence_never_returns_to_none() {
        let seq = PlayerInputSequenceNumber::new(u32::MAX);
        assert_eq!(seq.next(), seq);
        assert!(seq.next().is_some());
        assert!(PlayerInputSequenceNumber::new(u32::MAX - 1).next() > PlayerInputSequenceNumber::new(u32::MAX - 1));
        assert!(!PlayerInputSequenceNumber::NONE.is_some());
        assert!(PlayerInputSequenceNumber::new(1).is_some());
    }
}
