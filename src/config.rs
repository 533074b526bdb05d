//! Netcode configuration.
//!
//! Every tunable constant of the simulation core lives in [`NetcodeConfig`].
//! Missing JSON fields fall back to the defaults, so a config file only needs
//! to name what it changes:
//!
//! ```json
//! { "tick_rate": 60, "movement": { "max_run_speed": 6.0 } }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::clock::ClockSteering;
use crate::game::movement::MovementConfig;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// Config file is not valid JSON for this schema.
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// A value is out of range.
    #[error("Invalid config value for {field}: {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

/// Tunables for clocks, history, input queues and connection handshakes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetcodeConfig {
    /// Fixed simulation rate (Hz).
    pub tick_rate: u32,
    /// Cap on fixed steps per update after a stall.
    pub max_steps_per_update: u32,
    /// Seconds of history each snapshot store retains.
    pub snapshot_retention_secs: u32,
    /// Fraction of clock discrepancy corrected per update.
    pub clock_correction_fraction: f64,
    /// Discrepancy (fraction of a tick) below which no correction happens.
    pub clock_correction_threshold: f64,
    /// Extra delay applied when rendering remote entities (ms).
    pub remote_render_delay_ms: u64,
    /// Queued inputs per player on the server before the oldest is dropped.
    pub server_input_backlog: usize,
    /// Unacknowledged inputs a client keeps before dropping the oldest.
    pub client_pending_input_capacity: usize,
    /// Newest pending inputs resent in every input packet.
    pub input_redundancy: usize,
    /// Clock-sync requests sent before giving up.
    pub clock_sync_attempts: u32,
    /// Interval between clock-sync retries (ms).
    pub clock_sync_retry_ms: u64,
    /// Time allowed for the server to answer a join (ms).
    pub join_timeout_ms: u64,
    /// Movement state machine parameters.
    pub movement: MovementConfig,
}

impl Default for NetcodeConfig {
    fn default() -> Self {
        Self {
            tick_rate: crate::DEFAULT_TICK_RATE,
            max_steps_per_update: 5,
            snapshot_retention_secs: crate::DEFAULT_SNAPSHOT_RETENTION_SECS,
            clock_correction_fraction: 0.1,
            clock_correction_threshold: 0.1,
            remote_render_delay_ms: 100,
            server_input_backlog: 5,
            client_pending_input_capacity: 600,
            input_redundancy: 3,
            clock_sync_attempts: 5,
            clock_sync_retry_ms: 500,
            join_timeout_ms: 5000,
            movement: MovementConfig::default(),
        }
    }
}

impl NetcodeConfig {
    /// Parse from a JSON string and validate.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON file and validate.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Check ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: &str) -> ConfigError {
            ConfigError::Invalid {
                field,
                reason: reason.to_string(),
            }
        }

        if self.tick_rate == 0 || self.tick_rate > 1000 {
            return Err(invalid("tick_rate", "must be in 1..=1000"));
        }
        if self.max_steps_per_update == 0 {
            return Err(invalid("max_steps_per_update", "must be at least 1"));
        }
        if self.snapshot_retention_secs == 0 {
            return Err(invalid("snapshot_retention_secs", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.clock_correction_fraction) {
            return Err(invalid("clock_correction_fraction", "must be in 0..=1"));
        }
        if self.clock_correction_threshold < 0.0 {
            return Err(invalid("clock_correction_threshold", "must not be negative"));
        }
        if self.server_input_backlog == 0 {
            return Err(invalid("server_input_backlog", "must be at least 1"));
        }
        if self.client_pending_input_capacity == 0 {
            return Err(invalid("client_pending_input_capacity", "must be at least 1"));
        }
        if self.input_redundancy == 0 {
            return Err(invalid("input_redundancy", "must be at least 1"));
        }
        if self.clock_sync_attempts == 0 {
            return Err(invalid("clock_sync_attempts", "must be at least 1"));
        }
        self.movement.validate()
    }

    /// Duration of one fixed tick.
    pub fn fixed_step(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / self.tick_rate.max(1) as u64)
    }

    /// Fixed tick duration in seconds, as fed to the movement state machine.
    pub fn fixed_step_secs(&self) -> f32 {
        1.0 / self.tick_rate.max(1) as f32
    }

    /// Snapshot store capacity (ticks per second times retention).
    pub fn snapshot_capacity(&self) -> usize {
        self.tick_rate as usize * self.snapshot_retention_secs as usize
    }

    /// Clock steering parameters.
    pub fn clock_steering(&self) -> ClockSteering {
        ClockSteering {
            correction_fraction: self.clock_correction_fraction,
            threshold_fraction: self.clock_correction_threshold,
        }
    }

    /// Remote entity render delay.
    pub fn remote_render_delay(&self) -> Duration {
        Duration::from_millis(self.remote_render_delay_ms)
    }

    /// Interval between clock-sync retries.
    pub fn clock_sync_retry(&self) -> Duration {
        Duration::from_millis(self.clock_sync_retry_ms)
    }

    /// Join handshake timeout.
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}
