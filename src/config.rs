//! Configuration Module
//!
//! Handles loading and managing sync-layer configuration from environment variables.

use std::env;
use std::time::Duration;

/// Cache-and-sync layer configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Background sweep task interval in seconds
    pub sweep_interval_secs: u64,
    /// Short TTL tier in milliseconds, for frequently-changing lists
    pub ttl_short_ms: u64,
    /// Long TTL tier in milliseconds, for slow-changing aggregates
    pub ttl_long_ms: u64,
    /// Capacity of the per-scope and per-topic fan-out channels
    pub channel_capacity: usize,
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `SWEEP_INTERVAL` - Sweep frequency in seconds (default: 60)
    /// - `TTL_SHORT_MS` - Short TTL tier in milliseconds (default: 5000)
    /// - `TTL_LONG_MS` - Long TTL tier in milliseconds (default: 300000)
    /// - `CHANNEL_CAPACITY` - Fan-out channel capacity (default: 64)
    pub fn from_env() -> Self {
        Self {
            sweep_interval_secs: env::var("SWEEP_INTERVAL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            ttl_short_ms: env::var("TTL_SHORT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5_000),
            ttl_long_ms: env::var("TTL_LONG_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300_000),
            channel_capacity: env::var("CHANNEL_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(64),
        }
    }

    // == TTL Tiers ==
    /// Short TTL tier as a duration. Used for volatile lists such as comments
    /// or conversation messages.
    pub fn ttl_short(&self) -> Duration {
        Duration::from_millis(self.ttl_short_ms)
    }

    /// Long TTL tier as a duration. Used for slow-changing aggregates such as
    /// follower counts.
    pub fn ttl_long(&self) -> Duration {
        Duration::from_millis(self.ttl_long_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 60,
            ttl_short_ms: 5_000,
            ttl_long_ms: 300_000,
            channel_capacity: 64,
        }
    }
}
