//! Configuration management.

use serde::Deserialize;
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Real-time coordination configuration
    #[serde(default)]
    pub realtime: RealtimeConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// HTTP server host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Timing knobs for presence, locking, and broadcast.
///
/// Lease durations are deliberately short and renewable; they bound how long
/// a crashed editor can hold a resource, and they are much shorter than the
/// session-token lifetimes owned by the external auth subsystem.
#[derive(Debug, Clone, Deserialize)]
pub struct RealtimeConfig {
    /// Interval at which clients are expected to heartbeat
    #[serde(with = "humantime_serde", default = "default_heartbeat_interval")]
    pub heartbeat_interval: Duration,

    /// Missed-heartbeat duration after which an active session is demoted to idle
    #[serde(with = "humantime_serde", default = "default_idle_threshold")]
    pub idle_threshold: Duration,

    /// Duration after which an idle session is demoted to away
    #[serde(with = "humantime_serde", default = "default_away_threshold")]
    pub away_threshold: Duration,

    /// Consecutive missed heartbeats that force a disconnect
    #[serde(default = "default_max_missed_heartbeats")]
    pub max_missed_heartbeats: u32,

    /// Coalescing window for high-frequency updates (cursor, typing)
    #[serde(with = "humantime_serde", default = "default_coalesce_window")]
    pub coalesce_window: Duration,

    /// Default lock lease duration
    #[serde(with = "humantime_serde", default = "default_lock_lease")]
    pub lock_lease: Duration,

    /// Capacity of the guaranteed (state-changing) outbound lane
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,

    /// Capacity of the droppable (presence/cursor) outbound lane
    #[serde(default = "default_presence_queue_capacity")]
    pub presence_queue_capacity: usize,

    /// Number of recent events retained per resource for replay
    #[serde(default = "default_replay_buffer_size")]
    pub replay_buffer_size: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: default_heartbeat_interval(),
            idle_threshold: default_idle_threshold(),
            away_threshold: default_away_threshold(),
            max_missed_heartbeats: default_max_missed_heartbeats(),
            coalesce_window: default_coalesce_window(),
            lock_lease: default_lock_lease(),
            event_queue_capacity: default_event_queue_capacity(),
            presence_queue_capacity: default_presence_queue_capacity(),
            replay_buffer_size: default_replay_buffer_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
        }
    }
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_heartbeat_interval() -> Duration { Duration::from_secs(15) }
fn default_idle_threshold() -> Duration { Duration::from_secs(60) }
fn default_away_threshold() -> Duration { Duration::from_secs(300) }
fn default_max_missed_heartbeats() -> u32 { 3 }
fn default_coalesce_window() -> Duration { Duration::from_millis(150) }
fn default_lock_lease() -> Duration { Duration::from_secs(30) }
fn default_event_queue_capacity() -> usize { 256 }
fn default_presence_queue_capacity() -> usize { 64 }
fn default_replay_buffer_size() -> usize { 1000 }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("HUDDLE").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with environment overrides.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("HUDDLE").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = RealtimeConfig::default();
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(cfg.coalesce_window, Duration::from_millis(150));
        assert_eq!(cfg.lock_lease, Duration::from_secs(30));
        // Leases must be far shorter than idle/away session thresholds.
        assert!(cfg.lock_lease < cfg.away_threshold);
    }
}
