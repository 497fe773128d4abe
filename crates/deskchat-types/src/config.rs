//! Configuration types for deskchat.
//!
//! `ChatConfig` is the `config.toml` injected into the coordinator and the
//! post queue at construction time. Every field has a default, so an empty
//! file is a valid configuration.

use serde::{Deserialize, Serialize};

use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatConfig {
    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub events: EventConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Retry, concurrency, and lane lifecycle settings for the post queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Total delivery attempts before a job is marked failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound for any single backoff delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: u32,

    /// How long an empty lane task lingers before exiting.
    #[serde(default = "default_lane_idle_timeout_ms")]
    pub lane_idle_timeout_ms: u64,

    /// Process-wide cap on concurrent post calls across all lanes.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_multiplier() -> u32 {
    2
}

fn default_lane_idle_timeout_ms() -> u64 {
    30_000
}

fn default_max_in_flight() -> usize {
    4
}

impl QueueConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn lane_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.lane_idle_timeout_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            lane_idle_timeout_ms: default_lane_idle_timeout_ms(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

/// Event bus sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventConfig {
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
}

fn default_event_capacity() -> usize {
    256
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
        }
    }
}

/// Output format of the tracing subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,

    /// Default filter directive when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,

    /// Bridge spans to OpenTelemetry (stdout exporter).
    #[serde(default)]
    pub otel: bool,
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            filter: default_log_filter(),
            otel: false,
        }
    }
}
