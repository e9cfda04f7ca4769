//! Runtime configuration.
//!
//! Everything is assembled once at bootstrap and handed to the components
//! that need it. [`KeelConfig::from_env`] reads `KEEL_*` variables; every
//! variable is optional and falls back to the defaults below.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::restart::RestartBackoff;

/// Configuration loading errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

/// Top-level configuration for a node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeelConfig {
    pub entity: EntityConfig,
    pub directory: DirectoryConfig,
    pub projection: ProjectionConfig,
    pub reconciler: ReconcilerConfig,
}

impl KeelConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let entity_defaults = EntityConfig::default();
        let entity = EntityConfig {
            passivate_after: millis(&lookup, "KEEL_ENTITY_PASSIVATE_AFTER_MS", entity_defaults.passivate_after)?,
            snapshot_after: parsed(&lookup, "KEEL_ENTITY_SNAPSHOT_AFTER", entity_defaults.snapshot_after)?,
            mailbox_capacity: positive(&lookup, "KEEL_ENTITY_MAILBOX_CAPACITY", entity_defaults.mailbox_capacity)?,
            num_shards: positive(&lookup, "KEEL_NUM_SHARDS", entity_defaults.num_shards)?,
        };

        let directory_defaults = DirectoryConfig::default();
        let directory = DirectoryConfig {
            ask_timeout: millis(&lookup, "KEEL_ASK_TIMEOUT_MS", directory_defaults.ask_timeout)?,
            log_cluster_state_on_timeout: flag(
                &lookup,
                "KEEL_LOG_CLUSTER_STATE_ON_TIMEOUT",
                directory_defaults.log_cluster_state_on_timeout,
            )?,
            log_command_payload_on_timeout: flag(
                &lookup,
                "KEEL_LOG_COMMAND_PAYLOAD_ON_TIMEOUT",
                directory_defaults.log_command_payload_on_timeout,
            )?,
            virtual_nodes: positive(&lookup, "KEEL_PLACEMENT_VNODES", directory_defaults.virtual_nodes)?,
        };

        let projection_defaults = ProjectionConfig::default();
        let backoff = RestartBackoff::new(
            millis(&lookup, "KEEL_PROJECTION_BACKOFF_MIN_MS", projection_defaults.backoff.min)?,
            millis(&lookup, "KEEL_PROJECTION_BACKOFF_MAX_MS", projection_defaults.backoff.max)?,
        );
        if backoff.min > backoff.max {
            return Err(ConfigError::Invalid {
                key: "KEEL_PROJECTION_BACKOFF_MIN_MS".to_string(),
                value: backoff.min.as_millis().to_string(),
                reason: "must not exceed KEEL_PROJECTION_BACKOFF_MAX_MS".to_string(),
            });
        }
        let projection = ProjectionConfig {
            batch_threshold: positive(&lookup, "KEEL_PROJECTION_BATCH_THRESHOLD", projection_defaults.batch_threshold)?,
            flush_interval: millis(&lookup, "KEEL_PROJECTION_FLUSH_INTERVAL_MS", projection_defaults.flush_interval)?,
            poll_interval: millis(&lookup, "KEEL_PROJECTION_POLL_INTERVAL_MS", projection_defaults.poll_interval)?,
            page_size: positive(&lookup, "KEEL_PROJECTION_PAGE_SIZE", projection_defaults.page_size)?,
            backoff,
            unhandled_event_log: parsed(
                &lookup,
                "KEEL_PROJECTION_UNHANDLED_EVENT_LOG",
                projection_defaults.unhandled_event_log,
            )?,
        };

        let reconciler = ReconcilerConfig {
            tick: millis(&lookup, "KEEL_RECONCILER_TICK_MS", ReconcilerConfig::default().tick)?,
        };

        Ok(Self {
            entity,
            directory,
            projection,
            reconciler,
        })
    }

    pub fn with_entity(mut self, entity: EntityConfig) -> Self {
        self.entity = entity;
        self
    }

    pub fn with_directory(mut self, directory: DirectoryConfig) -> Self {
        self.directory = directory;
        self
    }

    pub fn with_projection(mut self, projection: ProjectionConfig) -> Self {
        self.projection = projection;
        self
    }

    pub fn with_reconciler(mut self, reconciler: ReconcilerConfig) -> Self {
        self.reconciler = reconciler;
        self
    }
}

/// Entity instance settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityConfig {
    /// Idle time after which an instance stops and releases its state.
    pub passivate_after: Duration,
    /// Events between snapshots (0 = never snapshot).
    pub snapshot_after: u64,
    /// Bounded mailbox size per instance.
    pub mailbox_capacity: usize,
    /// Number of tags for sharded event streams.
    pub num_shards: u32,
}

impl Default for EntityConfig {
    fn default() -> Self {
        Self {
            passivate_after: Duration::from_secs(120),
            snapshot_after: 100,
            mailbox_capacity: 32,
            num_shards: 4,
        }
    }
}

impl EntityConfig {
    pub fn with_passivate_after(mut self, passivate_after: Duration) -> Self {
        self.passivate_after = passivate_after;
        self
    }

    pub fn with_snapshot_after(mut self, snapshot_after: u64) -> Self {
        self.snapshot_after = snapshot_after;
        self
    }

    pub fn with_mailbox_capacity(mut self, mailbox_capacity: usize) -> Self {
        self.mailbox_capacity = mailbox_capacity.max(1);
        self
    }

    pub fn with_num_shards(mut self, num_shards: u32) -> Self {
        self.num_shards = num_shards.max(1);
        self
    }
}

/// Entity directory settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryConfig {
    /// Default bound on a single ask.
    pub ask_timeout: Duration,
    pub log_cluster_state_on_timeout: bool,
    pub log_command_payload_on_timeout: bool,
    /// Virtual nodes per member on the placement ring.
    pub virtual_nodes: u32,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            ask_timeout: Duration::from_secs(5),
            log_cluster_state_on_timeout: false,
            log_command_payload_on_timeout: false,
            virtual_nodes: 64,
        }
    }
}

impl DirectoryConfig {
    pub fn with_ask_timeout(mut self, ask_timeout: Duration) -> Self {
        self.ask_timeout = ask_timeout;
        self
    }

    pub fn with_log_cluster_state_on_timeout(mut self, enabled: bool) -> Self {
        self.log_cluster_state_on_timeout = enabled;
        self
    }

    pub fn with_log_command_payload_on_timeout(mut self, enabled: bool) -> Self {
        self.log_command_payload_on_timeout = enabled;
        self
    }

    pub fn with_virtual_nodes(mut self, virtual_nodes: u32) -> Self {
        self.virtual_nodes = virtual_nodes.max(1);
        self
    }
}

/// Projection runtime settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionConfig {
    /// Batched mode flushes once more than this many events are unflushed.
    pub batch_threshold: usize,
    /// Batched mode flushes a pending offset at least this often.
    pub flush_interval: Duration,
    /// Delay between event log polls once a tag is caught up.
    pub poll_interval: Duration,
    /// Events requested per event log read.
    pub page_size: usize,
    pub backoff: RestartBackoff,
    pub unhandled_event_log: UnhandledEventLog,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            batch_threshold: 20,
            flush_interval: Duration::from_secs(1),
            poll_interval: Duration::from_millis(100),
            page_size: 256,
            backoff: RestartBackoff::default(),
            unhandled_event_log: UnhandledEventLog::Debug,
        }
    }
}

impl ProjectionConfig {
    pub fn with_batch_threshold(mut self, batch_threshold: usize) -> Self {
        self.batch_threshold = batch_threshold.max(1);
        self
    }

    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: RestartBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_unhandled_event_log(mut self, level: UnhandledEventLog) -> Self {
        self.unhandled_event_log = level;
        self
    }
}

/// Worker reconciler settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// Period of the control loop when nothing else wakes it.
    pub tick: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(500),
        }
    }
}

impl ReconcilerConfig {
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }
}

/// Level at which skipped (unregistered) projection events are logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnhandledEventLog {
    Off,
    Trace,
    Debug,
    Info,
    Warn,
}

impl UnhandledEventLog {
    pub fn emit(&self, projection: &str, tag: &str, event_type: &str, offset: &str) {
        match self {
            UnhandledEventLog::Off => {}
            UnhandledEventLog::Trace => {
                tracing::trace!(projection, tag, event_type, offset, "skipping unhandled event")
            }
            UnhandledEventLog::Debug => {
                tracing::debug!(projection, tag, event_type, offset, "skipping unhandled event")
            }
            UnhandledEventLog::Info => {
                tracing::info!(projection, tag, event_type, offset, "skipping unhandled event")
            }
            UnhandledEventLog::Warn => {
                tracing::warn!(projection, tag, event_type, offset, "skipping unhandled event")
            }
        }
    }
}

impl FromStr for UnhandledEventLog {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "none" => Ok(Self::Off),
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            other => Err(format!("unknown level '{other}' (expected off|trace|debug|info|warn)")),
        }
    }
}

fn parsed<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse::<T>().map_err(|err| ConfigError::Invalid {
            key: key.to_string(),
            value: raw.clone(),
            reason: err.to_string(),
        }),
    }
}

fn positive<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + PartialOrd + Default + Copy,
    T::Err: std::fmt::Display,
{
    let value = parsed(lookup, key, default)?;
    if value <= T::default() {
        return Err(ConfigError::Invalid {
            key: key.to_string(),
            value: lookup(key).unwrap_or_default(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

fn millis<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let ms = parsed(lookup, key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(ms))
}

fn flag<F>(lookup: &F, key: &str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                key: key.to_string(),
                value: raw,
                reason: "expected a boolean".to_string(),
            }),
        },
    }
}
