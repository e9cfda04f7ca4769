//! Runtime and adapters: event log, offset stores, the entity runtime and
//! directory, projections, topic producers and the worker reconciler.

pub mod config;
pub mod entity;
pub mod event_log;
pub mod offset_store;
pub mod projection;
pub mod restart;
pub mod testkit;
pub mod topic;
pub mod workers;

#[cfg(test)]
mod test_entity;

pub use config::{
    ConfigError, DirectoryConfig, EntityConfig, KeelConfig, ProjectionConfig, ReconcilerConfig, UnhandledEventLog,
};
pub use restart::RestartBackoff;
