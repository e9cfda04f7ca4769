//! `keel-core`: entity building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the domain error model, and the [`Behavior`] value that drives
//! a persistent entity's command and event handling.

pub mod behavior;
pub mod entity;
pub mod error;
pub mod id;

pub use behavior::{Behavior, BehaviorBuilder, CommandContext, Effect, Kind};
pub use entity::{ExpectedVersion, PersistentEntity};
pub use error::{DomainError, DomainResult};
pub use id::{EntityId, EventId};
