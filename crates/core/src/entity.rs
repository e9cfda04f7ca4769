//! Persistent entity contract.

use crate::behavior::{Behavior, Kind};
use crate::id::EntityId;

/// An event-sourced, addressable entity type.
///
/// The type itself carries no per-instance data: everything an instance knows
/// lives in its [`Behavior`], which is rebuilt from a snapshot and the
/// persisted events whenever the instance is (re)started.
///
/// - **Commands** are routed to a handler by [`Kind::kind`].
/// - **Events** are applied through the event handler table of the current
///   behavior; handlers must be pure.
/// - **State** is only ever produced by folding events.
pub trait PersistentEntity: Sized + Send + Sync + 'static {
    type Command: Kind + core::fmt::Debug + Send + 'static;
    type Event: Kind + Clone + core::fmt::Debug + Send + Sync + 'static;
    type State: Clone + core::fmt::Debug + Send + Sync + 'static;
    type Reply: core::fmt::Debug + Send + 'static;

    /// Stable entity type name, used for registration and storage keys.
    const ENTITY_TYPE: &'static str;

    /// Behavior to start from, given the latest snapshot (if any).
    fn initial_behavior(snapshot: Option<Self::State>) -> Behavior<Self>;

    /// Runs once after recovery replay and before the first live command.
    fn recovery_completed(behavior: Behavior<Self>, _entity_id: &EntityId) -> Behavior<Self> {
        behavior
    }
}

/// Optimistic concurrency expectation for an entity stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Skip version checking.
    Any,
    /// Require the stream to be at an exact sequence number.
    Exact(u64),
}

impl ExpectedVersion {
    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }
}
