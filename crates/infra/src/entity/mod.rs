//! Entity runtime.
//!
//! One live instance per (entity type, entity id). An instance is a tokio
//! task owning its [`Behavior`](keel_core::Behavior) and draining a bounded
//! mailbox one command at a time, so command handling for an id is strictly
//! serial. Instances recover from snapshot + events on start and passivate
//! when idle.

pub mod child;
pub mod directory;
pub mod error;
pub mod failure;
pub mod instance;
pub mod placement;

pub use child::ChildEntity;
pub use directory::{EntityDirectory, EntityDirectoryBuilder, EntityRef};
pub use error::{AskError, DirectoryError};
pub use failure::{AskContext, AskFailureHandler, PassThroughFailureHandler, TracingFailureHandler};
pub use instance::EntityHandle;
pub use placement::{NodeId, Placement, PlacementTable};

use serde::Serialize;
use serde::de::DeserializeOwned;

use keel_core::PersistentEntity;

/// A persistent entity whose events and state can be stored.
///
/// Blanket-implemented; it only names the serialization bounds the runtime
/// needs.
pub trait EventSourcedEntity:
    PersistentEntity<Event: keel_events::Event, State: Serialize + DeserializeOwned>
{
}

impl<T> EventSourcedEntity for T where
    T: PersistentEntity<Event: keel_events::Event, State: Serialize + DeserializeOwned>
{
}
