//! Background workers.

pub mod reconciler;

pub use reconciler::{
    ProjectionState, ProjectionWorker, ReconcilerError, WorkerCoordinator, WorkerStatus, worker_placement_key,
};
