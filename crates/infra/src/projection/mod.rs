//! Projection handler runtime.
//!
//! A read side consumes each of its tags as an independent stream, strictly
//! in offset order, starting after the last committed offset. Delivery is
//! at-least-once; a failed stream is restarted by [`supervise`] from the
//! committed offset after a backoff.
//!
//! - [`ReadSideHandler`] / [`HandlerTable`]: the side-effect logic.
//! - [`ReadSideProcessor`]: handler + tags + [`CommitMode`].
//! - [`TagProcessor`] / [`TagRunner`]: what the worker reconciler starts and
//!   stops, one runner per tag.

pub mod error;
pub mod handler;
pub mod processor;
pub mod supervisor;

pub use error::{HandlerError, ProjectionError};
pub use handler::{HandlerTable, ReadSideHandler};
pub use processor::{CommitMode, ReadSideProcessor};
pub use supervisor::{TagProcessor, TagRunner, supervise};
