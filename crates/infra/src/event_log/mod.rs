//! Durable, append-only event log.
//!
//! - [`EventLog`]: storage contract used by entity instances (append/load)
//!   and by consumers (reads by tag, in offset order).
//! - [`InMemoryEventLog`]: per-process log for tests and single-node dev.
//! - [`PostgresEventLog`]: sqlx-backed journal.
//! - [`event_stream`]: live, polling stream over one tag.

pub mod in_memory;
pub mod postgres;
pub mod stream;
pub mod r#trait;

pub use in_memory::InMemoryEventLog;
pub use postgres::PostgresEventLog;
pub use r#trait::{EventLog, EventLogError, Snapshot, StoredEvent, UncommittedEvent};
pub use stream::{TagStream, event_stream};
