//! Read-side offset persistence.
//!
//! Every (read side, tag) pair keeps the offset of the last event whose side
//! effects were committed. Restarting consumers resume strictly after it.
//!
//! - [`OffsetStore`]: key/value contract for offsets.
//! - [`ReadSideDb`]: an offset store whose side-effect writes can share a
//!   transaction with the offset write.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::{InMemoryReadSide, InMemoryTx};
pub use postgres::PostgresOffsetStore;
pub use r#trait::{OffsetDao, OffsetKey, OffsetStore, OffsetStoreError, ReadSideDb};
