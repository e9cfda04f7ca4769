use thiserror::Error;

use keel_events::{AggregateEventTag, Offset, TrackerError};

use crate::event_log::EventLogError;
use crate::offset_store::OffsetStoreError;

/// Error returned by read-side handler code.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The resource a prepare step creates is already there.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error(transparent)]
    Store(OffsetStoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }
}

impl From<OffsetStoreError> for HandlerError {
    fn from(err: OffsetStoreError) -> Self {
        match err {
            OffsetStoreError::AlreadyExists(what) => Self::AlreadyExists(what),
            other => Self::Store(other),
        }
    }
}

impl From<sqlx::Error> for HandlerError {
    fn from(err: sqlx::Error) -> Self {
        crate::offset_store::postgres::map_sqlx_error("read_side_handler", err).into()
    }
}

/// Why a projection stream for one tag stopped.
///
/// Every variant ends the stream; the supervisor restarts it from the last
/// committed offset.
#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("global prepare of '{projection}' failed: {source}")]
    GlobalPrepare {
        projection: String,
        #[source]
        source: HandlerError,
    },

    #[error("prepare of '{projection}' for tag {tag} failed: {source}")]
    Prepare {
        projection: String,
        tag: AggregateEventTag,
        #[source]
        source: HandlerError,
    },

    #[error("handler of '{projection}' failed on {event_type} at {tag}@{offset}: {source}")]
    Handler {
        projection: String,
        tag: AggregateEventTag,
        offset: Offset,
        event_type: String,
        #[source]
        source: HandlerError,
    },

    #[error("offset store: {0}")]
    Offset(#[from] OffsetStoreError),

    #[error("event log: {0}")]
    EventLog(#[from] EventLogError),

    #[error(transparent)]
    NonMonotonicOffset(#[from] TrackerError),

    #[error("cannot decode {event_type} at {offset}: {reason}")]
    Decode {
        event_type: String,
        offset: Offset,
        reason: String,
    },

    #[error("publish failed at {tag}@{offset}: {source}")]
    Publish {
        tag: AggregateEventTag,
        offset: Offset,
        #[source]
        source: keel_events::PublishError,
    },
}
