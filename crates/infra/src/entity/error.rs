use std::time::Duration;

use thiserror::Error;

use keel_core::{DomainError, EntityId};

/// Why an ask did not produce a reply.
///
/// Only `PersistenceFailure` and `AskTimeout` leave the outcome of a
/// persisting command uncertain; every other variant guarantees nothing was
/// persisted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AskError {
    /// No reply within the ask timeout. The command may still run.
    #[error("ask to {entity_type}/{entity_id} timed out after {timeout:?}{}", diagnostics_suffix(.diagnostics))]
    AskTimeout {
        entity_type: String,
        entity_id: EntityId,
        timeout: Duration,
        diagnostics: Option<String>,
    },

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("unhandled command '{command}' for entity type '{entity_type}'")]
    UnhandledCommand { entity_type: String, command: String },

    #[error(transparent)]
    Domain(DomainError),

    /// The event log rejected or failed the append; state is unchanged.
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    /// The instance went away before replying (e.g. failed recovery).
    #[error("entity {entity_type}/{entity_id} stopped: {reason}")]
    EntityStopped {
        entity_type: String,
        entity_id: EntityId,
        reason: String,
    },

    #[error("entity type '{0}' is not registered")]
    UnknownEntityType(String),
}

impl AskError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, AskError::AskTimeout { .. })
    }
}

impl From<DomainError> for AskError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::InvalidCommand(msg) => AskError::InvalidCommand(msg),
            DomainError::UnhandledCommand { entity_type, command } => {
                AskError::UnhandledCommand { entity_type, command }
            }
            other => AskError::Domain(other),
        }
    }
}

fn diagnostics_suffix(diagnostics: &Option<String>) -> String {
    match diagnostics {
        Some(d) => format!(" ({d})"),
        None => String::new(),
    }
}

/// Entity directory construction and placement errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    #[error("entity type '{0}' is not registered")]
    UnknownEntityType(String),

    #[error("entity type '{0}' is registered twice")]
    DuplicateEntityType(String),

    #[error("entity type name must not be empty")]
    EmptyEntityType,

    #[error("membership must contain at least one node")]
    EmptyMembership,
}
