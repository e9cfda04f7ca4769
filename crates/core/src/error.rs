//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// These are deterministic failures raised while deciding what a command
/// means. Storage and transport failures are modelled by the infrastructure
/// crates and never appear here.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// The command was rejected by the entity. Nothing was persisted.
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// The current behavior has no handler for this command.
    #[error("unhandled command '{command}' for entity type '{entity_type}'")]
    UnhandledCommand { entity_type: String, command: String },

    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. empty or unparsable).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A domain-specific failure reported by a command handler.
    #[error("rejected: {0}")]
    Rejected(String),

    /// The command handler panicked; the entity state is unchanged.
    #[error("command handler failed: {0}")]
    HandlerFailed(String),
}

impl DomainError {
    pub fn invalid_command(msg: impl Into<String>) -> Self {
        Self::InvalidCommand(msg.into())
    }

    pub fn unhandled(entity_type: impl Into<String>, command: impl Into<String>) -> Self {
        Self::UnhandledCommand {
            entity_type: entity_type.into(),
            command: command.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }

    /// `true` for failures that must never be retried automatically.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::InvalidCommand(_) | Self::UnhandledCommand { .. } | Self::Validation(_)
        )
    }
}
