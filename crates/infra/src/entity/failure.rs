//! Hooks run when an ask fails.

use tracing::warn;

use keel_core::EntityId;

use super::error::AskError;
use super::placement::{NodeId, PlacementTable};
use crate::config::DirectoryConfig;

/// What the directory knew when an ask failed.
#[derive(Debug)]
pub struct AskContext<'a> {
    pub entity_type: &'static str,
    pub entity_id: &'a EntityId,
    /// `Debug` rendering of the command; only captured when payload logging is on.
    pub command: Option<&'a str>,
    pub placement: &'a PlacementTable,
    pub owner: &'a NodeId,
}

/// Observes (and may enrich) failed asks before they reach the caller.
pub trait AskFailureHandler: Send + Sync {
    fn on_failure(&self, error: AskError, context: &AskContext<'_>) -> AskError;

    /// Whether the directory should capture the command payload for this handler.
    fn wants_command_payload(&self) -> bool {
        false
    }
}

/// Returns every error unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThroughFailureHandler;

impl AskFailureHandler for PassThroughFailureHandler {
    fn on_failure(&self, error: AskError, _context: &AskContext<'_>) -> AskError {
        error
    }
}

/// Logs ask timeouts with optional placement state and command payload, and
/// attaches the same text to the returned `AskTimeout`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingFailureHandler {
    pub log_cluster_state: bool,
    pub log_command_payload: bool,
}

impl TracingFailureHandler {
    pub fn from_config(config: &DirectoryConfig) -> Self {
        Self {
            log_cluster_state: config.log_cluster_state_on_timeout,
            log_command_payload: config.log_command_payload_on_timeout,
        }
    }

    fn diagnostics(&self, context: &AskContext<'_>) -> Option<String> {
        let mut parts = Vec::new();
        if self.log_cluster_state {
            let members: Vec<&str> = context.placement.members().iter().map(NodeId::as_str).collect();
            parts.push(format!(
                "placement v{} owner {} members [{}]",
                context.placement.version(),
                context.owner,
                members.join(", ")
            ));
        }
        if self.log_command_payload {
            if let Some(command) = context.command {
                parts.push(format!("command {command}"));
            }
        }
        (!parts.is_empty()).then(|| parts.join("; "))
    }
}

impl AskFailureHandler for TracingFailureHandler {
    fn on_failure(&self, error: AskError, context: &AskContext<'_>) -> AskError {
        match error {
            AskError::AskTimeout {
                entity_type,
                entity_id,
                timeout,
                ..
            } => {
                let diagnostics = self.diagnostics(context);
                warn!(
                    entity_type = %entity_type,
                    entity_id = %entity_id,
                    timeout_ms = timeout.as_millis() as u64,
                    diagnostics = diagnostics.as_deref().unwrap_or(""),
                    "ask timed out"
                );
                AskError::AskTimeout {
                    entity_type,
                    entity_id,
                    timeout,
                    diagnostics,
                }
            }
            other => other,
        }
    }

    fn wants_command_payload(&self) -> bool {
        self.log_command_payload
    }
}
