//! Entity instances owned directly by a caller rather than the directory.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::info;

use keel_core::EntityId;

use super::EventSourcedEntity;
use super::error::AskError;
use super::instance::{EntityHandle, InstanceConfig, spawn_instance};
use crate::config::EntityConfig;
use crate::event_log::EventLog;

/// A privately owned instance with the same persistence semantics as a
/// directory-managed one, but no placement and no passivation.
///
/// It lives until [`stop`](Self::stop) is called or the child is dropped.
/// An instance that stopped itself after a persistence failure is recovered
/// from the log on the next ask. The owner must not start a second child for
/// the same id.
pub struct ChildEntity<E: EventSourcedEntity> {
    entity_id: EntityId,
    log: Arc<dyn EventLog>,
    config: InstanceConfig,
    handle: Mutex<EntityHandle<E>>,
    restart_lock: tokio::sync::Mutex<()>,
}

impl<E: EventSourcedEntity> ChildEntity<E> {
    pub fn spawn(entity_id: EntityId, log: Arc<dyn EventLog>, config: &EntityConfig) -> Self {
        let config = InstanceConfig {
            passivate_after: None,
            ..InstanceConfig::from(config)
        };
        let handle = spawn_instance::<E>(entity_id.clone(), log.clone(), config.clone());
        Self {
            entity_id,
            log,
            config,
            handle: Mutex::new(handle),
            restart_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    pub fn is_alive(&self) -> bool {
        self.current().is_alive()
    }

    pub async fn ask(&self, command: E::Command) -> Result<E::Reply, AskError> {
        let handle = self.live_handle().await;
        match handle.enqueue(command).await {
            Ok(pending) => pending.wait().await,
            // Stopped between the check and the send; one restart, then give up.
            Err(command) => self.live_handle().await.ask(command).await,
        }
    }

    pub async fn ask_with_timeout(&self, command: E::Command, timeout: Duration) -> Result<E::Reply, AskError> {
        tokio::time::timeout(timeout, self.ask(command))
            .await
            .unwrap_or_else(|_elapsed| {
                Err(AskError::AskTimeout {
                    entity_type: E::ENTITY_TYPE.to_string(),
                    entity_id: self.entity_id.clone(),
                    timeout,
                    diagnostics: None,
                })
            })
    }

    /// Stop after the queued commands and wait for the instance to finish.
    pub async fn stop(self) {
        self.current().stop().await;
    }

    fn current(&self) -> EntityHandle<E> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    async fn live_handle(&self) -> EntityHandle<E> {
        let current = self.current();
        if current.is_alive() {
            return current;
        }
        let _guard = self.restart_lock.lock().await;
        let current = self.current();
        if current.is_alive() {
            return current;
        }
        current.wait_terminated().await;
        info!(entity_type = E::ENTITY_TYPE, entity_id = %self.entity_id, "restarting child entity");
        let fresh = spawn_instance::<E>(self.entity_id.clone(), self.log.clone(), self.config.clone());
        *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = fresh.clone();
        fresh
    }
}

impl<E: EventSourcedEntity> std::fmt::Debug for ChildEntity<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ChildEntity").field(&self.current()).finish()
    }
}
