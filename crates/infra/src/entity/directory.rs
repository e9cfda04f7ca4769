//! Entity directory: the registry of entity types and the router from
//! (type, id) to the single live instance.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use keel_core::{EntityId, PersistentEntity};

use super::EventSourcedEntity;
use super::error::{AskError, DirectoryError};
use super::failure::{AskContext, AskFailureHandler, PassThroughFailureHandler, TracingFailureHandler};
use super::instance::{EntityHandle, InstanceConfig, spawn_instance, wait_for_termination};
use super::placement::{NodeId, Placement, PlacementTable};
use crate::config::KeelConfig;
use crate::event_log::EventLog;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct InstanceKey {
    entity_type: &'static str,
    entity_id: EntityId,
}

impl InstanceKey {
    fn new(entity_type: &'static str, entity_id: EntityId) -> Self {
        Self {
            entity_type,
            entity_id,
        }
    }

    fn placement_key(&self) -> String {
        format!("{}|{}", self.entity_type, self.entity_id)
    }
}

#[async_trait]
trait LiveHandle: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn is_alive(&self) -> bool;
    async fn stop(&self);
}

#[async_trait]
impl<E: PersistentEntity> LiveHandle for EntityHandle<E> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn is_alive(&self) -> bool {
        EntityHandle::is_alive(self)
    }

    async fn stop(&self) {
        EntityHandle::stop(self).await
    }
}

struct LiveInstance {
    handle: Arc<dyn LiveHandle>,
    owner: NodeId,
    /// Distinguishes successive instances of one key.
    generation: u64,
}

struct DirectoryInner {
    log: Arc<dyn EventLog>,
    instance_config: InstanceConfig,
    registered: HashMap<TypeId, &'static str>,
    placement: Placement,
    failure_handler: Arc<dyn AskFailureHandler>,
    instances: Mutex<HashMap<InstanceKey, LiveInstance>>,
    next_generation: AtomicU64,
    // Serializes spawning and stopping so an id never has two live instances.
    spawn_lock: tokio::sync::Mutex<()>,
}

impl DirectoryInner {
    fn instances(&self) -> MutexGuard<'_, HashMap<InstanceKey, LiveInstance>> {
        self.instances.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop the entry for `key` if it still belongs to `generation`.
    fn forget(&self, key: &InstanceKey, generation: u64) {
        let mut instances = self.instances();
        if instances.get(key).is_some_and(|live| live.generation == generation) {
            instances.remove(key);
        }
    }
}

/// Builder for [`EntityDirectory`]; the set of entity types is fixed by
/// [`build`](Self::build).
pub struct EntityDirectoryBuilder {
    log: Arc<dyn EventLog>,
    config: KeelConfig,
    registered: HashMap<TypeId, &'static str>,
    placement: Option<Placement>,
    failure_handler: Option<Arc<dyn AskFailureHandler>>,
}

impl EntityDirectoryBuilder {
    /// Register an entity type under its `ENTITY_TYPE` name.
    pub fn register<E: EventSourcedEntity>(mut self) -> Result<Self, DirectoryError> {
        let name = E::ENTITY_TYPE;
        if name.trim().is_empty() {
            return Err(DirectoryError::EmptyEntityType);
        }
        if self.registered.values().any(|existing| *existing == name) {
            return Err(DirectoryError::DuplicateEntityType(name.to_string()));
        }
        self.registered.insert(TypeId::of::<E>(), name);
        Ok(self)
    }

    /// Share a placement with other components (e.g. the worker reconciler).
    pub fn placement(mut self, placement: Placement) -> Self {
        self.placement = Some(placement);
        self
    }

    pub fn failure_handler(mut self, handler: Arc<dyn AskFailureHandler>) -> Self {
        self.failure_handler = Some(handler);
        self
    }

    pub fn build(self) -> EntityDirectory {
        let directory_config = &self.config.directory;
        let failure_handler = self.failure_handler.unwrap_or_else(|| {
            if directory_config.log_cluster_state_on_timeout || directory_config.log_command_payload_on_timeout {
                Arc::new(TracingFailureHandler::from_config(directory_config))
            } else {
                Arc::new(PassThroughFailureHandler)
            }
        });
        let placement = self
            .placement
            .unwrap_or_else(|| Placement::single(NodeId::new("local")));

        info!(
            entity_types = ?self.registered.values().collect::<Vec<_>>(),
            placement_version = placement.current().version(),
            "entity directory ready"
        );

        EntityDirectory {
            ask_timeout: directory_config.ask_timeout,
            inner: Arc::new(DirectoryInner {
                log: self.log,
                instance_config: InstanceConfig::from(&self.config.entity),
                registered: self.registered,
                placement,
                failure_handler,
                instances: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                spawn_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }
}

/// Routes commands to entity instances.
///
/// Cheap to clone. Instances are hosted in this process; the placement
/// records which member owns each id, and an owner change stops the old
/// instance before the next ask starts a new one.
#[derive(Clone)]
pub struct EntityDirectory {
    inner: Arc<DirectoryInner>,
    ask_timeout: Duration,
}

impl std::fmt::Debug for EntityDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityDirectory")
            .field("entity_types", &self.inner.registered.values().collect::<Vec<_>>())
            .field("ask_timeout", &self.ask_timeout)
            .field("live_instances", &self.live_instances())
            .finish()
    }
}

impl EntityDirectory {
    pub fn builder(log: Arc<dyn EventLog>, config: &KeelConfig) -> EntityDirectoryBuilder {
        EntityDirectoryBuilder {
            log,
            config: config.clone(),
            registered: HashMap::new(),
            placement: None,
            failure_handler: None,
        }
    }

    pub fn ask_timeout(&self) -> Duration {
        self.ask_timeout
    }

    /// Same directory, different default ask timeout.
    pub fn with_ask_timeout(&self, timeout: Duration) -> Self {
        Self {
            inner: self.inner.clone(),
            ask_timeout: timeout,
        }
    }

    pub fn placement(&self) -> &Placement {
        &self.inner.placement
    }

    pub fn live_instances(&self) -> usize {
        self.instances().values().filter(|l| l.handle.is_alive()).count()
    }

    pub fn entity_ref<E: EventSourcedEntity>(&self, entity_id: EntityId) -> Result<EntityRef<E>, DirectoryError> {
        self.check_registered::<E>()?;
        Ok(EntityRef {
            directory: self.clone(),
            entity_id,
            timeout: self.ask_timeout,
            _entity: PhantomData,
        })
    }

    /// Member the current placement assigns `entity_id` to.
    pub fn owner_of<E: EventSourcedEntity>(&self, entity_id: &EntityId) -> NodeId {
        let key = InstanceKey::new(E::ENTITY_TYPE, entity_id.clone());
        self.inner.placement.current().owner(&key.placement_key()).clone()
    }

    pub async fn ask<E: EventSourcedEntity>(
        &self,
        entity_id: &EntityId,
        command: E::Command,
    ) -> Result<E::Reply, AskError> {
        self.ask_with_timeout::<E>(entity_id, command, self.ask_timeout).await
    }

    /// Send `command` to the instance for `entity_id` and await its reply.
    ///
    /// On `AskTimeout` the command may or may not have been processed.
    pub async fn ask_with_timeout<E: EventSourcedEntity>(
        &self,
        entity_id: &EntityId,
        command: E::Command,
        timeout: Duration,
    ) -> Result<E::Reply, AskError> {
        self.check_registered::<E>()
            .map_err(|_| AskError::UnknownEntityType(E::ENTITY_TYPE.to_string()))?;

        let payload = self
            .inner
            .failure_handler
            .wants_command_payload()
            .then(|| format!("{command:?}"));
        let key = InstanceKey::new(E::ENTITY_TYPE, entity_id.clone());
        let table = self.inner.placement.current();
        let owner = table.owner(&key.placement_key()).clone();

        let outcome = tokio::time::timeout(timeout, self.deliver::<E>(&key, &owner, command)).await;
        let result = match outcome {
            Ok(result) => result,
            Err(_elapsed) => Err(AskError::AskTimeout {
                entity_type: E::ENTITY_TYPE.to_string(),
                entity_id: entity_id.clone(),
                timeout,
                diagnostics: None,
            }),
        };

        result.map_err(|error| {
            let context = AskContext {
                entity_type: E::ENTITY_TYPE,
                entity_id,
                command: payload.as_deref(),
                placement: &table,
                owner: &owner,
            };
            self.inner.failure_handler.on_failure(error, &context)
        })
    }

    /// Recompute placement for `members`; instances whose owner changed are
    /// stopped (and awaited) so the next ask restarts them on the new owner.
    pub async fn update_membership(&self, members: Vec<NodeId>) -> Result<Arc<PlacementTable>, DirectoryError> {
        let _guard = self.inner.spawn_lock.lock().await;
        let table = self.inner.placement.update_membership(members)?;

        let moved: Vec<LiveInstance> = {
            let mut instances = self.instances();
            let keys: Vec<InstanceKey> = instances
                .iter()
                .filter(|(key, live)| table.owner(&key.placement_key()) != &live.owner)
                .map(|(key, _)| key.clone())
                .collect();
            keys.iter().filter_map(|key| instances.remove(key)).collect()
        };
        for live in &moved {
            live.handle.stop().await;
        }

        info!(
            placement_version = table.version(),
            members = table.members().len(),
            moved = moved.len(),
            "membership updated"
        );
        Ok(table)
    }

    /// Stop every live instance.
    pub async fn shutdown(&self) {
        let _guard = self.inner.spawn_lock.lock().await;
        let all: Vec<LiveInstance> = self.instances().drain().map(|(_, live)| live).collect();
        for live in &all {
            live.handle.stop().await;
        }
        info!(stopped = all.len(), "entity directory shut down");
    }

    fn check_registered<E: EventSourcedEntity>(&self) -> Result<(), DirectoryError> {
        match self.inner.registered.get(&TypeId::of::<E>()) {
            Some(_) => Ok(()),
            None => Err(DirectoryError::UnknownEntityType(E::ENTITY_TYPE.to_string())),
        }
    }

    fn instances(&self) -> MutexGuard<'_, HashMap<InstanceKey, LiveInstance>> {
        self.inner.instances()
    }

    async fn deliver<E: EventSourcedEntity>(
        &self,
        key: &InstanceKey,
        owner: &NodeId,
        command: E::Command,
    ) -> Result<E::Reply, AskError> {
        let mut command = command;
        loop {
            let handle = self.instance::<E>(key, owner).await;
            match handle.enqueue(command).await {
                Ok(pending) => return pending.wait().await,
                // Passivated between lookup and send; the command was never
                // accepted, so start a fresh instance and retry.
                Err(returned) => {
                    debug!(entity_id = %key.entity_id, "instance stopped before accepting command, restarting");
                    command = returned;
                }
            }
        }
    }

    async fn instance<E: EventSourcedEntity>(&self, key: &InstanceKey, owner: &NodeId) -> EntityHandle<E> {
        if let Some(handle) = self.reusable::<E>(key, owner) {
            return handle;
        }

        let _guard = self.inner.spawn_lock.lock().await;
        let stale = {
            let instances = self.instances();
            if let Some(handle) = Self::reusable_in::<E>(&instances, key, owner) {
                return handle;
            }
            instances.get(key).map(|live| (live.handle.clone(), live.owner.clone()))
        };

        // The stale entry stays in the map until it has stopped: if this ask
        // is cancelled mid-stop, the next one finds it and finishes the job.
        if let Some((stale, from)) = stale {
            if &from != owner {
                info!(entity_id = %key.entity_id, from = %from, to = %owner, "moving entity");
            }
            stale.stop().await;
        }

        let handle = spawn_instance::<E>(
            key.entity_id.clone(),
            self.inner.log.clone(),
            self.inner.instance_config.clone(),
        );
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        self.instances().insert(
            key.clone(),
            LiveInstance {
                handle: Arc::new(handle.clone()),
                owner: owner.clone(),
                generation,
            },
        );
        self.forget_on_exit(key.clone(), generation, &handle);
        handle
    }

    /// Untrack the instance once it terminates (passivation, failure, stop).
    fn forget_on_exit<E: PersistentEntity>(&self, key: InstanceKey, generation: u64, handle: &EntityHandle<E>) {
        let inner = Arc::downgrade(&self.inner);
        let terminated = handle.termination();
        tokio::spawn(async move {
            wait_for_termination(terminated).await;
            if let Some(inner) = inner.upgrade() {
                inner.forget(&key, generation);
            }
        });
    }

    fn reusable<E: EventSourcedEntity>(&self, key: &InstanceKey, owner: &NodeId) -> Option<EntityHandle<E>> {
        Self::reusable_in::<E>(&self.instances(), key, owner)
    }

    fn reusable_in<E: EventSourcedEntity>(
        instances: &HashMap<InstanceKey, LiveInstance>,
        key: &InstanceKey,
        owner: &NodeId,
    ) -> Option<EntityHandle<E>> {
        instances
            .get(key)
            .filter(|live| live.handle.is_alive() && &live.owner == owner)
            .and_then(|live| live.handle.as_any().downcast_ref::<EntityHandle<E>>())
            .cloned()
    }
}

/// Handle on one entity id of one registered type.
pub struct EntityRef<E> {
    directory: EntityDirectory,
    entity_id: EntityId,
    timeout: Duration,
    _entity: PhantomData<fn() -> E>,
}

impl<E> Clone for EntityRef<E> {
    fn clone(&self) -> Self {
        Self {
            directory: self.directory.clone(),
            entity_id: self.entity_id.clone(),
            timeout: self.timeout,
            _entity: PhantomData,
        }
    }
}

impl<E: PersistentEntity> std::fmt::Debug for EntityRef<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityRef")
            .field("entity_type", &E::ENTITY_TYPE)
            .field("entity_id", &self.entity_id)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl<E: EventSourcedEntity> EntityRef<E> {
    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    pub fn ask_timeout(&self) -> Duration {
        self.timeout
    }

    pub fn with_ask_timeout(&self, timeout: Duration) -> Self {
        Self {
            timeout,
            ..self.clone()
        }
    }

    pub async fn ask(&self, command: E::Command) -> Result<E::Reply, AskError> {
        self.directory
            .ask_with_timeout::<E>(&self.entity_id, command, self.timeout)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DirectoryConfig;
    use crate::event_log::InMemoryEventLog;
    use crate::test_entity::{TestCommand, TestEntity, TestEvent, TestReply, TestState};
    use crate::testkit::FailingEventLog;
    use keel_core::Behavior;

    struct Unnamed;

    impl PersistentEntity for Unnamed {
        type Command = TestCommand;
        type Event = TestEvent;
        type State = TestState;
        type Reply = TestReply;

        const ENTITY_TYPE: &'static str = "";

        fn initial_behavior(_snapshot: Option<TestState>) -> Behavior<Self> {
            Behavior::<Self>::builder(TestState::default()).build()
        }
    }

    struct Impostor;

    impl PersistentEntity for Impostor {
        type Command = TestCommand;
        type Event = TestEvent;
        type State = TestState;
        type Reply = TestReply;

        const ENTITY_TYPE: &'static str = "test";

        fn initial_behavior(_snapshot: Option<TestState>) -> Behavior<Self> {
            Behavior::<Self>::builder(TestState::default()).build()
        }
    }

    fn id(s: &str) -> EntityId {
        EntityId::new(s).unwrap()
    }

    fn directory(log: Arc<dyn EventLog>) -> EntityDirectory {
        EntityDirectory::builder(log, &KeelConfig::default())
            .register::<TestEntity>()
            .unwrap()
            .build()
    }

    async fn elements(directory: &EntityDirectory, entity: &str) -> Vec<String> {
        match directory.ask::<TestEntity>(&id(entity), TestCommand::Get).await.unwrap() {
            TestReply::State(state) => state.elements,
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn registration_rejects_empty_and_duplicate_names() {
        let log: Arc<dyn EventLog> = Arc::new(InMemoryEventLog::new());
        let builder = EntityDirectory::builder(log.clone(), &KeelConfig::default());
        assert_eq!(
            builder.register::<Unnamed>().err(),
            Some(DirectoryError::EmptyEntityType)
        );

        let err = EntityDirectory::builder(log, &KeelConfig::default())
            .register::<TestEntity>()
            .unwrap()
            .register::<Impostor>()
            .err();
        assert_eq!(err, Some(DirectoryError::DuplicateEntityType("test".to_string())));
    }

    #[tokio::test]
    async fn unregistered_types_are_rejected() {
        let log: Arc<dyn EventLog> = Arc::new(InMemoryEventLog::new());
        let directory = EntityDirectory::builder(log, &KeelConfig::default()).build();

        assert!(matches!(
            directory.entity_ref::<TestEntity>(id("1")),
            Err(DirectoryError::UnknownEntityType(_))
        ));
        assert!(matches!(
            directory.ask::<TestEntity>(&id("1"), TestCommand::Get).await,
            Err(AskError::UnknownEntityType(_))
        ));
    }

    #[tokio::test]
    async fn asks_for_one_id_share_one_instance() {
        let directory = directory(Arc::new(InMemoryEventLog::new()));
        let entity = directory.entity_ref::<TestEntity>(id("1")).unwrap();

        entity.ask(TestCommand::add("a")).await.unwrap();
        entity.ask(TestCommand::add("b")).await.unwrap();
        directory.ask::<TestEntity>(&id("2"), TestCommand::add("z")).await.unwrap();

        assert_eq!(elements(&directory, "1").await, vec!["A", "B"]);
        assert_eq!(elements(&directory, "2").await, vec!["Z"]);
        assert_eq!(directory.live_instances(), 2);
    }

    #[tokio::test]
    async fn concurrent_asks_are_serialized() {
        let log = Arc::new(InMemoryEventLog::new());
        let directory = directory(log.clone());

        let tasks: Vec<_> = (0..40)
            .map(|i| {
                let directory = directory.clone();
                tokio::spawn(async move {
                    directory
                        .ask::<TestEntity>(&id("1"), TestCommand::add(format!("e{i}")))
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(elements(&directory, "1").await.len(), 40);
        let stored = log.load("test", &id("1"), 0).await.unwrap();
        let seqs: Vec<u64> = stored.iter().map(|e| e.sequence_nr).collect();
        assert_eq!(seqs, (1..=40).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn timed_out_command_still_takes_effect() {
        let log = Arc::new(FailingEventLog::new(InMemoryEventLog::new()));
        log.set_append_delay(Duration::from_millis(50));
        let directory = directory(log.clone());

        let err = directory
            .entity_ref::<TestEntity>(id("1"))
            .unwrap()
            .with_ask_timeout(Duration::from_millis(1))
            .ask(TestCommand::add("late"))
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        assert_eq!(elements(&directory, "1").await, vec!["LATE"]);
    }

    #[tokio::test]
    async fn timeout_diagnostics_follow_configuration() {
        let log = Arc::new(FailingEventLog::new(InMemoryEventLog::new()));
        log.set_append_delay(Duration::from_millis(50));
        let config = KeelConfig::default().with_directory(
            DirectoryConfig::default()
                .with_log_cluster_state_on_timeout(true)
                .with_log_command_payload_on_timeout(true),
        );
        let directory = EntityDirectory::builder(log, &config)
            .register::<TestEntity>()
            .unwrap()
            .build()
            .with_ask_timeout(Duration::from_millis(1));

        let err = directory
            .ask::<TestEntity>(&id("1"), TestCommand::add("x"))
            .await
            .unwrap_err();
        let AskError::AskTimeout { diagnostics: Some(text), .. } = err else {
            panic!("expected enriched timeout, got {err:?}");
        };
        assert!(text.contains("placement v1"));
        assert!(text.contains("Add"));
    }

    #[tokio::test]
    async fn passivated_instances_come_back_on_demand() {
        let log: Arc<dyn EventLog> = Arc::new(InMemoryEventLog::new());
        let mut config = KeelConfig::default();
        config.entity.passivate_after = Duration::from_millis(20);
        let directory = EntityDirectory::builder(log, &config)
            .register::<TestEntity>()
            .unwrap()
            .build();

        directory.ask::<TestEntity>(&id("1"), TestCommand::add("a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(directory.live_instances(), 0);

        directory.ask::<TestEntity>(&id("1"), TestCommand::add("b")).await.unwrap();
        assert_eq!(elements(&directory, "1").await, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn passivated_instances_are_untracked() {
        let log: Arc<dyn EventLog> = Arc::new(InMemoryEventLog::new());
        let mut config = KeelConfig::default();
        config.entity.passivate_after = Duration::from_millis(10);
        let directory = EntityDirectory::builder(log, &config)
            .register::<TestEntity>()
            .unwrap()
            .build();

        for i in 0..200 {
            directory
                .ask::<TestEntity>(&id(&format!("e{i}")), TestCommand::add("a"))
                .await
                .unwrap();
        }
        tokio::time::timeout(Duration::from_secs(2), async {
            while !directory.instances().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("passivated instances still tracked");
        assert_eq!(directory.live_instances(), 0);

        assert_eq!(elements(&directory, "e7").await, vec!["A"]);
        assert_eq!(directory.instances().len(), 1);
    }

    #[tokio::test]
    async fn lost_append_ack_is_recovered_on_the_next_ask() {
        let log = Arc::new(FailingEventLog::new(InMemoryEventLog::new()));
        let directory = directory(log.clone());

        log.lose_next_append_ack();
        let err = directory
            .ask::<TestEntity>(&id("1"), TestCommand::add("a"))
            .await
            .unwrap_err();
        assert!(matches!(err, AskError::PersistenceFailure(_)));

        directory.ask::<TestEntity>(&id("1"), TestCommand::add("b")).await.unwrap();
        assert_eq!(elements(&directory, "1").await, vec!["A", "B"]);
        let stored = log.load("test", &id("1"), 0).await.unwrap();
        assert_eq!(stored.iter().map(|e| e.sequence_nr).collect::<Vec<_>>(), [1, 2]);
    }

    #[tokio::test]
    async fn cancelled_move_keeps_the_old_instance_tracked() {
        let placement = Placement::new(vec![NodeId::new("n1")], 16).unwrap();
        let log = Arc::new(FailingEventLog::new(InMemoryEventLog::new()));
        let directory = EntityDirectory::builder(log.clone(), &KeelConfig::default())
            .register::<TestEntity>()
            .unwrap()
            .placement(placement.clone())
            .build();

        let grown = PlacementTable::new(vec![NodeId::new("n1"), NodeId::new("n2")], 16).unwrap();
        let moving = (0..100)
            .map(|i| format!("e{i}"))
            .find(|e| grown.owner(&format!("test|{e}")).as_str() == "n2")
            .expect("some id moves to n2");
        let key = InstanceKey::new("test", id(&moving));

        // Keep the n1 instance busy so stopping it takes a while.
        log.set_append_delay(Duration::from_millis(150));
        let busy = {
            let directory = directory.clone();
            let entity = id(&moving);
            tokio::spawn(async move { directory.ask::<TestEntity>(&entity, TestCommand::add("a")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        placement.update_membership(vec![NodeId::new("n1"), NodeId::new("n2")]).unwrap();

        let err = directory
            .ask_with_timeout::<TestEntity>(&id(&moving), TestCommand::Get, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(directory.instances().get(&key).map(|l| l.owner.as_str().to_string()), Some("n1".to_string()));

        busy.await.unwrap().unwrap();
        log.set_append_delay(Duration::ZERO);
        assert_eq!(elements(&directory, &moving).await, vec!["A"]);
        assert_eq!(directory.instances().get(&key).map(|l| l.owner.as_str().to_string()), Some("n2".to_string()));
        assert_eq!(directory.live_instances(), 1);
    }

    #[tokio::test]
    async fn membership_change_moves_only_reassigned_instances() {
        let placement = Placement::new(vec![NodeId::new("n1")], 16).unwrap();
        let log: Arc<dyn EventLog> = Arc::new(InMemoryEventLog::new());
        let directory = EntityDirectory::builder(log, &KeelConfig::default())
            .register::<TestEntity>()
            .unwrap()
            .placement(placement)
            .build();

        let ids: Vec<String> = (0..20).map(|i| format!("e{i}")).collect();
        for entity in &ids {
            directory.ask::<TestEntity>(&id(entity), TestCommand::add(entity.as_str())).await.unwrap();
        }
        assert_eq!(directory.live_instances(), 20);

        let table = directory
            .update_membership(vec![NodeId::new("n1"), NodeId::new("n2")])
            .await
            .unwrap();
        assert_eq!(table.version(), 2);

        let stayed = ids
            .iter()
            .filter(|e| directory.owner_of::<TestEntity>(&id(e)).as_str() == "n1")
            .count();
        assert_eq!(directory.live_instances(), stayed);

        for entity in &ids {
            assert_eq!(elements(&directory, entity).await, vec![entity.to_uppercase()]);
        }
        assert!(
            directory
                .update_membership(vec![])
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn shutdown_stops_everything() {
        let directory = directory(Arc::new(InMemoryEventLog::new()));
        directory.ask::<TestEntity>(&id("1"), TestCommand::add("a")).await.unwrap();
        directory.shutdown().await;
        assert_eq!(directory.live_instances(), 0);
    }
}
