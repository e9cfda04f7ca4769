//! Projection worker reconciler.
//!
//! Every registered [`TagProcessor`] gets one worker per tag. Callers only
//! change a worker's *requested* status; a control loop drives the
//! *observed* status toward it by spawning and stopping [`TagRunner`]s.
//! Status reads are eventually consistent.
//!
//! Workers are placed on the same ring as entities (key
//! `"{projection}|{tag}"`). When membership changes, only workers whose
//! owner moved are stopped and started again, so at most one runner per tag
//! is ever live.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use keel_events::AggregateEventTag;

use crate::config::ReconcilerConfig;
use crate::entity::{NodeId, Placement};
use crate::projection::supervisor::shutdown_requested;
use crate::projection::{TagProcessor, TagRunner};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkerStatus {
    Started,
    Stopped,
}

/// Reported state of one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionWorker {
    /// `"{projection}-{tag}"`.
    pub name: String,
    pub tag: AggregateEventTag,
    pub requested: WorkerStatus,
    pub observed: WorkerStatus,
    /// Node the running worker was placed on; `None` while stopped.
    pub node: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionState {
    pub name: String,
    pub workers: Vec<ProjectionWorker>,
}

impl ProjectionState {
    pub fn worker(&self, tag: &AggregateEventTag) -> Option<&ProjectionWorker> {
        self.workers.iter().find(|w| &w.tag == tag)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcilerError {
    #[error("projection '{0}' is already registered")]
    DuplicateProjection(String),

    #[error("unknown projection '{0}'")]
    UnknownProjection(String),

    #[error("projection '{projection}' has no worker for tag '{tag}'")]
    UnknownWorker {
        projection: String,
        tag: AggregateEventTag,
    },

    #[error("worker coordinator is shut down")]
    ShutDown,
}

pub fn worker_placement_key(projection: &str, tag: &AggregateEventTag) -> String {
    format!("{projection}|{tag}")
}

struct WorkerSlot {
    tag: AggregateEventTag,
    requested: WorkerStatus,
    observed: WorkerStatus,
    node: Option<NodeId>,
    runner: Option<TagRunner>,
}

struct RegisteredProjection {
    processor: Arc<dyn TagProcessor>,
    workers: Vec<WorkerSlot>,
}

struct CoordinatorInner {
    placement: Placement,
    tick: Duration,
    projections: Mutex<Vec<RegisteredProjection>>,
    wake: Notify,
}

/// Owns the control loop; dropping it without [`shutdown`](Self::shutdown)
/// leaves the runners to the runtime.
pub struct WorkerCoordinator {
    inner: Arc<CoordinatorInner>,
    stop: watch::Sender<bool>,
    control_loop: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for WorkerCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerCoordinator")
            .field("placement_version", &self.inner.placement.current().version())
            .field("tick", &self.inner.tick)
            .finish()
    }
}

impl WorkerCoordinator {
    /// Start the control loop. Must be called inside a tokio runtime.
    pub fn new(config: &ReconcilerConfig, placement: Placement) -> Self {
        let inner = Arc::new(CoordinatorInner {
            placement,
            tick: config.tick,
            projections: Mutex::new(Vec::new()),
            wake: Notify::new(),
        });
        let (stop, shutdown) = watch::channel(false);
        let task = tokio::spawn(control_loop(inner.clone(), shutdown));
        Self {
            inner,
            stop,
            control_loop: Mutex::new(Some(task)),
        }
    }

    /// Add a processor with one worker per tag, all requested as `initial`.
    pub fn register(
        &self,
        processor: Arc<dyn TagProcessor>,
        initial: WorkerStatus,
    ) -> Result<(), ReconcilerError> {
        self.ensure_running()?;
        {
            let mut projections = self.inner.lock();
            if projections.iter().any(|p| p.processor.name() == processor.name()) {
                return Err(ReconcilerError::DuplicateProjection(processor.name().to_string()));
            }
            let workers = processor
                .tags()
                .iter()
                .map(|tag| WorkerSlot {
                    tag: tag.clone(),
                    requested: initial,
                    observed: WorkerStatus::Stopped,
                    node: None,
                    runner: None,
                })
                .collect();
            info!(projection = %processor.name(), tags = processor.tags().len(), ?initial, "projection registered");
            projections.push(RegisteredProjection { processor, workers });
        }
        self.inner.wake.notify_one();
        Ok(())
    }

    pub fn get_status(&self) -> Vec<ProjectionState> {
        self.inner
            .lock()
            .iter()
            .map(|p| ProjectionState {
                name: p.processor.name().to_string(),
                workers: p
                    .workers
                    .iter()
                    .map(|w| ProjectionWorker {
                        name: format!("{}-{}", p.processor.name(), w.tag),
                        tag: w.tag.clone(),
                        requested: w.requested,
                        observed: w.observed,
                        node: w.node.clone(),
                    })
                    .collect(),
            })
            .collect()
    }

    pub fn start_worker(&self, projection: &str, tag: &AggregateEventTag) -> Result<(), ReconcilerError> {
        self.request(projection, Some(tag), WorkerStatus::Started)
    }

    pub fn stop_worker(&self, projection: &str, tag: &AggregateEventTag) -> Result<(), ReconcilerError> {
        self.request(projection, Some(tag), WorkerStatus::Stopped)
    }

    pub fn start_all_workers(&self, projection: &str) -> Result<(), ReconcilerError> {
        self.request(projection, None, WorkerStatus::Started)
    }

    pub fn stop_all_workers(&self, projection: &str) -> Result<(), ReconcilerError> {
        self.request(projection, None, WorkerStatus::Stopped)
    }

    /// Stop the control loop and every running worker.
    pub async fn shutdown(&self) {
        let _ = self.stop.send(true);
        let task = self
            .control_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(error = %err, "worker reconciler loop ended abnormally");
            }
        }
    }

    fn ensure_running(&self) -> Result<(), ReconcilerError> {
        if *self.stop.borrow() {
            return Err(ReconcilerError::ShutDown);
        }
        Ok(())
    }

    fn request(
        &self,
        projection: &str,
        tag: Option<&AggregateEventTag>,
        status: WorkerStatus,
    ) -> Result<(), ReconcilerError> {
        self.ensure_running()?;
        {
            let mut projections = self.inner.lock();
            let registered = projections
                .iter_mut()
                .find(|p| p.processor.name() == projection)
                .ok_or_else(|| ReconcilerError::UnknownProjection(projection.to_string()))?;
            match tag {
                Some(tag) => {
                    let slot = registered
                        .workers
                        .iter_mut()
                        .find(|w| &w.tag == tag)
                        .ok_or_else(|| ReconcilerError::UnknownWorker {
                            projection: projection.to_string(),
                            tag: tag.clone(),
                        })?;
                    slot.requested = status;
                }
                None => registered.workers.iter_mut().for_each(|w| w.requested = status),
            }
        }
        debug!(projection, tag = ?tag.map(|t| t.as_str()), ?status, "worker status requested");
        self.inner.wake.notify_one();
        Ok(())
    }
}

impl CoordinatorInner {
    fn lock(&self) -> MutexGuard<'_, Vec<RegisteredProjection>> {
        self.projections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn reconcile(&self) {
        let table = self.placement.current();

        // Runners are stopped outside the lock; a replacement is only
        // spawned once the old runner has finished.
        let mut stopping = Vec::new();
        for registered in self.lock().iter_mut() {
            let name = registered.processor.name().to_string();
            for slot in registered.workers.iter_mut() {
                let Some(runner) = slot.runner.as_ref() else {
                    continue;
                };
                if runner.is_finished() {
                    warn!(projection = %name, tag = %slot.tag, "worker ended unexpectedly");
                    slot.runner = None;
                    continue;
                }
                let owner = table.owner(&worker_placement_key(&name, &slot.tag));
                let moved = slot.node.as_ref() != Some(owner);
                if slot.requested == WorkerStatus::Stopped || moved {
                    if moved {
                        info!(projection = %name, tag = %slot.tag, owner = %owner, "worker owner moved");
                    }
                    stopping.extend(slot.runner.take());
                }
            }
        }
        if !stopping.is_empty() {
            join_all(stopping.into_iter().map(TagRunner::stop)).await;
        }

        let table = self.placement.current();
        for registered in self.lock().iter_mut() {
            let name = registered.processor.name().to_string();
            for slot in registered.workers.iter_mut().filter(|w| w.runner.is_none()) {
                match slot.requested {
                    WorkerStatus::Started => {
                        let owner = table.owner(&worker_placement_key(&name, &slot.tag)).clone();
                        info!(projection = %name, tag = %slot.tag, node = %owner, "starting worker");
                        slot.runner = Some(TagRunner::spawn(registered.processor.clone(), slot.tag.clone()));
                        slot.node = Some(owner);
                        slot.observed = WorkerStatus::Started;
                    }
                    WorkerStatus::Stopped => {
                        if slot.observed == WorkerStatus::Started {
                            info!(projection = %name, tag = %slot.tag, "worker stopped");
                        }
                        slot.node = None;
                        slot.observed = WorkerStatus::Stopped;
                    }
                }
            }
        }
    }

    async fn stop_all(&self) {
        let runners: Vec<TagRunner> = self
            .lock()
            .iter_mut()
            .flat_map(|p| p.workers.iter_mut())
            .filter_map(|slot| {
                slot.observed = WorkerStatus::Stopped;
                slot.node = None;
                slot.runner.take()
            })
            .collect();
        join_all(runners.into_iter().map(TagRunner::stop)).await;
    }
}

async fn control_loop(inner: Arc<CoordinatorInner>, mut shutdown: watch::Receiver<bool>) {
    let mut membership = inner.placement.subscribe();
    let mut ticker = tokio::time::interval(inner.tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        inner.reconcile().await;
        tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => break,
            // The sender lives in `inner.placement`, so this never errors.
            _ = membership.changed() => {
                debug!(version = membership.borrow_and_update().version(), "placement changed");
            }
            _ = inner.wake.notified() => {}
            _ = ticker.tick() => {}
        }
    }

    inner.stop_all().await;
    info!("worker reconciler stopped");
}
