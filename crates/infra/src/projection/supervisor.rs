//! Restart loop around one tag of a processor.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{Instrument, info, info_span, warn};

use keel_events::AggregateEventTag;

use super::error::ProjectionError;
use crate::restart::RestartBackoff;

/// Something that consumes tags one stream at a time: a read side or a
/// topic producer.
#[async_trait]
pub trait TagProcessor: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn tags(&self) -> &[AggregateEventTag];

    fn backoff(&self) -> RestartBackoff;

    /// Run `tag` from its committed offset. Returns `Ok` once `shutdown`
    /// flips, `Err` when the stream fails.
    async fn run_tag(
        &self,
        tag: &AggregateEventTag,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), ProjectionError>;
}

/// Resolves once shutdown is requested or the sender is gone.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Run `tag` until shutdown, restarting after failures with the processor's
/// backoff. The failure count resets once a run outlives the maximum delay.
pub async fn supervise(
    processor: Arc<dyn TagProcessor>,
    tag: AggregateEventTag,
    mut shutdown: watch::Receiver<bool>,
) {
    let backoff = processor.backoff();
    let mut failures = 0u32;

    loop {
        if *shutdown.borrow() {
            break;
        }
        let started = Instant::now();
        match processor.run_tag(&tag, shutdown.clone()).await {
            Ok(()) => break,
            Err(err) => {
                failures = if started.elapsed() >= backoff.max { 1 } else { failures + 1 };
                let delay = backoff.delay_for_attempt(failures);
                warn!(
                    error = %err,
                    failures,
                    delay_ms = delay.as_millis() as u64,
                    "tag stream failed, restarting from last committed offset"
                );
                tokio::select! {
                    _ = shutdown_requested(&mut shutdown) => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
    info!("tag stream stopped");
}

/// A supervised tag stream running on its own task.
#[derive(Debug)]
pub struct TagRunner {
    tag: AggregateEventTag,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl TagRunner {
    pub fn spawn(processor: Arc<dyn TagProcessor>, tag: AggregateEventTag) -> Self {
        let (stop, shutdown) = watch::channel(false);
        let span = info_span!("tag_stream", projection = %processor.name(), tag = %tag);
        let task = tokio::spawn(supervise(processor, tag.clone(), shutdown).instrument(span));
        Self { tag, stop, task }
    }

    pub fn tag(&self) -> &AggregateEventTag {
        &self.tag
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Request shutdown and wait for the current event to finish.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(err) = self.task.await {
            warn!(tag = %self.tag, error = %err, "tag stream task ended abnormally");
        }
    }
}
