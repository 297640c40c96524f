use crate::runtime::hooks::{await_hook, HookDecision};
use crate::runtime::protocol::{FetchFailure, FetchProtocol};
use crate::runtime::telemetry::Telemetry;
use anyhow::{bail, Result};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::shared::{FetchActivityTracker, WorkerShared};
use super::types::{Completion, CompletionSender, SharedDispatchReceiver};

pub struct Worker<P: FetchProtocol> {
    pub id: usize,
    pub(super) protocol: Arc<RwLock<P>>,
    pub(super) intake: SharedDispatchReceiver<P::Location>,
    pub(super) completion_tx: CompletionSender<P::Location, P::Content>,
    pub(super) shutdown: CancellationToken,
    pub(super) telemetry: Arc<Telemetry>,
    pub(super) activity: Arc<FetchActivityTracker>,
}

impl<P: FetchProtocol> Worker<P> {
    pub fn new(id: usize, shutdown: CancellationToken, shared: WorkerShared<P>) -> Self {
        let WorkerShared {
            protocol,
            intake,
            completion_tx,
            telemetry,
            activity,
        } = shared;

        Self {
            id,
            protocol,
            intake,
            completion_tx,
            shutdown,
            telemetry,
            activity,
        }
    }

    #[tracing::instrument(name = "worker", skip_all, fields(worker = self.id))]
    pub async fn run(self) -> Result<()> {
        tracing::info!(worker = self.id, "worker task started");

        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    tracing::info!(worker = self.id, "shutdown requested; exiting worker loop");
                    break;
                }
                location = self.next_location() => location,
            };

            let Some(location) = next else {
                tracing::debug!(worker = self.id, "location intake closed");
                break;
            };

            let completion = self.fetch_location(location).await;
            let cancelled = matches!(&completion.outcome, Err(failure) if failure.is_cancelled());

            if let Err(err) = self.completion_tx.send(completion).await {
                if self.shutdown.is_cancelled() {
                    break;
                }
                bail!(
                    "coordinator stopped before the completion for {:?} was delivered",
                    err.0.location
                );
            }

            if cancelled {
                break;
            }
        }

        tracing::info!(worker = self.id, "worker task exited");
        Ok(())
    }

    async fn next_location(&self) -> Option<P::Location> {
        self.intake.lock().await.recv().await
    }

    /// Runs the fetch capability for one location and always yields a completion,
    /// including when the fetch fails or is interrupted by shutdown.
    pub(super) async fn fetch_location(
        &self,
        location: P::Location,
    ) -> Completion<P::Location, P::Content> {
        let _activity_guard = self.activity.enter();
        tracing::debug!(worker = self.id, location = ?location, "fetching location");

        let fetch = {
            let protocol = self.protocol.read().await;
            protocol.fetch(location.clone())
        };

        match await_hook(fetch, &self.shutdown).await {
            HookDecision::Finished(Ok(content)) => Completion::new(location, Ok(Arc::new(content))),
            HookDecision::Finished(Err(error)) => {
                self.telemetry.record_fetch_failure();
                let failure = FetchFailure::failed(&location, error);
                tracing::warn!(
                    worker = self.id,
                    error = %failure,
                    "fetch failed; notifying waiting references"
                );
                Completion::new(location, Err(failure))
            }
            HookDecision::Cancelled => {
                self.telemetry.record_cancelled_fetch();
                tracing::debug!(worker = self.id, location = ?location, "fetch abandoned on shutdown");
                let failure = FetchFailure::cancelled(&location);
                Completion::new(location, Err(failure))
            }
        }
    }
}
