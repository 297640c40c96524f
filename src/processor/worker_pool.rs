//! Worker pool orchestration for `CoalescingFetcher`.
//!
//! Owns worker creation and panic containment.

use crate::runtime::fatal::FatalErrorHandler;
use crate::runtime::protocol::FetchProtocol;
use crate::runtime::telemetry::Telemetry;
use crate::worker::{
    CompletionSender, FetchActivityTracker, SharedDispatchReceiver, Worker, WorkerShared,
    WorkerSharedParams,
};
use futures::FutureExt;
use std::{any::Any, sync::Arc};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub(crate) struct WorkerPool<P: FetchProtocol> {
    worker_count: usize,
    protocol: Arc<RwLock<P>>,
    telemetry: Arc<Telemetry>,
    activity: Arc<FetchActivityTracker>,
    workers: Vec<JoinHandle<()>>,
}

pub(crate) struct WorkerPoolParams<P: FetchProtocol> {
    pub worker_count: usize,
    pub protocol: Arc<RwLock<P>>,
    pub telemetry: Arc<Telemetry>,
    pub activity: Arc<FetchActivityTracker>,
}

pub(crate) struct WorkerPoolChannels<P: FetchProtocol> {
    pub intake: SharedDispatchReceiver<P::Location>,
    pub completion_tx: CompletionSender<P::Location, P::Content>,
}

impl<P: FetchProtocol> WorkerPool<P> {
    pub(crate) fn new(params: WorkerPoolParams<P>) -> Self {
        Self {
            worker_count: params.worker_count.max(1),
            protocol: params.protocol,
            telemetry: params.telemetry,
            activity: params.activity,
            workers: Vec::new(),
        }
    }

    pub(crate) fn handles(&self) -> &[JoinHandle<()>] {
        &self.workers
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Spawns `worker_count` workers sharing one location intake. Each worker owns a
    /// clone of the completion sender, so the completion channel closes once the
    /// last worker has exited.
    pub(crate) fn launch(
        &mut self,
        channels: WorkerPoolChannels<P>,
        run_token: CancellationToken,
        fatal_handler: Arc<FatalErrorHandler>,
    ) {
        self.workers.clear();

        let shared = WorkerShared::new(WorkerSharedParams {
            protocol: self.protocol.clone(),
            intake: channels.intake,
            completion_tx: channels.completion_tx,
            telemetry: self.telemetry.clone(),
            activity: self.activity.clone(),
        });

        for worker_id in 0..self.worker_count {
            let worker = Worker::new(worker_id, run_token.clone(), shared.clone());
            let fatal_handler = fatal_handler.clone();

            let handle = tokio::spawn(async move {
                let result = std::panic::AssertUnwindSafe(worker.run())
                    .catch_unwind()
                    .await;

                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        tracing::error!(
                            worker = worker_id,
                            error = %err,
                            "worker task exited with error"
                        );
                        let context = format!("worker {worker_id} exited with error");
                        let err = err.context(context.clone());
                        fatal_handler.trigger_external(context.as_str(), err);
                    }
                    Err(panic_payload) => {
                        let panic_msg = panic_message(panic_payload.as_ref());
                        tracing::error!(
                            worker = worker_id,
                            panic = %panic_msg,
                            "worker task panicked"
                        );
                        let context = format!("worker {worker_id} panicked");
                        let panic_error =
                            anyhow::anyhow!("worker {worker_id} panicked: {panic_msg}");
                        fatal_handler.trigger_external(context.as_str(), panic_error);
                    }
                }
            });

            self.workers.push(handle);
        }

        self.telemetry.record_worker_pool_size(self.workers.len());
    }

    pub(crate) fn shutdown(&mut self) -> Vec<JoinHandle<()>> {
        self.telemetry.record_worker_pool_size(0);
        std::mem::take(&mut self.workers)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
