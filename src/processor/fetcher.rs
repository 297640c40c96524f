//! Coalescing pipeline orchestration.
//!
//! `CoalescingFetcher` composes the smaller modules so each concern is owned by
//! the component that knows it best:
//! - `coordinator` owns the waiters table, resolution and fan-out.
//! - `worker_pool` manages worker creation and panic containment.
//! - `intake` is the caller-facing reference sender.
//! - `lifecycle` wires run-scoped cancellation, telemetry reporters, and fatal
//!   error propagation.

use super::coordinator::{Coordinator, CoordinatorChannels};
use super::intake::ReferenceSender;
use super::lifecycle::{LifecycleHandles, LifecycleSpawnParams};
use super::worker_pool::{WorkerPool, WorkerPoolChannels, WorkerPoolParams};

use crate::runtime::config::CoalescerConfig;
use crate::runtime::protocol::FetchProtocol;
use crate::runtime::telemetry::Telemetry;
use crate::worker::{completion_channel, dispatch_channel, FetchActivityTracker};
use anyhow::{bail, Context, Result};
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct CoalescingFetcher<P: FetchProtocol> {
    config: CoalescerConfig,
    protocol: Arc<RwLock<P>>,
    coordinator_handle: Option<JoinHandle<Result<()>>>,
    coordinator_done: Option<watch::Receiver<bool>>,
    running: bool,
    shutdown_root: CancellationToken,
    telemetry: Arc<Telemetry>,
    activity: Arc<FetchActivityTracker>,
    worker_pool: WorkerPool<P>,
    lifecycle: Option<LifecycleHandles>,
}

impl<P: FetchProtocol> CoalescingFetcher<P> {
    /// Creates a new fetcher with the given configuration and protocol.
    ///
    /// The fetcher creates its own root cancellation token. Use [`Self::with_cancellation_token`]
    /// if you need to integrate with an existing shutdown mechanism.
    pub fn new(config: CoalescerConfig, protocol: P) -> Self {
        Self::with_cancellation_token(config, protocol, CancellationToken::new())
    }

    /// Creates a new fetcher with the given configuration, protocol, and shutdown token.
    ///
    /// The shutdown token is used to derive per-run cancellation tokens for workers and the
    /// coordinator.
    pub fn with_cancellation_token(
        config: CoalescerConfig,
        protocol: P,
        shutdown_token: CancellationToken,
    ) -> Self {
        let protocol = Arc::new(RwLock::new(protocol));
        let telemetry = Arc::new(Telemetry::default());
        let activity = Arc::new(FetchActivityTracker::new());
        let worker_pool = WorkerPool::new(WorkerPoolParams {
            worker_count: config.worker_count(),
            protocol: protocol.clone(),
            telemetry: telemetry.clone(),
            activity: activity.clone(),
        });

        Self {
            config,
            protocol,
            coordinator_handle: None,
            coordinator_done: None,
            running: false,
            shutdown_root: shutdown_token,
            telemetry,
            activity,
            worker_pool,
            lifecycle: None,
        }
    }

    /// Returns a reference to the fetcher's configuration.
    pub fn config(&self) -> &CoalescerConfig {
        &self.config
    }

    /// Returns a reference to the protocol instance wrapped in an `RwLock`.
    pub fn protocol(&self) -> &Arc<RwLock<P>> {
        &self.protocol
    }

    /// Returns a reference to the worker task handles.
    pub fn workers(&self) -> &[JoinHandle<()>] {
        self.worker_pool.handles()
    }

    /// Returns a clone of the telemetry handle for observability.
    pub fn telemetry(&self) -> Arc<Telemetry> {
        self.telemetry.clone()
    }

    /// Active and peak concurrent fetch counts across the worker pool.
    pub fn fetch_activity(&self) -> Arc<FetchActivityTracker> {
        self.activity.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Replaces the root shutdown token used to derive per-run cancellation tokens.
    /// This must only be called while the fetcher is idle (i.e. between `stop` and `start`).
    pub fn replace_shutdown_root(&mut self, shutdown: CancellationToken) {
        debug_assert!(
            !self.running,
            "shutdown token should not change while the fetcher is running"
        );
        self.shutdown_root = shutdown;
    }

    /// Launches the worker pool and the coordinator.
    ///
    /// Returns the sender for the reference intake. The pipeline drains once every
    /// clone of it is dropped. Returns an error if the fetcher is already running.
    pub fn start(&mut self) -> Result<ReferenceSender<P::Reference>> {
        if self.running {
            bail!("coalescing fetcher already running");
        }

        debug_assert!(
            self.config.validate().is_ok(),
            "CoalescerConfig should have been validated at construction time"
        );

        tracing::info!(
            workers = self.worker_pool.worker_count(),
            intake_capacity = self.config.intake_capacity(),
            dispatch_capacity = self.config.dispatch_capacity(),
            "starting coalescing fetcher"
        );

        let lifecycle = LifecycleHandles::spawn(LifecycleSpawnParams {
            shutdown_root: &self.shutdown_root,
            telemetry: self.telemetry.clone(),
            metrics_interval: self.config.metrics_interval(),
        });
        let fatal_handler = lifecycle.fatal_handler();
        let run_token = lifecycle.run_token.clone();

        let (intake_tx, intake_rx) = mpsc::channel(self.config.intake_capacity());
        let (dispatch_tx, dispatch_rx) = dispatch_channel(self.config.dispatch_capacity());
        let (completion_tx, completion_rx) = completion_channel(self.config.completion_capacity());
        let (done_tx, done_rx) = watch::channel(false);

        self.worker_pool.launch(
            WorkerPoolChannels {
                intake: dispatch_rx,
                completion_tx,
            },
            run_token.clone(),
            fatal_handler.clone(),
        );

        let coordinator = Coordinator::new(
            self.protocol.clone(),
            self.telemetry.clone(),
            fatal_handler,
            run_token,
        );
        let coordinator_handle = tokio::spawn(coordinator.run(CoordinatorChannels {
            intake: intake_rx,
            dispatch_tx,
            completions: completion_rx,
            done_tx,
        }));

        self.coordinator_handle = Some(coordinator_handle);
        self.coordinator_done = Some(done_rx);
        self.lifecycle = Some(lifecycle);
        self.running = true;

        Ok(ReferenceSender::new(intake_tx))
    }

    /// Resolves once the coordinator has exited: drained, cancelled, or aborted
    /// by a fatal error. Resolves immediately when the fetcher is not running.
    pub async fn finished(&self) {
        let Some(done) = self.coordinator_done.as_ref() else {
            return;
        };
        let mut done = done.clone();
        let _ = done.wait_for(|done| *done).await;
    }

    /// Waits until every reference sender has been dropped and every in-flight
    /// location has been delivered, then tears the pipeline down like [`Self::stop`].
    pub async fn drain(&mut self) -> Result<()> {
        if !self.running {
            return Ok(());
        }

        tracing::info!("draining coalescing fetcher");
        self.finished().await;
        self.stop().await
    }

    /// Stops the pipeline.
    ///
    /// Cancels workers and the coordinator, abandons in-flight dispatches, and invokes the
    /// protocol's shutdown hook. Returns the first fatal error recorded during the run.
    pub async fn stop(&mut self) -> Result<()> {
        if !self.running {
            return Ok(());
        }

        tracing::info!("stopping coalescing fetcher");

        if let Some(handles) = &self.lifecycle {
            handles.run_token.cancel();
        }

        let mut pipeline_error: Option<anyhow::Error> = None;
        if let Some(handle) = self.coordinator_handle.take() {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::error!(error = %err, "coordinator exited with error");
                    pipeline_error = Some(err);
                }
                Err(err) => {
                    tracing::error!(error = %err, "failed to join coordinator task");
                    pipeline_error = Some(err.into());
                }
            }
        }
        tracing::debug!("coalescing fetcher stop: coordinator joined");

        let worker_handles = self.worker_pool.shutdown();
        let results = join_all(worker_handles).await;
        for (idx, result) in results.into_iter().enumerate() {
            if let Err(err) = result {
                tracing::warn!(worker = idx, error = %err, "worker task terminated unexpectedly");
            }
        }
        tracing::debug!("coalescing fetcher stop: worker tasks joined");

        let lifecycle_error = self.lifecycle.as_ref().and_then(|handles| handles.error());
        if let Some(handles) = self.lifecycle.take() {
            handles.shutdown().await;
        }
        self.coordinator_done = None;
        self.running = false;

        {
            let mut protocol = self.protocol.write().await;
            protocol
                .shutdown()
                .await
                .context("failed to shutdown protocol")?;
        }

        let snapshot = self.telemetry.snapshot();
        tracing::info!(
            references = snapshot.references,
            dispatched = snapshot.dispatched,
            deliveries = snapshot.deliveries,
            abandoned_locations = snapshot.in_flight,
            "coalescing fetcher stopped"
        );

        if let Some(err) = lifecycle_error.or(pipeline_error) {
            return Err(err).context("coalescing pipeline aborted");
        }

        Ok(())
    }
}
