//! Single-owner deduplication and fan-out.
//!
//! The coordinator is the only component that reads or writes the waiters
//! table. It runs as one task: resolving references, deciding dispatches and
//! fanning completions out all happen on that task, so `submit` and
//! `on_completion` never interleave.

use crate::runtime::fatal::FatalErrorHandler;
use crate::runtime::hooks::{await_hook, HookDecision};
use crate::runtime::protocol::{FetchProtocol, ResolutionFailure};
use crate::runtime::telemetry::Telemetry;
use crate::worker::{Completion, CompletionReceiver, DispatchSender};
use anyhow::{anyhow, Result};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};
use tokio_util::sync::CancellationToken;

/// A completion arrived for a location that has no waiters entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolViolation {
    location: String,
}

impl ProtocolViolation {
    fn new(location: &impl fmt::Debug) -> Self {
        Self {
            location: format!("{location:?}"),
        }
    }

    pub fn location(&self) -> &str {
        &self.location
    }
}

impl fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "completion received for {} which was never dispatched or already completed",
            self.location
        )
    }
}

impl std::error::Error for ProtocolViolation {}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Admission<L> {
    /// First reference for the location; the caller must dispatch exactly one fetch.
    Dispatch(L),
    /// Appended to an in-flight location.
    Coalesced { waiting: usize },
}

/// Location → references waiting on it, in arrival order.
///
/// A location is present exactly while its fetch is dispatched and not yet completed.
pub(crate) struct WaitersTable<L, R> {
    requested: HashMap<L, Vec<R>>,
}

impl<L: Eq + Hash + Clone, R> WaitersTable<L, R> {
    pub(crate) fn new() -> Self {
        Self {
            requested: HashMap::new(),
        }
    }

    pub(crate) fn admit(&mut self, location: L, reference: R) -> Admission<L> {
        match self.requested.entry(location) {
            Entry::Occupied(mut entry) => {
                let waiting = entry.get_mut();
                waiting.push(reference);
                Admission::Coalesced {
                    waiting: waiting.len(),
                }
            }
            Entry::Vacant(entry) => {
                let location = entry.key().clone();
                entry.insert(vec![reference]);
                Admission::Dispatch(location)
            }
        }
    }

    pub(crate) fn complete(&mut self, location: &L) -> Result<Vec<R>, ProtocolViolation>
    where
        L: fmt::Debug,
    {
        self.requested
            .remove(location)
            .ok_or_else(|| ProtocolViolation::new(location))
    }

    /// Number of in-flight locations.
    pub(crate) fn len(&self) -> usize {
        self.requested.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.requested.is_empty()
    }

    /// Number of references waiting across all locations.
    pub(crate) fn waiting(&self) -> usize {
        self.requested.values().map(Vec::len).sum()
    }
}

pub(crate) enum CoordinatorAction {
    Applied,
    Cancelled,
}

pub(crate) struct CoordinatorChannels<P: FetchProtocol> {
    pub intake: mpsc::Receiver<P::Reference>,
    pub dispatch_tx: DispatchSender<P::Location>,
    pub completions: CompletionReceiver<P::Location, P::Content>,
    pub done_tx: watch::Sender<bool>,
}

pub(crate) struct Coordinator<P: FetchProtocol> {
    protocol: Arc<RwLock<P>>,
    waiters: WaitersTable<P::Location, P::Reference>,
    next_dispatch: Option<P::Location>,
    telemetry: Arc<Telemetry>,
    fatal_handler: Arc<FatalErrorHandler>,
    shutdown: CancellationToken,
}

impl<P: FetchProtocol> Coordinator<P> {
    pub(crate) fn new(
        protocol: Arc<RwLock<P>>,
        telemetry: Arc<Telemetry>,
        fatal_handler: Arc<FatalErrorHandler>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            protocol,
            waiters: WaitersTable::new(),
            next_dispatch: None,
            telemetry,
            fatal_handler,
            shutdown,
        }
    }

    /// Resolves `reference` and either schedules a fetch for a new location or
    /// appends it to the waiters of an in-flight one.
    pub(crate) async fn submit(&mut self, reference: P::Reference) -> Result<CoordinatorAction> {
        self.telemetry.record_reference();

        let resolved = {
            let protocol = self.protocol.read().await;
            protocol.resolve(&reference)
        };

        let location = match resolved {
            Ok(location) => location,
            Err(source) => return self.report_unresolved(reference, source).await,
        };

        match self.waiters.admit(location, reference) {
            Admission::Dispatch(location) => {
                tracing::debug!(location = ?location, "dispatching fetch for new location");
                debug_assert!(
                    self.next_dispatch.is_none(),
                    "references are only admitted while the dispatch slot is free"
                );
                self.next_dispatch = Some(location);
                self.telemetry.record_in_flight(self.waiters.len());
            }
            Admission::Coalesced { waiting } => {
                tracing::trace!(waiting, "reference coalesced onto in-flight location");
                self.telemetry.record_coalesced();
            }
        }

        Ok(CoordinatorAction::Applied)
    }

    /// Removes the waiters of a completed location and delivers the outcome to each
    /// of them in arrival order.
    pub(crate) async fn on_completion(
        &mut self,
        completion: Completion<P::Location, P::Content>,
    ) -> Result<CoordinatorAction> {
        self.telemetry.record_completion();
        let Completion { location, outcome } = completion;

        let waiting = match self.waiters.complete(&location) {
            Ok(waiting) => waiting,
            Err(violation) => {
                return Err(self
                    .fatal_handler
                    .trigger_external("coordinator received unexpected completion", violation.into()));
            }
        };
        self.telemetry.record_in_flight(self.waiters.len());

        tracing::debug!(
            location = ?location,
            references = waiting.len(),
            success = outcome.is_ok(),
            "fanning out completion"
        );

        let mut protocol = self.protocol.write().await;
        let mut delivered = 0u64;
        let mut action = CoordinatorAction::Applied;
        for reference in waiting {
            let hook = protocol.process(reference, outcome.clone());
            match await_hook(hook, &self.shutdown).await {
                HookDecision::Finished(Ok(())) => delivered += 1,
                HookDecision::Finished(Err(error)) => {
                    self.telemetry.record_deliveries(delivered);
                    return Err(self.fatal_handler.trigger(error));
                }
                HookDecision::Cancelled => {
                    action = CoordinatorAction::Cancelled;
                    break;
                }
            }
        }
        self.telemetry.record_deliveries(delivered);

        Ok(action)
    }

    async fn report_unresolved(
        &mut self,
        reference: P::Reference,
        source: anyhow::Error,
    ) -> Result<CoordinatorAction> {
        self.telemetry.record_resolution_failure();
        let failure = ResolutionFailure::new(reference, source);
        tracing::warn!(error = %failure, "dropping reference that could not be resolved");

        let mut protocol = self.protocol.write().await;
        match await_hook(protocol.unresolved(failure), &self.shutdown).await {
            HookDecision::Finished(Ok(())) => Ok(CoordinatorAction::Applied),
            HookDecision::Finished(Err(error)) => Err(self.fatal_handler.trigger(error)),
            HookDecision::Cancelled => Ok(CoordinatorAction::Cancelled),
        }
    }

    /// Runs the coordinator until shutdown, a fatal error, or until the reference
    /// intake is closed and every dispatched location has been delivered.
    pub(crate) async fn run(mut self, channels: CoordinatorChannels<P>) -> Result<()> {
        let CoordinatorChannels {
            intake,
            dispatch_tx,
            completions,
            done_tx,
        } = channels;

        let result = self.run_loop(intake, dispatch_tx, completions).await;
        let _ = done_tx.send(true);
        result
    }

    async fn run_loop(
        &mut self,
        mut intake: mpsc::Receiver<P::Reference>,
        dispatch_tx: DispatchSender<P::Location>,
        mut completions: CompletionReceiver<P::Location, P::Content>,
    ) -> Result<()> {
        let mut intake_closed = false;
        let mut completions_closed = false;

        loop {
            if intake_closed && self.waiters.is_empty() && self.next_dispatch.is_none() {
                tracing::info!("reference intake closed and every dispatch delivered; coordinator drained");
                break;
            }

            // Completions are polled before new work so workers blocked on a full
            // completion channel always make progress.
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    tracing::info!(
                        abandoned_locations = self.waiters.len(),
                        waiting_references = self.waiters.waiting(),
                        "coordinator received shutdown signal; abandoning in-flight dispatches"
                    );
                    break;
                }
                completion = completions.recv(), if !completions_closed => {
                    match completion {
                        Some(completion) => {
                            if let CoordinatorAction::Cancelled = self.on_completion(completion).await? {
                                break;
                            }
                        }
                        None => {
                            completions_closed = true;
                            if !self.waiters.is_empty() {
                                let err = anyhow!(
                                    "worker pool exited with {} locations still in flight",
                                    self.waiters.len()
                                );
                                return Err(self.fatal_handler.trigger_external("coordinator", err));
                            }
                            tracing::debug!("completion channel closed");
                        }
                    }
                }
                permit = dispatch_tx.reserve(), if self.next_dispatch.is_some() => {
                    match permit {
                        Ok(permit) => {
                            if let Some(location) = self.next_dispatch.take() {
                                permit.send(location);
                                self.telemetry.record_dispatch();
                            }
                        }
                        Err(_) => {
                            let err = anyhow!("worker intake closed while a dispatch was pending");
                            return Err(self.fatal_handler.trigger_external("coordinator", err));
                        }
                    }
                }
                reference = intake.recv(), if self.next_dispatch.is_none() && !intake_closed => {
                    match reference {
                        Some(reference) => {
                            if let CoordinatorAction::Cancelled = self.submit(reference).await? {
                                break;
                            }
                        }
                        None => {
                            intake_closed = true;
                            tracing::debug!(
                                in_flight = self.waiters.len(),
                                "reference intake closed; draining in-flight dispatches"
                            );
                        }
                    }
                }
            }
        }

        tracing::info!("coordinator stopped");
        Ok(())
    }
}
