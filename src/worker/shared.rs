use crate::runtime::protocol::FetchProtocol;
use crate::runtime::telemetry::Telemetry;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::types::{CompletionSender, SharedDispatchReceiver};

pub struct WorkerShared<P: FetchProtocol> {
    pub(super) protocol: Arc<RwLock<P>>,
    pub(super) intake: SharedDispatchReceiver<P::Location>,
    pub(super) completion_tx: CompletionSender<P::Location, P::Content>,
    pub(super) telemetry: Arc<Telemetry>,
    pub(super) activity: Arc<FetchActivityTracker>,
}

pub struct WorkerSharedParams<P: FetchProtocol> {
    pub protocol: Arc<RwLock<P>>,
    pub intake: SharedDispatchReceiver<P::Location>,
    pub completion_tx: CompletionSender<P::Location, P::Content>,
    pub telemetry: Arc<Telemetry>,
    pub activity: Arc<FetchActivityTracker>,
}

impl<P: FetchProtocol> WorkerShared<P> {
    pub fn new(params: WorkerSharedParams<P>) -> Self {
        Self {
            protocol: params.protocol,
            intake: params.intake,
            completion_tx: params.completion_tx,
            telemetry: params.telemetry,
            activity: params.activity,
        }
    }
}

impl<P: FetchProtocol> Clone for WorkerShared<P> {
    fn clone(&self) -> Self {
        Self {
            protocol: Arc::clone(&self.protocol),
            intake: Arc::clone(&self.intake),
            completion_tx: self.completion_tx.clone(),
            telemetry: Arc::clone(&self.telemetry),
            activity: Arc::clone(&self.activity),
        }
    }
}

/// Counts fetches currently executing across the pool and remembers the peak.
#[derive(Debug, Default)]
pub struct FetchActivityTracker {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl FetchActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(self: &Arc<Self>) -> FetchActivityGuard {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        FetchActivityGuard {
            tracker: Arc::clone(self),
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous fetches observed since creation.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

pub struct FetchActivityGuard {
    tracker: Arc<FetchActivityTracker>,
}

impl Drop for FetchActivityGuard {
    fn drop(&mut self) {
        self.tracker.active.fetch_sub(1, Ordering::SeqCst);
    }
}
