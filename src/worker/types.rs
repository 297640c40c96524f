use crate::runtime::protocol::Delivery;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Result of one dispatched fetch, sent back to the coordinator exactly once per location.
#[derive(Debug)]
pub struct Completion<L, C> {
    pub location: L,
    pub outcome: Delivery<C>,
}

impl<L, C> Completion<L, C> {
    pub fn new(location: L, outcome: Delivery<C>) -> Self {
        Self { location, outcome }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

pub type DispatchSender<L> = mpsc::Sender<L>;
/// Receiving half of the location queue. Workers take turns holding the lock, so
/// each location is handed to exactly one idle worker.
pub type SharedDispatchReceiver<L> = Arc<Mutex<mpsc::Receiver<L>>>;
pub type CompletionSender<L, C> = mpsc::Sender<Completion<L, C>>;
pub type CompletionReceiver<L, C> = mpsc::Receiver<Completion<L, C>>;

pub fn dispatch_channel<L>(capacity: usize) -> (DispatchSender<L>, SharedDispatchReceiver<L>) {
    let (tx, rx) = mpsc::channel(capacity);
    (tx, Arc::new(Mutex::new(rx)))
}

pub fn completion_channel<L, C>(
    capacity: usize,
) -> (CompletionSender<L, C>, CompletionReceiver<L, C>) {
    mpsc::channel(capacity)
}
