//! Caller-facing handle for submitting references.

use anyhow::{bail, Result};
use futures::{Stream, StreamExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

/// Bounded, cloneable sender into the coordinator's reference intake.
///
/// The pipeline drains once every clone has been dropped and all in-flight
/// locations have been delivered.
pub struct ReferenceSender<R> {
    tx: mpsc::Sender<R>,
}

impl<R> Clone for ReferenceSender<R> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<R: Send + 'static> ReferenceSender<R> {
    pub(crate) fn new(tx: mpsc::Sender<R>) -> Self {
        Self { tx }
    }

    /// Waits for intake capacity and enqueues `reference`.
    pub async fn submit(&self, reference: R) -> Result<()> {
        if self.tx.send(reference).await.is_err() {
            bail!("coalescing pipeline is no longer accepting references");
        }
        Ok(())
    }

    /// Enqueues `reference` without waiting. The reference is handed back when
    /// the intake is full or closed.
    pub fn try_submit(&self, reference: R) -> Result<(), TrySendError<R>> {
        self.tx.try_send(reference)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Free slots in the bounded intake.
    pub fn capacity(&self) -> usize {
        self.tx.capacity()
    }

    /// Submits every item of `references` until the stream ends, `shutdown`
    /// fires, or the pipeline stops accepting references. Returns the number of
    /// references submitted. The sender is dropped on return.
    pub async fn forward<S>(self, references: S, shutdown: &CancellationToken) -> Result<u64>
    where
        S: Stream<Item = R>,
    {
        let mut references = std::pin::pin!(references);
        let mut forwarded = 0u64;

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = references.next() => next,
            };
            let Some(reference) = next else {
                tracing::debug!(forwarded, "reference stream exhausted");
                break;
            };

            let sent = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                sent = self.tx.send(reference) => sent,
            };
            if sent.is_err() {
                if shutdown.is_cancelled() {
                    break;
                }
                bail!("coalescing pipeline stopped after {forwarded} forwarded references");
            }
            forwarded += 1;
        }

        Ok(forwarded)
    }
}
