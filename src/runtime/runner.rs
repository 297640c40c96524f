use crate::processor::intake::ReferenceSender;
use crate::{CoalescerConfig, CoalescingFetcher, FetchProtocol};
use anyhow::{bail, Result};
use futures::Stream;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Coordinates the fetcher lifecycle and handles OS signals for graceful shutdowns.
pub struct Runner<P: FetchProtocol> {
    fetcher: CoalescingFetcher<P>,
    shutdown: CancellationToken,
    started: bool,
}

impl<P: FetchProtocol> Runner<P> {
    /// Creates a new runner and wires a root [`CancellationToken`] that propagates
    /// through the entire pipeline (coordinator, workers, metrics reporter).
    pub fn new(config: CoalescerConfig, protocol: P) -> Self {
        let shutdown = CancellationToken::new();
        let fetcher = CoalescingFetcher::with_cancellation_token(config, protocol, shutdown.clone());
        Self {
            fetcher,
            shutdown,
            started: false,
        }
    }

    /// Returns a clone of the root shutdown token so external callers can integrate
    /// with their own signal handlers or cancellation strategies.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn fetcher(&self) -> &CoalescingFetcher<P> {
        &self.fetcher
    }

    /// Starts the underlying pipeline and returns the reference sender.
    pub fn start(&mut self) -> Result<ReferenceSender<P::Reference>> {
        if self.started {
            bail!("runner already started");
        }

        let sender = self.fetcher.start()?;
        self.started = true;
        Ok(sender)
    }

    /// Stops the pipeline by cancelling the root token and delegating to the fetcher.
    pub async fn stop(&mut self) -> Result<()> {
        if !self.started {
            return Ok(());
        }

        self.shutdown.cancel();
        let result = self.fetcher.stop().await;
        self.started = false;
        self.reinitialize_shutdown_token();
        result
    }

    /// Feeds `references` into the pipeline until Ctrl-C (SIGINT) is received, the
    /// shutdown token is cancelled elsewhere, or the pipeline finishes on its own.
    ///
    /// When the stream ends, the runner waits for every in-flight location to be
    /// delivered before shutting down.
    pub async fn run_until_ctrl_c<S>(&mut self, references: S) -> Result<()>
    where
        S: Stream<Item = P::Reference>,
    {
        let sender = self.start()?;
        tracing::info!("runner started; waiting for Ctrl-C (SIGINT) or stream end to initiate shutdown");

        let shutdown = self.shutdown.clone();
        let forward = sender.forward(references, &shutdown);
        tokio::pin!(forward);
        let mut forwarding = true;

        loop {
            tokio::select! {
                _ = signal::ctrl_c() => {
                    tracing::info!("Ctrl-C received; shutting down runner");
                    break;
                }
                _ = shutdown.cancelled() => {
                    tracing::info!("runner shutdown token cancelled");
                    break;
                }
                _ = self.fetcher.finished() => {
                    tracing::info!("pipeline finished; shutting down runner");
                    break;
                }
                forwarded = &mut forward, if forwarding => {
                    forwarding = false;
                    match forwarded {
                        Ok(count) => {
                            tracing::info!(count, "reference stream forwarded; draining in-flight locations");
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "reference stream interrupted");
                        }
                    }
                }
            }
        }

        self.stop().await
    }

    fn reinitialize_shutdown_token(&mut self) {
        self.shutdown = CancellationToken::new();
        self.fetcher.replace_shutdown_root(self.shutdown.clone());
    }
}
