//! Time-boxed run of the coalescing pipeline over an endless stream of references.
//!
//! Environment:
//! - `COALESCER_WORKERS`: worker pool size (default 4)
//! - `COALESCER_FAN_IN`: consecutive references sharing one location (default 3)
//! - `COALESCER_RUN_MS`: how long to run before cancelling (default 3000)

use anyhow::{Context, Result};
use coalescer::{
    init_tracing, CoalescerConfig, Delivery, FetchProtocol, ProtocolFetchFuture, ProtocolFuture,
    ResolutionFailure, Runner,
};
use futures::stream;
use std::time::Duration;

const DOWNLOAD_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy)]
struct Reference(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Location(u64);

#[derive(Debug)]
struct Content(u64);

struct Downloader {
    fan_in: u64,
    processed: u64,
    failed: u64,
}

impl FetchProtocol for Downloader {
    type Reference = Reference;
    type Location = Location;
    type Content = Content;

    fn resolve(&self, reference: &Reference) -> Result<Location> {
        tracing::debug!(?reference, "resolving location");
        Ok(Location(reference.0 / self.fan_in))
    }

    fn fetch(&self, location: Location) -> ProtocolFetchFuture<Content> {
        Box::pin(async move {
            tracing::debug!(?location, "downloading");
            tokio::time::sleep(DOWNLOAD_DELAY).await;
            Ok(Content(location.0))
        })
    }

    fn process<'a>(&'a mut self, reference: Reference, delivery: Delivery<Content>) -> ProtocolFuture<'a> {
        Box::pin(async move {
            match delivery {
                Ok(content) => {
                    self.processed += 1;
                    tracing::info!(?reference, content = content.0, "processing content");
                }
                Err(failure) => {
                    self.failed += 1;
                    tracing::warn!(?reference, error = %failure, "download failed");
                }
            }
            Ok(())
        })
    }

    fn unresolved<'a>(&'a mut self, failure: ResolutionFailure<Reference>) -> ProtocolFuture<'a> {
        Box::pin(async move {
            tracing::warn!(error = %failure, "skipping reference");
            Ok(())
        })
    }

    fn shutdown<'a>(&'a mut self) -> ProtocolFuture<'a> {
        Box::pin(async move {
            tracing::info!(
                processed = self.processed,
                failed = self.failed,
                "downloader shut down"
            );
            Ok(())
        })
    }
}

fn env_u64(name: &str, default: u64) -> Result<u64> {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .with_context(|| format!("{name} must be a non-negative integer, got {value:?}")),
        Err(_) => Ok(default),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let workers = env_u64("COALESCER_WORKERS", 4)?;
    let fan_in = env_u64("COALESCER_FAN_IN", 3)?.max(1);
    let run_for = Duration::from_millis(env_u64("COALESCER_RUN_MS", 3000)?);

    let config = CoalescerConfig::builder()
        .worker_count(usize::try_from(workers).context("COALESCER_WORKERS out of range")?)
        .build()?;
    let protocol = Downloader {
        fan_in,
        processed: 0,
        failed: 0,
    };

    let mut runner = Runner::new(config, protocol);
    let shutdown = runner.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(run_for).await;
        tracing::info!(?run_for, "time limit reached; cancelling");
        shutdown.cancel();
    });

    let references = stream::iter((1..).map(Reference));
    runner.run_until_ctrl_c(references).await?;

    let snapshot = runner.fetcher().telemetry().snapshot();
    tracing::info!(
        references = snapshot.references,
        dispatched = snapshot.dispatched,
        coalesced = snapshot.coalesced,
        deliveries = snapshot.deliveries,
        peak_fetches = runner.fetcher().fetch_activity().peak(),
        "run complete"
    );
    Ok(())
}
