use std::time::Duration;

use crate::support::{
    helpers::{config, deliveries, init_tracing, wait_for_deliveries, wait_until},
    scripted::{Req, ScriptedProtocol},
};
use anyhow::{Context, Result};
use coalescer::CoalescingFetcher;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_abandons_in_flight_locations_without_delivering() -> Result<()> {
    init_tracing();
    let mut protocol = ScriptedProtocol::new();
    let _gate = protocol.gate("X");
    let stats = protocol.stats();

    let mut fetcher = CoalescingFetcher::new(config(2)?, protocol);
    let sender = fetcher.start()?;
    sender.submit(Req::to(1, "X")).await?;
    sender.submit(Req::to(2, "X")).await?;
    wait_until("gated fetch to start", WAIT, || stats.started("X") == 1).await?;

    timeout(WAIT, fetcher.stop())
        .await
        .context("stop should not wait for gated fetches")??;

    assert!(deliveries(&fetcher).await.is_empty());
    assert_eq!(stats.get("X").active, 0);
    assert!(sender.is_closed());
    assert!(sender.submit(Req::to(3, "Y")).await.is_err());
    assert_eq!(fetcher.telemetry().snapshot().cancelled_fetches, 1);
    assert_eq!(fetcher.protocol().read().await.shutdowns(), 1);
    assert!(!fetcher.is_running());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn process_failure_aborts_pipeline() -> Result<()> {
    init_tracing();
    let protocol = ScriptedProtocol::new().failing_process_for(2);

    let mut fetcher = CoalescingFetcher::new(config(2)?, protocol);
    let sender = fetcher.start()?;
    sender.submit(Req::to(1, "X")).await?;
    wait_for_deliveries(&fetcher, 1, WAIT).await?;
    sender.submit(Req::to(2, "Y")).await?;

    timeout(WAIT, fetcher.finished())
        .await
        .context("fatal error should end the run")?;
    let err = fetcher
        .stop()
        .await
        .expect_err("process failure should surface from stop");
    let message = format!("{err:#}");
    assert!(
        message.contains("coalescing pipeline aborted"),
        "expected pipeline abort, got {message}"
    );
    assert!(message.contains("sink rejected reference 2"), "{message}");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fetcher_can_restart_after_stop() -> Result<()> {
    init_tracing();
    let mut fetcher = CoalescingFetcher::new(config(2)?, ScriptedProtocol::new());

    let sender = fetcher.start()?;
    assert!(fetcher.start().is_err(), "second start must be rejected");
    sender.submit(Req::to(1, "X")).await?;
    wait_for_deliveries(&fetcher, 1, WAIT).await?;
    fetcher.stop().await?;

    let sender = fetcher.start()?;
    assert_eq!(fetcher.workers().len(), 2);
    sender.submit(Req::to(2, "X")).await?;
    drop(sender);
    fetcher.drain().await?;

    let records = deliveries(&fetcher).await;
    assert_eq!(records.len(), 2);
    assert_eq!(fetcher.protocol().read().await.shutdowns(), 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn drain_and_stop_are_noops_when_idle() -> Result<()> {
    init_tracing();
    let mut fetcher = CoalescingFetcher::new(config(1)?, ScriptedProtocol::new());
    fetcher.drain().await?;
    fetcher.stop().await?;
    timeout(Duration::from_millis(100), fetcher.finished())
        .await
        .context("finished resolves immediately when idle")?;
    assert_eq!(fetcher.protocol().read().await.shutdowns(), 0);
    Ok(())
}
