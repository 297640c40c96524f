use std::time::Duration;

use crate::support::{
    helpers::{
        config, deliveries, ids_for, init_tracing, wait_for_coalesced, wait_for_deliveries,
        wait_until,
    },
    scripted::{Req, ScriptedProtocol},
};
use anyhow::Result;
use coalescer::CoalescingFetcher;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_references_share_one_fetch() -> Result<()> {
    init_tracing();
    let mut protocol = ScriptedProtocol::new();
    let gate = protocol.gate("X");
    let stats = protocol.stats();

    let mut fetcher = CoalescingFetcher::new(config(4)?, protocol);
    let sender = fetcher.start()?;
    for id in 1..=5 {
        sender.submit(Req::to(id, "X")).await?;
    }
    wait_for_coalesced(&fetcher, 4, WAIT).await?;
    assert_eq!(stats.started("X"), 1);

    gate.add_permits(1);
    let records = wait_for_deliveries(&fetcher, 5, WAIT).await?;

    assert_eq!(stats.started("X"), 1);
    assert_eq!(ids_for(&records, "X"), vec![1, 2, 3, 4, 5]);
    assert!(records
        .iter()
        .all(|record| record.outcome == Ok("content:X".to_string())));
    assert_eq!(fetcher.telemetry().dispatched(), 1);

    drop(sender);
    fetcher.drain().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn never_two_fetches_in_flight_for_one_location() -> Result<()> {
    init_tracing();
    let protocol = ScriptedProtocol::new().with_fetch_delay(Duration::from_millis(3));
    let stats = protocol.stats();
    let locations = ["a", "b", "c"];

    let mut fetcher = CoalescingFetcher::new(config(4)?, protocol);
    let sender = fetcher.start()?;
    for id in 0..300u64 {
        let target = locations[(id % 3) as usize];
        sender.submit(Req::to(id, target)).await?;
    }
    drop(sender);
    fetcher.drain().await?;

    let records = deliveries(&fetcher).await;
    assert_eq!(records.len(), 300);
    assert_eq!(stats.max_active_per_location(), 1);
    assert!(fetcher.fetch_activity().peak() <= 4);

    let snapshot = fetcher.telemetry().snapshot();
    assert_eq!(snapshot.dispatched as usize, stats.total_started());
    assert_eq!(snapshot.references, 300);
    assert_eq!(snapshot.deliveries, 300);
    assert_eq!(snapshot.coalesced + snapshot.dispatched, 300);
    for location in locations {
        let ids = ids_for(&records, location);
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted, "deliveries for {location} must follow arrival order");
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_location_does_not_hold_back_others() -> Result<()> {
    init_tracing();
    let mut protocol = ScriptedProtocol::new();
    let slow = protocol.gate("slow");
    let stats = protocol.stats();

    let mut fetcher = CoalescingFetcher::new(config(2)?, protocol);
    let sender = fetcher.start()?;
    sender.submit(Req::to(1, "slow")).await?;
    wait_until("slow fetch to start", WAIT, || stats.started("slow") == 1).await?;
    sender.submit(Req::to(2, "fast")).await?;
    sender.submit(Req::to(3, "fast")).await?;

    let records = wait_for_deliveries(&fetcher, 2, WAIT).await?;
    assert_eq!(ids_for(&records, "fast"), vec![2, 3]);
    assert!(ids_for(&records, "slow").is_empty());
    assert_eq!(stats.get("slow").active, 1);

    slow.add_permits(1);
    let records = wait_for_deliveries(&fetcher, 3, WAIT).await?;
    assert_eq!(ids_for(&records, "slow"), vec![1]);

    drop(sender);
    fetcher.drain().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_fetch_reaches_every_waiter_and_spares_other_locations() -> Result<()> {
    init_tracing();
    let mut protocol = ScriptedProtocol::new().with_failure("down");
    let gate = protocol.gate("down");

    let mut fetcher = CoalescingFetcher::new(config(2)?, protocol);
    let sender = fetcher.start()?;
    sender.submit(Req::to(1, "down")).await?;
    sender.submit(Req::to(2, "up")).await?;
    sender.submit(Req::to(3, "down")).await?;
    wait_for_coalesced(&fetcher, 1, WAIT).await?;
    gate.add_permits(1);
    drop(sender);
    fetcher.drain().await?;

    let records = deliveries(&fetcher).await;
    assert_eq!(records.len(), 3);
    for record in records.iter().filter(|record| record.location == "down") {
        let message = record.outcome.as_ref().unwrap_err();
        assert!(message.contains("down is unreachable"), "{message}");
    }
    assert_eq!(ids_for(&records, "down"), vec![1, 3]);
    let up: Vec<_> = records.iter().filter(|record| record.location == "up").collect();
    assert_eq!(up.len(), 1);
    assert_eq!(up[0].outcome, Ok("content:up".to_string()));

    let snapshot = fetcher.telemetry().snapshot();
    assert_eq!(snapshot.fetch_failures, 1);
    assert_eq!(snapshot.dispatched, 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_worker_fans_out_in_arrival_order() -> Result<()> {
    init_tracing();
    let mut protocol = ScriptedProtocol::new();
    let gate_x = protocol.gate("X");
    let stats = protocol.stats();

    let mut fetcher = CoalescingFetcher::new(config(1)?, protocol);
    let sender = fetcher.start()?;
    sender.submit(Req::to(1, "X")).await?;
    sender.submit(Req::to(2, "Y")).await?;
    sender.submit(Req::to(3, "X")).await?;
    wait_for_coalesced(&fetcher, 1, WAIT).await?;

    gate_x.add_permits(1);
    drop(sender);
    fetcher.drain().await?;

    let records = deliveries(&fetcher).await;
    let order: Vec<_> = records
        .iter()
        .map(|record| (record.reference, record.location))
        .collect();
    assert_eq!(order, vec![(1, "X"), (3, "X"), (2, "Y")]);
    assert_eq!(stats.total_started(), 2);
    assert_eq!(fetcher.fetch_activity().peak(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unresolvable_reference_is_dropped_without_stalling() -> Result<()> {
    init_tracing();
    let protocol = ScriptedProtocol::new();
    let stats = protocol.stats();

    let mut fetcher = CoalescingFetcher::new(config(2)?, protocol);
    let sender = fetcher.start()?;
    sender.submit(Req::unresolvable(1)).await?;
    sender.submit(Req::to(2, "ok")).await?;
    drop(sender);
    fetcher.drain().await?;

    let protocol = fetcher.protocol().read().await;
    assert_eq!(protocol.unresolved(), &[1]);
    assert_eq!(protocol.deliveries().len(), 1);
    assert_eq!(protocol.deliveries()[0].reference, 2);
    assert_eq!(stats.total_started(), 1);
    assert_eq!(fetcher.telemetry().snapshot().resolution_failures, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn location_is_fetched_again_after_completion() -> Result<()> {
    init_tracing();
    let protocol = ScriptedProtocol::new();
    let stats = protocol.stats();

    let mut fetcher = CoalescingFetcher::new(config(2)?, protocol);
    let sender = fetcher.start()?;
    sender.submit(Req::to(1, "X")).await?;
    wait_for_deliveries(&fetcher, 1, WAIT).await?;
    sender.submit(Req::to(2, "X")).await?;
    wait_for_deliveries(&fetcher, 2, WAIT).await?;

    assert_eq!(stats.started("X"), 2);
    drop(sender);
    fetcher.drain().await?;
    Ok(())
}
