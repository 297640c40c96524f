use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Default interval used by the metrics reporter task.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(5);

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// The subscriber honours `RUST_LOG` if it is present, otherwise it falls back to `info`.
/// Calling this function multiple times is harmless.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Rolling counters describing what the coordinator and workers have done.
#[derive(Default, Debug)]
pub struct Telemetry {
    references: AtomicU64,
    resolution_failures: AtomicU64,
    coalesced: AtomicU64,
    dispatched: AtomicU64,
    completions: AtomicU64,
    fetch_failures: AtomicU64,
    cancelled_fetches: AtomicU64,
    deliveries: AtomicU64,
    in_flight: AtomicUsize,
    worker_pool_size: AtomicUsize,
}

impl Telemetry {
    pub fn record_reference(&self) {
        self.references.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resolution_failure(&self) {
        self.resolution_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_coalesced(&self) {
        self.coalesced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatch(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fetch_failure(&self) {
        self.fetch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled_fetch(&self) {
        self.cancelled_fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completion(&self) {
        self.completions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deliveries(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.deliveries.fetch_add(count, Ordering::Relaxed);
    }

    /// Number of locations currently present in the waiters table.
    pub fn record_in_flight(&self, locations: usize) {
        self.in_flight.store(locations, Ordering::Relaxed);
    }

    pub fn record_worker_pool_size(&self, workers: usize) {
        self.worker_pool_size.store(workers, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            references: self.references.load(Ordering::Relaxed),
            resolution_failures: self.resolution_failures.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            completions: self.completions.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            cancelled_fetches: self.cancelled_fetches.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }

    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    pub fn deliveries(&self) -> u64 {
        self.deliveries.load(Ordering::Relaxed)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn worker_pool_size(&self) -> usize {
        self.worker_pool_size.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub references: u64,
    pub resolution_failures: u64,
    pub coalesced: u64,
    pub dispatched: u64,
    pub completions: u64,
    pub fetch_failures: u64,
    pub cancelled_fetches: u64,
    pub deliveries: u64,
    pub in_flight: usize,
}

/// Spawns a background task that periodically logs delivery throughput and pipeline counters.
pub fn spawn_metrics_reporter(
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_snapshot = telemetry.snapshot();
        let mut last_tick = Instant::now();

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(target: "coalescer::metrics", "metrics reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let current = telemetry.snapshot();
                    let delivered = current.deliveries.saturating_sub(last_snapshot.deliveries);
                    let elapsed = last_tick.elapsed().as_secs_f64();
                    let throughput = if elapsed <= f64::EPSILON {
                        0.0
                    } else {
                        delivered as f64 / elapsed
                    };

                    tracing::info!(
                        target: "coalescer::metrics",
                        throughput = format!("{throughput:.2}"),
                        references = current.references,
                        coalesced = current.coalesced,
                        dispatched = current.dispatched,
                        in_flight = current.in_flight,
                        deliveries = current.deliveries,
                        fetch_failures = current.fetch_failures,
                        resolution_failures = current.resolution_failures,
                        "runtime metrics snapshot"
                    );

                    last_snapshot = current;
                    last_tick = Instant::now();
                }
            }
        }
    })
}
