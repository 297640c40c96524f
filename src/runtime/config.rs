use crate::runtime::telemetry;
use anyhow::{bail, Result};
use std::time::Duration;

pub const DEFAULT_WORKER_COUNT: usize = 4;
const DEFAULT_INTAKE_CAPACITY: usize = 1_024;

/// Runtime configuration for the coalescing pipeline.
///
/// All instances must be constructed via [`CoalescerConfig::builder`] or [`CoalescerConfig::new`]
/// so invariants are validated before any consumer observes the values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoalescerConfig {
    worker_count: usize,
    intake_capacity: usize,
    dispatch_capacity: usize,
    completion_capacity: usize,
    metrics_interval: Duration,
}

pub struct CoalescerConfigParams {
    pub worker_count: usize,
    pub intake_capacity: usize,
    pub dispatch_capacity: usize,
    pub completion_capacity: usize,
    pub metrics_interval: Duration,
}

impl CoalescerConfig {
    /// Returns a builder to incrementally construct and validate a configuration.
    pub fn builder() -> CoalescerConfigBuilder {
        CoalescerConfigBuilder::default()
    }

    /// Constructs a configuration directly from the provided values.
    pub fn new(params: CoalescerConfigParams) -> Result<Self> {
        let CoalescerConfigParams {
            worker_count,
            intake_capacity,
            dispatch_capacity,
            completion_capacity,
            metrics_interval,
        } = params;

        let config = Self {
            worker_count,
            intake_capacity,
            dispatch_capacity,
            completion_capacity,
            metrics_interval,
        };

        config.validate()?;
        Ok(config)
    }

    /// Number of concurrent fetch executors.
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Bound of the reference intake channel. Producers wait when it is full.
    pub fn intake_capacity(&self) -> usize {
        self.intake_capacity
    }

    /// Bound of the location queue shared by the workers.
    pub fn dispatch_capacity(&self) -> usize {
        self.dispatch_capacity
    }

    /// Bound of the channel carrying completions back to the coordinator.
    pub fn completion_capacity(&self) -> usize {
        self.completion_capacity
    }

    /// Interval used by the telemetry reporter.
    pub fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    /// Performs validation on an existing configuration instance.
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            bail!("worker_count must be greater than 0");
        }

        if self.intake_capacity == 0 {
            bail!("intake_capacity must be greater than 0");
        }

        if self.dispatch_capacity == 0 {
            bail!("dispatch_capacity must be greater than 0");
        }

        if self.completion_capacity == 0 {
            bail!("completion_capacity must be greater than 0");
        }

        if self.metrics_interval.is_zero() {
            bail!("metrics_interval must be greater than 0");
        }

        Ok(())
    }
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        let worker_count = DEFAULT_WORKER_COUNT;
        Self {
            worker_count,
            intake_capacity: DEFAULT_INTAKE_CAPACITY,
            dispatch_capacity: worker_count,
            completion_capacity: worker_count,
            metrics_interval: telemetry::DEFAULT_METRICS_INTERVAL,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct CoalescerConfigBuilder {
    worker_count: Option<usize>,
    intake_capacity: Option<usize>,
    dispatch_capacity: Option<usize>,
    completion_capacity: Option<usize>,
    metrics_interval: Option<Duration>,
}

impl CoalescerConfigBuilder {
    pub fn worker_count(mut self, count: usize) -> Self {
        self.worker_count = Some(count);
        self
    }

    pub fn intake_capacity(mut self, capacity: usize) -> Self {
        self.intake_capacity = Some(capacity);
        self
    }

    pub fn dispatch_capacity(mut self, capacity: usize) -> Self {
        self.dispatch_capacity = Some(capacity);
        self
    }

    pub fn completion_capacity(mut self, capacity: usize) -> Self {
        self.completion_capacity = Some(capacity);
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    /// Queue bounds that are not set explicitly follow the worker count.
    pub fn build(self) -> Result<CoalescerConfig> {
        let worker_count = self.worker_count.unwrap_or(DEFAULT_WORKER_COUNT);
        let queue_default = worker_count.max(1);
        let params = CoalescerConfigParams {
            worker_count,
            intake_capacity: self.intake_capacity.unwrap_or(DEFAULT_INTAKE_CAPACITY),
            dispatch_capacity: self.dispatch_capacity.unwrap_or(queue_default),
            completion_capacity: self.completion_capacity.unwrap_or(queue_default),
            metrics_interval: self
                .metrics_interval
                .unwrap_or(telemetry::DEFAULT_METRICS_INTERVAL),
        };

        CoalescerConfig::new(params)
    }
}
