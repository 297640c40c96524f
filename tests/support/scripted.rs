use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail};
use coalescer::{
    Delivery, FetchProtocol, ProtocolError, ProtocolFetchFuture, ProtocolFuture, ProtocolStage,
    ResolutionFailure,
};
use tokio::sync::Semaphore;

/// Reference used by the integration tests: an id plus the location it resolves to.
/// References without a target fail resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Req {
    pub id: u64,
    pub target: Option<&'static str>,
}

impl Req {
    pub fn to(id: u64, target: &'static str) -> Self {
        Self {
            id,
            target: Some(target),
        }
    }

    pub fn unresolvable(id: u64) -> Self {
        Self { id, target: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRecord {
    pub reference: u64,
    pub location: &'static str,
    pub outcome: Result<String, String>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LocationStats {
    pub started: usize,
    pub active: usize,
    pub max_active: usize,
}

/// Per-location fetch accounting shared with in-flight fetch futures.
#[derive(Debug, Default)]
pub struct FetchStats {
    locations: Mutex<HashMap<&'static str, LocationStats>>,
}

impl FetchStats {
    fn enter(self: &Arc<Self>, location: &'static str) -> ActiveFetch {
        let mut locations = self.locations.lock().unwrap();
        let stats = locations.entry(location).or_default();
        stats.started += 1;
        stats.active += 1;
        stats.max_active = stats.max_active.max(stats.active);
        ActiveFetch {
            stats: self.clone(),
            location,
        }
    }

    pub fn get(&self, location: &'static str) -> LocationStats {
        self.locations
            .lock()
            .unwrap()
            .get(location)
            .copied()
            .unwrap_or_default()
    }

    pub fn started(&self, location: &'static str) -> usize {
        self.get(location).started
    }

    pub fn total_started(&self) -> usize {
        self.locations
            .lock()
            .unwrap()
            .values()
            .map(|stats| stats.started)
            .sum()
    }

    pub fn max_active_per_location(&self) -> usize {
        self.locations
            .lock()
            .unwrap()
            .values()
            .map(|stats| stats.max_active)
            .max()
            .unwrap_or(0)
    }
}

struct ActiveFetch {
    stats: Arc<FetchStats>,
    location: &'static str,
}

impl Drop for ActiveFetch {
    fn drop(&mut self) {
        if let Some(stats) = self.stats.locations.lock().unwrap().get_mut(self.location) {
            stats.active -= 1;
        }
    }
}

/// Protocol whose fetches can be held back per location, fail on demand, and
/// whose deliveries are recorded in order.
#[derive(Default)]
pub struct ScriptedProtocol {
    gates: HashMap<&'static str, Arc<Semaphore>>,
    failing: HashSet<&'static str>,
    fetch_delay: Option<Duration>,
    fail_process_for: Option<u64>,
    stats: Arc<FetchStats>,
    deliveries: Vec<DeliveryRecord>,
    unresolved: Vec<u64>,
    shutdowns: usize,
}

impl ScriptedProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    /// Holds every fetch of `location` until a permit is added to the returned semaphore.
    pub fn gate(&mut self, location: &'static str) -> Arc<Semaphore> {
        self.gates
            .entry(location)
            .or_insert_with(|| Arc::new(Semaphore::new(0)))
            .clone()
    }

    pub fn with_failure(mut self, location: &'static str) -> Self {
        self.failing.insert(location);
        self
    }

    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = Some(delay);
        self
    }

    pub fn failing_process_for(mut self, reference: u64) -> Self {
        self.fail_process_for = Some(reference);
        self
    }

    pub fn stats(&self) -> Arc<FetchStats> {
        self.stats.clone()
    }

    pub fn deliveries(&self) -> &[DeliveryRecord] {
        &self.deliveries
    }

    pub fn unresolved(&self) -> &[u64] {
        &self.unresolved
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns
    }
}

impl FetchProtocol for ScriptedProtocol {
    type Reference = Req;
    type Location = &'static str;
    type Content = String;

    fn resolve(&self, reference: &Req) -> anyhow::Result<&'static str> {
        reference
            .target
            .ok_or_else(|| anyhow!("reference {} has no target", reference.id))
    }

    fn fetch(&self, location: &'static str) -> ProtocolFetchFuture<String> {
        let gate = self.gates.get(location).cloned();
        let fail = self.failing.contains(location);
        let delay = self.fetch_delay;
        let stats = self.stats.clone();

        Box::pin(async move {
            let _active = stats.enter(location);
            if let Some(gate) = gate {
                gate.acquire().await?.forget();
            }
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if fail {
                bail!("{location} is unreachable");
            }
            Ok::<_, anyhow::Error>(format!("content:{location}"))
        })
    }

    fn process<'a>(&'a mut self, reference: Req, delivery: Delivery<String>) -> ProtocolFuture<'a> {
        Box::pin(async move {
            if self.fail_process_for == Some(reference.id) {
                return Err(ProtocolError::new(
                    ProtocolStage::Process,
                    anyhow!("sink rejected reference {}", reference.id),
                ));
            }

            let outcome = delivery
                .map(|content| content.as_ref().clone())
                .map_err(|failure| failure.to_string());
            self.deliveries.push(DeliveryRecord {
                reference: reference.id,
                location: reference.target.unwrap_or("<none>"),
                outcome,
            });
            Ok(())
        })
    }

    fn unresolved<'a>(&'a mut self, failure: ResolutionFailure<Req>) -> ProtocolFuture<'a> {
        Box::pin(async move {
            self.unresolved.push(failure.reference().id);
            Ok(())
        })
    }

    fn shutdown<'a>(&'a mut self) -> ProtocolFuture<'a> {
        Box::pin(async move {
            self.shutdowns += 1;
            Ok(())
        })
    }
}
