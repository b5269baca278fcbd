//! Shared fixtures for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Semaphore;

use crate::api::{ApiError, ListingSource};
use crate::models::Record;

pub(crate) fn record_starting(start: &str) -> Record {
    Record::from_value(json!({
        "title": format!("event at {}", start),
        "start_datetime": start,
    }))
    .expect("fixture is an object")
}

type Pair = (String, String);

/// Scriptable listing source with call counters.
///
/// Every pair returns two far-future records unless overridden. A gated
/// source blocks each fetch until `release` hands out a permit.
pub(crate) struct StubSource {
    regions: Vec<String>,
    categories: Vec<String>,
    records: Mutex<HashMap<Pair, Vec<Record>>>,
    failing: Mutex<HashSet<Pair>>,
    calls: AtomicUsize,
    pair_calls: Mutex<HashMap<Pair, usize>>,
    gate: Option<Arc<Semaphore>>,
    delay: Option<Duration>,
}

impl StubSource {
    pub(crate) fn new(regions: &[&str], categories: &[&str]) -> Self {
        Self {
            regions: regions.iter().map(|s| s.to_string()).collect(),
            categories: categories.iter().map(|s| s.to_string()).collect(),
            records: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            calls: AtomicUsize::new(0),
            pair_calls: Mutex::new(HashMap::new()),
            gate: None,
            delay: None,
        }
    }

    pub(crate) fn gated(mut self) -> Self {
        self.gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn set_records(&self, region: &str, category: &str, records: Vec<Record>) {
        self.records
            .lock()
            .unwrap()
            .insert((region.to_string(), category.to_string()), records);
    }

    pub(crate) fn fail(&self, region: &str, category: &str) {
        self.failing
            .lock()
            .unwrap()
            .insert((region.to_string(), category.to_string()));
    }

    pub(crate) fn recover(&self, region: &str, category: &str) {
        self.failing
            .lock()
            .unwrap()
            .remove(&(region.to_string(), category.to_string()));
    }

    /// Let `n` blocked (or future) fetches through a gated source.
    pub(crate) fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn calls_for(&self, region: &str, category: &str) -> usize {
        self.pair_calls
            .lock()
            .unwrap()
            .get(&(region.to_string(), category.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn default_records(region: &str, category: &str) -> Vec<Record> {
        vec![
            Record::from_value(json!({
                "title": format!("{} {} first", region, category),
                "start_datetime": "2099-01-01T20:00:00Z",
            }))
            .unwrap(),
            Record::from_value(json!({
                "title": format!("{} {} second", region, category),
                "start_datetime": "2099-01-02T20:00:00Z",
            }))
            .unwrap(),
        ]
    }
}

#[async_trait]
impl ListingSource for StubSource {
    async fn fetch(&self, region: &str, category: &str) -> Result<Vec<Record>, ApiError> {
        let pair = (region.to_string(), category.to_string());
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.pair_calls.lock().unwrap().entry(pair.clone()).or_insert(0) += 1;

        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if self.failing.lock().unwrap().contains(&pair) {
            return Err(ApiError::ServerError(format!("{}/{} is down", region, category)));
        }
        Ok(self
            .records
            .lock()
            .unwrap()
            .get(&pair)
            .cloned()
            .unwrap_or_else(|| Self::default_records(region, category)))
    }

    fn supported_regions(&self) -> Vec<String> {
        self.regions.clone()
    }

    fn supported_categories(&self) -> Vec<String> {
        self.categories.clone()
    }
}
