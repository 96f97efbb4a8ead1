//! Named event meters.
//!
//! Meters are shared through a `Registry` so that every component marking a meter of the same
//! name contributes to the same count. A meter reports the mean rate of its events since it was
//! registered. Every mark is also reported through the `metrics` facade as a counter of the same
//! name, from which the installed exporter derives windowed rates.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;

/// A registry of named meters.
#[derive(Clone, Default)]
pub struct Registry {
    meters: Arc<DashMap<String, Meter>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the meter of the given name, registering it if needed.
    pub fn get_or_register(&self, name: &str) -> Meter {
        if let Some(meter) = self.meters.get(name) {
            return meter.value().clone();
        }
        self.meters
            .entry(name.to_string())
            .or_insert_with(|| {
                metrics::register_counter!(name.to_string(), metrics::Unit::Count, "number of events marked on this meter");
                Meter::new(name)
            })
            .value()
            .clone()
    }

    /// Get the meter of the given name, if registered.
    pub fn get(&self, name: &str) -> Option<Meter> {
        self.meters.get(name).map(|meter| meter.value().clone())
    }

    /// The names of all registered meters, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.meters.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }
}

/// A named meter of marked events.
#[derive(Clone, Debug)]
pub struct Meter {
    name: Arc<str>,
    count: Arc<AtomicU64>,
    registered_at: Instant,
}

impl Meter {
    fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            count: Default::default(),
            registered_at: Instant::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mark the occurrence of `n` events.
    pub fn mark(&self, n: u64) {
        self.count.fetch_add(n, Ordering::Relaxed);
        metrics::counter!(self.name.to_string(), n);
    }

    /// The total number of events marked.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// The mean number of events marked per second since this meter was registered.
    pub fn rate(&self) -> f64 {
        let elapsed = self.registered_at.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        self.count() as f64 / elapsed
    }
}
