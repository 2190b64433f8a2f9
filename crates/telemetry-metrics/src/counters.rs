//! Hand-rolled atomic counters and gauges, no metrics crate (§5 "self-telemetry
//! counters use atomic integer operations... no global locks on the hot
//! path"). Per-label storage is a `RwLock<HashMap<..>>`, read-heavy and only
//! write-locked when a brand new label value is seen for the first time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

#[derive(Default)]
pub(crate) struct CounterVec {
    values: RwLock<HashMap<String, AtomicU64>>,
}

impl CounterVec {
    pub(crate) fn incr(&self, label: &str, n: u64) {
        if let Some(counter) = self.values.read().unwrap().get(label) {
            counter.fetch_add(n, Ordering::Relaxed);
            return;
        }
        let mut values = self.values.write().unwrap();
        values
            .entry(label.to_owned())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> Vec<(String, u64)> {
        self.values
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect()
    }
}

#[derive(Default)]
pub(crate) struct GaugeVec {
    values: RwLock<HashMap<String, AtomicU64>>,
}

impl GaugeVec {
    pub(crate) fn set(&self, label: &str, value: u64) {
        if let Some(gauge) = self.values.read().unwrap().get(label) {
            gauge.store(value, Ordering::Relaxed);
            return;
        }
        let mut values = self.values.write().unwrap();
        values
            .entry(label.to_owned())
            .or_insert_with(|| AtomicU64::new(0))
            .store(value, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> Vec<(String, u64)> {
        self.values
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect()
    }
}

/// Per-label running sum and count, for a Prometheus-summary-style average
/// (`backend_latency_seconds`).
#[derive(Default)]
pub(crate) struct LatencyVec {
    sum_micros: RwLock<HashMap<String, AtomicU64>>,
    count: RwLock<HashMap<String, AtomicU64>>,
}

impl LatencyVec {
    pub(crate) fn observe(&self, label: &str, duration: std::time::Duration) {
        let micros = duration.as_micros().min(u128::from(u64::MAX)) as u64;
        Self::bump(&self.sum_micros, label, micros);
        Self::bump(&self.count, label, 1);
    }

    fn bump(map: &RwLock<HashMap<String, AtomicU64>>, label: &str, n: u64) {
        if let Some(counter) = map.read().unwrap().get(label) {
            counter.fetch_add(n, Ordering::Relaxed);
            return;
        }
        let mut values = map.write().unwrap();
        values
            .entry(label.to_owned())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(n, Ordering::Relaxed);
    }

    /// `(label, sum_seconds, count)` per label.
    pub(crate) fn snapshot(&self) -> Vec<(String, f64, u64)> {
        let sums = self.sum_micros.read().unwrap();
        let counts = self.count.read().unwrap();
        sums.iter()
            .map(|(label, sum)| {
                let count = counts.get(label).map(|c| c.load(Ordering::Relaxed)).unwrap_or(0);
                let seconds = sum.load(Ordering::Relaxed) as f64 / 1_000_000.0;
                (label.clone(), seconds, count)
            })
            .collect()
    }
}
