//! Thread-safe latest-sample snapshot across all metric families. Feeds
//! the rule engine and profiler each tick; never synthesizes a value for a
//! collector that failed — the previous reading is retained and marked
//! stale.

use crate::types::Sample;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct StoredSample {
    sample: Sample,
    stored_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SnapshotEntry {
    pub sample: Sample,
    pub age: chrono::Duration,
    pub stale: bool,
}

#[derive(Debug, Default)]
pub struct Snapshot {
    pub entries: HashMap<String, SnapshotEntry>,
}

impl Snapshot {
    pub fn get(&self, metric_key: &str) -> Option<&SnapshotEntry> {
        self.entries.get(metric_key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &SnapshotEntry)> {
        self.entries.iter()
    }
}

/// Staleness cutoff: a sample older than this is flagged stale but still
/// returned — collectors typically report at 15-60s cadence.
const STALE_AFTER: chrono::Duration = chrono::Duration::seconds(180);

pub struct MetricStore {
    samples: RwLock<HashMap<String, StoredSample>>,
}

impl Default for MetricStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricStore {
    pub fn new() -> Self {
        Self {
            samples: RwLock::new(HashMap::new()),
        }
    }

    pub async fn put(&self, sample: Sample) {
        let mut samples = self.samples.write().await;
        samples.insert(
            sample.metric_key.clone(),
            StoredSample {
                sample,
                stored_at: Utc::now(),
            },
        );
    }

    pub async fn put_all(&self, batch: Vec<Sample>) {
        let mut samples = self.samples.write().await;
        for sample in batch {
            samples.insert(
                sample.metric_key.clone(),
                StoredSample {
                    sample,
                    stored_at: Utc::now(),
                },
            );
        }
    }

    /// The latest coherent reading across all metric families, with
    /// per-entry staleness visible to consumers.
    pub async fn snapshot(&self) -> Snapshot {
        let samples = self.samples.read().await;
        let now = Utc::now();
        let entries = samples
            .iter()
            .map(|(key, stored)| {
                let age = now - stored.stored_at;
                (
                    key.clone(),
                    SnapshotEntry {
                        sample: stored.sample.clone(),
                        age,
                        stale: age > STALE_AFTER,
                    },
                )
            })
            .collect();
        Snapshot { entries }
    }
}
