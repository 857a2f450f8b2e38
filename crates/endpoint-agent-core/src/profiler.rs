//! Behavioral profiler: per-(metric, hour, weekday) streaming mean/variance
//! via Welford's algorithm, with cross-day and monthly fallbacks to
//! suppress signals that are normal for the time of week. Crash-safe JSON
//! persistence every 5 minutes and on graceful stop.

use crate::types::{ProfileBucket, ProfileKey};
use chrono::{DateTime, Datelike, Timelike, Utc};
use endpoint_agent_common::persistence::{atomic_write_json, load_json};
use endpoint_agent_common::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;

pub const MIN_SAMPLES: u64 = 50;
pub const Z_THRESHOLD: f64 = 2.5;
const MONTHLY_MIN_SAMPLES: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Anomalous,
    WithinNormal,
    WithinNormalCrossDayFallback,
    WithinNormalMonthlyFallback,
    InsufficientData,
}

impl Verdict {
    pub fn is_anomalous(&self) -> bool {
        matches!(self, Verdict::Anomalous)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct OverallStat {
    n: u64,
    mean: f64,
    m2: f64,
}

impl OverallStat {
    fn update(&mut self, value: f64) {
        self.n += 1;
        let delta = value - self.mean;
        self.mean += delta / self.n as f64;
        let delta2 = value - self.mean;
        self.m2 += delta * delta2;
    }

    fn stddev(&self) -> f64 {
        if self.n == 0 {
            0.0
        } else {
            (self.m2 / self.n as f64).sqrt()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MonthlyProfiles {
    monthly_buckets: HashMap<String, [OverallStat; 12]>,
    overall_means: HashMap<String, OverallStat>,
}

impl Default for MonthlyProfiles {
    fn default() -> Self {
        Self {
            monthly_buckets: HashMap::new(),
            overall_means: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProfilerStats {
    month_tag: String,
    suppression_monthly: u64,
    suppression_lifetime: u64,
}

impl ProfilerStats {
    fn new(month_tag: String) -> Self {
        Self {
            month_tag,
            suppression_monthly: 0,
            suppression_lifetime: 0,
        }
    }
}

fn month_tag_for(now: DateTime<Utc>) -> String {
    format!("{:04}-{:02}", now.year(), now.month())
}

pub struct Profiler {
    data_dir: PathBuf,
    buckets: RwLock<HashMap<(String, ProfileKey), ProfileBucket>>,
    process_frequency: RwLock<HashMap<String, u64>>,
    monthly: RwLock<MonthlyProfiles>,
    stats: RwLock<ProfilerStats>,
    top_process_count: usize,
}

fn bucket_key(metric: &str, key: ProfileKey) -> String {
    format!("{metric}@{}:{}", key.hour, if key.is_weekday { "wd" } else { "we" })
}

impl Profiler {
    pub fn new(data_dir: PathBuf, top_process_count: usize) -> Self {
        Self {
            data_dir,
            buckets: RwLock::new(HashMap::new()),
            process_frequency: RwLock::new(HashMap::new()),
            monthly: RwLock::new(MonthlyProfiles::default()),
            stats: RwLock::new(ProfilerStats::new(month_tag_for(Utc::now()))),
            top_process_count,
        }
    }

    fn buckets_path(&self) -> PathBuf {
        self.data_dir.join("behavioral-profiles.json")
    }

    fn process_frequency_path(&self) -> PathBuf {
        self.data_dir.join("process-frequency.json")
    }

    fn monthly_path(&self) -> PathBuf {
        self.data_dir.join("monthly-profiles.json")
    }

    fn stats_path(&self) -> PathBuf {
        self.data_dir.join("profiler-stats.json")
    }

    /// Load persisted state. I/O failures are logged and the profiler
    /// starts cold rather than ever crashing the process.
    pub async fn load(&self) {
        if let Ok(buckets) = load_json::<Vec<ProfileBucket>>(&self.buckets_path()).await {
            let mut map = self.buckets.write().await;
            for bucket in buckets {
                map.insert((bucket.metric.clone(), bucket.key), bucket);
            }
        }
        if let Ok(freq) = load_json::<HashMap<String, u64>>(&self.process_frequency_path()).await {
            *self.process_frequency.write().await = freq;
        }
        if let Ok(monthly) = load_json::<MonthlyProfiles>(&self.monthly_path()).await {
            *self.monthly.write().await = monthly;
        }
        if let Ok(mut stats) = load_json::<ProfilerStats>(&self.stats_path()).await {
            let current_tag = month_tag_for(Utc::now());
            if stats.month_tag != current_tag {
                // UTC YYYY-MM mismatch: clear monthly counters, keep lifetime total.
                stats.suppression_monthly = 0;
                stats.month_tag = current_tag;
            }
            *self.stats.write().await = stats;
        }
    }

    /// Persist the full bucket set and ancillary structures atomically.
    /// Failure is the profiler's problem alone: log and continue serving
    /// queries from memory.
    pub async fn flush(&self) -> Result<()> {
        let buckets: Vec<ProfileBucket> = self.buckets.read().await.values().cloned().collect();
        atomic_write_json(&self.buckets_path(), &buckets, false).await?;

        let freq = self.process_frequency.read().await.clone();
        atomic_write_json(&self.process_frequency_path(), &freq, false).await?;

        let monthly = self.monthly.read().await;
        atomic_write_json(&self.monthly_path(), &*monthly, false).await?;
        drop(monthly);

        let stats = self.stats.read().await;
        atomic_write_json(&self.stats_path(), &*stats, false).await?;

        Ok(())
    }

    fn profile_key_for(now: DateTime<Utc>) -> ProfileKey {
        let weekday = now.weekday().number_from_monday();
        ProfileKey {
            hour: now.hour() as u8,
            is_weekday: weekday <= 5,
        }
    }

    /// Record one sample, updating the primary bucket, the overall/monthly
    /// stats, and (if this is a process metric) the process frequency
    /// counter.
    pub async fn record(&self, metric: &str, value: f64, observed_at: DateTime<Utc>) {
        let key = Self::profile_key_for(observed_at);
        {
            let mut buckets = self.buckets.write().await;
            let bucket = buckets
                .entry((metric.to_string(), key))
                .or_insert_with(|| ProfileBucket::new(metric, key, observed_at));
            bucket.n += 1;
            let delta = value - bucket.mean;
            bucket.mean += delta / bucket.n as f64;
            let delta2 = value - bucket.mean;
            bucket.m2 += delta * delta2;
            bucket.min = bucket.min.min(value);
            bucket.max = bucket.max.max(value);
            bucket.last_updated = observed_at;
        }

        {
            let mut monthly = self.monthly.write().await;
            let overall = monthly.overall_means.entry(metric.to_string()).or_default();
            let overall_mean_before = overall.mean;
            overall.update(value);

            let month_idx = observed_at.month0() as usize;
            let bucket_array = monthly
                .monthly_buckets
                .entry(metric.to_string())
                .or_insert_with(|| std::array::from_fn(|_| OverallStat::default()));
            bucket_array[month_idx].update(value - overall_mean_before);
        }
    }

    /// Track process observation; the top-N most frequent names get their
    /// own `process:<name>:cpu`/`process:<name>:memory` profiles via the
    /// rule engine feeding back through `record`.
    pub async fn observe_process(&self, name: &str) {
        let mut freq = self.process_frequency.write().await;
        *freq.entry(name.to_string()).or_insert(0) += 1;
    }

    pub async fn top_processes(&self) -> Vec<String> {
        let freq = self.process_frequency.read().await;
        let mut entries: Vec<(&String, &u64)> = freq.iter().collect();
        entries.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        entries
            .into_iter()
            .take(self.top_process_count)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// `isAnomalous(metric, value)` per §4.2.
    pub async fn is_anomalous(&self, metric: &str, value: f64, observed_at: DateTime<Utc>) -> Verdict {
        let primary_key = Self::profile_key_for(observed_at);
        let buckets = self.buckets.read().await;

        let primary = match buckets.get(&(metric.to_string(), primary_key)) {
            Some(b) => b,
            None => return Verdict::InsufficientData,
        };

        if primary.n < MIN_SAMPLES {
            return Verdict::InsufficientData;
        }

        let primary_anomalous = Self::bucket_says_anomalous(primary, value);
        if !primary_anomalous {
            return Verdict::WithinNormal;
        }

        // Cross-day fallback: opposite weekday/weekend, same hour.
        let cross_key = ProfileKey {
            hour: primary_key.hour,
            is_weekday: !primary_key.is_weekday,
        };
        if let Some(cross) = buckets.get(&(metric.to_string(), cross_key)) {
            if cross.n >= MIN_SAMPLES && !Self::bucket_says_anomalous(cross, value) {
                self.record_suppression().await;
                return Verdict::WithinNormalCrossDayFallback;
            }
        }

        drop(buckets);

        // Monthly fallback: both primary and cross-day agree anomalous
        // (cross-day either absent/insufficient or also anomalous).
        let monthly = self.monthly.read().await;
        if let (Some(overall), Some(bucket_array)) = (
            monthly.overall_means.get(metric),
            monthly.monthly_buckets.get(metric),
        ) {
            let month_bucket = &bucket_array[observed_at.month0() as usize];
            if month_bucket.n >= MONTHLY_MIN_SAMPLES {
                let expected = overall.mean + month_bucket.mean;
                let stddev = month_bucket.stddev();
                let z = if stddev < 1e-3 {
                    if (value - expected).abs() > 0.5 {
                        Z_THRESHOLD + 1.0
                    } else {
                        0.0
                    }
                } else {
                    (value - expected) / stddev
                };
                if z.abs() <= Z_THRESHOLD {
                    drop(monthly);
                    self.record_suppression().await;
                    return Verdict::WithinNormalMonthlyFallback;
                }
            }
        }

        Verdict::Anomalous
    }

    fn bucket_says_anomalous(bucket: &ProfileBucket, value: f64) -> bool {
        let sigma = bucket.stddev();
        if sigma < 1e-3 {
            (value - bucket.mean).abs() > 0.5
        } else {
            let z = (value - bucket.mean) / sigma;
            z > Z_THRESHOLD
        }
    }

    async fn record_suppression(&self) {
        let mut stats = self.stats.write().await;
        stats.suppression_monthly += 1;
        stats.suppression_lifetime += 1;
    }
}
