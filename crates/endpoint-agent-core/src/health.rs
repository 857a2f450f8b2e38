//! Component health scoring: fixed per-prefix deductions, severity
//! multipliers, ring-buffered history, trend comparison, and a linear
//! regression over recent history to estimate a failure date (§4.6).

use crate::ringbuffer::RingBuffer;
use crate::types::{ComponentHealthScore, HistoryPoint, Severity, Trend};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Fixed deduction per signal metric prefix, applied before the severity
/// multiplier. Unlisted prefixes fall back to a modest default.
fn base_deduction(metric_prefix: &str) -> f64 {
    match metric_prefix {
        "smart" => 30.0,
        "ecc" => 40.0,
        "bsod" => 50.0,
        "system:cpu" | "system:memory" => 15.0,
        p if p.starts_with("disk:") => 10.0,
        p if p.starts_with("service:") => 12.0,
        _ => 5.0,
    }
}

fn severity_multiplier(severity: Severity) -> f64 {
    match severity {
        Severity::Critical => 1.5,
        Severity::Warning => 1.0,
        Severity::Info => 0.3,
    }
}

pub struct HealthTracker {
    scores: HashMap<String, ComponentHealthScore>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            scores: HashMap::new(),
        }
    }

    pub fn restore(scores: HashMap<String, ComponentHealthScore>) -> Self {
        Self { scores }
    }

    pub fn snapshot(&self) -> HashMap<String, ComponentHealthScore> {
        self.scores.clone()
    }

    pub fn get(&self, component: &str) -> Option<&ComponentHealthScore> {
        self.scores.get(component)
    }

    /// Apply a deduction for `metric_prefix` at `severity` to `component`'s
    /// score. The score never goes below 0; it recovers only through
    /// `Trend::Improving`, never by direct addition (invariant 5).
    pub fn apply_signal(&mut self, component: &str, metric_prefix: &str, severity: Severity, now: DateTime<Utc>) {
        let entry = self
            .scores
            .entry(component.to_string())
            .or_insert_with(|| ComponentHealthScore::new(component));

        let deduction = base_deduction(metric_prefix) * severity_multiplier(severity);
        entry.score = (entry.score as f64 - deduction).max(0.0).round() as i32;
        entry.factors.push(-(deduction.round() as i32));
        entry.history.push(HistoryPoint {
            timestamp: now,
            score: entry.score,
        });
        entry.trend = trend_for(&entry.history);
    }
}

/// Compare the mean of the last 5 history points to the mean of the 5
/// before that: delta < -5 is degrading, > +5 is improving, else stable.
fn trend_for(history: &RingBuffer<HistoryPoint>) -> Trend {
    let points: Vec<i32> = history.iter().map(|p| p.score).collect();
    if points.len() < 10 {
        return Trend::Stable;
    }
    let n = points.len();
    let recent = &points[n - 5..];
    let prior = &points[n - 10..n - 5];
    let recent_mean = recent.iter().sum::<i32>() as f64 / 5.0;
    let prior_mean = prior.iter().sum::<i32>() as f64 / 5.0;
    let delta = recent_mean - prior_mean;
    if delta < -5.0 {
        Trend::Degrading
    } else if delta > 5.0 {
        Trend::Improving
    } else {
        Trend::Stable
    }
}

/// Linear regression over up to the last 30 history points, `x` in days
/// since the first point, `y` = score. Returns a projected failure date
/// only if the slope is negative and the extrapolated time to reach score
/// 20 falls within `(0, 365]` days.
pub fn estimate_failure_date(history: &RingBuffer<HistoryPoint>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let all: Vec<HistoryPoint> = history.iter().copied().collect();
    if all.len() < 2 {
        return None;
    }
    let start = all.len().saturating_sub(30);
    let window = &all[start..];
    let first_ts = window.first()?.timestamp;

    let xs: Vec<f64> = window
        .iter()
        .map(|p| (p.timestamp - first_ts).num_seconds() as f64 / 86_400.0)
        .collect();
    let ys: Vec<f64> = window.iter().map(|p| p.score as f64).collect();

    let n = xs.len() as f64;
    let x_mean = xs.iter().sum::<f64>() / n;
    let y_mean = ys.iter().sum::<f64>() / n;

    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for (x, y) in xs.iter().zip(ys.iter()) {
        numerator += (x - x_mean) * (y - y_mean);
        denominator += (x - x_mean).powi(2);
    }
    if denominator == 0.0 {
        return None;
    }
    let slope = numerator / denominator;
    if slope >= 0.0 {
        return None;
    }
    let intercept = y_mean - slope * x_mean;

    // Solve slope * x + intercept = 20 for x, relative to the most recent
    // sample (xs.last()), not the regression origin.
    let x_target = (20.0 - intercept) / slope;
    let x_now = *xs.last().unwrap();
    let days_from_now = x_target - x_now;

    if days_from_now > 0.0 && days_from_now <= 365.0 {
        Some(now + chrono::Duration::seconds((days_from_now * 86_400.0) as i64))
    } else {
        None
    }
}
