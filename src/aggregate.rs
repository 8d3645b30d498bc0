//! Folds a website's tick history into the status shown to users.
//!
//! Everything here is a pure function of (ticks, now, window config) and is
//! recomputed on every read.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::config::ServerConfig;
use crate::db::{Tick, TickStatus};

/// Shape of the trailing status window.
#[derive(Debug, Clone, Copy)]
pub struct WindowConfig {
    pub bucket_width: Duration,
    pub window_count: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            bucket_width: Duration::minutes(3),
            window_count: 10,
        }
    }
}

impl From<&ServerConfig> for WindowConfig {
    fn from(cfg: &ServerConfig) -> Self {
        Self {
            bucket_width: Duration::from_std(cfg.bucket_width)
                .unwrap_or_else(|_| Duration::minutes(3)),
            window_count: cfg.window_count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowStatus {
    Good,
    Bad,
    /// No ticks at all, which is not the same as bad
    Unknown,
}

/// One slice of the trailing window, `[start, end)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowBucket {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub status: WindowStatus,
    pub good: usize,
    pub bad: usize,
    pub average_latency: f64,
}

impl WindowBucket {
    fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start,
            end,
            status: WindowStatus::Unknown,
            good: 0,
            bad: 0,
            average_latency: 0.0,
        }
    }

    fn total(&self) -> usize {
        self.good + self.bad
    }
}

/// Aggregated view of one website.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    /// Status of the most recent bucket
    pub status: WindowStatus,
    pub uptime_percentage: f64,
    pub average_response_time: f64,
    pub last_response_time: u64,
    pub last_checked: Option<DateTime<Utc>>,
    /// Bucket statuses, oldest first
    pub uptime_ticks: Vec<WindowStatus>,
    pub buckets: Vec<WindowBucket>,
    pub total_checks: usize,
    pub successful_checks: usize,
    pub failed_checks: usize,
}

/// Status of a bucket holding `good` of `total` ticks. Ties count as good.
pub fn bucket_status(good: usize, total: usize) -> WindowStatus {
    if total == 0 {
        WindowStatus::Unknown
    } else if 2 * good >= total {
        WindowStatus::Good
    } else {
        WindowStatus::Bad
    }
}

/// Percentage of good ticks; 100 when there are none.
pub fn uptime_percentage(good: usize, total: usize) -> f64 {
    if total == 0 {
        100.0
    } else {
        100.0 * good as f64 / total as f64
    }
}

/// Summarize a tick history as of `now`. The input order does not matter.
pub fn summarize(ticks: &[Tick], now: DateTime<Utc>, cfg: &WindowConfig) -> Summary {
    let buckets = bucketize(ticks, now, cfg);

    let total = ticks.len();
    let good = ticks.iter().filter(|t| t.status == TickStatus::Good).count();
    let latency_sum: u128 = ticks.iter().map(|t| u128::from(t.latency)).sum();
    let average_response_time = if total == 0 {
        0.0
    } else {
        latency_sum as f64 / total as f64
    };

    // Latest by timestamp, not by position in the history
    let last = ticks.iter().max_by_key(|t| t.timestamp);

    Summary {
        status: buckets
            .last()
            .map(|b| b.status)
            .unwrap_or(WindowStatus::Unknown),
        uptime_percentage: uptime_percentage(good, total),
        average_response_time,
        last_response_time: last.map(|t| t.latency).unwrap_or(0),
        last_checked: last.map(|t| t.timestamp),
        uptime_ticks: buckets.iter().map(|b| b.status).collect(),
        buckets,
        total_checks: total,
        successful_checks: good,
        failed_checks: total - good,
    }
}

/// Split the trailing window into buckets, oldest first.
///
/// Bucket `i` covers `[now - (n - i) * w, now - (n - 1 - i) * w)`.
fn bucketize(ticks: &[Tick], now: DateTime<Utc>, cfg: &WindowConfig) -> Vec<WindowBucket> {
    let n = cfg.window_count;
    let width = cfg.bucket_width;
    let width_ms = width.num_milliseconds();
    if n == 0 || width_ms <= 0 {
        return Vec::new();
    }

    let window_start = now - width * n as i32;
    let mut buckets: Vec<WindowBucket> = (0..n)
        .map(|i| {
            let start = window_start + width * i as i32;
            WindowBucket::new(start, start + width)
        })
        .collect();
    let mut latency_sums = vec![0u128; n];

    for tick in ticks {
        if tick.timestamp < window_start || tick.timestamp >= now {
            continue;
        }
        let offset_ms = (tick.timestamp - window_start).num_milliseconds();
        let idx = ((offset_ms / width_ms) as usize).min(n - 1);

        let bucket = &mut buckets[idx];
        match tick.status {
            TickStatus::Good => bucket.good += 1,
            TickStatus::Bad => bucket.bad += 1,
        }
        latency_sums[idx] += u128::from(tick.latency);
    }

    for (bucket, sum) in buckets.iter_mut().zip(latency_sums) {
        let total = bucket.total();
        bucket.status = bucket_status(bucket.good, total);
        if total > 0 {
            bucket.average_latency = sum as f64 / total as f64;
        }
    }

    buckets
}
