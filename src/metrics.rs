//! Concurrent aggregation of attack results.
//!
//! [`Metrics`] is written to by every completing attempt and frozen once by
//! [`Metrics::close`]. Counters can be read at any time; latency statistics,
//! elapsed time and rate are only defined after close.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::error::MetricsError;
use crate::models::Result as AttackResult;

/// Status bucket for attempts that never obtained an HTTP response
pub const ERROR_BUCKET: &str = "error";

/// Latency summary over every recorded attempt
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Latencies {
    pub min: Duration,
    pub mean: Duration,
    pub p50: Duration,
    pub p90: Duration,
    pub p95: Duration,
    pub p99: Duration,
    pub max: Duration,
}

#[derive(Debug, Default)]
struct Inner {
    requests: u64,
    success: u64,
    bytes_in: u64,
    bytes_out: u64,
    latencies: Vec<Duration>,
    status_codes: BTreeMap<String, u64>,
    errors: Vec<String>,
    earliest: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    summary: Option<Latencies>,
}

/// Thread-safe aggregate of one run
#[derive(Debug, Default)]
pub struct Metrics {
    inner: Mutex<Inner>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Every update leaves Inner consistent, so a poisoned lock is still usable
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record one result
    pub fn add(&self, result: AttackResult) -> Result<(), MetricsError> {
        let mut inner = self.lock();
        if inner.end.is_some() {
            return Err(MetricsError::Closed);
        }

        inner.requests += 1;
        if result.is_success() {
            inner.success += 1;
        }
        inner.bytes_in += result.bytes_in as u64;
        inner.bytes_out += result.bytes_out as u64;
        inner.latencies.push(result.latency);

        let bucket = match &result.error {
            Some(_) => ERROR_BUCKET.to_string(),
            None => result.status_code.to_string(),
        };
        *inner.status_codes.entry(bucket).or_insert(0) += 1;

        if let Some(error) = result.error {
            if !inner.errors.contains(&error) {
                inner.errors.push(error);
            }
        }

        if inner.earliest.is_none_or(|t| result.timestamp < t) {
            inner.earliest = Some(result.timestamp);
        }

        Ok(())
    }

    /// Freeze the metrics. Later calls are no-ops.
    pub fn close(&self) {
        let mut inner = self.lock();
        if inner.end.is_some() {
            return;
        }

        inner.end = Some(Utc::now());
        inner.latencies.sort_unstable();
        let summary = summarize(&inner.latencies);
        inner.summary = Some(summary);
    }

    pub fn is_closed(&self) -> bool {
        self.lock().end.is_some()
    }

    pub fn requests(&self) -> u64 {
        self.lock().requests
    }

    /// Attempts with a status code in [200, 400)
    pub fn success(&self) -> u64 {
        self.lock().success
    }

    pub fn failed(&self) -> u64 {
        let inner = self.lock();
        inner.requests - inner.success
    }

    pub fn success_ratio(&self) -> f64 {
        let inner = self.lock();
        if inner.requests == 0 {
            0.0
        } else {
            inner.success as f64 / inner.requests as f64
        }
    }

    pub fn bytes_in(&self) -> u64 {
        self.lock().bytes_in
    }

    pub fn bytes_out(&self) -> u64 {
        self.lock().bytes_out
    }

    /// Counts keyed by status code, or [`ERROR_BUCKET`]
    pub fn status_codes(&self) -> BTreeMap<String, u64> {
        self.lock().status_codes.clone()
    }

    /// Distinct error messages in first-seen order
    pub fn errors(&self) -> Vec<String> {
        self.lock().errors.clone()
    }

    pub fn latencies(&self) -> Result<Latencies, MetricsError> {
        self.lock().summary.ok_or(MetricsError::NotClosed)
    }

    /// Wall time from the first issued attempt to close
    pub fn elapsed(&self) -> Result<Duration, MetricsError> {
        let inner = self.lock();
        let end = inner.end.ok_or(MetricsError::NotClosed)?;
        Ok(match inner.earliest {
            Some(earliest) => (end - earliest).to_std().unwrap_or(Duration::ZERO),
            None => Duration::ZERO,
        })
    }

    /// Requests per second of wall time
    pub fn rate(&self) -> Result<f64, MetricsError> {
        let elapsed = self.elapsed()?.as_secs_f64();
        let requests = self.requests();
        Ok(if elapsed > 0.0 { requests as f64 / elapsed } else { 0.0 })
    }
}

fn summarize(sorted: &[Duration]) -> Latencies {
    if sorted.is_empty() {
        return Latencies::default();
    }

    let total: u128 = sorted.iter().map(Duration::as_nanos).sum();
    let mean = Duration::from_nanos((total / sorted.len() as u128) as u64);

    Latencies {
        min: sorted[0],
        mean,
        p50: percentile(sorted, 0.50),
        p90: percentile(sorted, 0.90),
        p95: percentile(sorted, 0.95),
        p99: percentile(sorted, 0.99),
        max: sorted[sorted.len() - 1],
    }
}

/// Nearest-rank percentile of a sorted sample
pub fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }

    let rank = (sorted.len() as f64 * p).ceil() as usize;
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn result(status_code: u16, latency_ms: u64) -> AttackResult {
        AttackResult {
            seq: 0,
            timestamp: Utc::now(),
            latency: Duration::from_millis(latency_ms),
            status_code,
            error: None,
            bytes_in: 10,
            bytes_out: 2,
        }
    }

    fn network_error(message: &str) -> AttackResult {
        AttackResult::failed(0, Utc::now(), Duration::from_millis(5), 0, message.to_string())
    }

    #[test]
    fn test_nearest_rank() {
        let sorted: Vec<Duration> = (1..=100).map(Duration::from_millis).collect();
        assert_eq!(percentile(&sorted, 0.50), Duration::from_millis(50));
        assert_eq!(percentile(&sorted, 0.95), Duration::from_millis(95));
        assert_eq!(percentile(&sorted, 0.99), Duration::from_millis(99));
        assert_eq!(percentile(&sorted, 1.0), Duration::from_millis(100));
        assert_eq!(percentile(&sorted, 0.0), Duration::from_millis(1));

        let ten: Vec<Duration> = (1..=10).map(Duration::from_millis).collect();
        assert_eq!(percentile(&ten, 0.95), Duration::from_millis(10));

        let one = [Duration::from_millis(7)];
        assert_eq!(percentile(&one, 0.99), Duration::from_millis(7));
        assert_eq!(percentile(&[], 0.99), Duration::ZERO);
    }

    #[test]
    fn test_accumulation() {
        let metrics = Metrics::new();
        metrics.add(result(200, 30)).unwrap();
        metrics.add(result(302, 10)).unwrap();
        metrics.add(result(404, 20)).unwrap();
        metrics.add(result(500, 40)).unwrap();
        metrics.add(network_error("Request failed: connection refused")).unwrap();
        metrics.add(network_error("Request failed: connection refused")).unwrap();
        metrics.close();

        assert_eq!(metrics.requests(), 6);
        assert_eq!(metrics.success(), 2);
        assert_eq!(metrics.failed(), 4);
        assert_eq!(metrics.bytes_in(), 40);
        assert_eq!(metrics.bytes_out(), 8);
        assert_eq!(metrics.errors(), vec!["Request failed: connection refused".to_string()]);

        let codes = metrics.status_codes();
        assert_eq!(codes.get("200"), Some(&1));
        assert_eq!(codes.get("302"), Some(&1));
        assert_eq!(codes.get("404"), Some(&1));
        assert_eq!(codes.get("500"), Some(&1));
        assert_eq!(codes.get(ERROR_BUCKET), Some(&2));
        assert!(!codes.contains_key("0"));

        let latencies = metrics.latencies().unwrap();
        assert_eq!(latencies.min, Duration::from_millis(5));
        assert_eq!(latencies.max, Duration::from_millis(40));
        assert_eq!(latencies.mean, Duration::from_nanos(18_333_333));
        assert!(latencies.min <= latencies.p95);
        assert!(latencies.p95 <= latencies.p99);
        assert!(latencies.p99 <= latencies.max);
    }

    #[test]
    fn test_lifecycle() {
        let metrics = Metrics::new();
        metrics.add(result(200, 1)).unwrap();
        assert_eq!(metrics.latencies(), Err(MetricsError::NotClosed));
        assert_eq!(metrics.rate(), Err(MetricsError::NotClosed));

        metrics.close();
        let first = metrics.latencies().unwrap();
        let elapsed = metrics.elapsed().unwrap();

        metrics.close();
        assert_eq!(metrics.latencies().unwrap(), first);
        assert_eq!(metrics.elapsed().unwrap(), elapsed);
        assert_eq!(metrics.add(result(200, 1)), Err(MetricsError::Closed));
        assert_eq!(metrics.requests(), 1);
    }

    #[test]
    fn test_empty_metrics() {
        let metrics = Metrics::new();
        metrics.close();

        assert_eq!(metrics.requests(), 0);
        assert_eq!(metrics.success_ratio(), 0.0);
        assert_eq!(metrics.latencies().unwrap(), Latencies::default());
        assert_eq!(metrics.elapsed().unwrap(), Duration::ZERO);
        assert_eq!(metrics.rate().unwrap(), 0.0);
    }

    #[test]
    fn test_rate_uses_wall_time() {
        let metrics = Metrics::new();
        let mut early = result(200, 1);
        early.timestamp = Utc::now() - chrono::Duration::seconds(2);
        metrics.add(early).unwrap();
        metrics.add(result(200, 1)).unwrap();
        metrics.close();

        let elapsed = metrics.elapsed().unwrap().as_secs_f64();
        assert!(elapsed >= 2.0);
        let rate = metrics.rate().unwrap();
        assert!((rate - 2.0 / elapsed).abs() < 1e-9);
    }

    #[test]
    fn test_concurrent_add() {
        let metrics = Arc::new(Metrics::new());
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let metrics = metrics.clone();
                std::thread::spawn(move || {
                    for i in 0..500 {
                        let status = if (worker + i) % 5 == 0 { 500 } else { 200 };
                        metrics.add(result(status, i as u64)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        metrics.close();

        assert_eq!(metrics.requests(), 4000);
        let codes = metrics.status_codes();
        assert_eq!(codes.values().sum::<u64>(), 4000);
        assert_eq!(metrics.success() + codes["500"], 4000);
        assert_eq!(metrics.success() + metrics.failed(), 4000);
    }
}
