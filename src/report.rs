use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::MetricsError;
use crate::metrics::{ERROR_BUCKET, Metrics};
use crate::models::LoadTestConfig;
use crate::utils::{format_duration, nanos};

/// Outcome of one load test run, as returned by `GET /api/load-test`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub test_duration: u32,
    pub total_requests: i64,
    pub successful_requests: i64,
    pub failed_requests: i64,
    pub requests_per_second: f64,
    pub concurrent_users: u32,
    pub response_time: ResponseTime,
    pub errors: Vec<ErrorDetail>,
}

/// Latency summary, each value in nanoseconds on the wire
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseTime {
    #[serde(with = "nanos")]
    pub min: Duration,
    #[serde(with = "nanos")]
    pub max: Duration,
    #[serde(with = "nanos")]
    pub mean: Duration,
    #[serde(with = "nanos")]
    pub p95: Duration,
    #[serde(with = "nanos")]
    pub p99: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub name: String,
    pub count: i64,
    pub error_type: String,
}

/// Build the report of a closed run
pub fn build(config: &LoadTestConfig, metrics: &Metrics) -> Result<Report, MetricsError> {
    let latencies = metrics.latencies()?;
    let rate = metrics.rate()?;

    let total = metrics.requests() as i64;
    let success = metrics.success() as i64;

    // BTreeMap order keeps numeric buckets ahead of the error sentinel
    let errors = metrics
        .status_codes()
        .into_iter()
        .filter(|(_, count)| *count > 0)
        .filter_map(|(bucket, count)| error_detail(&bucket, count))
        .collect();

    Ok(Report {
        test_duration: config.test_time,
        total_requests: total,
        successful_requests: success,
        failed_requests: total - success,
        requests_per_second: rate,
        concurrent_users: config.users,
        response_time: ResponseTime {
            min: latencies.min,
            max: latencies.max,
            mean: latencies.mean,
            p95: latencies.p95,
            p99: latencies.p99,
        },
        errors,
    })
}

fn error_detail(bucket: &str, count: u64) -> Option<ErrorDetail> {
    if bucket == ERROR_BUCKET {
        return Some(ErrorDetail {
            name: "Network Error".to_string(),
            count: count as i64,
            error_type: "Network Error".to_string(),
        });
    }

    match bucket.parse::<u16>() {
        Ok(status) if status >= 400 => Some(ErrorDetail {
            name: format!("HTTP {}", status),
            count: count as i64,
            error_type: "HTTP Error".to_string(),
        }),
        _ => None,
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Load Test Results:")?;
        writeln!(f, "-----------------")?;
        writeln!(f, "Duration:\t\t{} seconds", self.test_duration)?;
        writeln!(f, "Total Requests:\t\t{}", self.total_requests)?;
        writeln!(f, "Successful Requests:\t{}", self.successful_requests)?;
        writeln!(f, "Failed Requests:\t{}", self.failed_requests)?;
        writeln!(f, "Requests/second:\t{:.2}", self.requests_per_second)?;
        writeln!(f, "Concurrent Users:\t{}", self.concurrent_users)?;
        writeln!(f)?;
        writeln!(f, "Response Times:")?;
        writeln!(f, "--------------")?;
        writeln!(f, "Min:\t\t{}", format_duration(self.response_time.min))?;
        writeln!(f, "Max:\t\t{}", format_duration(self.response_time.max))?;
        writeln!(f, "Mean:\t\t{}", format_duration(self.response_time.mean))?;
        writeln!(f, "P95:\t\t{}", format_duration(self.response_time.p95))?;
        writeln!(f, "P99:\t\t{}", format_duration(self.response_time.p99))?;

        if !self.errors.is_empty() {
            writeln!(f)?;
            writeln!(f, "Errors:")?;
            writeln!(f, "-------")?;
            for error in &self.errors {
                writeln!(f, "{}\t{}\t({})", error.name, error.count, error.error_type)?;
            }
        }

        Ok(())
    }
}
