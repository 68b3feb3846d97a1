use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::error::ValidationError;

/// Represents the request template repeated by every attempt of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    /// The HTTP method (GET, POST, etc.)
    pub method: String,
    /// The URL to request
    pub url: Url,
    /// HTTP headers to include in the request, in order
    pub headers: Vec<Header>,
    /// Request body
    pub body: Option<Vec<u8>>,
}

impl Target {
    /// Create a target with no headers and no body
    pub fn new(method: &str, url: Url) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            url,
            headers: Vec::new(),
            body: None,
        }
    }

    /// Create a GET target
    pub fn get(url: Url) -> Self {
        Self::new("GET", url)
    }

    /// Append a header
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push(Header {
            name: name.to_string(),
            value: value.to_string(),
        });
        self
    }

    /// Set the request body
    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }
}

/// Represents an HTTP header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Header name
    pub name: String,
    /// Header value
    pub value: String,
}

/// Represents the result of a single request attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Result {
    /// Issuance sequence number within the run
    pub seq: u64,
    /// When the request was issued
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Time from issue to completion or abandonment
    pub latency: Duration,
    /// HTTP status code, 0 when no response was obtained
    pub status_code: u16,
    /// Error message, set iff no HTTP response was obtained
    pub error: Option<String>,
    /// Size of the response body in bytes
    pub bytes_in: usize,
    /// Size of the request body in bytes
    pub bytes_out: usize,
}

impl Result {
    /// Build the result of an attempt that never produced a response
    pub fn failed(
        seq: u64,
        timestamp: chrono::DateTime<chrono::Utc>,
        latency: Duration,
        bytes_out: usize,
        error: String,
    ) -> Self {
        Self {
            seq,
            timestamp,
            latency,
            status_code: 0,
            error: Some(error),
            bytes_in: 0,
            bytes_out,
        }
    }

    /// Whether the status code falls in [200, 400)
    pub fn is_success(&self) -> bool {
        (200..400).contains(&self.status_code)
    }
}

/// Parameters of one load test run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadTestConfig {
    /// Concurrency hint, echoed in the report
    pub users: u32,
    /// Requests issued per second
    pub spawn_rate: u32,
    /// Issuance window in seconds
    pub test_time: u32,
}

impl LoadTestConfig {
    /// Build a config, rejecting any non-positive value
    pub fn new(users: u32, spawn_rate: u32, test_time: u32) -> std::result::Result<Self, ValidationError> {
        for (name, value) in [("users", users), ("spawn_rate", spawn_rate), ("test_time", test_time)] {
            if value == 0 {
                return Err(ValidationError::NotPositive {
                    name,
                    value: value.to_string(),
                });
            }
        }

        Ok(Self {
            users,
            spawn_rate,
            test_time,
        })
    }

    /// Build a config from raw query parameter values
    pub fn from_params(
        users: Option<&str>,
        spawn_rate: Option<&str>,
        test_time: Option<&str>,
    ) -> std::result::Result<Self, ValidationError> {
        let users = parse_positive("users", users)?;
        let spawn_rate = parse_positive("spawn_rate", spawn_rate)?;
        let test_time = parse_positive("test_time", test_time)?;
        Self::new(users, spawn_rate, test_time)
    }

    /// The issuance window as a duration
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.test_time as u64)
    }
}

fn parse_positive(name: &'static str, raw: Option<&str>) -> std::result::Result<u32, ValidationError> {
    let raw = match raw.map(str::trim) {
        Some(raw) if !raw.is_empty() => raw,
        _ => return Err(ValidationError::Missing(name)),
    };

    match raw.parse::<u32>() {
        Ok(0) | Err(_) => Err(ValidationError::NotPositive {
            name,
            value: raw.to_string(),
        }),
        Ok(value) => Ok(value),
    }
}

/// Engine bounds shared by every run
///
/// The in-flight bound is `rate * workers_per_rate`, clamped to
/// `[1, max_workers_cap]`. Attempts still outstanding `drain_grace` after
/// issuance stops are abandoned and recorded as timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// Per-attempt timeout
    pub request_timeout: Duration,
    /// How long to wait for in-flight attempts once issuance stops
    pub drain_grace: Duration,
    /// Upper bound on concurrently outstanding attempts
    pub max_workers_cap: usize,
    /// Outstanding attempts allowed per unit of request rate
    pub workers_per_rate: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            drain_grace: Duration::from_secs(10),
            max_workers_cap: 1000,
            workers_per_rate: 10,
        }
    }
}

impl EngineSettings {
    /// Number of attempts allowed in flight for the given rate
    pub fn worker_bound(&self, rate: u32) -> usize {
        (rate as usize)
            .saturating_mul(self.workers_per_rate)
            .clamp(1, self.max_workers_cap.max(1))
    }
}

/// Represents attack parameters
#[derive(Debug, Clone)]
pub struct AttackConfig {
    /// Rate of requests (requests per second)
    pub rate: u32,
    /// Duration of the issuance window
    pub duration: Duration,
    /// Timeout for each request
    pub timeout: Duration,
    /// Grace period for in-flight requests after issuance stops
    pub drain_grace: Duration,
    /// Maximum number of outstanding requests
    pub max_workers: usize,
    /// Whether to keep connections alive
    pub keepalive: bool,
    /// Maximum number of idle connections per host
    pub connections: usize,
    /// Ignore invalid server TLS certificates
    pub insecure: bool,
    /// Number of redirects to follow, negative disables following
    pub redirects: i32,
}
