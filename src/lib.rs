//! Loadrelay - a chat relay server with an embedded HTTP load test engine
//!
//! The engine issues requests against a single [`Target`] at a fixed rate
//! (open loop: issuance never waits on responses), aggregates every result
//! into [`Metrics`] and renders a [`Report`].
//!
//! # Example
//!
//! ```rust,no_run
//! use loadrelay::{AttackBuilder, Target};
//! use url::Url;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let target = Target::get(Url::parse("http://localhost:8000/api")?)
//!         .with_header("Content-Type", "application/json");
//!
//!     let metrics = AttackBuilder::new()
//!         .rate(50)  // 50 requests per second
//!         .duration(Duration::from_secs(30))
//!         .timeout(Duration::from_secs(5))
//!         .run(target)
//!         .await?;
//!
//!     println!("{} requests, {:.2} req/s", metrics.requests(), metrics.rate()?);
//!     Ok(())
//! }
//! ```

mod attack;
pub mod error;
pub mod metrics;
mod models;
pub mod report;
pub mod server;
pub mod utils;

// Re-export the main types for library users
pub use attack::{RESULT_CHANNEL_SIZE, attack, build_client, make_request};
pub use error::{ApiError, MetricsError, ValidationError};
pub use metrics::{Latencies, Metrics};
pub use models::{AttackConfig, EngineSettings, Header, LoadTestConfig, Result as AttackResult, Target};
pub use report::Report;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

/// Builder for configuring and running an attack
pub struct AttackBuilder {
    rate: u32,
    duration: Duration,
    timeout: Duration,
    drain_grace: Duration,
    max_workers: Option<usize>,
    settings: EngineSettings,
    keepalive: bool,
    connections: usize,
    insecure: bool,
    redirects: i32,
}

impl Default for AttackBuilder {
    fn default() -> Self {
        let settings = EngineSettings::default();
        Self {
            rate: 50,
            duration: Duration::from_secs(30),
            timeout: settings.request_timeout,
            drain_grace: settings.drain_grace,
            max_workers: None,
            settings,
            keepalive: true,
            connections: 10000,
            insecure: false,
            redirects: 10,
        }
    }
}

impl AttackBuilder {
    /// Create a new AttackBuilder with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder for a validated load test config
    pub fn from_config(config: &LoadTestConfig, settings: &EngineSettings) -> Self {
        Self::new()
            .settings(*settings)
            .rate(config.spawn_rate)
            .duration(config.duration())
    }

    /// Apply engine bounds: timeout, drain grace and worker sizing
    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.timeout = settings.request_timeout;
        self.drain_grace = settings.drain_grace;
        self.settings = settings;
        self
    }

    /// Set the request rate (requests per second)
    pub fn rate(mut self, rate: u32) -> Self {
        self.rate = rate;
        self
    }

    /// Set the issuance window
    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Set the request timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set how long in-flight requests may run once issuance stops
    pub fn drain_grace(mut self, drain_grace: Duration) -> Self {
        self.drain_grace = drain_grace;
        self
    }

    /// Override the in-flight bound derived from the rate
    pub fn max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = Some(max_workers);
        self
    }

    /// Set whether to keep connections alive
    pub fn keepalive(mut self, keepalive: bool) -> Self {
        self.keepalive = keepalive;
        self
    }

    /// Set the maximum number of idle connections per host
    pub fn connections(mut self, connections: usize) -> Self {
        self.connections = connections;
        self
    }

    /// Set whether to ignore invalid server TLS certificates
    pub fn insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    /// Set the number of redirects to follow
    pub fn redirects(mut self, redirects: i32) -> Self {
        self.redirects = redirects;
        self
    }

    /// Resolve the attack config
    pub fn config(&self) -> AttackConfig {
        AttackConfig {
            rate: self.rate,
            duration: self.duration,
            timeout: self.timeout,
            drain_grace: self.drain_grace,
            max_workers: self.max_workers.unwrap_or_else(|| self.settings.worker_bound(self.rate)),
            keepalive: self.keepalive,
            connections: self.connections,
            insecure: self.insecure,
            redirects: self.redirects,
        }
    }

    /// Start the attack and return the result stream
    pub fn start(self, target: Target) -> Result<mpsc::Receiver<AttackResult>> {
        let config = self.config();
        let client = build_client(&config)?;
        Ok(attack(client, Arc::new(target), config))
    }

    /// Run the attack to completion and return the closed metrics
    pub async fn run(self, target: Target) -> Result<Metrics> {
        let mut rx = self.start(target)?;
        let metrics = Metrics::new();

        while let Some(result) = rx.recv().await {
            metrics.add(result)?;
        }
        metrics.close();

        info!(
            event = "attack_completed",
            total_requests = metrics.requests(),
            success_requests = metrics.success(),
            failure_requests = metrics.failed(),
            message = "Load test attack completed"
        );

        Ok(metrics)
    }
}

/// Run one load test and build its report
pub async fn run_load_test(config: &LoadTestConfig, settings: &EngineSettings, target: Target) -> Result<Report> {
    let metrics = AttackBuilder::from_config(config, settings).run(target).await?;
    Ok(report::build(config, &metrics)?)
}
