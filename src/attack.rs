use anyhow::{Context, Result};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio::time::{self, Instant};
use tracing::{debug, info};

use crate::models::{AttackConfig, Result as AttackResult, Target};

/// Capacity of the channel between attempts and the consumer
pub const RESULT_CHANNEL_SIZE: usize = 1000;

/// Build the HTTP client used by every attempt of a run
pub fn build_client(config: &AttackConfig) -> Result<Client> {
    let mut client_builder = Client::builder()
        .timeout(config.timeout)
        .pool_max_idle_per_host(config.connections);

    if !config.keepalive {
        client_builder = client_builder.pool_max_idle_per_host(0);
    }

    if config.insecure {
        client_builder = client_builder.danger_accept_invalid_certs(true);
    }

    // Set up redirects policy
    if config.redirects >= 0 {
        client_builder = client_builder.redirect(reqwest::redirect::Policy::limited(config.redirects as usize));
    } else {
        client_builder = client_builder.redirect(reqwest::redirect::Policy::none());
    }

    client_builder.build().context("Failed to build HTTP client")
}

/// Start an open-loop attack against `target`
///
/// One attempt is issued every `1 / rate` seconds until `duration` elapses.
/// Results are delivered in completion order, and the returned stream ends
/// only after every dispatched attempt has reported. Dropping the receiver
/// stops issuance. Must be called from within a Tokio runtime.
pub fn attack(client: Client, target: Arc<Target>, config: AttackConfig) -> mpsc::Receiver<AttackResult> {
    let (tx, rx) = mpsc::channel::<AttackResult>(RESULT_CHANNEL_SIZE);

    if config.rate == 0 || config.duration.is_zero() {
        debug!(
            event = "attack_skipped",
            rate = config.rate,
            duration_ms = config.duration.as_millis() as u64,
            message = "Nothing to dispatch"
        );
        return rx;
    }

    tokio::spawn(issue(client, target, config, tx));
    rx
}

async fn issue(client: Client, target: Arc<Target>, config: AttackConfig, tx: mpsc::Sender<AttackResult>) {
    // Calculate delay between requests based on rate
    let delay = Duration::from_secs_f64(1.0 / config.rate as f64).max(Duration::from_nanos(1));

    let max_workers = config.max_workers.max(1);
    let worker_semaphore = Arc::new(Semaphore::new(max_workers));

    let mut interval = time::interval(delay);
    let start_time = Instant::now();
    let end_time = start_time + config.duration;
    let drain_cutoff = end_time + config.drain_grace;
    let mut request_count: u64 = 0;

    info!(
        event = "attack_started",
        rate = config.rate,
        duration_ms = config.duration.as_millis() as u64,
        max_workers = max_workers,
        method = target.method.as_str(),
        url = %target.url,
        message = "Starting load test attack"
    );

    loop {
        tokio::select! {
            biased;
            _ = tx.closed() => {
                info!(event = "attack_cancelled", dispatched = request_count, message = "Result receiver dropped, stopping issuance");
                break;
            }
            _ = interval.tick() => {}
        }

        if Instant::now() >= end_time {
            break;
        }

        // Acquire a permit before spawning, waiting if every worker is busy
        let permit = match worker_semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                debug!(
                    event = "workers_saturated",
                    max_workers = max_workers,
                    message = "All workers busy, delaying issuance"
                );
                tokio::select! {
                    biased;
                    _ = tx.closed() => {
                        info!(event = "attack_cancelled", dispatched = request_count, message = "Result receiver dropped, stopping issuance");
                        break;
                    }
                    permit = worker_semaphore.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                }
            }
        };

        // The wait for a permit may have outlived the issuance window
        if Instant::now() >= end_time {
            break;
        }

        let seq = request_count;
        let timestamp = chrono::Utc::now();
        let began = Instant::now();
        let timeout = config.timeout;
        let client = client.clone();
        let target = target.clone();
        let tx = tx.clone();

        tokio::spawn(async move {
            let result = attempt(&client, &target, seq, timestamp, began, timeout, drain_cutoff).await;
            drop(permit);
            if tx.send(result).await.is_err() {
                debug!(event = "result_dropped", seq = seq, message = "Result receiver gone");
            }
        });

        request_count += 1;
    }

    info!(
        event = "attack_draining",
        dispatched = request_count,
        in_flight = max_workers - worker_semaphore.available_permits(),
        message = "Issuance stopped, draining in-flight requests"
    );
}

/// Run one attempt under its hard deadline
async fn attempt(
    client: &Client,
    target: &Target,
    seq: u64,
    timestamp: chrono::DateTime<chrono::Utc>,
    began: Instant,
    timeout: Duration,
    drain_cutoff: Instant,
) -> AttackResult {
    let request_deadline = began + timeout;
    let deadline = request_deadline.min(drain_cutoff);

    match time::timeout_at(deadline, make_request(client, target, seq, timestamp, began)).await {
        Ok(result) => result,
        Err(_) => {
            let error = if deadline < request_deadline {
                "Request abandoned after drain grace period".to_string()
            } else {
                format!("Request timed out after {}", humantime::format_duration(timeout))
            };
            let bytes_out = target.body.as_ref().map(|b| b.len()).unwrap_or(0);
            AttackResult::failed(seq, timestamp, began.elapsed(), bytes_out, error)
        }
    }
}

/// Make a single HTTP request
pub async fn make_request(
    client: &Client,
    target: &Target,
    seq: u64,
    timestamp: chrono::DateTime<chrono::Utc>,
    began: Instant,
) -> AttackResult {
    let bytes_out = target.body.as_ref().map(|b| b.len()).unwrap_or(0);

    let method = match reqwest::Method::from_bytes(target.method.as_bytes()) {
        Ok(method) => method,
        Err(e) => {
            return AttackResult::failed(seq, timestamp, began.elapsed(), bytes_out, format!("Invalid method {:?}: {}", target.method, e));
        }
    };

    let mut request_builder = client.request(method, target.url.clone());

    // Add headers from target
    for header in &target.headers {
        request_builder = request_builder.header(&header.name, &header.value);
    }

    // Add body if present
    if let Some(body) = &target.body {
        request_builder = request_builder.body(body.clone());
    }

    let response = match request_builder.send().await {
        Ok(response) => response,
        Err(e) => {
            debug!(event = "request_error", seq = seq, error = %e, message = "Request failed with error");
            return AttackResult::failed(seq, timestamp, began.elapsed(), bytes_out, format!("Request failed: {}", e));
        }
    };

    let status_code = response.status().as_u16();

    // A body cut off mid-transfer counts as no usable response
    match response.bytes().await {
        Ok(body_bytes) => AttackResult {
            seq,
            timestamp,
            latency: began.elapsed(),
            status_code,
            error: None,
            bytes_in: body_bytes.len(),
            bytes_out,
        },
        Err(e) => {
            debug!(event = "request_error", seq = seq, status_code = status_code, error = %e, message = "Failed to read response body");
            AttackResult::failed(seq, timestamp, began.elapsed(), bytes_out, format!("Failed to read response body: {}", e))
        }
    }
}
