//! HTTP surface: the API root, the chat relay and the load test endpoint.

use anyhow::{Context, Result};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};
use url::Url;

use crate::error::ApiError;
use crate::models::{EngineSettings, LoadTestConfig, Target};
use crate::report::Report;

/// Remote inference endpoint the chat relay forwards to
#[derive(Debug, Clone)]
pub struct ChatUpstream {
    pub invocations_url: Url,
    pub token: String,
}

impl ChatUpstream {
    /// Upstream for a Databricks model serving endpoint
    pub fn serving_endpoint(host: &str, endpoint: &str, token: String) -> Result<Self> {
        let url = format!("https://{}/serving-endpoints/{}/invocations", host, endpoint);
        let invocations_url = Url::parse(&url).context(format!("Invalid serving endpoint URL: {}", url))?;
        Ok(Self { invocations_url, token })
    }
}

/// Server configuration, built once at startup
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
    pub chat: Option<ChatUpstream>,
    pub engine: EngineSettings,
    pub upstream_timeout: Duration,
    /// Built frontend served for every path outside `/api`
    pub static_dir: Option<PathBuf>,
}

#[derive(Clone)]
pub struct AppState {
    pub client: reqwest::Client,
    pub engine: EngineSettings,
    /// Request template exercised by `/api/load-test`
    pub load_test_target: Arc<Target>,
    pub chat: Option<Arc<ChatUpstream>>,
}

impl AppState {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.upstream_timeout)
            .build()
            .context("Failed to build upstream HTTP client")?;

        Ok(Self {
            client,
            engine: config.engine,
            load_test_target: Arc::new(self_target(config.host, config.port)?),
            chat: config.chat.clone().map(Arc::new),
        })
    }
}

/// The server's own API root, the load test target of a deployment
///
/// A wildcard bind address is reached through the loopback of its family.
pub fn self_target(host: IpAddr, port: u16) -> Result<Target> {
    let host = match host {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    let url = Url::parse(&format!("http://{}/api", SocketAddr::new(host, port)))?;
    Ok(Target::get(url).with_header("Content-Type", "application/json"))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api", get(api_root))
        .route("/api/chat", post(chat))
        .route("/api/load-test", get(load_test))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve a built frontend from `dir`, answering unknown paths with its `index.html`
pub fn with_frontend(router: Router, dir: &Path) -> Router {
    let index = ServeFile::new(dir.join("index.html"));
    router.fallback_service(ServeDir::new(dir).fallback(index))
}

/// Bind and serve until Ctrl-C
pub async fn serve(config: ServerConfig) -> Result<()> {
    let state = AppState::new(&config)?;
    let addr = SocketAddr::new(config.host, config.port);
    let listener = TcpListener::bind(addr)
        .await
        .context(format!("Failed to bind {}", addr))?;

    info!(
        event = "server_started",
        addr = %addr,
        chat_relay = config.chat.is_some(),
        message = "Listening"
    );

    let mut app = router(state);
    if let Some(dir) = &config.static_dir {
        info!(event = "frontend_enabled", dir = %dir.display(), message = "Serving frontend build");
        app = with_frontend(app, dir);
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(event = "signal_error", error = %e, message = "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!(event = "server_stopping", message = "Shutting down");
}

async fn api_root() -> Json<Value> {
    Json(json!({ "message": "Welcome to the LLM Chat API" }))
}

/// Raw `/api/load-test` query, validated into a [`LoadTestConfig`]
#[derive(Debug, Default, Deserialize)]
pub struct LoadTestQuery {
    pub users: Option<String>,
    pub spawn_rate: Option<String>,
    pub test_time: Option<String>,
}

/// Who asked for a load test, as forwarded by the platform proxy
#[derive(Debug, PartialEq, Eq)]
struct Initiator<'a> {
    user_id: &'a str,
    email: &'a str,
    username: &'a str,
    client_ip: &'a str,
    request_id: &'a str,
}

impl<'a> Initiator<'a> {
    fn from_headers(headers: &'a HeaderMap) -> Self {
        Self {
            user_id: header(headers, "X-Forwarded-User"),
            email: header(headers, "X-Forwarded-Email"),
            username: header(headers, "X-Forwarded-Preferred-Username"),
            client_ip: header(headers, "X-Real-Ip"),
            request_id: header(headers, "X-Request-Id"),
        }
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers.get(name).and_then(|v| v.to_str().ok()).unwrap_or("")
}

async fn load_test(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<LoadTestQuery>, QueryRejection>,
) -> Result<Json<Report>, ApiError> {
    let Query(query) = query.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let config = LoadTestConfig::from_params(
        query.users.as_deref(),
        query.spawn_rate.as_deref(),
        query.test_time.as_deref(),
    )?;

    let initiator = Initiator::from_headers(&headers);
    info!(
        event = "load_test_started",
        users = config.users,
        spawn_rate = config.spawn_rate,
        test_time = config.test_time,
        target = %state.load_test_target.url,
        user_id = initiator.user_id,
        email = initiator.email,
        username = initiator.username,
        client_ip = initiator.client_ip,
        request_id = initiator.request_id,
        message = "Load test initiated"
    );

    let report = crate::run_load_test(&config, &state.engine, (*state.load_test_target).clone())
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    info!(
        event = "load_test_completed",
        total_requests = report.total_requests,
        successful_requests = report.successful_requests,
        failed_requests = report.failed_requests,
        requests_per_second = report.requests_per_second,
        message = "Load test completed"
    );
    debug!("\n{}", report);

    Ok(Json(report))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
}

#[derive(Debug, Deserialize)]
struct LlmResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: LlmMessage,
}

#[derive(Debug, Deserialize)]
struct LlmMessage {
    content: String,
}

async fn chat(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let upstream = state.chat.as_ref().ok_or(ApiError::ChatUnavailable)?;

    debug!(event = "chat_received", length = request.message.len(), message = "Received chat message");

    let payload = json!({
        "messages": [
            { "role": "user", "content": request.message }
        ]
    });

    let response = state
        .client
        .post(upstream.invocations_url.clone())
        .bearer_auth(&upstream.token)
        .json(&payload)
        .send()
        .await
        .map_err(|e| {
            error!(event = "chat_upstream_error", error = %e, message = "Failed to send request");
            ApiError::Internal("Failed to send request to LLM".to_string())
        })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        error!(
            event = "chat_upstream_status",
            status_code = status.as_u16(),
            body = body.as_str(),
            message = "HTTP error from LLM endpoint"
        );
        return Err(ApiError::Upstream {
            status: StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY),
            message: "Error from LLM endpoint".to_string(),
        });
    }

    let llm_response: LlmResponse = response.json().await.map_err(|e| {
        error!(event = "chat_decode_error", error = %e, message = "Failed to decode response");
        ApiError::Internal("Invalid response from LLM endpoint".to_string())
    })?;

    let content = llm_response
        .choices
        .into_iter()
        .next()
        .map(|choice| choice.message.content)
        .filter(|content| !content.is_empty())
        .ok_or_else(|| ApiError::Internal("Invalid response structure from LLM endpoint".to_string()))?;

    Ok(Json(ChatResponse { content }))
}
