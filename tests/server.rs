use axum::body::Body;
use axum::http::{Request, StatusCode};
use loadrelay::server::{AppState, ChatUpstream, router, with_frontend};
use loadrelay::{EngineSettings, Report, Target};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use url::Url;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn health_stub() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "message": "Welcome to the LLM Chat API" })))
        .mount(&server)
        .await;
    server
}

fn state(target_server: &MockServer, chat: Option<ChatUpstream>) -> AppState {
    let url = Url::parse(&format!("{}/api", target_server.uri())).unwrap();
    AppState {
        client: reqwest::Client::new(),
        engine: EngineSettings {
            request_timeout: Duration::from_secs(5),
            drain_grace: Duration::from_secs(5),
            ..EngineSettings::default()
        },
        load_test_target: Arc::new(Target::get(url).with_header("Content-Type", "application/json")),
        chat: chat.map(Arc::new),
    }
}

async fn send(state: AppState, request: Request<Body>) -> (StatusCode, Value) {
    let response = router(state).oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_api_root() {
    let target = health_stub().await;
    let (status, body) = send(state(&target, None), get("/api")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Welcome to the LLM Chat API");
}

#[tokio::test]
async fn test_load_test_rejects_invalid_params() {
    let target = health_stub().await;

    for uri in [
        "/api/load-test?users=0&spawn_rate=5&test_time=2",
        "/api/load-test?users=1&test_time=2",
        "/api/load-test?users=1&spawn_rate=-3&test_time=2",
        "/api/load-test?users=1&spawn_rate=5&test_time=abc",
        "/api/load-test",
    ] {
        let (status, body) = send(state(&target, None), get(uri)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", uri);
        assert!(body["error"].as_str().is_some_and(|m| !m.is_empty()), "{}", uri);
    }

    // No attempt ever reached the target
    assert!(target.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_load_test_error_messages() {
    let target = health_stub().await;

    let (_, body) = send(state(&target, None), get("/api/load-test?users=1&test_time=2")).await;
    assert_eq!(body["error"], "missing required query parameter: spawn_rate");

    let (_, body) = send(state(&target, None), get("/api/load-test?users=0&spawn_rate=5&test_time=2")).await;
    assert_eq!(body["error"], "users must be a positive integer, got \"0\"");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_load_test_returns_report() {
    let target = health_stub().await;

    let (status, body) = send(
        state(&target, None),
        get("/api/load-test?users=2&spawn_rate=5&test_time=2"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    for field in [
        "test_duration",
        "total_requests",
        "successful_requests",
        "failed_requests",
        "requests_per_second",
        "concurrent_users",
        "response_time",
        "errors",
    ] {
        assert!(body.get(field).is_some(), "missing {}", field);
    }

    let report: Report = serde_json::from_value(body).unwrap();
    assert_eq!(report.test_duration, 2);
    assert_eq!(report.concurrent_users, 2);
    assert!((9..=11).contains(&report.total_requests), "total {}", report.total_requests);
    assert_eq!(report.failed_requests, 0);
    assert!(report.errors.is_empty());
    assert!(report.requests_per_second > 0.0);

    let received = target.received_requests().await.unwrap();
    assert_eq!(received.len() as i64, report.total_requests);
    assert!(received.iter().all(|r| r.url.path() == "/api"));
}

fn chat_upstream(server: &MockServer) -> ChatUpstream {
    ChatUpstream {
        invocations_url: Url::parse(&format!("{}/serving-endpoints/llama/invocations", server.uri())).unwrap(),
        token: "secret".to_string(),
    }
}

#[tokio::test]
async fn test_chat_relays_message() {
    let target = health_stub().await;
    let llm = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/serving-endpoints/llama/invocations"))
        .and(header("authorization", "Bearer secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "content": "hello back" } }]
        })))
        .expect(1)
        .mount(&llm)
        .await;

    let (status, body) = send(
        state(&target, Some(chat_upstream(&llm))),
        post_json("/api/chat", json!({ "message": "hello" })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["content"], "hello back");

    let received = llm.received_requests().await.unwrap();
    let payload: Value = serde_json::from_slice(&received[0].body).unwrap();
    assert_eq!(payload, json!({ "messages": [{ "role": "user", "content": "hello" }] }));
}

#[tokio::test]
async fn test_chat_forwards_upstream_status() {
    let target = health_stub().await;
    let llm = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .mount(&llm)
        .await;

    let (status, body) = send(
        state(&target, Some(chat_upstream(&llm))),
        post_json("/api/chat", json!({ "message": "hello" })),
    )
    .await;

    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"], "Error from LLM endpoint");
}

#[tokio::test]
async fn test_chat_rejects_empty_choices() {
    let target = health_stub().await;
    let llm = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "choices": [] })))
        .mount(&llm)
        .await;

    let (status, body) = send(
        state(&target, Some(chat_upstream(&llm))),
        post_json("/api/chat", json!({ "message": "hello" })),
    )
    .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "Invalid response structure from LLM endpoint");
}

#[tokio::test]
async fn test_chat_without_upstream() {
    let target = health_stub().await;
    let (status, body) = send(state(&target, None), post_json("/api/chat", json!({ "message": "hello" }))).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "chat relay is not configured");
}

#[tokio::test]
async fn test_chat_rejects_malformed_body() {
    let target = health_stub().await;
    let (status, body) = send(state(&target, None), post_json("/api/chat", json!({ "text": "hello" }))).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_frontend_fallback() {
    let dir = std::env::temp_dir().join(format!("loadrelay-frontend-{}", std::process::id()));
    std::fs::create_dir_all(dir.join("static")).unwrap();
    std::fs::write(dir.join("index.html"), "<html>app</html>").unwrap();
    std::fs::write(dir.join("static/app.js"), "console.log(1)").unwrap();

    let target = health_stub().await;
    let app = with_frontend(router(state(&target, None)), &dir);

    let fetch = |uri: &'static str| {
        let app = app.clone();
        async move {
            let response = app.oneshot(get(uri)).await.unwrap();
            let status = response.status();
            let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
            (status, String::from_utf8(body.to_vec()).unwrap())
        }
    };

    assert_eq!(fetch("/static/app.js").await, (StatusCode::OK, "console.log(1)".to_string()));
    assert_eq!(fetch("/chat/history").await, (StatusCode::OK, "<html>app</html>".to_string()));

    let (status, body) = fetch("/api").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("Welcome to the LLM Chat API"));

    std::fs::remove_dir_all(&dir).unwrap();
}
