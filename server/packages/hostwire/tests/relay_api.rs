mod common;

use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::util::ServiceExt;

use common::{send_json, send_raw, sse_data_lines, FakeBackend, TestApp};

fn chunk_lines() -> Vec<String> {
    vec![
        json!({"message": {"role": "assistant", "content": "Hel"}, "done": false}).to_string(),
        json!({"message": {"role": "assistant", "content": "lo"}, "done": false}).to_string(),
        json!({"done": true}).to_string(),
    ]
}

#[tokio::test]
async fn stream_prepends_system_prompt_and_forwards_each_line() {
    let lines = chunk_lines();
    let backend = FakeBackend::start(lines.clone(), 7).await;
    let url = backend.url.clone();
    let test_app = TestApp::with_config(move |config| config.backend_url = url);

    let (status, body) = send_raw(
        &test_app.app,
        Method::POST,
        "/generate-stream",
        Some(
            &json!({
                "model": "m1",
                "history": [{"role": "user", "content": "hi"}],
                "tools_enabled": true
            })
            .to_string(),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let expected: String = lines.iter().map(|line| format!("data: {line}\n\n")).collect();
    assert_eq!(String::from_utf8_lossy(&body), expected);

    let requests = backend.requests();
    assert_eq!(requests.len(), 1);
    let sent = &requests[0];
    assert_eq!(sent["model"], "m1");
    assert_eq!(sent["stream"], true);
    let messages = sent["messages"].as_array().expect("messages");
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["role"], "system");
    assert!(messages[0]["content"]
        .as_str()
        .unwrap_or_default()
        .contains("execute_command"));
    assert_eq!(messages[1], json!({"role": "user", "content": "hi"}));
}

#[tokio::test]
async fn stream_appends_the_new_user_turn_without_tools() {
    let backend = FakeBackend::start(chunk_lines(), 64).await;
    let url = backend.url.clone();
    let test_app = TestApp::with_config(move |config| config.backend_url = url);

    let (status, _) = send_raw(
        &test_app.app,
        Method::POST,
        "/generate-stream",
        Some(
            &json!({
                "modelhs": ["old", "m9"],
                "messages": [{"role": "assistant", "content": "earlier"}],
                "message": "next"
            })
            .to_string(),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let sent = &backend.requests()[0];
    assert_eq!(sent["model"], "m9");
    assert_eq!(
        sent["messages"],
        json!([
            {"role": "assistant", "content": "earlier"},
            {"role": "user", "content": "next"}
        ])
    );
}

#[tokio::test]
async fn unreachable_backend_yields_one_failure_event() {
    let test_app = TestApp::new();
    let (status, body) = send_raw(
        &test_app.app,
        Method::POST,
        "/generate-stream",
        Some(&json!({"model": "m1", "message": "hi"}).to_string()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let events = sse_data_lines(&body);
    assert_eq!(events.len(), 1, "{events:?}");
    let failure: Value = serde_json::from_str(&events[0]).expect("failure envelope");
    assert_eq!(failure["type"], "backend_unavailable");
    assert!(failure["error"].is_string());
}

#[tokio::test]
async fn generate_passes_the_backend_reply_through() {
    let backend = FakeBackend::start(Vec::new(), 16).await;
    let url = backend.url.clone();
    let test_app = TestApp::with_config(move |config| config.backend_url = url);

    let (status, body) = send_json(
        &test_app.app,
        Method::POST,
        "/switch-model",
        Some(json!({"model": "m2"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");

    let (status, body) = send_json(
        &test_app.app,
        Method::POST,
        "/generate",
        Some(json!({"messages": [{"role": "user", "content": "hi"}]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["message"]["content"], "hello");
    assert_eq!(body["model"], "m2");

    let sent = &backend.requests()[0];
    assert_eq!(sent["stream"], false);
    assert_eq!(sent["model"], "m2");
}

#[tokio::test]
async fn generate_against_a_dead_backend_is_502() {
    let test_app = TestApp::new();
    let (status, body) = send_json(
        &test_app.app,
        Method::POST,
        "/generate",
        Some(json!({"model": "m1", "messages": []})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["type"], "backend_unavailable");
}

#[tokio::test]
async fn dropping_the_stream_closes_the_upstream_request() {
    let backend = FakeBackend::start_endless(vec![chunk_lines()[0].clone()]).await;
    let url = backend.url.clone();
    let test_app = TestApp::with_config(move |config| config.backend_url = url);

    let request = Request::builder()
        .method(Method::POST)
        .uri("/generate-stream")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({"model": "m1", "message": "hi"}).to_string()))
        .expect("build request");
    let response = test_app.app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let mut body = response.into_body();
    let frame = body
        .frame()
        .await
        .expect("first frame")
        .expect("frame ok");
    let data = frame.into_data().expect("data frame");
    assert!(String::from_utf8_lossy(&data).starts_with("data: "));
    assert!(!backend.wait_for_body_drop(Duration::from_millis(200)).await);

    drop(body);
    assert!(
        backend.wait_for_body_drop(Duration::from_secs(5)).await,
        "upstream stream still open after the client went away"
    );
}

#[tokio::test]
async fn generate_title_asks_the_backend_for_a_title() {
    let backend = FakeBackend::start(Vec::new(), 16).await;
    let url = backend.url.clone();
    let test_app = TestApp::with_config(move |config| config.backend_url = url);

    let (status, body) = send_json(
        &test_app.app,
        Method::POST,
        "/generate-title",
        Some(json!({
            "model": "m1",
            "history": [
                {"role": "system", "content": "tool preamble"},
                {"role": "user", "content": "how big is my disk?"},
                {"role": "assistant", "content": "about 500 GB"}
            ]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body, json!({"title": "hello"}));

    let sent = &backend.requests()[0];
    assert_eq!(sent["model"], "m1");
    assert_eq!(sent["stream"], false);
    let messages = sent["messages"].as_array().expect("messages");
    assert_eq!(messages.len(), 3);
    assert!(messages.iter().all(|message| message["role"] != "system"));
    assert_eq!(messages[2]["role"], "user");
    assert!(messages[2]["content"]
        .as_str()
        .unwrap_or_default()
        .contains("title"));
}

#[tokio::test]
async fn generate_title_against_a_dead_backend_is_502() {
    let test_app = TestApp::new();
    let (status, body) = send_json(
        &test_app.app,
        Method::POST,
        "/generate-title",
        Some(json!({"history": [{"role": "user", "content": "hi"}]})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["type"], "backend_unavailable");
}
