mod common;

use axum::http::{Method, StatusCode};
use serde_json::json;

use common::{send_json, send_raw, TestApp};

#[tokio::test]
async fn meta_endpoints() {
    let test_app = TestApp::new();

    let (status, body) = send_json(&test_app.app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "ok"}));

    let (status, body) = send_json(&test_app.app, Method::GET, "/api/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "ok"}));

    let (status, body) = send_raw(&test_app.app, Method::GET, "/", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(String::from_utf8_lossy(&body).contains("hostwire"));

    let (status, _) = send_raw(&test_app.app, Method::GET, "/no-such-route", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send_json(&test_app.app, Method::GET, "/openapi.json", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["paths"]["/tools"].is_object());
    assert!(body["paths"]["/generate-stream"].is_object());
    assert!(body["paths"]["/generate-title"].is_object());
}

#[tokio::test]
async fn switch_model_survives_a_restart() {
    let test_app = TestApp::new();

    let (status, body) = send_json(
        &test_app.app,
        Method::POST,
        "/switch-model",
        Some(json!({"model": "m2"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "success", "model": "m2"}));

    let (_, body) = send_json(&test_app.app, Method::GET, "/current-model", None).await;
    assert_eq!(body["model"], "m2");

    let restarted = test_app.restart();
    let (_, body) = send_json(&restarted, Method::GET, "/current-model", None).await;
    assert_eq!(body["model"], "m2");
}

#[tokio::test]
async fn configured_default_model_is_the_fallback() {
    let test_app = TestApp::with_config(|config| config.default_model = Some("llama3".to_string()));
    let (_, body) = send_json(&test_app.app, Method::GET, "/current-model", None).await;
    assert_eq!(body["model"], "llama3");
}

#[tokio::test]
async fn settings_merge_and_switch_the_model() {
    let test_app = TestApp::new();

    let (status, body) = send_json(&test_app.app, Method::GET, "/settings", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["language"], "en");

    let (status, body) = send_json(
        &test_app.app,
        Method::POST,
        "/settings",
        Some(json!({"default_model": "m3", "theme": "dark"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["status"], "success");
    assert_eq!(body["settings"]["language"], "en");
    assert_eq!(body["settings"]["theme"], "dark");

    let (_, body) = send_json(&test_app.app, Method::GET, "/current-model", None).await;
    assert_eq!(body["model"], "m3");

    let (status, body) = send_json(&test_app.app, Method::POST, "/settings", Some(json!([1]))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["type"], "invalid_parameter");

    let restarted = test_app.restart();
    let (_, body) = send_json(&restarted, Method::GET, "/settings", None).await;
    assert_eq!(body["theme"], "dark");
}

#[tokio::test]
async fn failed_model_switch_leaves_settings_untouched() {
    let test_app = TestApp::new();
    let blocked = test_app.config.last_model_path();
    std::fs::create_dir_all(blocked.join("occupied")).expect("block the model file");

    let (status, body) = send_json(
        &test_app.app,
        Method::POST,
        "/settings",
        Some(json!({"default_model": "m5", "theme": "dark"})),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR, "{body}");

    let (_, body) = send_json(&test_app.app, Method::GET, "/settings", None).await;
    assert_eq!(body["default_model"], "");
    assert!(body.get("theme").is_none(), "{body}");
    let (_, body) = send_json(&test_app.app, Method::GET, "/current-model", None).await;
    assert_eq!(body["model"], "");
}

#[tokio::test]
async fn chats_are_stored_listed_and_deleted() {
    let test_app = TestApp::new();
    let chat = json!({"title": "t", "messages": [{"role": "user", "content": "hi"}]});

    let (status, _) = send_json(&test_app.app, Method::PUT, "/chats/c1", Some(chat.clone())).await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = send_json(&test_app.app, Method::GET, "/chats", None).await;
    assert_eq!(body, json!(["c1"]));

    let (status, body) = send_json(&test_app.app, Method::GET, "/chats/c1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, chat);

    let (status, _) = send_json(&test_app.app, Method::DELETE, "/delete-chat/c1", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = send_json(&test_app.app, Method::DELETE, "/delete-chat/c1", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["type"], "not_found");

    let (status, body) = send_json(&test_app.app, Method::GET, "/chats/bad.id", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["type"], "invalid_parameter");
}

#[tokio::test]
async fn missing_model_manager_degrades() {
    let test_app = TestApp::new();

    let (status, body) = send_json(&test_app.app, Method::GET, "/installed-models", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));

    let (status, body) = send_json(
        &test_app.app,
        Method::POST,
        "/delete-model",
        Some(json!({"model": "m1"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["type"], "backend_unavailable");

    let (status, body) = send_json(
        &test_app.app,
        Method::POST,
        "/install-model-stream",
        Some(json!({"model": "  "})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["type"], "missing_parameter");
}

#[cfg(unix)]
#[tokio::test]
async fn model_manager_commands_are_relayed() {
    let bin_dir = tempfile::tempdir().expect("bin dir");
    let bin = bin_dir.path().join("ollama");
    common::write_executable(
        &bin,
        "#!/bin/sh\n\
         case \"$1\" in\n\
           list) printf 'NAME ID SIZE\\nm1 a 1GB\\nm2 b 2GB\\n' ;;\n\
           rm) exit 0 ;;\n\
           pull) echo \"pulling $2\"; echo \"success\" ;;\n\
         esac\n",
    );
    let bin_path = bin.clone();
    let test_app = TestApp::with_config(move |config| config.ollama_bin = bin_path);

    let (_, body) = send_json(&test_app.app, Method::GET, "/installed-models", None).await;
    assert_eq!(body, json!(["m1", "m2"]));

    let (status, body) = send_json(
        &test_app.app,
        Method::POST,
        "/delete-model",
        Some(json!({"model": "m1"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");

    let (status, body) = send_raw(
        &test_app.app,
        Method::POST,
        "/install-model-stream",
        Some(&json!({"model": "m3"}).to_string()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        common::sse_data_lines(&body),
        vec!["pulling m3", "success", "DONE"]
    );
}
