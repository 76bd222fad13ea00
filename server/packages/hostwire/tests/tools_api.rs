mod common;

use std::fs;
use std::time::Duration;

use axum::http::{Method, StatusCode};
use serde_json::json;

use common::{call_tool, send_json, send_raw, TestApp};

#[tokio::test]
async fn lists_every_builtin_tool() {
    let test_app = TestApp::new();
    let (status, body) = send_json(&test_app.app, Method::GET, "/tools", None).await;
    assert_eq!(status, StatusCode::OK);
    let tools = body.as_array().expect("tool array");
    assert_eq!(tools.len(), 14);
    assert!(tools
        .iter()
        .any(|tool| tool["name"] == "execute_command" && tool["parameters"].is_object()));
}

#[tokio::test]
async fn edit_file_leaves_a_backup_of_the_previous_content() {
    let test_app = TestApp::new();
    let target = test_app.workspace_path().join("notes.txt");
    fs::write(&target, "before").expect("seed file");

    let (status, body) = call_tool(
        &test_app.app,
        "edit_file",
        json!({"filename": "notes.txt", "content": "after"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["tool"], "edit_file");
    assert!(body["result"].is_string());
    assert_eq!(fs::read_to_string(&target).expect("main file"), "after");
    assert_eq!(
        fs::read_to_string(test_app.workspace_path().join("notes.txt.backup")).expect("backup"),
        "before"
    );
}

#[tokio::test]
async fn list_files_reports_kinds_and_parent_entry() {
    let test_app = TestApp::new();
    fs::create_dir(test_app.workspace_path().join("sub")).expect("subdir");
    fs::write(test_app.workspace_path().join("a.txt"), "abc").expect("file");

    let (status, body) = call_tool(&test_app.app, "list_files", json!({})).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let entries = body["data"]["entries"].as_array().expect("entries");
    let names: Vec<&str> = entries
        .iter()
        .map(|entry| entry["name"].as_str().unwrap_or_default())
        .collect();
    assert_eq!(names, vec!["..", "sub", "a.txt"]);
    assert_eq!(entries[1]["kind"], "directory");
    assert_eq!(entries[2]["kind"], "file");
}

#[tokio::test]
async fn legacy_alias_path_and_tool_key_work() {
    let test_app = TestApp::new();
    let (status, body) = send_json(
        &test_app.app,
        Method::POST,
        "/api/tools",
        Some(json!({"tool": "create_directory", "parameters": {"dirname": "made"}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert!(test_app.workspace_path().join("made").is_dir());
}

#[tokio::test]
async fn failures_map_to_status_codes() {
    let test_app = TestApp::new();

    let (status, body) = call_tool(&test_app.app, "read_file", json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["type"], "missing_parameter");
    assert!(body["error"].as_str().unwrap_or_default().contains("filename"));

    let (status, body) = call_tool(&test_app.app, "read_file", json!({"filename": "nope.txt"})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["type"], "not_found");

    let outside = tempfile::tempdir().expect("outside dir");
    let secret = outside.path().join("secret.txt");
    fs::write(&secret, "x").expect("secret");
    let (status, body) = call_tool(
        &test_app.app,
        "read_file",
        json!({"filename": secret.to_string_lossy()}),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["type"], "permission_denied");

    let (status, body) = call_tool(&test_app.app, "format_disk", json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["type"], "unknown_tool");

    let (status, body) = send_json(
        &test_app.app,
        Method::POST,
        "/tools",
        Some(json!({"parameters": {}})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["type"], "missing_parameter");
}

#[tokio::test]
async fn malformed_json_is_an_invalid_parameter() {
    let test_app = TestApp::new();
    let (status, bytes) = send_raw(&test_app.app, Method::POST, "/tools", Some("{not json")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let body: serde_json::Value = serde_json::from_slice(&bytes).expect("error body");
    assert_eq!(body["type"], "invalid_parameter");
}

#[tokio::test]
async fn commands_outside_the_allow_list_are_denied() {
    let test_app = TestApp::new();
    let (status, body) = call_tool(&test_app.app, "execute_command", json!({"command": "ls -la"})).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["type"], "permission_denied");
}

#[tokio::test]
async fn killing_needs_process_control() {
    let test_app = TestApp::new();
    let (status, body) = call_tool(
        &test_app.app,
        "manage_processes",
        json!({"action": "kill", "process_id": 1}),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["type"], "permission_denied");
}

#[cfg(unix)]
#[tokio::test]
async fn killing_a_missing_process_is_not_found() {
    let test_app = TestApp::with_config(|config| config.policy.allow_process_control = true);
    let (status, body) = call_tool(
        &test_app.app,
        "manage_processes",
        json!({"action": "kill", "process_id": i32::MAX}),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND, "{body}");
    assert_eq!(body["type"], "not_found");
}

#[cfg(unix)]
#[tokio::test]
async fn command_timeout_is_408_and_kills_the_child() {
    let test_app = TestApp::with_config(|config| {
        config.policy.allowed_commands = vec!["sh".to_string()];
    });
    let (status, body) = call_tool(
        &test_app.app,
        "execute_command",
        json!({"command": "sh -c 'echo $$ > pid.txt; sleep 30'", "timeout": 1}),
    )
    .await;
    assert_eq!(status, StatusCode::REQUEST_TIMEOUT, "{body}");
    assert_eq!(body["type"], "timeout");

    let pid: u32 = fs::read_to_string(test_app.workspace_path().join("pid.txt"))
        .expect("pid file")
        .trim()
        .parse()
        .expect("pid");
    let mut alive = hostwire::os::process_exists(pid);
    for _ in 0..20 {
        if !alive {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        alive = hostwire::os::process_exists(pid);
    }
    assert!(!alive, "child {pid} still running");
}

#[cfg(unix)]
#[tokio::test]
async fn allow_listed_command_returns_output() {
    let test_app = TestApp::with_config(|config| {
        config.policy.allowed_commands = vec!["echo".to_string()];
    });
    let (status, body) = call_tool(
        &test_app.app,
        "execute_command",
        json!({"command": "echo hello; rm -rf /"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["exitCode"], 0);
    assert_eq!(body["data"]["stdout"], "hello; rm -rf /\n");
}

#[cfg(unix)]
#[tokio::test]
async fn copying_a_link_to_outside_the_root_is_denied() {
    let test_app = TestApp::new();
    let outside = tempfile::tempdir().expect("outside dir");
    fs::write(outside.path().join("secret"), "TOP SECRET").expect("secret");
    let src = test_app.workspace_path().join("src");
    fs::create_dir(&src).expect("src");
    std::os::unix::fs::symlink(outside.path().join("secret"), src.join("link")).expect("link");

    let (status, body) = call_tool(
        &test_app.app,
        "file_operations",
        json!({"operation": "copy", "source": "src", "destination": "dst"}),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN, "{body}");
    assert_eq!(body["type"], "permission_denied");

    let (status, _) = call_tool(&test_app.app, "read_file", json!({"filename": "dst/link"})).await;
    assert_ne!(status, StatusCode::OK);
}

#[cfg(unix)]
#[tokio::test]
async fn edit_file_never_writes_through_a_backup_link() {
    let test_app = TestApp::new();
    let outside = tempfile::tempdir().expect("outside dir");
    let victim = outside.path().join("victim.txt");
    fs::write(&victim, "untouched").expect("victim");
    fs::write(test_app.workspace_path().join("notes.txt"), "before").expect("notes");
    std::os::unix::fs::symlink(&victim, test_app.workspace_path().join("notes.txt.backup"))
        .expect("link");

    let (status, body) = call_tool(
        &test_app.app,
        "edit_file",
        json!({"filename": "notes.txt", "content": "attacker controlled"}),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN, "{body}");
    assert_eq!(fs::read_to_string(&victim).expect("victim"), "untouched");
    assert_eq!(
        fs::read_to_string(test_app.workspace_path().join("notes.txt")).expect("notes"),
        "before"
    );
}

#[cfg(unix)]
#[tokio::test]
async fn background_children_do_not_swallow_command_output() {
    let test_app = TestApp::with_config(|config| {
        config.policy.allowed_commands = vec!["sh".to_string()];
    });
    let (status, body) = call_tool(
        &test_app.app,
        "execute_command",
        json!({"command": "sh -c 'sleep 30 & echo hi'", "timeout": 2}),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["stdout"], "hi\n");
}
