use std::fs;

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use serde_json::{Value, json};
use tempfile::tempdir;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn envelope(data: Value) -> Value {
    json!({ "code": 0, "data": data })
}

fn far_future_ms() -> i64 {
    4_102_444_800_000
}

async fn backend() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/auth/login"))
        .and(body_partial_json(json!({ "masterPassword": "hunter2" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(json!({
            "username": "ann",
            "deviceId": "dev-1",
            "deviceName": "laptop",
            "accessToken": "access-1",
            "accessTokenExpireAtMs": far_future_ms(),
            "deviceToken": "device-1",
        }))))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh"))
        .and(body_partial_json(json!({ "deviceToken": "device-1" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(json!({
            "username": "ann",
            "deviceName": "laptop",
            "accessToken": "access-2",
            "accessTokenExpireAtMs": far_future_ms(),
        }))))
        .mount(&server)
        .await;
    server
}

#[tokio::test(flavor = "multi_thread")]
async fn test_login_persists_device_token_and_whoami_restores_it() {
    let server = backend().await;
    let dir = tempdir().unwrap();

    cargo_bin_cmd!("ap")
        .env("AP_HOME", dir.path())
        .env("AP_BASE_URL", server.uri())
        .env("AP_MASTER_PASSWORD", "hunter2")
        .args(["login", "--device-name", "laptop"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Logged in as ann"));

    let stored = fs::read_to_string(dir.path().join("device.json")).unwrap();
    assert!(stored.contains("device-1"));
    assert!(!stored.contains("access-1"));

    cargo_bin_cmd!("ap")
        .env("AP_HOME", dir.path())
        .env("AP_BASE_URL", server.uri())
        .arg("whoami")
        .assert()
        .success()
        .stdout(predicate::str::contains("ann (laptop)"));
}

/// Test: password piped on stdin, then logout forgets the device.
#[tokio::test(flavor = "multi_thread")]
async fn test_login_reads_password_from_stdin_and_logout_clears_it() {
    let server = backend().await;
    Mock::given(method("POST"))
        .and(path("/api/auth/logout"))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(json!({}))))
        .expect(1)
        .mount(&server)
        .await;
    let dir = tempdir().unwrap();
    let device_path = dir.path().join("device.json");

    cargo_bin_cmd!("ap")
        .env("AP_HOME", dir.path())
        .env("AP_BASE_URL", server.uri())
        .env_remove("AP_MASTER_PASSWORD")
        .arg("login")
        .write_stdin("hunter2\n")
        .assert()
        .success();
    assert!(device_path.exists());

    cargo_bin_cmd!("ap")
        .env("AP_HOME", dir.path())
        .env("AP_BASE_URL", server.uri())
        .arg("logout")
        .assert()
        .success()
        .stdout(predicate::str::contains("Logged out."));
    assert!(!device_path.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_login_with_wrong_password_reports_server_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/auth/login"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "code": 401,
            "msg": "bad password"
        })))
        .mount(&server)
        .await;
    let dir = tempdir().unwrap();

    cargo_bin_cmd!("ap")
        .env("AP_HOME", dir.path())
        .env("AP_BASE_URL", server.uri())
        .env("AP_MASTER_PASSWORD", "nope")
        .arg("login")
        .assert()
        .failure()
        .stderr(predicate::str::contains("bad password"));

    assert!(!dir.path().join("device.json").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_whoami_without_login_fails() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();

    cargo_bin_cmd!("ap")
        .env("AP_HOME", dir.path())
        .env("AP_BASE_URL", server.uri())
        .arg("whoami")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Not logged in"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_chats_syncs_then_lists_offline() {
    let server = backend().await;
    Mock::given(method("GET"))
        .and(path("/api/ap/chats"))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(json!([
            { "chatId": "c1", "chatName": "Trip", "lastRunId": "7", "lastRunContent": "Booked." }
        ]))))
        .mount(&server)
        .await;
    let dir = tempdir().unwrap();

    cargo_bin_cmd!("ap")
        .env("AP_HOME", dir.path())
        .env("AP_BASE_URL", server.uri())
        .env("AP_MASTER_PASSWORD", "hunter2")
        .arg("login")
        .assert()
        .success();

    cargo_bin_cmd!("ap")
        .env("AP_HOME", dir.path())
        .env("AP_BASE_URL", server.uri())
        .arg("chats")
        .assert()
        .success()
        .stdout(predicate::str::contains("c1  Trip  Booked."));

    cargo_bin_cmd!("ap")
        .env("AP_HOME", dir.path())
        .env("AP_BASE_URL", server.uri())
        .args(["chats", "--offline"])
        .assert()
        .success()
        .stdout(predicate::str::contains("c1  Trip"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ask_prints_streamed_reply() {
    let server = backend().await;
    let events = [
        json!({"type": "run.start", "runId": "1", "chatId": "c-new"}),
        json!({"type": "content.start", "contentId": "a1", "text": "Hel"}),
        json!({"type": "content.delta", "contentId": "a1", "delta": "lo there"}),
        json!({"type": "content.end", "contentId": "a1"}),
        json!({"type": "run.complete", "runId": "1"}),
    ];
    let body: String = events.iter().map(|e| format!("data: {e}\n\n")).collect();
    Mock::given(method("POST"))
        .and(path("/api/ap/query"))
        .and(body_partial_json(json!({ "message": "hi", "agentKey": "travel" })))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(body),
        )
        .mount(&server)
        .await;
    let dir = tempdir().unwrap();

    cargo_bin_cmd!("ap")
        .env("AP_HOME", dir.path())
        .env("AP_BASE_URL", server.uri())
        .env("AP_MASTER_PASSWORD", "hunter2")
        .arg("login")
        .assert()
        .success();

    cargo_bin_cmd!("ap")
        .env("AP_HOME", dir.path())
        .env("AP_BASE_URL", server.uri())
        .args(["ask", "hi", "--agent", "travel"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Hello there"))
        .stdout(predicate::str::contains("[Run completed]"))
        .stdout(predicate::str::contains("> hi").not())
        .stderr(predicate::str::contains("chat: c-new"));
}

#[test]
fn test_show_falls_back_to_cache_when_offline() {
    let dir = tempdir().unwrap();
    let cache_dir = dir.path().join("cache").join("127.0.0.1_9");
    fs::create_dir_all(cache_dir.join("chats")).unwrap();
    fs::write(
        cache_dir.join("chats").join("c1.json"),
        json!({
            "chatId": "c1",
            "events": [
                {"type": "request.query", "requestId": "r1", "message": "old question"},
                {"type": "content.snapshot", "contentId": "a1", "text": "old answer"}
            ],
            "lastSyncMs": 1
        })
        .to_string(),
    )
    .unwrap();

    cargo_bin_cmd!("ap")
        .env("AP_HOME", dir.path())
        .env("AP_BASE_URL", "http://127.0.0.1:9")
        .args(["show", "c1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("> old question"))
        .stdout(predicate::str::contains("old answer"))
        .stderr(predicate::str::contains("Showing cached history"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_chats_list_filters_with_cursor() {
    let server = backend().await;
    Mock::given(method("GET"))
        .and(path("/api/ap/chats"))
        .and(query_param("lastRunId", "7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(json!([]))))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/ap/chats"))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(json!([
            { "chatId": "c1", "chatName": "Trip", "lastRunId": "7" }
        ]))))
        .mount(&server)
        .await;
    let dir = tempdir().unwrap();

    cargo_bin_cmd!("ap")
        .env("AP_HOME", dir.path())
        .env("AP_BASE_URL", server.uri())
        .env("AP_MASTER_PASSWORD", "hunter2")
        .arg("login")
        .assert()
        .success();

    for _ in 0..2 {
        cargo_bin_cmd!("ap")
            .env("AP_HOME", dir.path())
            .env("AP_BASE_URL", server.uri())
            .arg("chats")
            .assert()
            .success()
            .stdout(predicate::str::contains("c1  Trip"));
    }
}
