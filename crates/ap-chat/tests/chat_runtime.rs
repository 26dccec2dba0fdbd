use std::sync::{Arc, Mutex};
use std::time::Duration;

use ap_chat::runtime::handlers::sync_chat_list;
use ap_chat::state::MessageVariant;
use ap_chat::{ChatHost, ChatRuntime, FrontendToolState, HistorySource, RuntimeOptions};
use ap_core::auth::{AuthCoordinator, MemoryDeviceTokenStore};
use ap_core::cache::{ChatCache, ChatDetail, ChatSummary, MemoryChatCache};
use ap_core::{ApClient, time};
use serde_json::{Value, json};
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Debug, Default)]
struct Recorded {
    bound: Vec<String>,
    actions: Vec<(String, Value)>,
    activated: Vec<String>,
    posted: Vec<Value>,
}

#[derive(Clone, Default)]
struct RecordingHost(Arc<Mutex<Recorded>>);

impl ChatHost for RecordingHost {
    fn chat_id_bound(&mut self, chat_id: &str) {
        self.0.lock().unwrap().bound.push(chat_id.to_string());
    }

    fn execute_action(&mut self, action_name: &str, args: &Value) {
        self.0
            .lock()
            .unwrap()
            .actions
            .push((action_name.to_string(), args.clone()));
    }

    fn frontend_tool_activated(&mut self, tool: &FrontendToolState) {
        self.0.lock().unwrap().activated.push(tool.tool_id.clone());
    }

    fn post_to_frontend_tool(&mut self, message: &Value) {
        self.0.lock().unwrap().posted.push(message.clone());
    }
}

struct Harness {
    server: MockServer,
    runtime: ChatRuntime,
    cache: Arc<MemoryChatCache>,
    host: RecordingHost,
    api: ApClient,
}

fn envelope(data: Value) -> Value {
    json!({ "code": 0, "data": data })
}

fn sse(events: &[Value]) -> String {
    events.iter().map(|e| format!("data: {e}\n\n")).collect()
}

async fn harness() -> Harness {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/auth/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(json!({
            "username": "ann",
            "deviceId": "dev-1",
            "deviceName": "test",
            "accessToken": "access-1",
            "accessTokenExpireAtMs": time::now_millis() + 3_600_000,
            "deviceToken": "device-1",
        }))))
        .mount(&server)
        .await;

    let auth = AuthCoordinator::new(Arc::new(MemoryDeviceTokenStore::new()));
    auth.login(&server.uri(), "pw", "test").await.unwrap();
    let api = ApClient::new(auth, server.uri());
    let cache = Arc::new(MemoryChatCache::new());
    let host = RecordingHost::default();
    let runtime = ChatRuntime::new(
        api.clone(),
        Arc::clone(&cache) as Arc<dyn ChatCache>,
        Box::new(host.clone()),
        RuntimeOptions {
            agent_key: "default".into(),
            stream_idle_timeout: Duration::from_secs(5),
            reasoning_collapse_delay: Duration::from_millis(10),
        },
    );
    Harness {
        server,
        runtime,
        cache,
        host,
        api,
    }
}

async fn mount_stream(server: &MockServer, events: &[Value]) {
    Mock::given(method("POST"))
        .and(path("/api/ap/query"))
        .and(header("authorization", "Bearer access-1"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(sse(events)),
        )
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_open_chat_replays_history_and_caches_it() {
    let mut h = harness().await;
    Mock::given(method("GET"))
        .and(path("/api/ap/chat"))
        .and(query_param("chatId", "c1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(json!({
            "chatId": "c1",
            "chatName": "Trip plan",
            "events": [
                {"type": "request.query", "requestId": "q1", "message": "plan a trip", "timestamp": 1_700_000_000_000_i64},
                {"type": "run.start", "runId": "r1"},
                {"type": "reasoning.start", "reasoningId": "x"},
                {"type": "reasoning.delta", "reasoningId": "x", "delta": "thinking"},
                {"type": "reasoning.end", "reasoningId": "x"},
                {"type": "content.start", "contentId": "m1", "text": "Day 1"},
                {"type": "content.delta", "contentId": "m1", "delta": ": museum"},
                {"type": "run.complete", "runId": "r1"}
            ]
        }))))
        .expect(1)
        .mount(&h.server)
        .await;

    let source = h.runtime.open_chat("c1").await.unwrap();

    assert_eq!(source, HistorySource::Network);
    let state = h.runtime.state();
    assert!(!state.streaming);
    assert!(state.active_frontend_tool.is_none());
    let texts: Vec<_> = state.messages().map(|(_, m)| m.text.as_str()).collect();
    assert_eq!(texts, vec!["plan a trip", "Day 1: museum", "Run completed"]);
    let reasoning = state.timeline.iter().find_map(|e| e.as_reasoning()).unwrap();
    assert!(reasoning.collapsed);

    let cached = h.cache.get_cached_chat_detail("c1").unwrap().unwrap();
    assert_eq!(cached.chat_name.as_deref(), Some("Trip plan"));
    assert_eq!(cached.events.len(), 8);
}

#[tokio::test]
async fn test_history_falls_back_to_cache_when_offline() {
    let mut h = harness().await;
    Mock::given(method("GET"))
        .and(path("/api/ap/chat"))
        .respond_with(ResponseTemplate::new(503).set_body_json(json!({"msg": "maintenance"})))
        .mount(&h.server)
        .await;
    h.cache
        .upsert_chat_detail(&ChatDetail {
            chat_id: "c1".into(),
            events: vec![json!({"type": "content.snapshot", "contentId": "m1", "text": "cached answer"})],
            last_sync_ms: 1,
            ..ChatDetail::default()
        })
        .unwrap();

    let source = h.runtime.open_chat("c1").await.unwrap();

    assert_eq!(source, HistorySource::Cache);
    let state = h.runtime.state();
    assert_eq!(state.timeline[0].as_message().unwrap().text, "cached answer");
    let status = state.status_text.as_deref().unwrap();
    assert!(status.starts_with("Showing cached history"), "{status}");
    assert!(status.contains("maintenance"), "{status}");
}

#[tokio::test]
async fn test_history_missing_everywhere_is_an_error() {
    let mut h = harness().await;
    Mock::given(method("GET"))
        .and(path("/api/ap/chat"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&h.server)
        .await;

    let err = h.runtime.open_chat("nope").await.unwrap_err();

    assert!(format!("{err:#}").contains("Failed to load chat nope"));
}

#[tokio::test]
async fn test_send_message_echoes_then_streams_reply() {
    let mut h = harness().await;
    mount_stream(
        &h.server,
        &[
            json!({"type": "run.start", "runId": "r1", "chatId": "c-new"}),
            json!({"type": "content.start", "contentId": "m1", "text": "hello"}),
            json!({"type": "content.delta", "contentId": "m1", "delta": " world"}),
            json!({"type": "run.complete", "runId": "r1"}),
        ],
    )
    .await;
    h.runtime.switch_chat(None);

    h.runtime.send_message("  hi there ").unwrap();
    let echo = h.runtime.state().timeline[0].as_message().unwrap();
    assert_eq!(echo.text, "hi there");
    assert!(h.runtime.send_message("again").is_err());

    h.runtime.run_until_idle().await;

    let state = h.runtime.state();
    assert_eq!(state.chat_id.as_deref(), Some("c-new"));
    assert!(!state.streaming);
    assert!(!h.runtime.is_stream_open());
    let texts: Vec<_> = state.messages().map(|(_, m)| m.text.as_str()).collect();
    assert_eq!(texts, vec!["hi there", "hello world", "Run completed"]);
    let run_end = state.entry("run-end-r1").unwrap().as_message().unwrap();
    assert_eq!(run_end.variant, Some(MessageVariant::RunEnd));
    assert_eq!(h.host.0.lock().unwrap().bound, vec!["c-new".to_string()]);

    let requests = h.server.received_requests().await.unwrap();
    let query = requests
        .iter()
        .find(|r| r.url.path() == "/api/ap/query")
        .unwrap();
    let body: Value = serde_json::from_slice(&query.body).unwrap();
    assert_eq!(body["message"], "hi there");
    assert_eq!(body["agentKey"], "default");
    assert_eq!(body["stream"], true);
    assert!(body.get("chatId").is_none());
}

#[tokio::test]
async fn test_query_401_refreshes_once_and_replays_request() {
    let mut h = harness().await;
    Mock::given(method("POST"))
        .and(path("/api/ap/query"))
        .and(header("authorization", "Bearer access-1"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"code": 401, "msg": "expired"})))
        .expect(1)
        .mount(&h.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh"))
        .and(body_partial_json(json!({"deviceToken": "device-1"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(json!({
            "accessToken": "access-2",
            "accessTokenExpireAtMs": time::now_millis() + 3_600_000,
        }))))
        .expect(1)
        .mount(&h.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/ap/query"))
        .and(header("authorization", "Bearer access-2"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(sse(&[
                    json!({"type": "run.start", "runId": "r1"}),
                    json!({"type": "content.delta", "contentId": "m1", "delta": "renewed"}),
                    json!({"type": "run.complete", "runId": "r1"}),
                ])),
        )
        .expect(1)
        .mount(&h.server)
        .await;
    h.runtime.switch_chat(None);

    h.runtime.send_message("hi").unwrap();
    h.runtime.run_until_idle().await;

    let state = h.runtime.state();
    assert!(state.status_text.is_none());
    let texts: Vec<_> = state.messages().map(|(_, m)| m.text.as_str()).collect();
    assert_eq!(texts, vec!["hi", "renewed", "Run completed"]);

    let requests = h.server.received_requests().await.unwrap();
    let queries: Vec<_> = requests
        .iter()
        .filter(|r| r.url.path() == "/api/ap/query")
        .collect();
    assert_eq!(queries.len(), 2);
    let first: Value = serde_json::from_slice(&queries[0].body).unwrap();
    let second: Value = serde_json::from_slice(&queries[1].body).unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_stream_http_error_becomes_status_text() {
    let mut h = harness().await;
    Mock::given(method("POST"))
        .and(path("/api/ap/query"))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
        .mount(&h.server)
        .await;
    h.runtime.switch_chat(Some("c1"));

    h.runtime.send_message("hello").unwrap();
    h.runtime.run_until_idle().await;

    let state = h.runtime.state();
    assert_eq!(state.status_text.as_deref(), Some("HTTP 502: bad gateway"));
    assert!(!state.streaming);
}

#[tokio::test]
async fn test_actions_reach_host_once() {
    let mut h = harness().await;
    let end = json!({"type": "action.end", "actionId": "a1", "actionName": "open_url", "args": {"url": "https://example.com"}});
    mount_stream(&h.server, &[end.clone(), end]).await;
    h.runtime.switch_chat(Some("c1"));

    h.runtime.send_message("open it").unwrap();
    h.runtime.run_until_idle().await;

    let recorded = h.host.0.lock().unwrap();
    assert_eq!(
        recorded.actions,
        vec![("open_url".to_string(), json!({"url": "https://example.com"}))]
    );
}

#[tokio::test]
async fn test_frontend_tool_init_then_submit() {
    let mut h = harness().await;
    mount_stream(
        &h.server,
        &[
            json!({"type": "run.start", "runId": "r1"}),
            json!({
                "type": "tool.start",
                "runId": "r1",
                "toolId": "t1",
                "toolKey": "approval_form",
                "toolType": "html",
                "toolName": "Approve transfer"
            }),
            json!({"type": "tool.args", "toolId": "t1", "delta": "{\"amount\":", "chunkIndex": 0}),
            json!({"type": "tool.args", "toolId": "t1", "delta": "42}", "chunkIndex": 1}),
        ],
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/api/ap/viewport"))
        .and(query_param("viewportKey", "approval_form"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(envelope(json!({"html": "<form></form>"}))),
        )
        .expect(1)
        .mount(&h.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/ap/submit"))
        .and(body_partial_json(json!({"runId": "r1", "toolId": "t1"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(
            json!({"accepted": false, "detail": "Approval window expired"}),
        )))
        .up_to_n_times(1)
        .mount(&h.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/ap/submit"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(envelope(json!({"accepted": true}))),
        )
        .mount(&h.server)
        .await;
    h.runtime.switch_chat(Some("c1"));

    h.runtime.send_message("pay bob").unwrap();
    h.runtime.run_until_idle().await;

    let tool = h.runtime.state().active_frontend_tool.clone().unwrap();
    assert_eq!(tool.viewport_html.as_deref(), Some("<form></form>"));
    assert!(!tool.loading);
    assert!(tool.params_ready);
    assert!(tool.tool_init_dispatched);
    assert_eq!(tool.init_attempt, 1);
    {
        let recorded = h.host.0.lock().unwrap();
        assert_eq!(recorded.activated, vec!["t1".to_string()]);
        assert_eq!(recorded.posted.len(), 1);
        assert_eq!(recorded.posted[0]["type"], "tool_init");
        assert_eq!(recorded.posted[0]["data"]["params"], json!({"amount": 42}));
    }

    let rejected = h
        .runtime
        .submit_active_frontend_tool(json!({"approved": true}))
        .await
        .unwrap();
    assert!(!rejected.accepted);
    assert_eq!(
        h.runtime.state().status_text.as_deref(),
        Some("Approval window expired")
    );
    assert!(h.runtime.state().active_frontend_tool.is_some());

    h.runtime
        .handle_view_message(r#"{"type":"frontend_submit","params":{"approved":true}}"#)
        .await
        .unwrap();
    assert!(h.runtime.state().active_frontend_tool.is_none());
    assert!(h.runtime.state().status_text.is_none());
}

#[tokio::test]
async fn test_switching_chat_aborts_stream_and_drops_its_events() {
    let mut h = harness().await;
    Mock::given(method("POST"))
        .and(path("/api/ap/query"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(sse(&[json!({"type": "content.delta", "contentId": "m1", "delta": "old chat"})]))
                .set_delay(Duration::from_millis(200)),
        )
        .mount(&h.server)
        .await;
    h.runtime.switch_chat(Some("a"));
    h.runtime.send_message("first").unwrap();

    h.runtime.switch_chat(Some("b"));
    h.runtime.run_until_idle().await;

    let state = h.runtime.state();
    assert_eq!(state.chat_id.as_deref(), Some("b"));
    assert!(state.timeline.is_empty());
    assert!(state.status_text.is_none());
    assert!(!h.runtime.has_pending_tasks());
}

#[tokio::test]
async fn test_sync_chat_list_sends_max_cursor() {
    let h = harness().await;
    h.cache
        .upsert_chat_summaries(&[
            ChatSummary {
                chat_id: "c1".into(),
                last_run_id: Some("5".into()),
                ..ChatSummary::default()
            },
            ChatSummary {
                chat_id: "c2".into(),
                last_run_id: Some("12".into()),
                ..ChatSummary::default()
            },
        ])
        .unwrap();
    Mock::given(method("GET"))
        .and(path("/api/ap/chats"))
        .and(query_param("lastRunId", "12"))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(json!([
            {"chatId": "c3", "chatName": "New", "lastRunId": "13"}
        ]))))
        .expect(1)
        .mount(&h.server)
        .await;

    let chats = sync_chat_list(&h.api, h.cache.as_ref()).await.unwrap();

    let mut ids: Vec<_> = chats.iter().map(|c| c.chat_id.as_str()).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec!["c1", "c2", "c3"]);
}
