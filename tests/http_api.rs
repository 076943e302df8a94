//! HTTP API tests against a real listener.

mod common;

use std::sync::Arc;

use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::TcpListener;

use book_rag::config::Config;
use book_rag::generation::CompletionProvider;
use book_rag::server;
use book_rag_core::prompt::SELECTION_REFUSAL;

use common::{fixture, test_config, Fixture, FixedProvider, KeywordEmbedder, VOCAB};

// ─── Helpers ────────────────────────────────────────────────────────

async fn start(fx: &Fixture) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let orchestrator = fx.orchestrator.clone();
    let trust = fx.config.server.trust_forwarded_for;
    tokio::spawn(async move {
        server::serve(listener, orchestrator, trust).await.unwrap();
    });
    wait_for_server(port).await;
    port
}

async fn wait_for_server(port: u16) {
    let client = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{}/health", port);
    for _ in 0..50 {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        if let Ok(resp) = client.get(&url).send().await {
            if resp.status().is_success() {
                return;
            }
        }
    }
    panic!("Server did not become ready within 5 seconds");
}

async fn book_server(tmp: &TempDir, extra_toml: &str, reply: &str) -> (Fixture, u16) {
    book_server_with(test_config(tmp, extra_toml), reply).await
}

async fn book_server_with(config: Config, reply: &str) -> (Fixture, u16) {
    let provider = Arc::new(FixedProvider::replying("gpt-4o", reply));
    let fx = fixture(
        config,
        Arc::new(KeywordEmbedder::new(VOCAB)),
        vec![provider as Arc<dyn CompletionProvider>],
    )
    .await;
    let port = start(&fx).await;
    (fx, port)
}

async fn post(port: u16, path: &str, body: Value) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("http://127.0.0.1:{}{}", port, path))
        .json(&body)
        .send()
        .await
        .unwrap()
}

// ─── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_health_reports_corpus_version() {
    let tmp = TempDir::new().unwrap();
    let (_fx, port) = book_server(&tmp, "", "unused").await;

    let resp = reqwest::get(format!("http://127.0.0.1:{}/health", port))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["corpus_version"], "v1");
}

#[tokio::test]
async fn test_query_returns_grounded_answer_with_sources() {
    let tmp = TempDir::new().unwrap();
    let (fx, port) = book_server(&tmp, "", "ROS 2 connects components [Source 1].").await;

    let resp = post(
        port,
        "/query",
        json!({"query": "What is ROS 2?", "session_id": "web-1"}),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["grounded"], true);
    assert_eq!(body["session_id"], "web-1");
    assert_eq!(body["answer"], "ROS 2 connects components [Source 1].");
    assert_eq!(body["source_refs"][0]["chunk_id"], fx.chunk_ids[&0].as_str());
    assert_eq!(body["tokens"]["input"], 250);
    assert!(body["latency_ms"].is_u64());
}

#[tokio::test]
async fn test_query_without_session_gets_one_assigned() {
    let tmp = TempDir::new().unwrap();
    let (_fx, port) = book_server(&tmp, "", "ROS 2 answer.").await;

    let body: Value = post(port, "/query", json!({"query": "What is ROS 2?"}))
        .await
        .json()
        .await
        .unwrap();
    let session_id = body["session_id"].as_str().unwrap();
    assert!(!session_id.is_empty());

    let history = reqwest::get(format!(
        "http://127.0.0.1:{}/sessions/{}/history",
        port, session_id
    ))
    .await
    .unwrap();
    assert_eq!(history.status(), 200);
}

#[tokio::test]
async fn test_invalid_input_is_400() {
    let tmp = TempDir::new().unwrap();
    let (_fx, port) = book_server(&tmp, "", "unused").await;

    let resp = post(port, "/query", json!({"query": "   "})).await;
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error_kind"], "invalid_input");
    assert!(body.get("retry_after").is_none());

    let resp = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{}/query", port))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error_kind"], "invalid_input");

    let resp = post(
        port,
        "/query",
        json!({"query": "What is ROS 2?", "session_id": "has spaces"}),
    )
    .await;
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_eleventh_question_in_a_minute_is_429() {
    let tmp = TempDir::new().unwrap();
    let (_fx, port) = book_server(&tmp, "", "ROS 2 answer.").await;

    for i in 0..10 {
        let resp = post(
            port,
            "/query",
            json!({"query": "What is ROS 2?", "session_id": "busy"}),
        )
        .await;
        assert_eq!(resp.status(), 200, "request {} should be admitted", i + 1);
    }

    let resp = post(
        port,
        "/query",
        json!({"query": "What is ROS 2?", "session_id": "busy"}),
    )
    .await;
    assert_eq!(resp.status(), 429);
    assert_eq!(resp.headers()["retry-after"], "45");
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error_kind"], "rate_limited");
    assert_eq!(body["retry_after"], 45);

    // Another session from the same client is unaffected.
    let resp = post(
        port,
        "/query",
        json!({"query": "What is ROS 2?", "session_id": "calm"}),
    )
    .await;
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn test_client_limit_follows_forwarded_address_when_trusted() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(&tmp, "\n[rate_limit]\nclient_limit = 2\n");
    config.server.trust_forwarded_for = true;
    let (_fx, port) = book_server_with(config, "ROS 2 answer.").await;
    let client = reqwest::Client::new();

    let ask = |session: &str, forwarded: &str| {
        client
            .post(format!("http://127.0.0.1:{}/query", port))
            .header("x-forwarded-for", forwarded.to_string())
            .json(&json!({"query": "What is ROS 2?", "session_id": session}))
            .send()
    };

    assert_eq!(ask("a", "198.51.100.4").await.unwrap().status(), 200);
    assert_eq!(ask("b", "198.51.100.4, 10.0.0.1").await.unwrap().status(), 200);

    let resp = ask("c", "198.51.100.4").await.unwrap();
    assert_eq!(resp.status(), 429);
    let body: Value = resp.json().await.unwrap();
    assert!(body["message"].as_str().unwrap().contains("client"));
    assert!(body["retry_after"].as_u64().unwrap() > 0);

    assert_eq!(ask("d", "198.51.100.5").await.unwrap().status(), 200);
}

#[tokio::test]
async fn test_forwarded_header_is_ignored_by_default() {
    let tmp = TempDir::new().unwrap();
    let (_fx, port) = book_server(&tmp, "\n[rate_limit]\nclient_limit = 2\n", "ROS 2 answer.").await;
    let client = reqwest::Client::new();

    // Rotating the header on every request must not mint new clients.
    let mut statuses = Vec::new();
    for i in 0..5 {
        let resp = client
            .post(format!("http://127.0.0.1:{}/query", port))
            .header("x-forwarded-for", format!("10.9.9.{}", i))
            .json(&json!({"query": "What is ROS 2?", "session_id": format!("rotating-{}", i)}))
            .send()
            .await
            .unwrap();
        statuses.push(resp.status().as_u16());
        if i == 2 {
            let body: Value = resp.json().await.unwrap();
            assert_eq!(body["error_kind"], "rate_limited");
            assert!(body["message"].as_str().unwrap().contains("client"));
        }
    }
    assert_eq!(statuses, vec![200, 200, 429, 429, 429]);
}

#[tokio::test]
async fn test_history_endpoint() {
    let tmp = TempDir::new().unwrap();
    let (_fx, port) = book_server(&tmp, "", "ROS 2 answer.").await;

    for q in ["What is ROS 2?", "Tell me about Gazebo"] {
        post(port, "/query", json!({"query": q, "session_id": "notes"})).await;
    }

    let resp = reqwest::get(format!(
        "http://127.0.0.1:{}/sessions/notes/history?limit=1",
        port
    ))
    .await
    .unwrap();
    assert_eq!(resp.status(), 200);
    let page: Value = resp.json().await.unwrap();
    assert_eq!(page["message_count"], 2);
    assert_eq!(page["messages"].as_array().unwrap().len(), 1);
    assert_eq!(page["messages"][0]["user_text"], "What is ROS 2?");
    assert_eq!(page["next_cursor"], 1);

    let resp = reqwest::get(format!(
        "http://127.0.0.1:{}/sessions/notes/history?after=1",
        port
    ))
    .await
    .unwrap();
    let page: Value = resp.json().await.unwrap();
    assert_eq!(page["messages"][0]["user_text"], "Tell me about Gazebo");
    assert!(page.get("next_cursor").is_none());

    let resp = reqwest::get(format!(
        "http://127.0.0.1:{}/sessions/nobody/history",
        port
    ))
    .await
    .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error_kind"], "not_found");

    let resp = reqwest::get(format!(
        "http://127.0.0.1:{}/sessions/notes/history?limit=many",
        port
    ))
    .await
    .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_selection_outside_knowledge_is_refused() {
    let tmp = TempDir::new().unwrap();
    let provider = Arc::new(FixedProvider::replying(
        "gpt-4o",
        "The top speed is about 1.5 m/s.",
    ));
    let fx = fixture(
        test_config(&tmp, ""),
        Arc::new(KeywordEmbedder::new(&["modularity", "redundancy", "speed"])),
        vec![provider as Arc<dyn CompletionProvider>],
    )
    .await;
    let port = start(&fx).await;

    let resp = post(
        port,
        "/query/selection",
        json!({
            "query": "What is the top speed of this robot?",
            "selected_text": "Design principles include modularity and redundancy.",
            "session_id": "sel-1"
        }),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["in_selected_text"], false);
    assert_eq!(body["answer"], SELECTION_REFUSAL);
    assert_eq!(body["selection_truncated"], false);

    let resp = post(
        port,
        "/query/selection",
        json!({"query": "What is this?", "selected_text": ""}),
    )
    .await;
    assert_eq!(resp.status(), 400);
}
