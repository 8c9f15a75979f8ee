//! Adapter tests against a throwaway HTTP server on localhost.
//!
//! The stub answers one canned response per connection (with
//! `Connection: close`) and records every request it sees.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use doppel_core::collab::{CompletionParams, CompletionProvider};
use doppel_core::error::{CompletionError, EmbeddingError};
use doppel_core::twin::TraitUpdate;
use doppel_core::{DigitalTwin, EmbeddingProvider, HashingEmbeddingProvider, TwinConfig};
use doppel_llm::{HttpEmbedder, LlmClient, LlmProvider, TemplatePromptRenderer};

#[derive(Debug, Clone)]
struct Seen {
    head: String,
    path: String,
    body: Value,
}

struct Stub {
    base_url: String,
    seen: Arc<Mutex<Vec<Seen>>>,
}

impl Stub {
    fn requests(&self) -> Vec<Seen> {
        self.seen.lock().clone()
    }
}

async fn read_request(stream: &mut TcpStream) -> Seen {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut chunk).await.expect("read");
        assert!(n > 0, "client closed before sending headers");
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };
    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let length = head
        .lines()
        .filter_map(|l| l.split_once(':'))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    while buf.len() < header_end + length {
        let n = stream.read(&mut chunk).await.expect("read body");
        assert!(n > 0, "client closed mid-body");
        buf.extend_from_slice(&chunk[..n]);
    }
    let path = head
        .lines()
        .next()
        .and_then(|l| l.split_whitespace().nth(1))
        .unwrap_or_default()
        .to_string();
    let body = serde_json::from_slice(&buf[header_end..header_end + length]).unwrap_or(Value::Null);
    Seen { head, path, body }
}

/// Serve `responses` in order, one per connection.
async fn stub(responses: Vec<(u16, Value)>) -> Stub {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    tokio::spawn(async move {
        for (status, body) in responses {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let request = read_request(&mut stream).await;
            log.lock().push(request);
            let payload = body.to_string();
            let reason = if status == 200 { "OK" } else { "Error" };
            let response = format!(
                "HTTP/1.1 {status} {reason}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{payload}",
                payload.len()
            );
            stream.write_all(response.as_bytes()).await.expect("write");
            let _ = stream.shutdown().await;
        }
    });
    Stub {
        base_url: format!("http://{addr}"),
        seen,
    }
}

fn ollama(stub: &Stub, model: &str, max_retries: u32) -> LlmClient {
    LlmClient::new(
        LlmProvider::Ollama {
            base_url: stub.base_url.clone(),
        },
        model,
        5_000,
        max_retries,
    )
    .expect("client")
}

#[tokio::test]
async fn ollama_generate_round_trip() {
    let server = stub(vec![(200, json!({"response": "hello there", "eval_count": 3}))]).await;
    let client = ollama(&server, "llama3.2", 0);

    let params = CompletionParams::default().with_temperature(0.2);
    let text = client.complete("Say hello", &params).await.expect("completion");
    assert_eq!(text, "hello there");
    assert_eq!(client.name(), "ollama");

    let seen = server.requests();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].path, "/api/generate");
    assert_eq!(seen[0].body["model"], json!("llama3.2"));
    assert_eq!(seen[0].body["prompt"], json!("Say hello"));
    assert_eq!(seen[0].body["stream"], json!(false));
}

#[tokio::test]
async fn openai_sends_bearer_token() {
    let server = stub(vec![(200, json!({"choices": [{"message": {"content": "hi"}}]}))]).await;
    let client = LlmClient::new(
        LlmProvider::OpenAiCompatible {
            base_url: server.base_url.clone(),
            api_key: "sk-test".into(),
        },
        "gpt-4o-mini",
        5_000,
        0,
    )
    .expect("client");

    assert_eq!(client.complete("hey", &CompletionParams::default()).await.expect("ok"), "hi");
    let seen = server.requests();
    assert_eq!(seen[0].path, "/v1/chat/completions");
    assert!(seen[0].head.to_ascii_lowercase().contains("authorization: bearer sk-test"));
    assert_eq!(seen[0].body["messages"][0]["role"], json!("user"));
}

#[tokio::test]
async fn server_errors_are_retried() {
    let server = stub(vec![
        (500, json!({"error": "loading model"})),
        (200, json!({"response": "recovered"})),
    ])
    .await;
    let client = ollama(&server, "llama3.2", 1);

    let text = client.complete("again", &CompletionParams::default()).await.expect("second attempt");
    assert_eq!(text, "recovered");
    assert_eq!(server.requests().len(), 2);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let server = stub(vec![
        (400, json!({"error": "bad request"})),
        (200, json!({"response": "never sent"})),
    ])
    .await;
    let client = ollama(&server, "llama3.2", 2);

    let err = client.complete("bad", &CompletionParams::default()).await.expect_err("400");
    assert!(matches!(err, CompletionError::RequestFailed(msg) if msg.contains("400")));
    assert_eq!(server.requests().len(), 1);
}

#[tokio::test]
async fn exhausted_retries_report_attempts() {
    let server = stub(vec![(503, json!({})), (503, json!({}))]).await;
    let client = ollama(&server, "llama3.2", 1);

    let err = client.complete("x", &CompletionParams::default()).await.expect_err("503 twice");
    assert!(matches!(err, CompletionError::RequestFailed(msg) if msg.contains("2 tries")));
}

#[tokio::test]
async fn blank_completion_is_empty_response() {
    let server = stub(vec![(200, json!({"response": "  \n"}))]).await;
    let client = ollama(&server, "llama3.2", 0);
    let err = client.complete("x", &CompletionParams::default()).await.expect_err("blank");
    assert_eq!(err, CompletionError::EmptyResponse);
}

#[tokio::test]
async fn refused_connection_is_unavailable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let client = LlmClient::new(
        LlmProvider::Ollama {
            base_url: format!("http://{addr}"),
        },
        "llama3.2",
        2_000,
        0,
    )
    .expect("client");
    let err = client.complete("x", &CompletionParams::default()).await.expect_err("refused");
    assert!(matches!(err, CompletionError::Unavailable(_)));
}

#[tokio::test]
async fn ollama_embeddings_are_validated() {
    let server = stub(vec![
        (200, json!({"embedding": [0.1, 0.2, 0.3, 0.4]})),
        (200, json!({"embedding": [0.1, 0.2, 0.3]})),
    ])
    .await;
    let embedder = HttpEmbedder::new(ollama(&server, "nomic-embed-text", 0), 4);

    let vector = embedder.embed("sailing").await.expect("embedding");
    assert_eq!(vector.dimensions(), 4);
    assert_eq!(embedder.model_name(), "nomic-embed-text");

    let err = embedder.embed("short").await.expect_err("wrong length");
    assert_eq!(err, EmbeddingError::DimensionMismatch { expected: 4, actual: 3 });

    let seen = server.requests();
    assert_eq!(seen[0].path, "/api/embeddings");
    assert_eq!(seen[0].body["prompt"], json!("sailing"));
}

#[tokio::test]
async fn cached_embedder_from_config_skips_repeat_requests() {
    let server = stub(vec![(200, json!({"embedding": [0.6, 0.8, 0.0]}))]).await;
    let mut config = TwinConfig::default();
    config.llm.base_url = server.base_url.clone();
    config.llm.embedding_model = "nomic-embed-text".into();
    config.memory.embedding_dimensions = 3;
    config.retrieval.query_cache_size = 8;

    let embedder = HttpEmbedder::cached(&config).expect("embedder");
    assert_eq!(embedder.dimensions(), 3);
    let first = embedder.embed("sailing").await.expect("first");
    let second = embedder.embed("sailing").await.expect("cached");
    assert_eq!(first, second);
    assert_eq!(embedder.cached(), 1);

    let seen = server.requests();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].body["model"], json!("nomic-embed-text"));
}

#[tokio::test]
async fn twin_drives_the_http_client() {
    let analysis = "PERSONALITY_UPDATES:\n- openness: +0.4 (confidence: 1.0)\n\n\
                    KNOWLEDGE_UPDATES:\n- Plays the cello\n\nMEMORY_FORMATION:\n";
    let server = stub(vec![(200, json!({"response": analysis}))]).await;

    let mut config = TwinConfig::default();
    config.general.name = "Ada".into();
    config.personality.learning_rate = 1.0;
    let dims = config.memory.embedding_dimensions;
    let twin = DigitalTwin::new(
        config,
        HashingEmbeddingProvider::new(dims),
        ollama(&server, "llama3.2", 0),
        TemplatePromptRenderer::builtin(),
        Utc::now(),
    )
    .expect("twin");
    let before = twin.traits().get("openness").expect("openness");

    let outcome = twin
        .interact("I started cello lessons this week", None, Utc::now())
        .await
        .expect("interact");

    assert!(matches!(outcome.trait_update, TraitUpdate::Applied(_)));
    assert!(twin.traits().get("openness").expect("openness") > before);
    assert!(outcome.admitted.iter().any(|m| m.content.contains("cello")));

    let prompt = server.requests()[0].body["prompt"].as_str().expect("prompt").to_string();
    assert!(prompt.contains("I started cello lessons this week"));
    assert!(prompt.contains("PERSONALITY_UPDATES:"));
    assert!(prompt.contains("- openness: 0.50"));
}
