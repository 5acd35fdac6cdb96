use super::*;
use futures::StreamExt;
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::llm::{Role, ToolCall};

fn client_for(server: &MockServer) -> OllamaClient {
    let uri = Url::parse(&server.uri()).expect("mock server uri should parse");
    let config = OllamaConfig {
        host: uri.host_str().expect("mock server has a host").to_string(),
        port: uri.port().expect("mock server has a port"),
        ..OllamaConfig::default()
    };

    OllamaClient::new(&config)
        .expect("Failed to create client")
        .with_retry_policy(
            RetryPolicy::default()
                .with_attempts(2)
                .with_base_delay(Duration::ZERO),
        )
}

#[test]
fn client_configuration() {
    let config = OllamaConfig {
        protocol: "http".to_string(),
        host: "test-host".to_string(),
        port: 1234,
        embedding_model: "test-model".to_string(),
        ..OllamaConfig::default()
    };
    let client = OllamaClient::new(&config).expect("Failed to create client");

    assert_eq!(client.embedding_model, "test-model");
    assert_eq!(client.base_url.host_str(), Some("test-host"));
    assert_eq!(client.base_url.port(), Some(1234));
    assert_eq!(client.retry, RetryPolicy::default());
}

#[test]
fn client_builder_methods() {
    let client = OllamaClient::new(&OllamaConfig::default())
        .expect("Failed to create client")
        .with_timeout(Duration::from_secs(60))
        .with_retry_policy(RetryPolicy::default().with_attempts(5));

    assert_eq!(client.retry.attempts, 5);
}

#[tokio::test]
async fn embed_sends_model_and_prompt() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embeddings"))
        .and(body_partial_json(json!({
            "model": "nomic-embed-text",
            "prompt": "We pray for the Light"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "embedding": [0.25, -0.5, 1.0]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let vector = client
        .embed("We pray for the Light")
        .await
        .expect("embedding should succeed");

    assert_eq!(vector, vec![0.25, -0.5, 1.0]);
}

#[tokio::test]
async fn embed_failure_is_an_embedding_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embeddings"))
        .respond_with(ResponseTemplate::new(500))
        .expect(2)
        .mount(&server)
        .await;

    let err = client_for(&server)
        .embed("anything")
        .await
        .expect_err("server errors should surface");

    assert!(matches!(err, BreviaryError::Embedding(_)));
    assert!(err.is_service_error());
}

#[tokio::test]
async fn empty_embedding_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embeddings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "embedding": [] })))
        .mount(&server)
        .await;

    let err = client_for(&server)
        .embed("anything")
        .await
        .expect_err("empty vectors are not embeddings");
    assert!(matches!(err, BreviaryError::Embedding(msg) if msg.contains("empty embedding")));
}

#[tokio::test]
async fn chat_parses_tool_calls() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .and(body_partial_json(json!({
            "model": "qwen2.5:7b",
            "stream": false,
            "tools": [{ "type": "function", "function": { "name": "fetch_document" } }]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model": "qwen2.5:7b",
            "message": {
                "role": "assistant",
                "content": "",
                "tool_calls": [{
                    "function": {
                        "name": "fetch_document",
                        "arguments": { "document_id": "breviary_of_targossas" }
                    }
                }]
            },
            "done": true
        })))
        .mount(&server)
        .await;

    let request = ChatRequest {
        model: "qwen2.5:7b".to_string(),
        messages: vec![ChatMessage::system("sys"), ChatMessage::user("pray")],
        tools: vec![ToolDefinition::function(
            "fetch_document",
            "Fetch a document",
            json!({ "type": "object" }),
        )],
    };

    let message = client_for(&server)
        .chat(&request)
        .await
        .expect("chat should succeed");

    assert_eq!(message.role, Role::Assistant);
    assert!(!message.has_content());
    assert_eq!(
        message.tool_calls,
        vec![ToolCall::new(
            "fetch_document",
            json!({ "document_id": "breviary_of_targossas" })
        )]
    );
}

#[tokio::test]
async fn chat_omits_empty_tool_list() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "message": { "role": "assistant", "content": "So mote it be." }
        })))
        .mount(&server)
        .await;

    let request = ChatRequest {
        model: "llama3.2:3b".to_string(),
        messages: vec![ChatMessage::user("hello")],
        tools: Vec::new(),
    };
    let message = client_for(&server)
        .chat(&request)
        .await
        .expect("chat should succeed");
    assert_eq!(message.content, "So mote it be.");

    let received = server
        .received_requests()
        .await
        .expect("request recording is enabled");
    let body: serde_json::Value =
        serde_json::from_slice(&received[0].body).expect("request body is json");
    assert!(body.get("tools").is_none());
}

#[tokio::test]
async fn generate_stream_yields_fragments_in_order() {
    let server = MockServer::start().await;
    let body = [
        json!({ "response": "The ", "done": false }),
        json!({ "response": "Light ", "done": false }),
        json!({ "response": "endures.", "done": false }),
        json!({ "response": "", "done": true }),
    ]
    .iter()
    .map(|line| format!("{}\n", line))
    .collect::<String>();

    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_partial_json(json!({ "model": "llama3.2:3b", "stream": true })))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/x-ndjson"))
        .mount(&server)
        .await;

    let request = GenerateRequest {
        model: "llama3.2:3b".to_string(),
        prompt: "What endures?".to_string(),
    };
    let stream = client_for(&server)
        .generate_stream(&request)
        .await
        .expect("stream should open");

    let fragments: Vec<String> = stream
        .map(|item| item.expect("fragment should be ok"))
        .collect()
        .await;
    assert_eq!(fragments, vec!["The ", "Light ", "endures."]);
}

#[tokio::test]
async fn generate_stream_terminates_on_error_line() {
    let server = MockServer::start().await;
    let body = format!(
        "{}\n{}\n{}\n",
        json!({ "response": "partial", "done": false }),
        json!({ "error": "model crashed" }),
        json!({ "response": "never seen", "done": false }),
    );

    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/x-ndjson"))
        .mount(&server)
        .await;

    let request = GenerateRequest {
        model: "llama3.2:3b".to_string(),
        prompt: "?".to_string(),
    };
    let items: Vec<_> = client_for(&server)
        .generate_stream(&request)
        .await
        .expect("stream should open")
        .collect()
        .await;

    assert_eq!(items.len(), 2);
    assert_eq!(items[0].as_deref().ok(), Some("partial"));
    assert!(matches!(&items[1], Err(BreviaryError::Chat(msg)) if msg.contains("model crashed")));
}

#[tokio::test]
async fn generate_stream_open_failure_is_chat_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let request = GenerateRequest {
        model: "missing".to_string(),
        prompt: "?".to_string(),
    };
    let result = client_for(&server).generate_stream(&request).await;
    assert!(matches!(result, Err(BreviaryError::Chat(_))));
}

/// Serve one `/api/generate` request as chunked NDJSON, pausing `pause` between lines
fn slow_generate_server(lines: Vec<String>, pause: Duration) -> (u16, std::thread::JoinHandle<()>) {
    use std::io::{Read, Write};

    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("should bind listener");
    let port = listener.local_addr().expect("listener has an address").port();

    let handle = std::thread::spawn(move || {
        let (mut socket, _) = listener.accept().expect("should accept connection");

        let mut request = Vec::new();
        let mut buf = [0_u8; 1024];
        let header_end = loop {
            let n = socket.read(&mut buf).expect("should read request");
            assert!(n > 0, "connection closed before headers");
            request.extend_from_slice(&buf[..n]);
            if let Some(pos) = request.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };
        let head = String::from_utf8_lossy(&request[..header_end]).to_lowercase();
        let content_length = head
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|value| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        while request.len() < header_end + content_length {
            let n = socket.read(&mut buf).expect("should read request body");
            assert!(n > 0, "connection closed before body");
            request.extend_from_slice(&buf[..n]);
        }

        socket
            .write_all(
                b"HTTP/1.1 200 OK\r\nContent-Type: application/x-ndjson\r\n\
                  Transfer-Encoding: chunked\r\n\r\n",
            )
            .expect("should write head");
        for (i, line) in lines.iter().enumerate() {
            if i > 0 {
                std::thread::sleep(pause);
            }
            let line = format!("{}\n", line);
            write!(socket, "{:x}\r\n{}\r\n", line.len(), line).expect("should write chunk");
            socket.flush().expect("should flush chunk");
        }
        // The client may already have hung up after reading `done`
        let _ = socket.write_all(b"0\r\n\r\n");
    });

    (port, handle)
}

#[tokio::test]
async fn generate_stream_outlives_request_timeout() {
    let mut lines: Vec<String> = ["Hail ", "Lady ", "Aurora, ", "bringer ", "of dawn."]
        .iter()
        .map(|text| json!({ "response": text, "done": false }).to_string())
        .collect();
    lines.push(json!({ "response": "", "done": true }).to_string());
    let (port, server) = slow_generate_server(lines, Duration::from_millis(300));

    let config = OllamaConfig {
        host: "127.0.0.1".to_string(),
        port,
        ..OllamaConfig::default()
    };
    let client = OllamaClient::new(&config)
        .expect("Failed to create client")
        .with_timeout(Duration::from_secs(1))
        .with_retry_policy(RetryPolicy::default().with_attempts(1));

    let request = GenerateRequest {
        model: "llama3.2:3b".to_string(),
        prompt: "Praise the dawn".to_string(),
    };
    let fragments: Vec<String> = client
        .generate_stream(&request)
        .await
        .expect("stream should open")
        .map(|item| item.expect("a slow but healthy stream should not fail"))
        .collect()
        .await;

    assert_eq!(fragments.concat(), "Hail Lady Aurora, bringer of dawn.");
    server.join().expect("server thread should finish");
}

#[tokio::test]
async fn timed_out_chat_turn_is_not_resent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({
                    "message": { "role": "assistant", "content": "too late" },
                    "done": true
                }))
                .set_delay(Duration::from_secs(2)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let request = ChatRequest {
        model: "qwen2.5:7b".to_string(),
        messages: vec![ChatMessage::user("Pray")],
        tools: Vec::new(),
    };
    let result = client_for(&server)
        .with_timeout(Duration::from_millis(200))
        .chat(&request)
        .await;

    assert!(matches!(result, Err(BreviaryError::Chat(_))));
}

#[tokio::test]
async fn health_check_reports_missing_models() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "models": [
                { "name": "nomic-embed-text:latest" },
                { "name": "qwen2.5:7b" }
            ]
        })))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let ok = tokio::task::spawn_blocking({
        let client = client.clone();
        move || client.health_check(&["nomic-embed-text", "qwen2.5:7b"])
    })
    .await
    .expect("task should join");
    assert!(ok.is_ok());

    let missing = tokio::task::spawn_blocking(move || client.health_check(&["llama3.2:3b"]))
        .await
        .expect("task should join");
    assert!(missing.is_err());
}

#[test]
fn parse_generate_lines() {
    assert_eq!(
        parse_generate_line(r#"{"response":"Amen","done":false}"#).expect("valid line"),
        StreamEvent::Fragment("Amen".to_string())
    );
    assert_eq!(
        parse_generate_line(r#"{"response":"","done":true,"total_duration":5}"#)
            .expect("valid line"),
        StreamEvent::Done
    );
    assert_eq!(
        parse_generate_line("   ").expect("blank lines are skipped"),
        StreamEvent::Skip
    );
    assert!(parse_generate_line("not json").is_err());
    assert!(parse_generate_line(r#"{"error":"boom"}"#).is_err());
}

#[test]
fn model_name_matching() {
    assert!(model_matches("nomic-embed-text:latest", "nomic-embed-text"));
    assert!(model_matches("qwen2.5:7b", "qwen2.5:7b"));
    assert!(!model_matches("qwen2.5:14b", "qwen2.5:7b"));
    assert!(!model_matches("llama3.2:3b", "llama3.2"));
}
