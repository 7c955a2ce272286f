use std::net::TcpListener;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use mockito::{Matcher, Server};
use serde_json::json;

use quill_adapters::{
    create_embedding_adapter, create_text_adapter, spawn_embedding_probe, spawn_text_probe,
    test_text, AdapterError, AdapterOptions, ProbeError, ProbeReport, RetryConfig,
    EMBEDDING_PROBE_TEXT, TEXT_PROBE_PROMPT,
};
use quill_core::{
    EmbeddingModelError, EmbeddingProfile, LanguageModelError, NetworkConfig, ProviderProfile,
    VecLogSink,
};

fn options() -> AdapterOptions {
    AdapterOptions::new(NetworkConfig::direct()).with_retry(RetryConfig::once())
}

fn chat_body(content: &str) -> String {
    json!({ "choices": [ { "message": { "role": "assistant", "content": content } } ] })
        .to_string()
}

fn adapter_error(err: &LanguageModelError) -> &AdapterError {
    let inner = err
        .as_inner()
        .downcast_ref::<AdapterError>()
        .expect("adapter error inside language model error");
    match inner {
        AdapterError::RetryExhausted { source, .. } => source.as_ref(),
        other => other,
    }
}

fn embedding_adapter_error(err: &EmbeddingModelError) -> &AdapterError {
    let inner = err
        .as_inner()
        .downcast_ref::<AdapterError>()
        .expect("adapter error inside embedding model error");
    match inner {
        AdapterError::RetryExhausted { source, .. } => source.as_ref(),
        other => other,
    }
}

/// Accepts connections and never answers them.
fn silent_server_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind silent listener");
    let address = listener.local_addr().expect("silent listener address");
    thread::spawn(move || {
        let mut held = Vec::new();
        for stream in listener.incoming().flatten() {
            held.push(stream);
        }
    });
    format!("http://{address}")
}

fn assert_timed_out(err: &AdapterError) {
    match err {
        AdapterError::Http(source) => assert!(source.is_timeout(), "not a timeout: {source}"),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn chat_completion_sends_bearer_key_and_model() {
    let mut server = Server::new();
    let mock = server
        .mock("POST", "/v1/chat/completions")
        .match_header("authorization", "Bearer sk-test")
        .match_body(Matcher::PartialJson(json!({
            "model": "deepseek-chat",
            "messages": [
                { "role": "system", "content": "You are a helpful assistant." },
                { "role": "user", "content": "写一句开场白" },
            ],
            "max_tokens": 8192,
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(chat_body("夜色如墨。"))
        .create();

    let mut profile = ProviderProfile::new("DeepSeek", server.url(), "deepseek-chat");
    profile.api_key = "sk-test".to_string();
    let adapter = create_text_adapter(&profile, &options()).unwrap();

    assert_eq!(adapter.invoke("写一句开场白").unwrap(), "夜色如墨。");
    mock.assert();
}

#[test]
fn non_success_status_is_reported_with_body() {
    let mut server = Server::new();
    let mock = server
        .mock("POST", "/v1/chat/completions")
        .with_status(401)
        .with_body("invalid api key")
        .create();

    let profile = ProviderProfile::new("OpenAI", server.url(), "gpt-4o-mini");
    let adapter = create_text_adapter(&profile, &options()).unwrap();
    let err = adapter.invoke("hi").unwrap_err();

    match adapter_error(&err) {
        AdapterError::HttpStatus { status, body } => {
            assert_eq!(status.as_u16(), 401);
            assert_eq!(body, "invalid api key");
        }
        other => panic!("unexpected error: {other}"),
    }
    mock.assert();
}

#[test]
fn blank_choices_count_as_an_empty_response() {
    let mut server = Server::new();
    let mock = server
        .mock("POST", "/v1/chat/completions")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(chat_body("   "))
        .expect(2)
        .create();

    let profile = ProviderProfile::new("Ollama", server.url(), "qwen2.5");
    let retrying = AdapterOptions::new(NetworkConfig::direct())
        .with_retry(RetryConfig::new(2, Duration::ZERO));
    let adapter = create_text_adapter(&profile, &retrying).unwrap();
    let err = adapter.invoke("hi").unwrap_err();

    assert!(matches!(adapter_error(&err), AdapterError::EmptyResponse));
    mock.assert();
}

#[test]
fn batch_embeddings_follow_response_indices() {
    let mut server = Server::new();
    let mock = server
        .mock("POST", "/v1/embeddings")
        .match_body(Matcher::PartialJson(json!({
            "model": "text-embedding-3-small",
            "input": ["甲", "乙"],
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "data": [
                    { "index": 1, "embedding": [0.0, 1.0] },
                    { "index": 0, "embedding": [1.0, 0.0] },
                ]
            })
            .to_string(),
        )
        .create();

    let profile = EmbeddingProfile::new("OpenAI", server.url(), "text-embedding-3-small");
    let adapter = create_embedding_adapter(&profile, &options()).unwrap();
    let vectors = adapter
        .try_embed_documents(&["甲".to_string(), "乙".to_string()])
        .unwrap();

    assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    mock.assert();
}

#[test]
fn dashscope_embeds_one_text_per_request() {
    let mut server = Server::new();
    let mock = server
        .mock("POST", "/embeddings")
        .match_header("authorization", "Bearer ds-key")
        .match_body(Matcher::PartialJson(json!({ "model": "text-embedding-v3" })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({ "data": [ { "embedding": [0.5, 0.25, 0.125] } ] }).to_string())
        .expect(3)
        .create();

    let mut profile = EmbeddingProfile::new("阿里云百炼", server.url(), "text-embedding-v3");
    profile.api_key = "ds-key".to_string();
    let adapter = create_embedding_adapter(&profile, &options()).unwrap();
    let texts: Vec<String> = ["一", "二", "三"].iter().map(|s| s.to_string()).collect();
    let vectors = adapter.try_embed_documents(&texts).unwrap();

    assert_eq!(vectors.len(), 3);
    assert!(vectors.iter().all(|v| v.len() == 3));
    mock.assert();
}

#[test]
fn embedding_failures_degrade_to_empty_vectors() {
    let mut server = Server::new();
    let _mock = server.mock("POST", "/api/embeddings").with_status(500).create();

    let profile = EmbeddingProfile::new("Ollama", server.url(), "nomic-embed-text");
    let adapter = create_embedding_adapter(&profile, &options()).unwrap();

    assert!(adapter.embed_query("雨").is_empty());
    assert!(adapter.try_embed_query("雨").is_err());
}

#[test]
fn single_item_batch_empties_only_the_failed_text() {
    let mut server = Server::new();
    let sunny = server
        .mock("POST", "/v1/embeddings")
        .match_body(Matcher::PartialJson(json!({ "input": "晴" })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({ "data": [ { "embedding": [1.0, 2.0] } ] }).to_string())
        .expect(2)
        .create();
    let rainy = server
        .mock("POST", "/v1/embeddings")
        .match_body(Matcher::PartialJson(json!({ "input": "雨" })))
        .with_status(500)
        .with_body("model crashed")
        .expect(1)
        .create();

    let profile = EmbeddingProfile::new("ML Studio", server.url(), "bge-m3");
    let adapter = create_embedding_adapter(&profile, &options()).unwrap();
    let texts: Vec<String> = ["晴", "雨", "晴"].iter().map(|s| s.to_string()).collect();
    let vectors = adapter.embed_documents(&texts);

    assert_eq!(vectors, vec![vec![1.0, 2.0], Vec::new(), vec![1.0, 2.0]]);
    sunny.assert();
    rainy.assert();
}

#[test]
fn text_requests_honor_the_profile_timeout() {
    let mut profile = ProviderProfile::new("OpenAI", silent_server_url(), "gpt-4o-mini");
    profile.timeout_secs = 1;
    let adapter = create_text_adapter(&profile, &options()).unwrap();

    let started = Instant::now();
    let err = adapter.invoke("hi").unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(30));
    assert_timed_out(adapter_error(&err));
}

#[test]
fn embedding_requests_honor_the_profile_timeout() {
    let mut profile = EmbeddingProfile::new("Ollama", silent_server_url(), "nomic-embed-text");
    profile.timeout_secs = 1;
    let adapter = create_embedding_adapter(&profile, &options()).unwrap();

    let started = Instant::now();
    let err = adapter.try_embed_query("雨").unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(30));
    assert_timed_out(embedding_adapter_error(&err));
}

#[test]
fn gemini_sends_key_as_query_and_reads_candidates() {
    let mut server = Server::new();
    let mock = server
        .mock("POST", "/models/gemini-2.0-flash:generateContent")
        .match_query(Matcher::UrlEncoded("key".into(), "g-key".into()))
        .match_body(Matcher::PartialJson(json!({
            "contents": [ { "role": "user", "parts": [ { "text": "你好" } ] } ],
            "generationConfig": { "maxOutputTokens": 8192 },
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({ "candidates": [ { "content": { "parts": [ { "text": "您好。" } ] } } ] })
                .to_string(),
        )
        .create();

    let mut profile = ProviderProfile::new("Gemini", server.url(), "gemini-2.0-flash");
    profile.api_key = "g-key".to_string();
    let adapter = create_text_adapter(&profile, &options()).unwrap();

    assert_eq!(adapter.invoke("你好").unwrap(), "您好。");
    mock.assert();
}

#[test]
fn gemini_waits_out_a_rate_limit_and_retries() {
    let mut server = Server::new();
    let limited = server
        .mock("POST", "/models/gemini-2.0-flash:generateContent")
        .match_query(Matcher::Any)
        .with_status(429)
        .with_body(
            json!({
                "error": {
                    "code": 429,
                    "message": "Resource has been exhausted (e.g. check quota).",
                    "details": [ { "retryDelay": "0s" } ],
                }
            })
            .to_string(),
        )
        .expect(1)
        .create();
    let recovered = server
        .mock("POST", "/models/gemini-2.0-flash:generateContent")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({ "candidates": [ { "content": { "parts": [ { "text": "继续" } ] } } ] })
                .to_string(),
        )
        .expect(1)
        .create();

    let mut profile = ProviderProfile::new("Gemini", server.url(), "gemini-2.0-flash");
    profile.api_key = "g-key".to_string();
    let retrying = AdapterOptions::new(NetworkConfig::direct())
        .with_retry(RetryConfig::new(2, Duration::from_millis(10)));
    let adapter = create_text_adapter(&profile, &retrying).unwrap();

    assert_eq!(adapter.invoke("下一段").unwrap(), "继续");
    limited.assert();
    recovered.assert();
}

#[test]
fn gemini_does_not_retry_other_failures() {
    let mut server = Server::new();
    let mock = server
        .mock("POST", "/models/gemini-2.0-flash:generateContent")
        .match_query(Matcher::Any)
        .with_status(400)
        .with_body("API key not valid")
        .expect(1)
        .create();

    let mut profile = ProviderProfile::new("Gemini", server.url(), "gemini-2.0-flash");
    profile.api_key = "bad".to_string();
    let retrying = AdapterOptions::new(NetworkConfig::direct())
        .with_retry(RetryConfig::new(3, Duration::from_millis(10)));
    let adapter = create_text_adapter(&profile, &retrying).unwrap();

    let err = adapter.invoke("hi").unwrap_err();
    assert!(matches!(
        adapter_error(&err),
        AdapterError::HttpStatus { status, .. } if status.as_u16() == 400
    ));
    mock.assert();
}

#[test]
fn azure_openai_chat_sends_api_key_header() {
    let mut server = Server::new();
    let mock = server
        .mock("POST", "/openai/deployments/gpt4o/chat/completions")
        .match_query(Matcher::UrlEncoded("api-version".into(), "2024-02-01".into()))
        .match_header("api-key", "az-key")
        .match_header("authorization", Matcher::Missing)
        .match_body(Matcher::PartialJson(json!({
            "messages": [ { "role": "user", "content": "hi" } ],
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(chat_body("hello"))
        .create();

    let base_url = format!(
        "{}/openai/deployments/gpt4o/chat/completions?api-version=2024-02-01",
        server.url()
    );
    let mut profile = ProviderProfile::new("Azure OpenAI", base_url, "");
    profile.api_key = "az-key".to_string();
    let adapter = create_text_adapter(&profile, &options()).unwrap();

    assert_eq!(adapter.invoke("hi").unwrap(), "hello");
    mock.assert();
}

#[test]
fn azure_openai_embeddings_send_api_key_header() {
    let mut server = Server::new();
    let mock = server
        .mock("POST", "/openai/deployments/embed/embeddings")
        .match_query(Matcher::UrlEncoded("api-version".into(), "2024-02-01".into()))
        .match_header("api-key", "az-key")
        .match_body(Matcher::PartialJson(json!({ "input": ["甲"] })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({ "data": [ { "index": 0, "embedding": [0.5, 0.5] } ] }).to_string())
        .create();

    let base_url = format!(
        "{}/openai/deployments/embed/embeddings?api-version=2024-02-01",
        server.url()
    );
    let mut profile = EmbeddingProfile::new("Azure OpenAI", base_url, "");
    profile.api_key = "az-key".to_string();
    let adapter = create_embedding_adapter(&profile, &options()).unwrap();

    assert_eq!(adapter.try_embed_query("甲").unwrap(), vec![0.5, 0.5]);
    mock.assert();
}

#[test]
fn text_probe_reports_reply_and_logs_success() {
    let mut server = Server::new();
    let mock = server
        .mock("POST", "/v1/chat/completions")
        .match_body(Matcher::PartialJson(json!({
            "messages": [
                { "role": "system", "content": "You are a helpful assistant." },
                { "role": "user", "content": TEXT_PROBE_PROMPT },
            ],
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(chat_body("OK"))
        .create();

    let sink = Arc::new(VecLogSink::new());
    let profile = ProviderProfile::new("OpenAI", server.url(), "gpt-4o-mini");
    let outcome = spawn_text_probe(&profile, &options(), sink.clone()).wait();

    assert_eq!(
        outcome.unwrap(),
        ProbeReport::Text {
            reply: "OK".to_string()
        }
    );
    assert!(sink.messages().contains(&"✅ LLM配置测试成功！".to_string()));
    mock.assert();
}

#[tokio::test(flavor = "multi_thread")]
async fn embedding_probe_reports_dimensions_asynchronously() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/v1/embeddings")
        .match_body(Matcher::PartialJson(json!({ "input": EMBEDDING_PROBE_TEXT })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({ "data": [ { "embedding": [0.1, 0.2, 0.3, 0.4] } ] }).to_string())
        .create_async()
        .await;

    let sink = Arc::new(VecLogSink::new());
    let profile = EmbeddingProfile::new("ML Studio", server.url(), "bge-m3");
    let outcome = spawn_embedding_probe(&profile, &options(), sink.clone())
        .outcome()
        .await;

    assert_eq!(outcome.unwrap(), ProbeReport::Embedding { dimensions: 4 });
    assert!(sink.messages().contains(&"生成的向量维度: 4".to_string()));
    mock.assert_async().await;
}

#[test]
fn probe_with_missing_credentials_fails_without_a_request() {
    let sink = Arc::new(VecLogSink::new());
    let profile = ProviderProfile::new("Gemini", "", "gemini-2.0-flash");
    let outcome = spawn_text_probe(&profile, &options(), sink).wait();
    assert!(matches!(outcome, Err(ProbeError::Text(_))));
}

#[test]
fn callback_probe_routes_failures_to_on_error() {
    let mut server = Server::new();
    let _mock = server
        .mock("POST", "/v1/chat/completions")
        .with_status(503)
        .with_body("overloaded")
        .create();

    let (log_tx, log_rx) = mpsc::channel::<String>();
    let log_tx = std::sync::Mutex::new(log_tx);
    let (err_tx, err_rx) = mpsc::channel::<String>();
    let profile = ProviderProfile::new("OpenAI", server.url(), "gpt-4o-mini");

    test_text(
        &profile,
        &options(),
        move |message| {
            if let Ok(tx) = log_tx.lock() {
                let _ = tx.send(message);
            }
        },
        move |message| {
            let _ = err_tx.send(message);
        },
    );

    let error = err_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert!(error.starts_with("LLM配置测试失败"));
    let logs: Vec<String> = log_rx.try_iter().collect();
    assert!(logs.iter().any(|m| m.starts_with("❌ LLM配置测试失败")));
}
