//! Chat orchestration against a mock completion API.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use severus::chat::{ChatService, CompletionClient, ContextStatus};
use severus::config::{ChatConfig, Config};
use severus::corpus::{DocumentCache, Retriever};
use severus_core::embedding::EmbeddingProvider;
use severus_core::models::{ChatMessage, Document, DocumentMetadata, Role};

struct FixedProvider {
    delay: Duration,
}

#[async_trait]
impl EmbeddingProvider for FixedProvider {
    fn model_name(&self) -> &str {
        "fixed"
    }
    fn dims(&self) -> usize {
        2
    }
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        tokio::time::sleep(self.delay).await;
        Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
    }
}

fn corpus() -> Vec<Document> {
    vec![Document {
        id: "rbr.pdf_chunk_0".to_string(),
        content: "O RBR relativiza o dNBR pelo NBR pré-fogo mais 1,001.".to_string(),
        metadata: DocumentMetadata {
            title: "rbr (Parte 1)".to_string(),
            source: "Documentos SeverusPT".to_string(),
            category: "incendios_florestais".to_string(),
            date: None,
        },
        embedding: Some(vec![1.0, 0.0]),
        hash: None,
    }]
}

fn chat_config(server: &MockServer) -> ChatConfig {
    ChatConfig {
        base_url: server.uri(),
        backoff_base_ms: 10,
        retrieval_timeout_secs: 1,
        ..ChatConfig::default()
    }
}

fn service(chat: ChatConfig, delay: Duration) -> ChatService {
    let config = Config::minimal("127.0.0.1:0");
    let cache = Arc::new(DocumentCache::with_documents("unused.json", corpus()));
    let retriever = Arc::new(Retriever::new(&config, cache, Arc::new(FixedProvider { delay })));
    let client = CompletionClient::with_api_key(&chat, Some("sk-test".to_string())).unwrap();
    ChatService::new(retriever, client, chat, config.rag.min_similarity)
}

fn question() -> Vec<ChatMessage> {
    vec![ChatMessage::new(Role::User, "O que é o RBR?")]
}

fn completion(content: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "choices": [{"message": {"role": "assistant", "content": content}}]
    }))
}

#[tokio::test]
async fn test_reply_with_context() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(header("x-title", "SeverusBot"))
        .respond_with(completion("  O RBR é o rácio relativizado.  "))
        .expect(1)
        .mount(&server)
        .await;

    let response = service(chat_config(&server), Duration::ZERO)
        .answer(&question())
        .await
        .unwrap();
    assert_eq!(response.reply, "O RBR é o rácio relativizado.");
    assert_eq!(response.context, ContextStatus::Found);

    let requests = server.received_requests().await.unwrap();
    let sent: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(sent["messages"][0]["role"], "system");
    let system = sent["messages"][0]["content"].as_str().unwrap();
    assert!(system.contains("[Fonte: rbr (Parte 1)]"));
    assert_eq!(sent["messages"][1]["content"], "O que é o RBR?");
    assert_eq!(sent["max_tokens"], 800);
}

#[tokio::test]
async fn test_retries_server_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(completion("Resposta após nova tentativa."))
        .expect(1)
        .mount(&server)
        .await;

    let response = service(chat_config(&server), Duration::ZERO)
        .answer(&question())
        .await
        .unwrap();
    assert_eq!(response.reply, "Resposta após nova tentativa.");
}

#[tokio::test]
async fn test_fallback_after_exhausting_retries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429))
        .expect(3)
        .mount(&server)
        .await;

    let chat = chat_config(&server);
    let fallback = chat.fallback_reply.clone();
    let response = service(chat, Duration::ZERO).answer(&question()).await.unwrap();
    assert_eq!(response.reply, fallback);
}

#[tokio::test]
async fn test_client_error_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let chat = chat_config(&server);
    let fallback = chat.fallback_reply.clone();
    let response = service(chat, Duration::ZERO).answer(&question()).await.unwrap();
    assert_eq!(response.reply, fallback);
}

#[tokio::test]
async fn test_empty_completion_uses_empty_reply() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(completion("   "))
        .mount(&server)
        .await;

    let chat = chat_config(&server);
    let empty = chat.empty_reply.clone();
    let response = service(chat, Duration::ZERO).answer(&question()).await.unwrap();
    assert_eq!(response.reply, empty);
}

#[tokio::test]
async fn test_slow_retrieval_answers_without_context() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(completion("Sem contexto, mas com resposta."))
        .expect(1)
        .mount(&server)
        .await;

    let response = service(chat_config(&server), Duration::from_secs(3))
        .answer(&question())
        .await
        .unwrap();
    assert_eq!(response.context, ContextStatus::Unavailable);
    assert_eq!(response.reply, "Sem contexto, mas com resposta.");

    let requests = server.received_requests().await.unwrap();
    let sent: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert!(!sent["messages"][0]["content"].as_str().unwrap().contains("CONTEXTO"));
}
