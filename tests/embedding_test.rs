//! Embedding providers against mock HTTP endpoints.

use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use severus::config::EmbeddingConfig;
use severus::embedding::{create_provider, OllamaProvider, OpenAIProvider};
use severus_core::embedding::EmbeddingProvider;

fn openai_config(server: &MockServer, key_env: &str) -> EmbeddingConfig {
    EmbeddingConfig {
        provider: "openai".to_string(),
        model: Some("text-embedding-3-small".to_string()),
        dims: Some(3),
        url: Some(server.uri()),
        api_key_env: key_env.to_string(),
        max_retries: 1,
        ..EmbeddingConfig::default()
    }
}

fn texts(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_openai_embeds_in_input_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .and(header("authorization", "Bearer sk-embed"))
        .and(body_partial_json(json!({"model": "text-embedding-3-small"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0, 0.0]},
                {"index": 0, "embedding": [1.0, 0.0, 0.0]}
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    std::env::set_var("SEVERUS_TEST_EMBED_KEY_ORDER", "sk-embed");
    let provider = OpenAIProvider::new(&openai_config(&server, "SEVERUS_TEST_EMBED_KEY_ORDER")).unwrap();
    assert_eq!(provider.dims(), 3);
    let vectors = provider.embed(&texts(&["incêndio", "fogo"])).await.unwrap();
    assert_eq!(vectors, vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0]]);
}

#[tokio::test]
async fn test_openai_retries_server_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"index": 0, "embedding": [0.5, 0.5, 0.0]}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    std::env::set_var("SEVERUS_TEST_EMBED_KEY_RETRY", "sk-embed");
    let provider = OpenAIProvider::new(&openai_config(&server, "SEVERUS_TEST_EMBED_KEY_RETRY")).unwrap();
    let vectors = provider.embed(&texts(&["queimada"])).await.unwrap();
    assert_eq!(vectors.len(), 1);
}

#[tokio::test]
async fn test_openai_client_error_fails_immediately() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad input"))
        .expect(1)
        .mount(&server)
        .await;

    std::env::set_var("SEVERUS_TEST_EMBED_KEY_400", "sk-embed");
    let provider = OpenAIProvider::new(&openai_config(&server, "SEVERUS_TEST_EMBED_KEY_400")).unwrap();
    let err = provider.embed(&texts(&["x"])).await.unwrap_err();
    assert!(err.to_string().contains("400"));
    assert!(err.to_string().contains("bad input"));
}

#[tokio::test]
async fn test_ollama_embed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .and(body_partial_json(json!({"model": "nomic-embed-text", "input": ["área ardida"]})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "embeddings": [[0.1, 0.2]]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let config = EmbeddingConfig {
        provider: "ollama".to_string(),
        model: Some("nomic-embed-text".to_string()),
        dims: Some(2),
        url: Some(server.uri()),
        ..EmbeddingConfig::default()
    };
    let provider = OllamaProvider::new(&config).unwrap();
    let vectors = provider.embed(&texts(&["área ardida"])).await.unwrap();
    assert_eq!(vectors.len(), 1);
    assert!((vectors[0][1] - 0.2).abs() < 1e-6);
}

#[tokio::test]
async fn test_create_provider_by_name() {
    let server = MockServer::start().await;
    let disabled = create_provider(&EmbeddingConfig::default()).unwrap();
    assert_eq!(disabled.model_name(), "disabled");
    assert!(disabled.embed(&texts(&["x"])).await.is_err());

    let ollama = create_provider(&EmbeddingConfig {
        provider: "ollama".to_string(),
        model: Some("nomic-embed-text".to_string()),
        dims: Some(768),
        url: Some(server.uri()),
        ..EmbeddingConfig::default()
    })
    .unwrap();
    assert_eq!(ollama.model_name(), "nomic-embed-text");
    assert_eq!(ollama.dims(), 768);
}
