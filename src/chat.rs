//! Retrieval-augmented chat over an OpenAI-compatible completion API
//! (OpenRouter by default).
//!
//! # Flow
//!
//! 1. The last message must come from the user; anything else is a 400.
//! 2. Its text is searched against the corpus under `retrieval_timeout_secs`.
//!    A timeout or retrieval error drops the context, it never fails the turn.
//! 3. Hits are cut to `snippet_chars`, joined, and the joined text is capped
//!    at `context_budget_chars` inside the system message.
//! 4. The completion call is retried up to `max_retries` times on transport
//!    errors, timeouts, 429 and 5xx, waiting `backoff_base_ms · 2^(n-1)`.
//!    When every attempt fails the configured apology is returned.
//!
//! Apart from input validation, [`ChatService::answer`] always yields a reply.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use severus_core::chunk::truncate_chars;
use severus_core::models::{ChatMessage, Role, SearchResult};

use crate::config::ChatConfig;
use crate::corpus::Retriever;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

/// Outcome of the retrieval step, reported back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ContextStatus {
    #[serde(rename = "Contexto encontrado")]
    Found,
    #[serde(rename = "Sem contexto relevante")]
    NotFound,
    /// Retrieval timed out or failed; the reply was generated without context.
    #[serde(rename = "Contexto indisponível")]
    Unavailable,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub reply: String,
    pub context: ContextStatus,
}

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("Mensagem de utilizador inválida")]
    InvalidRequest,
}

/// Format hits as `[Fonte: title]` blocks, each cut to `snippet_chars`.
/// Only hits strictly above `min_similarity` are kept.
pub fn format_context(results: &[SearchResult], min_similarity: f32, snippet_chars: usize) -> String {
    results
        .iter()
        .filter(|r| r.similarity > min_similarity)
        .map(|r| {
            format!(
                "[Fonte: {}]\n{}...",
                r.document.metadata.title,
                truncate_chars(&r.document.content, snippet_chars)
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}

/// The system instruction: answering policy plus the budgeted context.
pub fn system_message(config: &ChatConfig, context: &str) -> ChatMessage {
    let policy = format!(
        "Como especialista em incêndios florestais em Portugal, siga estas regras:\n\
         1. Responda em {}, formal mas acessível\n\
         2. Seja conciso (1-2 parágrafos)\n\
         3. Baseie-se apenas no contexto fornecido\n\
         4. Caso não saiba, responda: \"Não possuo dados suficientes sobre isso\"",
        config.language
    );
    let content = if context.is_empty() {
        policy
    } else {
        format!(
            "{}\n\nCONTEXTO:\n{}",
            policy,
            truncate_chars(context, config.context_budget_chars)
        )
    };
    ChatMessage::new(Role::System, content)
}

enum CompletionError {
    Retryable(anyhow::Error),
    Fatal(anyhow::Error),
}

/// Client for `POST {base_url}/chat/completions`.
pub struct CompletionClient {
    client: reqwest::Client,
    config: ChatConfig,
    api_key: Option<String>,
}

impl CompletionClient {
    pub fn new(config: &ChatConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env).ok().filter(|k| !k.is_empty());
        if api_key.is_none() {
            tracing::warn!(env = %config.api_key_env, "chat API key not set; replies will fall back");
        }
        Self::with_api_key(config, api_key)
    }

    pub fn with_api_key(config: &ChatConfig, api_key: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            config: config.clone(),
            api_key,
        })
    }

    /// Returns `Ok(None)` when the model answered with no content.
    async fn complete_once(&self, messages: &[ChatMessage]) -> Result<Option<String>, CompletionError> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            CompletionError::Fatal(anyhow::anyhow!("{} not set", self.config.api_key_env))
        })?;
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.config.model,
            "messages": messages,
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .header("HTTP-Referer", &self.config.referer)
            .header("X-Title", &self.config.title)
            .json(&body)
            .send()
            .await
            .map_err(|e| CompletionError::Retryable(anyhow::anyhow!("completion request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let err = anyhow::anyhow!("completion API error {}: {}", status, text);
            return Err(if status.as_u16() == 429 || status.is_server_error() {
                CompletionError::Retryable(err)
            } else {
                CompletionError::Fatal(err)
            });
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CompletionError::Retryable(anyhow::anyhow!("invalid completion body: {}", e)))?;
        Ok(json
            .pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string))
    }

    /// Complete with bounded retries; `Err` only after the last attempt.
    pub async fn complete(&self, messages: &[ChatMessage]) -> Result<Option<String>> {
        let mut last_err = None;
        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = self.config.backoff_base_ms << (attempt - 1).min(10);
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            match self.complete_once(messages).await {
                Ok(reply) => return Ok(reply),
                Err(CompletionError::Fatal(e)) => return Err(e),
                Err(CompletionError::Retryable(e)) => {
                    tracing::warn!(attempt, error = %e, "completion attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("completion failed")))
    }
}

pub struct ChatService {
    retriever: Arc<Retriever>,
    client: CompletionClient,
    config: ChatConfig,
    min_similarity: f32,
}

impl ChatService {
    pub fn new(retriever: Arc<Retriever>, client: CompletionClient, config: ChatConfig, min_similarity: f32) -> Self {
        Self {
            retriever,
            client,
            config,
            min_similarity,
        }
    }

    async fn context_for(&self, question: &str) -> (String, ContextStatus) {
        let timeout = Duration::from_secs(self.config.retrieval_timeout_secs);
        match tokio::time::timeout(timeout, self.retriever.retrieve(question)).await {
            Ok(Ok(results)) => {
                let context = format_context(&results, self.min_similarity, self.config.snippet_chars);
                if context.is_empty() {
                    (context, ContextStatus::NotFound)
                } else {
                    (context, ContextStatus::Found)
                }
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "retrieval failed; answering without context");
                (String::new(), ContextStatus::Unavailable)
            }
            Err(_) => {
                tracing::warn!(timeout_secs = self.config.retrieval_timeout_secs, "retrieval timed out");
                (String::new(), ContextStatus::Unavailable)
            }
        }
    }

    pub async fn answer(&self, messages: &[ChatMessage]) -> Result<ChatResponse, ChatError> {
        let question = match messages.last() {
            Some(last) if last.role == Role::User && !last.content.trim().is_empty() => &last.content,
            _ => return Err(ChatError::InvalidRequest),
        };

        let (context, status) = self.context_for(question).await;

        let mut prompt = Vec::with_capacity(messages.len() + 1);
        prompt.push(system_message(&self.config, &context));
        prompt.extend(messages.iter().filter(|m| m.role != Role::System).cloned());

        let reply = match self.client.complete(&prompt).await {
            Ok(Some(reply)) => reply,
            Ok(None) => self.config.empty_reply.clone(),
            Err(e) => {
                tracing::error!(error = %e, "completion failed; returning fallback reply");
                self.config.fallback_reply.clone()
            }
        };

        Ok(ChatResponse { reply, context: status })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use severus_core::models::{Document, DocumentMetadata};

    fn hit(title: &str, content: &str, similarity: f32) -> SearchResult {
        SearchResult {
            document: Document {
                id: title.to_string(),
                content: content.to_string(),
                metadata: DocumentMetadata {
                    title: title.to_string(),
                    source: "s".to_string(),
                    category: "c".to_string(),
                    date: None,
                },
                embedding: None,
                hash: None,
            },
            similarity,
        }
    }

    #[test]
    fn test_format_context_snippets_and_threshold() {
        let results = vec![
            hit("Guia", &"x".repeat(600), 0.9),
            hit("Nota", "curta", 0.7),
            hit("Limite", "igual", 0.65),
        ];
        let context = format_context(&results, 0.65, 500);
        let blocks: Vec<&str> = context.split("\n\n---\n\n").collect();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0], format!("[Fonte: Guia]\n{}...", "x".repeat(500)));
        assert_eq!(blocks[1], "[Fonte: Nota]\ncurta...");
    }

    #[test]
    fn test_system_message_budget() {
        let config = ChatConfig::default();
        let msg = system_message(&config, &"y".repeat(4000));
        assert_eq!(msg.role, Role::System);
        assert!(msg.content.contains("português europeu"));
        assert!(msg.content.contains("Não possuo dados suficientes sobre isso"));
        let context = msg.content.split("CONTEXTO:\n").nth(1).unwrap();
        assert_eq!(context.chars().count(), 1500);

        let bare = system_message(&config, "");
        assert!(!bare.content.contains("CONTEXTO"));
    }

    #[test]
    fn test_context_status_serialization() {
        assert_eq!(
            serde_json::to_value(ContextStatus::Found).unwrap(),
            serde_json::json!("Contexto encontrado")
        );
        assert_eq!(
            serde_json::to_value(ContextStatus::NotFound).unwrap(),
            serde_json::json!("Sem contexto relevante")
        );
    }
}
