//! LLM gateway
//!
//! A single capability: `chat`. The HTTP implementation speaks the
//! Anthropic messages endpoint; everything provider-specific stays in
//! this module. Transport failures, 429s and timeouts are retried here
//! with exponential backoff so callers only ever see exhausted errors.

use crate::error::{EngineError, Result};
use crate::runlog::{LlmCallRecord, RunLogger};
use crate::types::CancelToken;
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Hint that the reply must be a bare JSON document. Callers still
/// validate; the hint only tightens the instruction footer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFormat {
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Stage label for call accounting (e.g. "critic.novelty")
    pub stage: String,
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: usize,
    pub response_format: ResponseFormat,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
}

#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub text: String,
    pub usage: TokenUsage,
    pub latency_ms: u64,
}

#[async_trait]
pub trait LlmGateway: Send + Sync {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatOutcome>;
}

/// Anthropic-style HTTP gateway with local retries.
#[derive(Debug)]
pub struct HttpLlmGateway {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    max_retries: usize,
    timeout_secs: u64,
    cancel: CancelToken,
    logger: Arc<RunLogger>,
}

impl HttpLlmGateway {
    pub fn new(
        api_url: String,
        api_key: String,
        max_retries: usize,
        timeout_secs: u64,
        cancel: CancelToken,
        logger: Arc<RunLogger>,
    ) -> Result<Self> {
        if api_key.is_empty() {
            return Err(EngineError::Config(
                "LLM_API_KEY not set; the gateway cannot authenticate".into(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| EngineError::Transport(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            api_url,
            api_key,
            max_retries,
            timeout_secs,
            cancel,
            logger,
        })
    }

    fn request_body(request: &ChatRequest) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|m| {
                serde_json::json!({
                    "role": match m.role {
                        ChatRole::User => "user",
                        ChatRole::Assistant => "assistant",
                    },
                    "content": m.content,
                })
            })
            .collect();

        let mut body = serde_json::json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": messages,
        });
        if let Some(system) = &request.system {
            body["system"] = serde_json::Value::String(system.clone());
        }
        body
    }

    async fn send_once(&self, request: &ChatRequest) -> Result<ChatOutcome> {
        let body = Self::request_body(request);
        let started = Instant::now();

        let response = self
            .client
            .post(&self.api_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EngineError::Timeout(self.timeout_secs)
                } else {
                    EngineError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(EngineError::RateLimited);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(EngineError::Transport(format!(
                "provider returned {}: {}",
                status, text
            )));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EngineError::Transport(format!("malformed provider response: {}", e)))?;

        let text = json["content"][0]["text"]
            .as_str()
            .ok_or_else(|| {
                EngineError::InvalidOutput("provider response carried no text block".into())
            })?
            .to_string();

        let usage = TokenUsage {
            input_tokens: json["usage"]["input_tokens"].as_u64().unwrap_or(0) as usize,
            output_tokens: json["usage"]["output_tokens"].as_u64().unwrap_or(0) as usize,
        };

        Ok(ChatOutcome {
            text,
            usage,
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }
}

#[async_trait]
impl LlmGateway for HttpLlmGateway {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatOutcome> {
        let prompt_chars: usize = request.messages.iter().map(|m| m.content.len()).sum();
        let mut attempt = 0;
        loop {
            self.cancel.check()?;
            attempt += 1;
            match self.send_once(request).await {
                Ok(outcome) => {
                    self.logger.llm_call(&LlmCallRecord {
                        stage: request.stage.clone(),
                        model: request.model.clone(),
                        prompt_chars,
                        output_chars: outcome.text.len(),
                        input_tokens: outcome.usage.input_tokens,
                        output_tokens: outcome.usage.output_tokens,
                        latency_ms: outcome.latency_ms,
                        attempt,
                        ok: true,
                        error: None,
                    });
                    return Ok(outcome);
                }
                Err(err) if err.is_retryable() && attempt <= self.max_retries => {
                    self.logger.llm_call(&LlmCallRecord {
                        stage: request.stage.clone(),
                        model: request.model.clone(),
                        prompt_chars,
                        output_chars: 0,
                        input_tokens: 0,
                        output_tokens: 0,
                        latency_ms: 0,
                        attempt,
                        ok: false,
                        error: Some(err.to_string()),
                    });
                    tokio::time::sleep(backoff_delay(attempt)).await;
                }
                Err(err) => {
                    self.logger.llm_call(&LlmCallRecord {
                        stage: request.stage.clone(),
                        model: request.model.clone(),
                        prompt_chars,
                        output_chars: 0,
                        input_tokens: 0,
                        output_tokens: 0,
                        latency_ms: 0,
                        attempt,
                        ok: false,
                        error: Some(err.to_string()),
                    });
                    return Err(err);
                }
            }
        }
    }
}

/// Exponential backoff with jitter: 1s, 2s, 4s... plus up to 250ms.
fn backoff_delay(attempt: usize) -> Duration {
    let base = 1u64 << (attempt.min(6) - 1);
    let jitter_ms = rand::thread_rng().gen_range(0..250);
    Duration::from_millis(base * 1000 + jitter_ms)
}

/// Strip a markdown code fence if the model wrapped its JSON in one.
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```json") {
        return rest.trim_end_matches("```").trim();
    }
    if let Some(rest) = trimmed.strip_prefix("```") {
        return rest.trim_end_matches("```").trim();
    }
    trimmed
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scripted gateway for tests: pops canned replies in order. A reply
    /// of `Err` simulates a gateway failure.
    pub(crate) struct ScriptedLlm {
        replies: Mutex<VecDeque<Result<String>>>,
        pub calls: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedLlm {
        pub(crate) fn new(replies: Vec<Result<String>>) -> Self {
            Self {
                replies: Mutex::new(replies.into_iter().collect()),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl LlmGateway for ScriptedLlm {
        async fn chat(&self, request: &ChatRequest) -> Result<ChatOutcome> {
            self.calls.lock().unwrap().push(request.clone());
            let next = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(EngineError::StepFailed("script exhausted".into())));
            next.map(|text| ChatOutcome {
                text,
                usage: TokenUsage::default(),
                latency_ms: 1,
            })
        }
    }

    #[test]
    fn test_request_body_shape() {
        let request = ChatRequest {
            stage: "story.initial".into(),
            system: Some("you write stories".into()),
            messages: vec![ChatMessage::user("hello")],
            model: "claude-3-5-sonnet-20241022".into(),
            temperature: 0.7,
            max_tokens: 512,
            response_format: ResponseFormat::Json,
        };
        let body = HttpLlmGateway::request_body(&request);
        assert_eq!(body["model"], "claude-3-5-sonnet-20241022");
        assert_eq!(body["max_tokens"], 512);
        assert_eq!(body["system"], "you write stories");
        assert_eq!(body["messages"][0]["role"], "user");
    }

    #[test]
    fn test_missing_api_key_is_config_error() {
        let err = HttpLlmGateway::new(
            "https://example.invalid/v1/messages".into(),
            String::new(),
            3,
            30,
            CancelToken::new(),
            Arc::new(RunLogger::disabled()),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_strip_code_fence() {
        assert_eq!(strip_code_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("```\n{}\n```"), "{}");
        assert_eq!(strip_code_fence("  {\"a\":1} "), "{\"a\":1}");
    }

    #[tokio::test]
    async fn test_scripted_gateway_pops_in_order() {
        let gateway = ScriptedLlm::new(vec![Ok("one".into()), Ok("two".into())]);
        let request = ChatRequest {
            stage: "t".into(),
            system: None,
            messages: vec![ChatMessage::user("x")],
            model: "m".into(),
            temperature: 0.0,
            max_tokens: 10,
            response_format: ResponseFormat::Text,
        };
        assert_eq!(gateway.chat(&request).await.unwrap().text, "one");
        assert_eq!(gateway.chat(&request).await.unwrap().text, "two");
        assert_eq!(gateway.call_count(), 2);
    }
}
