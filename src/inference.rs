//! Text-generation service abstraction.
//!
//! The enrichment client talks to an [`InferenceService`]; adapters here
//! cover the two wire protocols seen in practice:
//!
//! | Provider | Endpoint | Request shape |
//! |----------|----------|---------------|
//! | `ollama` | `/api/generate` or `/api/chat` | prompt, or chat messages |
//! | `openai` | `/v1/chat/completions` (any compatible server) | chat messages |
//!
//! [`ScriptedService`] replays a fixed script and is used by tests and
//! offline dry runs.
//!
//! Adapters perform exactly one HTTP call per `generate`; retries and
//! timeouts are applied by the caller through [`retry`](crate::retry::retry).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::EnrichmentConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

/// One generation request. Exactly one of `prompt` or `messages` is
/// normally set; adapters that only speak chat wrap a bare prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub model: String,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
}

impl InferenceRequest {
    /// All message content plus the prompt, for doubles that match on text.
    pub fn full_text(&self) -> String {
        let mut parts: Vec<&str> = self.messages.iter().map(|m| m.content.as_str()).collect();
        if let Some(p) = &self.prompt {
            parts.push(p);
        }
        parts.join("\n")
    }

    fn as_chat(&self) -> Vec<ChatMessage> {
        let mut messages = self.messages.clone();
        if let Some(p) = &self.prompt {
            messages.push(ChatMessage::user(p.clone()));
        }
        messages
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub text: String,
}

#[async_trait]
pub trait InferenceService: Send + Sync {
    /// Provider/model label for logs.
    fn name(&self) -> &str;
    async fn generate(&self, request: &InferenceRequest) -> Result<InferenceResponse>;
}

/// Build the configured service, or `None` when enrichment is disabled.
pub fn create_service(config: &EnrichmentConfig) -> Result<Option<Arc<dyn InferenceService>>> {
    let timeout = Duration::from_secs(config.timeout_secs);
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "ollama" => Ok(Some(Arc::new(OllamaService::new(
            config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            timeout,
        )?))),
        "openai" => {
            let api_key = std::env::var("OPENAI_API_KEY").ok();
            Ok(Some(Arc::new(OpenAiChatService::new(
                config
                    .url
                    .clone()
                    .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
                api_key,
                timeout,
            )?)))
        }
        other => Err(Error::Config(format!(
            "Unknown enrichment provider: {}",
            other
        ))),
    }
}

fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Config(format!("cannot build HTTP client: {}", e)))
}

// ============ Ollama ============

pub struct OllamaService {
    base_url: String,
    client: reqwest::Client,
}

impl OllamaService {
    pub fn new(base_url: String, timeout: Duration) -> Result<Self> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: http_client(timeout)?,
        })
    }
}

#[async_trait]
impl InferenceService for OllamaService {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn generate(&self, request: &InferenceRequest) -> Result<InferenceResponse> {
        let options = serde_json::json!({ "temperature": request.temperature });
        let (url, body) = if request.messages.is_empty() {
            (
                format!("{}/api/generate", self.base_url),
                serde_json::json!({
                    "model": request.model,
                    "prompt": request.prompt.clone().unwrap_or_default(),
                    "stream": false,
                    "options": options,
                }),
            )
        } else {
            (
                format!("{}/api/chat", self.base_url),
                serde_json::json!({
                    "model": request.model,
                    "messages": request.as_chat(),
                    "stream": false,
                    "options": options,
                }),
            )
        };

        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let json: serde_json::Value = response.json().await?;
        parse_ollama(&json)
    }
}

fn parse_ollama(json: &serde_json::Value) -> Result<InferenceResponse> {
    let text = json
        .get("response")
        .and_then(|v| v.as_str())
        .or_else(|| {
            json.get("message")
                .and_then(|m| m.get("content"))
                .and_then(|v| v.as_str())
        })
        .ok_or_else(|| Error::MalformedResponse("Ollama response has no text".into()))?;
    Ok(InferenceResponse {
        text: text.to_string(),
    })
}

// ============ OpenAI-compatible ============

pub struct OpenAiChatService {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl OpenAiChatService {
    pub fn new(base_url: String, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client: http_client(timeout)?,
        })
    }
}

#[async_trait]
impl InferenceService for OpenAiChatService {
    fn name(&self) -> &str {
        "openai"
    }

    async fn generate(&self, request: &InferenceRequest) -> Result<InferenceResponse> {
        let body = serde_json::json!({
            "model": request.model,
            "messages": request.as_chat(),
            "temperature": request.temperature,
        });
        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }
        let response = builder.send().await?.error_for_status()?;
        let json: serde_json::Value = response.json().await?;
        parse_openai_chat(&json)
    }
}

fn parse_openai_chat(json: &serde_json::Value) -> Result<InferenceResponse> {
    let text = json
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::MalformedResponse("chat completion has no choices".into()))?;
    Ok(InferenceResponse {
        text: text.to_string(),
    })
}

// ============ Scripted double ============

/// One scripted reaction to a request.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Reply(String),
    /// Fails with a retryable error.
    Transient,
    /// Fails with a non-retryable error.
    Reject,
    /// Sleeps past any reasonable timeout.
    Hang(Duration),
}

type Responder = dyn Fn(&InferenceRequest, usize) -> ScriptStep + Send + Sync;

/// An [`InferenceService`] whose answers come from a script.
pub struct ScriptedService {
    responder: Box<Responder>,
    calls: AtomicUsize,
    requests: Mutex<Vec<InferenceRequest>>,
}

impl ScriptedService {
    /// Replay `steps` in order, then keep repeating the last one.
    pub fn sequence(steps: Vec<ScriptStep>) -> Self {
        Self::from_fn(move |_, call| {
            steps
                .get(call)
                .or_else(|| steps.last())
                .cloned()
                .unwrap_or(ScriptStep::Transient)
        })
    }

    /// Always answer with `text`.
    pub fn always(text: impl Into<String>) -> Self {
        let text = text.into();
        Self::from_fn(move |_, _| ScriptStep::Reply(text.clone()))
    }

    /// Decide per request; `call` is the 0-based call number.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&InferenceRequest, usize) -> ScriptStep + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(f),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<InferenceRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl InferenceService for ScriptedService {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, request: &InferenceRequest) -> Result<InferenceResponse> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut log) = self.requests.lock() {
            log.push(request.clone());
        }
        match (self.responder)(request, call) {
            ScriptStep::Reply(text) => Ok(InferenceResponse { text }),
            ScriptStep::Transient => Err(Error::Transient("scripted 503".into())),
            ScriptStep::Reject => Err(Error::Rejected("scripted 400".into())),
            ScriptStep::Hang(d) => {
                tokio::time::sleep(d).await;
                Err(Error::Transient("scripted hang ended".into()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> InferenceRequest {
        InferenceRequest {
            model: "m".into(),
            prompt: Some("hello".into()),
            messages: vec![ChatMessage::system("be terse")],
            temperature: 0.0,
        }
    }

    #[test]
    fn test_parse_ollama_generate_and_chat() {
        let gen = serde_json::json!({"response": "{\"tags\": []}", "done": true});
        assert_eq!(parse_ollama(&gen).unwrap().text, "{\"tags\": []}");
        let chat = serde_json::json!({"message": {"role": "assistant", "content": "ok"}});
        assert_eq!(parse_ollama(&chat).unwrap().text, "ok");
        assert!(parse_ollama(&serde_json::json!({})).is_err());
    }

    #[test]
    fn test_parse_openai_chat() {
        let json = serde_json::json!({
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "hi"}}]
        });
        assert_eq!(parse_openai_chat(&json).unwrap().text, "hi");
        let err = parse_openai_chat(&serde_json::json!({"choices": []})).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::MalformedResponse);
    }

    #[test]
    fn test_prompt_wrapped_as_chat() {
        let chat = request().as_chat();
        assert_eq!(chat.len(), 2);
        assert_eq!(chat[1].role, "user");
        assert_eq!(chat[1].content, "hello");
        assert!(request().full_text().contains("be terse"));
    }

    #[tokio::test]
    async fn test_scripted_sequence_repeats_last() {
        let svc = ScriptedService::sequence(vec![
            ScriptStep::Transient,
            ScriptStep::Reply("done".into()),
        ]);
        assert!(svc.generate(&request()).await.unwrap_err().is_transient());
        assert_eq!(svc.generate(&request()).await.unwrap().text, "done");
        assert_eq!(svc.generate(&request()).await.unwrap().text, "done");
        assert_eq!(svc.calls(), 3);
        assert_eq!(svc.requests().len(), 3);
    }

    #[test]
    fn test_disabled_provider_yields_none() {
        let config = EnrichmentConfig::default();
        assert!(create_service(&config).unwrap().is_none());
    }
}
