//! Reasoning service boundary.
//!
//! Every phase talks to the external completion API through the
//! [`ReasoningService`] trait. Production code uses [`HttpReasoningClient`]
//! wrapped in [`TimeoutReasoning`]; tests use [`ScriptedReasoning`].

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::errors::ReasoningError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvokeOptions {
    pub format: ResponseFormat,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for InvokeOptions {
    fn default() -> Self {
        Self {
            format: ResponseFormat::Text,
            max_tokens: 4096,
            temperature: 0.3,
        }
    }
}

impl InvokeOptions {
    pub fn json(max_tokens: u32, temperature: f32) -> Self {
        Self {
            format: ResponseFormat::Json,
            max_tokens,
            temperature,
        }
    }
}

/// One request to the reasoning service. `task` names the call site so logs
/// and test doubles can tell requests apart.
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub task: String,
    pub system: String,
    pub user: String,
}

impl Prompt {
    pub fn new(task: impl Into<String>, system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            system: system.into(),
            user: user.into(),
        }
    }
}

/// Abstraction over the completion API, for testability.
#[async_trait]
pub trait ReasoningService: Send + Sync {
    async fn invoke(&self, prompt: &Prompt, options: &InvokeOptions) -> Result<String, ReasoningError>;
}

// ── HTTP client ───────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint.
pub struct HttpReasoningClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl HttpReasoningClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key,
        }
    }
}

#[async_trait]
impl ReasoningService for HttpReasoningClient {
    async fn invoke(&self, prompt: &Prompt, options: &InvokeOptions) -> Result<String, ReasoningError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &prompt.system,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt.user,
                },
            ],
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            response_format: match options.format {
                ResponseFormat::Json => Some(json!({ "type": "json_object" })),
                ResponseFormat::Text => None,
            },
        };

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Content-Type", "application/json")
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        debug!(task = %prompt.task, model = %self.model, "invoking reasoning service");
        let response = builder
            .send()
            .await
            .map_err(|e| ReasoningError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ReasoningError::Transport(format!("invalid response body: {}", e)))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|text| !text.trim().is_empty())
            .ok_or(ReasoningError::Empty)
    }
}

/// Map a non-success HTTP status onto the error taxonomy.
pub fn classify_status(status: u16, body: String) -> ReasoningError {
    match status {
        429 => ReasoningError::RateLimited,
        401 | 403 => ReasoningError::Unauthorized(body),
        _ => ReasoningError::Http { status, body },
    }
}

// ── Timeout wrapper ───────────────────────────────────────────────────

/// Applies a fixed ceiling to every call of the wrapped service.
pub struct TimeoutReasoning<S> {
    inner: S,
    timeout: Duration,
}

impl<S: ReasoningService> TimeoutReasoning<S> {
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl<S: ReasoningService> ReasoningService for TimeoutReasoning<S> {
    async fn invoke(&self, prompt: &Prompt, options: &InvokeOptions) -> Result<String, ReasoningError> {
        match tokio::time::timeout(self.timeout, self.inner.invoke(prompt, options)).await {
            Ok(result) => result,
            Err(_) => Err(ReasoningError::Timeout {
                secs: self.timeout.as_secs(),
            }),
        }
    }
}

// ── Scripted double ───────────────────────────────────────────────────

/// Scripted reasoning service for tests and offline runs.
///
/// Responses are queued per task tag and consumed in order; a task may also
/// have a sticky response used whenever its queue is empty. Every prompt is
/// recorded. A task with nothing scripted fails with a non-retryable error.
#[derive(Default)]
pub struct ScriptedReasoning {
    queues: Mutex<HashMap<String, VecDeque<Result<String, ReasoningError>>>>,
    sticky: Mutex<HashMap<String, String>>,
    received: Mutex<Vec<Prompt>>,
}

impl ScriptedReasoning {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a one-shot response for `task`.
    pub fn respond(&self, task: &str, text: impl Into<String>) -> &Self {
        self.push(task, Ok(text.into()));
        self
    }

    /// Queue a one-shot error for `task`.
    pub fn fail(&self, task: &str, error: ReasoningError) -> &Self {
        self.push(task, Err(error));
        self
    }

    /// Response returned for `task` whenever its queue is empty.
    pub fn respond_always(&self, task: &str, text: impl Into<String>) -> &Self {
        if let Ok(mut sticky) = self.sticky.lock() {
            sticky.insert(task.to_string(), text.into());
        }
        self
    }

    fn push(&self, task: &str, entry: Result<String, ReasoningError>) {
        if let Ok(mut queues) = self.queues.lock() {
            queues.entry(task.to_string()).or_default().push_back(entry);
        }
    }

    pub fn prompts(&self) -> Vec<Prompt> {
        self.received.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn calls(&self, task: &str) -> usize {
        self.received
            .lock()
            .map(|p| p.iter().filter(|prompt| prompt.task == task).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl ReasoningService for ScriptedReasoning {
    async fn invoke(&self, prompt: &Prompt, _options: &InvokeOptions) -> Result<String, ReasoningError> {
        if let Ok(mut received) = self.received.lock() {
            received.push(prompt.clone());
        }
        let queued = self
            .queues
            .lock()
            .ok()
            .and_then(|mut queues| queues.get_mut(&prompt.task).and_then(|q| q.pop_front()));
        if let Some(entry) = queued {
            return entry;
        }
        let sticky = self
            .sticky
            .lock()
            .ok()
            .and_then(|sticky| sticky.get(&prompt.task).cloned());
        sticky.ok_or_else(|| ReasoningError::Http {
            status: 404,
            body: format!("no scripted response for task '{}'", prompt.task),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Slow;

    #[async_trait]
    impl ReasoningService for Slow {
        async fn invoke(&self, _: &Prompt, _: &InvokeOptions) -> Result<String, ReasoningError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("late".into())
        }
    }

    #[tokio::test]
    async fn test_timeout_maps_to_transient_error() {
        let service = TimeoutReasoning::new(Slow, Duration::from_millis(20));
        let err = service
            .invoke(&Prompt::new("t", "s", "u"), &InvokeOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ReasoningError::Timeout { .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_scripted_queue_then_sticky() {
        let service = ScriptedReasoning::new();
        service
            .respond("a", "first")
            .fail("a", ReasoningError::RateLimited)
            .respond_always("a", "always");
        let prompt = Prompt::new("a", "sys", "user");
        let opts = InvokeOptions::default();

        assert_eq!(service.invoke(&prompt, &opts).await.unwrap(), "first");
        assert!(matches!(
            service.invoke(&prompt, &opts).await,
            Err(ReasoningError::RateLimited)
        ));
        assert_eq!(service.invoke(&prompt, &opts).await.unwrap(), "always");
        assert_eq!(service.invoke(&prompt, &opts).await.unwrap(), "always");
        assert_eq!(service.calls("a"), 4);
    }

    #[tokio::test]
    async fn test_scripted_unknown_task_is_fatal() {
        let service = ScriptedReasoning::new();
        let err = service
            .invoke(&Prompt::new("missing", "", ""), &InvokeOptions::default())
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(service.prompts().len(), 1);
    }

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status(429, String::new()),
            ReasoningError::RateLimited
        ));
        assert!(matches!(
            classify_status(403, "denied".into()),
            ReasoningError::Unauthorized(_)
        ));
        assert!(classify_status(502, String::new()).is_transient());
        assert!(!classify_status(400, String::new()).is_transient());
    }

    #[test]
    fn test_chat_request_json_format() {
        let request = ChatRequest {
            model: "m",
            messages: vec![ChatMessage {
                role: "user",
                content: "hi",
            }],
            max_tokens: 10,
            temperature: 0.0,
            response_format: Some(json!({ "type": "json_object" })),
        };
        let encoded = serde_json::to_value(&request).unwrap();
        assert_eq!(encoded["response_format"]["type"], "json_object");
        assert_eq!(encoded["messages"][0]["role"], "user");
    }
}
