//! OpenAI-compatible HTTP provider with transparent retry.
//!
//! Talks to any `{api_base}/chat/completions` endpoint. Transient upstream
//! failures (transport errors, 5xx, 429, the OpenRouter 401 "user not found"
//! quirk, and semantically empty 200s) are absorbed by exponential backoff
//! with jitter; `Retry-After` hints are honored without jitter. All waits and
//! the request itself race against the caller's cancellation token.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, YoctoError};
use crate::session::{Message, Role};
use crate::utils::truncate;

use super::{ChatOptions, LLMProvider, LLMResponse, LLMToolCall, ToolDefinition, Usage};

const DEFAULT_MAX_RETRIES: u32 = 5; // up to 5 retries (6 attempts total)
const DEFAULT_RETRY_BASE_WAIT: Duration = Duration::from_secs(1);
const DEFAULT_RETRY_MAX_WAIT: Duration = Duration::from_secs(60);
const DEFAULT_RETRY_JITTER: f64 = 0.2; // +/-20% for non-Retry-After waits
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(120);

/// Source of jitter factors in `[0, 1)`. Injectable for deterministic tests.
type JitterFn = Box<dyn Fn() -> f64 + Send + Sync>;

/// Resilient HTTP provider for OpenAI-compatible chat completion APIs.
pub struct HttpProvider {
    api_key: String,
    api_base: String,
    client: Client,
    max_retries: u32,
    retry_base_wait: Duration,
    retry_max_wait: Duration,
    retry_jitter: f64,
    jitter_fn: JitterFn,
    routing: Option<Value>,
    /// Model-name substrings that take `max_completion_tokens`.
    completion_token_models: Vec<String>,
    default_model: String,
}

impl std::fmt::Debug for HttpProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpProvider")
            .field("api_base", &self.api_base)
            .field("max_retries", &self.max_retries)
            .field("retry_base_wait", &self.retry_base_wait)
            .field("retry_max_wait", &self.retry_max_wait)
            .field("retry_jitter", &self.retry_jitter)
            .field("routing", &self.routing)
            .field("completion_token_models", &self.completion_token_models)
            .field("default_model", &self.default_model)
            .finish()
    }
}

impl HttpProvider {
    /// Create a provider for the given endpoint. A trailing slash on
    /// `api_base` is removed; an empty `api_key` sends no Authorization
    /// header.
    pub fn new(api_key: &str, api_base: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            api_base: api_base.trim_end_matches('/').to_string(),
            client: Client::builder()
                .timeout(DEFAULT_HTTP_TIMEOUT)
                .build()
                .unwrap_or_else(|_| Client::new()),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_wait: DEFAULT_RETRY_BASE_WAIT,
            retry_max_wait: DEFAULT_RETRY_MAX_WAIT,
            retry_jitter: DEFAULT_RETRY_JITTER,
            jitter_fn: Box::new(system_time_jitter),
            routing: None,
            completion_token_models: vec!["glm".to_string(), "o1".to_string()],
            default_model: String::new(),
        }
    }

    /// Set provider routing preferences (OpenRouter-style), sent verbatim as
    /// the `provider` object in the request body.
    pub fn with_routing(mut self, routing: Value) -> Self {
        self.routing = Some(routing);
        self
    }

    /// Set the maximum number of retries (attempts = retries + 1).
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the base wait before the first retry.
    pub fn with_retry_base_wait(mut self, wait: Duration) -> Self {
        self.retry_base_wait = wait;
        self
    }

    /// Set the cap on any single backoff wait.
    pub fn with_retry_max_wait(mut self, wait: Duration) -> Self {
        self.retry_max_wait = wait;
        self
    }

    /// Set the jitter fraction applied to computed waits (0 disables jitter).
    pub fn with_retry_jitter(mut self, jitter: f64) -> Self {
        self.retry_jitter = jitter;
        self
    }

    /// Replace the jitter source. Tests use this for determinism.
    pub fn with_jitter_fn(mut self, f: impl Fn() -> f64 + Send + Sync + 'static) -> Self {
        self.jitter_fn = Box::new(f);
        self
    }

    /// Set the model-name substrings that require `max_completion_tokens`.
    pub fn with_completion_token_models(mut self, models: Vec<String>) -> Self {
        self.completion_token_models = models;
        self
    }

    /// Set the model reported by `default_model()`.
    pub fn with_default_model(mut self, model: &str) -> Self {
        self.default_model = model.to_string();
        self
    }

    fn build_request_body(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        model: &str,
        options: &ChatOptions,
    ) -> Value {
        let wire_messages: Vec<WireMessage> = messages.iter().map(WireMessage::from).collect();

        let mut body = serde_json::json!({
            "model": model,
            "messages": wire_messages,
        });

        if !tools.is_empty() {
            let wire_tools: Vec<Value> = tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = Value::Array(wire_tools);
            body["tool_choice"] = Value::String("auto".to_string());
        }

        if let Some(max_tokens) = options.max_tokens {
            let lower = model.to_lowercase();
            let wants_completion_field = self
                .completion_token_models
                .iter()
                .any(|m| !m.is_empty() && lower.contains(&m.to_lowercase()));
            if wants_completion_field {
                body["max_completion_tokens"] = max_tokens.into();
            } else {
                body["max_tokens"] = max_tokens.into();
            }
        }

        if let Some(temperature) = options.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }

        if let Some(routing) = &self.routing {
            body["provider"] = routing.clone();
        }

        body
    }

    /// Compute the wait before retry `attempt` (1-based). A Retry-After hint
    /// suppresses jitter and wins when larger, clamped to the max wait.
    fn compute_retry_wait(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let exp = 1u64 << (attempt.saturating_sub(1)).min(16);
        let mut wait = self
            .retry_base_wait
            .checked_mul(exp as u32)
            .unwrap_or(self.retry_max_wait)
            .min(self.retry_max_wait);

        if retry_after.is_none() && self.retry_jitter > 0.0 {
            let factor = 1.0 + ((self.jitter_fn)() * 2.0 - 1.0) * self.retry_jitter;
            let factor = factor.max(0.0);
            wait = Duration::from_secs_f64(wait.as_secs_f64() * factor);
            if wait < Duration::from_millis(1) {
                wait = Duration::from_millis(1);
            }
            if wait > self.retry_max_wait {
                wait = self.retry_max_wait;
            }
        }

        if let Some(hint) = retry_after {
            let hint = hint.min(self.retry_max_wait);
            if hint > wait {
                wait = hint;
            }
        }

        wait
    }
}

#[async_trait]
impl LLMProvider for HttpProvider {
    async fn chat(
        &self,
        cancel: CancellationToken,
        messages: Vec<Message>,
        tools: Vec<ToolDefinition>,
        model: &str,
        options: ChatOptions,
    ) -> Result<LLMResponse> {
        if self.api_base.is_empty() {
            return Err(YoctoError::Config("API base not configured".into()));
        }

        let body = self.build_request_body(&messages, &tools, model, &options);
        let url = format!("{}/chat/completions", self.api_base);

        let mut last_err: Option<YoctoError> = None;
        let mut retry_after_hint: Option<Duration> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let wait = self.compute_retry_wait(attempt, retry_after_hint.take());
                warn!(
                    attempt = attempt + 1,
                    attempts = self.max_retries + 1,
                    wait_ms = wait.as_millis() as u64,
                    last_error = %last_err.as_ref().map(|e| e.to_string()).unwrap_or_default(),
                    "retrying LLM request"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return Err(YoctoError::Cancelled("context cancelled during retry wait".into()));
                    }
                    _ = tokio::time::sleep(wait) => {}
                }
            }

            let mut request = self
                .client
                .post(&url)
                .header("Content-Type", "application/json")
                .json(&body);
            if !self.api_key.is_empty() {
                request = request.bearer_auth(&self.api_key);
            }

            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(YoctoError::Cancelled("context cancelled during request".into()));
                }
                r = request.send() => r,
            };

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    if cancel.is_cancelled() {
                        return Err(YoctoError::Cancelled(format!(
                            "failed to send request: {}",
                            e
                        )));
                    }
                    last_err = Some(YoctoError::Provider(format!("failed to send request: {}", e)));
                    continue;
                }
            };

            let status = response.status();
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);

            let raw_body = match response.text().await {
                Ok(b) => b,
                Err(e) => {
                    last_err = Some(YoctoError::Provider(format!("failed to read response: {}", e)));
                    continue;
                }
            };
            // Some upstreams pad responses with newlines.
            let raw_body = raw_body.trim();

            if !status.is_success() {
                let err = YoctoError::Provider(format!(
                    "API error (HTTP {}): {}",
                    status.as_u16(),
                    truncate(raw_body, 500)
                ));
                if is_retryable_http_error(status.as_u16(), raw_body) {
                    last_err = Some(err);
                    retry_after_hint = retry_after;
                    continue;
                }
                return Err(err);
            }

            debug!(
                status = status.as_u16(),
                body_bytes = raw_body.len(),
                body = %truncate(raw_body, 2000),
                "raw LLM response"
            );

            let llm_resp = match parse_response(raw_body) {
                Ok(r) => r,
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            };

            if should_retry_response(&llm_resp) {
                last_err = Some(YoctoError::Provider(format!(
                    "empty or error response from LLM (finish_reason={})",
                    llm_resp.finish_reason
                )));
                continue;
            }

            return Ok(llm_resp);
        }

        Err(YoctoError::Provider(format!(
            "LLM request failed after {} attempts: {}",
            self.max_retries + 1,
            last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string())
        )))
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }
}

/// Jitter factor derived from the nanosecond component of the current time.
/// Decorrelates concurrent retries without pulling in `rand`.
fn system_time_jitter() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| (d.subsec_nanos() % 1_000_000) as f64 / 1_000_000.0)
        .unwrap_or(0.5)
}

/// Whether a non-OK HTTP status warrants a retry.
///
/// 429 and 5xx are always retryable. A 401 whose body mentions "user not
/// found" is retried too: OpenRouter transiently returns that even for valid
/// credentials.
fn is_retryable_http_error(status: u16, body: &str) -> bool {
    if status == 429 || status >= 500 {
        return true;
    }

    if status == 401 {
        #[derive(serde::Deserialize)]
        struct ErrorPayload {
            error: ErrorBody,
        }
        #[derive(serde::Deserialize)]
        struct ErrorBody {
            #[serde(default)]
            message: String,
        }
        if let Ok(payload) = serde_json::from_str::<ErrorPayload>(body) {
            if payload.error.message.to_lowercase().contains("user not found") {
                return true;
            }
        }
        // Fallback for non-standard payload shapes.
        if body.to_lowercase().contains("user not found") {
            return true;
        }
    }

    false
}

/// Parse a `Retry-After` header value: delta-seconds or HTTP-date.
fn parse_retry_after(header: &str) -> Option<Duration> {
    let header = header.trim();
    if header.is_empty() {
        return None;
    }

    if let Ok(secs) = header.parse::<i64>() {
        if secs <= 0 {
            return Some(Duration::ZERO);
        }
        return Some(Duration::from_secs(secs as u64));
    }

    if let Ok(when) = httpdate::parse_http_date(header) {
        return Some(
            when.duration_since(SystemTime::now())
                .unwrap_or(Duration::ZERO),
        );
    }

    None
}

/// Whether an HTTP-200 response is semantically empty and worth retrying.
fn should_retry_response(resp: &LLMResponse) -> bool {
    // Some providers return finish_reason="error" even with partial content.
    if resp.finish_reason.eq_ignore_ascii_case("error") {
        return true;
    }
    resp.content.is_empty() && resp.tool_calls.is_empty()
}

fn parse_response(body: &str) -> Result<LLMResponse> {
    #[derive(serde::Deserialize)]
    struct ApiResponse {
        #[serde(default)]
        choices: Vec<Choice>,
        #[serde(default)]
        usage: Option<WireUsage>,
    }
    #[derive(serde::Deserialize)]
    struct Choice {
        message: ChoiceMessage,
        #[serde(default)]
        finish_reason: Option<String>,
    }
    #[derive(serde::Deserialize)]
    struct ChoiceMessage {
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        tool_calls: Option<Vec<WireToolCall>>,
    }
    #[derive(serde::Deserialize)]
    struct WireToolCall {
        #[serde(default)]
        id: String,
        #[serde(default)]
        function: Option<WireFunction>,
    }
    #[derive(serde::Deserialize)]
    struct WireFunction {
        #[serde(default)]
        name: String,
        #[serde(default)]
        arguments: String,
    }
    #[derive(serde::Deserialize)]
    struct WireUsage {
        #[serde(default)]
        prompt_tokens: u32,
        #[serde(default)]
        completion_tokens: u32,
        #[serde(default)]
        total_tokens: u32,
    }

    let api: ApiResponse = serde_json::from_str(body)
        .map_err(|e| YoctoError::Provider(format!("failed to unmarshal response: {}", e)))?;

    let usage = api.usage.map(|u| Usage {
        prompt_tokens: u.prompt_tokens,
        completion_tokens: u.completion_tokens,
        total_tokens: if u.total_tokens > 0 {
            u.total_tokens
        } else {
            u.prompt_tokens + u.completion_tokens
        },
    });

    let Some(choice) = api.choices.into_iter().next() else {
        warn!(body_preview = %truncate(body, 500), "LLM returned 0 choices");
        // The retry decision is made later on semantic emptiness.
        return Ok(LLMResponse {
            content: String::new(),
            tool_calls: vec![],
            finish_reason: "stop".to_string(),
            usage,
        });
    };

    let content = choice.message.content.unwrap_or_default();
    let finish_reason = choice.finish_reason.unwrap_or_default();

    let mut tool_calls = Vec::new();
    for tc in choice.message.tool_calls.unwrap_or_default() {
        // OpenAI shape carries type=="function"; legacy upstreams omit the
        // type field but still nest a function object. Either way the
        // function object is authoritative.
        let Some(function) = tc.function else {
            continue;
        };
        tool_calls.push(LLMToolCall::new(&tc.id, &function.name, &function.arguments));
    }

    if content.is_empty() && tool_calls.is_empty() {
        warn!(
            finish_reason = %finish_reason,
            body_preview = %truncate(body, 500),
            "LLM returned empty content with no tool calls"
        );
    }

    Ok(LLMResponse {
        content,
        tool_calls,
        finish_reason,
        usage,
    })
}

/// Wire form of a message for the chat/completions request body.
#[derive(Serialize)]
struct WireMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl From<&Message> for WireMessage {
    fn from(msg: &Message) -> Self {
        let role = match msg.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };

        let tool_calls = msg.tool_calls.as_ref().map(|tcs| {
            tcs.iter()
                .map(|tc| {
                    serde_json::json!({
                        "id": tc.id,
                        "type": "function",
                        "function": {
                            "name": tc.name,
                            "arguments": tc.arguments,
                        }
                    })
                })
                .collect()
        });

        WireMessage {
            role,
            content: if msg.content.is_empty() && tool_calls.is_some() {
                None
            } else {
                Some(msg.content.clone())
            },
            tool_calls,
            tool_call_id: msg.tool_call_id.clone(),
        }
    }
}
