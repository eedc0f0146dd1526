// Aviary Engine — AI Provider Clients
// Direct HTTP calls to OpenAI-compatible chat APIs, plus a scripted
// provider for tests and offline dry runs. Providers are a closed enum —
// dispatch is a match, not a runtime registry.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{
    ChatRequest, ChatResponse, FunctionCall, ProviderConfig, ProviderKind, TokenUsage, ToolCall,
};
use log::{info, warn};
use parking_lot::Mutex;
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::time::Duration;

/// Retry configuration for transient API errors.
const MAX_RETRIES: u32 = 3;
const INITIAL_RETRY_DELAY_MS: u64 = 1000;

/// Check if an HTTP status code should be retried.
fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 529)
}

/// Sleep with exponential backoff.
async fn retry_delay(attempt: u32) {
    let delay = Duration::from_millis(INITIAL_RETRY_DELAY_MS * 2u64.pow(attempt));
    tokio::time::sleep(delay).await;
}

// ── OpenAI-compatible provider ─────────────────────────────────────────────
// Works for: OpenAI, OpenRouter, Ollama, DeepSeek — any compatible API.

/// Per-provider-id call pacing: requests are spaced at least
/// `min_interval` apart. A cooperative sleep, never an error — only the
/// room queue surfaces Busy to connectors.
struct CallPacer {
    min_interval: Duration,
    last_call: Mutex<Option<std::time::Instant>>,
}

impl CallPacer {
    fn from_rpm(requests_per_minute: u32) -> Self {
        CallPacer {
            min_interval: Duration::from_millis(60_000 / requests_per_minute.max(1) as u64),
            last_call: Mutex::new(None),
        }
    }

    async fn pace(&self) {
        let wait = {
            let mut last = self.last_call.lock();
            let now = std::time::Instant::now();
            let wait = match *last {
                Some(prev) => self.min_interval.saturating_sub(now.duration_since(prev)),
                None => Duration::ZERO,
            };
            *last = Some(now + wait);
            wait
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

pub struct OpenAiProvider {
    client: Client,
    provider_id: String,
    base_url: String,
    api_key: Option<String>,
    pacer: Option<CallPacer>,
}

impl OpenAiProvider {
    pub fn new(provider_id: &str, base_url: &str, api_key: Option<String>) -> Self {
        OpenAiProvider {
            client: Client::new(),
            provider_id: provider_id.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            pacer: None,
        }
    }

    pub fn with_rate_limit(mut self, requests_per_minute: u32) -> Self {
        self.pacer = Some(CallPacer::from_rpm(requests_per_minute));
        self
    }

    fn format_messages(request: &ChatRequest) -> Vec<Value> {
        let mut out = Vec::with_capacity(request.messages.len() + 1);
        if !request.system.is_empty() {
            out.push(json!({ "role": "system", "content": request.system }));
        }
        for msg in &request.messages {
            let mut m = json!({
                "role": msg.role,
                "content": msg.content,
            });
            if let Some(tool_calls) = &msg.tool_calls {
                m["tool_calls"] = json!(tool_calls);
            }
            if let Some(id) = &msg.tool_call_id {
                m["tool_call_id"] = json!(id);
            }
            if let Some(name) = &msg.name {
                m["name"] = json!(name);
            }
            out.push(m);
        }
        out
    }

    fn parse_response(&self, body: &Value) -> EngineResult<ChatResponse> {
        let choice = body["choices"].get(0).ok_or_else(|| {
            EngineError::provider_permanent(&self.provider_id, "response has no choices")
        })?;
        let message = &choice["message"];
        let content = message["content"].as_str().unwrap_or("").to_string();
        let reasoning_content = message["reasoning_content"].as_str().map(|s| s.to_string());

        let mut tool_calls = Vec::new();
        if let Some(calls) = message["tool_calls"].as_array() {
            for call in calls {
                let id = call["id"].as_str().unwrap_or("").to_string();
                let name = call["function"]["name"].as_str().unwrap_or("").to_string();
                let arguments = call["function"]["arguments"].as_str().unwrap_or("{}").to_string();
                if name.is_empty() {
                    continue;
                }
                tool_calls.push(ToolCall {
                    id,
                    call_type: "function".into(),
                    function: FunctionCall { name, arguments },
                });
            }
        }

        let usage = body.get("usage").and_then(|u| {
            let input = u["prompt_tokens"].as_u64().unwrap_or(0);
            let output = u["completion_tokens"].as_u64().unwrap_or(0);
            if input > 0 || output > 0 {
                Some(TokenUsage {
                    input_tokens: input,
                    output_tokens: output,
                    total_tokens: u["total_tokens"].as_u64().unwrap_or(input + output),
                })
            } else {
                None
            }
        });

        Ok(ChatResponse {
            message: content,
            tool_calls,
            reasoning_content,
            usage,
            model: body["model"].as_str().map(|s| s.to_string()),
        })
    }

    pub async fn chat(&self, request: &ChatRequest) -> EngineResult<ChatResponse> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut payload = json!({
            "model": request.model,
            "messages": Self::format_messages(request),
        });
        if !request.tools.is_empty() {
            payload["tools"] = json!(request.tools);
            if let Some(choice) = &request.tool_choice {
                payload["tool_choice"] = match choice.as_str() {
                    "auto" | "none" | "required" => json!(choice),
                    name => json!({ "type": "function", "function": { "name": name } }),
                };
            }
        }
        if let Some(t) = request.temperature {
            payload["temperature"] = json!(t);
        }
        if let Some(max) = request.max_tokens {
            payload["max_tokens"] = json!(max);
        }

        let mut attempt = 0u32;
        loop {
            if let Some(pacer) = &self.pacer {
                pacer.pace().await;
            }
            let mut builder = self
                .client
                .post(&url)
                .timeout(Duration::from_secs(120))
                .json(&payload);
            if let Some(key) = &self.api_key {
                builder = builder.bearer_auth(key);
            }

            let result = builder.send().await;
            match result {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if resp.status().is_success() {
                        let body: Value = resp.json().await.map_err(|e| {
                            EngineError::provider_retryable(&self.provider_id, e.to_string())
                        })?;
                        return self.parse_response(&body);
                    }
                    let body = resp.text().await.unwrap_or_default();
                    let detail = format!("HTTP {}: {}", status, crate::atoms::types::truncate_utf8(&body, 300));
                    if is_retryable_status(status) && attempt < MAX_RETRIES {
                        warn!(
                            "[provider] {} transient failure (attempt {}/{}): {}",
                            self.provider_id,
                            attempt + 1,
                            MAX_RETRIES,
                            detail
                        );
                        retry_delay(attempt).await;
                        attempt += 1;
                        continue;
                    }
                    return if is_retryable_status(status) {
                        Err(EngineError::provider_retryable(&self.provider_id, detail))
                    } else {
                        Err(EngineError::provider_permanent(&self.provider_id, detail))
                    };
                }
                Err(e) => {
                    if attempt < MAX_RETRIES {
                        warn!(
                            "[provider] {} network error (attempt {}/{}): {}",
                            self.provider_id,
                            attempt + 1,
                            MAX_RETRIES,
                            e
                        );
                        retry_delay(attempt).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(EngineError::provider_retryable(&self.provider_id, e.to_string()));
                }
            }
        }
    }
}

// ── Scripted provider ──────────────────────────────────────────────────────
// Deterministic canned responses. Tests queue exact responses; the fallback
// text answers anything else so flows never dead-end.

pub struct ScriptedProvider {
    queue: Mutex<VecDeque<ChatResponse>>,
    fallback: String,
    /// Simulated latency per call — gives tests a real suspension window.
    delay: Mutex<Duration>,
    /// Requests observed, for assertions on what was actually sent.
    pub requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::always("Understood.")
    }

    pub fn always(fallback: &str) -> Self {
        ScriptedProvider {
            queue: Mutex::new(VecDeque::new()),
            fallback: fallback.to_string(),
            delay: Mutex::new(Duration::ZERO),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn push_text(&self, text: &str) {
        self.queue.lock().push_back(ChatResponse {
            message: text.to_string(),
            ..Default::default()
        });
    }

    pub fn push_tool_call(&self, tool: &str, arguments: Value) {
        self.queue.lock().push_back(ChatResponse {
            message: String::new(),
            tool_calls: vec![ToolCall {
                id: format!("call-{}", uuid::Uuid::new_v4()),
                call_type: "function".into(),
                function: FunctionCall { name: tool.to_string(), arguments: arguments.to_string() },
            }],
            ..Default::default()
        });
    }

    pub fn push_response(&self, response: ChatResponse) {
        self.queue.lock().push_back(response);
    }

    pub async fn chat(&self, request: &ChatRequest) -> EngineResult<ChatResponse> {
        self.requests.lock().push(request.clone());
        // Cooperative suspension point, so cancellation semantics hold in
        // tests exactly as they do against a real provider.
        let delay = *self.delay.lock();
        if delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(delay).await;
        }
        if let Some(response) = self.queue.lock().pop_front() {
            return Ok(response);
        }
        Ok(ChatResponse { message: self.fallback.clone(), ..Default::default() })
    }
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

// ── Enum dispatch ──────────────────────────────────────────────────────────

pub enum AnyProvider {
    OpenAiCompatible(OpenAiProvider),
    Scripted(ScriptedProvider),
}

impl AnyProvider {
    pub fn from_config(config: &ProviderConfig, api_key: Option<String>) -> EngineResult<Self> {
        match config.kind {
            ProviderKind::OpenAiCompatible => {
                let base_url = config.base_url.clone().ok_or_else(|| {
                    EngineError::Config(format!("provider '{}' missing base_url", config.id))
                })?;
                info!("[provider] Using {} at {}", config.id, base_url);
                let mut provider = OpenAiProvider::new(&config.id, &base_url, api_key);
                if let Some(rpm) = config.max_requests_per_minute {
                    provider = provider.with_rate_limit(rpm);
                }
                Ok(AnyProvider::OpenAiCompatible(provider))
            }
            ProviderKind::Scripted => Ok(AnyProvider::Scripted(ScriptedProvider::new())),
        }
    }

    pub async fn chat(&self, request: ChatRequest) -> EngineResult<ChatResponse> {
        match self {
            AnyProvider::OpenAiCompatible(p) => p.chat(&request).await,
            AnyProvider::Scripted(p) => p.chat(&request).await,
        }
    }

    /// The scripted inner handle, for tests that queue responses.
    pub fn scripted(&self) -> Option<&ScriptedProvider> {
        match self {
            AnyProvider::Scripted(p) => Some(p),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::Message;

    fn request(text: &str) -> ChatRequest {
        ChatRequest {
            model: "test".into(),
            system: "sys".into(),
            messages: vec![Message::user(text)],
            tools: vec![],
            tool_choice: None,
            temperature: None,
            max_tokens: None,
        }
    }

    #[tokio::test]
    async fn scripted_queue_then_fallback() {
        let provider = ScriptedProvider::always("fallback");
        provider.push_text("first");
        assert_eq!(provider.chat(&request("a")).await.unwrap().message, "first");
        assert_eq!(provider.chat(&request("b")).await.unwrap().message, "fallback");
        assert_eq!(provider.requests.lock().len(), 2);
    }

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(503));
        assert!(!is_retryable_status(400));
        assert!(!is_retryable_status(401));
    }

    #[test]
    fn parse_openai_response_shape() {
        let provider = OpenAiProvider::new("test", "http://localhost", None);
        let body = json!({
            "model": "gpt-test",
            "choices": [{
                "message": {
                    "content": "hello",
                    "tool_calls": [{
                        "id": "call_1",
                        "function": { "name": "read_file", "arguments": "{\"path\":\"x\"}" }
                    }]
                }
            }],
            "usage": { "prompt_tokens": 10, "completion_tokens": 5 }
        });
        let parsed = provider.parse_response(&body).unwrap();
        assert_eq!(parsed.message, "hello");
        assert_eq!(parsed.tool_calls.len(), 1);
        assert_eq!(parsed.tool_calls[0].function.name, "read_file");
        assert_eq!(parsed.usage.unwrap().total_tokens, 15);
    }
}
