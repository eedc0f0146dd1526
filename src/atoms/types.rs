// ── Aviary Atoms: Core Types ───────────────────────────────────────────────
// The data structures that flow through the entire engine.
// Provider-independent: every AI provider client maps to/from these.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ── Utility ────────────────────────────────────────────────────────────────

/// UTF-8–safe string truncation.  Returns a `&str` of at most `max_bytes`
/// bytes, backing up to the previous char boundary if `max_bytes` falls
/// inside a multi-byte character.
///
/// Use this instead of `&s[..s.len().min(N)]` which panics on non-ASCII.
pub fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Heuristic token count: ~4 bytes per token, the ratio used for all
/// context budgeting. Close enough for budget enforcement; the provider
/// reports exact usage after the fact.
pub fn approx_tokens(s: &str) -> usize {
    s.len().div_ceil(4)
}

// ── Messages ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single message in a provider conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Message { role: Role::System, content: content.into(), tool_calls: None, tool_call_id: None, name: None }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Message { role: Role::User, content: content.into(), tool_calls: None, tool_call_id: None, name: None }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Message { role: Role::Assistant, content: content.into(), tool_calls: None, tool_call_id: None, name: None }
    }

    /// Tool-result message echoed back to the provider.
    pub fn tool_result(tool_call_id: impl Into<String>, name: impl Into<String>, content: impl Into<String>) -> Self {
        Message {
            role: Role::Tool,
            content: content.into(),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
        }
    }
}

// ── Tool calling ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "default_tool_type")]
    pub call_type: String,
    pub function: FunctionCall,
}

fn default_tool_type() -> String {
    "function".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded arguments, exactly as the model produced them.
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    pub fn function(name: impl Into<String>, description: impl Into<String>, parameters: serde_json::Value) -> Self {
        ToolDefinition {
            tool_type: "function".into(),
            function: FunctionDefinition {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

// ── Provider request/response ──────────────────────────────────────────────

/// Token usage reported by the API (for metering).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

/// A complete chat request to any provider.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub system: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    /// "auto" | "none" | a specific tool name.
    pub tool_choice: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
}

/// The assembled provider response for one call.
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub message: String,
    pub tool_calls: Vec<ToolCall>,
    /// Native reasoning text, when the provider exposes it.
    /// Stored on the outbound event; never re-fed on later turns.
    pub reasoning_content: Option<String>,
    pub usage: Option<TokenUsage>,
    pub model: Option<String>,
}

impl ChatResponse {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

// ── Provider config ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// OpenAI, OpenRouter, Ollama, DeepSeek — any OpenAI-compatible API.
    OpenAiCompatible,
    /// Canned responses for tests and offline dry runs.
    Scripted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Stable identifier recorded next to vectors and usage rows.
    pub id: String,
    pub kind: ProviderKind,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Name of the secret holding the API key (resolved via SecretStore).
    #[serde(default)]
    pub api_key_secret: Option<String>,
    pub model: String,
    /// Cheapest model, used for background summary refresh.
    #[serde(default)]
    pub cheap_model: Option<String>,
    /// Call pacing cap for this provider id.
    #[serde(default)]
    pub max_requests_per_minute: Option<u32>,
}

impl ProviderConfig {
    pub fn cheap_model(&self) -> &str {
        self.cheap_model.as_deref().unwrap_or(&self.model)
    }
}

// ── Bot profiles (role cards) ──────────────────────────────────────────────
// Pure data loaded at startup and composed by flat merge — later wins.

/// Chain-of-thought depth for reflection injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningLevel {
    None,
    Light,
    Standard,
    Full,
}

impl ReasoningLevel {
    /// One step down, clamped at None.
    pub fn downgrade(self) -> Self {
        match self {
            ReasoningLevel::None | ReasoningLevel::Light => ReasoningLevel::None,
            ReasoningLevel::Standard => ReasoningLevel::Light,
            ReasoningLevel::Full => ReasoningLevel::Standard,
        }
    }

    /// One step up, clamped at Full.
    pub fn upgrade(self) -> Self {
        match self {
            ReasoningLevel::None => ReasoningLevel::Light,
            ReasoningLevel::Light => ReasoningLevel::Standard,
            ReasoningLevel::Standard | ReasoningLevel::Full => ReasoningLevel::Full,
        }
    }
}

/// Rough complexity of the user's request, used to shift reasoning depth
/// and to pick routing vs decomposition in the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplexityTier {
    Simple,
    Standard,
    Complex,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReasoningConfig {
    #[serde(default = "default_reasoning_level")]
    pub level: ReasoningLevel,
    /// Tools that always trigger a reflection pass after their result.
    #[serde(default)]
    pub always_cot: Vec<String>,
    /// Tools that never trigger reflection.
    #[serde(default)]
    pub never_cot: Vec<String>,
}

fn default_reasoning_level() -> ReasoningLevel {
    ReasoningLevel::Light
}

impl Default for ReasoningLevel {
    fn default() -> Self {
        ReasoningLevel::Light
    }
}

impl ReasoningConfig {
    /// Effective level at a complexity tier: simple downgrades one step,
    /// complex upgrades one step, bounded by None..Full.
    pub fn effective_level(&self, tier: ComplexityTier) -> ReasoningLevel {
        match tier {
            ComplexityTier::Simple => self.level.downgrade(),
            ComplexityTier::Standard => self.level,
            ComplexityTier::Complex => self.level.upgrade(),
        }
    }

    /// Whether a reflection instruction should follow this tool's result.
    pub fn should_reflect(&self, tool: &str, tier: ComplexityTier) -> bool {
        if self.always_cot.iter().any(|t| t == tool) {
            return true;
        }
        if self.never_cot.iter().any(|t| t == tool) {
            return false;
        }
        self.effective_level(tier) >= ReasoningLevel::Standard
    }
}

/// A bot's role card: identity, specialty, permissions, reasoning posture.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotProfile {
    pub name: String,
    /// "leader" for the coordinator, otherwise the specialty ("researcher",
    /// "coder", "creative", "auditor", "social", ...).
    pub role: String,
    /// Domains this bot claims expertise in (drives task assignment).
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub system_prompt: String,
    /// Optional persona overlay merged after the system prompt.
    #[serde(default)]
    pub soul: Option<String>,
    /// Tool names this bot may call. Empty = all registered non-destructive.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    #[serde(default)]
    pub reasoning: ReasoningConfig,
    /// Optional model override for this bot.
    #[serde(default)]
    pub model: Option<String>,
}

fn default_max_concurrent_tasks() -> usize {
    2
}

impl BotProfile {
    pub fn is_leader(&self) -> bool {
        self.role == "leader"
    }

    /// Flat-merge another card over this one: later wins, field by field.
    pub fn merge(&mut self, overlay: BotProfile) {
        if !overlay.system_prompt.is_empty() {
            self.system_prompt = overlay.system_prompt;
        }
        if overlay.soul.is_some() {
            self.soul = overlay.soul;
        }
        if !overlay.domains.is_empty() {
            self.domains = overlay.domains;
        }
        if !overlay.allowed_tools.is_empty() {
            self.allowed_tools = overlay.allowed_tools;
        }
        if overlay.model.is_some() {
            self.model = overlay.model;
        }
        self.role = overlay.role;
        self.max_concurrent_tasks = overlay.max_concurrent_tasks;
        self.reasoning = overlay.reasoning;
    }
}

// ── Inbound channel events ─────────────────────────────────────────────────

/// What a channel connector hands to the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub channel: String,
    pub sender: String,
    /// The connector's native conversation id.
    pub chat_id: String,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    pub timestamp: String,
    /// Drop pending queue entries for the room and cancel the active turn.
    #[serde(default)]
    pub cancel_prior: bool,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_utf8_respects_boundaries() {
        let s = "héllo wörld";
        let t = truncate_utf8(s, 2);
        assert!(t.len() <= 2);
        assert!(s.starts_with(t));
        assert_eq!(truncate_utf8("abc", 10), "abc");
    }

    #[test]
    fn reasoning_tier_shifts_are_clamped() {
        let cfg = ReasoningConfig { level: ReasoningLevel::Full, ..Default::default() };
        assert_eq!(cfg.effective_level(ComplexityTier::Complex), ReasoningLevel::Full);
        let cfg = ReasoningConfig { level: ReasoningLevel::None, ..Default::default() };
        assert_eq!(cfg.effective_level(ComplexityTier::Simple), ReasoningLevel::None);
    }

    #[test]
    fn always_cot_beats_level() {
        let cfg = ReasoningConfig {
            level: ReasoningLevel::None,
            always_cot: vec!["web_fetch".into()],
            never_cot: vec![],
        };
        assert!(cfg.should_reflect("web_fetch", ComplexityTier::Simple));
        assert!(!cfg.should_reflect("read_file", ComplexityTier::Simple));
    }

    #[test]
    fn profile_merge_later_wins() {
        let mut base = BotProfile {
            name: "coder".into(),
            role: "coder".into(),
            domains: vec!["code".into()],
            system_prompt: "base".into(),
            soul: None,
            allowed_tools: vec![],
            max_concurrent_tasks: 2,
            reasoning: ReasoningConfig::default(),
            model: None,
        };
        let overlay = BotProfile {
            name: "coder".into(),
            role: "coder".into(),
            domains: vec![],
            system_prompt: "overlay".into(),
            soul: Some("persona".into()),
            allowed_tools: vec!["exec".into()],
            max_concurrent_tasks: 4,
            reasoning: ReasoningConfig::default(),
            model: Some("small".into()),
        };
        base.merge(overlay);
        assert_eq!(base.system_prompt, "overlay");
        assert_eq!(base.domains, vec!["code".to_string()]); // empty overlay keeps base
        assert_eq!(base.max_concurrent_tasks, 4);
        assert_eq!(base.model.as_deref(), Some("small"));
    }
}
