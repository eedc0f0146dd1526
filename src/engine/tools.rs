// Aviary Engine — Tool Registry
// Tool contracts: name, JSON-schema parameters, side-effect class, and the
// per-bot permission mask. The registry is a plain lookup table built at
// startup; skills (directory + manifest) must pass the injection scan
// before their tools activate.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{BotProfile, ToolDefinition};
use crate::engine::injection;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;

// ── Contracts ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SideEffect {
    ReadOnly,
    ReadWrite,
    Network,
    Exec,
    Destructive,
}

impl SideEffect {
    pub fn as_str(&self) -> &'static str {
        match self {
            SideEffect::ReadOnly => "read-only",
            SideEffect::ReadWrite => "read-write",
            SideEffect::Network => "network",
            SideEffect::Exec => "exec",
            SideEffect::Destructive => "destructive",
        }
    }

    /// Classes that need explicit confirmation or coordinator authority.
    pub fn is_guarded(&self) -> bool {
        matches!(self, SideEffect::Exec | SideEffect::Destructive)
    }
}

#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON-schema object for the arguments.
    pub parameters: Value,
    pub side_effect: SideEffect,
}

impl ToolSpec {
    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition::function(&self.name, &self.description, self.parameters.clone())
    }
}

/// Outcome status of one tool execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Success,
    Error,
    Timeout,
}

impl ToolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolStatus::Success => "success",
            ToolStatus::Error => "error",
            ToolStatus::Timeout => "timeout",
        }
    }
}

/// What `execute` hands back (and what lands in the tool_result event).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub status: ToolStatus,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured_output: Option<Value>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolOutcome {
    pub fn success(value: impl Into<String>, structured_output: Option<Value>, duration_ms: u64) -> Self {
        ToolOutcome { status: ToolStatus::Success, value: value.into(), structured_output, duration_ms, error: None }
    }

    pub fn failure(status: ToolStatus, error: impl Into<String>, duration_ms: u64) -> Self {
        let error = error.into();
        ToolOutcome {
            status,
            value: format!("Error: {}", error),
            structured_output: None,
            duration_ms,
            error: Some(error),
        }
    }
}

// ── Registry ───────────────────────────────────────────────────────────────

pub struct ToolRegistry {
    tools: HashMap<String, ToolSpec>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        let mut registry = ToolRegistry { tools: HashMap::new() };
        for spec in builtin_specs() {
            registry.register(spec);
        }
        registry
    }

    pub fn register(&mut self, spec: ToolSpec) {
        self.tools.insert(spec.name.clone(), spec);
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name)
    }

    /// Permission mask: an empty allowlist grants every registered tool
    /// except the guarded classes; leaders additionally get the
    /// coordination tools regardless.
    pub fn is_permitted(&self, bot: &BotProfile, name: &str) -> bool {
        let Some(spec) = self.tools.get(name) else { return false };
        if COORDINATION_TOOLS.contains(&name) {
            return bot.is_leader();
        }
        if bot.allowed_tools.is_empty() {
            return !spec.side_effect.is_guarded();
        }
        bot.allowed_tools.iter().any(|t| t == name)
    }

    /// The tool definitions this bot may see in a provider call.
    pub fn definitions_for(&self, bot: &BotProfile) -> Vec<ToolDefinition> {
        let mut names: Vec<&String> = self.tools.keys().collect();
        names.sort(); // deterministic ordering for context purity
        names
            .into_iter()
            .filter(|name| self.is_permitted(bot, name))
            .filter_map(|name| self.tools.get(name).map(|s| s.definition()))
            .collect()
    }

    /// Minimal JSON-schema validation: required keys present, property
    /// types match. Violations are permanent tool errors, never retried.
    pub fn validate_args(&self, name: &str, args: &Value) -> EngineResult<()> {
        let spec = self
            .tools
            .get(name)
            .ok_or_else(|| EngineError::tool_permanent(name, "unknown tool"))?;
        let schema = &spec.parameters;
        let Some(obj) = args.as_object() else {
            return Err(EngineError::tool_permanent(name, "arguments must be an object"));
        };
        if let Some(required) = schema["required"].as_array() {
            for key in required.iter().filter_map(|k| k.as_str()) {
                if !obj.contains_key(key) {
                    return Err(EngineError::tool_permanent(
                        name,
                        format!("missing required argument '{}'", key),
                    ));
                }
            }
        }
        if let Some(properties) = schema["properties"].as_object() {
            for (key, value) in obj {
                let Some(prop) = properties.get(key) else { continue };
                let expected = prop["type"].as_str().unwrap_or("string");
                let ok = match expected {
                    "string" => value.is_string(),
                    "number" | "integer" => value.is_number(),
                    "boolean" => value.is_boolean(),
                    "array" => value.is_array(),
                    "object" => value.is_object(),
                    _ => true,
                };
                if !ok {
                    return Err(EngineError::tool_permanent(
                        name,
                        format!("argument '{}' must be a {}", key, expected),
                    ));
                }
            }
        }
        Ok(())
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Tools only the leader may call.
pub const COORDINATION_TOOLS: &[&str] = &["delegate_task", "check_delegations"];

/// Tools the agent loop intercepts itself instead of routing to the
/// executor (they spawn sessions rather than compute a value).
pub const INTERCEPTED_TOOLS: &[&str] = &["delegate_task", "check_delegations", "spawn_sidekick"];

fn string_param(description: &str) -> Value {
    json!({ "type": "string", "description": description })
}

pub fn builtin_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: "read_file".into(),
            description: "Read a file from your workspace.".into(),
            parameters: json!({
                "type": "object",
                "properties": { "path": string_param("Workspace-relative file path") },
                "required": ["path"]
            }),
            side_effect: SideEffect::ReadOnly,
        },
        ToolSpec {
            name: "write_file".into(),
            description: "Write (or overwrite) a file in your workspace.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": string_param("Workspace-relative file path"),
                    "content": string_param("Full file content")
                },
                "required": ["path", "content"]
            }),
            side_effect: SideEffect::ReadWrite,
        },
        ToolSpec {
            name: "list_directory".into(),
            description: "List files in a workspace directory.".into(),
            parameters: json!({
                "type": "object",
                "properties": { "path": string_param("Workspace-relative directory (default: root)") },
                "required": []
            }),
            side_effect: SideEffect::ReadOnly,
        },
        ToolSpec {
            name: "delete_file".into(),
            description: "Delete a file from your workspace. Destructive.".into(),
            parameters: json!({
                "type": "object",
                "properties": { "path": string_param("Workspace-relative file path") },
                "required": ["path"]
            }),
            side_effect: SideEffect::Destructive,
        },
        ToolSpec {
            name: "fetch".into(),
            description: "Fetch a URL. The content is stored as an external artifact and \
                quarantined as untrusted."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": { "url": string_param("HTTP(S) URL to fetch") },
                "required": ["url"]
            }),
            side_effect: SideEffect::Network,
        },
        ToolSpec {
            name: "remember".into(),
            description: "Store a learning for yourself (optionally shareable by category).".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "content": string_param("The insight to remember"),
                    "category": string_param("user_preference | tool_pattern | research_finding | other"),
                    "confidence": { "type": "number", "description": "0.0 - 1.0" }
                },
                "required": ["content"]
            }),
            side_effect: SideEffect::ReadWrite,
        },
        ToolSpec {
            name: "recall".into(),
            description: "Semantic search over the event memory.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": string_param("What to look for"),
                    "k": { "type": "integer", "description": "Max results (default 5)" }
                },
                "required": ["query"]
            }),
            side_effect: SideEffect::ReadOnly,
        },
        ToolSpec {
            name: "artifact_put".into(),
            description: "Store content as a content-addressed artifact and register it on the \
                room's artifact chain for downstream bots."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "content": string_param("Artifact body"),
                    "ext": string_param("File extension (default: txt)"),
                    "kind": string_param("Logical type, e.g. report, csv, code")
                },
                "required": ["content"]
            }),
            side_effect: SideEffect::ReadWrite,
        },
        ToolSpec {
            name: "artifact_get".into(),
            description: "Read an artifact by its path reference.".into(),
            parameters: json!({
                "type": "object",
                "properties": { "path": string_param("artifacts/<hash>.<ext> path") },
                "required": ["path"]
            }),
            side_effect: SideEffect::ReadOnly,
        },
        ToolSpec {
            name: "spawn_sidekick".into(),
            description: "Spawn a short-lived helper session with a scoped context packet. \
                Its output merges into your response; it never posts to the room."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "goal": string_param("What the sidekick should produce"),
                    "inputs": { "type": "array", "items": { "type": "string" },
                                "description": "Explicit input snippets or artifact paths" },
                    "output_format": string_param("Expected shape of the result")
                },
                "required": ["goal"]
            }),
            side_effect: SideEffect::ReadOnly,
        },
        ToolSpec {
            name: "delegate_task".into(),
            description: "Leader only: delegate a task to a specialist bot (fire-and-forget; \
                the result is announced back into the room)."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "bot": string_param("Specialist bot name"),
                    "task": string_param("Clear description of the delegated work"),
                    "expected_outputs": { "type": "array", "items": { "type": "string" },
                                          "description": "Structured keys the result must contain" },
                    "input_artifacts": { "type": "array", "items": { "type": "string" },
                                         "description": "Artifact paths the bot should consume" }
                },
                "required": ["bot", "task"]
            }),
            side_effect: SideEffect::ReadWrite,
        },
        ToolSpec {
            name: "check_delegations".into(),
            description: "Leader only: status of tasks delegated in this room.".into(),
            parameters: json!({ "type": "object", "properties": {}, "required": [] }),
            side_effect: SideEffect::ReadOnly,
        },
    ]
}

// ── Skills ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SkillManifest {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub tools: Vec<SkillTool>,
}

#[derive(Debug, Deserialize)]
pub struct SkillTool {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub parameters: Option<Value>,
    #[serde(default = "default_skill_side_effect")]
    pub side_effect: String,
}

fn default_skill_side_effect() -> String {
    "read-only".into()
}

/// Load skill manifests from `skills/<name>/skill.json`. A manifest that
/// trips the injection scan or carries a credential is rejected — the skill
/// simply never activates.
pub fn load_skills(registry: &mut ToolRegistry, skills_dir: &Path) -> EngineResult<usize> {
    if !skills_dir.exists() {
        return Ok(0);
    }
    let mut loaded = 0usize;
    for entry in std::fs::read_dir(skills_dir)? {
        let entry = entry?;
        let manifest_path = entry.path().join("skill.json");
        if !manifest_path.exists() {
            continue;
        }
        let raw = std::fs::read_to_string(&manifest_path)?;

        let scan = injection::scan(&raw);
        let (_, credentials) = injection::redact_credentials(&raw);
        if scan.is_injection || !credentials.is_empty() {
            warn!(
                "[tools] Rejected skill manifest {:?}: injection={} credentials={:?}",
                manifest_path, scan.is_injection, credentials
            );
            continue;
        }

        let manifest: SkillManifest = match serde_json::from_str(&raw) {
            Ok(m) => m,
            Err(e) => {
                warn!("[tools] Unparseable skill manifest {:?}: {}", manifest_path, e);
                continue;
            }
        };
        for tool in manifest.tools {
            let side_effect = match tool.side_effect.as_str() {
                "read-write" => SideEffect::ReadWrite,
                "network" => SideEffect::Network,
                "exec" => SideEffect::Exec,
                "destructive" => SideEffect::Destructive,
                _ => SideEffect::ReadOnly,
            };
            registry.register(ToolSpec {
                name: tool.name,
                description: tool.description,
                parameters: tool
                    .parameters
                    .unwrap_or_else(|| json!({ "type": "object", "properties": {}, "required": [] })),
                side_effect,
            });
            loaded += 1;
        }
        info!("[tools] Activated skill '{}'", manifest.name);
    }
    Ok(loaded)
}
