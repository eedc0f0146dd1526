// Aviary Engine — Configuration
// One config object loaded from `aviary.toml` at the workspace root.
// Recognized sections: memory, rooms, security, channels, providers, bots.
// Unknown keys are ignored with a warning — they never fail startup.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::room_types::{EscalationThreshold, RoomKind, RoomPolicy};
use crate::atoms::types::{BotProfile, ProviderConfig, ProviderKind, ReasoningConfig};
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

// ── Memory section ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// "hash" = deterministic local embedder, otherwise an HTTP base URL
    /// style: "ollama" or "openai".
    pub backend: String,
    pub base_url: String,
    pub model: String,
    pub dims: usize,
    /// Degrade to the remote capability when the local provider fails.
    pub api_fallback: bool,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        EmbeddingConfig {
            backend: "hash".into(),
            base_url: "http://localhost:11434".into(),
            model: "nomic-embed-text".into(),
            dims: 384,
            api_fallback: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    pub batch_size: usize,
    /// Cosine floor for entity resolution candidates.
    pub candidate_threshold: f64,
    /// Cosine floor for an automatic merge.
    pub merge_threshold: f64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        ExtractionConfig { batch_size: 50, candidate_threshold: 0.78, merge_threshold: 0.85 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SummaryConfig {
    /// Events a node tolerates before it is refresh-eligible.
    pub staleness_threshold: i64,
    /// Leaves refreshed per background cycle.
    pub max_refresh_batch: usize,
    /// Source events read when rebuilding a leaf.
    pub max_source_events: usize,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        SummaryConfig { staleness_threshold: 10, max_refresh_batch: 8, max_source_events: 20 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    pub promotion_threshold: f64,
    pub max_promotions_per_bot: usize,
    pub half_life_days: f64,
    /// Cosine threshold for contradiction detection.
    pub contradiction_threshold: f64,
}

impl Default for LearningConfig {
    fn default() -> Self {
        LearningConfig {
            promotion_threshold: 0.75,
            max_promotions_per_bot: 3,
            half_life_days: 14.0,
            contradiction_threshold: 0.9,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub token_budget: usize,
    /// Last M session events included verbatim.
    pub recent_events: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        ContextConfig { token_budget: 4000, recent_events: 12 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TasksConfig {
    /// Group-commit durability is the default; flipping this off switches
    /// the broker to an explicit in-memory queue. Non-default, logged loudly.
    pub durable_broker: bool,
    pub background_workers: usize,
    pub background_queue_capacity: usize,
    pub quiet_threshold_secs: u64,
    pub max_retries: u32,
}

impl Default for TasksConfig {
    fn default() -> Self {
        TasksConfig {
            durable_broker: true,
            background_workers: 2,
            background_queue_capacity: 1000,
            quiet_threshold_secs: 30,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    pub embedding: EmbeddingConfig,
    pub extraction: ExtractionConfig,
    pub summary: SummaryConfig,
    pub learning: LearningConfig,
    pub context: ContextConfig,
    pub tasks: TasksConfig,
}

// ── Rooms section ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomDefaults {
    pub coordinator_mode: bool,
    pub escalation_threshold: String,
    pub auto_archive: bool,
    pub archive_after_days: u32,
}

impl Default for RoomDefaults {
    fn default() -> Self {
        RoomDefaults {
            coordinator_mode: false,
            escalation_threshold: "medium".into(),
            auto_archive: false,
            archive_after_days: 30,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomsSection {
    pub open: RoomDefaults,
    pub project: RoomDefaults,
    pub direct: RoomDefaults,
    pub coordination: RoomDefaults,
    /// Per-room inbound queue high-water mark.
    pub queue_high_water: Option<usize>,
    pub max_sidekicks_per_bot: Option<usize>,
    pub max_sidekicks_per_room: Option<usize>,
}

impl RoomsSection {
    pub fn defaults_for(&self, kind: RoomKind) -> &RoomDefaults {
        match kind {
            RoomKind::Open => &self.open,
            RoomKind::Project => &self.project,
            RoomKind::Direct => &self.direct,
            RoomKind::Coordination => &self.coordination,
        }
    }

    pub fn policy_for(&self, kind: RoomKind) -> RoomPolicy {
        let d = self.defaults_for(kind);
        RoomPolicy {
            auto_archive: d.auto_archive,
            archive_after_days: d.archive_after_days,
            coordinator_mode: d.coordinator_mode,
            escalation_threshold: EscalationThreshold::parse(&d.escalation_threshold)
                .unwrap_or(EscalationThreshold::Medium),
        }
    }
}

// ── Security section ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecuritySection {
    /// "keyring" or "file".
    pub secret_backend: String,
    pub web_content_isolation: bool,
    /// Destructive / exec tools need explicit user confirmation.
    pub require_confirmation: bool,
    /// User-provided substrings that force the coordinator to escalate
    /// instead of acting autonomously (matched case-insensitively).
    pub escalation_rules: Vec<String>,
}

impl Default for SecuritySection {
    fn default() -> Self {
        SecuritySection {
            secret_backend: "keyring".into(),
            web_content_isolation: true,
            require_confirmation: true,
            escalation_rules: Vec::new(),
        }
    }
}

// ── Channels section ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSection {
    pub enabled: bool,
    pub settings: HashMap<String, toml::Value>,
}

// ── Top-level config ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistantConfig {
    pub memory: MemorySection,
    pub rooms: RoomsSection,
    pub security: SecuritySection,
    pub channels: HashMap<String, ChannelSection>,
    pub providers: Vec<ProviderConfig>,
    pub bots: Vec<BotProfile>,
}

const KNOWN_SECTIONS: &[&str] = &["memory", "rooms", "security", "channels", "providers", "bots"];

impl AssistantConfig {
    /// Load `aviary.toml` from the workspace root; defaults when absent.
    /// Unknown top-level sections are ignored with a warning.
    pub fn load(workspace: &Path) -> EngineResult<Self> {
        let path = workspace.join("aviary.toml");
        if !path.exists() {
            let mut cfg = AssistantConfig::default();
            cfg.ensure_roster();
            return Ok(cfg);
        }
        let raw = std::fs::read_to_string(&path)?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> EngineResult<Self> {
        let value: toml::Value = raw
            .parse()
            .map_err(|e: toml::de::Error| EngineError::Config(format!("aviary.toml: {}", e)))?;
        if let Some(table) = value.as_table() {
            for key in table.keys() {
                if !KNOWN_SECTIONS.contains(&key.as_str()) {
                    warn!("[config] Ignoring unknown section '{}' in aviary.toml", key);
                }
            }
        }
        let mut cfg: AssistantConfig = value
            .try_into()
            .map_err(|e: toml::de::Error| EngineError::Config(format!("aviary.toml: {}", e)))?;
        cfg.ensure_roster();
        Ok(cfg)
    }

    /// Guarantee a usable bot roster: a leader always exists, and the
    /// default specialists are seeded when the config names none.
    fn ensure_roster(&mut self) {
        if self.bots.is_empty() {
            self.bots = default_roster();
            return;
        }
        if !self.bots.iter().any(|b| b.is_leader()) {
            self.bots.insert(0, leader_profile());
        }
    }

    pub fn leader(&self) -> &BotProfile {
        // ensure_roster guarantees a leader exists.
        self.bots
            .iter()
            .find(|b| b.is_leader())
            .unwrap_or(&self.bots[0])
    }

    pub fn bot(&self, name: &str) -> Option<&BotProfile> {
        self.bots.iter().find(|b| b.name == name)
    }

    pub fn provider(&self, id: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.id == id)
    }

    pub fn default_provider(&self) -> Option<&ProviderConfig> {
        self.providers.first()
    }

    pub fn queue_high_water(&self) -> usize {
        self.rooms.queue_high_water.unwrap_or(100)
    }

    pub fn max_sidekicks_per_bot(&self) -> usize {
        self.rooms.max_sidekicks_per_bot.unwrap_or(3)
    }

    pub fn max_sidekicks_per_room(&self) -> usize {
        self.rooms.max_sidekicks_per_room.unwrap_or(6)
    }
}

fn leader_profile() -> BotProfile {
    BotProfile {
        name: "leader".into(),
        role: "leader".into(),
        domains: vec!["coordination".into(), "strategy".into()],
        system_prompt: "You coordinate a team of specialist bots. Route simple requests \
            yourself, decompose complex ones into delegated tasks, and assemble the results."
            .into(),
        soul: None,
        allowed_tools: vec![],
        max_concurrent_tasks: 4,
        reasoning: ReasoningConfig::default(),
        model: None,
    }
}

/// The stock team: a leader plus the standard specialists.
pub fn default_roster() -> Vec<BotProfile> {
    let specialist = |name: &str, domains: &[&str], prompt: &str| BotProfile {
        name: name.into(),
        role: name.into(),
        domains: domains.iter().map(|d| d.to_string()).collect(),
        system_prompt: prompt.into(),
        soul: None,
        allowed_tools: vec![],
        max_concurrent_tasks: 2,
        reasoning: ReasoningConfig::default(),
        model: None,
    };
    vec![
        leader_profile(),
        specialist("researcher", &["research", "analysis"], "You dig up sources, compare claims, and report findings with citations."),
        specialist("coder", &["code", "engineering"], "You write, review, and debug code. Prefer small verified steps."),
        specialist("creative", &["writing", "design"], "You draft copy, name things, and explore creative directions."),
        specialist("auditor", &["review", "compliance"], "You check other bots' outputs for errors, risks, and policy violations."),
        specialist("social", &["communication", "outreach"], "You handle tone, scheduling, and outward-facing messages."),
    ]
}

/// Default provider used when the config declares none: a scripted provider
/// so the runtime stays usable offline (tests, dry runs).
pub fn fallback_provider() -> ProviderConfig {
    ProviderConfig {
        id: "scripted".into(),
        kind: ProviderKind::Scripted,
        base_url: None,
        api_key_secret: None,
        model: "scripted-v0".into(),
        cheap_model: None,
        max_requests_per_minute: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_have_a_leader_and_specialists() {
        let cfg = AssistantConfig::parse("").unwrap();
        assert!(cfg.bots.iter().any(|b| b.is_leader()));
        assert!(cfg.bots.iter().any(|b| b.name == "researcher"));
        assert!(cfg.memory.tasks.durable_broker);
        assert_eq!(cfg.memory.summary.staleness_threshold, 10);
    }

    #[test]
    fn unknown_sections_are_tolerated() {
        let cfg = AssistantConfig::parse("[telemetry]\nendpoint = \"nope\"\n").unwrap();
        assert!(cfg.providers.is_empty());
    }

    #[test]
    fn bots_without_leader_get_one_seeded() {
        let raw = r#"
[[bots]]
name = "coder"
role = "coder"
"#;
        let cfg = AssistantConfig::parse(raw).unwrap();
        assert!(cfg.bots[0].is_leader());
        assert!(cfg.bots.iter().any(|b| b.name == "coder"));
    }

    #[test]
    fn room_policy_from_defaults() {
        let raw = r#"
[rooms.project]
coordinator_mode = true
escalation_threshold = "high"
"#;
        let cfg = AssistantConfig::parse(raw).unwrap();
        let policy = cfg.rooms.policy_for(RoomKind::Project);
        assert!(policy.coordinator_mode);
        assert_eq!(policy.escalation_threshold, EscalationThreshold::High);
        assert!(!cfg.rooms.policy_for(RoomKind::Open).coordinator_mode);
    }
}
