// ── Aviary Atoms: Memory Types ─────────────────────────────────────────────
// The hybrid memory data model: the append-only event log, the knowledge
// graph (entities / edges / facts), the staleness-driven summary tree, and
// per-bot learnings.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ── Events ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
    Internal,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
            Direction::Internal => "internal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inbound" => Some(Direction::Inbound),
            "outbound" => Some(Direction::Outbound),
            "internal" => Some(Direction::Internal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Message,
    ToolCall,
    ToolResult,
    Observation,
    BotMessage,
    Escalation,
    Coordination,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Message => "message",
            EventKind::ToolCall => "tool_call",
            EventKind::ToolResult => "tool_result",
            EventKind::Observation => "observation",
            EventKind::BotMessage => "bot_message",
            EventKind::Escalation => "escalation",
            EventKind::Coordination => "coordination",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "message" => Some(EventKind::Message),
            "tool_call" => Some(EventKind::ToolCall),
            "tool_result" => Some(EventKind::ToolResult),
            "observation" => Some(EventKind::Observation),
            "bot_message" => Some(EventKind::BotMessage),
            "escalation" => Some(EventKind::Escalation),
            "coordination" => Some(EventKind::Coordination),
            _ => None,
        }
    }

    /// Tool events must carry a tool name.
    pub fn requires_tool_name(&self) -> bool {
        matches!(self, EventKind::ToolCall | EventKind::ToolResult)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionStatus {
    Pending,
    Complete,
    Skipped,
    Failed,
}

impl ExtractionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionStatus::Pending => "pending",
            ExtractionStatus::Complete => "complete",
            ExtractionStatus::Skipped => "skipped",
            ExtractionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ExtractionStatus::Pending),
            "complete" => Some(ExtractionStatus::Complete),
            "skipped" => Some(ExtractionStatus::Skipped),
            "failed" => Some(ExtractionStatus::Failed),
            _ => None,
        }
    }
}

/// Immutable record of everything that happened: messages, tool calls and
/// results, observations, inter-bot traffic, escalations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    /// Per-session monotonic sequence assigned by the store on append.
    /// 0 until persisted.
    #[serde(default)]
    pub seq: i64,
    pub timestamp: String,
    pub channel: String,
    pub direction: Direction,
    pub kind: EventKind,
    pub content: String,
    /// Session / room key, e.g. "cli:#general".
    pub session_key: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub bot_name: Option<String>,
    #[serde(default)]
    pub bot_role: Option<String>,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default = "default_extraction")]
    pub extraction: ExtractionStatus,
    /// Relevance score in [0,1], decayed by the maintenance cycle.
    #[serde(default = "default_relevance")]
    pub relevance: f64,
    #[serde(default)]
    pub last_accessed: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

fn default_extraction() -> ExtractionStatus {
    ExtractionStatus::Pending
}

fn default_relevance() -> f64 {
    1.0
}

impl Event {
    /// New inbound/outbound/internal event with a fresh id and timestamp.
    pub fn new(
        channel: impl Into<String>,
        direction: Direction,
        kind: EventKind,
        content: impl Into<String>,
        session_key: impl Into<String>,
    ) -> Self {
        Event {
            id: uuid::Uuid::new_v4().to_string(),
            seq: 0,
            timestamp: chrono::Utc::now().to_rfc3339(),
            channel: channel.into(),
            direction,
            kind,
            content: content.into(),
            session_key: session_key.into(),
            parent_id: None,
            bot_name: None,
            bot_role: None,
            tool_name: None,
            extraction: ExtractionStatus::Pending,
            relevance: 1.0,
            last_accessed: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_bot(mut self, name: impl Into<String>, role: impl Into<String>) -> Self {
        self.bot_name = Some(name.into());
        self.bot_role = Some(role.into());
        self
    }

    pub fn with_tool(mut self, tool_name: impl Into<String>) -> Self {
        self.tool_name = Some(tool_name.into());
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

// ── Knowledge graph ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Person,
    Org,
    Location,
    Concept,
    Tool,
    Topic,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Person => "person",
            EntityKind::Org => "org",
            EntityKind::Location => "location",
            EntityKind::Concept => "concept",
            EntityKind::Tool => "tool",
            EntityKind::Topic => "topic",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "person" => Some(EntityKind::Person),
            "org" => Some(EntityKind::Org),
            "location" => Some(EntityKind::Location),
            "concept" => Some(EntityKind::Concept),
            "tool" => Some(EntityKind::Tool),
            "topic" => Some(EntityKind::Topic),
            _ => None,
        }
    }

    pub fn all() -> [EntityKind; 6] {
        [
            EntityKind::Person,
            EntityKind::Org,
            EntityKind::Location,
            EntityKind::Concept,
            EntityKind::Tool,
            EntityKind::Topic,
        ]
    }
}

/// Canonical reference to a person / org / location / concept / tool / topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub name: String,
    pub kind: EntityKind,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub source_event_ids: Vec<String>,
    #[serde(default)]
    pub event_count: i64,
    pub first_seen: String,
    pub last_seen: String,
}

/// Directed, typed relationship between two entities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub src: String,
    pub rel: String,
    pub dst: String,
    pub strength: f64,
    #[serde(default)]
    pub source_event_ids: Vec<String>,
    pub first_seen: String,
    pub last_seen: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FactKind {
    Relation,
    Attribute,
    Preference,
    State,
}

impl FactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FactKind::Relation => "relation",
            FactKind::Attribute => "attribute",
            FactKind::Preference => "preference",
            FactKind::State => "state",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "relation" => Some(FactKind::Relation),
            "attribute" => Some(FactKind::Attribute),
            "preference" => Some(FactKind::Preference),
            "state" => Some(FactKind::State),
            _ => None,
        }
    }
}

/// Subject-predicate-object triple. Object may be a literal or an entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    pub id: String,
    pub subject_id: String,
    pub predicate: String,
    pub object_text: String,
    #[serde(default)]
    pub object_entity_id: Option<String>,
    pub kind: FactKind,
    pub confidence: f64,
    pub strength: f64,
    #[serde(default)]
    pub source_event_ids: Vec<String>,
    #[serde(default)]
    pub valid_from: Option<String>,
    #[serde(default)]
    pub valid_to: Option<String>,
    /// Contradiction handling chains through here; history is never mutated.
    #[serde(default)]
    pub superseded_by: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

// ── Summary tree ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryKind {
    Root,
    Channel,
    EntityType,
    Entity,
    Topic,
    Preferences,
}

impl SummaryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SummaryKind::Root => "root",
            SummaryKind::Channel => "channel",
            SummaryKind::EntityType => "entity_type",
            SummaryKind::Entity => "entity",
            SummaryKind::Topic => "topic",
            SummaryKind::Preferences => "preferences",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "root" => Some(SummaryKind::Root),
            "channel" => Some(SummaryKind::Channel),
            "entity_type" => Some(SummaryKind::EntityType),
            "entity" => Some(SummaryKind::Entity),
            "topic" => Some(SummaryKind::Topic),
            "preferences" => Some(SummaryKind::Preferences),
            _ => None,
        }
    }

    /// Position in the hierarchy; a parent must rank strictly higher.
    pub fn rank(&self) -> u8 {
        match self {
            SummaryKind::Root => 3,
            SummaryKind::Channel | SummaryKind::EntityType | SummaryKind::Preferences => 2,
            SummaryKind::Entity | SummaryKind::Topic => 1,
        }
    }

    /// Leaves are rebuilt from events; branches synthesize from children.
    pub fn is_leaf(&self) -> bool {
        matches!(self, SummaryKind::Entity | SummaryKind::Topic | SummaryKind::Preferences)
    }
}

/// Node in the staleness-driven summary tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryNode {
    pub id: String,
    pub kind: SummaryKind,
    /// Composite key, e.g. "root", "channel:telegram", "entity:{id}",
    /// "user_preferences".
    pub key: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub summary: String,
    pub events_since_update: i64,
    #[serde(default)]
    pub last_updated: Option<String>,
}

// ── Learnings ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningSource {
    UserFeedback,
    SelfEvaluation,
    ToolOutcome,
    CrossPollination,
}

impl LearningSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LearningSource::UserFeedback => "user_feedback",
            LearningSource::SelfEvaluation => "self_evaluation",
            LearningSource::ToolOutcome => "tool_outcome",
            LearningSource::CrossPollination => "cross_pollination",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user_feedback" => Some(LearningSource::UserFeedback),
            "self_evaluation" => Some(LearningSource::SelfEvaluation),
            "tool_outcome" => Some(LearningSource::ToolOutcome),
            "cross_pollination" => Some(LearningSource::CrossPollination),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Negative,
    Neutral,
}

impl Sentiment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sentiment::Positive => "positive",
            Sentiment::Negative => "negative",
            Sentiment::Neutral => "neutral",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "positive" => Some(Sentiment::Positive),
            "negative" => Some(Sentiment::Negative),
            "neutral" => Some(Sentiment::Neutral),
            _ => None,
        }
    }

    pub fn opposes(&self, other: Sentiment) -> bool {
        matches!(
            (self, other),
            (Sentiment::Positive, Sentiment::Negative) | (Sentiment::Negative, Sentiment::Positive)
        )
    }
}

/// A self- or user-derived insight, private to a bot until promoted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Learning {
    pub id: String,
    pub bot_id: String,
    pub content: String,
    pub source: LearningSource,
    pub sentiment: Sentiment,
    pub confidence: f64,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub recommendation: String,
    #[serde(default)]
    pub superseded_by: Option<String>,
    pub is_private: bool,
    #[serde(default)]
    pub promotion_count: i64,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: String,
    pub updated_at: String,
}

/// Append-only record of a private learning's promotion to the shared pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    pub learning_id: String,
    pub bot_id: String,
    pub original_scope: String,
    pub promotion_date: String,
    pub reason: String,
    pub cross_pollinated_by: String,
    pub exposure_count: i64,
}

/// Per (bot, domain) success tracking with Laplace smoothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotExpertise {
    pub bot_id: String,
    pub domain: String,
    pub interaction_count: i64,
    pub success_count: i64,
    #[serde(default)]
    pub last_success_at: Option<String>,
}

impl BotExpertise {
    /// Add-one numerator, add-two denominator.
    pub fn score(&self) -> f64 {
        (self.success_count as f64 + 1.0) / (self.interaction_count.max(0) as f64 + 2.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_roundtrip() {
        for k in [
            EventKind::Message,
            EventKind::ToolCall,
            EventKind::ToolResult,
            EventKind::Observation,
            EventKind::BotMessage,
            EventKind::Escalation,
            EventKind::Coordination,
        ] {
            assert_eq!(EventKind::parse(k.as_str()), Some(k));
        }
        assert!(EventKind::ToolCall.requires_tool_name());
        assert!(!EventKind::Message.requires_tool_name());
    }

    #[test]
    fn summary_hierarchy_ranks() {
        assert!(SummaryKind::Root.rank() > SummaryKind::Channel.rank());
        assert!(SummaryKind::Channel.rank() > SummaryKind::Entity.rank());
        assert!(SummaryKind::Preferences.is_leaf());
        assert!(!SummaryKind::Root.is_leaf());
    }

    #[test]
    fn expertise_laplace_smoothing() {
        let e = BotExpertise {
            bot_id: "coder".into(),
            domain: "code".into(),
            interaction_count: 0,
            success_count: 0,
            last_success_at: None,
        };
        assert!((e.score() - 0.5).abs() < 1e-9);
        let e2 = BotExpertise { interaction_count: 8, success_count: 7, ..e };
        assert!((e2.score() - 0.8).abs() < 1e-9);
    }

    #[test]
    fn sentiment_opposition() {
        assert!(Sentiment::Positive.opposes(Sentiment::Negative));
        assert!(!Sentiment::Neutral.opposes(Sentiment::Negative));
    }
}
