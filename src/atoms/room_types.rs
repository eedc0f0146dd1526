// ── Aviary Atoms: Rooms, Tasks, Bot Messages ───────────────────────────────
// Conversation spaces, delegated work units, and the inter-bot bus envelope.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::atoms::error::{EngineError, EngineResult};

// ── Rooms ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomKind {
    Open,
    Project,
    Direct,
    Coordination,
}

impl RoomKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomKind::Open => "open",
            RoomKind::Project => "project",
            RoomKind::Direct => "direct",
            RoomKind::Coordination => "coordination",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(RoomKind::Open),
            "project" => Some(RoomKind::Project),
            "direct" => Some(RoomKind::Direct),
            "coordination" => Some(RoomKind::Coordination),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscalationThreshold {
    Low,
    Medium,
    High,
}

impl EscalationThreshold {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationThreshold::Low => "low",
            EscalationThreshold::Medium => "medium",
            EscalationThreshold::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(EscalationThreshold::Low),
            "medium" => Some(EscalationThreshold::Medium),
            "high" => Some(EscalationThreshold::High),
            _ => None,
        }
    }

    /// Minimum confidence the coordinator needs before acting autonomously.
    /// Below this, the decision escalates to the user.
    pub fn min_confidence(&self) -> f64 {
        match self {
            EscalationThreshold::Low => 0.5,
            EscalationThreshold::Medium => 0.7,
            EscalationThreshold::High => 0.9,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomPolicy {
    #[serde(default)]
    pub auto_archive: bool,
    #[serde(default = "default_archive_after_days")]
    pub archive_after_days: u32,
    /// Lets the leader act autonomously subject to the escalation threshold.
    #[serde(default)]
    pub coordinator_mode: bool,
    #[serde(default = "default_escalation_threshold")]
    pub escalation_threshold: EscalationThreshold,
}

fn default_archive_after_days() -> u32 {
    30
}

fn default_escalation_threshold() -> EscalationThreshold {
    EscalationThreshold::Medium
}

impl Default for RoomPolicy {
    fn default() -> Self {
        RoomPolicy {
            auto_archive: false,
            archive_after_days: 30,
            coordinator_mode: false,
            escalation_threshold: EscalationThreshold::Medium,
        }
    }
}

/// Descriptor of a produced artifact inside a chain entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    pub path: String,
    pub kind: String,
    pub size: u64,
    pub sha256: String,
    pub created_at: String,
}

/// One step of a room's artifact chain. Steps strictly increase per room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactChainEntry {
    pub step: u64,
    pub producer: String,
    pub task: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<ArtifactDescriptor>,
    pub status: String,
    pub timestamp: String,
}

/// Addressable conversation space — the unit of message ordering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: String,
    pub kind: RoomKind,
    pub owner: String,
    /// Ordered set of participant bot names. The leader is always present.
    pub participants: Vec<String>,
    pub created_at: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub policy: RoomPolicy,
    #[serde(default)]
    pub deadline: Option<String>,
    #[serde(default)]
    pub artifact_chain: Vec<ArtifactChainEntry>,
    #[serde(default)]
    pub last_activity: Option<String>,
}

impl Room {
    /// Validate structural invariants before persisting.
    pub fn validate(&self, leader: &str) -> EngineResult<()> {
        if !self.participants.iter().any(|p| p == leader) {
            return Err(EngineError::Config(format!(
                "room '{}' must include the leader bot '{}'",
                self.id, leader
            )));
        }
        if self.kind == RoomKind::Direct && self.participants.len() != 2 {
            return Err(EngineError::Config(format!(
                "direct room '{}' must have exactly two participants, has {}",
                self.id,
                self.participants.len()
            )));
        }
        let mut last_step = 0u64;
        for entry in &self.artifact_chain {
            if entry.step <= last_step && last_step != 0 {
                return Err(EngineError::Corruption(format!(
                    "room '{}' artifact chain steps not strictly increasing at step {}",
                    self.id, entry.step
                )));
            }
            last_step = entry.step;
        }
        Ok(())
    }

    /// Next artifact chain step number.
    pub fn next_step(&self) -> u64 {
        self.artifact_chain.last().map(|e| e.step + 1).unwrap_or(1)
    }
}

// ── Tasks ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    InProgress,
    Blocked,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "assigned" => Some(TaskStatus::Assigned),
            "in_progress" => Some(TaskStatus::InProgress),
            "blocked" => Some(TaskStatus::Blocked),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }

    /// Allowed edges of the task state machine.
    /// PENDING → ASSIGNED → IN_PROGRESS → {COMPLETED | FAILED | CANCELLED};
    /// BLOCKED is a side state entered from PENDING/ASSIGNED on unmet
    /// dependencies and exited back to PENDING on dependency completion.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Assigned)
                | (Pending, Blocked)
                | (Pending, Cancelled)
                | (Assigned, InProgress)
                | (Assigned, Blocked)
                | (Assigned, Cancelled)
                | (Blocked, Pending)
                | (Blocked, Cancelled)
                | (Blocked, Failed)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Cancelled)
        )
    }
}

/// Unit of delegated work tracked by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub room_id: String,
    pub title: String,
    pub description: String,
    pub domain: String,
    /// 1 (highest) .. 5 (lowest).
    pub priority: u8,
    #[serde(default)]
    pub assigned_to: Option<String>,
    pub status: TaskStatus,
    pub created_at: String,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub completed_at: Option<String>,
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub parent_task_id: Option<String>,
    /// Task ids that must be COMPLETED before this one may start.
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    #[serde(default)]
    pub retry_count: u32,
}

impl Task {
    pub fn new(room_id: impl Into<String>, title: impl Into<String>, domain: impl Into<String>) -> Self {
        Task {
            id: uuid::Uuid::new_v4().to_string(),
            room_id: room_id.into(),
            title: title.into(),
            description: String::new(),
            domain: domain.into(),
            priority: 3,
            assigned_to: None,
            status: TaskStatus::Pending,
            created_at: chrono::Utc::now().to_rfc3339(),
            started_at: None,
            completed_at: None,
            due_date: None,
            requirements: Vec::new(),
            constraints: Vec::new(),
            result: None,
            confidence: None,
            parent_task_id: None,
            depends_on: BTreeSet::new(),
            retry_count: 0,
        }
    }
}

// ── Inter-bot bus ──────────────────────────────────────────────────────────

/// Broadcast recipient on the bus.
pub const TEAM_RECIPIENT: &str = "team";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BotMessageKind {
    Query,
    Info,
    Response,
    Task,
    Escalation,
    Discussion,
}

impl BotMessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BotMessageKind::Query => "query",
            BotMessageKind::Info => "info",
            BotMessageKind::Response => "response",
            BotMessageKind::Task => "task",
            BotMessageKind::Escalation => "escalation",
            BotMessageKind::Discussion => "discussion",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "query" => Some(BotMessageKind::Query),
            "info" => Some(BotMessageKind::Info),
            "response" => Some(BotMessageKind::Response),
            "task" => Some(BotMessageKind::Task),
            "escalation" => Some(BotMessageKind::Escalation),
            "discussion" => Some(BotMessageKind::Discussion),
            _ => None,
        }
    }
}

/// Envelope on the inter-bot message bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotMessage {
    pub id: String,
    pub sender: String,
    /// A bot name, or `TEAM_RECIPIENT` for broadcast.
    pub recipient: String,
    pub kind: BotMessageKind,
    pub content: String,
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
    pub conversation_id: String,
    pub timestamp: String,
    #[serde(default)]
    pub response_to: Option<String>,
}

impl BotMessage {
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        kind: BotMessageKind,
        content: impl Into<String>,
        conversation_id: impl Into<String>,
    ) -> Self {
        BotMessage {
            id: uuid::Uuid::new_v4().to_string(),
            sender: sender.into(),
            recipient: recipient.into(),
            kind,
            content: content.into(),
            context: HashMap::new(),
            conversation_id: conversation_id.into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            response_to: None,
        }
    }

    /// A `response` must reference the message it answers and stay in the
    /// same conversation.
    pub fn validate(&self) -> EngineResult<()> {
        if self.kind == BotMessageKind::Response && self.response_to.is_none() {
            return Err(EngineError::user(format!(
                "bot response from '{}' missing response_to",
                self.sender
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_state_machine_edges() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Assigned));
        assert!(Assigned.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Completed));
        assert!(Blocked.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(InProgress));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!InProgress.can_transition_to(Assigned));
    }

    #[test]
    fn direct_room_needs_two_participants() {
        let room = Room {
            id: "dm:user".into(),
            kind: RoomKind::Direct,
            owner: "user".into(),
            participants: vec!["user".into(), "leader".into()],
            created_at: chrono::Utc::now().to_rfc3339(),
            summary: String::new(),
            policy: RoomPolicy::default(),
            deadline: None,
            artifact_chain: vec![],
            last_activity: None,
        };
        assert!(room.validate("leader").is_ok());

        let mut bad = room.clone();
        bad.participants.push("coder".into());
        assert!(bad.validate("leader").is_err());
    }

    #[test]
    fn response_requires_response_to() {
        let mut m = BotMessage::new("coder", "leader", BotMessageKind::Response, "done", "conv-1");
        assert!(m.validate().is_err());
        m.response_to = Some("msg-0".into());
        assert!(m.validate().is_ok());
    }

    #[test]
    fn escalation_threshold_ordering() {
        assert!(EscalationThreshold::High.min_confidence() > EscalationThreshold::Medium.min_confidence());
    }
}
