// Aviary Engine — Coordinator
// The leader bot's elevated-authority brain: analyze an inbound turn, route
// simple single-domain work to one bot, decompose multi-domain work into a
// dependency-aware plan, and track the per-room state machine:
//
//   IDLE → ANALYZING → ROUTE_TO_BOT | TASK_DECOMPOSITION → DELEGATING
//        → MONITORING → ASSEMBLING_RESULTS | ERROR_HANDLING | ESCALATING
//        → PRESENTING → IDLE
//
// The dispatcher owns execution (invocations, announcements); decisions and
// state live here.

use crate::atoms::error::EngineResult;
use crate::atoms::memory_types::Event;
use crate::atoms::room_types::Room;
use crate::atoms::types::{BotProfile, ChatRequest, ComplexityTier, Message};
use crate::engine::agent_loop::classify_complexity;
use crate::engine::orchestrator::{PlannedTask, TaskPlan};
use crate::engine::providers::AnyProvider;
use crate::engine::store::MemoryStore;
use log::{info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

// ── State machine ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    Analyzing,
    RouteToBot,
    TaskDecomposition,
    Delegating,
    Monitoring,
    AssemblingResults,
    ErrorHandling,
    Retrying,
    Escalating,
    Presenting,
}

impl CoordinatorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoordinatorState::Idle => "IDLE",
            CoordinatorState::Analyzing => "ANALYZING",
            CoordinatorState::RouteToBot => "ROUTE_TO_BOT",
            CoordinatorState::TaskDecomposition => "TASK_DECOMPOSITION",
            CoordinatorState::Delegating => "DELEGATING",
            CoordinatorState::Monitoring => "MONITORING",
            CoordinatorState::AssemblingResults => "ASSEMBLING_RESULTS",
            CoordinatorState::ErrorHandling => "ERROR_HANDLING",
            CoordinatorState::Retrying => "RETRYING",
            CoordinatorState::Escalating => "ESCALATING",
            CoordinatorState::Presenting => "PRESENTING",
        }
    }

    fn can_transition_to(&self, next: CoordinatorState) -> bool {
        use CoordinatorState::*;
        matches!(
            (self, next),
            (Idle, Analyzing)
                | (Analyzing, RouteToBot)
                | (Analyzing, TaskDecomposition)
                | (Analyzing, Escalating)
                | (RouteToBot, Idle)
                | (TaskDecomposition, Delegating)
                | (Delegating, Monitoring)
                | (Monitoring, AssemblingResults)
                | (Monitoring, ErrorHandling)
                | (Monitoring, Escalating)
                | (AssemblingResults, Presenting)
                | (ErrorHandling, Retrying)
                | (ErrorHandling, Escalating)
                | (Retrying, Monitoring)
                | (Retrying, Escalating)
                | (Escalating, Idle)
                | (Presenting, Idle)
        )
    }
}

/// What ANALYZING decided for one inbound turn.
#[derive(Debug, Clone)]
pub enum Decision {
    /// Single domain, low complexity: one bot handles it directly.
    Route { bot: String },
    /// Multi-domain or high complexity: a dependency-aware plan.
    Plan(TaskPlan),
    /// A user-provided rule matched — no autonomous action this turn.
    Escalate { reason: String },
}

pub struct Coordinator {
    provider: Arc<AnyProvider>,
    model: String,
    roster: Vec<BotProfile>,
    leader: String,
    /// User-provided substrings that always force escalation.
    escalation_rules: Vec<String>,
    states: Mutex<HashMap<String, CoordinatorState>>,
}

impl Coordinator {
    pub fn new(
        provider: Arc<AnyProvider>,
        model: &str,
        roster: Vec<BotProfile>,
        escalation_rules: Vec<String>,
    ) -> Self {
        let leader = roster
            .iter()
            .find(|b| b.is_leader())
            .map(|b| b.name.clone())
            .unwrap_or_else(|| "leader".to_string());
        Coordinator {
            provider,
            model: model.to_string(),
            roster,
            leader,
            escalation_rules,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn state(&self, room_id: &str) -> CoordinatorState {
        self.states.lock().get(room_id).copied().unwrap_or(CoordinatorState::Idle)
    }

    /// Advance the room's state machine, warning on (and refusing) edges
    /// the machine does not have.
    pub fn transition(&self, room_id: &str, next: CoordinatorState) {
        let mut states = self.states.lock();
        let current = states.get(room_id).copied().unwrap_or(CoordinatorState::Idle);
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            warn!(
                "[coordinator] {}: illegal transition {} -> {} (forcing through IDLE)",
                room_id,
                current.as_str(),
                next.as_str()
            );
            states.insert(room_id.to_string(), CoordinatorState::Idle);
            return;
        }
        info!("[coordinator] {}: {} -> {}", room_id, current.as_str(), next.as_str());
        states.insert(room_id.to_string(), next);
    }

    pub fn leader_name(&self) -> &str {
        &self.leader
    }

    // ── Analysis ───────────────────────────────────────────────────────

    /// ANALYZING: escalate on a matching user rule, else route or decompose.
    pub async fn analyze(&self, store: &MemoryStore, room: &Room, event: &Event) -> EngineResult<Decision> {
        self.transition(&room.id, CoordinatorState::Analyzing);

        let lower = event.content.to_lowercase();
        if let Some(rule) = self
            .escalation_rules
            .iter()
            .find(|rule| !rule.is_empty() && lower.contains(&rule.to_lowercase()))
        {
            self.transition(&room.id, CoordinatorState::Escalating);
            return Ok(Decision::Escalate {
                reason: format!("matches your escalation rule '{}'", rule),
            });
        }

        let tier = classify_complexity(&event.content);
        let domains = self.detect_domains(&event.content);

        if tier != ComplexityTier::Complex && domains.len() <= 1 {
            let domain = domains.first().cloned().unwrap_or_default();
            let bot = self.route_target(store, &domain)?;
            self.transition(&room.id, CoordinatorState::RouteToBot);
            return Ok(Decision::Route { bot });
        }

        self.transition(&room.id, CoordinatorState::TaskDecomposition);
        let plan = self.decompose(store, &event.content, &domains).await?;
        Ok(Decision::Plan(plan))
    }

    /// Domains the request touches, matched against the roster's claims
    /// plus a small keyword table.
    pub fn detect_domains(&self, text: &str) -> Vec<String> {
        const KEYWORDS: &[(&str, &[&str])] = &[
            ("research", &["research", "investigate", "competitor", "analyze", "sources", "compare"]),
            ("code", &["code", "implement", "bug", "function", "script", "parse", "refactor"]),
            ("writing", &["write", "draft", "blog", "copy", "naming"]),
            ("review", &["review", "audit", "verify", "proofread"]),
            ("communication", &["email", "schedule", "announce", "post", "reply"]),
            ("strategy", &["pricing", "strategy", "roadmap", "propose", "plan", "budget"]),
        ];
        let lower = text.to_lowercase();
        let mut domains = Vec::new();
        for (domain, words) in KEYWORDS {
            if words.iter().any(|w| lower.contains(w)) {
                domains.push(domain.to_string());
            }
        }
        domains
    }

    /// Best bot for a domain: recorded expertise first, then roster claims,
    /// then the leader itself.
    fn route_target(&self, store: &MemoryStore, domain: &str) -> EngineResult<String> {
        if domain.is_empty() {
            return Ok(self.leader.clone());
        }
        let names: Vec<String> = self.roster.iter().map(|b| b.name.clone()).collect();
        if let Some(best) = store.best_bot_for_domain(domain, &names)? {
            return Ok(best);
        }
        if let Some(claimer) = self
            .roster
            .iter()
            .find(|b| b.domains.iter().any(|d| d == domain))
        {
            return Ok(claimer.name.clone());
        }
        Ok(self.leader.clone())
    }

    /// Ask the model for a JSON plan; fall back to the sequential heuristic
    /// when the reply does not parse. Either way the plan is validated
    /// (cycles are construction-time errors).
    async fn decompose(&self, store: &MemoryStore, content: &str, domains: &[String]) -> EngineResult<TaskPlan> {
        let roster_line = self
            .roster
            .iter()
            .map(|b| format!("{} ({})", b.name, b.domains.join("/")))
            .collect::<Vec<_>>()
            .join(", ");
        let prompt = format!(
            "Decompose this request into delegated tasks.\nRequest: {}\nBots: {}\n\
             Reply with ONLY a JSON array: \
             [{{\"title\":...,\"domain\":...,\"assignee\":...,\"depends_on\":[indices]}}]",
            content, roster_line
        );
        let response = self
            .provider
            .chat(ChatRequest {
                model: self.model.clone(),
                system: "You are a task planner. JSON only, no prose.".into(),
                messages: vec![Message::user(prompt)],
                tools: vec![],
                tool_choice: None,
                temperature: Some(0.1),
                max_tokens: Some(600),
            })
            .await;

        let plan = match response {
            Ok(reply) => parse_plan_json(&reply.message),
            Err(e) => {
                warn!("[coordinator] Decomposition call failed ({}), using heuristic", e);
                None
            }
        };
        let mut plan = match plan {
            Some(plan) => plan,
            None => self.heuristic_plan(content, domains),
        };

        // Fill assignees the model left empty.
        for task in plan.tasks.iter_mut() {
            if task.assignee.is_none() {
                task.assignee = Some(self.route_target(store, &task.domain)?);
            }
        }
        plan.validate()?;
        Ok(plan)
    }

    /// Sequential fallback: split on step connectives, one task per part,
    /// each depending on the previous.
    fn heuristic_plan(&self, content: &str, domains: &[String]) -> TaskPlan {
        let lower = content.to_lowercase();
        let parts: Vec<&str> = if lower.contains(" then ") {
            split_on_then(content)
        } else {
            vec![content]
        };
        let mut tasks = Vec::new();
        for (i, part) in parts.iter().enumerate() {
            let part_domains = self.detect_domains(part);
            let domain = part_domains
                .first()
                .or(domains.first())
                .cloned()
                .unwrap_or_else(|| "general".into());
            tasks.push(PlannedTask {
                title: part.trim().to_string(),
                description: String::new(),
                domain,
                assignee: None,
                depends_on: if i == 0 { vec![] } else { vec![i - 1] },
                priority: 3,
            });
        }
        TaskPlan { tasks }
    }
}

/// Case-preserving split on the word "then" (with optional comma/and).
fn split_on_then(content: &str) -> Vec<&str> {
    let lower = content.to_lowercase();
    let Some(idx) = lower.find(" then ") else { return vec![content] };
    let first = content[..idx].trim_end_matches([',', ';']);
    let rest = &content[idx + " then ".len()..];
    vec![first, rest]
}

fn parse_plan_json(reply: &str) -> Option<TaskPlan> {
    // Tolerate code fences and prose around the array.
    let start = reply.find('[')?;
    let end = reply.rfind(']')?;
    if end <= start {
        return None;
    }
    let tasks: Vec<PlannedTask> = serde_json::from_str(&reply[start..=end]).ok()?;
    if tasks.is_empty() {
        return None;
    }
    let plan = TaskPlan { tasks };
    plan.validate().ok()?;
    Some(plan)
}
