// Aviary Engine — Bot Dispatcher
// Parses @bot / #room mentions, routes each inbound event to the leader or
// a specialist, and owns fire-and-forget invocation: a delegated bot runs
// in its own background session and its result is announced back into the
// originating room. The dispatcher is also the broker's RoomHandler — the
// single entry point for everything a room receives.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::memory_types::{Direction, Event, EventKind};
use crate::atoms::room_types::{BotMessage, BotMessageKind, Room, Task, TaskStatus};
use crate::atoms::types::{truncate_utf8, BotProfile, ComplexityTier};
use crate::engine::agent_loop::{classify_complexity, AgentLoop, Directive, TurnOptions, TurnOutput};
use crate::engine::audit::AuditLog;
use crate::engine::broker::{RoomHandler, TurnSignal};
use crate::engine::coordinator::{Coordinator, CoordinatorState, Decision};
use crate::engine::orchestrator;
use crate::engine::rooms::RoomManager;
use crate::engine::store::MemoryStore;
use log::{info, warn};
use parking_lot::Mutex;
use regex::Regex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Weak};
use std::time::Duration;

/// Delivery callback into the channel layer: (room_id, text).
pub type Announcer = Arc<dyn Fn(&str, &str) + Send + Sync>;

static MENTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@([A-Za-z][A-Za-z0-9_-]*)").unwrap());
static ROOM_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"#([A-Za-z0-9][\w-]*)").unwrap());

/// Legacy aliases for the coordinating bot.
const LEADER_ALIASES: &[&str] = &["leader", "coordinator", "nanobot"];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedMentions {
    pub bots: Vec<String>,
    pub rooms: Vec<String>,
}

pub struct Dispatcher {
    roster: Vec<BotProfile>,
    rooms: Arc<RoomManager>,
    store: Arc<MemoryStore>,
    agent_loop: Arc<AgentLoop>,
    coordinator: Arc<Coordinator>,
    audit: Arc<AuditLog>,
    announcer: Announcer,
    /// Live background invocations per bot, bounding fan-out.
    active: Mutex<HashMap<String, usize>>,
    task_max_retries: u32,
    /// Self-handle for spawning background runs (set at construction).
    me: Weak<Dispatcher>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        roster: Vec<BotProfile>,
        rooms: Arc<RoomManager>,
        store: Arc<MemoryStore>,
        agent_loop: Arc<AgentLoop>,
        coordinator: Arc<Coordinator>,
        audit: Arc<AuditLog>,
        announcer: Announcer,
        task_max_retries: u32,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Dispatcher {
            roster,
            rooms,
            store,
            agent_loop,
            coordinator,
            audit,
            announcer,
            active: Mutex::new(HashMap::new()),
            task_max_retries,
            me: me.clone(),
        })
    }

    fn profile(&self, name: &str) -> Option<&BotProfile> {
        self.roster.iter().find(|b| b.name == name)
    }

    fn leader(&self) -> &BotProfile {
        self.profile(self.coordinator.leader_name())
            .unwrap_or(&self.roster[0])
    }

    // ── Mention parsing ────────────────────────────────────────────────

    /// `@name` / `#room` tokens, validated against the roster. Leader
    /// aliases collapse onto the leader; an unknown bot is a user error.
    pub fn parse_mentions(&self, text: &str) -> EngineResult<ParsedMentions> {
        let mut parsed = ParsedMentions::default();
        for cap in MENTION_RE.captures_iter(text) {
            let raw = cap[1].to_lowercase();
            let name = if LEADER_ALIASES.contains(&raw.as_str()) {
                self.coordinator.leader_name().to_string()
            } else {
                raw.clone()
            };
            if self.profile(&name).is_none() {
                return Err(EngineError::user(format!("unknown bot @{}", raw)));
            }
            if !parsed.bots.contains(&name) {
                parsed.bots.push(name);
            }
        }
        for cap in ROOM_RE.captures_iter(text) {
            let room = format!("#{}", &cap[1]);
            if !parsed.rooms.contains(&room) {
                parsed.rooms.push(room);
            }
        }
        Ok(parsed)
    }

    // ── Inbound routing ────────────────────────────────────────────────

    pub async fn handle_inbound(
        &self,
        room_id: &str,
        event: Event,
        cancel: TurnSignal,
    ) -> EngineResult<()> {
        let Some(room) = self.rooms.get(room_id)? else {
            return Err(EngineError::user(format!("unknown room '{}'", room_id)));
        };
        self.rooms.touch_activity(room_id).ok();

        let mentions = match self.parse_mentions(&event.content) {
            Ok(mentions) => mentions,
            Err(e) => {
                // User errors surface verbatim in the room, never retried.
                self.post_to_room(&room, &event, self.leader(), &e.to_string())?;
                return Ok(());
            }
        };

        match mentions.bots.len() {
            0 => {
                let complex = classify_complexity(&event.content) == ComplexityTier::Complex;
                if room.policy.coordinator_mode && complex {
                    self.coordinate(&room, &event, &cancel).await
                } else {
                    self.run_routed_turn(self.leader().name.clone(), &room, &event, &cancel).await
                }
            }
            1 => {
                let target = mentions.bots[0].clone();
                if target == self.coordinator.leader_name() {
                    self.run_routed_turn(target, &room, &event, &cancel).await
                } else {
                    // Single specialist mention: fire-and-forget invoke with
                    // an immediate leader acknowledgement.
                    self.post_to_room(
                        &room,
                        &event,
                        self.leader(),
                        &format!("@{} is on the task — I'll announce the result here.", target),
                    )?;
                    self.invoke(&room, &target, &event.content, vec![], vec![], self.leader().name.clone())?;
                    Ok(())
                }
            }
            _ => {
                // Leader invokes each mentioned bot in turn.
                let names = mentions
                    .bots
                    .iter()
                    .map(|b| format!("@{}", b))
                    .collect::<Vec<_>>()
                    .join(", ");
                self.post_to_room(
                    &room,
                    &event,
                    self.leader(),
                    &format!("Fanning this out to {} — results will be announced here.", names),
                )?;
                for bot in mentions.bots {
                    self.invoke(&room, &bot, &event.content, vec![], vec![], self.leader().name.clone())?;
                }
                Ok(())
            }
        }
    }

    /// Run a full agent turn for one bot and deliver its answer, then fire
    /// any delegation directives the turn collected.
    async fn run_routed_turn(
        &self,
        bot_name: String,
        room: &Room,
        event: &Event,
        cancel: &TurnSignal,
    ) -> EngineResult<()> {
        let bot = self
            .profile(&bot_name)
            .ok_or_else(|| EngineError::user(format!("unknown bot @{}", bot_name)))?
            .clone();
        let output = self
            .agent_loop
            .run_turn(&bot, room, event, &TurnOptions::default(), cancel)
            .await?;
        (self.announcer)(&room.id, &output.text);
        self.fire_directives(room, &bot, &output)?;
        Ok(())
    }

    fn fire_directives(&self, room: &Room, bot: &BotProfile, output: &TurnOutput) -> EngineResult<()> {
        for directive in &output.directives {
            let Directive::Delegate { bot: target, task, expected_outputs, input_artifacts } = directive;
            if self.profile(target).is_none() {
                warn!("[dispatcher] Directive names unknown bot '{}', dropping", target);
                continue;
            }
            self.invoke(
                room,
                target,
                task,
                expected_outputs.clone(),
                input_artifacts.clone(),
                bot.name.clone(),
            )?;
        }
        Ok(())
    }

    // ── Coordinator flow ───────────────────────────────────────────────

    async fn coordinate(&self, room: &Room, event: &Event, cancel: &TurnSignal) -> EngineResult<()> {
        match self.coordinator.analyze(&self.store, room, event).await? {
            Decision::Escalate { reason } => {
                let mut escalation = Event::new(
                    event.channel.clone(),
                    Direction::Internal,
                    EventKind::Escalation,
                    reason.clone(),
                    event.session_key.clone(),
                )
                .with_parent(event.id.clone())
                .with_bot(self.leader().name.clone(), "leader");
                escalation.metadata.insert("room_id".into(), json!(room.id));
                self.store.append_event(&mut escalation)?;
                self.audit.record("escalation", self.coordinator.leader_name(), &reason).ok();
                self.post_to_room(
                    room,
                    event,
                    self.leader(),
                    &format!("Holding off — this {}; please confirm how to proceed.", reason),
                )?;
                self.coordinator.transition(&room.id, CoordinatorState::Idle);
                Ok(())
            }
            Decision::Route { bot } => {
                let result = self.run_routed_turn(bot, room, event, cancel).await;
                self.coordinator.transition(&room.id, CoordinatorState::Idle);
                result
            }
            Decision::Plan(plan) => {
                let created = orchestrator::create_plan(&self.store, &room.id, &plan)?;

                // Coordination event: the plan is part of the record.
                let titles: Vec<String> =
                    created.iter().map(|t| format!("{} [{}]", t.title, t.domain)).collect();
                let mut coordination = Event::new(
                    event.channel.clone(),
                    Direction::Internal,
                    EventKind::Coordination,
                    format!("plan: {}", titles.join("; ")),
                    event.session_key.clone(),
                )
                .with_parent(event.id.clone())
                .with_bot(self.leader().name.clone(), "leader");
                coordination.metadata.insert("room_id".into(), json!(room.id));
                coordination
                    .metadata
                    .insert("task_ids".into(), json!(created.iter().map(|t| t.id.clone()).collect::<Vec<_>>()));
                self.store.append_event(&mut coordination)?;

                self.coordinator.transition(&room.id, CoordinatorState::Delegating);
                self.post_to_room(
                    room,
                    event,
                    self.leader(),
                    &format!("Breaking this into {} tasks: {}", created.len(), titles.join("; ")),
                )?;
                self.dispatch_ready(room)?;
                self.coordinator.transition(&room.id, CoordinatorState::Monitoring);
                Ok(())
            }
        }
    }

    /// Start every ready task whose assignee has free capacity.
    fn dispatch_ready(&self, room: &Room) -> EngineResult<usize> {
        let ready = orchestrator::ready_tasks(&self.store, &room.id)?;
        let mut started = 0usize;
        for task in ready {
            let bot_name = match &task.assigned_to {
                Some(bot) => bot.clone(),
                None => {
                    let names: Vec<String> = self.roster.iter().map(|b| b.name.clone()).collect();
                    self.store
                        .best_bot_for_domain(&task.domain, &names)?
                        .unwrap_or_else(|| self.leader().name.clone())
                }
            };
            let Some(profile) = self.profile(&bot_name) else { continue };
            if !self.try_reserve(&bot_name, profile.max_concurrent_tasks) {
                continue; // stays PENDING/ASSIGNED; re-checked when a slot frees
            }
            if task.status == TaskStatus::Pending {
                if let Err(e) = self.store.assign_task(&task.id, &bot_name) {
                    self.release(&bot_name);
                    return Err(e);
                }
            }
            self.spawn_task_run(room.clone(), task.id.clone(), bot_name);
            started += 1;
        }
        Ok(started)
    }

    // ── Fire-and-forget invocation ─────────────────────────────────────

    /// Create a task for `bot` and run it in the background. The caller
    /// does not await; the result is announced in the room when it lands.
    pub fn invoke(
        &self,
        room: &Room,
        bot: &str,
        task_description: &str,
        expected_outputs: Vec<String>,
        input_artifacts: Vec<String>,
        triggered_by: String,
    ) -> EngineResult<String> {
        let profile = self
            .profile(bot)
            .ok_or_else(|| EngineError::user(format!("unknown bot @{}", bot)))?;

        let domain = self
            .coordinator
            .detect_domains(task_description)
            .first()
            .cloned()
            .unwrap_or_else(|| profile.domains.first().cloned().unwrap_or_else(|| "general".into()));

        let mut task = Task::new(&room.id, task_description, &domain);
        task.description = task_description.to_string();
        if !expected_outputs.is_empty() {
            task.requirements = expected_outputs;
        }
        if !input_artifacts.is_empty() {
            task.constraints = input_artifacts.iter().map(|a| format!("input:{}", a)).collect();
        }
        self.store.insert_task(&task)?;
        self.store.assign_task(&task.id, bot)?;
        self.audit
            .record("delegation", &triggered_by, &format!("{} -> {} in {}", task.title, bot, room.id))
            .ok();

        if self.try_reserve(bot, profile.max_concurrent_tasks) {
            self.spawn_task_run(room.clone(), task.id.clone(), bot.to_string());
        } else {
            info!("[dispatcher] {} at capacity; task '{}' queued", bot, task.title);
        }
        Ok(task.id)
    }

    fn try_reserve(&self, bot: &str, max: usize) -> bool {
        let mut active = self.active.lock();
        let count = active.entry(bot.to_string()).or_insert(0);
        if *count >= max {
            return false;
        }
        *count += 1;
        true
    }

    fn release(&self, bot: &str) {
        let mut active = self.active.lock();
        if let Some(count) = active.get_mut(bot) {
            *count = count.saturating_sub(1);
        }
    }

    fn spawn_task_run(&self, room: Room, task_id: String, bot_name: String) {
        let Some(dispatcher) = self.me.upgrade() else { return };
        tokio::spawn(async move {
            if let Err(e) = dispatcher.run_task(&room, &task_id, &bot_name).await {
                warn!("[dispatcher] Task {} run failed: {}", task_id, e);
            }
            dispatcher.release(&bot_name);
            // A freed slot or a completed dependency may unblock more work.
            if let Err(e) = dispatcher.after_task(&room) {
                warn!("[dispatcher] Post-task bookkeeping failed: {}", e);
            }
        });
    }

    /// One delegated task: its own session, retries with backoff, then the
    /// bot_message + room announcement.
    async fn run_task(&self, room: &Room, task_id: &str, bot_name: &str) -> EngineResult<()> {
        let Some(task) = self.store.get_task(task_id)? else {
            return Err(EngineError::user(format!("task {} vanished", task_id)));
        };
        let bot = self
            .profile(bot_name)
            .ok_or_else(|| EngineError::user(format!("unknown bot @{}", bot_name)))?
            .clone();

        self.store.transition_task(task_id, TaskStatus::InProgress, None, None)?;

        // Context packet: the task text plus referenced artifacts only —
        // never the room's history.
        let mut packet = task.description.clone();
        let artifact_inputs: Vec<&str> = task
            .constraints
            .iter()
            .filter_map(|c| c.strip_prefix("input:"))
            .collect();
        if !artifact_inputs.is_empty() {
            packet.push_str("\n\nInput artifacts (read with artifact_get):\n");
            for path in &artifact_inputs {
                packet.push_str(&format!("- {}\n", path));
            }
        }

        let mut session_event = Event::new(
            "internal",
            Direction::Internal,
            EventKind::Message,
            packet,
            format!("task:{}", task_id),
        );
        session_event.metadata.insert("room_id".into(), json!(room.id));
        session_event.metadata.insert("task_id".into(), json!(task_id));
        self.store.append_event(&mut session_event)?;

        // Retry loop: transient failures back off exponentially. Delegated
        // turns run at the task's confidence — guarded tools measure it
        // against the room's escalation threshold.
        let options = TurnOptions { confirmed: false, confidence: task.confidence.unwrap_or(0.6) };
        let mut attempt = 0u32;
        let outcome = loop {
            let signal = TurnSignal::new();
            match self
                .agent_loop
                .run_turn(&bot, room, &session_event, &options, &signal)
                .await
            {
                Ok(output) => break Ok(output),
                Err(e) if e.is_retryable() && attempt < self.task_max_retries => {
                    attempt = self.store.bump_task_retry(task_id)?;
                    let backoff = Duration::from_secs(2u64.pow(attempt.min(6)));
                    warn!(
                        "[dispatcher] Task '{}' attempt {} failed ({}), retrying in {:?}",
                        task.title, attempt, e, backoff
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => break Err(e),
            }
        };

        match outcome {
            Ok(output) => {
                // Expected outputs present? Otherwise the invocation is
                // PARTIAL, not DONE.
                let missing: Vec<&String> = task
                    .requirements
                    .iter()
                    .filter(|key| !output.text.contains(key.as_str()))
                    .collect();
                let status = if missing.is_empty() { "done" } else { "partial" };

                self.store
                    .transition_task(task_id, TaskStatus::Completed, Some(&output.text), Some(0.8))?;
                let task = self.store.get_task(task_id)?.unwrap_or(task);
                orchestrator::on_task_terminated(&self.store, &task, true)?;
                self.record_completion(room, &task, &bot, &output.text, status)?;
            }
            Err(e) => {
                self.store
                    .transition_task(task_id, TaskStatus::Failed, Some(&e.to_string()), None)?;
                let task = self.store.get_task(task_id)?.unwrap_or(task);
                orchestrator::on_task_terminated(&self.store, &task, false)?;
                self.handle_task_failure(room, &task)?;
            }
        }
        Ok(())
    }

    /// Durable bot_message + the `[Bot @X completed]` room announcement.
    fn record_completion(
        &self,
        room: &Room,
        task: &Task,
        bot: &BotProfile,
        result: &str,
        status: &str,
    ) -> EngineResult<()> {
        let summary = truncate_utf8(result, 600);
        let mut bus = BotMessage::new(
            bot.name.clone(),
            self.coordinator.leader_name(),
            BotMessageKind::Response,
            summary,
            format!("room:{}", room.id),
        );
        bus.response_to = Some(task.id.clone());
        bus.context.insert("status".into(), json!(status));
        self.store.insert_bot_message(&bus)?;

        let mut event = Event::new(
            "internal",
            Direction::Internal,
            EventKind::BotMessage,
            format!("Task: {}. Result: {}", task.title, summary),
            crate::engine::rooms::RoomManager::session_key("internal", &room.id),
        )
        .with_bot(bot.name.clone(), bot.role.clone());
        event.metadata.insert("triggered_by".into(), json!(self.coordinator.leader_name()));
        event.metadata.insert("room_id".into(), json!(room.id));
        event.metadata.insert("task_id".into(), json!(task.id));
        event.metadata.insert("status".into(), json!(status));
        self.store.append_event(&mut event)?;

        let announcement = format!(
            "[Bot @{} completed] Task: {}. Result: {}",
            bot.name,
            task.title,
            truncate_utf8(result, 400)
        );
        (self.announcer)(&room.id, &announcement);
        Ok(())
    }

    /// Terminal failure: try an alternate bot once by expertise, else
    /// escalate to the user.
    fn handle_task_failure(&self, room: &Room, task: &Task) -> EngineResult<()> {
        self.coordinator.transition(&room.id, CoordinatorState::ErrorHandling);
        let roster: Vec<String> = self.roster.iter().map(|b| b.name.clone()).collect();
        let already_respawned = task.parent_task_id.is_some();

        if !already_respawned {
            if let Some(alternate) = orchestrator::alternate_bot(&self.store, task, &roster)? {
                self.coordinator.transition(&room.id, CoordinatorState::Retrying);
                let fresh = self.store.respawn_task(task, Some(&alternate))?;
                self.store.assign_task(&fresh.id, &alternate)?;
                (self.announcer)(
                    &room.id,
                    &format!("@{} couldn't finish '{}' — rerouting to @{}.",
                        task.assigned_to.as_deref().unwrap_or("?"), task.title, alternate),
                );
                if let Some(profile) = self.profile(&alternate) {
                    if self.try_reserve(&alternate, profile.max_concurrent_tasks) {
                        self.spawn_task_run(room.clone(), fresh.id.clone(), alternate);
                    }
                }
                self.coordinator.transition(&room.id, CoordinatorState::Monitoring);
                return Ok(());
            }
        }

        self.coordinator.transition(&room.id, CoordinatorState::Escalating);
        let mut escalation = Event::new(
            "internal",
            Direction::Internal,
            EventKind::Escalation,
            format!("Task '{}' failed with no alternate bot: {}", task.title,
                task.result.as_deref().unwrap_or("no detail")),
            crate::engine::rooms::RoomManager::session_key("internal", &room.id),
        )
        .with_bot(self.coordinator.leader_name().to_string(), "leader");
        escalation.metadata.insert("room_id".into(), json!(room.id));
        escalation.metadata.insert("task_id".into(), json!(task.id));
        self.store.append_event(&mut escalation)?;
        self.audit
            .record("escalation", self.coordinator.leader_name(), &format!("task '{}' failed", task.title))
            .ok();
        (self.announcer)(
            &room.id,
            &format!("I need your input: task '{}' failed and no other bot covers '{}'.",
                task.title, task.domain),
        );
        self.coordinator.transition(&room.id, CoordinatorState::Idle);
        Ok(())
    }

    /// After any task run: unblock dependents, start newly ready work, and
    /// when everything is terminal, assemble and present — unless two
    /// delegates disagree, which escalates instead.
    fn after_task(&self, room: &Room) -> EngineResult<()> {
        orchestrator::reconcile_blocked(&self.store, &room.id)?;
        self.dispatch_ready(room)?;

        if self.coordinator.state(&room.id) == CoordinatorState::Monitoring
            && orchestrator::all_terminal(&self.store, &room.id)?
        {
            if let Some(reason) = orchestrator::detect_disagreement(&self.store, &room.id)? {
                self.coordinator.transition(&room.id, CoordinatorState::Escalating);
                let mut escalation = Event::new(
                    "internal",
                    Direction::Internal,
                    EventKind::Escalation,
                    reason.clone(),
                    crate::engine::rooms::RoomManager::session_key("internal", &room.id),
                )
                .with_bot(self.coordinator.leader_name().to_string(), "leader");
                escalation.metadata.insert("room_id".into(), json!(room.id));
                self.store.append_event(&mut escalation)?;
                self.audit.record("escalation", self.coordinator.leader_name(), &reason).ok();
                (self.announcer)(
                    &room.id,
                    &format!("The team disagrees: {}. I need your call before presenting.", reason),
                );
                self.coordinator.transition(&room.id, CoordinatorState::Idle);
                return Ok(());
            }
            self.coordinator.transition(&room.id, CoordinatorState::AssemblingResults);
            let assembled = orchestrator::assemble_results(&self.store, &room.id)?;
            self.coordinator.transition(&room.id, CoordinatorState::Presenting);
            (self.announcer)(&room.id, &format!("All tasks finished:\n{}", assembled));
            self.coordinator.transition(&room.id, CoordinatorState::Idle);
        }
        Ok(())
    }

    /// Leader-voice message into the room: an outbound event plus delivery.
    fn post_to_room(&self, room: &Room, inbound: &Event, bot: &BotProfile, text: &str) -> EngineResult<()> {
        let mut event = Event::new(
            inbound.channel.clone(),
            Direction::Outbound,
            EventKind::Message,
            text.to_string(),
            inbound.session_key.clone(),
        )
        .with_parent(inbound.id.clone())
        .with_bot(bot.name.clone(), bot.role.clone());
        event.metadata.insert("room_id".into(), json!(room.id));
        self.store.append_event(&mut event)?;
        (self.announcer)(&room.id, text);
        Ok(())
    }
}

#[async_trait::async_trait]
impl RoomHandler for Dispatcher {
    async fn handle(&self, room_id: &str, event: Event, cancel: TurnSignal) -> EngineResult<()> {
        self.handle_inbound(room_id, event, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::config::default_roster;
    use crate::engine::providers::{AnyProvider, ScriptedProvider};

    fn dispatcher_for_parsing() -> Arc<Dispatcher> {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::open_in_memory().unwrap());
        let rooms = Arc::new(
            RoomManager::new(
                Arc::clone(&store),
                dir.path(),
                crate::engine::config::RoomsSection::default(),
                "leader",
            )
            .unwrap(),
        );
        let provider = Arc::new(AnyProvider::Scripted(ScriptedProvider::new()));
        let embedder = Arc::new(crate::engine::embedder::EmbedderStack::hash(32));
        let artifacts = Arc::new(crate::engine::artifacts::ArtifactStore::new(dir.path()).unwrap());
        let audit = Arc::new(AuditLog::open(dir.path()).unwrap());
        let executor = Arc::new(crate::engine::tool_executor::ToolExecutor::new(
            crate::engine::tools::ToolRegistry::new(),
            Arc::clone(&store),
            Arc::clone(&artifacts),
            Arc::clone(&rooms),
            Arc::clone(&embedder),
            Arc::clone(&audit),
            crate::engine::config::LearningConfig::default(),
            dir.path().to_path_buf(),
        ));
        let sidekicks = Arc::new(crate::engine::sidekick::SidekickOrchestrator::new(
            Arc::clone(&provider),
            artifacts,
            "model",
            3,
            6,
        ));
        let activity = Arc::new(crate::engine::background::ActivityTracker::new(
            std::time::Duration::from_secs(30),
        ));
        let agent_loop = Arc::new(AgentLoop::new(
            Arc::clone(&store),
            Arc::clone(&provider),
            executor,
            sidekicks,
            activity,
            Arc::clone(&audit),
            embedder,
            crate::engine::config::ContextConfig::default(),
            crate::engine::config::LearningConfig::default(),
            "model",
        ));
        let coordinator = Arc::new(Coordinator::new(Arc::clone(&provider), "model", default_roster(), vec![]));
        // Leak the tempdir so the fixture outlives this constructor.
        std::mem::forget(dir);
        Dispatcher::new(
            default_roster(),
            rooms,
            store,
            agent_loop,
            coordinator,
            audit,
            Arc::new(|_room: &str, _text: &str| {}),
            3,
        )
    }

    #[test]
    fn mention_parsing_with_aliases() {
        let d = dispatcher_for_parsing();
        let parsed = d.parse_mentions("@coder write a parser, then tell @nanobot in #general").unwrap();
        assert_eq!(parsed.bots, vec!["coder".to_string(), "leader".to_string()]);
        assert_eq!(parsed.rooms, vec!["#general".to_string()]);
    }

    #[test]
    fn unknown_bot_is_a_user_error() {
        let d = dispatcher_for_parsing();
        let err = d.parse_mentions("@nobody do things").unwrap_err();
        assert!(matches!(err, EngineError::User(_)));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn coordinator_alias_collapses() {
        let d = dispatcher_for_parsing();
        let parsed = d.parse_mentions("@coordinator plan this").unwrap();
        assert_eq!(parsed.bots, vec!["leader".to_string()]);
    }
}
