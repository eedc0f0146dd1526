// Aviary Engine — Agent Loop
// The core turn: assemble context → call the model → execute tool calls →
// repeat until a final message (bounded rounds) → emit outbound. Sidekick
// spawning and reflection injection happen inside the loop; delegation is
// collected as directives and fired after the turn by the dispatcher
// (fire-and-forget).

mod context;

pub use context::assemble;

use crate::atoms::error::EngineResult;
use crate::atoms::memory_types::{Direction, Event, EventKind, LearningSource, Sentiment};
use crate::atoms::room_types::Room;
use crate::atoms::types::{
    truncate_utf8, BotProfile, ChatRequest, ComplexityTier, Message, ToolCall,
};
use crate::engine::audit::AuditLog;
use crate::engine::background::ActivityTracker;
use crate::engine::broker::TurnSignal;
use crate::engine::config::{ContextConfig, LearningConfig};
use crate::engine::embedder::EmbedderStack;
use crate::engine::injection;
use crate::engine::learnings;
use crate::engine::providers::AnyProvider;
use crate::engine::sidekick::{SidekickOrchestrator, SidekickRequest};
use crate::engine::store::MemoryStore;
use crate::engine::tool_executor::{GuardDecision, ToolContext, ToolExecutor};
use log::{info, warn};
use serde_json::{json, Value};
use std::sync::Arc;

const MAX_TOOL_ITERATIONS: usize = 8;

/// Work the turn wants done after it finishes (fire-and-forget semantics:
/// the model already got its "delegated" answer inside the turn).
#[derive(Debug, Clone)]
pub enum Directive {
    Delegate {
        bot: String,
        task: String,
        expected_outputs: Vec<String>,
        input_artifacts: Vec<String>,
    },
}

#[derive(Debug, Clone)]
pub struct TurnOutput {
    pub text: String,
    pub outbound_event_id: String,
    pub directives: Vec<Directive>,
    /// Set when a guarded tool was escalated instead of executed.
    pub escalated: Option<String>,
}

/// Per-turn knobs the caller controls (the coordinator passes its task
/// confidence; connectors pass explicit confirmations through).
#[derive(Debug, Clone)]
pub struct TurnOptions {
    pub confirmed: bool,
    pub confidence: f64,
}

impl Default for TurnOptions {
    fn default() -> Self {
        TurnOptions { confirmed: false, confidence: 0.8 }
    }
}

pub struct AgentLoop {
    store: Arc<MemoryStore>,
    provider: Arc<AnyProvider>,
    executor: Arc<ToolExecutor>,
    sidekicks: Arc<SidekickOrchestrator>,
    activity: Arc<ActivityTracker>,
    audit: Arc<AuditLog>,
    context_cfg: ContextConfig,
    learning_cfg: LearningConfig,
    embedder: Arc<EmbedderStack>,
    model: String,
}

impl AgentLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<MemoryStore>,
        provider: Arc<AnyProvider>,
        executor: Arc<ToolExecutor>,
        sidekicks: Arc<SidekickOrchestrator>,
        activity: Arc<ActivityTracker>,
        audit: Arc<AuditLog>,
        embedder: Arc<EmbedderStack>,
        context_cfg: ContextConfig,
        learning_cfg: LearningConfig,
        model: &str,
    ) -> Self {
        AgentLoop {
            store,
            provider,
            executor,
            sidekicks,
            activity,
            audit,
            context_cfg,
            learning_cfg,
            embedder,
            model: model.to_string(),
        }
    }

    /// Run one full turn for bot `B` on a broker-dispatched inbound event.
    pub async fn run_turn(
        &self,
        bot: &BotProfile,
        room: &Room,
        inbound: &Event,
        options: &TurnOptions,
        cancel: &TurnSignal,
    ) -> EngineResult<TurnOutput> {
        // 1. Activity mark.
        if inbound.direction == Direction::Inbound {
            self.activity.pulse();
        }

        // Inbound injection scan: flagged content still gets answered, but
        // it cannot steer guarded tools autonomously this turn.
        let scan = injection::scan(&inbound.content);
        let confidence = if scan.blocks_autonomy() { 0.0 } else { options.confidence };

        // 2. Pure context assembly.
        let system = context::assemble(
            &self.store,
            &self.context_cfg,
            &self.learning_cfg,
            bot,
            room,
            inbound,
        )?;

        let tier = classify_complexity(&inbound.content);
        let tools = self.executor.registry.definitions_for(bot);
        let model = bot.model.clone().unwrap_or_else(|| self.model.clone());

        let mut messages = vec![Message::user(inbound.content.clone())];
        let mut directives: Vec<Directive> = Vec::new();
        let mut escalated: Option<String> = None;
        let mut final_text = String::new();
        let mut reasoning_content: Option<String> = None;
        let mut round = 0usize;

        // 3–5. Provider call + tool loop + reflection.
        loop {
            round += 1;
            if round > MAX_TOOL_ITERATIONS {
                warn!("[loop] Max tool rounds ({}) reached for {}", MAX_TOOL_ITERATIONS, bot.name);
                if final_text.is_empty() {
                    final_text = format!(
                        "I ran {} tool rounds without reaching a final answer; stopping here with \
                         what I have.",
                        MAX_TOOL_ITERATIONS
                    );
                }
                break;
            }

            cancel.checkpoint()?;
            let response = self
                .provider
                .chat(ChatRequest {
                    model: model.clone(),
                    system: system.clone(),
                    messages: messages.clone(),
                    tools: tools.clone(),
                    tool_choice: None,
                    temperature: None,
                    max_tokens: None,
                })
                .await?;
            cancel.checkpoint()?;

            if response.reasoning_content.is_some() {
                reasoning_content = response.reasoning_content.clone();
            }

            if !response.has_tool_calls() {
                final_text = response.message;
                break;
            }

            messages.push(Message {
                role: crate::atoms::types::Role::Assistant,
                content: response.message.clone(),
                tool_calls: Some(response.tool_calls.clone()),
                tool_call_id: None,
                name: None,
            });

            let mut reflect_after: Option<String> = None;
            for call in &response.tool_calls {
                cancel.checkpoint()?;
                let result_text = self
                    .handle_tool_call(
                        bot,
                        room,
                        inbound,
                        call,
                        confidence,
                        options.confirmed,
                        cancel,
                        &mut directives,
                        &mut escalated,
                    )
                    .await?;
                messages.push(Message::tool_result(
                    call.id.clone(),
                    call.function.name.clone(),
                    result_text,
                ));
                if bot.reasoning.should_reflect(&call.function.name, tier) {
                    reflect_after = Some(call.function.name.clone());
                }
            }

            if let Some(tool) = reflect_after {
                messages.push(Message::user(format!(
                    "Before answering, briefly check the {} result: does it actually support \
                     your next step? Correct course if not.",
                    tool
                )));
            }
        }

        if final_text.is_empty() {
            final_text = "I don't have a useful answer yet — could you rephrase or narrow the request?".into();
        }

        // 6. Emit: outbound event threaded to the inbound query.
        let mut outbound = Event::new(
            inbound.channel.clone(),
            Direction::Outbound,
            EventKind::Message,
            final_text.clone(),
            inbound.session_key.clone(),
        )
        .with_parent(inbound.id.clone())
        .with_bot(bot.name.clone(), bot.role.clone());
        outbound.metadata.insert("room_id".into(), json!(room.id));
        if let Some(reasoning) = reasoning_content {
            // Stored, never re-fed on later turns.
            outbound.metadata.insert("reasoning_content".into(), json!(reasoning));
        }
        if let Some(reason) = &escalated {
            outbound.metadata.insert("escalated".into(), json!(reason));
        }
        self.store.append_event(&mut outbound)?;

        // 7. Learning capture from explicit user sentiment.
        if inbound.direction == Direction::Inbound {
            self.capture_sentiment(bot, &inbound.content).await;
        }

        info!(
            "[loop] {} finished turn in {} ({} rounds, {} directives)",
            bot.name,
            room.id,
            round,
            directives.len()
        );
        Ok(TurnOutput { text: final_text, outbound_event_id: outbound.id, directives, escalated })
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_tool_call(
        &self,
        bot: &BotProfile,
        room: &Room,
        inbound: &Event,
        call: &ToolCall,
        confidence: f64,
        confirmed: bool,
        cancel: &TurnSignal,
        directives: &mut Vec<Directive>,
        escalated: &mut Option<String>,
    ) -> EngineResult<String> {
        let name = call.function.name.as_str();
        let args: Value = serde_json::from_str(&call.function.arguments).unwrap_or_else(|_| json!({}));

        match name {
            "spawn_sidekick" => {
                let request = SidekickRequest {
                    goal: args["goal"].as_str().unwrap_or_default().to_string(),
                    inputs: string_array(&args["inputs"]),
                    constraints: string_array(&args["constraints"]),
                    output_format: args["output_format"].as_str().unwrap_or_default().to_string(),
                };
                match self.sidekicks.run_batch(bot, &room.id, vec![request], cancel).await {
                    Ok(merge) => match merge.merged {
                        Some(text) => Ok(text),
                        None => Ok("All sidekicks failed; continue solo and note the fallback.".into()),
                    },
                    Err(e) => Ok(format!("Sidekick unavailable ({}); continue solo.", e)),
                }
            }
            "delegate_task" => {
                let target = args["bot"].as_str().unwrap_or_default().to_string();
                let task = args["task"].as_str().unwrap_or_default().to_string();
                if target.is_empty() || task.is_empty() {
                    return Ok("delegate_task needs both 'bot' and 'task'.".into());
                }
                self.audit
                    .record("delegation", &bot.name, &format!("{} -> {} in {}", task, target, room.id))
                    .ok();
                directives.push(Directive::Delegate {
                    bot: target.clone(),
                    task: task.clone(),
                    expected_outputs: string_array(&args["expected_outputs"]),
                    input_artifacts: string_array(&args["input_artifacts"]),
                });
                Ok(format!(
                    "Delegated to @{} — running in the background; the result will be announced \
                     in the room.",
                    target
                ))
            }
            "check_delegations" => {
                let tasks = self.store.room_tasks(&room.id)?;
                if tasks.is_empty() {
                    return Ok("No delegated tasks in this room.".into());
                }
                let lines: Vec<String> = tasks
                    .iter()
                    .map(|t| {
                        format!(
                            "- [{}] {} (assigned: {}){}",
                            t.status.as_str(),
                            t.title,
                            t.assigned_to.as_deref().unwrap_or("nobody"),
                            t.result
                                .as_deref()
                                .map(|r| format!(" result: {}", truncate_utf8(r, 120)))
                                .unwrap_or_default(),
                        )
                    })
                    .collect();
                Ok(lines.join("\n"))
            }
            _ => {
                // Guarded tools gate BEFORE any tool_call event exists.
                if let Some(spec) = self.executor.registry.get(name).cloned() {
                    let ctx = ToolContext {
                        bot,
                        room_id: &room.id,
                        session_key: &inbound.session_key,
                        channel: &inbound.channel,
                        confirmed,
                        confidence,
                        coordinator_mode: room.policy.coordinator_mode,
                        escalation_threshold: room.policy.escalation_threshold,
                        cancel,
                    };
                    if let GuardDecision::Escalate(reason) = self.executor.authority_check(&spec, &ctx) {
                        self.write_escalation(bot, room, inbound, &reason)?;
                        *escalated = Some(reason.clone());
                        return Ok(format!(
                            "Escalated to the user for confirmation ({}). Do not retry this tool; \
                             summarize the situation instead.",
                            reason
                        ));
                    }
                    let (outcome, _call_event_id) = self.executor.execute(&ctx, call).await?;
                    return Ok(outcome.value);
                }
                Ok(format!("Unknown tool '{}'.", name))
            }
        }
    }

    fn write_escalation(
        &self,
        bot: &BotProfile,
        room: &Room,
        inbound: &Event,
        reason: &str,
    ) -> EngineResult<()> {
        let mut event = Event::new(
            inbound.channel.clone(),
            Direction::Internal,
            EventKind::Escalation,
            reason.to_string(),
            inbound.session_key.clone(),
        )
        .with_parent(inbound.id.clone())
        .with_bot(bot.name.clone(), bot.role.clone());
        event.metadata.insert("room_id".into(), json!(room.id));
        self.store.append_event(&mut event)?;
        self.audit.record("escalation", &bot.name, reason).ok();
        Ok(())
    }

    /// Explicit user sentiment becomes a private learning for this bot.
    async fn capture_sentiment(&self, bot: &BotProfile, content: &str) {
        let lower = content.to_lowercase();
        let negative = ["actually i prefer", "that was wrong", "that's wrong", "don't do that", "stop doing"];
        let positive = ["perfect, thanks", "great job", "exactly right", "love that"];
        let sentiment = if negative.iter().any(|p| lower.contains(p)) {
            Some(Sentiment::Negative)
        } else if positive.iter().any(|p| lower.contains(p)) {
            Some(Sentiment::Positive)
        } else {
            None
        };
        let Some(sentiment) = sentiment else { return };

        let category = if lower.contains("prefer") { Some("user_preference") } else { None };
        if let Err(e) = learnings::capture(
            &self.store,
            &self.embedder,
            &self.learning_cfg,
            &bot.name,
            content,
            LearningSource::UserFeedback,
            sentiment,
            0.8,
            None,
            category,
        )
        .await
        {
            warn!("[loop] Could not capture feedback learning: {}", e);
        }
    }
}

fn string_array(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(|s| s.to_string())).collect())
        .unwrap_or_default()
}

/// Rough request complexity: drives reasoning-tier shifts and the
/// coordinator's route-vs-decompose choice.
pub fn classify_complexity(text: &str) -> ComplexityTier {
    let lower = text.to_lowercase();
    let words = text.split_whitespace().count();
    let multi_step = ["then", "after that", "first", "finally", "and also", "step"]
        .iter()
        .any(|m| lower.contains(m));
    let analytical = ["analyze", "compare", "research", "plan", "design", "propose", "evaluate"]
        .iter()
        .filter(|m| lower.contains(*m))
        .count();

    if words > 60 || (multi_step && analytical >= 1) || analytical >= 2 {
        ComplexityTier::Complex
    } else if words < 15 && !multi_step && analytical == 0 {
        ComplexityTier::Simple
    } else {
        ComplexityTier::Standard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complexity_tiers() {
        assert_eq!(classify_complexity("hi there"), ComplexityTier::Simple);
        assert_eq!(
            classify_complexity("Analyze our competitors and then propose pricing"),
            ComplexityTier::Complex
        );
        assert_eq!(
            classify_complexity(
                "Can you put together a short recap of the meeting notes from yesterday for the whole team please?"
            ),
            ComplexityTier::Standard
        );
    }

    #[test]
    fn string_array_handles_non_arrays() {
        assert!(string_array(&json!("nope")).is_empty());
        assert_eq!(string_array(&json!(["a", "b"])), vec!["a".to_string(), "b".to_string()]);
    }
}
