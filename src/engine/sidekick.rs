// Aviary Engine — Sidekick Orchestrator
// Short-lived helper sessions owned by a parent bot. A sidekick gets a
// context packet (goal + explicit inputs + output format — never room
// history), runs under its own timeout and a smaller token budget, and
// stays silent in the room: only the parent's merged response enters
// history. Sidekicks cannot spawn sidekicks.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{truncate_utf8, BotProfile, ChatRequest, Message};
use crate::engine::artifacts::ArtifactStore;
use crate::engine::broker::TurnSignal;
use crate::engine::injection;
use crate::engine::providers::AnyProvider;
use log::{info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SidekickRequest {
    pub goal: String,
    /// Explicit input snippets or artifact paths — the whole context.
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub output_format: String,
}

#[derive(Debug, Clone)]
pub struct SidekickResult {
    pub index: usize,
    pub goal: String,
    pub output: Option<String>,
    pub error: Option<String>,
}

/// Results merged in deterministic spawn order. `merged` is None when every
/// sidekick failed — the parent falls back to solo execution and says so.
#[derive(Debug, Clone)]
pub struct SidekickMerge {
    pub merged: Option<String>,
    pub results: Vec<SidekickResult>,
}

pub struct SidekickOrchestrator {
    provider: Arc<AnyProvider>,
    artifacts: Arc<ArtifactStore>,
    model: String,
    max_per_bot: usize,
    max_per_room: usize,
    timeout: Duration,
    /// Live sidekicks per room, bounding concurrent fan-out.
    active_per_room: Mutex<HashMap<String, usize>>,
}

impl SidekickOrchestrator {
    pub fn new(
        provider: Arc<AnyProvider>,
        artifacts: Arc<ArtifactStore>,
        model: &str,
        max_per_bot: usize,
        max_per_room: usize,
    ) -> Self {
        SidekickOrchestrator {
            provider,
            artifacts,
            model: model.to_string(),
            max_per_bot,
            max_per_room,
            timeout: Duration::from_secs(120),
            active_per_room: Mutex::new(HashMap::new()),
        }
    }

    /// Run a batch of sidekicks for one parent turn, in parallel, and merge.
    pub async fn run_batch(
        &self,
        parent: &BotProfile,
        room_id: &str,
        mut requests: Vec<SidekickRequest>,
        cancel: &TurnSignal,
    ) -> EngineResult<SidekickMerge> {
        if requests.is_empty() {
            return Ok(SidekickMerge { merged: None, results: vec![] });
        }
        if requests.len() > self.max_per_bot {
            warn!(
                "[sidekick] {} asked for {} sidekicks, capping at {}",
                parent.name,
                requests.len(),
                self.max_per_bot
            );
            requests.truncate(self.max_per_bot);
        }

        // Room budget: admission is all-or-nothing for the batch.
        {
            let mut active = self.active_per_room.lock();
            let current = active.get(room_id).copied().unwrap_or(0);
            if current + requests.len() > self.max_per_room {
                return Err(EngineError::busy(format!("sidekicks in {}", room_id)));
            }
            active.insert(room_id.to_string(), current + requests.len());
        }
        let batch_size = requests.len();

        info!("[sidekick] {} spawning {} sidekicks in {}", parent.name, batch_size, room_id);
        let futures: Vec<_> = requests
            .into_iter()
            .enumerate()
            .map(|(index, request)| self.run_one(parent, index, request, cancel.clone()))
            .collect();
        let results: Vec<SidekickResult> = futures::future::join_all(futures).await;

        {
            let mut active = self.active_per_room.lock();
            if let Some(count) = active.get_mut(room_id) {
                *count = count.saturating_sub(batch_size);
            }
        }

        Ok(merge(results))
    }

    async fn run_one(
        &self,
        parent: &BotProfile,
        index: usize,
        request: SidekickRequest,
        cancel: TurnSignal,
    ) -> SidekickResult {
        let goal = request.goal.clone();
        let fail = |error: String| SidekickResult {
            index,
            goal: goal.clone(),
            output: None,
            error: Some(error),
        };

        if cancel.is_cancelled() {
            return fail("cancelled before start".into());
        }

        let packet = match self.context_packet(&request) {
            Ok(packet) => packet,
            Err(e) => return fail(e.to_string()),
        };

        let chat = self.provider.chat(ChatRequest {
            model: self.model.clone(),
            system: format!(
                "You are a short-lived helper working for the bot '{}'. Work ONLY from the \
                 context packet. Produce the requested output and nothing else.",
                parent.name
            ),
            messages: vec![Message::user(packet)],
            tools: vec![],
            tool_choice: None,
            temperature: Some(0.3),
            // Smaller budget than the parent by contract.
            max_tokens: Some(800),
        });

        match tokio::time::timeout(self.timeout, chat).await {
            Ok(Ok(response)) => SidekickResult {
                index,
                goal,
                output: Some(response.message),
                error: None,
            },
            Ok(Err(e)) => fail(e.to_string()),
            Err(_) => fail(format!("timed out after {:?}", self.timeout)),
        }
    }

    /// The sidekick's entire world: goal, explicit inputs (artifact paths
    /// resolved, external content stays banner-wrapped), constraints, and
    /// the expected output shape.
    fn context_packet(&self, request: &SidekickRequest) -> EngineResult<String> {
        let mut packet = format!("Goal: {}\n", request.goal);
        if !request.inputs.is_empty() {
            packet.push_str("\nInputs:\n");
            for input in &request.inputs {
                if input.starts_with("artifacts/") {
                    let bytes = self.artifacts.get(input)?;
                    let text = String::from_utf8_lossy(&bytes).to_string();
                    let text = if ArtifactStore::is_external(input) && !injection::is_wrapped(&text) {
                        injection::wrap_external(&text, input, 0.3)
                    } else {
                        text
                    };
                    packet.push_str(&format!("--- {} ---\n{}\n", input, truncate_utf8(&text, 4000)));
                } else {
                    packet.push_str(&format!("- {}\n", input));
                }
            }
        }
        if !request.constraints.is_empty() {
            packet.push_str("\nConstraints:\n");
            for constraint in &request.constraints {
                packet.push_str(&format!("- {}\n", constraint));
            }
        }
        if !request.output_format.is_empty() {
            packet.push_str(&format!("\nOutput format: {}\n", request.output_format));
        }
        Ok(packet)
    }
}

/// Deterministic merge by spawn index; gaps annotated, successes kept.
fn merge(mut results: Vec<SidekickResult>) -> SidekickMerge {
    results.sort_by_key(|r| r.index);
    let successes = results.iter().filter(|r| r.output.is_some()).count();
    if successes == 0 {
        return SidekickMerge { merged: None, results };
    }
    let mut merged = String::new();
    for result in &results {
        match (&result.output, &result.error) {
            (Some(output), _) => {
                merged.push_str(&format!("### {} \n{}\n\n", result.goal, output.trim()));
            }
            (None, Some(error)) => {
                merged.push_str(&format!("### {} \n[helper failed: {}]\n\n", result.goal, error));
            }
            (None, None) => {}
        }
    }
    SidekickMerge { merged: Some(merged.trim_end().to_string()), results }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::ReasoningConfig;
    use crate::engine::providers::ScriptedProvider;

    fn parent() -> BotProfile {
        BotProfile {
            name: "researcher".into(),
            role: "researcher".into(),
            domains: vec![],
            system_prompt: String::new(),
            soul: None,
            allowed_tools: vec![],
            max_concurrent_tasks: 2,
            reasoning: ReasoningConfig::default(),
            model: None,
        }
    }

    fn orchestrator(provider: AnyProvider, dir: &std::path::Path) -> SidekickOrchestrator {
        SidekickOrchestrator::new(
            Arc::new(provider),
            Arc::new(ArtifactStore::new(dir).unwrap()),
            "cheap",
            3,
            6,
        )
    }

    fn request(goal: &str) -> SidekickRequest {
        SidekickRequest {
            goal: goal.into(),
            inputs: vec![],
            constraints: vec![],
            output_format: "bullet list".into(),
        }
    }

    #[tokio::test]
    async fn merge_is_in_spawn_order() {
        let dir = tempfile::tempdir().unwrap();
        let scripted = ScriptedProvider::always("result");
        scripted.push_text("alpha");
        scripted.push_text("beta");
        let orch = orchestrator(AnyProvider::Scripted(scripted), dir.path());
        let cancel = TurnSignal::new();
        let out = orch
            .run_batch(&parent(), "#r", vec![request("first"), request("second")], &cancel)
            .await
            .unwrap();
        let merged = out.merged.unwrap();
        let first_pos = merged.find("first").unwrap();
        let second_pos = merged.find("second").unwrap();
        assert!(first_pos < second_pos);
        assert_eq!(out.results.len(), 2);
    }

    #[tokio::test]
    async fn over_cap_requests_are_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(AnyProvider::Scripted(ScriptedProvider::always("ok")), dir.path());
        let cancel = TurnSignal::new();
        let requests: Vec<SidekickRequest> = (0..5).map(|i| request(&format!("g{}", i))).collect();
        let out = orch.run_batch(&parent(), "#r", requests, &cancel).await.unwrap();
        assert_eq!(out.results.len(), 3);
    }

    #[tokio::test]
    async fn room_budget_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let orch = SidekickOrchestrator::new(
            Arc::new(AnyProvider::Scripted(ScriptedProvider::always("ok"))),
            Arc::new(ArtifactStore::new(dir.path()).unwrap()),
            "cheap",
            3,
            2,
        );
        let cancel = TurnSignal::new();
        let err = orch
            .run_batch(&parent(), "#r", vec![request("a"), request("b"), request("c")], &cancel)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn all_failures_mean_no_merge() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(AnyProvider::Scripted(ScriptedProvider::always("unused")), dir.path());
        let cancel = TurnSignal::new();
        cancel.cancel();
        let out = orch.run_batch(&parent(), "#r", vec![request("a")], &cancel).await.unwrap();
        assert!(out.merged.is_none());
        assert!(out.results[0].error.is_some());
    }
}
