// Aviary Engine — Tool Executor
// Every tool call goes through here — this is the security enforcement
// point. Permission mask, schema validation, the guarded-class confirmation
// gate, per-(bot, class) serialization, timeouts, and the paired
// tool_call / tool_result event records all live in this file.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::memory_types::{Direction, Event, EventKind, LearningSource, Sentiment};
use crate::atoms::room_types::{ArtifactChainEntry, EscalationThreshold};
use crate::atoms::types::{truncate_utf8, BotProfile, ToolCall};
use crate::engine::artifacts::ArtifactStore;
use crate::engine::audit::AuditLog;
use crate::engine::broker::TurnSignal;
use crate::engine::config::LearningConfig;
use crate::engine::embedder::EmbedderStack;
use crate::engine::injection;
use crate::engine::learnings;
use crate::engine::rooms::RoomManager;
use crate::engine::store::{EventFilter, MemoryStore};
use crate::engine::tools::{
    SideEffect, ToolOutcome, ToolRegistry, ToolSpec, ToolStatus, INTERCEPTED_TOOLS,
};
use log::{info, warn};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Everything the executor needs to know about who is calling from where.
pub struct ToolContext<'a> {
    pub bot: &'a BotProfile,
    pub room_id: &'a str,
    pub session_key: &'a str,
    pub channel: &'a str,
    /// The user explicitly confirmed this specific guarded call.
    pub confirmed: bool,
    /// Caller confidence, measured against the room's escalation threshold
    /// when coordinator mode is on.
    pub confidence: f64,
    pub coordinator_mode: bool,
    pub escalation_threshold: EscalationThreshold,
    pub cancel: &'a TurnSignal,
}

/// What the confirmation gate decided for a guarded tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    Allow,
    /// Pause and ask the user; the caller writes the escalation event and
    /// never records a tool_call.
    Escalate(String),
}

pub struct ToolExecutor {
    pub registry: ToolRegistry,
    store: Arc<MemoryStore>,
    artifacts: Arc<ArtifactStore>,
    rooms: Arc<RoomManager>,
    embedder: Arc<EmbedderStack>,
    audit: Arc<AuditLog>,
    learning_cfg: LearningConfig,
    workspace: PathBuf,
    http: reqwest::Client,
    tool_timeout: Duration,
    /// Exec/destructive runs are serialized per (bot, class) so a retry can
    /// never double-apply.
    guard_locks: Mutex<HashMap<(String, SideEffect), Arc<tokio::sync::Mutex<()>>>>,
}

impl ToolExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: ToolRegistry,
        store: Arc<MemoryStore>,
        artifacts: Arc<ArtifactStore>,
        rooms: Arc<RoomManager>,
        embedder: Arc<EmbedderStack>,
        audit: Arc<AuditLog>,
        learning_cfg: LearningConfig,
        workspace: PathBuf,
    ) -> Self {
        ToolExecutor {
            registry,
            store,
            artifacts,
            rooms,
            embedder,
            audit,
            learning_cfg,
            workspace,
            http: reqwest::Client::new(),
            tool_timeout: Duration::from_secs(60),
            guard_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Gate for exec/destructive tools. Checked by the caller BEFORE any
    /// tool_call event exists, so an escalated call leaves no tool trace —
    /// only the escalation event.
    pub fn authority_check(&self, spec: &ToolSpec, ctx: &ToolContext<'_>) -> GuardDecision {
        if !spec.side_effect.is_guarded() || ctx.confirmed {
            return GuardDecision::Allow;
        }
        if ctx.coordinator_mode && ctx.confidence >= ctx.escalation_threshold.min_confidence() {
            return GuardDecision::Allow;
        }
        GuardDecision::Escalate(format!(
            "'{}' is {} and needs confirmation (confidence {:.2}, threshold {:.2}, coordinator_mode {})",
            spec.name,
            spec.side_effect.as_str(),
            ctx.confidence,
            ctx.escalation_threshold.min_confidence(),
            ctx.coordinator_mode,
        ))
    }

    /// Execute one tool call and record the paired events. Infrastructure
    /// failures surface as Err; tool-level failures come back as an
    /// outcome with status error/timeout so the model sees them.
    pub async fn execute(
        &self,
        ctx: &ToolContext<'_>,
        call: &ToolCall,
    ) -> EngineResult<(ToolOutcome, String)> {
        let name = call.function.name.clone();
        let started = Instant::now();
        info!(
            "[executor] {} calling {} args={}",
            ctx.bot.name,
            name,
            truncate_utf8(&call.function.arguments, 200)
        );

        // Record the call first — even failures keep the paired record.
        let mut call_event = Event::new(
            ctx.channel,
            Direction::Internal,
            EventKind::ToolCall,
            json!({ "name": name, "arguments": call.function.arguments }).to_string(),
            ctx.session_key,
        )
        .with_tool(name.clone())
        .with_bot(ctx.bot.name.clone(), ctx.bot.role.clone());
        call_event.metadata.insert("room_id".into(), json!(ctx.room_id));
        self.store.append_event(&mut call_event)?;
        let call_event_id = call_event.id.clone();
        self.audit
            .record("tool_call", &ctx.bot.name, &format!("{} in {}", name, ctx.room_id))
            .ok();

        let outcome = self.run_checked(ctx, call, started).await;

        // Paired tool_result, success or not.
        let mut result_event = Event::new(
            ctx.channel,
            Direction::Internal,
            EventKind::ToolResult,
            serde_json::to_string(&outcome)?,
            ctx.session_key,
        )
        .with_tool(name.clone())
        .with_parent(call_event_id.clone())
        .with_bot(ctx.bot.name.clone(), ctx.bot.role.clone());
        result_event.metadata.insert("status".into(), json!(outcome.status.as_str()));
        result_event.metadata.insert("room_id".into(), json!(ctx.room_id));
        self.store.append_event(&mut result_event)?;

        Ok((outcome, call_event_id))
    }

    async fn run_checked(&self, ctx: &ToolContext<'_>, call: &ToolCall, started: Instant) -> ToolOutcome {
        let name = &call.function.name;
        let elapsed = |s: Instant| s.elapsed().as_millis() as u64;

        let Some(spec) = self.registry.get(name).cloned() else {
            return ToolOutcome::failure(ToolStatus::Error, format!("unknown tool '{}'", name), elapsed(started));
        };

        if INTERCEPTED_TOOLS.contains(&name.as_str()) {
            return ToolOutcome::failure(
                ToolStatus::Error,
                format!("'{}' is handled by the agent loop, not the executor", name),
                elapsed(started),
            );
        }

        if !self.registry.is_permitted(ctx.bot, name) {
            self.audit
                .record("permission_denied", &ctx.bot.name, &format!("{} in {}", name, ctx.room_id))
                .ok();
            return ToolOutcome::failure(
                ToolStatus::Error,
                format!("permission denied: {} may not call {}", ctx.bot.name, name),
                elapsed(started),
            );
        }

        let args: Value = match serde_json::from_str(&call.function.arguments) {
            Ok(v) => v,
            Err(e) => {
                return ToolOutcome::failure(
                    ToolStatus::Error,
                    format!("arguments are not valid JSON: {}", e),
                    elapsed(started),
                )
            }
        };
        if let Err(e) = self.registry.validate_args(name, &args) {
            return ToolOutcome::failure(ToolStatus::Error, e.to_string(), elapsed(started));
        }

        // Defense in depth: the gate is checked upstream, but a guarded
        // call that slips through still stops here.
        if let GuardDecision::Escalate(reason) = self.authority_check(&spec, ctx) {
            return ToolOutcome::failure(ToolStatus::Error, reason, elapsed(started));
        }

        if ctx.cancel.is_cancelled() {
            return ToolOutcome::failure(ToolStatus::Timeout, "turn cancelled", elapsed(started));
        }

        // Serialize guarded classes per (bot, class).
        let _guard = if spec.side_effect.is_guarded() {
            let lock = {
                let mut locks = self.guard_locks.lock();
                Arc::clone(
                    locks
                        .entry((ctx.bot.name.clone(), spec.side_effect))
                        .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
                )
            };
            Some(lock.lock_owned().await)
        } else {
            None
        };

        match tokio::time::timeout(self.tool_timeout, self.run_builtin(ctx, name, &args)).await {
            Ok(Ok((value, structured))) => ToolOutcome::success(value, structured, elapsed(started)),
            Ok(Err(e)) => {
                warn!("[executor] {} failed: {}", name, e);
                ToolOutcome::failure(ToolStatus::Error, e.to_string(), elapsed(started))
            }
            Err(_) => {
                warn!("[executor] {} timed out after {:?}", name, self.tool_timeout);
                ToolOutcome::failure(ToolStatus::Timeout, "tool timed out", elapsed(started))
            }
        }
    }

    // ── Builtins ───────────────────────────────────────────────────────

    async fn run_builtin(
        &self,
        ctx: &ToolContext<'_>,
        name: &str,
        args: &Value,
    ) -> EngineResult<(String, Option<Value>)> {
        match name {
            "read_file" => self.read_file(ctx, args),
            "write_file" => self.write_file(ctx, args),
            "list_directory" => self.list_directory(ctx, args),
            "delete_file" => self.delete_file(ctx, args),
            "fetch" => self.fetch(args).await,
            "remember" => self.remember(ctx, args).await,
            "recall" => self.recall(args).await,
            "artifact_put" => self.artifact_put(ctx, args),
            "artifact_get" => self.artifact_get(args),
            other => Err(EngineError::tool_permanent(other, "no builtin implementation")),
        }
    }

    /// Each bot works inside its own workspace directory.
    fn bot_workspace(&self, bot: &str) -> EngineResult<PathBuf> {
        let dir = self.workspace.join("workspaces").join(bot);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    fn resolve_path(&self, ctx: &ToolContext<'_>, raw: &str) -> EngineResult<PathBuf> {
        if raw.split(['/', '\\']).any(|part| part == "..") || raw.starts_with('/') {
            return Err(EngineError::Security(format!("path escapes workspace: {}", raw)));
        }
        Ok(self.bot_workspace(&ctx.bot.name)?.join(raw))
    }

    fn read_file(&self, ctx: &ToolContext<'_>, args: &Value) -> EngineResult<(String, Option<Value>)> {
        let path = args["path"].as_str().unwrap_or_default();
        let resolved = self.resolve_path(ctx, path)?;
        let content = std::fs::read_to_string(&resolved)
            .map_err(|e| EngineError::tool_permanent("read_file", format!("{}: {}", path, e)))?;
        Ok((content, None))
    }

    fn write_file(&self, ctx: &ToolContext<'_>, args: &Value) -> EngineResult<(String, Option<Value>)> {
        let path = args["path"].as_str().unwrap_or_default();
        let content = args["content"].as_str().unwrap_or_default();
        let resolved = self.resolve_path(ctx, path)?;
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&resolved, content)?;
        Ok((
            format!("wrote {} bytes to {}", content.len(), path),
            Some(json!({ "path": path, "bytes": content.len() })),
        ))
    }

    fn list_directory(&self, ctx: &ToolContext<'_>, args: &Value) -> EngineResult<(String, Option<Value>)> {
        let path = args["path"].as_str().unwrap_or("");
        let resolved = self.resolve_path(ctx, path)?;
        let mut names = Vec::new();
        if resolved.exists() {
            for entry in std::fs::read_dir(&resolved)? {
                let entry = entry?;
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();
        Ok((names.join("\n"), Some(json!({ "entries": names }))))
    }

    fn delete_file(&self, ctx: &ToolContext<'_>, args: &Value) -> EngineResult<(String, Option<Value>)> {
        let path = args["path"].as_str().unwrap_or_default();
        let resolved = self.resolve_path(ctx, path)?;
        std::fs::remove_file(&resolved)
            .map_err(|e| EngineError::tool_permanent("delete_file", format!("{}: {}", path, e)))?;
        self.audit
            .record("destructive", &ctx.bot.name, &format!("delete_file {}", path))
            .ok();
        Ok((format!("deleted {}", path), None))
    }

    async fn fetch(&self, args: &Value) -> EngineResult<(String, Option<Value>)> {
        let url = args["url"].as_str().unwrap_or_default();
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(EngineError::tool_permanent("fetch", format!("not an http(s) url: {}", url)));
        }
        let resp = self
            .http
            .get(url)
            .timeout(Duration::from_secs(20))
            .send()
            .await
            .map_err(|e| EngineError::tool_retryable("fetch", e.to_string()))?;
        let status = resp.status().as_u16();
        if status >= 400 {
            return Err(EngineError::tool_retryable("fetch", format!("HTTP {}", status)));
        }
        let body = resp
            .text()
            .await
            .map_err(|e| EngineError::tool_retryable("fetch", e.to_string()))?;

        // External content is quarantined: stored under external_source and
        // banner-wrapped before any provider sees it.
        let trust_score = 0.3;
        let descriptor = self.artifacts.put_external(body.as_bytes(), "web", "html")?;
        let wrapped = injection::wrap_external(truncate_utf8(&body, 4000), url, trust_score);
        Ok((
            wrapped,
            Some(json!({
                "artifact_path": descriptor.path,
                "sha256": descriptor.sha256,
                "trust_score": trust_score,
                "external": true,
            })),
        ))
    }

    async fn remember(&self, ctx: &ToolContext<'_>, args: &Value) -> EngineResult<(String, Option<Value>)> {
        let content = args["content"].as_str().unwrap_or_default();
        let category = args["category"].as_str();
        let confidence = args["confidence"].as_f64().unwrap_or(0.6);
        let learning = learnings::capture(
            &self.store,
            &self.embedder,
            &self.learning_cfg,
            &ctx.bot.name,
            content,
            LearningSource::ToolOutcome,
            Sentiment::Neutral,
            confidence,
            None,
            category,
        )
        .await?;
        Ok((
            format!("remembered with confidence {:.2}", learning.confidence),
            Some(json!({ "learning_id": learning.id })),
        ))
    }

    async fn recall(&self, args: &Value) -> EngineResult<(String, Option<Value>)> {
        let query = args["query"].as_str().unwrap_or_default();
        let k = args["k"].as_u64().unwrap_or(5) as usize;
        let (provider_id, vector) = self
            .embedder
            .embed_one(query)
            .await
            .map_err(|e| EngineError::tool_retryable("recall", e.to_string()))?;
        let hits =
            self.store
                .semantic_search_events(&provider_id, &vector, k, &EventFilter::default())?;
        let mut lines = Vec::new();
        let mut structured = Vec::new();
        for (event, score) in &hits {
            self.store.touch_event(&event.id).ok();
            lines.push(format!("[{:.2}] {}", score, truncate_utf8(&event.content, 200)));
            structured.push(json!({ "event_id": event.id, "score": score, "content": event.content }));
        }
        Ok((lines.join("\n"), Some(json!({ "matches": structured }))))
    }

    fn artifact_put(&self, ctx: &ToolContext<'_>, args: &Value) -> EngineResult<(String, Option<Value>)> {
        let content = args["content"].as_str().unwrap_or_default();
        let ext = args["ext"].as_str().unwrap_or("txt");
        let kind = args["kind"].as_str().unwrap_or("text");
        let descriptor = self.artifacts.put(content.as_bytes(), kind, ext)?;
        let step = self.rooms.record_artifact(
            ctx.room_id,
            ArtifactChainEntry {
                step: 0,
                producer: ctx.bot.name.clone(),
                task: "artifact_put".into(),
                inputs: vec![],
                outputs: vec![descriptor.clone()],
                status: "done".into(),
                timestamp: chrono::Utc::now().to_rfc3339(),
            },
        )?;
        Ok((
            format!("stored {} (chain step {})", descriptor.path, step),
            Some(serde_json::to_value(&descriptor)?),
        ))
    }

    fn artifact_get(&self, args: &Value) -> EngineResult<(String, Option<Value>)> {
        let path = args["path"].as_str().unwrap_or_default();
        let bytes = self.artifacts.get(path)?;
        let text = String::from_utf8_lossy(&bytes).to_string();
        // Anything read back out of the external namespace stays wrapped.
        let value = if ArtifactStore::is_external(path) && !injection::is_wrapped(&text) {
            injection::wrap_external(&text, path, 0.3)
        } else {
            text
        };
        Ok((value, Some(json!({ "path": path, "bytes": bytes.len() }))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::ReasoningConfig;
    use crate::engine::config::RoomsSection;

    struct Fixture {
        executor: ToolExecutor,
        store: Arc<MemoryStore>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::open_in_memory().unwrap());
        let artifacts = Arc::new(ArtifactStore::new(dir.path()).unwrap());
        let rooms = Arc::new(
            RoomManager::new(Arc::clone(&store), dir.path(), RoomsSection::default(), "leader").unwrap(),
        );
        rooms
            .create_room("#general", crate::atoms::room_types::RoomKind::Open, "user", vec![])
            .unwrap();
        let embedder = Arc::new(EmbedderStack::hash(32));
        let audit = Arc::new(AuditLog::open(dir.path()).unwrap());
        let executor = ToolExecutor::new(
            ToolRegistry::new(),
            Arc::clone(&store),
            artifacts,
            rooms,
            embedder,
            audit,
            LearningConfig::default(),
            dir.path().to_path_buf(),
        );
        Fixture { executor, store, _dir: dir }
    }

    fn bot(name: &str, allowed: Vec<String>) -> BotProfile {
        BotProfile {
            name: name.into(),
            role: name.into(),
            domains: vec![],
            system_prompt: String::new(),
            soul: None,
            allowed_tools: allowed,
            max_concurrent_tasks: 2,
            reasoning: ReasoningConfig::default(),
            model: None,
        }
    }

    fn call(name: &str, args: Value) -> ToolCall {
        ToolCall {
            id: "call-1".into(),
            call_type: "function".into(),
            function: crate::atoms::types::FunctionCall { name: name.into(), arguments: args.to_string() },
        }
    }

    fn ctx<'a>(bot: &'a BotProfile, cancel: &'a TurnSignal) -> ToolContext<'a> {
        ToolContext {
            bot,
            room_id: "#general",
            session_key: "cli:#general",
            channel: "cli",
            confirmed: false,
            confidence: 0.5,
            coordinator_mode: false,
            escalation_threshold: EscalationThreshold::Medium,
            cancel,
        }
    }

    #[tokio::test]
    async fn write_then_read_roundtrip_with_paired_events() {
        let f = fixture();
        let coder = bot("coder", vec![]);
        let cancel = TurnSignal::new();
        let c = ctx(&coder, &cancel);

        let (outcome, _) = f
            .executor
            .execute(&c, &call("write_file", json!({ "path": "notes.txt", "content": "hi" })))
            .await
            .unwrap();
        assert_eq!(outcome.status, ToolStatus::Success);

        let (outcome, _) = f
            .executor
            .execute(&c, &call("read_file", json!({ "path": "notes.txt" })))
            .await
            .unwrap();
        assert_eq!(outcome.value, "hi");

        // Every call produced a tool_call + tool_result pair.
        let events = f.store.list_by_session("cli:#general", 100, 0).unwrap();
        let calls = events.iter().filter(|e| e.kind == EventKind::ToolCall).count();
        let results = events.iter().filter(|e| e.kind == EventKind::ToolResult).count();
        assert_eq!(calls, 2);
        assert_eq!(results, 2);
        for result in events.iter().filter(|e| e.kind == EventKind::ToolResult) {
            let parent = result.parent_id.as_ref().unwrap();
            assert!(events.iter().any(|e| &e.id == parent && e.kind == EventKind::ToolCall));
        }
    }

    #[tokio::test]
    async fn permission_denied_is_recorded_not_thrown() {
        let f = fixture();
        let coder = bot("coder", vec![]);
        let cancel = TurnSignal::new();
        let c = ctx(&coder, &cancel);

        let (outcome, _) = f
            .executor
            .execute(&c, &call("delete_file", json!({ "path": "x.txt" })))
            .await
            .unwrap();
        assert_eq!(outcome.status, ToolStatus::Error);
        assert!(outcome.error.unwrap().contains("permission denied"));
        // The failed call still has its paired events.
        let events = f.store.list_by_session("cli:#general", 100, 0).unwrap();
        assert_eq!(events.iter().filter(|e| e.kind == EventKind::ToolResult).count(), 1);
    }

    #[tokio::test]
    async fn guarded_tool_escalates_without_authority() {
        let f = fixture();
        let trusted = bot("coder", vec!["delete_file".into()]);
        let cancel = TurnSignal::new();
        let mut c = ctx(&trusted, &cancel);
        let spec = f.executor.registry.get("delete_file").unwrap().clone();

        // No confirmation, no coordinator mode: escalate.
        assert!(matches!(f.executor.authority_check(&spec, &c), GuardDecision::Escalate(_)));

        // Coordinator mode with enough confidence: allow.
        c.coordinator_mode = true;
        c.confidence = 0.9;
        assert_eq!(f.executor.authority_check(&spec, &c), GuardDecision::Allow);

        // Coordinator mode below the threshold: escalate.
        c.confidence = 0.6;
        assert!(matches!(f.executor.authority_check(&spec, &c), GuardDecision::Escalate(_)));
    }

    #[tokio::test]
    async fn invalid_args_fail_validation() {
        let f = fixture();
        let coder = bot("coder", vec![]);
        let cancel = TurnSignal::new();
        let c = ctx(&coder, &cancel);
        let (outcome, _) = f.executor.execute(&c, &call("read_file", json!({}))).await.unwrap();
        assert_eq!(outcome.status, ToolStatus::Error);
        assert!(outcome.error.unwrap().contains("missing required argument"));
    }

    #[tokio::test]
    async fn traversal_is_blocked() {
        let f = fixture();
        let coder = bot("coder", vec![]);
        let cancel = TurnSignal::new();
        let c = ctx(&coder, &cancel);
        let (outcome, _) = f
            .executor
            .execute(&c, &call("read_file", json!({ "path": "../../etc/passwd" })))
            .await
            .unwrap();
        assert_eq!(outcome.status, ToolStatus::Error);
    }

    #[tokio::test]
    async fn recall_finds_semantically_close_events() {
        let f = fixture();
        let coder = bot("coder", vec![]);
        let cancel = TurnSignal::new();
        let c = ctx(&coder, &cancel);

        // Seed an embedded event.
        let mut ev = Event::new(
            "cli",
            Direction::Inbound,
            EventKind::Message,
            "the deploy pipeline uses blue green rollouts",
            "cli:#general",
        );
        f.store.append_event(&mut ev).unwrap();
        let stack = EmbedderStack::hash(32);
        let (provider, vector) = stack
            .embed_one("the deploy pipeline uses blue green rollouts")
            .await
            .unwrap();
        f.store
            .set_event_embedding(&ev.id, &crate::engine::store::encode_vector(&provider, &vector))
            .unwrap();

        let (outcome, _) = f
            .executor
            .execute(&c, &call("recall", json!({ "query": "deploy pipeline rollouts" })))
            .await
            .unwrap();
        assert_eq!(outcome.status, ToolStatus::Success);
        assert!(outcome.value.contains("deploy pipeline"));
    }
}
