// ── Agent Loop: Context Assembly ───────────────────────────────────────────
// Token-budgeted, PURE assembly: summary nodes, learnings, and recent
// events in, one context string out. No LLM calls, no clocks — identical
// store state and inbound event always produce identical bytes (the
// timestamp woven in is the event's own).

use crate::atoms::error::EngineResult;
use crate::atoms::memory_types::Event;
use crate::atoms::room_types::Room;
use crate::atoms::types::{approx_tokens, truncate_utf8, BotProfile};
use crate::engine::config::{ContextConfig, LearningConfig};
use crate::engine::graph;
use crate::engine::learnings;
use crate::engine::store::MemoryStore;

/// Per-section token budgets (defaults sum within the 4000-token budget).
#[derive(Debug, Clone)]
pub struct SectionBudgets {
    pub identity: usize,
    pub state: usize,
    pub root_summary: usize,
    pub recent_activity: usize,
    pub channel_summary: usize,
    pub entity_summary: usize,
    pub topic_summaries: usize,
    pub preferences: usize,
    pub learnings: usize,
}

impl Default for SectionBudgets {
    fn default() -> Self {
        SectionBudgets {
            identity: 200,
            state: 150,
            root_summary: 500,
            recent_activity: 400,
            channel_summary: 300,
            entity_summary: 400,
            topic_summaries: 400,
            preferences: 300,
            learnings: 200,
        }
    }
}

/// Clip a section body to its token budget (≈4 bytes per token).
fn clip(text: &str, budget_tokens: usize) -> String {
    let max_bytes = budget_tokens * 4;
    if approx_tokens(text) <= budget_tokens {
        text.to_string()
    } else {
        format!("{}…", truncate_utf8(text, max_bytes.saturating_sub(4)))
    }
}

fn push_section(out: &mut String, title: &str, body: &str, budget: usize) {
    if body.is_empty() {
        return;
    }
    out.push_str("## ");
    out.push_str(title);
    out.push('\n');
    out.push_str(&clip(body, budget));
    out.push_str("\n\n");
}

/// Assemble the system context for one bot turn. Reads the summary tree,
/// the learning pools (shared reads count as exposure), and the last M
/// session events. Pure lookup — the only writes are exposure counters,
/// which never feed back into the output bytes.
pub fn assemble(
    store: &MemoryStore,
    cfg: &ContextConfig,
    learning_cfg: &LearningConfig,
    bot: &BotProfile,
    room: &Room,
    event: &Event,
) -> EngineResult<String> {
    let budgets = SectionBudgets::default();
    let mut out = String::new();

    // Identity: role card + soul overlay.
    let mut identity = bot.system_prompt.clone();
    if let Some(soul) = &bot.soul {
        if !identity.is_empty() {
            identity.push('\n');
        }
        identity.push_str(soul);
    }
    push_section(&mut out, "Identity", &identity, budgets.identity);

    // State: room shape and the event's own timestamp (pure).
    let state = format!(
        "room: {} ({}) | participants: {} | time: {} | coordinator_mode: {}",
        room.id,
        room.kind.as_str(),
        room.participants.join(", "),
        event.timestamp,
        room.policy.coordinator_mode,
    );
    push_section(&mut out, "State", &state, budgets.state);

    // Knowledge root.
    if let Some(root) = store.summary_node("root")? {
        push_section(&mut out, "Knowledge", &root.summary, budgets.root_summary);
    }

    // Recent activity: last M events of this session, oldest first.
    let recent = store.recent_session_events(&event.session_key, cfg.recent_events)?;
    let mut activity = String::new();
    for past in recent.iter().filter(|e| e.id != event.id) {
        let who = past.bot_name.as_deref().unwrap_or_else(|| {
            past.metadata
                .get("sender")
                .and_then(|v| v.as_str())
                .unwrap_or("user")
        });
        activity.push_str(&format!("{} ({}): {}\n", who, past.kind.as_str(), truncate_utf8(&past.content, 240)));
    }
    push_section(&mut out, "Recent activity", &activity, budgets.recent_activity);

    // Channel summary, when the tree knows this channel.
    if let Some(node) = store.summary_node(&format!("channel:{}", event.channel))? {
        push_section(&mut out, "Channel summary", &node.summary, budgets.channel_summary);
    }

    // Entity summary: a person named in the message, if resolved already.
    if let Some(entity_section) = identified_entity_summary(store, event)? {
        push_section(&mut out, "Known entity", &entity_section, budgets.entity_summary);
    }

    // Topic summaries keyed off the message's own keywords.
    let mut topics = String::new();
    for topic in graph::extract_topics(&event.content) {
        if let Some(node) = store.summary_node(&format!("topic:{}", topic))? {
            if !node.summary.is_empty() {
                topics.push_str(&format!("{}: {}\n", topic, node.summary));
            }
        }
    }
    push_section(&mut out, "Topics", &topics, budgets.topic_summaries);

    // User preferences — always included when non-empty.
    if let Some(prefs) = store.summary_node("user_preferences")? {
        push_section(&mut out, "User preferences", &prefs.summary, budgets.preferences);
    }

    // Learnings: this bot's best private ones plus the shared pool. Being
    // packed into a turn counts as use, which re-boosts recency.
    let mut learning_lines = String::new();
    for (learning, _score) in learnings::ranked_private(store, learning_cfg, &bot.name, 3)? {
        learning_lines.push_str(&format!("(private) {}\n", learning.content));
        store.touch_learning(&learning.id)?;
    }
    for learning in learnings::read_shared_pool(store, 3)? {
        learning_lines.push_str(&format!("(shared) {}\n", learning.content));
        store.touch_learning(&learning.id)?;
    }
    push_section(&mut out, "Learnings", &learning_lines, budgets.learnings);

    // Hard cap: the whole context respects the overall token budget.
    Ok(clip(&out, cfg.token_budget))
}

/// Find a resolved person/org mentioned in the message and render its
/// summary node (or graph facts when the summary is still empty).
fn identified_entity_summary(store: &MemoryStore, event: &Event) -> EngineResult<Option<String>> {
    for mention in graph::extract_mentions(&event.content) {
        let normalized = graph::normalize_surface(&mention.surface);
        let Some(entity) = store
            .find_entity_exact(&normalized, mention.kind)?
            .or(store.find_entity_by_alias(&normalized, mention.kind)?)
        else {
            continue;
        };
        if let Some(node) = store.summary_node(&format!("entity:{}", entity.id))? {
            if !node.summary.is_empty() {
                return Ok(Some(format!("{}: {}", entity.name, node.summary)));
            }
        }
        let facts = store.active_facts(&entity.id, None)?;
        if !facts.is_empty() {
            let lines: Vec<String> = facts
                .iter()
                .take(5)
                .map(|f| format!("{} {} {}", entity.name, f.predicate, f.object_text))
                .collect();
            return Ok(Some(lines.join("\n")));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::memory_types::{Direction, EventKind};
    use crate::atoms::room_types::{RoomKind, RoomPolicy};
    use crate::atoms::types::ReasoningConfig;

    fn room() -> Room {
        Room {
            id: "#general".into(),
            kind: RoomKind::Open,
            owner: "user".into(),
            participants: vec!["leader".into()],
            created_at: "2026-01-01T00:00:00Z".into(),
            summary: String::new(),
            policy: RoomPolicy::default(),
            deadline: None,
            artifact_chain: vec![],
            last_activity: None,
        }
    }

    fn bot() -> BotProfile {
        BotProfile {
            name: "leader".into(),
            role: "leader".into(),
            domains: vec![],
            system_prompt: "You coordinate.".into(),
            soul: None,
            allowed_tools: vec![],
            max_concurrent_tasks: 2,
            reasoning: ReasoningConfig::default(),
            model: None,
        }
    }

    #[test]
    fn assembly_is_deterministic() {
        let store = MemoryStore::open_in_memory().unwrap();
        crate::engine::summaries::ensure_tree_skeleton(&store).unwrap();
        store.store_summary_refresh("root", "The user builds Rust services.", None).unwrap();
        store
            .store_summary_refresh("user_preferences", "Prefers short answers.", None)
            .unwrap();

        let mut event =
            Event::new("cli", Direction::Inbound, EventKind::Message, "hello there", "cli:#general");
        event.timestamp = "2026-01-02T03:04:05Z".into();
        store.append_event(&mut event).unwrap();

        let cfg = ContextConfig::default();
        let lcfg = LearningConfig::default();
        let a = assemble(&store, &cfg, &lcfg, &bot(), &room(), &event).unwrap();
        let b = assemble(&store, &cfg, &lcfg, &bot(), &room(), &event).unwrap();
        assert_eq!(a, b, "context assembly must be byte-identical");
        assert!(a.contains("Prefers short answers."));
        assert!(a.contains("The user builds Rust services."));
    }

    #[test]
    fn sections_respect_budgets() {
        let store = MemoryStore::open_in_memory().unwrap();
        crate::engine::summaries::ensure_tree_skeleton(&store).unwrap();
        let huge = "word ".repeat(5000);
        store.store_summary_refresh("root", &huge, None).unwrap();

        let mut event = Event::new("cli", Direction::Inbound, EventKind::Message, "hi", "cli:#g");
        store.append_event(&mut event).unwrap();

        let cfg = ContextConfig::default();
        let lcfg = LearningConfig::default();
        let out = assemble(&store, &cfg, &lcfg, &bot(), &room(), &event).unwrap();
        assert!(approx_tokens(&out) <= cfg.token_budget + 10);
    }

    #[test]
    fn preferences_always_present_when_known() {
        let store = MemoryStore::open_in_memory().unwrap();
        crate::engine::summaries::ensure_tree_skeleton(&store).unwrap();
        store.store_summary_refresh("user_preferences", "Night owl. Metric units.", None).unwrap();
        let mut event = Event::new("cli", Direction::Inbound, EventKind::Message, "quick one", "cli:#g");
        store.append_event(&mut event).unwrap();
        let out = assemble(
            &store,
            &ContextConfig::default(),
            &LearningConfig::default(),
            &bot(),
            &room(),
            &event,
        )
        .unwrap();
        assert!(out.contains("Night owl"));
    }
}
