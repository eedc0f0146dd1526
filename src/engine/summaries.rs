// ── Summary Tree: Staleness-Driven Refresh ─────────────────────────────────
//
// Fixed tree shape:
//   root
//   ├── channel:{name}          (one per active channel)
//   ├── entity_type:{kind}      (person / org / location / concept / tool)
//   │       └── entity:{id}     (leaves)
//   ├── entity_type:topic
//   │       └── topic:{name}    (leaves)
//   └── user_preferences        (singleton leaf, always context-eligible)
//
// Every graph write bumps `events_since_update` on the covering nodes
// (ancestors included) inside the extraction transaction. Refresh runs only
// through the background manager: leaves first (bounded batch), branches
// from children, root last. This is the ONLY core path that issues LLM
// calls outside a user turn, and it uses the provider's cheapest model.

use crate::atoms::error::EngineResult;
use crate::atoms::memory_types::{EntityKind, Event, SummaryKind, SummaryNode};
use crate::atoms::types::{ChatRequest, Message};
use crate::engine::config::SummaryConfig;
use crate::engine::embedder::EmbedderStack;
use crate::engine::graph::ExtractionOutcome;
use crate::engine::providers::AnyProvider;
use crate::engine::store::{encode_vector, MemoryStore};
use log::{info, warn};

/// Root and the singleton preferences leaf always exist.
pub fn ensure_tree_skeleton(store: &MemoryStore) -> EngineResult<()> {
    let root_id = store.ensure_summary_node(SummaryKind::Root, "root", None)?;
    store.ensure_summary_node(SummaryKind::Preferences, "user_preferences", Some(&root_id))?;
    Ok(())
}

/// Ensure the nodes covering one extracted event exist, and return their
/// keys (ancestors included) for the staleness bump.
pub fn covering_keys(
    store: &MemoryStore,
    event: &Event,
    outcome: &ExtractionOutcome,
) -> EngineResult<Vec<String>> {
    ensure_tree_skeleton(store)?;
    let root_id = store
        .summary_node("root")?
        .map(|n| n.id)
        .unwrap_or_default();

    let mut keys = vec!["root".to_string()];

    let channel_key = format!("channel:{}", event.channel);
    store.ensure_summary_node(SummaryKind::Channel, &channel_key, Some(&root_id))?;
    keys.push(channel_key);

    for entity_id in &outcome.entity_ids {
        let Some(entity) = store.get_entity(entity_id)? else { continue };
        let type_key = format!("entity_type:{}", entity.kind.as_str());
        let type_id = store.ensure_summary_node(SummaryKind::EntityType, &type_key, Some(&root_id))?;
        let entity_key = format!("entity:{}", entity.id);
        store.ensure_summary_node(SummaryKind::Entity, &entity_key, Some(&type_id))?;
        if !keys.contains(&type_key) {
            keys.push(type_key);
        }
        keys.push(entity_key);
    }

    if !outcome.topic_names.is_empty() {
        let topics_key = format!("entity_type:{}", EntityKind::Topic.as_str());
        let topics_id = store.ensure_summary_node(SummaryKind::EntityType, &topics_key, Some(&root_id))?;
        if !keys.contains(&topics_key) {
            keys.push(topics_key);
        }
        for topic in &outcome.topic_names {
            let topic_key = format!("topic:{}", topic);
            store.ensure_summary_node(SummaryKind::Topic, &topic_key, Some(&topics_id))?;
            keys.push(topic_key);
        }
    }

    if outcome.preference_found {
        keys.push("user_preferences".to_string());
    }

    Ok(keys)
}

// ── Refresh cycle ──────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct RefreshReport {
    pub leaves_refreshed: usize,
    pub branches_refreshed: usize,
}

/// One refresh pass: stale leaves (bounded), then stale branches, root last.
/// Runs on the background manager only.
pub async fn refresh_cycle(
    store: &MemoryStore,
    provider: &AnyProvider,
    cheap_model: &str,
    embedder: &EmbedderStack,
    cfg: &SummaryConfig,
) -> EngineResult<RefreshReport> {
    let mut report = RefreshReport::default();

    let leaves = store.stale_summary_leaves(cfg.staleness_threshold, cfg.max_refresh_batch)?;
    for leaf in &leaves {
        match refresh_leaf(store, provider, cheap_model, cfg, leaf).await {
            Ok(()) => {
                embed_node(store, embedder, &leaf.key).await;
                report.leaves_refreshed += 1;
            }
            Err(e) => warn!("[summaries] Leaf '{}' refresh failed: {}", leaf.key, e),
        }
    }

    // Branches synthesize from children; the ORDER BY puts root last.
    let branches = store.stale_summary_branches(cfg.staleness_threshold)?;
    for branch in &branches {
        match refresh_branch(store, provider, cheap_model, cfg, branch).await {
            Ok(()) => {
                embed_node(store, embedder, &branch.key).await;
                report.branches_refreshed += 1;
            }
            Err(e) => warn!("[summaries] Branch '{}' refresh failed: {}", branch.key, e),
        }
    }

    if report.leaves_refreshed + report.branches_refreshed > 0 {
        info!(
            "[summaries] Refreshed {} leaves, {} branches",
            report.leaves_refreshed, report.branches_refreshed
        );
    }
    Ok(report)
}

async fn refresh_leaf(
    store: &MemoryStore,
    provider: &AnyProvider,
    cheap_model: &str,
    cfg: &SummaryConfig,
    leaf: &SummaryNode,
) -> EngineResult<()> {
    let sources = leaf_source_texts(store, leaf, cfg.max_source_events)?;
    if sources.is_empty() && leaf.summary.is_empty() {
        // Nothing to say yet; counter still resets so the node stops
        // presenting as stale.
        store.store_summary_refresh(&leaf.key, &leaf.summary, None)?;
        return Ok(());
    }
    let summary = summarize(provider, cheap_model, &leaf.key, &leaf.summary, &sources).await?;
    store.store_summary_refresh(&leaf.key, &summary, None)?;
    Ok(())
}

async fn refresh_branch(
    store: &MemoryStore,
    provider: &AnyProvider,
    cheap_model: &str,
    cfg: &SummaryConfig,
    branch: &SummaryNode,
) -> EngineResult<()> {
    let children = store.summary_children(&branch.id)?;
    let child_summaries: Vec<String> = children
        .iter()
        .filter(|c| !c.summary.is_empty())
        .map(|c| format!("{}: {}", c.key, c.summary))
        .collect();

    // Channel nodes have no children in the fixed shape — they summarize
    // their own channel's recent traffic instead.
    let sources = if child_summaries.is_empty() && branch.kind == SummaryKind::Channel {
        channel_source_texts(store, branch, cfg.max_source_events)?
    } else {
        child_summaries
    };

    if sources.is_empty() && branch.summary.is_empty() {
        store.store_summary_refresh(&branch.key, &branch.summary, None)?;
        return Ok(());
    }
    let summary = summarize(provider, cheap_model, &branch.key, &branch.summary, &sources).await?;
    store.store_summary_refresh(&branch.key, &summary, None)?;
    Ok(())
}

/// Source events for a leaf: entity sources, topic-tagged events, or
/// recent inbound preference statements.
fn leaf_source_texts(store: &MemoryStore, leaf: &SummaryNode, limit: usize) -> EngineResult<Vec<String>> {
    match leaf.kind {
        SummaryKind::Entity => {
            let entity_id = leaf.key.strip_prefix("entity:").unwrap_or("");
            let Some(entity) = store.get_entity(entity_id)? else { return Ok(vec![]) };
            let mut texts = Vec::new();
            for event_id in entity.source_event_ids.iter().rev().take(limit) {
                if let Some(event) = store.get_event(event_id)? {
                    texts.push(event.content);
                }
            }
            texts.reverse();
            Ok(texts)
        }
        SummaryKind::Topic => {
            let topic = leaf.key.strip_prefix("topic:").unwrap_or("");
            let conn = store.conn.lock();
            let mut stmt = conn.prepare(
                "SELECT e.content FROM events e
                 JOIN event_topics et ON et.event_id = e.id
                 JOIN topics t ON t.id = et.topic_id
                 WHERE t.name = ?1 ORDER BY e.timestamp DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(rusqlite::params![topic, limit as i64], |r| r.get::<_, String>(0))?;
            let mut texts: Vec<String> = rows.filter_map(|r| r.ok()).collect();
            texts.reverse();
            Ok(texts)
        }
        SummaryKind::Preferences => {
            let conn = store.conn.lock();
            let mut stmt = conn.prepare(
                "SELECT f.predicate || ' ' || f.object_text FROM facts f
                 WHERE f.kind = 'preference' AND f.superseded_by IS NULL
                 ORDER BY f.updated_at DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(rusqlite::params![limit as i64], |r| r.get::<_, String>(0))?;
            Ok(rows.filter_map(|r| r.ok()).collect())
        }
        _ => Ok(vec![]),
    }
}

fn channel_source_texts(store: &MemoryStore, node: &SummaryNode, limit: usize) -> EngineResult<Vec<String>> {
    let channel = node.key.strip_prefix("channel:").unwrap_or("");
    let conn = store.conn.lock();
    let mut stmt = conn.prepare(
        "SELECT content FROM events WHERE channel = ?1 AND kind IN ('message', 'bot_message')
         ORDER BY timestamp DESC LIMIT ?2",
    )?;
    let rows = stmt.query_map(rusqlite::params![channel, limit as i64], |r| r.get::<_, String>(0))?;
    let mut texts: Vec<String> = rows.filter_map(|r| r.ok()).collect();
    texts.reverse();
    Ok(texts)
}

async fn summarize(
    provider: &AnyProvider,
    cheap_model: &str,
    key: &str,
    previous: &str,
    sources: &[String],
) -> EngineResult<String> {
    let mut prompt = format!("Update the running summary for '{}'.\n", key);
    if !previous.is_empty() {
        prompt.push_str(&format!("Previous summary:\n{}\n\n", previous));
    }
    prompt.push_str("New material:\n");
    for source in sources {
        prompt.push_str("- ");
        prompt.push_str(crate::atoms::types::truncate_utf8(source, 400));
        prompt.push('\n');
    }
    prompt.push_str("\nReply with the updated summary only, at most four sentences.");

    let response = provider
        .chat(ChatRequest {
            model: cheap_model.to_string(),
            system: "You maintain terse factual summaries for an assistant's memory. \
                No preamble, no markdown."
                .to_string(),
            messages: vec![Message::user(prompt)],
            tools: vec![],
            tool_choice: None,
            temperature: Some(0.2),
            max_tokens: Some(300),
        })
        .await?;
    Ok(response.message.trim().to_string())
}

async fn embed_node(store: &MemoryStore, embedder: &EmbedderStack, key: &str) {
    let Ok(Some(node)) = store.summary_node(key) else { return };
    if node.summary.is_empty() {
        return;
    }
    match embedder.embed_one(&node.summary).await {
        Ok((provider_id, vector)) => {
            let blob = encode_vector(&provider_id, &vector);
            let conn = store.conn.lock();
            let _ = conn.execute(
                "UPDATE summary_nodes SET embedding = ?2 WHERE key = ?1",
                rusqlite::params![key, blob],
            );
        }
        Err(e) => warn!("[summaries] Could not embed summary '{}': {}", key, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::memory_types::{Direction, EventKind};
    use crate::engine::config::ExtractionConfig;
    use crate::engine::providers::ScriptedProvider;

    #[tokio::test]
    async fn stale_leaf_refreshes_and_counter_resets() {
        let store = MemoryStore::open_in_memory().unwrap();
        let embedder = EmbedderStack::hash(32);
        let cfg = SummaryConfig { staleness_threshold: 1, ..Default::default() };
        ensure_tree_skeleton(&store).unwrap();

        // Drive one event through extraction so a leaf goes stale.
        let mut ev = Event::new(
            "cli",
            Direction::Inbound,
            EventKind::Message,
            "Alice works at Acme Labs",
            "cli:#general",
        );
        store.append_event(&mut ev).unwrap();
        crate::engine::graph::extract_event(&store, &embedder, &ExtractionConfig::default(), &ev)
            .await
            .unwrap();

        let provider = AnyProvider::Scripted(ScriptedProvider::always("Alice is at Acme."));
        let report = refresh_cycle(&store, &provider, "cheap", &embedder, &cfg).await.unwrap();
        assert!(report.leaves_refreshed >= 1);

        let nodes = store.all_summary_nodes().unwrap();
        for node in nodes {
            assert_eq!(node.events_since_update, 0, "node {} still stale", node.key);
        }
    }

    #[tokio::test]
    async fn covering_keys_include_ancestors() {
        let store = MemoryStore::open_in_memory().unwrap();
        ensure_tree_skeleton(&store).unwrap();
        let mut ev = Event::new("telegram", Direction::Inbound, EventKind::Message, "hi", "tg:1");
        store.append_event(&mut ev).unwrap();
        let outcome = ExtractionOutcome::default();
        let keys = covering_keys(&store, &ev, &outcome).unwrap();
        assert!(keys.contains(&"root".to_string()));
        assert!(keys.contains(&"channel:telegram".to_string()));
    }
}
