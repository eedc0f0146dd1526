// ── Knowledge Graph: Extraction & Resolution ───────────────────────────────
//
// Turns raw events into entities, edges, facts, and topics. Extraction is
// heuristic (patterns + embeddings) — the background pipeline never calls an
// LLM; summary refresh is the only background path that does.
//
// Pipeline per event:
//   1. Mention extraction  – capitalized spans, @handles, emails
//   2. Entity resolution   – exact (name|alias, kind) match, then embedding
//                            candidates ≥ 0.78, merge at ≥ 0.85, else insert
//   3. Relation patterns   – "works at", "lives in", preference phrasing
//   4. Edge upsert         – +0.1 on re-mention (cap 1.0), 0.5 for new
//   5. Fact dedup          – corroborate, supersede, or coexist (set-valued)
//   6. Topic tagging       – significant keywords into topics/event_topics
//   7. Atomic finish       – extraction status + staleness counters in one
//                            transaction

use crate::atoms::error::EngineResult;
use crate::atoms::memory_types::{
    Entity, EntityKind, Event, EventKind, ExtractionStatus, Fact, FactKind,
};
use crate::engine::config::ExtractionConfig;
use crate::engine::embedder::EmbedderStack;
use crate::engine::store::{encode_vector, MemoryStore};
use crate::engine::summaries;
use log::{info, warn};
use regex::Regex;
use std::sync::LazyLock;

/// Half-life of 30 days for edge/fact strength: lambda = ln(2) / 30.
pub const DECAY_LAMBDA: f64 = std::f64::consts::LN_2 / 30.0;

// ── Mention extraction ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Mention {
    pub surface: String,
    pub kind: EntityKind,
}

static HANDLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@([A-Za-z][A-Za-z0-9_-]{1,31})").unwrap());
static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").unwrap());
static CAP_SPAN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([A-Z][a-z]+(?:\s+[A-Z][a-z]+){0,2})\b").unwrap());

const STOPWORDS: &[&str] = &[
    "the", "a", "an", "i", "we", "you", "he", "she", "it", "they", "this", "that", "these",
    "those", "my", "your", "our", "their", "is", "are", "was", "were", "be", "been", "being",
    "have", "has", "had", "do", "does", "did", "will", "would", "could", "should", "can", "and",
    "or", "but", "not", "with", "for", "from", "into", "about", "then", "than", "when", "what",
    "which", "who", "how", "why", "where", "there", "here", "please", "thanks", "okay", "yes",
    "also", "just", "very", "really", "today", "tomorrow", "yesterday", "make", "need", "want",
    "like", "sure", "maybe",
];

const ORG_SUFFIXES: &[&str] = &["inc", "corp", "labs", "ltd", "gmbh", "llc", "team", "co", "systems"];

/// Normalize a surface form for resolution: lowercase, strip punctuation.
pub fn normalize_surface(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_stopword(word: &str) -> bool {
    STOPWORDS.contains(&word.to_lowercase().as_str())
}

/// Pull candidate entity mentions out of free text. Heuristic by design —
/// resolution downstream cleans up duplicates and near-misses.
pub fn extract_mentions(text: &str) -> Vec<Mention> {
    let mut mentions: Vec<Mention> = Vec::new();
    let mut seen: Vec<String> = Vec::new();
    let mut push = |surface: String, kind: EntityKind| {
        let normalized = normalize_surface(&surface);
        if normalized.is_empty() || seen.contains(&normalized) {
            return;
        }
        seen.push(normalized);
        mentions.push(Mention { surface, kind });
    };

    for cap in HANDLE_RE.captures_iter(text) {
        push(cap[1].to_string(), EntityKind::Person);
    }
    for m in EMAIL_RE.find_iter(text) {
        push(m.as_str().to_string(), EntityKind::Person);
    }
    for cap in CAP_SPAN_RE.captures_iter(text) {
        let span = cap[1].to_string();
        let words: Vec<&str> = span.split_whitespace().collect();
        if words.iter().all(|w| is_stopword(w)) {
            continue;
        }
        // Trim stopword prefixes like "The" in "The Acme Team".
        let trimmed: Vec<&str> = words
            .iter()
            .skip_while(|w| is_stopword(w))
            .copied()
            .collect();
        if trimmed.is_empty() {
            continue;
        }
        let surface = trimmed.join(" ");
        let last = trimmed.last().map(|w| w.to_lowercase()).unwrap_or_default();
        let kind = if ORG_SUFFIXES.contains(&last.as_str()) {
            EntityKind::Org
        } else if trimmed.len() <= 2 {
            EntityKind::Person
        } else {
            EntityKind::Concept
        };
        push(surface, kind);
    }
    mentions
}

/// Significant keywords used as topic tags (lowercased, deduped, capped).
pub fn extract_topics(text: &str) -> Vec<String> {
    let mut topics = Vec::new();
    for word in text.split(|c: char| !c.is_alphanumeric()) {
        let lower = word.to_lowercase();
        if lower.len() >= 6 && !is_stopword(&lower) && !topics.contains(&lower) {
            topics.push(lower);
        }
        if topics.len() >= 3 {
            break;
        }
    }
    topics
}

// ── Relation patterns ──────────────────────────────────────────────────────

struct RelationPattern {
    regex: &'static str,
    rel: &'static str,
    fact_kind: FactKind,
}

const RELATION_PATTERNS: &[RelationPattern] = &[
    RelationPattern { regex: r"(?i)\bworks?\s+(?:at|for)\s+", rel: "works_at", fact_kind: FactKind::Relation },
    RelationPattern { regex: r"(?i)\blives?\s+in\s+", rel: "lives_in", fact_kind: FactKind::Attribute },
    RelationPattern { regex: r"(?i)\bmoved\s+to\s+", rel: "lives_in", fact_kind: FactKind::Attribute },
    RelationPattern { regex: r"(?i)\bmet\s+(?:with\s+)?", rel: "met", fact_kind: FactKind::Relation },
    RelationPattern { regex: r"(?i)\bmanages?\s+", rel: "manages", fact_kind: FactKind::Relation },
];

static PREFERENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:i|we)\s+(?:prefer|like|love|hate|dislike|always want|never want)\s+(.{3,80}?)(?:[.!?,]|$)")
        .unwrap()
});

/// Relations found between two resolved mentions in the same sentence.
fn relation_between(text: &str, a: &Mention, b: &Mention) -> Option<(&'static str, FactKind)> {
    let a_pos = text.find(&a.surface)?;
    let b_pos = text.find(&b.surface)?;
    let (start, end) = if a_pos < b_pos { (a_pos + a.surface.len(), b_pos) } else { (b_pos + b.surface.len(), a_pos) };
    let between = text.get(start..end)?;
    if between.len() > 40 || between.contains('.') {
        return None;
    }
    for pattern in RELATION_PATTERNS {
        let re = Regex::new(pattern.regex).ok()?;
        if re.is_match(between) {
            return Some((pattern.rel, pattern.fact_kind));
        }
    }
    None
}

// ── Entity resolution ──────────────────────────────────────────────────────

/// Resolve one mention to an entity id, creating the entity when nothing
/// matches. Implements: exact (name|alias, kind) → embedding candidates at
/// the candidate floor → merge when a single candidate clears the merge
/// threshold → otherwise insert new.
pub async fn resolve_entity(
    store: &MemoryStore,
    embedder: &EmbedderStack,
    cfg: &ExtractionConfig,
    mention: &Mention,
    event: &Event,
) -> EngineResult<String> {
    let normalized = normalize_surface(&mention.surface);
    let now = event.timestamp.clone();

    // 1–2. Exact match by normalized name, then alias.
    if let Some(entity) = store.find_entity_exact(&normalized, mention.kind)? {
        store.record_entity_mention(&entity.id, None, &event.id, &now)?;
        return Ok(entity.id);
    }
    if let Some(entity) = store.find_entity_by_alias(&normalized, mention.kind)? {
        store.record_entity_mention(&entity.id, None, &event.id, &now)?;
        return Ok(entity.id);
    }

    // 3–4. Embedding candidates: merge only a single confident match.
    let embedded = embedder.embed_one(&mention.surface).await.ok();
    if let Some((provider_id, vector)) = &embedded {
        let candidates =
            store.entity_candidates(provider_id, vector, mention.kind, 5, cfg.candidate_threshold)?;
        let confident: Vec<_> = candidates
            .iter()
            .filter(|(_, score)| *score >= cfg.merge_threshold)
            .collect();
        if confident.len() == 1 {
            let (entity, score) = confident[0];
            info!(
                "[graph] Merging mention '{}' into entity '{}' (cosine {:.2})",
                mention.surface, entity.name, score
            );
            store.record_entity_mention(&entity.id, Some(&normalized), &event.id, &now)?;
            return Ok(entity.id.clone());
        }
    }

    // 5. New entity.
    let entity = Entity {
        id: uuid::Uuid::new_v4().to_string(),
        name: mention.surface.clone(),
        kind: mention.kind,
        aliases: vec![],
        description: String::new(),
        source_event_ids: vec![event.id.clone()],
        event_count: 1,
        first_seen: now.clone(),
        last_seen: now,
    };
    let blob = embedded.as_ref().map(|(p, v)| encode_vector(p, v));
    store.insert_entity(&entity, &normalized, blob.as_deref())?;
    Ok(entity.id)
}

// ── Fact dedup ─────────────────────────────────────────────────────────────

/// Predicates that may legitimately hold several objects at once.
fn is_set_valued(predicate: &str) -> bool {
    matches!(predicate, "met" | "knows" | "works_with" | "mentioned_with" | "interested_in")
}

/// Insert a fact with the dedup/contradiction policy: same object
/// corroborates; a confident contradiction supersedes; an unconfident one
/// only re-boosts the incumbent; set-valued predicates coexist.
pub fn upsert_fact(
    store: &MemoryStore,
    subject_id: &str,
    predicate: &str,
    object_text: &str,
    object_entity_id: Option<&str>,
    kind: FactKind,
    confidence: f64,
    event_id: &str,
) -> EngineResult<Option<String>> {
    let existing = store.active_facts(subject_id, Some(predicate))?;
    let now = chrono::Utc::now().to_rfc3339();

    for old in &existing {
        if old.object_text.eq_ignore_ascii_case(object_text) {
            store.boost_fact(&old.id, event_id)?;
            return Ok(Some(old.id.clone()));
        }
    }

    if !existing.is_empty() && !is_set_valued(predicate) {
        let incumbent = &existing[0];
        if confidence < incumbent.confidence + 0.1 {
            store.boost_fact(&incumbent.id, event_id)?;
            return Ok(None);
        }
        let fact = new_fact(subject_id, predicate, object_text, object_entity_id, kind, confidence, event_id, &now);
        store.insert_fact(&fact)?;
        store.supersede_fact(&incumbent.id, &fact.id)?;
        info!(
            "[graph] Fact superseded: {} {} '{}' -> '{}'",
            subject_id, predicate, incumbent.object_text, object_text
        );
        return Ok(Some(fact.id));
    }

    let fact = new_fact(subject_id, predicate, object_text, object_entity_id, kind, confidence, event_id, &now);
    store.insert_fact(&fact)?;
    Ok(Some(fact.id))
}

#[allow(clippy::too_many_arguments)]
fn new_fact(
    subject_id: &str,
    predicate: &str,
    object_text: &str,
    object_entity_id: Option<&str>,
    kind: FactKind,
    confidence: f64,
    event_id: &str,
    now: &str,
) -> Fact {
    Fact {
        id: uuid::Uuid::new_v4().to_string(),
        subject_id: subject_id.to_string(),
        predicate: predicate.to_string(),
        object_text: object_text.to_string(),
        object_entity_id: object_entity_id.map(|s| s.to_string()),
        kind,
        confidence,
        strength: 0.5,
        source_event_ids: vec![event_id.to_string()],
        valid_from: Some(now.to_string()),
        valid_to: None,
        superseded_by: None,
        created_at: now.to_string(),
        updated_at: now.to_string(),
    }
}

// ── Per-event pipeline ─────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct ExtractionOutcome {
    pub entity_ids: Vec<String>,
    pub topic_names: Vec<String>,
    pub edges: usize,
    pub facts: usize,
    pub preference_found: bool,
}

/// Run the full heuristic pipeline for one event and finish it atomically
/// (status + staleness counters in one transaction). Tool events are
/// skipped — their payloads are machine-generated JSON.
pub async fn extract_event(
    store: &MemoryStore,
    embedder: &EmbedderStack,
    cfg: &ExtractionConfig,
    event: &Event,
) -> EngineResult<ExtractionOutcome> {
    let mut outcome = ExtractionOutcome::default();

    if matches!(event.kind, EventKind::ToolCall | EventKind::ToolResult) {
        store.finish_event_extraction(&event.id, ExtractionStatus::Skipped, &[])?;
        return Ok(outcome);
    }

    let mentions = extract_mentions(&event.content);
    let mut resolved: Vec<(Mention, String)> = Vec::new();
    for mention in mentions {
        let result = resolve_entity(store, embedder, cfg, &mention, event).await;
        match result {
            Ok(id) => {
                outcome.entity_ids.push(id.clone());
                resolved.push((mention, id));
            }
            Err(e) => warn!("[graph] Failed to resolve mention '{}': {}", mention.surface, e),
        }
    }

    // Edges + relation facts between co-mentioned entities.
    for i in 0..resolved.len() {
        for j in (i + 1)..resolved.len() {
            let (ma, ida) = &resolved[i];
            let (mb, idb) = &resolved[j];
            if ida == idb {
                continue;
            }
            let (rel, fact_kind) = relation_between(&event.content, ma, mb)
                .unwrap_or(("mentioned_with", FactKind::Relation));
            store.upsert_edge(ida, rel, idb, &event.id)?;
            outcome.edges += 1;
            if rel != "mentioned_with" {
                if upsert_fact(store, ida, rel, &mb.surface, Some(idb), fact_kind, 0.6, &event.id)?
                    .is_some()
                {
                    outcome.facts += 1;
                }
            }
        }
    }

    // Preference facts attach to the speaking user as a concept entity.
    if event.direction == crate::atoms::memory_types::Direction::Inbound {
        for cap in PREFERENCE_RE.captures_iter(&event.content) {
            let preference = cap[1].trim().to_string();
            let user = resolve_entity(
                store,
                embedder,
                cfg,
                &Mention { surface: "User".into(), kind: EntityKind::Person },
                event,
            )
            .await?;
            if upsert_fact(store, &user, "prefers", &preference, None, FactKind::Preference, 0.7, &event.id)?
                .is_some()
            {
                outcome.facts += 1;
            }
            outcome.preference_found = true;
        }
    }

    // Topic tags.
    for topic in extract_topics(&event.content) {
        let topic_id = store.upsert_topic(&topic, None)?;
        store.link_event_topic(&event.id, &topic_id)?;
        outcome.topic_names.push(topic);
    }

    // Atomic finish: status + counters on every covering summary node.
    let stale_keys = summaries::covering_keys(store, event, &outcome)?;
    store.finish_event_extraction(&event.id, ExtractionStatus::Complete, &stale_keys)?;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::memory_types::Direction;
    use crate::engine::config::ExtractionConfig;

    fn event(content: &str) -> Event {
        Event::new("cli", Direction::Inbound, EventKind::Message, content, "cli:#general")
    }

    #[test]
    fn mentions_pick_up_names_handles_orgs() {
        let mentions = extract_mentions("Alice met @bob at Acme Labs yesterday");
        let surfaces: Vec<&str> = mentions.iter().map(|m| m.surface.as_str()).collect();
        assert!(surfaces.contains(&"Alice"));
        assert!(surfaces.contains(&"bob"));
        assert!(surfaces.iter().any(|s| s.contains("Acme")));
        let acme = mentions.iter().find(|m| m.surface.contains("Acme")).unwrap();
        assert_eq!(acme.kind, EntityKind::Org);
    }

    #[test]
    fn normalization_strips_punctuation() {
        assert_eq!(normalize_surface("  Acme, Inc.! "), "acme inc");
        assert_eq!(normalize_surface("Alice"), "alice");
    }

    #[tokio::test]
    async fn resolution_reuses_exact_matches() {
        let store = MemoryStore::open_in_memory().unwrap();
        let embedder = EmbedderStack::hash(64);
        let cfg = ExtractionConfig::default();
        let mut ev = event("Alice joined");
        store.append_event(&mut ev).unwrap();

        let mention = Mention { surface: "Alice".into(), kind: EntityKind::Person };
        let first = resolve_entity(&store, &embedder, &cfg, &mention, &ev).await.unwrap();
        let second = resolve_entity(&store, &embedder, &cfg, &mention, &ev).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.list_entities(Some(EntityKind::Person), 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn full_pipeline_builds_graph_and_marks_complete() {
        let store = MemoryStore::open_in_memory().unwrap();
        let embedder = EmbedderStack::hash(64);
        let cfg = ExtractionConfig::default();
        crate::engine::summaries::ensure_tree_skeleton(&store).unwrap();

        let mut ev = event("Alice works at Acme Labs. I prefer concise updates please.");
        store.append_event(&mut ev).unwrap();
        let outcome = extract_event(&store, &embedder, &cfg, &ev).await.unwrap();

        assert!(outcome.entity_ids.len() >= 2);
        assert!(outcome.edges >= 1);
        assert!(outcome.preference_found);
        let got = store.get_event(&ev.id).unwrap().unwrap();
        assert_eq!(got.extraction, ExtractionStatus::Complete);

        // The preferences leaf saw the event.
        let prefs = store.summary_node("user_preferences").unwrap().unwrap();
        assert!(prefs.events_since_update >= 1);
    }

    #[test]
    fn fact_contradiction_policy() {
        let store = MemoryStore::open_in_memory().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        let subject = Entity {
            id: "e1".into(),
            name: "Alice".into(),
            kind: EntityKind::Person,
            aliases: vec![],
            description: String::new(),
            source_event_ids: vec![],
            event_count: 0,
            first_seen: now.clone(),
            last_seen: now,
        };
        store.insert_entity(&subject, "alice", None).unwrap();

        upsert_fact(&store, "e1", "lives_in", "Berlin", None, FactKind::Attribute, 0.6, "ev1").unwrap();
        // Low-confidence contradiction: incumbent stays.
        upsert_fact(&store, "e1", "lives_in", "Lisbon", None, FactKind::Attribute, 0.65, "ev2").unwrap();
        let active = store.active_facts("e1", Some("lives_in")).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].object_text, "Berlin");

        // Confident contradiction supersedes.
        upsert_fact(&store, "e1", "lives_in", "Lisbon", None, FactKind::Attribute, 0.9, "ev3").unwrap();
        let active = store.active_facts("e1", Some("lives_in")).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].object_text, "Lisbon");

        // Set-valued predicates coexist.
        upsert_fact(&store, "e1", "met", "Bob", None, FactKind::Relation, 0.6, "ev4").unwrap();
        upsert_fact(&store, "e1", "met", "Carol", None, FactKind::Relation, 0.6, "ev5").unwrap();
        assert_eq!(store.active_facts("e1", Some("met")).unwrap().len(), 2);
    }
}
