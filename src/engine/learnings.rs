// ── Learning Store: Capture, Cross-Pollination, Decay ──────────────────────
//
// Bots accumulate private learnings; cross-pollination periodically promotes
// the most confident ones into the shared workspace pool with an append-only
// ledger entry. Relevance decays by half-life and is recomputed at read time
// — using a learning re-boosts it by touching `updated_at`.

use crate::atoms::error::EngineResult;
use crate::atoms::memory_types::{Learning, LearningSource, Sentiment};
use crate::engine::config::LearningConfig;
use crate::engine::embedder::EmbedderStack;
use crate::engine::store::{cosine_similarity, decode_vector, encode_vector, MemoryStore};
use log::info;
use std::collections::HashMap;

/// Categories a tool-outcome learning may share beyond its own bot.
const SHAREABLE_CATEGORIES: &[&str] = &["user_preference", "tool_pattern", "research_finding"];

pub fn is_shareable_category(category: &str) -> bool {
    SHAREABLE_CATEGORIES.contains(&category)
}

// ── Capture ────────────────────────────────────────────────────────────────

/// Record a new learning for a bot, embedding it and resolving
/// contradictions: an existing near-duplicate (cosine ≥ threshold) with the
/// opposite sentiment is superseded by the newcomer.
pub async fn capture(
    store: &MemoryStore,
    embedder: &EmbedderStack,
    cfg: &LearningConfig,
    bot_id: &str,
    content: &str,
    source: LearningSource,
    sentiment: Sentiment,
    confidence: f64,
    tool_name: Option<&str>,
    category: Option<&str>,
) -> EngineResult<Learning> {
    let now = chrono::Utc::now().to_rfc3339();
    let mut metadata = HashMap::new();
    if let Some(category) = category {
        metadata.insert("category".to_string(), serde_json::json!(category));
        metadata.insert(
            "shareable".to_string(),
            serde_json::json!(is_shareable_category(category)),
        );
    }
    let learning = Learning {
        id: uuid::Uuid::new_v4().to_string(),
        bot_id: bot_id.to_string(),
        content: content.to_string(),
        source,
        sentiment,
        confidence: confidence.clamp(0.0, 1.0),
        tool_name: tool_name.map(|t| t.to_string()),
        recommendation: String::new(),
        superseded_by: None,
        is_private: true,
        promotion_count: 0,
        metadata,
        created_at: now.clone(),
        updated_at: now,
    };

    let embedded = embedder.embed_one(content).await.ok();
    let blob = embedded.as_ref().map(|(p, v)| encode_vector(p, v));
    store.insert_learning(&learning, blob.as_deref())?;

    // Contradiction: near-duplicate with opposite sentiment loses to the
    // newer learning, chained via superseded_by.
    if let Some((provider, vector)) = &embedded {
        for (existing, existing_blob) in store.learning_embeddings(bot_id)? {
            if existing.id == learning.id || !existing.sentiment.opposes(sentiment) {
                continue;
            }
            let Some(existing_blob) = existing_blob else { continue };
            let Some((their_provider, their_vector)) = decode_vector(&existing_blob) else { continue };
            if their_provider != *provider {
                continue;
            }
            if cosine_similarity(vector, &their_vector) >= cfg.contradiction_threshold {
                info!(
                    "[learnings] '{}' contradicts '{}' for bot {} — superseding",
                    learning.content, existing.content, bot_id
                );
                store.supersede_learning(&existing.id, &learning.id)?;
            }
        }
    }

    Ok(learning)
}

// ── Relevance decay ────────────────────────────────────────────────────────

/// relevance = confidence * 2^(-age_days / half_life). Any actual use
/// re-boosts the learning by resetting updated_at (see touch_learning).
pub fn relevance(learning: &Learning, half_life_days: f64) -> f64 {
    let age_days = age_in_days(&learning.updated_at);
    learning.confidence * (2f64).powf(-age_days / half_life_days)
}

fn age_in_days(timestamp: &str) -> f64 {
    match chrono::DateTime::parse_from_rfc3339(timestamp) {
        Ok(then) => {
            let age = chrono::Utc::now().signed_duration_since(then.with_timezone(&chrono::Utc));
            (age.num_seconds() as f64 / 86_400.0).max(0.0)
        }
        Err(_) => 30.0,
    }
}

/// A bot's private learnings ranked by decayed relevance.
pub fn ranked_private(
    store: &MemoryStore,
    cfg: &LearningConfig,
    bot_id: &str,
    limit: usize,
) -> EngineResult<Vec<(Learning, f64)>> {
    let mut scored: Vec<(Learning, f64)> = store
        .private_learnings(bot_id)?
        .into_iter()
        .map(|l| {
            let score = relevance(&l, cfg.half_life_days);
            (l, score)
        })
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(limit);
    Ok(scored)
}

/// Shared-pool read for a bot: every returned learning counts as exposure.
pub fn read_shared_pool(store: &MemoryStore, limit: usize) -> EngineResult<Vec<Learning>> {
    let learnings = store.shared_learnings(limit)?;
    let ids: Vec<String> = learnings.iter().map(|l| l.id.clone()).collect();
    store.record_ledger_exposure(&ids)?;
    Ok(learnings)
}

// ── Cross-pollination ──────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct PollinationReport {
    pub bots_scanned: usize,
    pub promoted: usize,
}

/// Promote each bot's best private learnings into the shared pool:
/// confidence ≥ promotion threshold, ranked by confidence × recency weight,
/// capped per bot. Promotion and its ledger row commit together;
/// re-promotion is a no-op at the store.
pub fn cross_pollinate(
    store: &MemoryStore,
    cfg: &LearningConfig,
    promoted_by: &str,
) -> EngineResult<PollinationReport> {
    let mut report = PollinationReport::default();

    // Distinct bots holding private learnings.
    let bots: Vec<String> = {
        let conn = store.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT bot_id FROM learnings WHERE is_private = 1 AND superseded_by IS NULL",
        )?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        rows.filter_map(|r| r.ok()).collect()
    };

    for bot in bots {
        report.bots_scanned += 1;
        let mut eligible: Vec<(Learning, f64)> = store
            .private_learnings(&bot)?
            .into_iter()
            .filter(|l| l.confidence >= cfg.promotion_threshold)
            .map(|l| {
                let weight = l.confidence * (2f64).powf(-age_in_days(&l.updated_at) / cfg.half_life_days);
                (l, weight)
            })
            .collect();
        eligible.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        for (learning, _) in eligible.into_iter().take(cfg.max_promotions_per_bot) {
            let reason = format!("confidence {:.2} >= {:.2}", learning.confidence, cfg.promotion_threshold);
            if store.promote_learning(&learning.id, &bot, &reason, promoted_by)? {
                report.promoted += 1;
            }
        }
    }

    if report.promoted > 0 {
        info!(
            "[learnings] Cross-pollination promoted {} learnings across {} bots",
            report.promoted, report.bots_scanned
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> LearningConfig {
        LearningConfig::default()
    }

    #[tokio::test]
    async fn cross_pollination_promotes_top_three() {
        let store = MemoryStore::open_in_memory().unwrap();
        let embedder = EmbedderStack::hash(32);
        for (content, confidence) in [
            ("finding a", 0.92),
            ("finding b", 0.88),
            ("finding c", 0.80),
            ("finding d", 0.70),
            ("finding e", 0.95),
        ] {
            capture(
                &store,
                &embedder,
                &cfg(),
                "researcher",
                content,
                LearningSource::SelfEvaluation,
                Sentiment::Positive,
                confidence,
                None,
                None,
            )
            .await
            .unwrap();
        }

        let report = cross_pollinate(&store, &cfg(), "system").unwrap();
        assert_eq!(report.promoted, 3);

        let shared = store.shared_learnings(10).unwrap();
        let mut confidences: Vec<f64> = shared.iter().map(|l| l.confidence).collect();
        confidences.sort_by(|a, b| b.partial_cmp(a).unwrap());
        assert_eq!(confidences, vec![0.95, 0.92, 0.88]);

        // Remaining two stay private.
        assert_eq!(store.private_learnings("researcher").unwrap().len(), 2);

        // Re-running promotes nothing new.
        let again = cross_pollinate(&store, &cfg(), "system").unwrap();
        assert_eq!(again.promoted, 0);
    }

    #[tokio::test]
    async fn contradiction_supersedes_older() {
        let store = MemoryStore::open_in_memory().unwrap();
        let embedder = EmbedderStack::hash(64);
        let first = capture(
            &store,
            &embedder,
            &cfg(),
            "coder",
            "user likes verbose logging output",
            LearningSource::UserFeedback,
            Sentiment::Positive,
            0.8,
            None,
            None,
        )
        .await
        .unwrap();
        let _second = capture(
            &store,
            &embedder,
            &cfg(),
            "coder",
            "user likes verbose logging output",
            LearningSource::UserFeedback,
            Sentiment::Negative,
            0.85,
            None,
            None,
        )
        .await
        .unwrap();

        let remaining = store.private_learnings("coder").unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].sentiment, Sentiment::Negative);
        let old = store.get_learning(&first.id).unwrap().unwrap();
        assert!(old.superseded_by.is_some());
    }

    #[test]
    fn relevance_decays_with_age() {
        let mut l = Learning {
            id: "l1".into(),
            bot_id: "coder".into(),
            content: "x".into(),
            source: LearningSource::SelfEvaluation,
            sentiment: Sentiment::Neutral,
            confidence: 0.8,
            tool_name: None,
            recommendation: String::new(),
            superseded_by: None,
            is_private: true,
            promotion_count: 0,
            metadata: HashMap::new(),
            created_at: chrono::Utc::now().to_rfc3339(),
            updated_at: chrono::Utc::now().to_rfc3339(),
        };
        let fresh = relevance(&l, 14.0);
        assert!((fresh - 0.8).abs() < 0.01);

        l.updated_at = (chrono::Utc::now() - chrono::Duration::days(14)).to_rfc3339();
        let aged = relevance(&l, 14.0);
        assert!((aged - 0.4).abs() < 0.02);
    }

    #[test]
    fn shareable_categories() {
        assert!(is_shareable_category("tool_pattern"));
        assert!(!is_shareable_category("gossip"));
    }
}
