// ── MemoryStore: Learnings, Promotion Ledger, Bot Expertise ────────────────
// Private per-bot learnings vs the shared workspace pool, the append-only
// promotion ledger, and (bot, domain) expertise counters. Promotion flips
// `is_private` and writes the ledger row in ONE transaction.

use super::{optional, MemoryStore};
use crate::atoms::error::EngineResult;
use crate::atoms::memory_types::{BotExpertise, Learning, LearningSource, LedgerEntry, Sentiment};
use log::warn;
use rusqlite::{params, Row};

const LEARNING_COLUMNS: &str = "id, bot_id, content, source, sentiment, confidence, tool_name, \
     recommendation, superseded_by, is_private, promotion_count, metadata, created_at, updated_at";

impl MemoryStore {
    // ── Learnings ──────────────────────────────────────────────────────

    pub fn insert_learning(&self, learning: &Learning, embedding: Option<&[u8]>) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO learnings (id, bot_id, content, embedding, source, sentiment, confidence,
                tool_name, recommendation, superseded_by, is_private, promotion_count, metadata,
                created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                learning.id,
                learning.bot_id,
                learning.content,
                embedding,
                learning.source.as_str(),
                learning.sentiment.as_str(),
                learning.confidence,
                learning.tool_name,
                learning.recommendation,
                learning.superseded_by,
                learning.is_private as i64,
                learning.promotion_count,
                serde_json::to_string(&learning.metadata)?,
                learning.created_at,
                learning.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_learning(&self, id: &str) -> EngineResult<Option<Learning>> {
        let conn = self.conn.lock();
        let result = conn.query_row(
            &format!("SELECT {} FROM learnings WHERE id = ?1", LEARNING_COLUMNS),
            params![id],
            row_to_learning,
        );
        optional(result)
    }

    /// A bot's private, non-superseded learnings.
    pub fn private_learnings(&self, bot_id: &str) -> EngineResult<Vec<Learning>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM learnings
             WHERE bot_id = ?1 AND is_private = 1 AND superseded_by IS NULL
             ORDER BY updated_at DESC",
            LEARNING_COLUMNS
        ))?;
        let rows = stmt.query_map(params![bot_id], row_to_learning)?;
        Ok(collect_learnings(rows))
    }

    /// The shared workspace pool (non-superseded).
    pub fn shared_learnings(&self, limit: usize) -> EngineResult<Vec<Learning>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM learnings
             WHERE is_private = 0 AND superseded_by IS NULL
             ORDER BY confidence DESC, updated_at DESC LIMIT ?1",
            LEARNING_COLUMNS
        ))?;
        let rows = stmt.query_map(params![limit as i64], row_to_learning)?;
        Ok(collect_learnings(rows))
    }

    /// Embedding blobs for a bot's learnings (contradiction detection).
    pub fn learning_embeddings(&self, bot_id: &str) -> EngineResult<Vec<(Learning, Option<Vec<u8>>)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {}, embedding FROM learnings
             WHERE bot_id = ?1 AND superseded_by IS NULL",
            LEARNING_COLUMNS
        ))?;
        let rows = stmt.query_map(params![bot_id], |row| {
            let blob: Option<Vec<u8>> = row.get(14)?;
            Ok((row_to_learning(row)?, blob))
        })?;
        let mut out = Vec::new();
        for row in rows {
            match row {
                Ok(pair) => out.push(pair),
                Err(e) => warn!("[store] Quarantined corrupt learning row: {}", e),
            }
        }
        Ok(out)
    }

    pub fn supersede_learning(&self, old_id: &str, new_id: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE learnings SET superseded_by = ?2, updated_at = ?3 WHERE id = ?1",
            params![old_id, new_id, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// A learning that was actually used gets its recency re-boosted.
    pub fn touch_learning(&self, id: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE learnings SET updated_at = ?2 WHERE id = ?1",
            params![id, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    // ── Promotion (cross-pollination) ──────────────────────────────────

    /// Promote a private learning into the shared pool. The flip and the
    /// ledger row commit together; re-promotion is a no-op (ledger row
    /// already exists). Returns true when a promotion actually happened.
    pub fn promote_learning(
        &self,
        learning_id: &str,
        bot_id: &str,
        reason: &str,
        promoted_by: &str,
    ) -> EngineResult<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let already: i64 = tx.query_row(
            "SELECT COUNT(*) FROM bot_memory_ledger WHERE learning_id = ?1",
            params![learning_id],
            |r| r.get(0),
        )?;
        if already > 0 {
            return Ok(false);
        }
        tx.execute(
            "UPDATE learnings SET is_private = 0, promotion_count = promotion_count + 1,
                updated_at = ?2
             WHERE id = ?1",
            params![learning_id, chrono::Utc::now().to_rfc3339()],
        )?;
        tx.execute(
            "INSERT INTO bot_memory_ledger
                (id, learning_id, bot_id, original_scope, promotion_date, reason,
                 cross_pollinated_by, exposure_count)
             VALUES (?1, ?2, ?3, 'private', ?4, ?5, ?6, 0)",
            params![
                uuid::Uuid::new_v4().to_string(),
                learning_id,
                bot_id,
                chrono::Utc::now().to_rfc3339(),
                reason,
                promoted_by,
            ],
        )?;
        tx.commit()?;
        Ok(true)
    }

    pub fn ledger_entries(&self, learning_id: Option<&str>) -> EngineResult<Vec<LedgerEntry>> {
        let conn = self.conn.lock();
        let mut out = Vec::new();
        let map = |row: &Row<'_>| -> Result<LedgerEntry, rusqlite::Error> {
            Ok(LedgerEntry {
                id: row.get(0)?,
                learning_id: row.get(1)?,
                bot_id: row.get(2)?,
                original_scope: row.get(3)?,
                promotion_date: row.get(4)?,
                reason: row.get(5)?,
                cross_pollinated_by: row.get(6)?,
                exposure_count: row.get(7)?,
            })
        };
        let sql = "SELECT id, learning_id, bot_id, original_scope, promotion_date, reason,
                       cross_pollinated_by, exposure_count
                   FROM bot_memory_ledger";
        if let Some(learning_id) = learning_id {
            let mut stmt = conn.prepare(&format!("{} WHERE learning_id = ?1", sql))?;
            let rows = stmt.query_map(params![learning_id], map)?;
            out.extend(rows.filter_map(|r| r.ok()));
        } else {
            let mut stmt = conn.prepare(&format!("{} ORDER BY promotion_date", sql))?;
            let rows = stmt.query_map([], map)?;
            out.extend(rows.filter_map(|r| r.ok()));
        }
        Ok(out)
    }

    /// Every shared-pool read by a bot counts as exposure.
    pub fn record_ledger_exposure(&self, learning_ids: &[String]) -> EngineResult<()> {
        let conn = self.conn.lock();
        for id in learning_ids {
            conn.execute(
                "UPDATE bot_memory_ledger SET exposure_count = exposure_count + 1
                 WHERE learning_id = ?1",
                params![id],
            )?;
        }
        Ok(())
    }

    // ── Bot expertise ──────────────────────────────────────────────────

    /// Record a terminated task against the bot's domain record.
    pub fn record_expertise(&self, bot_id: &str, domain: &str, success: bool) -> EngineResult<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO bot_expertise (bot_id, domain, interaction_count, success_count, last_success_at)
             VALUES (?1, ?2, 1, ?3, ?4)
             ON CONFLICT(bot_id, domain) DO UPDATE SET
                interaction_count = interaction_count + 1,
                success_count = success_count + ?3,
                last_success_at = CASE WHEN ?3 = 1 THEN ?4 ELSE last_success_at END",
            params![bot_id, domain, success as i64, now],
        )?;
        Ok(())
    }

    pub fn expertise_for_domain(&self, domain: &str) -> EngineResult<Vec<BotExpertise>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT bot_id, domain, interaction_count, success_count, last_success_at
             FROM bot_expertise WHERE domain = ?1",
        )?;
        let rows = stmt.query_map(params![domain], |row| {
            Ok(BotExpertise {
                bot_id: row.get(0)?,
                domain: row.get(1)?,
                interaction_count: row.get(2)?,
                success_count: row.get(3)?,
                last_success_at: row.get(4)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Best bot for a domain: highest Laplace-smoothed score, ties broken
    /// by most recent success.
    pub fn best_bot_for_domain(&self, domain: &str, candidates: &[String]) -> EngineResult<Option<String>> {
        let mut records = self.expertise_for_domain(domain)?;
        records.retain(|r| candidates.iter().any(|c| c == &r.bot_id));
        records.sort_by(|a, b| {
            b.score()
                .partial_cmp(&a.score())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.last_success_at.cmp(&a.last_success_at))
        });
        Ok(records.first().map(|r| r.bot_id.clone()))
    }
}

fn row_to_learning(row: &Row<'_>) -> Result<Learning, rusqlite::Error> {
    let source_str: String = row.get(3)?;
    let sentiment_str: String = row.get(4)?;
    let metadata_str: String = row.get(11)?;
    let is_private: i64 = row.get(9)?;
    let invalid = |what: &str| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("corrupt learning column: {}", what).into(),
        )
    };
    Ok(Learning {
        id: row.get(0)?,
        bot_id: row.get(1)?,
        content: row.get(2)?,
        source: LearningSource::parse(&source_str).ok_or_else(|| invalid("source"))?,
        sentiment: Sentiment::parse(&sentiment_str).ok_or_else(|| invalid("sentiment"))?,
        confidence: row.get(5)?,
        tool_name: row.get(6)?,
        recommendation: row.get(7)?,
        superseded_by: row.get(8)?,
        is_private: is_private != 0,
        promotion_count: row.get(10)?,
        metadata: serde_json::from_str(&metadata_str).map_err(|_| invalid("metadata"))?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

fn collect_learnings(
    rows: rusqlite::MappedRows<'_, impl FnMut(&Row<'_>) -> Result<Learning, rusqlite::Error>>,
) -> Vec<Learning> {
    let mut out = Vec::new();
    for row in rows {
        match row {
            Ok(learning) => out.push(learning),
            Err(e) => warn!("[store] Quarantined corrupt learning row: {}", e),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn learning(bot: &str, content: &str, confidence: f64) -> Learning {
        let now = chrono::Utc::now().to_rfc3339();
        Learning {
            id: uuid::Uuid::new_v4().to_string(),
            bot_id: bot.into(),
            content: content.into(),
            source: LearningSource::SelfEvaluation,
            sentiment: Sentiment::Positive,
            confidence,
            tool_name: None,
            recommendation: String::new(),
            superseded_by: None,
            is_private: true,
            promotion_count: 0,
            metadata: HashMap::new(),
            created_at: now.clone(),
            updated_at: now,
        }
    }

    #[test]
    fn promotion_roundtrip_with_single_ledger_entry() {
        let store = MemoryStore::open_in_memory().unwrap();
        let l = learning("researcher", "short queries beat long ones", 0.9);
        store.insert_learning(&l, None).unwrap();

        assert!(store.promote_learning(&l.id, "researcher", "high confidence", "system").unwrap());
        // Re-promotion is a no-op.
        assert!(!store.promote_learning(&l.id, "researcher", "again", "system").unwrap());

        let shared = store.shared_learnings(10).unwrap();
        assert_eq!(shared.len(), 1);
        assert!(!shared[0].is_private);

        let ledger = store.ledger_entries(Some(&l.id)).unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].bot_id, "researcher");
        assert_eq!(ledger[0].original_scope, "private");
    }

    #[test]
    fn exposure_counts_increment() {
        let store = MemoryStore::open_in_memory().unwrap();
        let l = learning("coder", "run tests before claiming done", 0.8);
        store.insert_learning(&l, None).unwrap();
        store.promote_learning(&l.id, "coder", "", "system").unwrap();
        store.record_ledger_exposure(&[l.id.clone()]).unwrap();
        store.record_ledger_exposure(&[l.id.clone()]).unwrap();
        let ledger = store.ledger_entries(Some(&l.id)).unwrap();
        assert_eq!(ledger[0].exposure_count, 2);
    }

    #[test]
    fn expertise_best_bot_breaks_ties_by_recency() {
        let store = MemoryStore::open_in_memory().unwrap();
        store.record_expertise("researcher", "research", true).unwrap();
        store.record_expertise("coder", "research", false).unwrap();
        let best = store
            .best_bot_for_domain("research", &["researcher".into(), "coder".into()])
            .unwrap();
        assert_eq!(best.as_deref(), Some("researcher"));
        // A candidate filter that excludes the best yields the other.
        let best = store.best_bot_for_domain("research", &["coder".into()]).unwrap();
        assert_eq!(best.as_deref(), Some("coder"));
    }
}
