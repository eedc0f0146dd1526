// ── MemoryStore: Summary Tree Tables ───────────────────────────────────────
// Persistence for the staleness-driven summary tree. Refresh policy lives in
// engine::summaries; this layer keeps the tree shape and the counters.

use super::{optional, MemoryStore};
use crate::atoms::error::EngineResult;
use crate::atoms::memory_types::{ExtractionStatus, SummaryKind, SummaryNode};
use log::warn;
use rusqlite::{params, Row};

const NODE_COLUMNS: &str = "id, kind, key, parent_id, summary, events_since_update, last_updated";

impl MemoryStore {
    /// Create the node if missing; returns its id either way.
    pub fn ensure_summary_node(
        &self,
        kind: SummaryKind,
        key: &str,
        parent_id: Option<&str>,
    ) -> EngineResult<String> {
        let conn = self.conn.lock();
        if let Some(id) = optional(conn.query_row(
            "SELECT id FROM summary_nodes WHERE key = ?1",
            params![key],
            |r| r.get(0),
        ))? {
            return Ok(id);
        }
        let id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT OR IGNORE INTO summary_nodes (id, kind, key, parent_id, summary, events_since_update)
             VALUES (?1, ?2, ?3, ?4, '', 0)",
            params![id, kind.as_str(), key, parent_id],
        )?;
        Ok(id)
    }

    pub fn summary_node(&self, key: &str) -> EngineResult<Option<SummaryNode>> {
        let conn = self.conn.lock();
        let result = conn.query_row(
            &format!("SELECT {} FROM summary_nodes WHERE key = ?1", NODE_COLUMNS),
            params![key],
            row_to_node,
        );
        optional(result)
    }

    pub fn summary_children(&self, parent_id: &str) -> EngineResult<Vec<SummaryNode>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM summary_nodes WHERE parent_id = ?1 ORDER BY key",
            NODE_COLUMNS
        ))?;
        let rows = stmt.query_map(params![parent_id], row_to_node)?;
        Ok(collect_nodes(rows))
    }

    pub fn all_summary_nodes(&self) -> EngineResult<Vec<SummaryNode>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare(&format!("SELECT {} FROM summary_nodes ORDER BY key", NODE_COLUMNS))?;
        let rows = stmt.query_map([], row_to_node)?;
        Ok(collect_nodes(rows))
    }

    /// Leaves whose counter reached the staleness threshold, stalest first.
    pub fn stale_summary_leaves(&self, threshold: i64, limit: usize) -> EngineResult<Vec<SummaryNode>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM summary_nodes
             WHERE kind IN ('entity', 'topic', 'preferences') AND events_since_update >= ?1
             ORDER BY events_since_update DESC LIMIT ?2",
            NODE_COLUMNS
        ))?;
        let rows = stmt.query_map(params![threshold, limit as i64], row_to_node)?;
        Ok(collect_nodes(rows))
    }

    /// Branches (channel / entity_type / root) with any staleness, deepest
    /// rank first so the root refreshes last.
    pub fn stale_summary_branches(&self, threshold: i64) -> EngineResult<Vec<SummaryNode>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM summary_nodes
             WHERE kind IN ('channel', 'entity_type', 'root') AND events_since_update >= ?1
             ORDER BY CASE kind WHEN 'root' THEN 2 ELSE 1 END ASC",
            NODE_COLUMNS
        ))?;
        let rows = stmt.query_map(params![threshold], row_to_node)?;
        Ok(collect_nodes(rows))
    }

    /// Atomically finish extraction for one event: set its status and bump
    /// `events_since_update` on every covering node in the same transaction.
    pub fn finish_event_extraction(
        &self,
        event_id: &str,
        status: ExtractionStatus,
        stale_keys: &[String],
    ) -> EngineResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE events SET extraction = ?2 WHERE id = ?1",
            params![event_id, status.as_str()],
        )?;
        for key in stale_keys {
            tx.execute(
                "UPDATE summary_nodes SET events_since_update = events_since_update + 1 WHERE key = ?1",
                params![key],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Store a refreshed summary: text + embedding, counter back to zero.
    pub fn store_summary_refresh(
        &self,
        key: &str,
        summary: &str,
        embedding: Option<&[u8]>,
    ) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE summary_nodes
             SET summary = ?2, embedding = ?3, events_since_update = 0, last_updated = ?4
             WHERE key = ?1",
            params![key, summary, embedding, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Max staleness across the tree (for `memory doctor`).
    pub fn summary_staleness_high_water(&self) -> EngineResult<i64> {
        let conn = self.conn.lock();
        let max: i64 = conn.query_row(
            "SELECT COALESCE(MAX(events_since_update), 0) FROM summary_nodes",
            [],
            |r| r.get(0),
        )?;
        Ok(max)
    }
}

fn row_to_node(row: &Row<'_>) -> Result<SummaryNode, rusqlite::Error> {
    let kind_str: String = row.get(1)?;
    let kind = SummaryKind::parse(&kind_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            "corrupt summary node kind".into(),
        )
    })?;
    Ok(SummaryNode {
        id: row.get(0)?,
        kind,
        key: row.get(2)?,
        parent_id: row.get(3)?,
        summary: row.get(4)?,
        events_since_update: row.get(5)?,
        last_updated: row.get(6)?,
    })
}

fn collect_nodes(
    rows: rusqlite::MappedRows<'_, impl FnMut(&Row<'_>) -> Result<SummaryNode, rusqlite::Error>>,
) -> Vec<SummaryNode> {
    let mut out = Vec::new();
    for row in rows {
        match row {
            Ok(node) => out.push(node),
            Err(e) => warn!("[store] Quarantined corrupt summary node row: {}", e),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::memory_types::{Direction, Event, EventKind};

    #[test]
    fn ensure_is_idempotent() {
        let store = MemoryStore::open_in_memory().unwrap();
        let root = store.ensure_summary_node(SummaryKind::Root, "root", None).unwrap();
        let again = store.ensure_summary_node(SummaryKind::Root, "root", None).unwrap();
        assert_eq!(root, again);
    }

    #[test]
    fn staleness_counts_and_resets() {
        let store = MemoryStore::open_in_memory().unwrap();
        store.ensure_summary_node(SummaryKind::Root, "root", None).unwrap();
        let root_id = store.summary_node("root").unwrap().unwrap().id;
        store
            .ensure_summary_node(SummaryKind::Preferences, "user_preferences", Some(&root_id))
            .unwrap();

        let mut e = Event::new("cli", Direction::Inbound, EventKind::Message, "hi", "cli:#g");
        store.append_event(&mut e).unwrap();
        store
            .finish_event_extraction(
                &e.id,
                ExtractionStatus::Complete,
                &["root".to_string(), "user_preferences".to_string()],
            )
            .unwrap();

        assert_eq!(store.summary_node("root").unwrap().unwrap().events_since_update, 1);
        store.store_summary_refresh("root", "all quiet", None).unwrap();
        let node = store.summary_node("root").unwrap().unwrap();
        assert_eq!(node.events_since_update, 0);
        assert_eq!(node.summary, "all quiet");
        assert!(node.last_updated.is_some());
    }
}
