// ── MemoryStore: Event Log ─────────────────────────────────────────────────
// Append-only log of everything that happened. Within a session_key, events
// are totally ordered by a monotonic `seq` assigned inside the append
// transaction — never by wall clock. Corrupt rows are quarantined (skipped
// with a warning), never a panic in the agent loop.

use super::{optional, MemoryStore};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::memory_types::{Direction, Event, EventKind, ExtractionStatus};
use log::warn;
use rusqlite::{params, Connection, Row};

/// Filter for semantic / time-range queries over the log.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub session_key: Option<String>,
    pub kind: Option<EventKind>,
    pub channel: Option<String>,
    /// Only events at or after this RFC3339 timestamp.
    pub since: Option<String>,
    /// Size of the working set scanned by the flat search.
    pub working_set: usize,
}

impl MemoryStore {
    /// Append a single event in its own transaction (solo fsync).
    /// Events that ride a broker batch go through `append_events_batch`.
    pub fn append_event(&self, event: &mut Event) -> EngineResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        append_event_raw(&tx, event)?;
        tx.commit()?;
        Ok(())
    }

    /// Append many events in ONE transaction — the broker's group commit.
    /// All-or-nothing: either every event in the batch is durable or none.
    pub fn append_events_batch(&self, events: &mut [Event]) -> EngineResult<()> {
        if events.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for event in events.iter_mut() {
            append_event_raw(&tx, event)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_event(&self, id: &str) -> EngineResult<Option<Event>> {
        let conn = self.conn.lock();
        let result = conn.query_row(
            &format!("SELECT {} FROM events WHERE id = ?1", EVENT_COLUMNS),
            params![id],
            row_to_event,
        );
        optional(result)
    }

    /// Events of a session in seq order. `since_seq` excludes earlier rows.
    pub fn list_by_session(
        &self,
        session_key: &str,
        limit: usize,
        since_seq: i64,
    ) -> EngineResult<Vec<Event>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM events WHERE session_key = ?1 AND seq > ?2 ORDER BY seq ASC LIMIT ?3",
            EVENT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![session_key, since_seq, limit as i64], row_to_event)?;
        Ok(collect_quarantined(rows))
    }

    /// The most recent `limit` events of a session, oldest first.
    pub fn recent_session_events(&self, session_key: &str, limit: usize) -> EngineResult<Vec<Event>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM events WHERE session_key = ?1 ORDER BY seq DESC LIMIT ?2",
            EVENT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![session_key, limit as i64], row_to_event)?;
        let mut events = collect_quarantined(rows);
        events.reverse();
        Ok(events)
    }

    /// Events awaiting background extraction, oldest first.
    pub fn pending_extraction(&self, limit: usize) -> EngineResult<Vec<Event>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM events WHERE extraction = 'pending' ORDER BY timestamp ASC LIMIT ?1",
            EVENT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![limit as i64], row_to_event)?;
        Ok(collect_quarantined(rows))
    }

    pub fn mark_extraction(&self, id: &str, status: ExtractionStatus) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE events SET extraction = ?2 WHERE id = ?1",
            params![id, status.as_str()],
        )?;
        Ok(())
    }

    pub fn set_event_embedding(&self, id: &str, blob: &[u8]) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute("UPDATE events SET embedding = ?2 WHERE id = ?1", params![id, blob])?;
        Ok(())
    }

    /// Mark an event as used by a retrieval: bump last_accessed.
    pub fn touch_event(&self, id: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE events SET last_accessed = ?2 WHERE id = ?1",
            params![id, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Exact flat cosine search over a filtered working set. Events without
    /// a same-provider embedding are excluded (still readable by id/session).
    pub fn semantic_search_events(
        &self,
        provider_id: &str,
        query: &[f32],
        k: usize,
        filter: &EventFilter,
    ) -> EngineResult<Vec<(Event, f64)>> {
        let working_set = if filter.working_set == 0 { 2000 } else { filter.working_set };
        let mut sql = format!(
            "SELECT {} FROM events WHERE embedding IS NOT NULL",
            EVENT_COLUMNS
        );
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        if let Some(session) = &filter.session_key {
            args.push(Box::new(session.clone()));
            sql.push_str(&format!(" AND session_key = ?{}", args.len()));
        }
        if let Some(kind) = filter.kind {
            args.push(Box::new(kind.as_str().to_string()));
            sql.push_str(&format!(" AND kind = ?{}", args.len()));
        }
        if let Some(channel) = &filter.channel {
            args.push(Box::new(channel.clone()));
            sql.push_str(&format!(" AND channel = ?{}", args.len()));
        }
        if let Some(since) = &filter.since {
            args.push(Box::new(since.clone()));
            sql.push_str(&format!(" AND timestamp >= ?{}", args.len()));
        }
        args.push(Box::new(working_set as i64));
        sql.push_str(&format!(" ORDER BY timestamp DESC LIMIT ?{}", args.len()));

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let arg_refs: Vec<&dyn rusqlite::types::ToSql> = args.iter().map(|a| a.as_ref()).collect();
        let rows = stmt.query_map(arg_refs.as_slice(), |row| {
            let blob: Option<Vec<u8>> = row.get(8)?;
            Ok((row_to_event(row)?, blob))
        })?;

        let mut events: Vec<Event> = Vec::new();
        let mut blobs: Vec<Option<Vec<u8>>> = Vec::new();
        for row in rows {
            match row {
                Ok((event, blob)) => {
                    events.push(event);
                    blobs.push(blob);
                }
                Err(e) => warn!("[store] Quarantined corrupt event row: {}", e),
            }
        }

        let hits = super::embedding::flat_top_k(provider_id, query, &blobs, k);
        Ok(hits
            .into_iter()
            .map(|(idx, score)| (events[idx].clone(), score))
            .collect())
    }

    /// Events within an inclusive RFC3339 timestamp range.
    pub fn time_range(&self, from: &str, to: &str) -> EngineResult<Vec<Event>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM events WHERE timestamp >= ?1 AND timestamp <= ?2
             ORDER BY timestamp ASC",
            EVENT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![from, to], row_to_event)?;
        Ok(collect_quarantined(rows))
    }

    /// Count of events stuck in extraction backlog (for `memory doctor`).
    pub fn extraction_backlog(&self) -> EngineResult<(i64, i64)> {
        let conn = self.conn.lock();
        let pending: i64 =
            conn.query_row("SELECT COUNT(*) FROM events WHERE extraction = 'pending'", [], |r| r.get(0))?;
        let failed: i64 =
            conn.query_row("SELECT COUNT(*) FROM events WHERE extraction = 'failed'", [], |r| r.get(0))?;
        Ok((pending, failed))
    }
}

pub(crate) const EVENT_COLUMNS: &str = "id, session_key, seq, timestamp, channel, direction, kind, \
     content, embedding, parent_id, bot_name, bot_role, tool_name, extraction, relevance, \
     last_accessed, metadata";

/// Insert one event, assigning its per-session seq inside the caller's
/// transaction. Validates the structural invariants before writing.
pub(crate) fn append_event_raw(conn: &Connection, event: &mut Event) -> EngineResult<()> {
    if event.kind.requires_tool_name() && event.tool_name.is_none() {
        return Err(EngineError::Other(format!(
            "{} event {} missing tool_name",
            event.kind.as_str(),
            event.id
        )));
    }

    if let Some(parent_id) = &event.parent_id {
        let parent: Option<(String, String)> = optional(conn.query_row(
            "SELECT session_key, kind FROM events WHERE id = ?1",
            params![parent_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        ))?;
        match parent {
            None => {
                return Err(EngineError::Other(format!(
                    "event {} references missing parent {}",
                    event.id, parent_id
                )));
            }
            Some((parent_session, parent_kind)) => {
                if parent_session != event.session_key {
                    return Err(EngineError::Other(format!(
                        "event {} parent {} belongs to a different session",
                        event.id, parent_id
                    )));
                }
                if event.kind == EventKind::ToolResult && parent_kind != "tool_call" {
                    return Err(EngineError::Other(format!(
                        "tool_result {} parent {} is not a tool_call",
                        event.id, parent_id
                    )));
                }
            }
        }
    } else if event.kind == EventKind::ToolResult {
        return Err(EngineError::Other(format!(
            "tool_result {} has no tool_call parent",
            event.id
        )));
    }

    let seq: i64 = conn.query_row(
        "SELECT COALESCE(MAX(seq), 0) + 1 FROM events WHERE session_key = ?1",
        params![&event.session_key],
        |r| r.get(0),
    )?;
    event.seq = seq;

    let metadata = serde_json::to_string(&event.metadata)?;
    conn.execute(
        "INSERT INTO events (id, session_key, seq, timestamp, channel, direction, kind, content,
            parent_id, bot_name, bot_role, tool_name, extraction, relevance, last_accessed, metadata)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            event.id,
            event.session_key,
            event.seq,
            event.timestamp,
            event.channel,
            event.direction.as_str(),
            event.kind.as_str(),
            event.content,
            event.parent_id,
            event.bot_name,
            event.bot_role,
            event.tool_name,
            event.extraction.as_str(),
            event.relevance,
            event.last_accessed,
            metadata,
        ],
    )?;
    Ok(())
}

fn row_to_event(row: &Row<'_>) -> Result<Event, rusqlite::Error> {
    let direction_str: String = row.get(5)?;
    let kind_str: String = row.get(6)?;
    let extraction_str: String = row.get(13)?;
    let metadata_str: String = row.get(16)?;

    // An unknown enum tag or unparseable metadata quarantines the row.
    let invalid = |what: &str| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("corrupt event column: {}", what).into(),
        )
    };

    Ok(Event {
        id: row.get(0)?,
        session_key: row.get(1)?,
        seq: row.get(2)?,
        timestamp: row.get(3)?,
        channel: row.get(4)?,
        direction: Direction::parse(&direction_str).ok_or_else(|| invalid("direction"))?,
        kind: EventKind::parse(&kind_str).ok_or_else(|| invalid("kind"))?,
        content: row.get(7)?,
        parent_id: row.get(9)?,
        bot_name: row.get(10)?,
        bot_role: row.get(11)?,
        tool_name: row.get(12)?,
        extraction: ExtractionStatus::parse(&extraction_str).ok_or_else(|| invalid("extraction"))?,
        relevance: row.get(14)?,
        last_accessed: row.get(15)?,
        metadata: serde_json::from_str(&metadata_str).map_err(|_| invalid("metadata"))?,
    })
}

/// Collect mapped rows, skipping (and logging) corrupt ones.
fn collect_quarantined(
    rows: rusqlite::MappedRows<'_, impl FnMut(&Row<'_>) -> Result<Event, rusqlite::Error>>,
) -> Vec<Event> {
    let mut out = Vec::new();
    for row in rows {
        match row {
            Ok(event) => out.push(event),
            Err(e) => warn!("[store] Quarantined corrupt event row: {}", e),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        MemoryStore::open_in_memory().unwrap()
    }

    fn inbound(session: &str, content: &str) -> Event {
        Event::new("cli", Direction::Inbound, EventKind::Message, content, session)
    }

    #[test]
    fn append_assigns_monotonic_seq_per_session() {
        let store = store();
        let mut a = inbound("cli:#general", "A");
        let mut b = inbound("cli:#general", "B");
        let mut other = inbound("cli:#dev", "X");
        store.append_event(&mut a).unwrap();
        store.append_event(&mut other).unwrap();
        store.append_event(&mut b).unwrap();
        assert_eq!(a.seq, 1);
        assert_eq!(b.seq, 2);
        assert_eq!(other.seq, 1);

        let listed = store.list_by_session("cli:#general", 10, 0).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].content, "A");
        assert_eq!(listed[1].content, "B");
    }

    #[test]
    fn batch_append_is_ordered() {
        let store = store();
        let mut events: Vec<Event> =
            (0..5).map(|i| inbound("cli:#general", &format!("m{}", i))).collect();
        store.append_events_batch(&mut events).unwrap();
        let listed = store.list_by_session("cli:#general", 10, 0).unwrap();
        let seqs: Vec<i64> = listed.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn tool_result_requires_tool_call_parent() {
        let store = store();
        let mut call = Event::new("cli", Direction::Internal, EventKind::ToolCall, "{}", "s")
            .with_tool("read_file");
        store.append_event(&mut call).unwrap();

        let mut orphan = Event::new("cli", Direction::Internal, EventKind::ToolResult, "ok", "s")
            .with_tool("read_file");
        assert!(store.append_event(&mut orphan).is_err());

        let mut paired = Event::new("cli", Direction::Internal, EventKind::ToolResult, "ok", "s")
            .with_tool("read_file")
            .with_parent(call.id.clone());
        store.append_event(&mut paired).unwrap();
        assert!(paired.seq > call.seq);
    }

    #[test]
    fn tool_events_require_tool_name() {
        let store = store();
        let mut bad = Event::new("cli", Direction::Internal, EventKind::ToolCall, "{}", "s");
        assert!(store.append_event(&mut bad).is_err());
    }

    #[test]
    fn extraction_lifecycle() {
        let store = store();
        let mut e = inbound("cli:#general", "Alice works at Acme");
        store.append_event(&mut e).unwrap();
        let pending = store.pending_extraction(10).unwrap();
        assert_eq!(pending.len(), 1);
        store.mark_extraction(&e.id, ExtractionStatus::Complete).unwrap();
        assert!(store.pending_extraction(10).unwrap().is_empty());
    }

    #[test]
    fn semantic_search_filters_provider() {
        let store = store();
        let mut e1 = inbound("cli:#general", "rust ownership");
        let mut e2 = inbound("cli:#general", "gardening tips");
        store.append_event(&mut e1).unwrap();
        store.append_event(&mut e2).unwrap();
        store
            .set_event_embedding(&e1.id, &super::super::encode_vector("hash-2", &[1.0, 0.0]))
            .unwrap();
        store
            .set_event_embedding(&e2.id, &super::super::encode_vector("other-2", &[1.0, 0.0]))
            .unwrap();

        let hits = store
            .semantic_search_events("hash-2", &[1.0, 0.0], 5, &EventFilter::default())
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.id, e1.id);
    }
}
