// ── MemoryStore: Knowledge Graph Tables ────────────────────────────────────
// SQL for entities, edges, facts, and topics. Resolution and decay policy
// live in engine::graph; this layer is plain persistence with the uniqueness
// and supersede invariants enforced at the row level.

use super::{optional, MemoryStore};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::memory_types::{Edge, Entity, EntityKind, Fact, FactKind};
use log::warn;
use rusqlite::{params, Row};

const ENTITY_COLUMNS: &str =
    "id, name, normalized, kind, aliases, description, source_event_ids, event_count, first_seen, last_seen";

const FACT_COLUMNS: &str = "id, subject_id, predicate, object_text, object_entity_id, kind, \
     confidence, strength, source_event_ids, valid_from, valid_to, superseded_by, created_at, updated_at";

impl MemoryStore {
    // ── Entities ───────────────────────────────────────────────────────

    pub fn insert_entity(&self, entity: &Entity, normalized: &str, embedding: Option<&[u8]>) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO entities (id, name, normalized, kind, aliases, description,
                name_embedding, source_event_ids, event_count, first_seen, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                entity.id,
                entity.name,
                normalized,
                entity.kind.as_str(),
                serde_json::to_string(&entity.aliases)?,
                entity.description,
                embedding,
                serde_json::to_string(&entity.source_event_ids)?,
                entity.event_count,
                entity.first_seen,
                entity.last_seen,
            ],
        )?;
        Ok(())
    }

    pub fn get_entity(&self, id: &str) -> EngineResult<Option<Entity>> {
        let conn = self.conn.lock();
        let result = conn.query_row(
            &format!("SELECT {} FROM entities WHERE id = ?1", ENTITY_COLUMNS),
            params![id],
            row_to_entity,
        );
        optional(result)
    }

    /// Exact match on the resolved `(normalized name, kind)` pair.
    pub fn find_entity_exact(&self, normalized: &str, kind: EntityKind) -> EngineResult<Option<Entity>> {
        let conn = self.conn.lock();
        let result = conn.query_row(
            &format!(
                "SELECT {} FROM entities WHERE normalized = ?1 AND kind = ?2",
                ENTITY_COLUMNS
            ),
            params![normalized, kind.as_str()],
            row_to_entity,
        );
        optional(result)
    }

    /// Match against aliases of a kind: aliases are stored as a JSON array,
    /// scanned in code — the alias list is short by construction.
    pub fn find_entity_by_alias(&self, normalized: &str, kind: EntityKind) -> EngineResult<Option<Entity>> {
        for entity in self.list_entities(Some(kind), 10_000)? {
            if entity.aliases.iter().any(|a| a == normalized) {
                return Ok(Some(entity));
            }
        }
        Ok(None)
    }

    /// Loose lookup by display name or alias, any kind (CLI `memory entity`).
    pub fn find_entity_named(&self, name: &str) -> EngineResult<Option<Entity>> {
        let needle = name.to_lowercase();
        for entity in self.list_entities(None, 10_000)? {
            if entity.name.to_lowercase() == needle || entity.aliases.iter().any(|a| a == &needle) {
                return Ok(Some(entity));
            }
        }
        Ok(None)
    }

    pub fn list_entities(&self, kind: Option<EntityKind>, limit: usize) -> EngineResult<Vec<Entity>> {
        let conn = self.conn.lock();
        let mut out = Vec::new();
        if let Some(kind) = kind {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM entities WHERE kind = ?1 ORDER BY event_count DESC LIMIT ?2",
                ENTITY_COLUMNS
            ))?;
            let rows = stmt.query_map(params![kind.as_str(), limit as i64], row_to_entity)?;
            for row in rows {
                match row {
                    Ok(entity) => out.push(entity),
                    Err(e) => warn!("[store] Quarantined corrupt entity row: {}", e),
                }
            }
        } else {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM entities ORDER BY event_count DESC LIMIT ?1",
                ENTITY_COLUMNS
            ))?;
            let rows = stmt.query_map(params![limit as i64], row_to_entity)?;
            for row in rows {
                match row {
                    Ok(entity) => out.push(entity),
                    Err(e) => warn!("[store] Quarantined corrupt entity row: {}", e),
                }
            }
        }
        Ok(out)
    }

    /// Same-kind entities ranked by name-embedding cosine, floor applied.
    pub fn entity_candidates(
        &self,
        provider_id: &str,
        query: &[f32],
        kind: EntityKind,
        k: usize,
        floor: f64,
    ) -> EngineResult<Vec<(Entity, f64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {}, name_embedding FROM entities WHERE kind = ?1 AND name_embedding IS NOT NULL",
            ENTITY_COLUMNS
        ))?;
        let rows = stmt.query_map(params![kind.as_str()], |row| {
            let blob: Option<Vec<u8>> = row.get(10)?;
            Ok((row_to_entity(row)?, blob))
        })?;

        let mut entities = Vec::new();
        let mut blobs = Vec::new();
        for row in rows {
            match row {
                Ok((entity, blob)) => {
                    entities.push(entity);
                    blobs.push(blob);
                }
                Err(e) => warn!("[store] Quarantined corrupt entity row: {}", e),
            }
        }
        let hits = super::embedding::flat_top_k(provider_id, query, &blobs, k);
        Ok(hits
            .into_iter()
            .filter(|(_, score)| *score >= floor)
            .map(|(idx, score)| (entities[idx].clone(), score))
            .collect())
    }

    /// Record a resolved mention against an existing entity: append the
    /// alias (if new), attach the source event, bump counters. Idempotent
    /// per (entity, event).
    pub fn record_entity_mention(
        &self,
        entity_id: &str,
        alias: Option<&str>,
        event_id: &str,
        seen_at: &str,
    ) -> EngineResult<()> {
        let conn = self.conn.lock();
        let (aliases_str, sources_str): (String, String) = conn.query_row(
            "SELECT aliases, source_event_ids FROM entities WHERE id = ?1",
            params![entity_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        let mut aliases: Vec<String> = serde_json::from_str(&aliases_str).unwrap_or_default();
        let mut sources: Vec<String> = serde_json::from_str(&sources_str).unwrap_or_default();
        if let Some(alias) = alias {
            if !alias.is_empty() && !aliases.iter().any(|a| a == alias) {
                aliases.push(alias.to_string());
            }
        }
        let already_counted = sources.iter().any(|s| s == event_id);
        if !already_counted {
            sources.push(event_id.to_string());
        }
        conn.execute(
            "UPDATE entities SET aliases = ?2, source_event_ids = ?3,
                event_count = event_count + ?4, last_seen = ?5
             WHERE id = ?1",
            params![
                entity_id,
                serde_json::to_string(&aliases)?,
                serde_json::to_string(&sources)?,
                if already_counted { 0 } else { 1 },
                seen_at,
            ],
        )?;
        Ok(())
    }

    pub fn delete_entity(&self, id: &str) -> EngineResult<bool> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM edges WHERE src = ?1 OR dst = ?1", params![id])?;
        conn.execute("DELETE FROM facts WHERE subject_id = ?1 OR object_entity_id = ?1", params![id])?;
        let n = conn.execute("DELETE FROM entities WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    // ── Edges ──────────────────────────────────────────────────────────

    /// Upsert `(src, rel, dst)`: existing edges gain +0.1 strength (capped
    /// at 1.0) and a fresh last_seen; new edges start at 0.5.
    pub fn upsert_edge(&self, src: &str, rel: &str, dst: &str, event_id: &str) -> EngineResult<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let conn = self.conn.lock();
        for endpoint in [src, dst] {
            let exists: i64 = conn.query_row(
                "SELECT COUNT(*) FROM entities WHERE id = ?1",
                params![endpoint],
                |r| r.get(0),
            )?;
            if exists == 0 {
                return Err(EngineError::Other(format!(
                    "edge endpoint '{}' does not exist",
                    endpoint
                )));
            }
        }
        let existing: Option<(String, String)> = optional(conn.query_row(
            "SELECT id, source_event_ids FROM edges WHERE src = ?1 AND rel = ?2 AND dst = ?3",
            params![src, rel, dst],
            |r| Ok((r.get(0)?, r.get(1)?)),
        ))?;
        match existing {
            Some((id, sources_str)) => {
                let mut sources: Vec<String> = serde_json::from_str(&sources_str).unwrap_or_default();
                if !sources.iter().any(|s| s == event_id) {
                    sources.push(event_id.to_string());
                }
                conn.execute(
                    "UPDATE edges SET strength = MIN(1.0, strength + 0.1),
                        source_event_ids = ?2, last_seen = ?3
                     WHERE id = ?1",
                    params![id, serde_json::to_string(&sources)?, now],
                )?;
            }
            None => {
                conn.execute(
                    "INSERT INTO edges (id, src, rel, dst, strength, source_event_ids, first_seen, last_seen)
                     VALUES (?1, ?2, ?3, ?4, 0.5, ?5, ?6, ?6)",
                    params![
                        uuid::Uuid::new_v4().to_string(),
                        src,
                        rel,
                        dst,
                        serde_json::to_string(&[event_id])?,
                        now,
                    ],
                )?;
            }
        }
        Ok(())
    }

    pub fn edges_for_entity(&self, entity_id: &str) -> EngineResult<Vec<Edge>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, src, rel, dst, strength, source_event_ids, first_seen, last_seen
             FROM edges WHERE src = ?1 OR dst = ?1 ORDER BY strength DESC",
        )?;
        let rows = stmt.query_map(params![entity_id], row_to_edge)?;
        let mut out = Vec::new();
        for row in rows {
            match row {
                Ok(edge) => out.push(edge),
                Err(e) => warn!("[store] Quarantined corrupt edge row: {}", e),
            }
        }
        Ok(out)
    }

    // ── Facts ──────────────────────────────────────────────────────────

    pub fn insert_fact(&self, fact: &Fact) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT INTO facts ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                FACT_COLUMNS
            ),
            params![
                fact.id,
                fact.subject_id,
                fact.predicate,
                fact.object_text,
                fact.object_entity_id,
                fact.kind.as_str(),
                fact.confidence,
                fact.strength,
                serde_json::to_string(&fact.source_event_ids)?,
                fact.valid_from,
                fact.valid_to,
                fact.superseded_by,
                fact.created_at,
                fact.updated_at,
            ],
        )?;
        Ok(())
    }

    /// Non-superseded facts for a subject (optionally one predicate).
    pub fn active_facts(&self, subject_id: &str, predicate: Option<&str>) -> EngineResult<Vec<Fact>> {
        let conn = self.conn.lock();
        let mut out = Vec::new();
        if let Some(predicate) = predicate {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM facts
                 WHERE subject_id = ?1 AND predicate = ?2 AND superseded_by IS NULL
                 ORDER BY updated_at DESC",
                FACT_COLUMNS
            ))?;
            let rows = stmt.query_map(params![subject_id, predicate], row_to_fact)?;
            for row in rows {
                match row {
                    Ok(fact) => out.push(fact),
                    Err(e) => warn!("[store] Quarantined corrupt fact row: {}", e),
                }
            }
        } else {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM facts WHERE subject_id = ?1 AND superseded_by IS NULL
                 ORDER BY strength DESC",
                FACT_COLUMNS
            ))?;
            let rows = stmt.query_map(params![subject_id], row_to_fact)?;
            for row in rows {
                match row {
                    Ok(fact) => out.push(fact),
                    Err(e) => warn!("[store] Quarantined corrupt fact row: {}", e),
                }
            }
        }
        Ok(out)
    }

    /// Chain the contradiction: old fact points at its replacement.
    /// History is never mutated beyond the pointer.
    pub fn supersede_fact(&self, old_id: &str, new_id: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE facts SET superseded_by = ?2, valid_to = ?3, updated_at = ?3 WHERE id = ?1",
            params![old_id, new_id, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Corroboration: a repeated mention re-boosts the existing fact.
    pub fn boost_fact(&self, id: &str, event_id: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        let sources_str: String =
            conn.query_row("SELECT source_event_ids FROM facts WHERE id = ?1", params![id], |r| r.get(0))?;
        let mut sources: Vec<String> = serde_json::from_str(&sources_str).unwrap_or_default();
        if !sources.iter().any(|s| s == event_id) {
            sources.push(event_id.to_string());
        }
        conn.execute(
            "UPDATE facts SET strength = MIN(1.0, strength + 0.1), source_event_ids = ?2, updated_at = ?3
             WHERE id = ?1",
            params![id, serde_json::to_string(&sources)?, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    // ── Decay ──────────────────────────────────────────────────────────

    /// Apply exponential decay to edge and fact strengths:
    /// strength *= exp(-lambda * elapsed_days). Returns rows touched.
    pub fn decay_graph(&self, lambda: f64, elapsed_days: f64) -> EngineResult<usize> {
        if elapsed_days <= 0.0 {
            return Ok(0);
        }
        let factor = (-lambda * elapsed_days).exp();
        let conn = self.conn.lock();
        let edges = conn.execute("UPDATE edges SET strength = strength * ?1", params![factor])?;
        let facts = conn.execute(
            "UPDATE facts SET strength = strength * ?1 WHERE superseded_by IS NULL",
            params![factor],
        )?;
        Ok(edges + facts)
    }

    // ── Topics ─────────────────────────────────────────────────────────

    pub fn upsert_topic(&self, name: &str, embedding: Option<&[u8]>) -> EngineResult<String> {
        let conn = self.conn.lock();
        let existing: Option<String> = optional(conn.query_row(
            "SELECT id FROM topics WHERE name = ?1",
            params![name],
            |r| r.get(0),
        ))?;
        if let Some(id) = existing {
            return Ok(id);
        }
        let id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO topics (id, name, embedding, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![id, name, embedding, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(id)
    }

    pub fn link_event_topic(&self, event_id: &str, topic_id: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO event_topics (event_id, topic_id) VALUES (?1, ?2)",
            params![event_id, topic_id],
        )?;
        Ok(())
    }

    /// Topic names with mention counts, busiest first.
    pub fn topic_activity(&self, limit: usize) -> EngineResult<Vec<(String, String, i64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT t.id, t.name, COUNT(et.event_id) AS mentions
             FROM topics t LEFT JOIN event_topics et ON et.topic_id = t.id
             GROUP BY t.id ORDER BY mentions DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get::<_, i64>(2)?))
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

fn row_to_entity(row: &Row<'_>) -> Result<Entity, rusqlite::Error> {
    let kind_str: String = row.get(3)?;
    let aliases_str: String = row.get(4)?;
    let sources_str: String = row.get(6)?;
    let invalid = |what: &str| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("corrupt entity column: {}", what).into(),
        )
    };
    Ok(Entity {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: EntityKind::parse(&kind_str).ok_or_else(|| invalid("kind"))?,
        aliases: serde_json::from_str(&aliases_str).map_err(|_| invalid("aliases"))?,
        description: row.get(5)?,
        source_event_ids: serde_json::from_str(&sources_str).map_err(|_| invalid("sources"))?,
        event_count: row.get(7)?,
        first_seen: row.get(8)?,
        last_seen: row.get(9)?,
    })
}

fn row_to_edge(row: &Row<'_>) -> Result<Edge, rusqlite::Error> {
    let sources_str: String = row.get(5)?;
    Ok(Edge {
        id: row.get(0)?,
        src: row.get(1)?,
        rel: row.get(2)?,
        dst: row.get(3)?,
        strength: row.get(4)?,
        source_event_ids: serde_json::from_str(&sources_str).unwrap_or_default(),
        first_seen: row.get(6)?,
        last_seen: row.get(7)?,
    })
}

fn row_to_fact(row: &Row<'_>) -> Result<Fact, rusqlite::Error> {
    let kind_str: String = row.get(5)?;
    let sources_str: String = row.get(8)?;
    let invalid = |what: &str| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("corrupt fact column: {}", what).into(),
        )
    };
    Ok(Fact {
        id: row.get(0)?,
        subject_id: row.get(1)?,
        predicate: row.get(2)?,
        object_text: row.get(3)?,
        object_entity_id: row.get(4)?,
        kind: FactKind::parse(&kind_str).ok_or_else(|| invalid("kind"))?,
        confidence: row.get(6)?,
        strength: row.get(7)?,
        source_event_ids: serde_json::from_str(&sources_str).map_err(|_| invalid("sources"))?,
        valid_from: row.get(9)?,
        valid_to: row.get(10)?,
        superseded_by: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        MemoryStore::open_in_memory().unwrap()
    }

    fn entity(name: &str, kind: EntityKind) -> Entity {
        let now = chrono::Utc::now().to_rfc3339();
        Entity {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            kind,
            aliases: vec![],
            description: String::new(),
            source_event_ids: vec![],
            event_count: 0,
            first_seen: now.clone(),
            last_seen: now,
        }
    }

    #[test]
    fn entity_uniqueness_per_kind() {
        let store = store();
        let a = entity("Alice", EntityKind::Person);
        store.insert_entity(&a, "alice", None).unwrap();
        let dup = entity("alice", EntityKind::Person);
        assert!(store.insert_entity(&dup, "alice", None).is_err());
        // Same name as a different kind is a different entity.
        let org = entity("Alice", EntityKind::Org);
        store.insert_entity(&org, "alice", None).unwrap();
    }

    #[test]
    fn edge_upsert_boosts_and_caps() {
        let store = store();
        let a = entity("Alice", EntityKind::Person);
        let b = entity("Acme", EntityKind::Org);
        store.insert_entity(&a, "alice", None).unwrap();
        store.insert_entity(&b, "acme", None).unwrap();

        store.upsert_edge(&a.id, "works_at", &b.id, "ev1").unwrap();
        let edges = store.edges_for_entity(&a.id).unwrap();
        assert!((edges[0].strength - 0.5).abs() < 1e-9);

        for i in 0..10 {
            store.upsert_edge(&a.id, "works_at", &b.id, &format!("ev{}", i + 2)).unwrap();
        }
        let edges = store.edges_for_entity(&a.id).unwrap();
        assert_eq!(edges.len(), 1);
        assert!(edges[0].strength <= 1.0 + 1e-9);
    }

    #[test]
    fn edge_requires_existing_endpoints() {
        let store = store();
        let a = entity("Alice", EntityKind::Person);
        store.insert_entity(&a, "alice", None).unwrap();
        assert!(store.upsert_edge(&a.id, "knows", "missing", "ev1").is_err());
    }

    #[test]
    fn decay_is_monotonic_without_mentions() {
        let store = store();
        let a = entity("Alice", EntityKind::Person);
        let b = entity("Acme", EntityKind::Org);
        store.insert_entity(&a, "alice", None).unwrap();
        store.insert_entity(&b, "acme", None).unwrap();
        store.upsert_edge(&a.id, "works_at", &b.id, "ev1").unwrap();

        let lambda = std::f64::consts::LN_2 / 30.0;
        let mut last = store.edges_for_entity(&a.id).unwrap()[0].strength;
        for _ in 0..3 {
            store.decay_graph(lambda, 1.0).unwrap();
            let current = store.edges_for_entity(&a.id).unwrap()[0].strength;
            assert!(current <= last);
            last = current;
        }
        // Half-life check: after 30 days the strength should be ~halved.
        let store2 = store;
        let before = last;
        store2.decay_graph(lambda, 30.0).unwrap();
        let after = store2.edges_for_entity(&a.id).unwrap()[0].strength;
        assert!((after / before - 0.5).abs() < 0.01);
    }

    #[test]
    fn fact_supersede_chains() {
        let store = store();
        let a = entity("Alice", EntityKind::Person);
        store.insert_entity(&a, "alice", None).unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        let old = Fact {
            id: "f1".into(),
            subject_id: a.id.clone(),
            predicate: "lives_in".into(),
            object_text: "Berlin".into(),
            object_entity_id: None,
            kind: FactKind::Attribute,
            confidence: 0.6,
            strength: 0.5,
            source_event_ids: vec![],
            valid_from: None,
            valid_to: None,
            superseded_by: None,
            created_at: now.clone(),
            updated_at: now.clone(),
        };
        store.insert_fact(&old).unwrap();
        let new = Fact { id: "f2".into(), object_text: "Lisbon".into(), confidence: 0.8, ..old.clone() };
        store.insert_fact(&new).unwrap();
        store.supersede_fact("f1", "f2").unwrap();

        let active = store.active_facts(&a.id, Some("lives_in")).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "f2");
    }

    #[test]
    fn record_mention_is_idempotent_per_event() {
        let store = store();
        let a = entity("Alice", EntityKind::Person);
        store.insert_entity(&a, "alice", None).unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        store.record_entity_mention(&a.id, Some("al"), "ev1", &now).unwrap();
        store.record_entity_mention(&a.id, Some("al"), "ev1", &now).unwrap();
        let got = store.get_entity(&a.id).unwrap().unwrap();
        assert_eq!(got.event_count, 1);
        assert_eq!(got.aliases, vec!["al".to_string()]);
        assert!(got.event_count >= got.source_event_ids.len() as i64);
    }
}
