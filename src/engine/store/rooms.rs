// ── MemoryStore: Rooms, Tasks, Dependencies ────────────────────────────────
// Room manifests are stored as JSON both here and as `rooms/<id>.json` files
// (the files are the restart source of truth; the table serves queries).
// Tasks carry the orchestrator's state machine; transitions are validated
// at the store boundary so illegal edges never persist.

use super::{optional, MemoryStore};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::room_types::{Room, Task, TaskStatus};
use log::warn;
use rusqlite::{params, Row};
use std::collections::BTreeSet;

impl MemoryStore {
    // ── Rooms ──────────────────────────────────────────────────────────

    pub fn upsert_room(&self, room: &Room) -> EngineResult<()> {
        let manifest = serde_json::to_string(room)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO rooms (id, kind, manifest, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET kind = ?2, manifest = ?3, updated_at = ?4",
            params![room.id, room.kind.as_str(), manifest, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get_room(&self, id: &str) -> EngineResult<Option<Room>> {
        let conn = self.conn.lock();
        let manifest: Option<String> = optional(conn.query_row(
            "SELECT manifest FROM rooms WHERE id = ?1",
            params![id],
            |r| r.get(0),
        ))?;
        match manifest {
            None => Ok(None),
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(room) => Ok(Some(room)),
                Err(e) => {
                    warn!("[store] Quarantined corrupt room manifest '{}': {}", id, e);
                    Ok(None)
                }
            },
        }
    }

    pub fn list_rooms(&self) -> EngineResult<Vec<Room>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id, manifest FROM rooms ORDER BY id")?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?;
        let mut out = Vec::new();
        for row in rows {
            let Ok((id, raw)) = row else { continue };
            match serde_json::from_str(&raw) {
                Ok(room) => out.push(room),
                Err(e) => warn!("[store] Quarantined corrupt room manifest '{}': {}", id, e),
            }
        }
        Ok(out)
    }

    // ── Tasks ──────────────────────────────────────────────────────────

    pub fn insert_task(&self, task: &Task) -> EngineResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO tasks (id, room_id, title, description, domain, priority, assigned_to,
                status, created_at, started_at, completed_at, due_date, requirements,
                constraints_json, result, confidence, parent_task_id, retry_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                task.id,
                task.room_id,
                task.title,
                task.description,
                task.domain,
                task.priority as i64,
                task.assigned_to,
                task.status.as_str(),
                task.created_at,
                task.started_at,
                task.completed_at,
                task.due_date,
                serde_json::to_string(&task.requirements)?,
                serde_json::to_string(&task.constraints)?,
                task.result,
                task.confidence,
                task.parent_task_id,
                task.retry_count as i64,
            ],
        )?;
        for dep in &task.depends_on {
            tx.execute(
                "INSERT OR IGNORE INTO task_dependencies (task_id, depends_on) VALUES (?1, ?2)",
                params![task.id, dep],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_task(&self, id: &str) -> EngineResult<Option<Task>> {
        let conn = self.conn.lock();
        let result = conn.query_row(
            &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
            params![id],
            row_to_task,
        );
        let Some(mut task) = optional(result)? else { return Ok(None) };
        task.depends_on = task_deps(&conn, &task.id)?;
        Ok(Some(task))
    }

    pub fn room_tasks(&self, room_id: &str) -> EngineResult<Vec<Task>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tasks WHERE room_id = ?1 ORDER BY created_at",
            TASK_COLUMNS
        ))?;
        let rows = stmt.query_map(params![room_id], row_to_task)?;
        let mut tasks = Vec::new();
        for row in rows {
            match row {
                Ok(task) => tasks.push(task),
                Err(e) => warn!("[store] Quarantined corrupt task row: {}", e),
            }
        }
        for task in tasks.iter_mut() {
            task.depends_on = task_deps(&conn, &task.id)?;
        }
        Ok(tasks)
    }

    /// Validated transition along the task state machine. Also stamps
    /// started_at / completed_at and stores results when provided.
    pub fn transition_task(
        &self,
        id: &str,
        next: TaskStatus,
        result: Option<&str>,
        confidence: Option<f64>,
    ) -> EngineResult<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let conn = self.conn.lock();
        let current_str: String =
            conn.query_row("SELECT status FROM tasks WHERE id = ?1", params![id], |r| r.get(0))?;
        let current = TaskStatus::parse(&current_str)
            .ok_or_else(|| EngineError::Corruption(format!("task {} has status '{}'", id, current_str)))?;
        if !current.can_transition_to(next) {
            return Err(EngineError::Other(format!(
                "task {}: illegal transition {} -> {}",
                id,
                current.as_str(),
                next.as_str()
            )));
        }
        let started_at = if next == TaskStatus::InProgress { Some(now.clone()) } else { None };
        let completed_at = if next.is_terminal() { Some(now.clone()) } else { None };
        conn.execute(
            "UPDATE tasks SET status = ?2,
                started_at = COALESCE(?3, started_at),
                completed_at = COALESCE(?4, completed_at),
                result = COALESCE(?5, result),
                confidence = COALESCE(?6, confidence)
             WHERE id = ?1",
            params![id, next.as_str(), started_at, completed_at, result, confidence],
        )?;
        Ok(())
    }

    pub fn assign_task(&self, id: &str, bot: &str) -> EngineResult<()> {
        self.transition_task(id, TaskStatus::Assigned, None, None)?;
        let conn = self.conn.lock();
        conn.execute("UPDATE tasks SET assigned_to = ?2 WHERE id = ?1", params![id, bot])?;
        Ok(())
    }

    pub fn bump_task_retry(&self, id: &str) -> EngineResult<u32> {
        let conn = self.conn.lock();
        conn.execute("UPDATE tasks SET retry_count = retry_count + 1 WHERE id = ?1", params![id])?;
        let count: i64 =
            conn.query_row("SELECT retry_count FROM tasks WHERE id = ?1", params![id], |r| r.get(0))?;
        Ok(count as u32)
    }

    /// Reset a task for a retry on an alternate bot: back to PENDING with a
    /// cleared assignee. Only legal from FAILED via explicit re-creation —
    /// so this clones into a fresh PENDING row linked by parent_task_id.
    pub fn respawn_task(&self, failed: &Task, new_bot: Option<&str>) -> EngineResult<Task> {
        let mut fresh = failed.clone();
        fresh.id = uuid::Uuid::new_v4().to_string();
        fresh.status = TaskStatus::Pending;
        fresh.assigned_to = new_bot.map(|b| b.to_string());
        fresh.started_at = None;
        fresh.completed_at = None;
        fresh.result = None;
        fresh.retry_count = 0;
        fresh.parent_task_id = Some(failed.id.clone());
        fresh.created_at = chrono::Utc::now().to_rfc3339();
        self.insert_task(&fresh)?;
        Ok(fresh)
    }
}

const TASK_COLUMNS: &str = "id, room_id, title, description, domain, priority, assigned_to, status, \
     created_at, started_at, completed_at, due_date, requirements, constraints_json, result, \
     confidence, parent_task_id, retry_count";

fn task_deps(conn: &rusqlite::Connection, task_id: &str) -> EngineResult<BTreeSet<String>> {
    let mut stmt = conn.prepare("SELECT depends_on FROM task_dependencies WHERE task_id = ?1")?;
    let rows = stmt.query_map(params![task_id], |r| r.get::<_, String>(0))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

fn row_to_task(row: &Row<'_>) -> Result<Task, rusqlite::Error> {
    let status_str: String = row.get(7)?;
    let requirements_str: String = row.get(12)?;
    let constraints_str: String = row.get(13)?;
    let invalid = |what: &str| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("corrupt task column: {}", what).into(),
        )
    };
    Ok(Task {
        id: row.get(0)?,
        room_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        domain: row.get(4)?,
        priority: row.get::<_, i64>(5)? as u8,
        assigned_to: row.get(6)?,
        status: TaskStatus::parse(&status_str).ok_or_else(|| invalid("status"))?,
        created_at: row.get(8)?,
        started_at: row.get(9)?,
        completed_at: row.get(10)?,
        due_date: row.get(11)?,
        requirements: serde_json::from_str(&requirements_str).map_err(|_| invalid("requirements"))?,
        constraints: serde_json::from_str(&constraints_str).map_err(|_| invalid("constraints"))?,
        result: row.get(14)?,
        confidence: row.get(15)?,
        parent_task_id: row.get(16)?,
        depends_on: BTreeSet::new(),
        retry_count: row.get::<_, i64>(17)? as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::room_types::{RoomKind, RoomPolicy};

    #[test]
    fn room_manifest_roundtrip() {
        let store = MemoryStore::open_in_memory().unwrap();
        let room = Room {
            id: "#general".into(),
            kind: RoomKind::Open,
            owner: "user".into(),
            participants: vec!["leader".into(), "coder".into()],
            created_at: chrono::Utc::now().to_rfc3339(),
            summary: String::new(),
            policy: RoomPolicy::default(),
            deadline: None,
            artifact_chain: vec![],
            last_activity: None,
        };
        store.upsert_room(&room).unwrap();
        let got = store.get_room("#general").unwrap().unwrap();
        assert_eq!(got.participants, room.participants);
        assert_eq!(store.list_rooms().unwrap().len(), 1);
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let store = MemoryStore::open_in_memory().unwrap();
        let task = Task::new("#general", "analyze", "research");
        store.insert_task(&task).unwrap();
        // PENDING -> IN_PROGRESS skips ASSIGNED.
        assert!(store
            .transition_task(&task.id, TaskStatus::InProgress, None, None)
            .is_err());
        store.assign_task(&task.id, "researcher").unwrap();
        store.transition_task(&task.id, TaskStatus::InProgress, None, None).unwrap();
        store
            .transition_task(&task.id, TaskStatus::Completed, Some("done"), Some(0.9))
            .unwrap();
        let got = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(got.status, TaskStatus::Completed);
        assert!(got.completed_at.is_some());
        assert_eq!(got.result.as_deref(), Some("done"));
    }

    #[test]
    fn dependencies_roundtrip() {
        let store = MemoryStore::open_in_memory().unwrap();
        let t1 = Task::new("#general", "research", "research");
        let mut t2 = Task::new("#general", "pricing", "strategy");
        t2.depends_on.insert(t1.id.clone());
        store.insert_task(&t1).unwrap();
        store.insert_task(&t2).unwrap();
        let got = store.get_task(&t2.id).unwrap().unwrap();
        assert!(got.depends_on.contains(&t1.id));
    }
}
