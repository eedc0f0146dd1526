// Aviary Engine — Memory Store
// Single embedded SQLite database (`memory.db`) holding the append-only
// event log, the knowledge graph, the summary tree, learnings, rooms,
// tasks, and the inter-bot bus. WAL mode, synchronous=NORMAL.
//
// One connection behind a parking_lot Mutex; method impls are split across
// the files in this directory by table family.

mod bus;
mod embedding;
mod events;
mod graph;
mod learnings;
mod rooms;
mod summaries;

pub use embedding::{cosine_similarity, decode_vector, encode_vector, flat_top_k};
pub use events::EventFilter;

use crate::atoms::error::{EngineError, EngineResult};
use log::{info, warn};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;

/// Current schema version recorded in the `migrations` table.
const SCHEMA_VERSION: i64 = 1;

/// Thread-safe database wrapper. All engine persistence goes through here.
pub struct MemoryStore {
    pub(crate) conn: Mutex<Connection>,
}

impl MemoryStore {
    /// Open (or create) `memory.db` under the workspace root.
    pub fn open(workspace: &Path) -> EngineResult<Self> {
        std::fs::create_dir_all(workspace)?;
        let path = workspace.join("memory.db");
        info!("[store] Opening memory store at {:?}", path);
        let conn = Connection::open(&path)?;
        Self::init(conn)
    }

    /// In-memory store for tests and the explicit non-durable mode.
    pub fn open_in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> EngineResult<Self> {
        // WAL for concurrent readers; NORMAL sync pairs with group commit.
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA foreign_keys=ON;",
        )
        .ok();

        conn.execute_batch(SCHEMA)?;

        let store = MemoryStore { conn: Mutex::new(conn) };
        store.apply_migrations()?;
        Ok(store)
    }

    /// Record and apply schema migrations. New versions append ALTERs here;
    /// SQLite errors from re-adding an existing column are swallowed.
    fn apply_migrations(&self) -> EngineResult<()> {
        let conn = self.conn.lock();
        let current: i64 = conn
            .query_row("SELECT COALESCE(MAX(version), 0) FROM migrations", [], |r| r.get(0))
            .unwrap_or(0);
        if current >= SCHEMA_VERSION {
            return Ok(());
        }
        conn.execute(
            "INSERT OR IGNORE INTO migrations (version, applied_at) VALUES (?1, ?2)",
            rusqlite::params![SCHEMA_VERSION, chrono::Utc::now().to_rfc3339()],
        )?;
        info!("[store] Schema at version {}", SCHEMA_VERSION);
        Ok(())
    }

    /// Quick integrity probe used by `memory doctor`.
    pub fn integrity_check(&self) -> EngineResult<String> {
        let conn = self.conn.lock();
        let result: String = conn.query_row("PRAGMA integrity_check", [], |r| r.get(0))?;
        if result != "ok" {
            warn!("[store] integrity_check: {}", result);
        }
        Ok(result)
    }

    /// Row counts per table, for `memory status`.
    pub fn table_counts(&self) -> EngineResult<Vec<(String, i64)>> {
        let conn = self.conn.lock();
        let mut out = Vec::new();
        for table in [
            "events",
            "entities",
            "edges",
            "facts",
            "topics",
            "summary_nodes",
            "learnings",
            "bot_expertise",
            "bot_memory_ledger",
            "rooms",
            "tasks",
            "bot_messages",
        ] {
            let count: i64 =
                conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))?;
            out.push((table.to_string(), count));
        }
        Ok(out)
    }
}

/// Map a "no rows" query result to `Option`, everything else to the error.
pub(crate) fn optional<T>(result: Result<T, rusqlite::Error>) -> EngineResult<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(EngineError::Database(e)),
    }
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS events (
        id TEXT PRIMARY KEY,
        session_key TEXT NOT NULL,
        seq INTEGER NOT NULL,
        timestamp TEXT NOT NULL,
        channel TEXT NOT NULL DEFAULT '',
        direction TEXT NOT NULL,
        kind TEXT NOT NULL,
        content TEXT NOT NULL DEFAULT '',
        embedding BLOB,
        parent_id TEXT,
        bot_name TEXT,
        bot_role TEXT,
        tool_name TEXT,
        extraction TEXT NOT NULL DEFAULT 'pending',
        relevance REAL NOT NULL DEFAULT 1.0,
        last_accessed TEXT,
        metadata TEXT NOT NULL DEFAULT '{}',
        UNIQUE(session_key, seq)
    );

    CREATE INDEX IF NOT EXISTS idx_events_session ON events(session_key, seq);
    CREATE INDEX IF NOT EXISTS idx_events_extraction ON events(extraction);
    CREATE INDEX IF NOT EXISTS idx_events_kind ON events(kind, timestamp);

    CREATE TABLE IF NOT EXISTS entities (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        normalized TEXT NOT NULL,
        kind TEXT NOT NULL,
        aliases TEXT NOT NULL DEFAULT '[]',
        description TEXT NOT NULL DEFAULT '',
        name_embedding BLOB,
        source_event_ids TEXT NOT NULL DEFAULT '[]',
        event_count INTEGER NOT NULL DEFAULT 0,
        first_seen TEXT NOT NULL,
        last_seen TEXT NOT NULL,
        UNIQUE(normalized, kind)
    );

    CREATE INDEX IF NOT EXISTS idx_entities_kind ON entities(kind);

    CREATE TABLE IF NOT EXISTS edges (
        id TEXT PRIMARY KEY,
        src TEXT NOT NULL,
        rel TEXT NOT NULL,
        dst TEXT NOT NULL,
        strength REAL NOT NULL DEFAULT 0.5,
        source_event_ids TEXT NOT NULL DEFAULT '[]',
        first_seen TEXT NOT NULL,
        last_seen TEXT NOT NULL,
        UNIQUE(src, rel, dst)
    );

    CREATE TABLE IF NOT EXISTS facts (
        id TEXT PRIMARY KEY,
        subject_id TEXT NOT NULL,
        predicate TEXT NOT NULL,
        object_text TEXT NOT NULL,
        object_entity_id TEXT,
        kind TEXT NOT NULL,
        confidence REAL NOT NULL DEFAULT 0.5,
        strength REAL NOT NULL DEFAULT 0.5,
        source_event_ids TEXT NOT NULL DEFAULT '[]',
        valid_from TEXT,
        valid_to TEXT,
        superseded_by TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_facts_subject ON facts(subject_id, predicate);

    CREATE TABLE IF NOT EXISTS topics (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        embedding BLOB,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS event_topics (
        event_id TEXT NOT NULL,
        topic_id TEXT NOT NULL,
        PRIMARY KEY (event_id, topic_id)
    );

    CREATE TABLE IF NOT EXISTS summary_nodes (
        id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        key TEXT NOT NULL UNIQUE,
        parent_id TEXT,
        summary TEXT NOT NULL DEFAULT '',
        embedding BLOB,
        events_since_update INTEGER NOT NULL DEFAULT 0,
        last_updated TEXT
    );

    CREATE TABLE IF NOT EXISTS learnings (
        id TEXT PRIMARY KEY,
        bot_id TEXT NOT NULL,
        content TEXT NOT NULL,
        embedding BLOB,
        source TEXT NOT NULL,
        sentiment TEXT NOT NULL DEFAULT 'neutral',
        confidence REAL NOT NULL DEFAULT 0.5,
        tool_name TEXT,
        recommendation TEXT NOT NULL DEFAULT '',
        superseded_by TEXT,
        is_private INTEGER NOT NULL DEFAULT 1,
        promotion_count INTEGER NOT NULL DEFAULT 0,
        metadata TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_learnings_bot ON learnings(bot_id, is_private);

    CREATE TABLE IF NOT EXISTS bot_expertise (
        bot_id TEXT NOT NULL,
        domain TEXT NOT NULL,
        interaction_count INTEGER NOT NULL DEFAULT 0,
        success_count INTEGER NOT NULL DEFAULT 0,
        last_success_at TEXT,
        PRIMARY KEY (bot_id, domain)
    );

    CREATE TABLE IF NOT EXISTS bot_memory_ledger (
        id TEXT PRIMARY KEY,
        learning_id TEXT NOT NULL UNIQUE,
        bot_id TEXT NOT NULL,
        original_scope TEXT NOT NULL DEFAULT 'private',
        promotion_date TEXT NOT NULL,
        reason TEXT NOT NULL DEFAULT '',
        cross_pollinated_by TEXT NOT NULL DEFAULT '',
        exposure_count INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS rooms (
        id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        manifest TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        room_id TEXT NOT NULL,
        title TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        domain TEXT NOT NULL DEFAULT '',
        priority INTEGER NOT NULL DEFAULT 3,
        assigned_to TEXT,
        status TEXT NOT NULL DEFAULT 'pending',
        created_at TEXT NOT NULL,
        started_at TEXT,
        completed_at TEXT,
        due_date TEXT,
        requirements TEXT NOT NULL DEFAULT '[]',
        constraints_json TEXT NOT NULL DEFAULT '[]',
        result TEXT,
        confidence REAL,
        parent_task_id TEXT,
        retry_count INTEGER NOT NULL DEFAULT 0
    );

    CREATE INDEX IF NOT EXISTS idx_tasks_room ON tasks(room_id, status);

    CREATE TABLE IF NOT EXISTS task_dependencies (
        task_id TEXT NOT NULL,
        depends_on TEXT NOT NULL,
        PRIMARY KEY (task_id, depends_on)
    );

    CREATE TABLE IF NOT EXISTS bot_messages (
        id TEXT PRIMARY KEY,
        sender TEXT NOT NULL,
        recipient TEXT NOT NULL,
        kind TEXT NOT NULL,
        content TEXT NOT NULL DEFAULT '',
        context TEXT NOT NULL DEFAULT '{}',
        conversation_id TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        response_to TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_bot_messages_conv ON bot_messages(conversation_id, timestamp);

    CREATE TABLE IF NOT EXISTS migrations (
        version INTEGER PRIMARY KEY,
        applied_at TEXT NOT NULL
    );
";
