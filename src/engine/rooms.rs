// Aviary Engine — Room Manager
// Typed rooms with participants, policy, and the artifact chain. Manifests
// are written to `rooms/<id>.json` (the restart source of truth) and
// mirrored into the store for queries. Channel connectors resolve their
// native conversation ids to rooms here.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::room_types::{ArtifactChainEntry, Room, RoomKind};
use crate::engine::config::RoomsSection;
use crate::engine::store::MemoryStore;
use log::{info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

pub struct RoomManager {
    store: Arc<MemoryStore>,
    rooms_dir: PathBuf,
    cfg: RoomsSection,
    leader: String,
    /// Live cache; manifests on disk stay authoritative across restarts.
    cache: Mutex<HashMap<String, Room>>,
}

impl RoomManager {
    pub fn new(
        store: Arc<MemoryStore>,
        workspace: &std::path::Path,
        cfg: RoomsSection,
        leader: &str,
    ) -> EngineResult<Self> {
        let rooms_dir = workspace.join("rooms");
        std::fs::create_dir_all(&rooms_dir)?;
        let manager = RoomManager {
            store,
            rooms_dir,
            cfg,
            leader: leader.to_string(),
            cache: Mutex::new(HashMap::new()),
        };
        manager.load_manifests()?;
        Ok(manager)
    }

    /// Read every `rooms/<id>.json` back in. A manifest that fails to parse
    /// is quarantined (skipped with a warning), never fatal.
    fn load_manifests(&self) -> EngineResult<()> {
        let mut loaded = 0usize;
        for entry in std::fs::read_dir(&self.rooms_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = match std::fs::read_to_string(&path) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!("[rooms] Skipping unreadable manifest {:?}: {}", path, e);
                    continue;
                }
            };
            match serde_json::from_str::<Room>(&raw) {
                Ok(room) => {
                    self.store.upsert_room(&room)?;
                    self.cache.lock().insert(room.id.clone(), room);
                    loaded += 1;
                }
                Err(e) => warn!("[rooms] Quarantined corrupt manifest {:?}: {}", path, e),
            }
        }
        if loaded > 0 {
            info!("[rooms] Restored {} room manifests", loaded);
        }
        Ok(())
    }

    fn manifest_path(&self, room_id: &str) -> PathBuf {
        // Room ids may carry '#' and ':'; keep filenames tame.
        let safe: String = room_id
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.rooms_dir.join(format!("{}.json", safe))
    }

    fn persist(&self, room: &Room) -> EngineResult<()> {
        room.validate(&self.leader)?;
        self.store.upsert_room(room)?;
        let manifest = serde_json::to_string_pretty(room)?;
        std::fs::write(self.manifest_path(&room.id), manifest)?;
        self.cache.lock().insert(room.id.clone(), room.clone());
        Ok(())
    }

    // ── CRUD ───────────────────────────────────────────────────────────

    pub fn create_room(
        &self,
        id: &str,
        kind: RoomKind,
        owner: &str,
        mut participants: Vec<String>,
    ) -> EngineResult<Room> {
        if self.get(id)?.is_some() {
            return Err(EngineError::user(format!("room '{}' already exists", id)));
        }
        if !participants.iter().any(|p| p == &self.leader) {
            participants.push(self.leader.clone());
        }
        let room = Room {
            id: id.to_string(),
            kind,
            owner: owner.to_string(),
            participants,
            created_at: chrono::Utc::now().to_rfc3339(),
            summary: String::new(),
            policy: self.cfg.policy_for(kind),
            deadline: None,
            artifact_chain: vec![],
            last_activity: None,
        };
        self.persist(&room)?;
        info!("[rooms] Created {} room '{}'", kind.as_str(), id);
        Ok(room)
    }

    pub fn get(&self, id: &str) -> EngineResult<Option<Room>> {
        if let Some(room) = self.cache.lock().get(id) {
            return Ok(Some(room.clone()));
        }
        self.store.get_room(id)
    }

    pub fn list(&self) -> EngineResult<Vec<Room>> {
        self.store.list_rooms()
    }

    pub fn invite(&self, room_id: &str, bot: &str) -> EngineResult<Room> {
        let mut room = self
            .get(room_id)?
            .ok_or_else(|| EngineError::user(format!("unknown room '{}'", room_id)))?;
        if room.kind == RoomKind::Direct {
            return Err(EngineError::user("direct rooms cannot take more participants"));
        }
        if !room.participants.iter().any(|p| p == bot) {
            room.participants.push(bot.to_string());
            self.persist(&room)?;
            info!("[rooms] Invited '{}' to '{}'", bot, room_id);
        }
        Ok(room)
    }

    pub fn touch_activity(&self, room_id: &str) -> EngineResult<()> {
        if let Some(mut room) = self.get(room_id)? {
            room.last_activity = Some(chrono::Utc::now().to_rfc3339());
            self.persist(&room)?;
        }
        Ok(())
    }

    pub fn set_coordinator_mode(&self, room_id: &str, on: bool) -> EngineResult<()> {
        let mut room = self
            .get(room_id)?
            .ok_or_else(|| EngineError::user(format!("unknown room '{}'", room_id)))?;
        room.policy.coordinator_mode = on;
        self.persist(&room)
    }

    // ── Channel mapping ────────────────────────────────────────────────

    /// Resolve a connector's native conversation id to a room, creating a
    /// `direct` or `open` room on first use. `#`-prefixed chat ids become
    /// open rooms under their own name; everything else is a direct room
    /// between the human and the leader.
    pub fn map_channel_to_room(&self, channel: &str, chat_id: &str) -> EngineResult<Room> {
        let (room_id, kind) = if chat_id.starts_with('#') {
            (chat_id.to_string(), RoomKind::Open)
        } else {
            (format!("{}:{}", channel, chat_id), RoomKind::Direct)
        };
        if let Some(room) = self.get(&room_id)? {
            return Ok(room);
        }
        let participants = match kind {
            RoomKind::Direct => vec!["user".to_string(), self.leader.clone()],
            _ => vec![self.leader.clone()],
        };
        self.create_room(&room_id, kind, "user", participants)
    }

    /// Session key under which a room's events are logged.
    pub fn session_key(channel: &str, room_id: &str) -> String {
        format!("{}:{}", channel, room_id)
    }

    // ── Artifact chain ─────────────────────────────────────────────────

    /// Append a chain entry, enforcing strictly increasing step numbers.
    pub fn record_artifact(&self, room_id: &str, mut entry: ArtifactChainEntry) -> EngineResult<u64> {
        let mut room = self
            .get(room_id)?
            .ok_or_else(|| EngineError::user(format!("unknown room '{}'", room_id)))?;
        let step = room.next_step();
        entry.step = step;
        room.artifact_chain.push(entry);
        self.persist(&room)?;
        Ok(step)
    }

    pub fn leader(&self) -> &str {
        &self.leader
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(dir: &std::path::Path) -> RoomManager {
        let store = Arc::new(MemoryStore::open_in_memory().unwrap());
        RoomManager::new(store, dir, RoomsSection::default(), "leader").unwrap()
    }

    #[test]
    fn create_always_includes_leader() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        let room = m.create_room("#general", RoomKind::Open, "user", vec![]).unwrap();
        assert!(room.participants.iter().any(|p| p == "leader"));
    }

    #[test]
    fn manifests_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let m = manager(dir.path());
            m.create_room("#general", RoomKind::Open, "user", vec!["coder".into()]).unwrap();
        }
        let m2 = manager(dir.path());
        let room = m2.get("#general").unwrap().unwrap();
        assert!(room.participants.contains(&"coder".to_string()));
    }

    #[test]
    fn channel_mapping_auto_creates() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        let open = m.map_channel_to_room("cli", "#general").unwrap();
        assert_eq!(open.kind, RoomKind::Open);
        let direct = m.map_channel_to_room("telegram", "4711").unwrap();
        assert_eq!(direct.kind, RoomKind::Direct);
        assert_eq!(direct.participants.len(), 2);
        // Second resolution hits the same room.
        let again = m.map_channel_to_room("telegram", "4711").unwrap();
        assert_eq!(again.id, direct.id);
    }

    #[test]
    fn artifact_steps_strictly_increase() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        m.create_room("#p", RoomKind::Project, "user", vec![]).unwrap();
        let entry = |task: &str| ArtifactChainEntry {
            step: 0,
            producer: "coder".into(),
            task: task.into(),
            inputs: vec![],
            outputs: vec![],
            status: "done".into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        assert_eq!(m.record_artifact("#p", entry("a")).unwrap(), 1);
        assert_eq!(m.record_artifact("#p", entry("b")).unwrap(), 2);
        assert_eq!(m.record_artifact("#p", entry("c")).unwrap(), 3);
    }

    #[test]
    fn direct_room_rejects_invites() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        let direct = m.map_channel_to_room("telegram", "4711").unwrap();
        assert!(m.invite(&direct.id, "coder").is_err());
    }
}
