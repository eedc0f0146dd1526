// Aviary Engine — Channel Layer
// Thin connector seam between transports and the broker. A connector only
// knows how to deliver text to its own surface; admission (injection scan,
// room resolution, enqueue) is shared in ChannelInbox. Transports
// themselves (Telegram, Discord, Slack, mail) live outside the core.

use crate::atoms::error::EngineResult;
use crate::atoms::types::InboundEvent;
use crate::engine::broker::RoomBroker;
use crate::engine::injection;
use crate::engine::rooms::RoomManager;
use log::{info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[async_trait::async_trait]
pub trait ChannelConnector: Send + Sync {
    fn name(&self) -> &str;
    /// Deliver an outbound message to this channel's surface.
    async fn send(&self, room_id: &str, message: &str) -> EngineResult<()>;
}

// ── Built-in connectors ────────────────────────────────────────────────────

/// The interactive terminal surface.
pub struct CliConnector;

#[async_trait::async_trait]
impl ChannelConnector for CliConnector {
    fn name(&self) -> &str {
        "cli"
    }

    async fn send(&self, room_id: &str, message: &str) -> EngineResult<()> {
        println!("{} │ {}", room_id, message);
        Ok(())
    }
}

/// Collects everything sent, for tests and dry runs.
#[derive(Default)]
pub struct CollectingConnector {
    pub sent: Mutex<Vec<(String, String)>>,
}

#[async_trait::async_trait]
impl ChannelConnector for CollectingConnector {
    fn name(&self) -> &str {
        "collect"
    }

    async fn send(&self, room_id: &str, message: &str) -> EngineResult<()> {
        self.sent.lock().push((room_id.to_string(), message.to_string()));
        Ok(())
    }
}

// ── Registry ───────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct ChannelRegistry {
    connectors: HashMap<String, Arc<dyn ChannelConnector>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, connector: Arc<dyn ChannelConnector>) {
        self.connectors.insert(connector.name().to_string(), connector);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ChannelConnector>> {
        self.connectors.get(name).cloned()
    }

    /// Best-effort broadcast of a room message to every connector.
    pub fn deliver_all(&self, room_id: &str, message: &str) {
        for connector in self.connectors.values() {
            let connector = Arc::clone(connector);
            let room = room_id.to_string();
            let text = message.to_string();
            tokio::spawn(async move {
                if let Err(e) = connector.send(&room, &text).await {
                    warn!("[channels] {} delivery failed: {}", connector.name(), e);
                }
            });
        }
    }
}

// ── Admission ──────────────────────────────────────────────────────────────

/// Shared inbound path: scan → resolve room → enqueue. Connectors call this
/// and handle the Busy error themselves (drop, buffer, or pace).
pub struct ChannelInbox {
    rooms: Arc<RoomManager>,
    broker: Arc<RoomBroker>,
}

impl ChannelInbox {
    pub fn new(rooms: Arc<RoomManager>, broker: Arc<RoomBroker>) -> Self {
        ChannelInbox { rooms, broker }
    }

    /// Admit one native message. Returns the room it landed in.
    pub async fn accept(&self, mut inbound: InboundEvent) -> EngineResult<String> {
        // Credentials never enter the log verbatim.
        let (clean, found) = injection::redact_credentials(&inbound.content);
        if !found.is_empty() {
            warn!(
                "[channels] Redacted {:?} from inbound {} message",
                found, inbound.channel
            );
            inbound.content = clean;
            inbound.metadata.insert("redacted".into(), serde_json::json!(found));
        }

        let scan = injection::scan(&inbound.content);
        if scan.is_injection {
            warn!(
                "[channels] Injection pattern(s) on {} from {} (severity {:?})",
                inbound.channel, inbound.sender, scan.severity
            );
            inbound
                .metadata
                .insert("injection_severity".into(), serde_json::json!(scan.severity));
        }

        let room = self.rooms.map_channel_to_room(&inbound.channel, &inbound.chat_id)?;
        self.broker.enqueue(&room.id, inbound).await?;
        info!("[channels] Enqueued into {}", room.id);
        Ok(room.id)
    }
}
