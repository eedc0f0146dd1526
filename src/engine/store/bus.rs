// ── MemoryStore: Inter-Bot Message Bus ─────────────────────────────────────
// Durable record of the typed bus between bots. The live delivery path is
// in-memory (dispatcher/coordinator); this table is the audit + monitoring
// view and survives restarts.

use super::MemoryStore;
use crate::atoms::error::EngineResult;
use crate::atoms::room_types::{BotMessage, BotMessageKind, TEAM_RECIPIENT};
use log::warn;
use rusqlite::{params, Row};

impl MemoryStore {
    pub fn insert_bot_message(&self, message: &BotMessage) -> EngineResult<()> {
        message.validate()?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO bot_messages (id, sender, recipient, kind, content, context,
                conversation_id, timestamp, response_to)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                message.id,
                message.sender,
                message.recipient,
                message.kind.as_str(),
                message.content,
                serde_json::to_string(&message.context)?,
                message.conversation_id,
                message.timestamp,
                message.response_to,
            ],
        )?;
        Ok(())
    }

    /// Conversation traffic in time order.
    pub fn conversation_messages(&self, conversation_id: &str) -> EngineResult<Vec<BotMessage>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, sender, recipient, kind, content, context, conversation_id, timestamp, response_to
             FROM bot_messages WHERE conversation_id = ?1 ORDER BY timestamp",
        )?;
        let rows = stmt.query_map(params![conversation_id], row_to_bot_message)?;
        Ok(collect(rows))
    }

    /// Messages addressed to a bot (direct or team broadcast).
    pub fn messages_for_bot(&self, bot: &str, limit: usize) -> EngineResult<Vec<BotMessage>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, sender, recipient, kind, content, context, conversation_id, timestamp, response_to
             FROM bot_messages WHERE recipient = ?1 OR recipient = ?2
             ORDER BY timestamp DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![bot, TEAM_RECIPIENT, limit as i64], row_to_bot_message)?;
        let mut out = collect(rows);
        out.reverse();
        Ok(out)
    }
}

fn row_to_bot_message(row: &Row<'_>) -> Result<BotMessage, rusqlite::Error> {
    let kind_str: String = row.get(3)?;
    let context_str: String = row.get(5)?;
    let invalid = |what: &str| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("corrupt bot_message column: {}", what).into(),
        )
    };
    Ok(BotMessage {
        id: row.get(0)?,
        sender: row.get(1)?,
        recipient: row.get(2)?,
        kind: BotMessageKind::parse(&kind_str).ok_or_else(|| invalid("kind"))?,
        content: row.get(4)?,
        context: serde_json::from_str(&context_str).map_err(|_| invalid("context"))?,
        conversation_id: row.get(6)?,
        timestamp: row.get(7)?,
        response_to: row.get(8)?,
    })
}

fn collect(
    rows: rusqlite::MappedRows<'_, impl FnMut(&Row<'_>) -> Result<BotMessage, rusqlite::Error>>,
) -> Vec<BotMessage> {
    let mut out = Vec::new();
    for row in rows {
        match row {
            Ok(message) => out.push(message),
            Err(e) => warn!("[store] Quarantined corrupt bot_message row: {}", e),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_reaches_every_bot_query() {
        let store = MemoryStore::open_in_memory().unwrap();
        let m = BotMessage::new("leader", TEAM_RECIPIENT, BotMessageKind::Info, "standup", "conv-1");
        store.insert_bot_message(&m).unwrap();
        let direct = BotMessage::new("leader", "coder", BotMessageKind::Task, "build it", "conv-1");
        store.insert_bot_message(&direct).unwrap();

        let for_coder = store.messages_for_bot("coder", 10).unwrap();
        assert_eq!(for_coder.len(), 2);
        let for_researcher = store.messages_for_bot("researcher", 10).unwrap();
        assert_eq!(for_researcher.len(), 1);
    }

    #[test]
    fn invalid_response_is_rejected_at_the_store() {
        let store = MemoryStore::open_in_memory().unwrap();
        let bad = BotMessage::new("coder", "leader", BotMessageKind::Response, "done", "conv-1");
        assert!(store.insert_bot_message(&bad).is_err());
    }
}
