// Aviary Engine — Per-Room Message Broker
// The serialization point for everything addressed to a room. Inbound
// events are persisted through a group-commit writer (one transaction per
// ≤5 ms / ≤64-item batch; enqueue returns only after its group commits),
// then drained by exactly one dispatch worker per room — strict FIFO within
// a room, full parallelism across rooms.
//
// Cancellation is cooperative: a room-level cancel clears pending queue
// entries and trips the active turn's signal, which the agent loop honors
// at its next suspension point.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::memory_types::{Direction, Event, EventKind};
use crate::atoms::types::InboundEvent;
use crate::engine::store::MemoryStore;
use log::{info, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Notify};

/// Command a connector may send to drop a room's backlog.
pub const CANCEL_COMMAND: &str = "/cancel";

// ── Turn cancellation ──────────────────────────────────────────────────────

/// Signal that the current agent turn should wrap up. The turn checks this
/// at each suspension point (provider call, tool call, embed) and stops
/// without corruption when it is tripped.
#[derive(Clone, Default)]
pub struct TurnSignal(Arc<AtomicBool>);

impl TurnSignal {
    pub fn new() -> Self {
        TurnSignal(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Suspension-point check: error out of the turn when cancelled.
    pub fn checkpoint(&self) -> EngineResult<()> {
        if self.is_cancelled() {
            Err(EngineError::Cancelled("turn cancelled".into()))
        } else {
            Ok(())
        }
    }
}

// ── Handler seam ───────────────────────────────────────────────────────────

/// The broker hands each event to exactly one of these per room at a time.
/// Wired to the agent loop in production, to probes in tests.
#[async_trait::async_trait]
pub trait RoomHandler: Send + Sync + 'static {
    async fn handle(&self, room_id: &str, event: Event, cancel: TurnSignal) -> EngineResult<()>;
}

// ── Options ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BrokerOptions {
    /// Group-commit durability. The in-memory mode is explicit, non-default,
    /// and loudly logged.
    pub durable: bool,
    /// Per-room queue cap; beyond it enqueue returns Busy.
    pub high_water: usize,
    pub group_max_items: usize,
    pub group_window: Duration,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        BrokerOptions {
            durable: true,
            high_water: 100,
            group_max_items: 64,
            group_window: Duration::from_millis(5),
        }
    }
}

// ── Internals ──────────────────────────────────────────────────────────────

struct RoomQueue {
    fifo: Mutex<VecDeque<Event>>,
    notify: Notify,
    /// Signal of the turn currently inside the handler, if any.
    active_turn: Mutex<Option<TurnSignal>>,
}

struct CommitRequest {
    room_id: String,
    event: Event,
    ack: oneshot::Sender<Result<Event, String>>,
}

struct BrokerShared {
    store: Arc<MemoryStore>,
    handler: Arc<dyn RoomHandler>,
    options: BrokerOptions,
    rooms: Mutex<HashMap<String, Arc<RoomQueue>>>,
    shutdown: AtomicBool,
}

pub struct RoomBroker {
    shared: Arc<BrokerShared>,
    commit_tx: Option<mpsc::Sender<CommitRequest>>,
}

impl RoomBroker {
    pub fn new(store: Arc<MemoryStore>, handler: Arc<dyn RoomHandler>, options: BrokerOptions) -> Self {
        if !options.durable {
            warn!("[broker] Running with the in-memory queue — enqueued events are NOT durable");
        }
        let shared = Arc::new(BrokerShared {
            store,
            handler,
            options: options.clone(),
            rooms: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
        });
        let commit_tx = if options.durable {
            let (tx, rx) = mpsc::channel::<CommitRequest>(1024);
            let writer_shared = Arc::clone(&shared);
            tokio::spawn(async move {
                group_commit_writer(writer_shared, rx).await;
            });
            Some(tx)
        } else {
            None
        };
        RoomBroker { shared, commit_tx }
    }

    /// Admit one inbound event for a room. Returns the persisted event id.
    /// FIFO guarantee: the order in which concurrent `enqueue` calls return
    /// equals the order the room's handler observes their events.
    pub async fn enqueue(&self, room_id: &str, inbound: InboundEvent) -> EngineResult<String> {
        if inbound.cancel_prior || inbound.content.trim() == CANCEL_COMMAND {
            let dropped = self.cancel_room(room_id);
            info!("[broker] Cancel for '{}' dropped {} pending events", room_id, dropped);
            if inbound.content.trim() == CANCEL_COMMAND || inbound.content.trim().is_empty() {
                return Ok(String::new());
            }
        }

        let queue = room_entry(&self.shared, room_id);
        if queue.fifo.lock().len() >= self.shared.options.high_water {
            return Err(EngineError::busy(format!("room {}", room_id)));
        }

        let mut event = Event::new(
            inbound.channel.clone(),
            Direction::Inbound,
            EventKind::Message,
            inbound.content.clone(),
            crate::engine::rooms::RoomManager::session_key(&inbound.channel, room_id),
        );
        event.metadata.insert("sender".into(), serde_json::json!(inbound.sender));
        event.metadata.insert("chat_id".into(), serde_json::json!(inbound.chat_id));
        event.metadata.insert("room_id".into(), serde_json::json!(room_id));
        if !inbound.attachments.is_empty() {
            event.metadata.insert("attachments".into(), serde_json::json!(inbound.attachments));
        }
        let event_id = event.id.clone();

        match &self.commit_tx {
            Some(tx) => {
                // Durable path: the writer persists the batch, pushes each
                // event onto its room FIFO in commit order, then acks.
                let (ack_tx, ack_rx) = oneshot::channel();
                tx.send(CommitRequest { room_id: room_id.to_string(), event, ack: ack_tx })
                    .await
                    .map_err(|_| EngineError::busy("broker writer"))?;
                ack_rx
                    .await
                    .map_err(|_| EngineError::busy("broker writer"))?
                    .map_err(EngineError::Other)?;
            }
            None => {
                // Explicit in-memory mode: enqueue order is the lock order.
                let mut fifo = queue.fifo.lock();
                fifo.push_back(event);
                drop(fifo);
                queue.notify.notify_one();
            }
        }
        Ok(event_id)
    }

    /// Drop pending (un-started) events for the room and signal the active
    /// turn. Returns how many pending events were dropped.
    pub fn cancel_room(&self, room_id: &str) -> usize {
        let queue = room_entry(&self.shared, room_id);
        let dropped = {
            let mut fifo = queue.fifo.lock();
            let n = fifo.len();
            fifo.clear();
            n
        };
        if let Some(signal) = queue.active_turn.lock().as_ref() {
            signal.cancel();
        }
        dropped
    }

    pub fn queue_depth(&self, room_id: &str) -> usize {
        room_entry(&self.shared, room_id).fifo.lock().len()
    }

    /// Restart recovery: re-queue inbound events that never produced an
    /// outbound response, and synthesize timeout results for tool calls
    /// left open by a crash. Returns the number of re-queued events.
    pub fn recover(&self) -> EngineResult<usize> {
        let synthesized = synthesize_dangling_tool_results(&self.shared.store)?;
        if synthesized > 0 {
            info!("[broker] Synthesized {} timeout tool_results at recovery", synthesized);
        }

        let unanswered = unanswered_inbound(&self.shared.store)?;
        let mut requeued = 0usize;
        for event in unanswered {
            let Some(room_id) = event
                .metadata
                .get("room_id")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
            else {
                continue;
            };
            let queue = room_entry(&self.shared, &room_id);
            queue.fifo.lock().push_back(event);
            queue.notify.notify_one();
            requeued += 1;
        }
        if requeued > 0 {
            info!("[broker] Recovered {} unanswered inbound events", requeued);
        }
        Ok(requeued)
    }

    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        let rooms = self.shared.rooms.lock();
        for queue in rooms.values() {
            queue.notify.notify_waiters();
        }
    }
}

/// Get or create a room's queue; the first access spawns its single
/// dispatch worker.
fn room_entry(shared: &Arc<BrokerShared>, room_id: &str) -> Arc<RoomQueue> {
    let mut rooms = shared.rooms.lock();
    if let Some(queue) = rooms.get(room_id) {
        return Arc::clone(queue);
    }
    let queue = Arc::new(RoomQueue {
        fifo: Mutex::new(VecDeque::new()),
        notify: Notify::new(),
        active_turn: Mutex::new(None),
    });
    rooms.insert(room_id.to_string(), Arc::clone(&queue));
    drop(rooms);

    let worker_shared = Arc::clone(shared);
    let worker_queue = Arc::clone(&queue);
    let room = room_id.to_string();
    tokio::spawn(async move {
        dispatch_worker(worker_shared, room, worker_queue).await;
    });
    queue
}

/// One worker per room: drains the FIFO into the handler, one event at a
/// time. Strict per-room serialization lives here.
async fn dispatch_worker(shared: Arc<BrokerShared>, room_id: String, queue: Arc<RoomQueue>) {
    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            return;
        }
        let event = queue.fifo.lock().pop_front();
        let Some(event) = event else {
            let _ = tokio::time::timeout(Duration::from_millis(500), queue.notify.notified()).await;
            continue;
        };

        let signal = TurnSignal::new();
        *queue.active_turn.lock() = Some(signal.clone());
        let result = shared.handler.handle(&room_id, event, signal).await;
        *queue.active_turn.lock() = None;
        match result {
            Ok(()) => {}
            Err(EngineError::Cancelled(_)) => {
                info!("[broker] Turn in '{}' cancelled at a suspension point", room_id)
            }
            Err(e) => warn!("[broker] Turn in '{}' failed: {}", room_id, e),
        }
    }
}

/// The group-commit writer: batches everything that arrives within the
/// window (or up to the batch cap) into ONE transaction, pushes each event
/// onto its room FIFO in commit order, then releases the enqueuers.
async fn group_commit_writer(shared: Arc<BrokerShared>, mut rx: mpsc::Receiver<CommitRequest>) {
    loop {
        let Some(first) = rx.recv().await else { return };
        let mut batch = vec![first];
        let deadline = Instant::now() + shared.options.group_window;
        while batch.len() < shared.options.group_max_items {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Some(req)) => batch.push(req),
                Ok(None) => break,
                Err(_) => break,
            }
        }

        let mut events: Vec<Event> = batch.iter().map(|r| r.event.clone()).collect();
        match shared.store.append_events_batch(&mut events) {
            Ok(()) => {
                for (req, event) in batch.into_iter().zip(events.into_iter()) {
                    let queue = room_entry(&shared, &req.room_id);
                    queue.fifo.lock().push_back(event.clone());
                    queue.notify.notify_one();
                    let _ = req.ack.send(Ok(event));
                }
            }
            Err(e) => {
                let message = format!("group commit failed: {}", e);
                warn!("[broker] {}", message);
                for req in batch {
                    let _ = req.ack.send(Err(message.clone()));
                }
            }
        }
    }
}

// ── Recovery queries ───────────────────────────────────────────────────────

fn unanswered_inbound(store: &MemoryStore) -> EngineResult<Vec<Event>> {
    let ids: Vec<String> = {
        let conn = store.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT e.id FROM events e
             WHERE e.kind = 'message' AND e.direction = 'inbound'
               AND NOT EXISTS (
                   SELECT 1 FROM events c
                   WHERE c.parent_id = e.id AND c.direction = 'outbound'
               )
             ORDER BY e.session_key, e.seq",
        )?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        rows.filter_map(|r| r.ok()).collect()
    };
    let mut events = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(event) = store.get_event(&id)? {
            events.push(event);
        }
    }
    Ok(events)
}

/// A tool_call with no tool_result means the previous process died mid-turn.
/// Synthesize `tool_result{status=timeout}` so the pairing invariant holds.
fn synthesize_dangling_tool_results(store: &MemoryStore) -> EngineResult<usize> {
    let dangling: Vec<Event> = {
        let ids: Vec<String> = {
            let conn = store.conn.lock();
            let mut stmt = conn.prepare(
                "SELECT e.id FROM events e
                 WHERE e.kind = 'tool_call'
                   AND NOT EXISTS (
                       SELECT 1 FROM events c
                       WHERE c.parent_id = e.id AND c.kind = 'tool_result'
                   )",
            )?;
            let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
            rows.filter_map(|r| r.ok()).collect()
        };
        let mut events = Vec::new();
        for id in ids {
            if let Some(event) = store.get_event(&id)? {
                events.push(event);
            }
        }
        events
    };

    let count = dangling.len();
    for call in dangling {
        let mut result = Event::new(
            call.channel.clone(),
            Direction::Internal,
            EventKind::ToolResult,
            "{\"status\":\"timeout\",\"error\":\"recovered after restart\"}",
            call.session_key.clone(),
        )
        .with_parent(call.id.clone())
        .with_tool(call.tool_name.clone().unwrap_or_default())
        .with_meta("status", serde_json::json!("timeout"))
        .with_meta("synthesized", serde_json::json!(true));
        store.append_event(&mut result)?;
    }
    Ok(count)
}
