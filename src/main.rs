// Aviary — command-line surface.
// `aviary agent` runs the interactive room loop; the other commands inspect
// or manage the workspace without starting the full engine.
// Exit codes: 0 success, 2 invalid usage, 3 permission denied, 4
// precondition failed.

use aviary::atoms::error::{EngineError, EngineResult};
use aviary::atoms::room_types::RoomKind;
use aviary::atoms::types::InboundEvent;
use aviary::engine::channels::CliConnector;
use aviary::engine::config::AssistantConfig;
use aviary::engine::embedder::EmbedderStack;
use aviary::engine::rooms::RoomManager;
use aviary::engine::runtime::Runtime;
use aviary::engine::store::{EventFilter, MemoryStore};
use clap::{Parser, Subcommand};
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt as _;
use tokio_stream::StreamExt as _;

#[derive(Parser)]
#[command(name = "aviary", version, about = "A team of bots behind your chat channels")]
struct Cli {
    /// Workspace directory (default: ~/.aviary)
    #[arg(long, global = true, env = "AVIARY_WORKSPACE")]
    workspace: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Interactive session against a room.
    Agent {
        /// Room to talk in (default: #general)
        #[arg(long)]
        room: Option<String>,
    },
    /// Room management.
    Room {
        #[command(subcommand)]
        command: RoomCommand,
    },
    /// Explain what the assistant has been doing.
    Explain {
        /// Room to explain
        #[arg(short = 'w', long = "room")]
        room: Option<String>,
        /// Restrict to one bot (@name)
        #[arg(short = 'b', long = "bot")]
        bot: Option<String>,
        #[arg(long, default_value = "summary")]
        mode: String,
    },
    /// Ask why/how something happened, against the memory.
    How {
        query: String,
        #[arg(short = 'w', long = "room")]
        room: Option<String>,
    },
    /// Memory inspection and maintenance.
    Memory {
        #[command(subcommand)]
        command: MemoryCommand,
    },
}

#[derive(Subcommand)]
enum RoomCommand {
    /// Create a room: `room create <id> [type]`
    Create {
        id: String,
        #[arg(default_value = "open")]
        kind: String,
    },
    /// Invite a bot into a room.
    Invite {
        room: String,
        bot: String,
    },
    /// List rooms.
    List,
}

#[derive(Subcommand)]
enum MemoryCommand {
    Status,
    Search { query: String },
    Entities,
    Entity { name: String },
    Summary,
    Forget { entity: String },
    Export,
    Import { file: PathBuf },
    Tasks,
    Doctor,
}

fn workspace_dir(cli: &Cli) -> PathBuf {
    cli.workspace.clone().unwrap_or_else(|| {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".aviary")
    })
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let workspace = workspace_dir(&cli);

    let result = match &cli.command {
        Command::Agent { room } => run_agent(&workspace, room.as_deref()).await,
        Command::Room { command } => run_room(&workspace, command),
        Command::Explain { room, bot, mode } => {
            run_explain(&workspace, room.as_deref(), bot.as_deref(), mode)
        }
        Command::How { query, room } => run_how(&workspace, query, room.as_deref()).await,
        Command::Memory { command } => run_memory(&workspace, command).await,
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        std::process::exit(e.exit_code());
    }
}

// ── agent ──────────────────────────────────────────────────────────────────

async fn run_agent(workspace: &PathBuf, room: Option<&str>) -> EngineResult<()> {
    let runtime = Runtime::start(workspace, vec![Arc::new(CliConnector)]).await?;
    let room_id = room.unwrap_or("#general").to_string();
    runtime.rooms.map_channel_to_room("cli", &room_id)?;

    println!("aviary │ talking in {} — /cancel drops the queue, /quit leaves", room_id);
    let lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut lines = tokio_stream::wrappers::LinesStream::new(lines);
    loop {
        print!("> ");
        std::io::stdout().flush().ok();
        let Some(line) = lines.next().await else { break };
        let content = line?.trim().to_string();
        if content.is_empty() {
            continue;
        }
        if content == "/quit" || content == "/exit" {
            break;
        }
        let inbound = InboundEvent {
            channel: "cli".into(),
            sender: whoami(),
            chat_id: room_id.clone(),
            content,
            attachments: vec![],
            timestamp: chrono::Utc::now().to_rfc3339(),
            cancel_prior: false,
            metadata: Default::default(),
        };
        match runtime.inbox.accept(inbound).await {
            Ok(_) => {}
            Err(e) if e.is_retryable() => eprintln!("busy — try again in a moment ({})", e),
            Err(e) => eprintln!("error: {}", e),
        }
        // Give the turn a moment to stream its answer before re-prompting.
        tokio::time::sleep(std::time::Duration::from_millis(400)).await;
    }
    runtime.shutdown();
    Ok(())
}

fn whoami() -> String {
    std::env::var("USER").unwrap_or_else(|_| "user".into())
}

// ── room ───────────────────────────────────────────────────────────────────

fn open_rooms(workspace: &PathBuf) -> EngineResult<(Arc<MemoryStore>, RoomManager)> {
    let config = AssistantConfig::load(workspace)?;
    let store = Arc::new(MemoryStore::open(workspace)?);
    let rooms = RoomManager::new(
        Arc::clone(&store),
        workspace,
        config.rooms.clone(),
        &config.leader().name,
    )?;
    Ok((store, rooms))
}

fn run_room(workspace: &PathBuf, command: &RoomCommand) -> EngineResult<()> {
    let (_store, rooms) = open_rooms(workspace)?;
    match command {
        RoomCommand::Create { id, kind } => {
            let kind = RoomKind::parse(kind)
                .ok_or_else(|| EngineError::user(format!("unknown room type '{}'", kind)))?;
            let room = rooms.create_room(id, kind, &whoami(), vec![])?;
            println!("created {} ({})", room.id, room.kind.as_str());
        }
        RoomCommand::Invite { room, bot } => {
            let room = rooms.invite(room, bot)?;
            println!("{} participants: {}", room.id, room.participants.join(", "));
        }
        RoomCommand::List => {
            for room in rooms.list()? {
                println!(
                    "{:<20} {:<12} participants: {}",
                    room.id,
                    room.kind.as_str(),
                    room.participants.join(", ")
                );
            }
        }
    }
    Ok(())
}

// ── explain / how ──────────────────────────────────────────────────────────

fn run_explain(
    workspace: &PathBuf,
    room: Option<&str>,
    bot: Option<&str>,
    mode: &str,
) -> EngineResult<()> {
    let store = MemoryStore::open(workspace)?;
    let room_id = room.unwrap_or("#general");
    let bot_filter = bot.map(|b| b.trim_start_matches('@').to_string());
    let session = format!("cli:{}", room_id);
    let events = store.recent_session_events(&session, 100)?;
    let events: Vec<_> = events
        .into_iter()
        .filter(|e| bot_filter.as_deref().is_none_or(|b| e.bot_name.as_deref() == Some(b)))
        .collect();

    match mode {
        "summary" => {
            println!("{}: {} recent events", room_id, events.len());
            if let Some(last) = events.last() {
                println!("last activity: {} ({})", last.timestamp, last.kind.as_str());
            }
            let tool_calls = events.iter().filter(|e| e.tool_name.is_some()).count();
            println!("tool activity: {} calls/results", tool_calls);
        }
        "detailed" => {
            for event in &events {
                let who = event.bot_name.as_deref().unwrap_or("user");
                println!(
                    "[{}] {:<12} {:<10} {}",
                    event.timestamp,
                    who,
                    event.kind.as_str(),
                    aviary::atoms::types::truncate_utf8(&event.content, 120)
                );
            }
        }
        "debug" => {
            for event in &events {
                println!(
                    "seq={:<5} id={} kind={} dir={} extraction={} parent={:?}",
                    event.seq,
                    event.id,
                    event.kind.as_str(),
                    event.direction.as_str(),
                    event.extraction.as_str(),
                    event.parent_id,
                );
            }
        }
        "coordination" => {
            let tasks = store.room_tasks(room_id)?;
            if tasks.is_empty() {
                println!("no coordinated tasks in {}", room_id);
            }
            for task in &tasks {
                println!(
                    "[{:<11}] {:<40} -> {} (deps: {})",
                    task.status.as_str(),
                    aviary::atoms::types::truncate_utf8(&task.title, 40),
                    task.assigned_to.as_deref().unwrap_or("unassigned"),
                    task.depends_on.len(),
                );
            }
        }
        other => return Err(EngineError::user(format!("unknown explain mode '{}'", other))),
    }
    Ok(())
}

async fn run_how(workspace: &PathBuf, query: &str, room: Option<&str>) -> EngineResult<()> {
    let config = AssistantConfig::load(workspace)?;
    let store = MemoryStore::open(workspace)?;
    let embedder = EmbedderStack::from_config(&config.memory.embedding);
    let (provider_id, vector) = embedder.embed_one(query).await?;
    let filter = EventFilter {
        session_key: room.map(|r| format!("cli:{}", r)),
        ..Default::default()
    };
    let hits = store.semantic_search_events(&provider_id, &vector, 8, &filter)?;
    if hits.is_empty() {
        println!("nothing in memory matches \"{}\"", query);
        return Ok(());
    }
    println!("closest memory for \"{}\":", query);
    for (event, score) in hits {
        println!(
            "[{:.2}] {} {} — {}",
            score,
            event.timestamp,
            event.bot_name.as_deref().unwrap_or("user"),
            aviary::atoms::types::truncate_utf8(&event.content, 160),
        );
    }
    Ok(())
}

// ── memory ─────────────────────────────────────────────────────────────────

async fn run_memory(workspace: &PathBuf, command: &MemoryCommand) -> EngineResult<()> {
    let config = AssistantConfig::load(workspace)?;
    let store = MemoryStore::open(workspace)?;

    match command {
        MemoryCommand::Status => {
            for (table, count) in store.table_counts()? {
                println!("{:<20} {}", table, count);
            }
            let (pending, failed) = store.extraction_backlog()?;
            println!("extraction backlog: {} pending, {} failed", pending, failed);
        }
        MemoryCommand::Search { query } => {
            let embedder = EmbedderStack::from_config(&config.memory.embedding);
            let (provider_id, vector) = embedder.embed_one(query).await?;
            let hits = store.semantic_search_events(&provider_id, &vector, 10, &EventFilter::default())?;
            for (event, score) in hits {
                println!("[{:.2}] {}", score, aviary::atoms::types::truncate_utf8(&event.content, 160));
            }
        }
        MemoryCommand::Entities => {
            for entity in store.list_entities(None, 50)? {
                println!(
                    "{:<24} {:<10} mentions: {:<4} last: {}",
                    entity.name,
                    entity.kind.as_str(),
                    entity.event_count,
                    entity.last_seen
                );
            }
        }
        MemoryCommand::Entity { name } => {
            let Some(entity) = store.find_entity_named(name)? else {
                return Err(EngineError::user(format!("no entity named '{}'", name)));
            };
            println!("{} ({})", entity.name, entity.kind.as_str());
            if !entity.aliases.is_empty() {
                println!("aliases: {}", entity.aliases.join(", "));
            }
            for fact in store.active_facts(&entity.id, None)? {
                println!(
                    "  {} {} (confidence {:.2}, strength {:.2})",
                    fact.predicate, fact.object_text, fact.confidence, fact.strength
                );
            }
            for edge in store.edges_for_entity(&entity.id)? {
                println!("  edge: {} --{}--> {} ({:.2})", edge.src, edge.rel, edge.dst, edge.strength);
            }
        }
        MemoryCommand::Summary => {
            for node in store.all_summary_nodes()? {
                let marker = if node.events_since_update > 0 {
                    format!(" (stale: {})", node.events_since_update)
                } else {
                    String::new()
                };
                println!("{}{}", node.key, marker);
                if !node.summary.is_empty() {
                    println!("  {}", aviary::atoms::types::truncate_utf8(&node.summary, 200));
                }
            }
        }
        MemoryCommand::Forget { entity } => {
            let Some(found) = store.find_entity_named(entity)? else {
                return Err(EngineError::user(format!("no entity named '{}'", entity)));
            };
            store.delete_entity(&found.id)?;
            println!("forgot '{}' and its edges/facts", found.name);
        }
        MemoryCommand::Export => {
            let export = serde_json::json!({
                "entities": store.list_entities(None, 100_000)?,
                "rooms": store.list_rooms()?,
                "summary_nodes": store.all_summary_nodes()?,
            });
            println!("{}", serde_json::to_string_pretty(&export)?);
        }
        MemoryCommand::Import { file } => {
            let raw = std::fs::read_to_string(file)?;
            let value: serde_json::Value = serde_json::from_str(&raw)?;
            let mut imported = 0usize;
            if let Some(entities) = value["entities"].as_array() {
                for item in entities {
                    let Ok(entity) =
                        serde_json::from_value::<aviary::atoms::memory_types::Entity>(item.clone())
                    else {
                        continue;
                    };
                    let normalized = aviary::engine::graph::normalize_surface(&entity.name);
                    if store.find_entity_exact(&normalized, entity.kind)?.is_none() {
                        store.insert_entity(&entity, &normalized, None)?;
                        imported += 1;
                    }
                }
            }
            println!("imported {} entities", imported);
        }
        MemoryCommand::Tasks => {
            let mut any = false;
            for room in store.list_rooms()? {
                for task in store.room_tasks(&room.id)? {
                    any = true;
                    println!(
                        "{:<16} [{:<11}] {:<40} -> {}",
                        room.id,
                        task.status.as_str(),
                        aviary::atoms::types::truncate_utf8(&task.title, 40),
                        task.assigned_to.as_deref().unwrap_or("unassigned"),
                    );
                }
            }
            if !any {
                println!("no tasks");
            }
        }
        MemoryCommand::Doctor => {
            let integrity = store.integrity_check()?;
            println!("sqlite integrity: {}", integrity);
            let (pending, failed) = store.extraction_backlog()?;
            println!("extraction backlog: {} pending, {} failed", pending, failed);
            let staleness = store.summary_staleness_high_water()?;
            println!(
                "summary staleness high water: {} (threshold {})",
                staleness, config.memory.summary.staleness_threshold
            );
            let audit = aviary::engine::audit::AuditLog::open(workspace)?;
            match audit.verify() {
                Ok(entries) => println!("audit chain: ok ({} entries)", entries),
                Err(e) => {
                    println!("audit chain: BROKEN — {}", e);
                    return Err(EngineError::Corruption("audit chain verification failed".into()));
                }
            }
            if integrity != "ok" || failed > 50 {
                return Err(EngineError::Corruption("memory needs attention".into()));
            }
            println!("memory looks healthy");
        }
    }
    Ok(())
}
