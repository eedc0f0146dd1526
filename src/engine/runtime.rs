// Aviary Engine — Runtime Assembly
// Builds the whole engine from a workspace directory: store, memory
// pipeline, providers, tools, dispatcher, broker, and the background
// manager. Everything is constructor-injected — no process-wide globals.

use crate::atoms::error::EngineResult;
use crate::engine::agent_loop::AgentLoop;
use crate::engine::artifacts::ArtifactStore;
use crate::engine::audit::AuditLog;
use crate::engine::background::{
    registered_periodics, BackgroundManager, Job, JobKind, JobRunner,
};
use crate::engine::broker::{BrokerOptions, RoomBroker};
use crate::engine::channels::{ChannelConnector, ChannelInbox, ChannelRegistry};
use crate::engine::config::{fallback_provider, AssistantConfig};
use crate::engine::coordinator::Coordinator;
use crate::engine::dispatcher::Dispatcher;
use crate::engine::embedder::EmbedderStack;
use crate::engine::graph;
use crate::engine::learnings;
use crate::engine::providers::AnyProvider;
use crate::engine::rooms::RoomManager;
use crate::engine::secrets::SecretStore;
use crate::engine::store::MemoryStore;
use crate::engine::summaries;
use crate::engine::tool_executor::ToolExecutor;
use crate::engine::tools::{load_skills, ToolRegistry};
use log::{info, warn};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct Runtime {
    pub workspace: PathBuf,
    pub config: AssistantConfig,
    pub store: Arc<MemoryStore>,
    pub rooms: Arc<RoomManager>,
    pub artifacts: Arc<ArtifactStore>,
    pub audit: Arc<AuditLog>,
    pub embedder: Arc<EmbedderStack>,
    pub provider: Arc<AnyProvider>,
    pub dispatcher: Arc<Dispatcher>,
    pub broker: Arc<RoomBroker>,
    pub background: Arc<BackgroundManager>,
    pub channels: Arc<ChannelRegistry>,
    pub inbox: ChannelInbox,
}

impl Runtime {
    /// Bring the engine up against a workspace. Restart recovery (queued
    /// events, dangling tool calls) runs before anything new is admitted.
    pub async fn start(
        workspace: &Path,
        connectors: Vec<Arc<dyn ChannelConnector>>,
    ) -> EngineResult<Arc<Runtime>> {
        let config = AssistantConfig::load(workspace)?;
        let store = Arc::new(MemoryStore::open(workspace)?);
        summaries::ensure_tree_skeleton(&store)?;

        let artifacts = Arc::new(ArtifactStore::new(workspace)?);
        let audit = Arc::new(AuditLog::open(workspace)?);
        let secrets = SecretStore::from_config(&config.security.secret_backend, workspace);
        let embedder = Arc::new(EmbedderStack::from_config(&config.memory.embedding));

        // Provider: the configured default, with its key out of the secret
        // store; a scripted provider keeps offline runs working.
        let provider_cfg = config.default_provider().cloned().unwrap_or_else(fallback_provider);
        let api_key = match &provider_cfg.api_key_secret {
            Some(secret_name) => secrets.get(secret_name).unwrap_or_else(|e| {
                warn!("[runtime] Could not read secret '{}': {}", secret_name, e);
                None
            }),
            None => None,
        };
        let provider = Arc::new(AnyProvider::from_config(&provider_cfg, api_key)?);
        let model = provider_cfg.model.clone();
        let cheap_model = provider_cfg.cheap_model().to_string();

        let leader = config.leader().name.clone();
        let rooms = Arc::new(RoomManager::new(
            Arc::clone(&store),
            workspace,
            config.rooms.clone(),
            &leader,
        )?);

        let mut registry = ToolRegistry::new();
        let skills = load_skills(&mut registry, &workspace.join("skills"))?;
        if skills > 0 {
            info!("[runtime] Activated {} skill tools", skills);
        }
        let executor = Arc::new(ToolExecutor::new(
            registry,
            Arc::clone(&store),
            Arc::clone(&artifacts),
            Arc::clone(&rooms),
            Arc::clone(&embedder),
            Arc::clone(&audit),
            config.memory.learning.clone(),
            workspace.to_path_buf(),
        ));

        let sidekicks = Arc::new(crate::engine::sidekick::SidekickOrchestrator::new(
            Arc::clone(&provider),
            Arc::clone(&artifacts),
            &cheap_model,
            config.max_sidekicks_per_bot(),
            config.max_sidekicks_per_room(),
        ));

        let background = BackgroundManager::new(
            config.memory.tasks.background_queue_capacity,
            Duration::from_secs(config.memory.tasks.quiet_threshold_secs),
        );

        let agent_loop = Arc::new(AgentLoop::new(
            Arc::clone(&store),
            Arc::clone(&provider),
            Arc::clone(&executor),
            sidekicks,
            Arc::clone(&background.activity),
            Arc::clone(&audit),
            Arc::clone(&embedder),
            config.memory.context.clone(),
            config.memory.learning.clone(),
            &model,
        ));

        let coordinator = Arc::new(Coordinator::new(
            Arc::clone(&provider),
            &cheap_model,
            config.bots.clone(),
            config.security.escalation_rules.clone(),
        ));

        let mut channel_registry = ChannelRegistry::new();
        for connector in connectors {
            channel_registry.register(connector);
        }
        let channels = Arc::new(channel_registry);
        let announcer_channels = Arc::clone(&channels);
        let announcer = Arc::new(move |room_id: &str, text: &str| {
            announcer_channels.deliver_all(room_id, text);
        });

        let dispatcher = Dispatcher::new(
            config.bots.clone(),
            Arc::clone(&rooms),
            Arc::clone(&store),
            agent_loop,
            coordinator,
            Arc::clone(&audit),
            announcer,
            config.memory.tasks.max_retries,
        );

        let handler: Arc<dyn crate::engine::broker::RoomHandler> = dispatcher.clone();
        let broker = Arc::new(RoomBroker::new(
            Arc::clone(&store),
            handler,
            BrokerOptions {
                durable: config.memory.tasks.durable_broker,
                high_water: config.queue_high_water(),
                ..Default::default()
            },
        ));
        let recovered = broker.recover()?;
        if recovered > 0 {
            info!("[runtime] Recovered {} queued events from the previous run", recovered);
        }

        // Background pipeline: extraction, summary refresh, maintenance.
        let runner = Arc::new(EngineJobRunner {
            store: Arc::clone(&store),
            embedder: Arc::clone(&embedder),
            provider: Arc::clone(&provider),
            config: config.clone(),
            cheap_model,
            last_maintenance: Mutex::new(Instant::now()),
        });
        for (job, interval) in registered_periodics() {
            background.register_periodic(job, interval);
        }
        Arc::clone(&background).start(config.memory.tasks.background_workers, runner);

        let inbox = ChannelInbox::new(Arc::clone(&rooms), Arc::clone(&broker));

        info!("[runtime] Engine up at {:?} ({} bots)", workspace, config.bots.len());
        Ok(Arc::new(Runtime {
            workspace: workspace.to_path_buf(),
            config,
            store,
            rooms,
            artifacts,
            audit,
            embedder,
            provider,
            dispatcher,
            broker,
            background,
            channels,
            inbox,
        }))
    }

    /// Nudge a background job to run soon (CLI `memory tasks`, tests).
    pub fn kick_background(&self, kind: JobKind) {
        self.background.kick(kind);
    }

    pub fn shutdown(&self) {
        self.background.stop();
        self.broker.shutdown();
        info!("[runtime] Engine stopped");
    }
}

// ── Background job runner ──────────────────────────────────────────────────

struct EngineJobRunner {
    store: Arc<MemoryStore>,
    embedder: Arc<EmbedderStack>,
    provider: Arc<AnyProvider>,
    config: AssistantConfig,
    cheap_model: String,
    /// Elapsed-time base for graph decay between maintenance runs.
    last_maintenance: Mutex<Instant>,
}

#[async_trait::async_trait]
impl JobRunner for EngineJobRunner {
    async fn run(&self, job: &Job) -> EngineResult<()> {
        match job.kind {
            JobKind::Extraction => {
                let pending = self
                    .store
                    .pending_extraction(self.config.memory.extraction.batch_size)?;
                for event in &pending {
                    if let Err(e) = graph::extract_event(
                        &self.store,
                        &self.embedder,
                        &self.config.memory.extraction,
                        event,
                    )
                    .await
                    {
                        warn!("[runtime] Extraction failed for {}: {}", event.id, e);
                        self.store
                            .mark_extraction(&event.id, crate::atoms::memory_types::ExtractionStatus::Failed)
                            .ok();
                    }
                    // Embed the event itself for semantic search.
                    if let Ok((provider_id, vector)) = self.embedder.embed_one(&event.content).await {
                        let blob = crate::engine::store::encode_vector(&provider_id, &vector);
                        self.store.set_event_embedding(&event.id, &blob).ok();
                    }
                }
                Ok(())
            }
            JobKind::SummaryRefresh => {
                summaries::refresh_cycle(
                    &self.store,
                    &self.provider,
                    &self.cheap_model,
                    &self.embedder,
                    &self.config.memory.summary,
                )
                .await?;
                Ok(())
            }
            JobKind::LearningMaintenance => {
                learnings::cross_pollinate(&self.store, &self.config.memory.learning, "system")?;
                let elapsed_days = {
                    let mut last = self.last_maintenance.lock();
                    let days = last.elapsed().as_secs_f64() / 86_400.0;
                    *last = Instant::now();
                    days
                };
                self.store.decay_graph(graph::DECAY_LAMBDA, elapsed_days)?;
                Ok(())
            }
        }
    }
}
