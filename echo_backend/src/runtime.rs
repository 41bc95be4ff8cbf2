use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use flume::Sender;

use crate::config::EchoConfig;
use crate::database::EchoDatabase;
use crate::llm_client::{LlmClient, TextGenerator};
use crate::proactive::arbitrator::Arbitrator;
use crate::proactive::enhancer::MessageEnhancer;
use crate::proactive::evaluators::default_evaluators;
use crate::proactive::gate::{RandomGate, ThreadRngGate};
use crate::proactive::{load_arbitrator, ChannelSink, EngineEvent, EngineSchedule, ProactiveEngine};
use crate::scheduler::{PeriodicJob, ScheduledTask};
use crate::signals::{SignalKind, SignalRecord, SignalStore, SignalStores};

pub struct BackendRuntime {
    pub config: EchoConfig,
    pub engine: Arc<ProactiveEngine>,
    pub stores: SignalStores,
    pub database: Option<Arc<EchoDatabase>>,
}

pub struct BackendRuntimeBuilder {
    config: EchoConfig,
    event_tx: Sender<EngineEvent>,
    generator: Option<Arc<dyn TextGenerator>>,
    gate: Option<Arc<dyn RandomGate>>,
    in_memory: bool,
}

impl BackendRuntimeBuilder {
    pub fn new(config: EchoConfig, event_tx: Sender<EngineEvent>) -> Self {
        Self {
            config,
            event_tx,
            generator: None,
            gate: None,
            in_memory: false,
        }
    }

    /// Override the enhancement backend (defaults to the configured LLM endpoint).
    pub fn with_generator(mut self, generator: Arc<dyn TextGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn with_gate(mut self, gate: Arc<dyn RandomGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Skip SQLite entirely; nothing survives a restart.
    pub fn with_in_memory_storage(mut self) -> Self {
        self.in_memory = true;
        self
    }

    pub fn build(self) -> Result<BackendRuntime> {
        let config = self.config;
        let proactive = &config.proactive;

        let database = if self.in_memory {
            None
        } else {
            match EchoDatabase::new(&config.database_path) {
                Ok(db) => Some(Arc::new(db)),
                Err(e) => {
                    tracing::warn!(
                        "Failed to open database {}, falling back to memory: {}",
                        config.database_path,
                        e
                    );
                    None
                }
            }
        };

        let stores = match database.as_ref() {
            Some(db) => SignalStores::sqlite(db.clone()),
            None => SignalStores::in_memory(),
        };

        let arbitrator = match database.as_ref() {
            Some(db) => load_arbitrator(db, proactive.policy()),
            None => Arbitrator::new(proactive.policy()),
        };

        let enhancer = if proactive.enable_enhancement {
            let generator: Arc<dyn TextGenerator> = match self.generator {
                Some(generator) => generator,
                None => {
                    let model = proactive
                        .enhancement_model
                        .clone()
                        .unwrap_or_else(|| config.llm_model.clone());
                    tracing::info!("Message enhancement via {} ({})", config.llm_api_url, model);
                    Arc::new(
                        LlmClient::new(
                            config.llm_api_url.clone(),
                            config.llm_api_key.clone(),
                            model,
                        )
                        .with_system_prompt(config.system_prompt.clone()),
                    )
                }
            };
            MessageEnhancer::new(generator, proactive.enhancement_timeout())
        } else {
            tracing::info!("Message enhancement disabled");
            MessageEnhancer::disabled()
        };

        let gate: Arc<dyn RandomGate> = match self.gate {
            Some(gate) => gate,
            None => Arc::new(ThreadRngGate),
        };
        let evaluators = default_evaluators(&stores, proactive.gate_chances());
        tracing::info!("Loaded {} trigger evaluator(s)", evaluators.len());

        let mut engine = ProactiveEngine::new(
            arbitrator,
            evaluators,
            Arc::new(stores.interaction_anchor()),
            enhancer,
            gate,
            Arc::new(ChannelSink::new(self.event_tx)),
        );
        if let Some(db) = database.as_ref() {
            engine = engine.with_database(db.clone());
        }

        Ok(BackendRuntime {
            config,
            engine: Arc::new(engine),
            stores,
            database,
        })
    }
}

impl BackendRuntime {
    pub fn bootstrap(config: EchoConfig, event_tx: Sender<EngineEvent>) -> Result<Self> {
        BackendRuntimeBuilder::new(config, event_tx).build()
    }

    /// Start the proactive loop unless disabled in config. Returns whether it is now running.
    pub async fn start_proactive(&self) -> bool {
        let proactive = &self.config.proactive;
        if !proactive.enabled {
            tracing::info!("Proactive messaging disabled in config");
            return false;
        }

        let retention = PeriodicJob::new(
            "signal_retention",
            proactive.signal_retention_interval(),
            Arc::new(SignalRetentionTask {
                stores: self.stores.clone(),
            }),
        );
        self.engine
            .start(EngineSchedule {
                cycle_interval: proactive.cycle_interval(),
                cleanup_interval: proactive.cleanup_interval(),
                extra_jobs: vec![retention],
            })
            .await;
        self.engine.is_running().await
    }

    pub async fn shutdown(&self) {
        self.engine.stop().await;
    }

    pub fn record_interaction(&self, summary: &str) -> Result<()> {
        self.stores
            .record_interaction(Utc::now(), summary)
            .context("Failed to record interaction")
    }

    /// The user answered an emitted message: refresh the anchor and retire the candidate.
    pub async fn respond(&self, candidate_id: &str, text: &str) -> Result<bool> {
        self.record_interaction(text)?;
        Ok(self.engine.dismiss(candidate_id).await)
    }

    pub fn ingest_signal(&self, kind: SignalKind, record: SignalRecord) -> Result<()> {
        tracing::debug!("Ingesting {} record {}", kind.as_db_str(), record.id);
        self.stores
            .get(kind)
            .record(record)
            .with_context(|| format!("Failed to store {} record", kind.as_db_str()))
    }
}

struct SignalRetentionTask {
    stores: SignalStores,
}

#[async_trait]
impl ScheduledTask for SignalRetentionTask {
    async fn run(&self) {
        self.stores.purge_expired(Utc::now());
    }
}
