use std::sync::Arc;

use anyhow::{Context, Result};
use flume::Sender;
use tokio::sync::Mutex;

use crate::agent::{AgentEvent, ConversationEngine, MemoryConsolidator, SharedMind};
use crate::config::{AgentConfig, EngineSettings};
use crate::llm_client::{LanguageModelGateway, LlmClient};
use crate::persistence::{open_state_store, StateStore};
use crate::persona::load_character_sheet;

pub struct BackendRuntime {
    pub config: AgentConfig,
    pub engine: Arc<Mutex<ConversationEngine>>,
    pub mind: SharedMind,
    pub consolidator: MemoryConsolidator,
}

pub struct BackendRuntimeBuilder {
    config: AgentConfig,
    event_tx: Option<Sender<AgentEvent>>,
    gateway: Option<Arc<dyn LanguageModelGateway>>,
    store: Option<Arc<dyn StateStore>>,
}

impl BackendRuntimeBuilder {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            event_tx: None,
            gateway: None,
            store: None,
        }
    }

    pub fn with_events(mut self, event_tx: Sender<AgentEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    /// Use this gateway instead of the configured HTTP client.
    pub fn with_gateway(mut self, gateway: Arc<dyn LanguageModelGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Use this store instead of the configured backend.
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Result<BackendRuntime> {
        let config = self.config;
        let settings = EngineSettings::from_config(&config);

        let store = match self.store {
            Some(store) => store,
            None => open_state_store(&config).context("Failed to open state store")?,
        };

        let gateway: Arc<dyn LanguageModelGateway> = match self.gateway {
            Some(gateway) => gateway,
            None => {
                let client = LlmClient::new(
                    config.llm_api_url.clone(),
                    config.llm_api_key.clone(),
                    config.llm_model.clone(),
                    settings.gateway_timeout,
                )
                .context("Failed to build LLM client")?;
                tracing::info!(
                    "Using model '{}' at {} (timeout {:?})",
                    client.model(),
                    config.llm_api_url,
                    settings.gateway_timeout
                );
                Arc::new(client)
            }
        };

        let character_sheet = load_character_sheet(&config.character_sheet_path);
        let engine = ConversationEngine::load(
            settings,
            character_sheet,
            gateway,
            store,
            self.event_tx,
        );
        let mind = engine.mind().clone();
        let consolidator = engine.consolidator().clone();

        Ok(BackendRuntime {
            config,
            engine: Arc::new(Mutex::new(engine)),
            mind,
            consolidator,
        })
    }
}

impl BackendRuntime {
    pub fn bootstrap(config: AgentConfig, event_tx: Sender<AgentEvent>) -> Result<Self> {
        BackendRuntimeBuilder::new(config).with_events(event_tx).build()
    }
}
