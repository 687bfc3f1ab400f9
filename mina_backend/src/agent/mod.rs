pub mod consolidator;

use flume::Sender;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};

use crate::config::EngineSettings;
use crate::conversation::{ConsolidationBuffer, ConversationWindow, Turn};
use crate::emotion::EmotionState;
use crate::llm_client::{complete_with_timeout, LanguageModelGateway};
use crate::memory::{LongTermMemoryStore, MemoryRecord};
use crate::persistence::{
    load_conversation, load_emotion, load_memories, save_conversation, StateStore,
};
use crate::persona::build_preamble;

pub use consolidator::{
    ConsolidationError, ConsolidationPhase, DispatchOutcome, Extraction, MemoryConsolidator,
};

#[derive(Debug, Clone)]
pub enum AgentEvent {
    TurnCompleted {
        reply: String,
        used_fallback: bool,
    },
    ConsolidationStarted {
        job_id: String,
        lines: usize,
    },
    ConsolidationSkipped {
        reason: String,
    },
    MemoryConsolidated {
        job_id: String,
        summary: String,
        importance: u8,
        emotion: EmotionState,
    },
    ConsolidationFailed {
        job_id: String,
        error: String,
    },
}

/// State written by the consolidation worker and read by the foreground.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MindState {
    pub emotion: EmotionState,
    pub memories: LongTermMemoryStore,
}

/// Lock-guarded handle to the [`MindState`]. Every read and write goes
/// through the lock, so a reader never sees a half-applied consolidation.
/// Each applied extraction bumps a revision that subscribers can watch.
#[derive(Clone)]
pub struct SharedMind {
    inner: Arc<RwLock<MindState>>,
    revision: Arc<watch::Sender<u64>>,
}

impl Default for SharedMind {
    fn default() -> Self {
        Self::new(MindState::default())
    }
}

impl SharedMind {
    pub fn new(state: MindState) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(RwLock::new(state)),
            revision: Arc::new(revision),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    pub async fn snapshot(&self) -> MindState {
        self.inner.read().await.clone()
    }

    pub async fn emotion(&self) -> EmotionState {
        self.inner.read().await.emotion.clone()
    }

    pub async fn memories(&self) -> LongTermMemoryStore {
        self.inner.read().await.memories.clone()
    }

    /// Render memory and emotion under one read guard.
    pub async fn render_preamble(&self, character_sheet: &str) -> String {
        let state = self.inner.read().await;
        build_preamble(character_sheet, &state.memories.render(), &state.emotion)
    }

    /// Merge an extraction in one critical section. Returns the resulting
    /// state and any records pushed past capacity.
    pub async fn apply(&self, extraction: Extraction) -> (MindState, Vec<MemoryRecord>) {
        let mut state = self.inner.write().await;
        if let Some(delta) = &extraction.emotion_delta {
            state.emotion.merge(delta);
        }
        let evicted = state.memories.insert(extraction.record);
        let applied = state.clone();
        drop(state);
        self.revision.send_modify(|revision| *revision += 1);
        (applied, evicted)
    }
}

/// Foreground orchestrator. Owns the window and the consolidation buffer;
/// callers must serialize `handle_user_turn`.
pub struct ConversationEngine {
    settings: EngineSettings,
    character_sheet: String,
    window: ConversationWindow,
    buffer: ConsolidationBuffer,
    pairs_since_trigger: usize,
    gateway: Arc<dyn LanguageModelGateway>,
    store: Arc<dyn StateStore>,
    mind: SharedMind,
    consolidator: MemoryConsolidator,
    mind_updates: watch::Receiver<u64>,
    event_tx: Option<Sender<AgentEvent>>,
}

impl ConversationEngine {
    /// Restore persisted state (absent or corrupt blobs load as defaults) and
    /// regenerate the preamble from it.
    pub fn load(
        settings: EngineSettings,
        character_sheet: String,
        gateway: Arc<dyn LanguageModelGateway>,
        store: Arc<dyn StateStore>,
        event_tx: Option<Sender<AgentEvent>>,
    ) -> Self {
        let emotion = load_emotion(store.as_ref());
        let memories = load_memories(store.as_ref(), settings.memory_capacity);
        let preamble = build_preamble(&character_sheet, &memories.render(), &emotion);
        let window = ConversationWindow::restore(
            load_conversation(store.as_ref()),
            settings.context_limit,
            preamble,
        );
        tracing::info!(
            "Restored {} conversation turns and {} memories",
            window.len() - 1,
            memories.len()
        );

        let mind = SharedMind::new(MindState { emotion, memories });
        let mind_updates = mind.subscribe();
        let consolidator = MemoryConsolidator::new(
            gateway.clone(),
            store.clone(),
            mind.clone(),
            &settings,
            event_tx.clone(),
        );

        Self {
            settings,
            character_sheet,
            window,
            buffer: ConsolidationBuffer::default(),
            pairs_since_trigger: 0,
            gateway,
            store,
            mind,
            consolidator,
            mind_updates,
            event_tx,
        }
    }

    /// Run one user turn and return the reply. Always returns text: a failed
    /// or timed-out gateway call yields the configured fallback reply.
    pub async fn handle_user_turn(&mut self, text: &str) -> String {
        let text = text.trim();
        if text.is_empty() {
            tracing::debug!("Ignoring empty user turn");
            return self.settings.fallback_reply.clone();
        }

        self.mind_updates.borrow_and_update();
        self.refresh_preamble().await;
        self.window.append(Turn::user(text));
        self.persist_conversation();

        let result = complete_with_timeout(
            self.gateway.as_ref(),
            self.window.turns(),
            self.settings.reply_temperature,
            self.settings.gateway_timeout,
        )
        .await;
        let (reply, used_fallback) = match result {
            Ok(reply) => (reply.trim().to_string(), false),
            Err(e) => {
                tracing::warn!("Reply generation failed, using fallback: {}", e);
                (self.settings.fallback_reply.clone(), true)
            }
        };

        self.window.append(Turn::assistant(reply.clone()));
        let evicted = self.window.enforce_capacity();
        if evicted > 0 {
            tracing::debug!("Evicted {} turns from the conversation window", evicted);
        }
        self.persist_conversation();

        self.buffer
            .push_exchange(text, &self.settings.assistant_label, &reply);
        self.pairs_since_trigger += 1;
        if self.pairs_since_trigger >= self.settings.consolidation_period {
            self.pairs_since_trigger = 0;
            self.consolidator.trigger(&mut self.buffer);
        }

        self.emit(AgentEvent::TurnCompleted {
            reply: reply.clone(),
            used_fallback,
        });
        reply
    }

    /// Replace the preamble with one built from current memory and emotion.
    pub async fn refresh_preamble(&mut self) {
        let preamble = self.mind.render_preamble(&self.character_sheet).await;
        self.window.set_preamble(preamble);
    }

    /// Install the preamble for any consolidation applied since the last
    /// look, and persist the window. Returns whether anything changed.
    pub async fn observe_completions(&mut self) -> bool {
        if !self.mind_updates.has_changed().unwrap_or(false) {
            return false;
        }
        let revision = *self.mind_updates.borrow_and_update();
        self.refresh_preamble().await;
        self.persist_conversation();
        tracing::debug!("Installed preamble for mind revision {}", revision);
        true
    }

    /// Wait for the in-flight consolidation, if any, then install its result.
    pub async fn settle(&mut self) -> bool {
        self.consolidator.wait_until_idle().await;
        self.observe_completions().await
    }

    fn persist_conversation(&self) {
        if let Err(e) = save_conversation(self.store.as_ref(), self.window.turns()) {
            tracing::error!("Failed to persist conversation: {:#}", e);
        }
    }

    fn emit(&self, event: AgentEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    pub fn window(&self) -> &ConversationWindow {
        &self.window
    }

    pub fn buffer(&self) -> &ConsolidationBuffer {
        &self.buffer
    }

    pub fn pairs_since_trigger(&self) -> usize {
        self.pairs_since_trigger
    }

    pub fn mind(&self) -> &SharedMind {
        &self.mind
    }

    pub fn consolidator(&self) -> &MemoryConsolidator {
        &self.consolidator
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }
}
