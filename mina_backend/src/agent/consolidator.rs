//! Background distillation of buffered dialogue into one memory record plus
//! an emotion update. At most one job is in flight; a trigger that arrives
//! while one is running leaves the buffer alone.

use chrono::{DateTime, Utc};
use flume::Sender;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::{AgentEvent, SharedMind};
use crate::config::EngineSettings;
use crate::conversation::{ConsolidationBuffer, Turn};
use crate::emotion::{parse_integer, EmotionState};
use crate::llm_client::{complete_with_timeout, extract_json, GatewayError, LanguageModelGateway};
use crate::memory::{clamp_importance, MemoryRecord};
use crate::persistence::{save_emotion, save_memories, StateStore};

const RAW_PREVIEW_CHARS: usize = 500;

#[derive(Debug, thiserror::Error)]
pub enum ConsolidationError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("malformed extraction: {reason}")]
    Malformed { reason: String, raw: String },
}

impl ConsolidationError {
    fn malformed(reason: impl Into<String>, raw: &str) -> Self {
        Self::Malformed {
            reason: reason.into(),
            raw: raw.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConsolidationPhase {
    Idle,
    Dispatched {
        job_id: String,
        started_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Dispatched { job_id: String },
    AlreadyRunning,
    NothingBuffered,
}

/// What a well-formed extraction reply contributes.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub record: MemoryRecord,
    pub emotion_delta: Option<Value>,
}

/// Returns the phase to idle when the job's task ends, however it ends.
struct PhaseReset(Arc<watch::Sender<ConsolidationPhase>>);

impl Drop for PhaseReset {
    fn drop(&mut self) {
        self.0.send_replace(ConsolidationPhase::Idle);
    }
}

#[derive(Clone)]
pub struct MemoryConsolidator {
    gateway: Arc<dyn LanguageModelGateway>,
    store: Arc<dyn StateStore>,
    mind: SharedMind,
    phase: Arc<watch::Sender<ConsolidationPhase>>,
    dispatched_jobs: Arc<AtomicU64>,
    event_tx: Option<Sender<AgentEvent>>,
    temperature: f32,
    timeout: Duration,
}

impl MemoryConsolidator {
    pub fn new(
        gateway: Arc<dyn LanguageModelGateway>,
        store: Arc<dyn StateStore>,
        mind: SharedMind,
        settings: &EngineSettings,
        event_tx: Option<Sender<AgentEvent>>,
    ) -> Self {
        let (phase, _) = watch::channel(ConsolidationPhase::Idle);
        Self {
            gateway,
            store,
            mind,
            phase: Arc::new(phase),
            dispatched_jobs: Arc::new(AtomicU64::new(0)),
            event_tx,
            temperature: settings.extraction_temperature,
            timeout: settings.gateway_timeout,
        }
    }

    /// Claim the slot, snapshot-and-clear the buffer, and hand the snapshot
    /// to a spawned worker. Never waits on the worker.
    ///
    /// Must be called from within a tokio runtime.
    pub fn trigger(&self, buffer: &mut ConsolidationBuffer) -> DispatchOutcome {
        if buffer.is_empty() {
            self.emit(AgentEvent::ConsolidationSkipped {
                reason: "nothing buffered".to_string(),
            });
            return DispatchOutcome::NothingBuffered;
        }

        let job_id = uuid::Uuid::new_v4().to_string();
        let claimed = self.phase.send_if_modified(|phase| {
            if !matches!(phase, ConsolidationPhase::Idle) {
                return false;
            }
            *phase = ConsolidationPhase::Dispatched {
                job_id: job_id.clone(),
                started_at: Utc::now(),
            };
            true
        });

        if !claimed {
            tracing::debug!(
                "Consolidation already in flight; keeping {} buffered lines",
                buffer.len()
            );
            self.emit(AgentEvent::ConsolidationSkipped {
                reason: "consolidation already in flight".to_string(),
            });
            return DispatchOutcome::AlreadyRunning;
        }

        let lines = buffer.take();
        self.dispatched_jobs.fetch_add(1, Ordering::SeqCst);
        tracing::info!("Dispatching consolidation job {} ({} lines)", job_id, lines.len());
        self.emit(AgentEvent::ConsolidationStarted {
            job_id: job_id.clone(),
            lines: lines.len(),
        });

        let worker = self.clone();
        let task_job_id = job_id.clone();
        tokio::spawn(async move {
            let _reset = PhaseReset(worker.phase.clone());
            worker.run_job(task_job_id, lines).await;
        });

        DispatchOutcome::Dispatched { job_id }
    }

    async fn run_job(&self, job_id: String, lines: Vec<String>) {
        match self.consolidate(&job_id, &lines).await {
            Ok(record) => {
                tracing::info!(
                    "Consolidation job {} stored memory (importance {})",
                    job_id,
                    record.importance
                );
            }
            Err(ConsolidationError::Malformed { reason, raw }) => {
                tracing::warn!(
                    "Consolidation job {} discarded: {}. Raw response: {}",
                    job_id,
                    reason,
                    preview(&raw)
                );
                self.emit(AgentEvent::ConsolidationFailed {
                    job_id,
                    error: format!("malformed extraction: {}", reason),
                });
            }
            Err(e) => {
                tracing::warn!("Consolidation job {} discarded: {}", job_id, e);
                self.emit(AgentEvent::ConsolidationFailed {
                    job_id,
                    error: e.to_string(),
                });
            }
        }
    }

    async fn consolidate(
        &self,
        job_id: &str,
        lines: &[String],
    ) -> Result<MemoryRecord, ConsolidationError> {
        let emotion = self.mind.emotion().await;
        let messages = [Turn::user(build_extraction_prompt(lines, &emotion))];
        let raw =
            complete_with_timeout(self.gateway.as_ref(), &messages, self.temperature, self.timeout)
                .await?;

        let extraction = parse_extraction(&raw)?;
        let record = extraction.record.clone();
        let (state, evicted) = self.mind.apply(extraction).await;
        if !evicted.is_empty() {
            tracing::debug!(
                "Consolidation job {} evicted {} low-importance memories",
                job_id,
                evicted.len()
            );
        }

        if let Err(e) = save_memories(self.store.as_ref(), &state.memories) {
            tracing::error!("Failed to persist memories after job {}: {:#}", job_id, e);
        }
        if let Err(e) = save_emotion(self.store.as_ref(), &state.emotion) {
            tracing::error!("Failed to persist emotion after job {}: {:#}", job_id, e);
        }

        self.emit(AgentEvent::MemoryConsolidated {
            job_id: job_id.to_string(),
            summary: record.summary.clone(),
            importance: record.importance,
            emotion: state.emotion,
        });
        Ok(record)
    }

    pub fn phase(&self) -> ConsolidationPhase {
        self.phase.borrow().clone()
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self.phase(), ConsolidationPhase::Dispatched { .. })
    }

    pub fn dispatched_jobs(&self) -> u64 {
        self.dispatched_jobs.load(Ordering::SeqCst)
    }

    /// Resolves once no job is in flight.
    pub async fn wait_until_idle(&self) {
        let mut rx = self.phase.subscribe();
        let _ = rx
            .wait_for(|phase| matches!(phase, ConsolidationPhase::Idle))
            .await;
    }

    fn emit(&self, event: AgentEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }
}

pub fn build_extraction_prompt(lines: &[String], emotion: &EmotionState) -> String {
    format!(
        r#"Summarize these events briefly, score their importance from 1 to 10,
add 1-3 short tags, and update the emotional state realistically.

Current emotional state:
{}

Respond with ONLY valid JSON in this shape:
{{
  "summary": "...",
  "importance": 5,
  "tags": ["a", "b"],
  "emotion": {{
    "mood": "...",
    "stress": 0-10,
    "trust_in_user": 0-10,
    "current_goal": "..."
  }}
}}

Events:
{}"#,
        emotion.to_prompt_json(),
        lines.join("\n")
    )
}

/// Parse an extraction reply. `summary`, `importance` and `tags` are required;
/// `emotion` is optional.
pub fn parse_extraction(raw: &str) -> Result<Extraction, ConsolidationError> {
    let value: Value = serde_json::from_str(extract_json(raw))
        .map_err(|e| ConsolidationError::malformed(format!("not JSON ({})", e), raw))?;
    let Some(object) = value.as_object() else {
        return Err(ConsolidationError::malformed("expected a JSON object", raw));
    };

    let summary = match object.get("summary") {
        Some(Value::String(text)) if !text.trim().is_empty() => text.trim().to_string(),
        Some(_) => return Err(ConsolidationError::malformed("summary is empty or not text", raw)),
        None => return Err(ConsolidationError::malformed("missing summary", raw)),
    };

    let importance = match object.get("importance") {
        Some(value) => parse_integer(value)
            .map(clamp_importance)
            .ok_or_else(|| ConsolidationError::malformed("importance is not numeric", raw))?,
        None => return Err(ConsolidationError::malformed("missing importance", raw)),
    };

    let tags = match object.get("tags") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(text) => Some(text.clone()),
                Value::Number(number) => Some(number.to_string()),
                _ => None,
            })
            .collect(),
        Some(_) => return Err(ConsolidationError::malformed("tags is not a list", raw)),
        None => return Err(ConsolidationError::malformed("missing tags", raw)),
    };

    Ok(Extraction {
        record: MemoryRecord::new(summary, importance, tags),
        emotion_delta: object.get("emotion").filter(|v| !v.is_null()).cloned(),
    })
}

fn preview(raw: &str) -> String {
    let mut out: String = raw.chars().take(RAW_PREVIEW_CHARS).collect();
    if raw.chars().count() > RAW_PREVIEW_CHARS {
        out.push_str("...");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::test_support::ScriptedGateway;
    use crate::agent::MindState;
    use crate::persistence::{load_memories, InMemoryStateStore};
    use serde_json::json;

    fn consolidator(
        gateway: Arc<ScriptedGateway>,
    ) -> (MemoryConsolidator, SharedMind, flume::Receiver<AgentEvent>) {
        let mind = SharedMind::new(MindState::default());
        let (tx, rx) = flume::unbounded();
        let consolidator = MemoryConsolidator::new(
            gateway,
            Arc::new(InMemoryStateStore::default()),
            mind.clone(),
            &EngineSettings::default(),
            Some(tx),
        );
        (consolidator, mind, rx)
    }

    fn buffer_with(lines: &[&str]) -> ConsolidationBuffer {
        let mut buffer = ConsolidationBuffer::default();
        for line in lines {
            buffer.push(*line);
        }
        buffer
    }

    #[test]
    fn parses_well_formed_extraction() {
        let raw = r#"```json
{"summary": "User started a new job", "importance": 14, "tags": ["work", "news", "work", "extra"],
 "emotion": {"mood": "proud", "stress": 2}}
```"#;
        let extraction = parse_extraction(raw).unwrap();
        assert_eq!(extraction.record.summary, "User started a new job");
        assert_eq!(extraction.record.importance, 10);
        assert_eq!(extraction.record.tags, vec!["work", "news", "extra"]);
        assert_eq!(
            extraction.emotion_delta,
            Some(json!({"mood": "proud", "stress": 2}))
        );
    }

    #[test]
    fn emotion_block_is_optional() {
        let extraction =
            parse_extraction(r#"{"summary": "x", "importance": "3", "tags": []}"#).unwrap();
        assert_eq!(extraction.record.importance, 3);
        assert!(extraction.emotion_delta.is_none());
    }

    #[test]
    fn missing_or_invalid_fields_are_malformed() {
        let cases = [
            "I'd rather not summarize that.",
            r#"["summary", "importance"]"#,
            r#"{"importance": 5, "tags": []}"#,
            r#"{"summary": "  ", "importance": 5, "tags": []}"#,
            r#"{"summary": "x", "tags": []}"#,
            r#"{"summary": "x", "importance": "very", "tags": []}"#,
            r#"{"summary": "x", "importance": 5}"#,
            r#"{"summary": "x", "importance": 5, "tags": "work"}"#,
        ];
        for raw in cases {
            let err = parse_extraction(raw).unwrap_err();
            assert!(
                matches!(err, ConsolidationError::Malformed { .. }),
                "expected malformed for {}",
                raw
            );
        }
    }

    #[test]
    fn prompt_carries_emotion_and_events() {
        let lines = vec!["User: I got a puppy".to_string(), "Mina: Wonderful!".to_string()];
        let prompt = build_extraction_prompt(&lines, &EmotionState::default());
        assert!(prompt.contains("\"mood\": \"neutral\""));
        assert!(prompt.ends_with("Events:\nUser: I got a puppy\nMina: Wonderful!"));
    }

    #[test]
    fn preview_truncates_long_responses() {
        let raw = "z".repeat(800);
        let out = preview(&raw);
        assert_eq!(out.len(), RAW_PREVIEW_CHARS + 3);
        assert_eq!(preview("short"), "short");
    }

    #[tokio::test]
    async fn empty_buffer_is_not_dispatched() {
        let gateway = Arc::new(ScriptedGateway::new());
        let (consolidator, _, rx) = consolidator(gateway.clone());
        let mut buffer = ConsolidationBuffer::default();

        assert_eq!(consolidator.trigger(&mut buffer), DispatchOutcome::NothingBuffered);
        assert_eq!(consolidator.dispatched_jobs(), 0);
        assert!(matches!(
            rx.try_recv(),
            Ok(AgentEvent::ConsolidationSkipped { .. })
        ));
    }

    #[tokio::test]
    async fn successful_job_updates_mind_and_store() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.push_extraction(Ok(r#"{"summary": "User loves hiking", "importance": 7,
            "tags": ["outdoors"], "emotion": {"mood": "cheerful", "trust_in_user": 8}}"#
            .to_string()));
        let store = Arc::new(InMemoryStateStore::default());
        let mind = SharedMind::new(MindState::default());
        let consolidator = MemoryConsolidator::new(
            gateway.clone(),
            store.clone(),
            mind.clone(),
            &EngineSettings::default(),
            None,
        );

        let mut buffer = buffer_with(&["User: I hiked today", "Mina: How far?"]);
        let outcome = consolidator.trigger(&mut buffer);
        assert!(matches!(outcome, DispatchOutcome::Dispatched { .. }));
        assert!(buffer.is_empty());

        consolidator.wait_until_idle().await;
        let state = mind.snapshot().await;
        assert_eq!(state.memories.len(), 1);
        assert_eq!(state.memories.records()[0].summary, "User loves hiking");
        assert_eq!(state.emotion.mood, "cheerful");
        assert_eq!(state.emotion.trust_in_user, 8);
        assert_eq!(state.emotion.stress, 3);

        let persisted = load_memories(store.as_ref(), 50);
        assert_eq!(persisted.records()[0].summary, "User loves hiking");
        assert!(gateway.extraction_prompts()[0].contains("User: I hiked today"));
    }

    #[tokio::test]
    async fn gateway_failure_returns_to_idle_without_changes() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.push_extraction(Err(GatewayError::Status {
            status: 503,
            body: "overloaded".to_string(),
        }));
        let (consolidator, mind, rx) = consolidator(gateway);

        let mut buffer = buffer_with(&["User: hello", "Mina: hi"]);
        consolidator.trigger(&mut buffer);
        consolidator.wait_until_idle().await;

        assert!(!consolidator.is_in_flight());
        assert!(buffer.is_empty());
        let state = mind.snapshot().await;
        assert!(state.memories.is_empty());
        assert_eq!(state.emotion, EmotionState::default());

        let events: Vec<_> = rx.drain().collect();
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::ConsolidationFailed { .. })));
    }

    #[tokio::test]
    async fn trigger_while_in_flight_keeps_buffer() {
        let gateway = Arc::new(ScriptedGateway::new().gated());
        let (consolidator, _, _rx) = consolidator(gateway.clone());

        let mut buffer = buffer_with(&["User: one", "Mina: two"]);
        let job_id = match consolidator.trigger(&mut buffer) {
            DispatchOutcome::Dispatched { job_id } => job_id,
            other => panic!("expected dispatch, got {:?}", other),
        };
        assert!(matches!(
            consolidator.phase(),
            ConsolidationPhase::Dispatched { job_id: ref running, .. } if *running == job_id
        ));

        buffer.push("User: three");
        assert_eq!(consolidator.trigger(&mut buffer), DispatchOutcome::AlreadyRunning);
        assert_eq!(buffer.lines(), ["User: three"]);
        assert_eq!(consolidator.dispatched_jobs(), 1);

        gateway.release();
        consolidator.wait_until_idle().await;
        assert_eq!(consolidator.phase(), ConsolidationPhase::Idle);
        assert_eq!(gateway.max_concurrent_extractions(), 1);
    }
}
