//! Wires detectors, extractors and sessions together.
//!
//! One pipeline per attached session: the terminal's output feeds a
//! [`StreamEventDetector`], every trigger is queued onto a per-pipeline
//! channel, and a worker task drains that queue strictly in order — take a
//! snapshot, extract, fold into the session. Snapshot rendering is pluggable
//! via [`SnapshotProvider`]; without one the detector's raw cumulative
//! buffer is used, which the extractors handle by stripping ANSI themselves.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::EngineConfig;
use crate::detect::{DetectorConfig, StreamEventDetector, TriggerEvent};
use crate::extract::{ExtractorKind, SnapshotExtractor};
use crate::session::{ConversationSession, SessionError, SessionRecord, SessionStatus};
use crate::terminal::{StreamSubscription, TerminalError, TerminalStreamSource};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Terminal(#[from] TerminalError),
}

/// Everything a provider needs to locate the right terminal screen.
#[derive(Debug, Clone)]
pub struct SnapshotContext {
    pub session_id: String,
    pub instance_id: String,
    pub trigger: TriggerEvent,
}

/// Renders the current visible screen for a terminal instance, typically by
/// asking the host's terminal emulator. Returning `None` falls back to the
/// detector's raw buffer.
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    async fn snapshot(&self, ctx: &SnapshotContext) -> Option<String>;
}

struct Pipeline {
    instance_id: String,
    detector: Arc<StreamEventDetector>,
    worker: tokio::task::JoinHandle<()>,
    _trigger_sub: crate::detect::Subscription,
    _data_sub: StreamSubscription,
    _write_sub: StreamSubscription,
}

impl Pipeline {
    fn teardown(self) {
        self.detector.destroy();
        self.worker.abort();
    }
}

type SharedSession = Arc<Mutex<ConversationSession>>;

/// Owns every session and its (at most one) live pipeline.
pub struct SessionOrchestrator {
    config: EngineConfig,
    provider: Option<Arc<dyn SnapshotProvider>>,
    sessions: Mutex<HashMap<String, SharedSession>>,
    pipelines: Mutex<HashMap<String, Pipeline>>,
}

impl SessionOrchestrator {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            provider: None,
            sessions: Mutex::new(HashMap::new()),
            pipelines: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn SnapshotProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn create_session(
        &self,
        working_dir: impl Into<String>,
        model_id: Option<String>,
    ) -> SharedSession {
        let session = ConversationSession::new(working_dir, model_id)
            .with_similarity(self.config.similarity.clone());
        let id = session.id.clone();
        let shared = Arc::new(Mutex::new(session));
        self.sessions.lock().insert(id, shared.clone());
        shared
    }

    pub fn session(&self, session_id: &str) -> Option<SharedSession> {
        self.sessions.lock().get(session_id).cloned()
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.lock().keys().cloned().collect()
    }

    /// Attach a terminal instance to a session and start its pipeline.
    /// An existing pipeline for the session is torn down first.
    pub fn attach(
        &self,
        session_id: &str,
        source: &dyn TerminalStreamSource,
        tool: Option<&str>,
    ) -> Result<(), EngineError> {
        let session = self
            .session(session_id)
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;

        if let Some(old) = self.pipelines.lock().remove(session_id) {
            tracing::debug!(session_id, old_instance = %old.instance_id, "Replacing existing pipeline");
            old.teardown();
        }

        let instance_id = source.instance_id().to_string();
        session.lock().attach(instance_id.clone())?;

        let tool_hint = tool
            .map(str::to_string)
            .or_else(|| session.lock().model_id.clone())
            .unwrap_or_default();
        let extractor: Arc<dyn SnapshotExtractor> =
            Arc::from(ExtractorKind::for_tool(&tool_hint).build());

        let detector = Arc::new(StreamEventDetector::new(DetectorConfig {
            idle_timeout: self.config.idle_timeout,
            max_buffer_bytes: self.config.max_buffer_bytes,
            ..DetectorConfig::default()
        }));

        // Triggers queue here and are consumed strictly in arrival order.
        let (tx, rx) = mpsc::unbounded_channel::<TriggerEvent>();
        let trigger_sub = detector.on(None, move |event| {
            let _ = tx.send(event.clone());
        });

        let det = detector.clone();
        let data_sub = source.on_data(Box::new(move |bytes| {
            det.ingest(&String::from_utf8_lossy(bytes));
        }));
        let det = detector.clone();
        let write_sub = source.on_write(Box::new(move |bytes| {
            det.ingest_write(&String::from_utf8_lossy(bytes));
        }));

        let worker = tokio::spawn(run_pipeline(
            rx,
            session,
            detector.clone(),
            extractor,
            self.provider.clone(),
            session_id.to_string(),
            instance_id.clone(),
        ));

        tracing::info!(session_id, instance_id = %instance_id, "Pipeline attached");
        self.pipelines.lock().insert(
            session_id.to_string(),
            Pipeline {
                instance_id,
                detector,
                worker,
                _trigger_sub: trigger_sub,
                _data_sub: data_sub,
                _write_sub: write_sub,
            },
        );
        Ok(())
    }

    /// Stop observing a session's terminal. The session stays updatable.
    pub fn detach(&self, session_id: &str) -> Result<(), EngineError> {
        let session = self
            .session(session_id)
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;
        if let Some(pipeline) = self.pipelines.lock().remove(session_id) {
            pipeline.teardown();
        }
        session.lock().detach();
        Ok(())
    }

    /// Swap a session onto a fresh terminal instance.
    pub fn restart(
        &self,
        session_id: &str,
        source: &dyn TerminalStreamSource,
        tool: Option<&str>,
    ) -> Result<(), EngineError> {
        self.attach(session_id, source, tool)
    }

    /// End a session for good; its pipeline is torn down.
    pub fn terminate(&self, session_id: &str) -> Result<(), EngineError> {
        let session = self
            .session(session_id)
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;
        if let Some(pipeline) = self.pipelines.lock().remove(session_id) {
            pipeline.teardown();
        }
        session.lock().terminate();
        Ok(())
    }

    /// React to a terminal process ending. Exits for instances no session
    /// is attached to are dropped silently; processes outlive detaches.
    pub fn handle_process_exit(&self, instance_id: &str, exit_code: Option<i32>, signal: Option<&str>) {
        let session_id = self
            .pipelines
            .lock()
            .iter()
            .find(|(_, p)| p.instance_id == instance_id)
            .map(|(id, _)| id.clone());

        let Some(session_id) = session_id else {
            tracing::debug!(instance_id, "Exit for unattached terminal instance, ignoring");
            return;
        };
        if let Some(pipeline) = self.pipelines.lock().remove(&session_id) {
            pipeline.teardown();
        }
        if let Some(session) = self.session(&session_id) {
            session.lock().record_process_exit(exit_code, signal);
        }
    }

    /// Load persisted sessions at startup. Sessions claiming an attachment
    /// to a terminal instance that no longer exists are marked exited.
    /// Returns the ids of sessions that were reconciled that way.
    pub fn reconcile_startup(
        &self,
        records: Vec<SessionRecord>,
        live_instances: &HashSet<String>,
    ) -> Vec<String> {
        let mut exited = Vec::new();
        let mut sessions = self.sessions.lock();
        for record in records {
            let mut session = ConversationSession::from_record(record);
            let stale = session
                .attached_instance_id
                .as_ref()
                .map_or(false, |id| !live_instances.contains(id));
            if stale {
                tracing::info!(session_id = %session.id, "Attached terminal gone, marking session exited");
                session.record_process_exit(None, None);
                exited.push(session.id.clone());
            }
            sessions.insert(session.id.clone(), Arc::new(Mutex::new(session)));
        }
        exited
    }
}

impl Drop for SessionOrchestrator {
    fn drop(&mut self) {
        for (_, pipeline) in self.pipelines.lock().drain() {
            pipeline.teardown();
        }
    }
}

async fn run_pipeline(
    mut triggers: mpsc::UnboundedReceiver<TriggerEvent>,
    session: SharedSession,
    detector: Arc<StreamEventDetector>,
    extractor: Arc<dyn SnapshotExtractor>,
    provider: Option<Arc<dyn SnapshotProvider>>,
    session_id: String,
    instance_id: String,
) {
    while let Some(trigger) = triggers.recv().await {
        let ctx = SnapshotContext {
            session_id: session_id.clone(),
            instance_id: instance_id.clone(),
            trigger,
        };
        let text = match &provider {
            Some(p) => p.snapshot(&ctx).await,
            None => None,
        }
        .unwrap_or_else(|| detector.buffer_contents());

        if text.trim().is_empty() {
            continue;
        }

        let mut session = session.lock();
        if session.status != SessionStatus::Active {
            break;
        }
        if session.last_recorded_snapshot.as_deref() == Some(text.as_str()) {
            tracing::trace!(session_id = %session_id, "Snapshot unchanged, skipping");
            continue;
        }
        match session.update_from_snapshot(&text, extractor.as_ref()) {
            Ok(changed) => {
                tracing::trace!(session_id = %session_id, trigger = ?ctx.trigger.kind, changed, "Trigger processed");
            }
            Err(err) => {
                tracing::warn!(session_id = %session_id, error = %err, "Snapshot update failed");
            }
        }
    }
}
