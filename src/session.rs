//! Conversation session state machine.
//!
//! Owns the canonical, append-mostly message list for one terminal-driven
//! chat. Every trigger re-extracts the entire visible conversation, so
//! folding fragments in has to be a merge: fragments matching already
//! recorded turns are skipped in order, only the current last message may
//! ever be replaced in place, and everything below it is permanently frozen.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

use crate::extract::{Fragment, Role, SnapshotExtractor};
use crate::reconcile::{are_similar, normalize, SimilarityConfig};

/// How many trailing messages the merge may look back over when deciding
/// whether a fragment is already recorded. A snapshot never shows more
/// conversation than one screen plus scrollback, so a small window suffices
/// and keeps similarity comparisons cheap.
const RECONCILE_LOOKBACK: usize = 32;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session not active: {0}")]
    NotActive(String),
}

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Attached (or attachable) to a live terminal instance.
    Active,
    /// Explicitly ended by the user; no further updates accepted.
    Terminated,
    /// The observed process ended on its own; session remains readable.
    Exited,
}

/// One reconstructed conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_ref: Option<String>,
}

/// What changed in a [`SessionUpdate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateType {
    MessageAdded,
    MetadataUpdated,
    StatusChanged,
}

/// Serializable full-session snapshot handed to persistence/UI collaborators
/// on every change notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    pub status: SessionStatus,
    pub messages: Vec<ConversationMessage>,
    pub working_dir: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attached_instance_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUpdate {
    pub update_type: UpdateType,
    pub session: SessionRecord,
}

/// Injectable id source; avoids shared global counters.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

pub struct UlidGenerator;

impl IdGenerator for UlidGenerator {
    fn next_id(&self) -> String {
        Ulid::new().to_string()
    }
}

type UpdateListener = Arc<dyn Fn(&SessionUpdate) + Send + Sync>;
type ListenerTable = Arc<Mutex<HashMap<u64, UpdateListener>>>;

/// Handle returned by [`ConversationSession::on_update`]; dropping it
/// removes the listener.
pub struct UpdateSubscription {
    table: Weak<Mutex<HashMap<u64, UpdateListener>>>,
    id: u64,
}

impl UpdateSubscription {
    pub fn unsubscribe(self) {}
}

impl Drop for UpdateSubscription {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            table.lock().remove(&self.id);
        }
    }
}

/// One terminal-driven conversation.
pub struct ConversationSession {
    pub id: String,
    pub status: SessionStatus,
    pub messages: Vec<ConversationMessage>,
    pub working_dir: String,
    pub attached_instance_id: Option<String>,
    pub model_id: Option<String>,
    pub exit_code: Option<i32>,
    pub last_recorded_snapshot: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    similarity: SimilarityConfig,
    id_gen: Arc<dyn IdGenerator>,
    listeners: ListenerTable,
    next_listener_id: u64,
}

impl ConversationSession {
    pub fn new(working_dir: impl Into<String>, model_id: Option<String>) -> Self {
        Self::with_id_generator(working_dir, model_id, Arc::new(UlidGenerator))
    }

    pub fn with_id_generator(
        working_dir: impl Into<String>,
        model_id: Option<String>,
        id_gen: Arc<dyn IdGenerator>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id_gen.next_id(),
            status: SessionStatus::Active,
            messages: Vec::new(),
            working_dir: working_dir.into(),
            attached_instance_id: None,
            model_id,
            exit_code: None,
            last_recorded_snapshot: None,
            created_at: now,
            updated_at: now,
            similarity: SimilarityConfig::default(),
            id_gen,
            listeners: Arc::new(Mutex::new(HashMap::new())),
            next_listener_id: 0,
        }
    }

    pub fn with_similarity(mut self, similarity: SimilarityConfig) -> Self {
        self.similarity = similarity;
        self
    }

    /// Restore a previously persisted session (cold start).
    pub fn from_record(record: SessionRecord) -> Self {
        let mut session = Self::new(record.working_dir, record.model_id);
        session.id = record.id;
        session.status = record.status;
        session.messages = record.messages;
        session.attached_instance_id = record.attached_instance_id;
        session.exit_code = record.exit_code;
        session.created_at = record.created_at;
        session.updated_at = record.updated_at;
        session
    }

    pub fn snapshot(&self) -> SessionRecord {
        SessionRecord {
            id: self.id.clone(),
            status: self.status,
            messages: self.messages.clone(),
            working_dir: self.working_dir.clone(),
            attached_instance_id: self.attached_instance_id.clone(),
            model_id: self.model_id.clone(),
            exit_code: self.exit_code,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// Subscribe to change notifications. Emission is synchronous with each
    /// mutation and ordered.
    pub fn on_update(
        &mut self,
        listener: impl Fn(&SessionUpdate) + Send + Sync + 'static,
    ) -> UpdateSubscription {
        let id = self.next_listener_id;
        self.next_listener_id += 1;
        self.listeners.lock().insert(id, Arc::new(listener));
        UpdateSubscription {
            table: Arc::downgrade(&self.listeners),
            id,
        }
    }

    fn emit(&self, update_type: UpdateType) {
        let listeners: Vec<UpdateListener> = {
            let table = self.listeners.lock();
            let mut entries: Vec<_> = table.iter().collect();
            entries.sort_by_key(|(id, _)| **id);
            entries.into_iter().map(|(_, l)| l.clone()).collect()
        };
        if listeners.is_empty() {
            return;
        }
        let update = SessionUpdate {
            update_type,
            session: self.snapshot(),
        };
        for listener in &listeners {
            listener(&update);
        }
    }

    /// Now, clamped so message timestamps never decrease.
    fn next_timestamp(&self) -> DateTime<Utc> {
        let now = Utc::now();
        match self.messages.last() {
            Some(last) if last.timestamp > now => last.timestamp,
            _ => now,
        }
    }

    fn push_message(&mut self, fragment: Fragment) {
        let message = ConversationMessage {
            id: self.id_gen.next_id(),
            role: fragment.role,
            content: fragment.content,
            timestamp: self.next_timestamp(),
            task_ref: None,
        };
        self.messages.push(message);
    }

    /// Re-extract the visible conversation from `screen_text` and merge it
    /// into the message list. Returns whether anything changed. Extraction
    /// yielding nothing usable leaves the message list untouched.
    pub fn update_from_snapshot(
        &mut self,
        screen_text: &str,
        extractor: &dyn SnapshotExtractor,
    ) -> Result<bool, SessionError> {
        if self.status != SessionStatus::Active {
            return Err(SessionError::NotActive(self.id.clone()));
        }
        if screen_text.trim().is_empty() {
            return Ok(false);
        }

        let fragments = extractor.extract(screen_text);
        self.last_recorded_snapshot = Some(screen_text.to_string());
        if fragments.is_empty() {
            tracing::debug!(session_id = %self.id, "Extraction produced no fragments, skipping update");
            return Ok(false);
        }

        let mut changed = false;
        // Fragments arrive in screen order and must match already recorded
        // messages in order; the cursor only moves forward.
        let mut cursor = self.messages.len().saturating_sub(RECONCILE_LOOKBACK);

        for fragment in fragments {
            if fragment.role == Role::System {
                // Boundary fragments are matched exactly, never fuzzily.
                if let Some(rel) = self.messages[cursor..]
                    .iter()
                    .position(|m| m.role == Role::System && m.content == fragment.content)
                {
                    cursor += rel + 1;
                    continue;
                }
                // Collapse identical consecutive boundaries (duplicate
                // triggers produce duplicate notices).
                if self
                    .messages
                    .last()
                    .map_or(false, |m| m.role == Role::System && m.content == fragment.content)
                {
                    continue;
                }
                self.push_message(fragment);
                cursor = self.messages.len();
                changed = true;
                continue;
            }

            let matched = self.messages[cursor..].iter().position(|m| {
                are_similar(m.role, &m.content, fragment.role, &fragment.content, &self.similarity)
                    || (m.role == fragment.role
                        && normalize(&fragment.content).starts_with(&normalize(&m.content)))
            });

            match matched {
                Some(rel) => {
                    let idx = cursor + rel;
                    cursor = idx + 1;
                    if idx + 1 == self.messages.len() {
                        // Only the last message may absorb a more-complete
                        // re-render of the same turn.
                        let existing = &self.messages[idx];
                        let is_partial_rerender = fragment.content.len() < existing.content.len()
                            && normalize(&existing.content).contains(&normalize(&fragment.content));
                        if fragment.content != existing.content && !is_partial_rerender {
                            let ts = self.next_timestamp();
                            let last = &mut self.messages[idx];
                            last.content = fragment.content;
                            last.timestamp = ts;
                            changed = true;
                        }
                    }
                    // Matches below the last message are frozen: skip.
                }
                None => {
                    self.push_message(fragment);
                    cursor = self.messages.len();
                    changed = true;
                }
            }
        }

        if changed {
            self.updated_at = Utc::now();
            self.emit(UpdateType::MessageAdded);
        }
        Ok(changed)
    }

    /// Attach a terminal instance. Attaching while already attached performs
    /// a clean detach first; the caller owns tearing down the old pipeline.
    pub fn attach(&mut self, instance_id: impl Into<String>) -> Result<(), SessionError> {
        if self.status == SessionStatus::Terminated {
            return Err(SessionError::NotActive(self.id.clone()));
        }
        if self.attached_instance_id.is_some() {
            self.detach();
        }
        self.attached_instance_id = Some(instance_id.into());
        self.status = SessionStatus::Active;
        self.updated_at = Utc::now();
        self.emit(UpdateType::MetadataUpdated);
        Ok(())
    }

    /// Drop the attached instance reference. Idempotent; status is unchanged
    /// so a detached session stays updatable until it terminates or exits.
    pub fn detach(&mut self) {
        if self.attached_instance_id.take().is_some() {
            self.updated_at = Utc::now();
            self.emit(UpdateType::MetadataUpdated);
        }
    }

    /// Detach the old instance and attach a new one.
    pub fn restart(&mut self, new_instance_id: impl Into<String>) -> Result<(), SessionError> {
        self.detach();
        self.attach(new_instance_id)
    }

    /// Explicit user termination. Terminal state; idempotent.
    pub fn terminate(&mut self) {
        if self.status == SessionStatus::Terminated {
            return;
        }
        self.attached_instance_id = None;
        self.status = SessionStatus::Terminated;
        self.updated_at = Utc::now();
        self.emit(UpdateType::StatusChanged);
    }

    /// The observed process ended without explicit termination.
    pub fn record_process_exit(&mut self, exit_code: Option<i32>, signal: Option<&str>) {
        if self.status != SessionStatus::Active {
            tracing::debug!(session_id = %self.id, "Process exit for non-active session, ignoring");
            return;
        }
        tracing::info!(session_id = %self.id, exit_code = ?exit_code, signal = ?signal, "Observed process exited");
        self.attached_instance_id = None;
        self.status = SessionStatus::Exited;
        self.exit_code = exit_code;
        self.updated_at = Utc::now();
        self.emit(UpdateType::StatusChanged);
    }
}
