// Colloquy
// Reconstructs structured conversations from raw terminal byte streams of
// CLI coding assistants. Hosts own the PTY; this crate taps the stream,
// decides when a re-read is worthwhile, extracts conversation fragments from
// screen snapshots and folds them into append-mostly session records.

pub mod config;
pub mod detect;
pub mod extract;
pub mod orchestrator;
pub mod reconcile;
pub mod session;
pub mod terminal;

// Re-export the types a host application touches directly.
pub use config::EngineConfig;
pub use detect::{
    DetectorConfig, StreamEventDetector, Subscription, TriggerEvent, TriggerKind,
    DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_BUFFER_BYTES,
};
pub use extract::{strip_ansi, ExtractorKind, Fragment, Role, SnapshotExtractor};
pub use orchestrator::{
    EngineError, SessionOrchestrator, SnapshotContext, SnapshotProvider,
};
pub use reconcile::{are_similar, find_similar_index, normalize, similarity, SimilarityConfig};
pub use session::{
    ConversationMessage, ConversationSession, IdGenerator, SessionError, SessionRecord,
    SessionStatus, SessionUpdate, UlidGenerator, UpdateSubscription, UpdateType,
};
pub use terminal::{
    InMemoryStreamSource, StreamSubscription, TerminalError, TerminalStreamSource,
};
