//! Stream event detection over raw terminal bytes.
//!
//! The detector watches everything flowing out of (and into) a terminal
//! instance and turns it into discrete lifecycle triggers: a session banner
//! appeared, the screen was cleared, the user pressed enter, output went
//! idle. It never interprets content or roles — every trigger means the same
//! thing downstream: "now is a good time to fetch a fresh snapshot and
//! re-extract."
//!
//! Pattern matching runs against the cumulative buffer with a per-pattern
//! scan offset, so a control sequence split across two `ingest` calls is
//! still detected exactly once. Requires a tokio runtime for the idle timer.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Default quiet window before an `OutputIdle` trigger fires. The upstream
/// tools redraw spinners every few hundred milliseconds, so anything shorter
/// never goes idle mid-response.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Cap on the cumulative buffer; trimmed from the front when exceeded.
pub const DEFAULT_MAX_BUFFER_BYTES: usize = 512 * 1024;

static DEFAULT_BANNER_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Welcome to Claude Code|Claude Code v\d").unwrap());

/// Explicit clear-screen control sequences or a `/clear` command echo.
static CLEAR_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[2J|\x1b\[3J|\x1b\[H\x1b\[J|\x1bc|/clear").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    SessionBanner,
    ScreenCleared,
    EnterPressed,
    OutputIdle,
}

/// A discrete resynchronization signal.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerEvent {
    pub kind: TriggerKind,
    pub raw_match: String,
    pub timestamp: DateTime<Utc>,
}

/// Detector tuning. The banner pattern is per-tool; everything else is
/// tool-agnostic.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub idle_timeout: Duration,
    pub max_buffer_bytes: usize,
    pub banner_pattern: Regex,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
            banner_pattern: DEFAULT_BANNER_PATTERN.clone(),
        }
    }
}

type Listener = Arc<dyn Fn(&TriggerEvent) + Send + Sync>;

struct DetectorInner {
    buffer: String,
    banner_pos: usize,
    clear_pos: usize,
    destroyed: bool,
    listeners: HashMap<u64, (Option<TriggerKind>, Listener)>,
    next_listener_id: u64,
    idle_generation: u64,
    idle_task: Option<tokio::task::JoinHandle<()>>,
}

impl DetectorInner {
    fn listener_snapshot(&self, kind: TriggerKind) -> Vec<Listener> {
        let mut ids: Vec<_> = self
            .listeners
            .iter()
            .filter(|(_, (filter, _))| filter.map_or(true, |f| f == kind))
            .collect();
        // HashMap iteration order is arbitrary; deliver in subscribe order.
        ids.sort_by_key(|(id, _)| **id);
        ids.into_iter().map(|(_, (_, l))| l.clone()).collect()
    }
}

/// Observes a terminal's byte stream and emits [`TriggerEvent`]s.
pub struct StreamEventDetector {
    inner: Arc<Mutex<DetectorInner>>,
    config: DetectorConfig,
}

/// Handle returned by [`StreamEventDetector::on`]; dropping it (or calling
/// [`Subscription::unsubscribe`]) removes the listener.
pub struct Subscription {
    inner: Weak<Mutex<DetectorInner>>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.lock().listeners.remove(&self.id);
        }
    }
}

impl StreamEventDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(DetectorInner {
                buffer: String::new(),
                banner_pos: 0,
                clear_pos: 0,
                destroyed: false,
                listeners: HashMap::new(),
                next_listener_id: 0,
                idle_generation: 0,
                idle_task: None,
            })),
            config,
        }
    }

    /// Subscribe to triggers. `kind` of `None` receives every trigger.
    pub fn on(
        &self,
        kind: Option<TriggerKind>,
        listener: impl Fn(&TriggerEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let mut inner = self.inner.lock();
        let id = inner.next_listener_id;
        inner.next_listener_id += 1;
        inner.listeners.insert(id, (kind, Arc::new(listener)));
        Subscription {
            inner: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Feed inbound terminal output. Runs the banner/clear matchers against
    /// the cumulative buffer and restarts the idle countdown.
    pub fn ingest(&self, chunk: &str) {
        let mut pending: Vec<(TriggerEvent, Vec<Listener>)> = Vec::new();
        {
            let mut inner = self.inner.lock();
            if inner.destroyed {
                return;
            }
            inner.buffer.push_str(chunk);
            self.trim_buffer(&mut inner);
            self.scan(&mut inner, &mut pending);
            self.restart_idle_timer(&mut inner);
        }
        // Listeners run outside the lock so they may call back in.
        for (event, listeners) in &pending {
            for listener in listeners {
                listener(event);
            }
        }
    }

    /// Feed outbound bytes the user typed. Only used to detect the enter
    /// keystroke ("the user just submitted something, check now").
    pub fn ingest_write(&self, chunk: &str) {
        if !chunk.contains('\r') && !chunk.contains('\n') {
            return;
        }
        let (event, listeners) = {
            let inner = self.inner.lock();
            if inner.destroyed {
                return;
            }
            (
                TriggerEvent {
                    kind: TriggerKind::EnterPressed,
                    raw_match: "\r".to_string(),
                    timestamp: Utc::now(),
                },
                inner.listener_snapshot(TriggerKind::EnterPressed),
            )
        };
        for listener in &listeners {
            listener(&event);
        }
    }

    /// Everything seen since the last reset (bounded by the buffer cap).
    pub fn buffer_contents(&self) -> String {
        self.inner.lock().buffer.clone()
    }

    pub fn reset_buffer(&self) {
        let mut inner = self.inner.lock();
        inner.buffer.clear();
        inner.banner_pos = 0;
        inner.clear_pos = 0;
    }

    /// Cancel the pending idle timer and drop all subscriptions. Idempotent;
    /// no trigger fires after this returns.
    pub fn destroy(&self) {
        let mut inner = self.inner.lock();
        inner.destroyed = true;
        inner.idle_generation += 1;
        if let Some(task) = inner.idle_task.take() {
            task.abort();
        }
        inner.listeners.clear();
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.lock().destroyed
    }

    fn trim_buffer(&self, inner: &mut DetectorInner) {
        let over = inner.buffer.len().saturating_sub(self.config.max_buffer_bytes);
        if over == 0 {
            return;
        }
        let mut cut = over;
        while cut < inner.buffer.len() && !inner.buffer.is_char_boundary(cut) {
            cut += 1;
        }
        inner.buffer.drain(..cut);
        inner.banner_pos = inner.banner_pos.saturating_sub(cut);
        inner.clear_pos = inner.clear_pos.saturating_sub(cut);
    }

    fn scan(&self, inner: &mut DetectorInner, pending: &mut Vec<(TriggerEvent, Vec<Listener>)>) {
        while let Some(m) = self.config.banner_pattern.find(&inner.buffer[inner.banner_pos..]) {
            let raw = m.as_str().to_string();
            inner.banner_pos += m.end();
            pending.push((
                TriggerEvent {
                    kind: TriggerKind::SessionBanner,
                    raw_match: raw,
                    timestamp: Utc::now(),
                },
                inner.listener_snapshot(TriggerKind::SessionBanner),
            ));
        }
        while let Some(m) = CLEAR_PATTERN.find(&inner.buffer[inner.clear_pos..]) {
            let raw = m.as_str().to_string();
            inner.clear_pos += m.end();
            pending.push((
                TriggerEvent {
                    kind: TriggerKind::ScreenCleared,
                    raw_match: raw,
                    timestamp: Utc::now(),
                },
                inner.listener_snapshot(TriggerKind::ScreenCleared),
            ));
        }
    }

    fn restart_idle_timer(&self, inner: &mut DetectorInner) {
        inner.idle_generation += 1;
        let generation = inner.idle_generation;
        if let Some(task) = inner.idle_task.take() {
            task.abort();
        }
        let weak = Arc::downgrade(&self.inner);
        // Anchor the deadline now, not at the task's first poll.
        let deadline = tokio::time::Instant::now() + self.config.idle_timeout;
        inner.idle_task = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let (event, listeners) = {
                let guard = inner.lock();
                if guard.destroyed || guard.idle_generation != generation {
                    return;
                }
                (
                    TriggerEvent {
                        kind: TriggerKind::OutputIdle,
                        raw_match: String::new(),
                        timestamp: Utc::now(),
                    },
                    guard.listener_snapshot(TriggerKind::OutputIdle),
                )
            };
            for listener in &listeners {
                listener(&event);
            }
        }));
    }
}

impl Drop for StreamEventDetector {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counted(
        detector: &StreamEventDetector,
        kind: TriggerKind,
    ) -> (Arc<AtomicUsize>, Subscription) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let sub = detector.on(Some(kind), move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (count, sub)
    }

    #[tokio::test]
    async fn test_banner_detected() {
        let detector = StreamEventDetector::new(DetectorConfig::default());
        let (count, _sub) = counted(&detector, TriggerKind::SessionBanner);
        detector.ingest("some art\nWelcome to Claude Code\nmore art");
        assert_eq!(count.load(Ordering::SeqCst), 1);
        // The same banner occurrence never fires twice.
        detector.ingest("trailing output");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_clear_split_across_chunks_fires_once() {
        let detector = StreamEventDetector::new(DetectorConfig::default());
        let (count, _sub) = counted(&detector, TriggerKind::ScreenCleared);
        detector.ingest("output\x1b[");
        assert_eq!(count.load(Ordering::SeqCst), 0);
        detector.ingest("2J\x1b[Hredrawn");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_enter_pressed_on_write() {
        let detector = StreamEventDetector::new(DetectorConfig::default());
        let (count, _sub) = counted(&detector, TriggerKind::EnterPressed);
        detector.ingest_write("hello");
        assert_eq!(count.load(Ordering::SeqCst), 0);
        detector.ingest_write("\r");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_output_idle_after_quiet_window() {
        let detector = StreamEventDetector::new(DetectorConfig::default());
        let (count, _sub) = counted(&detector, TriggerKind::OutputIdle);

        detector.ingest("chunk one");
        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        // New output restarts the countdown.
        detector.ingest("chunk two");
        tokio::time::advance(Duration::from_millis(900)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_millis(200)).await;
        // `advance` yields only once; yield again so the woken idle task
        // actually runs before we assert.
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Quiet stays quiet: no repeated idle triggers.
        tokio::time::advance(Duration::from_secs(5)).await;
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_stops_everything() {
        let detector = StreamEventDetector::new(DetectorConfig::default());
        let (banner_count, _s1) = counted(&detector, TriggerKind::SessionBanner);
        let (idle_count, _s2) = counted(&detector, TriggerKind::OutputIdle);

        detector.ingest("warm up");
        detector.destroy();
        detector.destroy(); // idempotent

        detector.ingest("Welcome to Claude Code");
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(banner_count.load(Ordering::SeqCst), 0);
        assert_eq!(idle_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_subscription_drop_stops_delivery() {
        let detector = StreamEventDetector::new(DetectorConfig::default());
        let (count, sub) = counted(&detector, TriggerKind::ScreenCleared);
        detector.ingest("\x1b[2J");
        assert_eq!(count.load(Ordering::SeqCst), 1);
        sub.unsubscribe();
        detector.ingest("\x1b[2J");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_buffer_contents_and_reset() {
        let detector = StreamEventDetector::new(DetectorConfig::default());
        detector.ingest("abc");
        detector.ingest("def");
        assert_eq!(detector.buffer_contents(), "abcdef");
        detector.reset_buffer();
        assert_eq!(detector.buffer_contents(), "");
    }

    #[tokio::test]
    async fn test_buffer_trimmed_at_cap() {
        let config = DetectorConfig {
            max_buffer_bytes: 16,
            ..DetectorConfig::default()
        };
        let detector = StreamEventDetector::new(config);
        detector.ingest("0123456789abcdef");
        detector.ingest("XYZ");
        let contents = detector.buffer_contents();
        assert_eq!(contents.len(), 16);
        assert!(contents.ends_with("XYZ"));
    }
}
