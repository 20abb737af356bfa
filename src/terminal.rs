//! Terminal stream source abstraction.
//!
//! The engine never owns a PTY. A host application (or test harness) owns the
//! terminal process and exposes it through [`TerminalStreamSource`]: output
//! bytes flow out via `on_data`, user keystrokes echo via `on_write`, and the
//! engine only ever taps both streams. [`InMemoryStreamSource`] is a
//! channel-free implementation backed by plain callbacks, which is all the
//! orchestrator needs and what the tests drive directly.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TerminalError {
    #[error("Terminal stream error: {0}")]
    Stream(String),
    #[error("Terminal not found: {0}")]
    NotFound(String),
    #[error("Terminal closed: {0}")]
    Closed(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

type DataListener = Arc<dyn Fn(&[u8]) + Send + Sync>;
type DataListenerTable = Arc<Mutex<HashMap<u64, DataListener>>>;

/// Handle for a data/write tap; dropping it removes the listener.
pub struct StreamSubscription {
    table: Weak<Mutex<HashMap<u64, DataListener>>>,
    id: u64,
}

impl StreamSubscription {
    pub fn unsubscribe(self) {}
}

impl Drop for StreamSubscription {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            table.lock().remove(&self.id);
        }
    }
}

/// One live terminal instance as seen from the engine.
pub trait TerminalStreamSource: Send + Sync {
    /// Stable instance id, distinct from any session id.
    fn instance_id(&self) -> &str;

    /// Tap the terminal's output stream (raw bytes, ANSI included).
    fn on_data(&self, listener: Box<dyn Fn(&[u8]) + Send + Sync>) -> StreamSubscription;

    /// Tap bytes written toward the terminal (user keystrokes).
    fn on_write(&self, listener: Box<dyn Fn(&[u8]) + Send + Sync>) -> StreamSubscription;

    /// Send bytes to the terminal.
    fn write(&self, data: &[u8]) -> Result<(), TerminalError>;

    fn resize(&self, cols: u16, rows: u16) -> Result<(), TerminalError>;

    /// Tear the instance down. Listeners receive nothing further.
    fn kill(&self) -> Result<(), TerminalError>;
}

struct InMemoryInner {
    data_listeners: DataListenerTable,
    write_listeners: DataListenerTable,
    written: Vec<u8>,
    cols: u16,
    rows: u16,
    closed: bool,
}

/// Callback-backed stream source with no process behind it. The owner feeds
/// output in with [`push_output`](InMemoryStreamSource::push_output).
pub struct InMemoryStreamSource {
    id: String,
    inner: Arc<Mutex<InMemoryInner>>,
}

impl InMemoryStreamSource {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            id: instance_id.into(),
            inner: Arc::new(Mutex::new(InMemoryInner {
                data_listeners: Arc::new(Mutex::new(HashMap::new())),
                write_listeners: Arc::new(Mutex::new(HashMap::new())),
                written: Vec::new(),
                cols: 80,
                rows: 24,
                closed: false,
            })),
        }
    }

    /// Deliver terminal output to every data listener.
    pub fn push_output(&self, data: &[u8]) {
        let listeners = Self::collect(&self.inner.lock().data_listeners);
        for listener in listeners {
            listener(data);
        }
    }

    /// Bytes the engine (or host) has written so far.
    pub fn written(&self) -> Vec<u8> {
        self.inner.lock().written.clone()
    }

    pub fn size(&self) -> (u16, u16) {
        let inner = self.inner.lock();
        (inner.cols, inner.rows)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    fn collect(table: &DataListenerTable) -> Vec<DataListener> {
        let table = table.lock();
        let mut entries: Vec<_> = table.iter().collect();
        entries.sort_by_key(|(id, _)| **id);
        entries.into_iter().map(|(_, l)| l.clone()).collect()
    }

    fn subscribe(table: &DataListenerTable, next_id: u64, listener: DataListener) -> StreamSubscription {
        table.lock().insert(next_id, listener);
        StreamSubscription {
            table: Arc::downgrade(table),
            id: next_id,
        }
    }
}

static NEXT_SUBSCRIPTION_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

fn next_subscription_id() -> u64 {
    NEXT_SUBSCRIPTION_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
}

impl TerminalStreamSource for InMemoryStreamSource {
    fn instance_id(&self) -> &str {
        &self.id
    }

    fn on_data(&self, listener: Box<dyn Fn(&[u8]) + Send + Sync>) -> StreamSubscription {
        let inner = self.inner.lock();
        Self::subscribe(&inner.data_listeners, next_subscription_id(), Arc::from(listener))
    }

    fn on_write(&self, listener: Box<dyn Fn(&[u8]) + Send + Sync>) -> StreamSubscription {
        let inner = self.inner.lock();
        Self::subscribe(&inner.write_listeners, next_subscription_id(), Arc::from(listener))
    }

    fn write(&self, data: &[u8]) -> Result<(), TerminalError> {
        let listeners = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(TerminalError::Closed(self.id.clone()));
            }
            inner.written.extend_from_slice(data);
            Self::collect(&inner.write_listeners)
        };
        for listener in listeners {
            listener(data);
        }
        Ok(())
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<(), TerminalError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(TerminalError::Closed(self.id.clone()));
        }
        inner.cols = cols;
        inner.rows = rows;
        Ok(())
    }

    fn kill(&self) -> Result<(), TerminalError> {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.data_listeners.lock().clear();
        inner.write_listeners.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_reaches_data_listeners() {
        let source = InMemoryStreamSource::new("term-1");
        let seen: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = source.on_data(Box::new(move |data| sink.lock().extend_from_slice(data)));

        source.push_output(b"hello ");
        source.push_output(b"world");
        assert_eq!(&*seen.lock(), b"hello world");
    }

    #[test]
    fn test_write_echoes_to_write_listeners() {
        let source = InMemoryStreamSource::new("term-1");
        let seen: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = source.on_write(Box::new(move |data| sink.lock().extend_from_slice(data)));

        source.write(b"ls\r").unwrap();
        assert_eq!(&*seen.lock(), b"ls\r");
        assert_eq!(source.written(), b"ls\r");
    }

    #[test]
    fn test_subscription_drop_removes_listener() {
        let source = InMemoryStreamSource::new("term-1");
        let seen: Arc<Mutex<usize>> = Arc::new(Mutex::new(0));
        let sink = seen.clone();
        let sub = source.on_data(Box::new(move |_| *sink.lock() += 1));

        source.push_output(b"a");
        sub.unsubscribe();
        source.push_output(b"b");
        assert_eq!(*seen.lock(), 1);
    }

    #[test]
    fn test_kill_closes_and_silences() {
        let source = InMemoryStreamSource::new("term-1");
        let seen: Arc<Mutex<usize>> = Arc::new(Mutex::new(0));
        let sink = seen.clone();
        let _sub = source.on_data(Box::new(move |_| *sink.lock() += 1));

        source.kill().unwrap();
        assert!(source.is_closed());
        source.push_output(b"late");
        assert_eq!(*seen.lock(), 0);
        assert!(matches!(source.write(b"x"), Err(TerminalError::Closed(_))));
    }

    #[test]
    fn test_resize() {
        let source = InMemoryStreamSource::new("term-1");
        source.resize(120, 40).unwrap();
        assert_eq!(source.size(), (120, 40));
    }
}
