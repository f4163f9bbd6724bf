//! Per-server console buffer with live listener fan-out.
//!
//! Every byte a server process writes is split into lines, stamped with a
//! monotonic epoch, retained in a bounded buffer, and pushed to registered
//! listeners. Late joiners backfill with [`ConsoleBuffer::read_from`] and use
//! the returned cursor for subsequent polls.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::debug;

/// Default retained line count.
pub const DEFAULT_MAX_LINES: usize = 1000;

/// Default retained line age.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(10 * 60);

/// Event delivered to live console listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleEvent {
    /// A line of process output.
    Line(String),
    /// The underlying process exited.
    Stopped { exit_code: Option<i32> },
}

/// A live console subscriber.
///
/// Listeners only see output produced after registration; a listener whose
/// channel is closed or full is removed on the next write attempt.
pub type Listener = mpsc::Sender<ConsoleEvent>;

struct ConsoleLine {
    epoch: i64,
    text: String,
}

struct Inner {
    lines: VecDeque<ConsoleLine>,
    listeners: Vec<Listener>,
    /// One past the newest retained line's epoch. Polling with this cursor
    /// returns only lines produced later.
    cursor: i64,
    /// Trailing bytes of an incomplete line, carried until the newline arrives.
    partial: String,
}

/// Bounded, epoch-indexed append-only log of console output.
pub struct ConsoleBuffer {
    inner: Mutex<Inner>,
    max_lines: usize,
    max_age: Duration,
}

impl Default for ConsoleBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINES, DEFAULT_MAX_AGE)
    }
}

impl ConsoleBuffer {
    pub fn new(max_lines: usize, max_age: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                lines: VecDeque::new(),
                listeners: Vec::new(),
                cursor: 0,
                partial: String::new(),
            }),
            max_lines,
            max_age,
        }
    }

    /// Append raw process output, splitting it into lines.
    ///
    /// An incomplete trailing line is held back until its newline arrives
    /// (or [`flush`](Self::flush) is called).
    pub fn write(&self, data: &str) {
        let mut inner = self.inner.lock().expect("console lock poisoned");
        let mut buf = std::mem::take(&mut inner.partial);
        buf.push_str(data);

        while let Some(pos) = buf.find('\n') {
            let mut line: String = buf.drain(..=pos).collect();
            line.truncate(line.trim_end_matches(['\n', '\r']).len());
            Self::append_line(&mut inner, self.max_lines, self.max_age, line);
        }
        inner.partial = buf;
    }

    /// Append a single complete line.
    pub fn write_line(&self, line: &str) {
        let mut inner = self.inner.lock().expect("console lock poisoned");
        Self::append_line(&mut inner, self.max_lines, self.max_age, line.to_string());
    }

    /// Flush any held-back partial line into the buffer.
    pub fn flush(&self) {
        let mut inner = self.inner.lock().expect("console lock poisoned");
        if !inner.partial.is_empty() {
            let line = std::mem::take(&mut inner.partial);
            Self::append_line(&mut inner, self.max_lines, self.max_age, line);
        }
    }

    /// Broadcast a control event to all listeners.
    pub fn broadcast(&self, event: ConsoleEvent) {
        let mut inner = self.inner.lock().expect("console lock poisoned");
        Self::fan_out(&mut inner.listeners, event);
    }

    /// Register a live subscriber. No replay: only future output is delivered.
    pub fn add_listener(&self, listener: Listener) {
        let mut inner = self.inner.lock().expect("console lock poisoned");
        inner.listeners.push(listener);
    }

    /// Retained lines with epoch >= `epoch`, in production order, plus the
    /// current cursor for the next poll.
    ///
    /// Lines evicted by retention are simply no longer satisfiable; polling
    /// with an old epoch returns what remains, never an error.
    pub fn read_from(&self, epoch: i64) -> (Vec<String>, i64) {
        let inner = self.inner.lock().expect("console lock poisoned");
        let lines = inner
            .lines
            .iter()
            .filter(|l| l.epoch >= epoch)
            .map(|l| l.text.clone())
            .collect();
        (lines, inner.cursor)
    }

    /// Number of currently registered listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.lock().expect("console lock poisoned").listeners.len()
    }

    fn append_line(inner: &mut Inner, max_lines: usize, max_age: Duration, text: String) {
        // Epochs are wall-clock millis clamped monotonic non-decreasing.
        let epoch = Utc::now().timestamp_millis().max(inner.cursor);
        inner.lines.push_back(ConsoleLine {
            epoch,
            text: text.clone(),
        });
        inner.cursor = epoch + 1;

        while inner.lines.len() > max_lines {
            inner.lines.pop_front();
        }
        let min_epoch = Utc::now().timestamp_millis() - max_age.as_millis() as i64;
        while inner.lines.front().is_some_and(|l| l.epoch < min_epoch) {
            inner.lines.pop_front();
        }

        Self::fan_out(&mut inner.listeners, ConsoleEvent::Line(text));
    }

    fn fan_out(listeners: &mut Vec<Listener>, event: ConsoleEvent) {
        // A slow or disconnected listener must never stall output capture:
        // try_send and prune on failure.
        listeners.retain(|l| match l.try_send(event.clone()) {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "Dropping console listener");
                false
            }
        });
    }
}
