//! Per-session event buffer — append-only JSONL log on disk, in-memory
//! cache, and subscriber fan-out.
//!
//! Subscribers get the cached prefix first, then live events through a
//! bounded queue. Pushes use a non-blocking try-send: a subscriber that
//! falls behind drops new events instead of stalling the producer or the
//! other subscribers. This is an intentional backpressure policy; the
//! on-disk log and cache always stay complete.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use ov_domain::event::{BufferedEvent, StreamEvent};

struct SessionBuffer {
    events: Vec<BufferedEvent>,
    subscribers: Vec<mpsc::Sender<BufferedEvent>>,
}

impl SessionBuffer {
    fn new() -> Self {
        Self {
            events: Vec::new(),
            subscribers: Vec::new(),
        }
    }
}

pub struct EventBuffer {
    /// Root of the per-session task directories (`<dir>/<session_id>/events.jsonl`).
    dir: PathBuf,
    subscriber_capacity: usize,
    inner: Mutex<HashMap<String, SessionBuffer>>,
}

impl EventBuffer {
    pub fn new(tasks_dir: PathBuf, subscriber_capacity: usize) -> Self {
        Self {
            dir: tasks_dir,
            subscriber_capacity: subscriber_capacity.max(1024),
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn events_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(session_id).join("events.jsonl")
    }

    /// Append an event: stamp it, extend cache and disk log, push to every
    /// subscriber. Returns the stamped event.
    pub fn append(&self, session_id: &str, event: StreamEvent) -> BufferedEvent {
        let buffered = BufferedEvent::stamp(event.with_session(session_id));

        // Disk first, so the log is never behind what subscribers saw.
        if let Err(e) = self.append_to_disk(session_id, &buffered) {
            tracing::warn!(session_id, error = %e, "failed to persist event");
        }

        let mut inner = self.inner.lock();
        let buffer = inner
            .entry(session_id.to_owned())
            .or_insert_with(SessionBuffer::new);
        buffer.events.push(buffered.clone());

        buffer.subscribers.retain(|tx| match tx.try_send(buffered.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Slow subscriber: drop this event for it, keep the channel.
                tracing::debug!(session_id, "subscriber queue full, dropping event");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });

        buffered
    }

    fn append_to_disk(&self, session_id: &str, event: &BufferedEvent) -> std::io::Result<()> {
        let path = self.events_path(session_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string(event)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        writeln!(file, "{json}")
    }

    /// Snapshot of the current cache for a session.
    pub fn cached(&self, session_id: &str) -> Vec<BufferedEvent> {
        self.inner
            .lock()
            .get(session_id)
            .map(|b| b.events.clone())
            .unwrap_or_default()
    }

    pub fn event_count(&self, session_id: &str) -> usize {
        self.inner
            .lock()
            .get(session_id)
            .map(|b| b.events.len())
            .unwrap_or(0)
    }

    /// Register a subscriber: returns the cached prefix and a live receiver.
    /// Every subscriber sees the same per-session event order.
    pub fn subscribe(
        &self,
        session_id: &str,
    ) -> (Vec<BufferedEvent>, mpsc::Receiver<BufferedEvent>) {
        let (tx, rx) = mpsc::channel(self.subscriber_capacity);
        let mut inner = self.inner.lock();
        let buffer = inner
            .entry(session_id.to_owned())
            .or_insert_with(SessionBuffer::new);
        let cached = buffer.events.clone();
        buffer.subscribers.push(tx);
        (cached, rx)
    }

    /// Replay a session's on-disk log into the cache (startup recovery).
    /// Malformed lines are skipped. Returns the number of events loaded.
    pub fn load_from_disk(&self, session_id: &str) -> usize {
        let path = self.events_path(session_id);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(_) => return 0,
        };

        let mut events = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<BufferedEvent>(line) {
                Ok(event) => events.push(event),
                Err(e) => {
                    tracing::warn!(session_id, error = %e, "skipping malformed event line");
                }
            }
        }

        let count = events.len();
        let mut inner = self.inner.lock();
        inner
            .entry(session_id.to_owned())
            .or_insert_with(SessionBuffer::new)
            .events = events;
        count
    }

    /// Drop the in-memory cache and the on-disk log for a session. Called
    /// when a new task starts (fresh log) or a session is deleted.
    pub fn clear(&self, session_id: &str) {
        self.inner.lock().remove(session_id);
        let path = self.events_path(session_id);
        if path.exists() {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!(session_id, error = %e, "failed to remove event log");
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use ov_domain::event::EventType;
    use serde_json::json;

    fn make_buffer() -> (tempfile::TempDir, EventBuffer) {
        let dir = tempfile::tempdir().unwrap();
        let buffer = EventBuffer::new(dir.path().join("tasks"), 1024);
        (dir, buffer)
    }

    fn text_event(text: &str) -> StreamEvent {
        StreamEvent::new(EventType::Text, json!(text))
    }

    #[test]
    fn append_stamps_session_and_timestamp() {
        let (_dir, buffer) = make_buffer();
        let buffered = buffer.append("s1", text_event("hello"));
        assert_eq!(buffered.event.session_id(), Some("s1"));
        assert!(buffered.timestamp > 0);
        assert_eq!(buffer.event_count("s1"), 1);
    }

    #[tokio::test]
    async fn subscriber_sees_cache_then_live() {
        let (_dir, buffer) = make_buffer();
        buffer.append("s1", text_event("one"));
        buffer.append("s1", text_event("two"));

        let (cached, mut rx) = buffer.subscribe("s1");
        assert_eq!(cached.len(), 2);

        buffer.append("s1", text_event("three"));
        let live = rx.recv().await.unwrap();
        assert_eq!(live.event.content, json!("three"));
    }

    #[tokio::test]
    async fn same_order_for_early_and_late_subscribers() {
        let (_dir, buffer) = make_buffer();
        let (_, mut early) = buffer.subscribe("s1");
        for i in 0..5 {
            buffer.append("s1", text_event(&format!("e{i}")));
        }
        let (cached_late, _) = buffer.subscribe("s1");

        let mut seen_early = Vec::new();
        for _ in 0..5 {
            seen_early.push(early.recv().await.unwrap().event.content.clone());
        }
        let seen_late: Vec<_> = cached_late.iter().map(|e| e.event.content.clone()).collect();
        assert_eq!(seen_early, seen_late);
    }

    #[test]
    fn overflow_drops_for_that_subscriber_only() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = EventBuffer::new(dir.path().join("tasks"), 1024);

        let (_, slow_rx) = buffer.subscribe("s1");
        // Fill past the slow subscriber's capacity without draining it.
        for i in 0..1030 {
            buffer.append("s1", text_event(&format!("e{i}")));
        }
        drop(slow_rx);

        // Cache and disk stayed complete.
        assert_eq!(buffer.event_count("s1"), 1030);
        let reloaded = {
            let fresh = EventBuffer::new(dir.path().join("tasks"), 1024);
            fresh.load_from_disk("s1")
        };
        assert_eq!(reloaded, 1030);
    }

    #[test]
    fn load_from_disk_replays_and_skips_garbage() {
        let (dir, buffer) = make_buffer();
        buffer.append("s1", text_event("persisted"));

        // Corrupt one line.
        let path = dir.path().join("tasks/s1/events.jsonl");
        let mut raw = std::fs::read_to_string(&path).unwrap();
        raw.push_str("{broken\n");
        std::fs::write(&path, raw).unwrap();

        let fresh = EventBuffer::new(dir.path().join("tasks"), 1024);
        assert_eq!(fresh.load_from_disk("s1"), 1);
        assert_eq!(fresh.cached("s1")[0].event.content, json!("persisted"));
    }

    #[test]
    fn clear_removes_cache_and_log() {
        let (dir, buffer) = make_buffer();
        buffer.append("s1", text_event("x"));
        buffer.clear("s1");
        assert_eq!(buffer.event_count("s1"), 0);
        assert!(!dir.path().join("tasks/s1/events.jsonl").exists());
    }

    #[tokio::test]
    async fn closed_subscribers_are_pruned() {
        let (_dir, buffer) = make_buffer();
        let (_, rx) = buffer.subscribe("s1");
        drop(rx);
        buffer.append("s1", text_event("a"));
        // A second append exercises the pruned subscriber list.
        buffer.append("s1", text_event("b"));
        assert_eq!(buffer.event_count("s1"), 2);
    }
}
