//! Event sink capability and the sinks shipped with the core.

use crate::event::EventEnvelope;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Consumer capability for the event stream.
///
/// The recorder is the only writer within a scenario; sinks shared across
/// concurrently running scenarios must synchronise internally.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &EventEnvelope);

    /// Flush and release resources. Safe to call more than once.
    fn close(&self) {}
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &EventEnvelope) {}
}

/// Collects events into memory; meant for tests and inspection.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<EventEnvelope>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EventEnvelope> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &EventEnvelope) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// Append-only newline-delimited JSON file sink for run artifacts.
pub struct JsonlSink {
    path: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
}

impl JsonlSink {
    /// Open (creating parent directories) an append-mode JSONL file.
    pub fn new(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(Some(BufWriter::new(file))),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventSink for JsonlSink {
    fn emit(&self, event: &EventEnvelope) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize event for jsonl sink");
                return;
            }
        };
        if let Ok(mut guard) = self.writer.lock() {
            if let Some(writer) = guard.as_mut() {
                if let Err(e) = writeln!(writer, "{line}").and_then(|()| writer.flush()) {
                    tracing::warn!(error = %e, path = %self.path.display(), "jsonl sink write failed");
                }
            }
        }
    }

    fn close(&self) {
        if let Ok(mut guard) = self.writer.lock() {
            if let Some(mut writer) = guard.take() {
                if let Err(e) = writer.flush() {
                    tracing::warn!(error = %e, path = %self.path.display(), "jsonl sink flush failed");
                }
            }
        }
    }
}

/// Read back an artifact log written by [`JsonlSink`], in file order.
pub fn read_events(path: impl AsRef<Path>) -> std::io::Result<Vec<EventEnvelope>> {
    let raw = std::fs::read_to_string(path)?;
    let mut events = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let event = serde_json::from_str(line)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        events.push(event);
    }
    Ok(events)
}

/// Fans events out to several downstream sinks.
///
/// A failing sink must not break its siblings, so each sink is responsible
/// for swallowing its own errors in `emit`.
#[derive(Default)]
pub struct BroadcastSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl BroadcastSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: &EventEnvelope) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }

    fn close(&self) {
        for sink in &self.sinks {
            sink.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventPayload;
    use chrono::Utc;

    fn sample(trace: &str) -> EventEnvelope {
        EventEnvelope {
            timestamp: Utc::now(),
            trace_id: trace.to_string(),
            span_id: None,
            provider: None,
            payload: EventPayload::TraceStart {
                scenario: "sample".to_string(),
            },
        }
    }

    #[test]
    fn memory_sink_collects_in_order() {
        let sink = MemorySink::new();
        sink.emit(&sample("a"));
        sink.emit(&sample("b"));
        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].trace_id, "a");
        assert_eq!(events[1].trace_id, "b");
    }

    #[test]
    fn jsonl_sink_round_trips_through_the_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("runs").join("events.jsonl");
        let sink = JsonlSink::new(&path).expect("open sink");
        sink.emit(&sample("a"));
        sink.emit(&sample("b"));
        sink.close();
        sink.close(); // idempotent

        let events = read_events(&path).expect("read back");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].trace_id, "a");
    }

    #[test]
    fn broadcast_fans_out_to_all_sinks() {
        let first = Arc::new(MemorySink::new());
        let second = Arc::new(MemorySink::new());
        let broadcast = BroadcastSink::new(vec![first.clone(), second.clone()]);
        broadcast.emit(&sample("a"));
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
    }
}
