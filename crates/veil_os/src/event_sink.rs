#![forbid(unsafe_code)]

use std::io::Write;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use veil_kernel_contracts::detector::DetectorEvent;

/// Observer registered on the protocol facade. Called after a commit, so a sink
/// can never roll back or block the operation that produced the event.
pub trait DetectorEventSink {
    fn on_event(&mut self, event: &DetectorEvent);
}

/// Keeps every event in memory; clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct RecordingEventSink {
    events: Arc<Mutex<Vec<DetectorEvent>>>,
}

impl RecordingEventSink {
    pub fn events(&self) -> Vec<DetectorEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl DetectorEventSink for RecordingEventSink {
    fn on_event(&mut self, event: &DetectorEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event.clone()),
            Err(poisoned) => poisoned.into_inner().push(event.clone()),
        }
    }
}

/// Forwards events over an mpsc channel. A dropped receiver just stops delivery.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: Sender<DetectorEvent>,
}

impl ChannelEventSink {
    pub fn new(tx: Sender<DetectorEvent>) -> Self {
        Self { tx }
    }
}

impl DetectorEventSink for ChannelEventSink {
    fn on_event(&mut self, event: &DetectorEvent) {
        let _ = self.tx.send(event.clone());
    }
}

#[derive(Debug, Serialize)]
struct EventLogLine<'a> {
    level: &'static str,
    component: &'static str,
    #[serde(flatten)]
    event: &'a DetectorEvent,
}

/// Writes one JSON object per event (JSONL).
#[derive(Debug)]
pub struct JsonlEventSink<W: Write> {
    out: W,
    write_failures: u64,
}

impl<W: Write> JsonlEventSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            write_failures: 0,
        }
    }

    pub fn write_failures(&self) -> u64 {
        self.write_failures
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_line(&mut self, event: &DetectorEvent) -> Result<(), String> {
        let line = EventLogLine {
            level: "info",
            component: "veil_detector",
            event,
        };
        let mut bytes = serde_json::to_vec(&line).map_err(|e| e.to_string())?;
        bytes.push(b'\n');
        self.out.write_all(&bytes).map_err(|e| e.to_string())?;
        self.out.flush().map_err(|e| e.to_string())
    }
}

impl<W: Write> DetectorEventSink for JsonlEventSink<W> {
    fn on_event(&mut self, event: &DetectorEvent) {
        if self.write_line(event).is_err() {
            self.write_failures = self.write_failures.saturating_add(1);
        }
    }
}
