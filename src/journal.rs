//! Append-only mission journal.
//!
//! Every dispatched command, retry, mode transition, engagement event and
//! landing step is stamped with elapsed mission time, mirrored to `tracing`,
//! kept in a bounded in-memory history and optionally appended to a
//! JSON-lines file. The core never reads the journal back to make decisions.

use crate::engagement::EngagementPhase;
use crate::mission::FlightMode;
use crate::protocol::{CommandOrigin, CommandOutcome};
use crate::safety::LandingStep;
use heapless::Vec;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::{LineWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::time::Instant;
use tracing::{error, info, warn};

pub const JOURNAL_HISTORY: usize = 256;

static_assertions::const_assert!(JOURNAL_HISTORY > 0);

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JournalEvent {
    Command {
        command_id: u32,
        command: String,
        origin: CommandOrigin,
        attempts: u8,
        outcome: CommandOutcome,
        timeout_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Retry {
        command_id: u32,
        command: String,
        attempt: u8,
        reason: String,
    },
    ModeTransition {
        from: FlightMode,
        to: FlightMode,
        waypoint: usize,
        reason: String,
    },
    Engagement {
        from: EngagementPhase,
        to: EngagementPhase,
        label: String,
        confidence: f32,
        offset_x: f32,
        offset_y: f32,
        distance_cm: Option<f32>,
        dwell_ms: u64,
        correction: Option<String>,
    },
    Warning {
        message: String,
    },
    Landing {
        step: LandingStep,
        outcome: CommandOutcome,
        height_cm: Option<f32>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JournalEntry {
    pub elapsed_ms: u64,
    #[serde(flatten)]
    pub event: JournalEvent,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JournalCounts {
    pub commands: u32,
    pub retries: u32,
    pub mode_transitions: u32,
    pub engagement_events: u32,
    pub warnings: u32,
    pub landing_steps: u32,
}

struct JournalInner {
    started: Instant,
    history: Vec<JournalEntry, JOURNAL_HISTORY>,
    counts: JournalCounts,
    sink: Option<Box<dyn Write + Send>>,
}

/// Cloneable handle; all clones append to the same journal.
#[derive(Clone)]
pub struct Journal {
    inner: Arc<Mutex<JournalInner>>,
}

impl core::fmt::Debug for Journal {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Journal").field("counts", &self.counts()).finish()
    }
}

impl Default for Journal {
    fn default() -> Self {
        Self::new()
    }
}

impl Journal {
    /// In-memory journal with no file sink.
    pub fn new() -> Self {
        Self::with_sink(None)
    }

    pub fn with_file(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::with_sink(Some(Box::new(LineWriter::new(file)))))
    }

    pub fn with_writer(writer: impl Write + Send + 'static) -> Self {
        Self::with_sink(Some(Box::new(writer)))
    }

    fn with_sink(sink: Option<Box<dyn Write + Send>>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(JournalInner {
                started: Instant::now(),
                history: Vec::new(),
                counts: JournalCounts::default(),
                sink,
            })),
        }
    }

    pub fn record(&self, event: JournalEvent) {
        trace_event(&event);

        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let elapsed_ms = u64::try_from(inner.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let counts = &mut inner.counts;
        match event {
            JournalEvent::Command { .. } => counts.commands += 1,
            JournalEvent::Retry { .. } => counts.retries += 1,
            JournalEvent::ModeTransition { .. } => counts.mode_transitions += 1,
            JournalEvent::Engagement { .. } => counts.engagement_events += 1,
            JournalEvent::Warning { .. } => counts.warnings += 1,
            JournalEvent::Landing { .. } => counts.landing_steps += 1,
        }

        let entry = JournalEntry { elapsed_ms, event };

        let mut sink_failed = false;
        if let Some(sink) = inner.sink.as_mut() {
            let written = serde_json::to_writer(&mut *sink, &entry)
                .map_err(std::io::Error::from)
                .and_then(|()| sink.write_all(b"\n"));
            if let Err(e) = written {
                error!("journal sink write failed, continuing in memory only: {}", e);
                sink_failed = true;
            }
        }
        if sink_failed {
            inner.sink = None;
        }

        if inner.history.is_full() {
            inner.history.remove(0);
        }
        let _ = inner.history.push(entry);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.record(JournalEvent::Warning { message: message.into() });
    }

    pub fn counts(&self) -> JournalCounts {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).counts
    }

    /// Most recent entries, oldest first.
    pub fn entries(&self) -> std::vec::Vec<JournalEntry> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .iter()
            .cloned()
            .collect()
    }

    pub fn flush(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sink) = inner.sink.as_mut() {
            if let Err(e) = sink.flush() {
                warn!("journal flush failed: {}", e);
            }
        }
    }
}

fn trace_event(event: &JournalEvent) {
    match event {
        JournalEvent::Command { command_id, command, attempts, outcome, detail, .. } => {
            if outcome.is_success() {
                info!(command_id, attempts, "{} -> {:?}", command, outcome);
            } else {
                warn!(command_id, attempts, "{} -> {:?} {}", command, outcome, detail.as_deref().unwrap_or(""));
            }
        }
        JournalEvent::Retry { command_id, command, attempt, reason } => {
            warn!(command_id, attempt, "{} retrying: {}", command, reason);
        }
        JournalEvent::ModeTransition { from, to, waypoint, reason } => {
            info!(waypoint, "mode {:?} -> {:?}: {}", from, to, reason);
        }
        JournalEvent::Engagement { from, to, label, confidence, correction, .. } => {
            info!(confidence, "engagement {:?} -> {:?} on '{}' {}", from, to, label, correction.as_deref().unwrap_or(""));
        }
        JournalEvent::Warning { message } => warn!("{}", message),
        JournalEvent::Landing { step, outcome, height_cm } => {
            info!("landing step {:?} -> {:?} (height {:?} cm)", step, outcome, height_cm);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<std::vec::Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct BrokenSink;

    impl Write for BrokenSink {
        fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn command(id: u32) -> JournalEvent {
        JournalEvent::Command {
            command_id: id,
            command: "forward 60".into(),
            origin: CommandOrigin::Route { waypoint: 0 },
            attempts: 1,
            outcome: CommandOutcome::Acknowledged,
            timeout_ms: 10_500,
            detail: None,
        }
    }

    #[test]
    fn test_json_lines_sink() {
        let buffer = SharedBuffer::default();
        let journal = Journal::with_writer(buffer.clone());
        journal.record(command(1));
        journal.warn("battery 28% (Warning)");

        let text = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        let lines: std::vec::Vec<serde_json::Value> =
            text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "command");
        assert_eq!(lines[0]["origin"]["by"], "route");
        assert_eq!(lines[0]["origin"]["waypoint"], 0);
        assert!(lines[0].get("detail").is_none());
        assert_eq!(lines[1]["event"], "warning");
        assert!(lines[1]["elapsed_ms"].is_u64());
    }

    #[test]
    fn test_history_is_bounded_and_counts_are_not() {
        let journal = Journal::new();
        let total = JOURNAL_HISTORY as u32 + 10;
        for id in 0..total {
            journal.record(command(id));
        }
        let entries = journal.entries();
        assert_eq!(entries.len(), JOURNAL_HISTORY);
        assert!(matches!(entries[0].event, JournalEvent::Command { command_id: 10, .. }));
        assert_eq!(journal.counts().commands, total);
    }

    #[test]
    fn test_failed_sink_falls_back_to_memory() {
        let journal = Journal::with_writer(BrokenSink);
        journal.record(command(1));
        journal.record(command(2));
        assert_eq!(journal.entries().len(), 2);
        assert_eq!(journal.counts().commands, 2);
    }
}
