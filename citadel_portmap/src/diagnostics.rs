//! Human-readable probe, selection, and fault events.
//!
//! A sink is handed to [`crate::UPnPHandler::new`] and shared by every component of the
//! subsystem. Nothing here influences protocol decisions.
use parking_lot::Mutex;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum DiagnosticKind {
    Discovery,
    Selection,
    Fault,
    Mapping,
    Renewal,
}

impl Display for DiagnosticKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DiagnosticKind::Discovery => "discovery",
            DiagnosticKind::Selection => "selection",
            DiagnosticKind::Fault => "fault",
            DiagnosticKind::Mapping => "mapping",
            DiagnosticKind::Renewal => "renewal",
        };
        write!(f, "{name}")
    }
}

pub trait DiagnosticsSink: Send + Sync {
    fn record(&self, kind: DiagnosticKind, message: &str);
}

pub type SharedSink = Arc<dyn DiagnosticsSink>;

/// Forwards every event to the `log` facade
#[derive(Debug, Default, Copy, Clone)]
pub struct LogSink;

impl DiagnosticsSink for LogSink {
    fn record(&self, kind: DiagnosticKind, message: &str) {
        match kind {
            DiagnosticKind::Fault => log::warn!(target: "citadel", "[portmap/{kind}] {message}"),
            _ => log::info!(target: "citadel", "[portmap/{kind}] {message}"),
        }
    }
}

/// Keeps every event in memory, in arrival order
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<(DiagnosticKind, String)>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn lines(&self) -> Vec<(DiagnosticKind, String)> {
        self.lines.lock().clone()
    }

    pub fn lines_of(&self, kind: DiagnosticKind) -> Vec<String> {
        self.lines
            .lock()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, line)| line.clone())
            .collect()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines.lock().iter().any(|(_, line)| line.contains(needle))
    }
}

impl DiagnosticsSink for MemorySink {
    fn record(&self, kind: DiagnosticKind, message: &str) {
        self.lines.lock().push((kind, message.to_string()));
    }
}
