use std::sync::Mutex;

/// Severity of a diagnostic event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

/// A single event emitted by the engine, tagged with the stage that raised it
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub level: Level,
    pub stage: &'static str,
    pub message: String,
}

/// Destination for engine diagnostics.
///
/// Sinks are handed to each `Engine` explicitly, so two renders running side
/// by side can report to different places.
pub trait DiagnosticsSink: Send + Sync {
    fn record(&self, event: Event);
}

/// Forwards events to the `log` facade under the `mediaforge` target
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl DiagnosticsSink for LogSink {
    fn record(&self, event: Event) {
        let level = match event.level {
            Level::Debug => log::Level::Debug,
            Level::Info => log::Level::Info,
            Level::Warn => log::Level::Warn,
            Level::Error => log::Level::Error,
        };
        log::log!(target: "mediaforge", level, "[{}] {}", event.stage, event.message);
    }
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl DiagnosticsSink for NullSink {
    fn record(&self, _event: Event) {}
}

/// Keeps events in memory; useful as a per-render transcript
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Events raised by one stage, in order
    pub fn for_stage(&self, stage: &str) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.stage == stage)
            .collect()
    }
}

impl DiagnosticsSink for MemorySink {
    fn record(&self, event: Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
