//! Activity logging: append-only JSONL with graceful degradation.

pub mod jsonl;

use parking_lot::Mutex;

use self::jsonl::{JsonlConfig, JsonlWriter, LogEntry, Severity};

/// Shared handle onto the activity log.
///
/// Lifecycle calls on different containers may run concurrently; they all
/// append through the same mutex-guarded writer.
pub struct ActivityLog {
    writer: Option<Mutex<JsonlWriter>>,
    echo_stderr: bool,
}

impl ActivityLog {
    /// Log to `config.path`, echoing warnings and criticals to stderr when `echo_stderr`.
    #[must_use]
    pub fn open(config: JsonlConfig, echo_stderr: bool) -> Self {
        Self {
            writer: Some(Mutex::new(JsonlWriter::open(config))),
            echo_stderr,
        }
    }

    /// Discard everything.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            writer: None,
            echo_stderr: false,
        }
    }

    pub fn record(&self, entry: &LogEntry) {
        if self.echo_stderr && entry.severity != Severity::Info {
            eprintln!("[CBH] {}", summarize(entry));
        }
        if let Some(writer) = &self.writer {
            let mut w = writer.lock();
            w.write_entry(entry);
            w.flush();
        }
    }

    /// Writer degradation state, `None` when disabled.
    #[must_use]
    pub fn state(&self) -> Option<&'static str> {
        self.writer.as_ref().map(|w| w.lock().state())
    }

    /// Flush and sync the underlying file.
    pub fn sync(&self) {
        if let Some(writer) = &self.writer {
            writer.lock().fsync();
        }
    }
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::disabled()
    }
}

fn summarize(entry: &LogEntry) -> String {
    let event = serde_json::to_value(entry.event)
        .ok()
        .and_then(|v| v.as_str().map(str::to_owned))
        .unwrap_or_else(|| format!("{:?}", entry.event));
    let mut line = event;
    if let Some(name) = &entry.container {
        line.push_str(&format!(" {name}"));
    }
    if let Some(message) = entry.error_message.as_ref().or(entry.details.as_ref()) {
        line.push_str(&format!(": {message}"));
    }
    line
}
