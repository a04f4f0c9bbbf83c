use chrono::{DateTime, Local};
use std::sync::Mutex;

/// Which view of the journal an entry belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// request/response traffic and client-submitted lines
    Request,
    /// seeding lifecycle events of one file
    File(String),
}

#[derive(Debug, Clone)]
struct Entry {
    at: DateTime<Local>,
    scope: Scope,
    message: String,
}

/// Append-only record of tracker activity. Entries are never rewritten or
/// dropped for the lifetime of the process; appends are serialized so
/// concurrent handlers cannot lose writes.
#[derive(Debug, Default)]
pub struct Journal {
    entries: Mutex<Vec<Entry>>,
}

impl Journal {
    pub fn new() -> Journal {
        Journal::default()
    }

    pub fn record(&self, message: impl Into<String>) {
        self.push(Scope::Request, message.into());
    }

    pub fn record_file(&self, file: &str, message: impl Into<String>) {
        self.push(Scope::File(file.to_string()), message.into());
    }

    fn push(&self, scope: Scope, message: String) {
        let mut entries = self.entries.lock().unwrap();
        entries.push(Entry {
            at: Local::now(),
            scope,
            message,
        });
    }

    /// All general (non-per-file) entries, oldest first.
    pub fn requests(&self) -> Vec<String> {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .filter(|entry| entry.scope == Scope::Request)
            .map(render)
            .collect()
    }

    /// All per-file entries, oldest first.
    pub fn file_events(&self) -> Vec<String> {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .filter(|entry| matches!(entry.scope, Scope::File(_)))
            .map(render)
            .collect()
    }

    /// Per-file entries for one file, or `None` if the journal has never
    /// seen the file.
    pub fn file_events_for(&self, file: &str) -> Option<Vec<String>> {
        let entries = self.entries.lock().unwrap();
        let lines: Vec<String> = entries
            .iter()
            .filter(|entry| matches!(&entry.scope, Scope::File(f) if f == file))
            .map(render)
            .collect();
        if lines.is_empty() {
            None
        } else {
            Some(lines)
        }
    }
}

fn render(entry: &Entry) -> String {
    let at = entry.at.format("%Y-%m-%d %H:%M:%S%.3f");
    match &entry.scope {
        Scope::Request => format!("{} {}", at, entry.message),
        Scope::File(file) => format!("{} [{}] {}", at, file, entry.message),
    }
}
