//! Sync progress reporting.
//!
//! Progress goes to **stderr** so the stdout summary stays parseable for
//! scripts. Human output is the default on a TTY; `--progress json` emits one
//! JSON object per line.

use std::io::Write;

/// A single progress event for sync.
#[derive(Clone, Debug, PartialEq)]
pub enum SyncProgressEvent {
    /// Connector is querying its source; total unknown.
    Discovering { connector: String },
    /// Normalizing and storing changed items.
    Processing {
        connector: String,
        n: u64,
        total: u64,
    },
    /// Uploading records to the vector store; `n` counts finished uploads.
    Uploading {
        connector: String,
        n: u64,
        total: u64,
    },
}

pub trait SyncProgressReporter: Send + Sync {
    fn report(&self, event: SyncProgressEvent);
}

/// "sync mail  processing  1,234 / 5,000 items" on stderr.
pub struct StderrProgress;

impl SyncProgressReporter for StderrProgress {
    fn report(&self, event: SyncProgressEvent) {
        let line = match &event {
            SyncProgressEvent::Discovering { connector } => {
                format!("sync {}  discovering...\n", connector)
            }
            SyncProgressEvent::Processing {
                connector,
                n,
                total,
            } => format!(
                "sync {}  processing  {} / {} items\n",
                connector,
                format_number(*n),
                format_number(*total)
            ),
            SyncProgressEvent::Uploading {
                connector,
                n,
                total,
            } => format!(
                "sync {}  uploading  {} / {} records\n",
                connector,
                format_number(*n),
                format_number(*total)
            ),
        };
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl SyncProgressReporter for JsonProgress {
    fn report(&self, event: SyncProgressEvent) {
        if let Ok(line) = serde_json::to_string(&event_json(&event)) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

fn event_json(event: &SyncProgressEvent) -> serde_json::Value {
    match event {
        SyncProgressEvent::Discovering { connector } => serde_json::json!({
            "event": "progress",
            "connector": connector,
            "phase": "discovering"
        }),
        SyncProgressEvent::Processing {
            connector,
            n,
            total,
        } => serde_json::json!({
            "event": "progress",
            "connector": connector,
            "phase": "processing",
            "n": n,
            "total": total
        }),
        SyncProgressEvent::Uploading {
            connector,
            n,
            total,
        } => serde_json::json!({
            "event": "progress",
            "connector": connector,
            "phase": "uploading",
            "n": n,
            "total": total
        }),
    }
}

pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: SyncProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn SyncProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
