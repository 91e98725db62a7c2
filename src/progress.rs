//! Index and clip progress reporting.
//!
//! Reports observable progress while tiles are scanned and indexed and while
//! clip jobs complete, so users see how much is left. Progress is emitted on
//! **stderr** so stdout remains parseable for scripts.

use std::io::Write;
use std::sync::Arc;

use crate::models::ClipStatus;

/// A single progress event.
#[derive(Clone, Debug)]
pub enum ProgressEvent {
    /// Tile discovery finished under the configured roots.
    Scanning { tiles: u64 },
    /// Index build: n tiles processed out of total.
    Indexing { n: u64, total: u64 },
    /// Clip phase: n jobs completed out of total; `fid` just finished.
    Clipping {
        n: u64,
        total: u64,
        fid: i64,
        status: ClipStatus,
    },
}

/// Reports progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    /// Emit a progress event. Called from the index builder and orchestrator,
    /// possibly from blocking worker threads.
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr: "clip  1,234 / 5,000 polygons".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Scanning { tiles } => {
                format!("scan  found {} tiles\n", format_number(*tiles))
            }
            ProgressEvent::Indexing { n, total } => {
                format!(
                    "index  {} / {} tiles\n",
                    format_number(*n),
                    format_number(*total)
                )
            }
            ProgressEvent::Clipping {
                n,
                total,
                fid,
                status,
            } => format!(
                "clip  {} / {} polygons  (fid {} {})\n",
                format_number(*n),
                format_number(*total),
                fid,
                status.as_str()
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = match &event {
            ProgressEvent::Scanning { tiles } => serde_json::json!({
                "event": "progress",
                "phase": "scanning",
                "tiles": tiles
            }),
            ProgressEvent::Indexing { n, total } => serde_json::json!({
                "event": "progress",
                "phase": "indexing",
                "n": n,
                "total": total
            }),
            ProgressEvent::Clipping {
                n,
                total,
                fid,
                status,
            } => serde_json::json!({
                "event": "progress",
                "phase": "clipping",
                "n": n,
                "total": total,
                "fid": fid,
                "status": status
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

pub(crate) fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    /// Human progress when stderr is a TTY, otherwise off.
    Auto,
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Resolve `Auto` against the terminal.
    pub fn resolve(self) -> Self {
        match self {
            ProgressMode::Auto => {
                if atty::is(atty::Stream::Stderr) {
                    ProgressMode::Human
                } else {
                    ProgressMode::Off
                }
            }
            other => other,
        }
    }

    /// Build a shareable reporter for this mode.
    pub fn reporter(&self) -> Arc<dyn ProgressReporter> {
        match self.resolve() {
            ProgressMode::Human => Arc::new(StderrProgress),
            ProgressMode::Json => Arc::new(JsonProgress),
            ProgressMode::Off | ProgressMode::Auto => Arc::new(NoProgress),
        }
    }
}
