//! Sync progress reporting.
//!
//! Reports what each source is doing during `kbsync sync` so users can see
//! which source is listing, how far along processing is, and how it ended.
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.
//! Reporters are shared by concurrent source tasks and must be `Send + Sync`.

use std::io::Write;

use crate::models::SourceStats;

/// A single progress event for one source.
#[derive(Clone, Debug)]
pub enum SyncProgressEvent {
    /// The source is initializing and listing files. Total unknown.
    Discovering { source: String },
    /// `n` changes applied out of `total`.
    Processing { source: String, n: u64, total: u64 },
    /// The source finished, successfully or not.
    Finished {
        source: String,
        stats: SourceStats,
        error: Option<String>,
    },
}

/// Reports sync progress. Implementations write to stderr (human or JSON).
pub trait SyncProgressReporter: Send + Sync {
    /// Emit a progress event. Called from source sync tasks.
    fn report(&self, event: SyncProgressEvent);
}

/// Human-friendly progress on stderr: "sync handbook  processing  1,234 / 5,000 files".
pub struct StderrProgress;

impl SyncProgressReporter for StderrProgress {
    fn report(&self, event: SyncProgressEvent) {
        let line = match &event {
            SyncProgressEvent::Discovering { source } => {
                format!("sync {}  discovering...\n", source)
            }
            SyncProgressEvent::Processing { source, n, total } => format!(
                "sync {}  processing  {} / {} files\n",
                source,
                format_number(*n),
                format_number(*total)
            ),
            SyncProgressEvent::Finished {
                source,
                stats,
                error,
            } => match error {
                None => format!(
                    "sync {}  done  new {}, modified {}, unchanged {}, deleted {}, errors {}\n",
                    source, stats.new, stats.modified, stats.unchanged, stats.deleted, stats.errors
                ),
                Some(e) => format!("sync {}  failed  {}\n", source, e),
            },
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl SyncProgressReporter for JsonProgress {
    fn report(&self, event: SyncProgressEvent) {
        let obj = match &event {
            SyncProgressEvent::Discovering { source } => serde_json::json!({
                "event": "progress",
                "source": source,
                "phase": "discovering"
            }),
            SyncProgressEvent::Processing { source, n, total } => serde_json::json!({
                "event": "progress",
                "source": source,
                "phase": "processing",
                "n": n,
                "total": total
            }),
            SyncProgressEvent::Finished {
                source,
                stats,
                error,
            } => serde_json::json!({
                "event": "finished",
                "source": source,
                "stats": stats,
                "error": error
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: SyncProgressEvent) {}
}

fn format_number(n: u64) -> String {
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
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    /// Build a reporter for this mode.
    pub fn reporter(&self) -> std::sync::Arc<dyn SyncProgressReporter> {
        match self {
            ProgressMode::Off => std::sync::Arc::new(NoProgress),
            ProgressMode::Human => std::sync::Arc::new(StderrProgress),
            ProgressMode::Json => std::sync::Arc::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(1), "1");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1234), "1,234");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn reporters_match_modes() {
        // Smoke test: every reporter accepts every event without panicking.
        for mode in [ProgressMode::Off, ProgressMode::Human, ProgressMode::Json] {
            let reporter = mode.reporter();
            reporter.report(SyncProgressEvent::Discovering {
                source: "s".to_string(),
            });
            reporter.report(SyncProgressEvent::Finished {
                source: "s".to_string(),
                stats: SourceStats::default(),
                error: Some("boom".to_string()),
            });
        }
    }
}
