//! Human-readable CLI output.
//!
//! Tables for `kbsync sources`, `kbsync runs`, and `kbsync errors`, plus the
//! run summary printed after `kbsync sync`. Everything goes to stdout.

use chrono::{DateTime, Utc};

use crate::config::KnowledgeBaseConfig;
use crate::models::{FileRecord, SyncRun};
use crate::traits::{SinkFactory, SourceFactory};

/// Print the sink and sources configured for a knowledge base.
pub fn print_sources(
    name: &str,
    kb: &KnowledgeBaseConfig,
    sources: &SourceFactory,
    sinks: &SinkFactory,
) {
    let sink_status = if sinks.supports(&kb.sink.sink_type) {
        "OK"
    } else {
        "UNKNOWN TYPE"
    };
    println!("Knowledge base: {}", name);
    println!("  Sink: {} ({})", kb.sink.sink_type, sink_status);
    println!();
    println!("  {:<24} {:<14} {:<9} STATUS", "SOURCE", "TYPE", "ENABLED");
    println!("  {}", "-".repeat(64));

    for def in &kb.sources {
        let status = if !sources.supports(&def.source_type) {
            "UNKNOWN TYPE"
        } else {
            "OK"
        };
        println!(
            "  {:<24} {:<14} {:<9} {}",
            def.source_id, def.source_type, def.enabled, status
        );
    }
    if kb.sources.is_empty() {
        println!("  (no sources configured)");
    }
}

/// Print the outcome of one run.
pub fn print_run_summary(run: &SyncRun) {
    println!(
        "sync run {} {}  ({})",
        run.id,
        run.status.as_str(),
        format_duration(run.start_time, run.end_time)
    );
    println!(
        "  processed {}  new {}  modified {}  unchanged {}  deleted {}  errors {}",
        run.totals.processed,
        run.totals.new,
        run.totals.modified,
        run.totals.unchanged,
        run.totals.deleted,
        run.totals.errors
    );
    for (source_id, error) in &run.source_errors {
        println!("  source {} failed: {}", source_id, error);
    }
}

/// Print recent runs, newest first.
pub fn print_runs(runs: &[SyncRun]) {
    if runs.is_empty() {
        println!("No sync runs recorded.");
        return;
    }

    println!(
        "{:>6}  {:<10} {:<10} {:<16} {:>9} {:>6} {:>8} {:>7} {:>6}",
        "RUN", "MODE", "STATUS", "STARTED", "PROCESSED", "NEW", "MODIFIED", "DELETED", "ERRORS"
    );
    for run in runs {
        println!(
            "{:>6}  {:<10} {:<10} {:<16} {:>9} {:>6} {:>8} {:>7} {:>6}",
            run.id,
            run.mode.as_str(),
            run.status.as_str(),
            format_relative(run.start_time, Utc::now()),
            run.totals.processed,
            run.totals.new,
            run.totals.modified,
            run.totals.deleted,
            run.totals.errors
        );
    }
}

/// Print files whose last sync attempt failed.
pub fn print_errors(records: &[FileRecord]) {
    if records.is_empty() {
        println!("No files in error.");
        return;
    }

    for record in records {
        println!(
            "{}:{}  ({})",
            record.source_id,
            record.original_uri,
            format_relative(record.updated_at, Utc::now())
        );
        println!(
            "    {}",
            record.error_message.as_deref().unwrap_or("unknown error")
        );
    }
}

fn format_duration(start: DateTime<Utc>, end: Option<DateTime<Utc>>) -> String {
    let Some(end) = end else {
        return "running".to_string();
    };
    let ms = (end - start).num_milliseconds().max(0);
    if ms < 1000 {
        format!("{} ms", ms)
    } else if ms < 60_000 {
        format!("{:.1} s", ms as f64 / 1000.0)
    } else {
        format!("{}m {}s", ms / 60_000, (ms % 60_000) / 1000)
    }
}

/// Relative time such as "3 hours ago"; absolute past 30 days or in the future.
fn format_relative(ts: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let delta = (now - ts).num_seconds();

    if delta < 0 {
        return ts.format("%Y-%m-%d %H:%M").to_string();
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        ts.format("%Y-%m-%d %H:%M").to_string()
    }
}
