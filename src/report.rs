//! Run summaries and report files.
//!
//! The summary goes to stdout after every run. The optional report file
//! holds one row per polygon: JSON Lines by default, CSV when the path ends
//! in `.csv`.

use anyhow::{Context, Result};
use serde::Serialize;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::models::{BatchReport, ClipResult, ClipStatus};
use crate::progress::format_number;
use crate::tiles::TileWarning;

/// Flat row shape shared by both report formats.
#[derive(Serialize)]
struct ReportRow<'a> {
    fid: i64,
    status: &'static str,
    action: Option<&'static str>,
    output: Option<String>,
    tiles: usize,
    point_count: Option<u64>,
    reason: Option<&'a str>,
    error_kind: Option<&'a str>,
    error: Option<&'a str>,
}

impl<'a> From<&'a ClipResult> for ReportRow<'a> {
    fn from(r: &'a ClipResult) -> Self {
        Self {
            fid: r.fid,
            status: r.status.as_str(),
            action: r.action.map(|a| a.as_str()),
            output: r.output.as_ref().map(|p| p.display().to_string()),
            tiles: r.tiles,
            point_count: r.point_count,
            reason: r.reason.as_deref(),
            error_kind: r.error_kind.as_deref(),
            error: r.error.as_deref(),
        }
    }
}

/// Write the per-polygon report, choosing the format from the extension.
pub fn write_report(report: &BatchReport, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let is_csv = path
        .extension()
        .map(|e| e.eq_ignore_ascii_case("csv"))
        .unwrap_or(false);

    if is_csv {
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create report: {}", path.display()))?;
        for result in &report.results {
            writer.serialize(ReportRow::from(result))?;
        }
        writer.flush()?;
    } else {
        let file = std::fs::File::create(path)
            .with_context(|| format!("Failed to create report: {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        for result in &report.results {
            serde_json::to_writer(&mut writer, &ReportRow::from(result))?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
    }
    Ok(())
}

/// Print the batch summary in the CLI's line-oriented style.
pub fn print_summary(report: &BatchReport, warnings: &[TileWarning]) {
    let elapsed = report.finished_at - report.started_at;
    if report.dry_run {
        println!("clip (preview; pass --execute to write outputs)");
    } else {
        println!("clip");
    }
    println!("  polygons: {}", format_number(report.results.len() as u64));
    if report.dry_run {
        println!("  planned: {}", format_number(report.planned() as u64));
    } else {
        println!("  succeeded: {}", format_number(report.succeeded() as u64));
    }
    println!("  skipped: {}", format_number(report.skipped() as u64));
    println!("  failed: {}", format_number(report.failed() as u64));
    let points: u64 = report
        .results
        .iter()
        .filter(|r| r.status == ClipStatus::Succeeded)
        .filter_map(|r| r.point_count)
        .sum();
    if points > 0 {
        println!("  points written: {}", format_number(points));
    }
    println!("  elapsed: {:.1}s", elapsed.num_milliseconds() as f64 / 1000.0);

    for failure in report.failures() {
        println!(
            "  ! fid {}: {}",
            failure.fid,
            failure.error.as_deref().unwrap_or("unknown error")
        );
    }
    for warning in warnings {
        println!("  ? {}: {}", warning.path.display(), warning.reason);
    }
    if report.cancelled {
        println!("cancelled");
    } else {
        println!("ok");
    }
}
