//! Rendering of run summaries and run history.

use chrono::{DateTime, Utc};
use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};

use rostersync_core::db::RunEntry;
use rostersync_core::record::Side;
use rostersync_core::{RunStatus, RunSummary};

use crate::style;

fn new_table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(header);
    table
}

fn short_id(id: &str) -> &str {
    &id[..8.min(id.len())]
}

fn timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Render a stored RFC 3339 timestamp, or its raw prefix if unparseable.
fn stored_timestamp(raw: &str) -> String {
    match DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => timestamp(&ts.with_timezone(&Utc)),
        Err(_) => raw.chars().take(19).collect(),
    }
}

fn status_cell(status: &str) -> Cell {
    match RunStatus::from_str_val(status) {
        Some(RunStatus::Success) => Cell::new("✓ success").fg(Color::Green),
        Some(RunStatus::PartialFailure) => Cell::new("⚠ partial").fg(Color::Yellow),
        Some(RunStatus::Failed) => Cell::new("✗ failed").fg(Color::Red),
        None => Cell::new(status),
    }
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

/// Key/value overview of a run.
pub fn overview(summary: &RunSummary) -> String {
    let mut lines = vec![
        format!("  Run          : {}", summary.run_id),
        format!("  Status       : {}", style::status(summary.status)),
        format!("  Started at   : {}", timestamp(&summary.started_at)),
    ];
    if let Some(ms) = summary.duration_ms() {
        lines.push(format!("  Duration     : {} ms", ms));
    }
    lines.push(format!(
        "  Stores       : A = {}, B = {}",
        summary.store_a, summary.store_b
    ));
    lines.push(format!(
        "  Direction    : {}{}",
        summary.direction,
        if summary.dry_run { " (dry run)" } else { "" }
    ));

    if let Some(err) = &summary.fatal_error {
        lines.push(format!("  Fatal error  : {}", err));
        return lines.join("\n");
    }

    lines.push(format!(
        "  Fetched      : {} from A, {} from B",
        summary.fetched_a, summary.fetched_b
    ));
    lines.push(format!(
        "  Matched      : {} ({} unchanged)",
        summary.matched, summary.unchanged
    ));
    if summary.matched_by.len() > 1 {
        for m in &summary.matched_by {
            lines.push(format!("    by {}: {}", m.pivot_fields.join(", "), m.matched));
        }
    }
    lines.push(format!(
        "  Created      : {} in A, {} in B",
        summary.created_in_a, summary.created_in_b
    ));
    lines.push(format!(
        "  Updated      : {} in A, {} in B",
        summary.updated_in_a, summary.updated_in_b
    ));
    if summary.dry_run {
        lines.push(format!("  Planned      : {}", summary.planned.len()));
    }
    lines.push(format!("  Conflicts    : {}", summary.conflicts.len()));
    lines.push(format!("  Duplicates   : {}", summary.duplicates.len()));
    lines.push(format!("  Errors       : {}", summary.errors.len()));
    lines.push(format!("  Skipped      : {}", summary.skipped.len()));
    lines.join("\n")
}

/// One titled table per non-empty report section of a run.
pub fn detail_tables(summary: &RunSummary) -> Vec<(&'static str, Table)> {
    let store = |side: Side| format!("{} ({})", summary.store_name(side), side);
    let mut sections = Vec::new();

    if !summary.conflicts.is_empty() {
        let mut table = new_table(vec!["Identity", "Field", "Value A", "Value B"]);
        for c in &summary.conflicts {
            table.add_row(vec![
                c.identity.clone(),
                c.field.clone(),
                c.value_a.to_string(),
                c.value_b.to_string(),
            ]);
        }
        sections.push(("Unresolved conflicts", table));
    }

    if !summary.duplicates.is_empty() {
        let mut table = new_table(vec!["Store", "Identity", "Records"]);
        for d in &summary.duplicates {
            table.add_row(vec![
                store(d.side),
                d.identity.to_string(),
                d.records.join(", "),
            ]);
        }
        sections.push(("Duplicate identities", table));
    }

    if !summary.errors.is_empty() {
        let mut table = new_table(vec!["Target", "Write", "Record", "Error"]);
        for e in &summary.errors {
            table.add_row(vec![
                Cell::new(store(e.target)),
                Cell::new(e.kind),
                Cell::new(&e.record),
                Cell::new(&e.message).fg(Color::Red),
            ]);
        }
        sections.push(("Write errors", table));
    }

    if !summary.skipped.is_empty() {
        let mut table = new_table(vec!["Target", "Write", "Record", "Reason"]);
        for s in &summary.skipped {
            table.add_row(vec![
                store(s.target),
                s.kind.to_string(),
                s.record.clone(),
                s.reason.to_string(),
            ]);
        }
        sections.push(("Skipped", table));
    }

    if !summary.planned.is_empty() {
        let mut table = new_table(vec!["Target", "Write", "Record", "Fields"]);
        for p in &summary.planned {
            let fields = p
                .fields
                .iter()
                .map(|(name, value)| format!("{} = {}", name, value))
                .collect::<Vec<_>>()
                .join("\n");
            table.add_row(vec![
                store(p.target),
                p.kind.to_string(),
                p.record.clone(),
                fields,
            ]);
        }
        sections.push(("Planned writes (dry run)", table));
    }

    sections
}

/// Print the overview and every detail table.
pub fn print_summary(summary: &RunSummary) {
    println!();
    println!("{}", style::header("Reconciliation Run"));
    println!();
    println!("{}", overview(summary));

    for (title, table) in detail_tables(summary) {
        println!();
        println!("{}", style::header(title));
        println!("{}", table);
    }
    if summary.needs_attention() {
        println!();
        println!("{}", style::warn("This run left items that need review."));
    }
    println!();
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// Table of stored runs, newest first.
pub fn history_table(entries: &[RunEntry]) -> Table {
    let mut table = new_table(vec![
        "Run", "Started", "Status", "Direction", "Matched", "Writes", "Conflicts", "Errors",
    ]);
    for entry in entries {
        let direction = if entry.dry_run {
            format!("{} (dry)", entry.direction)
        } else {
            entry.direction.clone()
        };
        table.add_row(vec![
            Cell::new(short_id(&entry.id)),
            Cell::new(stored_timestamp(&entry.started_at)),
            status_cell(&entry.status),
            Cell::new(direction),
            Cell::new(entry.matched),
            Cell::new(entry.total_writes),
            Cell::new(entry.conflicts),
            Cell::new(entry.errors),
        ]);
    }
    table
}
