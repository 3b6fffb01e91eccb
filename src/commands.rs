//! Terminal output for `coursectl` commands.
//!
//! Every report has a human rendering and a `--json` rendering. Human
//! output goes to stdout in the same plain, indented style for every
//! command; progress and logs stay on stderr.

use anyhow::Result;
use serde::Serialize;

use course_harness_core::models::{BackupSnapshot, BackupSummary};

use crate::backup::RestoreSummary;
use crate::engine::{MigrationResult, RunStatus};
use crate::health::{HealthStatus, HealthVerdict, IntegrityReport};
use crate::planner::{MigrationPlan, ScopeEstimate};
use crate::progress::format_number;

/// How many per-record errors to list before summarizing the rest.
const MAX_LISTED_ERRORS: usize = 20;

/// Print `value` as pretty JSON on stdout.
pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn print_result(result: &MigrationResult) {
    let status = match result.status {
        RunStatus::Completed => "completed",
        RunStatus::Failed => "failed",
        RunStatus::Cancelled => "cancelled",
    };
    println!("{} {}", result.operation, status);
    println!("  total:     {}", format_number(result.total));
    println!("  processed: {}", format_number(result.processed));
    println!("  success:   {}", format_number(result.success));
    println!(
        "  failed:    {} ({:.1}%)",
        format_number(result.failed),
        result.failure_rate() * 100.0
    );
    println!("  skipped:   {}", format_number(result.skipped));
    println!("  batches:   {}", result.batches_committed);
    if let Some(id) = &result.backup_id {
        println!("  backup:    {}", id);
    }
    if !result.lost.is_empty() {
        println!("  lost:      {} staged mutations", result.lost.len());
    }
    println!("  duration:  {:.1}s", result.duration_ms as f64 / 1000.0);

    if !result.errors.is_empty() {
        println!();
        println!("errors:");
        for e in result.errors.iter().take(MAX_LISTED_ERRORS) {
            println!("  {}  [{}] {}", e.reference, e.code, e.message);
        }
        if result.errors.len() > MAX_LISTED_ERRORS {
            println!("  ... and {} more", result.errors.len() - MAX_LISTED_ERRORS);
        }
    }
}

pub fn print_plans(plans: &[MigrationPlan]) {
    for plan in plans {
        println!("{} (v{})", plan.name, plan.version);
        println!("  {}", plan.description);
        println!("  target:          {:?}", plan.target);
        println!("  pending items:   {}", format_number(plan.estimated_item_count));
        println!("  requires backup: {}", if plan.requires_backup { "yes" } else { "no" });
        for risk in &plan.risks {
            println!("  risk: {}", risk);
        }
        println!();
    }
}

pub fn print_scope(scope: &ScopeEstimate) {
    println!("Scope");
    println!("=====");
    println!();
    println!("  Collections: {}", format_number(scope.total_collections));
    println!("  Records:     {}", format_number(scope.total_records));
    println!();
    if !scope.collections.is_empty() {
        println!("  {:<30} {:>10}", "COLLECTION", "RECORDS");
        for c in &scope.collections {
            println!("  {:<30} {:>10}", c.id, format_number(c.records));
        }
        println!();
    }
    println!("  Pending per plan:");
    for (plan, count) in &scope.needing_migration {
        println!("    {:<28} {:>10}", plan, format_number(*count));
    }
}

pub fn print_backup(snapshot: &BackupSnapshot) {
    println!("backup {}", snapshot.id);
    println!("  label:    {}", snapshot.label);
    println!("  created:  {}", snapshot.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("  scope:    {}", snapshot.scope.as_deref().unwrap_or("all"));
    println!("  records:  {}", format_number(snapshot.record_count as u64));
    println!("  checksum: {}", snapshot.checksum);
}

pub fn print_backups(backups: &[BackupSummary]) {
    if backups.is_empty() {
        println!("No backups.");
        return;
    }
    println!(
        "  {:<36}  {:<20}  {:>8}  {}",
        "ID", "CREATED", "RECORDS", "LABEL"
    );
    for b in backups {
        println!(
            "  {:<36}  {:<20}  {:>8}  {}",
            b.id,
            b.created_at.format("%Y-%m-%d %H:%M:%S"),
            format_number(b.record_count as u64),
            b.label
        );
    }
}

pub fn print_restore(summary: &RestoreSummary) {
    println!("restore {}", summary.backup_id);
    println!("  restored: {}", format_number(summary.restored));
    println!("  batches:  {}", summary.batches_committed);
    if summary.is_complete() {
        println!("ok");
    } else {
        println!("  lost:     {} records not written back", summary.lost.len());
    }
}

pub fn print_verdict(verdict: &HealthVerdict) {
    let status = match verdict.status {
        HealthStatus::Healthy => "healthy",
        HealthStatus::Warning => "warning",
        HealthStatus::Error => "error",
    };
    println!("health: {}", status);
    for c in &verdict.checks {
        println!(
            "  {:<22} {:<4} {:>5}ms  {}",
            c.name,
            if c.passed { "ok" } else { "FAIL" },
            c.duration_ms,
            c.message
        );
    }
}

pub fn print_integrity(report: &IntegrityReport) {
    println!("Data integrity");
    println!("==============");
    println!();
    println!("  Collections: {}", format_number(report.total_collections));
    println!("  Records:     {}", format_number(report.total_records));
    println!("  Invalid:     {}", format_number(report.invalid_records));
    println!();
    println!("  Field presence:");
    for (field, count) in &report.field_presence {
        println!("    {:<20} {:>10}", field, format_number(*count));
    }
    if !report.findings.is_empty() {
        println!();
        println!("  Findings:");
        for f in report.findings.iter().take(MAX_LISTED_ERRORS) {
            println!("    {:<40} {:?}: {}", f.id, f.severity, f.issue);
        }
        if report.findings.len() > MAX_LISTED_ERRORS {
            println!("    ... and {} more", report.findings.len() - MAX_LISTED_ERRORS);
        }
    }
}
