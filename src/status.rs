//! Operator views of execution records.
//!
//! Backs `level0 status`, `level0 executions` and `level0 cancel`. Output
//! goes to stdout in a plain aligned layout meant for terminals.

use anyhow::{anyhow, bail, Result};

use level0_core::machine::{Execution, ExecutionState};
use level0_core::models::ExecutionId;
use level0_core::ports::ExecutionStore;

use crate::orchestrator::CancelOutcome;
use crate::pipeline::Pipeline;

/// Default row limit for `level0 executions`.
pub const DEFAULT_LIST_LIMIT: usize = 50;

/// With an id, print that execution's record; without one, print counts per
/// state plus the arrival buffer depth.
pub async fn run_status(pipeline: &Pipeline, id: Option<&str>) -> Result<()> {
    let Some(raw) = id else {
        return print_overview(pipeline).await;
    };
    let id = ExecutionId::parse(raw).map_err(|e| anyhow!(e))?;
    let execution = pipeline
        .executions
        .load(&id)
        .await?
        .ok_or_else(|| anyhow!("execution not found: {}", id))?;
    print!("{}", describe(&execution));
    Ok(())
}

async fn print_overview(pipeline: &Pipeline) -> Result<()> {
    let counts = pipeline.executions.count_by_state().await?;
    let total: i64 = counts.iter().map(|(_, n)| n).sum();

    println!("Level 0 pipeline status");
    println!("=======================");
    println!();
    println!("  Database:     {}", pipeline.config.db.path.display());
    println!("  Queued:       {}", pipeline.buffer.depth().await?);
    println!("  Dead letters: {}", pipeline.buffer.dead_letter_count().await?);
    println!();
    println!("  Executions:   {}", total);
    for (state, count) in counts {
        println!("    {:<12} {}", state.as_label(), count);
    }
    Ok(())
}

/// Multi-line description of one execution record.
pub fn describe(execution: &Execution) -> String {
    let mut out = String::new();
    let mut line = |label: &str, value: String| {
        out.push_str(&format!("{:<15}{}\n", format!("{}:", label), value));
    };
    line("execution", execution.id.to_string());
    line("object_key", execution.descriptor.object_key.clone());
    line("object_version", execution.descriptor.object_version.clone());
    line("file_type", execution.descriptor.file_type.to_string());
    line("state", execution.state.to_string());
    line("attempt_count", execution.attempt_count().to_string());
    if let Some(err) = &execution.last_error {
        line("last_error", format!("{}: {}", err.kind, err.message));
    }
    if let Some(due) = execution.retry_at {
        line("retry_at", due.to_rfc3339());
    }
    if let Some(summary) = &execution.summary {
        line("rows", summary.row_count.to_string());
    }
    if execution.is_partial_success() {
        line("outcome", "partial success (imported, not notified)".to_string());
    }
    line("updated_at", execution.updated_at.to_rfc3339());
    out
}

/// List executions, newest first, optionally restricted to one state.
pub async fn run_executions(pipeline: &Pipeline, state: Option<&str>, limit: usize) -> Result<()> {
    let state = match state {
        Some(raw) => Some(raw.parse::<ExecutionState>().map_err(|e| anyhow!(e))?),
        None => None,
    };
    let executions = pipeline.executions.list(state, limit).await?;
    if executions.is_empty() {
        println!("No executions.");
        return Ok(());
    }
    println!(
        "{:<36}  {:<10}  {:>3}  {:<20}  OBJECT",
        "EXECUTION", "STATE", "TRY", "LAST ERROR"
    );
    for e in &executions {
        let error = e
            .last_error
            .as_ref()
            .map(|err| err.kind.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<36}  {:<10}  {:>3}  {:<20}  {}",
            e.id,
            e.state.as_label(),
            e.attempt_count(),
            error,
            e.descriptor.object_key
        );
    }
    Ok(())
}

/// Cancel one execution by id.
pub async fn run_cancel(pipeline: &Pipeline, id: &str, reason: &str) -> Result<()> {
    let id = ExecutionId::parse(id).map_err(|e| anyhow!(e))?;
    match pipeline.orchestrator.cancel(&id, reason).await? {
        CancelOutcome::Cancelled(execution) => {
            println!("Cancelled {}.", execution.id);
            Ok(())
        }
        CancelOutcome::AlreadyTerminal(execution) => {
            println!("{} already finished ({}).", execution.id, execution.state);
            Ok(())
        }
        CancelOutcome::NotFound => bail!("execution not found: {}", id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use level0_core::error::ErrorKind;
    use level0_core::machine::StepFailure;
    use level0_core::models::{FileCategory, FileDescriptor, FileType, ImportSummary};

    #[test]
    fn test_describe_marks_partial_success() {
        let descriptor = FileDescriptor::new("L0/2024-01-01/0ce86a42.ac1", "v1", Utc::now());
        let mut execution = Execution::new(descriptor, Utc::now());
        execution.state = ExecutionState::Failed;
        execution.notify_attempts = 4;
        execution.last_error = Some(StepFailure::new(
            ErrorKind::NotificationFailed,
            "webhook returned 503",
        ));
        execution.summary = Some(ImportSummary {
            object_key: execution.descriptor.object_key.clone(),
            object_version: "v1".to_string(),
            file_type: FileType::Ac1,
            category: FileCategory::Spectrum,
            row_count: 128,
            instrument: "AC1".to_string(),
            range: None,
            newly_committed: true,
        });

        let text = describe(&execution);
        assert!(text.contains("state:         failed"));
        assert!(text.contains("attempt_count: 4"));
        assert!(text.contains("NotificationFailed: webhook returned 503"));
        assert!(text.contains("rows:          128"));
        assert!(text.contains("partial success"));
    }

    #[test]
    fn test_describe_pending_has_no_error_line() {
        let descriptor = FileDescriptor::new("L0/2024-01-01/0ce86a42.fba", "v1", Utc::now());
        let text = describe(&Execution::new(descriptor, Utc::now()));
        assert!(text.contains("state:         pending"));
        assert!(!text.contains("last_error"));
        assert!(!text.contains("partial success"));
    }
}
