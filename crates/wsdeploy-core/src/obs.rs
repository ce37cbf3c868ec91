//! Structured observability hooks for publish runs.
//!
//! The orchestrator reports lifecycle events through a [`RunReporter`]
//! handed to it at construction. [`TracingReporter`] turns them into
//! `info!`/`warn!` events with an `event = "..."` field; tests substitute
//! their own reporter to observe transitions.

use tracing::{info, warn};

use crate::outcome::{Operation, PublishOutcome, RunReport, RunState};

/// Span tagging everything logged during one run with its id.
///
/// Attach with `Instrument::instrument`; an entered guard must not be held
/// across `.await` in a spawned task.
pub fn run_span(run_id: &str, operation: Operation) -> tracing::Span {
    tracing::info_span!("wsdeploy.run", run_id = %run_id, operation = %operation)
}

/// Receives orchestrator lifecycle events. Every method defaults to a no-op.
pub trait RunReporter: Send + Sync {
    fn run_started(&self, _run_id: &str, _operation: Operation, _items: usize) {}

    fn state_changed(&self, _run_id: &str, _state: &RunState) {}

    fn item_finished(&self, _run_id: &str, _outcome: &PublishOutcome) {}

    fn run_finished(&self, _report: &RunReport) {}
}

/// Reporter that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl RunReporter for NoopReporter {}

/// Reporter that forwards to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl RunReporter for TracingReporter {
    fn run_started(&self, run_id: &str, operation: Operation, items: usize) {
        emit_run_started(run_id, operation, items);
    }

    fn state_changed(&self, run_id: &str, state: &RunState) {
        match state {
            RunState::Aborted { reason } => emit_run_aborted(run_id, reason),
            other => emit_state_changed(run_id, other),
        }
    }

    fn item_finished(&self, run_id: &str, outcome: &PublishOutcome) {
        emit_item_finished(run_id, outcome);
    }

    fn run_finished(&self, report: &RunReport) {
        emit_run_finished(report);
    }
}

/// Emit event: run started with the number of items in scope.
pub fn emit_run_started(run_id: &str, operation: Operation, items: usize) {
    info!(event = "run.started", run_id = %run_id, operation = %operation, items = items);
}

pub fn emit_state_changed(run_id: &str, state: &RunState) {
    match state {
        RunState::Publishing { stage, item_type } => info!(
            event = "run.stage_started",
            run_id = %run_id,
            stage = stage,
            item_type = %item_type,
        ),
        other => info!(event = "run.state_changed", run_id = %run_id, state = ?other),
    }
}

/// Emit event: one item reached a terminal outcome.
pub fn emit_item_finished(run_id: &str, outcome: &PublishOutcome) {
    let duration_ms = outcome.duration().num_milliseconds();
    if outcome.success {
        info!(
            event = "item.finished",
            run_id = %run_id,
            item_type = %outcome.item_type,
            item_name = %outcome.name,
            operation = %outcome.operation,
            duration_ms = duration_ms,
            success = true,
        );
    } else {
        warn!(
            event = "item.failed",
            run_id = %run_id,
            item_type = %outcome.item_type,
            item_name = %outcome.name,
            operation = %outcome.operation,
            duration_ms = duration_ms,
            retryable = outcome.retryable,
            error = outcome.error.as_deref().unwrap_or(""),
        );
    }
}

/// Emit event: run finished with counts and the overall verdict.
pub fn emit_run_finished(report: &RunReport) {
    let summary = report.summary();
    info!(
        event = "run.finished",
        run_id = %report.run_id,
        operation = %report.operation,
        duration_ms = (report.finished_at - report.started_at).num_milliseconds(),
        attempted = summary.attempted,
        failed = summary.failed,
        success = report.run_succeeded,
    );
}

/// Emit event: the run stopped early (warning level).
pub fn emit_run_aborted(run_id: &str, reason: &str) {
    warn!(event = "run.aborted", run_id = %run_id, reason = %reason);
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;
    use crate::item::{Item, ItemType};
    use crate::outcome::ItemAttempt;

    #[test]
    fn run_span_can_be_entered() {
        let _guard = run_span("run-1", Operation::Publish).entered();
    }

    #[traced_test]
    #[test]
    fn tracing_reporter_emits_lifecycle_events() {
        let reporter = TracingReporter;
        let item = Item::new(ItemType::NOTEBOOK, "etl", "", "/repo");
        reporter.run_started("run-7", Operation::Publish, 1);
        reporter.state_changed(
            "run-7",
            &RunState::Publishing {
                stage: 0,
                item_type: ItemType::NOTEBOOK,
            },
        );
        reporter.item_finished(
            "run-7",
            &ItemAttempt::start(&item, Operation::Publish, true).succeeded(None),
        );
        reporter.state_changed(
            "run-7",
            &RunState::Aborted {
                reason: "cycle".into(),
            },
        );

        assert!(logs_contain("run.started"));
        assert!(logs_contain("run.stage_started"));
        assert!(logs_contain("item.finished"));
        assert!(logs_contain("run.aborted"));
    }
}
