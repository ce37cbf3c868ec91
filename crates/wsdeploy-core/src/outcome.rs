//! Outcome log: one structured record per attempted item.

use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PublishError;
use crate::item::{Item, ItemType};

/// Which pass an outcome belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Publish,
    Unpublish,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Publish => f.write_str("publish"),
            Operation::Unpublish => f.write_str("unpublish"),
        }
    }
}

/// Result of one attempt on one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishOutcome {
    pub name: String,
    pub item_type: ItemType,
    pub operation: Operation,
    pub success: bool,
    pub error: Option<String>,
    /// Set when the failure was transient in nature
    #[serde(default)]
    pub retryable: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub guid: Option<String>,
    /// Hidden outcomes still count toward run success
    #[serde(skip)]
    pub visible: bool,
}

impl PublishOutcome {
    /// Never negative.
    pub fn duration(&self) -> chrono::Duration {
        (self.finished_at - self.started_at).max(chrono::Duration::zero())
    }
}

/// An attempt in progress; turns into a [`PublishOutcome`] when finished.
#[derive(Debug)]
pub struct ItemAttempt {
    name: String,
    item_type: ItemType,
    operation: Operation,
    visible: bool,
    started_at: DateTime<Utc>,
}

impl ItemAttempt {
    pub fn start(item: &Item, operation: Operation, visible: bool) -> Self {
        ItemAttempt {
            name: item.name().to_string(),
            item_type: item.item_type().clone(),
            operation,
            visible,
            started_at: Utc::now(),
        }
    }

    pub fn succeeded(self, guid: Option<String>) -> PublishOutcome {
        self.finish(true, None, false, guid)
    }

    pub fn failed(self, error: &PublishError) -> PublishOutcome {
        self.finish(false, Some(error.to_string()), error.retryable, None)
    }

    fn finish(self, success: bool, error: Option<String>, retryable: bool, guid: Option<String>) -> PublishOutcome {
        let finished_at = Utc::now().max(self.started_at);
        PublishOutcome {
            name: self.name,
            item_type: self.item_type,
            operation: self.operation,
            success,
            error,
            retryable,
            started_at: self.started_at,
            finished_at,
            guid,
            visible: self.visible,
        }
    }
}

/// Ordered, append-only collection of outcomes, one slot per item.
///
/// Recording the same `(operation, type, name)` twice replaces the earlier
/// record in place.
#[derive(Debug, Default)]
pub struct OutcomeLog {
    entries: Mutex<Vec<PublishOutcome>>,
}

impl OutcomeLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, outcome: PublishOutcome) {
        let mut entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let slot = entries.iter_mut().find(|existing| {
            existing.operation == outcome.operation
                && existing.item_type == outcome.item_type
                && existing.name == outcome.name
        });
        match slot {
            Some(existing) => *existing = outcome,
            None => entries.push(outcome),
        }
    }

    /// Every outcome, hidden ones included
    pub fn all(&self) -> Vec<PublishOutcome> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Outcomes meant for the visible report
    pub fn visible(&self) -> Vec<PublishOutcome> {
        self.all().into_iter().filter(|outcome| outcome.visible).collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// False as soon as any recorded outcome failed, hidden or not
    pub fn run_succeeded(&self) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .all(|outcome| outcome.success)
    }
}

/// Lifecycle of one orchestration run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Resolving,
    Publishing { stage: usize, item_type: ItemType },
    Completed,
    Aborted { reason: String },
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Aborted { .. })
    }
}

/// Counts derived from a [`RunReport`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub hidden: usize,
}

/// Final, serialisable account of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub operation: Operation,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Visible outcomes in recording order
    pub outcomes: Vec<PublishOutcome>,
    pub run_succeeded: bool,
    #[serde(default)]
    pub hidden_outcomes: usize,
    #[serde(default)]
    pub hidden_failures: usize,
}

impl RunReport {
    pub fn from_log(
        run_id: Uuid,
        operation: Operation,
        state: RunState,
        started_at: DateTime<Utc>,
        log: &OutcomeLog,
    ) -> Self {
        let all = log.all();
        let (outcomes, hidden): (Vec<_>, Vec<_>) = all.into_iter().partition(|o| o.visible);
        RunReport {
            run_id,
            operation,
            state,
            started_at,
            finished_at: Utc::now().max(started_at),
            run_succeeded: log.run_succeeded(),
            hidden_outcomes: hidden.len(),
            hidden_failures: hidden.iter().filter(|o| !o.success).count(),
            outcomes,
        }
    }

    /// Report for a pass that had nothing to do.
    pub fn empty(operation: Operation) -> Self {
        let now = Utc::now();
        RunReport {
            run_id: Uuid::new_v4(),
            operation,
            state: RunState::Completed,
            started_at: now,
            finished_at: now,
            outcomes: Vec::new(),
            run_succeeded: true,
            hidden_outcomes: 0,
            hidden_failures: 0,
        }
    }

    pub fn summary(&self) -> RunSummary {
        let visible_failed = self.outcomes.iter().filter(|o| !o.success).count();
        let failed = visible_failed + self.hidden_failures;
        let attempted = self.outcomes.len() + self.hidden_outcomes;
        RunSummary {
            attempted,
            succeeded: attempted - failed,
            failed,
            hidden: self.hidden_outcomes,
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &PublishOutcome> {
        self.outcomes.iter().filter(|o| !o.success)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
