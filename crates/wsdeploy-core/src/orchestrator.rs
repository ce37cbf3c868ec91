//! Drives one publish or unpublish pass over a set of items.
//!
//! A run resolves a [`PublishPlan`](crate::graph::PublishPlan) first; a cycle, a duplicate item or a
//! type without a publisher aborts before any remote call. Stages then run
//! strictly in order. Inside a stage, per-item publishers fan out wave by
//! wave through [`run_bounded`]; bulk publishers get one `publish_all` call.
//! Every dispatched item ends with exactly one outcome in the log.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use chrono::Utc;
use tracing::{debug, instrument, warn, Instrument};
use uuid::Uuid;

use crate::error::{DeployError, DeployResult, ItemFailure, PublishError};
use crate::graph::{DependencyResolver, Stage};
use crate::item::{Item, ItemType};
use crate::obs::{run_span, RunReporter};
use crate::outcome::{ItemAttempt, Operation, OutcomeLog, PublishOutcome, RunReport, RunState};
use crate::parallel::{run_bounded, HaltFlag, JobStatus, ParallelConfig};
use crate::publisher::{PublishMode, Publisher};
use crate::reconcile::{find_orphans, OrphanFilter};
use crate::registry::PublisherRegistry;

type ItemIndex = HashMap<(ItemType, String), Arc<Item>>;

/// Mutable bookkeeping for one run.
struct RunContext {
    run_id: String,
    operation: Operation,
    log: Arc<OutcomeLog>,
    halt: HaltFlag,
    dispatched: usize,
}

impl RunContext {
    fn new(run_id: &Uuid, operation: Operation) -> Self {
        RunContext {
            run_id: run_id.to_string(),
            operation,
            log: Arc::new(OutcomeLog::new()),
            halt: HaltFlag::new(),
            dispatched: 0,
        }
    }
}

pub struct PublishOrchestrator {
    registry: Arc<PublisherRegistry>,
    resolver: DependencyResolver,
    config: ParallelConfig,
    reporter: Arc<dyn RunReporter>,
    state: Mutex<RunState>,
}

impl PublishOrchestrator {
    pub fn new(
        registry: Arc<PublisherRegistry>,
        resolver: DependencyResolver,
        config: ParallelConfig,
        reporter: Arc<dyn RunReporter>,
    ) -> Self {
        PublishOrchestrator {
            registry,
            resolver,
            config,
            reporter,
            state: Mutex::new(RunState::Idle),
        }
    }

    pub fn config(&self) -> ParallelConfig {
        self.config
    }

    pub fn registry(&self) -> &PublisherRegistry {
        &self.registry
    }

    /// State of the most recent run.
    pub fn state(&self) -> RunState {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Publish `items` in dependency order.
    ///
    /// Planning failures are returned as errors with no report. Item
    /// failures never are: they land in the report's outcomes.
    #[instrument(skip(self, items), fields(items = items.len()))]
    pub async fn publish(&self, items: Vec<Item>) -> DeployResult<RunReport> {
        self.run(items, Operation::Publish).await
    }

    /// Delete `items` in reverse dependency order.
    #[instrument(skip(self, items), fields(items = items.len()))]
    pub async fn unpublish(&self, items: Vec<Item>) -> DeployResult<RunReport> {
        self.run(items, Operation::Unpublish).await
    }

    /// Delete every deployed item that the repository no longer has.
    pub async fn unpublish_orphans(
        &self,
        repository: &[Item],
        deployed: Vec<Item>,
        filter: &OrphanFilter,
    ) -> DeployResult<RunReport> {
        let orphans: Vec<Item> = find_orphans(repository, deployed, filter)
            .into_iter()
            .filter(|item| {
                let known = self.registry.contains(item.item_type());
                if !known {
                    debug!(item_type = %item.item_type(), item_name = item.name(), "No publisher, leaving deployed item alone");
                }
                known
            })
            .collect();
        debug!(orphans = orphans.len(), "Computed orphaned items");
        self.unpublish(orphans).await
    }

    async fn run(&self, items: Vec<Item>, operation: Operation) -> DeployResult<RunReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = run_span(&run_id.to_string(), operation);
        self.run_in_span(run_id, started_at, items, operation)
            .instrument(span)
            .await
    }

    async fn run_in_span(
        &self,
        run_id: Uuid,
        started_at: chrono::DateTime<Utc>,
        items: Vec<Item>,
        operation: Operation,
    ) -> DeployResult<RunReport> {
        let mut ctx = RunContext::new(&run_id, operation);
        self.transition(&ctx.run_id, RunState::Resolving);

        let plan = match self.resolver.plan(&items, &self.registry) {
            Ok(plan) if operation == Operation::Unpublish => plan.reversed(),
            Ok(plan) => plan,
            Err(err) => {
                self.transition(
                    &ctx.run_id,
                    RunState::Aborted {
                        reason: err.to_string(),
                    },
                );
                return Err(err);
            }
        };
        self.reporter
            .run_started(&ctx.run_id, operation, plan.item_count());

        let index: ItemIndex = items
            .into_iter()
            .map(|item| ((item.item_type().clone(), item.name().to_string()), Arc::new(item)))
            .collect();

        for (position, stage) in plan.stages.iter().enumerate() {
            if ctx.halt.is_raised() {
                break;
            }
            self.transition(
                &ctx.run_id,
                RunState::Publishing {
                    stage: position,
                    item_type: stage.item_type.clone(),
                },
            );
            let publisher = self.registry.get(&stage.item_type).ok_or_else(|| DeployError::NoPublisher {
                item_type: stage.item_type.to_string(),
            })?;

            if operation == Operation::Publish && publisher.mode() == PublishMode::Bulk {
                self.run_bulk_stage(&mut ctx, stage, &publisher, &index).await;
            } else {
                for wave in &stage.waves {
                    if ctx.halt.is_raised() {
                        break;
                    }
                    self.run_wave(&mut ctx, wave, &publisher, &index).await;
                }
            }
        }

        let not_attempted = plan.item_count() - ctx.dispatched;
        let state = if not_attempted > 0 {
            RunState::Aborted {
                reason: format!("{not_attempted} item(s) not attempted after a failure"),
            }
        } else {
            RunState::Completed
        };
        self.transition(&ctx.run_id, state.clone());

        let report = RunReport::from_log(run_id, operation, state, started_at, &ctx.log);
        self.reporter.run_finished(&report);
        Ok(report)
    }

    /// Fan one wave out over the worker pool.
    async fn run_wave(
        &self,
        ctx: &mut RunContext,
        wave: &[String],
        publisher: &Arc<dyn Publisher>,
        index: &ItemIndex,
    ) {
        let item_type = publisher.item_type();
        let items: Vec<Arc<Item>> = wave
            .iter()
            .filter_map(|name| index.get(&(item_type.clone(), name.clone())).cloned())
            .collect();

        let job = {
            let publisher = Arc::clone(publisher);
            let log = Arc::clone(&ctx.log);
            let reporter = Arc::clone(&self.reporter);
            let run_id = ctx.run_id.clone();
            let operation = ctx.operation;
            move |item: Arc<Item>| {
                let publisher = Arc::clone(&publisher);
                let log = Arc::clone(&log);
                let reporter = Arc::clone(&reporter);
                let run_id = run_id.clone();
                async move {
                    let outcome = attempt(publisher.as_ref(), &item, operation).await;
                    let success = outcome.success;
                    reporter.item_finished(&run_id, &outcome);
                    log.record(outcome);
                    success
                }
            }
        };

        let statuses = run_bounded(items.clone(), self.config, &ctx.halt, job).await;

        for (item, status) in items.iter().zip(statuses) {
            match status {
                JobStatus::Skipped => {}
                JobStatus::Succeeded | JobStatus::Failed => ctx.dispatched += 1,
                JobStatus::Crashed => {
                    ctx.dispatched += 1;
                    let visible = !publisher.hidden_from_log();
                    let outcome = ItemAttempt::start(item, ctx.operation, visible).failed(&PublishError::new(
                        item.item_type().clone(),
                        item.name(),
                        ctx.operation,
                        ItemFailure::Other(anyhow!("publisher task panicked")),
                    ));
                    self.reporter.item_finished(&ctx.run_id, &outcome);
                    ctx.log.record(outcome);
                }
            }
        }
    }

    /// One `publish_all` call for the whole stage, in its own task.
    async fn run_bulk_stage(
        &self,
        ctx: &mut RunContext,
        stage: &Stage,
        publisher: &Arc<dyn Publisher>,
        index: &ItemIndex,
    ) {
        let items: Vec<Arc<Item>> = stage
            .item_names()
            .filter_map(|name| index.get(&(stage.item_type.clone(), name.to_string())).cloned())
            .collect();
        let visible = !publisher.hidden_from_log();
        let attempts: Vec<ItemAttempt> = items
            .iter()
            .map(|item| ItemAttempt::start(item, Operation::Publish, visible))
            .collect();

        let task = {
            let publisher = Arc::clone(publisher);
            let items = items.clone();
            tokio::spawn(
                async move {
                    let refs: Vec<&Item> = items.iter().map(|item| item.as_ref()).collect();
                    publisher.publish_all(&refs).await
                }
                .instrument(tracing::Span::current()),
            )
        };
        let (mut results, missing): (HashMap<String, _>, &str) = match task.await {
            Ok(results) => (results.into_iter().collect(), "no result returned for item"),
            Err(err) => {
                warn!(item_type = %stage.item_type, error = %err, "bulk publisher task did not complete");
                (HashMap::new(), "publisher task panicked")
            }
        };
        ctx.dispatched += items.len();

        let mut failed = false;
        for (item, attempt) in items.iter().zip(attempts) {
            let result = results
                .remove(item.name())
                .unwrap_or_else(|| Err(ItemFailure::Other(anyhow!(missing))));
            let outcome = finish(attempt, item, Operation::Publish, result);
            failed |= !outcome.success;
            self.reporter.item_finished(&ctx.run_id, &outcome);
            ctx.log.record(outcome);
        }

        if failed && !self.config.continue_on_failure() {
            ctx.halt.raise();
        }
    }

    fn transition(&self, run_id: &str, next: RunState) {
        if let RunState::Aborted { reason } = &next {
            warn!(reason = %reason, "Run aborted");
        }
        self.reporter.state_changed(run_id, &next);
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = next;
    }
}

/// Run one item through its publisher and turn the result into an outcome.
async fn attempt(publisher: &dyn Publisher, item: &Item, operation: Operation) -> PublishOutcome {
    let attempt = ItemAttempt::start(item, operation, !publisher.hidden_from_log());
    let result = match operation {
        Operation::Publish => publisher.publish_one(item).await,
        Operation::Unpublish => publisher.unpublish_one(item).await.map(|()| None),
    };
    finish(attempt, item, operation, result)
}

fn finish(
    attempt: ItemAttempt,
    item: &Item,
    operation: Operation,
    result: Result<Option<String>, ItemFailure>,
) -> PublishOutcome {
    match result {
        Ok(guid) => {
            let guid = guid.or_else(|| Some(item.guid().to_string()).filter(|guid| !guid.is_empty()));
            attempt.succeeded(guid)
        }
        Err(cause) => attempt.failed(&PublishError::new(
            item.item_type().clone(),
            item.name(),
            operation,
            cause,
        )),
    }
}
