//! Bounded fan-out of per-item work within one stage.
//!
//! Each job runs in its own tokio task, gated by a semaphore sized by
//! `max_workers`. A shared halt flag (watch channel) stops new dispatches
//! once a failure is seen and `continue_on_failure` is off; jobs already
//! running always finish.

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tracing::{warn, Instrument};

use crate::error::{DeployError, DeployResult};

/// Concurrency settings for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawParallelConfig")]
pub struct ParallelConfig {
    max_workers: usize,
    continue_on_failure: bool,
}

#[derive(Deserialize)]
struct RawParallelConfig {
    #[serde(default = "default_max_workers")]
    max_workers: usize,
    #[serde(default = "default_continue_on_failure")]
    continue_on_failure: bool,
}

fn default_max_workers() -> usize {
    4
}

fn default_continue_on_failure() -> bool {
    true
}

impl TryFrom<RawParallelConfig> for ParallelConfig {
    type Error = DeployError;

    fn try_from(raw: RawParallelConfig) -> Result<Self, Self::Error> {
        ParallelConfig::new(raw.max_workers, raw.continue_on_failure)
    }
}

impl Default for ParallelConfig {
    fn default() -> Self {
        ParallelConfig {
            max_workers: default_max_workers(),
            continue_on_failure: default_continue_on_failure(),
        }
    }
}

impl ParallelConfig {
    /// `max_workers` must be at least 1.
    pub fn new(max_workers: usize, continue_on_failure: bool) -> DeployResult<Self> {
        if max_workers == 0 {
            return Err(DeployError::Config(
                "parallel.max_workers must be at least 1".to_string(),
            ));
        }
        Ok(ParallelConfig {
            max_workers,
            continue_on_failure,
        })
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn continue_on_failure(&self) -> bool {
        self.continue_on_failure
    }
}

/// Shared stop signal for one run.
#[derive(Debug, Clone)]
pub struct HaltFlag {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for HaltFlag {
    fn default() -> Self {
        let (sender, _receiver) = watch::channel(false);
        HaltFlag {
            sender: Arc::new(sender),
        }
    }
}

impl HaltFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_raised(&self) -> bool {
        *self.sender.borrow()
    }
}

/// Raises the halt flag if dropped while still armed, i.e. when a job
/// panics or is cancelled before reporting back.
struct HaltOnUnwind(Option<HaltFlag>);

impl HaltOnUnwind {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for HaltOnUnwind {
    fn drop(&mut self) {
        if let Some(halt) = self.0.take() {
            halt.raise();
        }
    }
}

/// What happened to one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Succeeded,
    Failed,
    /// Never started because the halt flag was up.
    Skipped,
    /// The task panicked or was cancelled.
    Crashed,
}

/// Run `job` over `inputs` with at most `max_workers` in flight.
///
/// Returns one status per input, in input order. A failed or panicking job
/// raises `halt` unless `continue_on_failure` is set; queued jobs then come
/// back `Skipped`.
pub async fn run_bounded<T, F, Fut>(
    inputs: Vec<T>,
    config: ParallelConfig,
    halt: &HaltFlag,
    job: F,
) -> Vec<JobStatus>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    let job = Arc::new(job);
    let sem = Arc::new(Semaphore::new(config.max_workers));

    let mut tasks = Vec::with_capacity(inputs.len());
    for input in inputs {
        let job = Arc::clone(&job);
        let sem = Arc::clone(&sem);
        let halt = halt.clone();

        tasks.push(tokio::spawn(async move {
            let _permit = sem.acquire_owned().await.ok();

            // Checked after the permit so queued work sees a sibling's failure.
            if halt.is_raised() {
                return JobStatus::Skipped;
            }

            // Declared after the permit so it drops, and halts, before the permit is released.
            let guard = HaltOnUnwind((!config.continue_on_failure).then(|| halt.clone()));
            let succeeded = job(input).await;
            guard.disarm();

            if succeeded {
                JobStatus::Succeeded
            } else {
                if !config.continue_on_failure {
                    halt.raise();
                }
                JobStatus::Failed
            }
        }
        .instrument(tracing::Span::current())));
    }

    let mut statuses = Vec::with_capacity(tasks.len());
    for task in tasks {
        match task.await {
            Ok(status) => statuses.push(status),
            Err(err) => {
                warn!(error = %err, "worker task did not complete");
                statuses.push(JobStatus::Crashed);
            }
        }
    }
    statuses
}
