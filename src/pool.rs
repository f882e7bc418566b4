//! Worker pool.
//!
//! Each worker is an [`Executor`] on its own blocking thread: claim a batch,
//! run every task in it, repeat until a claim comes back empty. Workers
//! share nothing but the store. A per-task failure is logged and leaves the
//! task Claimed; only store-level failures stop a worker.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::model::{LeasedTask, WorkerId};
use crate::observer::{Observer, ProgressSource};
use crate::runner::TaskRunner;
use crate::storage::Store;
use crate::telemetry::metrics;
use crate::telemetry::task::{record_outcome, start_task_span};
use crate::workdir::ScratchDir;

/// Configuration for a pool run.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub workers: usize,
    /// Upper bound on tasks leased per claim.
    pub batch_size: usize,
    /// Parent of the per-worker scratch directories.
    pub scratch_dir: PathBuf,
    pub progress_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism().map_or(1, |n| n.get()),
            batch_size: 64,
            scratch_dir: PathBuf::from("/tmp/batchq"),
            progress_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerReport {
    pub worker: WorkerId,
    pub completed: usize,
    /// Tasks left Claimed by this worker.
    pub failed: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolReport {
    pub completed: usize,
    pub failed: usize,
    pub workers: Vec<WorkerReport>,
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// One worker: a runner, a scratch directory and a claimant id.
pub struct Executor<T, R> {
    store: Arc<Store<T>>,
    runner: R,
    worker: WorkerId,
    scratch: ScratchDir,
    batch_size: usize,
}

impl<T, R: TaskRunner<T>> Executor<T, R> {
    pub fn new(store: Arc<Store<T>>, runner: R, worker: WorkerId, config: &PoolConfig) -> Self {
        Self {
            store,
            runner,
            worker,
            scratch: ScratchDir::for_worker(&config.scratch_dir, worker),
            batch_size: config.batch_size.max(1),
        }
    }

    /// Drain the store. Blocks until a claim returns nothing.
    pub fn run(mut self) -> Result<WorkerReport> {
        let mut report = WorkerReport {
            worker: self.worker,
            completed: 0,
            failed: 0,
        };
        info!(worker_id = %self.worker, "worker started");

        loop {
            let batch = self.store.claim_batch(self.worker, self.batch_size)?;
            if batch.is_empty() {
                break;
            }
            for task in &batch {
                match self.execute(task) {
                    Ok(()) => report.completed += 1,
                    Err(e) => {
                        report.failed += 1;
                        warn!(
                            worker_id = %self.worker,
                            task_id = %task.id,
                            "task left claimed: {e}"
                        );
                    }
                }
            }
        }

        info!(
            worker_id = %self.worker,
            completed = report.completed,
            failed = report.failed,
            "worker drained"
        );
        Ok(report)
    }

    fn execute(&mut self, task: &LeasedTask<T>) -> Result<()> {
        let span = start_task_span(self.worker, task.id);
        let _enter = span.enter();

        let started = Instant::now();
        let outcome = match self.scratch.materialize(&task.files) {
            Ok(files) => self.runner.run(&task.payload, files.dir()),
            Err(e) => {
                metrics::runner_failures().add(1, &[KeyValue::new("stage", "materialize")]);
                record_outcome(&span, "materialize_failed");
                return Err(e);
            }
        };
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        let output = match outcome {
            Ok(output) => {
                metrics::task_duration_ms().record(elapsed_ms, &[KeyValue::new("outcome", "ok")]);
                output
            }
            Err(failure) => {
                metrics::task_duration_ms()
                    .record(elapsed_ms, &[KeyValue::new("outcome", "error")]);
                metrics::runner_failures().add(1, &[KeyValue::new("stage", "run")]);
                record_outcome(&span, "runner_failed");
                return Err(failure.into());
            }
        };

        if let Err(e) = self.store.complete(task.id, &output) {
            metrics::runner_failures().add(1, &[KeyValue::new("stage", "complete")]);
            record_outcome(&span, "complete_failed");
            return Err(e);
        }
        record_outcome(&span, "done");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// Run `config.workers` executors against `store` until every one of them
/// has seen an empty claim, with a progress observer alongside.
///
/// `runner_factory` is called once per worker with that worker's id. The
/// observer is told to stop when the pool drains but is not waited for.
pub async fn run_pool<T, R, F>(
    store: Arc<Store<T>>,
    mut runner_factory: F,
    config: PoolConfig,
) -> Result<PoolReport>
where
    T: Send + 'static,
    R: TaskRunner<T> + 'static,
    F: FnMut(WorkerId) -> R,
{
    if config.workers == 0 {
        return Err(Error::Config("pool needs at least one worker".to_string()));
    }
    if config.progress_interval.is_zero() {
        return Err(Error::Config("progress interval must be non-zero".to_string()));
    }
    if config.workers > WorkerId::MAX_SLOTS {
        return Err(Error::Config(format!(
            "pool supports at most {} workers, got {}",
            WorkerId::MAX_SLOTS,
            config.workers
        )));
    }

    let source: Arc<dyn ProgressSource> = store.clone();
    let observer = Observer::new(source, config.progress_interval).spawn();

    info!(
        workers = config.workers,
        batch_size = config.batch_size,
        scratch_dir = %config.scratch_dir.display(),
        "pool starting"
    );

    let handles: Vec<_> = (0..config.workers)
        .map(|slot| {
            let worker = WorkerId::for_slot(slot);
            let executor = Executor::new(Arc::clone(&store), runner_factory(worker), worker, &config);
            tokio::task::spawn_blocking(move || executor.run())
        })
        .collect();

    let mut report = PoolReport::default();
    let mut first_error = None;
    for handle in handles {
        match handle.await {
            Ok(Ok(worker)) => {
                report.completed += worker.completed;
                report.failed += worker.failed;
                report.workers.push(worker);
            }
            Ok(Err(e)) => {
                error!("worker stopped: {e}");
                first_error.get_or_insert(e);
            }
            Err(e) => {
                error!("worker panicked: {e}");
                first_error.get_or_insert(Error::Other(format!("worker panicked: {e}")));
            }
        }
    }

    observer.stop();

    if let Some(e) = first_error {
        return Err(e);
    }
    info!(
        completed = report.completed,
        failed = report.failed,
        "pool drained"
    );
    Ok(report)
}
