//! Bounded fan-out of per-item pipelines over one batch.

use crate::metrics;
use crate::models::{AcquisitionOutcome, BatchSummary, ImageReference};
use crate::pipeline::{Pipeline, PipelineError};
use crate::report::OutcomeReporter;
use std::{
    collections::{HashMap, VecDeque},
    num::NonZeroUsize,
    sync::Arc,
    time::Instant,
};
use tokio::{sync::Semaphore, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Runs a batch with at most `concurrency` items in flight. Each worker
/// owns one item from fetch to store; outcomes come back in completion
/// order, one per input reference.
#[derive(Clone)]
pub struct BatchScheduler {
    pipeline: Pipeline,
    concurrency: NonZeroUsize,
}

impl BatchScheduler {
    pub fn new(pipeline: Pipeline, concurrency: NonZeroUsize) -> Self {
        Self {
            pipeline,
            concurrency,
        }
    }

    /// Same scheduler, with every outcome going to `reporter` instead.
    pub fn with_reporter(&self, reporter: Arc<dyn OutcomeReporter>) -> Self {
        Self {
            pipeline: self.pipeline.clone().with_reporter(reporter),
            concurrency: self.concurrency,
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency.get()
    }

    pub async fn run(
        &self,
        references: Vec<ImageReference>,
    ) -> Result<Vec<AcquisitionOutcome>, PipelineError> {
        self.run_with_cancel(references, CancellationToken::new())
            .await
    }

    /// Like [`BatchScheduler::run`], but `cancel` aborts the batch: running
    /// items abandon their current attempt and unstarted items are recorded
    /// as cancelled without being attempted.
    pub async fn run_with_cancel(
        &self,
        references: Vec<ImageReference>,
        cancel: CancellationToken,
    ) -> Result<Vec<AcquisitionOutcome>, PipelineError> {
        Pipeline::validate_batch(&references)?;

        let started = Instant::now();
        let total = references.len();
        let semaphore = Arc::new(Semaphore::new(self.concurrency.get()));
        let mut queue: VecDeque<ImageReference> = references.into();
        let mut in_flight: HashMap<String, ImageReference> = HashMap::new();
        let mut workers: JoinSet<AcquisitionOutcome> = JoinSet::new();
        let mut outcomes = Vec::with_capacity(total);

        info!(
            target = "valuer.batch",
            total,
            concurrency = self.concurrency.get(),
            "batch_started"
        );

        while !queue.is_empty() || !workers.is_empty() {
            if cancel.is_cancelled() && !queue.is_empty() {
                info!(
                    target = "valuer.batch",
                    skipped = queue.len(),
                    "batch_cancelled"
                );
                for reference in queue.drain(..) {
                    outcomes.push(self.pipeline.abandoned_outcome(&reference));
                }
            }

            while !queue.is_empty() {
                let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                    break;
                };
                let Some(reference) = queue.pop_front() else {
                    break;
                };
                in_flight.insert(reference.logical_id.clone(), reference.clone());
                let pipeline = self.pipeline.clone();
                let token = cancel.clone();
                workers.spawn(async move {
                    let _permit = permit;
                    pipeline.process(&reference, &token).await
                });
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled(), if !queue.is_empty() => {}
                joined = workers.join_next() => match joined {
                    Some(Ok(outcome)) => {
                        in_flight.remove(&outcome.logical_id);
                        outcomes.push(outcome);
                    }
                    Some(Err(err)) => {
                        error!(target = "valuer.batch", error = %err, "worker_aborted");
                    }
                    None => {}
                },
            }
        }

        // Workers that panicked never produced an outcome.
        for reference in in_flight.into_values() {
            outcomes.push(self.pipeline.abandoned_outcome(&reference));
        }

        let summary = BatchSummary::from_outcomes(&outcomes, started.elapsed());
        metrics::batch_elapsed(summary.total, started.elapsed().as_millis());
        info!(
            target = "valuer.batch",
            total = summary.total,
            stored = summary.stored,
            placeholder = summary.placeholder,
            failed = summary.failed,
            elapsed_ms = summary.elapsed_ms,
            "batch_finished"
        );
        Ok(outcomes)
    }
}
