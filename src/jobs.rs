use serde::Serialize;
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex as StdMutex},
};
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use valuer_images::{
    models::{AcquisitionOutcome, BatchSummary, FinalStatus, ImageReference},
    report::{OutcomeReporter, TracingReporter},
    scheduler::BatchScheduler,
};

use crate::ApiError;

#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
    statuses: Arc<Mutex<JobTable>>,
    progress: Arc<StdMutex<Progress>>,
}

/// Job states by id. Only the most recent `history` finished jobs are kept;
/// queued and running jobs are never evicted.
struct JobTable {
    states: HashMap<Uuid, JobState>,
    finished: VecDeque<Uuid>,
    history: usize,
}

impl JobTable {
    fn new(history: usize) -> Self {
        Self {
            states: HashMap::new(),
            finished: VecDeque::new(),
            history,
        }
    }

    fn set(&mut self, id: Uuid, state: JobState) {
        self.states.insert(id, state);
    }

    fn finish(&mut self, id: Uuid, state: JobState) {
        self.states.insert(id, state);
        self.finished.push_back(id);
        while self.finished.len() > self.history {
            if let Some(oldest) = self.finished.pop_front() {
                self.states.remove(&oldest);
            }
        }
    }
}

struct Job {
    id: Uuid,
    references: Vec<ImageReference>,
}

#[derive(Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running {
        total: usize,
        processed: usize,
        stored: usize,
        placeholder: usize,
        failed: usize,
    },
    Completed {
        summary: BatchSummary,
    },
    Failed {
        error: String,
        stage: Option<String>,
    },
}

#[derive(Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    #[serde(flatten)]
    pub state: JobState,
}

/// Counts for the batch the worker is running right now.
#[derive(Debug, Default, Clone)]
struct Progress {
    job: Option<Uuid>,
    stored: usize,
    placeholder: usize,
    failed: usize,
}

/// Outcome reporter for queued batches: keeps the running job's counts
/// current for status polling and forwards every outcome to the log.
pub struct JobReporter {
    progress: Arc<StdMutex<Progress>>,
    inner: TracingReporter,
}

impl JobReporter {
    fn new(progress: Arc<StdMutex<Progress>>) -> Self {
        Self {
            progress,
            inner: TracingReporter,
        }
    }
}

impl OutcomeReporter for JobReporter {
    fn report(&self, outcome: &AcquisitionOutcome) {
        if let Ok(mut progress) = self.progress.lock() {
            match outcome.final_status {
                FinalStatus::Stored => progress.stored += 1,
                FinalStatus::Placeholder => progress.placeholder += 1,
                FinalStatus::Failed => progress.failed += 1,
            }
        }
        self.inner.report(outcome);
    }
}

impl JobQueue {
    /// Starts the single background worker. Jobs run one batch at a time;
    /// `shutdown` cancels the batch in progress.
    pub fn spawn(
        scheduler: BatchScheduler,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        Self::spawn_with(
            scheduler,
            shutdown,
            env_usize("QUEUE_CAPACITY", 64),
            env_usize("JOB_HISTORY_LIMIT", 1000),
        )
    }

    pub fn spawn_with(
        scheduler: BatchScheduler,
        shutdown: CancellationToken,
        capacity: usize,
        history: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Job>(capacity.max(1));
        let statuses = Arc::new(Mutex::new(JobTable::new(history.max(1))));
        let statuses_bg = statuses.clone();
        let progress = Arc::new(StdMutex::new(Progress::default()));
        let progress_bg = progress.clone();
        let scheduler = scheduler.with_reporter(Arc::new(JobReporter::new(progress.clone())));

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if let Ok(mut guard) = progress_bg.lock() {
                    *guard = Progress {
                        job: Some(job.id),
                        ..Default::default()
                    };
                }
                {
                    let mut guard = statuses_bg.lock().await;
                    guard.set(
                        job.id,
                        JobState::Running {
                            total: job.references.len(),
                            processed: 0,
                            stored: 0,
                            placeholder: 0,
                            failed: 0,
                        },
                    );
                }

                let started = std::time::Instant::now();
                let result = scheduler
                    .run_with_cancel(job.references, shutdown.child_token())
                    .await;
                let mut guard = statuses_bg.lock().await;
                match result {
                    Ok(outcomes) => {
                        let summary = BatchSummary::from_outcomes(&outcomes, started.elapsed());
                        guard.finish(job.id, JobState::Completed { summary });
                    }
                    Err(err) => {
                        guard.finish(
                            job.id,
                            JobState::Failed {
                                error: err.detail().to_string(),
                                stage: Some(err.stage().to_string()),
                            },
                        );
                    }
                }
                if let Ok(mut guard) = progress_bg.lock() {
                    guard.job = None;
                }
            }
        });

        (
            Self {
                tx,
                statuses,
                progress,
            },
            handle,
        )
    }

    pub async fn enqueue_batch(&self, references: Vec<ImageReference>) -> Result<Uuid, ApiError> {
        let id = Uuid::new_v4();
        {
            let mut guard = self.statuses.lock().await;
            guard.set(id, JobState::Queued);
        }
        let job = Job { id, references };
        if self.tx.send(job).await.is_err() {
            self.statuses.lock().await.states.remove(&id);
            return Err(ApiError {
                error: "queue_send_failed".into(),
                detail: Some("worker not available".into()),
            });
        }
        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Option<JobInfo> {
        let guard = self.statuses.lock().await;
        let state = match guard.states.get(&id).cloned()? {
            JobState::Running { total, .. } => self.live_counts(id, total),
            other => other,
        };
        Some(JobInfo {
            id: id.to_string(),
            state,
        })
    }

    fn live_counts(&self, id: Uuid, total: usize) -> JobState {
        let snapshot = self
            .progress
            .lock()
            .ok()
            .map(|guard| guard.clone())
            .filter(|progress| progress.job == Some(id))
            .unwrap_or_default();
        JobState::Running {
            total,
            processed: snapshot.stored + snapshot.placeholder + snapshot.failed,
            stored: snapshot.stored,
            placeholder: snapshot.placeholder,
            failed: snapshot.failed,
        }
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}
