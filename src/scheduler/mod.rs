mod queue;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::TimeDelta;
use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};
use ulid::Ulid;

use crate::backoff::Backoff;
use crate::clock::SharedClock;
use crate::error::JobError;
use crate::model::{JobPayload, JobStatus, JobType, ScheduledJob, Ts};
use crate::observability::{JOBS_PENDING, JOBS_TOTAL};

use queue::JobQueue;

/// Work behind one job type. `Ok(false)` and `Err` both count as a failed run.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &ScheduledJob) -> Result<bool, JobError>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollReport {
    pub dispatched: usize,
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
    pub purged: usize,
}

/// Single authority over deferred work. Jobs live in memory only. A request's next
/// attempt is persisted as its `scheduled_for`, which the processor poll re-derives from.
pub struct JobScheduler {
    queue: Mutex<JobQueue>,
    handlers: DashMap<JobType, Arc<dyn JobHandler>>,
    clock: SharedClock,
    backoff: Backoff,
    retention: TimeDelta,
    poll_interval: Duration,
    running: AtomicBool,
}

impl JobScheduler {
    pub fn new(clock: SharedClock, backoff: Backoff, retention: TimeDelta, poll_interval: Duration) -> Self {
        Self {
            queue: Mutex::new(JobQueue::default()),
            handlers: DashMap::new(),
            clock,
            backoff,
            retention,
            poll_interval,
            running: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, JobQueue> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn now(&self) -> Ts {
        self.clock.utc()
    }

    pub fn register(&self, job_type: JobType, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(job_type, handler);
    }

    pub fn schedule(&self, job_type: JobType, scheduled_time: Ts, payload: JobPayload) -> Ulid {
        self.enqueue(ScheduledJob::new(job_type, scheduled_time, payload, self.now()))
    }

    /// Queue a job built by the caller, keeping its id.
    pub fn enqueue(&self, job: ScheduledJob) -> Ulid {
        let id = job.job_id;
        debug!(job_id = %id, job_type = %job.job_type, at = %job.scheduled_time, "job scheduled");
        let mut queue = self.lock();
        queue.insert(job);
        metrics::gauge!(JOBS_PENDING).set(queue.pending_count() as f64);
        id
    }

    /// Only a PENDING job can be cancelled.
    pub fn cancel(&self, id: Ulid) -> bool {
        let now = self.now();
        let mut queue = self.lock();
        let Some(job_type) = queue
            .get(&id)
            .filter(|j| j.status == JobStatus::Pending)
            .map(|j| j.job_type)
        else {
            return false;
        };
        queue.finish(&id, JobStatus::Cancelled, now);
        metrics::counter!(JOBS_TOTAL, "job_type" => job_type.as_str(), "status" => "cancelled")
            .increment(1);
        metrics::gauge!(JOBS_PENDING).set(queue.pending_count() as f64);
        debug!(job_id = %id, "job cancelled");
        true
    }

    pub fn status(&self, id: Ulid) -> Option<JobStatus> {
        self.lock().get(&id).map(|j| j.status)
    }

    pub fn job(&self, id: Ulid) -> Option<ScheduledJob> {
        self.lock().get(&id).cloned()
    }

    /// PENDING jobs ordered by due time.
    pub fn pending_jobs(&self) -> Vec<ScheduledJob> {
        self.lock().pending()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// One poll cycle: run every due job, apply outcomes, purge old finished jobs.
    pub async fn poll_once(&self) -> PollReport {
        let now = self.now();
        let due = self.lock().take_due(now);
        let mut report = PollReport {
            dispatched: due.len(),
            ..PollReport::default()
        };

        let ids: Vec<Ulid> = due.iter().map(|j| j.job_id).collect();
        let runs = due.into_iter().map(|job| {
            let handler = self.handlers.get(&job.job_type).map(|h| h.value().clone());
            let span = info_span!("job", job_id = %job.job_id, job_type = %job.job_type);
            let handle = tokio::spawn(
                async move {
                    match handler {
                        Some(handler) => handler.handle(&job).await,
                        None => Err(JobError::UnknownJobType(job.job_type)),
                    }
                }
                .instrument(span),
            );
            async move { handle.await.unwrap_or(Err(JobError::Panicked)) }
        });
        let results = join_all(runs).await;

        let finished_at = self.now();
        for (id, result) in ids.into_iter().zip(results) {
            match self.record_result(id, result, finished_at) {
                JobStatus::Completed => report.completed += 1,
                JobStatus::Pending => report.retried += 1,
                JobStatus::Failed => report.failed += 1,
                JobStatus::Running | JobStatus::Cancelled => {}
            }
        }

        let mut queue = self.lock();
        report.purged = queue.purge_finished(finished_at - self.retention);
        metrics::gauge!(JOBS_PENDING).set(queue.pending_count() as f64);
        drop(queue);

        if report.dispatched > 0 || report.purged > 0 {
            debug!(?report, "scheduler poll");
        }
        report
    }

    fn record_result(&self, id: Ulid, result: Result<bool, JobError>, now: Ts) -> JobStatus {
        let mut queue = self.lock();
        let Some(job) = queue.get_mut(&id) else {
            return JobStatus::Cancelled;
        };
        let job_type = job.job_type;

        let error = match result {
            Ok(true) => {
                job.error_message = None;
                queue.finish(&id, JobStatus::Completed, now);
                metrics::counter!(JOBS_TOTAL, "job_type" => job_type.as_str(), "status" => "completed")
                    .increment(1);
                return JobStatus::Completed;
            }
            Ok(false) => "handler reported failure".to_string(),
            Err(e) => e.to_string(),
        };

        job.retry_count += 1;
        job.error_message = Some(error.clone());
        if job.retry_count < job.max_retries {
            let at = now + self.backoff.delay(job.retry_count);
            let attempt = job.retry_count;
            queue.requeue(&id, at);
            warn!(job_id = %id, job_type = %job_type, attempt, retry_at = %at, error = %error, "job failed, will retry");
            metrics::counter!(JOBS_TOTAL, "job_type" => job_type.as_str(), "status" => "retried")
                .increment(1);
            JobStatus::Pending
        } else {
            let attempts = job.retry_count;
            queue.finish(&id, JobStatus::Failed, now);
            error!(job_id = %id, job_type = %job_type, attempts, error = %error, "job failed permanently");
            metrics::counter!(JOBS_TOTAL, "job_type" => job_type.as_str(), "status" => "failed")
                .increment(1);
            JobStatus::Failed
        }
    }

    /// Poll until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        self.running.store(true, Ordering::Relaxed);
        info!(interval_secs = self.poll_interval.as_secs(), "job scheduler started");
        let mut interval = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.poll_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.running.store(false, Ordering::Relaxed);
        info!("job scheduler stopped");
    }
}
