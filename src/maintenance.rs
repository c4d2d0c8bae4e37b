use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::TimeDelta;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::JobError;
use crate::model::{JobPayload, JobType, ScheduledJob, Ts, PAYLOAD_TASK};
use crate::processor::BookingProcessor;
use crate::scheduler::{JobHandler, JobScheduler};
use crate::store::JournaledStore;

pub const TASK_SWEEP: &str = "sweep";

/// Periodic housekeeping: expiry sweep, terminal purge, journal compaction.
/// Each first run queues its own successor, so one seed job keeps the cadence going.
pub struct MaintenanceHandler {
    processor: Arc<BookingProcessor>,
    store: Option<Arc<JournaledStore>>,
    scheduler: Weak<JobScheduler>,
    interval: TimeDelta,
    compact_threshold: u64,
}

impl MaintenanceHandler {
    pub fn new(
        processor: Arc<BookingProcessor>,
        store: Option<Arc<JournaledStore>>,
        scheduler: &Arc<JobScheduler>,
        interval: TimeDelta,
        compact_threshold: u64,
    ) -> Self {
        Self {
            processor,
            store,
            scheduler: Arc::downgrade(scheduler),
            interval,
            compact_threshold,
        }
    }

    /// Register on `scheduler` and queue the first run at `first_run`.
    pub fn install(self, scheduler: &JobScheduler, first_run: Ts) -> ulid::Ulid {
        scheduler.register(JobType::PeriodicMaintenance, Arc::new(self));
        scheduler.schedule(
            JobType::PeriodicMaintenance,
            first_run,
            JobPayload::new().with(PAYLOAD_TASK, TASK_SWEEP),
        )
    }

    async fn sweep(&self) -> Result<(), JobError> {
        let swept = self.processor.expire_stale().await?;
        let purged = self.processor.purge_terminal().await?;
        if swept.expired + swept.failed + purged > 0 {
            info!(expired = swept.expired, failed = swept.failed, purged, "maintenance sweep");
        }
        if let Some(store) = &self.store {
            store.compact_if_needed(self.compact_threshold).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl JobHandler for MaintenanceHandler {
    async fn handle(&self, job: &ScheduledJob) -> Result<bool, JobError> {
        // Retries of a failed run must not fork the chain.
        if job.retry_count == 0
            && let Some(scheduler) = self.scheduler.upgrade()
        {
            let next = scheduler.now() + self.interval;
            let id = scheduler.schedule(JobType::PeriodicMaintenance, next, job.payload.clone());
            debug!(job_id = %id, at = %next, "next maintenance queued");
        }

        match job.payload.get(PAYLOAD_TASK) {
            Some(TASK_SWEEP) | None => {
                self.sweep().await?;
                Ok(true)
            }
            Some(other) => {
                warn!(task = other, "unknown maintenance task");
                Ok(true)
            }
        }
    }
}

/// Background task that compacts the journal once it grows past `threshold` appends.
pub async fn run_compactor(
    store: Arc<JournaledStore>,
    threshold: u64,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = store.compact_if_needed(threshold).await {
                    error!(error = %e, "journal compaction failed");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::Backoff;
    use crate::clock::{Clock, ManualClock};
    use crate::config::Config;
    use crate::credentials::{Credentials, InMemoryCredentials};
    use crate::error::ExecutorError;
    use crate::executor::BookingExecutor;
    use crate::lifecycle::Lifecycle;
    use crate::model::{BookingRequest, BookingStatus, ExecutionOutcome, JobStatus};
    use crate::notify::NotifyHub;
    use crate::store::tests::{sample, test_wal_path};
    use crate::store::BookingStore;
    use chrono::{NaiveDate, TimeZone, Utc};

    struct Unused;

    #[async_trait]
    impl BookingExecutor for Unused {
        async fn execute(
            &self,
            _request: &BookingRequest,
            _credentials: &Credentials,
        ) -> Result<ExecutionOutcome, ExecutorError> {
            Err(ExecutorError::Protocol("not expected".into()))
        }
    }

    #[tokio::test]
    async fn maintenance_sweeps_and_reschedules_itself() {
        let start = Utc.with_ymd_and_hms(2026, 4, 1, 9, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let store = Arc::new(JournaledStore::open(&test_wal_path("maintenance.wal")).unwrap());
        let scheduler = Arc::new(JobScheduler::new(
            clock.clone(),
            Backoff::default(),
            TimeDelta::hours(24),
            Duration::from_secs(30),
        ));
        let lifecycle = Arc::new(Lifecycle::new(
            store.clone(),
            scheduler.clone(),
            Arc::new(NotifyHub::new()),
            clock.clone(),
            Backoff::default(),
        ));
        let processor = Arc::new(BookingProcessor::new(
            &Config::default(),
            lifecycle,
            Arc::new(Unused),
            Arc::new(InMemoryCredentials::new()),
            clock.clone(),
        ));
        let stale = store
            .create(sample("ana", 1, NaiveDate::from_ymd_opt(2026, 4, 5).unwrap(), BookingStatus::Scheduled))
            .await
            .unwrap();

        let seed = MaintenanceHandler::new(processor, Some(store.clone()), &scheduler, TimeDelta::hours(6), 1)
            .install(&scheduler, start + TimeDelta::hours(25));

        clock.set(start + TimeDelta::hours(25));
        let report = scheduler.poll_once().await;
        assert_eq!(report.completed, 1);
        assert_eq!(scheduler.status(seed), Some(JobStatus::Completed));
        assert_eq!(
            store.get(stale.request_id).await.unwrap().unwrap().status,
            BookingStatus::Expired
        );

        let pending = scheduler.pending_jobs();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].job_type, JobType::PeriodicMaintenance);
        assert_eq!(pending[0].scheduled_time, clock.utc() + TimeDelta::hours(6));
        // Threshold 1 means the sweep's own write triggered a compaction.
        assert_eq!(store.appends_since_compact().await, 0);
    }
}
