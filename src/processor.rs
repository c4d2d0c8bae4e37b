use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::TimeDelta;
use dashmap::DashSet;
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, info_span, warn, Instrument};
use ulid::Ulid;

use crate::clock::SharedClock;
use crate::config::Config;
use crate::credentials::CredentialStore;
use crate::error::BookingError;
use crate::executor::BookingExecutor;
use crate::lifecycle::{Lifecycle, TransitionContext};
use crate::limits::SWEEP_BATCH;
use crate::model::{BookingRequest, BookingStatus, ExecutionOutcome};
use crate::observability::{EXECUTIONS_IN_FLIGHT, EXECUTIONS_TOTAL, EXECUTION_DURATION_SECONDS};
use crate::store::BookingStore;

pub const STALE_PROCESSING_ERROR: &str = "recovered stale processing record";
pub const EXPIRED_PENDING_ERROR: &str = "request expired before it could be processed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Moved to PROCESSING; the executor runs in the background.
    Started,
    AlreadyInProgress,
    AtCapacity,
    NotEligible(BookingStatus),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessingStatus {
    pub running: bool,
    pub in_flight: usize,
    pub in_flight_ids: Vec<Ulid>,
    pub max_concurrent: usize,
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessingStatistics {
    pub counts: BTreeMap<BookingStatus, usize>,
    pub total: usize,
    /// `confirmed / (confirmed + failed) × 100`, zero when neither happened yet.
    pub success_rate: f64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub failed: usize,
    pub purged: usize,
}

/// Releases the in-progress slot when the execution unit ends, however it ends.
struct InFlight {
    set: Arc<DashSet<Ulid>>,
    idle: Arc<Notify>,
    id: Ulid,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.set.remove(&self.id);
        metrics::gauge!(EXECUTIONS_IN_FLIGHT).set(self.set.len() as f64);
        self.idle.notify_waiters();
    }
}

/// Pulls due requests, runs the executor for each on its own task, feeds results back.
pub struct BookingProcessor {
    lifecycle: Arc<Lifecycle>,
    store: Arc<dyn BookingStore>,
    executor: Arc<dyn BookingExecutor>,
    credentials: Arc<dyn CredentialStore>,
    clock: SharedClock,
    in_progress: Arc<DashSet<Ulid>>,
    idle: Arc<Notify>,
    max_concurrent: usize,
    poll_interval: Duration,
    expire_after: TimeDelta,
    retention: TimeDelta,
    running: AtomicBool,
}

impl BookingProcessor {
    pub fn new(
        config: &Config,
        lifecycle: Arc<Lifecycle>,
        executor: Arc<dyn BookingExecutor>,
        credentials: Arc<dyn CredentialStore>,
        clock: SharedClock,
    ) -> Self {
        Self {
            store: lifecycle.store().clone(),
            lifecycle,
            executor,
            credentials,
            clock,
            in_progress: Arc::new(DashSet::new()),
            idle: Arc::new(Notify::new()),
            max_concurrent: config.max_concurrent.max(1),
            poll_interval: config.processor_poll,
            expire_after: config.expire_after,
            retention: config.retention,
            running: AtomicBool::new(false),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_progress.len()
    }

    pub fn is_in_flight(&self, id: Ulid) -> bool {
        self.in_progress.contains(&id)
    }

    /// Claim an in-progress slot. None if the id is already claimed or the cap is reached.
    fn claim(&self, id: Ulid) -> Result<InFlight, DispatchOutcome> {
        if self.in_progress.len() >= self.max_concurrent {
            return Err(DispatchOutcome::AtCapacity);
        }
        if !self.in_progress.insert(id) {
            return Err(DispatchOutcome::AlreadyInProgress);
        }
        let slot = InFlight {
            set: self.in_progress.clone(),
            idle: self.idle.clone(),
            id,
        };
        if self.in_progress.len() > self.max_concurrent {
            return Err(DispatchOutcome::AtCapacity);
        }
        metrics::gauge!(EXECUTIONS_IN_FLIGHT).set(self.in_progress.len() as f64);
        Ok(slot)
    }

    /// Dispatch one request if it is eligible now. Used by the deferred and retry jobs.
    pub async fn dispatch(self: &Arc<Self>, id: Ulid) -> Result<DispatchOutcome, BookingError> {
        self.dispatch_inner(id, false).await
    }

    async fn dispatch_inner(
        self: &Arc<Self>,
        id: Ulid,
        force: bool,
    ) -> Result<DispatchOutcome, BookingError> {
        let slot = match self.claim(id) {
            Ok(slot) => slot,
            Err(outcome) => return Ok(outcome),
        };

        let request = self
            .store
            .get(id)
            .await?
            .ok_or(BookingError::NotFound(id))?;
        let eligible = match request.status {
            BookingStatus::Pending | BookingStatus::Failed => true,
            BookingStatus::Scheduled => force || request.is_due(self.clock.utc()),
            _ => false,
        };
        if !eligible {
            return Ok(DispatchOutcome::NotEligible(request.status));
        }

        let request = match self
            .lifecycle
            .transition(id, BookingStatus::Processing, TransitionContext::default())
            .await
        {
            Ok(r) => r,
            Err(BookingError::InvalidTransition { from, .. }) => {
                return Ok(DispatchOutcome::NotEligible(from));
            }
            Err(e) => return Err(e),
        };

        let this = self.clone();
        let span = info_span!("execution", request_id = %id, user_id = %request.user_id);
        tokio::spawn(
            async move {
                let _slot = slot;
                this.execute(request).await;
            }
            .instrument(span),
        );
        Ok(DispatchOutcome::Started)
    }

    async fn execute(&self, request: BookingRequest) {
        let id = request.request_id;
        let started = Instant::now();
        let outcome = match self.credentials.credentials_for(&request.user_id).await {
            Ok(creds) => match self.executor.execute(&request, &creds).await {
                Ok(outcome) => {
                    let label = if outcome.success { "success" } else { "failure" };
                    metrics::counter!(EXECUTIONS_TOTAL, "outcome" => label).increment(1);
                    outcome
                }
                Err(e) => {
                    metrics::counter!(EXECUTIONS_TOTAL, "outcome" => "error").increment(1);
                    warn!(error = %e, "executor error");
                    ExecutionOutcome::failed(e.to_string())
                }
            },
            Err(e) => {
                metrics::counter!(EXECUTIONS_TOTAL, "outcome" => "error").increment(1);
                warn!(error = %e, "cannot execute without credentials");
                ExecutionOutcome::failed(e.to_string())
            }
        };
        metrics::histogram!(EXECUTION_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        debug!(success = outcome.success, elapsed_ms = started.elapsed().as_millis() as u64, "execution finished");

        if let Err(e) = self.lifecycle.record_outcome(id, outcome).await {
            error!(error = %e, "failed to record execution outcome");
        }
    }

    /// One poll cycle. Returns how many executions were started.
    pub async fn poll_once(self: &Arc<Self>) -> Result<usize, BookingError> {
        let free = self.max_concurrent.saturating_sub(self.in_progress.len());
        if free == 0 {
            return Ok(0);
        }

        let now = self.clock.utc();
        let mut due = self.store.query_by_status(BookingStatus::Pending, SWEEP_BATCH).await?;
        due.extend(
            self.store
                .query_by_status(BookingStatus::Scheduled, SWEEP_BATCH)
                .await?
                .into_iter()
                .filter(|r| r.is_due(now)),
        );
        // Retries whose job was lost to a restart or spent against a full processor.
        due.extend(
            self.store
                .query_by_status(BookingStatus::Failed, SWEEP_BATCH)
                .await?
                .into_iter()
                .filter(|r| r.is_retry_due(now)),
        );
        due.retain(|r| !self.in_progress.contains(&r.request_id));
        due.sort_by_key(|r| (Reverse(r.priority), r.created_at, r.request_id));

        let mut started = 0;
        for request in due {
            if started == free {
                break;
            }
            match self.dispatch(request.request_id).await {
                Ok(DispatchOutcome::Started) => started += 1,
                Ok(DispatchOutcome::AtCapacity) => break,
                Ok(_) => {}
                Err(e) => warn!(request_id = %request.request_id, error = %e, "dispatch failed"),
            }
        }
        if started > 0 {
            debug!(started, in_flight = self.in_flight(), "processor poll");
        }
        Ok(started)
    }

    /// Operator re-run of a request. A PROCESSING record with no live execution is
    /// failed first, without spending its retry budget.
    pub async fn process_manually(self: &Arc<Self>, id: Ulid) -> Result<DispatchOutcome, BookingError> {
        let request = self
            .store
            .get(id)
            .await?
            .ok_or(BookingError::NotFound(id))?;
        match request.status {
            BookingStatus::Processing if self.is_in_flight(id) => {
                return Ok(DispatchOutcome::AlreadyInProgress);
            }
            BookingStatus::Processing => {
                warn!(request_id = %id, "recovering stale processing record");
                self.lifecycle
                    .transition(
                        id,
                        BookingStatus::Failed,
                        TransitionContext {
                            error_message: Some(STALE_PROCESSING_ERROR.into()),
                            skip_retry: true,
                            quiet: true,
                            ..TransitionContext::default()
                        },
                    )
                    .await?;
            }
            BookingStatus::Pending | BookingStatus::Scheduled | BookingStatus::Failed => {}
            from => {
                return Err(BookingError::InvalidTransition {
                    from,
                    to: BookingStatus::Processing,
                });
            }
        }
        info!(request_id = %id, "manual processing requested");
        self.dispatch_inner(id, true).await
    }

    /// Expire PENDING/SCHEDULED requests older than the configured age. A PENDING request
    /// cannot move to EXPIRED, so it is failed terminally instead.
    pub async fn expire_stale(&self) -> Result<SweepReport, BookingError> {
        let cutoff = self.clock.utc() - self.expire_after;
        let stale = self
            .store
            .query_older_than(
                cutoff,
                &[BookingStatus::Pending, BookingStatus::Scheduled],
                SWEEP_BATCH,
            )
            .await?;

        let mut report = SweepReport::default();
        for request in stale {
            let id = request.request_id;
            if self.is_in_flight(id) {
                continue;
            }
            let result = match request.status {
                BookingStatus::Scheduled => self
                    .lifecycle
                    .transition(id, BookingStatus::Expired, TransitionContext::default())
                    .await
                    .map(|_| report.expired += 1),
                _ => self
                    .lifecycle
                    .transition(
                        id,
                        BookingStatus::Failed,
                        TransitionContext {
                            error_message: Some(EXPIRED_PENDING_ERROR.into()),
                            skip_retry: true,
                            ..TransitionContext::default()
                        },
                    )
                    .await
                    .map(|_| report.failed += 1),
            };
            if let Err(e) = result {
                debug!(request_id = %id, error = %e, "expiry skipped");
            }
        }
        Ok(report)
    }

    /// Delete terminal requests older than the retention window.
    pub async fn purge_terminal(&self) -> Result<usize, BookingError> {
        let cutoff = self.clock.utc() - self.retention;
        let statuses: Vec<BookingStatus> = BookingStatus::ALL
            .into_iter()
            .filter(|s| s.is_purgeable())
            .collect();
        let old = self
            .store
            .query_older_than(cutoff, &statuses, SWEEP_BATCH)
            .await?;
        let mut purged = 0;
        for request in old {
            if !self.is_in_flight(request.request_id) && self.store.delete(request.request_id).await? {
                purged += 1;
            }
        }
        Ok(purged)
    }

    pub fn processing_status(&self) -> ProcessingStatus {
        let mut in_flight_ids: Vec<Ulid> = self.in_progress.iter().map(|id| *id).collect();
        in_flight_ids.sort();
        ProcessingStatus {
            running: self.running.load(Ordering::Relaxed),
            in_flight: in_flight_ids.len(),
            in_flight_ids,
            max_concurrent: self.max_concurrent,
            poll_interval_secs: self.poll_interval.as_secs(),
        }
    }

    pub async fn statistics(&self) -> Result<ProcessingStatistics, BookingError> {
        let counts = self.store.count_by_status().await?;
        let count = |s: BookingStatus| counts.get(&s).copied().unwrap_or(0);
        let confirmed = count(BookingStatus::Confirmed);
        let failed = count(BookingStatus::Failed);
        let success_rate = if confirmed + failed == 0 {
            0.0
        } else {
            confirmed as f64 / (confirmed + failed) as f64 * 100.0
        };
        Ok(ProcessingStatistics {
            total: counts.values().sum(),
            counts,
            success_rate,
        })
    }

    /// Wait until no execution is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_progress.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Poll until `shutdown` flips to true. In-flight executions keep running.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        self.running.store(true, Ordering::Relaxed);
        info!(
            interval_secs = self.poll_interval.as_secs(),
            max_concurrent = self.max_concurrent,
            "booking processor started"
        );
        let mut interval = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.poll_once().await {
                        error!(error = %e, "processor poll failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.running.store(false, Ordering::Relaxed);
        info!(in_flight = self.in_flight(), "booking processor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::Backoff;
    use crate::clock::{Clock, ManualClock};
    use crate::credentials::{Credentials, InMemoryCredentials};
    use crate::error::ExecutorError;
    use crate::notify::NotifyHub;
    use crate::scheduler::JobScheduler;
    use crate::store::tests::{sample, test_wal_path};
    use crate::store::JournaledStore;
    use async_trait::async_trait;
    use chrono::{NaiveDate, TimeZone, Utc};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tokio::sync::Semaphore;

    /// Blocks every call on a semaphore and counts concurrent calls per id.
    struct GatedExecutor {
        gate: Semaphore,
        calls: Mutex<Vec<Ulid>>,
        concurrent: AtomicUsize,
        max_seen: AtomicUsize,
        succeed: bool,
    }

    impl GatedExecutor {
        fn new(succeed: bool, permits: usize) -> Arc<Self> {
            Arc::new(Self {
                gate: Semaphore::new(permits),
                calls: Mutex::new(Vec::new()),
                concurrent: AtomicUsize::new(0),
                max_seen: AtomicUsize::new(0),
                succeed,
            })
        }

        fn calls_for(&self, id: Ulid) -> usize {
            self.calls.lock().unwrap().iter().filter(|c| **c == id).count()
        }
    }

    #[async_trait]
    impl BookingExecutor for GatedExecutor {
        async fn execute(
            &self,
            request: &BookingRequest,
            _credentials: &Credentials,
        ) -> Result<ExecutionOutcome, ExecutorError> {
            self.calls.lock().unwrap().push(request.request_id);
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            let _permit = self.gate.acquire().await.unwrap();
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            Ok(if self.succeed {
                ExecutionOutcome::confirmed("OK")
            } else {
                ExecutionOutcome::failed("court unavailable")
            })
        }
    }

    struct Fixture {
        store: Arc<JournaledStore>,
        clock: Arc<ManualClock>,
        processor: Arc<BookingProcessor>,
    }

    fn fixture(name: &str, executor: Arc<dyn BookingExecutor>, max_concurrent: usize) -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 4, 1, 9, 0, 0).unwrap()));
        let store = Arc::new(JournaledStore::open(&test_wal_path(name)).unwrap());
        let scheduler = Arc::new(JobScheduler::new(
            clock.clone(),
            Backoff::default(),
            TimeDelta::hours(24),
            Duration::from_secs(30),
        ));
        let lifecycle = Arc::new(Lifecycle::new(
            store.clone(),
            scheduler,
            Arc::new(NotifyHub::new()),
            clock.clone(),
            Backoff::default(),
        ));
        let creds = InMemoryCredentials::new();
        creds.insert("ana", Credentials { username: "ana".into(), password: "pw".into() });
        let config = Config {
            max_concurrent,
            ..Config::default()
        };
        let processor = Arc::new(BookingProcessor::new(
            &config,
            lifecycle,
            executor,
            Arc::new(creds),
            clock.clone(),
        ));
        Fixture { store, clock, processor }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 4, 5).unwrap()
    }

    async fn status_of(f: &Fixture, id: Ulid) -> BookingStatus {
        f.store.get(id).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn overlapping_polls_execute_once() {
        let exec = GatedExecutor::new(true, 0);
        let f = fixture("processor_overlap.wal", exec.clone(), 3);
        let r = f.store.create(sample("ana", 1, date(), BookingStatus::Pending)).await.unwrap();

        let (a, b) = tokio::join!(f.processor.poll_once(), f.processor.poll_once());
        assert_eq!(a.unwrap() + b.unwrap(), 1);
        assert_eq!(f.processor.dispatch(r.request_id).await.unwrap(), DispatchOutcome::AlreadyInProgress);

        exec.gate.add_permits(10);
        f.processor.wait_idle().await;
        assert_eq!(exec.calls_for(r.request_id), 1);
        assert_eq!(status_of(&f, r.request_id).await, BookingStatus::Confirmed);
    }

    #[tokio::test]
    async fn respects_max_concurrent() {
        let exec = GatedExecutor::new(true, 0);
        let f = fixture("processor_cap.wal", exec.clone(), 2);
        for _ in 0..5 {
            f.store.create(sample("ana", 1, date(), BookingStatus::Pending)).await.unwrap();
        }
        assert_eq!(f.processor.poll_once().await.unwrap(), 2);
        assert_eq!(f.processor.poll_once().await.unwrap(), 0);
        assert_eq!(f.processor.processing_status().in_flight, 2);

        exec.gate.add_permits(100);
        f.processor.wait_idle().await;
        while f.processor.poll_once().await.unwrap() > 0 {
            f.processor.wait_idle().await;
        }
        assert!(exec.max_seen.load(Ordering::SeqCst) <= 2);
        let stats = f.processor.statistics().await.unwrap();
        assert_eq!(stats.counts[&BookingStatus::Confirmed], 5);
        assert_eq!(stats.success_rate, 100.0);
    }

    #[tokio::test]
    async fn scheduled_request_waits_until_due() {
        let exec = GatedExecutor::new(true, 100);
        let f = fixture("processor_due.wal", exec.clone(), 3);
        let mut r = sample("ana", 1, date(), BookingStatus::Scheduled);
        r.scheduled_for = Some(f.clock.utc() + TimeDelta::hours(2));
        let r = f.store.create(r).await.unwrap();

        assert_eq!(f.processor.poll_once().await.unwrap(), 0);
        assert_eq!(
            f.processor.dispatch(r.request_id).await.unwrap(),
            DispatchOutcome::NotEligible(BookingStatus::Scheduled)
        );
        f.clock.advance(TimeDelta::hours(2));
        assert_eq!(f.processor.poll_once().await.unwrap(), 1);
        f.processor.wait_idle().await;
        assert_eq!(status_of(&f, r.request_id).await, BookingStatus::Confirmed);
    }

    #[tokio::test]
    async fn missing_credentials_fail_the_attempt() {
        let exec = GatedExecutor::new(true, 100);
        let f = fixture("processor_nocreds.wal", exec.clone(), 3);
        let r = f.store.create(sample("zoe", 1, date(), BookingStatus::Pending)).await.unwrap();
        f.processor.dispatch(r.request_id).await.unwrap();
        f.processor.wait_idle().await;

        let after = f.store.get(r.request_id).await.unwrap().unwrap();
        assert_eq!(after.status, BookingStatus::Failed);
        assert!(after.error_message.unwrap().contains("zoe"));
        assert_eq!(exec.calls_for(r.request_id), 0);
    }

    #[tokio::test]
    async fn manual_processing_recovers_stale_record() {
        let exec = GatedExecutor::new(true, 100);
        let f = fixture("processor_manual.wal", exec.clone(), 3);
        let r = f.store.create(sample("ana", 1, date(), BookingStatus::Processing)).await.unwrap();

        assert_eq!(f.processor.poll_once().await.unwrap(), 0);
        assert_eq!(f.processor.process_manually(r.request_id).await.unwrap(), DispatchOutcome::Started);
        f.processor.wait_idle().await;
        let after = f.store.get(r.request_id).await.unwrap().unwrap();
        assert_eq!(after.status, BookingStatus::Confirmed);
        assert_eq!(after.retry_count, 0);

        assert!(matches!(
            f.processor.process_manually(r.request_id).await,
            Err(BookingError::InvalidTransition { from: BookingStatus::Confirmed, .. })
        ));
    }

    #[tokio::test]
    async fn expiry_sweep_and_purge() {
        let exec = GatedExecutor::new(true, 100);
        let f = fixture("processor_sweep.wal", exec, 3);
        let scheduled = f.store.create(sample("ana", 1, date(), BookingStatus::Scheduled)).await.unwrap();
        let pending = f.store.create(sample("ana", 2, date(), BookingStatus::Pending)).await.unwrap();
        let confirmed = f.store.create(sample("ana", 1, date(), BookingStatus::Confirmed)).await.unwrap();

        f.clock.advance(TimeDelta::hours(25));
        let report = f.processor.expire_stale().await.unwrap();
        assert_eq!(report, SweepReport { expired: 1, failed: 1, purged: 0 });
        assert_eq!(status_of(&f, scheduled.request_id).await, BookingStatus::Expired);
        let p = f.store.get(pending.request_id).await.unwrap().unwrap();
        assert_eq!(p.status, BookingStatus::Failed);
        assert_eq!(p.error_message.as_deref(), Some(EXPIRED_PENDING_ERROR));

        assert_eq!(f.processor.purge_terminal().await.unwrap(), 0);
        f.clock.advance(TimeDelta::days(30));
        assert_eq!(f.processor.purge_terminal().await.unwrap(), 3);
        assert_eq!(f.store.get(confirmed.request_id).await.unwrap(), None);
    }
}
