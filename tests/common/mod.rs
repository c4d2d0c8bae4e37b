#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Days, NaiveDate, TimeZone, Utc};
use tokio::sync::Semaphore;
use ulid::Ulid;

use courtside::backoff::Backoff;
use courtside::clock::{Clock, ManualClock};
use courtside::config::Config;
use courtside::credentials::{Credentials, InMemoryCredentials};
use courtside::error::ExecutorError;
use courtside::executor::BookingExecutor;
use courtside::jobs::AttemptHandler;
use courtside::lifecycle::Lifecycle;
use courtside::model::{BookingCandidate, BookingRequest, ExecutionOutcome, Ts};
use courtside::notify::{Notification, NotificationContext, NotificationKind, Notifier};
use courtside::processor::BookingProcessor;
use courtside::scheduler::JobScheduler;
use courtside::service::BookingService;
use courtside::store::{BookingStore, JournaledStore};

// ── Fakes ────────────────────────────────────────────────────

/// Plays back scripted outcomes, then repeats `fallback`. Calls wait on `gate`.
pub struct FakeExecutor {
    script: Mutex<VecDeque<ExecutionOutcome>>,
    fallback: ExecutionOutcome,
    gate: Semaphore,
    calls: Mutex<Vec<Ulid>>,
}

impl FakeExecutor {
    pub fn confirming() -> Arc<Self> {
        Self::with(ExecutionOutcome::confirmed("CRT-0001"), Semaphore::MAX_PERMITS)
    }

    pub fn failing() -> Arc<Self> {
        Self::with(ExecutionOutcome::failed("court no longer available"), Semaphore::MAX_PERMITS)
    }

    /// Confirms, but every call blocks until `release`.
    pub fn held() -> Arc<Self> {
        Self::with(ExecutionOutcome::confirmed("CRT-HELD"), 0)
    }

    fn with(fallback: ExecutionOutcome, permits: usize) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            gate: Semaphore::new(permits),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn then(&self, outcome: ExecutionOutcome) {
        self.script.lock().unwrap().push_back(outcome);
    }

    pub fn release(&self) {
        self.gate.add_permits(1024);
    }

    /// Let `n` more blocked calls through.
    pub fn allow(&self, n: usize) {
        self.gate.add_permits(n);
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_for(&self, id: Ulid) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| **c == id).count()
    }
}

#[async_trait]
impl BookingExecutor for FakeExecutor {
    async fn execute(
        &self,
        request: &BookingRequest,
        _credentials: &Credentials,
    ) -> Result<ExecutionOutcome, ExecutorError> {
        self.calls.lock().unwrap().push(request.request_id);
        // Each permit admits exactly one call.
        self.gate
            .acquire()
            .await
            .map_err(|_| ExecutorError::Protocol("gate closed".into()))?
            .forget();
        let next = self.script.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| self.fallback.clone()))
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn for_request(&self, id: Ulid) -> Vec<Notification> {
        self.sent().into_iter().filter(|n| n.request_id == id).collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, request_id: Ulid, kind: NotificationKind, context: NotificationContext) {
        self.sent.lock().unwrap().push(Notification {
            request_id,
            kind,
            context,
        });
    }
}

// ── Harness ──────────────────────────────────────────────────

pub const USER: &str = "maria";
pub const SLOT: &str = "De 08:00 AM a 09:00 AM";

pub fn start() -> Ts {
    Utc.with_ymd_and_hms(2026, 4, 1, 9, 0, 0).unwrap()
}

pub fn today() -> NaiveDate {
    start().date_naive()
}

pub fn days_ahead(n: u64) -> NaiveDate {
    today().checked_add_days(Days::new(n)).unwrap()
}

pub fn candidate(court: u32, date: NaiveDate) -> BookingCandidate {
    BookingCandidate {
        resource_id: court,
        booking_date: date,
        time_slot: SLOT.into(),
        priority: None,
        auto_retry: None,
        max_retries: None,
        notes: None,
    }
}

pub fn temp_journal() -> PathBuf {
    std::env::temp_dir()
        .join(format!("courtside_it_{}", Ulid::new()))
        .join("bookings.wal")
}

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub store: Arc<JournaledStore>,
    pub scheduler: Arc<JobScheduler>,
    pub lifecycle: Arc<Lifecycle>,
    pub processor: Arc<BookingProcessor>,
    pub service: BookingService,
    pub notifier: Arc<RecordingNotifier>,
    pub executor: Arc<FakeExecutor>,
    pub journal: PathBuf,
}

impl Harness {
    pub fn new(executor: Arc<FakeExecutor>) -> Self {
        Self::with_config(executor, Config::default(), temp_journal())
    }

    pub fn with_config(executor: Arc<FakeExecutor>, config: Config, journal: PathBuf) -> Self {
        let clock = Arc::new(ManualClock::new(start()));
        let store = Arc::new(JournaledStore::open(&journal).unwrap());
        let backoff = Backoff::new(config.retry_base, config.retry_cap);
        let scheduler = Arc::new(JobScheduler::new(
            clock.clone(),
            backoff,
            config.job_retention,
            Duration::from_millis(10),
        ));
        let notifier = Arc::new(RecordingNotifier::default());
        let lifecycle = Arc::new(Lifecycle::new(
            store.clone(),
            scheduler.clone(),
            notifier.clone(),
            clock.clone(),
            backoff,
        ));
        let credentials = InMemoryCredentials::new();
        credentials.insert(
            USER,
            Credentials {
                username: "maria@club".into(),
                password: "secret".into(),
            },
        );
        let processor = Arc::new(BookingProcessor::new(
            &config,
            lifecycle.clone(),
            executor.clone(),
            Arc::new(credentials),
            clock.clone(),
        ));
        AttemptHandler::register(&scheduler, processor.clone());
        let service = BookingService::new(&config, lifecycle.clone(), clock.clone());

        Self {
            clock,
            store,
            scheduler,
            lifecycle,
            processor,
            service,
            notifier,
            executor,
            journal,
        }
    }

    pub fn now(&self) -> Ts {
        self.clock.utc()
    }

    pub async fn request(&self, id: Ulid) -> BookingRequest {
        self.store.get(id).await.unwrap().unwrap()
    }

    /// Fire every due job and wait for the executions they started.
    pub async fn run_due_jobs(&self) {
        self.scheduler.poll_once().await;
        self.processor.wait_idle().await;
    }

    /// Move the clock to `request`'s queued job and fire it.
    pub async fn fire_scheduled_job(&self, id: Ulid) {
        let request = self.request(id).await;
        let job_id = request.scheduled_job_id.expect("request has a queued job");
        let job = self.scheduler.job(job_id).expect("job is known to the scheduler");
        self.clock.set(job.scheduled_time);
        self.run_due_jobs().await;
    }
}
