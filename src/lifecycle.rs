use std::sync::Arc;

use tracing::{info, warn};
use ulid::Ulid;

use crate::backoff::Backoff;
use crate::clock::SharedClock;
use crate::error::{BookingError, StoreError};
use crate::model::{
    BookingRequest, BookingStatus, ExecutionOutcome, JobPayload, JobType, ScheduledJob, Ts,
};
use crate::notify::{NotificationContext, NotificationKind, Notifier};
use crate::observability::{INVALID_TRANSITIONS_TOTAL, TRANSITIONS_TOTAL};
use crate::scheduler::JobScheduler;
use crate::store::BookingStore;

/// Extra data a transition may need.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionContext {
    pub message: Option<String>,
    pub confirmation_code: Option<String>,
    pub error_message: Option<String>,
    pub external_booking_id: Option<String>,
    /// Fail without consuming the retry budget.
    pub skip_retry: bool,
    /// Suppress the terminal-failure notification.
    pub quiet: bool,
}

impl TransitionContext {
    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            error_message: Some(error.into()),
            ..Self::default()
        }
    }
}

/// `CONF_<first 8 id chars, upper-case>_<YYYYMMDD>`.
pub fn synthesize_confirmation_code(id: Ulid, on: Ts) -> String {
    let id = id.to_string();
    let prefix: String = id.chars().take(8).collect();
    format!("CONF_{}_{}", prefix.to_uppercase(), on.format("%Y%m%d"))
}

/// Side effects of an applied transition, run only after the write succeeded.
#[derive(Default)]
struct Effects {
    retry_job: Option<ScheduledJob>,
    cancel_job: Option<Ulid>,
    notify: Option<NotificationKind>,
}

/// Owns request status. Every change goes through one conditional write.
pub struct Lifecycle {
    store: Arc<dyn BookingStore>,
    scheduler: Arc<JobScheduler>,
    notifier: Arc<dyn Notifier>,
    clock: SharedClock,
    backoff: Backoff,
}

impl Lifecycle {
    pub fn new(
        store: Arc<dyn BookingStore>,
        scheduler: Arc<JobScheduler>,
        notifier: Arc<dyn Notifier>,
        clock: SharedClock,
        backoff: Backoff,
    ) -> Self {
        Self {
            store,
            scheduler,
            notifier,
            clock,
            backoff,
        }
    }

    pub fn store(&self) -> &Arc<dyn BookingStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &Arc<JobScheduler> {
        &self.scheduler
    }

    async fn load(&self, id: Ulid) -> Result<BookingRequest, BookingError> {
        self.store.get(id).await?.ok_or(BookingError::NotFound(id))
    }

    /// Apply `to` against the current record. A version conflict is retried once
    /// against a fresh read, which re-checks the transition table.
    pub async fn transition(
        &self,
        id: Ulid,
        to: BookingStatus,
        ctx: TransitionContext,
    ) -> Result<BookingRequest, BookingError> {
        let current = self.load(id).await?;
        let (stored, from, effects) = match self.apply(current, to, &ctx).await {
            Err(BookingError::Store(StoreError::VersionConflict { expected, actual, .. })) => {
                warn!(request_id = %id, to = %to, expected, actual, "version conflict, retrying transition");
                let fresh = self.load(id).await?;
                self.apply(fresh, to, &ctx).await?
            }
            other => other?,
        };

        metrics::counter!(TRANSITIONS_TOTAL, "from" => from.as_str(), "to" => to.as_str())
            .increment(1);
        info!(request_id = %id, from = %from, to = %to, retry_count = stored.retry_count, "request transitioned");
        self.run_effects(&stored, effects);
        Ok(stored)
    }

    async fn apply(
        &self,
        current: BookingRequest,
        to: BookingStatus,
        ctx: &TransitionContext,
    ) -> Result<(BookingRequest, BookingStatus, Effects), BookingError> {
        let from = current.status;
        if !from.can_transition_to(to) {
            metrics::counter!(INVALID_TRANSITIONS_TOTAL).increment(1);
            warn!(request_id = %current.request_id, from = %from, to = %to, "invalid transition refused");
            return Err(BookingError::InvalidTransition { from, to });
        }

        let now = self.clock.utc();
        let mut next = current.clone();
        let mut effects = Effects::default();
        next.status = to;
        next.updated_at = now;

        match to {
            BookingStatus::Processing => {
                effects.cancel_job = next.scheduled_job_id.take();
            }
            BookingStatus::Confirmed => {
                next.confirmation_code = Some(
                    ctx.confirmation_code
                        .clone()
                        .unwrap_or_else(|| synthesize_confirmation_code(next.request_id, now)),
                );
                next.confirmed_at = Some(now);
                next.error_message = None;
                if ctx.external_booking_id.is_some() {
                    next.external_booking_id = ctx.external_booking_id.clone();
                }
                effects.notify = Some(NotificationKind::Confirmed);
            }
            BookingStatus::Failed => {
                let error = ctx
                    .error_message
                    .clone()
                    .or_else(|| ctx.message.clone())
                    .ok_or_else(|| {
                        BookingError::Validation("a failed transition needs an error message".into())
                    })?;
                next.error_message = Some(error);
                effects.cancel_job = next.scheduled_job_id.take();
                next.scheduled_for = None;

                let budgeted = next.auto_retry && !ctx.skip_retry;
                if budgeted && next.retry_count < next.max_retries {
                    next.retry_count += 1;
                }
                if budgeted && next.retry_count < next.max_retries {
                    let at = now + self.backoff.delay(next.retry_count);
                    let job = ScheduledJob::new(JobType::RetryAttempt, at, JobPayload::for_request(&next), now);
                    next.scheduled_job_id = Some(job.job_id);
                    next.scheduled_for = Some(at);
                    effects.retry_job = Some(job);
                } else if !ctx.quiet {
                    effects.notify = Some(NotificationKind::Failed);
                }
            }
            BookingStatus::Cancelled | BookingStatus::Expired => {
                effects.cancel_job = next.scheduled_job_id.take();
                effects.notify = NotificationKind::for_status(to);
            }
            BookingStatus::Pending | BookingStatus::Scheduled => {}
        }

        let stored = self.store.update_conditionally(next, current.version).await?;
        Ok((stored, from, effects))
    }

    fn run_effects(&self, stored: &BookingRequest, effects: Effects) {
        if let Some(job_id) = effects.cancel_job
            && self.scheduler.cancel(job_id)
        {
            info!(request_id = %stored.request_id, job_id = %job_id, "cancelled queued job");
        }
        if let Some(job) = effects.retry_job {
            info!(
                request_id = %stored.request_id,
                job_id = %job.job_id,
                attempt = stored.retry_count,
                retry_at = %job.scheduled_time,
                "retry scheduled"
            );
            self.scheduler.enqueue(job);
        }
        if let Some(kind) = effects.notify {
            self.notifier
                .notify(stored.request_id, kind, NotificationContext::from(stored));
        }
    }

    /// Route an executor result into CONFIRMED or FAILED. An outcome for a request that
    /// left PROCESSING meanwhile (a user cancelled it) is logged and dropped.
    pub async fn record_outcome(
        &self,
        id: Ulid,
        outcome: ExecutionOutcome,
    ) -> Result<BookingRequest, BookingError> {
        let (to, ctx) = if outcome.success {
            (
                BookingStatus::Confirmed,
                TransitionContext {
                    confirmation_code: outcome.confirmation_code,
                    external_booking_id: outcome.external_booking_id,
                    ..TransitionContext::default()
                },
            )
        } else {
            (
                BookingStatus::Failed,
                TransitionContext::failure(
                    outcome
                        .error_message
                        .unwrap_or_else(|| "booking attempt failed".into()),
                ),
            )
        };

        let current = self.load(id).await?;
        if current.status != BookingStatus::Processing {
            info!(request_id = %id, status = %current.status, outcome = %to, "late outcome ignored");
            return Ok(current);
        }
        match self.transition(id, to, ctx).await {
            Err(BookingError::InvalidTransition { from, .. }) => {
                info!(request_id = %id, status = %from, outcome = %to, "late outcome ignored");
                self.load(id).await
            }
            other => other,
        }
    }
}
