use std::sync::Arc;

use chrono::TimeDelta;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{info, warn};
use ulid::Ulid;

use crate::clock::SharedClock;
use crate::config::Config;
use crate::error::BookingError;
use crate::lifecycle::{Lifecycle, TransitionContext};
use crate::limits::MAX_USER_REQUESTS_PAGE;
use crate::model::{
    AvailabilityReport, BookingCandidate, BookingRequest, BookingResponse, BookingStatus,
    JobPayload, JobType, Rejection, ScheduledJob, TimeSlot, ValidationResult,
};
use crate::observability::{REQUESTS_CREATED_TOTAL, REQUESTS_REJECTED_TOTAL};
use crate::scheduler::JobScheduler;
use crate::store::BookingStore;
use crate::validator::BookingValidator;

/// What the HTTP layer calls.
pub struct BookingService {
    validator: BookingValidator,
    lifecycle: Arc<Lifecycle>,
    store: Arc<dyn BookingStore>,
    scheduler: Arc<JobScheduler>,
    clock: SharedClock,
    default_max_retries: u32,
    expire_after: TimeDelta,
    /// Serializes quota check and insert per user.
    user_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl BookingService {
    pub fn new(config: &Config, lifecycle: Arc<Lifecycle>, clock: SharedClock) -> Self {
        let store = lifecycle.store().clone();
        Self {
            validator: BookingValidator::new(config, store.clone(), clock.clone()),
            scheduler: lifecycle.scheduler().clone(),
            lifecycle,
            store,
            clock,
            default_max_retries: config.max_retries,
            expire_after: config.expire_after,
            user_locks: DashMap::new(),
        }
    }

    fn user_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        self.user_locks.entry(user_id.to_string()).or_default().clone()
    }

    pub async fn validate_request(
        &self,
        candidate: &BookingCandidate,
        user_id: &str,
    ) -> Result<ValidationResult, BookingError> {
        self.validator.validate(candidate, user_id).await
    }

    /// Validate and persist. Rejected candidates leave no record behind.
    pub async fn create_request(
        &self,
        candidate: BookingCandidate,
        user_id: &str,
    ) -> Result<BookingResponse, BookingError> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;
        let validation = self.validator.validate(&candidate, user_id).await?;
        if !validation.is_valid {
            let rejection = validation.rejection.unwrap_or(Rejection::Shape);
            metrics::counter!(REQUESTS_REJECTED_TOTAL, "reason" => rejection.label()).increment(1);
            info!(user_id, court = candidate.resource_id, date = %candidate.booking_date, reason = rejection.label(), "booking request rejected");
            return Err(match rejection {
                Rejection::Shape => BookingError::Validation(validation.reason),
                Rejection::Conflict => BookingError::Conflict(validation.reason),
                Rejection::Quota => BookingError::QuotaExceeded(validation.reason),
                Rejection::OutsideWindow => BookingError::OutsideWindow(validation.reason),
            });
        }

        let now = self.clock.utc();
        let (status, scheduled_for) = if validation.is_available_now {
            (BookingStatus::Pending, None)
        } else {
            let at = validation.available_at.ok_or_else(|| {
                BookingError::OutsideWindow(format!(
                    "Court {} only allows bookings {} days in advance.",
                    candidate.resource_id, validation.window_days
                ))
            })?;
            (BookingStatus::Scheduled, Some(at))
        };

        let mut request = BookingRequest {
            request_id: Ulid::new(),
            user_id: user_id.to_string(),
            resource_id: candidate.resource_id,
            booking_date: candidate.booking_date,
            time_slot: TimeSlot::parse(&candidate.time_slot)?,
            status,
            priority: candidate.priority.unwrap_or_default(),
            retry_count: 0,
            max_retries: candidate.max_retries.unwrap_or(self.default_max_retries),
            auto_retry: candidate.auto_retry.unwrap_or(true),
            notes: candidate.notes,
            created_at: now,
            updated_at: now,
            requested_at: now,
            expires_at: Some(now + self.expire_after),
            confirmed_at: None,
            scheduled_for,
            scheduled_job_id: None,
            confirmation_code: None,
            error_message: None,
            external_booking_id: None,
            version: 0,
        };

        let deferred = scheduled_for.map(|at| {
            ScheduledJob::new(
                JobType::DeferredBookingAttempt,
                at,
                JobPayload::for_request(&request),
                now,
            )
        });
        request.scheduled_job_id = deferred.as_ref().map(|j| j.job_id);

        let stored = self.store.create(request).await?;
        if let Some(job) = deferred {
            self.scheduler.enqueue(job);
        }
        metrics::counter!(REQUESTS_CREATED_TOTAL, "status" => status.as_str()).increment(1);
        info!(
            request_id = %stored.request_id,
            user_id,
            status = %status,
            summary = %stored.summary(),
            "booking request created"
        );

        Ok(BookingResponse {
            request_id: stored.request_id,
            status,
            message: validation.reason,
            scheduled_for,
        })
    }

    /// Operator or HTTP status change. `message` doubles as the error text for FAILED.
    pub async fn update_status(
        &self,
        id: Ulid,
        status: BookingStatus,
        message: Option<String>,
    ) -> Result<BookingResponse, BookingError> {
        let ctx = TransitionContext {
            message: message.clone(),
            error_message: (status == BookingStatus::Failed).then(|| message.clone()).flatten(),
            ..TransitionContext::default()
        };
        let stored = self.lifecycle.transition(id, status, ctx).await?;
        Ok(BookingResponse {
            request_id: stored.request_id,
            status: stored.status,
            message: message.unwrap_or_else(|| format!("Status updated to {}", stored.status)),
            scheduled_for: stored.scheduled_for,
        })
    }

    /// User cancellation. False when the request is missing, owned by someone else,
    /// already past the point of cancelling, or a confirmed booking whose date has passed.
    pub async fn cancel(&self, id: Ulid, user_id: &str) -> Result<bool, BookingError> {
        let Some(request) = self.store.get(id).await? else {
            return Ok(false);
        };
        if request.user_id != user_id {
            warn!(request_id = %id, user_id, "cancel refused: not the owner");
            return Ok(false);
        }
        if !request.status.can_transition_to(BookingStatus::Cancelled) {
            return Ok(false);
        }
        if request.status == BookingStatus::Confirmed && request.booking_date < self.validator.today() {
            return Ok(false);
        }
        match self
            .lifecycle
            .transition(id, BookingStatus::Cancelled, TransitionContext::with_message("cancelled by user"))
            .await
        {
            Ok(_) => Ok(true),
            Err(BookingError::InvalidTransition { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn get_availability(&self) -> AvailabilityReport {
        let today = self.validator.today();
        let calculator = self.validator.calculator();
        AvailabilityReport {
            current_date: today,
            courts: calculator
                .resources()
                .map(|court| calculator.describe(court, today))
                .collect(),
        }
    }

    pub async fn get_request(&self, id: Ulid, user_id: &str) -> Result<BookingRequest, BookingError> {
        let request = self.store.get(id).await?.ok_or(BookingError::NotFound(id))?;
        if request.user_id != user_id {
            return Err(BookingError::Forbidden(id));
        }
        Ok(request)
    }

    /// Newest first.
    pub async fn user_requests(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<BookingRequest>, BookingError> {
        Ok(self
            .store
            .query_by_user(user_id, limit.min(MAX_USER_REQUESTS_PAGE), offset)
            .await?)
    }
}
