use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::BookingError;

/// Wall-clock instant. All persisted timestamps are UTC.
pub type Ts = DateTime<Utc>;

/// Court number as the provider knows it.
pub type ResourceId = u32;

// ── Booking status ───────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Scheduled,
    Processing,
    Confirmed,
    Failed,
    Cancelled,
    Expired,
}

impl BookingStatus {
    pub const ALL: [BookingStatus; 7] = [
        BookingStatus::Pending,
        BookingStatus::Scheduled,
        BookingStatus::Processing,
        BookingStatus::Confirmed,
        BookingStatus::Failed,
        BookingStatus::Cancelled,
        BookingStatus::Expired,
    ];

    /// The single source of truth for legal lifecycle moves.
    pub fn allowed_transitions(self) -> &'static [BookingStatus] {
        use BookingStatus::*;
        match self {
            Pending => &[Processing, Cancelled, Failed],
            Scheduled => &[Processing, Cancelled, Expired],
            Processing => &[Confirmed, Failed, Cancelled],
            Failed => &[Processing],
            Confirmed => &[Cancelled],
            Cancelled | Expired => &[],
        }
    }

    pub fn can_transition_to(self, next: BookingStatus) -> bool {
        self.allowed_transitions().contains(&next)
    }

    /// CONFIRMED is terminal for the processing pipeline even though a user may still cancel it.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BookingStatus::Confirmed | BookingStatus::Cancelled | BookingStatus::Expired
        )
    }

    /// Statuses eligible for the long-retention purge.
    pub fn is_purgeable(self) -> bool {
        matches!(
            self,
            BookingStatus::Confirmed
                | BookingStatus::Cancelled
                | BookingStatus::Failed
                | BookingStatus::Expired
        )
    }

    /// Statuses that count against a user's daily quota.
    pub fn counts_toward_quota(self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Scheduled => "scheduled",
            BookingStatus::Processing => "processing",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Failed => "failed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = BookingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BookingStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| BookingError::Validation(format!("unknown booking status: {s}")))
    }
}

/// Higher priorities dispatch first within one poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

// ── Time slot ────────────────────────────────────────────

/// A validated `[start, end)` range within one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeSlot {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeSlot {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Result<Self, BookingError> {
        if end <= start {
            return Err(BookingError::Validation(
                "end time must be after start time".into(),
            ));
        }
        Ok(Self { start, end })
    }

    /// Accepts the provider form `De 08:00 AM a 09:00 AM` or the compact `08:00-09:00`.
    pub fn parse(raw: &str) -> Result<Self, BookingError> {
        let raw = raw.trim();
        let invalid = || {
            BookingError::Validation(format!(
                "time slot must look like 'De HH:MM AM a HH:MM PM' or 'HH:MM-HH:MM', got '{raw}'"
            ))
        };

        if let Some(rest) = raw.strip_prefix("De ") {
            let (start, end) = rest.split_once(" a ").ok_or_else(invalid)?;
            let start = NaiveTime::parse_from_str(start.trim(), "%I:%M %p").map_err(|_| invalid())?;
            let end = NaiveTime::parse_from_str(end.trim(), "%I:%M %p").map_err(|_| invalid())?;
            return Self::new(start, end);
        }

        let (start, end) = raw.split_once('-').ok_or_else(invalid)?;
        let start = NaiveTime::parse_from_str(start.trim(), "%H:%M").map_err(|_| invalid())?;
        let end = NaiveTime::parse_from_str(end.trim(), "%H:%M").map_err(|_| invalid())?;
        Self::new(start, end)
    }
}

impl fmt::Display for TimeSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "De {} a {}",
            self.start.format("%I:%M %p"),
            self.end.format("%I:%M %p")
        )
    }
}

// ── Booking request ──────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRequest {
    pub request_id: Ulid,
    pub user_id: String,
    pub resource_id: ResourceId,
    pub booking_date: NaiveDate,
    pub time_slot: TimeSlot,
    pub status: BookingStatus,
    pub priority: Priority,
    pub retry_count: u32,
    pub max_retries: u32,
    pub auto_retry: bool,
    pub notes: Option<String>,
    pub created_at: Ts,
    pub updated_at: Ts,
    pub requested_at: Ts,
    pub expires_at: Option<Ts>,
    pub confirmed_at: Option<Ts>,
    /// Next attempt instant: the window opening for a SCHEDULED request, the
    /// backoff retry time for a FAILED one. Outlives the in-memory job queue.
    pub scheduled_for: Option<Ts>,
    /// Deferred or retry job currently queued on behalf of this request.
    pub scheduled_job_id: Option<Ulid>,
    pub confirmation_code: Option<String>,
    pub error_message: Option<String>,
    pub external_booking_id: Option<String>,
    /// Bumped by every successful conditional write.
    pub version: u64,
}

impl BookingRequest {
    pub fn summary(&self) -> String {
        format!(
            "Court {} on {} at {}",
            self.resource_id, self.booking_date, self.time_slot
        )
    }

    pub fn can_retry(&self) -> bool {
        self.auto_retry && self.retry_count < self.max_retries
    }

    /// True when a SCHEDULED request's window has opened.
    pub fn is_due(&self, now: Ts) -> bool {
        self.status == BookingStatus::Scheduled && self.scheduled_for.is_some_and(|at| at <= now)
    }

    /// True when a FAILED request with budget left has reached its retry time.
    pub fn is_retry_due(&self, now: Ts) -> bool {
        self.status == BookingStatus::Failed
            && self.can_retry()
            && self.scheduled_for.is_some_and(|at| at <= now)
    }
}

/// Unvalidated booking input as the HTTP layer hands it over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingCandidate {
    pub resource_id: ResourceId,
    pub booking_date: NaiveDate,
    pub time_slot: String,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub auto_retry: Option<bool>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Why the validator refused a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rejection {
    Shape,
    Conflict,
    Quota,
    OutsideWindow,
}

impl Rejection {
    pub fn label(self) -> &'static str {
        match self {
            Rejection::Shape => "shape",
            Rejection::Conflict => "conflict",
            Rejection::Quota => "quota",
            Rejection::OutsideWindow => "window",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub is_available_now: bool,
    pub is_schedulable: bool,
    pub available_at: Option<Ts>,
    pub reason: String,
    pub window_days: u32,
    pub rejection: Option<Rejection>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingResponse {
    pub request_id: Ulid,
    pub status: BookingStatus,
    pub message: String,
    pub scheduled_for: Option<Ts>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceAvailability {
    pub resource_id: ResourceId,
    pub window_days: u32,
    pub available_dates: Vec<NaiveDate>,
    pub next_available_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityReport {
    pub current_date: NaiveDate,
    pub courts: Vec<ResourceAvailability>,
}

/// What the external executor reports back for one attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    #[serde(default)]
    pub confirmation_code: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub external_booking_id: Option<String>,
}

impl ExecutionOutcome {
    pub fn confirmed(code: impl Into<String>) -> Self {
        Self {
            success: true,
            confirmation_code: Some(code.into()),
            ..Self::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_message: Some(message.into()),
            ..Self::default()
        }
    }
}

// ── Scheduled jobs ───────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobType {
    DeferredBookingAttempt,
    RetryAttempt,
    PeriodicMaintenance,
}

impl JobType {
    pub fn as_str(self) -> &'static str {
        match self {
            JobType::DeferredBookingAttempt => "deferred_booking_attempt",
            JobType::RetryAttempt => "retry_attempt",
            JobType::PeriodicMaintenance => "periodic_maintenance",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

pub const PAYLOAD_REQUEST_ID: &str = "request_id";
pub const PAYLOAD_USER_ID: &str = "user_id";
pub const PAYLOAD_TASK: &str = "task";

/// Opaque key/value payload interpreted by the job's handler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload(pub BTreeMap<String, String>);

impl JobPayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_request(request: &BookingRequest) -> Self {
        Self::new()
            .with(PAYLOAD_REQUEST_ID, request.request_id.to_string())
            .with(PAYLOAD_USER_ID, request.user_id.clone())
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn request_id(&self) -> Option<Ulid> {
        self.get(PAYLOAD_REQUEST_ID).and_then(|s| Ulid::from_string(s).ok())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub job_id: Ulid,
    pub job_type: JobType,
    pub scheduled_time: Ts,
    pub payload: JobPayload,
    pub status: JobStatus,
    pub created_at: Ts,
    pub started_at: Option<Ts>,
    pub completed_at: Option<Ts>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl ScheduledJob {
    pub fn new(job_type: JobType, scheduled_time: Ts, payload: JobPayload, now: Ts) -> Self {
        Self {
            job_id: Ulid::new(),
            job_type,
            scheduled_time,
            payload,
            status: JobStatus::Pending,
            created_at: now,
            started_at: None,
            completed_at: None,
            error_message: None,
            retry_count: 0,
            max_retries: crate::limits::DEFAULT_JOB_MAX_RETRIES,
        }
    }
}

// ── Journal records ──────────────────────────────────────

/// The journal record format. Flat, one variant per store mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RequestWritten(BookingRequest),
    RequestDeleted { id: Ulid },
}
