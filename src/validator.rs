use std::sync::Arc;

use chrono::{Days, NaiveDate};
use chrono_tz::Tz;

use crate::availability::AvailabilityCalculator;
use crate::clock::{local_date, midnight, SharedClock};
use crate::config::Config;
use crate::error::BookingError;
use crate::limits::{MAX_NOTES_LEN, MAX_RETRIES_CEILING, MAX_USER_ID_LEN};
use crate::model::{BookingCandidate, Rejection, TimeSlot, ValidationResult};
use crate::store::BookingStore;

fn long_date(date: NaiveDate) -> String {
    date.format("%B %d, %Y").to_string()
}

/// Classifies a candidate as bookable now, schedulable for tonight, or rejected.
/// Reads the store, never writes it.
pub struct BookingValidator {
    calculator: AvailabilityCalculator,
    store: Arc<dyn BookingStore>,
    clock: SharedClock,
    timezone: Tz,
    max_daily_bookings: usize,
    known_courts_only: bool,
}

impl BookingValidator {
    pub fn new(config: &Config, store: Arc<dyn BookingStore>, clock: SharedClock) -> Self {
        Self {
            calculator: AvailabilityCalculator::new(
                config.court_windows.clone(),
                config.default_window_days,
            ),
            store,
            clock,
            timezone: config.timezone,
            max_daily_bookings: config.max_daily_bookings,
            known_courts_only: config.known_courts_only,
        }
    }

    pub fn calculator(&self) -> &AvailabilityCalculator {
        &self.calculator
    }

    pub fn today(&self) -> NaiveDate {
        local_date(self.clock.utc(), self.timezone)
    }

    /// Input checks that need no store access. Returns the parsed slot.
    pub fn check_shape(
        &self,
        candidate: &BookingCandidate,
        user_id: &str,
        today: NaiveDate,
    ) -> Result<TimeSlot, BookingError> {
        if user_id.trim().is_empty() || user_id.len() > MAX_USER_ID_LEN {
            return Err(BookingError::Validation(format!(
                "user id must be 1 to {MAX_USER_ID_LEN} characters"
            )));
        }
        if candidate.resource_id == 0
            || (self.known_courts_only && !self.calculator.is_configured(candidate.resource_id))
        {
            return Err(BookingError::Validation(format!(
                "unknown court {}",
                candidate.resource_id
            )));
        }
        if candidate.notes.as_ref().is_some_and(|n| n.len() > MAX_NOTES_LEN) {
            return Err(BookingError::Validation(format!(
                "notes must be at most {MAX_NOTES_LEN} characters"
            )));
        }
        if candidate.max_retries.is_some_and(|n| n > MAX_RETRIES_CEILING) {
            return Err(BookingError::Validation(format!(
                "max retries must be at most {MAX_RETRIES_CEILING}"
            )));
        }
        let slot = TimeSlot::parse(&candidate.time_slot)?;
        if candidate.booking_date <= today {
            return Err(BookingError::Validation(
                "Booking date must be in the future".into(),
            ));
        }
        Ok(slot)
    }

    pub async fn validate(
        &self,
        candidate: &BookingCandidate,
        user_id: &str,
    ) -> Result<ValidationResult, BookingError> {
        let today = self.today();
        let court = candidate.resource_id;
        let date = candidate.booking_date;
        let window_days = self.calculator.window_days(court);

        let is_available_now = self.calculator.is_in_window(court, today, date);
        let tomorrow = today
            .checked_add_days(Days::new(1))
            .ok_or_else(|| BookingError::Validation("date out of range".into()))?;
        let is_schedulable = !is_available_now && self.calculator.is_in_window(court, tomorrow, date);
        let days_ahead = (date - today).num_days();
        let available_at = (is_schedulable && days_ahead == i64::from(window_days))
            .then(|| midnight(tomorrow, self.timezone));

        let rejected = |rejection: Rejection, reason: String| ValidationResult {
            is_valid: false,
            is_available_now,
            is_schedulable,
            available_at,
            reason,
            window_days,
            rejection: Some(rejection),
        };

        let slot = match self.check_shape(candidate, user_id, today) {
            Ok(slot) => slot,
            Err(BookingError::Validation(reason)) => return Ok(rejected(Rejection::Shape, reason)),
            Err(e) => return Err(e),
        };

        let on_date = self.store.query_user_bookings_on_date(user_id, date).await?;
        if on_date.len() >= self.max_daily_bookings {
            return Ok(rejected(
                Rejection::Quota,
                format!(
                    "You have reached the maximum of {} bookings per day",
                    self.max_daily_bookings
                ),
            ));
        }

        let conflicts = self.store.query_conflicts(court, date, &slot).await?;
        if !conflicts.is_empty() {
            return Ok(rejected(
                Rejection::Conflict,
                format!(
                    "Court {court} is already booked at {slot} on {}",
                    long_date(date)
                ),
            ));
        }

        if is_available_now {
            return Ok(ValidationResult {
                is_valid: true,
                is_available_now,
                is_schedulable,
                available_at,
                reason: format!("Court {court} is available for booking on {}", long_date(date)),
                window_days,
                rejection: None,
            });
        }

        if is_schedulable {
            return Ok(ValidationResult {
                is_valid: true,
                is_available_now,
                is_schedulable,
                available_at,
                reason: format!(
                    "Court {court} bookings for {} aren't open yet. Your request is scheduled and will be attempted after midnight on {}.",
                    long_date(date),
                    long_date(tomorrow)
                ),
                window_days,
                rejection: None,
            });
        }

        Ok(rejected(
            Rejection::OutsideWindow,
            format!(
                "Court {court} only allows bookings {window_days} days in advance. Please choose a date within the next {window_days} days."
            ),
        ))
    }
}
