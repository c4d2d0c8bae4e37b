use std::collections::BTreeMap;

use chrono::{Days, NaiveDate};

use crate::limits::MAX_WINDOW_DAYS;
use crate::model::{ResourceAvailability, ResourceId};

// ── Availability Calculator ──────────────────────────────

/// Maps a court and a reference date to the dates bookable from that date.
/// Pure: no clock, no I/O.
#[derive(Debug, Clone)]
pub struct AvailabilityCalculator {
    windows: BTreeMap<ResourceId, u32>,
    default_window: u32,
}

impl AvailabilityCalculator {
    pub fn new(windows: BTreeMap<ResourceId, u32>, default_window: u32) -> Self {
        let clamp = |days: u32| days.clamp(1, MAX_WINDOW_DAYS);
        Self {
            windows: windows.into_iter().map(|(id, days)| (id, clamp(days))).collect(),
            default_window: clamp(default_window),
        }
    }

    pub fn window_days(&self, resource_id: ResourceId) -> u32 {
        self.windows
            .get(&resource_id)
            .copied()
            .unwrap_or(self.default_window)
    }

    pub fn is_configured(&self, resource_id: ResourceId) -> bool {
        self.windows.contains_key(&resource_id)
    }

    pub fn resources(&self) -> impl Iterator<Item = ResourceId> + '_ {
        self.windows.keys().copied()
    }

    /// `window_days` consecutive dates starting at `from` inclusive.
    pub fn available_dates(&self, resource_id: ResourceId, from: NaiveDate) -> Vec<NaiveDate> {
        from.iter_days()
            .take(self.window_days(resource_id) as usize)
            .collect()
    }

    /// O(1) membership test equivalent to `available_dates(..).contains(&date)`.
    pub fn is_in_window(&self, resource_id: ResourceId, from: NaiveDate, date: NaiveDate) -> bool {
        let days_ahead = (date - from).num_days();
        days_ahead >= 0 && days_ahead < i64::from(self.window_days(resource_id))
    }

    pub fn describe(&self, resource_id: ResourceId, today: NaiveDate) -> ResourceAvailability {
        let tomorrow = today.checked_add_days(Days::new(1));
        ResourceAvailability {
            resource_id,
            window_days: self.window_days(resource_id),
            available_dates: self.available_dates(resource_id, today),
            next_available_date: tomorrow
                .and_then(|t| self.available_dates(resource_id, t).last().copied()),
        }
    }
}
