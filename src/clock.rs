use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Local, NaiveDate, NaiveTime, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;

pub use mockable::{Clock, DefaultClock};

use crate::model::Ts;

pub type SharedClock = Arc<dyn Clock + Send + Sync>;

pub fn system_clock() -> SharedClock {
    Arc::new(DefaultClock)
}

/// Calendar date of `now` in the courts' time zone.
pub fn local_date(now: Ts, tz: Tz) -> NaiveDate {
    now.with_timezone(&tz).date_naive()
}

/// First instant of `date` in `tz`, as UTC. A midnight swallowed by a DST gap
/// resolves to the first valid local instant after it.
pub fn midnight(date: NaiveDate, tz: Tz) -> Ts {
    let naive = date.and_time(NaiveTime::MIN);
    tz.from_local_datetime(&naive)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(naive + TimeDelta::hours(1))).earliest())
        .map(|local| local.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
}

/// Hand-driven clock for tests and simulations.
pub struct ManualClock(Mutex<DateTime<Utc>>);

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self(Mutex::new(now))
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.lock() = now;
    }

    pub fn advance(&self, delta: TimeDelta) {
        *self.lock() += delta;
    }

    fn lock(&self) -> MutexGuard<'_, DateTime<Utc>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Clock for ManualClock {
    fn local(&self) -> DateTime<Local> {
        self.utc().with_timezone(&Local)
    }

    fn utc(&self) -> DateTime<Utc> {
        *self.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        clock.advance(TimeDelta::minutes(90));
        assert_eq!(clock.utc(), start + TimeDelta::minutes(90));
    }

    #[test]
    fn local_date_respects_zone() {
        // 23:30 UTC is already the next day in Madrid.
        let now = Utc.with_ymd_and_hms(2026, 6, 10, 23, 30, 0).unwrap();
        assert_eq!(local_date(now, chrono_tz::UTC), NaiveDate::from_ymd_opt(2026, 6, 10).unwrap());
        assert_eq!(
            local_date(now, chrono_tz::Europe::Madrid),
            NaiveDate::from_ymd_opt(2026, 6, 11).unwrap()
        );
    }

    #[test]
    fn midnight_in_zone_converts_to_utc() {
        let date = NaiveDate::from_ymd_opt(2026, 6, 11).unwrap();
        assert_eq!(
            midnight(date, chrono_tz::Europe::Madrid),
            Utc.with_ymd_and_hms(2026, 6, 10, 22, 0, 0).unwrap()
        );
        assert_eq!(
            midnight(date, chrono_tz::UTC),
            Utc.with_ymd_and_hms(2026, 6, 11, 0, 0, 0).unwrap()
        );
    }
}
