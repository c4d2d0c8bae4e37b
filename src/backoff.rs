use chrono::TimeDelta;

/// Exponential backoff shared by request retries and job retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: TimeDelta,
    pub cap: TimeDelta,
}

impl Backoff {
    pub fn new(base: TimeDelta, cap: TimeDelta) -> Self {
        Self { base, cap: cap.max(base) }
    }

    /// `min(base × 2^attempt, cap)`, saturating instead of overflowing.
    pub fn delay(&self, attempt: u32) -> TimeDelta {
        let factor = 1i32.checked_shl(attempt).filter(|f| *f > 0);
        factor
            .and_then(|f| self.base.checked_mul(f))
            .map_or(self.cap, |d| d.min(self.cap))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(TimeDelta::minutes(5), TimeDelta::hours(1))
    }
}
