use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::TimeDelta;
use chrono_tz::Tz;

use crate::limits::DEFAULT_WINDOW_DAYS;
use crate::model::ResourceId;

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub timezone: Tz,
    /// Per-court `windowDays`.
    pub court_windows: BTreeMap<ResourceId, u32>,
    pub default_window_days: u32,
    /// Reject courts missing from `court_windows`.
    pub known_courts_only: bool,
    pub max_daily_bookings: usize,
    pub max_retries: u32,
    pub retry_base: TimeDelta,
    pub retry_cap: TimeDelta,
    pub scheduler_poll: Duration,
    pub processor_poll: Duration,
    pub max_concurrent: usize,
    pub expire_after: TimeDelta,
    pub retention: TimeDelta,
    pub job_retention: TimeDelta,
    pub maintenance_interval: TimeDelta,
    pub compact_threshold: u64,
    pub executor_cmd: String,
    pub executor_timeout: Duration,
    pub credentials_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            timezone: chrono_tz::UTC,
            court_windows: BTreeMap::from([(1, 10), (2, 9)]),
            default_window_days: DEFAULT_WINDOW_DAYS,
            known_courts_only: true,
            max_daily_bookings: 2,
            max_retries: 3,
            retry_base: TimeDelta::minutes(5),
            retry_cap: TimeDelta::hours(1),
            scheduler_poll: Duration::from_secs(30),
            processor_poll: Duration::from_secs(30),
            max_concurrent: 3,
            expire_after: TimeDelta::hours(24),
            retention: TimeDelta::days(30),
            job_retention: TimeDelta::hours(24),
            maintenance_interval: TimeDelta::hours(6),
            compact_threshold: 1000,
            executor_cmd: "./reserve".into(),
            executor_timeout: Duration::from_secs(120),
            credentials_file: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

/// Parse `1:10,2:9` into a court → window table. Malformed pairs are skipped.
pub fn parse_court_windows(raw: &str) -> BTreeMap<ResourceId, u32> {
    raw.split(',')
        .filter_map(|pair| {
            let (court, days) = pair.split_once(':')?;
            Some((court.trim().parse().ok()?, days.trim().parse().ok()?))
        })
        .filter(|(_, days): &(ResourceId, u32)| *days > 0)
        .collect()
}

impl Config {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            data_dir: std::env::var("COURTSIDE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.data_dir),
            metrics_port: env_parse("COURTSIDE_METRICS_PORT"),
            timezone: env_parse("COURTSIDE_TIMEZONE").unwrap_or(d.timezone),
            court_windows: std::env::var("COURTSIDE_COURT_WINDOWS")
                .map(|raw| parse_court_windows(&raw))
                .unwrap_or(d.court_windows),
            default_window_days: env_parse("COURTSIDE_DEFAULT_WINDOW_DAYS")
                .unwrap_or(d.default_window_days),
            known_courts_only: env_parse("COURTSIDE_KNOWN_COURTS_ONLY")
                .unwrap_or(d.known_courts_only),
            max_daily_bookings: env_parse("COURTSIDE_MAX_DAILY_BOOKINGS")
                .unwrap_or(d.max_daily_bookings),
            max_retries: env_parse("COURTSIDE_MAX_RETRIES").unwrap_or(d.max_retries),
            retry_base: env_parse("COURTSIDE_RETRY_BASE_SECS")
                .map(TimeDelta::seconds)
                .unwrap_or(d.retry_base),
            retry_cap: env_parse("COURTSIDE_RETRY_CAP_SECS")
                .map(TimeDelta::seconds)
                .unwrap_or(d.retry_cap),
            scheduler_poll: env_parse("COURTSIDE_SCHEDULER_POLL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.scheduler_poll),
            processor_poll: env_parse("COURTSIDE_PROCESSOR_POLL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.processor_poll),
            max_concurrent: env_parse::<usize>("COURTSIDE_MAX_CONCURRENT")
                .map(|n| n.max(1))
                .unwrap_or(d.max_concurrent),
            expire_after: env_parse("COURTSIDE_EXPIRE_AFTER_HOURS")
                .map(TimeDelta::hours)
                .unwrap_or(d.expire_after),
            retention: env_parse("COURTSIDE_RETENTION_DAYS")
                .map(TimeDelta::days)
                .unwrap_or(d.retention),
            job_retention: env_parse("COURTSIDE_JOB_RETENTION_HOURS")
                .map(TimeDelta::hours)
                .unwrap_or(d.job_retention),
            maintenance_interval: env_parse("COURTSIDE_MAINTENANCE_INTERVAL_SECS")
                .map(TimeDelta::seconds)
                .unwrap_or(d.maintenance_interval),
            compact_threshold: env_parse("COURTSIDE_COMPACT_THRESHOLD")
                .unwrap_or(d.compact_threshold),
            executor_cmd: std::env::var("COURTSIDE_EXECUTOR_CMD").unwrap_or(d.executor_cmd),
            executor_timeout: env_parse("COURTSIDE_EXECUTOR_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.executor_timeout),
            credentials_file: std::env::var("COURTSIDE_CREDENTIALS_FILE")
                .ok()
                .map(PathBuf::from),
        }
    }

    pub fn journal_path(&self) -> PathBuf {
        self.data_dir.join("bookings.wal")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn court_windows_parse() {
        let windows = parse_court_windows("1:10, 2:9,3:14");
        assert_eq!(windows, BTreeMap::from([(1, 10), (2, 9), (3, 14)]));
    }

    #[test]
    fn court_windows_skip_malformed_pairs() {
        let windows = parse_court_windows("1:10,x:3,4,5:0,6:abc,7:7");
        assert_eq!(windows, BTreeMap::from([(1, 10), (7, 7)]));
    }

    #[test]
    fn defaults_match_documented_values() {
        let c = Config::default();
        assert_eq!(c.retry_base, TimeDelta::minutes(5));
        assert_eq!(c.retry_cap, TimeDelta::hours(1));
        assert_eq!(c.max_concurrent, 3);
        assert_eq!(c.court_windows.get(&1), Some(&10));
        assert_eq!(c.journal_path(), PathBuf::from("./data/bookings.wal"));
    }
}
