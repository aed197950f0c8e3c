//! Service configuration, read from `SLOTD_*` environment variables.
//!
//! A `.env` file in the working directory is honoured outside of tests.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;

use crate::dispatch::{DEFAULT_RECORD_RETENTION, RetryPolicy};
use crate::engine::{EngineSettings, LifecyclePolicy};
use crate::housekeeping::SweepSchedule;
use crate::model::{DAY_MS, HOUR_MS};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub tenants: Vec<String>,
    pub metrics_port: Option<u16>,
    pub compact_threshold: u64,
    pub engine: EngineSettings,
    pub schedule: SweepSchedule,
    pub retry: RetryPolicy,
    /// How long settled delivery records stay queryable.
    pub notification_retention: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let data_dir = lookup("SLOTD_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data"));

        let tenants: Vec<String> = lookup("SLOTD_TENANTS")
            .unwrap_or_else(|| "default".to_string())
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_owned)
            .collect();
        if tenants.is_empty() {
            return Err(ConfigError::InvalidValue(
                "SLOTD_TENANTS".into(),
                "no tenant names given".into(),
            ));
        }

        let timezone: Tz = parsed(&lookup, "SLOTD_TIMEZONE")?.unwrap_or(Tz::UTC);
        let metrics_port: Option<u16> = parsed(&lookup, "SLOTD_METRICS_PORT")?;
        let compact_threshold: u64 = parsed(&lookup, "SLOTD_COMPACT_THRESHOLD")?.unwrap_or(1000);

        let timeout_hours = positive(&lookup, "SLOTD_CONFIRMATION_TIMEOUT_HOURS", 12)?;
        let review_minutes = parsed::<u64>(&lookup, "SLOTD_REVIEW_DELAY_MINUTES")?.unwrap_or(60);
        let archive_days = positive(&lookup, "SLOTD_ARCHIVE_AFTER_DAYS", 365)?;
        let lifecycle = LifecyclePolicy {
            confirmation_timeout_ms: timeout_hours as i64 * HOUR_MS,
            review_delay: Duration::from_secs(review_minutes * 60),
            archive_after_ms: archive_days as i64 * DAY_MS,
        };

        let defaults = SweepSchedule::default();
        let secs = |var: &str, default: Duration| -> Result<Duration, ConfigError> {
            positive(&lookup, var, default.as_secs()).map(Duration::from_secs)
        };
        let schedule = SweepSchedule {
            confirmation_timeout: secs("SLOTD_TIMEOUT_SWEEP_SECS", defaults.confirmation_timeout)?,
            completion: secs("SLOTD_COMPLETION_SWEEP_SECS", defaults.completion)?,
            archival: secs("SLOTD_ARCHIVAL_SWEEP_SECS", defaults.archival)?,
            waiting_list: secs("SLOTD_WAITING_LIST_SWEEP_SECS", defaults.waiting_list)?,
            reminder: secs("SLOTD_REMINDER_SWEEP_SECS", defaults.reminder)?,
            review: secs("SLOTD_REVIEW_SWEEP_SECS", defaults.review)?,
        };

        let attempts = positive(&lookup, "SLOTD_NOTIFY_MAX_ATTEMPTS", 3)?;
        let retry = RetryPolicy::with_max_attempts(attempts as u32);
        let notification_retention = secs("SLOTD_NOTIFICATION_RETENTION_SECS", DEFAULT_RECORD_RETENTION)?;

        Ok(Self {
            data_dir,
            tenants,
            metrics_port,
            compact_threshold,
            engine: EngineSettings { timezone, lifecycle },
            schedule,
            retry,
            notification_retention,
        })
    }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, var: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue(var.to_string(), format!("'{raw}': {e}"))),
    }
}

fn positive(lookup: &impl Fn(&str) -> Option<String>, var: &str, default: u64) -> Result<u64, ConfigError> {
    match parsed::<u64>(lookup, var)? {
        Some(0) => Err(ConfigError::InvalidValue(var.to_string(), "must be greater than zero".into())),
        Some(v) if v > u32::MAX as u64 => {
            Err(ConfigError::InvalidValue(var.to_string(), "value too large".into()))
        }
        Some(v) => Ok(v),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.data_dir, PathBuf::from("./data"));
        assert_eq!(cfg.tenants, vec!["default".to_string()]);
        assert_eq!(cfg.metrics_port, None);
        assert_eq!(cfg.compact_threshold, 1000);
        assert_eq!(cfg.engine.timezone, Tz::UTC);
        assert_eq!(cfg.engine.lifecycle.confirmation_timeout_ms, 12 * HOUR_MS);
        assert_eq!(cfg.engine.lifecycle.review_delay, Duration::from_secs(3600));
        assert_eq!(cfg.engine.lifecycle.archive_after_ms, 365 * DAY_MS);
        assert_eq!(cfg.schedule.completion, Duration::from_secs(900));
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.schedule.review, Duration::from_secs(300));
        assert_eq!(cfg.notification_retention, Duration::from_secs(86_400));
    }

    #[test]
    fn overrides() {
        let cfg = config(&[
            ("SLOTD_TENANTS", " clinic_a, clinic_b ,,"),
            ("SLOTD_TIMEZONE", "Europe/Berlin"),
            ("SLOTD_METRICS_PORT", "9100"),
            ("SLOTD_CONFIRMATION_TIMEOUT_HOURS", "24"),
            ("SLOTD_REVIEW_DELAY_MINUTES", "0"),
            ("SLOTD_WAITING_LIST_SWEEP_SECS", "30"),
            ("SLOTD_NOTIFY_MAX_ATTEMPTS", "5"),
            ("SLOTD_NOTIFICATION_RETENTION_SECS", "600"),
        ])
        .unwrap();
        assert_eq!(cfg.tenants, vec!["clinic_a".to_string(), "clinic_b".to_string()]);
        assert_eq!(cfg.engine.timezone, chrono_tz::Europe::Berlin);
        assert_eq!(cfg.metrics_port, Some(9100));
        assert_eq!(cfg.engine.lifecycle.confirmation_timeout_ms, 24 * HOUR_MS);
        assert_eq!(cfg.engine.lifecycle.review_delay, Duration::ZERO);
        assert_eq!(cfg.schedule.waiting_list, Duration::from_secs(30));
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.notification_retention, Duration::from_secs(600));
    }

    #[test]
    fn rejects_bad_values() {
        for (var, value) in [
            ("SLOTD_TIMEZONE", "Mars/Olympus"),
            ("SLOTD_METRICS_PORT", "70000"),
            ("SLOTD_COMPLETION_SWEEP_SECS", "0"),
            ("SLOTD_NOTIFICATION_RETENTION_SECS", "soon"),
            ("SLOTD_ARCHIVE_AFTER_DAYS", "-1"),
            ("SLOTD_TENANTS", " , "),
        ] {
            match config(&[(var, value)]) {
                Err(ConfigError::InvalidValue(name, _)) => assert_eq!(name, var),
                Ok(_) => panic!("{var}={value} accepted"),
            }
        }
    }
}
