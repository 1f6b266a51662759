//! Environment configuration for cleanup jobs.

use std::time::Duration;

use tracing::warn;
use uuid::Uuid;

use sweep_core::defaults;
use sweep_core::{Error, JobConfig, JobType, Result};

use crate::lock::LockOptions;
use crate::runner::RunnerSettings;
use crate::schedule::CronSchedule;

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn parse_flag(value: Option<String>, default: bool) -> bool {
    value
        .map(|v| {
            let v = v.trim().to_ascii_lowercase();
            v != "false" && v != "0"
        })
        .unwrap_or(default)
}

/// Per-job-type settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSettings {
    pub job_type: JobType,
    pub enabled: bool,
    pub schedule: String,
    pub ttl_days: u32,
    /// Budget for manual runs. Scheduled runs derive theirs from the cron interval.
    pub timeout_minutes: u64,
    pub batch_size: i64,
    /// Zero disables the vacuum phase.
    pub vacuum_minutes: u64,
}

impl JobSettings {
    pub fn defaults_for(job_type: JobType) -> Self {
        let (schedule, ttl_days, batch_size, vacuum_minutes) = match job_type {
            JobType::Versions => (
                defaults::VERSIONS_SCHEDULE,
                defaults::VERSIONS_TTL_DAYS,
                defaults::VERSIONS_BATCH_SIZE,
                defaults::VERSIONS_VACUUM_MINUTES,
            ),
            JobType::Comparisons => (
                defaults::COMPARISONS_SCHEDULE,
                defaults::COMPARISONS_TTL_DAYS,
                defaults::COMPARISONS_BATCH_SIZE,
                defaults::COMPARISONS_VACUUM_MINUTES,
            ),
            JobType::SoftDeleted => (
                defaults::SOFT_DELETED_SCHEDULE,
                defaults::SOFT_DELETED_TTL_DAYS,
                defaults::SOFT_DELETED_BATCH_SIZE,
                defaults::SOFT_DELETED_VACUUM_MINUTES,
            ),
            JobType::Unreferenced => (
                defaults::UNREFERENCED_SCHEDULE,
                defaults::UNREFERENCED_TTL_DAYS,
                defaults::UNREFERENCED_BATCH_SIZE,
                defaults::UNREFERENCED_VACUUM_MINUTES,
            ),
        };
        Self {
            job_type,
            enabled: true,
            schedule: schedule.to_string(),
            ttl_days,
            timeout_minutes: defaults::JOB_TIMEOUT_MINUTES,
            batch_size,
            vacuum_minutes,
        }
    }

    /// Read `SWEEP_<JOB>_*` variables over the defaults.
    pub fn from_lookup<F>(job_type: JobType, lookup: &F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let base = Self::defaults_for(job_type);
        let var = |suffix: &str| lookup(&format!("SWEEP_{}_{suffix}", job_type.env_prefix()));

        Self {
            job_type,
            enabled: parse_flag(var("ENABLED"), base.enabled),
            schedule: var("SCHEDULE")
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or(base.schedule),
            ttl_days: parse_or(var("TTL_DAYS"), base.ttl_days).min(defaults::MAX_TTL_DAYS),
            timeout_minutes: parse_or(var("TIMEOUT_MINUTES"), base.timeout_minutes).max(1),
            batch_size: parse_or(var("BATCH_SIZE"), base.batch_size).max(1),
            vacuum_minutes: parse_or(var("VACUUM_MINUTES"), base.vacuum_minutes),
        }
    }

    pub fn cron(&self) -> Result<CronSchedule> {
        CronSchedule::parse(&self.schedule)
            .map_err(|e| Error::Config(format!("SWEEP_{}_SCHEDULE: {e}", self.job_type.env_prefix())))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_minutes.saturating_mul(60))
    }

    pub fn vacuum_timeout(&self) -> Duration {
        Duration::from_secs(self.vacuum_minutes.saturating_mul(60))
    }

    pub fn job_config(&self, instance_id: &str) -> JobConfig {
        JobConfig::new(self.job_type, instance_id, self.ttl_days).with_timeout(self.timeout())
    }
}

/// Process-wide cleanup configuration.
///
/// | Variable | Default | Description |
/// |----------|---------|-------------|
/// | `SWEEP_INSTANCE_ID` | `<HOSTNAME>-<random>` | Lock owner and run attribution |
/// | `SWEEP_LOCK_NAME` | `cleanup_jobs` | Lock shared by all job types |
/// | `SWEEP_LOCK_LEASE_SECS` | `60` | Lease length |
/// | `SWEEP_LOCK_HEARTBEAT_SECS` | `20` | Heartbeat interval |
/// | `SWEEP_CLOCK_SKEW_SECS` | `10` | Clock-skew margin |
/// | `SWEEP_RELEASE_TIMEOUT_SECS` | `10` | Release / final status budget |
/// | `SWEEP_TIMEOUT_BUFFER_MINUTES` | `60` | Subtracted from the cron interval |
/// | `SWEEP_CHECKPOINT_ITEMS` | `10000` | Deleted items between progress writes |
/// | `SWEEP_RUN_ONCE` | unset | Run one job type once and exit |
/// | `SWEEP_<JOB>_*` | per type | See [`JobSettings`] |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepConfig {
    pub instance_id: String,
    pub lock_name: String,
    pub lease_secs: u64,
    pub heartbeat_secs: u64,
    pub clock_skew_secs: u64,
    pub release_timeout_secs: u64,
    pub timeout_buffer_minutes: u64,
    pub checkpoint_items: i64,
    pub jobs: Vec<JobSettings>,
    pub run_once: Option<JobType>,
}

impl SweepConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Invalid numbers fall back to
    /// defaults; an invalid schedule or `SWEEP_RUN_ONCE` value is an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let instance_id = lookup("SWEEP_INSTANCE_ID")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| default_instance_id(lookup("HOSTNAME")));

        let run_once = match lookup("SWEEP_RUN_ONCE").filter(|s| !s.trim().is_empty()) {
            Some(value) => Some(value.parse::<JobType>()?),
            None => None,
        };

        let jobs: Vec<JobSettings> = JobType::ALL
            .iter()
            .map(|job_type| JobSettings::from_lookup(*job_type, &lookup))
            .collect();
        for job in jobs.iter().filter(|j| j.enabled) {
            job.cron()?;
        }

        let lease_secs =
            parse_or(lookup("SWEEP_LOCK_LEASE_SECS"), defaults::LOCK_LEASE_SECS).max(1);
        let config = Self {
            instance_id,
            lock_name: lookup("SWEEP_LOCK_NAME")
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| defaults::LOCK_NAME.to_string()),
            lease_secs,
            heartbeat_secs: parse_or(
                lookup("SWEEP_LOCK_HEARTBEAT_SECS"),
                defaults::LOCK_HEARTBEAT_SECS,
            )
            .clamp(1, lease_secs),
            clock_skew_secs: parse_or(lookup("SWEEP_CLOCK_SKEW_SECS"), defaults::CLOCK_SKEW_SECS),
            release_timeout_secs: parse_or(
                lookup("SWEEP_RELEASE_TIMEOUT_SECS"),
                defaults::RELEASE_TIMEOUT_SECS,
            )
            .max(1),
            timeout_buffer_minutes: parse_or(
                lookup("SWEEP_TIMEOUT_BUFFER_MINUTES"),
                defaults::TIMEOUT_BUFFER_MINUTES,
            ),
            checkpoint_items: parse_or(
                lookup("SWEEP_CHECKPOINT_ITEMS"),
                defaults::PROGRESS_CHECKPOINT_ITEMS,
            ),
            jobs,
            run_once,
        };
        config.check_heartbeat();
        Ok(config)
    }

    /// Whether a heartbeat can renew before another instance sees the lease
    /// as expired: `heartbeat + 2 * skew < lease`.
    pub fn heartbeat_fits_lease(&self) -> bool {
        self.heartbeat_secs
            .saturating_add(self.clock_skew_secs.saturating_mul(2))
            < self.lease_secs
    }

    fn check_heartbeat(&self) {
        if !self.heartbeat_fits_lease() {
            warn!(
                subsystem = "jobs",
                component = "config",
                lease_secs = self.lease_secs,
                heartbeat_secs = self.heartbeat_secs,
                clock_skew_secs = self.clock_skew_secs,
                "Heartbeat interval too long for lease and skew margin, lock may be lost between refreshes"
            );
        }
    }

    pub fn lock_options(&self) -> LockOptions {
        LockOptions {
            lease: Duration::from_secs(self.lease_secs),
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
            notify_on_loss: true,
        }
    }

    pub fn runner_settings(&self) -> RunnerSettings {
        RunnerSettings {
            lock_name: self.lock_name.clone(),
            lock: self.lock_options(),
            release_timeout: Duration::from_secs(self.release_timeout_secs),
        }
    }

    pub fn clock_skew(&self) -> Duration {
        Duration::from_secs(self.clock_skew_secs)
    }

    pub fn timeout_buffer(&self) -> Duration {
        Duration::from_secs(self.timeout_buffer_minutes.saturating_mul(60))
    }

    pub fn job(&self, job_type: JobType) -> Option<&JobSettings> {
        self.jobs.iter().find(|j| j.job_type == job_type)
    }

    pub fn enabled_jobs(&self) -> impl Iterator<Item = &JobSettings> {
        self.jobs.iter().filter(|j| j.enabled)
    }
}

fn default_instance_id(hostname: Option<String>) -> String {
    let host = hostname
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "sweep".to_string());
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{host}-{}", &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = SweepConfig::from_lookup(lookup(&[])).unwrap();

        assert!(config.instance_id.starts_with("sweep-"));
        assert_eq!(config.lock_name, "cleanup_jobs");
        assert_eq!(config.lease_secs, 60);
        assert_eq!(config.heartbeat_secs, 20);
        assert_eq!(config.clock_skew_secs, 10);
        assert_eq!(config.timeout_buffer(), Duration::from_secs(3600));
        assert_eq!(config.run_once, None);
        assert_eq!(config.enabled_jobs().count(), 4);
        assert!(config.heartbeat_fits_lease());

        let versions = config.job(JobType::Versions).unwrap();
        assert_eq!(versions.ttl_days, 90);
        assert_eq!(versions.vacuum_timeout(), Duration::from_secs(30 * 60));
        assert_eq!(
            config.job(JobType::Comparisons).unwrap().vacuum_timeout(),
            Duration::ZERO
        );
    }

    #[test]
    fn test_instance_id_from_hostname() {
        let config = SweepConfig::from_lookup(lookup(&[("HOSTNAME", "worker-3")])).unwrap();
        assert!(config.instance_id.starts_with("worker-3-"));
        assert_eq!(config.instance_id.len(), "worker-3-".len() + 8);

        let config = SweepConfig::from_lookup(lookup(&[("SWEEP_INSTANCE_ID", "fixed")])).unwrap();
        assert_eq!(config.instance_id, "fixed");
    }

    #[test]
    fn test_per_job_overrides() {
        let config = SweepConfig::from_lookup(lookup(&[
            ("SWEEP_SOFT_DELETED_TTL_DAYS", "14"),
            ("SWEEP_SOFT_DELETED_BATCH_SIZE", "25"),
            ("SWEEP_SOFT_DELETED_SCHEDULE", "*/15 * * * *"),
            ("SWEEP_UNREFERENCED_ENABLED", "false"),
            ("SWEEP_VERSIONS_TIMEOUT_MINUTES", "5"),
        ]))
        .unwrap();

        let soft = config.job(JobType::SoftDeleted).unwrap();
        assert_eq!(soft.ttl_days, 14);
        assert_eq!(soft.batch_size, 25);
        assert_eq!(soft.schedule, "*/15 * * * *");
        assert!(!config.job(JobType::Unreferenced).unwrap().enabled);
        assert_eq!(config.enabled_jobs().count(), 3);

        let job_config = config.job(JobType::Versions).unwrap().job_config("i-1");
        assert_eq!(job_config.timeout, Duration::from_secs(300));
        assert_eq!(job_config.ttl_days, 90);
    }

    #[test]
    fn test_invalid_numbers_fall_back_to_defaults() {
        let config = SweepConfig::from_lookup(lookup(&[
            ("SWEEP_LOCK_LEASE_SECS", "soon"),
            ("SWEEP_COMPARISONS_BATCH_SIZE", "-3"),
        ]))
        .unwrap();
        assert_eq!(config.lease_secs, 60);
        assert_eq!(config.job(JobType::Comparisons).unwrap().batch_size, 1);
    }

    #[test]
    fn test_invalid_schedule_is_config_error() {
        let err = SweepConfig::from_lookup(lookup(&[("SWEEP_VERSIONS_SCHEDULE", "every day")]))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)), "{err:?}");
    }

    #[test]
    fn test_invalid_schedule_ignored_when_disabled() {
        let config = SweepConfig::from_lookup(lookup(&[
            ("SWEEP_VERSIONS_SCHEDULE", "every day"),
            ("SWEEP_VERSIONS_ENABLED", "0"),
        ]));
        assert!(config.is_ok());
    }

    #[test]
    fn test_run_once() {
        let config = SweepConfig::from_lookup(lookup(&[("SWEEP_RUN_ONCE", "soft_deleted")])).unwrap();
        assert_eq!(config.run_once, Some(JobType::SoftDeleted));

        let err = SweepConfig::from_lookup(lookup(&[("SWEEP_RUN_ONCE", "everything")])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_heartbeat_sanity() {
        let config = SweepConfig::from_lookup(lookup(&[
            ("SWEEP_LOCK_LEASE_SECS", "30"),
            ("SWEEP_LOCK_HEARTBEAT_SECS", "25"),
        ]))
        .unwrap();
        assert!(!config.heartbeat_fits_lease());
    }

    #[test]
    fn test_ttl_capped() {
        let config = SweepConfig::from_lookup(lookup(&[(
            "SWEEP_VERSIONS_TTL_DAYS",
            "4294967295",
        )]))
        .unwrap();
        assert_eq!(
            config.job(JobType::Versions).unwrap().ttl_days,
            defaults::MAX_TTL_DAYS
        );
    }

    #[test]
    fn test_huge_values_saturate() {
        let max = u64::MAX.to_string();
        let config = SweepConfig::from_lookup(lookup(&[
            ("SWEEP_VERSIONS_TIMEOUT_MINUTES", max.as_str()),
            ("SWEEP_VERSIONS_VACUUM_MINUTES", max.as_str()),
            ("SWEEP_TIMEOUT_BUFFER_MINUTES", max.as_str()),
            ("SWEEP_LOCK_HEARTBEAT_SECS", max.as_str()),
            ("SWEEP_CLOCK_SKEW_SECS", max.as_str()),
        ]))
        .unwrap();

        let versions = config.job(JobType::Versions).unwrap();
        assert_eq!(versions.timeout(), Duration::from_secs(u64::MAX));
        assert_eq!(versions.vacuum_timeout(), Duration::from_secs(u64::MAX));
        assert_eq!(config.timeout_buffer(), Duration::from_secs(u64::MAX));
        assert_eq!(config.heartbeat_secs, config.lease_secs);
        assert!(!config.heartbeat_fits_lease());
    }

    #[test]
    fn test_runner_settings() {
        let config = SweepConfig::from_lookup(lookup(&[
            ("SWEEP_LOCK_NAME", "cleanup_eu"),
            ("SWEEP_RELEASE_TIMEOUT_SECS", "3"),
        ]))
        .unwrap();
        let settings = config.runner_settings();
        assert_eq!(settings.lock_name, "cleanup_eu");
        assert_eq!(settings.release_timeout, Duration::from_secs(3));
        assert_eq!(settings.lock.lease, Duration::from_secs(60));
    }
}
