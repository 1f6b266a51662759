//! Cron schedules and processing budget derivation.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

use sweep_core::defaults::SHORT_INTERVAL_TIMEOUT_RATIO;
use sweep_core::{Error, Result};

/// A parsed cron expression.
///
/// Accepts the classic 5-field form (minute precision, a `0` seconds field is
/// prepended) as well as 6- and 7-field expressions with seconds and year.
/// Numeric weekdays in the 5-field form count from Sunday as `0` (or `7`)
/// and are rewritten to names; 6- and 7-field expressions use the `cron`
/// crate's own numbering, so named weekdays are the portable choice there.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: cron::Schedule,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let fields = expression.split_whitespace().count();
        let normalized = match fields {
            5 => {
                let parts: Vec<&str> = expression.split_whitespace().collect();
                let weekdays = translate_weekdays(parts[4])
                    .map_err(|e| Error::Schedule(format!("{e} in {expression:?}")))?;
                format!("0 {} {weekdays}", parts[..4].join(" "))
            }
            6 | 7 => expression.trim().to_string(),
            n => {
                return Err(Error::Schedule(format!(
                    "expected 5, 6 or 7 fields in {expression:?}, found {n}"
                )))
            }
        };
        let schedule = cron::Schedule::from_str(&normalized)
            .map_err(|e| Error::Schedule(format!("invalid cron expression {expression:?}: {e}")))?;
        Ok(Self {
            expression: expression.trim().to_string(),
            schedule,
        })
    }

    /// The expression as configured.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First firing strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// Gap between the next two firings after `after`.
    pub fn interval_after(&self, after: DateTime<Utc>) -> Result<Duration> {
        let mut upcoming = self.schedule.after(&after);
        let (Some(first), Some(second)) = (upcoming.next(), upcoming.next()) else {
            return Err(Error::Schedule(format!(
                "{:?} does not fire twice after {after}",
                self.expression
            )));
        };
        (second - first)
            .to_std()
            .map_err(|e| Error::Schedule(format!("negative cron interval: {e}")))
    }

    /// Processing budget for a run starting now.
    pub fn processing_timeout(&self, buffer: Duration) -> Result<Duration> {
        self.processing_timeout_at(Utc::now(), buffer)
    }

    pub fn processing_timeout_at(&self, now: DateTime<Utc>, buffer: Duration) -> Result<Duration> {
        let interval = self.interval_after(now)?;
        let timeout = derive_timeout(interval, buffer);
        if interval <= buffer {
            warn!(
                subsystem = "jobs",
                component = "schedule",
                schedule = %self.expression,
                interval_secs = interval.as_secs(),
                buffer_secs = buffer.as_secs(),
                timeout_secs = timeout.as_secs(),
                "Cron interval shorter than timeout buffer, using fraction of interval"
            );
        }
        Ok(timeout)
    }
}

const WEEKDAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// Rewrite numeric day-of-week terms (`0`-`7`, ranges, lists, steps) to
/// names. Wildcards and named terms pass through unchanged.
fn translate_weekdays(field: &str) -> std::result::Result<String, String> {
    let mut days = [false; 7];
    let mut kept = Vec::new();

    for term in field.split(',') {
        if !term.starts_with(|c: char| c.is_ascii_digit()) {
            kept.push(term.to_string());
            continue;
        }
        let (range, step) = match term.split_once('/') {
            Some((range, step)) => (range, Some(step)),
            None => (term, None),
        };
        let (lo, hi) = match range.split_once('-') {
            Some((lo, hi)) => (weekday_number(lo)?, weekday_number(hi)?),
            None => {
                let lo = weekday_number(range)?;
                (lo, if step.is_some() { 6 } else { lo })
            }
        };
        let step = match step {
            Some(step) => step
                .parse::<usize>()
                .ok()
                .filter(|s| *s > 0)
                .ok_or_else(|| format!("invalid weekday step {step:?}"))?,
            None => 1,
        };
        if lo > hi {
            return Err(format!("weekday range {range:?} runs backwards"));
        }
        for day in (lo..=hi).step_by(step) {
            days[day % 7] = true;
        }
    }

    let names = days
        .iter()
        .zip(WEEKDAY_NAMES)
        .filter(|(set, _)| **set)
        .map(|(_, name)| name.to_string());
    Ok(names.chain(kept).collect::<Vec<_>>().join(","))
}

fn weekday_number(value: &str) -> std::result::Result<usize, String> {
    value
        .parse::<usize>()
        .ok()
        .filter(|d| *d <= 7)
        .ok_or_else(|| format!("invalid weekday {value:?}"))
}

/// `interval - buffer`, or a fixed fraction of `interval` when the buffer
/// would leave nothing.
pub fn derive_timeout(interval: Duration, buffer: Duration) -> Duration {
    if interval > buffer {
        interval - buffer
    } else {
        let millis = (interval.as_millis() as f64 * SHORT_INTERVAL_TIMEOUT_RATIO).round();
        Duration::from_millis(millis as u64)
    }
}
