//! Recurring notification rules and their due predicate.
//!
//! All rules are evaluated against instants in the household time zone.
//! The timer itself lives in the notifier; this module only answers
//! "is this rule due at T?" and "when does it fire next after T?".

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDateTime, NaiveTime, TimeDelta, TimeZone, Timelike, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Deserializer};

/// Width of the window in which a rule counts as due.
pub const TICK_RESOLUTION_SECS: i64 = 60;

/// What a notification is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topic {
    Trash,
    Paper,
    Recycling,
    Finances,
    DeploymentTest,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Trash => "trash",
            Topic::Paper => "paper",
            Topic::Recycling => "recycling",
            Topic::Finances => "finances",
            Topic::DeploymentTest => "deployment-test",
        }
    }

    /// Body used when a rule does not override it.
    pub fn default_body(&self) -> &'static str {
        match self {
            Topic::Trash => "Morn isch Mülltag.",
            Topic::Paper => "Morn isch Karton-Recycling Tag.",
            Topic::Recycling => "Bitte denk an das Recycling.",
            Topic::Finances => {
                "Ryan sollte die Finanzen regeln. Überprüfe Splitwise auf ausstehende Beträge."
            }
            Topic::DeploymentTest => "Test-Benachrichtigung vom neuen Deployment.",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When a rule fires. Times are wall-clock times in the household zone.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// On each listed weekday at `time`.
    WeekdaysAt { days: Vec<Weekday>, time: NaiveTime },
    /// At `anchor` and every `period` after it, counted in absolute time.
    RepeatingInterval {
        #[serde(rename = "period_secs", deserialize_with = "period_from_secs")]
        period: TimeDelta,
        anchor: NaiveDateTime,
    },
    /// On day `day` of every month at `time`. Months without that day are skipped.
    MonthlyOnDay { day: u32, time: NaiveTime },
}

fn period_from_secs<'de, D: Deserializer<'de>>(deserializer: D) -> Result<TimeDelta, D::Error> {
    let secs = i64::deserialize(deserializer)?;
    TimeDelta::try_seconds(secs)
        .ok_or_else(|| serde::de::Error::custom(format!("period of {secs}s is out of range")))
}

impl Schedule {
    /// Seven-field cron expression (sec min hour dom month dow year) for
    /// calendar based schedules. Repeating intervals have no cron form.
    pub fn cron_expression(&self) -> Option<String> {
        match self {
            Schedule::WeekdaysAt { days, time } => {
                let days: Vec<String> = days.iter().map(|d| d.to_string()).collect();
                Some(format!(
                    "{} {} {} * * {} *",
                    time.second(),
                    time.minute(),
                    time.hour(),
                    days.join(",")
                ))
            }
            Schedule::MonthlyOnDay { day, time } => Some(format!(
                "{} {} {} {} * * *",
                time.second(),
                time.minute(),
                time.hour(),
                day
            )),
            Schedule::RepeatingInterval { .. } => None,
        }
    }
}

/// A recurring notification bound to one topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationRule {
    pub topic: Topic,
    pub schedule: Schedule,
    pub body: String,
}

impl NotificationRule {
    pub fn new(topic: Topic, schedule: Schedule) -> Self {
        Self { topic, schedule, body: topic.default_body().to_string() }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Whether the rule is due at `at`, interpreted in `at`'s own zone.
    pub fn is_due(&self, at: &DateTime<Tz>) -> bool {
        match &self.schedule {
            Schedule::WeekdaysAt { days, time } => {
                days.contains(&at.weekday()) && same_minute(at.time(), *time)
            }
            Schedule::RepeatingInterval { period, anchor } => {
                let Some(anchor) = resolve_local(&at.timezone(), anchor) else {
                    return false;
                };
                let period = period.num_seconds();
                let elapsed = at.signed_duration_since(anchor).num_seconds();
                period > 0 && elapsed >= 0 && elapsed % period < TICK_RESOLUTION_SECS
            }
            Schedule::MonthlyOnDay { day, time } => at.day() == *day && same_minute(at.time(), *time),
        }
    }

    /// First due instant strictly after `after`, or `None` if the rule can never fire.
    pub fn next_fire_after(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        match &self.schedule {
            Schedule::RepeatingInterval { period, anchor } => {
                let anchor = resolve_local(&after.timezone(), anchor)?;
                if *after < anchor {
                    return Some(anchor);
                }
                let period = period.num_seconds();
                if period <= 0 {
                    return None;
                }
                let elapsed = after.signed_duration_since(anchor).num_seconds();
                let cycles = elapsed / period + 1;
                Some(anchor + TimeDelta::seconds(period * cycles))
            }
            schedule => {
                let expr = schedule.cron_expression()?;
                let cron = cron::Schedule::from_str(&expr).ok()?;
                cron.after(after).next()
            }
        }
    }
}

fn same_minute(a: NaiveTime, b: NaiveTime) -> bool {
    a.hour() == b.hour() && a.minute() == b.minute()
}

/// Map a wall-clock time to an instant. Times skipped by a DST jump resolve to nothing.
pub fn resolve_local(tz: &Tz, local: &NaiveDateTime) -> Option<DateTime<Tz>> {
    tz.from_local_datetime(local).earliest()
}

/// The household's standing reminders.
pub fn household_rules() -> Vec<NotificationRule> {
    let at = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap_or_default();
    let paper_anchor = chrono::NaiveDate::from_ymd_opt(2021, 10, 12)
        .and_then(|d| d.and_hms_opt(20, 30, 0))
        .unwrap_or_default();

    vec![
        NotificationRule::new(
            Topic::Trash,
            Schedule::WeekdaysAt { days: vec![Weekday::Wed, Weekday::Sun], time: at(20, 45) },
        ),
        NotificationRule::new(
            Topic::Paper,
            Schedule::RepeatingInterval { period: TimeDelta::weeks(2), anchor: paper_anchor },
        ),
        NotificationRule::new(
            Topic::Recycling,
            Schedule::WeekdaysAt { days: vec![Weekday::Thu], time: at(11, 0) },
        ),
        NotificationRule::new(Topic::Finances, Schedule::MonthlyOnDay { day: 7, time: at(17, 0) }),
    ]
}
