//! Cron expressions with timezone support.
//!
//! Patterns are accepted in three shapes:
//!
//! - classic five-field crontab (`min hour dom month dow`), with seconds
//!   implied as `0` and numeric weekdays counted from `0 = Sunday`
//! - six-field (`sec min hour dom month dow`)
//! - seven-field (six-field plus `year`)
//!
//! Six and seven field patterns are handed to the `cron` crate unchanged, so
//! their numeric weekdays follow its numbering (`1 = Sunday`). Weekday names
//! (`Mon-Fri`) mean the same thing in every shape.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, str::FromStr};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CronError {
    #[error("Invalid cron expression: {0}")]
    InvalidExpression(String),
    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),
    #[error("Cron parsing error: {0}")]
    ParseError(#[from] cron::error::Error),
}

/// Represents a cron schedule with timezone support
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronSchedule {
    /// The pattern as given by the caller.
    pub expression: String,
    pub timezone: String,
    #[serde(skip)]
    schedule: Option<Schedule>,
    #[serde(skip)]
    tz: Option<Tz>,
}

impl PartialEq for CronSchedule {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression && self.timezone == other.timezone
    }
}

/// Rewrites a crontab weekday field (0-7, 0 and 7 both Sunday) into the
/// `cron` crate's numbering (1-7, 1 = Sunday).
fn translate_weekdays(field: &str) -> Result<String, CronError> {
    let day = |value: &str| -> Result<u8, CronError> {
        let n: u8 = value.parse().map_err(|_| {
            CronError::InvalidExpression(format!("bad weekday value: {}", value))
        })?;
        if n > 7 {
            return Err(CronError::InvalidExpression(format!(
                "weekday out of range: {}",
                n
            )));
        }
        Ok(n)
    };
    let shift = |n: u8| n % 7 + 1;

    let mut parts = Vec::new();
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, Some(step)),
            None => (item, None),
        };
        let numeric = range.chars().all(|c| c.is_ascii_digit() || c == '-');
        if range == "*" || range == "?" || !numeric {
            parts.push(item.to_string());
            continue;
        }

        let Some((start, end)) = range.split_once('-') else {
            let translated = shift(day(range)?).to_string();
            parts.push(match step {
                Some(step) => format!("{}/{}", translated, step),
                None => translated,
            });
            continue;
        };
        let (start, end) = (day(start)?, day(end)?);
        if start > end {
            return Err(CronError::InvalidExpression(format!(
                "weekday range runs backwards: {}",
                range
            )));
        }

        match step {
            // Stepping counts in crontab days, so list the selected days.
            Some(step) => {
                let step: usize = step
                    .parse()
                    .ok()
                    .filter(|step| *step > 0)
                    .ok_or_else(|| {
                        CronError::InvalidExpression(format!("bad weekday step: {}", step))
                    })?;
                let days: BTreeSet<u8> = (start..=end).step_by(step).map(shift).collect();
                parts.extend(days.iter().map(u8::to_string));
            }
            // "x-7" ends on Sunday, which wraps to the start of the week.
            None if end == 7 => {
                parts.push("1".to_string());
                parts.push(format!("{}-7", shift(start)));
            }
            None => parts.push(format!("{}-{}", shift(start), shift(end))),
        }
    }
    Ok(parts.join(","))
}

/// Expands a five-field crontab pattern to the six-field form; other shapes
/// pass through unchanged.
fn normalize(expression: &str) -> Result<String, CronError> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    match fields.len() {
        5 => Ok(format!(
            "0 {} {} {} {} {}",
            fields[0],
            fields[1],
            fields[2],
            fields[3],
            translate_weekdays(fields[4])?
        )),
        6 | 7 => Ok(fields.join(" ")),
        n => Err(CronError::InvalidExpression(format!(
            "{}: expected 5, 6 or 7 fields, found {}",
            expression, n
        ))),
    }
}

fn parse(expression: &str) -> Result<Schedule, CronError> {
    let normalized = normalize(expression)?;
    Schedule::from_str(&normalized)
        .map_err(|e| CronError::InvalidExpression(format!("{}: {}", expression, e)))
}

impl CronSchedule {
    /// Create a new CronSchedule with UTC timezone
    pub fn new(expression: &str) -> Result<Self, CronError> {
        Self::with_timezone(expression, "UTC")
    }

    /// Create a new CronSchedule with a specific timezone
    pub fn with_timezone(expression: &str, timezone: &str) -> Result<Self, CronError> {
        let schedule = parse(expression)?;
        let tz = timezone
            .parse::<Tz>()
            .map_err(|_| CronError::InvalidTimezone(timezone.to_string()))?;

        Ok(CronSchedule {
            expression: expression.trim().to_string(),
            timezone: timezone.to_string(),
            schedule: Some(schedule),
            tz: Some(tz),
        })
    }

    /// Get the next execution time strictly after the given datetime
    pub fn next_execution(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let schedule = self.schedule.as_ref()?;
        let tz = self.tz.as_ref()?;

        let after_tz = after.with_timezone(tz);
        let next_tz = schedule.after(&after_tz).next()?;
        Some(next_tz.with_timezone(&Utc))
    }

    /// Validate that the cron expression is valid
    pub fn validate(expression: &str) -> Result<(), CronError> {
        parse(expression)?;
        Ok(())
    }

    /// Reinitialize the schedule and timezone after deserialization
    pub fn reinitialize(&mut self) -> Result<(), CronError> {
        self.schedule = Some(parse(&self.expression)?);
        self.tz = Some(
            self.timezone
                .parse::<Tz>()
                .map_err(|_| CronError::InvalidTimezone(self.timezone.clone()))?,
        );
        Ok(())
    }
}

impl FromStr for CronSchedule {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}
