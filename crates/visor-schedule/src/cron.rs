//! Cron as an external capability: `validate` and `next_after` over the
//! `cron` crate, evaluated in an IANA timezone. Expressions use the common
//! 5-field form (minute hour dom month dow); a seconds field of `0` is
//! prepended before parsing.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum CronError {
    #[error("invalid cron expression '{expr}': {message}")]
    Invalid { expr: String, message: String },
    #[error("unknown timezone '{0}'")]
    UnknownTimezone(String),
}

fn normalize(expr: &str) -> Result<String, CronError> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    match fields.len() {
        5 => Ok(format!("0 {}", fields.join(" "))),
        6 | 7 => Ok(fields.join(" ")),
        n => Err(CronError::Invalid {
            expr: expr.to_string(),
            message: format!("expected 5 fields (minute hour dom month dow), got {n}"),
        }),
    }
}

fn parse(expr: &str) -> Result<Schedule, CronError> {
    let normalized = normalize(expr)?;
    Schedule::from_str(&normalized).map_err(|err| CronError::Invalid {
        expr: expr.to_string(),
        message: err.to_string(),
    })
}

/// Parse a timezone name, falling back to UTC for empty input.
pub fn parse_tz(name: &str) -> Result<Tz, CronError> {
    if name.trim().is_empty() {
        return Ok(chrono_tz::UTC);
    }
    name.parse::<Tz>()
        .map_err(|_| CronError::UnknownTimezone(name.to_string()))
}

/// Check an expression without computing anything.
pub fn validate(expr: &str) -> Result<(), CronError> {
    parse(expr).map(|_| ())
}

/// Next occurrence strictly after `after`, evaluated in `timezone` and
/// returned in UTC. `None` when the expression has no future occurrence.
pub fn next_after(
    expr: &str,
    after: DateTime<Utc>,
    timezone: &str,
) -> Result<Option<DateTime<Utc>>, CronError> {
    let schedule = parse(expr)?;
    let tz = parse_tz(timezone)?;
    let local = after.with_timezone(&tz);
    Ok(schedule.after(&local).next().map(|dt| dt.with_timezone(&Utc)))
}
