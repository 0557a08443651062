//! Cron parsing on top of the `cron` crate, accepting the classic five-field
//! form (`min hour dom month dow`) as well as the crate's own six/seven-field
//! form with seconds.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::str::FromStr;

use crate::core::error::{RuntimeError, RuntimeResult};

const WEEKDAYS: [&str; 8] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT", "SUN"];

/// Five-field day-of-week numbers count from Sunday = 0 (7 is Sunday too);
/// the `cron` crate counts from Sunday = 1. Names are unambiguous, so numeric
/// days are rewritten to names.
fn rewrite_weekdays(field: &str) -> RuntimeResult<String> {
    let mut items = Vec::new();
    for item in field.split(',') {
        let (base, step) = match item.split_once('/') {
            Some((base, step)) => (base, Some(step)),
            None => (item, None),
        };
        let mut parts = Vec::new();
        for bound in base.split('-') {
            match bound.parse::<usize>() {
                Ok(n) if n < WEEKDAYS.len() => parts.push(WEEKDAYS[n].to_string()),
                Ok(n) => {
                    return Err(RuntimeError::Validation(format!(
                        "day-of-week {} is out of range 0-7",
                        n
                    )));
                }
                Err(_) => parts.push(bound.to_string()),
            }
        }
        let mut rewritten = parts.join("-");
        if let Some(step) = step {
            rewritten.push('/');
            rewritten.push_str(step);
        }
        items.push(rewritten);
    }
    Ok(items.join(","))
}

pub fn parse_expression(expression: &str) -> RuntimeResult<Schedule> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    let normalized = match fields.len() {
        5 => {
            let weekday = rewrite_weekdays(fields[4])?;
            format!("0 {} {} {} {} {}", fields[0], fields[1], fields[2], fields[3], weekday)
        }
        6 | 7 => fields.join(" "),
        n => {
            return Err(RuntimeError::Validation(format!(
                "cron expression '{}' has {} fields, expected 5",
                expression, n
            )));
        }
    };
    Schedule::from_str(&normalized).map_err(|e| {
        RuntimeError::Validation(format!("invalid cron expression '{}': {}", expression, e))
    })
}

pub fn parse_timezone(name: &str) -> RuntimeResult<Tz> {
    name.parse::<Tz>()
        .map_err(|_| RuntimeError::Validation(format!("unknown timezone '{}'", name)))
}

/// First occurrence strictly after `after`, evaluated in `timezone`.
pub fn next_run_after(
    expression: &str,
    timezone: &str,
    after: DateTime<Utc>,
) -> RuntimeResult<DateTime<Utc>> {
    let schedule = parse_expression(expression)?;
    let tz = parse_timezone(timezone)?;
    schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|at| at.with_timezone(&Utc))
        .ok_or_else(|| {
            RuntimeError::Validation(format!("cron expression '{}' never fires", expression))
        })
}
