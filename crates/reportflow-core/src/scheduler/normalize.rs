//! Schedule expressions: normalization, validation, occurrence math.

use chrono::{DateTime, SubsecRound, Utc};
use croner::Cron;
use reportflow_types::error::SchedulerError;

/// Upper bound on occurrences enumerated by [`check_missed_runs`].
pub const MAX_MISSED_RUNS: usize = 1_000;

/// Normalize a schedule string to a 6-field cron expression (with seconds).
///
/// Supported forms (case-insensitive):
/// - 6-field cron, returned as-is
/// - 5-field cron, seconds `0` prepended
/// - "every N seconds" / "every N minutes" / "every N hours"
/// - "every minute", "every hour", "every day", "hourly", "daily"
/// - "every day at HH:MM"
///
/// The result is checked with the cron parser; anything it rejects is
/// `InvalidCron`. There is no default schedule.
pub fn normalize_schedule(input: &str) -> Result<String, SchedulerError> {
    let expr = to_cron(input)?;
    parse_cron(&expr)?;
    Ok(expr)
}

fn to_cron(input: &str) -> Result<String, SchedulerError> {
    let invalid = || SchedulerError::InvalidCron(input.to_string());
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(invalid());
    }

    let parts: Vec<&str> = trimmed.split_whitespace().collect();
    match parts.len() {
        5 => return Ok(format!("0 {}", parts.join(" "))),
        6 => return Ok(parts.join(" ")),
        _ => {}
    }

    let lower = trimmed.to_lowercase();
    match lower.as_str() {
        "every minute" | "minutely" => return Ok("0 * * * * *".to_string()),
        "every hour" | "hourly" => return Ok("0 0 * * * *".to_string()),
        "every day" | "daily" => return Ok("0 0 0 * * *".to_string()),
        _ => {}
    }

    let rest = lower.strip_prefix("every ").ok_or_else(invalid)?;

    if let Some(at) = rest.strip_prefix("day at ") {
        let (hour, minute) = at.split_once(':').ok_or_else(invalid)?;
        let hour: u32 = hour.trim().parse().map_err(|_| invalid())?;
        let minute: u32 = minute.trim().parse().map_err(|_| invalid())?;
        if hour >= 24 || minute >= 60 {
            return Err(invalid());
        }
        return Ok(format!("0 {minute} {hour} * * *"));
    }

    let words: Vec<&str> = rest.split_whitespace().collect();
    let [count, unit] = words.as_slice() else {
        return Err(invalid());
    };
    let n: u32 = count.parse().map_err(|_| invalid())?;
    if n == 0 {
        return Err(SchedulerError::InvalidCron(format!(
            "'{input}': interval must be greater than zero"
        )));
    }
    match unit.trim_end_matches('s') {
        "second" => Ok(format!("*/{n} * * * * *")),
        "minute" => Ok(format!("0 */{n} * * * *")),
        "hour" => Ok(format!("0 0 */{n} * * *")),
        _ => Err(invalid()),
    }
}

/// Parse a normalized expression.
pub fn parse_cron(expr: &str) -> Result<Cron, SchedulerError> {
    expr.parse::<Cron>()
        .map_err(|e| SchedulerError::InvalidCron(format!("'{expr}': {e}")))
}

/// First occurrence strictly after `after`, if the expression has one.
///
/// Occurrences land on whole seconds; a fractional `after` is truncated
/// first so the result stays on the cron boundary.
pub fn next_occurrence(cron: &Cron, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    cron.iter_after(after.trunc_subsecs(0)).next()
}

/// Occurrences after `last_run_at` and before `now` (capped at
/// [`MAX_MISSED_RUNS`]). Without a previous run there is nothing to miss.
pub fn check_missed_runs(
    cron: &Cron,
    last_run_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Vec<DateTime<Utc>> {
    let Some(from) = last_run_at else {
        return Vec::new();
    };
    cron.iter_after(from.trunc_subsecs(0))
        .take_while(|t| *t < now)
        .take(MAX_MISSED_RUNS)
        .collect()
}
