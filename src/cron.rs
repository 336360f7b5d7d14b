//! Cron schedule validation and next-run computation.
//!
//! All schedules are 5-field cron expressions evaluated in UTC. Next-run
//! computation is always strictly after the reference time, so a trigger
//! is never rescheduled for the instant it just fired at.

use chrono::{DateTime, Utc};
use croner::Cron;

/// Parse and validate a 5-field cron expression.
pub fn parse(expr: &str) -> anyhow::Result<Cron> {
    Cron::new(expr)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid cron schedule '{}': {}", expr, e))
}

/// Validate a cron expression without computing anything.
pub fn validate(expr: &str) -> anyhow::Result<()> {
    parse(expr).map(|_| ())
}

/// Compute the next occurrence of `expr` strictly after `after`.
pub fn next_after(expr: &str, after: DateTime<Utc>) -> anyhow::Result<DateTime<Utc>> {
    let cron = parse(expr)?;
    cron.find_next_occurrence(&after, false)
        .map_err(|e| anyhow::anyhow!("No next occurrence for '{}': {}", expr, e))
}
