//! Cron expression evaluation.
//!
//! Expressions use standard 5-field crontab syntax (minute hour day month
//! weekday), evaluated minute-granular in UTC. The crate-native 6/7-field
//! forms (with seconds and optional year) are accepted unchanged.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cron::Schedule as CronExprSchedule;
use std::str::FromStr;

pub fn normalize_expression(expression: &str) -> Result<String> {
    let expression = expression.trim();
    let field_count = expression.split_whitespace().count();

    match field_count {
        // standard crontab syntax: minute hour day month weekday
        5 => Ok(format!("0 {expression}")),
        // crate-native syntax includes seconds (+ optional year)
        6 | 7 => Ok(expression.to_string()),
        _ => anyhow::bail!(
            "Invalid cron expression: {expression} (expected 5, 6, or 7 fields, got {field_count})"
        ),
    }
}

pub fn next_occurrence(expression: &str, from: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let normalized = normalize_expression(expression)?;
    let cron = CronExprSchedule::from_str(&normalized)
        .with_context(|| format!("Invalid cron expression: {expression}"))?;
    cron.after(&from)
        .next()
        .ok_or_else(|| anyhow::anyhow!("No future occurrence for expression: {expression}"))
}

pub fn validate_expression(expression: &str) -> Result<()> {
    let _ = next_occurrence(expression, Utc::now())?;
    Ok(())
}
