mod cron_expr;
mod rate;

use chrono::{DateTime, Utc};

pub use cron_expr::CronExpression;
pub use rate::{RateExpression, RateUnit};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("invalid rate expression: {0}")]
    InvalidRate(String),
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),
    #[error("not a schedule expression: {0}")]
    Unrecognized(String),
}

/// A `rate(...)` or `cron(...)` schedule string.
#[derive(Debug, Clone)]
pub enum ScheduleExpression {
    Rate(RateExpression),
    Cron(CronExpression),
}

impl ScheduleExpression {
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let lowered = expression.trim_start().to_ascii_lowercase();
        if lowered.starts_with("rate(") {
            return Ok(ScheduleExpression::Rate(RateExpression::parse(expression)?));
        }
        if lowered.starts_with("cron(") {
            return Ok(ScheduleExpression::Cron(CronExpression::parse(expression)?));
        }
        Err(ScheduleError::Unrecognized(expression.to_owned()))
    }

    /// Next fire time strictly after `from`, if the schedule has one.
    pub fn next(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            ScheduleExpression::Rate(rate) => Some(rate.next(from)),
            ScheduleExpression::Cron(cron) => cron.next(from),
        }
    }
}
