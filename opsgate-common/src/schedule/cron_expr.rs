use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use once_cell::sync::Lazy;
use regex::Regex;

use super::ScheduleError;

static CRON_RE: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)]
    let re = Regex::new(r"(?i)^cron\((.+)\)$").unwrap();
    re
});

/// `cron(<body>)` wrapping a standard cron schedule.
#[derive(Debug, Clone)]
pub struct CronExpression {
    schedule: Schedule,
}

impl CronExpression {
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let invalid = || ScheduleError::InvalidCron(expression.to_owned());

        let captures = CRON_RE.captures(expression).ok_or_else(invalid)?;
        let schedule = Schedule::from_str(captures[1].trim()).map_err(|_| invalid())?;
        Ok(CronExpression { schedule })
    }

    pub fn next(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&from).next()
    }
}
