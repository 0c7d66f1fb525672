use std::time::Duration;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use super::ScheduleError;

static RATE_RE: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)]
    let re = Regex::new(r"(?i)^rate\(\s*([0-9]+)\s*(minutes?|hours?|days?)\s*\)$").unwrap();
    re
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateUnit {
    Minutes,
    Hours,
    Days,
}

impl RateUnit {
    pub fn seconds(&self) -> u64 {
        match self {
            RateUnit::Minutes => 60,
            RateUnit::Hours => 3600,
            RateUnit::Days => 86400,
        }
    }
}

/// `rate(N unit)` with a positive integer N and a minute/hour/day unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateExpression {
    pub value: u64,
    pub unit: RateUnit,
}

impl RateExpression {
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let invalid = || ScheduleError::InvalidRate(expression.to_owned());

        let captures = RATE_RE.captures(expression).ok_or_else(invalid)?;
        let value: u64 = captures[1].parse().map_err(|_| invalid())?;
        if value == 0 {
            return Err(invalid());
        }

        let unit = match captures[2].to_ascii_lowercase().as_str() {
            "minute" | "minutes" => RateUnit::Minutes,
            "hour" | "hours" => RateUnit::Hours,
            "day" | "days" => RateUnit::Days,
            _ => return Err(invalid()),
        };

        Ok(RateExpression { value, unit })
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.value * self.unit.seconds())
    }

    pub fn next(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        from + chrono::Duration::seconds((self.value * self.unit.seconds()) as i64)
    }
}
