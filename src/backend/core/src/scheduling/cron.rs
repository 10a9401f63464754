//! Cron expression evaluation.
//!
//! Accepts the usual five-field unix form (`min hour dom month dow`) as
//! well as the six/seven-field form with seconds (and year) understood by
//! the `cron` crate.

use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;

use crate::error::{EngineError, Result};

/// Parse an expression, adding a zero seconds field to five-field input.
pub fn parse(expression: &str) -> Result<Schedule> {
    let trimmed = expression.trim();
    let fields = trimmed.split_whitespace().count();
    let normalized = match fields {
        5 => format!("0 {}", trimmed),
        6 | 7 => trimmed.to_string(),
        _ => {
            return Err(EngineError::invalid_cron(
                expression,
                format!("expected 5, 6 or 7 fields, found {}", fields),
            ))
        }
    };

    Schedule::from_str(&normalized)
        .map_err(|e| EngineError::invalid_cron(expression, e.to_string()))
}

/// First fire time strictly after `after`.
pub fn next_fire_after(expression: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    parse(expression)?
        .after(&after)
        .next()
        .ok_or_else(|| EngineError::invalid_cron(expression, "schedule never fires again"))
}

/// The next `count` fire times after `after`.
pub fn upcoming(expression: &str, after: DateTime<Utc>, count: usize) -> Result<Vec<DateTime<Utc>>> {
    Ok(parse(expression)?.after(&after).take(count).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 15, h, m, s).unwrap()
    }

    #[test]
    fn test_five_field_expression() {
        let next = next_fire_after("0 3 * * *", at(2, 59, 59)).unwrap();
        assert_eq!(next, at(3, 0, 0));
    }

    #[test]
    fn test_next_is_strictly_after() {
        let next = next_fire_after("*/15 * * * *", at(10, 15, 0)).unwrap();
        assert_eq!(next, at(10, 30, 0));
    }

    #[test]
    fn test_six_field_expression_passes_through() {
        let next = next_fire_after("30 * * * * *", at(10, 0, 0)).unwrap();
        assert_eq!(next, at(10, 0, 30));
    }

    #[test]
    fn test_upcoming() {
        let times = upcoming("0 * * * *", at(10, 30, 0), 3).unwrap();
        assert_eq!(times, vec![at(11, 0, 0), at(12, 0, 0), at(13, 0, 0)]);
    }

    #[test]
    fn test_invalid_expressions() {
        let err = next_fire_after("every tuesday", at(0, 0, 0)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidCronExpression);

        let err = next_fire_after("99 * * * *", at(0, 0, 0)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidCronExpression);
    }
}
