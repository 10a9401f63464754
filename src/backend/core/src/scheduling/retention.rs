//! Job retention period parsing.

use std::time::Duration;

use crate::error::{EngineError, ErrorCode, Result};

/// Smallest retention the engine honours.
pub const MINIMUM_RETENTION: Duration = Duration::from_secs(60);

/// Parse a retention period such as `"30d"`, `"12h"` or `"90m"`.
///
/// Blank input disables deletion and yields `None`. Anything else is
/// truncated to whole minutes and raised to at least one minute.
pub fn parse_retention(period: &str) -> Result<Option<Duration>> {
    let period = period.trim();
    if period.is_empty() {
        return Ok(None);
    }

    let parsed = humantime::parse_duration(period).map_err(|e| {
        EngineError::new(
            ErrorCode::InvalidConfiguration,
            format!("Invalid retention period '{}': {}", period, e),
        )
    })?;

    let minutes = parsed.as_secs() / 60;
    Ok(Some(Duration::from_secs(minutes * 60).max(MINIMUM_RETENTION)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_disables() {
        assert_eq!(parse_retention("").unwrap(), None);
        assert_eq!(parse_retention("   ").unwrap(), None);
    }

    #[test]
    fn test_common_periods() {
        assert_eq!(
            parse_retention("30d").unwrap(),
            Some(Duration::from_secs(30 * 24 * 3600))
        );
        assert_eq!(parse_retention("12h").unwrap(), Some(Duration::from_secs(12 * 3600)));
        assert_eq!(parse_retention("90m").unwrap(), Some(Duration::from_secs(90 * 60)));
    }

    #[test]
    fn test_truncates_and_floors() {
        assert_eq!(parse_retention("150s").unwrap(), Some(Duration::from_secs(120)));
        assert_eq!(parse_retention("5s").unwrap(), Some(MINIMUM_RETENTION));
    }

    #[test]
    fn test_rejects_garbage() {
        let err = parse_retention("a month").unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidConfiguration);
    }
}
