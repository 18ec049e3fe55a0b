// Cron and duration parsing for job definitions.
//
// Definitions carry standard 5-field cron expressions (minute hour dom month
// dow). The `cron` crate wants a seconds field, so 5-field input is
// normalized by prepending `0`; 6- and 7-field expressions pass through
// untouched. An empty expression means manual-only and is handled by the
// callers, never here.

use crate::errors::ScheduleError;
use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use std::str::FromStr;
use std::time::Duration;

/// Parse and validate a cron expression, accepting the 5-field form.
pub fn parse_cron_expression(expression: &str) -> Result<CronSchedule, ScheduleError> {
    let trimmed = expression.trim();
    let field_count = trimmed.split_whitespace().count();
    let normalized = if field_count == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    };

    CronSchedule::from_str(&normalized).map_err(|e| ScheduleError::InvalidCronExpression {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// Next wall-clock fire time strictly after `after`.
pub fn next_fire_time(
    expression: &str,
    after: DateTime<Utc>,
) -> Result<DateTime<Utc>, ScheduleError> {
    let schedule = parse_cron_expression(expression)?;
    schedule
        .after(&after)
        .next()
        .ok_or_else(|| ScheduleError::NoNextFire(expression.to_string()))
}

/// Parse a conventional duration string: `15s`, `30m`, `1h`, `1h30m`, `90s`.
///
/// Units are hours, minutes, seconds; at least one unit is required and a
/// bare number is rejected.
pub fn parse_duration(input: &str) -> Result<Duration, ScheduleError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ScheduleError::InvalidDuration {
            input: input.to_string(),
            reason: "empty duration".to_string(),
        });
    }

    let mut total_secs: u64 = 0;
    let mut digits = String::new();
    let mut saw_unit = false;

    for ch in trimmed.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }

        let value: u64 = digits
            .parse()
            .map_err(|_| ScheduleError::InvalidDuration {
                input: input.to_string(),
                reason: format!("unit '{}' has no leading number", ch),
            })?;
        digits.clear();
        saw_unit = true;

        let factor = match ch {
            'h' => 3600,
            'm' => 60,
            's' => 1,
            _ => {
                return Err(ScheduleError::InvalidDuration {
                    input: input.to_string(),
                    reason: format!("unknown unit '{}'", ch),
                })
            }
        };
        total_secs = total_secs.saturating_add(value.saturating_mul(factor));
    }

    if !digits.is_empty() {
        return Err(ScheduleError::InvalidDuration {
            input: input.to_string(),
            reason: "trailing number without unit".to_string(),
        });
    }
    if !saw_unit {
        return Err(ScheduleError::InvalidDuration {
            input: input.to_string(),
            reason: "no duration units found".to_string(),
        });
    }

    Ok(Duration::from_secs(total_secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_five_field_cron() {
        assert!(parse_cron_expression("0 * * * *").is_ok());
        assert!(parse_cron_expression("*/5 2 * * 1").is_ok());
    }

    #[test]
    fn test_parse_six_field_cron_passthrough() {
        assert!(parse_cron_expression("30 0 12 * * *").is_ok());
    }

    #[test]
    fn test_parse_invalid_cron() {
        assert!(parse_cron_expression("not a cron").is_err());
        assert!(parse_cron_expression("61 * * * *").is_err());
    }

    #[test]
    fn test_next_fire_time_hourly() {
        let after = Utc.with_ymd_and_hms(2024, 6, 1, 10, 30, 0).unwrap();
        let next = next_fire_time("0 * * * *", after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 6, 1, 11, 0, 0).unwrap());
    }

    #[test]
    fn test_next_fire_is_strictly_after() {
        let on_the_hour = Utc.with_ymd_and_hms(2024, 6, 1, 11, 0, 0).unwrap();
        let next = next_fire_time("0 * * * *", on_the_hour).unwrap();
        assert!(next > on_the_hour);
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("15s").unwrap(), Duration::from_secs(15));
        assert_eq!(parse_duration("30m").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("1h30m15s").unwrap(), Duration::from_secs(5415));
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("30").is_err());
        assert!(parse_duration("m30").is_err());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("1h30").is_err());
    }
}
