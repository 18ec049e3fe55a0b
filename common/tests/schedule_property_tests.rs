// Property-based tests for cron and duration parsing.

use chrono::{TimeZone, Utc};
use common::schedule::{next_fire_time, parse_cron_expression, parse_duration};
use proptest::prelude::*;
use std::time::Duration;

proptest! {
    /// *For any* h/m/s combination, the composed duration string parses to
    /// the matching number of seconds.
    #[test]
    fn property_duration_composition(h in 0u64..100, m in 0u64..600, s in 0u64..600) {
        let text = format!("{}h{}m{}s", h, m, s);
        let expected = Duration::from_secs(h * 3600 + m * 60 + s);
        prop_assert_eq!(parse_duration(&text).unwrap(), expected);
    }

    /// *For any* bare number, parsing fails: a unit is mandatory.
    #[test]
    fn property_bare_number_rejected(n in 0u64..100000) {
        prop_assert!(parse_duration(&n.to_string()).is_err());
    }

    /// *For any* valid fixed-minute hourly schedule, the next fire time is
    /// strictly in the future and lands on that minute.
    #[test]
    fn property_next_fire_strictly_after(minute in 0u32..60, offset_minutes in 0i64..(48 * 60)) {
        let expression = format!("{} * * * *", minute);
        let after = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
            + chrono::Duration::minutes(offset_minutes);

        let next = next_fire_time(&expression, after).unwrap();
        prop_assert!(next > after);
        prop_assert_eq!(chrono::Timelike::minute(&next), minute);
    }

    /// *For any* five-field expression that parses, re-parsing is stable
    /// (no flip-flopping on the seconds-field normalization).
    #[test]
    fn property_five_field_parse_stable(minute in 0u32..60, hour in 0u32..24) {
        let expression = format!("{} {} * * *", minute, hour);
        prop_assert!(parse_cron_expression(&expression).is_ok());
        let padded_expression = format!(" {} ", expression);
        prop_assert!(parse_cron_expression(&padded_expression).is_ok());
    }
}

#[test]
fn test_empty_and_garbage_expressions_rejected() {
    assert!(parse_cron_expression("").is_err());
    assert!(parse_cron_expression("every tuesday").is_err());
}
