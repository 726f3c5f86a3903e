//! Timestamp normalization
//!
//! Feed servers report modification times as HTTP dates (`Sat, 26 Jul 2014
//! 15:55:03 GMT`) while checkpoints are stored as RFC 3339. Both are reduced to
//! a single `DateTime<Utc>` instant before any comparison happens.

use chrono::{DateTime, Utc};

/// Parse an HTTP `Last-Modified` value into a UTC instant.
///
/// Accepts the IMF-fixdate / RFC 2822 form servers are required to send and,
/// leniently, RFC 3339. Returns `None` for anything else.
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    DateTime::parse_from_rfc2822(value)
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    #[test]
    fn test_parse_imf_fixdate() {
        let parsed = parse_http_date("Sat, 26 Jul 2014 15:55:03 GMT").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2014, 7, 26, 15, 55, 3).unwrap());
    }

    #[test]
    fn test_parse_offset_is_normalized_to_utc() {
        let parsed = parse_http_date("2014-07-26T11:55:03.777-04:00").unwrap();
        assert_eq!(
            parsed,
            Utc.with_ymd_and_hms(2014, 7, 26, 15, 55, 3).unwrap()
                + chrono::Duration::milliseconds(777)
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_http_date("").is_none());
        assert!(parse_http_date("yesterday").is_none());
        assert!(parse_http_date("26/07/2014").is_none());
    }

    proptest! {
        #[test]
        fn test_rfc2822_dates_parse_to_same_instant(secs in 0i64..4_102_444_800i64) {
            let instant = Utc.timestamp_opt(secs, 0).unwrap();
            prop_assert_eq!(parse_http_date(&instant.to_rfc2822()), Some(instant));
        }

        #[test]
        fn test_rfc3339_keeps_subsecond_precision(secs in 0i64..4_102_444_800i64, nanos in 0u32..1_000_000_000u32) {
            let instant = Utc.timestamp_opt(secs, nanos).unwrap();
            let text = instant.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true);
            prop_assert_eq!(parse_http_date(&text), Some(instant));
        }
    }
}
