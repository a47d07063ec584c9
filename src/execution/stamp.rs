//! Placement time carried in the order comment as `S{minutes since UTC midnight}`.
//!
//! The comment travels with the order inside the terminal, so order age can be
//! recovered after a restart without any local store.

use chrono::{DateTime, Timelike, Utc};

use crate::error::BotError;
use crate::Result;

const STAMP_PREFIX: char = 'S';
const MINUTES_PER_DAY: u32 = 1440;

pub fn minute_of_day(t: DateTime<Utc>) -> u32 {
    t.hour() * 60 + t.minute()
}

pub fn encode_placement(t: DateTime<Utc>) -> String {
    format!("{STAMP_PREFIX}{}", minute_of_day(t))
}

/// Decode a placement stamp.
///
/// `Ok(None)` for comments that are not stamps (manual orders, other tools).
/// A comment that starts like a stamp but does not parse is an error.
pub fn decode_placement(comment: &str) -> Result<Option<u32>> {
    let comment = comment.trim();
    let Some(rest) = comment.strip_prefix(STAMP_PREFIX) else {
        return Ok(None);
    };
    if !rest.starts_with(|c: char| c.is_ascii_digit()) {
        return Ok(None);
    }
    match rest.parse::<u32>() {
        Ok(minute) if minute < MINUTES_PER_DAY => Ok(Some(minute)),
        _ => Err(BotError::MalformedState(format!(
            "unparseable placement stamp {comment:?}"
        ))),
    }
}

/// Minutes between placement and now, both as minute of day.
///
/// A placement minute greater than the current one means the order was
/// placed before midnight.
pub fn order_age_minutes(placed: u32, current: u32) -> u32 {
    if current >= placed {
        current - placed
    } else {
        current + MINUTES_PER_DAY - placed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_encode() {
        let t = Utc.with_ymd_and_hms(2024, 3, 12, 9, 5, 59).unwrap();
        assert_eq!(minute_of_day(t), 545);
        assert_eq!(encode_placement(t), "S545");
    }

    #[test]
    fn test_decode() {
        assert_eq!(decode_placement("S545").unwrap(), Some(545));
        assert_eq!(decode_placement(" S0 ").unwrap(), Some(0));
        assert_eq!(decode_placement("manual hedge").unwrap(), None);
        assert_eq!(decode_placement("Swing").unwrap(), None);
        assert_eq!(decode_placement("").unwrap(), None);
    }

    #[test]
    fn test_decode_malformed() {
        assert!(matches!(
            decode_placement("S12x"),
            Err(BotError::MalformedState(_))
        ));
        assert!(decode_placement("S1440").is_err());
        assert!(decode_placement("S99999999999").is_err());
    }

    #[test]
    fn test_age_same_day() {
        assert_eq!(order_age_minutes(540, 575), 35);
        assert_eq!(order_age_minutes(600, 600), 0);
    }

    #[test]
    fn test_age_wraps_midnight() {
        assert_eq!(order_age_minutes(1430, 10), 20);
        assert_eq!(order_age_minutes(1439, 0), 1);
    }

    #[test]
    fn test_age_matches_formula_everywhere() {
        for p in (0..1440).step_by(37) {
            for c in (0..1440).step_by(41) {
                let expected = if c >= p { c - p } else { c + 1440 - p };
                assert_eq!(order_age_minutes(p, c), expected);
            }
        }
    }
}
