/*!
 * Source Date-Time Parsing
 *
 * Normalizes the date-time forms adapters encounter in raw source payloads
 * (iCal `DTSTART`/`DTEND` value strings, CalDAV REPORT responses) into
 * `DateTime<Utc>`. Covers the subset spec.md §6 names: bare UTC (`Z`
 * suffix), explicit numeric offset, all-day `YYYYMMDD`, floating local
 * `YYYYMMDDTHHMMSS`, and named-zone forms via `chrono-tz` with a logged
 * fallback to UTC when the zone is unknown. Full VTIMEZONE/DST-transition
 * handling is out of scope.
 */

use crate::calendar::error::{CalendarError, CalendarResult};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};

/// Parses a source date-time string into UTC. `tz_hint` is the `TZID`
/// parameter an adapter may have alongside the value (e.g. from an iCal
/// `DTSTART;TZID=America/New_York:...` property); it is only consulted for
/// the floating local form.
pub fn parse_source_datetime(value: &str, tz_hint: Option<&str>, source_id: &str) -> CalendarResult<DateTime<Utc>> {
    let value = value.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }

    if value.ends_with('Z') && value.len() == 16 {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&value[..15], "%Y%m%dT%H%M%S") {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }

    if value.len() == 8 {
        if let Ok(date) = NaiveDate::parse_from_str(value, "%Y%m%d") {
            return Ok(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).expect("midnight is always valid")));
        }
    }

    if value.len() == 15 && value.contains('T') {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S") {
            return Ok(resolve_floating_local(naive, tz_hint, source_id));
        }
    }

    Err(CalendarError::NormalizationError {
        message: format!("unrecognized date-time form: {}", value),
        source_id: source_id.to_string(),
    })
}

fn resolve_floating_local(naive: NaiveDateTime, tz_hint: Option<&str>, source_id: &str) -> DateTime<Utc> {
    let Some(hint) = tz_hint else {
        return Utc.from_utc_datetime(&naive);
    };

    if let Ok(tz) = hint.parse::<chrono_tz::Tz>() {
        return match tz.from_local_datetime(&naive).single() {
            Some(dt) => dt.with_timezone(&Utc),
            None => {
                tracing::warn!(source_id, tz_hint = hint, "ambiguous local time under named zone, falling back to UTC interpretation");
                Utc.from_utc_datetime(&naive)
            }
        };
    }

    if let Some(offset) = parse_numeric_offset(hint) {
        return match offset.from_local_datetime(&naive).single() {
            Some(dt) => dt.with_timezone(&Utc),
            None => Utc.from_utc_datetime(&naive),
        };
    }

    tracing::warn!(source_id, tz_hint = hint, "unknown timezone name, falling back to UTC interpretation");
    Utc.from_utc_datetime(&naive)
}

/// Parses a `+HHMM`/`-HHMM`/`+HH:MM` numeric UTC offset hint. `chrono_tz`
/// only understands IANA zone names, so this covers the other `tz_hint`
/// form the date-time table names.
fn parse_numeric_offset(hint: &str) -> Option<FixedOffset> {
    let sign = match hint.as_bytes().first()? {
        b'+' => 1,
        b'-' => -1,
        _ => return None,
    };

    let digits: String = hint[1..].chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let hours: i32 = digits[0..2].parse().ok()?;
    let minutes: i32 = digits[2..4].parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rfc3339_utc() {
        let dt = parse_source_datetime("2024-01-15T10:00:00Z", None, "s1").unwrap();
        assert_eq!(dt.to_rfc3339(), "2024-01-15T10:00:00+00:00");
    }

    #[test]
    fn parses_rfc3339_with_offset() {
        let dt = parse_source_datetime("2024-01-15T10:00:00-05:00", None, "s1").unwrap();
        assert_eq!(dt, Utc.with_ymd_and_hms(2024, 1, 15, 15, 0, 0).unwrap());
    }

    #[test]
    fn parses_ical_utc_form() {
        let dt = parse_source_datetime("20240115T100000Z", None, "s1").unwrap();
        assert_eq!(dt, Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap());
    }

    #[test]
    fn parses_all_day_form() {
        let dt = parse_source_datetime("20240115", None, "s1").unwrap();
        assert_eq!(dt, Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap());
    }

    #[test]
    fn parses_floating_local_with_named_zone() {
        let dt = parse_source_datetime("20240115T100000", Some("America/New_York"), "s1").unwrap();
        assert_eq!(dt, Utc.with_ymd_and_hms(2024, 1, 15, 15, 0, 0).unwrap());
    }

    #[test]
    fn parses_floating_local_with_numeric_offset() {
        let dt = parse_source_datetime("20240115T100000", Some("-0500"), "s1").unwrap();
        assert_eq!(dt, Utc.with_ymd_and_hms(2024, 1, 15, 15, 0, 0).unwrap());
    }

    #[test]
    fn parses_floating_local_with_colon_numeric_offset() {
        let dt = parse_source_datetime("20240115T100000", Some("+05:30"), "s1").unwrap();
        assert_eq!(dt, Utc.with_ymd_and_hms(2024, 1, 15, 4, 30, 0).unwrap());
    }

    #[test]
    fn unknown_zone_falls_back_to_utc() {
        let dt = parse_source_datetime("20240115T100000", Some("Not/AZone"), "s1").unwrap();
        assert_eq!(dt, Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap());
    }

    #[test]
    fn garbage_input_is_normalization_error() {
        let err = parse_source_datetime("not-a-date", None, "s1").unwrap_err();
        assert!(matches!(err, CalendarError::NormalizationError { .. }));
    }
}
