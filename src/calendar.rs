//! Wall-clock helpers: calendar weeks in a department's time zone and
//! timestamp parsing for wire input.

use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::model::{Ms, Span};

pub fn now_ms() -> Ms {
    Utc::now().timestamp_millis()
}

/// A calendar week: Monday 00:00 up to the following Monday 00:00, local time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Week {
    pub monday: NaiveDate,
    pub span: Span,
}

/// The calendar week in `tz` containing instant `t`.
///
/// Returns `None` only when `t` is outside chrono's representable range.
pub fn week_of(t: Ms, tz: Tz) -> Option<Week> {
    let local = tz.timestamp_millis_opt(t).single()?;
    let back = u64::from(local.weekday().num_days_from_monday());
    let monday = local.date_naive().checked_sub_days(Days::new(back))?;
    let next_monday = monday.checked_add_days(Days::new(7))?;
    let start = local_midnight(tz, monday)?;
    let end = local_midnight(tz, next_monday)?;
    Some(Week {
        monday,
        span: Span::try_new(start, end)?,
    })
}

/// First instant of `date` in `tz`. A DST gap at midnight resolves to the
/// first valid local time after it.
fn local_midnight(tz: Tz, date: NaiveDate) -> Option<Ms> {
    let midnight = date.and_hms_opt(0, 0, 0)?;
    resolve_local(tz, midnight)
        .or_else(|| resolve_local(tz, midnight + chrono::Duration::hours(1)))
}

fn resolve_local(tz: Tz, naive: NaiveDateTime) -> Option<Ms> {
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.timestamp_millis())
}

/// Parse a wire timestamp: integer Unix milliseconds or an RFC 3339 string
/// with offset (`2024-03-04T10:00:00-05:00`).
pub fn parse_timestamp(s: &str) -> Result<Ms, String> {
    let s = s.trim();
    if let Ok(ms) = s.parse::<i64>() {
        return Ok(ms);
    }
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.timestamp_millis())
        .map_err(|e| format!("bad timestamp {s:?}: {e}"))
}

/// Render `t` in `tz` as RFC 3339, e.g. for human-facing messages and rows.
pub fn format_local(t: Ms, tz: Tz) -> String {
    match tz.timestamp_millis_opt(t).single() {
        Some(dt) => dt.to_rfc3339(),
        None => t.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::America::New_York;
    use chrono_tz::UTC;

    fn at(s: &str) -> Ms {
        parse_timestamp(s).unwrap()
    }

    #[test]
    fn week_starts_monday_midnight_local() {
        // Wednesday 2024-03-06 15:00 Eastern
        let week = week_of(at("2024-03-06T15:00:00-05:00"), New_York).unwrap();
        assert_eq!(week.monday, NaiveDate::from_ymd_opt(2024, 3, 4).unwrap());
        assert_eq!(week.span.start, at("2024-03-04T00:00:00-05:00"));
        assert_eq!(week.span.end, at("2024-03-11T00:00:00-04:00")); // DST began 03-10
    }

    #[test]
    fn monday_midnight_belongs_to_its_own_week() {
        let monday = at("2024-03-04T00:00:00-05:00");
        let week = week_of(monday, New_York).unwrap();
        assert_eq!(week.span.start, monday);

        let sunday_night = at("2024-03-03T23:59:59-05:00");
        let prev = week_of(sunday_night, New_York).unwrap();
        assert_eq!(prev.span.end, monday);
        assert_eq!(prev.monday, NaiveDate::from_ymd_opt(2024, 2, 26).unwrap());
    }

    #[test]
    fn week_depends_on_zone() {
        // Monday 02:00 UTC is still Sunday evening in New York.
        let t = at("2024-03-04T02:00:00Z");
        assert_eq!(
            week_of(t, UTC).unwrap().monday,
            NaiveDate::from_ymd_opt(2024, 3, 4).unwrap()
        );
        assert_eq!(
            week_of(t, New_York).unwrap().monday,
            NaiveDate::from_ymd_opt(2024, 2, 26).unwrap()
        );
    }

    #[test]
    fn parse_accepts_millis_and_rfc3339() {
        assert_eq!(parse_timestamp("1709564400000"), Ok(1_709_564_400_000));
        assert_eq!(
            parse_timestamp("2024-03-04T10:00:00-05:00"),
            Ok(1_709_564_400_000)
        );
        assert_eq!(parse_timestamp("2024-03-04T15:00:00Z"), Ok(1_709_564_400_000));
        assert!(parse_timestamp("next tuesday").is_err());
    }

    #[test]
    fn format_local_uses_zone_offset() {
        let s = format_local(1_709_564_400_000, New_York);
        assert_eq!(s, "2024-03-04T10:00:00-05:00");
    }
}
