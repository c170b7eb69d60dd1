//! Local wall-clock ↔ [`Ms`] conversion in the gym's timezone.

use chrono::{Datelike, LocalResult, NaiveDate, NaiveTime, TimeZone};
use chrono_tz::Tz;

use crate::model::{Ms, Span};

/// Calendar month as `(year, month)`.
pub type MonthKey = (i32, u32);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CalendarError {
    #[error("{date} {time} does not exist in {tz}")]
    Nonexistent { date: NaiveDate, time: NaiveTime, tz: &'static str },
    #[error("{date} {time} is ambiguous in {tz}")]
    Ambiguous { date: NaiveDate, time: NaiveTime, tz: &'static str },
    #[error("start {start} must be before end {end}")]
    Inverted { start: NaiveTime, end: NaiveTime },
}

pub fn local_instant(tz: Tz, date: NaiveDate, time: NaiveTime) -> Result<Ms, CalendarError> {
    match tz.from_local_datetime(&date.and_time(time)) {
        LocalResult::Single(dt) => Ok(dt.timestamp_millis()),
        LocalResult::None => Err(CalendarError::Nonexistent { date, time, tz: tz.name() }),
        LocalResult::Ambiguous(..) => Err(CalendarError::Ambiguous { date, time, tz: tz.name() }),
    }
}

/// Same-day window `[start, end)` on `date`.
pub fn local_span(
    tz: Tz,
    date: NaiveDate,
    start: NaiveTime,
    end: NaiveTime,
) -> Result<Span, CalendarError> {
    let s = local_instant(tz, date, start)?;
    let e = local_instant(tz, date, end)?;
    if s >= e {
        return Err(CalendarError::Inverted { start, end });
    }
    Ok(Span::new(s, e))
}

pub fn month_of(tz: Tz, at: Ms) -> MonthKey {
    let local = tz.timestamp_millis_opt(at).earliest().map(|dt| dt.date_naive());
    match local {
        Some(d) => (d.year(), d.month()),
        // Out of chrono's range; bucket everything there together.
        None => (i32::MAX, 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn utc_span() {
        let span = local_span(Tz::UTC, d(2026, 1, 5), t(9, 0), t(10, 30)).unwrap();
        assert_eq!(span.minutes(), 90);
        assert_eq!(span.start, 1_767_603_600_000);
    }

    #[test]
    fn inverted_span_rejected() {
        let err = local_span(Tz::UTC, d(2026, 1, 5), t(10, 0), t(10, 0)).unwrap_err();
        assert!(matches!(err, CalendarError::Inverted { .. }));
    }

    #[test]
    fn dst_gap_is_nonexistent() {
        // Clocks jump from 02:00 to 03:00 in Warsaw on 2026-03-29.
        let err = local_instant(Tz::Europe__Warsaw, d(2026, 3, 29), t(2, 30)).unwrap_err();
        assert!(matches!(err, CalendarError::Nonexistent { .. }));
    }

    #[test]
    fn month_follows_local_date() {
        // 23:30 UTC on Jan 31 is already February in Warsaw.
        let at = local_instant(Tz::UTC, d(2026, 1, 31), t(23, 30)).unwrap();
        assert_eq!(month_of(Tz::UTC, at), (2026, 1));
        assert_eq!(month_of(Tz::Europe__Warsaw, at), (2026, 2));
    }
}
