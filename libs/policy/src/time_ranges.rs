//! The `"<DAY>/<RANGES>/<TZ>"` grammar for time-of-week conditions.
//!
//! `DAY` is one of `M T W R F S U`, `RANGES` is either the literal `true`
//! (the whole day) or a comma-separated list of `HH[:MM[:SS]]-HH[:MM[:SS]]`,
//! and `TZ` is an IANA zone name. The current UTC instant is converted into
//! the zone before the day and time are compared.

use chrono::{DateTime, Datelike as _, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;
use std::str::FromStr;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TimeRangeError {
    #[error("invalid day of the week")]
    InvalidDayOfWeek,
    #[error("timezone is required")]
    TimezoneRequired,
    #[error("invalid timezone")]
    InvalidTimezone,
    #[error("invalid time range: {0}")]
    InvalidRange(String),
}

/// One parsed grammar value: the admissible time ranges of a single weekday.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayTimeRanges {
    pub day: Weekday,
    pub ranges: Vec<(NaiveTime, NaiveTime)>,
    pub timezone: Tz,
}

impl DayTimeRanges {
    /// Whether the instant falls on this weekday within any range, evaluated
    /// in the value's timezone. Both boundaries are inclusive.
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        let local = instant.with_timezone(&self.timezone);

        if local.weekday() != self.day {
            return false;
        }

        let time = local.time();

        self.ranges
            .iter()
            .any(|(start, end)| *start <= time && time <= *end)
    }
}

impl FromStr for DayTimeRanges {
    type Err = TimeRangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '/');

        let day = parts.next().unwrap_or_default();
        let ranges = parts.next().ok_or(TimeRangeError::TimezoneRequired)?;
        let timezone = parts.next().ok_or(TimeRangeError::TimezoneRequired)?;

        let day = parse_day(day)?;
        let timezone = timezone
            .parse::<Tz>()
            .map_err(|_| TimeRangeError::InvalidTimezone)?;
        let ranges = parse_ranges(ranges)?;

        Ok(Self {
            day,
            ranges,
            timezone,
        })
    }
}

fn parse_day(day: &str) -> Result<Weekday, TimeRangeError> {
    match day {
        "M" => Ok(Weekday::Mon),
        "T" => Ok(Weekday::Tue),
        "W" => Ok(Weekday::Wed),
        "R" => Ok(Weekday::Thu),
        "F" => Ok(Weekday::Fri),
        "S" => Ok(Weekday::Sat),
        "U" => Ok(Weekday::Sun),
        _ => Err(TimeRangeError::InvalidDayOfWeek),
    }
}

fn parse_ranges(ranges: &str) -> Result<Vec<(NaiveTime, NaiveTime)>, TimeRangeError> {
    if ranges == "true" {
        let start = NaiveTime::from_hms_opt(0, 0, 0).expect("00:00:00 is a valid time");
        let end = NaiveTime::from_hms_opt(23, 59, 59).expect("23:59:59 is a valid time");

        return Ok(vec![(start, end)]);
    }

    ranges.split(',').map(parse_range).collect()
}

fn parse_range(range: &str) -> Result<(NaiveTime, NaiveTime), TimeRangeError> {
    let invalid = || TimeRangeError::InvalidRange(range.to_owned());

    let (start, end) = range.split_once('-').ok_or_else(invalid)?;

    let start = parse_time(start).ok_or_else(invalid)?;
    let end = parse_time(end).ok_or_else(invalid)?;

    if start > end {
        return Err(invalid());
    }

    Ok((start, end))
}

fn parse_time(time: &str) -> Option<NaiveTime> {
    let mut components = time.splitn(3, ':');

    let hours = components.next()?.parse::<u32>().ok()?;
    let minutes = match components.next() {
        Some(m) => m.parse::<u32>().ok()?,
        None => 0,
    };
    let seconds = match components.next() {
        Some(s) => s.parse::<u32>().ok()?,
        None => 0,
    };

    NaiveTime::from_hms_opt(hours, minutes, seconds)
}
