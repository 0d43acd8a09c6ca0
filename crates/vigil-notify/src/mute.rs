//! Mute timings.
//!
//! A mute timing is a named list of time intervals in the Alertmanager
//! format. Routes reference timings by name; while the current time falls in
//! any interval of a referenced timing, notifications for that route are
//! held back. Every field of an interval is optional; an empty field matches
//! everything.

use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{NotifyError, Result};

/// A `HH:MM` to `HH:MM` range within a day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Inclusive start, e.g. `09:00`.
    pub start_time: String,
    /// Exclusive end, e.g. `17:00`. `24:00` is allowed.
    pub end_time: String,
}

/// One interval of a mute timing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeInterval {
    /// Times of day.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub times: Vec<TimeRange>,
    /// Weekdays or weekday ranges, e.g. `monday:friday`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub weekdays: Vec<String>,
    /// Days of month; negative values count from the end, e.g. `-1`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub days_of_month: Vec<String>,
    /// Months by name or number, e.g. `january:march`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub months: Vec<String>,
    /// Years or year ranges.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub years: Vec<String>,
    /// Time zone. Only `UTC` is supported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// A named set of time intervals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MuteTiming {
    /// Name referenced from routes.
    pub name: String,
    /// Intervals; the timing is active if any of them is.
    #[serde(default)]
    pub time_intervals: Vec<TimeInterval>,
}

impl MuteTiming {
    /// Checks the timing.
    ///
    /// # Errors
    ///
    /// Returns `NotifyError::InvalidConfig` if the name is empty or an
    /// interval cannot be parsed.
    pub fn validate(&self) -> Result<()> {
        self.compile().map(|_| ())
    }

    /// Parses every interval.
    ///
    /// # Errors
    ///
    /// See [`MuteTiming::validate`].
    pub fn compile(&self) -> Result<CompiledMuteTiming> {
        if self.name.trim().is_empty() {
            return Err(NotifyError::invalid_config("mute timing name cannot be empty"));
        }
        let intervals = self
            .time_intervals
            .iter()
            .map(CompiledInterval::parse)
            .collect::<Result<Vec<_>>>()
            .map_err(|e| NotifyError::invalid_config(format!("mute timing {:?}: {e}", self.name)))?;
        Ok(CompiledMuteTiming {
            name: self.name.clone(),
            intervals,
        })
    }
}

/// A parsed [`MuteTiming`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledMuteTiming {
    name: String,
    intervals: Vec<CompiledInterval>,
}

impl CompiledMuteTiming {
    /// Timing name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True if `now` is inside any interval.
    #[must_use]
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        self.intervals.iter().any(|i| i.contains(now))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CompiledInterval {
    minutes: Vec<(u32, u32)>,
    weekdays: Vec<(u32, u32)>,
    days_of_month: Vec<(i32, i32)>,
    months: Vec<(u32, u32)>,
    years: Vec<(i32, i32)>,
}

const WEEKDAYS: [&str; 7] = [
    "sunday",
    "monday",
    "tuesday",
    "wednesday",
    "thursday",
    "friday",
    "saturday",
];

const MONTHS: [&str; 12] = [
    "january",
    "february",
    "march",
    "april",
    "may",
    "june",
    "july",
    "august",
    "september",
    "october",
    "november",
    "december",
];

impl CompiledInterval {
    fn parse(interval: &TimeInterval) -> Result<Self> {
        if let Some(location) = &interval.location {
            if !location.eq_ignore_ascii_case("utc") {
                return Err(NotifyError::invalid_config(format!(
                    "unsupported location {location:?}"
                )));
            }
        }

        let minutes = interval
            .times
            .iter()
            .map(|t| {
                let start = parse_clock(&t.start_time)?;
                let end = parse_clock(&t.end_time)?;
                if start >= end {
                    return Err(NotifyError::invalid_config(format!(
                        "start time {} must be before end time {}",
                        t.start_time, t.end_time
                    )));
                }
                Ok((start, end))
            })
            .collect::<Result<Vec<_>>>()?;

        let weekdays = interval
            .weekdays
            .iter()
            .map(|s| parse_range(s, |v| lookup(v, &WEEKDAYS, 0), "weekday"))
            .collect::<Result<Vec<_>>>()?;

        let months = interval
            .months
            .iter()
            .map(|s| {
                parse_range(
                    s,
                    |v| {
                        lookup(v, &MONTHS, 1).or_else(|| {
                            v.parse::<u32>().ok().filter(|m| (1..=12).contains(m))
                        })
                    },
                    "month",
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let days_of_month = interval
            .days_of_month
            .iter()
            .map(|s| {
                parse_range(
                    s,
                    |v| {
                        v.parse::<i32>()
                            .ok()
                            .filter(|d| *d != 0 && (-31..=31).contains(d))
                    },
                    "day of month",
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let years = interval
            .years
            .iter()
            .map(|s| parse_range(s, |v| v.parse::<i32>().ok().filter(|y| *y > 0), "year"))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            minutes,
            weekdays,
            days_of_month,
            months,
            years,
        })
    }

    fn contains(&self, now: DateTime<Utc>) -> bool {
        let minute = now.hour() * 60 + now.minute();
        if !self.minutes.is_empty() && !self.minutes.iter().any(|(s, e)| *s <= minute && minute < *e) {
            return false;
        }
        let weekday = now.weekday().num_days_from_sunday();
        if !self.weekdays.is_empty() && !in_ranges(&self.weekdays, weekday) {
            return false;
        }
        if !self.months.is_empty() && !in_ranges(&self.months, now.month()) {
            return false;
        }
        if !self.years.is_empty() && !in_ranges(&self.years, now.year()) {
            return false;
        }
        if !self.days_of_month.is_empty() {
            let days = days_in_month(now.year(), now.month());
            let day = i32::try_from(now.day()).unwrap_or(0);
            let resolve = |d: i32| if d < 0 { days + d + 1 } else { d };
            if !self
                .days_of_month
                .iter()
                .any(|(s, e)| resolve(*s) <= day && day <= resolve(*e))
            {
                return false;
            }
        }
        true
    }
}

fn in_ranges<T: PartialOrd>(ranges: &[(T, T)], value: T) -> bool {
    ranges.iter().any(|(s, e)| *s <= value && value <= *e)
}

fn lookup(value: &str, names: &[&str], offset: u32) -> Option<u32> {
    let value = value.to_ascii_lowercase();
    names
        .iter()
        .position(|n| *n == value)
        .and_then(|i| u32::try_from(i).ok())
        .map(|i| i + offset)
}

fn parse_range<T: PartialOrd + Copy>(
    spec: &str,
    parse: impl Fn(&str) -> Option<T>,
    what: &str,
) -> Result<(T, T)> {
    let invalid = || NotifyError::invalid_config(format!("invalid {what} {spec:?}"));
    let (start, end) = match spec.split_once(':') {
        Some((s, e)) => (parse(s.trim()).ok_or_else(invalid)?, parse(e.trim()).ok_or_else(invalid)?),
        None => {
            let v = parse(spec.trim()).ok_or_else(invalid)?;
            (v, v)
        }
    };
    if start > end {
        return Err(NotifyError::invalid_config(format!(
            "{what} range {spec:?} ends before it starts"
        )));
    }
    Ok((start, end))
}

fn parse_clock(value: &str) -> Result<u32> {
    let invalid = || NotifyError::invalid_config(format!("invalid time {value:?}, expected HH:MM"));
    let (h, m) = value.split_once(':').ok_or_else(invalid)?;
    let h: u32 = h.parse().map_err(|_| invalid())?;
    let m: u32 = m.parse().map_err(|_| invalid())?;
    if m >= 60 || h > 24 || (h == 24 && m != 0) {
        return Err(invalid());
    }
    Ok(h * 60 + m)
}

fn days_in_month(year: i32, month: u32) -> i32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map_or(31, |d| i32::try_from(d.day()).unwrap_or(31))
}
