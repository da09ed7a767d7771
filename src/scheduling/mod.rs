//! Slot availability and booking conflict detection.
//!
//! Times of day are handled as minutes since local midnight. Candidate slots
//! start at each shift's start and advance in fixed steps; a slot is offered
//! when the whole requested duration fits inside the shift, does not overlap
//! an active booking and, for today, starts after the current local time.

mod availability;

pub use availability::*;

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeZone, Utc};
use thiserror::Error;

const MINUTES_PER_DAY: u32 = 24 * 60;

#[derive(Debug, Error)]
pub enum SchedulingError {
    #[error("Invalid date '{0}', expected YYYY-MM-DD")]
    InvalidDate(String),
    #[error("Invalid time '{0}', expected HH:MM")]
    InvalidTime(String),
    #[error("Date is in the past")]
    PastDate,
    #[error("Date is more than {0} days ahead")]
    BeyondHorizon(i64),
    #[error("Requested time is no longer available")]
    InPast,
    #[error("Time overlaps an existing booking at {0}")]
    Conflict(String),
    #[error("Time is outside working hours")]
    OutsideWorkingHours,
    #[error("Unknown service: {0}")]
    UnknownService(String),
    #[error("Invalid duration")]
    InvalidDuration,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Parse `HH:MM` into minutes since midnight. `24:00` is accepted as end of day.
pub fn parse_hhmm(value: &str) -> Result<u32, SchedulingError> {
    let invalid = || SchedulingError::InvalidTime(value.to_string());
    let (h, m) = value.trim().split_once(':').ok_or_else(invalid)?;
    if h.is_empty() || h.len() > 2 || m.len() != 2 {
        return Err(invalid());
    }
    let hours: u32 = h.parse().map_err(|_| invalid())?;
    let minutes: u32 = m.parse().map_err(|_| invalid())?;
    if minutes >= 60 {
        return Err(invalid());
    }
    let total = hours * 60 + minutes;
    if total > MINUTES_PER_DAY {
        return Err(invalid());
    }
    Ok(total)
}

pub fn format_hhmm(minutes: u32) -> String {
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}

pub fn parse_date(value: &str) -> Result<NaiveDate, SchedulingError> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|_| SchedulingError::InvalidDate(value.to_string()))
}

/// Weekday index stored in `work_shifts` (0 = Monday .. 6 = Sunday)
pub fn weekday_index(date: NaiveDate) -> i64 {
    date.weekday().num_days_from_monday() as i64
}

/// A working interval `[start, end)` in minutes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shift {
    pub start: u32,
    pub end: u32,
}

impl Shift {
    pub fn parse(start: &str, end: &str) -> Result<Self, SchedulingError> {
        Ok(Self {
            start: parse_hhmm(start)?,
            end: parse_hhmm(end)?,
        })
    }

    pub fn contains(&self, start: u32, duration: u32) -> bool {
        start >= self.start && start + duration <= self.end
    }
}

/// An occupied interval, typically an active booking
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusyInterval {
    pub start: u32,
    pub duration: u32,
    /// Booking id, used to exclude a booking from its own conflict check
    pub id: String,
}

/// Half-open interval overlap; touching intervals do not overlap
pub fn overlaps(a_start: u32, a_len: u32, b_start: u32, b_len: u32) -> bool {
    a_start < b_start + b_len && b_start < a_start + a_len
}

/// Every start time, stepping `slot_minutes` from each shift start, at which
/// `duration` fits inside the shift. Sorted and deduplicated.
pub fn candidate_slots(shifts: &[Shift], slot_minutes: u32, duration: u32) -> Vec<u32> {
    if slot_minutes == 0 || duration == 0 {
        return Vec::new();
    }

    let mut slots = Vec::new();
    for shift in shifts {
        let mut start = shift.start;
        while start + duration <= shift.end {
            slots.push(start);
            start += slot_minutes;
        }
    }
    slots.sort_unstable();
    slots.dedup();
    slots
}

/// Inputs for one day of availability
#[derive(Debug, Clone)]
pub struct SlotQuery<'a> {
    pub shifts: &'a [Shift],
    pub busy: &'a [BusyInterval],
    pub slot_minutes: u32,
    pub duration: u32,
    /// Current local time when the day is today; slots must start after it
    pub now_minutes: Option<u32>,
}

pub fn available_slots(query: &SlotQuery<'_>) -> Vec<u32> {
    candidate_slots(query.shifts, query.slot_minutes, query.duration)
        .into_iter()
        .filter(|&start| query.now_minutes.map_or(true, |now| start > now))
        .filter(|&start| {
            !query
                .busy
                .iter()
                .any(|b| overlaps(start, query.duration, b.start, b.duration))
        })
        .collect()
}

/// First busy interval overlapping `[start, start + duration)`, ignoring `exclude_id`
pub fn first_conflict<'a>(
    busy: &'a [BusyInterval],
    start: u32,
    duration: u32,
    exclude_id: Option<&str>,
) -> Option<&'a BusyInterval> {
    busy.iter()
        .filter(|b| exclude_id.map_or(true, |id| b.id != id))
        .find(|b| overlaps(start, duration, b.start, b.duration))
}

pub fn fits_in_shifts(shifts: &[Shift], start: u32, duration: u32) -> bool {
    shifts.iter().any(|s| s.contains(start, duration))
}

/// Business-local wall clock at a fixed UTC offset
#[derive(Debug, Clone, Copy)]
pub struct BusinessClock {
    offset: FixedOffset,
}

impl BusinessClock {
    pub fn new(utc_offset_minutes: i32) -> Self {
        let offset = FixedOffset::east_opt(utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix());
        Self { offset }
    }

    pub fn local(&self, at: DateTime<Utc>) -> NaiveDateTime {
        at.with_timezone(&self.offset).naive_local()
    }

    pub fn now_local(&self) -> NaiveDateTime {
        self.local(Utc::now())
    }

    /// UTC instant of a local date and minute of day
    pub fn to_utc(&self, date: NaiveDate, minutes: u32) -> DateTime<Utc> {
        let local = date.and_time(NaiveTime::MIN) + chrono::Duration::minutes(minutes as i64);
        let utc = local - chrono::Duration::seconds(self.offset.local_minus_utc() as i64);
        Utc.from_utc_datetime(&utc)
    }
}

/// Minutes since midnight of a local timestamp
pub fn minutes_of_day(at: NaiveDateTime) -> u32 {
    use chrono::Timelike;
    at.hour() * 60 + at.minute()
}
