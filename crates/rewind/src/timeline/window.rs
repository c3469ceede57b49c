use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeDelta, TimeZone, Utc};

use crate::error::{RewindError, RewindResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> RewindResult<Self> {
        if end <= start {
            return Err(RewindError::InvalidWindow(format!(
                "end {end} is not after start {start}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn from_duration(start: DateTime<Utc>, duration: TimeDelta) -> RewindResult<Self> {
        let end = start
            .checked_add_signed(duration)
            .ok_or_else(|| RewindError::InvalidWindow(format!("duration {duration} overflows")))?;
        Self::new(start, end)
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }

    /// Overlap of two windows, `None` when they do not share any instant.
    pub fn intersect(&self, other: &TimeWindow) -> Option<TimeWindow> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (end > start).then_some(TimeWindow { start, end })
    }

    pub fn start_ticks(&self, timescale: u64) -> i128 {
        to_ticks(self.start, timescale)
    }

    pub fn end_ticks(&self, timescale: u64) -> i128 {
        to_ticks(self.end, timescale)
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

/// Ticks elapsed since the Unix epoch in the given timescale.
pub(crate) fn to_ticks(instant: DateTime<Utc>, timescale: u64) -> i128 {
    (instant.timestamp_millis() as i128 * timescale as i128).div_euclid(1000)
}

pub(crate) fn from_ticks(ticks: i128, timescale: u64) -> Option<DateTime<Utc>> {
    let millis = (ticks * 1000).div_euclid(timescale as i128);
    DateTime::from_timestamp_millis(i64::try_from(millis).ok()?)
}

/// Parses `YYYY-MM-DD HH:MM:SS` as a wall-clock time at the given UTC offset.
pub fn parse_local_datetime(input: &str, offset: FixedOffset) -> RewindResult<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(input.trim(), "%Y-%m-%d %H:%M:%S")
        .map_err(|e| RewindError::InvalidWindow(format!("invalid date {input}: {e}")))?;
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| RewindError::InvalidWindow(format!("ambiguous date {input}")))
}

/// Parses a `HH:MM:SS` clock duration.
pub fn parse_clock_duration(input: &str) -> RewindResult<TimeDelta> {
    let invalid = || RewindError::InvalidWindow(format!("invalid duration {input}, expected HH:MM:SS"));

    let parts = input
        .trim()
        .split(':')
        .map(|p| p.parse::<u32>().map_err(|_| invalid()))
        .collect::<RewindResult<Vec<_>>>()?;
    let &[hours, minutes, seconds] = parts.as_slice() else {
        return Err(invalid());
    };
    if minutes >= 60 || seconds >= 60 {
        return Err(invalid());
    }

    let total = hours as i64 * 3600 + minutes as i64 * 60 + seconds as i64;
    if total == 0 {
        return Err(invalid());
    }
    TimeDelta::try_seconds(total).ok_or_else(invalid)
}
