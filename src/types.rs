//! Timestamps, status identifiers and clocks
use std::sync::Mutex;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};

use crate::error::HistoryError;

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
pub struct TimeStamp(DateTime<Utc>);

impl TimeStamp {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn new_with(
        year: i32,
        month: u32,
        day: u32,
        hour: u32,
        min: u32,
        sec: u32,
    ) -> Option<Self> {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .single()
            .map(Self)
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
    /// Smallest representable step after `self`, nanosecond resolution matches the CBOR encoding.
    pub fn successor(&self) -> Self {
        Self(self.0 + Duration::nanoseconds(1))
    }
    pub fn add_seconds(&self, secs: i64) -> Self {
        Self(self.0 + Duration::seconds(secs))
    }
    pub fn seconds_since(&self, earlier: &TimeStamp) -> f64 {
        (self.0 - earlier.0).num_milliseconds() as f64 / 1000.0
    }
    pub fn to_iso(&self) -> String {
        self.0.to_rfc3339_opts(SecondsFormat::AutoSi, true)
    }
    /// Accepts RFC 3339, naive `YYYY-MM-DDTHH:MM:SS[.f]` (read as UTC) and plain dates.
    pub fn parse_iso(value: &str) -> Result<Self, HistoryError> {
        let value = value.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
            return Ok(Self(dt.with_timezone(&Utc)));
        }
        for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
                return Ok(Self(naive.and_utc()));
            }
        }
        NaiveDate::parse_from_str(value, "%Y-%m-%d")
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|naive| Self(naive.and_utc()))
            .ok_or_else(|| HistoryError::InvalidTimestampFormat(value.to_string()))
    }
}

impl Default for TimeStamp {
    fn default() -> Self {
        Self::new()
    }
}

impl From<DateTime<Utc>> for TimeStamp {
    fn from(value: DateTime<Utc>) -> Self {
        TimeStamp(value)
    }
}

impl std::fmt::Display for TimeStamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_iso())
    }
}

impl<C> minicbor::Encode<C> for TimeStamp {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

/// Identifier of a status node, unique within its workflow.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, minicbor::Encode, minicbor::Decode)]
#[cbor(transparent)]
pub struct StatusId(#[n(0)] pub String);

impl StatusId {
    pub fn new<S: Into<String>>(name: S) -> Self {
        StatusId(name.into())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StatusId {
    fn from(s: &str) -> Self {
        StatusId(s.to_string())
    }
}

impl From<String> for StatusId {
    fn from(s: String) -> Self {
        StatusId(s)
    }
}

impl std::fmt::Display for StatusId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> TimeStamp;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> TimeStamp {
        TimeStamp::new()
    }
}

/// Manually driven clock, used for timeout jumps and history tests.
#[derive(Debug)]
pub struct FixedClock(Mutex<TimeStamp>);

impl FixedClock {
    pub fn new(at: TimeStamp) -> Self {
        Self(Mutex::new(at))
    }
    pub fn set(&self, at: TimeStamp) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = at;
    }
    pub fn advance_secs(&self, secs: i64) {
        let mut guard = self.0.lock().unwrap_or_else(|e| e.into_inner());
        *guard = guard.add_seconds(secs);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> TimeStamp {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_encoding() {
        let original = TimeStamp::new();

        let encoding = minicbor::to_vec(original).unwrap();
        let decode: TimeStamp = minicbor::decode(&encoding).unwrap();

        assert_eq!(original, decode);
    }

    #[test]
    fn successor_is_strictly_greater() {
        let ts = TimeStamp::new_with(2024, 6, 15, 10, 30, 0).unwrap();
        assert!(ts.successor() > ts);
        assert_eq!(
            (ts.successor().to_datetime_utc() - ts.to_datetime_utc()).num_nanoseconds(),
            Some(1)
        );
    }

    #[test]
    fn parse_iso_formats() {
        let expected = TimeStamp::new_with(2024, 6, 15, 10, 30, 0).unwrap();
        assert_eq!(TimeStamp::parse_iso("2024-06-15T10:30:00Z").unwrap(), expected);
        assert_eq!(TimeStamp::parse_iso("2024-06-15T12:30:00+02:00").unwrap(), expected);
        assert_eq!(TimeStamp::parse_iso("2024-06-15T10:30:00").unwrap(), expected);
        assert_eq!(
            TimeStamp::parse_iso("2024-06-15").unwrap(),
            TimeStamp::new_with(2024, 6, 15, 0, 0, 0).unwrap()
        );
        assert_eq!(
            TimeStamp::parse_iso("yesterday"),
            Err(HistoryError::InvalidTimestampFormat("yesterday".into()))
        );
    }

    #[test]
    fn status_id_encoding() {
        let status = StatusId::from("new");
        let encoding = minicbor::to_vec(&status).unwrap();
        let decode: StatusId = minicbor::decode(&encoding).unwrap();
        assert_eq!(status, decode);
        assert_eq!(status.to_string(), "new");
    }
}
