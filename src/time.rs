use thiserror::Error;

pub const MINUTES_PER_DAY: u32 = 24 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeParseError {
    #[error("expected HH:MM, got {0:?}")]
    Format(String),
    #[error("hour out of range in {0:?}")]
    Hour(String),
    #[error("minute out of range in {0:?}")]
    Minute(String),
    #[error("end {ends_at} must be after start {starts_at}")]
    EmptyRange { starts_at: String, ends_at: String },
}

/// Wall-clock `HH:MM` (24h) to minutes since midnight.
///
/// `24:00` is accepted as the end-of-day boundary; nothing past it is.
pub fn time_to_minutes(t: &str) -> Result<u32, TimeParseError> {
    let t = t.trim();
    let Some((h, m)) = t.split_once(':') else {
        return Err(TimeParseError::Format(t.to_string()));
    };
    let digits = |s: &str| !s.is_empty() && s.len() <= 2 && s.bytes().all(|b| b.is_ascii_digit());
    if !digits(h) || m.len() != 2 || !digits(m) {
        return Err(TimeParseError::Format(t.to_string()));
    }
    let hour: u32 = h.parse().map_err(|_| TimeParseError::Format(t.to_string()))?;
    let minute: u32 = m.parse().map_err(|_| TimeParseError::Format(t.to_string()))?;
    if minute >= 60 {
        return Err(TimeParseError::Minute(t.to_string()));
    }
    let total = hour * 60 + minute;
    if hour > 24 || total > MINUTES_PER_DAY {
        return Err(TimeParseError::Hour(t.to_string()));
    }
    Ok(total)
}

pub fn minutes_to_time(m: u32) -> String {
    format!("{:02}:{:02}", m / 60, m % 60)
}

/// Half-open `[start, end)` interval in minutes since midnight.
///
/// Always non-empty and within the day: the only ways in are [`TimeRange::parse`]
/// and [`TimeRange::from_minutes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeRange {
    start: u32,
    end: u32,
}

impl TimeRange {
    pub fn parse(starts_at: &str, ends_at: &str) -> Result<Self, TimeParseError> {
        let start = time_to_minutes(starts_at)?;
        let end = time_to_minutes(ends_at)?;
        if start >= end {
            return Err(TimeParseError::EmptyRange {
                starts_at: starts_at.trim().to_string(),
                ends_at: ends_at.trim().to_string(),
            });
        }
        Ok(Self { start, end })
    }

    pub fn from_minutes(start: u32, end: u32) -> Result<Self, TimeParseError> {
        if end > MINUTES_PER_DAY {
            return Err(TimeParseError::Hour(minutes_to_time(end)));
        }
        if start >= end {
            return Err(TimeParseError::EmptyRange {
                starts_at: minutes_to_time(start),
                ends_at: minutes_to_time(end),
            });
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    pub fn duration_minutes(&self) -> u32 {
        self.end.saturating_sub(self.start)
    }

    pub fn starts_at(&self) -> String {
        minutes_to_time(self.start)
    }

    pub fn ends_at(&self) -> String {
        minutes_to_time(self.end)
    }
}

/// Serde adapter for minute fields stored as `HH:MM` strings.
pub mod hhmm {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(minutes: &u32, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::minutes_to_time(*minutes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
        let raw = String::deserialize(d)?;
        super::time_to_minutes(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wall_clock_times() {
        assert_eq!(time_to_minutes("00:00"), Ok(0));
        assert_eq!(time_to_minutes("09:30"), Ok(570));
        assert_eq!(time_to_minutes("9:05"), Ok(545));
        assert_eq!(time_to_minutes("23:59"), Ok(1439));
        assert_eq!(time_to_minutes("24:00"), Ok(1440));
    }

    #[test]
    fn rejects_malformed_times() {
        assert!(matches!(time_to_minutes("0930"), Err(TimeParseError::Format(_))));
        assert!(matches!(time_to_minutes("ab:cd"), Err(TimeParseError::Format(_))));
        assert!(matches!(time_to_minutes("9:5"), Err(TimeParseError::Format(_))));
        assert!(matches!(time_to_minutes(""), Err(TimeParseError::Format(_))));
        assert!(matches!(time_to_minutes("10:60"), Err(TimeParseError::Minute(_))));
        assert!(matches!(time_to_minutes("24:01"), Err(TimeParseError::Hour(_))));
        assert!(matches!(time_to_minutes("25:00"), Err(TimeParseError::Hour(_))));
    }

    #[test]
    fn formats_minutes_with_padding() {
        assert_eq!(minutes_to_time(0), "00:00");
        assert_eq!(minutes_to_time(545), "09:05");
        assert_eq!(minutes_to_time(1440), "24:00");
        for m in [0, 1, 59, 60, 61, 719, 1439, 1440] {
            assert_eq!(time_to_minutes(&minutes_to_time(m)), Ok(m));
        }
    }

    #[test]
    fn range_requires_positive_duration() {
        let r = TimeRange::parse("09:00", "10:15").expect("range");
        assert_eq!(r.duration_minutes(), 75);
        assert_eq!(r.starts_at(), "09:00");
        assert_eq!(r.ends_at(), "10:15");

        assert!(matches!(
            TimeRange::parse("10:00", "10:00"),
            Err(TimeParseError::EmptyRange { .. })
        ));
        assert!(matches!(
            TimeRange::parse("11:00", "10:00"),
            Err(TimeParseError::EmptyRange { .. })
        ));
    }

    #[test]
    fn minute_ranges_are_checked_like_parsed_ones() {
        let r = TimeRange::from_minutes(540, 600).expect("range");
        assert_eq!(r, TimeRange::parse("09:00", "10:00").expect("parsed"));
        assert_eq!((r.start(), r.end()), (540, 600));

        assert!(matches!(
            TimeRange::from_minutes(600, 600),
            Err(TimeParseError::EmptyRange { .. })
        ));
        assert!(matches!(
            TimeRange::from_minutes(610, 600),
            Err(TimeParseError::EmptyRange { .. })
        ));
        assert!(matches!(
            TimeRange::from_minutes(1400, 1441),
            Err(TimeParseError::Hour(_))
        ));
        assert!(TimeRange::from_minutes(1380, 1440).is_ok());
    }
}
