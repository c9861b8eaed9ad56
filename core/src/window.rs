use chrono::{DateTime, Duration, Utc};
use std::fmt;

use crate::errors::ConfigError;

/// Half-open time interval `[since, until)` handed to a source query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Window {
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
}

impl Window {
    pub fn new(since: DateTime<Utc>, until: DateTime<Utc>) -> Result<Self, ConfigError> {
        if since >= until {
            return Err(ConfigError::ValidationFailed {
                reason: format!("window start {since} is not before end {until}"),
            });
        }
        Ok(Self { since, until })
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.since <= instant && instant < self.until
    }

    pub fn duration(&self) -> Duration {
        self.until - self.since
    }

    /// Compact form used in file names, e.g. `20200101T0000_20200101T0010`.
    pub fn file_stem(&self) -> String {
        format!(
            "{}_{}",
            self.since.format("%Y%m%dT%H%M%S"),
            self.until.format("%Y%m%dT%H%M%S")
        )
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.since.to_rfc3339(), self.until.to_rfc3339())
    }
}

/// Contiguous windows of `stride` covering `[since, until)`; the last one is
/// clipped to `until`.
pub fn windows(
    since: DateTime<Utc>,
    until: DateTime<Utc>,
    stride: Duration,
) -> Result<Windows, ConfigError> {
    if stride <= Duration::zero() {
        return Err(ConfigError::ValidationFailed {
            reason: "window stride must be positive".to_string(),
        });
    }
    Ok(Windows {
        cursor: since,
        until,
        stride,
    })
}

#[derive(Debug, Clone)]
pub struct Windows {
    cursor: DateTime<Utc>,
    until: DateTime<Utc>,
    stride: Duration,
}

impl Windows {
    /// Start of the next window that has not been yielded yet.
    pub fn cursor(&self) -> DateTime<Utc> {
        self.cursor
    }
}

impl Iterator for Windows {
    type Item = Window;

    fn next(&mut self) -> Option<Window> {
        if self.cursor >= self.until {
            return None;
        }
        let end = self
            .cursor
            .checked_add_signed(self.stride)
            .map_or(self.until, |end| end.min(self.until));
        let window = Window {
            since: self.cursor,
            until: end,
        };
        self.cursor = end;
        Some(window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 1, 1, hour, minute, 0).unwrap()
    }

    #[test]
    fn test_three_strides_yield_three_contiguous_windows() {
        let stride = Duration::minutes(10);
        let all: Vec<Window> = windows(at(0, 0), at(0, 30), stride).unwrap().collect();

        assert_eq!(all.len(), 3);
        assert_eq!(all[0].since, at(0, 0));
        assert_eq!(all[2].until, at(0, 30));
        for pair in all.windows(2) {
            assert_eq!(pair[0].until, pair[1].since);
        }
    }

    #[test]
    fn test_last_window_is_clipped() {
        let all: Vec<Window> = windows(at(0, 0), at(0, 25), Duration::minutes(10))
            .unwrap()
            .collect();
        assert_eq!(all.len(), 3);
        assert_eq!(all[2].duration(), Duration::minutes(5));
    }

    #[test]
    fn test_empty_range_and_bad_stride() {
        assert_eq!(windows(at(1, 0), at(1, 0), Duration::minutes(1)).unwrap().count(), 0);
        assert!(windows(at(0, 0), at(1, 0), Duration::zero()).is_err());
        assert!(Window::new(at(1, 0), at(0, 0)).is_err());
    }

    #[test]
    fn test_stride_past_calendar_end_clips_to_until() {
        let all: Vec<Window> = windows(at(0, 0), at(1, 0), Duration::days(100_000_000))
            .unwrap()
            .collect();
        assert_eq!(all, vec![Window::new(at(0, 0), at(1, 0)).unwrap()]);
    }

    #[test]
    fn test_window_bounds_are_half_open() {
        let window = Window::new(at(0, 0), at(0, 10)).unwrap();
        assert!(window.contains(at(0, 0)));
        assert!(!window.contains(at(0, 10)));
        assert_eq!(window.file_stem(), "20200101T000000_20200101T001000");
    }
}
