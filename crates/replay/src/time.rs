//! Log timestamps and time ranges.
//!
//! Times follow the ROS convention: whole seconds plus nanoseconds, with
//! `nsec` always normalised into `[0, 1e9)`.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ReplayError, Result};

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// A receive or header timestamp.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(from = "WireTime")]
pub struct Time {
    pub sec: u32,
    pub nsec: u32,
}

/// `Time` as it arrives on the wire; `nsec` may overflow into seconds.
#[derive(Deserialize)]
struct WireTime {
    sec: u32,
    nsec: u64,
}

impl From<WireTime> for Time {
    fn from(raw: WireTime) -> Self {
        Time::new(raw.sec, raw.nsec)
    }
}

impl Time {
    pub const ZERO: Time = Time { sec: 0, nsec: 0 };
    pub const MAX: Time = Time {
        sec: u32::MAX,
        nsec: (NANOS_PER_SEC - 1) as u32,
    };

    /// Build a time, carrying excess nanoseconds into seconds.
    pub fn new(sec: u32, nsec: u64) -> Self {
        let carry = nsec / NANOS_PER_SEC;
        let sec = (sec as u64).saturating_add(carry);
        if sec > u32::MAX as u64 {
            return Self::MAX;
        }
        Self {
            sec: sec as u32,
            nsec: (nsec % NANOS_PER_SEC) as u32,
        }
    }

    pub fn from_nanos(nanos: u64) -> Self {
        Self::new(0, nanos)
    }

    pub fn from_millis(millis: u64) -> Self {
        Self::from_nanos(millis.saturating_mul(1_000_000))
    }

    pub fn from_secs_f64(secs: f64) -> Self {
        if !secs.is_finite() || secs <= 0.0 {
            return Self::ZERO;
        }
        Self::from_nanos((secs * NANOS_PER_SEC as f64).round() as u64)
    }

    pub fn to_nanos(self) -> u64 {
        self.sec as u64 * NANOS_PER_SEC + self.nsec as u64
    }

    pub fn to_secs_f64(self) -> f64 {
        self.sec as f64 + self.nsec as f64 / NANOS_PER_SEC as f64
    }

    /// Shift by a signed nanosecond offset, saturating at both ends.
    pub fn offset(self, nanos: i64) -> Self {
        let base = self.to_nanos();
        let shifted = if nanos >= 0 {
            base.saturating_add(nanos as u64)
        } else {
            base.saturating_sub(nanos.unsigned_abs())
        };
        Self::from_nanos(shifted)
    }

    pub fn add_nanos(self, nanos: u64) -> Self {
        Self::from_nanos(self.to_nanos().saturating_add(nanos))
    }

    pub fn sub_nanos(self, nanos: u64) -> Self {
        Self::from_nanos(self.to_nanos().saturating_sub(nanos))
    }

    /// Nanoseconds from `earlier` to `self`, zero if `earlier` is later.
    pub fn nanos_since(self, earlier: Time) -> u64 {
        self.to_nanos().saturating_sub(earlier.to_nanos())
    }

    pub fn clamp_to(self, start: Time, end: Time) -> Self {
        self.max(start).min(end)
    }

    /// Linear interpolation between two times; `fraction` is clamped to `[0, 1]`.
    pub fn interpolate(start: Time, end: Time, fraction: f64) -> Self {
        let fraction = if fraction.is_nan() {
            0.0
        } else {
            fraction.clamp(0.0, 1.0)
        };
        let span = end.nanos_since(start) as f64;
        start.add_nanos((span * fraction).round() as u64)
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.sec, self.nsec)
    }
}

/// Parse `"12"`, `"12."` or `"12.345"` into a time.
///
/// Up to nine fractional digits are kept; longer fractions are rounded.
pub fn parse_time_str(s: &str) -> Option<Time> {
    let s = s.trim();
    let (whole, frac) = match s.split_once('.') {
        Some((whole, frac)) => (whole, frac),
        None => (s, ""),
    };
    if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let sec: u32 = whole.parse().ok()?;
    if frac.is_empty() {
        return Some(Time::new(sec, 0));
    }
    let nsec = if frac.len() <= 9 {
        let padded = format!("{frac:0<9}");
        padded.parse::<u64>().ok()?
    } else {
        let value: f64 = format!("0.{frac}").parse().ok()?;
        (value * NANOS_PER_SEC as f64).round() as u64
    };
    Some(Time::new(sec, nsec))
}

/// An inclusive `[start, end]` range of log time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Time,
    pub end: Time,
}

impl TimeRange {
    pub fn new(start: Time, end: Time) -> Result<Self> {
        if start > end {
            return Err(ReplayError::InvalidRange(format!(
                "start {start} is after end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    /// Range covering a single instant.
    pub fn instant(t: Time) -> Self {
        Self { start: t, end: t }
    }

    pub fn contains(&self, t: Time) -> bool {
        self.start <= t && t <= self.end
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// True when the ranges overlap or `other` starts right after `self` ends.
    pub fn touches(&self, other: &TimeRange) -> bool {
        self.overlaps(other)
            || self.end.add_nanos(1) == other.start
            || other.end.add_nanos(1) == self.start
    }

    pub fn intersect(&self, other: &TimeRange) -> Option<TimeRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start <= end).then_some(TimeRange { start, end })
    }

    pub fn union(&self, other: &TimeRange) -> TimeRange {
        TimeRange {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    pub fn duration_nanos(&self) -> u64 {
        self.end.nanos_since(self.start)
    }

    pub fn shift(&self, nanos: i64) -> TimeRange {
        TimeRange {
            start: self.start.offset(nanos),
            end: self.end.offset(nanos),
        }
    }

    /// Position of `t` within the range as a fraction in `[0, 1]`.
    pub fn fraction_of(&self, t: Time) -> f64 {
        let span = self.duration_nanos();
        if span == 0 {
            return 1.0;
        }
        t.clamp_to(self.start, self.end).nanos_since(self.start) as f64 / span as f64
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// Where the Player should seek once a source is loaded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SeekToTimeSpec {
    /// An exact log time.
    Absolute(Time),
    /// Offset from the start, or from the end when `from_end` is set.
    Relative { offset: Time, from_end: bool },
    /// Fraction of the source duration.
    Fraction(f64),
}

/// Resolve a seek spec against a source range; the result is always inside it.
pub fn seek_time_from_spec(spec: SeekToTimeSpec, range: TimeRange) -> Time {
    let raw = match spec {
        SeekToTimeSpec::Absolute(t) => t,
        SeekToTimeSpec::Relative {
            offset,
            from_end: false,
        } => range.start.add_nanos(offset.to_nanos()),
        SeekToTimeSpec::Relative {
            offset,
            from_end: true,
        } => range.end.sub_nanos(offset.to_nanos()),
        SeekToTimeSpec::Fraction(fraction) => Time::interpolate(range.start, range.end, fraction),
    };
    raw.clamp_to(range.start, range.end)
}
