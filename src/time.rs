// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Time precision model.
//!
//! Every database fixes one precision at creation time. Timestamps are
//! stored as `u64` scaled by `factor = 1000^index`; seconds precision keeps
//! every legal timestamp below 2^32 so series created under it may store
//! 32-bit timestamps on disk.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TdbError};

/// Timestamp precision of a database, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Precision {
    #[serde(rename = "s")]
    Seconds,
    #[serde(rename = "ms")]
    Milliseconds,
    #[serde(rename = "us")]
    Microseconds,
    #[serde(rename = "ns")]
    Nanoseconds,
}

impl Precision {
    pub fn index(self) -> u32 {
        match self {
            Precision::Seconds => 0,
            Precision::Milliseconds => 1,
            Precision::Microseconds => 2,
            Precision::Nanoseconds => 3,
        }
    }

    /// Conversion factor between wall-clock seconds and stored timestamps.
    pub fn factor(self) -> u64 {
        1000u64.pow(self.index())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Precision::Seconds => "s",
            Precision::Milliseconds => "ms",
            Precision::Microseconds => "us",
            Precision::Nanoseconds => "ns",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "s" => Some(Precision::Seconds),
            "ms" => Some(Precision::Milliseconds),
            "us" => Some(Precision::Microseconds),
            "ns" => Some(Precision::Nanoseconds),
            _ => None,
        }
    }
}

/// Per-database time model: precision plus derived constants.
#[derive(Debug, Clone)]
pub struct TimeModel {
    pub precision: Precision,
    pub factor: u64,
    /// Timestamp width in bytes for raw shard storage.
    pub ts_sz: usize,
}

impl TimeModel {
    pub fn new(precision: Precision) -> Self {
        TimeModel {
            precision,
            factor: precision.factor(),
            ts_sz: if precision == Precision::Seconds { 4 } else { 8 },
        }
    }

    /// Scale wall-clock seconds into a database timestamp.
    pub fn scale(&self, wall_ts_seconds: u64) -> u64 {
        wall_ts_seconds * self.factor
    }

    /// Database timestamp back to whole wall-clock seconds.
    pub fn to_seconds(&self, db_ts: u64) -> u64 {
        db_ts / self.factor
    }

    /// Current wall-clock time in database precision.
    pub fn now(&self) -> u64 {
        let dur = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        match self.precision {
            Precision::Seconds => dur.as_secs(),
            Precision::Milliseconds => dur.as_millis() as u64,
            Precision::Microseconds => dur.as_micros() as u64,
            Precision::Nanoseconds => dur.as_nanos() as u64,
        }
    }

    /// Check whether `ts` is valid for this precision. Seconds precision
    /// only accepts timestamps fitting 32 bits.
    pub fn valid_ts(&self, ts: u64) -> bool {
        self.precision != Precision::Seconds || ts < (1u64 << 32)
    }

    /// Parse a duration literal like "2h" or "1w" into a database
    /// timestamp span. The trailing unit is one of s/m/h/d/w.
    pub fn parse_duration(&self, s: &str) -> Result<u64> {
        let s = s.trim();
        let (num, unit) = s.split_at(s.len().saturating_sub(1));
        let n: u64 = num
            .parse()
            .map_err(|_| TdbError::Query(format!("invalid duration: '{s}'")))?;
        let seconds = match unit {
            "s" => n,
            "m" => n * 60,
            "h" => n * 3600,
            "d" => n * 86400,
            "w" => n * 604800,
            _ => return Err(TdbError::Query(format!("invalid duration unit: '{s}'"))),
        };
        Ok(seconds * self.factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factor_per_precision() {
        assert_eq!(Precision::Seconds.factor(), 1);
        assert_eq!(Precision::Milliseconds.factor(), 1_000);
        assert_eq!(Precision::Microseconds.factor(), 1_000_000);
        assert_eq!(Precision::Nanoseconds.factor(), 1_000_000_000);
    }

    #[test]
    fn test_parse_duration_units() {
        let tm = TimeModel::new(Precision::Seconds);
        assert_eq!(tm.parse_duration("10s").unwrap(), 10);
        assert_eq!(tm.parse_duration("2m").unwrap(), 120);
        assert_eq!(tm.parse_duration("3h").unwrap(), 10800);
        assert_eq!(tm.parse_duration("1d").unwrap(), 86400);
        assert_eq!(tm.parse_duration("1w").unwrap(), 604800);
        assert!(tm.parse_duration("5x").is_err());
    }

    #[test]
    fn test_parse_duration_scales_with_precision() {
        let tm = TimeModel::new(Precision::Milliseconds);
        assert_eq!(tm.parse_duration("1s").unwrap(), 1000);
    }

    #[test]
    fn test_seconds_precision_ts_range() {
        let tm = TimeModel::new(Precision::Seconds);
        assert!(tm.valid_ts(u32::MAX as u64));
        assert!(!tm.valid_ts(1u64 << 32));
        let tm = TimeModel::new(Precision::Nanoseconds);
        assert!(tm.valid_ts(u64::MAX));
    }
}
