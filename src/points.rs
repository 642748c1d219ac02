// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Point containers.
//!
//! A [`Points`] vector keeps (ts, value) pairs ordered by timestamp.
//! Insertion shifts right from the tail so late-arriving points land at the
//! correct position; equal timestamps preserve insertion order.

use crate::error::{Result, TdbError};

/// Value type of a series, fixed at series creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointType {
    Int,
    Double,
    Log,
}

impl PointType {
    pub fn as_str(self) -> &'static str {
        match self {
            PointType::Int => "integer",
            PointType::Double => "float",
            PointType::Log => "string",
        }
    }
}

/// A tagged point value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Double(f64),
    Log(Vec<u8>),
}

impl Value {
    pub fn tp(&self) -> PointType {
        match self {
            Value::Int(_) => PointType::Int,
            Value::Double(_) => PointType::Double,
            Value::Log(_) => PointType::Log,
        }
    }

    pub fn as_int(&self) -> i64 {
        match self {
            Value::Int(v) => *v,
            Value::Double(v) => *v as i64,
            Value::Log(_) => 0,
        }
    }

    pub fn as_double(&self) -> f64 {
        match self {
            Value::Int(v) => *v as f64,
            Value::Double(v) => *v,
            Value::Log(_) => 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub ts: u64,
    pub val: Value,
}

/// Ordered sequence of typed points, ascending by timestamp.
#[derive(Debug, Clone)]
pub struct Points {
    tp: PointType,
    data: Vec<Point>,
}

impl Points {
    pub fn new(capacity: usize, tp: PointType) -> Self {
        Points {
            tp,
            data: Vec::with_capacity(capacity),
        }
    }

    pub fn tp(&self) -> PointType {
        self.tp
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Insert a point at its timestamp position. Rejects values of the
    /// wrong type for this container.
    pub fn add_point(&mut self, ts: u64, val: Value) -> Result<()> {
        if val.tp() != self.tp {
            return Err(TdbError::Insert(format!(
                "value type mismatch: expected {}",
                self.tp.as_str()
            )));
        }
        let mut i = self.data.len();
        while i > 0 && self.data[i - 1].ts > ts {
            i -= 1;
        }
        self.data.insert(i, Point { ts, val });
        Ok(())
    }

    /// Append without position search. The caller guarantees `ts` is not
    /// below the current last timestamp.
    pub fn append_point(&mut self, ts: u64, val: Value) {
        debug_assert!(self.data.last().map_or(true, |p| p.ts <= ts));
        self.data.push(Point { ts, val });
    }

    /// Shrink to `new_len` points, dropping the tail.
    pub fn resize(&mut self, new_len: usize) {
        self.data.truncate(new_len);
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn get(&self, i: usize) -> Option<&Point> {
        self.data.get(i)
    }

    pub fn first(&self) -> Option<&Point> {
        self.data.first()
    }

    pub fn last(&self) -> Option<&Point> {
        self.data.last()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Point> {
        self.data.iter()
    }

    pub fn as_slice(&self) -> &[Point] {
        &self.data
    }

    /// True when two consecutive points share a timestamp.
    pub fn has_duplicates(&self) -> bool {
        self.data.windows(2).any(|w| w[0].ts == w[1].ts)
    }

    /// Merge a sorted container into this one, keeping order.
    pub fn merge(&mut self, other: Points) {
        for p in other.data {
            let mut i = self.data.len();
            while i > 0 && self.data[i - 1].ts > p.ts {
                i -= 1;
            }
            self.data.insert(i, p);
        }
    }

    /// Extend with the in-range points of `other`, appending in order.
    pub fn extend_in_range(&mut self, other: &Points, start_ts: u64, end_ts: u64) {
        for p in other.iter() {
            if p.ts >= start_ts && p.ts <= end_ts {
                self.data.push(p.clone());
            }
        }
    }
}
