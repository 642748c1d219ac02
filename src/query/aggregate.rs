// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Aggregation functions.
//!
//! Applied per series. With an interval the points are grouped into
//! fixed windows in the database precision and every window produces one
//! output point stamped at the window end; without an interval the whole
//! range reduces to a single point.

use crate::error::{Result, TdbError};
use crate::points::{Point, PointType, Points, Value};
use crate::query::expr::resolve_time_expr;
use crate::query::grammar::{Gid, Node};
use crate::time::TimeModel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggrFn {
    Count,
    First,
    Last,
    Max,
    Min,
    Mean,
    Median,
    MedianLow,
    MedianHigh,
    Sum,
    Variance,
    PVariance,
    Stddev,
    Difference,
    Derivative,
}

impl AggrFn {
    pub fn from_name(name: &str) -> Result<AggrFn> {
        Ok(match name {
            "count" => AggrFn::Count,
            "first" => AggrFn::First,
            "last" => AggrFn::Last,
            "max" => AggrFn::Max,
            "min" => AggrFn::Min,
            "mean" => AggrFn::Mean,
            "median" => AggrFn::Median,
            "median_low" => AggrFn::MedianLow,
            "median_high" => AggrFn::MedianHigh,
            "sum" => AggrFn::Sum,
            "variance" => AggrFn::Variance,
            "pvariance" => AggrFn::PVariance,
            "stddev" => AggrFn::Stddev,
            "difference" => AggrFn::Difference,
            "derivative" => AggrFn::Derivative,
            other => {
                return Err(TdbError::Query(format!(
                    "unknown aggregation function '{other}'"
                )))
            }
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            AggrFn::Count => "count",
            AggrFn::First => "first",
            AggrFn::Last => "last",
            AggrFn::Max => "max",
            AggrFn::Min => "min",
            AggrFn::Mean => "mean",
            AggrFn::Median => "median",
            AggrFn::MedianLow => "median_low",
            AggrFn::MedianHigh => "median_high",
            AggrFn::Sum => "sum",
            AggrFn::Variance => "variance",
            AggrFn::PVariance => "pvariance",
            AggrFn::Stddev => "stddev",
            AggrFn::Difference => "difference",
            AggrFn::Derivative => "derivative",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Aggregation {
    pub func: AggrFn,
    /// Window width in database time units; 0 reduces the whole range.
    pub interval: u64,
}

impl Aggregation {
    /// Build from an `Aggregate` parse node.
    pub fn from_node(node: &Node, time: &TimeModel) -> Result<Aggregation> {
        let name = node
            .child(Gid::FnName)
            .map(|n| n.text.as_str())
            .unwrap_or_default();
        let func = AggrFn::from_name(name)?;
        let interval = match node.child(Gid::Interval) {
            Some(interval) => {
                let expr = interval
                    .children
                    .first()
                    .ok_or_else(|| TdbError::Query("missing aggregation interval".into()))?;
                let v = resolve_time_expr(&expr.text, time)?;
                if v == 0 {
                    return Err(TdbError::Query(
                        "aggregation interval must be positive".into(),
                    ));
                }
                v
            }
            None => 0,
        };
        Ok(Aggregation { func, interval })
    }

    /// Apply to one series' points.
    pub fn apply(&self, points: &Points) -> Result<Points> {
        if points.tp() == PointType::Log && self.func != AggrFn::Count {
            return Err(TdbError::Query(format!(
                "cannot use '{}' on a string series",
                self.func.name()
            )));
        }
        let out_tp = match self.func {
            AggrFn::Count => PointType::Int,
            AggrFn::Mean
            | AggrFn::Median
            | AggrFn::Variance
            | AggrFn::PVariance
            | AggrFn::Stddev
            | AggrFn::Derivative => PointType::Double,
            _ => points.tp(),
        };
        let mut out = Points::new(8, out_tp);
        if points.is_empty() {
            return Ok(out);
        }

        if self.interval == 0 {
            let group: Vec<&Point> = points.iter().collect();
            let ts = group.last().unwrap().ts;
            out.append_point(ts, self.reduce(&group)?);
            return Ok(out);
        }

        let mut start = 0;
        let slice = points.as_slice();
        while start < slice.len() {
            let window = slice[start].ts / self.interval;
            let mut end = start + 1;
            while end < slice.len() && slice[end].ts / self.interval == window {
                end += 1;
            }
            let group: Vec<&Point> = slice[start..end].iter().collect();
            let ts = (window + 1) * self.interval;
            out.append_point(ts, self.reduce(&group)?);
            start = end;
        }
        Ok(out)
    }

    fn reduce(&self, group: &[&Point]) -> Result<Value> {
        debug_assert!(!group.is_empty());
        let vals = || group.iter().map(|p| p.val.as_double());
        let is_int = matches!(group[0].val, Value::Int(_));

        Ok(match self.func {
            AggrFn::Count => Value::Int(group.len() as i64),
            AggrFn::First => group[0].val.clone(),
            AggrFn::Last => group[group.len() - 1].val.clone(),
            AggrFn::Max => pick(group, is_int, |a, b| a > b),
            AggrFn::Min => pick(group, is_int, |a, b| a < b),
            AggrFn::Sum => {
                if is_int {
                    Value::Int(group.iter().map(|p| p.val.as_int()).sum())
                } else {
                    Value::Double(vals().sum())
                }
            }
            AggrFn::Mean => Value::Double(vals().sum::<f64>() / group.len() as f64),
            AggrFn::Median => {
                let mut v: Vec<f64> = vals().collect();
                v.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                let n = v.len();
                if n % 2 == 1 {
                    Value::Double(v[n / 2])
                } else {
                    Value::Double((v[n / 2 - 1] + v[n / 2]) / 2.0)
                }
            }
            AggrFn::MedianLow => {
                let idx = (group.len() - 1) / 2;
                nth_value(group, idx, is_int)
            }
            AggrFn::MedianHigh => {
                let idx = group.len() / 2;
                nth_value(group, idx, is_int)
            }
            AggrFn::Variance => Value::Double(variance(&vals().collect::<Vec<_>>(), 1)),
            AggrFn::PVariance => Value::Double(variance(&vals().collect::<Vec<_>>(), 0)),
            AggrFn::Stddev => Value::Double(variance(&vals().collect::<Vec<_>>(), 1).sqrt()),
            AggrFn::Difference => {
                let first = &group[0].val;
                let last = &group[group.len() - 1].val;
                if is_int {
                    Value::Int(last.as_int() - first.as_int())
                } else {
                    Value::Double(last.as_double() - first.as_double())
                }
            }
            AggrFn::Derivative => {
                let span = group[group.len() - 1].ts.saturating_sub(group[0].ts);
                if span == 0 {
                    Value::Double(0.0)
                } else {
                    let diff =
                        group[group.len() - 1].val.as_double() - group[0].val.as_double();
                    Value::Double(diff / span as f64)
                }
            }
        })
    }
}

fn pick(group: &[&Point], is_int: bool, better: fn(f64, f64) -> bool) -> Value {
    let mut best = &group[0].val;
    for p in group.iter().skip(1) {
        if better(p.val.as_double(), best.as_double()) {
            best = &p.val;
        }
    }
    if is_int {
        Value::Int(best.as_int())
    } else {
        Value::Double(best.as_double())
    }
}

fn nth_value(group: &[&Point], idx: usize, is_int: bool) -> Value {
    let mut v: Vec<f64> = group.iter().map(|p| p.val.as_double()).collect();
    v.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    if is_int {
        Value::Int(v[idx] as i64)
    } else {
        Value::Double(v[idx])
    }
}

/// Variance with `ddof` delta degrees of freedom (0 = population,
/// 1 = sample). Groups smaller than `ddof + 1` yield 0.
fn variance(vals: &[f64], ddof: usize) -> f64 {
    let n = vals.len();
    if n <= ddof {
        return 0.0;
    }
    let mean = vals.iter().sum::<f64>() / n as f64;
    let sq: f64 = vals.iter().map(|v| (v - mean) * (v - mean)).sum();
    sq / (n - ddof) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_points(vals: &[(u64, i64)]) -> Points {
        let mut p = Points::new(vals.len(), PointType::Int);
        for &(ts, v) in vals {
            p.add_point(ts, Value::Int(v)).unwrap();
        }
        p
    }

    fn aggr(func: AggrFn, interval: u64) -> Aggregation {
        Aggregation { func, interval }
    }

    #[test]
    fn test_windowed_mean() {
        let points = int_points(&[(5, 10), (15, 20), (25, 30), (35, 40)]);
        // Windows of 20: [5,15] and [25,35].
        let out = aggr(AggrFn::Mean, 20).apply(&points).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out.get(0).unwrap().ts, 20);
        assert_eq!(out.get(0).unwrap().val, Value::Double(15.0));
        assert_eq!(out.get(1).unwrap().ts, 40);
        assert_eq!(out.get(1).unwrap().val, Value::Double(35.0));
    }

    #[test]
    fn test_whole_range_reduction() {
        let points = int_points(&[(1, 3), (2, 1), (3, 8)]);
        let out = aggr(AggrFn::Max, 0).apply(&points).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out.get(0).unwrap().ts, 3);
        assert_eq!(out.get(0).unwrap().val, Value::Int(8));
    }

    #[test]
    fn test_count_keeps_int_type() {
        let points = int_points(&[(1, 3), (2, 1)]);
        let out = aggr(AggrFn::Count, 0).apply(&points).unwrap();
        assert_eq!(out.get(0).unwrap().val, Value::Int(2));
    }

    #[test]
    fn test_median_variants_on_canonical_sequence() {
        // Canonical sequence 1, 3, 5, 7: median 4.0, low 3, high 5.
        let points = int_points(&[(1, 1), (2, 3), (3, 5), (4, 7)]);
        let med = aggr(AggrFn::Median, 0).apply(&points).unwrap();
        assert_eq!(med.get(0).unwrap().val, Value::Double(4.0));
        let low = aggr(AggrFn::MedianLow, 0).apply(&points).unwrap();
        assert_eq!(low.get(0).unwrap().val, Value::Int(3));
        let high = aggr(AggrFn::MedianHigh, 0).apply(&points).unwrap();
        assert_eq!(high.get(0).unwrap().val, Value::Int(5));

        // Odd length takes the middle element.
        let points = int_points(&[(1, 9), (2, 1), (3, 5)]);
        let med = aggr(AggrFn::Median, 0).apply(&points).unwrap();
        assert_eq!(med.get(0).unwrap().val, Value::Double(5.0));
    }

    #[test]
    fn test_variance_matches_sample_and_population() {
        let points = int_points(&[(1, 2), (2, 4), (3, 4), (4, 4), (5, 5), (6, 5), (7, 7), (8, 9)]);
        let var = aggr(AggrFn::Variance, 0).apply(&points).unwrap();
        match var.get(0).unwrap().val {
            Value::Double(v) => assert!((v - 4.571428571428571).abs() < 1e-9),
            _ => panic!("expected double"),
        }
        let pvar = aggr(AggrFn::PVariance, 0).apply(&points).unwrap();
        match pvar.get(0).unwrap().val {
            Value::Double(v) => assert!((v - 4.0).abs() < 1e-9),
            _ => panic!("expected double"),
        }
    }

    #[test]
    fn test_difference_and_derivative() {
        let points = int_points(&[(10, 100), (20, 160)]);
        let diff = aggr(AggrFn::Difference, 0).apply(&points).unwrap();
        assert_eq!(diff.get(0).unwrap().val, Value::Int(60));
        let der = aggr(AggrFn::Derivative, 0).apply(&points).unwrap();
        assert_eq!(der.get(0).unwrap().val, Value::Double(6.0));
    }

    #[test]
    fn test_string_series_rejects_numeric_fn() {
        let mut points = Points::new(1, PointType::Log);
        points.add_point(1, Value::Log(b"x".to_vec())).unwrap();
        assert!(aggr(AggrFn::Mean, 0).apply(&points).is_err());
        let count = aggr(AggrFn::Count, 0).apply(&points).unwrap();
        assert_eq!(count.get(0).unwrap().val, Value::Int(1));
    }
}
