// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Where-expression engine.
//!
//! A boolean combination of `{prop OP operand}` conditions, built from the
//! parse tree into a binary AND/OR tree. Evaluation dispatches every leaf
//! to a per-object-kind callback which maps the property to a value and
//! compares with the operand's semantic type.

use regex::Regex;

use crate::error::{Result, TdbError};
use crate::groups::compile_pattern;
use crate::query::grammar::{Gid, Node};
use crate::time::TimeModel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Match,
    NotMatch,
}

impl Op {
    fn from_str(s: &str) -> Result<Op> {
        Ok(match s {
            "==" => Op::Eq,
            "!=" => Op::Ne,
            "<" => Op::Lt,
            "<=" => Op::Le,
            ">" => Op::Gt,
            ">=" => Op::Ge,
            "~" => Op::Match,
            "!~" => Op::NotMatch,
            other => {
                return Err(TdbError::Query(format!(
                    "unknown comparison operator '{other}'"
                )))
            }
        })
    }
}

#[derive(Debug, Clone)]
pub enum Operand {
    Int(i64),
    Double(f64),
    Str(String),
}

#[derive(Debug)]
pub struct Condition {
    pub prop: String,
    pub op: Op,
    pub operand: Operand,
    /// Compiled when the operator is ~ or !~.
    pub regex: Option<Regex>,
}

#[derive(Debug)]
pub enum Expr {
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Cond(Condition),
}

impl Expr {
    /// Build from a parse-tree `Where` child (the expression node).
    pub fn build(node: &Node, time: &TimeModel) -> Result<Expr> {
        match node.gid {
            Gid::ExprAnd => Ok(Expr::And(
                node.children
                    .iter()
                    .map(|c| Expr::build(c, time))
                    .collect::<Result<_>>()?,
            )),
            Gid::ExprOr => Ok(Expr::Or(
                node.children
                    .iter()
                    .map(|c| Expr::build(c, time))
                    .collect::<Result<_>>()?,
            )),
            Gid::Condition => {
                let prop = node.child(Gid::Prop).map(|n| n.text.clone()).unwrap_or_default();
                let op =
                    Op::from_str(node.child(Gid::Operator).map(|n| n.text.as_str()).unwrap_or(""))?;
                let operand_node = node
                    .child(Gid::Operand)
                    .ok_or_else(|| TdbError::Query("missing comparison value".into()))?;

                let is_string = operand_node.children.iter().any(|c| c.gid == Gid::Column);
                let operand = if is_string {
                    Operand::Str(operand_node.text.clone())
                } else if operand_node.text.contains('.') {
                    Operand::Double(
                        operand_node
                            .text
                            .parse()
                            .map_err(|_| TdbError::Query("invalid number".into()))?,
                    )
                } else if operand_node.text.chars().next().is_some_and(|c| {
                    c.is_ascii_digit() || c == '-'
                }) && operand_node.text != "now"
                    && !operand_node.text.contains("now")
                {
                    match operand_node.text.parse::<i64>() {
                        Ok(v) => Operand::Int(v),
                        // Duration literal like "1d".
                        Err(_) => Operand::Int(resolve_time_expr(&operand_node.text, time)? as i64),
                    }
                } else {
                    Operand::Int(resolve_time_expr(&operand_node.text, time)? as i64)
                };

                let regex = if matches!(op, Op::Match | Op::NotMatch) {
                    let source = match &operand {
                        Operand::Str(s) => s.clone(),
                        _ => {
                            return Err(TdbError::Query(
                                "the ~ operator expects a string".into(),
                            ))
                        }
                    };
                    Some(compile_pattern(&source)?)
                } else {
                    None
                };

                Ok(Expr::Cond(Condition {
                    prop,
                    op,
                    operand,
                    regex,
                }))
            }
            other => Err(TdbError::Query(format!(
                "unexpected node in where expression: {other:?}"
            ))),
        }
    }

    /// Evaluate against one object; `cb` answers each leaf condition.
    pub fn eval<F>(&self, cb: &F) -> bool
    where
        F: Fn(&Condition) -> bool,
    {
        match self {
            Expr::And(terms) => terms.iter().all(|t| t.eval(cb)),
            Expr::Or(terms) => terms.iter().any(|t| t.eval(cb)),
            Expr::Cond(cond) => cb(cond),
        }
    }
}

// ─────────────────────────────── comparators ────────────────────────────────

pub fn cmp_int(op: Op, left: i64, cond: &Condition) -> bool {
    let right = match &cond.operand {
        Operand::Int(v) => *v,
        Operand::Double(v) => *v as i64,
        Operand::Str(_) => return false,
    };
    match op {
        Op::Eq => left == right,
        Op::Ne => left != right,
        Op::Lt => left < right,
        Op::Le => left <= right,
        Op::Gt => left > right,
        Op::Ge => left >= right,
        Op::Match | Op::NotMatch => false,
    }
}

pub fn cmp_double(op: Op, left: f64, cond: &Condition) -> bool {
    let right = match &cond.operand {
        Operand::Int(v) => *v as f64,
        Operand::Double(v) => *v,
        Operand::Str(_) => return false,
    };
    match op {
        Op::Eq => left == right,
        Op::Ne => left != right,
        Op::Lt => left < right,
        Op::Le => left <= right,
        Op::Gt => left > right,
        Op::Ge => left >= right,
        Op::Match | Op::NotMatch => false,
    }
}

pub fn cmp_str(op: Op, left: &str, cond: &Condition) -> bool {
    match op {
        Op::Match => cond.regex.as_ref().is_some_and(|re| re.is_match(left)),
        Op::NotMatch => !cond.regex.as_ref().is_some_and(|re| re.is_match(left)),
        _ => {
            let right = match &cond.operand {
                Operand::Str(s) => s.as_str(),
                _ => return false,
            };
            match op {
                Op::Eq => left == right,
                Op::Ne => left != right,
                Op::Lt => left < right,
                Op::Le => left <= right,
                Op::Gt => left > right,
                Op::Ge => left >= right,
                Op::Match | Op::NotMatch => unreachable!(),
            }
        }
    }
}

// ─────────────────────────────── time expressions ───────────────────────────

/// Resolve a time operand like `now - 1d + 3600` into a timestamp in the
/// database precision.
pub fn resolve_time_expr(text: &str, time: &TimeModel) -> Result<u64> {
    let mut total: i128 = 0;
    let mut sign: i128 = 1;
    let mut term = String::new();

    let flush = |term: &mut String, sign: i128, total: &mut i128, time: &TimeModel| -> Result<()> {
        if term.is_empty() {
            return Err(TdbError::Query("invalid timestamp expression".into()));
        }
        let value: i128 = if term == "now" {
            time.now() as i128
        } else if term.chars().last().is_some_and(|c| c.is_ascii_alphabetic()) {
            time.parse_duration(term)? as i128
        } else {
            term.parse::<i128>()
                .map_err(|_| TdbError::Query("invalid timestamp expression".into()))?
        };
        *total += sign * value;
        term.clear();
        Ok(())
    };

    for c in text.chars() {
        match c {
            '+' => {
                flush(&mut term, sign, &mut total, time)?;
                sign = 1;
            }
            '-' => {
                flush(&mut term, sign, &mut total, time)?;
                sign = -1;
            }
            c if c.is_whitespace() => {}
            c => term.push(c),
        }
    }
    flush(&mut term, sign, &mut total, time)?;

    if total < 0 {
        return Err(TdbError::Query("timestamp expression is negative".into()));
    }
    Ok(total as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::grammar::parse;
    use crate::time::Precision;

    fn build_where(q: &str) -> Expr {
        let time = TimeModel::new(Precision::Seconds);
        let node = parse(q).unwrap();
        let where_node = node.child(Gid::Where).unwrap();
        Expr::build(&where_node.children[0], &time).unwrap()
    }

    #[test]
    fn test_simple_condition() {
        let expr = build_where("list series where length > 100");
        let hit = expr.eval(&|c| {
            assert_eq!(c.prop, "length");
            cmp_int(c.op, 150, c)
        });
        assert!(hit);
        let miss = expr.eval(&|c| cmp_int(c.op, 50, c));
        assert!(!miss);
    }

    #[test]
    fn test_and_or_combination() {
        let expr = build_where("list series where length > 10 and length < 20 or length == 99");
        // or(and(>10, <20), ==99)
        assert!(expr.eval(&|c| cmp_int(c.op, 15, c)));
        assert!(expr.eval(&|c| cmp_int(c.op, 99, c)));
        assert!(!expr.eval(&|c| cmp_int(c.op, 25, c)));
    }

    #[test]
    fn test_braces_group() {
        let expr = build_where("list series where {length > 10 or length == 1} and length < 20");
        assert!(expr.eval(&|c| cmp_int(c.op, 15, c)));
        assert!(expr.eval(&|c| cmp_int(c.op, 1, c)));
        assert!(!expr.eval(&|c| cmp_int(c.op, 30, c)));
    }

    #[test]
    fn test_regex_condition() {
        let expr = build_where("list series where name ~ \"^cpu\"");
        assert!(expr.eval(&|c| cmp_str(c.op, "cpu.load", c)));
        assert!(!expr.eval(&|c| cmp_str(c.op, "mem.free", c)));

        let expr = build_where("list series where name !~ \"^cpu\"");
        assert!(expr.eval(&|c| cmp_str(c.op, "mem.free", c)));
    }

    #[test]
    fn test_time_expr_resolution() {
        let time = TimeModel::new(Precision::Seconds);
        assert_eq!(resolve_time_expr("100", &time).unwrap(), 100);
        assert_eq!(resolve_time_expr("1d", &time).unwrap(), 86400);
        assert_eq!(resolve_time_expr("1d+10", &time).unwrap(), 86410);
        let now = time.now();
        let v = resolve_time_expr("now-1h", &time).unwrap();
        assert!(v >= now - 3610 && v <= now - 3590);
        assert!(resolve_time_expr("", &time).is_err());
        assert!(resolve_time_expr("-5", &time).is_err());
    }

    #[test]
    fn test_string_equality() {
        let expr = build_where("list series where type == integer");
        assert!(expr.eval(&|c| cmp_str(c.op, "integer", c)));
        assert!(!expr.eval(&|c| cmp_str(c.op, "float", c)));
    }
}
