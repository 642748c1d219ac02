// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Query engine.
//!
//! A query is parsed into a typed tree ([`grammar`]), walked into ordered
//! enter/exit steps ([`walker`]) and executed against the database
//! ([`queries`]). Results are built as a [`QpVal`] tree which serializes
//! both to the packed wire format and to JSON for the HTTP mirror.

pub mod aggregate;
pub mod expr;
pub mod grammar;
pub mod queries;
pub mod walker;

use crate::qpack::Packer;

/// A query result value.
#[derive(Debug, Clone, PartialEq)]
pub enum QpVal {
    Int(i64),
    Double(f64),
    Str(String),
    Bool(bool),
    Null,
    Arr(Vec<QpVal>),
    Map(Vec<(String, QpVal)>),
}

impl QpVal {
    pub fn success(msg: impl Into<String>) -> QpVal {
        QpVal::Map(vec![("success_msg".into(), QpVal::Str(msg.into()))])
    }

    /// Serialize into a packer.
    pub fn pack(&self, p: &mut Packer) {
        match self {
            QpVal::Int(v) => p.add_int(*v),
            QpVal::Double(v) => p.add_double(*v),
            QpVal::Str(s) => p.add_string(s),
            QpVal::Bool(b) => p.add_bool(*b),
            QpVal::Null => p.add_null(),
            QpVal::Arr(items) => {
                p.open_array();
                for item in items {
                    item.pack(p);
                }
                p.close_array();
            }
            QpVal::Map(entries) => {
                p.open_map();
                for (key, value) in entries {
                    p.add_string(key);
                    value.pack(p);
                }
                p.close_map();
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut p = Packer::new();
        self.pack(&mut p);
        p.into_bytes()
    }

    /// JSON mirror for the HTTP API.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            QpVal::Int(v) => serde_json::Value::from(*v),
            QpVal::Double(v) => serde_json::Value::from(*v),
            QpVal::Str(s) => serde_json::Value::from(s.as_str()),
            QpVal::Bool(b) => serde_json::Value::from(*b),
            QpVal::Null => serde_json::Value::Null,
            QpVal::Arr(items) => {
                serde_json::Value::Array(items.iter().map(QpVal::to_json).collect())
            }
            QpVal::Map(entries) => serde_json::Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

pub use queries::execute;
