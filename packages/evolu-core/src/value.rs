//! Dynamic column value type.
//!
//! Every cell in the row store and every `Message` carries one of these.
//! Deliberately narrower than a general JSON value: SQLite's own storage
//! classes (NULL, TEXT, INTEGER, REAL, BLOB) are exactly what a last-writer-
//! wins column needs.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum Value {
    Null,
    Text(String),
    Int(i64),
    Real(f64),
    Bytes(#[serde(with = "serde_bytes")] Vec<u8>),
}

impl Value {
    /// Column-equality used by the query patch differ: binary comparison for
    /// `Bytes`, value comparison otherwise (`Real` included -- query rows
    /// never carry NaN in practice, and `PartialEq` already does the
    /// reasonable thing for the finite values columns actually hold).
    #[must_use]
    pub fn cell_eq(&self, other: &Value) -> bool {
        self == other
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Int(i64::from(b))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Real(f)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}
