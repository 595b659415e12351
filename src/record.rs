//! The dynamic record type records flow through the queue as.
//!
//! A [`Record`] is a map from field name to [`Value`]. `Value` deliberately
//! has no variant for a nested mapping: the source rejects dicts-within-dicts
//! at the boundary, and here that invariant is enforced by the type itself
//! rather than by a runtime check.

use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// A single scalar or homogeneous-list field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Real(f64),
    Text(String),
    List(Vec<Value>),
}

impl Value {
    /// SQL column type this value would create, per the source's
    /// `create_column` type inference (`str`→TEXT, `float`→REAL,
    /// `int`→INTEGER, anything else→TEXT).
    pub(crate) fn sql_type(&self) -> &'static str {
        match self {
            Value::Int(_) => "INTEGER",
            Value::Real(_) => "REAL",
            Value::Text(_) => "TEXT",
            Value::Null => "TEXT",
            Value::List(_) => unreachable!("list values are flattened before schema inference"),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Real(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(v) => Some(v.as_slice()),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::List(v.into_iter().map(Into::into).collect())
    }
}

impl From<Option<i64>> for Value {
    fn from(v: Option<i64>) -> Self {
        v.map_or(Value::Null, Value::Int)
    }
}

/// A mapping from field name to value. Field names must be empty, and must
/// not collide with the reserved columns `_id`, `timestamp`, `status`, and
/// must not contain the array-dimension marker `_dim_` (that suffix is
/// reserved for flattened list columns, see [`crate::flatten`]).
pub type Record = BTreeMap<String, Value>;

pub(crate) const RESERVED_COLUMNS: [&str; 3] = ["_id", "timestamp", "status"];

/// Validates that `record` is non-empty and every field name is a safe SQL
/// identifier that doesn't collide with reserved machinery.
pub(crate) fn validate_record(record: &Record) -> Result<()> {
    if record.is_empty() {
        return Err(Error::invalid_record("record must have at least one field"));
    }
    for name in record.keys() {
        validate_field_name(name)?;
    }
    Ok(())
}

pub(crate) fn validate_field_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::invalid_record("field name must not be empty"));
    }
    if RESERVED_COLUMNS.contains(&name) {
        return Err(Error::invalid_record(format!(
            "field name `{name}` is reserved"
        )));
    }
    if name.contains("_dim_") {
        return Err(Error::invalid_record(format!(
            "field name `{name}` must not contain the reserved `_dim_` marker"
        )));
    }
    let mut chars = name.chars();
    let first_ok = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !first_ok || !rest_ok {
        return Err(Error::invalid_record(format!(
            "field name `{name}` is not a valid identifier"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_record() {
        let record: Record = Record::new();
        assert!(validate_record(&record).is_err());
    }

    #[test]
    fn rejects_reserved_field_names() {
        let mut record = Record::new();
        record.insert("_id".to_string(), Value::Int(1));
        assert!(validate_record(&record).is_err());
    }

    #[test]
    fn rejects_dim_marker_in_field_names() {
        let mut record = Record::new();
        record.insert("v_dim_0000".to_string(), Value::Int(1));
        assert!(validate_record(&record).is_err());
    }

    #[test]
    fn accepts_well_formed_record() {
        let mut record = Record::new();
        record.insert("id".to_string(), Value::Int(1));
        record.insert("color".to_string(), Value::Text("red".into()));
        assert!(validate_record(&record).is_ok());
    }
}
