//! Array flattening: the on-disk layout for list-valued record fields.
//!
//! A field `v = [a, b, c]` is stored across columns `v_dim_0000`,
//! `v_dim_0001`, `v_dim_0002`. This is kept in one module, separate from the
//! rest of the ack queue, so a future JSON-blob encoding could replace it
//! without touching the queue's contract.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::record::{Record, Value};

/// Width of the zero-padded dimension suffix, e.g. `_dim_0000`.
const DIM_WIDTH: usize = 4;

fn dim_column(field: &str, index: usize) -> String {
    format!("{field}_dim_{index:0width$}", width = DIM_WIDTH)
}

/// Replaces every list-valued field `k` with `k_dim_0000 .. k_dim_{len-1}`.
/// Scalar fields pass through unchanged.
pub(crate) fn flatten_record(record: Record) -> Record {
    let mut flat = Record::new();
    for (key, value) in record {
        match value {
            Value::List(items) => {
                for (idx, item) in items.into_iter().enumerate() {
                    flat.insert(dim_column(&key, idx), item);
                }
            }
            other => {
                flat.insert(key, other);
            }
        }
    }
    flat
}

/// Groups columns whose name contains `_dim_` back into list fields, keyed on
/// the token before the first underscore. Any gap in the index sequence is a
/// data-integrity bug (the row was never validly written by this crate).
pub(crate) fn unflatten_record(flat: Record) -> Result<Record> {
    let mut record = Record::new();
    let mut arrays: BTreeMap<String, BTreeMap<usize, Value>> = BTreeMap::new();

    for (key, value) in flat {
        match split_dim_column(&key) {
            Some((base, index)) => {
                arrays.entry(base).or_default().insert(index, value);
            }
            None => {
                record.insert(key, value);
            }
        }
    }

    for (base, mut by_index) in arrays {
        let len = by_index.keys().max().map_or(0, |max| max + 1);
        let mut items = Vec::with_capacity(len);
        for idx in 0..len {
            let item = by_index.remove(&idx).ok_or_else(|| {
                Error::invalid_record(format!(
                    "array field `{base}` is missing dimension index {idx}"
                ))
            })?;
            items.push(item);
        }
        record.insert(base, Value::List(items));
    }

    Ok(record)
}

/// Splits `name_dim_0003` into `("name", 3)`. The base name is everything
/// before the first underscore, per the source's `key.split('_')[0]`.
fn split_dim_column(name: &str) -> Option<(String, usize)> {
    let dim_at = name.find("_dim_")?;
    let base_end = name.find('_').unwrap_or(dim_at);
    let base = name[..base_end].to_string();
    let index_str = &name[dim_at + "_dim_".len()..];
    let index: usize = index_str.parse().ok()?;
    Some((base, index))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flattens_list_field() {
        let mut record = Record::new();
        record.insert("v".to_string(), Value::from(vec![1_i64, 2, 3]));
        let flat = flatten_record(record);
        assert_eq!(flat.get("v_dim_0000"), Some(&Value::Int(1)));
        assert_eq!(flat.get("v_dim_0001"), Some(&Value::Int(2)));
        assert_eq!(flat.get("v_dim_0002"), Some(&Value::Int(3)));
    }

    #[test]
    fn round_trips_list_field() {
        let mut record = Record::new();
        record.insert("v".to_string(), Value::from(vec![1_i64, 2, 3]));
        record.insert("scalar".to_string(), Value::Int(9));
        let flat = flatten_record(record);
        let restored = unflatten_record(flat).expect("unflatten");
        assert_eq!(restored.get("v"), Some(&Value::List(vec![1.into(), 2.into(), 3.into()])));
        assert_eq!(restored.get("scalar"), Some(&Value::Int(9)));
    }

    #[test]
    fn rejects_gap_in_dimension_sequence() {
        let mut flat = Record::new();
        flat.insert("v_dim_0000".to_string(), Value::Int(1));
        flat.insert("v_dim_0002".to_string(), Value::Int(3));
        assert!(unflatten_record(flat).is_err());
    }
}
