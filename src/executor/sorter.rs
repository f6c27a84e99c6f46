//! Deterministic ordering of result rows

use std::cmp::Ordering;

use serde_json::Value;

use crate::source::Row;

/// Compares two JSON values for sorting.
///
/// Ordering rules:
/// - null < bool < number < string < array < object
/// - For same types, natural ordering
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    let type_order = |v: &Value| -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    };

    let a_type = type_order(a);
    let b_type = type_order(b);
    if a_type != b_type {
        return a_type.cmp(&b_type);
    }

    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(xi), Some(yi)) => xi.cmp(&yi),
            _ => {
                let xf = x.as_f64().unwrap_or(0.0);
                let yf = y.as_f64().unwrap_or(0.0);
                xf.partial_cmp(&yf).unwrap_or(Ordering::Equal)
            }
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (xv, yv) in x.iter().zip(y.iter()) {
                let ord = compare_values(xv, yv);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => Ordering::Equal,
    }
}

/// Sorts rows by precomputed sort keys
pub struct ResultSorter;

impl ResultSorter {
    /// Stable sort of `(row, keys)` pairs; `ascending[i]` gives key i direction
    pub fn sort(rows: &mut [(Row, Vec<Value>)], ascending: &[bool]) {
        rows.sort_by(|(_, a), (_, b)| {
            for (i, asc) in ascending.iter().enumerate() {
                let ordering = match (a.get(i), b.get(i)) {
                    (Some(x), Some(y)) => compare_values(x, y),
                    _ => Ordering::Equal,
                };
                let ordering = if *asc { ordering } else { ordering.reverse() };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        });
    }
}
