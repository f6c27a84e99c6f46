//! Value comparison for restrictions evaluated in memory
//!
//! No type coercion: a string never equals a number.

use std::cmp::Ordering;

use regex::RegexBuilder;
use serde_json::Value;

use crate::syntax::CmpOp;

use super::sorter::compare_values;

/// Evaluates comparison operators against JSON values
pub struct ValueFilter;

impl ValueFilter {
    /// Returns true if `actual <op> expected` holds
    pub fn matches(op: CmpOp, actual: &Value, expected: &Value) -> bool {
        match op {
            CmpOp::Eq => Self::eq_match(actual, expected),
            CmpOp::Ne => {
                if expected.is_null() {
                    !actual.is_null()
                } else {
                    !actual.is_null() && !Self::eq_match(actual, expected)
                }
            }
            CmpOp::Lt => Self::ordered(actual, expected, |o| o == Ordering::Less),
            CmpOp::Lte => Self::ordered(actual, expected, |o| o != Ordering::Greater),
            CmpOp::Gt => Self::ordered(actual, expected, |o| o == Ordering::Greater),
            CmpOp::Gte => Self::ordered(actual, expected, |o| o != Ordering::Less),
            CmpOp::Like => Self::like_match(actual, expected, false),
            CmpOp::ILike => Self::like_match(actual, expected, true),
        }
    }

    /// Exact equality; `NULL` matches only null
    fn eq_match(actual: &Value, expected: &Value) -> bool {
        match (actual, expected) {
            (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
                (Some(ai), Some(bi)) => ai == bi,
                _ => a.as_f64() == b.as_f64(),
            },
            _ => actual == expected,
        }
    }

    /// Range comparison between numbers or between strings only
    fn ordered(actual: &Value, expected: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
        match (actual, expected) {
            (Value::Number(_), Value::Number(_)) | (Value::String(_), Value::String(_)) => {
                accept(compare_values(actual, expected))
            }
            _ => false,
        }
    }

    /// SQL LIKE: `%` any run, `_` any single character
    fn like_match(actual: &Value, pattern: &Value, case_insensitive: bool) -> bool {
        let (Value::String(text), Value::String(pattern)) = (actual, pattern) else {
            return false;
        };
        let mut regex = String::from("^");
        for c in pattern.chars() {
            match c {
                '%' => regex.push_str(".*"),
                '_' => regex.push('.'),
                c => regex.push_str(&regex::escape(&c.to_string())),
            }
        }
        regex.push('$');
        RegexBuilder::new(&regex)
            .case_insensitive(case_insensitive)
            .dot_matches_new_line(true)
            .build()
            .map(|re| re.is_match(text))
            .unwrap_or(false)
    }
}
