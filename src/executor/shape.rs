//! Result shaping: GROUP BY, aggregates, ORDER BY, DISTINCT, LIMIT/OFFSET
//!
//! Input is a list of variable bindings; output rows follow the selection
//! list. Shared by in-memory sources and aggregate steps, which re-apply the
//! original shape over rows assembled from several sources.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::source::{QueryArgs, Row};
use crate::syntax::{Operand, Select, SortTerm};

use super::errors::{ExecutorError, ExecutorResult};
use super::sorter::{compare_values, ResultSorter};

/// Variable name -> value
pub type Binding = BTreeMap<String, Value>;

/// Output shape of a SELECT branch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultShape {
    pub selection: Vec<Operand>,
    pub groupby: Vec<String>,
    pub orderby: Vec<SortTerm>,
    pub distinct: bool,
    pub limit: Option<u64>,
    pub offset: u64,
}

impl ResultShape {
    /// Shape of `select`, modifiers included
    pub fn of(select: &Select) -> Self {
        Self {
            selection: select.selection.clone(),
            groupby: select.groupby.clone(),
            orderby: select.orderby.clone(),
            distinct: select.distinct,
            limit: select.limit,
            offset: select.offset,
        }
    }

    /// Plain projection of `vars`, no modifiers
    pub fn projection(vars: &[String]) -> Self {
        Self {
            selection: vars.iter().map(|v| Operand::var(v.clone())).collect(),
            ..Self::default()
        }
    }

    pub fn is_aggregated(&self) -> bool {
        !self.groupby.is_empty() || self.selection.iter().any(Operand::is_aggregate)
    }

    /// Every variable the shape reads, sorted
    pub fn variables(&self) -> Vec<String> {
        let mut vars = BTreeSet::new();
        for term in &self.selection {
            term.variables(&mut vars);
        }
        vars.extend(self.groupby.iter().cloned());
        for sort in &self.orderby {
            sort.term.variables(&mut vars);
        }
        vars.into_iter().collect()
    }

    /// Applies the shape to `bindings`
    pub fn apply(&self, bindings: Vec<Binding>, args: &QueryArgs) -> ExecutorResult<Vec<Row>> {
        let groups: Vec<Vec<Binding>> = if self.is_aggregated() {
            self.group(bindings)
        } else {
            bindings.into_iter().map(|b| vec![b]).collect()
        };

        let mut keyed: Vec<(Row, Vec<Value>)> = Vec::with_capacity(groups.len());
        for group in &groups {
            let row = self
                .selection
                .iter()
                .map(|term| evaluate(term, group, args))
                .collect::<ExecutorResult<Row>>()?;
            let keys = self
                .orderby
                .iter()
                .map(|sort| evaluate(&sort.term, group, args))
                .collect::<ExecutorResult<Vec<Value>>>()?;
            keyed.push((row, keys));
        }

        if !self.orderby.is_empty() {
            let ascending: Vec<bool> = self.orderby.iter().map(|s| s.asc).collect();
            ResultSorter::sort(&mut keyed, &ascending);
        }

        let mut rows: Vec<Row> = keyed.into_iter().map(|(row, _)| row).collect();
        if self.distinct {
            rows = dedup_rows(rows);
        }
        Ok(apply_window(rows, self.limit, self.offset))
    }

    fn group(&self, bindings: Vec<Binding>) -> Vec<Vec<Binding>> {
        if self.groupby.is_empty() {
            // aggregates without GROUP BY always yield one row
            return vec![bindings];
        }
        let mut order: Vec<Vec<Value>> = Vec::new();
        let mut groups: Vec<Vec<Binding>> = Vec::new();
        for binding in bindings {
            let key: Vec<Value> = self
                .groupby
                .iter()
                .map(|v| binding.get(v).cloned().unwrap_or(Value::Null))
                .collect();
            match order.iter().position(|k| *k == key) {
                Some(i) => groups[i].push(binding),
                None => {
                    order.push(key);
                    groups.push(vec![binding]);
                }
            }
        }
        groups
    }
}

/// Removes duplicate rows, keeping first occurrences
pub fn dedup_rows(rows: Vec<Row>) -> Vec<Row> {
    let mut seen: Vec<Row> = Vec::new();
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        if !seen.contains(&row) {
            seen.push(row.clone());
            out.push(row);
        }
    }
    out
}

/// Skips `offset` rows then keeps at most `limit`
pub fn apply_window(rows: Vec<Row>, limit: Option<u64>, offset: u64) -> Vec<Row> {
    let iter = rows.into_iter().skip(offset as usize);
    match limit {
        Some(limit) => iter.take(limit as usize).collect(),
        None => iter.collect(),
    }
}

fn evaluate(term: &Operand, group: &[Binding], args: &QueryArgs) -> ExecutorResult<Value> {
    match term {
        Operand::Var(name) => Ok(group
            .first()
            .and_then(|b| b.get(name))
            .cloned()
            .unwrap_or(Value::Null)),
        Operand::Const(constant) => Ok(constant.resolve(args)),
        Operand::Func(name, fargs) => {
            let upper = name.to_ascii_uppercase();
            match upper.as_str() {
                "COUNT" | "MIN" | "MAX" | "SUM" | "AVG" => {
                    let arg = fargs.first().ok_or_else(|| unsupported(name))?;
                    let mut values = Vec::new();
                    for binding in group {
                        let value = evaluate(arg, std::slice::from_ref(binding), args)?;
                        if !value.is_null() {
                            values.push(value);
                        }
                    }
                    Ok(aggregate(&upper, values))
                }
                "UPPER" | "LOWER" => {
                    let arg = fargs.first().ok_or_else(|| unsupported(name))?;
                    let value = evaluate(arg, group, args)?;
                    Ok(match value {
                        Value::String(s) if upper == "UPPER" => Value::String(s.to_uppercase()),
                        Value::String(s) => Value::String(s.to_lowercase()),
                        other => other,
                    })
                }
                _ => Err(unsupported(name)),
            }
        }
    }
}

fn unsupported(name: &str) -> ExecutorError {
    ExecutorError::UnsupportedFunction {
        name: name.to_string(),
    }
}

fn aggregate(function: &str, values: Vec<Value>) -> Value {
    match function {
        "COUNT" => Value::from(values.len() as u64),
        "MIN" => values
            .into_iter()
            .min_by(compare_values)
            .unwrap_or(Value::Null),
        "MAX" => values
            .into_iter()
            .max_by(compare_values)
            .unwrap_or(Value::Null),
        "SUM" | "AVG" => {
            let numbers: Vec<&serde_json::Number> = values
                .iter()
                .filter_map(|v| match v {
                    Value::Number(n) => Some(n),
                    _ => None,
                })
                .collect();
            if numbers.is_empty() {
                return Value::Null;
            }
            if function == "SUM" && numbers.iter().all(|n| n.is_i64()) {
                return Value::from(numbers.iter().filter_map(|n| n.as_i64()).sum::<i64>());
            }
            let total: f64 = numbers.iter().filter_map(|n| n.as_f64()).sum();
            if function == "SUM" {
                Value::from(total)
            } else {
                Value::from(total / numbers.len() as f64)
            }
        }
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn binding(pairs: &[(&str, Value)]) -> Binding {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn people() -> Vec<Binding> {
        vec![
            binding(&[("X", json!(1)), ("G", json!("staff")), ("A", json!(30))]),
            binding(&[("X", json!(2)), ("G", json!("guests")), ("A", json!(20))]),
            binding(&[("X", json!(3)), ("G", json!("staff")), ("A", json!(40))]),
        ]
    }

    #[test]
    fn test_projection_order_and_window() {
        let shape = ResultShape {
            selection: vec![Operand::var("X")],
            orderby: vec![SortTerm::desc(Operand::var("A"))],
            limit: Some(2),
            offset: 1,
            ..ResultShape::default()
        };
        let rows = shape.apply(people(), &QueryArgs::new()).unwrap();
        assert_eq!(rows, vec![vec![json!(1)], vec![json!(2)]]);
    }

    #[test]
    fn test_group_by_with_aggregates() {
        let shape = ResultShape {
            selection: vec![
                Operand::var("G"),
                Operand::func("COUNT", vec![Operand::var("X")]),
                Operand::func("SUM", vec![Operand::var("A")]),
            ],
            groupby: vec!["G".into()],
            orderby: vec![SortTerm::asc(Operand::var("G"))],
            ..ResultShape::default()
        };
        let rows = shape.apply(people(), &QueryArgs::new()).unwrap();
        assert_eq!(
            rows,
            vec![
                vec![json!("guests"), json!(1), json!(20)],
                vec![json!("staff"), json!(2), json!(70)],
            ]
        );
    }

    #[test]
    fn test_count_of_nothing_is_zero() {
        let shape = ResultShape {
            selection: vec![Operand::func("COUNT", vec![Operand::var("X")])],
            ..ResultShape::default()
        };
        let rows = shape.apply(Vec::new(), &QueryArgs::new()).unwrap();
        assert_eq!(rows, vec![vec![json!(0)]]);
    }

    #[test]
    fn test_distinct() {
        let shape = ResultShape {
            selection: vec![Operand::var("G")],
            distinct: true,
            ..ResultShape::default()
        };
        let rows = shape.apply(people(), &QueryArgs::new()).unwrap();
        assert_eq!(rows, vec![vec![json!("staff")], vec![json!("guests")]]);
    }

    #[test]
    fn test_unknown_function_rejected() {
        let shape = ResultShape {
            selection: vec![Operand::func("SOUNDEX", vec![Operand::var("X")])],
            ..ResultShape::default()
        };
        let err = shape.apply(people(), &QueryArgs::new()).unwrap_err();
        assert_eq!(err.code(), "AERO_EXEC_UNSUPPORTED_FUNCTION");
    }
}
