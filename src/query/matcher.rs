//! Built-in filter evaluator.

use super::{lookup, MatchEvaluator};
use crate::error::{BrokerError, Result};
use crate::types::{type_name, Document};
use serde_json::Value;
use std::cmp::Ordering;

/// Matches documents against query-style predicates.
#[derive(Clone, Copy, Debug, Default)]
pub struct DocumentMatcher;

impl DocumentMatcher {
    pub fn new() -> Self {
        Self
    }
}

impl MatchEvaluator for DocumentMatcher {
    fn validate(&self, predicate: &Document) -> Result<()> {
        validate_predicate(predicate)
    }

    fn matches(&self, predicate: &Document, document: &Document) -> bool {
        predicate
            .iter()
            .all(|(key, condition)| match key.as_str() {
                "$and" => clauses(condition).all(|p| self.matches(p, document)),
                "$or" => clauses(condition).any(|p| self.matches(p, document)),
                "$nor" => !clauses(condition).any(|p| self.matches(p, document)),
                path => field_matches(lookup(document, path), condition),
            })
    }
}

fn clauses(condition: &Value) -> impl Iterator<Item = &Document> {
    condition
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(Value::as_object)
}

fn validate_predicate(predicate: &Document) -> Result<()> {
    for (key, condition) in predicate {
        match key.as_str() {
            "$and" | "$or" | "$nor" => {
                let items = condition.as_array().ok_or_else(|| {
                    BrokerError::BadFilter(format!("{key} must be an array"))
                })?;
                if items.is_empty() {
                    return Err(BrokerError::BadFilter(format!("{key} must be a nonempty array")));
                }
                for item in items {
                    let nested = item.as_object().ok_or_else(|| {
                        BrokerError::BadFilter(format!(
                            "{key} entries must be documents but found a {}",
                            type_name(item)
                        ))
                    })?;
                    validate_predicate(nested)?;
                }
            }
            op if op.starts_with('$') => {
                return Err(BrokerError::BadFilter(format!("unknown top level operator: {op}")));
            }
            _ => {
                if let Some(ops) = operator_document(condition) {
                    for (op, operand) in ops {
                        validate_operator(op, operand)?;
                    }
                }
            }
        }
    }
    Ok(())
}

fn validate_operator(op: &str, operand: &Value) -> Result<()> {
    match op {
        "$eq" | "$ne" | "$gt" | "$gte" | "$lt" | "$lte" | "$exists" => Ok(()),
        "$in" | "$nin" => {
            if operand.is_array() {
                Ok(())
            } else {
                Err(BrokerError::BadFilter(format!("{op} needs an array")))
            }
        }
        other => Err(BrokerError::BadFilter(format!("unknown operator: {other}"))),
    }
}

/// A condition is an operator document when its first key starts with `$`.
fn operator_document(condition: &Value) -> Option<&Document> {
    let obj = condition.as_object()?;
    match obj.keys().next() {
        Some(k) if k.starts_with('$') => Some(obj),
        _ => None,
    }
}

fn field_matches(value: Option<&Value>, condition: &Value) -> bool {
    match operator_document(condition) {
        Some(ops) => ops.iter().all(|(op, operand)| apply_operator(value, op, operand)),
        None => equals(value, condition),
    }
}

fn apply_operator(value: Option<&Value>, op: &str, operand: &Value) -> bool {
    match op {
        "$eq" => equals(value, operand),
        "$ne" => !equals(value, operand),
        "$gt" => compares(value, operand, |o| o == Ordering::Greater),
        "$gte" => compares(value, operand, |o| o != Ordering::Less),
        "$lt" => compares(value, operand, |o| o == Ordering::Less),
        "$lte" => compares(value, operand, |o| o != Ordering::Greater),
        "$in" => operand
            .as_array()
            .map(|set| set.iter().any(|candidate| equals(value, candidate)))
            .unwrap_or(false),
        "$nin" => operand
            .as_array()
            .map(|set| !set.iter().any(|candidate| equals(value, candidate)))
            .unwrap_or(true),
        "$exists" => value.is_some() == truthy(operand),
        _ => false,
    }
}

/// Equality with array-contains semantics for array-valued fields.
fn equals(value: Option<&Value>, expected: &Value) -> bool {
    match value {
        None => expected.is_null(),
        Some(Value::Array(items)) if !expected.is_array() => {
            items.iter().any(|item| values_equal(item, expected))
        }
        Some(v) => values_equal(v, expected),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compares(value: Option<&Value>, operand: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .any(|item| compare(item, operand).map(&accept).unwrap_or(false)),
        Some(v) => compare(v, operand).map(accept).unwrap_or(false),
        None => false,
    }
}

/// Ordering between values of the same kind; `None` across kinds.
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::Null => false,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: Value) -> Document {
        v.as_object().cloned().unwrap()
    }

    fn check(filter: Value, message: Value) -> bool {
        DocumentMatcher.matches(&doc(filter), &doc(message))
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        assert!(check(json!({}), json!({"a": 1})));
    }

    #[test]
    fn test_equality_and_comparison() {
        assert!(check(json!({"a": 1}), json!({"a": 1.0})));
        assert!(!check(json!({"a": 1}), json!({"a": 2})));
        assert!(check(json!({"count": {"$gt": 3}}), json!({"count": 4})));
        assert!(!check(json!({"count": {"$gt": 3}}), json!({"count": 3})));
        assert!(check(json!({"count": {"$gte": 3, "$lt": 5}}), json!({"count": 3})));
        assert!(!check(json!({"count": {"$gt": 3}}), json!({"count": "4"})));
        assert!(check(json!({"name": {"$lt": "m"}}), json!({"name": "bob"})));
    }

    #[test]
    fn test_missing_fields() {
        assert!(!check(json!({"a": {"$gt": 0}}), json!({})));
        assert!(check(json!({"a": null}), json!({})));
        assert!(check(json!({"a": {"$exists": false}}), json!({"b": 1})));
        assert!(check(json!({"a": {"$exists": true}}), json!({"a": null})));
    }

    #[test]
    fn test_set_membership_and_arrays() {
        assert!(check(json!({"tag": {"$in": ["x", "y"]}}), json!({"tag": "y"})));
        assert!(check(json!({"tag": {"$nin": ["x"]}}), json!({"tag": "y"})));
        assert!(check(json!({"tags": "b"}), json!({"tags": ["a", "b"]})));
        assert!(check(json!({"nums": {"$gt": 5}}), json!({"nums": [1, 9]})));
    }

    #[test]
    fn test_combinators_and_paths() {
        let filter = json!({"$or": [{"a.b": 1}, {"c": {"$ne": 2}}]});
        assert!(check(filter.clone(), json!({"a": {"b": 1}, "c": 2})));
        assert!(!check(filter, json!({"a": {"b": 0}, "c": 2})));
        assert!(check(json!({"$nor": [{"x": 1}]}), json!({"x": 2})));
        assert!(check(json!({"$and": [{"x": 1}, {"y": 2}]}), json!({"x": 1, "y": 2})));
    }

    #[test]
    fn test_validate_rejects_malformed_predicates() {
        let m = DocumentMatcher::new();
        assert!(m.validate(&doc(json!({"a": {"$gt": 1}}))).is_ok());
        assert!(matches!(
            m.validate(&doc(json!({"a": {"$bogus": 1}}))),
            Err(BrokerError::BadFilter(_))
        ));
        assert!(matches!(m.validate(&doc(json!({"$or": []}))), Err(BrokerError::BadFilter(_))));
        assert!(matches!(m.validate(&doc(json!({"$or": [1]}))), Err(BrokerError::BadFilter(_))));
        assert!(matches!(
            m.validate(&doc(json!({"a": {"$in": 3}}))),
            Err(BrokerError::BadFilter(_))
        ));
        assert!(matches!(m.validate(&doc(json!({"$where": "x"}))), Err(BrokerError::BadFilter(_))));
    }
}
