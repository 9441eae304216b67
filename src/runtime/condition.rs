//! Condition evaluation for actions and transitions
//!
//! A closed set of comparisons against one JSONPath-selected field of the
//! instance variables. A path that selects nothing, or a comparison between
//! incompatible types, evaluates to false.

use crate::workflow::types::{Condition, ConditionOp};
use serde_json::Value;
use std::cmp::Ordering;

/// Evaluate one condition against the variables object
pub fn evaluate(condition: &Condition, variables: &Value) -> bool {
    let path = if condition.field.starts_with('$') {
        condition.field.clone()
    } else {
        format!("$.{}", condition.field)
    };

    let selected = match jsonpath_lib::select(variables, &path) {
        Ok(selected) => selected,
        Err(e) => {
            tracing::debug!("Condition path '{}' did not parse: {:?}", condition.field, e);
            return false;
        }
    };
    let Some(actual) = selected.first().copied() else {
        return false;
    };

    let expected = &condition.value;
    match condition.op {
        ConditionOp::Exists => !actual.is_null(),
        ConditionOp::Eq => values_equal(actual, expected),
        ConditionOp::Ne => !values_equal(actual, expected),
        ConditionOp::Gt => compare(actual, expected) == Some(Ordering::Greater),
        ConditionOp::Gte => matches!(
            compare(actual, expected),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        ConditionOp::Lt => compare(actual, expected) == Some(Ordering::Less),
        ConditionOp::Lte => matches!(
            compare(actual, expected),
            Some(Ordering::Less | Ordering::Equal)
        ),
        ConditionOp::In => expected
            .as_array()
            .map(|candidates| candidates.iter().any(|c| values_equal(actual, c)))
            .unwrap_or(false),
    }
}

/// All conditions hold (an empty list holds trivially)
pub fn all_hold(conditions: &[Condition], variables: &Value) -> bool {
    conditions
        .iter()
        .all(|condition| evaluate(condition, variables))
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cond(field: &str, op: ConditionOp, value: Value) -> Condition {
        Condition {
            field: field.into(),
            op,
            value,
        }
    }

    #[test]
    fn numeric_comparisons() {
        let vars = json!({ "amount": 12500, "nested": { "score": 7.5 } });
        assert!(evaluate(&cond("$.amount", ConditionOp::Gt, json!(10000)), &vars));
        assert!(!evaluate(&cond("$.amount", ConditionOp::Lt, json!(10000)), &vars));
        assert!(evaluate(&cond("amount", ConditionOp::Gte, json!(12500)), &vars));
        assert!(evaluate(&cond("$.nested.score", ConditionOp::Lte, json!(8)), &vars));
        assert!(evaluate(&cond("$.amount", ConditionOp::Eq, json!(12500.0)), &vars));
    }

    #[test]
    fn string_membership_and_existence() {
        let vars = json!({ "region": "emea", "owner": null });
        assert!(evaluate(&cond("region", ConditionOp::In, json!(["emea", "apac"])), &vars));
        assert!(evaluate(&cond("region", ConditionOp::Ne, json!("amer")), &vars));
        assert!(evaluate(&cond("region", ConditionOp::Exists, Value::Null), &vars));
        assert!(!evaluate(&cond("owner", ConditionOp::Exists, Value::Null), &vars));
        assert!(!evaluate(&cond("missing", ConditionOp::Exists, Value::Null), &vars));
    }

    #[test]
    fn mismatched_types_and_missing_fields_are_false() {
        let vars = json!({ "amount": "lots" });
        assert!(!evaluate(&cond("amount", ConditionOp::Gt, json!(5)), &vars));
        assert!(!evaluate(&cond("absent", ConditionOp::Eq, json!(1)), &vars));
        assert!(!evaluate(&cond("absent", ConditionOp::Ne, json!(1)), &vars));
    }

    #[test]
    fn empty_condition_list_holds() {
        assert!(all_hold(&[], &json!({})));
    }
}
