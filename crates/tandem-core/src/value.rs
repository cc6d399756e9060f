//! Deep value utilities
//!
//! Pure functions over `serde_json::Value` trees: structural clone,
//! equality, difference and the directional merge used for conflict
//! resolution between replicas.
//!
//! "Absent" is modelled with `Option`: a missing map key or an undefined
//! argument is `None`, while `Value::Null` is a defined value.

use serde_json::{Map, Number, Value};

/// Return a copy of `value` sharing no structure with it
pub fn clone_deep(value: &Value) -> Value {
    value.clone()
}

/// Check two trees for structural equality
///
/// Sequences and maps are never equal to each other, even when a map's
/// keys look like sequence indices. Numbers compare by value, so `1` and
/// `1.0` are equal.
pub fn is_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => numbers_equal(x, y),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| is_equal(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(key, a)| y.get(key).is_some_and(|b| is_equal(a, b)))
        }
        _ => a == b,
    }
}

fn numbers_equal(x: &Number, y: &Number) -> bool {
    if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
        return x == y;
    }
    if let (Some(x), Some(y)) = (x.as_u64(), y.as_u64()) {
        return x == y;
    }
    match (x.as_f64(), y.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

/// Return the part of `a` that differs from `b`
///
/// Returns `None` when the trees are structurally equal. Maps are compared
/// key by key; sequences are compared atomically, so any difference reports
/// the whole sequence from `a`. Keys present only in `b` make the maps
/// differ but contribute nothing to the result.
pub fn diff_deep(a: &Value, b: &Value) -> Option<Value> {
    match (a, b) {
        (Value::Object(x), Value::Object(y)) => {
            let mut equal = true;
            let mut diff = Map::new();
            for (key, value) in x {
                let changed = match y.get(key) {
                    Some(other) => diff_deep(value, other),
                    None => Some(value.clone()),
                };
                if let Some(changed) = changed {
                    equal = false;
                    diff.insert(key.clone(), changed);
                }
            }
            if y.keys().any(|key| !x.contains_key(key)) {
                equal = false;
            }
            (!equal).then_some(Value::Object(diff))
        }
        _ => (!is_equal(a, b)).then(|| a.clone()),
    }
}

/// Merge `b` over `a`
///
/// - a sequence in `b` replaces `a` outright;
/// - if either side is not a map, `b` wins;
/// - otherwise keys are merged recursively over the union of both maps,
///   values from `b` taking priority and keys only in `a` being kept.
///
/// Neither commutative nor associative: newer (`b`) overrides older (`a`),
/// but older fields missing from the newer tree survive.
pub fn merge_or_replace(a: &Value, b: &Value) -> Value {
    merge_values(Some(a), Some(b), false).unwrap_or(Value::Null)
}

/// Like [`merge_or_replace`], but keys of `a` absent from `b` are dropped
/// at every map level.
pub fn merge_or_replace_reduced(a: &Value, b: &Value) -> Value {
    merge_values(Some(a), Some(b), true).unwrap_or(Value::Null)
}

fn merge_values(a: Option<&Value>, b: Option<&Value>, reduce: bool) -> Option<Value> {
    match (a, b) {
        (_, Some(Value::Array(items))) => Some(Value::Array(items.clone())),
        (Some(Value::Object(x)), Some(Value::Object(y))) => {
            let mut merged = Map::new();
            for (key, value) in x {
                if reduce && !y.contains_key(key) {
                    continue;
                }
                if let Some(value) = merge_values(Some(value), y.get(key), reduce) {
                    merged.insert(key.clone(), value);
                }
            }
            for (key, value) in y {
                if !x.contains_key(key) {
                    merged.insert(key.clone(), value.clone());
                }
            }
            Some(Value::Object(merged))
        }
        (a, b) => b.or(a).cloned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "one": 1,
            "two": "two",
            "three": {"id": 1, "value": 500},
            "four": [2, 3, 4]
        })
    }

    #[test]
    fn test_clone_deep_is_independent() {
        let original = sample();
        let mut copy = clone_deep(&original);
        copy["three"]["value"] = json!(0);
        assert_eq!(original["three"]["value"], json!(500));
    }

    #[test]
    fn test_is_equal_same_shape() {
        assert!(is_equal(&sample(), &sample()));
    }

    #[test]
    fn test_is_equal_nested_difference() {
        let mut other = sample();
        other["three"]["id"] = json!(2);
        assert!(!is_equal(&sample(), &other));
    }

    #[test]
    fn test_is_equal_array_vs_array_like_object() {
        let arr = json!(["one", "two", "three"]);
        let obj = json!({"0": "one", "1": "two", "2": "three"});
        assert!(!is_equal(&arr, &obj));
    }

    #[test]
    fn test_is_equal_numbers_by_value() {
        assert!(is_equal(&json!(1), &json!(1.0)));
        assert!(!is_equal(&json!(1), &json!(2)));
        assert!(!is_equal(&json!(1), &json!("1")));
    }

    #[test]
    fn test_diff_deep_reports_changed_parts() {
        let other = json!({
            "one": 1,
            "two": "two",
            "three": {"id": 1, "value": 700},
            "four": [2, 3, 5]
        });
        let diff = diff_deep(&sample(), &other);
        assert_eq!(diff, Some(json!({"three": {"value": 500}, "four": [2, 3, 4]})));
    }

    #[test]
    fn test_diff_deep_equal_trees() {
        assert_eq!(diff_deep(&sample(), &sample()), None);
        assert_eq!(diff_deep(&json!(null), &json!(null)), None);
    }

    #[test]
    fn test_diff_deep_key_only_in_other() {
        let a = json!({"x": 1});
        let b = json!({"x": 1, "y": 2});
        // Differs, but there is nothing of `a` to report
        assert_eq!(diff_deep(&a, &b), Some(json!({})));
    }

    #[test]
    fn test_diff_implies_equality() {
        let trees = [sample(), json!([1, 2]), json!({"a": {"b": []}}), json!("s")];
        for a in &trees {
            for b in &trees {
                if diff_deep(a, b).is_none() {
                    assert!(is_equal(a, b));
                }
            }
        }
    }

    #[test]
    fn test_merge_keeps_fields_missing_from_newer() {
        let reduced = json!({"one": 1, "two": "two", "three": {"id": 1}});
        assert_eq!(merge_or_replace(&sample(), &reduced), sample());
    }

    #[test]
    fn test_merge_reduced_drops_fields_missing_from_newer() {
        let reduced = json!({"one": 1, "two": "two", "three": {"id": 1}});
        assert_eq!(merge_or_replace_reduced(&sample(), &reduced), reduced);
    }

    #[test]
    fn test_merge_newer_wins_conflicts() {
        let other = json!({
            "one": 0,
            "two": {"id": 1, "value": 500},
            "three": "three",
            "four": [2, 3, 5]
        });
        let mut merged = merge_or_replace(&sample(), &other);
        assert_eq!(merged, other);
        merged["two"] = json!(2);
        assert_ne!(merged, other);
    }

    #[test]
    fn test_merge_null_replaced_by_object() {
        let a = json!({"key": null});
        let b = json!({"key": {"p": 2}});
        assert_eq!(merge_or_replace(&a, &b), b);
    }

    #[test]
    fn test_merge_null_is_a_defined_value() {
        let a = json!({"key": {"p": 2}});
        let b = json!({"key": null});
        assert_eq!(merge_or_replace(&a, &b), b);
    }

    #[test]
    fn test_merge_sequences_are_replaced() {
        let a = json!({"list": [1, 2, 3]});
        let b = json!({"list": [4]});
        assert_eq!(merge_or_replace(&a, &b), json!({"list": [4]}));
        assert_eq!(merge_or_replace(&json!([1]), &json!({"a": 1})), json!({"a": 1}));
    }

    #[test]
    fn test_merge_is_directional() {
        let a = json!({"shared": "a", "only_a": true});
        let b = json!({"shared": "b", "only_b": true});
        assert_eq!(
            merge_or_replace(&a, &b),
            json!({"shared": "b", "only_a": true, "only_b": true})
        );
        assert_eq!(
            merge_or_replace(&b, &a),
            json!({"shared": "a", "only_a": true, "only_b": true})
        );
    }
}
