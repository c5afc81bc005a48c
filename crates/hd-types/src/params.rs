//! Parameter values and helpers for dotted-key parameter trees.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Separator between nesting levels in flat parameter keys (`model.lr`).
pub const KEY_SEPARATOR: char = '.';

/// A concrete value for one declared variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Integer(i64),
    Real(f64),
    Categorical(String),
}

impl ParameterValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(v) => Some(*v as f64),
            Self::Real(v) => Some(*v),
            Self::Categorical(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Categorical(v) => Some(v),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Integer(v) => Value::from(*v),
            Self::Real(v) => Value::from(*v),
            Self::Categorical(v) => Value::from(v.clone()),
        }
    }
}

impl std::fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Integer(v) => write!(f, "{v}"),
            Self::Real(v) => write!(f, "{v}"),
            Self::Categorical(v) => write!(f, "{v}"),
        }
    }
}

/// Human-readable parameter assignment, keyed by variable name.
///
/// Ordered so that parameter files and journal lines are reproducible.
pub type RawParams = BTreeMap<String, ParameterValue>;

/// Insert `value` at a dotted key, creating intermediate objects. An existing
/// non-object on the path is replaced.
pub fn insert_flat(tree: &mut Value, key: &str, value: Value) {
    if !tree.is_object() {
        *tree = Value::Object(Map::new());
    }
    let mut parts = key.split(KEY_SEPARATOR).peekable();
    let mut node = tree;
    while let Some(part) = parts.next() {
        let Value::Object(map) = node else {
            unreachable!("parameter tree nodes are objects");
        };
        if parts.peek().is_none() {
            map.insert(part.to_string(), value);
            return;
        }
        let child = map
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !child.is_object() {
            *child = Value::Object(Map::new());
        }
        node = child;
    }
}

/// Look up a dotted key in a nested JSON object.
pub fn lookup_flat<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    if let Some(direct) = value.get(key) {
        return Some(direct);
    }
    key.split(KEY_SEPARATOR)
        .try_fold(value, |node, part| node.get(part))
}

/// Build the parameter-file document: the fixed tree with every sampled
/// value written over it at its dotted name.
pub fn merge_params(fixed: &Value, params: &RawParams) -> Value {
    let mut tree = if fixed.is_object() {
        fixed.clone()
    } else {
        Value::Object(Map::new())
    };
    for (name, value) in params {
        insert_flat(&mut tree, name, value.to_json());
    }
    tree
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn insert_flat_builds_nested_objects() {
        let mut tree = json!({"model": {"layers": 3}, "epochs": 10});
        insert_flat(&mut tree, "model.lr", json!(0.1));
        insert_flat(&mut tree, "epochs.max", json!(20));
        assert_eq!(tree, json!({"model": {"layers": 3, "lr": 0.1}, "epochs": {"max": 20}}));

        let mut scalar = json!(1);
        insert_flat(&mut scalar, "x", json!(2));
        assert_eq!(scalar, json!({"x": 2}));
    }

    #[test]
    fn lookup_flat_walks_nested_keys() {
        let results = json!({"metrics": {"loss": 0.25}, "acc": 0.9});
        assert_eq!(lookup_flat(&results, "metrics.loss"), Some(&json!(0.25)));
        assert_eq!(lookup_flat(&results, "acc"), Some(&json!(0.9)));
        assert_eq!(lookup_flat(&results, "metrics.missing"), None);
    }

    #[test]
    fn lookup_flat_prefers_literal_dotted_key() {
        let results = json!({"val.loss": 1.0});
        assert_eq!(lookup_flat(&results, "val.loss"), Some(&json!(1.0)));
    }

    #[test]
    fn merge_params_overrides_fixed_values() {
        let fixed = json!({"model": {"lr": 0.5, "dropout": 0.1}, "epochs": 3});
        let mut params = RawParams::new();
        params.insert("model.lr".into(), ParameterValue::Real(0.01));
        params.insert("opt".into(), ParameterValue::Categorical("adam".into()));

        let merged = merge_params(&fixed, &params);
        assert_eq!(
            merged,
            json!({"model": {"lr": 0.01, "dropout": 0.1}, "epochs": 3, "opt": "adam"})
        );
    }

    #[test]
    fn parameter_value_serializes_untagged() {
        let mut params = RawParams::new();
        params.insert("x".into(), ParameterValue::Real(1.5));
        params.insert("n".into(), ParameterValue::Integer(4));
        params.insert("opt".into(), ParameterValue::Categorical("a".into()));

        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json, json!({"n": 4, "opt": "a", "x": 1.5}));
    }
}
