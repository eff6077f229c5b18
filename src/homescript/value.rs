//! Dynamically typed HomeScript values.
//!
//! Every variable binding, hook argument and hook result is a [`ScriptValue`].
//! Values cross the wire as plain JSON; integral numbers are emitted as JSON
//! integers so `5` round-trips as `5` rather than `5.0`.

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;

/// Closed set of values a script can observe or produce.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ScriptValue {
    #[default]
    Null,
    Boolean(bool),
    Number(f64),
    String(String),
    List(Vec<ScriptValue>),
    Map(IndexMap<String, ScriptValue>),
}

impl ScriptValue {
    pub fn string(value: impl Into<String>) -> Self {
        ScriptValue::String(value.into())
    }

    /// Name used in type errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            ScriptValue::Null => "null",
            ScriptValue::Boolean(_) => "boolean",
            ScriptValue::Number(_) => "number",
            ScriptValue::String(_) => "string",
            ScriptValue::List(_) => "list",
            ScriptValue::Map(_) => "map",
        }
    }

    /// Truthiness used by IF/WHILE conditions and boolean operators.
    pub fn is_truthy(&self) -> bool {
        match self {
            ScriptValue::Null => false,
            ScriptValue::Boolean(b) => *b,
            ScriptValue::Number(n) => *n != 0.0 && !n.is_nan(),
            ScriptValue::String(s) => !s.is_empty(),
            ScriptValue::List(items) => !items.is_empty(),
            ScriptValue::Map(entries) => !entries.is_empty(),
        }
    }

    /// Levels of list/map nesting; scalars are 0.
    pub fn depth(&self) -> usize {
        let inner = match self {
            ScriptValue::List(items) => items.iter().map(ScriptValue::depth).max(),
            ScriptValue::Map(entries) => entries.values().map(ScriptValue::depth).max(),
            _ => return 0,
        };
        1 + inner.unwrap_or(0)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScriptValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            ScriptValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Converts to a number the way `num()` does: numeric strings and
    /// booleans convert, everything else is rejected.
    pub fn coerce_number(&self) -> Option<f64> {
        match self {
            ScriptValue::Number(n) => Some(*n),
            ScriptValue::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            ScriptValue::String(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
            _ => None,
        }
    }

    /// Equality used by `==`. Numbers compare by value, containers structurally.
    pub fn loose_eq(&self, other: &ScriptValue) -> bool {
        match (self, other) {
            (ScriptValue::Number(a), ScriptValue::Number(b)) => a == b,
            (ScriptValue::List(a), ScriptValue::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.loose_eq(y))
            }
            (ScriptValue::Map(a), ScriptValue::Map(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .all(|(k, v)| b.get(k).map(|other| v.loose_eq(other)).unwrap_or(false))
            }
            _ => self == other,
        }
    }

    /// Ordering for `<`, `<=`, `>`, `>=`. Only numbers and strings are ordered.
    pub fn partial_compare(&self, other: &ScriptValue) -> Option<Ordering> {
        match (self, other) {
            (ScriptValue::Number(a), ScriptValue::Number(b)) => a.partial_cmp(b),
            (ScriptValue::String(a), ScriptValue::String(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ScriptValue::Null => serde_json::Value::Null,
            ScriptValue::Boolean(b) => serde_json::Value::Bool(*b),
            ScriptValue::Number(n) => number_to_json(*n),
            ScriptValue::String(s) => serde_json::Value::String(s.clone()),
            ScriptValue::List(items) => {
                serde_json::Value::Array(items.iter().map(ScriptValue::to_json).collect())
            }
            ScriptValue::Map(entries) => serde_json::Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

fn number_to_json(n: f64) -> serde_json::Value {
    if n.fract() == 0.0 && n.is_finite() && n.abs() < 9.007_199_254_740_992e15 {
        serde_json::Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.is_finite() && n.abs() < 9.007_199_254_740_992e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

impl fmt::Display for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptValue::Null => write!(f, "null"),
            ScriptValue::Boolean(b) => write!(f, "{}", b),
            ScriptValue::Number(n) => write!(f, "{}", format_number(*n)),
            ScriptValue::String(s) => write!(f, "{}", s),
            ScriptValue::List(_) | ScriptValue::Map(_) => write!(f, "{}", self.to_json()),
        }
    }
}

impl From<serde_json::Value> for ScriptValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => ScriptValue::Null,
            serde_json::Value::Bool(b) => ScriptValue::Boolean(b),
            serde_json::Value::Number(n) => ScriptValue::Number(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => ScriptValue::String(s),
            serde_json::Value::Array(items) => {
                ScriptValue::List(items.into_iter().map(ScriptValue::from).collect())
            }
            serde_json::Value::Object(entries) => ScriptValue::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, ScriptValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for ScriptValue {
    fn from(value: &str) -> Self {
        ScriptValue::String(value.to_string())
    }
}

impl From<String> for ScriptValue {
    fn from(value: String) -> Self {
        ScriptValue::String(value)
    }
}

impl From<f64> for ScriptValue {
    fn from(value: f64) -> Self {
        ScriptValue::Number(value)
    }
}

impl From<bool> for ScriptValue {
    fn from(value: bool) -> Self {
        ScriptValue::Boolean(value)
    }
}

impl Serialize for ScriptValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ScriptValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(ScriptValue::from)
    }
}

/// Converts a JSON object into a variable map, ignoring non-object input.
pub fn variables_from_json(value: &serde_json::Value) -> IndexMap<String, ScriptValue> {
    match value {
        serde_json::Value::Object(entries) => entries
            .iter()
            .map(|(k, v)| (k.clone(), ScriptValue::from(v.clone())))
            .collect(),
        _ => IndexMap::new(),
    }
}
