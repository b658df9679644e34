//! Test verdicts: canonical serialization and output comparison.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Deserializes a present field as `Some`, even when its value is `null`.
///
/// Paired with `#[serde(default)]`, an absent field stays `None`. This keeps
/// JSON `null` and JS `undefined` apart.
pub(crate) fn deserialize_some<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

/// Serializes `value` with object keys sorted at every level.
///
/// Floats with no fractional part print as integers, so `2.0` and `2`
/// serialize identically.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 9.007_199_254_740_992e15 => {
                out.push_str(&format!("{}", f as i64));
            }
            _ => out.push_str(&n.to_string()),
        },
        other => out.push_str(&other.to_string()),
    }
}

/// Compares an actual output with an expected one.
///
/// `None` stands for `undefined`. Both undefined passes; otherwise both sides
/// must be defined and serialize to the same canonical text.
pub fn outputs_match(actual: Option<&Value>, expected: Option<&Value>) -> bool {
    match (actual, expected) {
        (None, None) => true,
        (Some(actual), Some(expected)) => canonical_json(actual) == canonical_json(expected),
        _ => false,
    }
}
