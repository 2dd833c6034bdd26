//! Helpers for working with untyped event payloads.
//!
//! Payloads arrive as [`serde_json::Value`]. Listeners usually know what
//! shape they expect, and these helpers convert without panicking.

use serde::de::DeserializeOwned;
use serde_json::Value;

/// Convert a payload into `T`, returning `T::default()` if the payload does
/// not have the expected shape.
///
/// ```
/// use serde_json::json;
/// assert_eq!(evsock::to_type::<String>(&json!("hi")), "hi");
/// assert_eq!(evsock::to_type::<u32>(&json!("not a number")), 0);
/// assert_eq!(evsock::to_type::<Vec<u8>>(&json!([1, 2])), vec![1, 2]);
/// ```
pub fn to_type<T: DeserializeOwned + Default>(payload: &Value) -> T {
    try_to_type(payload).unwrap_or_default()
}

/// Convert a payload into `T`, returning `None` on mismatch.
pub fn try_to_type<T: DeserializeOwned>(payload: &Value) -> Option<T> {
    T::deserialize(payload).ok()
}

/// Lenient integer conversion used for protocol fields such as close codes
/// and the compression flag. Numbers are truncated, numeric strings parsed,
/// and booleans map to 0 and 1. Anything else is 0.
pub(crate) fn as_int(value: &Value) -> i64 {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_u64().map(|u| i64::try_from(u).unwrap_or(i64::MAX)))
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or_default(),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
                .unwrap_or_default()
        }
        Value::Bool(b) => i64::from(*b),
        _ => 0,
    }
}

/// Lenient string conversion used for migration credentials. Non-string
/// values become the empty string, which never matches a generated secret.
pub(crate) fn as_str(value: &Value) -> &str {
    value.as_str().unwrap_or_default()
}
