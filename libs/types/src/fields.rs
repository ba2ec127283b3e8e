//! Allow-listed flat field maps, the only shape that reaches a stream.
//!
//! Every message type owns a `FIELDS` list and reads exactly those keys back
//! out; anything else a producer attached is left behind in the map.

use crate::FieldError;
use std::collections::BTreeMap;

/// Flat string map written to and read from a stream entry
pub type FieldMap = BTreeMap<String, String>;

/// Required, non-empty string field
pub fn required<'a>(fields: &'a FieldMap, key: &'static str) -> Result<&'a str, FieldError> {
    match fields.get(key).map(|v| v.trim()) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(FieldError::Missing { field: key }),
    }
}

/// Non-negative integer amount in the token's smallest unit.
///
/// A leading `-` is reported as [`FieldError::Negative`] rather than a parse
/// failure so rejections say what actually went wrong.
pub fn required_amount(fields: &FieldMap, key: &'static str) -> Result<u128, FieldError> {
    let raw = required(fields, key)?;
    if raw.starts_with('-') {
        return Err(FieldError::Negative {
            field: key,
            value: raw.to_string(),
        });
    }
    raw.parse::<u128>()
        .map_err(|e| FieldError::malformed(key, e.to_string()))
}

pub fn required_u64(fields: &FieldMap, key: &'static str) -> Result<u64, FieldError> {
    let raw = required(fields, key)?;
    if raw.starts_with('-') {
        return Err(FieldError::Negative {
            field: key,
            value: raw.to_string(),
        });
    }
    raw.parse::<u64>()
        .map_err(|e| FieldError::malformed(key, e.to_string()))
}

pub fn required_u32(fields: &FieldMap, key: &'static str) -> Result<u32, FieldError> {
    let raw = required_u64(fields, key)?;
    u32::try_from(raw).map_err(|e| FieldError::malformed(key, e.to_string()))
}

/// Finite floating point field
pub fn required_f64(fields: &FieldMap, key: &'static str) -> Result<f64, FieldError> {
    let raw = required(fields, key)?;
    let value = raw
        .parse::<f64>()
        .map_err(|e| FieldError::malformed(key, e.to_string()))?;
    if !value.is_finite() {
        return Err(FieldError::malformed(key, "value is not finite"));
    }
    Ok(value)
}

/// Finite floating point field that is zero or more; `-0` counts as zero
pub fn required_non_negative_f64(fields: &FieldMap, key: &'static str) -> Result<f64, FieldError> {
    let value = required_f64(fields, key)?;
    if value < 0.0 {
        return Err(FieldError::Negative {
            field: key,
            value: value.to_string(),
        });
    }
    Ok(value)
}

pub fn required_bool(fields: &FieldMap, key: &'static str) -> Result<bool, FieldError> {
    match required(fields, key)? {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(FieldError::malformed(
            key,
            format!("expected boolean, got '{}'", other),
        )),
    }
}

/// Build a map from `(key, value)` pairs, used by the `to_fields` encoders
pub fn field_map<I, V>(pairs: I) -> FieldMap
where
    I: IntoIterator<Item = (&'static str, V)>,
    V: ToString,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Copy only the `allowed` keys, e.g. to park an undecodable message
pub fn allow_listed(fields: &FieldMap, allowed: &[&str]) -> FieldMap {
    fields
        .iter()
        .filter(|(key, _)| allowed.contains(&key.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
