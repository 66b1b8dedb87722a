//! Mapping between readable setting names and their integer tags.
//!
//! Settings travel on the wire as integer-keyed CBOR maps; configuration
//! files and CLI output use readable JSON names. Keys outside the table are
//! written as decimal tag numbers so new firmware settings stay reachable.

use thiserror::Error;

use crate::cbor::Value;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid setting key: {0:?}")]
pub struct InvalidSettingKeyError(pub String);

const SETTING_NAMES: &[(&str, i64)] = &[
    ("base_sample_rate_hz", 0),
    ("snippet_interval_ms", 1),
    ("snippet_length", 2),
    ("health_interval_ms", 3),
    ("snippet_mode", 4),
    ("capture_mode", 5),
    ("capture_buffer_length", 6),
    ("aggregates_mode", 7),
    ("aggregates_sample_rate_hz", 8),
    ("aggregates_interval_ms", 9),
    ("aggregates_fft_mode", 10),
    ("aggregates_fft_length", 11),
    ("aggregates_param_enable_0_31", 12),
    ("aggregates_param_enable_32_63", 13),
    ("events_motion_start_enable", 14),
    ("events_motion_start_capture", 15),
    ("events_motion_start_capture_duration_ms", 16),
    ("events_motion_stop_enable", 17),
    ("events_motion_threshold", 18),
    ("capture_sample_rate_hz", 19),
    ("capture_pretrigger_length", 20),
    ("clock_sync_enable", 21),
    ("clock_sync_interval_ms", 22),
    ("radio_tx_power", 23),
];

pub struct SettingsMapper;

impl SettingsMapper {
    /// Resolve a readable key to its integer tag. Unknown names must be
    /// plain decimal tag numbers.
    pub fn key_from_readable(key: &str) -> Result<i64, InvalidSettingKeyError> {
        if let Some((_, tag)) = SETTING_NAMES.iter().find(|(name, _)| *name == key) {
            return Ok(*tag);
        }
        key.parse::<i64>()
            .map_err(|_| InvalidSettingKeyError(key.to_string()))
    }

    /// Render an integer tag as its readable name, falling back to the
    /// decimal tag for unknown tags.
    pub fn key_to_readable(tag: i64) -> String {
        SETTING_NAMES
            .iter()
            .find(|(_, t)| *t == tag)
            .map(|(name, _)| (*name).to_string())
            .unwrap_or_else(|| tag.to_string())
    }

    /// Convert a readable JSON settings object into the integer-keyed map
    /// sent to the node.
    pub fn from_readable(
        settings: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Value, InvalidSettingKeyError> {
        let mut entries = Vec::with_capacity(settings.len());
        for (key, value) in settings {
            let tag = Self::key_from_readable(key)?;
            entries.push((Value::Int(tag), json_to_value(value)));
        }
        Ok(Value::Map(entries))
    }

    /// Convert an integer-keyed settings map into a readable JSON object.
    pub fn to_readable(settings: &Value) -> serde_json::Value {
        let Some(entries) = settings.as_map() else {
            return value_to_json(settings);
        };
        let mut object = serde_json::Map::with_capacity(entries.len());
        for (key, value) in entries {
            let name = match key.as_int() {
                Some(tag) => Self::key_to_readable(tag),
                None => format!("{key:?}"),
            };
            object.insert(name, value_to_json(value));
        }
        serde_json::Value::Object(object)
    }
}

fn json_to_value(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        serde_json::Value::String(s) => Value::Text(s.clone()),
        serde_json::Value::Array(items) => Value::Array(items.iter().map(json_to_value).collect()),
        serde_json::Value::Object(entries) => Value::Map(
            entries
                .iter()
                .map(|(k, v)| (Value::Text(k.clone()), json_to_value(v)))
                .collect(),
        ),
    }
}

fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::from(*i),
        Value::Float(f) => serde_json::Value::from(*f),
        Value::Bytes(b) => serde_json::Value::String(
            b.iter().map(|byte| format!("{byte:02x}")).collect::<String>(),
        ),
        Value::Text(s) => serde_json::Value::String(s.clone()),
        Value::Array(items) => serde_json::Value::Array(items.iter().map(value_to_json).collect()),
        Value::Map(entries) => {
            let mut object = serde_json::Map::with_capacity(entries.len());
            for (k, v) in entries {
                let key = match k {
                    Value::Text(s) => s.clone(),
                    Value::Int(i) => i.to_string(),
                    other => format!("{other:?}"),
                };
                object.insert(key, value_to_json(v));
            }
            serde_json::Value::Object(object)
        }
        Value::Tag(_, inner) => value_to_json(inner),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_key_mapping() {
        assert_eq!(SettingsMapper::key_from_readable("base_sample_rate_hz").unwrap(), 0);
        assert_eq!(SettingsMapper::key_from_readable("snippet_length").unwrap(), 2);
        assert_eq!(SettingsMapper::key_to_readable(3), "health_interval_ms");
    }

    #[test]
    fn test_unknown_key_is_decimal_tag() {
        assert_eq!(SettingsMapper::key_from_readable("42").unwrap(), 42);
        assert_eq!(SettingsMapper::key_to_readable(42), "42");
        assert!(SettingsMapper::key_from_readable("not_a_setting").is_err());
    }

    #[test]
    fn test_from_readable_roundtrip() {
        let json: serde_json::Value =
            serde_json::from_str(r#"{"base_sample_rate_hz": 1024, "snippet_mode": 2}"#).unwrap();
        let settings = SettingsMapper::from_readable(json.as_object().unwrap()).unwrap();
        let entries = settings.as_map().unwrap();
        assert_eq!(entries.len(), 2);

        let readable = SettingsMapper::to_readable(&settings);
        assert_eq!(readable, json);
    }
}
