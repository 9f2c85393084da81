use std::{path::PathBuf, str::FromStr, time::Duration};

use crate::loader::ConfigLoadError;

/// Parse a boolean value from a raw string, accepting common env-style forms.
///
/// Accepted truthy values (case-insensitive): `"1"`, `"true"`, `"yes"`, `"on"`.
/// Accepted falsy values: `"0"`, `"false"`, `"no"`, `"off"`.
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// First non-empty value among `names`, in order.
pub fn env_var(names: &[&str]) -> Option<(String, String)> {
    names.iter().find_map(|name| {
        std::env::var(name)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .map(|value| (name.to_string(), value))
    })
}

pub fn string_var(names: &[&str]) -> Option<String> {
    env_var(names).map(|(_, value)| value)
}

pub fn path_var(names: &[&str]) -> Option<PathBuf> {
    string_var(names).map(PathBuf::from)
}

pub fn bool_var(names: &[&str]) -> Result<Option<bool>, ConfigLoadError> {
    env_var(names)
        .map(|(key, raw)| {
            parse_bool(&raw).ok_or(ConfigLoadError::InvalidValue {
                key,
                value: raw,
                expected: "a boolean",
            })
        })
        .transpose()
}

pub fn parse_var<T: FromStr>(
    names: &[&str],
    expected: &'static str,
) -> Result<Option<T>, ConfigLoadError> {
    env_var(names)
        .map(|(key, raw)| {
            raw.parse().map_err(|_| ConfigLoadError::InvalidValue {
                key,
                value: raw,
                expected,
            })
        })
        .transpose()
}

/// Human-friendly durations such as `90s`, `30m` or `1h 15m`.
pub fn parse_duration(key: &str, raw: &str) -> Result<Duration, ConfigLoadError> {
    humantime::parse_duration(raw.trim()).map_err(|_| {
        ConfigLoadError::InvalidValue {
            key: key.to_string(),
            value: raw.to_string(),
            expected: "a duration like `30s` or `10m`",
        }
    })
}

pub fn duration_var(
    names: &[&str],
) -> Result<Option<Duration>, ConfigLoadError> {
    env_var(names)
        .map(|(key, raw)| parse_duration(&key, &raw))
        .transpose()
}
