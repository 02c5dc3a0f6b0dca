//! Plugin parameter access over loosely-typed config tables.

use log::warn;
use thiserror::Error;

/// Fatal configuration error raised by plugin `on_initialize`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key} has incorrect type (expected {expected})")]
    WrongType { key: String, expected: &'static str },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Types readable from a [`toml::Value`] parameter table.
pub trait ParamValue: Sized + std::fmt::Debug {
    const TYPE_NAME: &'static str;
    fn from_value(value: &toml::Value) -> Option<Self>;
}

impl ParamValue for f64 {
    const TYPE_NAME: &'static str = "float";
    fn from_value(value: &toml::Value) -> Option<Self> {
        value.as_float().or_else(|| value.as_integer().map(|i| i as f64))
    }
}

impl ParamValue for i64 {
    const TYPE_NAME: &'static str = "integer";
    fn from_value(value: &toml::Value) -> Option<Self> {
        value.as_integer()
    }
}

impl ParamValue for u32 {
    const TYPE_NAME: &'static str = "integer";
    fn from_value(value: &toml::Value) -> Option<Self> {
        value.as_integer().and_then(|i| u32::try_from(i).ok())
    }
}

impl ParamValue for bool {
    const TYPE_NAME: &'static str = "boolean";
    fn from_value(value: &toml::Value) -> Option<Self> {
        value.as_bool()
    }
}

impl ParamValue for String {
    const TYPE_NAME: &'static str = "string";
    fn from_value(value: &toml::Value) -> Option<Self> {
        value.as_str().map(str::to_string)
    }
}

/// Read `key` from a parameter table, warning and falling back to
/// `default` when the key is absent. A present key of the wrong type is a
/// fatal configuration error.
pub fn config_with_default_warn<T: ParamValue>(
    params: &toml::Value,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match params.get(key) {
        Some(value) => T::from_value(value).ok_or_else(|| ConfigError::WrongType {
            key: key.to_string(),
            expected: T::TYPE_NAME,
        }),
        None => {
            warn!("Using default value for {}: {:?}", key, default);
            Ok(default)
        }
    }
}

/// An empty parameter table.
pub fn empty_params() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}
