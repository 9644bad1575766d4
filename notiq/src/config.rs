//! Environment-driven configuration.
//!
//! Every component config has a `Default` and a `from_lookup` constructor that
//! reads overrides through a key lookup function. `from_env` wires the lookup to
//! the process environment (after `.env` has been loaded by the binary).

use std::str::FromStr;

use crate::api::server::ApiServerConfig;
use crate::broker::redis_streams::BrokerConfig;
use crate::logging::LogSettings;
use crate::notifier::email::EmailConfig;
use crate::worker::consumer::ConsumerConfig;

/// Lookup function for configuration keys.
pub trait Lookup: Fn(&str) -> Option<String> {}

impl<F: Fn(&str) -> Option<String>> Lookup for F {}

/// Read a non-empty string value.
pub(crate) fn string_var(lookup: &impl Lookup, key: &str) -> Option<String> {
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Read and parse a value, ignoring unparsable input with a warning.
pub(crate) fn parsed_var<T: FromStr>(lookup: &impl Lookup, key: &str) -> Option<T> {
    let raw = string_var(lookup, key)?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key = %key, value = %raw, "Ignoring unparsable configuration value");
            None
        }
    }
}

/// Read a boolean flag (`1/0`, `true/false`, `yes/no`, `on/off`).
pub(crate) fn bool_var(lookup: &impl Lookup, key: &str) -> Option<bool> {
    let raw = string_var(lookup, key)?;
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            tracing::warn!(key = %key, value = %raw, "Ignoring invalid boolean value");
            None
        }
    }
}

/// Complete application configuration.
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub email: EmailConfig,
    pub api: ApiServerConfig,
    pub consumer: ConsumerConfig,
    pub logging: LogSettings,
}

impl AppConfig {
    pub fn from_lookup(lookup: impl Lookup) -> Self {
        Self {
            broker: BrokerConfig::from_lookup(&lookup),
            email: EmailConfig::from_lookup(&lookup),
            api: ApiServerConfig::from_lookup(&lookup),
            consumer: ConsumerConfig::from_lookup(&lookup),
            logging: LogSettings::from_lookup(&lookup),
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key: &str| std::env::var(key).ok())
    }
}
