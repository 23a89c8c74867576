/**
 * Lenient `log_level` parsing. A missing or unrecognised level falls back to
 * the level implied by the environment: debug in development, warning
 * everywhere else.
 */
use serde::de::{self, Deserializer, Visitor};

use slog::Level;
use std::{env, fmt};

use super::{environment_type::EnvironmentType, ENVIRONMENT_VAR};

/**
 * Level used when none is configured.
 *
 * @param environment The environment name, as read from the environment variable.
 * @return The level name, suitable as a config default.
 */
pub(crate) fn default_level_name(environment: &str) -> &'static str {
    if EnvironmentType::parse_or_default(environment).is_development() {
        "debug"
    } else {
        "warn"
    }
}

fn default_level() -> Level {
    let environment = env::var(ENVIRONMENT_VAR).unwrap_or_default();
    if EnvironmentType::parse_or_default(&environment).is_development() {
        Level::Debug
    } else {
        Level::Warning
    }
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(deserializer
        .deserialize_str(LogLevelVisitor)
        .unwrap_or_else(|_| default_level()))
}

struct LogLevelVisitor;

impl<'de> Visitor<'de> for LogLevelVisitor {
    type Value = Level;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a string representing a log level")
    }

    fn visit_str<E>(self, value: &str) -> Result<Level, E>
    where
        E: de::Error,
    {
        match value.trim().to_lowercase().as_str() {
            "trace" => Ok(Level::Trace),
            "debug" => Ok(Level::Debug),
            "info" => Ok(Level::Info),
            "warn" | "warning" => Ok(Level::Warning),
            "error" => Ok(Level::Error),
            "critical" | "crit" => Ok(Level::Critical),
            _ => Err(de::Error::unknown_variant(
                value,
                &["trace", "debug", "info", "warn", "error", "critical"],
            )),
        }
    }
}
