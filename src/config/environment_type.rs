/**
 * Deployment environment of the client. Selects the environment-specific
 * config file and the default log level.
 *
 * Accepted spellings: `development`/`dev`, `staging`/`stg` and
 * `production`/`prod`. Anything else is treated as production.
 */
use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[allow(non_camel_case_types)]
pub enum EnvironmentType {
    development,
    staging,
    #[default]
    production,
}

impl FromStr for EnvironmentType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "development" | "dev" => Ok(EnvironmentType::development),
            "staging" | "stg" => Ok(EnvironmentType::staging),
            "production" | "prod" => Ok(EnvironmentType::production),
            _ => Err(()),
        }
    }
}

impl EnvironmentType {
    /**
     * Lenient parse, falling back to production.
     */
    pub fn parse_or_default(s: &str) -> Self {
        s.parse().unwrap_or_default()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentType::development => "development",
            EnvironmentType::staging => "staging",
            EnvironmentType::production => "production",
        }
    }

    pub fn is_development(&self) -> bool {
        *self == EnvironmentType::development
    }
}

impl fmt::Display for EnvironmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EnvironmentType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(EnvironmentType::parse_or_default(&s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aliases() {
        assert_eq!(EnvironmentType::parse_or_default("DEV"), EnvironmentType::development);
        assert_eq!(EnvironmentType::parse_or_default("stg"), EnvironmentType::staging);
        assert_eq!(EnvironmentType::parse_or_default(" prod "), EnvironmentType::production);
        assert_eq!(EnvironmentType::parse_or_default("qa"), EnvironmentType::production);
        assert!("qa".parse::<EnvironmentType>().is_err());
    }
}
