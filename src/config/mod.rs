/**
 * Initialize client configuration, using hierarchical configuration
 * https://docs.rs/config/latest/config/
 *
 * 1. First synturn.yaml is read
 * 2. Then synturn.{environment}.yaml is read
 * 3. Then synturn.local.yaml is read (this is normally used for dev and not checked in git)
 * 4. Finally, environment variables prefixed with SYNTURN_ are read
 */
use std::{env, fmt};

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::auth::{Credential, StaticCredential};

mod conn_type;
mod environment_type;
mod loglevel_type;

pub use conn_type::ConnType;
pub use environment_type::EnvironmentType;

/// Environment variable selecting the environment-specific config file.
pub(crate) const ENVIRONMENT_VAR: &str = "SYNTURN_ENVIRONMENT";

/**
 * Represents the configuration settings for the TURN client.
 *
 * Fields:
 * - `environment`: The environment type (e.g., development, staging, or production).
 * - `server`: TURN server name or IP address.
 * - `server_port`: Port used when `server` does not carry one.
 * - `transport`: How to reach the server, udp or tcp.
 * - `bind_address`: Local address to bind (hostname:port format).
 * - `username`, `password`: Long-term credential. An empty username disables authentication.
 * - `realm`: Realm to assume before the server announces one.
 * - `software_name`: Added as the SOFTWARE attribute of outgoing messages.
 * - `lifetime`: Requested allocation lifetime in seconds.
 * - `rto_ms`: Initial retransmission timeout in milliseconds.
 * - `max_transmit`: Transmissions of a request before it times out.
 * - `keep_alive_secs`: Interval of the keep-alive and permission refresh timer.
 * - `use_fingerprint`: Append FINGERPRINT to outgoing messages.
 * - `log_level`: The logging level. By default, logging is inferred from environment type if no other settings are found.
 */
#[derive(Deserialize, Clone)]
pub struct Settings {
    pub environment: EnvironmentType,
    pub server: String,
    pub server_port: u16,
    #[serde(deserialize_with = "conn_type::deserialize")]
    pub transport: ConnType,
    pub bind_address: String,
    pub username: String,
    pub password: String,
    pub realm: Option<String>,
    pub software_name: String,
    pub lifetime: u32,
    pub rto_ms: u64,
    pub max_transmit: u32,
    pub keep_alive_secs: u64,
    pub use_fingerprint: bool,
    #[serde(deserialize_with = "loglevel_type::deserialize")]
    pub log_level: slog::Level,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var(ENVIRONMENT_VAR).unwrap_or_else(|_| "production".into());

        let s = Config::builder()
            // default config file
            .add_source(File::with_name("synturn.yaml").required(false))
            // environment-based config file
            .add_source(File::with_name(&format!("synturn.{run_mode}.yaml")).required(false))
            // local config file (don't check this into source control)
            .add_source(File::with_name("synturn.local.yaml").required(false))
            .add_source(Environment::with_prefix("SYNTURN"))
            .set_default("environment", EnvironmentType::production.as_str())?
            .set_default("server", "127.0.0.1")?
            .set_default("server_port", 3478)?
            .set_default("transport", ConnType::Udp.as_str())?
            .set_default("bind_address", "0.0.0.0:0")?
            .set_default("username", "")?
            .set_default("password", "")?
            .set_default("software_name", "SYN_TURN/1")?
            .set_default("lifetime", 600)?
            .set_default("rto_ms", 500)?
            .set_default("max_transmit", 7)?
            .set_default("keep_alive_secs", 15)?
            .set_default("use_fingerprint", true)?
            .set_default("log_level", loglevel_type::default_level_name(&run_mode))?
            .build()?;

        s.try_deserialize()
    }

    /**
     * The configured long-term credential, `None` when no username is set.
     */
    pub fn credential(&self) -> Option<Credential> {
        if self.username.is_empty() {
            return None;
        }
        let mut credential = StaticCredential::new(&self.username, &self.password);
        credential.realm = self.realm.clone().filter(|r| !r.is_empty());
        Some(Credential::Static(credential))
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("environment", &self.environment)
            .field("server", &self.server)
            .field("server_port", &self.server_port)
            .field("transport", &self.transport)
            .field("bind_address", &self.bind_address)
            .field("username", &self.username)
            .field("realm", &self.realm)
            .field("software_name", &self.software_name)
            .field("lifetime", &self.lifetime)
            .field("rto_ms", &self.rto_ms)
            .field("max_transmit", &self.max_transmit)
            .field("keep_alive_secs", &self.keep_alive_secs)
            .field("use_fingerprint", &self.use_fingerprint)
            .field("log_level", &self.log_level)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    fn set_env_var(key: &str, value: &str) {
        env::set_var(key, value);
    }

    fn reset_env_var() {
        let v = env::vars().collect::<Vec<(String, String)>>();
        for (name, _) in v {
            if name.starts_with("SYNTURN_") {
                env::remove_var(name);
            }
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        reset_env_var();
        let settings = Settings::new().expect("Deserialization failed");
        assert_eq!(settings.environment, EnvironmentType::production);
        assert_eq!(settings.server, "127.0.0.1");
        assert_eq!(settings.server_port, 3478);
        assert_eq!(settings.transport, ConnType::Udp);
        assert_eq!(settings.bind_address, "0.0.0.0:0");
        assert_eq!(settings.software_name, "SYN_TURN/1");
        assert_eq!(settings.lifetime, 600);
        assert_eq!(settings.rto_ms, 500);
        assert_eq!(settings.max_transmit, 7);
        assert_eq!(settings.keep_alive_secs, 15);
        assert!(settings.use_fingerprint);
        assert_eq!(settings.realm, None);
        assert!(settings.credential().is_none());
    }

    #[test]
    #[serial]
    fn test_environment_variable_dev() {
        reset_env_var();
        set_env_var("SYNTURN_ENVIRONMENT", "development");
        let settings = Settings::new().expect("Deserialization failed");
        assert_eq!(
            settings.environment.as_str(),
            EnvironmentType::development.as_str()
        );
        reset_env_var();
    }

    #[test]
    #[serial]
    fn test_environment_variable_stg() {
        reset_env_var();
        set_env_var("SYNTURN_ENVIRONMENT", "stg");
        let settings = Settings::new().expect("Deserialization failed");
        assert_eq!(settings.environment, EnvironmentType::staging);
        reset_env_var();
    }

    #[test]
    #[serial]
    fn test_environment_variable_garbage() {
        reset_env_var();
        set_env_var("SYNTURN_ENVIRONMENT", "garbage");
        let settings = Settings::new().expect("Deserialization failed");
        assert_eq!(settings.environment, EnvironmentType::production);
        reset_env_var();
    }

    #[test]
    #[serial]
    fn test_server_variables() {
        reset_env_var();
        set_env_var("SYNTURN_SERVER", "turn.example.org");
        set_env_var("SYNTURN_SERVER_PORT", "5349");
        set_env_var("SYNTURN_BIND_ADDRESS", "127.0.0.1:5678");
        let settings = Settings::new().expect("Deserialization failed");
        assert_eq!(settings.server, "turn.example.org");
        assert_eq!(settings.server_port, 5349);
        assert_eq!(settings.bind_address, "127.0.0.1:5678");
        reset_env_var();
    }

    #[test]
    #[serial]
    fn test_transport_variable() {
        reset_env_var();
        set_env_var("SYNTURN_TRANSPORT", "TCP");
        let settings = Settings::new().expect("Deserialization failed");
        assert_eq!(settings.transport, ConnType::Tcp);

        set_env_var("SYNTURN_TRANSPORT", "udp");
        let settings = Settings::new().expect("Deserialization failed");
        assert_eq!(settings.transport, ConnType::Udp);

        set_env_var("SYNTURN_TRANSPORT", "sctp");
        let settings = Settings::new().expect("Deserialization failed");
        assert_eq!(settings.transport, ConnType::Udp);
        reset_env_var();
    }

    #[test]
    #[serial]
    fn test_fingerprint_variable_num() {
        reset_env_var();
        set_env_var("SYNTURN_USE_FINGERPRINT", "0");
        let settings = Settings::new().expect("Deserialization failed");
        assert!(!settings.use_fingerprint);

        set_env_var("SYNTURN_USE_FINGERPRINT", "true");
        let settings = Settings::new().expect("Deserialization failed");
        assert!(settings.use_fingerprint);
        reset_env_var();
    }

    #[test]
    #[serial]
    fn test_timing_variables() {
        reset_env_var();
        set_env_var("SYNTURN_RTO_MS", "250");
        set_env_var("SYNTURN_MAX_TRANSMIT", "3");
        set_env_var("SYNTURN_LIFETIME", "1200");
        set_env_var("SYNTURN_KEEP_ALIVE_SECS", "30");
        let settings = Settings::new().expect("Deserialization failed");
        assert_eq!(settings.rto_ms, 250);
        assert_eq!(settings.max_transmit, 3);
        assert_eq!(settings.lifetime, 1200);
        assert_eq!(settings.keep_alive_secs, 30);
        reset_env_var();
    }

    #[test]
    #[serial]
    fn test_credential() {
        reset_env_var();
        set_env_var("SYNTURN_USERNAME", "alice");
        set_env_var("SYNTURN_PASSWORD", "secret");
        set_env_var("SYNTURN_REALM", "example.org");
        let settings = Settings::new().expect("Deserialization failed");
        match settings.credential() {
            Some(Credential::Static(c)) => {
                assert_eq!(c.username, "alice");
                assert_eq!(c.password, b"secret");
                assert_eq!(c.realm.as_deref(), Some("example.org"));
            }
            other => panic!("unexpected credential {:?}", other),
        }
        assert!(!format!("{:?}", settings).contains("secret"));
        reset_env_var();
    }

    #[test]
    #[serial]
    fn test_log_level_none_none() {
        reset_env_var();
        let settings = Settings::new().expect("Deserialization failed");
        assert_eq!(settings.log_level, slog::Level::Warning);
        reset_env_var();
    }

    #[test]
    #[serial]
    fn test_log_level_combinations() {
        reset_env_var();

        set_env_var("SYNTURN_ENVIRONMENT", "production");
        let settings = Settings::new().expect("Deserialization failed");
        assert_eq!(settings.log_level, slog::Level::Warning);

        reset_env_var();
        set_env_var("SYNTURN_ENVIRONMENT", "staging");
        let settings = Settings::new().expect("Deserialization failed");
        assert_eq!(settings.log_level, slog::Level::Warning);

        reset_env_var();
        set_env_var("SYNTURN_ENVIRONMENT", "development");
        let settings = Settings::new().expect("Deserialization failed");
        assert_eq!(settings.log_level, slog::Level::Debug);

        reset_env_var();
        set_env_var("SYNTURN_ENVIRONMENT", "production");
        set_env_var("SYNTURN_LOG_LEVEL", "trace");
        let settings = Settings::new().expect("Deserialization failed");
        assert_eq!(settings.log_level, slog::Level::Trace);

        reset_env_var();
        set_env_var("SYNTURN_ENVIRONMENT", "development");
        set_env_var("SYNTURN_LOG_LEVEL", "Warning");
        let settings = Settings::new().expect("Deserialization failed");
        assert_eq!(settings.log_level, slog::Level::Warning);

        reset_env_var();
        set_env_var("SYNTURN_ENVIRONMENT", "development");
        set_env_var("SYNTURN_LOG_LEVEL", "garbage");
        let settings = Settings::new().expect("Deserialization failed");
        assert_eq!(settings.log_level, slog::Level::Debug);

        reset_env_var();
        set_env_var("SYNTURN_ENVIRONMENT", "production");
        set_env_var("SYNTURN_LOG_LEVEL", "garbage");
        let settings = Settings::new().expect("Deserialization failed");
        assert_eq!(settings.log_level, slog::Level::Warning);
        reset_env_var();
    }
}
