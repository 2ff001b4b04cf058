use std::time::Duration;

use serde::Deserialize;
use walrelay_core::GuardPolicy;

use crate::error::{ConfigError, ConfigResult};
use crate::validation::validate_config;

/// Session name used to tag every log line.
pub const DEFAULT_NAME: &str = "receiver_raw";

/// Relay configuration as parsed from walrelay.toml.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Session name.
    #[serde(default = "default_name")]
    pub name: String,
    /// Server the changes are streamed from.
    #[serde(default)]
    pub origin: OriginConfig,
    /// Database the changes are applied into.
    #[serde(default)]
    pub destination: DestinationConfig,
    /// Receive loop tuning.
    #[serde(default)]
    pub session: SessionConfig,
    /// Optional DROP DATABASE restriction.
    pub guard: Option<GuardConfig>,
}

/// Origin (replication) connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct OriginConfig {
    /// Connection string; `replication=database` is always requested.
    #[serde(default = "default_origin_connection")]
    pub connection_string: String,
    /// Logical replication slot to stream from.
    #[serde(default = "default_slot")]
    pub slot_name: String,
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            connection_string: default_origin_connection(),
            slot_name: default_slot(),
        }
    }
}

/// Destination database settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DestinationConfig {
    #[serde(default = "default_destination_connection")]
    pub connection_string: String,
    /// Overrides the dbname of the connection string.
    #[serde(default = "default_database")]
    pub database: String,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            connection_string: default_destination_connection(),
            database: default_database(),
        }
    }
}

/// Receive loop settings. Both values are reloadable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SessionConfig {
    /// Nap time between two loops (ms).
    #[serde(default = "default_idle_time_ms")]
    pub idle_time_ms: u64,
    /// Unsolicited feedback interval (ms), 0 disables it.
    #[serde(default)]
    pub status_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_time_ms: default_idle_time_ms(),
            status_interval_ms: 0,
        }
    }
}

impl SessionConfig {
    pub fn idle_time(&self) -> Duration {
        Duration::from_millis(self.idle_time_ms)
    }

    pub fn status_interval(&self) -> Option<Duration> {
        (self.status_interval_ms > 0).then(|| Duration::from_millis(self.status_interval_ms))
    }
}

/// Who may drop which database.
#[derive(Debug, Clone, Deserialize)]
pub struct GuardConfig {
    pub protected_database: String,
    pub privileged_user: String,
}

impl GuardConfig {
    pub fn to_policy(&self) -> GuardPolicy {
        GuardPolicy {
            protected_database: self.protected_database.clone(),
            privileged_user: self.privileged_user.clone(),
        }
    }
}

impl RelayConfig {
    /// Parse and validate a config from a TOML string.
    pub fn parse(toml_str: &str) -> ConfigResult<Self> {
        let config: RelayConfig = toml::from_str(toml_str)?;
        validate_config(&config)?;
        Ok(config)
    }

    /// Resolved origin connection string.
    pub fn origin_connection_string(&self) -> ConfigResult<String> {
        resolve_env(&self.origin.connection_string)
    }

    /// Resolved destination connection string.
    pub fn destination_connection_string(&self) -> ConfigResult<String> {
        resolve_env(&self.destination.connection_string)
    }

    pub fn guard_policy(&self) -> Option<GuardPolicy> {
        self.guard.as_ref().map(GuardConfig::to_policy)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            origin: OriginConfig::default(),
            destination: DestinationConfig::default(),
            session: SessionConfig::default(),
            guard: None,
        }
    }
}

/// Resolve environment variables in a string.
/// Supports ${VAR_NAME} syntax.
pub fn resolve_env(s: &str) -> ConfigResult<String> {
    let mut result = s.to_string();

    while let Some(start) = result.find("${") {
        let Some(end) = result[start..].find('}') else {
            break;
        };
        let var_name = &result[start + 2..start + end];
        let value = std::env::var(var_name)
            .map_err(|_| ConfigError::MissingEnvVar(var_name.to_string()))?;
        result = format!("{}{}{}", &result[..start], value, &result[start + end + 1..]);
    }

    Ok(result)
}

fn default_name() -> String {
    DEFAULT_NAME.to_string()
}

fn default_origin_connection() -> String {
    "replication=database dbname=postgres".to_string()
}

fn default_destination_connection() -> String {
    "host=localhost user=postgres".to_string()
}

fn default_slot() -> String {
    "slot".to_string()
}

fn default_database() -> String {
    "postgres".to_string()
}

fn default_idle_time_ms() -> u64 {
    100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty_uses_defaults() {
        let config = RelayConfig::parse("").unwrap();
        assert_eq!(config.name, "receiver_raw");
        assert_eq!(config.origin.slot_name, "slot");
        assert_eq!(
            config.origin.connection_string,
            "replication=database dbname=postgres"
        );
        assert_eq!(config.destination.database, "postgres");
        assert_eq!(config.session.idle_time(), Duration::from_millis(100));
        assert_eq!(config.session.status_interval(), None);
        assert!(config.guard_policy().is_none());
    }

    #[test]
    fn test_parse_full() {
        let toml = r#"
name = "relay_a"

[origin]
connection_string = "host=origin port=5433 user=repl"
slot_name = "relay_slot"

[destination]
connection_string = "host=localhost user=postgres"
database = "mirror"

[session]
idle_time_ms = 250
status_interval_ms = 10000

[guard]
protected_database = "mirror"
privileged_user = "postgres"
"#;
        let config = RelayConfig::parse(toml).unwrap();
        assert_eq!(config.name, "relay_a");
        assert_eq!(config.origin.slot_name, "relay_slot");
        assert_eq!(config.destination.database, "mirror");
        assert_eq!(config.session.idle_time_ms, 250);
        assert_eq!(
            config.session.status_interval(),
            Some(Duration::from_secs(10))
        );

        let policy = config.guard_policy().unwrap();
        assert_eq!(policy.protected_database, "mirror");
        assert_eq!(policy.privileged_user, "postgres");
    }

    #[test]
    fn test_parse_rejects_bad_toml() {
        assert!(matches!(
            RelayConfig::parse("name = "),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_resolve_env() {
        std::env::set_var("WALRELAY_TEST_RESOLVE", "hello");

        assert_eq!(resolve_env("${WALRELAY_TEST_RESOLVE}").unwrap(), "hello");
        assert_eq!(
            resolve_env("prefix_${WALRELAY_TEST_RESOLVE}_suffix").unwrap(),
            "prefix_hello_suffix"
        );
        assert_eq!(resolve_env("no_vars").unwrap(), "no_vars");
        assert!(matches!(
            resolve_env("${WALRELAY_TEST_DEFINITELY_UNSET}"),
            Err(ConfigError::MissingEnvVar(name)) if name == "WALRELAY_TEST_DEFINITELY_UNSET"
        ));
    }
}
