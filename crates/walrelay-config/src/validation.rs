use crate::error::{ConfigError, ConfigResult};
use crate::relay::{GuardConfig, RelayConfig};

pub const MIN_IDLE_TIME_MS: u64 = 1;
pub const MAX_IDLE_TIME_MS: u64 = 10_000;
/// One hour. 0 disables periodic status updates.
pub const MAX_STATUS_INTERVAL_MS: u64 = 3_600_000;

/// Longest identifier PostgreSQL accepts (NAMEDATALEN - 1).
const MAX_SLOT_NAME_LEN: usize = 63;

/// Validate a relay configuration.
pub fn validate_config(config: &RelayConfig) -> ConfigResult<()> {
    validate_required("name", &config.name)?;
    validate_required("origin.connection_string", &config.origin.connection_string)?;
    validate_slot_name(&config.origin.slot_name)?;
    validate_required(
        "destination.connection_string",
        &config.destination.connection_string,
    )?;
    validate_required("destination.database", &config.destination.database)?;
    validate_idle_time(config.session.idle_time_ms)?;
    validate_status_interval(config.session.status_interval_ms)?;
    if let Some(guard) = &config.guard {
        validate_guard(guard)?;
    }
    Ok(())
}

fn validate_required(field: &str, value: &str) -> ConfigResult<()> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingField {
            field: field.to_string(),
        });
    }
    Ok(())
}

fn validate_slot_name(name: &str) -> ConfigResult<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_SLOT_NAME_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_');

    if !valid {
        return Err(ConfigError::InvalidSlotName(name.to_string()));
    }
    Ok(())
}

fn validate_idle_time(value: u64) -> ConfigResult<()> {
    if !(MIN_IDLE_TIME_MS..=MAX_IDLE_TIME_MS).contains(&value) {
        return Err(ConfigError::InvalidIdleTime {
            value,
            min: MIN_IDLE_TIME_MS,
            max: MAX_IDLE_TIME_MS,
        });
    }
    Ok(())
}

fn validate_status_interval(value: u64) -> ConfigResult<()> {
    if value > MAX_STATUS_INTERVAL_MS {
        return Err(ConfigError::InvalidStatusInterval {
            value,
            max: MAX_STATUS_INTERVAL_MS,
        });
    }
    Ok(())
}

fn validate_guard(guard: &GuardConfig) -> ConfigResult<()> {
    validate_required("guard.protected_database", &guard.protected_database)?;
    validate_required("guard.privileged_user", &guard.privileged_user)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml: &str) -> ConfigResult<RelayConfig> {
        RelayConfig::parse(toml)
    }

    #[test]
    fn test_validate_defaults() {
        assert!(validate_config(&RelayConfig::default()).is_ok());
    }

    #[test]
    fn test_validate_idle_time_bounds() {
        assert!(parse("[session]\nidle_time_ms = 1").is_ok());
        assert!(parse("[session]\nidle_time_ms = 10000").is_ok());

        let result = parse("[session]\nidle_time_ms = 0");
        assert!(matches!(
            result,
            Err(ConfigError::InvalidIdleTime { value: 0, .. })
        ));

        let result = parse("[session]\nidle_time_ms = 10001");
        assert!(matches!(
            result,
            Err(ConfigError::InvalidIdleTime { value: 10001, .. })
        ));
    }

    #[test]
    fn test_validate_status_interval_bounds() {
        assert!(parse("[session]\nstatus_interval_ms = 0").is_ok());
        assert!(parse("[session]\nstatus_interval_ms = 3600000").is_ok());

        let result = parse("[session]\nstatus_interval_ms = 3600001");
        assert!(matches!(
            result,
            Err(ConfigError::InvalidStatusInterval { value: 3600001, .. })
        ));

        let result = parse("[session]\nstatus_interval_ms = 9223372036854775807");
        assert!(matches!(
            result,
            Err(ConfigError::InvalidStatusInterval { .. })
        ));
    }

    #[test]
    fn test_validate_slot_name() {
        assert!(parse("[origin]\nslot_name = \"relay_1\"").is_ok());

        for bad in ["", "Relay", "relay-1", "relay slot"] {
            let toml = format!("[origin]\nslot_name = \"{}\"", bad);
            assert!(
                matches!(parse(&toml), Err(ConfigError::InvalidSlotName(_))),
                "slot name {:?} should be rejected",
                bad
            );
        }

        let long = "a".repeat(64);
        let toml = format!("[origin]\nslot_name = \"{}\"", long);
        assert!(matches!(parse(&toml), Err(ConfigError::InvalidSlotName(_))));
    }

    #[test]
    fn test_validate_required_fields() {
        let result = parse("[destination]\ndatabase = \"\"");
        assert!(matches!(
            result,
            Err(ConfigError::MissingField { field }) if field == "destination.database"
        ));

        let result = parse("name = \"  \"");
        assert!(matches!(
            result,
            Err(ConfigError::MissingField { field }) if field == "name"
        ));
    }

    #[test]
    fn test_validate_guard() {
        let result = parse("[guard]\nprotected_database = \"db\"\nprivileged_user = \"\"");
        assert!(matches!(
            result,
            Err(ConfigError::MissingField { field }) if field == "guard.privileged_user"
        ));
    }
}
