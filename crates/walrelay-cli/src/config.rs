use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use url::Url;

use walrelay_config::{RelayConfig, SessionConfig};
use walrelay_pg::SessionSettings;

/// Read and validate walrelay.toml.
pub fn load_config(path: &Path) -> Result<RelayConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    RelayConfig::parse(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

/// Reloadable part of the config as seen by the session.
pub fn session_settings(session: &SessionConfig) -> SessionSettings {
    SessionSettings {
        idle_time: session.idle_time(),
        status_interval: session.status_interval(),
    }
}

/// Settings a reload cannot change, listed when they differ from the running config.
pub fn ignored_changes(running: &RelayConfig, reloaded: &RelayConfig) -> Vec<&'static str> {
    let mut changed = Vec::new();
    if running.name != reloaded.name {
        changed.push("name");
    }
    if running.origin.connection_string != reloaded.origin.connection_string {
        changed.push("origin.connection_string");
    }
    if running.origin.slot_name != reloaded.origin.slot_name {
        changed.push("origin.slot_name");
    }
    if running.destination.connection_string != reloaded.destination.connection_string {
        changed.push("destination.connection_string");
    }
    if running.destination.database != reloaded.destination.database {
        changed.push("destination.database");
    }
    if running.guard_policy() != reloaded.guard_policy() {
        changed.push("guard");
    }
    changed
}

/// Hide the password of a URL or key/value connection string.
pub fn mask_password(connection_string: &str) -> String {
    if connection_string.starts_with("postgres://") || connection_string.starts_with("postgresql://")
    {
        return match Url::parse(connection_string) {
            Ok(mut url) if url.password().is_some() => {
                let _ = url.set_password(Some("****"));
                url.to_string()
            }
            _ => connection_string.to_string(),
        };
    }

    connection_string
        .split_whitespace()
        .map(|pair| match pair.split_once('=') {
            Some((key, _)) if key == "password" => "password=****".to_string(),
            _ => pair.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}
