use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use walrelay_config::RelayConfig;
use walrelay_pg::{
    exit_code, PgApplier, ReplicationConnection, SessionSignals, StreamingSession,
};

use crate::config::session_settings;
use crate::signals::{spawn_parent_watch, spawn_reload_handler, spawn_terminate_handler};

/// Connect both sides and stream until the session ends. Returns the process exit status.
pub async fn run_relay(config: RelayConfig, config_path: &Path) -> Result<i32> {
    let origin = config.origin_connection_string()?;
    let destination = config.destination_connection_string()?;

    let (signals, settings_tx) = SessionSignals::new(session_settings(&config.session));
    spawn_terminate_handler(signals.terminate.clone());
    spawn_reload_handler(config_path.to_path_buf(), config.clone(), settings_tx);
    spawn_parent_watch(signals.host_gone.clone());

    info!(
        name = %config.name,
        slot = %config.origin.slot_name,
        database = %config.destination.database,
        "Starting relay"
    );

    let applier = PgApplier::connect(
        &destination,
        &config.destination.database,
        config.guard_policy(),
    )
    .await
    .context("Could not establish connection to destination database")?;

    let transport = ReplicationConnection::start(&origin, &config.origin.slot_name, &config.name)
        .await
        .context("Could not start streaming from origin")?;

    let result = StreamingSession::new(config.name.clone(), transport, applier, signals)
        .run()
        .await;

    Ok(exit_code(&result))
}
