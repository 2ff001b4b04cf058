//! Process signals and host liveness, turned into session signals.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use walrelay_config::RelayConfig;
use walrelay_pg::SessionSettings;

use crate::config::{ignored_changes, load_config, session_settings};

/// How often the parent process id is checked.
const PARENT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Cancel `terminate` on SIGTERM or SIGINT (Ctrl+C).
pub fn spawn_terminate_handler(terminate: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let (mut sigterm, mut sigint) = match (
                signal(SignalKind::terminate()),
                signal(SignalKind::interrupt()),
            ) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    warn!(error = %e, "Failed to install termination handlers");
                    return;
                }
            };

            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM"),
                _ = sigint.recv() => info!("Received SIGINT (Ctrl+C)"),
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl+C");
                return;
            }
            info!("Received Ctrl+C");
        }

        terminate.cancel();
    });
}

/// Re-read the config file on SIGHUP and push the reloadable settings to the session.
#[cfg(unix)]
pub fn spawn_reload_handler(
    config_path: PathBuf,
    running: RelayConfig,
    settings: watch::Sender<SessionSettings>,
) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut sighup = match signal(SignalKind::hangup()) {
            Ok(sighup) => sighup,
            Err(e) => {
                warn!(error = %e, "Failed to install SIGHUP handler");
                return;
            }
        };

        while sighup.recv().await.is_some() {
            let reloaded = match load_config(&config_path) {
                Ok(config) => config,
                Err(e) => {
                    warn!(error = %format!("{:#}", e), "Reload failed, keeping current settings");
                    continue;
                }
            };

            for field in ignored_changes(&running, &reloaded) {
                warn!(field, "Setting changed on reload but requires a restart, ignored");
            }

            if settings.send(session_settings(&reloaded.session)).is_err() {
                // Session is gone.
                return;
            }
        }
    });
}

#[cfg(not(unix))]
pub fn spawn_reload_handler(
    _config_path: PathBuf,
    _running: RelayConfig,
    _settings: watch::Sender<SessionSettings>,
) {
}

/// Cancel `host_gone` once this process is re-parented, meaning its supervisor died.
#[cfg(unix)]
pub fn spawn_parent_watch(host_gone: CancellationToken) {
    let parent = std::os::unix::process::parent_id();

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PARENT_POLL_INTERVAL);
        loop {
            interval.tick().await;
            if parent_changed(parent, std::os::unix::process::parent_id()) {
                host_gone.cancel();
                return;
            }
        }
    });
}

#[cfg(not(unix))]
pub fn spawn_parent_watch(_host_gone: CancellationToken) {}

fn parent_changed(original: u32, current: u32) -> bool {
    original != current
}
