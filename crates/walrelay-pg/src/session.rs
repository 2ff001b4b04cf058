//! The streaming receive loop.
//!
//! One session owns one replication connection and one destination
//! connection. Each wake-up opens a transaction, drains every frame that is
//! available without blocking, commits, then blocks on the socket until the
//! next status deadline:
//!
//! ```text
//! Streaming --ready--> Draining --would block--> commit --> Waiting --> Streaming
//!     |                    |
//!     | terminate          | end of stream
//!     v                    v
//! Terminated           EndOfStream
//! ```
//!
//! Keepalives advance the [`PositionTracker`] and are answered immediately
//! when the server asks, from inside the still-open transaction. Positions
//! are therefore acknowledged before the statements of the cycle are
//! committed locally: after a crash mid-cycle the origin may believe more was
//! flushed than was durably applied, and statements can be replayed again
//! after a restart.

use std::borrow::Cow;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use walrelay_core::{pg_now, wakeup_timeout, ApplyOutcome, Frame, PositionTracker};

use crate::apply::ChangeApplier;
use crate::error::{PgError, PgResult};
use crate::feedback::send_feedback;
use crate::replication::{CopyRead, ReplicationTransport};

/// Settings that may change while the session runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    /// Upper bound of the wait at the top of the loop.
    pub idle_time: Duration,
    /// Period of unsolicited status updates, if any.
    pub status_interval: Option<Duration>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_time: Duration::from_millis(100),
            status_interval: None,
        }
    }
}

/// Cooperative signals delivered to the session by the lifecycle shell.
pub struct SessionSignals {
    /// Graceful stop. Observed at the top of the loop and during the blocking wait.
    pub terminate: CancellationToken,
    /// The supervising process is gone. Fatal.
    pub host_gone: CancellationToken,
    /// Reloaded settings. Picked up at the top of the loop.
    pub settings: watch::Receiver<SessionSettings>,
}

impl SessionSignals {
    /// Signals with fresh tokens, plus the sender for settings reloads.
    pub fn new(settings: SessionSettings) -> (Self, watch::Sender<SessionSettings>) {
        let (tx, rx) = watch::channel(settings);
        let signals = Self {
            terminate: CancellationToken::new(),
            host_gone: CancellationToken::new(),
            settings: rx,
        };
        (signals, tx)
    }
}

/// How a session ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionExit {
    /// A termination signal was processed.
    Terminated,
    /// The origin ended the COPY stream.
    EndOfStream,
}

/// Process exit status for a finished session.
pub fn exit_code(result: &PgResult<SessionExit>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(_) => 1,
    }
}

/// What ended a wait at the top of the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    Ready,
    Timeout,
    Terminate,
    HostGone,
}

/// How a drain cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainEnd {
    WouldBlock,
    EndOfStream,
}

/// Per-cycle counters.
#[derive(Debug, Default)]
struct BatchStats {
    inserted: u64,
    updated: u64,
    deleted: u64,
    other: u64,
    keepalives: u64,
}

impl BatchStats {
    fn record(&mut self, outcome: ApplyOutcome) {
        match outcome {
            ApplyOutcome::Inserted => self.inserted += 1,
            ApplyOutcome::Updated => self.updated += 1,
            ApplyOutcome::Deleted => self.deleted += 1,
            ApplyOutcome::Other => self.other += 1,
        }
    }

    fn statements(&self) -> u64 {
        self.inserted + self.updated + self.deleted + self.other
    }
}

/// Streaming session state: connection, tracked positions and signals.
pub struct StreamingSession<T, A> {
    name: String,
    transport: T,
    applier: A,
    tracker: PositionTracker,
    signals: SessionSignals,
    settings: SessionSettings,
    /// PostgreSQL-epoch microseconds of the last status update, 0 if none.
    last_feedback: i64,
}

impl<T, A> StreamingSession<T, A>
where
    T: ReplicationTransport,
    A: ChangeApplier,
{
    /// Build a session around an already-started replication transport.
    pub fn new(name: impl Into<String>, transport: T, applier: A, signals: SessionSignals) -> Self {
        let settings = *signals.settings.borrow();
        Self {
            name: name.into(),
            transport,
            applier,
            tracker: PositionTracker::new(),
            signals,
            settings,
            last_feedback: 0,
        }
    }

    /// Run until terminated, the stream ends, or a fatal error.
    ///
    /// The transport is closed in every case.
    pub async fn run(mut self) -> PgResult<SessionExit> {
        let span = info_span!("session", name = %self.name);

        let result = self.run_loop().instrument(span.clone()).await;
        if let Err(e) = &result {
            error!(parent: &span, error = %e, "Session failed");
        }

        self.transport.close().instrument(span).await;
        result
    }

    async fn run_loop(&mut self) -> PgResult<SessionExit> {
        info!(
            idle_time_ms = self.settings.idle_time.as_millis() as u64,
            "Streaming started"
        );

        loop {
            match self.wait_for_input().await? {
                Wake::Terminate => {
                    info!("processed SIGTERM");
                    return Ok(SessionExit::Terminated);
                }
                Wake::HostGone => {
                    error!("host process has died, leaving");
                    return Err(PgError::HostGone);
                }
                Wake::Timeout => {
                    self.send_status_if_due().await?;
                    continue;
                }
                Wake::Ready => {}
            }

            if self.drain().await? == DrainEnd::EndOfStream {
                info!("COPY stream has ended");
                return Ok(SessionExit::EndOfStream);
            }

            self.send_status_if_due().await?;
            self.wait_for_more().await?;
        }
    }

    /// Top of the loop: apply reloads, then wait for data or a signal.
    async fn wait_for_input(&mut self) -> PgResult<Wake> {
        self.reload_settings();

        if self.signals.terminate.is_cancelled() {
            return Ok(Wake::Terminate);
        }
        if self.signals.host_gone.is_cancelled() {
            return Ok(Wake::HostGone);
        }

        let idle_time = self.settings.idle_time;
        let waited = tokio::select! {
            biased;
            _ = self.signals.terminate.cancelled() => return Ok(Wake::Terminate),
            _ = self.signals.host_gone.cancelled() => return Ok(Wake::HostGone),
            waited = tokio::time::timeout(idle_time, self.transport.wait_readable()) => waited,
        };

        match waited {
            Ok(ready) => ready.map(|()| Wake::Ready),
            Err(_) => Ok(Wake::Timeout),
        }
    }

    /// Apply every frame available right now inside one transaction.
    async fn drain(&mut self) -> PgResult<DrainEnd> {
        self.applier.begin().await?;
        let mut stats = BatchStats::default();

        let end = loop {
            match self.transport.try_next_frame()? {
                CopyRead::WouldBlock => break DrainEnd::WouldBlock,
                CopyRead::Done => break DrainEnd::EndOfStream,
                CopyRead::Data(data) => self.handle_frame(&data, &mut stats).await?,
            }
        };

        self.applier.commit().await?;

        if stats.statements() > 0 || stats.keepalives > 0 {
            debug!(
                inserted = stats.inserted,
                updated = stats.updated,
                deleted = stats.deleted,
                other = stats.other,
                keepalives = stats.keepalives,
                written = %self.tracker.written(),
                "Batch committed"
            );
        }

        Ok(end)
    }

    async fn handle_frame(&mut self, data: &[u8], stats: &mut BatchStats) -> PgResult<()> {
        let frame = Frame::decode(data).inspect_err(|e| error!(error = %e, "Incorrect streaming header"))?;

        match frame {
            Frame::Keepalive(keepalive) => {
                stats.keepalives += 1;
                self.tracker.observe(keepalive.server_position);
                debug!(
                    server_position = %keepalive.server_position,
                    reply_requested = keepalive.reply_requested,
                    "Keepalive"
                );

                if keepalive.reply_requested {
                    self.send_status().await?;
                }
            }
            Frame::WalData(wal) => {
                let statement = wal.statement();
                if matches!(statement, Cow::Owned(_)) {
                    warn!(
                        data_start = %wal.data_start,
                        "Change payload is not valid UTF-8, applying lossily"
                    );
                }
                let outcome = self.applier.apply(&statement).await?;
                stats.record(outcome);
            }
        }

        Ok(())
    }

    /// Waiting state: block on the socket until input arrives, a signal, or the deadline.
    async fn wait_for_more(&mut self) -> PgResult<()> {
        let timeout = wakeup_timeout(pg_now(), self.message_target(), 0);

        let waited = tokio::select! {
            biased;
            // Observed at the top of the loop.
            _ = self.signals.terminate.cancelled() => return Ok(()),
            _ = self.signals.host_gone.cancelled() => return Ok(()),
            waited = tokio::time::timeout(timeout, self.transport.wait_readable()) => waited,
        };

        match waited {
            // Timed out; loop around and maybe send a status update.
            Err(_) => Ok(()),
            Ok(Err(e)) => {
                error!(error = %e, "Incorrect status received, leaving");
                Err(e)
            }
            Ok(Ok(())) => self
                .transport
                .consume_input()
                .inspect_err(|e| error!(error = %e, "Could not read data remaining on the socket, leaving")),
        }
    }

    fn reload_settings(&mut self) {
        if !matches!(self.signals.settings.has_changed(), Ok(true)) {
            return;
        }

        self.settings = *self.signals.settings.borrow_and_update();
        info!(
            idle_time_ms = self.settings.idle_time.as_millis() as u64,
            status_interval_ms = self
                .settings
                .status_interval
                .map_or(0, |d| d.as_millis() as u64),
            "processed SIGHUP"
        );
    }

    /// Next unsolicited status deadline, or 0 when periodic updates are off.
    fn message_target(&self) -> i64 {
        match self.settings.status_interval {
            Some(interval) => self.last_feedback + interval.as_micros() as i64,
            None => 0,
        }
    }

    async fn send_status_if_due(&mut self) -> PgResult<()> {
        let target = self.message_target();
        if target > 0 && pg_now() >= target {
            self.send_status().await?;
        }
        Ok(())
    }

    async fn send_status(&mut self) -> PgResult<()> {
        let now = pg_now();
        send_feedback(&mut self.transport, &self.tracker, now).await?;
        self.last_feedback = now;
        Ok(())
    }
}
