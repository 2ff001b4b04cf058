//! Replays statements against the destination database.

use std::future::Future;

use tokio_postgres::Client;
use tracing::{debug, info, warn};
use walrelay_core::{is_restricted, ApplyOutcome, GuardPolicy, StatementKind};

use crate::connect::connect_postgres;
use crate::error::{PgError, PgResult};

/// Savepoint wrapped around every statement so a failure only discards that statement.
const APPLY_SAVEPOINT: &str = "walrelay_apply";

/// Applies statements inside a transaction owned by the caller.
///
/// `apply` reports ordinary SQL failures as [`ApplyOutcome::Other`] after
/// logging them. An `Err` means the destination itself is unusable.
pub trait ChangeApplier: Send {
    /// Open the transaction for a drain cycle.
    fn begin(&mut self) -> impl Future<Output = PgResult<()>> + Send;

    /// Execute one statement in the open transaction.
    fn apply(&mut self, statement: &str) -> impl Future<Output = PgResult<ApplyOutcome>> + Send;

    /// Commit the drain cycle's transaction.
    fn commit(&mut self) -> impl Future<Output = PgResult<()>> + Send;
}

/// [`ChangeApplier`] backed by a tokio-postgres client.
pub struct PgApplier {
    client: Client,
    guard: Option<GuardPolicy>,
    /// Role the statements run as, checked against the guard.
    current_user: String,
}

impl PgApplier {
    /// Connect to the destination database.
    pub async fn connect(
        connection_string: &str,
        database: &str,
        guard: Option<GuardPolicy>,
    ) -> PgResult<Self> {
        let client = connect_postgres(connection_string, Some(database)).await?;
        Self::new(client, guard).await
    }

    pub async fn new(client: Client, guard: Option<GuardPolicy>) -> PgResult<Self> {
        let current_user: String = client
            .query_one("SELECT current_user::text", &[])
            .await?
            .get(0);

        if let Some(policy) = &guard {
            info!(
                user = %current_user,
                protected_database = %policy.protected_database,
                "DROP DATABASE guard enabled"
            );
        }

        Ok(Self {
            client,
            guard,
            current_user,
        })
    }

    /// Get the underlying client.
    pub fn client(&self) -> &Client {
        &self.client
    }

    async fn execute_in_savepoint(&self, statement: &str) -> PgResult<Result<(), PgError>> {
        self.client
            .batch_execute(&format!("SAVEPOINT {}", APPLY_SAVEPOINT))
            .await?;

        match self.client.batch_execute(statement).await {
            Ok(()) => {
                self.client
                    .batch_execute(&format!("RELEASE SAVEPOINT {}", APPLY_SAVEPOINT))
                    .await?;
                Ok(Ok(()))
            }
            Err(e) if self.client.is_closed() => Err(e.into()),
            Err(e) => {
                self.client
                    .batch_execute(&format!("ROLLBACK TO SAVEPOINT {}", APPLY_SAVEPOINT))
                    .await?;
                Ok(Err(PgError::Apply(PgError::from(e).to_string())))
            }
        }
    }
}

impl ChangeApplier for PgApplier {
    async fn begin(&mut self) -> PgResult<()> {
        self.client.batch_execute("BEGIN").await?;
        Ok(())
    }

    async fn apply(&mut self, statement: &str) -> PgResult<ApplyOutcome> {
        if statement.trim().is_empty() {
            debug!("Empty change received, nothing to apply");
            return Ok(ApplyOutcome::Other);
        }

        let kind = StatementKind::classify(statement);

        if let Some(policy) = &self.guard {
            if is_restricted(&kind, &self.current_user, policy) {
                warn!(
                    user = %self.current_user,
                    "Only super-superuser \"{}\" can drop database \"{}\", skipping: {}",
                    policy.privileged_user,
                    policy.protected_database,
                    statement
                );
                return Ok(ApplyOutcome::Other);
            }
        }

        if let Err(e) = self.execute_in_savepoint(statement).await? {
            warn!(error = %e, "Error when applying change: {}", statement);
            return Ok(ApplyOutcome::Other);
        }

        match kind {
            StatementKind::Insert => info!("INSERT received correctly: {}", statement),
            StatementKind::Update => info!("UPDATE received correctly: {}", statement),
            StatementKind::Delete => info!("DELETE received correctly: {}", statement),
            _ => info!("Statement applied: {}", statement),
        }

        Ok(kind.outcome())
    }

    async fn commit(&mut self) -> PgResult<()> {
        self.client.batch_execute("COMMIT").await?;
        Ok(())
    }
}
