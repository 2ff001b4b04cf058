//! Destination database connection with TLS support.

use std::sync::Arc;

use rustls::ClientConfig;
use tokio_postgres::{Client, Config};
use tokio_postgres_rustls_improved::MakeRustlsConnect;
use tracing::{error, info};

use crate::error::{PgError, PgResult};

/// Connect to Postgres with TLS settings based on the sslmode in the connection string.
///
/// `database` overrides the dbname of the connection string. The connection
/// task is spawned and only the client is returned.
pub async fn connect_postgres(connection_string: &str, database: Option<&str>) -> PgResult<Client> {
    let mut config: Config = connection_string
        .parse()
        .map_err(|e: tokio_postgres::Error| PgError::Connection(e.to_string()))?;
    if let Some(database) = database {
        config.dbname(database);
    }

    info!(
        database = config.get_dbname().unwrap_or_default(),
        tls = requires_tls(connection_string),
        "Connecting to destination database"
    );

    if requires_tls(connection_string) {
        let tls_config =
            ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
                .with_safe_default_protocol_versions()
                .map_err(|e| PgError::Connection(format!("TLS config error: {}", e)))?
                .with_root_certificates(root_certs())
                .with_no_client_auth();

        let connector = MakeRustlsConnect::new(tls_config);

        let (client, connection) = config
            .connect(connector)
            .await
            .map_err(|e| PgError::Connection(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "Destination connection error");
            }
        });

        Ok(client)
    } else {
        let (client, connection) = config
            .connect(tokio_postgres::NoTls)
            .await
            .map_err(|e| PgError::Connection(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "Destination connection error");
            }
        });

        Ok(client)
    }
}

/// Get root certificates from webpki-roots.
fn root_certs() -> rustls::RootCertStore {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    roots
}

/// Check if the connection string requires TLS.
pub(crate) fn requires_tls(connection_string: &str) -> bool {
    connection_string.contains("sslmode=require")
        || connection_string.contains("sslmode=verify-ca")
        || connection_string.contains("sslmode=verify-full")
}
