//! PostgreSQL sessions opened over dialer-provided streams.

pub mod connector;
pub mod pool;
pub mod value;

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_postgres::{Client, Connection};

use crate::models::error::{Result, TunnelError};

pub use connector::{DriverConnector, PgTarget};
pub use pool::{ConnectionPool, PoolOptions, PooledDatabase};
pub use value::CellValue;

/// Rows returned by `Database::query_rows`
#[derive(Debug, Clone, Default)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
}

/// One live driver connection. The protocol task runs on the runtime until
/// the client is dropped or the stream fails.
pub struct Database {
    client: Client,
    connection: JoinHandle<()>,
    label: String,
}

impl Database {
    pub(crate) fn spawn<S, T>(client: Client, connection: Connection<S, T>, label: String) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let task_label = label.clone();
        let connection = tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!("PostgreSQL connection to {} ended: {}", task_label, e);
            }
        });
        Self {
            client,
            connection,
            label,
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Database address this session was started for
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_closed(&self) -> bool {
        self.client.is_closed()
    }

    /// Round-trip `SELECT 1`, bounded by `timeout`.
    pub async fn ping(&self, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.client.simple_query("SELECT 1")).await {
            Ok(result) => {
                result?;
                Ok(())
            }
            Err(_) => Err(TunnelError::Database {
                message: format!(
                    "Ping to {} timed out after {}ms",
                    self.label,
                    timeout.as_millis()
                ),
            }),
        }
    }

    /// Run a statement and convert every column of every row.
    pub async fn query_rows(&self, sql: &str) -> Result<QueryRows> {
        let statement = self.client.prepare(sql).await?;
        let columns = statement
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();

        let rows = self
            .client
            .query(&statement, &[])
            .await?
            .iter()
            .map(|row| (0..row.len()).map(|idx| CellValue::from_row(row, idx)).collect())
            .collect();

        Ok(QueryRows { columns, rows })
    }

    /// Terminate the session and wait briefly for the protocol task.
    pub async fn close(self) {
        let Database {
            client,
            mut connection,
            label,
        } = self;
        drop(client);
        if tokio::time::timeout(Duration::from_secs(1), &mut connection)
            .await
            .is_err()
        {
            tracing::debug!("PostgreSQL connection to {} did not close in time", label);
            connection.abort();
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::profile::{Profile, SslMode};
    use crate::transport::DirectDialer;
    use std::sync::Arc;

    async fn connect_to(answer_queries: bool, ssl_mode: SslMode) -> Database {
        let address = fake_server::start(answer_queries).await;
        let profile = Profile {
            user: "postgres".into(),
            host: address.host.clone(),
            port: address.port,
            database: "app".into(),
            ssl_mode,
            ..Default::default()
        };
        let target = PgTarget::from_profile(&profile, "pgtunnel").unwrap();
        DriverConnector::new(Arc::new(DirectDialer), target, Duration::from_secs(2))
            .connect()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_ping_round_trip() {
        let db = connect_to(true, SslMode::Disable).await;
        db.ping(Duration::from_secs(2)).await.unwrap();
        assert!(!db.is_closed());
        db.close().await;
    }

    #[tokio::test]
    async fn test_prefer_falls_back_to_plaintext() {
        let db = connect_to(true, SslMode::Prefer).await;
        db.ping(Duration::from_secs(2)).await.unwrap();
        db.close().await;
    }

    #[tokio::test]
    async fn test_ping_times_out() {
        let db = connect_to(false, SslMode::Disable).await;
        let err = db.ping(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, TunnelError::Database { .. }));
        assert!(err.to_string().contains("timed out"));
        db.close().await;
    }
}
