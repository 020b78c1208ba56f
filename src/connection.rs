//! Command façade over a single client
use std::sync::atomic::{AtomicBool, Ordering};

use crate::client::{Client, ConnectOptions, Stream};
use crate::error::{Error, ErrorKind, Result};
use crate::statement::Statement;

/// A connection to Mariadb/Mysql.
///
/// Thin façade over one exclusively owned [Client]. Disposal is latched:
/// once shut down, every method fails.
#[derive(Debug)]
pub struct Connection {
    /// The underlying client
    client: Client,
    /// Latched by shutdown
    disposed: AtomicBool,
}

impl Connection {
    /// Authenticate over an opened stream
    pub async fn connect<S>(stream: S, options: &ConnectOptions<'_>) -> Result<Connection>
    where
        S: Stream + 'static,
    {
        Ok(Connection::from_client(
            Client::handshake(stream, options).await?,
        ))
    }

    /// Wrap an already authenticated client
    pub fn from_client(client: Client) -> Connection {
        Connection {
            client,
            disposed: AtomicBool::new(false),
        }
    }

    fn check(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) || self.client.is_disposed() {
            return Err(ErrorKind::ConnectionDisposed.into());
        }
        Ok(())
    }

    /// The underlying client
    pub(crate) fn client(&self) -> &Client {
        &self.client
    }

    /// Unwrap the connection, keeping the client alive
    pub(crate) fn into_client(self) -> Client {
        self.client
    }

    /// Measure a server round trip in milliseconds
    pub async fn ping(&self) -> Result<u64> {
        self.check()?;
        self.client.ping().await
    }

    /// Create a prepared statement for the given SQL
    pub fn prepare(&self, sql: impl Into<String>) -> Result<Statement> {
        self.check()?;
        Ok(Statement::new(self.client.clone(), sql.into()))
    }

    /// Open a transaction, optionally read-only
    pub async fn begin_transaction(&self, read_only: bool) -> Result<()> {
        self.check()?;
        self.client.begin_transaction(read_only).await
    }

    /// Commit the open transaction
    pub async fn commit(&self) -> Result<()> {
        self.check()?;
        self.client.commit().await
    }

    /// Roll the open transaction back
    pub async fn roll_back(&self) -> Result<()> {
        self.check()?;
        self.client.roll_back().await
    }

    /// Shut the connection down. Idempotent.
    pub async fn shutdown(&self, reason: Option<Error>) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.client.shutdown(reason).await;
    }
}
