//! A capacity- and state-aware pool of clients
//!
//! Example:
//! --------
//! ```no_run
//! use mariner::{Client, ConnectOptions, Pool, PoolOptions};
//!
//! async fn test() -> Result<(), mariner::Error> {
//!     let pool = Pool::new(PoolOptions { size: 10 }, || async {
//!         let stream = tokio::net::TcpStream::connect("127.0.0.1:3306")
//!             .await
//!             .map_err(mariner::ErrorKind::Io)?;
//!         Client::handshake(
//!             stream,
//!             &ConnectOptions::new("user").password("pw").database("test"),
//!         )
//!         .await
//!     });
//!
//!     let conn = pool.checkout().await?;
//!     println!("round trip: {}ms", conn.ping().await?);
//!
//!     Ok(())
//! }
//! ```
use std::collections::{BTreeMap, VecDeque};
use std::ops::Deref;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::sync::Notify;
use tracing::debug;

use crate::client::Client;
use crate::connection::Connection;
use crate::error::{Error, ErrorKind, Result};
use crate::result_set::ResultSet;
use crate::statement::Statement;
use crate::value::Value;

/// Options used for a connection pool
pub struct PoolOptions {
    /// The maximum number of concurrent clients
    pub size: usize,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self { size: 10 }
    }
}

/// Produces a freshly authenticated client on demand
type Factory = Arc<dyn Fn() -> BoxFuture<'static, Result<Client>> + Send + Sync>;

/// Part of pool state protected by a mutex
#[derive(Debug)]
struct PoolState {
    /// Clients created or being created; never exceeds the pool size
    active: usize,
    /// Clients parked and ready to loan, oldest first
    idle: VecDeque<Client>,
    /// Latched by shutdown
    disposed: bool,
}

impl std::fmt::Debug for PoolInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolInner")
            .field("size", &self.size)
            .field("state", &self.state)
            .field("available", &self.available)
            .finish_non_exhaustive()
    }
}

/// Inner state of a pool
struct PoolInner {
    /// The maximum number of concurrent clients
    size: usize,
    /// Creates a client when demand outgrows the idle queue
    factory: Factory,
    /// Counters and the idle queue
    state: Mutex<PoolState>,
    /// Signalled whenever a slot or an idle client becomes available
    available: Notify,
}

/// A pool of clients that can be checked out.
///
/// A checked-out client is owned by exactly one caller until released;
/// release re-queues healthy clients and evicts dead or dirty ones.
#[derive(Clone, Debug)]
pub struct Pool(Arc<PoolInner>);

impl Pool {
    /// Create a pool that fills itself on demand using `factory`
    pub fn new<F, Fut>(options: PoolOptions, factory: F) -> Pool
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Client>> + Send + 'static,
    {
        assert!(options.size >= 1, "pool size must be at least 1");
        Pool(Arc::new(PoolInner {
            size: options.size,
            factory: Arc::new(move || Box::pin(factory())),
            state: Mutex::new(PoolState {
                active: 0,
                idle: VecDeque::new(),
                disposed: false,
            }),
            available: Notify::new(),
        }))
    }

    /// Clients created or being created right now
    pub fn active(&self) -> usize {
        self.0.state.lock().unwrap().active
    }

    /// Clients parked in the idle queue
    pub fn idle(&self) -> usize {
        self.0.state.lock().unwrap().idle.len()
    }

    /// Check a connection out of the pool.
    ///
    /// Prefers an idle client; creates a fresh one while there is
    /// capacity; otherwise waits for a release, first come first served.
    pub async fn checkout(&self) -> Result<PooledConnection> {
        enum Next {
            Loan(Client),
            Create,
            Wait,
        }
        loop {
            let next = {
                let mut state = self.0.state.lock().unwrap();
                if state.disposed {
                    return Err(ErrorKind::PoolClosed.into());
                }
                if let Some(client) = state.idle.pop_front() {
                    Next::Loan(client)
                } else if state.active < self.0.size {
                    state.active += 1;
                    Next::Create
                } else {
                    Next::Wait
                }
            };
            match next {
                Next::Loan(client) => {
                    if client.is_disposed() {
                        // died while parked; give its slot back and retry
                        self.0.state.lock().unwrap().active -= 1;
                        self.0.available.notify_one();
                        continue;
                    }
                    return Ok(self.loan(client));
                }
                Next::Create => {
                    match (self.0.factory)().await {
                        Ok(client) => return Ok(self.loan(client)),
                        Err(e) => {
                            self.0.state.lock().unwrap().active -= 1;
                            self.0.available.notify_one();
                            return Err(ErrorKind::Create(e).into());
                        }
                    }
                }
                Next::Wait => self.0.available.notified().await,
            }
        }
    }

    /// Create a pooled statement that acquires a connection on its first
    /// execute
    pub fn prepare(&self, sql: impl Into<String>) -> Result<PooledStatement> {
        if self.0.state.lock().unwrap().disposed {
            return Err(ErrorKind::PoolClosed.into());
        }
        Ok(PooledStatement {
            pool: self.clone(),
            sql: sql.into(),
            limit: None,
            offset: None,
            binds: BTreeMap::new(),
            inner: None,
        })
    }

    /// Shut the pool down: fail waiters, close every idle client and
    /// refuse further checkouts. Loaned connections are evicted as they
    /// come back.
    pub async fn shutdown(&self, reason: Option<Error>) {
        let idle = {
            let mut state = self.0.state.lock().unwrap();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.active -= state.idle.len();
            std::mem::take(&mut state.idle)
        };
        self.0.available.notify_waiters();
        let reason = reason.unwrap_or_else(|| ErrorKind::PoolClosed.into());
        for client in idle {
            client.shutdown(Some(reason.clone())).await;
        }
        debug!("pool shut down");
    }

    fn loan(&self, client: Client) -> PooledConnection {
        PooledConnection {
            pool: self.clone(),
            connection: Some(Connection::from_client(client)),
        }
    }

    /// Decide what happens to a returning client: evict the dead and the
    /// dirty, re-queue the healthy.
    fn release(&self, client: Client) {
        let disposed = self.0.state.lock().unwrap().disposed;
        if disposed || client.is_disposed() {
            self.evict(client);
            return;
        }
        if client.is_in_transaction() {
            // the caller forgot to commit or roll back; probe once and
            // re-check what the server reports
            let pool = self.clone();
            tokio::spawn(async move {
                let probe = client.ping().await;
                if probe.is_err() || client.is_in_transaction() {
                    debug!(
                        connection_id = client.connection_id(),
                        "evicting client still in transaction"
                    );
                    pool.evict(client);
                } else {
                    pool.park(client);
                }
            });
            return;
        }
        self.park(client);
    }

    /// Put a healthy client back into the idle queue
    fn park(&self, client: Client) {
        {
            let mut state = self.0.state.lock().unwrap();
            if state.disposed {
                drop(state);
                self.evict(client);
                return;
            }
            state.idle.push_back(client);
        }
        self.0.available.notify_one();
    }

    /// Drop a client from the pool's accounting and close it
    fn evict(&self, client: Client) {
        self.0.state.lock().unwrap().active -= 1;
        self.0.available.notify_one();
        tokio::spawn(async move {
            client.shutdown(None).await;
        });
    }
}

/// A connection on loan from a [Pool].
///
/// Dereferences to [Connection]. Dropping it returns the client to the
/// pool; [PooledConnection::shutdown] evicts it instead.
#[derive(Debug)]
pub struct PooledConnection {
    /// The pool the connection is on loan from
    pool: Pool,
    /// The loaned connection; empty only once released
    connection: Option<Connection>,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        self.connection.as_ref().expect("connection already released")
    }
}

impl PooledConnection {
    /// Close the underlying client instead of re-queueing it, recording
    /// `reason` as the cause
    pub async fn shutdown(mut self, reason: Option<Error>) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        let pool = self.pool.clone();
        drop(self);
        connection.shutdown(reason).await;
        pool.release(connection.into_client());
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.pool.release(connection.into_client());
        }
    }
}

/// A statement prepared through a [Pool].
///
/// Acquires a connection through the usual checkout arbitration on its
/// first execute and holds it until disposed.
pub struct PooledStatement {
    /// The pool the statement draws its connection from
    pool: Pool,
    /// The SQL text
    sql: String,
    /// Staged row limit
    limit: Option<u64>,
    /// Staged row offset
    offset: Option<u64>,
    /// Staged bindings by 0-based index
    binds: BTreeMap<u16, Value>,
    /// The connection and statement, once acquired
    inner: Option<(PooledConnection, Statement)>,
}

impl PooledStatement {
    /// Append a literal `LIMIT n` to the statement; n must be at least 1
    pub fn limit(&mut self, n: u64) -> Result<()> {
        if n == 0 {
            return Err(ErrorKind::InvalidLimit.into());
        }
        self.limit = Some(n);
        Ok(())
    }

    /// Append a literal `OFFSET k` to the statement
    pub fn offset(&mut self, k: u64) -> Result<()> {
        self.offset = Some(k);
        Ok(())
    }

    /// Bind a value to the 0-based placeholder `index`
    pub fn bind(&mut self, index: u16, value: impl Into<Value>) -> Result<()> {
        self.binds.insert(index, value.into());
        Ok(())
    }

    /// Bind values to placeholders 0, 1, 2, … in order
    pub fn bind_all<V: Into<Value>>(&mut self, values: impl IntoIterator<Item = V>) -> Result<()> {
        for (index, value) in values.into_iter().enumerate() {
            self.bind(index as u16, value)?;
        }
        Ok(())
    }

    /// Execute the statement, acquiring a connection first when needed
    pub async fn execute(&mut self) -> Result<ResultSet> {
        if self.inner.is_none() {
            let connection = self.pool.checkout().await?;
            let statement = connection.prepare(self.sql.clone())?;
            self.inner = Some((connection, statement));
        }
        let (_, statement) = self.inner.as_ref().unwrap();
        if let Some(n) = self.limit {
            statement.limit(n)?;
        }
        if let Some(k) = self.offset {
            statement.offset(k)?;
        }
        for (index, value) in &self.binds {
            statement.bind(*index, value.clone())?;
        }
        statement.execute().await
    }

    /// Dispose the statement and release its connection back to the pool
    pub async fn dispose(&mut self) {
        if let Some((connection, statement)) = self.inner.take() {
            statement.dispose().await;
            // dropping the loan runs the release arbitration; a faulted
            // client is evicted there
            drop(connection);
        }
    }
}
