//! The result of executing a statement
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;

use crate::error::{ErrorKind, Result};
use crate::row::{Column, Row};
use crate::value::Value;

/// The outcome of one execute: the affected-row counters and, for
/// row-returning statements, a bounded channel the rows stream through.
///
/// Rows arrive in server-emitted order. Drain them with [fetch] or close
/// the cursor; dropping an undrained result set counts as cancelling the
/// command and shuts the producing client down.
///
/// [fetch]: ResultSet::fetch
#[derive(Debug)]
pub struct ResultSet {
    /// Rows affected by the statement
    affected_rows: u64,
    /// Id assigned to the last inserted row
    last_insert_id: u64,
    /// Result-set columns; empty when the statement returned no rows
    columns: Arc<[Column]>,
    /// The row channel, present while rows may still arrive
    rows: Option<mpsc::Receiver<Result<Row>>>,
    /// Cleared once the stream has terminated, so the statement can be
    /// executed again
    streaming: Option<Arc<AtomicBool>>,
}

impl ResultSet {
    /// A result carrying only the OK counters
    pub(crate) fn finished(affected_rows: u64, last_insert_id: u64) -> ResultSet {
        ResultSet {
            affected_rows,
            last_insert_id,
            columns: Arc::from(Vec::new()),
            rows: None,
            streaming: None,
        }
    }

    /// A result whose rows arrive through `rows`
    pub(crate) fn streaming(
        columns: Arc<[Column]>,
        rows: mpsc::Receiver<Result<Row>>,
        streaming: Arc<AtomicBool>,
    ) -> ResultSet {
        ResultSet {
            affected_rows: 0,
            last_insert_id: 0,
            columns,
            rows: Some(rows),
            streaming: Some(streaming),
        }
    }

    /// Rows affected by the statement; 0 for row-returning statements
    pub fn affected_rows(&self) -> u64 {
        self.affected_rows
    }

    /// Id assigned to the last inserted row; 0 when nothing was inserted
    pub fn last_insert_id(&self) -> u64 {
        self.last_insert_id
    }

    /// The columns of the result set
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Mark the stream terminated on this side
    fn finish(&mut self) {
        self.rows = None;
        if let Some(flag) = self.streaming.take() {
            flag.store(false, Ordering::SeqCst);
        }
    }

    /// The next row, or `None` once the server finished the result set
    pub async fn fetch(&mut self) -> Result<Option<Row>> {
        let Some(rows) = &mut self.rows else {
            return Ok(None);
        };
        match rows.recv().await {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => {
                self.finish();
                Err(e)
            }
            None => {
                self.finish();
                Ok(None)
            }
        }
    }

    /// All remaining rows in server order
    pub async fn fetch_all(&mut self) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        while let Some(row) = self.fetch().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// The named column of the next row, or `None` at the end of the set
    pub async fn fetch_column(&mut self, alias: &str) -> Result<Option<Value>> {
        match self.fetch().await? {
            Some(row) => match row.get(alias) {
                Some(value) => Ok(Some(value.clone())),
                None => Err(ErrorKind::UnknownColumn(alias.to_string()).into()),
            },
            None => Ok(None),
        }
    }

    /// The named column of every remaining row, in server order
    pub async fn fetch_column_all(&mut self, alias: &str) -> Result<Vec<Value>> {
        let mut values = Vec::new();
        while let Some(value) = self.fetch_column(alias).await? {
            values.push(value);
        }
        Ok(values)
    }

    /// Close the cursor, draining and discarding whatever the server has
    /// still queued so the connection stays aligned. Idempotent.
    pub async fn close_cursor(&mut self) {
        if let Some(rows) = &mut self.rows {
            while rows.recv().await.is_some() {}
        }
        self.finish();
    }
}
