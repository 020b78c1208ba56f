//! Error taxonomy of the client
use std::sync::Arc;

use thiserror::Error;

use crate::packet::{CodecError, CodecResult, PacketReader};

/// Everything that can go wrong talking to Mariadb/Mysql
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Network error from the underlying stream
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// A malformed frame or primitive
    #[error("malformed packet reading {loc}: {source}")]
    Codec {
        /// What was being decoded
        loc: &'static str,
        /// The underlying decode failure
        source: CodecError,
    },
    /// The server did not speak the protocol as expected
    #[error("protocol error: {0}")]
    Protocol(String),
    /// An error packet returned by the server; the protocol stream stays aligned
    #[error("server error {code}: {message}")]
    Server {
        /// 2-byte server error code
        code: u16,
        /// 5-byte SQLSTATE
        sqlstate: [u8; 5],
        /// Error message
        message: String,
    },
    /// The server rejected the credentials during the handshake
    #[error("authentication rejected, server error {code}: {message}")]
    AuthRejected {
        /// 2-byte server error code
        code: u16,
        /// Error message
        message: String,
    },
    /// The server requested an auth plugin this crate does not implement
    #[error("unsupported auth plugin {0:?}")]
    UnsupportedAuthPlugin(String),
    /// A placeholder was never bound before execute
    #[error("parameter {0} is not bound")]
    UnboundParameter(u16),
    /// A value was bound to an index the statement does not have
    #[error("parameter index {index} out of range, statement takes {count}")]
    ParameterOutOfRange {
        /// The offending 0-based index
        index: u16,
        /// Number of parameters the statement takes
        count: u16,
    },
    /// A row limit below 1 was requested
    #[error("limit must be at least 1")]
    InvalidLimit,
    /// The statement has been disposed
    #[error("statement disposed")]
    StatementDisposed,
    /// The connection has been disposed
    #[error("connection disposed")]
    ConnectionDisposed,
    /// A previous execute on this statement still has undrained rows
    #[error("previous result set is still streaming")]
    RowsStillStreaming,
    /// The requested column alias does not exist in the result set
    #[error("no column {0:?} in result set")]
    UnknownColumn(String),
    /// The pool has been shut down
    #[error("pool is shut down")]
    PoolClosed,
    /// The pool factory failed to produce a client
    #[error("connection creation failed: {0}")]
    Create(#[source] Error),
    /// The caller cancelled an in-flight command
    #[error("command cancelled")]
    Cancelled,
    /// The client connection has been shut down
    #[error("connection closed")]
    Closed,
}

/// Error returned by this crate.
///
/// The kind lives behind an [Arc] so the error stays pointer-sized and can
/// be cloned when one shutdown cause has to reach every queued command.
#[derive(Clone)]
pub struct Error(Arc<ErrorKind>);

const _: () = {
    assert!(size_of::<Error>() == size_of::<usize>());
};

impl Error {
    /// What went wrong
    pub fn kind(&self) -> &ErrorKind {
        &self.0
    }

    /// The server error code, if the server reported one
    pub fn server_code(&self) -> Option<u16> {
        match &*self.0 {
            ErrorKind::Server { code, .. } | ErrorKind::AuthRejected { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// The 5-character SQLSTATE, if the server reported one
    pub fn sql_state(&self) -> Option<&str> {
        match &*self.0 {
            ErrorKind::Server { sqlstate, .. } => str::from_utf8(sqlstate).ok(),
            _ => None,
        }
    }

    /// True when the protocol stream can no longer be trusted and the
    /// client carrying it has to be shut down
    pub(crate) fn is_fatal(&self) -> bool {
        matches!(
            &*self.0,
            ErrorKind::Io(_) | ErrorKind::Codec { .. } | ErrorKind::Protocol(_)
        )
    }
}

impl std::ops::Deref for Error {
    type Target = ErrorKind;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<E: Into<ErrorKind>> From<E> for Error {
    fn from(value: E) -> Self {
        Error(Arc::new(value.into()))
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.0, f)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {}

/// Result type returned by this crate
pub type Result<T> = std::result::Result<T, Error>;

/// Convert a [CodecResult] into a [Result] with an attached location
pub(crate) trait At<T> {
    /// Attach a location to a decode failure
    fn at(self, loc: &'static str) -> Result<T>;
}

impl<T> At<T> for CodecResult<T> {
    fn at(self, loc: &'static str) -> Result<T> {
        self.map_err(|source| ErrorKind::Codec { loc, source }.into())
    }
}

/// Parse an ERR packet body, the 0xFF tag already consumed.
///
/// Pre-4.1 servers omit the SQLSTATE marker; those errors get the generic
/// HY000 state.
pub(crate) fn parse_server_error(r: &mut PacketReader<'_>) -> Error {
    fn inner(r: &mut PacketReader<'_>) -> Result<Error> {
        let code = r.get_u16().at("error code")?;
        let mut sqlstate = *b"HY000";
        if r.peek() == Some(b'#') {
            r.get_u8().at("sqlstate marker")?;
            sqlstate.copy_from_slice(r.get_bytes(5).at("sqlstate")?);
        }
        let message = r.get_eof_str().at("error message")?.to_string();
        Ok(ErrorKind::Server {
            code,
            sqlstate,
            message,
        }
        .into())
    }
    inner(r).unwrap_or_else(|malformed| malformed)
}
