//! Asynchronous client for the MySQL/MariaDB text and binary wire protocol
mod auth;
pub mod client;
pub mod connection;
pub mod constants;
pub mod error;
mod frame;
pub mod packet;
pub mod pool;
pub mod result_set;
pub mod row;
pub mod statement;
pub mod value;

pub use client::{Client, ConnectOptions, Stream};
pub use connection::Connection;
pub use error::{Error, ErrorKind, Result};
pub use packet::{CodecError, PacketBuilder, PacketReader};
pub use pool::{Pool, PoolOptions, PooledConnection, PooledStatement};
pub use result_set::ResultSet;
pub use row::{Column, Row};
pub use statement::Statement;
pub use value::Value;
