//! Bit tables and command bytes of the MySQL/MariaDB client-server protocol

/// Client/server capability flags negotiated during the handshake
pub(crate) mod capability {
    #![allow(unused)]
    pub const LONG_PASSWORD: u32 = 1;
    pub const FOUND_ROWS: u32 = 2;
    pub const LONG_FLAG: u32 = 4;
    pub const CONNECT_WITH_DB: u32 = 8;
    pub const PROTOCOL_41: u32 = 512;
    pub const TRANSACTIONS: u32 = 8192;
    pub const SECURE_CONNECTION: u32 = 1 << 15;
    pub const MULTI_STATEMENTS: u32 = 1 << 16;
    pub const MULTI_RESULTS: u32 = 1 << 17;
    pub const PS_MULTI_RESULTS: u32 = 1 << 18;
    pub const PLUGIN_AUTH: u32 = 1 << 19;
    pub const PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;
    pub const SESSION_TRACK: u32 = 1 << 23;
    pub const DEPRECATE_EOF: u32 = 1 << 24;
}

/// Server status flags carried by OK and EOF packets
pub(crate) mod status_flag {
    #![allow(unused)]
    pub const IN_TRANS: u16 = 1;
    pub const AUTOCOMMIT: u16 = 2;
    pub const MORE_RESULTS_EXISTS: u16 = 8;
    pub const SESSION_STATE_CHANGED: u16 = 1 << 14;
}

/// Command bytes, the first payload byte of a client-to-server packet
pub(crate) mod com {
    /// Close the connection, see <https://mariadb.com/docs/server/reference/clientserver-protocol/2-text-protocol/com_quit>
    pub const QUIT: u8 = 0x01;
    /// Select the default database, see <https://mariadb.com/docs/server/reference/clientserver-protocol/2-text-protocol/com_init_db>
    pub const INIT_DB: u8 = 0x02;
    /// Text-protocol query, see <https://mariadb.com/docs/server/reference/clientserver-protocol/2-text-protocol/com_query>
    pub const QUERY: u8 = 0x03;
    /// Ping, see <https://mariadb.com/docs/server/reference/clientserver-protocol/2-text-protocol/com_ping>
    pub const PING: u8 = 0x0E;
    /// Prepare statement, see <https://mariadb.com/docs/server/reference/clientserver-protocol/3-binary-protocol-prepared-statements/com_stmt_prepare>
    pub const STMT_PREPARE: u8 = 0x16;
    /// Execute statement, see <https://mariadb.com/docs/server/reference/clientserver-protocol/3-binary-protocol-prepared-statements/com_stmt_execute>
    pub const STMT_EXECUTE: u8 = 0x17;
    /// Close statement, see <https://mariadb.com/docs/server/reference/clientserver-protocol/3-binary-protocol-prepared-statements/3-binary-protocol-prepared-statements-com_stmt_close>
    pub const STMT_CLOSE: u8 = 0x19;
}

/// Column field types as described in
/// <https://mariadb.com/docs/server/reference/clientserver-protocol/4-server-response-packets/result-set-packets#field-types>
pub mod type_ {
    #![allow(missing_docs)]
    pub const DECIMAL: u8 = 0x00;
    pub const TINY: u8 = 0x01;
    pub const SHORT: u8 = 0x02;
    pub const LONG: u8 = 0x03;
    pub const FLOAT: u8 = 0x04;
    pub const DOUBLE: u8 = 0x05;
    pub const NULL: u8 = 0x06;
    pub const LONG_LONG: u8 = 0x08;
    pub const INT24: u8 = 0x09;
    pub const YEAR: u8 = 0x0d;
    pub const VAR_CHAR: u8 = 0x0f;
    pub const BIT: u8 = 0x10;
    pub const JSON: u8 = 0xf5;
    pub const NEW_DECIMAL: u8 = 0xf6;
    pub const ENUM: u8 = 0xf7;
    pub const SET: u8 = 0xf8;
    pub const TINY_BLOB: u8 = 0xf9;
    pub const MEDIUM_BLOB: u8 = 0xfa;
    pub const LONG_BLOB: u8 = 0xfb;
    pub const BLOB: u8 = 0xfc;
    pub const VAR_STRING: u8 = 0xfd;
    pub const STRING: u8 = 0xfe;
    pub const GEOMETRY: u8 = 0xff;
}

/// Column detail flags as described in
/// <https://mariadb.com/docs/server/reference/clientserver-protocol/4-server-response-packets/result-set-packets#field-details-flag>
pub mod column_flag {
    /// Field can't be `NULL`.
    pub const NOT_NULL: u16 = 1;
    /// Field is part of a primary key.
    pub const PRIMARY_KEY: u16 = 2;
    /// Field is unsigned.
    pub const UNSIGNED: u16 = 32;
    /// Field is binary.
    pub const BINARY: u16 = 128;
    /// Field is an auto-increment field.
    pub const AUTO_INCREMENT: u16 = 512;
}

/// Character set / collation ids used by this crate
pub(crate) mod charset {
    /// utf8mb4_general_ci, the default connection charset
    pub const UTF8MB4_GENERAL_CI: u8 = 45;
    /// The binary pseudo-collation; columns carrying it hold raw bytes
    pub const BINARY: u16 = 63;
}

/// The 32-bit capability mask as a typed set.
///
/// Packet encoders and decoders branch on named capabilities through this
/// type rather than on raw bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CapabilitySet(u32);

impl CapabilitySet {
    /// Everything this client is able and willing to speak
    pub(crate) const CLIENT: CapabilitySet = CapabilitySet(
        capability::LONG_FLAG
            | capability::PROTOCOL_41
            | capability::TRANSACTIONS
            | capability::SECURE_CONNECTION
            | capability::MULTI_RESULTS
            | capability::MULTI_STATEMENTS
            | capability::PLUGIN_AUTH
            | capability::PLUGIN_AUTH_LENENC_CLIENT_DATA
            | capability::SESSION_TRACK
            | capability::DEPRECATE_EOF,
    );

    /// Intersect the client set with what the server advertised
    pub(crate) fn negotiate(server: u32) -> Self {
        CapabilitySet(Self::CLIENT.0 & server)
    }

    /// Does the set contain all bits of `flag`?
    pub(crate) fn contains(self, flag: u32) -> bool {
        self.0 & flag == flag
    }

    /// The raw bit mask as sent on the wire
    pub(crate) fn bits(self) -> u32 {
        self.0
    }
}
