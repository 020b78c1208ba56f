//! Protocol and pool tests against a scripted in-memory server
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};

use mariner::{Client, ConnectOptions, Connection, ErrorKind, Pool, PoolOptions};

const CAP_PROTOCOL_41: u32 = 512;
const CAP_TRANSACTIONS: u32 = 8192;
const CAP_SECURE_CONNECTION: u32 = 1 << 15;
const CAP_MULTI_RESULTS: u32 = 1 << 17;
const CAP_PLUGIN_AUTH: u32 = 1 << 19;
const CAP_DEPRECATE_EOF: u32 = 1 << 24;

const SERVER_CAPS: u32 = CAP_PROTOCOL_41
    | CAP_TRANSACTIONS
    | CAP_SECURE_CONNECTION
    | CAP_MULTI_RESULTS
    | CAP_PLUGIN_AUTH
    | CAP_DEPRECATE_EOF;

const STATUS_IN_TRANS: u16 = 1;
const STATUS_AUTOCOMMIT: u16 = 2;

const COM_QUIT: u8 = 0x01;
const COM_QUERY: u8 = 0x03;
const COM_PING: u8 = 0x0E;
const COM_STMT_PREPARE: u8 = 0x16;
const COM_STMT_EXECUTE: u8 = 0x17;
const COM_STMT_CLOSE: u8 = 0x19;

const TYPE_VAR_STRING: u8 = 0xFD;

const SCRAMBLE: [u8; 20] = [
    11, 22, 33, 44, 55, 66, 77, 88, 99, 110, 121, 132, 143, 154, 165, 176, 187, 198, 209, 220,
];

/// The server end of a duplex stream, speaking raw frames
struct Wire {
    stream: DuplexStream,
}

impl Wire {
    fn new(stream: DuplexStream) -> Self {
        Self { stream }
    }

    async fn send(&mut self, seq: u8, payload: &[u8]) {
        let len = payload.len();
        let mut frame = Vec::with_capacity(4 + len);
        frame.push((len & 0xFF) as u8);
        frame.push(((len >> 8) & 0xFF) as u8);
        frame.push(((len >> 16) & 0xFF) as u8);
        frame.push(seq);
        frame.extend_from_slice(payload);
        self.stream.write_all(&frame).await.unwrap();
    }

    async fn recv(&mut self) -> Option<(u8, Vec<u8>)> {
        let mut head = [0u8; 4];
        self.stream.read_exact(&mut head).await.ok()?;
        let len = head[0] as usize | ((head[1] as usize) << 8) | ((head[2] as usize) << 16);
        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload).await.ok()?;
        Some((head[3], payload))
    }

    /// Read and discard whatever else the client sends until it hangs up
    async fn drain(&mut self) {
        while self.recv().await.is_some() {}
    }

    /// Send the greeting, check the handshake response and confirm it
    async fn handshake(&mut self, password: &str) {
        self.send(0, &greeting_payload()).await;
        let (seq, payload) = self.recv().await.unwrap();
        assert_eq!(seq, 1, "handshake response continues the greeting sequence");

        let caps = u32::from_le_bytes(payload[0..4].try_into().unwrap());
        assert_ne!(caps & CAP_PROTOCOL_41, 0);
        assert_ne!(caps & CAP_DEPRECATE_EOF, 0);
        let max_packet = u32::from_le_bytes(payload[4..8].try_into().unwrap());
        assert_eq!(max_packet, 0xFF_FFFF);
        assert_eq!(payload[8], 45, "default charset is utf8mb4_general_ci");
        assert_eq!(&payload[9..32], &[0u8; 23]);

        let mut off = 32;
        let user_len = payload[off..].iter().position(|&b| b == 0).unwrap();
        off += user_len + 1;
        let auth_len = payload[off] as usize;
        off += 1;
        let auth = &payload[off..off + auth_len];
        assert_eq!(auth, native_auth(password), "scramble hash must match");
        off += auth_len;
        let plugin_len = payload[off..].iter().position(|&b| b == 0).unwrap();
        assert_eq!(&payload[off..off + plugin_len], b"mysql_native_password");

        self.send(seq.wrapping_add(1), &ok_payload(0, 0, STATUS_AUTOCOMMIT))
            .await;
    }
}

fn lenenc(v: u64) -> Vec<u8> {
    if v < 0xFB {
        vec![v as u8]
    } else if v <= 0xFFFF {
        let mut out = vec![0xFC];
        out.extend_from_slice(&(v as u16).to_le_bytes());
        out
    } else if v <= 0xFF_FFFF {
        let mut out = vec![0xFD];
        out.extend_from_slice(&(v as u32).to_le_bytes()[..3]);
        out
    } else {
        let mut out = vec![0xFE];
        out.extend_from_slice(&v.to_le_bytes());
        out
    }
}

fn lenenc_str(s: &str) -> Vec<u8> {
    let mut out = lenenc(s.len() as u64);
    out.extend_from_slice(s.as_bytes());
    out
}

fn greeting_payload() -> Vec<u8> {
    let mut p = vec![0x0A];
    p.extend_from_slice(b"10.6.0-MariaDB-test\0");
    p.extend_from_slice(&7u32.to_le_bytes());
    p.extend_from_slice(&SCRAMBLE[..8]);
    p.push(0);
    p.extend_from_slice(&((SERVER_CAPS & 0xFFFF) as u16).to_le_bytes());
    p.push(45);
    p.extend_from_slice(&STATUS_AUTOCOMMIT.to_le_bytes());
    p.extend_from_slice(&((SERVER_CAPS >> 16) as u16).to_le_bytes());
    p.push(21);
    p.extend_from_slice(&[0u8; 10]);
    p.extend_from_slice(&SCRAMBLE[8..]);
    p.push(0);
    p.extend_from_slice(b"mysql_native_password\0");
    p
}

fn native_auth(password: &str) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let pw_hash = Sha1::digest(password.as_bytes());
    let pw_hash_hash = Sha1::digest(pw_hash);
    let mut ctx = Sha1::new();
    ctx.update(SCRAMBLE);
    ctx.update(pw_hash_hash);
    let mix = ctx.finalize();
    pw_hash.iter().zip(mix).map(|(a, b)| a ^ b).collect()
}

fn ok_payload(affected: u64, last_insert_id: u64, status: u16) -> Vec<u8> {
    let mut p = vec![0x00];
    p.extend_from_slice(&lenenc(affected));
    p.extend_from_slice(&lenenc(last_insert_id));
    p.extend_from_slice(&status.to_le_bytes());
    p.extend_from_slice(&0u16.to_le_bytes());
    p
}

/// The short 0xFE packet that terminates a row stream
fn eof_ok_payload(status: u16) -> Vec<u8> {
    let mut p = vec![0xFE, 0x00, 0x00];
    p.extend_from_slice(&status.to_le_bytes());
    p.extend_from_slice(&0u16.to_le_bytes());
    p
}

fn err_payload(code: u16, state: &[u8; 5], message: &str) -> Vec<u8> {
    let mut p = vec![0xFF];
    p.extend_from_slice(&code.to_le_bytes());
    p.push(b'#');
    p.extend_from_slice(state);
    p.extend_from_slice(message.as_bytes());
    p
}

fn prepare_ok_payload(stmt_id: u32, columns: u16, params: u16) -> Vec<u8> {
    let mut p = vec![0x00];
    p.extend_from_slice(&stmt_id.to_le_bytes());
    p.extend_from_slice(&columns.to_le_bytes());
    p.extend_from_slice(&params.to_le_bytes());
    p.push(0);
    p.extend_from_slice(&0u16.to_le_bytes());
    p
}

fn column_def_payload(alias: &str, type_: u8, flags: u16, charset: u16) -> Vec<u8> {
    let mut p = Vec::new();
    for s in ["def", "test", "customer", "customer", alias, alias] {
        p.extend_from_slice(&lenenc_str(s));
    }
    p.push(0x0C);
    p.extend_from_slice(&charset.to_le_bytes());
    p.extend_from_slice(&1020u32.to_le_bytes());
    p.push(type_);
    p.extend_from_slice(&flags.to_le_bytes());
    p.push(0);
    p.extend_from_slice(&0u16.to_le_bytes());
    p
}

/// A binary row of string columns; `None` marks NULL in the bitmap
fn string_row(values: &[Option<&str>]) -> Vec<u8> {
    let width = (values.len() + 9) >> 3;
    let mut p = vec![0u8; 1 + width];
    for (i, v) in values.iter().enumerate() {
        if v.is_none() {
            p[1 + ((i + 2) >> 3)] |= 1 << ((i + 2) & 7);
        }
    }
    for v in values.iter().flatten() {
        p.extend_from_slice(&lenenc_str(v));
    }
    p
}

fn options(password: &'static str) -> ConnectOptions<'static> {
    ConnectOptions::new("root").password(password)
}

/// A generic server loop good enough for pool traffic: tracks transaction
/// state, prepares anything, answers every execute with an OK.
async fn serve(mut wire: Wire, password: &str, ping_settles_transaction: bool) {
    wire.handshake(password).await;
    let mut in_trans = false;
    let mut next_stmt_id = 1u32;
    let mut executed = 0u64;
    loop {
        let Some((seq, payload)) = wire.recv().await else {
            return;
        };
        assert_eq!(seq, 0, "every command starts a fresh sequence");
        let status = |in_trans: bool| STATUS_AUTOCOMMIT | if in_trans { STATUS_IN_TRANS } else { 0 };
        match payload[0] {
            COM_PING => {
                if ping_settles_transaction {
                    in_trans = false;
                }
                wire.send(1, &ok_payload(0, 0, status(in_trans))).await;
            }
            COM_QUERY => {
                let sql = std::str::from_utf8(&payload[1..]).unwrap();
                if sql.starts_with("START TRANSACTION") {
                    in_trans = true;
                } else if sql == "COMMIT" || sql == "ROLLBACK" {
                    in_trans = false;
                }
                wire.send(1, &ok_payload(0, 0, status(in_trans))).await;
            }
            COM_STMT_PREPARE => {
                let sql = std::str::from_utf8(&payload[1..]).unwrap();
                let params = sql.matches('?').count() as u16;
                let stmt_id = next_stmt_id;
                next_stmt_id += 1;
                wire.send(1, &prepare_ok_payload(stmt_id, 0, params)).await;
                for i in 0..params {
                    wire.send(
                        2 + i as u8,
                        &column_def_payload("?", TYPE_VAR_STRING, 0, 224),
                    )
                    .await;
                }
            }
            COM_STMT_EXECUTE => {
                executed += 1;
                wire.send(1, &ok_payload(1, executed, status(in_trans))).await;
            }
            COM_STMT_CLOSE => {}
            COM_QUIT => return,
            other => panic!("unexpected command {other:#04x}"),
        }
    }
}

/// A pool whose factory spins up one scripted server per client
fn scripted_pool(
    size: usize,
    ping_settles_transaction: bool,
) -> (Pool, Arc<AtomicUsize>) {
    let created = Arc::new(AtomicUsize::new(0));
    let counter = created.clone();
    let pool = Pool::new(PoolOptions { size }, move || {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            let (client_io, server_io) = duplex(1 << 16);
            tokio::spawn(serve(Wire::new(server_io), "pw", ping_settles_transaction));
            Client::handshake(client_io, &options("pw")).await
        }
    });
    (pool, created)
}

async fn wait_until(mut probe: impl FnMut() -> bool) {
    for _ in 0..500 {
        if probe() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn handshake_authenticates_and_pings() {
    let (client_io, server_io) = duplex(1 << 14);
    let server = tokio::spawn(async move {
        let mut wire = Wire::new(server_io);
        wire.handshake("secret").await;

        let (seq, payload) = wire.recv().await.unwrap();
        assert_eq!((seq, payload.as_slice()), (0, &[COM_PING][..]));
        wire.send(1, &ok_payload(0, 0, STATUS_AUTOCOMMIT)).await;
        wire.drain().await;
    });

    let client = Client::handshake(client_io, &options("secret")).await.unwrap();
    assert_eq!(client.connection_id(), 7);
    client.ping().await.unwrap();
    client.shutdown(None).await;
    server.await.unwrap();
}

#[tokio::test]
async fn handshake_selects_the_database() {
    let (client_io, server_io) = duplex(1 << 14);
    let server = tokio::spawn(async move {
        let mut wire = Wire::new(server_io);
        wire.handshake("secret").await;

        let (seq, payload) = wire.recv().await.unwrap();
        assert_eq!(seq, 0);
        assert_eq!(payload[0], 0x02); // COM_INIT_DB
        assert_eq!(&payload[1..], b"test");
        wire.send(1, &ok_payload(0, 0, STATUS_AUTOCOMMIT)).await;
        wire.drain().await;
    });

    let client = Client::handshake(client_io, &options("secret").database("test"))
        .await
        .unwrap();
    client.shutdown(None).await;
    server.await.unwrap();
}

#[tokio::test]
async fn empty_password_sends_empty_auth_response() {
    let (client_io, server_io) = duplex(1 << 14);
    let server = tokio::spawn(async move {
        let mut wire = Wire::new(server_io);
        wire.handshake("").await;
        wire.drain().await;
    });

    let client = Client::handshake(client_io, &options("")).await.unwrap();
    client.shutdown(None).await;
    server.await.unwrap();
}

#[tokio::test]
async fn rejected_credentials_surface_as_auth_error() {
    let (client_io, server_io) = duplex(1 << 14);
    tokio::spawn(async move {
        let mut wire = Wire::new(server_io);
        wire.send(0, &greeting_payload()).await;
        let _ = wire.recv().await.unwrap();
        wire.send(2, &err_payload(1045, b"28000", "Access denied for user"))
            .await;
    });

    let err = Client::handshake(client_io, &options("wrong")).await.unwrap_err();
    assert!(matches!(
        err.kind(),
        ErrorKind::AuthRejected { code: 1045, .. }
    ));
}

#[tokio::test]
async fn prepared_select_streams_rows_in_server_order() {
    let (client_io, server_io) = duplex(1 << 14);
    let server = tokio::spawn(async move {
        let mut wire = Wire::new(server_io);
        wire.handshake("pw").await;

        let (seq, payload) = wire.recv().await.unwrap();
        assert_eq!(seq, 0);
        assert_eq!(payload[0], COM_STMT_PREPARE);
        assert_eq!(&payload[1..], b"SELECT name FROM customer ORDER BY name DESC");
        wire.send(1, &prepare_ok_payload(1, 1, 0)).await;
        wire.send(2, &column_def_payload("name", TYPE_VAR_STRING, 0, 224))
            .await;

        let (seq, payload) = wire.recv().await.unwrap();
        assert_eq!(seq, 0);
        assert_eq!(payload[0], COM_STMT_EXECUTE);
        assert_eq!(u32::from_le_bytes(payload[1..5].try_into().unwrap()), 1);
        assert_eq!(payload[5], 0, "NO_CURSOR");
        assert_eq!(u32::from_le_bytes(payload[6..10].try_into().unwrap()), 1);

        wire.send(1, &lenenc(1)).await;
        wire.send(2, &column_def_payload("name", TYPE_VAR_STRING, 0, 224))
            .await;
        let mut seq = 3;
        for name in ["MySQL", "KoolKode", "Git", "Async"] {
            wire.send(seq, &string_row(&[Some(name)])).await;
            seq += 1;
        }
        wire.send(seq, &eof_ok_payload(STATUS_AUTOCOMMIT)).await;

        let (_, payload) = wire.recv().await.unwrap();
        assert_eq!(payload[0], COM_STMT_CLOSE);
        assert_eq!(u32::from_le_bytes(payload[1..5].try_into().unwrap()), 1);
        wire.drain().await;
    });

    let client = Client::handshake(client_io, &options("pw")).await.unwrap();
    let connection = Connection::from_client(client);
    let statement = connection
        .prepare("SELECT name FROM customer ORDER BY name DESC")
        .unwrap();
    let mut rows = statement.execute().await.unwrap();
    assert_eq!(rows.affected_rows(), 0);
    assert_eq!(rows.last_insert_id(), 0);
    let names = rows.fetch_column_all("name").await.unwrap();
    let names: Vec<&str> = names.iter().map(|v| v.as_str().unwrap()).collect();
    assert_eq!(names, ["MySQL", "KoolKode", "Git", "Async"]);

    statement.dispose().await;
    connection.shutdown(None).await;
    server.await.unwrap();
}

#[tokio::test]
async fn execute_encodes_bound_parameters() {
    let (client_io, server_io) = duplex(1 << 14);
    let server = tokio::spawn(async move {
        let mut wire = Wire::new(server_io);
        wire.handshake("pw").await;

        let (_, payload) = wire.recv().await.unwrap();
        assert_eq!(payload[0], COM_STMT_PREPARE);
        wire.send(1, &prepare_ok_payload(4, 0, 2)).await;
        wire.send(2, &column_def_payload("?", TYPE_VAR_STRING, 0, 224))
            .await;
        wire.send(3, &column_def_payload("?", TYPE_VAR_STRING, 0, 224))
            .await;

        let (seq, payload) = wire.recv().await.unwrap();
        assert_eq!(seq, 0);
        assert_eq!(payload[0], COM_STMT_EXECUTE);
        assert_eq!(u32::from_le_bytes(payload[1..5].try_into().unwrap()), 4);
        assert_eq!(payload[10], 0x00, "no parameter is NULL");
        assert_eq!(payload[11], 0x01, "new parameters bound");
        // two LONG_BLOB params, signed
        assert_eq!(&payload[12..16], &[0xFB, 0x00, 0xFB, 0x00]);
        let mut expected = Vec::new();
        expected.extend_from_slice(&lenenc_str("GitHub"));
        expected.extend_from_slice(&lenenc_str("Git"));
        assert_eq!(&payload[16..], &expected[..]);
        wire.send(1, &ok_payload(1, 0, STATUS_AUTOCOMMIT)).await;
        wire.drain().await;
    });

    let connection = Connection::connect(client_io, &options("pw")).await.unwrap();
    let statement = connection
        .prepare("UPDATE customer SET name=? WHERE name=?")
        .unwrap();
    statement.bind(0, "GitHub").unwrap();
    statement.bind(1, "Git").unwrap();
    let result = statement.execute().await.unwrap();
    assert_eq!(result.affected_rows(), 1);

    statement.dispose().await;
    connection.shutdown(None).await;
    server.await.unwrap();
}

#[tokio::test]
async fn null_parameter_travels_in_the_bitmap_alone() {
    let (client_io, server_io) = duplex(1 << 14);
    let server = tokio::spawn(async move {
        let mut wire = Wire::new(server_io);
        wire.handshake("pw").await;

        let (_, payload) = wire.recv().await.unwrap();
        assert_eq!(payload[0], COM_STMT_PREPARE);
        wire.send(1, &prepare_ok_payload(2, 0, 1)).await;
        wire.send(2, &column_def_payload("?", TYPE_VAR_STRING, 0, 224))
            .await;

        let (_, payload) = wire.recv().await.unwrap();
        assert_eq!(payload[0], COM_STMT_EXECUTE);
        assert_eq!(payload[10], 0x01, "parameter 0 is NULL");
        assert_eq!(payload[11], 0x00, "no types follow when nothing is bound");
        assert_eq!(payload.len(), 12);
        wire.send(1, &ok_payload(1, 0, STATUS_AUTOCOMMIT)).await;
        wire.drain().await;
    });

    let connection = Connection::connect(client_io, &options("pw")).await.unwrap();
    let statement = connection.prepare("INSERT INTO t(v) VALUES (?)").unwrap();
    statement.bind(0, Option::<i64>::None).unwrap();
    statement.execute().await.unwrap();

    statement.dispose().await;
    connection.shutdown(None).await;
    server.await.unwrap();
}

#[tokio::test]
async fn changing_the_limit_recompiles_the_statement() {
    let (client_io, server_io) = duplex(1 << 14);
    let server = tokio::spawn(async move {
        let mut wire = Wire::new(server_io);
        wire.handshake("pw").await;

        let (_, payload) = wire.recv().await.unwrap();
        assert_eq!(payload[0], COM_STMT_PREPARE);
        assert_eq!(&payload[1..], b"SELECT name FROM customer LIMIT 2 OFFSET 1");
        wire.send(1, &prepare_ok_payload(1, 0, 0)).await;

        let (_, payload) = wire.recv().await.unwrap();
        assert_eq!(payload[0], COM_STMT_EXECUTE);
        wire.send(1, &ok_payload(0, 0, STATUS_AUTOCOMMIT)).await;

        // the limit changed, so the old id is closed and a new prepare runs
        let (_, payload) = wire.recv().await.unwrap();
        assert_eq!(payload[0], COM_STMT_CLOSE);
        assert_eq!(u32::from_le_bytes(payload[1..5].try_into().unwrap()), 1);

        let (_, payload) = wire.recv().await.unwrap();
        assert_eq!(payload[0], COM_STMT_PREPARE);
        assert_eq!(&payload[1..], b"SELECT name FROM customer LIMIT 3 OFFSET 1");
        wire.send(1, &prepare_ok_payload(2, 0, 0)).await;

        let (_, payload) = wire.recv().await.unwrap();
        assert_eq!(payload[0], COM_STMT_EXECUTE);
        assert_eq!(u32::from_le_bytes(payload[1..5].try_into().unwrap()), 2);
        wire.send(1, &ok_payload(0, 0, STATUS_AUTOCOMMIT)).await;
        wire.drain().await;
    });

    let connection = Connection::connect(client_io, &options("pw")).await.unwrap();
    let statement = connection.prepare("SELECT name FROM customer").unwrap();
    statement.limit(2).unwrap();
    statement.offset(1).unwrap();
    statement.execute().await.unwrap();

    statement.limit(3).unwrap();
    statement.execute().await.unwrap();

    statement.dispose().await;
    connection.shutdown(None).await;
    server.await.unwrap();
}

#[tokio::test]
async fn unbound_parameter_fails_before_execute_hits_the_wire() {
    let (client_io, server_io) = duplex(1 << 14);
    let server = tokio::spawn(async move {
        let mut wire = Wire::new(server_io);
        wire.handshake("pw").await;

        let (_, payload) = wire.recv().await.unwrap();
        assert_eq!(payload[0], COM_STMT_PREPARE);
        wire.send(1, &prepare_ok_payload(1, 0, 2)).await;
        wire.send(2, &column_def_payload("?", TYPE_VAR_STRING, 0, 224))
            .await;
        wire.send(3, &column_def_payload("?", TYPE_VAR_STRING, 0, 224))
            .await;

        // nothing but the statement close may follow
        let (_, payload) = wire.recv().await.unwrap();
        assert_eq!(payload[0], COM_STMT_CLOSE);
        wire.drain().await;
    });

    let connection = Connection::connect(client_io, &options("pw")).await.unwrap();
    let statement = connection.prepare("UPDATE t SET a=? WHERE b=?").unwrap();
    statement.bind(1, "only the second").unwrap();
    let err = statement.execute().await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::UnboundParameter(0)));

    statement.dispose().await;
    connection.shutdown(None).await;
    server.await.unwrap();
}

#[tokio::test]
async fn server_error_does_not_poison_the_client() {
    let (client_io, server_io) = duplex(1 << 14);
    let server = tokio::spawn(async move {
        let mut wire = Wire::new(server_io);
        wire.handshake("pw").await;

        let (_, payload) = wire.recv().await.unwrap();
        assert_eq!(payload[0], COM_STMT_PREPARE);
        wire.send(1, &err_payload(1064, b"42000", "You have an error in your SQL syntax"))
            .await;

        let (_, payload) = wire.recv().await.unwrap();
        assert_eq!(payload[0], COM_PING);
        wire.send(1, &ok_payload(0, 0, STATUS_AUTOCOMMIT)).await;
        wire.drain().await;
    });

    let connection = Connection::connect(client_io, &options("pw")).await.unwrap();
    let statement = connection.prepare("SELEKT broken").unwrap();
    let err = statement.execute().await.unwrap_err();
    assert_eq!(err.server_code(), Some(1064));
    assert_eq!(err.sql_state(), Some("42000"));

    // the protocol stream stayed aligned
    connection.ping().await.unwrap();

    statement.dispose().await;
    connection.shutdown(None).await;
    server.await.unwrap();
}

#[tokio::test]
async fn lost_stream_shuts_the_client_down() {
    let (client_io, server_io) = duplex(1 << 14);
    tokio::spawn(async move {
        let mut wire = Wire::new(server_io);
        wire.handshake("pw").await;
        let (_, payload) = wire.recv().await.unwrap();
        assert_eq!(payload[0], COM_PING);
        // hang up mid-command
    });

    let client = Client::handshake(client_io, &options("pw")).await.unwrap();
    let err = client.ping().await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Io(_)));
    assert!(client.is_disposed());

    // later commands fail with the stored cause
    let err = client.ping().await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Io(_)));
}

#[tokio::test]
async fn transaction_verbs_track_the_status_flags() {
    let (client_io, server_io) = duplex(1 << 16);
    tokio::spawn(serve(Wire::new(server_io), "pw", false));

    let client = Client::handshake(client_io, &options("pw")).await.unwrap();
    assert!(!client.is_in_transaction());
    client.begin_transaction(false).await.unwrap();
    assert!(client.is_in_transaction());
    client.commit().await.unwrap();
    assert!(!client.is_in_transaction());
    client.begin_transaction(true).await.unwrap();
    assert!(client.is_in_transaction());
    client.roll_back().await.unwrap();
    assert!(!client.is_in_transaction());
    client.shutdown(None).await;
}

#[tokio::test]
async fn transaction_state_disagreement_is_fatal() {
    let (client_io, server_io) = duplex(1 << 14);
    tokio::spawn(async move {
        let mut wire = Wire::new(server_io);
        wire.handshake("pw").await;
        let (_, payload) = wire.recv().await.unwrap();
        assert_eq!(payload[0], COM_QUERY);
        assert_eq!(&payload[1..], b"START TRANSACTION");
        // reply without the IN_TRANS bit
        wire.send(1, &ok_payload(0, 0, STATUS_AUTOCOMMIT)).await;
        wire.drain().await;
    });

    let client = Client::handshake(client_io, &options("pw")).await.unwrap();
    let err = client.begin_transaction(false).await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Protocol(_)));
    assert!(client.is_disposed());
}

#[tokio::test]
async fn commands_complete_in_submission_order() {
    let (client_io, server_io) = duplex(1 << 16);
    tokio::spawn(serve(Wire::new(server_io), "pw", false));

    let connection = Connection::connect(client_io, &options("pw")).await.unwrap();
    let first = connection.prepare("INSERT INTO a(v) VALUES (1)").unwrap();
    let second = connection.prepare("INSERT INTO b(v) VALUES (1)").unwrap();
    let third = connection.prepare("INSERT INTO c(v) VALUES (1)").unwrap();

    // the generic server numbers executes in arrival order
    let (a, b, c) = tokio::join!(first.execute(), second.execute(), third.execute());
    assert_eq!(a.unwrap().last_insert_id(), 1);
    assert_eq!(b.unwrap().last_insert_id(), 2);
    assert_eq!(c.unwrap().last_insert_id(), 3);

    first.dispose().await;
    second.dispose().await;
    third.dispose().await;
    connection.shutdown(None).await;
}

#[tokio::test]
async fn close_cursor_drains_and_keeps_the_client_usable() {
    let (client_io, server_io) = duplex(1 << 16);
    let server = tokio::spawn(async move {
        let mut wire = Wire::new(server_io);
        wire.handshake("pw").await;

        let (_, payload) = wire.recv().await.unwrap();
        assert_eq!(payload[0], COM_STMT_PREPARE);
        wire.send(1, &prepare_ok_payload(1, 1, 0)).await;
        wire.send(2, &column_def_payload("name", TYPE_VAR_STRING, 0, 224))
            .await;

        let (_, payload) = wire.recv().await.unwrap();
        assert_eq!(payload[0], COM_STMT_EXECUTE);
        wire.send(1, &lenenc(1)).await;
        wire.send(2, &column_def_payload("name", TYPE_VAR_STRING, 0, 224))
            .await;
        let mut seq = 3;
        for i in 0..10 {
            let name = format!("row-{i}");
            wire.send(seq, &string_row(&[Some(name.as_str())])).await;
            seq += 1;
        }
        wire.send(seq, &eof_ok_payload(STATUS_AUTOCOMMIT)).await;

        let (_, payload) = wire.recv().await.unwrap();
        assert_eq!(payload[0], COM_PING);
        wire.send(1, &ok_payload(0, 0, STATUS_AUTOCOMMIT)).await;
        wire.drain().await;
    });

    let connection = Connection::connect(client_io, &options("pw")).await.unwrap();
    let statement = connection.prepare("SELECT name FROM customer").unwrap();
    let mut rows = statement.execute().await.unwrap();
    let first = rows.fetch().await.unwrap().unwrap();
    assert_eq!(first.get("name").unwrap().as_str(), Some("row-0"));

    rows.close_cursor().await;
    connection.ping().await.unwrap();

    statement.dispose().await;
    connection.shutdown(None).await;
    server.await.unwrap();
}

#[tokio::test]
async fn dropping_an_undrained_result_set_shuts_the_client_down() {
    let (client_io, server_io) = duplex(1 << 16);
    tokio::spawn(async move {
        let mut wire = Wire::new(server_io);
        wire.handshake("pw").await;

        let (_, payload) = wire.recv().await.unwrap();
        assert_eq!(payload[0], COM_STMT_PREPARE);
        wire.send(1, &prepare_ok_payload(1, 1, 0)).await;
        wire.send(2, &column_def_payload("name", TYPE_VAR_STRING, 0, 224))
            .await;

        let (_, payload) = wire.recv().await.unwrap();
        assert_eq!(payload[0], COM_STMT_EXECUTE);
        wire.send(1, &lenenc(1)).await;
        wire.send(2, &column_def_payload("name", TYPE_VAR_STRING, 0, 224))
            .await;
        let mut seq = 3;
        for i in 0..64 {
            let name = format!("row-{i}");
            wire.send(seq, &string_row(&[Some(name.as_str())])).await;
            seq = seq.wrapping_add(1);
        }
        wire.send(seq, &eof_ok_payload(STATUS_AUTOCOMMIT)).await;
        wire.drain().await;
    });

    let client = Client::handshake(client_io, &options("pw")).await.unwrap();
    let connection = Connection::from_client(client.clone());
    let statement = connection.prepare("SELECT name FROM customer").unwrap();
    let mut rows = statement.execute().await.unwrap();
    rows.fetch().await.unwrap().unwrap();
    drop(rows);

    wait_until(|| client.is_disposed()).await;
    assert!(client.ping().await.is_err());
}

#[tokio::test]
async fn pool_reuses_idle_clients() {
    let (pool, created) = scripted_pool(2, false);

    let first = pool.checkout().await.unwrap();
    first.ping().await.unwrap();
    drop(first);
    assert_eq!(pool.idle(), 1);

    let second = pool.checkout().await.unwrap();
    second.ping().await.unwrap();
    drop(second);

    assert_eq!(created.load(Ordering::SeqCst), 1);
    assert_eq!(pool.active(), 1);
    assert_eq!(pool.idle(), 1);
    pool.shutdown(None).await;
}

#[tokio::test]
async fn pool_never_exceeds_its_size() {
    let (pool, created) = scripted_pool(4, false);
    let mut tasks = Vec::new();
    for _ in 0..40 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            let connection = pool.checkout().await.unwrap();
            assert!(pool.active() <= 4);
            let name: String = format!("{:032x}", rand::random::<u128>());
            let statement = connection
                .prepare("INSERT INTO customer(name) VALUES (?)")
                .unwrap();
            statement.bind(0, name.as_str()).unwrap();
            let result = statement.execute().await.unwrap();
            assert_eq!(result.affected_rows(), 1);
            assert!(result.last_insert_id() > 0);
            statement.dispose().await;
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert!(created.load(Ordering::SeqCst) <= 4);
    assert_eq!(pool.active(), pool.idle(), "everything settles back to idle");
    pool.shutdown(None).await;
    assert_eq!(pool.idle(), 0);
}

#[tokio::test]
async fn pool_evicts_clients_left_in_a_transaction() {
    let (pool, created) = scripted_pool(2, false);

    let connection = pool.checkout().await.unwrap();
    connection.begin_transaction(false).await.unwrap();
    drop(connection); // forgot to commit

    // the probe still reports IN_TRANS, so the client is closed
    wait_until(|| pool.active() == 0).await;

    let connection = pool.checkout().await.unwrap();
    connection.ping().await.unwrap();
    assert_eq!(created.load(Ordering::SeqCst), 2);
    drop(connection);
    pool.shutdown(None).await;
}

#[tokio::test]
async fn pool_requeues_when_the_probe_comes_back_clean() {
    // this server settles the transaction by the time the probe arrives
    let (pool, created) = scripted_pool(2, true);

    let connection = pool.checkout().await.unwrap();
    connection.begin_transaction(false).await.unwrap();
    drop(connection);

    wait_until(|| pool.idle() == 1).await;
    assert_eq!(pool.active(), 1);
    assert_eq!(created.load(Ordering::SeqCst), 1);
    pool.shutdown(None).await;
}

#[tokio::test]
async fn pool_evicts_dead_clients_and_creates_fresh_ones() {
    let (pool, created) = scripted_pool(2, false);

    // a caller-signalled shutdown evicts the loan instead of re-queueing it
    let connection = pool.checkout().await.unwrap();
    connection
        .shutdown(Some(ErrorKind::Cancelled.into()))
        .await;

    wait_until(|| pool.active() == 0).await;
    let connection = pool.checkout().await.unwrap();
    connection.ping().await.unwrap();
    assert_eq!(created.load(Ordering::SeqCst), 2);
    drop(connection);
    pool.shutdown(None).await;
}

#[tokio::test]
async fn checkout_after_shutdown_is_refused() {
    let (pool, _) = scripted_pool(2, false);
    let connection = pool.checkout().await.unwrap();
    drop(connection);
    pool.shutdown(None).await;

    let err = pool.checkout().await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::PoolClosed));
    assert!(pool.prepare("SELECT 1").is_err());
}

#[tokio::test]
async fn pooled_statement_acquires_on_first_execute() {
    let (pool, created) = scripted_pool(2, false);
    assert_eq!(created.load(Ordering::SeqCst), 0);

    let mut statement = pool.prepare("INSERT INTO customer(name) VALUES (?)").unwrap();
    assert_eq!(created.load(Ordering::SeqCst), 0, "acquisition is lazy");

    statement.bind(0, "X").unwrap();
    let first = statement.execute().await.unwrap();
    assert_eq!(first.affected_rows(), 1);
    assert_eq!(created.load(Ordering::SeqCst), 1);
    assert_eq!(pool.active(), 1);
    assert_eq!(pool.idle(), 0, "the statement holds its connection");

    statement.bind(0, "Y").unwrap();
    let second = statement.execute().await.unwrap();
    assert!(second.last_insert_id() > first.last_insert_id());

    statement.dispose().await;
    assert_eq!(pool.idle(), 1, "dispose releases the connection");
    pool.shutdown(None).await;
}
