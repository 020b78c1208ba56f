//! A single authenticated connection and its in-order command executor
use std::borrow::Cow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::auth::{self, Greeting};
use crate::constants::{CapabilitySet, capability, charset, com, status_flag};
use crate::error::{At, Error, ErrorKind, Result, parse_server_error};
use crate::frame::{FrameReader, FrameWriter};
use crate::packet::{Packet, PacketBuilder, PacketReader};

/// The byte stream a client runs over.
///
/// Establishing the stream (TCP, UNIX socket, in-memory pipe) is the
/// caller's business; the client only requires an opened duplex stream.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

/// The boxed stream the engine owns once a client is up
type BoxStream = Box<dyn Stream>;

/// A queued command closure, driven to completion by the executor task
pub(crate) type Command = Box<dyn for<'a> FnOnce(&'a mut Engine) -> BoxFuture<'a, ()> + Send>;

/// Options used to authenticate a connection
pub struct ConnectOptions<'a> {
    /// The user to connect as
    pub user: Cow<'a, str>,
    /// The password for the user
    pub password: Cow<'a, str>,
    /// Database selected with COM_INIT_DB after the handshake, if any
    pub database: Option<Cow<'a, str>>,
    /// Connection character set, by collation id
    pub charset: u8,
    /// Rows buffered per in-flight result set
    pub prefetch: usize,
}

impl<'a> Default for ConnectOptions<'a> {
    fn default() -> Self {
        Self {
            user: Cow::Borrowed("root"),
            password: Cow::Borrowed(""),
            database: None,
            charset: charset::UTF8MB4_GENERAL_CI,
            prefetch: 4,
        }
    }
}

impl<'a> ConnectOptions<'a> {
    /// Options for the given user with an empty password
    pub fn new(user: impl Into<Cow<'a, str>>) -> Self {
        Self {
            user: user.into(),
            ..Default::default()
        }
    }

    /// Set the password
    pub fn password(mut self, password: impl Into<Cow<'a, str>>) -> Self {
        self.password = password.into();
        self
    }

    /// Select this database once authenticated
    pub fn database(mut self, database: impl Into<Cow<'a, str>>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Buffer this many rows per in-flight result set
    pub fn prefetch(mut self, rows: usize) -> Self {
        self.prefetch = rows.max(1);
        self
    }
}

/// A parsed OK (or short EOF) packet
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct OkPacket {
    /// Rows affected by the command
    pub(crate) affected_rows: u64,
    /// Id assigned to the last inserted row
    pub(crate) last_insert_id: u64,
    /// Server status flags
    pub(crate) status: u16,
}

/// Parse an OK packet body, the 0x00 or 0xFE tag already consumed
pub(crate) fn parse_ok(r: &mut PacketReader<'_>, capabilities: CapabilitySet) -> Result<OkPacket> {
    let affected_rows = r.get_lenenc().at("affected rows")?;
    let last_insert_id = r.get_lenenc().at("last insert id")?;
    let mut status = 0;
    if capabilities.contains(capability::PROTOCOL_41) {
        status = r.get_u16().at("status flags")?;
        let _warnings = r.get_u16().at("warning count")?;
    }
    if capabilities.contains(capability::SESSION_TRACK) {
        if !r.is_empty() {
            r.skip_lenenc_str().at("status info")?;
            if status & status_flag::SESSION_STATE_CHANGED != 0 && !r.is_empty() {
                r.skip_lenenc_str().at("session state changes")?;
            }
        }
    } else if !r.is_empty() {
        r.get_eof_str().at("status info")?;
    }
    Ok(OkPacket {
        affected_rows,
        last_insert_id,
        status,
    })
}

/// State shared between the client handle and its executor task
#[derive(Debug)]
pub(crate) struct Shared {
    /// Server-assigned id of this connection
    connection_id: u32,
    /// Rows buffered per in-flight result set
    prefetch: usize,
    /// Latched once the client is shutting down or dead
    disposed: AtomicBool,
    /// Latched when protocol alignment was lost
    faulted: AtomicBool,
    /// Mirrors the IN_TRANS bit of the last observed status flags
    in_transaction: AtomicBool,
    /// The first shutdown cause, handed to every queued command
    reason: std::sync::Mutex<Option<Error>>,
}

impl Shared {
    fn new(connection_id: u32, prefetch: usize) -> Self {
        Self {
            connection_id,
            prefetch,
            disposed: AtomicBool::new(false),
            faulted: AtomicBool::new(false),
            in_transaction: AtomicBool::new(false),
            reason: std::sync::Mutex::new(None),
        }
    }

    fn store_reason(&self, e: Error) {
        let mut reason = self.reason.lock().unwrap();
        if reason.is_none() {
            *reason = Some(e);
        }
    }

    /// Record that protocol alignment was lost and the stream is dead
    pub(crate) fn fault(&self, e: Error) {
        warn!(connection_id = self.connection_id, error = %e, "client faulted");
        self.store_reason(e);
        self.faulted.store(true, Ordering::SeqCst);
        self.disposed.store(true, Ordering::SeqCst);
    }

    /// The shutdown cause, once the client is disposed
    pub(crate) fn closed_reason(&self) -> Option<Error> {
        if !self.disposed.load(Ordering::SeqCst) {
            return None;
        }
        let reason = self.reason.lock().unwrap();
        Some(
            reason
                .clone()
                .unwrap_or_else(|| ErrorKind::Closed.into()),
        )
    }

    fn is_closed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub(crate) fn set_in_transaction(&self, value: bool) {
        self.in_transaction.store(value, Ordering::SeqCst);
    }
}

/// Owns the stream halves and the sequence counter.
///
/// Lives inside the executor task; command closures receive it one at a
/// time, so reads and writes of different commands can never interleave.
pub(crate) struct Engine {
    /// Reads and reassembles inbound frames
    reader: FrameReader<ReadHalf<BoxStream>>,
    /// Stamps and writes outbound frames
    writer: FrameWriter<WriteHalf<BoxStream>>,
    /// Capabilities negotiated during the handshake
    pub(crate) capabilities: CapabilitySet,
    /// Flags shared with the client handle
    pub(crate) shared: Arc<Shared>,
}

impl Engine {
    /// Start a wire command: the next outbound frame carries sequence 0
    pub(crate) fn begin_command(&mut self) {
        self.writer.reset_sequence();
    }

    /// Frame and send one payload
    pub(crate) async fn send_packet(&mut self, payload: &[u8]) -> Result<()> {
        self.writer.send(payload).await
    }

    /// Read the next assembled payload, unfiltered, adopting its sequence
    pub(crate) async fn read_raw_packet(&mut self) -> Result<bytes::Bytes> {
        let (payload, seq) = self.reader.read_payload().await?;
        self.writer.set_sequence_after(seq);
        Ok(payload)
    }

    /// Read the next packet; an ERR packet becomes the parsed server
    /// error, a type outside `expected` (when non-empty) a protocol error.
    pub(crate) async fn read_packet(&mut self, expected: &[u8]) -> Result<Packet> {
        let payload = self.read_raw_packet().await?;
        let Some(&kind) = payload.first() else {
            return Err(ErrorKind::Protocol("unexpected empty packet".to_string()).into());
        };
        if kind == 0xFF {
            return Err(parse_server_error(&mut PacketReader::new(&payload[1..])));
        }
        if !expected.is_empty() && !expected.contains(&kind) {
            return Err(ErrorKind::Protocol(format!(
                "unexpected packet type {kind:#04x}"
            ))
            .into());
        }
        Ok(Packet { kind, payload })
    }

    /// Parse an OK body and track the transaction status it reports
    pub(crate) fn parse_ok(&self, r: &mut PacketReader<'_>) -> Result<OkPacket> {
        let ok = parse_ok(r, self.capabilities)?;
        self.shared
            .set_in_transaction(ok.status & status_flag::IN_TRANS != 0);
        Ok(ok)
    }

    /// Track a status word from a legacy EOF packet
    pub(crate) fn note_status(&self, status: u16) {
        self.shared
            .set_in_transaction(status & status_flag::IN_TRANS != 0);
    }

    /// Send a text-protocol query that returns no rows and parse its OK
    pub(crate) async fn query_ok(&mut self, sql: &str) -> Result<OkPacket> {
        self.begin_command();
        let mut b = PacketBuilder::new();
        b.put_u8(com::QUERY);
        b.put_slice(sql.as_bytes());
        self.send_packet(b.bytes()).await?;
        let packet = self.read_packet(&[0x00, 0xFE]).await?;
        if packet.kind == 0xFE && !self.capabilities.contains(capability::DEPRECATE_EOF) {
            return Err(ErrorKind::Protocol("unexpected EOF reply to query".to_string()).into());
        }
        self.parse_ok(&mut packet.reader())
    }

    /// Send COM_STMT_CLOSE for the given statement id; the server does not
    /// reply
    pub(crate) async fn stmt_close(&mut self, stmt_id: u32) -> Result<()> {
        self.begin_command();
        let mut b = PacketBuilder::new();
        b.put_u8(com::STMT_CLOSE);
        b.put_u32(stmt_id);
        self.send_packet(b.bytes()).await
    }
}

/// Handle to one authenticated connection.
///
/// Cloning is cheap; all clones feed the same FIFO executor, which drives
/// exactly one command at a time over the exclusively owned stream.
#[derive(Clone, Debug)]
pub struct Client {
    /// Submission side of the executor queue
    commands: mpsc::UnboundedSender<Command>,
    /// Flags shared with the executor task
    shared: Arc<Shared>,
}

impl Client {
    /// Authenticate over an opened stream and spawn the executor task.
    ///
    /// Performs the capability-negotiating handshake, answers the
    /// scramble with the requested auth plugin and selects the configured
    /// database.
    pub async fn handshake<S>(stream: S, options: &ConnectOptions<'_>) -> Result<Client>
    where
        S: Stream + 'static,
    {
        let (read, write) = tokio::io::split(Box::new(stream) as BoxStream);
        let mut reader = FrameReader::new(read);
        let mut writer = FrameWriter::new(write);

        let (payload, seq) = reader.read_payload().await?;
        if payload.first() == Some(&0xFF) {
            return Err(auth::rejected(parse_server_error(&mut PacketReader::new(
                &payload[1..],
            ))));
        }
        let greeting = Greeting::parse(&payload)?;
        let capabilities = CapabilitySet::negotiate(greeting.capabilities);
        if !capabilities.contains(capability::PROTOCOL_41) {
            return Err(ErrorKind::Protocol(
                "server does not speak protocol 4.1".to_string(),
            )
            .into());
        }

        let scramble_response =
            auth::auth_response(greeting.plugin, &options.password, &greeting.scramble);
        let response = auth::build_handshake_response(
            capabilities,
            options.charset,
            &options.user,
            &scramble_response,
            greeting.plugin,
        );
        writer.set_sequence_after(seq);
        writer.send(response.bytes()).await?;

        let (payload, _) = reader.read_payload().await?;
        match payload.first().copied() {
            Some(0x00) => {
                parse_ok(&mut PacketReader::new(&payload[1..]), capabilities)?;
            }
            Some(0xFF) => {
                return Err(auth::rejected(parse_server_error(&mut PacketReader::new(
                    &payload[1..],
                ))));
            }
            Some(0xFE) => {
                // an auth-switch request asks for a plugin we did not offer
                let mut r = PacketReader::new(&payload[1..]);
                let name = r.get_null_str().unwrap_or("unknown").to_string();
                return Err(ErrorKind::UnsupportedAuthPlugin(name).into());
            }
            _ => {
                return Err(ErrorKind::Protocol(
                    "unexpected reply to handshake response".to_string(),
                )
                .into());
            }
        }
        debug!(
            server_version = %greeting.server_version,
            connection_id = greeting.connection_id,
            "handshake complete"
        );

        let shared = Arc::new(Shared::new(greeting.connection_id, options.prefetch));
        let mut engine = Engine {
            reader,
            writer,
            capabilities,
            shared: shared.clone(),
        };

        if let Some(database) = &options.database {
            engine.begin_command();
            let mut b = PacketBuilder::new();
            b.put_u8(com::INIT_DB);
            b.put_slice(database.as_bytes());
            engine.send_packet(b.bytes()).await?;
            let packet = engine.read_packet(&[0x00, 0xFE]).await?;
            engine.parse_ok(&mut packet.reader())?;
            engine.begin_command();
        }

        let (commands, queue) = mpsc::unbounded_channel();
        tokio::spawn(drive(engine, queue));
        Ok(Client { commands, shared })
    }

    /// The server-assigned id of this connection
    pub fn connection_id(&self) -> u32 {
        self.shared.connection_id
    }

    /// Rows buffered per in-flight result set
    pub(crate) fn prefetch(&self) -> usize {
        self.shared.prefetch
    }

    /// True once the client has been shut down or has died
    pub fn is_disposed(&self) -> bool {
        self.shared.is_closed()
    }

    /// The IN_TRANS bit of the last status flags the server reported
    pub fn is_in_transaction(&self) -> bool {
        self.shared.in_transaction.load(Ordering::SeqCst)
    }

    /// The shutdown cause, defaulting to a plain closed error
    pub(crate) fn closed_error(&self) -> Error {
        self.shared
            .closed_reason()
            .unwrap_or_else(|| ErrorKind::Closed.into())
    }

    /// Enqueue a raw command closure on the executor
    pub(crate) fn send_command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| self.closed_error())
    }

    /// Enqueue a command closure and await its outcome.
    ///
    /// The closure runs alone on the engine. Dropping the returned future
    /// while the command is still queued cancels it without side effects;
    /// dropping it once the closure is mid-flight shuts the client down,
    /// since the position in the protocol stream is then unknown.
    pub(crate) async fn submit<T, F>(&self, command: F) -> Result<T>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a mut Engine) -> BoxFuture<'a, Result<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel::<Result<T>>();
        let boxed: Command = Box::new(move |engine| {
            Box::pin(async move {
                let mut tx = tx;
                if tx.is_closed() {
                    return;
                }
                if let Some(e) = engine.shared.closed_reason() {
                    let _ = tx.send(Err(e));
                    return;
                }
                let outcome = {
                    let work = command(&mut *engine);
                    tokio::select! {
                        biased;
                        out = work => Some(out),
                        _ = tx.closed() => None,
                    }
                };
                match outcome {
                    Some(out) => {
                        if let Err(e) = &out {
                            if e.is_fatal() {
                                engine.shared.fault(e.clone());
                            }
                        }
                        let _ = tx.send(out);
                    }
                    None => engine.shared.fault(ErrorKind::Cancelled.into()),
                }
            })
        });
        self.send_command(boxed)?;
        match rx.await {
            Ok(out) => out,
            Err(_) => Err(self.closed_error()),
        }
    }

    /// Measure a COM_PING round trip in milliseconds
    pub async fn ping(&self) -> Result<u64> {
        self.submit(|engine| {
            Box::pin(async move {
                let started = tokio::time::Instant::now();
                engine.begin_command();
                engine.send_packet(&[com::PING]).await?;
                let packet = engine.read_packet(&[0x00, 0xFE]).await?;
                engine.parse_ok(&mut packet.reader())?;
                Ok(started.elapsed().as_millis() as u64)
            })
        })
        .await
    }

    /// Open a transaction, optionally read-only
    pub async fn begin_transaction(&self, read_only: bool) -> Result<()> {
        let sql = if read_only {
            "START TRANSACTION READ ONLY"
        } else {
            "START TRANSACTION"
        };
        self.transaction_command(sql, true).await
    }

    /// Commit the open transaction
    pub async fn commit(&self) -> Result<()> {
        self.transaction_command("COMMIT", false).await
    }

    /// Roll the open transaction back
    pub async fn roll_back(&self) -> Result<()> {
        self.transaction_command("ROLLBACK", false).await
    }

    /// Run a transaction verb and verify the server agrees on the
    /// resulting transaction state. Any failure here shuts the client
    /// down: the pool must never re-issue a connection whose transaction
    /// state is in doubt.
    async fn transaction_command(&self, sql: &'static str, entering: bool) -> Result<()> {
        self.submit(move |engine| {
            Box::pin(async move {
                match engine.query_ok(sql).await {
                    Ok(ok) => {
                        let in_transaction = ok.status & status_flag::IN_TRANS != 0;
                        if in_transaction != entering {
                            let e: Error = ErrorKind::Protocol(format!(
                                "transaction state out of sync after {sql}"
                            ))
                            .into();
                            engine.shared.fault(e.clone());
                            return Err(e);
                        }
                        Ok(())
                    }
                    Err(e) => {
                        engine.shared.fault(e.clone());
                        Err(e)
                    }
                }
            })
        })
        .await
    }

    /// Shut the client down.
    ///
    /// Idempotent. Commands still queued are cancelled with `reason`; the
    /// in-flight command drains first, then COM_QUIT is sent best-effort
    /// and the stream closes.
    pub async fn shutdown(&self, reason: Option<Error>) {
        if self.shared.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared
            .store_reason(reason.unwrap_or_else(|| ErrorKind::Closed.into()));
        // wake the executor so it observes the latch even when idle
        let (tx, rx) = oneshot::channel::<()>();
        let nudge: Command = Box::new(move |_| {
            Box::pin(async move {
                let _ = tx.send(());
            })
        });
        if self.commands.send(nudge).is_ok() {
            let _ = rx.await;
        }
    }
}

/// The executor task: drives queued command closures strictly one at a
/// time, resetting the sequence counter at every boundary.
async fn drive(mut engine: Engine, mut queue: mpsc::UnboundedReceiver<Command>) {
    while let Some(command) = queue.recv().await {
        command(&mut engine).await;
        engine.begin_command();
        if engine.shared.is_closed() {
            break;
        }
    }
    queue.close();
    if !engine.shared.faulted.load(Ordering::SeqCst) {
        engine.begin_command();
        let _ = engine.send_packet(&[com::QUIT]).await;
    }
    engine.shared.store_reason(ErrorKind::Closed.into());
    engine.shared.disposed.store(true, Ordering::SeqCst);
    let _ = engine.writer.close().await;
    debug!(
        connection_id = engine.shared.connection_id,
        "connection closed"
    );
    // commands still queued are dropped here; their callers resolve with
    // the stored shutdown reason
}
