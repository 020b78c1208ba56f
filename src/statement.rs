//! Binary-protocol prepared statements
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use crate::client::{Client, Command, Engine};
use crate::constants::{capability, com};
use crate::error::{At, Error, ErrorKind, Result, parse_server_error};
use crate::packet::{PacketBuilder, PacketReader};
use crate::result_set::ResultSet;
use crate::row::{Column, Row, parse_column_definition};
use crate::value::Value;

/// Mutable state of a prepared statement, shared with the command
/// closures that prepare and execute it
struct StatementState {
    /// The SQL text, without the LIMIT/OFFSET tail
    sql: String,
    /// Server-assigned statement id, once prepared
    stmt_id: Option<u32>,
    /// Number of `?` placeholders the server reported
    param_count: u16,
    /// Parameter definitions the prepare response carried
    params: Vec<Column>,
    /// Bound values by 0-based placeholder index
    binds: BTreeMap<u16, Value>,
    /// Row limit appended as a literal `LIMIT n`
    limit: Option<u64>,
    /// Row offset appended as a literal `OFFSET k`
    offset: Option<u64>,
    /// Set when limit or offset changed after a prepare; the next execute
    /// closes the old id and prepares again
    recompile: bool,
    /// Latched by dispose
    disposed: bool,
}

impl StatementState {
    /// The SQL sent to the server, tail included
    fn full_sql(&self) -> String {
        let mut sql = self.sql.clone();
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
            if let Some(offset) = self.offset {
                sql.push_str(&format!(" OFFSET {offset}"));
            }
        }
        sql
    }
}

/// A prepared statement bound to one [Client].
///
/// Prepared lazily on the first execute; executing again reuses the
/// server-side id unless the limit or offset changed in between.
pub struct Statement {
    /// The client the statement is prepared on
    client: Client,
    /// State shared with the executor-side closures
    state: Arc<Mutex<StatementState>>,
    /// Set while an execute of this statement still has undrained rows
    streaming: Arc<AtomicBool>,
}

impl Statement {
    pub(crate) fn new(client: Client, sql: String) -> Statement {
        Statement {
            client,
            state: Arc::new(Mutex::new(StatementState {
                sql,
                stmt_id: None,
                param_count: 0,
                params: Vec::new(),
                binds: BTreeMap::new(),
                limit: None,
                offset: None,
                recompile: false,
                disposed: false,
            })),
            streaming: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Append a literal `LIMIT n` to the statement; n must be at least 1
    pub fn limit(&self, n: u64) -> Result<()> {
        if n == 0 {
            return Err(ErrorKind::InvalidLimit.into());
        }
        let mut state = self.state.lock().unwrap();
        if state.disposed {
            return Err(ErrorKind::StatementDisposed.into());
        }
        if state.limit != Some(n) {
            state.limit = Some(n);
            state.recompile = state.stmt_id.is_some();
        }
        Ok(())
    }

    /// Append a literal `OFFSET k` to the statement; takes effect with a
    /// limit set
    pub fn offset(&self, k: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.disposed {
            return Err(ErrorKind::StatementDisposed.into());
        }
        if state.offset != Some(k) {
            state.offset = Some(k);
            state.recompile = state.stmt_id.is_some();
        }
        Ok(())
    }

    /// Bind a value to the 0-based placeholder `index`
    pub fn bind(&self, index: u16, value: impl Into<Value>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.disposed {
            return Err(ErrorKind::StatementDisposed.into());
        }
        if state.stmt_id.is_some() && index >= state.param_count {
            return Err(ErrorKind::ParameterOutOfRange {
                index,
                count: state.param_count,
            }
            .into());
        }
        state.binds.insert(index, value.into());
        Ok(())
    }

    /// Bind values to placeholders 0, 1, 2, … in order
    pub fn bind_all<V: Into<Value>>(&self, values: impl IntoIterator<Item = V>) -> Result<()> {
        for (index, value) in values.into_iter().enumerate() {
            self.bind(index as u16, value)?;
        }
        Ok(())
    }

    /// The parameter definitions the server reported; empty until the
    /// first execute prepares the statement
    pub fn parameters(&self) -> Vec<Column> {
        self.state.lock().unwrap().params.clone()
    }

    /// Execute the statement, preparing it first when needed.
    ///
    /// Row-returning statements stream their rows through the returned
    /// [ResultSet]; everything else resolves with the OK counters.
    pub async fn execute(&self) -> Result<ResultSet> {
        if self.streaming.load(Ordering::SeqCst) {
            return Err(ErrorKind::RowsStillStreaming.into());
        }
        {
            let state = self.state.lock().unwrap();
            if state.disposed {
                return Err(ErrorKind::StatementDisposed.into());
            }
        }

        let (tx, rx) = oneshot::channel::<Result<ResultSet>>();
        let state = self.state.clone();
        let streaming = self.streaming.clone();
        let prefetch = self.client.prefetch();
        let command: Command = Box::new(move |engine| {
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
                    let work = run_execute(&mut *engine, &state);
                    tokio::select! {
                        biased;
                        out = work => Some(out),
                        _ = tx.closed() => None,
                    }
                };
                match outcome {
                    None => engine.shared.fault(ErrorKind::Cancelled.into()),
                    Some(Err(e)) => {
                        if e.is_fatal() {
                            engine.shared.fault(e.clone());
                        }
                        let _ = tx.send(Err(e));
                    }
                    Some(Ok(Response::Done(ok))) => {
                        let _ = tx.send(Ok(ResultSet::finished(
                            ok.affected_rows,
                            ok.last_insert_id,
                        )));
                    }
                    Some(Ok(Response::Rows(columns))) => {
                        let (row_tx, row_rx) = mpsc::channel(prefetch);
                        streaming.store(true, Ordering::SeqCst);
                        let set =
                            ResultSet::streaming(columns.clone(), row_rx, streaming.clone());
                        if tx.send(Ok(set)).is_err() {
                            // the caller vanished before taking the rows
                            streaming.store(false, Ordering::SeqCst);
                            engine.shared.fault(ErrorKind::Cancelled.into());
                            return;
                        }
                        pump_rows(&mut *engine, columns, row_tx, streaming).await;
                    }
                }
            })
        });
        self.client.send_command(command)?;
        match rx.await {
            Ok(out) => out,
            Err(_) => Err(self.client.closed_error()),
        }
    }

    /// Dispose the statement, closing the server-side id if one was
    /// allocated. Idempotent; later operations fail.
    pub async fn dispose(&self) {
        let stmt_id = {
            let mut state = self.state.lock().unwrap();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.binds.clear();
            state.params.clear();
            state.param_count = 0;
            state.stmt_id.take()
        };
        if let Some(stmt_id) = stmt_id {
            // no reply follows COM_STMT_CLOSE; a dead client frees the
            // statement together with the connection
            let _ = self
                .client
                .submit(move |engine| Box::pin(async move { engine.stmt_close(stmt_id).await }))
                .await;
        }
    }
}

impl Drop for Statement {
    fn drop(&mut self) {
        let stmt_id = {
            let mut state = self.state.lock().unwrap();
            if state.disposed {
                None
            } else {
                state.disposed = true;
                state.stmt_id.take()
            }
        };
        if let Some(stmt_id) = stmt_id {
            let _ = self.client.send_command(Box::new(move |engine| {
                Box::pin(async move {
                    let _ = engine.stmt_close(stmt_id).await;
                })
            }));
        }
    }
}

/// What the server answered to COM_STMT_EXECUTE
enum Response {
    /// No rows; the OK counters
    Done(crate::client::OkPacket),
    /// A result set with these columns; rows follow on the wire
    Rows(Arc<[Column]>),
}

/// Prepare the statement when needed, send COM_STMT_EXECUTE and read the
/// response up to the point where rows would begin.
async fn run_execute(engine: &mut Engine, state: &Arc<Mutex<StatementState>>) -> Result<Response> {
    let (needs_prepare, stale_id, sql) = {
        let mut st = state.lock().unwrap();
        if st.disposed {
            return Err(ErrorKind::StatementDisposed.into());
        }
        let stale = if st.recompile { st.stmt_id.take() } else { None };
        (
            st.stmt_id.is_none() || st.recompile,
            stale,
            st.full_sql(),
        )
    };

    if let Some(stale_id) = stale_id {
        engine.stmt_close(stale_id).await?;
    }

    let (stmt_id, param_count) = if needs_prepare {
        let (stmt_id, param_count) = prepare(engine, &sql, state).await?;
        trace!(stmt_id, param_count, "statement prepared");
        (stmt_id, param_count)
    } else {
        let st = state.lock().unwrap();
        (st.stmt_id.unwrap(), st.param_count)
    };

    // every placeholder must be bound, and none beyond the declared count
    let values: Vec<Value> = {
        let st = state.lock().unwrap();
        if let Some((&index, _)) = st.binds.range(param_count..).next() {
            return Err(ErrorKind::ParameterOutOfRange {
                index,
                count: param_count,
            }
            .into());
        }
        let mut values = Vec::with_capacity(param_count as usize);
        for index in 0..param_count {
            match st.binds.get(&index) {
                Some(value) => values.push(value.clone()),
                None => return Err(ErrorKind::UnboundParameter(index).into()),
            }
        }
        values
    };

    let mut b = PacketBuilder::new();
    b.put_u8(com::STMT_EXECUTE);
    b.put_u32(stmt_id);
    b.put_u8(0); // NO_CURSOR
    b.put_u32(1); // iteration count
    if param_count > 0 {
        let mut bitmap = vec![0u8; (param_count as usize + 7) >> 3];
        for (index, value) in values.iter().enumerate() {
            if value.is_null() {
                bitmap[index >> 3] |= 1 << (index & 7);
            }
        }
        b.put_slice(&bitmap);
        let any_bound = values.iter().any(|v| !v.is_null());
        b.put_u8(any_bound as u8);
        if any_bound {
            for value in &values {
                let (type_, unsigned) = value.parameter_type();
                b.put_u8(type_);
                b.put_u8(if unsigned { 0x80 } else { 0x00 });
            }
            for value in &values {
                value.encode(&mut b);
            }
        }
    }
    engine.begin_command();
    engine.send_packet(b.bytes()).await?;

    let payload = engine.read_raw_packet().await?;
    match payload.first().copied() {
        Some(0xFF) => Err(parse_server_error(&mut PacketReader::new(&payload[1..]))),
        Some(0x00) => {
            let ok = engine.parse_ok(&mut PacketReader::new(&payload[1..]))?;
            Ok(Response::Done(ok))
        }
        Some(0xFE) if payload.len() < 9 => {
            let ok = engine.parse_ok(&mut PacketReader::new(&payload[1..]))?;
            Ok(Response::Done(ok))
        }
        Some(_) => {
            let column_count = PacketReader::new(&payload)
                .get_lenenc()
                .at("column count")? as usize;
            let mut columns = Vec::with_capacity(column_count);
            for _ in 0..column_count {
                let definition = engine.read_raw_packet().await?;
                columns.push(parse_column_definition(&mut PacketReader::new(
                    &definition,
                ))?);
            }
            if !engine.capabilities.contains(capability::DEPRECATE_EOF) {
                engine.read_packet(&[0xFE]).await?;
            }
            Ok(Response::Rows(Arc::from(columns)))
        }
        None => Err(ErrorKind::Protocol("empty execute response".to_string()).into()),
    }
}

/// Send COM_STMT_PREPARE and parse the response, recording the new id and
/// parameter definitions in the statement state.
async fn prepare(
    engine: &mut Engine,
    sql: &str,
    state: &Arc<Mutex<StatementState>>,
) -> Result<(u32, u16)> {
    engine.begin_command();
    let mut b = PacketBuilder::new();
    b.put_u8(com::STMT_PREPARE);
    b.put_slice(sql.as_bytes());
    engine.send_packet(b.bytes()).await?;

    let payload = engine.read_raw_packet().await?;
    let mut r = PacketReader::new(&payload);
    // a prepare can legally fail with a server error, so ERR comes first
    match r.get_u8().at("prepare response")? {
        0xFF => return Err(parse_server_error(&mut r)),
        0x00 => {}
        other => {
            return Err(ErrorKind::Protocol(format!(
                "unexpected reply {other:#04x} to prepare"
            ))
            .into());
        }
    }
    let stmt_id = r.get_u32().at("statement id")?;
    let column_count = r.get_u16().at("column count")?;
    let param_count = r.get_u16().at("parameter count")?;
    if !r.is_empty() {
        r.expect_u8("prepare filler", 0).at("prepare filler")?;
        let _warnings = r.get_u16().at("warning count")?;
    }

    let mut params = Vec::with_capacity(param_count as usize);
    for _ in 0..param_count {
        let definition = engine.read_raw_packet().await?;
        params.push(parse_column_definition(&mut PacketReader::new(
            &definition,
        ))?);
    }
    if param_count > 0 && !engine.capabilities.contains(capability::DEPRECATE_EOF) {
        engine.read_packet(&[0xFE]).await?;
    }
    // column definitions are re-read on every execute; discard them here
    for _ in 0..column_count {
        engine.read_raw_packet().await?;
    }
    if column_count > 0 && !engine.capabilities.contains(capability::DEPRECATE_EOF) {
        engine.read_packet(&[0xFE]).await?;
    }

    let mut st = state.lock().unwrap();
    st.stmt_id = Some(stmt_id);
    st.param_count = param_count;
    st.params = params;
    st.recompile = false;
    Ok((stmt_id, param_count))
}

/// Read row packets and hand them to the result set's channel until the
/// terminal EOF, an error, or the consumer going away.
async fn pump_rows(
    engine: &mut Engine,
    columns: Arc<[Column]>,
    rows: mpsc::Sender<Result<Row>>,
    streaming: Arc<AtomicBool>,
) {
    loop {
        let payload = match engine.read_raw_packet().await {
            Ok(payload) => payload,
            Err(e) => {
                engine.shared.fault(e.clone());
                streaming.store(false, Ordering::SeqCst);
                let _ = rows.send(Err(e)).await;
                return;
            }
        };
        match payload.first().copied() {
            Some(0xFE) if payload.len() < 9 => {
                let mut r = PacketReader::new(&payload[1..]);
                if engine.capabilities.contains(capability::DEPRECATE_EOF) {
                    let _ = engine.parse_ok(&mut r);
                } else if let (Ok(_warnings), Ok(status)) = (r.get_u16(), r.get_u16()) {
                    engine.note_status(status);
                }
                streaming.store(false, Ordering::SeqCst);
                // dropping the sender ends the stream normally
                return;
            }
            Some(0x00) => match Row::parse_binary(&columns, &payload) {
                Ok(row) => {
                    if rows.send(Ok(row)).await.is_err() {
                        // consumer dropped the result set mid-stream; the
                        // remaining rows cannot be accounted for
                        streaming.store(false, Ordering::SeqCst);
                        engine.shared.fault(ErrorKind::Cancelled.into());
                        return;
                    }
                }
                Err(e) => {
                    engine.shared.fault(e.clone());
                    streaming.store(false, Ordering::SeqCst);
                    let _ = rows.send(Err(e)).await;
                    return;
                }
            },
            Some(0xFF) => {
                // the server aborted the result set; the stream stays aligned
                let e = parse_server_error(&mut PacketReader::new(&payload[1..]));
                streaming.store(false, Ordering::SeqCst);
                let _ = rows.send(Err(e)).await;
                return;
            }
            other => {
                let e: Error = ErrorKind::Protocol(format!(
                    "unexpected row packet type {other:?}"
                ))
                .into();
                engine.shared.fault(e.clone());
                streaming.store(false, Ordering::SeqCst);
                let _ = rows.send(Err(e)).await;
                return;
            }
        }
    }
}
