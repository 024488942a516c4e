//! In-memory stand-ins for a Postgres server and its transport.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};

use crate::client::websocket::WsConnector;
use crate::error::{NeonError, Result};
use crate::protocol::channel::Channel;

pub(crate) type SentLog = Arc<Mutex<Vec<Bytes>>>;

/// Scripted or server-backed [`Channel`].
///
/// Scripted channels replay fixed chunks. Server-backed channels feed each
/// sent buffer to a [`MockPostgres`] and queue its reply. Either way, an
/// exhausted queue reads as a closed peer.
pub(crate) struct MockChannel {
    inbound: VecDeque<Bytes>,
    server: Option<MockPostgres>,
    chunk_size: Option<usize>,
    delay: Option<Duration>,
    fail_sends: bool,
    sent: SentLog,
    closed: Arc<AtomicBool>,
    hung_up: Arc<AtomicBool>,
}

impl MockChannel {
    fn empty() -> Self {
        Self {
            inbound: VecDeque::new(),
            server: None,
            chunk_size: None,
            delay: None,
            fail_sends: false,
            sent: Arc::default(),
            closed: Arc::default(),
            hung_up: Arc::default(),
        }
    }

    pub(crate) fn with_chunks(chunks: impl IntoIterator<Item = Bytes>) -> Self {
        Self {
            inbound: chunks.into_iter().collect(),
            ..Self::empty()
        }
    }

    pub(crate) fn postgres(server: MockPostgres) -> Self {
        Self {
            server: Some(server),
            ..Self::empty()
        }
    }

    /// Split server replies into chunks of at most `n` bytes.
    pub(crate) fn chunk_size(mut self, n: usize) -> Self {
        self.chunk_size = Some(n);
        self
    }

    /// Sleep before every receive.
    pub(crate) fn delay(mut self, d: Duration) -> Self {
        self.delay = Some(d);
        self
    }

    pub(crate) fn failing_sends(mut self) -> Self {
        self.fail_sends = true;
        self
    }

    pub(crate) fn sent_log(&self) -> SentLog {
        self.sent.clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn closed_flag(&self) -> Arc<AtomicBool> {
        self.closed.clone()
    }

    /// Setting the flag makes the channel behave as if the server had
    /// closed the socket.
    pub(crate) fn hang_up_flag(&self) -> Arc<AtomicBool> {
        self.hung_up.clone()
    }

    fn hung_up(&self) -> bool {
        self.hung_up.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Channel for MockChannel {
    async fn send(&mut self, data: Bytes) -> Result<()> {
        if self.fail_sends || self.is_closed() || self.hung_up() {
            return Err(NeonError::Connection("mock channel closed".into()));
        }
        self.sent.lock().unwrap().push(data.clone());

        if let Some(server) = self.server.as_mut() {
            let reply = server.handle(&data);
            if !reply.is_empty() {
                match self.chunk_size {
                    Some(n) => self
                        .inbound
                        .extend(reply.chunks(n).map(Bytes::copy_from_slice)),
                    None => self.inbound.push_back(reply.freeze()),
                }
            }
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Bytes> {
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        if self.hung_up() {
            return Ok(Bytes::new());
        }
        Ok(self.inbound.pop_front().unwrap_or_default())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&mut self) -> bool {
        !self.is_closed() && !self.hung_up()
    }
}

/// Backend message builders. Each returns one complete framed message.
pub(crate) mod backend {
    use super::*;

    pub(crate) fn message(tag: u8, body: impl FnOnce(&mut BytesMut)) -> Bytes {
        let mut b = BytesMut::new();
        body(&mut b);
        let mut out = BytesMut::with_capacity(b.len() + 5);
        out.put_u8(tag);
        out.put_i32(b.len() as i32 + 4);
        out.extend_from_slice(&b);
        out.freeze()
    }

    fn cstr(b: &mut BytesMut, s: &str) {
        b.extend_from_slice(s.as_bytes());
        b.put_u8(0);
    }

    pub(crate) fn auth_request(code: i32, extra: &[u8]) -> Bytes {
        message(b'R', |b| {
            b.put_i32(code);
            b.extend_from_slice(extra);
        })
    }

    pub(crate) fn auth_ok() -> Bytes {
        auth_request(0, &[])
    }

    pub(crate) fn auth_cleartext() -> Bytes {
        auth_request(3, &[])
    }

    pub(crate) fn auth_md5(salt: [u8; 4]) -> Bytes {
        auth_request(5, &salt)
    }

    pub(crate) fn auth_sasl(mechanisms: &[&str]) -> Bytes {
        let mut list = Vec::new();
        for m in mechanisms {
            list.extend_from_slice(m.as_bytes());
            list.push(0);
        }
        list.push(0);
        auth_request(10, &list)
    }

    pub(crate) fn auth_sasl_continue(data: &str) -> Bytes {
        auth_request(11, data.as_bytes())
    }

    pub(crate) fn auth_sasl_final(data: &str) -> Bytes {
        auth_request(12, data.as_bytes())
    }

    pub(crate) fn parameter_status(name: &str, value: &str) -> Bytes {
        message(b'S', |b| {
            cstr(b, name);
            cstr(b, value);
        })
    }

    pub(crate) fn backend_key(pid: i32, secret: i32) -> Bytes {
        message(b'K', |b| {
            b.put_i32(pid);
            b.put_i32(secret);
        })
    }

    pub(crate) fn ready(status: u8) -> Bytes {
        message(b'Z', |b| b.put_u8(status))
    }

    pub(crate) fn row_description(cols: &[(&str, u32)]) -> Bytes {
        message(b'T', |b| {
            b.put_u16(cols.len() as u16);
            for (name, type_id) in cols {
                cstr(b, name);
                b.put_u32(0); // table oid
                b.put_i16(0); // column index
                b.put_u32(*type_id);
                b.put_i16(-1);
                b.put_i32(-1);
                b.put_i16(0);
            }
        })
    }

    pub(crate) fn data_row(values: &[Option<&[u8]>]) -> Bytes {
        message(b'D', |b| {
            b.put_u16(values.len() as u16);
            for v in values {
                match v {
                    None => b.put_i32(-1),
                    Some(v) => {
                        b.put_i32(v.len() as i32);
                        b.extend_from_slice(v);
                    }
                }
            }
        })
    }

    pub(crate) fn command_complete(tag: &str) -> Bytes {
        message(b'C', |b| cstr(b, tag))
    }

    pub(crate) fn error_response(fields: &[(u8, &str)]) -> Bytes {
        message(b'E', |b| {
            for (code, value) in fields {
                b.put_u8(*code);
                cstr(b, value);
            }
            b.put_u8(0);
        })
    }

    pub(crate) fn notice(text: &str) -> Bytes {
        message(b'N', |b| {
            b.put_u8(b'S');
            cstr(b, "NOTICE");
            b.put_u8(b'M');
            cstr(b, text);
            b.put_u8(0);
        })
    }

    pub(crate) fn parse_complete() -> Bytes {
        message(b'1', |_| {})
    }

    pub(crate) fn bind_complete() -> Bytes {
        message(b'2', |_| {})
    }

    pub(crate) fn no_data() -> Bytes {
        message(b'n', |_| {})
    }

    pub(crate) fn empty_query() -> Bytes {
        message(b'I', |_| {})
    }
}

/// Frontend message inspection.
pub(crate) mod frontend {
    use super::*;

    /// Split a buffer of tagged frontend messages into `(tag, body)`.
    pub(crate) fn split(mut data: &[u8]) -> Vec<(u8, Bytes)> {
        let mut out = Vec::new();
        while data.len() >= 5 {
            let len = i32::from_be_bytes([data[1], data[2], data[3], data[4]]) as usize;
            out.push((data[0], Bytes::copy_from_slice(&data[5..1 + len])));
            data = &data[1 + len..];
        }
        out
    }

    pub(crate) fn cstr(body: &[u8]) -> (&str, &[u8]) {
        let pos = body.iter().position(|&b| b == 0).unwrap_or(body.len());
        let s = std::str::from_utf8(&body[..pos]).unwrap_or("");
        (s, body.get(pos + 1..).unwrap_or(&[]))
    }

    /// SQL text of every Query and Parse message, skipping each log's
    /// leading startup message.
    pub(crate) fn statements(log: &[Bytes]) -> Vec<String> {
        log.iter()
            .skip(1)
            .flat_map(|buf| split(buf))
            .filter_map(|(tag, body)| match tag {
                b'Q' => Some(cstr(&body).0.to_string()),
                b'P' => Some(cstr(cstr(&body).1).0.to_string()),
                _ => None,
            })
            .collect()
    }

    /// Text parameter values of every Bind message.
    pub(crate) fn bind_params(log: &[Bytes]) -> Vec<Vec<Option<String>>> {
        log.iter()
            .skip(1)
            .flat_map(|buf| split(buf))
            .filter(|(tag, _)| *tag == b'B')
            .map(|(_, body)| super::bind_values(&body))
            .collect()
    }
}

fn bind_values(body: &[u8]) -> Vec<Option<String>> {
    let (_, rest) = frontend::cstr(body);
    let (_, rest) = frontend::cstr(rest);
    let n_formats = u16::from_be_bytes([rest[0], rest[1]]) as usize;
    let mut b = &rest[2 + 2 * n_formats..];
    let n = u16::from_be_bytes([b[0], b[1]]) as usize;
    b = &b[2..];
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        let len = i32::from_be_bytes([b[0], b[1], b[2], b[3]]);
        b = &b[4..];
        if len < 0 {
            out.push(None);
        } else {
            let len = len as usize;
            out.push(Some(String::from_utf8_lossy(&b[..len]).into_owned()));
            b = &b[len..];
        }
    }
    out
}

#[derive(Debug, Clone, Default)]
pub(crate) enum AuthStage {
    #[default]
    AwaitStartup,
    AwaitSaslInitial,
    AwaitSaslFinal {
        client_first_bare: String,
        server_first: String,
    },
    Ready,
}

/// A tiny Postgres: trust or SCRAM auth, the simple and extended query
/// protocols, and transaction status tracking.
///
/// Statements containing `bad` fail with SQLSTATE 42703. SELECTs return one
/// row: the first bound parameter as text, or `1` as int4.
#[derive(Debug, Clone, Default)]
pub(crate) struct MockPostgres {
    /// Require SCRAM-SHA-256 with this password.
    pub(crate) scram_password: Option<String>,
    /// Stop answering after this many statements.
    pub(crate) die_after: Option<usize>,
    pub(crate) stage: AuthStage,
    pub(crate) status: u8,
    pub(crate) statements: usize,
    pub(crate) skipping: bool,
    pub(crate) current_sql: String,
    pub(crate) current_param: Option<Option<String>>,
}

const SCRAM_SALT: &[u8] = b"mock-salt-123456";
const SCRAM_ITERATIONS: u32 = 16;

impl MockPostgres {
    fn handle(&mut self, data: &[u8]) -> BytesMut {
        let mut out = BytesMut::new();
        if let AuthStage::AwaitStartup = self.stage {
            self.status = b'I';
            if self.scram_password.is_some() {
                self.stage = AuthStage::AwaitSaslInitial;
                out.extend_from_slice(&backend::auth_sasl(&["SCRAM-SHA-256"]));
            } else {
                self.finish_startup(&mut out);
            }
            return out;
        }

        for (tag, body) in frontend::split(data) {
            if self.is_dead() {
                return BytesMut::new();
            }
            match tag {
                b'p' => self.handle_password(&body, &mut out),
                b'Q' => {
                    self.statements += 1;
                    if !self.is_dead() {
                        self.simple(frontend::cstr(&body).0, &mut out);
                    }
                }
                b'P' => {
                    self.statements += 1;
                    let sql = frontend::cstr(frontend::cstr(&body).1).0.to_string();
                    if self.is_dead() {
                        continue;
                    }
                    if sql.contains("bad") {
                        self.fail(&sql, &mut out);
                        self.skipping = true;
                    } else {
                        out.extend_from_slice(&backend::parse_complete());
                    }
                    self.current_sql = sql;
                    self.current_param = None;
                }
                b'B' if !self.skipping => {
                    self.current_param = bind_values(&body).into_iter().next();
                    out.extend_from_slice(&backend::bind_complete());
                }
                b'D' if !self.skipping => {
                    if is_select(&self.current_sql) {
                        let type_id = if self.current_param.is_some() { 25 } else { 23 };
                        out.extend_from_slice(&backend::row_description(&[(
                            "?column?", type_id,
                        )]));
                    } else {
                        out.extend_from_slice(&backend::no_data());
                    }
                }
                b'E' if !self.skipping => {
                    let sql = self.current_sql.clone();
                    if is_select(&sql) {
                        let value = match &self.current_param {
                            Some(p) => p.clone(),
                            None => Some("1".to_string()),
                        };
                        out.extend_from_slice(&backend::data_row(&[value
                            .as_deref()
                            .map(str::as_bytes)]));
                    }
                    self.complete(&sql, &mut out);
                }
                b'S' => {
                    self.skipping = false;
                    out.extend_from_slice(&backend::ready(self.status));
                }
                _ => {}
            }
        }
        out
    }

    fn is_dead(&self) -> bool {
        self.die_after.is_some_and(|n| self.statements > n)
    }

    fn finish_startup(&mut self, out: &mut BytesMut) {
        self.stage = AuthStage::Ready;
        out.extend_from_slice(&backend::auth_ok());
        out.extend_from_slice(&backend::parameter_status("server_version", "16.4"));
        out.extend_from_slice(&backend::parameter_status("client_encoding", "UTF8"));
        out.extend_from_slice(&backend::backend_key(1234, 5678));
        out.extend_from_slice(&backend::ready(b'I'));
    }

    fn fail(&mut self, sql: &str, out: &mut BytesMut) {
        if self.status == b'T' {
            self.status = b'E';
        }
        out.extend_from_slice(&backend::error_response(&[
            (b'S', "ERROR"),
            (b'C', "42703"),
            (b'M', &format!("column \"bad\" does not exist in: {sql}")),
            (b'H', "check the column name"),
        ]));
    }

    fn complete(&mut self, sql: &str, out: &mut BytesMut) {
        let verb = sql
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_ascii_uppercase();
        let tag = match verb.as_str() {
            "SELECT" => "SELECT 1".to_string(),
            "INSERT" => "INSERT 0 1".to_string(),
            "UPDATE" | "DELETE" => format!("{verb} 1"),
            "BEGIN" => {
                self.status = b'T';
                verb
            }
            "COMMIT" if self.status == b'E' => {
                self.status = b'I';
                "ROLLBACK".to_string()
            }
            "COMMIT" | "ROLLBACK" => {
                self.status = b'I';
                verb
            }
            _ => verb,
        };
        out.extend_from_slice(&backend::command_complete(&tag));
    }

    fn simple(&mut self, sql: &str, out: &mut BytesMut) {
        if sql.trim().is_empty() {
            out.extend_from_slice(&backend::empty_query());
        } else if sql.contains("bad") {
            self.fail(sql, out);
        } else {
            if is_select(sql) {
                out.extend_from_slice(&backend::row_description(&[("?column?", 23)]));
                out.extend_from_slice(&backend::data_row(&[Some(&b"1"[..])]));
            }
            self.complete(sql, out);
        }
        out.extend_from_slice(&backend::ready(self.status));
    }

    #[cfg(feature = "scram")]
    fn handle_password(&mut self, body: &[u8], out: &mut BytesMut) {
        use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
        use sha2::{Digest, Sha256};

        use crate::auth::scram::{hi_sha256, hmac_sha256};

        match std::mem::take(&mut self.stage) {
            AuthStage::AwaitSaslInitial => {
                let (_, rest) = frontend::cstr(body);
                let client_first = String::from_utf8_lossy(&rest[4..]).into_owned();
                let bare = client_first.trim_start_matches("n,,").to_string();
                let nonce = bare.split("r=").nth(1).unwrap_or("");
                let server_first = format!(
                    "r={nonce}MOCKSERVER,s={},i={SCRAM_ITERATIONS}",
                    B64.encode(SCRAM_SALT)
                );
                out.extend_from_slice(&backend::auth_sasl_continue(&server_first));
                self.stage = AuthStage::AwaitSaslFinal {
                    client_first_bare: bare,
                    server_first,
                };
            }
            AuthStage::AwaitSaslFinal {
                client_first_bare,
                server_first,
            } => {
                let client_final = String::from_utf8_lossy(body).into_owned();
                let (without_proof, proof) =
                    client_final.split_once(",p=").unwrap_or((client_final.as_str(), ""));
                let auth_message = format!("{client_first_bare},{server_first},{without_proof}");

                let password = self.scram_password.clone().unwrap_or_default();
                let salted = hi_sha256(password.as_bytes(), SCRAM_SALT, SCRAM_ITERATIONS);
                let stored = Sha256::digest(hmac_sha256(&salted, b"Client Key"));
                let signature = hmac_sha256(&stored, auth_message.as_bytes());
                let proof = B64.decode(proof).unwrap_or_default();
                let client_key: Vec<u8> =
                    proof.iter().zip(&signature).map(|(p, s)| p ^ s).collect();

                if proof.len() == signature.len()
                    && Sha256::digest(&client_key).as_slice() == stored.as_slice()
                {
                    let server_key = hmac_sha256(&salted, b"Server Key");
                    let v = B64.encode(hmac_sha256(&server_key, auth_message.as_bytes()));
                    out.extend_from_slice(&backend::auth_sasl_final(&format!("v={v}")));
                    self.finish_startup(out);
                } else {
                    out.extend_from_slice(&backend::error_response(&[
                        (b'S', "FATAL"),
                        (b'C', "28P01"),
                        (b'M', "password authentication failed for user \"alice\""),
                    ]));
                }
            }
            other => self.stage = other,
        }
    }

    #[cfg(not(feature = "scram"))]
    fn handle_password(&mut self, _body: &[u8], _out: &mut BytesMut) {}
}

fn is_select(sql: &str) -> bool {
    sql.trim_start()
        .get(..6)
        .is_some_and(|s| s.eq_ignore_ascii_case("select"))
}

/// [`WsConnector`] handing out [`MockPostgres`] channels and counting
/// connection attempts.
#[derive(Default)]
pub(crate) struct MockConnector {
    pub(crate) template: MockPostgres,
    pub(crate) delay: Option<Duration>,
    /// The first `doomed` connections stop answering after startup.
    pub(crate) doomed: usize,
    pub(crate) refuse: bool,
    pub(crate) connects: AtomicUsize,
    pub(crate) urls: Mutex<Vec<String>>,
    pub(crate) logs: Mutex<Vec<SentLog>>,
    pub(crate) closed: Mutex<Vec<Arc<AtomicBool>>>,
    pub(crate) hang_ups: Mutex<Vec<Arc<AtomicBool>>>,
}

impl MockConnector {
    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }

    /// SQL of every statement sent, across all connections.
    pub(crate) fn statements(&self) -> Vec<String> {
        self.logs
            .lock()
            .unwrap()
            .iter()
            .flat_map(|log| frontend::statements(&log.lock().unwrap()))
            .collect()
    }

    pub(crate) fn bind_params(&self) -> Vec<Vec<Option<String>>> {
        self.logs
            .lock()
            .unwrap()
            .iter()
            .flat_map(|log| frontend::bind_params(&log.lock().unwrap()))
            .collect()
    }

    /// Raw startup message of connection `i`.
    pub(crate) fn startup_message(&self, i: usize) -> Option<Bytes> {
        let logs = self.logs.lock().unwrap();
        let log = logs.get(i)?.lock().unwrap();
        log.first().cloned()
    }

    /// Server side closes every connection handed out so far.
    pub(crate) fn hang_up_all(&self) {
        for flag in self.hang_ups.lock().unwrap().iter() {
            flag.store(true, Ordering::SeqCst);
        }
    }

    /// Number of channels closed via [`Channel::close`].
    pub(crate) fn closed_channels(&self) -> usize {
        self.closed
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.load(Ordering::SeqCst))
            .count()
    }
}

#[async_trait]
impl WsConnector for MockConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Channel>> {
        let n = self.connects.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(url.to_string());
        if self.refuse {
            return Err(NeonError::Connection("connection refused".into()));
        }

        let mut server = self.template.clone();
        if n < self.doomed {
            server.die_after = Some(0);
        }
        let mut chan = MockChannel::postgres(server);
        if let Some(d) = self.delay {
            chan = chan.delay(d);
        }
        self.logs.lock().unwrap().push(chan.sent_log());
        self.closed.lock().unwrap().push(chan.closed_flag());
        self.hang_ups.lock().unwrap().push(chan.hang_up_flag());
        Ok(Box::new(chan))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::WireSession;

    #[tokio::test]
    async fn mock_server_survives_small_chunks() {
        let chan = MockChannel::postgres(MockPostgres::default()).chunk_size(3);
        let mut session = WireSession::new(chan);
        session.startup("alice", "", "neondb", &[]).await.unwrap();
        let res = session.extended_query("SELECT 1", &[]).await.unwrap();
        assert_eq!(res.rows.len(), 1);
    }

    #[tokio::test]
    async fn doomed_connection_goes_silent() {
        let pg = MockPostgres {
            die_after: Some(0),
            ..Default::default()
        };
        let mut session = WireSession::new(MockChannel::postgres(pg));
        session.startup("alice", "", "neondb", &[]).await.unwrap();
        assert!(session.simple_query("SELECT 1").await.unwrap_err().is_connection());
    }
}
