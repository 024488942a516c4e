use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{FutureExt, Sink, SinkExt, Stream, StreamExt};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;

use crate::client::{Executor, Statement};
use crate::config::NeonConfig;
use crate::error::{NeonError, Result, ServerError};
use crate::options::{QueryOptions, TransactionOptions};
use crate::protocol::{Channel, TransactionStatus, WireSession};
use crate::result::{FieldInfo, ProtocolQueryResult, QueryResult, Row};
use crate::types::{TextConverter, TypeConverter, decode_row};

/// WebSocket subprotocol spoken by the Neon proxy.
pub const SUBPROTOCOL: &str = "neon-v2";

type Session = WireSession<Box<dyn Channel>>;

/// Opens the byte channel a [`WsClient`] runs its session over.
#[async_trait]
pub trait WsConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn Channel>>;
}

/// [`WsConnector`] over `tokio-tungstenite`.
#[derive(Clone)]
pub struct TungsteniteConnector {
    heartbeat: Option<Duration>,
    #[cfg(feature = "tls-rustls")]
    tls: Arc<rustls::ClientConfig>,
}

impl std::fmt::Debug for TungsteniteConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TungsteniteConnector")
            .field("heartbeat", &self.heartbeat)
            .finish_non_exhaustive()
    }
}

impl TungsteniteConnector {
    pub fn new(config: &NeonConfig) -> Result<Self> {
        Ok(Self {
            heartbeat: config.heartbeat,
            #[cfg(feature = "tls-rustls")]
            tls: crate::tls::build_client_config(&config.tls)?,
        })
    }
}

#[async_trait]
impl WsConnector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Channel>> {
        let mut request = url
            .into_client_request()
            .map_err(|e| NeonError::Config(format!("invalid websocket url {url}: {e}")))?;
        request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));

        #[cfg(feature = "tls-rustls")]
        let connector = Some(tokio_tungstenite::Connector::Rustls(self.tls.clone()));
        #[cfg(not(feature = "tls-rustls"))]
        let connector = None;

        let (stream, response) =
            tokio_tungstenite::connect_async_tls_with_config(request, None, true, connector)
                .await
                .map_err(ws_error)?;
        tracing::debug!(url, status = response.status().as_u16(), "websocket connected");

        Ok(Box::new(WsChannel::new(stream, self.heartbeat)))
    }
}

fn ws_error(e: WsError) -> NeonError {
    match e {
        WsError::Url(e) => NeonError::Config(format!("invalid websocket url: {e}")),
        WsError::Http(resp) => NeonError::Connection(format!(
            "websocket upgrade rejected with HTTP {}",
            resp.status()
        )),
        other => NeonError::Connection(format!("websocket error: {other}")),
    }
}

/// Binary WebSocket frames as a [`Channel`].
///
/// With a heartbeat configured, a receive that sees no frame for one
/// interval sends a Ping; a second silent interval fails the receive.
struct WsChannel<S> {
    stream: S,
    heartbeat: Option<Duration>,
    /// Frames picked up by [`Channel::is_open`] before anyone asked.
    pending: VecDeque<Bytes>,
    peer_closed: bool,
}

impl<S> WsChannel<S> {
    fn new(stream: S, heartbeat: Option<Duration>) -> Self {
        Self {
            stream,
            heartbeat,
            pending: VecDeque::new(),
            peer_closed: false,
        }
    }
}

enum Incoming {
    Data(Bytes),
    Closed,
    Control,
    Failed(WsError),
}

fn classify(next: Option<std::result::Result<Message, WsError>>) -> Incoming {
    match next {
        Some(Ok(Message::Binary(data))) if !data.is_empty() => Incoming::Data(data),
        Some(Ok(Message::Text(text))) if !text.is_empty() => {
            Incoming::Data(Bytes::copy_from_slice(text.as_str().as_bytes()))
        }
        Some(Ok(Message::Close(frame))) => {
            tracing::debug!(?frame, "websocket closed by server");
            Incoming::Closed
        }
        Some(Ok(_)) => Incoming::Control,
        Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => Incoming::Closed,
        Some(Err(e)) => Incoming::Failed(e),
    }
}

#[async_trait]
impl<S> Channel for WsChannel<S>
where
    S: Stream<Item = std::result::Result<Message, WsError>>
        + Sink<Message, Error = WsError>
        + Unpin
        + Send,
{
    async fn send(&mut self, data: Bytes) -> Result<()> {
        self.stream.send(Message::Binary(data)).await.map_err(ws_error)
    }

    async fn recv(&mut self) -> Result<Bytes> {
        if let Some(data) = self.pending.pop_front() {
            return Ok(data);
        }
        if self.peer_closed {
            return Ok(Bytes::new());
        }

        let mut pinged = false;
        loop {
            let next = match self.heartbeat {
                None => self.stream.next().await,
                Some(interval) => match tokio::time::timeout(interval, self.stream.next()).await {
                    Ok(next) => next,
                    Err(_) if pinged => {
                        return Err(NeonError::Connection(format!(
                            "no frame from server within {interval:?} of a ping"
                        )));
                    }
                    Err(_) => {
                        self.stream
                            .send(Message::Ping(Bytes::new()))
                            .await
                            .map_err(ws_error)?;
                        pinged = true;
                        continue;
                    }
                },
            };
            pinged = false;

            match classify(next) {
                Incoming::Data(data) => return Ok(data),
                Incoming::Closed => {
                    self.peer_closed = true;
                    return Ok(Bytes::new());
                }
                Incoming::Control => {}
                Incoming::Failed(e) => return Err(ws_error(e)),
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        match self.stream.close().await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(ws_error(e)),
        }
    }

    fn is_open(&mut self) -> bool {
        while !self.peer_closed {
            let Some(next) = self.stream.next().now_or_never() else {
                break;
            };
            match classify(next) {
                Incoming::Data(data) => self.pending.push_back(data),
                Incoming::Closed => self.peer_closed = true,
                Incoming::Control => {}
                Incoming::Failed(e) => {
                    tracing::debug!("websocket failed while idle: {e}");
                    self.peer_closed = true;
                }
            }
        }
        !self.peer_closed
    }
}

/// One wire session over a WebSocket, opened on first use.
///
/// Calls are serialised. A connection error discards the session and marks
/// the client broken; the next call reconnects. So does a call dropped
/// before its reply was read, or a socket the server closed while idle.
pub struct WsClient {
    config: Arc<NeonConfig>,
    url: String,
    connector: Arc<dyn WsConnector>,
    converter: Arc<dyn TypeConverter>,
    session: Mutex<Option<Session>>,
    broken: AtomicBool,
}

impl std::fmt::Debug for WsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsClient")
            .field("url", &self.url)
            .field("broken", &self.is_broken())
            .finish_non_exhaustive()
    }
}

impl WsClient {
    pub fn new(config: impl Into<Arc<NeonConfig>>) -> Result<Self> {
        let config = config.into();
        let connector = Arc::new(TungsteniteConnector::new(&config)?);
        Ok(Self::with_connector(config, connector))
    }

    pub fn with_connector(
        config: impl Into<Arc<NeonConfig>>,
        connector: Arc<dyn WsConnector>,
    ) -> Self {
        let config = config.into();
        Self {
            url: config.ws_url(),
            config,
            connector,
            converter: Arc::new(TextConverter),
            session: Mutex::new(None),
            broken: AtomicBool::new(false),
        }
    }

    pub fn with_converter(mut self, converter: Arc<dyn TypeConverter>) -> Self {
        self.converter = converter;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// True after a connection error, until a reconnect succeeds.
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    /// Terminate the session and close the socket.
    pub async fn close(&self) {
        if let Some(mut session) = self.session.lock().await.take() {
            session.terminate().await;
        }
    }

    /// Close the socket without saying goodbye.
    pub async fn force_close(&self) {
        if let Some(mut session) = self.session.lock().await.take() {
            if let Err(e) = session.channel_mut().close().await {
                tracing::debug!("websocket close failed: {e}");
            }
        }
    }

    async fn connect(&self) -> Result<Session> {
        let conn = &self.config.connection;
        let mut params: Vec<(&str, &str)> = vec![
            ("client_encoding", "UTF8"),
            ("application_name", self.config.application_name.as_str()),
        ];
        params.retain(|(k, _)| !conn.params.iter().any(|(p, _)| p.as_str() == *k));
        params.extend(conn.params.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        let open = async {
            let channel = self.connector.connect(&self.url).await?;
            let mut session = WireSession::new(channel);
            session
                .startup(&conn.user, &conn.password, &conn.database, &params)
                .await?;
            Ok::<_, NeonError>(session)
        };

        let session = tokio::time::timeout(self.config.timeout, open)
            .await
            .map_err(|_| {
                NeonError::Connection(format!(
                    "connect to {} timed out after {:?}",
                    self.url, self.config.timeout
                ))
            })??;
        self.broken.store(false, Ordering::SeqCst);
        tracing::debug!(url = %self.url, "websocket session established");
        Ok(session)
    }

    /// Take the session out of `slot` for one exchange, reconnecting if
    /// there is none or the server hung up on it while idle.
    ///
    /// The slot stays empty until [`put_back`](Self::put_back). A call that
    /// is cancelled mid-exchange drops its session, so no half-read reply is
    /// ever handed to the next caller.
    async fn checkout(&self, slot: &mut Option<Session>) -> Result<Session> {
        if let Some(mut session) = slot.take() {
            if session.channel_mut().is_open() {
                return Ok(session);
            }
            tracing::debug!(url = %self.url, "server closed idle websocket; reconnecting");
            if let Err(e) = session.channel_mut().close().await {
                tracing::debug!("websocket close failed: {e}");
            }
        }

        match self.connect().await {
            Ok(session) => Ok(session),
            Err(e) => {
                if e.is_connection() {
                    self.broken.store(true, Ordering::SeqCst);
                }
                Err(e)
            }
        }
    }

    /// Return `session` to `slot`, unless `err` left it unusable or
    /// mid-transaction.
    async fn put_back(
        &self,
        slot: &mut Option<Session>,
        mut session: Session,
        err: Option<&NeonError>,
    ) {
        let Some(err) = err else {
            *slot = Some(session);
            return;
        };
        if !err.is_connection() && session.transaction_status() == TransactionStatus::Idle {
            *slot = Some(session);
            return;
        }

        self.broken.store(true, Ordering::SeqCst);
        tracing::warn!(url = %self.url, "discarding websocket session: {err}");
        if let Err(e) = session.channel_mut().close().await {
            tracing::debug!("websocket close failed: {e}");
        }
    }

    fn encode_params(&self, params: &[Value]) -> Result<Vec<Option<Bytes>>> {
        Ok(self
            .converter
            .encode_params(params)?
            .into_iter()
            .map(|p| p.map(Bytes::from))
            .collect())
    }

    fn to_result(&self, raw: ProtocolQueryResult, opts: &QueryOptions) -> Result<QueryResult> {
        let names: Vec<String> = raw.fields.iter().map(|f| f.name.clone()).collect();
        let type_ids: Vec<u32> = raw.fields.iter().map(|f| f.type_id).collect();
        let command = raw.command().to_string();
        let affected = raw.affected_rows();
        let fields: Vec<FieldInfo> = raw.fields.iter().map(FieldInfo::from).collect();

        let rows = raw
            .rows
            .into_iter()
            .map(|row| {
                let text = row
                    .into_iter()
                    .map(|cell| cell.map(utf8).transpose())
                    .collect::<Result<Vec<_>>>()?;
                let values = decode_row(self.converter.as_ref(), &type_ids, text)?;
                Ok(Row::build(&names, values, opts.array_mode))
            })
            .collect::<Result<Vec<_>>>()?;

        let full = opts.full_results;
        Ok(QueryResult {
            row_count: Some(affected.unwrap_or(rows.len() as u64)),
            rows,
            fields: if full { fields } else { Vec::new() },
            command: if full { command } else { String::new() },
            row_as_array: opts.array_mode,
        })
    }
}

fn utf8(b: Bytes) -> Result<String> {
    String::from_utf8(b.to_vec()).map_err(|e| NeonError::Decode(format!("column is not UTF-8: {e}")))
}

/// BEGIN, each statement, COMMIT. A server error rolls back and comes back
/// wrapped as a transaction error.
async fn run_transaction(
    session: &mut Session,
    begin: &str,
    statements: &[(&str, Vec<Option<Bytes>>)],
) -> Result<Vec<ProtocolQueryResult>> {
    let body = async {
        session.simple_query(begin).await?;
        let mut results = Vec::with_capacity(statements.len());
        for (sql, params) in statements {
            results.push(session.extended_query(sql, params).await?);
        }
        let commit = session.simple_query("COMMIT").await?;
        if commit.first().is_some_and(|r| r.command() == "ROLLBACK") {
            return Err(NeonError::transaction(
                ServerError {
                    message: "server rolled back the transaction at COMMIT".into(),
                    ..Default::default()
                }
                .into(),
            ));
        }
        Ok::<_, NeonError>(results)
    }
    .await;

    match body {
        Err(e) if e.is_query() => {
            if let Err(rb) = session.simple_query("ROLLBACK").await {
                tracing::warn!("rollback after failed statement did not complete: {rb}");
            }
            Err(NeonError::transaction(e))
        }
        other => other,
    }
}

#[async_trait]
impl Executor for WsClient {
    async fn query(&self, sql: &str, params: &[Value], opts: &QueryOptions) -> Result<QueryResult> {
        let params = self.encode_params(params)?;
        let mut slot = self.session.lock().await;

        let mut session = self.checkout(&mut slot).await?;
        let outcome = session.extended_query(sql, &params).await;
        self.put_back(&mut slot, session, outcome.as_ref().err()).await;

        self.to_result(outcome?, opts)
    }

    async fn transaction(
        &self,
        statements: &[Statement],
        opts: &TransactionOptions,
    ) -> Result<Vec<QueryResult>> {
        let encoded = statements
            .iter()
            .map(|s| Ok((s.sql.as_str(), self.encode_params(&s.params)?)))
            .collect::<Result<Vec<_>>>()?;
        let begin = opts.begin_sql();
        let mut slot = self.session.lock().await;

        let mut session = self.checkout(&mut slot).await?;
        let outcome = run_transaction(&mut session, &begin, &encoded).await;
        self.put_back(&mut slot, session, outcome.as_ref().err()).await;

        outcome?
            .into_iter()
            .map(|r| self.to_result(r, opts.query_options()))
            .collect()
    }

    async fn close(&self) -> Result<()> {
        WsClient::close(self).await;
        Ok(())
    }
}
