use std::collections::HashMap;

use bytes::{Bytes, BytesMut};

use crate::error::{NeonError, Result};
use crate::protocol::channel::Channel;
use crate::protocol::framing::{
    FrameReader, encode_bind, encode_describe_portal, encode_execute, encode_parse,
    encode_password, encode_query, encode_startup, encode_sync, encode_terminate,
};
use crate::protocol::messages::{
    AuthRequest, BackendKeyData, BackendMessage, ErrorFields, TransactionStatus,
};
use crate::result::ProtocolQueryResult;

/// Client side of one PostgreSQL v3 session over a [`Channel`].
///
/// Every exchange runs to ReadyForQuery before returning, including the
/// failing ones, so the session stays usable after a query error. Connection
/// errors leave it in an unknown state; callers should drop it.
pub struct WireSession<C> {
    reader: FrameReader<C>,
    server_params: HashMap<String, String>,
    backend_key: Option<BackendKeyData>,
    txn_status: TransactionStatus,
    notices: Vec<ErrorFields>,
}

impl<C: Channel> WireSession<C> {
    pub fn new(channel: C) -> Self {
        Self {
            reader: FrameReader::new(channel),
            server_params: HashMap::new(),
            backend_key: None,
            txn_status: TransactionStatus::Idle,
            notices: Vec::new(),
        }
    }

    pub fn server_params(&self) -> &HashMap<String, String> {
        &self.server_params
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.txn_status
    }

    pub fn backend_key(&self) -> Option<BackendKeyData> {
        self.backend_key
    }

    pub fn notices(&self) -> &[ErrorFields] {
        &self.notices
    }

    pub fn take_notices(&mut self) -> Vec<ErrorFields> {
        std::mem::take(&mut self.notices)
    }

    pub fn channel_mut(&mut self) -> &mut C {
        self.reader.get_mut()
    }

    pub fn into_inner(self) -> C {
        self.reader.into_inner()
    }

    async fn send(&mut self, buf: BytesMut) -> Result<()> {
        self.reader.get_mut().send(buf.freeze()).await
    }

    async fn recv(&mut self) -> Result<BackendMessage> {
        let raw = self.reader.read_message().await?;
        BackendMessage::parse(raw)
    }

    fn push_notice(&mut self, notice: ErrorFields) {
        tracing::debug!(
            severity = notice.severity().unwrap_or(""),
            code = notice.code().unwrap_or(""),
            "server notice: {}",
            notice.message().unwrap_or("")
        );
        self.notices.push(notice);
    }

    /// Send the startup message, authenticate, and read until the first
    /// ReadyForQuery. Returns the server parameters reported on the way.
    pub async fn startup(
        &mut self,
        user: &str,
        password: &str,
        database: &str,
        extra_params: &[(&str, &str)],
    ) -> Result<HashMap<String, String>> {
        let mut buf = BytesMut::new();
        encode_startup(&mut buf, user, database, extra_params);
        self.send(buf).await?;

        self.authenticate(user, password).await?;

        loop {
            match self.recv().await? {
                BackendMessage::ParameterStatus { name, value } => {
                    self.server_params.insert(name, value);
                }
                BackendMessage::BackendKeyData(key) => self.backend_key = Some(key),
                BackendMessage::NoticeResponse(n) => self.push_notice(n),
                BackendMessage::ReadyForQuery(status) => {
                    self.txn_status = status;
                    break;
                }
                BackendMessage::ErrorResponse(e) => {
                    return Err(NeonError::Auth(e.into_server_error().to_string()));
                }
                other => {
                    return Err(NeonError::protocol(format!(
                        "unexpected {} during startup",
                        other.name()
                    )));
                }
            }
        }

        tracing::debug!(
            server_version = self.server_params.get("server_version").map(String::as_str),
            "wire session ready"
        );
        Ok(self.server_params.clone())
    }

    /// Next authentication request. Notices are collected on the way; an
    /// ErrorResponse is an authentication failure.
    async fn recv_auth(&mut self) -> Result<AuthRequest> {
        loop {
            match self.recv().await? {
                BackendMessage::Authentication(req) => return Ok(req),
                BackendMessage::NoticeResponse(n) => self.push_notice(n),
                BackendMessage::ErrorResponse(e) => {
                    return Err(NeonError::Auth(e.into_server_error().to_string()));
                }
                other => {
                    return Err(NeonError::protocol(format!(
                        "unexpected {} during authentication",
                        other.name()
                    )));
                }
            }
        }
    }

    async fn authenticate(&mut self, user: &str, password: &str) -> Result<()> {
        loop {
            match self.recv_auth().await? {
                AuthRequest::Ok => return Ok(()),
                AuthRequest::CleartextPassword => {
                    let mut buf = BytesMut::new();
                    encode_password(&mut buf, password);
                    self.send(buf).await?;
                }
                AuthRequest::Md5Password { salt } => {
                    self.auth_md5(user, password, &salt).await?;
                }
                AuthRequest::Sasl { mechanisms } => {
                    self.auth_scram(&mechanisms, password).await?;
                }
                AuthRequest::SaslContinue(_) | AuthRequest::SaslFinal(_) => {
                    return Err(NeonError::Auth(
                        "SASL message received outside a SASL exchange".into(),
                    ));
                }
                AuthRequest::Unsupported(code) => {
                    return Err(NeonError::Auth(format!(
                        "unsupported authentication method: {code}"
                    )));
                }
            }
        }
    }

    #[cfg(feature = "md5")]
    async fn auth_md5(&mut self, user: &str, password: &str, salt: &[u8; 4]) -> Result<()> {
        let hashed = crate::auth::md5::md5_password(user, password, salt);
        let mut buf = BytesMut::new();
        encode_password(&mut buf, &hashed);
        self.send(buf).await
    }

    #[cfg(not(feature = "md5"))]
    async fn auth_md5(&mut self, _user: &str, _password: &str, _salt: &[u8; 4]) -> Result<()> {
        Err(NeonError::Auth("md5 feature disabled".into()))
    }

    async fn auth_scram(&mut self, mechanisms: &[String], password: &str) -> Result<()> {
        use crate::auth::scram::MECHANISM;

        if !mechanisms.iter().any(|m| m == MECHANISM) {
            return Err(NeonError::Auth(format!(
                "server does not offer {MECHANISM}: {mechanisms:?}"
            )));
        }

        #[cfg(not(feature = "scram"))]
        {
            let _ = password;
            return Err(NeonError::Auth("SCRAM feature disabled".into()));
        }

        #[cfg(feature = "scram")]
        {
            use crate::auth::scram::ScramSha256;
            use crate::protocol::framing::{encode_sasl_initial_response, encode_sasl_response};

            let mut scram = ScramSha256::new(password);
            let mut buf = BytesMut::new();
            encode_sasl_initial_response(&mut buf, MECHANISM, scram.client_first().as_bytes());
            self.send(buf).await?;

            let server_first = match self.recv_auth().await? {
                AuthRequest::SaslContinue(data) => utf8(data)?,
                other => {
                    return Err(NeonError::Auth(format!(
                        "expected SASL continue, got {other:?}"
                    )));
                }
            };

            // PBKDF2 with thousands of rounds; keep it off the async workers.
            let (mut scram, client_final) = tokio::task::spawn_blocking(move || {
                let out = scram.process_server_first(&server_first);
                (scram, out)
            })
            .await
            .map_err(|e| NeonError::Auth(format!("SCRAM key derivation failed: {e}")))?;
            let client_final = client_final?;

            let mut buf = BytesMut::new();
            encode_sasl_response(&mut buf, client_final.as_bytes());
            self.send(buf).await?;

            match self.recv_auth().await? {
                AuthRequest::SaslFinal(data) => scram.verify_server_final(&utf8(data)?),
                other => Err(NeonError::Auth(format!(
                    "expected SASL final, got {other:?}"
                ))),
            }
        }
    }

    /// Run `sql` with the simple query protocol. Returns one result per
    /// statement; an empty query string yields one empty result.
    pub async fn simple_query(&mut self, sql: &str) -> Result<Vec<ProtocolQueryResult>> {
        let mut buf = BytesMut::new();
        encode_query(&mut buf, sql);
        self.send(buf).await?;

        let mut results = Vec::new();
        let mut current = ProtocolQueryResult::default();

        loop {
            match self.recv().await? {
                BackendMessage::RowDescription(fields) => current.fields = fields,
                BackendMessage::DataRow(row) => current.rows.push(row),
                BackendMessage::CommandComplete(tag) => {
                    current.command_tag = tag;
                    results.push(std::mem::take(&mut current));
                }
                BackendMessage::EmptyQueryResponse => {
                    results.push(std::mem::take(&mut current));
                }
                BackendMessage::ErrorResponse(e) => return Err(self.fail_query(e).await),
                BackendMessage::ReadyForQuery(status) => {
                    self.txn_status = status;
                    return Ok(results);
                }
                other => self.handle_async(other)?,
            }
        }
    }

    /// Run one statement through Parse/Bind/Describe/Execute/Sync on the
    /// unnamed statement and portal, all in a single write.
    pub async fn extended_query(
        &mut self,
        sql: &str,
        params: &[Option<Bytes>],
    ) -> Result<ProtocolQueryResult> {
        let mut buf = BytesMut::new();
        encode_parse(&mut buf, sql, params.len())?;
        encode_bind(&mut buf, params)?;
        encode_describe_portal(&mut buf);
        encode_execute(&mut buf);
        encode_sync(&mut buf);
        self.send(buf).await?;

        let mut result = ProtocolQueryResult::default();

        loop {
            match self.recv().await? {
                BackendMessage::ParseComplete
                | BackendMessage::BindComplete
                | BackendMessage::NoData
                | BackendMessage::EmptyQueryResponse => {}
                BackendMessage::RowDescription(fields) => result.fields = fields,
                BackendMessage::DataRow(row) => result.rows.push(row),
                BackendMessage::CommandComplete(tag) => result.command_tag = tag,
                BackendMessage::ErrorResponse(e) => return Err(self.fail_query(e).await),
                BackendMessage::ReadyForQuery(status) => {
                    self.txn_status = status;
                    return Ok(result);
                }
                other => self.handle_async(other)?,
            }
        }
    }

    /// Messages the server may send at any time. Anything else is a
    /// protocol violation.
    fn handle_async(&mut self, msg: BackendMessage) -> Result<()> {
        match msg {
            BackendMessage::NoticeResponse(n) => {
                self.push_notice(n);
                Ok(())
            }
            BackendMessage::ParameterStatus { name, value } => {
                self.server_params.insert(name, value);
                Ok(())
            }
            other => Err(NeonError::protocol(format!(
                "unexpected {} during query",
                other.name()
            ))),
        }
    }

    /// Drain to ReadyForQuery after an ErrorResponse. A failed drain wins
    /// over the query error.
    async fn fail_query(&mut self, error: ErrorFields) -> NeonError {
        loop {
            match self.recv().await {
                Ok(BackendMessage::ReadyForQuery(status)) => {
                    self.txn_status = status;
                    return error.into_server_error().into();
                }
                Ok(BackendMessage::NoticeResponse(n)) => self.push_notice(n),
                Ok(_) => {}
                Err(e) => return e,
            }
        }
    }

    /// Send Terminate and close the channel. Failures are logged and
    /// otherwise ignored.
    pub async fn terminate(&mut self) {
        let mut buf = BytesMut::new();
        encode_terminate(&mut buf);
        if let Err(e) = self.send(buf).await {
            tracing::debug!("terminate not delivered: {e}");
        }
        if let Err(e) = self.reader.get_mut().close().await {
            tracing::debug!("channel close failed: {e}");
        }
    }
}

#[cfg(feature = "scram")]
fn utf8(data: Bytes) -> Result<String> {
    String::from_utf8(data.to_vec())
        .map_err(|e| NeonError::Auth(format!("SCRAM message is not UTF-8: {e}")))
}
