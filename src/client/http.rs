use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::client::{Executor, Statement};
use crate::config::NeonConfig;
use crate::error::{NeonError, Result, ServerError};
use crate::options::{QueryOptions, TransactionOptions};
use crate::result::{FieldInfo, QueryResult, Row};
use crate::types::{TextConverter, TypeConverter, decode_row, oid};

/// Status and body of one HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

/// Performs the POST for [`HttpClient`]. Swap it out to route requests
/// through another HTTP stack or to script responses.
#[async_trait]
pub trait HttpFetch: Send + Sync {
    async fn post(
        &self,
        url: &str,
        body: String,
        headers: &[(&'static str, String)],
    ) -> Result<HttpResponse>;
}

/// [`HttpFetch`] backed by a `reqwest` client.
#[derive(Debug, Clone)]
pub struct ReqwestFetch {
    client: reqwest::Client,
}

impl ReqwestFetch {
    pub fn new(config: &NeonConfig) -> Result<Self> {
        let builder = reqwest::Client::builder().timeout(config.timeout);

        #[cfg(feature = "tls-rustls")]
        let builder = {
            let tls = crate::tls::build_client_config(&config.tls)?;
            builder.use_preconfigured_tls((*tls).clone())
        };

        let client = builder
            .build()
            .map_err(|e| NeonError::Config(format!("build http client: {e}")))?;
        Ok(Self { client })
    }

    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpFetch for ReqwestFetch {
    async fn post(
        &self,
        url: &str,
        body: String,
        headers: &[(&'static str, String)],
    ) -> Result<HttpResponse> {
        let mut req = self.client.post(url).body(body);
        for (name, value) in headers {
            req = req.header(*name, value);
        }

        let resp = req.send().await.map_err(transport_error)?;
        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(transport_error)?;
        Ok(HttpResponse { status, body })
    }
}

fn transport_error(e: reqwest::Error) -> NeonError {
    if e.is_timeout() {
        NeonError::Connection(format!("request timeout: {e}"))
    } else if e.is_builder() {
        NeonError::Config(format!("invalid request: {e}"))
    } else {
        NeonError::Connection(format!("http error: {e}"))
    }
}

/// Stateless client for the SQL-over-HTTP endpoint.
#[derive(Clone)]
pub struct HttpClient {
    config: Arc<NeonConfig>,
    fetch: Arc<dyn HttpFetch>,
    converter: Arc<dyn TypeConverter>,
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("endpoint", &self.config.http_endpoint(self.config.auth_token.is_some()))
            .finish_non_exhaustive()
    }
}

impl HttpClient {
    pub fn new(config: impl Into<Arc<NeonConfig>>) -> Result<Self> {
        let config = config.into();
        let fetch = Arc::new(ReqwestFetch::new(&config)?);
        Ok(Self::with_fetch(config, fetch))
    }

    pub fn with_fetch(config: impl Into<Arc<NeonConfig>>, fetch: Arc<dyn HttpFetch>) -> Self {
        Self {
            config: config.into(),
            fetch,
            converter: Arc::new(TextConverter),
        }
    }

    pub fn with_converter(mut self, converter: Arc<dyn TypeConverter>) -> Self {
        self.converter = converter;
        self
    }

    pub fn config(&self) -> &NeonConfig {
        &self.config
    }

    fn headers(
        &self,
        array_mode: bool,
        token: Option<&str>,
        txn: Option<&TransactionOptions>,
    ) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("Content-Type", "application/json".to_string()),
            (
                "Neon-Connection-String",
                self.config.connection.as_str().to_string(),
            ),
            ("Neon-Raw-Text-Output", "true".to_string()),
            ("Neon-Array-Mode", array_mode.to_string()),
        ];
        if let Some(token) = token {
            headers.push(("Authorization", format!("Bearer {token}")));
        }
        if let Some(txn) = txn {
            headers.push((
                "Neon-Batch-Isolation-Level",
                txn.isolation_level().as_header().to_string(),
            ));
            headers.push(("Neon-Batch-Read-Only", txn.read_only().to_string()));
            headers.push(("Neon-Batch-Deferrable", txn.deferrable().to_string()));
        }
        headers
    }

    fn token<'a>(&'a self, opts: &'a QueryOptions) -> Option<&'a str> {
        opts.auth_token
            .as_deref()
            .or(self.config.auth_token.as_deref())
    }

    fn encode_query(&self, sql: &str, params: &[Value]) -> Result<Value> {
        let params = self.converter.encode_params(params)?;
        Ok(json!({ "query": sql, "params": params }))
    }

    async fn request(&self, body: &Value, headers: &[(&'static str, String)]) -> Result<Value> {
        let bearer = headers.iter().any(|(name, _)| *name == "Authorization");
        let url = self.config.http_endpoint(bearer);

        let resp = self.fetch.post(&url, body.to_string(), headers).await?;
        tracing::debug!(%url, status = resp.status, bytes = resp.body.len(), "sql-over-http response");
        match resp.status {
            200 => {}
            401 => {
                return Err(NeonError::Auth(
                    "authentication failed; check the connection string credentials".into(),
                ));
            }
            403 => {
                return Err(NeonError::Auth(
                    "authorization failed; check the auth token or permissions".into(),
                ));
            }
            status => {
                return Err(NeonError::Http {
                    status,
                    body: resp.body,
                });
            }
        }

        serde_json::from_str(&resp.body)
            .map_err(|e| NeonError::Decode(format!("invalid JSON response: {e}")))
    }

    fn parse_result(&self, resp: &Value, opts: &QueryOptions) -> Result<QueryResult> {
        let obj = resp
            .as_object()
            .ok_or_else(|| NeonError::Decode(format!("expected a JSON object, got {resp}")))?;

        if obj.contains_key("error") || obj.contains_key("message") {
            return Err(server_error(obj).into());
        }

        let fields: Vec<FieldInfo> = match obj.get("fields") {
            Some(f) if !f.is_null() => serde_json::from_value(f.clone())?,
            _ => Vec::new(),
        };
        let row_as_array = obj
            .get("rowAsArray")
            .and_then(Value::as_bool)
            .unwrap_or(opts.array_mode);

        let rows = match obj.get("rows").and_then(Value::as_array) {
            Some(rows) => rows
                .iter()
                .map(|row| self.decode_row(row, &fields, row_as_array))
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };

        let mut result = QueryResult {
            row_count: obj.get("rowCount").and_then(Value::as_u64),
            rows,
            fields,
            command: obj
                .get("command")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            row_as_array,
        };
        if !opts.full_results {
            result.fields.clear();
            result.command.clear();
        }
        Ok(result)
    }

    fn decode_row(&self, row: &Value, fields: &[FieldInfo], array_mode: bool) -> Result<Row> {
        let mut names: Vec<String> = fields.iter().map(|f| f.name.clone()).collect();
        let mut type_ids: Vec<u32> = fields.iter().map(|f| f.data_type_id).collect();

        let raw: Vec<Option<String>> = match row {
            Value::Array(values) => values.iter().map(raw_text).collect(),
            Value::Object(map) if fields.is_empty() => {
                names = map.keys().cloned().collect();
                type_ids = vec![oid::TEXT; names.len()];
                map.values().map(raw_text).collect()
            }
            Value::Object(map) => names
                .iter()
                .map(|n| map.get(n).and_then(raw_text))
                .collect(),
            other => {
                return Err(NeonError::Decode(format!(
                    "expected a row array or object, got {other}"
                )));
            }
        };

        let values = decode_row(self.converter.as_ref(), &type_ids, raw)?;
        Ok(Row::build(&names, values, array_mode))
    }
}

/// Raw text of one cell; numbers and booleans appear when raw text output is
/// not honoured.
fn raw_text(v: &Value) -> Option<String> {
    match v {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn server_error(obj: &Map<String, Value>) -> ServerError {
    let field = |name: &str| obj.get(name).and_then(Value::as_str).map(str::to_string);
    ServerError {
        message: field("message")
            .or_else(|| field("error"))
            .unwrap_or_else(|| "unknown error".to_string()),
        code: field("code"),
        detail: field("detail"),
        hint: field("hint"),
        severity: field("severity"),
        position: field("position"),
    }
}

#[async_trait]
impl Executor for HttpClient {
    async fn query(&self, sql: &str, params: &[Value], opts: &QueryOptions) -> Result<QueryResult> {
        let body = self.encode_query(sql, params)?;
        let headers = self.headers(opts.array_mode, self.token(opts), None);
        let resp = self.request(&body, &headers).await?;
        self.parse_result(&resp, opts)
    }

    async fn transaction(
        &self,
        statements: &[Statement],
        opts: &TransactionOptions,
    ) -> Result<Vec<QueryResult>> {
        let queries = statements
            .iter()
            .map(|s| self.encode_query(&s.sql, &s.params))
            .collect::<Result<Vec<_>>>()?;
        let body = json!({ "queries": queries });

        let qopts = opts.query_options();
        let headers = self.headers(qopts.array_mode, self.token(qopts), Some(opts));
        let resp = self.request(&body, &headers).await?;

        let results = match &resp {
            Value::Object(obj) if obj.contains_key("results") => obj
                .get("results")
                .and_then(Value::as_array)
                .ok_or_else(|| {
                    NeonError::transaction(NeonError::Decode("`results` is not an array".into()))
                })?,
            Value::Object(obj) if obj.contains_key("error") || obj.contains_key("message") => {
                return Err(NeonError::transaction(server_error(obj).into()));
            }
            Value::Array(items) => items,
            other => {
                return Err(NeonError::transaction(NeonError::Decode(format!(
                    "unexpected transaction response format: {other}"
                ))));
            }
        };

        results
            .iter()
            .map(|r| self.parse_result(r, qopts))
            .collect()
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
