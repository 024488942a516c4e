//! Error types for pgwire-serverless.
//!
//! All errors in this crate are represented by [`NeonError`], which covers:
//! - Configuration errors (bad connection string, invalid option combinations)
//! - Connection errors (closed socket, timeout, protocol desynchronisation)
//! - Authentication errors (rejected credentials, unsupported method, SCRAM failure)
//! - Query errors (PostgreSQL error responses)
//! - Transaction errors (a statement in a batch failed)
//! - HTTP errors (non-200 status from the SQL-over-HTTP endpoint)
//! - Decode errors (malformed JSON or values the converter cannot read)

use std::fmt;

use thiserror::Error;

/// Error type for all pgwire-serverless operations.
#[derive(Debug, Error, Clone)]
pub enum NeonError {
    /// Configuration error, detected before any I/O is attempted.
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport-level failure.
    ///
    /// Note: `std::io::Error` is not `Clone`, so we store the message.
    #[error("connection error: {0}")]
    Connection(String),

    /// Authentication error - wrong credentials or unsupported method.
    #[error("authentication error: {0}")]
    Auth(String),

    /// The server rejected a statement.
    #[error("query error: {0}")]
    Query(Box<ServerError>),

    /// A multi-statement batch failed; `source` is the underlying error.
    #[error("transaction error: {message}")]
    Transaction {
        message: String,
        #[source]
        source: Box<NeonError>,
    },

    /// Non-200 HTTP response with no more specific classification.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Response body or value could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
}

impl NeonError {
    pub(crate) fn protocol(msg: impl fmt::Display) -> Self {
        NeonError::Connection(format!("protocol violation: {msg}"))
    }

    pub(crate) fn transaction(source: NeonError) -> Self {
        NeonError::Transaction {
            message: source.to_string(),
            source: Box::new(source),
        }
    }

    /// Returns `true` if this is a configuration error.
    #[inline]
    pub fn is_config(&self) -> bool {
        matches!(self, NeonError::Config(_))
    }

    /// Returns `true` if this is a connection error.
    #[inline]
    pub fn is_connection(&self) -> bool {
        matches!(self, NeonError::Connection(_))
    }

    /// Returns `true` if this is an authentication error.
    #[inline]
    pub fn is_auth(&self) -> bool {
        matches!(self, NeonError::Auth(_))
    }

    /// Returns `true` if this is a query error.
    #[inline]
    pub fn is_query(&self) -> bool {
        matches!(self, NeonError::Query(_))
    }

    /// Returns `true` if this is a transaction error.
    #[inline]
    pub fn is_transaction(&self) -> bool {
        matches!(self, NeonError::Transaction { .. })
    }

    /// Server-side error details, if this error (or the error it wraps) came
    /// from an ErrorResponse.
    pub fn server_error(&self) -> Option<&ServerError> {
        match self {
            NeonError::Query(e) => Some(e),
            NeonError::Transaction { source, .. } => source.server_error(),
            _ => None,
        }
    }

    /// Returns `true` if this error is likely transient and retryable.
    ///
    /// Only connection errors qualify. Authentication errors are never
    /// retried automatically.
    pub fn is_transient(&self) -> bool {
        matches!(self, NeonError::Connection(_))
    }
}

/// Fields of a PostgreSQL ErrorResponse that callers usually care about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerError {
    pub message: String,
    pub code: Option<String>,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub severity: Option<String>,
    pub position: Option<String>,
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        if let Some(code) = &self.code {
            write!(f, " (SQLSTATE {code})")?;
        }
        Ok(())
    }
}

impl From<ServerError> for NeonError {
    fn from(err: ServerError) -> Self {
        NeonError::Query(Box::new(err))
    }
}

// Manual From impl since io::Error isn't Clone
impl From<std::io::Error> for NeonError {
    fn from(err: std::io::Error) -> Self {
        NeonError::Connection(err.to_string())
    }
}

impl From<serde_json::Error> for NeonError {
    fn from(err: serde_json::Error) -> Self {
        NeonError::Decode(err.to_string())
    }
}

/// Result type alias for pgwire-serverless operations.
pub type Result<T> = std::result::Result<T, NeonError>;
