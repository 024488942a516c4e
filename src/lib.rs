#![warn(
    clippy::all,
    clippy::cargo,
    clippy::perf,
    clippy::style,
    clippy::correctness,
    clippy::suspicious
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::multiple_crate_versions
)]

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod options;
pub mod protocol;
pub mod result;
pub mod tls;
pub mod types;

#[cfg(test)]
mod testing;

pub use client::{
    Executor, HttpClient, NeonClient, PoolStatus, PooledClient, Statement, Transport, WsClient,
    WsPool,
};
pub use config::{ConnectionString, FetchEndpoint, NeonConfig, TlsConfig, WsProxy};
pub use error::{NeonError, Result, ServerError};
pub use options::{IsolationLevel, QueryOptions, TransactionOptions};
pub use result::{FieldInfo, QueryResult, Row};
pub use types::{TextConverter, TypeConverter};
