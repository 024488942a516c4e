use std::fmt;

use crate::error::{NeonError, Result};

/// Per-call query options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOptions {
    /// Rows as positional arrays instead of name-keyed objects.
    pub array_mode: bool,
    /// Populate `fields` and `command` in the result. On by default.
    pub full_results: bool,
    /// Bearer token for this call, overriding the configured one (HTTP only).
    pub auth_token: Option<String>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            array_mode: false,
            full_results: true,
            auth_token: None,
        }
    }
}

impl QueryOptions {
    pub fn array_mode(mut self, on: bool) -> Self {
        self.array_mode = on;
        self
    }

    pub fn full_results(mut self, on: bool) -> Self {
        self.full_results = on;
        self
    }

    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// SQL spelling, as used after `BEGIN ISOLATION LEVEL`.
    pub fn as_sql(self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }

    /// Value of the `Neon-Batch-Isolation-Level` header.
    pub fn as_header(self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "ReadUncommitted",
            IsolationLevel::ReadCommitted => "ReadCommitted",
            IsolationLevel::RepeatableRead => "RepeatableRead",
            IsolationLevel::Serializable => "Serializable",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Options for a multi-statement transaction.
///
/// `deferrable` is only accepted together with `Serializable` and
/// `read_only`; the fields are private so that cannot be bypassed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransactionOptions {
    isolation_level: IsolationLevel,
    read_only: bool,
    deferrable: bool,
    query: QueryOptions,
}

impl TransactionOptions {
    pub fn new(isolation_level: IsolationLevel, read_only: bool, deferrable: bool) -> Result<Self> {
        if deferrable && !(isolation_level == IsolationLevel::Serializable && read_only) {
            return Err(NeonError::Config(
                "deferrable transactions must be SERIALIZABLE and READ ONLY".into(),
            ));
        }
        Ok(Self {
            isolation_level,
            read_only,
            deferrable,
            query: QueryOptions::default(),
        })
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn deferrable(&self) -> bool {
        self.deferrable
    }

    /// Options applied to each statement's result.
    pub fn query_options(&self) -> &QueryOptions {
        &self.query
    }

    pub fn array_mode(mut self, on: bool) -> Self {
        self.query.array_mode = on;
        self
    }

    pub fn full_results(mut self, on: bool) -> Self {
        self.query.full_results = on;
        self
    }

    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.query.auth_token = Some(token.into());
        self
    }

    /// `BEGIN ...` statement for the WebSocket path.
    pub(crate) fn begin_sql(&self) -> String {
        let mut sql = format!(
            "BEGIN ISOLATION LEVEL {} {}",
            self.isolation_level.as_sql(),
            if self.read_only { "READ ONLY" } else { "READ WRITE" }
        );
        if self.deferrable {
            sql.push_str(" DEFERRABLE");
        }
        sql
    }
}
