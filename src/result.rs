//! Query results, both the raw per-statement protocol form and the unified
//! form shared by the HTTP and WebSocket paths.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use crate::protocol::messages::FieldDescription;

/// Outcome of one statement on the wire session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtocolQueryResult {
    pub fields: Vec<FieldDescription>,
    /// One entry per DataRow; `None` is SQL NULL.
    pub rows: Vec<Vec<Option<Bytes>>>,
    /// CommandComplete tag, e.g. `SELECT 1` or `INSERT 0 3`.
    pub command_tag: String,
}

impl ProtocolQueryResult {
    /// First word of the command tag.
    pub fn command(&self) -> &str {
        self.command_tag.split_whitespace().next().unwrap_or("")
    }

    /// Trailing row count of the command tag, if it has one.
    pub fn affected_rows(&self) -> Option<u64> {
        self.command_tag
            .rsplit(' ')
            .next()
            .and_then(|n| n.parse().ok())
    }
}

/// Column metadata in the HTTP API's field shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInfo {
    pub name: String,
    #[serde(rename = "tableID", default)]
    pub table_id: u32,
    #[serde(rename = "columnID", default)]
    pub column_id: i16,
    #[serde(rename = "dataTypeID")]
    pub data_type_id: u32,
    #[serde(rename = "dataTypeSize", default)]
    pub data_type_size: i16,
    #[serde(rename = "dataTypeModifier", default)]
    pub data_type_modifier: i32,
    #[serde(default = "text_format")]
    pub format: String,
}

fn text_format() -> String {
    "text".to_string()
}

impl From<&FieldDescription> for FieldInfo {
    fn from(f: &FieldDescription) -> Self {
        FieldInfo {
            name: f.name.clone(),
            table_id: f.table_id,
            column_id: f.column_index,
            data_type_id: f.type_id,
            data_type_size: f.type_size,
            data_type_modifier: f.type_modifier,
            format: if f.format_code == 1 {
                "binary".to_string()
            } else {
                text_format()
            },
        }
    }
}

/// One decoded row.
#[derive(Debug, Clone, PartialEq)]
pub enum Row {
    /// Column name to value, in column order. Later duplicates win.
    Object(Map<String, Value>),
    /// Values by position.
    Array(Vec<Value>),
}

impl Row {
    pub fn get(&self, name: &str) -> Option<&Value> {
        match self {
            Row::Object(m) => m.get(name),
            Row::Array(_) => None,
        }
    }

    pub fn get_index(&self, idx: usize) -> Option<&Value> {
        match self {
            Row::Object(m) => m.values().nth(idx),
            Row::Array(v) => v.get(idx),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Row::Object(m) => m.len(),
            Row::Array(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn build(names: &[String], values: Vec<Value>, array_mode: bool) -> Row {
        if array_mode {
            return Row::Array(values);
        }
        Row::Object(names.iter().cloned().zip(values).collect())
    }
}

/// Transport-independent query result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub rows: Vec<Row>,
    /// Empty unless `full_results` was requested.
    pub fields: Vec<FieldInfo>,
    pub row_count: Option<u64>,
    /// First word of the command tag; empty unless `full_results`.
    pub command: String,
    pub row_as_array: bool,
}
