//! Conversion between JSON values and Postgres text format.

use serde_json::{Number, Value};

use crate::error::{NeonError, Result};

pub mod oid {
    pub const BOOL: u32 = 16;
    pub const INT8: u32 = 20;
    pub const INT2: u32 = 21;
    pub const INT4: u32 = 23;
    pub const TEXT: u32 = 25;
    pub const OID: u32 = 26;
    pub const JSON: u32 = 114;
    pub const FLOAT4: u32 = 700;
    pub const FLOAT8: u32 = 701;
    pub const NUMERIC: u32 = 1700;
    pub const JSONB: u32 = 3802;
}

/// Converts query parameters to text and result text back to values.
///
/// Shared by every client as an `Arc<dyn TypeConverter>`.
pub trait TypeConverter: Send + Sync {
    /// Text form of a parameter; `None` is SQL NULL.
    fn encode(&self, value: &Value) -> Result<Option<String>>;

    /// Value of a text-format column of type `type_id`.
    fn decode(&self, text: &str, type_id: u32) -> Result<Value>;

    fn encode_params(&self, params: &[Value]) -> Result<Vec<Option<String>>> {
        params.iter().map(|p| self.encode(p)).collect()
    }
}

/// Default converter covering the built-in scalar and JSON types.
///
/// Anything it does not recognise, `numeric` included, decodes to a string
/// so no precision is lost.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextConverter;

impl TypeConverter for TextConverter {
    fn encode(&self, value: &Value) -> Result<Option<String>> {
        Ok(match value {
            Value::Null => None,
            Value::Bool(b) => Some(b.to_string()),
            Value::Number(n) => Some(n.to_string()),
            Value::String(s) => Some(s.clone()),
            Value::Array(items) => {
                let mut out = String::new();
                write_array_literal(&mut out, items)?;
                Some(out)
            }
            Value::Object(_) => Some(serde_json::to_string(value)?),
        })
    }

    fn decode(&self, text: &str, type_id: u32) -> Result<Value> {
        match type_id {
            oid::BOOL => match text {
                "t" | "true" => Ok(Value::Bool(true)),
                "f" | "false" => Ok(Value::Bool(false)),
                other => Err(NeonError::Decode(format!("invalid bool: {other:?}"))),
            },
            oid::INT2 | oid::INT4 | oid::INT8 | oid::OID => text
                .parse::<i64>()
                .map(Value::from)
                .map_err(|e| NeonError::Decode(format!("invalid integer {text:?}: {e}"))),
            oid::FLOAT4 | oid::FLOAT8 => {
                let f = text
                    .parse::<f64>()
                    .map_err(|e| NeonError::Decode(format!("invalid float {text:?}: {e}")))?;
                // NaN and the infinities have no JSON number form
                Ok(Number::from_f64(f)
                    .map(Value::Number)
                    .unwrap_or_else(|| Value::String(text.to_string())))
            }
            oid::JSON | oid::JSONB => Ok(serde_json::from_str(text)?),
            _ => Ok(Value::String(text.to_string())),
        }
    }
}

fn write_array_literal(out: &mut String, items: &[Value]) -> Result<()> {
    out.push('{');
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        match item {
            Value::Null => out.push_str("NULL"),
            Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
            Value::Number(n) => out.push_str(&n.to_string()),
            Value::Array(inner) => write_array_literal(out, inner)?,
            Value::String(s) => quote_element(out, s),
            Value::Object(_) => quote_element(out, &serde_json::to_string(item)?),
        }
    }
    out.push('}');
    Ok(())
}

fn quote_element(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
}

/// Decode one row of text values; `type_ids` is indexed by column.
pub(crate) fn decode_row(
    converter: &dyn TypeConverter,
    type_ids: &[u32],
    values: impl IntoIterator<Item = Option<String>>,
) -> Result<Vec<Value>> {
    values
        .into_iter()
        .enumerate()
        .map(|(i, v)| match v {
            None => Ok(Value::Null),
            Some(text) => converter.decode(&text, type_ids.get(i).copied().unwrap_or(oid::TEXT)),
        })
        .collect()
}
