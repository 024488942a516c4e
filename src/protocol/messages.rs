use std::collections::BTreeMap;

use bytes::{Buf, Bytes};

use crate::error::{NeonError, Result, ServerError};
use crate::protocol::framing::RawMessage;

pub const AUTHENTICATION: u8 = b'R';
pub const PARAMETER_STATUS: u8 = b'S';
pub const BACKEND_KEY_DATA: u8 = b'K';
pub const READY_FOR_QUERY: u8 = b'Z';
pub const ROW_DESCRIPTION: u8 = b'T';
pub const DATA_ROW: u8 = b'D';
pub const COMMAND_COMPLETE: u8 = b'C';
pub const ERROR_RESPONSE: u8 = b'E';
pub const NOTICE_RESPONSE: u8 = b'N';
pub const PARSE_COMPLETE: u8 = b'1';
pub const BIND_COMPLETE: u8 = b'2';
pub const CLOSE_COMPLETE: u8 = b'3';
pub const NO_DATA: u8 = b'n';
pub const EMPTY_QUERY_RESPONSE: u8 = b'I';
pub const PARAMETER_DESCRIPTION: u8 = b't';

pub const AUTH_OK: i32 = 0;
pub const AUTH_CLEARTEXT: i32 = 3;
pub const AUTH_MD5: i32 = 5;
pub const AUTH_SASL: i32 = 10;
pub const AUTH_SASL_CONTINUE: i32 = 11;
pub const AUTH_SASL_FINAL: i32 = 12;

/// Transaction status carried by ReadyForQuery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionStatus {
    #[default]
    Idle,
    InTransaction,
    Failed,
}

impl TransactionStatus {
    pub fn from_byte(b: u8) -> Result<Self> {
        match b {
            b'I' => Ok(TransactionStatus::Idle),
            b'T' => Ok(TransactionStatus::InTransaction),
            b'E' => Ok(TransactionStatus::Failed),
            other => Err(NeonError::protocol(format!(
                "unknown transaction status '{}'",
                other as char
            ))),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            TransactionStatus::Idle => b'I',
            TransactionStatus::InTransaction => b'T',
            TransactionStatus::Failed => b'E',
        }
    }
}

/// Metadata for one column of a result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    pub table_id: u32,
    pub column_index: i16,
    pub type_id: u32,
    pub type_size: i16,
    pub type_modifier: i32,
    /// 0 = text, 1 = binary. Only text is ever requested.
    pub format_code: i16,
}

/// Process id and secret key, kept for a future CancelRequest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendKeyData {
    pub process_id: i32,
    pub secret_key: i32,
}

/// Authentication request subtypes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthRequest {
    Ok,
    CleartextPassword,
    Md5Password { salt: [u8; 4] },
    Sasl { mechanisms: Vec<String> },
    SaslContinue(Bytes),
    SaslFinal(Bytes),
    Unsupported(i32),
}

/// A decoded backend message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendMessage {
    Authentication(AuthRequest),
    ParameterStatus { name: String, value: String },
    BackendKeyData(BackendKeyData),
    ReadyForQuery(TransactionStatus),
    RowDescription(Vec<FieldDescription>),
    DataRow(Vec<Option<Bytes>>),
    CommandComplete(String),
    EmptyQueryResponse,
    ErrorResponse(ErrorFields),
    NoticeResponse(ErrorFields),
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    ParameterDescription,
    /// Any tag this client does not interpret.
    Unknown(u8),
}

impl BackendMessage {
    pub fn parse(msg: RawMessage) -> Result<BackendMessage> {
        let RawMessage { tag, payload } = msg;
        Ok(match tag {
            AUTHENTICATION => BackendMessage::Authentication(parse_auth_request(&payload)?),
            PARAMETER_STATUS => {
                let (name, value) = parse_parameter_status(&payload)?;
                BackendMessage::ParameterStatus { name, value }
            }
            BACKEND_KEY_DATA => BackendMessage::BackendKeyData(parse_backend_key_data(&payload)?),
            READY_FOR_QUERY => {
                let status = payload
                    .first()
                    .copied()
                    .ok_or_else(|| NeonError::protocol("empty ReadyForQuery"))?;
                BackendMessage::ReadyForQuery(TransactionStatus::from_byte(status)?)
            }
            ROW_DESCRIPTION => BackendMessage::RowDescription(parse_row_description(&payload)?),
            DATA_ROW => BackendMessage::DataRow(parse_data_row(payload)?),
            COMMAND_COMPLETE => BackendMessage::CommandComplete(read_cstr(&mut &payload[..])?),
            EMPTY_QUERY_RESPONSE => BackendMessage::EmptyQueryResponse,
            ERROR_RESPONSE => BackendMessage::ErrorResponse(ErrorFields::parse(&payload)),
            NOTICE_RESPONSE => BackendMessage::NoticeResponse(ErrorFields::parse(&payload)),
            PARSE_COMPLETE => BackendMessage::ParseComplete,
            BIND_COMPLETE => BackendMessage::BindComplete,
            CLOSE_COMPLETE => BackendMessage::CloseComplete,
            NO_DATA => BackendMessage::NoData,
            PARAMETER_DESCRIPTION => BackendMessage::ParameterDescription,
            other => BackendMessage::Unknown(other),
        })
    }

    /// Human-readable message name for error reporting.
    pub fn name(&self) -> &'static str {
        match self {
            BackendMessage::Authentication(_) => "Authentication",
            BackendMessage::ParameterStatus { .. } => "ParameterStatus",
            BackendMessage::BackendKeyData(_) => "BackendKeyData",
            BackendMessage::ReadyForQuery(_) => "ReadyForQuery",
            BackendMessage::RowDescription(_) => "RowDescription",
            BackendMessage::DataRow(_) => "DataRow",
            BackendMessage::CommandComplete(_) => "CommandComplete",
            BackendMessage::EmptyQueryResponse => "EmptyQueryResponse",
            BackendMessage::ErrorResponse(_) => "ErrorResponse",
            BackendMessage::NoticeResponse(_) => "NoticeResponse",
            BackendMessage::ParseComplete => "ParseComplete",
            BackendMessage::BindComplete => "BindComplete",
            BackendMessage::CloseComplete => "CloseComplete",
            BackendMessage::NoData => "NoData",
            BackendMessage::ParameterDescription => "ParameterDescription",
            BackendMessage::Unknown(_) => "Unknown",
        }
    }
}

fn need(b: &[u8], n: usize, what: &str) -> Result<()> {
    if b.remaining() < n {
        return Err(NeonError::protocol(format!("{what} truncated")));
    }
    Ok(())
}

fn read_cstr(b: &mut &[u8]) -> Result<String> {
    let pos = b
        .iter()
        .position(|&x| x == 0)
        .ok_or_else(|| NeonError::protocol("unterminated string"))?;
    let s = String::from_utf8_lossy(&b[..pos]).into_owned();
    *b = &b[pos + 1..];
    Ok(s)
}

/// Parse an Authentication ('R') payload.
pub fn parse_auth_request(payload: &[u8]) -> Result<AuthRequest> {
    need(payload, 4, "auth request")?;
    let mut b = payload;
    let code = b.get_i32();
    Ok(match code {
        AUTH_OK => AuthRequest::Ok,
        AUTH_CLEARTEXT => AuthRequest::CleartextPassword,
        AUTH_MD5 => {
            if b.len() != 4 {
                return Err(NeonError::Auth("md5 auth salt missing".into()));
            }
            let mut salt = [0u8; 4];
            salt.copy_from_slice(b);
            AuthRequest::Md5Password { salt }
        }
        AUTH_SASL => AuthRequest::Sasl {
            mechanisms: parse_sasl_mechanisms(b),
        },
        AUTH_SASL_CONTINUE => AuthRequest::SaslContinue(Bytes::copy_from_slice(b)),
        AUTH_SASL_FINAL => AuthRequest::SaslFinal(Bytes::copy_from_slice(b)),
        other => AuthRequest::Unsupported(other),
    })
}

/// Mechanism names are null-separated and the list ends with an empty name.
fn parse_sasl_mechanisms(mut b: &[u8]) -> Vec<String> {
    let mut offered = Vec::new();
    while let Some(pos) = b.iter().position(|&x| x == 0) {
        if pos == 0 {
            break;
        }
        offered.push(String::from_utf8_lossy(&b[..pos]).into_owned());
        b = &b[pos + 1..];
    }
    offered
}

pub fn parse_parameter_status(payload: &[u8]) -> Result<(String, String)> {
    let mut b = payload;
    let name = read_cstr(&mut b)?;
    let value = read_cstr(&mut b)?;
    Ok((name, value))
}

pub fn parse_backend_key_data(payload: &[u8]) -> Result<BackendKeyData> {
    need(payload, 8, "BackendKeyData")?;
    let mut b = payload;
    Ok(BackendKeyData {
        process_id: b.get_i32(),
        secret_key: b.get_i32(),
    })
}

/// Parse a RowDescription ('T') payload.
pub fn parse_row_description(payload: &[u8]) -> Result<Vec<FieldDescription>> {
    let mut b = payload;
    need(b, 2, "RowDescription")?;
    let n = b.get_u16() as usize;
    let mut fields = Vec::with_capacity(n);
    for _ in 0..n {
        let name = read_cstr(&mut b)?;
        need(b, 18, "RowDescription field")?;
        fields.push(FieldDescription {
            name,
            table_id: b.get_u32(),
            column_index: b.get_i16(),
            type_id: b.get_u32(),
            type_size: b.get_i16(),
            type_modifier: b.get_i32(),
            format_code: b.get_i16(),
        });
    }
    Ok(fields)
}

/// Parse a DataRow ('D') payload. Column values borrow from `payload`.
pub fn parse_data_row(payload: Bytes) -> Result<Vec<Option<Bytes>>> {
    let mut b = payload;
    need(&b, 2, "DataRow")?;
    let n = b.get_u16() as usize;
    let mut values = Vec::with_capacity(n);
    for _ in 0..n {
        need(&b, 4, "DataRow column")?;
        let len = b.get_i32();
        if len < 0 {
            values.push(None);
            continue;
        }
        let len = len as usize;
        need(&b, len, "DataRow value")?;
        values.push(Some(b.split_to(len)));
    }
    Ok(values)
}

const ERROR_FIELD_NAMES: &[(u8, &str)] = &[
    (b'S', "severity"),
    (b'V', "severity_nonlocalized"),
    (b'C', "code"),
    (b'M', "message"),
    (b'D', "detail"),
    (b'H', "hint"),
    (b'P', "position"),
    (b'p', "internal_position"),
    (b'q', "internal_query"),
    (b'W', "where"),
    (b's', "schema"),
    (b't', "table"),
    (b'c', "column"),
    (b'd', "datatype"),
    (b'n', "constraint"),
    (b'F', "file"),
    (b'L', "line"),
    (b'R', "routine"),
];

/// Fields of an ErrorResponse or NoticeResponse, keyed by name.
///
/// Unknown field tags are kept under `unknown_<tag>`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorFields {
    fields: BTreeMap<String, String>,
}

impl ErrorFields {
    pub fn parse(payload: &[u8]) -> ErrorFields {
        // fields: (code_byte, cstring) ... 0
        let mut fields = BTreeMap::new();
        let mut b = payload;

        while !b.is_empty() {
            let code = b[0];
            b = &b[1..];
            if code == 0 {
                break;
            }
            let Some(pos) = b.iter().position(|&x| x == 0) else {
                break;
            };
            let value = String::from_utf8_lossy(&b[..pos]).into_owned();
            b = &b[pos + 1..];

            let name = ERROR_FIELD_NAMES
                .iter()
                .find(|(tag, _)| *tag == code)
                .map(|(_, name)| (*name).to_string())
                .unwrap_or_else(|| format!("unknown_{}", code as char));
            fields.insert(name, value);
        }

        ErrorFields { fields }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn severity(&self) -> Option<&str> {
        self.get("severity")
    }

    pub fn code(&self) -> Option<&str> {
        self.get("code")
    }

    pub fn message(&self) -> Option<&str> {
        self.get("message")
    }

    pub fn into_server_error(self) -> ServerError {
        let mut f = self.fields;
        ServerError {
            message: f
                .remove("message")
                .unwrap_or_else(|| "unknown server error".to_string()),
            code: f.remove("code"),
            detail: f.remove("detail"),
            hint: f.remove("hint"),
            severity: f.remove("severity"),
            position: f.remove("position"),
        }
    }
}
