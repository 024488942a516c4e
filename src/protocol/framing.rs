use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{NeonError, Result};
use crate::protocol::channel::Channel;

/// Protocol 3.0 = (3 << 16) | 0
pub const PROTOCOL_VERSION: i32 = 196608;

/// The reader drops its consumed prefix once it grows past this many bytes.
pub const COMPACT_THRESHOLD: usize = 64 * 1024;

/// Largest payload the reader accepts; the server caps a field at 1 GiB.
pub const MAX_MESSAGE_LEN: usize = 1 << 30;

pub const QUERY: u8 = b'Q';
pub const PARSE: u8 = b'P';
pub const BIND: u8 = b'B';
pub const DESCRIBE: u8 = b'D';
pub const EXECUTE: u8 = b'E';
pub const SYNC: u8 = b'S';
pub const TERMINATE: u8 = b'X';
pub const PASSWORD: u8 = b'p';

const FORMAT_TEXT: i16 = 0;

/// One backend message as it came off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub tag: u8,
    pub payload: Bytes, // payload excludes the 4-byte length field
}

/// Buffers chunks from a [`Channel`] and serves exact byte counts and whole
/// protocol messages. Transport frames and protocol messages never line up.
pub struct FrameReader<C> {
    channel: C,
    buf: Vec<u8>,
    pos: usize,
}

impl<C: Channel> FrameReader<C> {
    pub fn new(channel: C) -> Self {
        Self {
            channel,
            buf: Vec::with_capacity(8 * 1024),
            pos: 0,
        }
    }

    pub fn get_ref(&self) -> &C {
        &self.channel
    }

    pub fn get_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    pub fn into_inner(self) -> C {
        self.channel
    }

    /// Bytes received but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Read exactly `n` bytes, pulling chunks from the channel as needed.
    pub async fn read_exact(&mut self, n: usize) -> Result<Bytes> {
        while self.buffered() < n {
            let chunk = self.channel.recv().await?;
            if chunk.is_empty() {
                return Err(NeonError::Connection(
                    "connection closed while reading".into(),
                ));
            }
            self.buf.extend_from_slice(&chunk);
        }

        let out = Bytes::copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;

        if self.pos > COMPACT_THRESHOLD {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }

        Ok(out)
    }

    /// Read one tagged backend message.
    pub async fn read_message(&mut self) -> Result<RawMessage> {
        let hdr = self.read_exact(5).await?;
        let tag = hdr[0];
        let len = i32::from_be_bytes([hdr[1], hdr[2], hdr[3], hdr[4]]);
        if len < 4 {
            return Err(NeonError::Connection(format!(
                "invalid message length {len} for type '{}'",
                tag as char
            )));
        }
        let payload_len = (len - 4) as usize;
        if payload_len > MAX_MESSAGE_LEN {
            return Err(NeonError::protocol(format!(
                "message type '{}' declares {payload_len} bytes, over the {MAX_MESSAGE_LEN} byte limit",
                tag as char
            )));
        }
        let payload = if payload_len == 0 {
            Bytes::new()
        } else {
            self.read_exact(payload_len).await?
        };
        Ok(RawMessage { tag, payload })
    }
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Append `tag`, a length placeholder, the body, then patch the length.
fn put_message(buf: &mut BytesMut, tag: u8, body: impl FnOnce(&mut BytesMut)) {
    buf.put_u8(tag);
    let len_at = buf.len();
    buf.put_i32(0); // length placeholder
    body(buf);
    let len = (buf.len() - len_at) as i32;
    buf[len_at..len_at + 4].copy_from_slice(&len.to_be_bytes());
}

fn param_count(n: usize) -> Result<u16> {
    u16::try_from(n).map_err(|_| {
        NeonError::Config(format!("too many query parameters: {n} (max {})", u16::MAX))
    })
}

/// Generic tagged frontend message.
pub fn encode_message(buf: &mut BytesMut, tag: u8, payload: &[u8]) {
    put_message(buf, tag, |b| b.extend_from_slice(payload));
}

/// StartupMessage: no tag byte, protocol version, then `key\0value\0` pairs.
pub fn encode_startup(buf: &mut BytesMut, user: &str, database: &str, params: &[(&str, &str)]) {
    let start = buf.len();
    buf.put_i32(0); // length placeholder
    buf.put_i32(PROTOCOL_VERSION);

    put_cstr(buf, "user");
    put_cstr(buf, user);
    put_cstr(buf, "database");
    put_cstr(buf, database);
    for (k, v) in params {
        put_cstr(buf, k);
        put_cstr(buf, v);
    }
    buf.put_u8(0); // terminator

    let len = (buf.len() - start) as i32;
    buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
}

pub fn encode_query(buf: &mut BytesMut, sql: &str) {
    put_message(buf, QUERY, |b| put_cstr(b, sql));
}

/// Parse into the unnamed statement; every parameter type is left for the
/// server to infer.
pub fn encode_parse(buf: &mut BytesMut, sql: &str, n_params: usize) -> Result<()> {
    let n = param_count(n_params)?;
    put_message(buf, PARSE, |b| {
        put_cstr(b, "");
        put_cstr(b, sql);
        b.put_u16(n);
        for _ in 0..n {
            b.put_u32(0);
        }
    });
    Ok(())
}

/// Bind the unnamed portal to the unnamed statement. Parameters and results
/// both use the text format, declared once for all columns.
pub fn encode_bind(buf: &mut BytesMut, params: &[Option<Bytes>]) -> Result<()> {
    let n = param_count(params.len())?;
    for p in params.iter().flatten() {
        if i32::try_from(p.len()).is_err() {
            return Err(NeonError::Config(format!(
                "query parameter too large: {} bytes",
                p.len()
            )));
        }
    }

    put_message(buf, BIND, |b| {
        put_cstr(b, ""); // portal
        put_cstr(b, ""); // statement
        b.put_i16(1);
        b.put_i16(FORMAT_TEXT);
        b.put_u16(n);
        for p in params {
            match p {
                None => b.put_i32(-1),
                Some(v) => {
                    b.put_i32(v.len() as i32);
                    b.extend_from_slice(v);
                }
            }
        }
        b.put_i16(1);
        b.put_i16(FORMAT_TEXT);
    });
    Ok(())
}

pub fn encode_describe_portal(buf: &mut BytesMut) {
    put_message(buf, DESCRIBE, |b| {
        b.put_u8(b'P');
        put_cstr(b, "");
    });
}

/// Execute the unnamed portal with no row limit.
pub fn encode_execute(buf: &mut BytesMut) {
    put_message(buf, EXECUTE, |b| {
        put_cstr(b, "");
        b.put_i32(0);
    });
}

pub fn encode_sync(buf: &mut BytesMut) {
    put_message(buf, SYNC, |_| {});
}

pub fn encode_terminate(buf: &mut BytesMut) {
    put_message(buf, TERMINATE, |_| {});
}

pub fn encode_password(buf: &mut BytesMut, password: &str) {
    put_message(buf, PASSWORD, |b| put_cstr(b, password));
}

/// SASLInitialResponse is sent as a PasswordMessage ('p'):
/// mechanism\0 + int32(len) + bytes
pub fn encode_sasl_initial_response(buf: &mut BytesMut, mechanism: &str, data: &[u8]) {
    put_message(buf, PASSWORD, |b| {
        put_cstr(b, mechanism);
        b.put_i32(data.len() as i32);
        b.extend_from_slice(data);
    });
}

pub fn encode_sasl_response(buf: &mut BytesMut, data: &[u8]) {
    put_message(buf, PASSWORD, |b| b.extend_from_slice(data));
}
