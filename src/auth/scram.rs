//! SCRAM-SHA-256 client (RFC 5802 / RFC 7677), without channel binding.
//!
//! The exchange is driven by the wire session:
//!
//! ```ignore
//! let mut scram = ScramSha256::new(password);
//! send_sasl_initial("SCRAM-SHA-256", scram.client_first().as_bytes());
//!
//! let client_final = scram.process_server_first(&server_first)?;
//! send_sasl_response(client_final.as_bytes());
//!
//! scram.verify_server_final(&server_final)?;
//! ```
//!
//! The username in `n=` is left empty; the server takes the user from the
//! startup message.

#[cfg(feature = "scram")]
use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
#[cfg(feature = "scram")]
use hmac::{Hmac, Mac};
#[cfg(feature = "scram")]
use rand::RngCore;
#[cfg(feature = "scram")]
use sha2::{Digest, Sha256};

#[cfg(feature = "scram")]
use crate::error::{NeonError, Result};

pub const MECHANISM: &str = "SCRAM-SHA-256";

#[cfg(feature = "scram")]
type HmacSha256 = Hmac<Sha256>;

#[cfg(feature = "scram")]
#[derive(Debug, Clone, PartialEq, Eq)]
enum Stage {
    Initial,
    ClientFirstSent,
    AwaitingServerFinal { server_signature: Vec<u8> },
    Done,
}

/// Client side of one SCRAM-SHA-256 exchange.
///
/// Calls must happen in order: [`client_first`](Self::client_first),
/// [`process_server_first`](Self::process_server_first),
/// [`verify_server_final`](Self::verify_server_final). Anything else is an
/// authentication error.
#[cfg(feature = "scram")]
pub struct ScramSha256 {
    password: String,
    client_nonce: String,
    client_first_bare: String,
    stage: Stage,
}

#[cfg(feature = "scram")]
impl std::fmt::Debug for ScramSha256 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScramSha256")
            .field("client_nonce", &self.client_nonce)
            .field("stage", &self.stage)
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "scram")]
impl ScramSha256 {
    /// Start an exchange with an 18-byte random nonce.
    pub fn new(password: &str) -> ScramSha256 {
        let mut nonce = [0u8; 18];
        rand::rng().fill_bytes(&mut nonce);
        Self::from_parts("", password, &B64.encode(nonce))
    }

    /// Deterministic exchange for known-answer tests.
    #[cfg(test)]
    pub(crate) fn with_nonce(username: &str, password: &str, nonce: &str) -> ScramSha256 {
        Self::from_parts(username, password, nonce)
    }

    fn from_parts(username: &str, password: &str, nonce: &str) -> ScramSha256 {
        let user = sasl_escape_username(username);
        ScramSha256 {
            password: password.to_string(),
            client_nonce: nonce.to_string(),
            client_first_bare: format!("n={user},r={nonce}"),
            stage: Stage::Initial,
        }
    }

    /// client-first-message: GS2 header `n,,` plus the bare message.
    pub fn client_first(&mut self) -> String {
        self.stage = Stage::ClientFirstSent;
        format!("n,,{}", self.client_first_bare)
    }

    /// Consume server-first-message and produce client-final-message.
    ///
    /// Runs PBKDF2 with the server's iteration count, so callers on an async
    /// runtime should move this onto a blocking thread.
    pub fn process_server_first(&mut self, server_first: &str) -> Result<String> {
        if self.stage != Stage::ClientFirstSent {
            return Err(NeonError::Auth(
                "SCRAM server-first received out of order".into(),
            ));
        }

        let (rnonce, salt_b64, iters) = parse_server_first(server_first)?;

        // server nonce must extend ours
        if !rnonce.starts_with(&self.client_nonce) || rnonce.len() == self.client_nonce.len() {
            return Err(NeonError::Auth(
                "SCRAM nonce mismatch: server nonce doesn't extend client nonce".into(),
            ));
        }

        let salt = B64
            .decode(salt_b64.as_bytes())
            .map_err(|e| NeonError::Auth(format!("SCRAM invalid salt base64: {e}")))?;

        // "biws" = base64("n,,")
        let client_final_wo_proof = format!("c=biws,r={rnonce}");
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, server_first, client_final_wo_proof
        );

        let salted_password = hi_sha256(self.password.as_bytes(), &salt, iters);
        let client_key = hmac_sha256(&salted_password, b"Client Key");
        let stored_key = Sha256::digest(&client_key);
        let client_sig = hmac_sha256(stored_key.as_slice(), auth_message.as_bytes());
        let proof = xor_bytes(&client_key, &client_sig);

        let server_key = hmac_sha256(&salted_password, b"Server Key");
        let server_signature = hmac_sha256(&server_key, auth_message.as_bytes());

        self.stage = Stage::AwaitingServerFinal { server_signature };
        Ok(format!("{client_final_wo_proof},p={}", B64.encode(proof)))
    }

    /// Check the server signature in server-final-message.
    pub fn verify_server_final(&mut self, server_final: &str) -> Result<()> {
        let Stage::AwaitingServerFinal { server_signature } = &self.stage else {
            return Err(NeonError::Auth(
                "SCRAM server-final received out of order".into(),
            ));
        };

        if let Some(err) = server_final.split(',').find_map(|p| p.strip_prefix("e=")) {
            return Err(NeonError::Auth(format!("SCRAM server error: {err}")));
        }

        let v = server_final
            .split(',')
            .find_map(|p| p.strip_prefix("v="))
            .ok_or_else(|| NeonError::Auth("SCRAM server-final missing signature (v=)".into()))?;

        let received = B64.decode(v.trim().as_bytes()).map_err(|e| {
            NeonError::Auth(format!("SCRAM invalid server signature base64: {e}"))
        })?;

        if !constant_time_eq(&received, server_signature) {
            return Err(NeonError::Auth(
                "SCRAM server signature mismatch: server may not know the password".into(),
            ));
        }

        self.stage = Stage::Done;
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.stage == Stage::Done
    }
}

/// Parse server-first-message into `(nonce, salt_b64, iterations)`.
#[cfg(feature = "scram")]
fn parse_server_first(server_first: &str) -> Result<(String, String, u32)> {
    let mut r = None;
    let mut s = None;
    let mut i = None;

    for part in server_first.split(',') {
        if let Some(v) = part.strip_prefix("r=") {
            r = Some(v.to_string());
        } else if let Some(v) = part.strip_prefix("s=") {
            s = Some(v.to_string());
        } else if let Some(v) = part.strip_prefix("i=") {
            i = v.parse::<u32>().ok().filter(|n| *n > 0);
        } else if let Some(v) = part.strip_prefix("e=") {
            return Err(NeonError::Auth(format!("SCRAM server error: {v}")));
        }
    }

    Ok((
        r.ok_or_else(|| NeonError::Auth("SCRAM server-first missing nonce (r=)".into()))?,
        s.ok_or_else(|| NeonError::Auth("SCRAM server-first missing salt (s=)".into()))?,
        i.ok_or_else(|| {
            NeonError::Auth("SCRAM server-first missing or invalid iteration count (i=)".into())
        })?,
    ))
}

/// Escapes `=` as `=3D` and `,` as `=2C`.
#[cfg(feature = "scram")]
fn sasl_escape_username(u: &str) -> String {
    u.replace('=', "=3D").replace(',', "=2C")
}

/// Hi() from RFC 5802, i.e. PBKDF2-HMAC-SHA256 with one output block.
#[cfg(feature = "scram")]
pub(crate) fn hi_sha256(password: &[u8], salt: &[u8], iters: u32) -> Vec<u8> {
    // U1 = HMAC(password, salt || INT(1))
    let mut s1 = Vec::with_capacity(salt.len() + 4);
    s1.extend_from_slice(salt);
    s1.extend_from_slice(&1u32.to_be_bytes());

    let mut u = hmac_sha256(password, &s1);
    let mut out = u.clone();

    for _ in 1..iters {
        u = hmac_sha256(password, &u);
        for (o, ui) in out.iter_mut().zip(u.iter()) {
            *o ^= *ui;
        }
    }

    out
}

#[cfg(feature = "scram")]
pub(crate) fn hmac_sha256(key: &[u8], msg: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC key length is always valid");
    mac.update(msg);
    mac.finalize().into_bytes().to_vec()
}

#[cfg(feature = "scram")]
fn xor_bytes(a: &[u8], b: &[u8]) -> Vec<u8> {
    debug_assert_eq!(a.len(), b.len(), "XOR operands must have equal length");
    a.iter().zip(b.iter()).map(|(x, y)| x ^ y).collect()
}

#[cfg(feature = "scram")]
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
