//! Password authentication for the wire session.
//!
//! - **SCRAM-SHA-256** (feature: `scram`): what serverless endpoints ask for.
//!   Mutual authentication; the password never crosses the wire.
//! - **MD5** (feature: `md5`): legacy `md5` challenge with a 4-byte salt.
//!
//! Cleartext passwords need no helper and are always available.
//!
//! # Feature Flags
//!
//! - `scram`: adds `sha2`, `hmac`, `rand` and `base64`.
//! - `md5`: adds `md5`.
//!
//! # Unsupported Methods
//!
//! - SCRAM-SHA-256-PLUS (channel binding)
//! - GSSAPI / Kerberos
//! - SSPI (Windows)

pub mod md5;
pub mod scram;

#[cfg(feature = "md5")]
pub use md5::md5_password;
#[cfg(feature = "scram")]
pub use scram::ScramSha256;
