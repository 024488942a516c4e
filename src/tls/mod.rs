pub mod rustls;

#[cfg(feature = "tls-rustls")]
pub use self::rustls::build_client_config;
