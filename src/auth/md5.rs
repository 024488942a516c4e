/// Response to an MD5 password challenge:
/// `"md5" + md5_hex(md5_hex(password + user) + salt)`.
#[cfg(feature = "md5")]
pub fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = format!("{:x}", md5::compute(format!("{password}{user}")));
    let mut outer = Vec::with_capacity(inner.len() + salt.len());
    outer.extend_from_slice(inner.as_bytes());
    outer.extend_from_slice(salt);
    format!("md5{:x}", md5::compute(outer))
}
