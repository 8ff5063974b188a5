//! MySQL authentication.
//!
//! Only `mysql_native_password` is implemented. Its scramble is:
//!
//! ```text
//! SHA1(password) XOR SHA1(scramble[..20] + SHA1(SHA1(password)))
//! ```
//!
//! The cleartext password never goes on the wire.

use mywire_core::Error;
use sha1::{Digest, Sha1};

use crate::error::auth_error;

/// Well-known authentication plugin names.
pub mod plugins {
    /// SHA1-based authentication
    pub const MYSQL_NATIVE_PASSWORD: &str = "mysql_native_password";
}

/// Bytes of the server scramble that take part in the hash.
pub const SCRAMBLE_LEN: usize = 20;

/// Compute the mysql_native_password response for `password`.
///
/// Only the first 20 bytes of `scramble` are used, so a trailing NUL sent
/// by the server makes no difference.
pub fn secure_auth(password: &str, scramble: &[u8]) -> [u8; 20] {
    let seed = &scramble[..scramble.len().min(SCRAMBLE_LEN)];

    let stage1: [u8; 20] = Sha1::digest(password.as_bytes()).into();
    let stage2: [u8; 20] = Sha1::digest(stage1).into();

    let mut hasher = Sha1::new();
    hasher.update(seed);
    hasher.update(stage2);
    let stage3: [u8; 20] = hasher.finalize().into();

    let mut out = [0u8; 20];
    for (o, (a, b)) in out.iter_mut().zip(stage1.iter().zip(stage3.iter())) {
        *o = a ^ b;
    }
    out
}

/// Compute the auth response for the named plugin.
///
/// An absent or empty password always yields an empty response.
pub fn auth_response(
    plugin: &str,
    password: Option<&str>,
    scramble: &[u8],
) -> Result<Vec<u8>, Error> {
    let Some(password) = password.filter(|p| !p.is_empty()) else {
        return Ok(Vec::new());
    };

    match plugin {
        plugins::MYSQL_NATIVE_PASSWORD => Ok(secure_auth(password, scramble).to_vec()),
        other => Err(auth_error(
            format!("Unsupported authentication method: {other}"),
            Some(other),
        )),
    }
}
