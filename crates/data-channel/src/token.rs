//! Connection tokens.
//!
//! A receiving node owns one token; senders present it as the first 32
//! bytes of every connection.

use rand::RngCore;
use rand::rngs::OsRng;

use crate::wire::TOKEN_LEN;

/// Generates a fresh token: 16 random bytes as lowercase hex.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_LEN / 2];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Returns `true` if `token` has the wire length and is all hex digits.
pub fn is_well_formed(token: &str) -> bool {
    token.len() == TOKEN_LEN && token.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Compares a presented token with the expected one in constant time for
/// equal lengths.
pub fn validate_token(received: &str, expected: &str) -> bool {
    received.len() == expected.len()
        && received
            .bytes()
            .zip(expected.bytes())
            .fold(0u8, |diff, (a, b)| diff | (a ^ b))
            == 0
}
