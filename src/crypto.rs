//! Token material: generation, hashing, verification.
//!
//! A withdrawal token is a `PREFIX-CORE` string drawn from a 36-symbol
//! alphabet (`A-Z0-9`). The 4-char prefix is a non-secret lookup key; the
//! 8-char core carries the entropy (8 * log2(36) ≈ 41 bits). Only the
//! salted, peppered SHA-256 of the full string is ever persisted.

use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Symbols a token may contain. Uppercase Latin letters and digits; the
/// wire pattern `^[A-Z0-9]{4}-[A-Z0-9]{8}$` assumes exactly this set.
pub const TOKEN_ALPHABET: &[u8; 36] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Length of the non-secret lookup prefix.
pub const PREFIX_LEN: usize = 4;

/// Length of the secret core.
pub const CORE_LEN: usize = 8;

/// Per-token salt length in bytes.
pub const SALT_LEN: usize = 16;

/// Draw `len` symbols from [`TOKEN_ALPHABET`] using the OS CSPRNG.
///
/// `gen_range` samples the index range uniformly, so no symbol is
/// favoured the way modulo-folding a raw byte would.
fn random_symbols(len: usize) -> String {
    let mut rng = OsRng;
    (0..len)
        .map(|_| TOKEN_ALPHABET[rng.gen_range(0..TOKEN_ALPHABET.len())] as char)
        .collect()
}

/// Generate a fresh plaintext token in `PREFIX-CORE` form.
pub fn generate_plaintext() -> String {
    format!(
        "{}-{}",
        random_symbols(PREFIX_LEN),
        random_symbols(CORE_LEN)
    )
}

/// Generate a fresh per-token salt.
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// `SHA256(pepper ‖ plaintext ‖ salt)`. The concatenation order must stay
/// stable across releases, or every live token stops verifying.
pub fn token_hash(pepper: &SecretString, plaintext: &str, salt: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(pepper.expose_secret().as_bytes());
    hasher.update(plaintext.as_bytes());
    hasher.update(salt);
    hasher.finalize().into()
}

/// Constant-time hash comparison.
pub fn hashes_match(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

/// Split a presented token into `(prefix, core)`.
///
/// Returns `None` unless the input matches `^[A-Z0-9]{4}-[A-Z0-9]{8}$`
/// exactly. Pure byte inspection; callers rely on rejection happening
/// before any database access.
pub fn parse_token(raw: &str) -> Option<(&str, &str)> {
    let bytes = raw.as_bytes();
    if bytes.len() != PREFIX_LEN + 1 + CORE_LEN || bytes[PREFIX_LEN] != b'-' {
        return None;
    }
    let symbol_ok = |b: &u8| b.is_ascii_uppercase() || b.is_ascii_digit();
    if !bytes[..PREFIX_LEN].iter().all(symbol_ok) || !bytes[PREFIX_LEN + 1..].iter().all(symbol_ok)
    {
        return None;
    }
    Some((&raw[..PREFIX_LEN], &raw[PREFIX_LEN + 1..]))
}
