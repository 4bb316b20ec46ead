//! Prefixed opaque identifier minting, in the style of the teacher's
//! hex-wrapped identifier types (`types.rs::ChainKey`/`WithdrawHash`): a
//! fixed-width random payload rendered as lowercase hex behind a short,
//! human-legible prefix tag so the entity kind is visible in logs and URLs.

use rand::RngCore;

pub const PREFIX_API_KEY: &str = "ak";
pub const PREFIX_SESSION_KEY: &str = "sk";
pub const PREFIX_ESCROW: &str = "esc";
pub const PREFIX_STREAM: &str = "stream";
pub const PREFIX_CONTRACT: &str = "ctr";
pub const PREFIX_RECEIPT: &str = "rcpt";
pub const PREFIX_COMMITMENT: &str = "cmt";
pub const PREFIX_PREDICTION: &str = "pred";
pub const PREFIX_RISK: &str = "risk";
pub const PREFIX_TENANT: &str = "ten";
pub const PREFIX_GATEWAY_SESSION: &str = "gws";

/// Mint a new identifier `<prefix>_<32 lowercase hex chars>` from 16 random bytes.
pub fn mint(prefix: &str) -> String {
    let mut buf = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut buf);
    format!("{prefix}_{}", hex::encode(buf))
}

/// Mints a 32-byte random secret, returning both the raw bytes and the
/// formatted `<prefix>_<64hex>` string -- callers that need to derive a
/// public id from the same entropy (e.g. API keys, see `auth.rs`) take the
/// bytes; callers that only need the bearer token itself use `mint_secret`.
pub fn mint_secret_bytes(prefix: &str) -> ([u8; 32], String) {
    let mut buf = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut buf);
    let formatted = format!("{prefix}_{}", hex::encode(buf));
    (buf, formatted)
}

/// Session keys carry the raw secret in the id's tail and are never stored
/// raw server-side (see `auth.rs`); this mints the longer `sk_<64hex>` form
/// used for bearer-token session keys per spec §6.
pub fn mint_secret(prefix: &str) -> String {
    mint_secret_bytes(prefix).1
}

/// Validate that an id carries the expected prefix and is well-formed hex.
pub fn has_prefix(id: &str, prefix: &str) -> bool {
    match id.split_once('_') {
        Some((p, tail)) => p == prefix && !tail.is_empty() && tail.bytes().all(|b| b.is_ascii_hexdigit()),
        None => false,
    }
}
