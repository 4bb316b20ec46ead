//! API-key issuance and validation.
//!
//! Keys are minted as `sk_<64 hex chars>` and only their SHA-256 hash is
//! ever retained server-side -- the raw value is returned once, at
//! issuance, exactly like a session key or a bridge operator's one-time
//! approval hash. The key's public id is `ak_<16 hex chars>` derived from
//! the first 8 bytes of that same raw secret, so the id can be logged and
//! referenced without ever exposing the bearer value it names. Every auth
//! failure -- missing header, malformed key, unknown hash, expired key,
//! revoked key -- collapses to `InvalidApiKey` so a caller probing for
//! which failure mode applies learns nothing (the "anti-oracle" rule).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::error::{CoreError, CoreResult};
use crate::ids::{self, PREFIX_API_KEY, PREFIX_SESSION_KEY};

#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    pub id: String,
    pub tenant_id: String,
    pub owner_agent_id: String,
    pub name: Option<String>,
    pub hash: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used: Option<DateTime<Utc>>,
    pub revoked: bool,
}

pub fn hash_key(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}

/// Manual constant-time byte comparison for secrets (admin secret, etc.) so
/// a short-circuiting `==` can't leak a timing side channel.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[derive(Default)]
pub struct AuthManager {
    by_hash: HashMap<String, ApiKeyRecord>,
}

impl AuthManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mints a new API key for `owner_agent_id` under `tenant_id`, returning
    /// the raw key (shown to the caller exactly once) and the stored record.
    /// The id is derived from the first 8 bytes of the same raw secret, not
    /// minted independently, so the id and the secret can never drift apart.
    pub fn issue(
        &mut self,
        tenant_id: &str,
        owner_agent_id: &str,
        name: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> (String, ApiKeyRecord) {
        let (bytes, raw) = ids::mint_secret_bytes(PREFIX_SESSION_KEY);
        let id = format!("{PREFIX_API_KEY}_{}", hex::encode(&bytes[..8]));
        let record = ApiKeyRecord {
            id,
            tenant_id: tenant_id.to_string(),
            owner_agent_id: owner_agent_id.to_string(),
            name: name.map(|s| s.to_string()),
            hash: hash_key(&raw),
            created_at: Utc::now(),
            expires_at,
            last_used: None,
            revoked: false,
        };
        self.by_hash.insert(record.hash.clone(), record.clone());
        (raw, record)
    }

    /// Validates a raw bearer key, or `None`/malformed, into its record. A
    /// leading `"Bearer "` (as sent in an `Authorization` header) is
    /// stripped before comparison.
    pub fn validate(&self, raw: Option<&str>) -> CoreResult<&ApiKeyRecord> {
        let raw = raw.ok_or(CoreError::NoApiKey)?;
        let raw = raw.strip_prefix("Bearer ").unwrap_or(raw);
        if !raw.starts_with("sk_") || raw.len() < 10 {
            return Err(CoreError::InvalidApiKey);
        }
        let hash = hash_key(raw);
        let record = self.by_hash.get(&hash).ok_or(CoreError::InvalidApiKey)?;
        if record.revoked {
            return Err(CoreError::InvalidApiKey);
        }
        if let Some(expires_at) = record.expires_at {
            if Utc::now() >= expires_at {
                return Err(CoreError::InvalidApiKey);
            }
        }
        Ok(record)
    }

    /// Records that `key_id` was just used to authenticate a request.
    /// Separate from `validate` so the hot validation path never needs
    /// `&mut self` -- callers that hold only a shared lock guard can still
    /// authenticate; this is called afterwards under a brief exclusive lock.
    pub fn touch_last_used(&mut self, key_id: &str) -> CoreResult<()> {
        let record = self.by_hash.values_mut().find(|r| r.id == key_id).ok_or(CoreError::KeyNotFound)?;
        record.last_used = Some(Utc::now());
        Ok(())
    }

    pub fn revoke(&mut self, key_id: &str) -> CoreResult<()> {
        let record = self
            .by_hash
            .values_mut()
            .find(|r| r.id == key_id)
            .ok_or(CoreError::KeyNotFound)?;
        record.revoked = true;
        Ok(())
    }

    pub fn check_owner(&self, record: &ApiKeyRecord, owner_agent_id: &str) -> CoreResult<()> {
        if record.owner_agent_id != owner_agent_id {
            return Err(CoreError::NotOwner);
        }
        Ok(())
    }
}

/// Validates an admin-secret header against configured `ADMIN_SECRET`.
pub fn validate_admin_secret(configured: Option<&str>, provided: Option<&str>) -> CoreResult<()> {
    match (configured, provided) {
        (Some(cfg), Some(p)) if constant_time_eq(cfg, p) => Ok(()),
        _ => Err(CoreError::InvalidApiKey),
    }
}
