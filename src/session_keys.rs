//! Session-key authorization: scoped, signed, budget-limited spending
//! tokens. A session key is an independent secp256k1 keypair (the same
//! curve the ledger's EVM side uses) whose signer address is bound to a
//! policy -- allowed recipients/services, a per-tx cap, a lifetime total
//! cap, and a TTL. Delegation forms a tree: a session key may mint child
//! keys with a narrower policy, and revoking a key cascades to every
//! descendant via DFS over a parent->children index, mirroring the
//! teacher's `WatcherManager`-style aggregate-then-cascade bookkeeping.
//!
//! The canonical message a client signs for a spend is
//! `key_id\nto\namount\nnonce\nchain_id` and is verified here by recovering
//! the signer address from an EIP-191 personal-sign signature.

use std::collections::HashMap;

use alloy::primitives::Address;
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::{Signature, Signer};
use chrono::{DateTime, Utc};

use crate::bounded_cache::BoundedSet;
use crate::error::{CoreError, CoreResult};
use crate::ids::{self, PREFIX_SESSION_KEY};
use crate::money::Micros;

#[derive(Debug, Clone, Default)]
pub struct SessionKeyPolicy {
    pub allowed_recipients: Option<Vec<String>>,
    pub allowed_services: Option<Vec<String>>,
    pub max_per_tx: Micros,
    pub max_total: Micros,
}

#[derive(Debug, Clone)]
pub struct SessionKey {
    pub id: String,
    pub owner_address: String,
    pub signer_address: Address,
    pub policy: SessionKeyPolicy,
    pub parent_id: Option<String>,
    pub spent_total: Micros,
    pub nonce_high_watermark: u64,
    pub revoked: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SessionKey {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && now < self.expires_at
    }

    /// Remaining spend headroom under `policy.max_total`; zero once the key
    /// has spent its entire lifetime budget.
    pub fn remaining_budget(&self) -> Micros {
        self.policy.max_total.checked_sub(self.spent_total).unwrap_or(Micros::ZERO)
    }

    /// Fraction of `max_total` already spent, in `[0, 1]`; a key with no
    /// budget configured reports 0.0 (there's nothing to warn about).
    pub fn budget_used_fraction(&self) -> f64 {
        if self.policy.max_total.is_zero() {
            return 0.0;
        }
        (self.spent_total.0 as f64 / self.policy.max_total.0 as f64).clamp(0.0, 1.0)
    }

    /// Fraction of the key's granted lifetime elapsed as of `now`, in `[0, 1]`.
    pub fn lifetime_used_fraction(&self, now: DateTime<Utc>) -> f64 {
        let total = (self.expires_at - self.created_at).num_seconds() as f64;
        if total <= 0.0 {
            return 1.0;
        }
        let elapsed = (now - self.created_at).num_seconds() as f64;
        (elapsed / total).clamp(0.0, 1.0)
    }
}

pub fn canonical_message(key_id: &str, to: &str, amount: Micros, nonce: u64, chain_id: u64) -> String {
    format!("{key_id}\n{to}\n{}\n{nonce}\n{chain_id}", amount.format())
}

pub struct SessionKeyManager {
    keys: HashMap<String, SessionKey>,
    children: HashMap<String, Vec<String>>,
    nonce_seen: BoundedSet<(String, u64)>,
}

impl Default for SessionKeyManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionKeyManager {
    pub fn new() -> Self {
        SessionKeyManager {
            keys: HashMap::new(),
            children: HashMap::new(),
            nonce_seen: BoundedSet::new(100_000, std::time::Duration::from_secs(7 * 86_400)),
        }
    }

    /// Creates a new session key. If `parent_id` is set, the new key is
    /// registered as that key's child for cascading revocation.
    pub fn create(
        &mut self,
        owner_address: &str,
        policy: SessionKeyPolicy,
        ttl: chrono::Duration,
        parent_id: Option<&str>,
    ) -> CoreResult<(String, SessionKey)> {
        if let Some(parent) = parent_id {
            let parent_key = self.keys.get(parent).ok_or(CoreError::KeyNotFound)?;
            if !parent_key.is_active(Utc::now()) {
                return Err(CoreError::PolicyViolation);
            }
        }
        let signer = PrivateKeySigner::random();
        let signer_address = signer.address();
        let id = ids::mint(PREFIX_SESSION_KEY);
        let now = Utc::now();
        let key = SessionKey {
            id: id.clone(),
            owner_address: owner_address.to_string(),
            signer_address,
            policy,
            parent_id: parent_id.map(|s| s.to_string()),
            spent_total: Micros::ZERO,
            nonce_high_watermark: 0,
            revoked: false,
            created_at: now,
            expires_at: now + ttl,
        };
        if let Some(parent) = parent_id {
            self.children.entry(parent.to_string()).or_default().push(id.clone());
        }
        self.keys.insert(id.clone(), key.clone());
        let raw_secret = hex::encode(signer.to_bytes());
        Ok((raw_secret, key))
    }

    pub fn get(&self, key_id: &str) -> CoreResult<&SessionKey> {
        self.keys.get(key_id).ok_or(CoreError::KeyNotFound)
    }

    /// Verifies a signed spend request against the key's signature, nonce
    /// monotonicity, TTL, and policy, and -- only if everything passes --
    /// records the nonce and running total. Does not touch the ledger;
    /// callers combine this with `Ledger::hold`/`spend` under the
    /// reserve-then-execute pattern so EVM side-effects never happen while
    /// holding this manager's lock.
    pub fn authorize(
        &mut self,
        key_id: &str,
        to: &str,
        amount: Micros,
        nonce: u64,
        chain_id: u64,
        signature: &Signature,
    ) -> CoreResult<()> {
        let now = Utc::now();
        let key = self.keys.get(key_id).ok_or(CoreError::KeyNotFound)?;
        if !key.is_active(now) {
            return Err(CoreError::PolicyViolation);
        }
        if nonce <= key.nonce_high_watermark {
            return Err(CoreError::PolicyViolation);
        }
        let message = canonical_message(key_id, to, amount, nonce, chain_id);
        let recovered = signature
            .recover_address_from_msg(message.as_bytes())
            .map_err(|_| CoreError::PolicyViolation)?;
        if recovered != key.signer_address {
            return Err(CoreError::PolicyViolation);
        }
        if let Some(allowed) = &key.policy.allowed_recipients {
            if !allowed.iter().any(|r| r == to) {
                return Err(CoreError::PolicyViolation);
            }
        }
        if amount > key.policy.max_per_tx {
            return Err(CoreError::PolicyViolation);
        }
        let projected_total = key.spent_total.checked_add(amount).ok_or(CoreError::PolicyViolation)?;
        if projected_total > key.policy.max_total {
            return Err(CoreError::PolicyViolation);
        }
        if !self.nonce_seen.insert((key_id.to_string(), nonce)) {
            return Err(CoreError::PolicyViolation);
        }
        let key = self.keys.get_mut(key_id).expect("checked above");
        key.nonce_high_watermark = nonce;
        key.spent_total = projected_total;
        Ok(())
    }

    /// Revokes `key_id` and every descendant reachable through the
    /// parent->children index, depth-first.
    pub fn revoke_cascade(&mut self, key_id: &str) -> CoreResult<Vec<String>> {
        if !self.keys.contains_key(key_id) {
            return Err(CoreError::KeyNotFound);
        }
        let mut revoked = Vec::new();
        let mut stack = vec![key_id.to_string()];
        while let Some(id) = stack.pop() {
            if let Some(key) = self.keys.get_mut(&id) {
                if key.revoked {
                    continue;
                }
                key.revoked = true;
                revoked.push(id.clone());
            }
            if let Some(kids) = self.children.get(&id) {
                stack.extend(kids.iter().cloned());
            }
        }
        Ok(revoked)
    }
}
