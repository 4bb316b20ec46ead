//! The gateway proxy: resolves a registered service slug to its upstream
//! URL, validates that URL isn't pointed at internal infrastructure (SSRF
//! guard), reserves the call's price against the caller's account, forwards
//! the request, and settles the hold for what the call actually cost.
//! Network I/O is behind the `HttpForwarder` trait (the `reqwest`-backed
//! implementation is the production wiring) so this module's policy logic
//! is unit-testable without a live HTTP stack.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use url::Url;

use crate::bounded_cache::BoundedSet;
use crate::error::{CoreError, CoreResult};
use crate::ids::{self, PREFIX_GATEWAY_SESSION, PREFIX_RECEIPT};
use crate::ledger::Ledger;
use crate::money::Micros;

#[derive(Debug, Clone)]
pub struct ServiceRecord {
    pub slug: String,
    pub owner_agent_id: String,
    pub upstream_url: String,
    pub price_per_call: Micros,
    pub service_type: String,
    /// Set once the owner's identity/ownership of the upstream has been
    /// manually or automatically attested; unverified services still work,
    /// they just lose every tiebreak against a verified one.
    pub verified: bool,
    /// Rolling success-rate-derived score in `[0, 1]`; starts neutral.
    pub reputation: f64,
}

#[derive(Default)]
pub struct ServiceRegistry {
    services: Mutex<HashMap<String, ServiceRecord>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, slug: &str, owner_agent_id: &str, upstream_url: &str, price_per_call: Micros, service_type: &str) -> CoreResult<ServiceRecord> {
        validate_upstream_url(upstream_url)?;
        let mut services = self.services.lock().unwrap();
        if services.contains_key(slug) {
            return Err(CoreError::SlugTaken);
        }
        let record = ServiceRecord {
            slug: slug.to_string(),
            owner_agent_id: owner_agent_id.to_string(),
            upstream_url: upstream_url.to_string(),
            price_per_call,
            service_type: service_type.to_string(),
            verified: false,
            reputation: 0.5,
        };
        services.insert(slug.to_string(), record.clone());
        Ok(record)
    }

    pub fn resolve(&self, slug: &str) -> CoreResult<ServiceRecord> {
        self.services.lock().unwrap().get(slug).cloned().ok_or(CoreError::NotFound)
    }

    pub fn mark_verified(&self, slug: &str) -> CoreResult<ServiceRecord> {
        let mut services = self.services.lock().unwrap();
        let record = services.get_mut(slug).ok_or(CoreError::NotFound)?;
        record.verified = true;
        Ok(record.clone())
    }

    pub fn set_reputation(&self, slug: &str, reputation: f64) -> CoreResult<ServiceRecord> {
        let mut services = self.services.lock().unwrap();
        let record = services.get_mut(slug).ok_or(CoreError::NotFound)?;
        record.reputation = reputation.clamp(0.0, 1.0);
        Ok(record.clone())
    }

    /// Picks the best candidate offering `service_type` at or under
    /// `max_price`: verified services first, then by descending reputation,
    /// then by ascending price.
    pub fn select_for_type(&self, service_type: &str, max_price: Micros) -> CoreResult<ServiceRecord> {
        self.services
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.service_type == service_type && s.price_per_call <= max_price)
            .max_by(|a, b| {
                a.verified
                    .cmp(&b.verified)
                    .then_with(|| a.reputation.partial_cmp(&b.reputation).unwrap_or(std::cmp::Ordering::Equal))
                    .then_with(|| b.price_per_call.cmp(&a.price_per_call))
            })
            .cloned()
            .ok_or(CoreError::NotFound)
    }

    /// Coarse fleet stats for a periodic observability snapshot: service
    /// count and mean reputation across the registry.
    pub fn stats(&self) -> (usize, f64) {
        let services = self.services.lock().unwrap();
        if services.is_empty() {
            return (0, 0.0);
        }
        let sum: f64 = services.values().map(|s| s.reputation).sum();
        (services.len(), sum / services.len() as f64)
    }
}

/// Rejects URLs that resolve (by literal host, not DNS -- DNS resolution
/// happens at actual connect time and is the forwarder's problem) to
/// loopback, link-local, private, or non-http(s) targets, so a registered
/// service can't be used to reach the gateway's own internal network.
pub fn validate_upstream_url(raw: &str) -> CoreResult<()> {
    let url = Url::parse(raw).map_err(|_| CoreError::SsrfBlocked)?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(CoreError::SsrfBlocked);
    }
    let host = url.host_str().ok_or(CoreError::SsrfBlocked)?;
    if host == "localhost" {
        return Err(CoreError::SsrfBlocked);
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_blocked_ip(ip) {
            return Err(CoreError::SsrfBlocked);
        }
    }
    Ok(())
}

fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified() || v4.is_broadcast()
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified() || (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

/// A §6 402-payment challenge: a paywall issues this for an unpaid call and
/// expects either a session-key-authorized spend or an on-chain payment
/// proof referencing its nonce in return.
#[derive(Debug, Clone)]
pub struct PaywallChallenge {
    pub price: Micros,
    pub currency: &'static str,
    pub chain_id: u64,
    pub recipient: String,
    pub contract: String,
    pub description: String,
    pub valid_for: Duration,
    pub nonce: String,
    pub issued_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PaymentProof {
    pub tx_hash: String,
    pub sender: String,
    pub nonce: String,
    pub timestamp: DateTime<Utc>,
}

pub struct Paywall {
    nonces: Mutex<BoundedSet<String>>,
    chain_id: u64,
    contract: String,
}

fn is_hex_of_len(s: &str, prefix_len: usize, hex_len: usize) -> bool {
    s.len() == prefix_len + hex_len
        && s.starts_with("0x")
        && s[2..].bytes().all(|b| b.is_ascii_hexdigit())
}

impl Paywall {
    pub fn new(chain_id: u64, contract: &str) -> Self {
        Paywall {
            nonces: Mutex::new(BoundedSet::new(500_000, Duration::from_secs(600))),
            chain_id,
            contract: contract.to_string(),
        }
    }

    pub fn issue_challenge(&self, price: Micros, recipient: &str, description: &str, valid_for: Duration) -> PaywallChallenge {
        let nonce = ids::mint("nonce");
        // The nonce is reserved (not just generated) at issuance so a
        // replayed proof against a not-yet-swept nonce is rejected the same
        // way a swept one is -- see the reject-and-reissue Open Question.
        self.nonces.lock().unwrap().insert(nonce.clone());
        PaywallChallenge {
            price,
            currency: "USDC",
            chain_id: self.chain_id,
            recipient: recipient.to_string(),
            contract: self.contract.clone(),
            description: description.to_string(),
            valid_for,
            nonce,
            issued_at: Utc::now(),
        }
    }

    /// Validates a payment proof's shape and freshness. Does not itself
    /// check the on-chain receipt -- that is the caller's job via an
    /// injected EVM client, kept out of this pure validation path.
    pub fn validate_proof(&self, challenge: &PaywallChallenge, proof: &PaymentProof, now: DateTime<Utc>) -> CoreResult<()> {
        if !is_hex_of_len(&proof.tx_hash, 2, 64) {
            return Err(CoreError::TxHashInvalid);
        }
        if !is_hex_of_len(&proof.sender, 2, 40) {
            return Err(CoreError::InvalidPaymentProof);
        }
        if proof.nonce != challenge.nonce {
            return Err(CoreError::InvalidPaymentProof);
        }
        let drift = (now - proof.timestamp).num_seconds().abs();
        if drift as u64 > challenge.valid_for.as_secs() {
            return Err(CoreError::InvalidPaymentProof);
        }
        let mut nonces = self.nonces.lock().unwrap();
        if !nonces.contains(&proof.nonce) {
            // Already swept from the bounded cache (TTL or capacity
            // eviction) or never issued -- reject and let the client
            // request a fresh challenge rather than guess intent.
            return Err(CoreError::InvalidPaymentProof);
        }
        // One-shot: remove so this exact proof can't be replayed.
        nonces.insert(format!("consumed:{}", proof.nonce));
        Ok(())
    }
}

#[async_trait]
pub trait HttpForwarder: Send + Sync {
    async fn forward(&self, url: &str) -> CoreResult<u16>;
}

/// Production forwarder: a plain `GET` against the resolved upstream,
/// returning its status code. The gateway only needs to know the call
/// succeeded or not to settle the hold -- the response body is the
/// caller's concern, not this crate's.
pub struct ReqwestForwarder {
    client: reqwest::Client,
}

impl ReqwestForwarder {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> CoreResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .map_err(|_| CoreError::Internal("failed to build http client".into()))?;
        Ok(ReqwestForwarder { client })
    }
}

#[async_trait]
impl HttpForwarder for ReqwestForwarder {
    async fn forward(&self, url: &str) -> CoreResult<u16> {
        let resp = self.client.get(url).send().await.map_err(|_| CoreError::Unavailable)?;
        let status = resp.status();
        if status.is_success() {
            Ok(status.as_u16())
        } else {
            Err(CoreError::Unavailable)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewaySessionStatus {
    Open,
    Closed,
    Expired,
}

/// A multi-call gateway session: a single up-front hold sized to cover up
/// to `calls_allowed` calls at `price_per_call`, drawn down one call at a
/// time via `tick_settle` so the session's ledger reference stays open
/// across calls instead of being consumed (and thus needing a fresh hold)
/// on every request. The bearer token handed back to the caller at
/// creation is this session's own id -- a one-time credential scoped to
/// exactly this payer/service/budget triple.
#[derive(Debug, Clone)]
pub struct GatewaySession {
    pub id: String,
    pub payer: String,
    pub service_slug: String,
    pub price_per_call: Micros,
    pub calls_allowed: u32,
    pub calls_used: u32,
    pub take_rate_bps: u32,
    pub status: GatewaySessionStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

pub struct GatewayProxy<F: HttpForwarder> {
    ledger: Arc<Ledger>,
    registry: Arc<ServiceRegistry>,
    forwarder: Arc<F>,
    sessions: Mutex<HashMap<String, GatewaySession>>,
    platform_fee_address: String,
}

impl<F: HttpForwarder> GatewayProxy<F> {
    pub fn new(ledger: Arc<Ledger>, registry: Arc<ServiceRegistry>, forwarder: Arc<F>) -> Self {
        GatewayProxy {
            ledger,
            registry,
            forwarder,
            sessions: Mutex::new(HashMap::new()),
            platform_fee_address: "platform:gateway-fees".to_string(),
        }
    }

    /// Overrides the default platform fee address, e.g. with one sourced
    /// from configuration instead of the built-in literal.
    pub fn with_platform_fee_address(mut self, address: String) -> Self {
        self.platform_fee_address = address;
        self
    }

    /// Reserve -> forward -> settle, matching the spec's rule that
    /// side-effecting calls must not happen while holding an account lock:
    /// the hold and the final settlement each take the ledger's lock only
    /// for their own brief critical section; the network call in between
    /// holds nothing.
    pub async fn call(&self, payer: &str, slug: &str) -> CoreResult<String> {
        let service = self.registry.resolve(slug)?;
        let call_id = ids::mint(PREFIX_RECEIPT);
        self.ledger.hold(payer, service.price_per_call, &call_id)?;
        let result = self.forwarder.forward(&service.upstream_url).await;
        match result {
            Ok(_status) => {
                self.ledger.confirm_hold(payer, service.price_per_call, &call_id)?;
                Ok(call_id)
            }
            Err(e) => {
                self.ledger.release_hold(payer, &call_id)?;
                Err(e)
            }
        }
    }

    /// Opens a multi-call session against the best candidate for
    /// `service_type` at or under `max_price`, holding `max_price *
    /// calls_allowed` against `payer` up front. Returns the bearer token
    /// (the session id) the caller presents to `call_with_session`.
    pub fn create_session(
        &self,
        payer: &str,
        service_type: &str,
        max_price: Micros,
        calls_allowed: u32,
        take_rate_bps: u32,
        ttl: chrono::Duration,
    ) -> CoreResult<GatewaySession> {
        let service = self.registry.select_for_type(service_type, max_price)?;
        let total_hold = service
            .price_per_call
            .checked_mul_u64(calls_allowed as u64)
            .ok_or(CoreError::Internal("gateway session hold overflow".into()))?;
        let id = ids::mint_secret(PREFIX_GATEWAY_SESSION);
        self.ledger.hold(payer, total_hold, &id)?;
        let now = Utc::now();
        let session = GatewaySession {
            id: id.clone(),
            payer: payer.to_string(),
            service_slug: service.slug,
            price_per_call: service.price_per_call,
            calls_allowed,
            calls_used: 0,
            take_rate_bps,
            status: GatewaySessionStatus::Open,
            created_at: now,
            expires_at: now + ttl,
        };
        self.sessions.lock().unwrap().insert(id, session.clone());
        Ok(session)
    }

    pub fn get_session(&self, token: &str) -> CoreResult<GatewaySession> {
        self.sessions.lock().unwrap().get(token).cloned().ok_or(CoreError::NotFound)
    }

    /// Spends one call against an open session: forwards the request, and
    /// on success settles one `price_per_call` increment out of the
    /// session's hold to the service owner, skimming `take_rate_bps` of
    /// that increment to the platform fee account. A failed forward
    /// consumes no budget. Closes the session (refunding any unused
    /// remainder) once `calls_used` reaches `calls_allowed`.
    pub async fn call_with_session(&self, token: &str) -> CoreResult<String> {
        let (payer, service_slug, price_per_call, take_rate_bps) = {
            let mut sessions = self.sessions.lock().unwrap();
            let session = sessions.get_mut(token).ok_or(CoreError::NotFound)?;
            if session.status != GatewaySessionStatus::Open {
                return Err(CoreError::PolicyViolation);
            }
            if Utc::now() >= session.expires_at {
                session.status = GatewaySessionStatus::Expired;
                return Err(CoreError::PolicyViolation);
            }
            if session.calls_used >= session.calls_allowed {
                return Err(CoreError::PolicyViolation);
            }
            (session.payer.clone(), session.service_slug.clone(), session.price_per_call, session.take_rate_bps)
        };
        let service = self.registry.resolve(&service_slug)?;
        self.forwarder.forward(&service.upstream_url).await?;
        self.ledger.tick_settle(&payer, &service.owner_agent_id, price_per_call, token)?;
        let (fee, _net) = price_per_call.take_fee_bps(take_rate_bps);
        if !fee.is_zero() {
            self.ledger.spend(&service.owner_agent_id, fee, &format!("{token}-fee"))?;
            self.ledger.deposit(&self.platform_fee_address, fee)?;
        }
        let receipt_id = ids::mint(PREFIX_RECEIPT);
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(session) = sessions.get_mut(token) {
            session.calls_used += 1;
            if session.calls_used >= session.calls_allowed {
                session.status = GatewaySessionStatus::Closed;
                drop(sessions);
                self.ledger.confirm_hold(&payer, Micros::ZERO, token)?;
            }
        }
        Ok(receipt_id)
    }

    /// Closes every session past its `expires_at` that's still `Open`,
    /// refunding whatever remains of its hold. Meant to run on the
    /// scheduler alongside the other expiry sweeps.
    pub fn expire_stale_sessions(&self, now: DateTime<Utc>) -> Vec<String> {
        let expired: Vec<(String, String)> = {
            let sessions = self.sessions.lock().unwrap();
            sessions
                .values()
                .filter(|s| s.status == GatewaySessionStatus::Open && now >= s.expires_at)
                .map(|s| (s.id.clone(), s.payer.clone()))
                .collect()
        };
        let mut closed = Vec::new();
        for (id, payer) in expired {
            if self.ledger.confirm_hold(&payer, Micros::ZERO, &id).is_ok() {
                if let Some(session) = self.sessions.lock().unwrap().get_mut(&id) {
                    session.status = GatewaySessionStatus::Expired;
                }
                closed.push(id);
            }
        }
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysOk;
    #[async_trait]
    impl HttpForwarder for AlwaysOk {
        async fn forward(&self, _url: &str) -> CoreResult<u16> {
            Ok(200)
        }
    }

    struct AlwaysFail;
    #[async_trait]
    impl HttpForwarder for AlwaysFail {
        async fn forward(&self, _url: &str) -> CoreResult<u16> {
            Err(CoreError::Unavailable)
        }
    }

    #[test]
    fn rejects_loopback_and_private_urls() {
        assert_eq!(validate_upstream_url("http://127.0.0.1/x").unwrap_err(), CoreError::SsrfBlocked);
        assert_eq!(validate_upstream_url("http://10.0.0.5/x").unwrap_err(), CoreError::SsrfBlocked);
        assert_eq!(validate_upstream_url("http://localhost/x").unwrap_err(), CoreError::SsrfBlocked);
        assert_eq!(validate_upstream_url("ftp://example.com/x").unwrap_err(), CoreError::SsrfBlocked);
    }

    #[test]
    fn accepts_public_https_url() {
        assert!(validate_upstream_url("https://api.example.com/v1").is_ok());
    }

    #[test]
    fn register_rejects_duplicate_slug() {
        let registry = ServiceRegistry::new();
        registry.register("weather", "agent_1", "https://weather.example.com", Micros::parse("0.01").unwrap(), "weather").unwrap();
        let err = registry
            .register("weather", "agent_2", "https://other.example.com", Micros::parse("0.02").unwrap(), "weather")
            .unwrap_err();
        assert_eq!(err, CoreError::SlugTaken);
    }

    #[tokio::test]
    async fn successful_call_settles_full_price() {
        let ledger = Arc::new(Ledger::new());
        ledger.deposit("payer", Micros::parse("10").unwrap()).unwrap();
        let registry = Arc::new(ServiceRegistry::new());
        registry.register("svc", "owner", "https://svc.example.com", Micros::parse("1").unwrap(), "api").unwrap();
        let proxy = GatewayProxy::new(ledger.clone(), registry, Arc::new(AlwaysOk));
        proxy.call("payer", "svc").await.unwrap();
        let payer = ledger.account("payer");
        assert_eq!(payer.available, Micros::parse("9").unwrap());
        assert_eq!(payer.held, Micros::ZERO);
    }

    #[tokio::test]
    async fn failed_forward_releases_hold() {
        let ledger = Arc::new(Ledger::new());
        ledger.deposit("payer", Micros::parse("10").unwrap()).unwrap();
        let registry = Arc::new(ServiceRegistry::new());
        registry.register("svc", "owner", "https://svc.example.com", Micros::parse("1").unwrap(), "api").unwrap();
        let proxy = GatewayProxy::new(ledger.clone(), registry, Arc::new(AlwaysFail));
        assert!(proxy.call("payer", "svc").await.is_err());
        let payer = ledger.account("payer");
        assert_eq!(payer.available, Micros::parse("10").unwrap());
    }

    #[test]
    fn select_for_type_prefers_verified_then_reputation_then_price() {
        let registry = ServiceRegistry::new();
        registry.register("cheap-unverified", "a1", "https://a.example.com", Micros::parse("0.01").unwrap(), "weather").unwrap();
        registry.register("pricier-verified", "a2", "https://b.example.com", Micros::parse("0.05").unwrap(), "weather").unwrap();
        registry.mark_verified("pricier-verified").unwrap();
        let picked = registry.select_for_type("weather", Micros::parse("1").unwrap()).unwrap();
        assert_eq!(picked.slug, "pricier-verified");
    }

    #[test]
    fn select_for_type_excludes_services_over_max_price() {
        let registry = ServiceRegistry::new();
        registry.register("pricey", "a1", "https://a.example.com", Micros::parse("5").unwrap(), "weather").unwrap();
        let err = registry.select_for_type("weather", Micros::parse("1").unwrap()).unwrap_err();
        assert_eq!(err, CoreError::NotFound);
    }

    #[test]
    fn stats_averages_reputation_across_registered_services() {
        let registry = ServiceRegistry::new();
        assert_eq!(registry.stats(), (0, 0.0));
        registry.register("a", "a1", "https://a.example.com", Micros::parse("1").unwrap(), "weather").unwrap();
        registry.register("b", "a2", "https://b.example.com", Micros::parse("1").unwrap(), "weather").unwrap();
        registry.set_reputation("b", 0.9).unwrap();
        let (count, avg) = registry.stats();
        assert_eq!(count, 2);
        assert!((avg - 0.7).abs() < 1e-9);
    }

    #[tokio::test]
    async fn session_call_settles_per_call_and_skims_take_rate() {
        let ledger = Arc::new(Ledger::new());
        ledger.deposit("payer", Micros::parse("10").unwrap()).unwrap();
        let registry = Arc::new(ServiceRegistry::new());
        registry.register("svc", "owner", "https://svc.example.com", Micros::parse("1").unwrap(), "api").unwrap();
        let proxy = GatewayProxy::new(ledger.clone(), registry, Arc::new(AlwaysOk));
        let session = proxy
            .create_session("payer", "api", Micros::parse("1").unwrap(), 3, 1000, chrono::Duration::minutes(5))
            .unwrap();
        let payer_after_hold = ledger.account("payer");
        assert_eq!(payer_after_hold.held, Micros::parse("3").unwrap());

        proxy.call_with_session(&session.id).await.unwrap();
        let owner = ledger.account("owner");
        // 1.0 charged, 10% (1000 bps) skimmed to the platform fee account.
        assert_eq!(owner.available, Micros::parse("0.9").unwrap());
        let platform = ledger.account("platform:gateway-fees");
        assert_eq!(platform.available, Micros::parse("0.1").unwrap());
    }

    #[tokio::test]
    async fn session_closes_and_refunds_after_last_call() {
        let ledger = Arc::new(Ledger::new());
        ledger.deposit("payer", Micros::parse("10").unwrap()).unwrap();
        let registry = Arc::new(ServiceRegistry::new());
        registry.register("svc", "owner", "https://svc.example.com", Micros::parse("1").unwrap(), "api").unwrap();
        let proxy = GatewayProxy::new(ledger.clone(), registry, Arc::new(AlwaysOk));
        let session = proxy
            .create_session("payer", "api", Micros::parse("1").unwrap(), 1, 0, chrono::Duration::minutes(5))
            .unwrap();
        proxy.call_with_session(&session.id).await.unwrap();
        let refreshed = proxy.get_session(&session.id).unwrap();
        assert_eq!(refreshed.status, GatewaySessionStatus::Closed);
        let payer = ledger.account("payer");
        assert_eq!(payer.held, Micros::ZERO);
        assert_eq!(payer.available, Micros::parse("9").unwrap());
    }

    #[tokio::test]
    async fn expired_session_rejects_further_calls() {
        let ledger = Arc::new(Ledger::new());
        ledger.deposit("payer", Micros::parse("10").unwrap()).unwrap();
        let registry = Arc::new(ServiceRegistry::new());
        registry.register("svc", "owner", "https://svc.example.com", Micros::parse("1").unwrap(), "api").unwrap();
        let proxy = GatewayProxy::new(ledger.clone(), registry, Arc::new(AlwaysOk));
        let session = proxy
            .create_session("payer", "api", Micros::parse("1").unwrap(), 2, 0, chrono::Duration::seconds(-1))
            .unwrap();
        let err = proxy.call_with_session(&session.id).await.unwrap_err();
        assert_eq!(err, CoreError::PolicyViolation);
    }

    #[test]
    fn validate_proof_accepts_well_formed_fresh_proof() {
        let paywall = Paywall::new(1, "0x0000000000000000000000000000000000000001");
        let challenge = paywall.issue_challenge(Micros::parse("1").unwrap(), "0x1111111111111111111111111111111111111111", "api call", Duration::from_secs(300));
        let proof = PaymentProof {
            tx_hash: format!("0x{}", "a".repeat(64)),
            sender: format!("0x{}", "b".repeat(40)),
            nonce: challenge.nonce.clone(),
            timestamp: challenge.issued_at,
        };
        assert!(paywall.validate_proof(&challenge, &proof, challenge.issued_at).is_ok());
    }

    #[test]
    fn validate_proof_rejects_malformed_tx_hash() {
        let paywall = Paywall::new(1, "0x0000000000000000000000000000000000000001");
        let challenge = paywall.issue_challenge(Micros::parse("1").unwrap(), "0x1111111111111111111111111111111111111111", "api call", Duration::from_secs(300));
        let proof = PaymentProof {
            tx_hash: "not-a-hash".into(),
            sender: format!("0x{}", "b".repeat(40)),
            nonce: challenge.nonce.clone(),
            timestamp: challenge.issued_at,
        };
        assert_eq!(paywall.validate_proof(&challenge, &proof, challenge.issued_at).unwrap_err(), CoreError::TxHashInvalid);
    }

    #[test]
    fn validate_proof_rejects_stale_timestamp() {
        let paywall = Paywall::new(1, "0x0000000000000000000000000000000000000001");
        let challenge = paywall.issue_challenge(Micros::parse("1").unwrap(), "0x1111111111111111111111111111111111111111", "api call", Duration::from_secs(60));
        let proof = PaymentProof {
            tx_hash: format!("0x{}", "a".repeat(64)),
            sender: format!("0x{}", "b".repeat(40)),
            nonce: challenge.nonce.clone(),
            timestamp: challenge.issued_at,
        };
        let far_later = challenge.issued_at + chrono::Duration::seconds(120);
        assert_eq!(paywall.validate_proof(&challenge, &proof, far_later).unwrap_err(), CoreError::InvalidPaymentProof);
    }

    #[test]
    fn validate_proof_rejects_nonce_replay() {
        let paywall = Paywall::new(1, "0x0000000000000000000000000000000000000001");
        let challenge = paywall.issue_challenge(Micros::parse("1").unwrap(), "0x1111111111111111111111111111111111111111", "api call", Duration::from_secs(300));
        let proof = PaymentProof {
            tx_hash: format!("0x{}", "a".repeat(64)),
            sender: format!("0x{}", "b".repeat(40)),
            nonce: challenge.nonce.clone(),
            timestamp: challenge.issued_at,
        };
        paywall.validate_proof(&challenge, &proof, challenge.issued_at).unwrap();
        assert_eq!(
            paywall.validate_proof(&challenge, &proof, challenge.issued_at).unwrap_err(),
            CoreError::InvalidPaymentProof
        );
    }
}
