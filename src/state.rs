//! The composition root: wires every engine together behind one shared
//! handle and registers the scheduler's periodic tasks. Grounded on the
//! teacher's `main.rs`, which builds `WatcherManager`/`WriterManager`/
//! `ConfirmationTracker` once at startup and races them under one
//! shutdown signal -- here every engine is constructed once into
//! `AppState` and the scheduler races their periodic maintenance tasks
//! the same way.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy::primitives::Address;
use tracing::warn;

use crate::auth::AuthManager;
use crate::config::Config;
use crate::contract_engine::ContractEngine;
use crate::db::Db;
use crate::escrow::EscrowEngine;
use crate::evm::AlloyEvmClient;
use crate::gateway::{GatewayProxy, Paywall, ReqwestForwarder, ServiceRegistry};
use crate::ledger::Ledger;
use crate::metrics::Metrics;
use crate::negotiation::NegotiationEngine;
use crate::rate_limit::RateLimiter;
use crate::risk::RiskWindow;
use crate::scheduler::{PeriodicTask, Scheduler};
use crate::session_keys::SessionKeyManager;
use crate::stream::StreamEngine;
use crate::tenancy::{CreditPolicy, FixedCreditPolicy, TenancyManager};
use crate::watchers::evm::{DepositWatcher, DepositWatcherConfig};

/// Risk windows are keyed by account address; each account's history is
/// consulted (and appended to) independently, so one lock per account
/// would be ideal, but a single mutex over the map is the same tradeoff
/// the ledger itself makes and keeps this module's code simple -- the
/// risk check is a pure, sub-millisecond computation, so contention here
/// is not the bottleneck the spec worries about (see `risk.rs` docs).
pub struct AppState {
    pub config: Config,
    pub db: Db,
    pub metrics: Metrics,

    pub ledger: Arc<Ledger>,
    pub auth: Mutex<AuthManager>,
    pub session_keys: Mutex<SessionKeyManager>,
    pub risk_windows: Mutex<HashMap<String, RiskWindow>>,

    pub escrows: Arc<EscrowEngine>,
    pub contracts: Arc<ContractEngine>,
    pub streams: Arc<StreamEngine>,

    pub services: Arc<ServiceRegistry>,
    pub paywall: Arc<Paywall>,
    pub gateway: Arc<GatewayProxy<ReqwestForwarder>>,

    pub negotiation: Arc<NegotiationEngine>,
    pub tenancy: Arc<TenancyManager>,
    pub credit_policy: Arc<dyn CreditPolicy>,
    pub rate_limiter: Arc<RateLimiter>,

    /// `None` when `DEPOSIT_WALLET` is unset or malformed -- the watcher
    /// task simply isn't registered, the same way the db pool stays
    /// disabled without `DATABASE_URL`. A `tokio::sync::Mutex` (not the
    /// `std` one everything else here uses) because its only caller holds
    /// the guard across the `.await` in `poll_once`.
    pub deposit_watcher: Option<Arc<tokio::sync::Mutex<DepositWatcher<AlloyEvmClient>>>>,
}

impl AppState {
    pub fn new(config: Config, db: Db) -> Self {
        let ledger = Arc::new(Ledger::new());
        let services = Arc::new(ServiceRegistry::new());
        let forwarder = match ReqwestForwarder::new(config.http_connect_timeout, config.http_request_timeout) {
            Ok(f) => Arc::new(f),
            Err(e) => {
                warn!(error = %e, "failed to build http forwarder with configured timeouts, falling back to defaults");
                Arc::new(ReqwestForwarder::new(Duration::from_secs(5), Duration::from_secs(30)).expect("default timeouts always build a client"))
            }
        };
        let gateway = Arc::new(GatewayProxy::new(ledger.clone(), services.clone(), forwarder).with_platform_fee_address(config.gateway_fee_address.clone()));
        let paywall = Arc::new(Paywall::new(config.chain_id, &config.usdc_contract));
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit_rps, config.rate_limit_rps * 2));
        let negotiation = Arc::new(NegotiationEngine::new(ledger.clone()).with_guarantee_fund_address(config.guarantee_fund_address.clone()));
        let deposit_watcher = Self::build_deposit_watcher(&config, ledger.clone());

        AppState {
            metrics: Metrics::new(),
            ledger: ledger.clone(),
            auth: Mutex::new(AuthManager::new()),
            session_keys: Mutex::new(SessionKeyManager::new()),
            risk_windows: Mutex::new(HashMap::new()),
            escrows: Arc::new(EscrowEngine::new(ledger.clone())),
            contracts: Arc::new(ContractEngine::new(ledger.clone())),
            streams: Arc::new(StreamEngine::new(ledger.clone())),
            services,
            paywall,
            gateway,
            negotiation,
            tenancy: Arc::new(TenancyManager::new()),
            credit_policy: Arc::new(FixedCreditPolicy),
            rate_limiter,
            deposit_watcher,
            config,
            db,
        }
    }

    /// Builds the deposit watcher if `DEPOSIT_WALLET` and `USDC_CONTRACT`
    /// both parse as addresses and an RPC client can be constructed;
    /// otherwise logs why and leaves deposit crediting to whatever out-of-band
    /// process the operator runs instead.
    fn build_deposit_watcher(config: &Config, ledger: Arc<Ledger>) -> Option<Arc<tokio::sync::Mutex<DepositWatcher<AlloyEvmClient>>>> {
        let wallet_raw = config.deposit_wallet.as_ref()?;
        let usdc_contract = match Address::from_str(&config.usdc_contract) {
            Ok(a) => a,
            Err(e) => {
                warn!(error = %e, "invalid USDC_CONTRACT, deposit watcher disabled");
                return None;
            }
        };
        let deposit_wallet = match Address::from_str(wallet_raw) {
            Ok(a) => a,
            Err(e) => {
                warn!(error = %e, "invalid DEPOSIT_WALLET, deposit watcher disabled");
                return None;
            }
        };
        let client = match AlloyEvmClient::new(&config.rpc_url, config.private_key.as_deref()) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "failed to build evm client, deposit watcher disabled");
                return None;
            }
        };
        let watcher_config = DepositWatcherConfig {
            usdc_contract,
            deposit_wallet,
            reorg_depth: config.deposit_reorg_depth,
            poll_interval: Duration::from_secs(config.deposit_poll_interval_secs),
            max_block_range: config.deposit_max_block_range,
        };
        Some(Arc::new(tokio::sync::Mutex::new(DepositWatcher::new(Arc::new(client), ledger, watcher_config, config.deposit_start_block))))
    }

    /// Registers every background maintenance task onto `scheduler`. The
    /// cadences mirror spec §8's scheduler table: frequent for the
    /// stream ticker, coarser for sweep-style reconciliation.
    pub fn register_periodic_tasks(self: &Arc<Self>, scheduler: &mut Scheduler) {
        let streams = self.streams.clone();
        scheduler.register(PeriodicTask::new(
            "stream-stale-reaper",
            Duration::from_secs(30),
            Arc::new(move || {
                let streams = streams.clone();
                Box::pin(async move {
                    let closed = streams.close_stale(chrono::Utc::now());
                    if !closed.is_empty() {
                        tracing::info!(count = closed.len(), "closed stale streams");
                    }
                    Ok(())
                })
            }),
        ));

        let streams = self.streams.clone();
        scheduler.register(PeriodicTask::new(
            "stream-reconcile",
            Duration::from_secs(60),
            Arc::new(move || {
                let streams = streams.clone();
                Box::pin(async move {
                    streams.reconcile_stuck();
                    Ok(())
                })
            }),
        ));

        let escrows = self.escrows.clone();
        scheduler.register(PeriodicTask::new(
            "escrow-auto-release",
            Duration::from_secs(60),
            Arc::new(move || {
                let escrows = escrows.clone();
                Box::pin(async move {
                    let released = escrows.process_auto_releases(chrono::Utc::now());
                    if !released.is_empty() {
                        tracing::info!(count = released.len(), "auto-released escrows");
                    }
                    Ok(())
                })
            }),
        ));

        let contracts = self.contracts.clone();
        scheduler.register(PeriodicTask::new(
            "contract-idle-expiry",
            Duration::from_secs(300),
            Arc::new(move || {
                let contracts = contracts.clone();
                Box::pin(async move {
                    let expired = contracts.expire_idle(chrono::Utc::now());
                    if !expired.is_empty() {
                        tracing::info!(count = expired.len(), "terminated idle contracts");
                    }
                    Ok(())
                })
            }),
        ));

        let gateway = self.gateway.clone();
        scheduler.register(PeriodicTask::new(
            "gateway-session-expiry",
            Duration::from_secs(60),
            Arc::new(move || {
                let gateway = gateway.clone();
                Box::pin(async move {
                    let expired = gateway.expire_stale_sessions(chrono::Utc::now());
                    if !expired.is_empty() {
                        tracing::info!(count = expired.len(), "expired stale gateway sessions");
                    }
                    Ok(())
                })
            }),
        ));

        let negotiation = self.negotiation.clone();
        scheduler.register(PeriodicTask::new(
            "negotiation-rfp-sweep",
            Duration::from_secs(60),
            Arc::new(move || {
                let negotiation = negotiation.clone();
                Box::pin(async move {
                    let swept = negotiation.sweep_expired(chrono::Utc::now());
                    if !swept.is_empty() {
                        tracing::info!(count = swept.len(), "closed expired rfps");
                    }
                    Ok(())
                })
            }),
        ));

        let rate_limiter = self.rate_limiter.clone();
        scheduler.register(PeriodicTask::new(
            "rate-limiter-idle-sweep",
            Duration::from_secs(1800),
            Arc::new(move || {
                let rate_limiter = rate_limiter.clone();
                Box::pin(async move {
                    rate_limiter.sweep_idle();
                    Ok(())
                })
            }),
        ));

        let services = self.services.clone();
        scheduler.register(PeriodicTask::new(
            "reputation-snapshot",
            Duration::from_secs(300),
            Arc::new(move || {
                let services = services.clone();
                Box::pin(async move {
                    let (count, avg_reputation) = services.stats();
                    tracing::info!(count, avg_reputation, "service registry reputation snapshot");
                    Ok(())
                })
            }),
        ));

        let state = self.clone();
        scheduler.register(PeriodicTask::new(
            "db-stats-sampler",
            Duration::from_secs(60),
            Arc::new(move || {
                let state = state.clone();
                Box::pin(async move {
                    state.db.ping().await?;
                    Ok(())
                })
            }),
        ));

        if let Some(watcher) = &self.deposit_watcher {
            let watcher = watcher.clone();
            let deposits_credited = self.metrics.deposits_credited.clone();
            scheduler.register(PeriodicTask::new(
                "deposit-watcher-poll",
                Duration::from_secs(self.config.deposit_poll_interval_secs),
                Arc::new(move || {
                    let watcher = watcher.clone();
                    let deposits_credited = deposits_credited.clone();
                    Box::pin(async move {
                        let credited = watcher.lock().await.poll_once().await?;
                        if credited > 0 {
                            deposits_credited.inc_by(credited);
                        }
                        Ok(())
                    })
                }),
            ));
        }
    }
}
