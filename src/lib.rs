pub mod api;
pub mod auth;
pub mod bounded_cache;
pub mod config;
pub mod contract_engine;
pub mod db;
pub mod error;
pub mod escrow;
pub mod evm;
pub mod gateway;
pub mod ids;
pub mod ledger;
pub mod metrics;
pub mod money;
pub mod negotiation;
pub mod rate_limit;
pub mod risk;
pub mod scheduler;
pub mod session_keys;
pub mod state;
pub mod stream;
pub mod tenancy;
pub mod transact;
pub mod watchers;
