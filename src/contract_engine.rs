//! Service-level-agreement contracts between a provider and a client: every
//! call is charged up front against the client's budget and paid to the
//! provider, while a rolling window of recent call outcomes feeds a
//! success-rate check -- a breach below the agreed target charges the
//! provider a penalty (paid to the client) and, because a breached SLA
//! means the agreement itself has failed, terminates the contract rather
//! than letting it limp on.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::error::{CoreError, CoreResult};
use crate::ids::{self, PREFIX_CONTRACT};
use crate::ledger::Ledger;
use crate::money::Micros;

const DEFAULT_WINDOW_SIZE: usize = 100;
/// Minimum calls observed before SLA enforcement kicks in -- a handful of
/// early failures shouldn't trigger a penalty against an unrepresentative
/// sample.
const MIN_SAMPLE_SIZE: usize = 10;
/// An `Active` contract with no charged call in this long is treated as
/// abandoned, not breached, and terminated without penalty.
const IDLE_EXPIRY: ChronoDuration = ChronoDuration::hours(24);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractStatus {
    Proposed,
    Active,
    Fulfilled,
    Terminated,
}

#[derive(Debug, Clone)]
pub struct Contract {
    pub id: String,
    pub provider: String,
    pub client: String,
    pub service_type: String,
    pub price_per_call: Micros,
    pub buyer_budget: Micros,
    pub total_charged: Micros,
    pub sla_target: f64,
    pub penalty_per_breach: Micros,
    pub calls: VecDeque<bool>,
    pub window_size: usize,
    pub breaches: u64,
    pub status: ContractStatus,
    pub created_at: DateTime<Utc>,
    pub last_call_at: DateTime<Utc>,
}

impl Contract {
    pub fn success_rate(&self) -> Option<f64> {
        if self.calls.len() < MIN_SAMPLE_SIZE {
            return None;
        }
        let successes = self.calls.iter().filter(|s| **s).count();
        Some(successes as f64 / self.calls.len() as f64)
    }
}

pub struct ContractEngine {
    ledger: Arc<Ledger>,
    contracts: Mutex<HashMap<String, Contract>>,
}

impl ContractEngine {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        ContractEngine {
            ledger,
            contracts: Mutex::new(HashMap::new()),
        }
    }

    /// Proposes a new contract, in `Proposed` status until the provider
    /// accepts it via `accept`.
    #[allow(clippy::too_many_arguments)]
    pub fn propose(
        &self,
        provider: &str,
        client: &str,
        service_type: &str,
        price_per_call: Micros,
        buyer_budget: Micros,
        sla_target: f64,
        penalty_per_breach: Micros,
    ) -> Contract {
        let id = ids::mint(PREFIX_CONTRACT);
        let now = Utc::now();
        let contract = Contract {
            id: id.clone(),
            provider: provider.to_string(),
            client: client.to_string(),
            service_type: service_type.to_string(),
            price_per_call,
            buyer_budget,
            total_charged: Micros::ZERO,
            sla_target,
            penalty_per_breach,
            calls: VecDeque::with_capacity(DEFAULT_WINDOW_SIZE),
            window_size: DEFAULT_WINDOW_SIZE,
            breaches: 0,
            status: ContractStatus::Proposed,
            created_at: now,
            last_call_at: now,
        };
        self.contracts.lock().unwrap().insert(id, contract.clone());
        contract
    }

    pub fn get(&self, id: &str) -> CoreResult<Contract> {
        self.contracts.lock().unwrap().get(id).cloned().ok_or(CoreError::NotFound)
    }

    /// Provider accepts a proposed contract, moving it to `Active`.
    pub fn accept(&self, id: &str) -> CoreResult<Contract> {
        let mut contracts = self.contracts.lock().unwrap();
        let contract = contracts.get_mut(id).ok_or(CoreError::NotFound)?;
        if contract.status != ContractStatus::Proposed {
            return Err(CoreError::PolicyViolation);
        }
        contract.status = ContractStatus::Active;
        Ok(contract.clone())
    }

    /// Explicit, manual completion of an active contract once its term is
    /// done -- no more calls will be charged against it afterward.
    pub fn fulfill(&self, id: &str) -> CoreResult<Contract> {
        let mut contracts = self.contracts.lock().unwrap();
        let contract = contracts.get_mut(id).ok_or(CoreError::NotFound)?;
        if contract.status != ContractStatus::Active {
            return Err(CoreError::PolicyViolation);
        }
        contract.status = ContractStatus::Fulfilled;
        Ok(contract.clone())
    }

    /// Charges one call against the client's remaining budget (hold ->
    /// confirm against the client, then credit the provider), records its
    /// outcome in the rolling SLA window, and -- if the success rate has
    /// dropped below `sla_target` -- charges the provider a penalty (capped
    /// at whatever the provider actually has available) and terminates the
    /// contract. Returns the amount charged for the call and, if a breach
    /// fired, the penalty collected.
    pub fn record_call(&self, id: &str, success: bool) -> CoreResult<(Micros, Option<Micros>)> {
        let (provider, client, price_per_call) = {
            let contracts = self.contracts.lock().unwrap();
            let contract = contracts.get(id).ok_or(CoreError::NotFound)?;
            if contract.status != ContractStatus::Active {
                return Err(CoreError::PolicyViolation);
            }
            let projected = contract.total_charged.checked_add(contract.price_per_call).ok_or(CoreError::Internal("charge overflow".into()))?;
            if projected > contract.buyer_budget {
                return Err(CoreError::PolicyViolation);
            }
            (contract.provider.clone(), contract.client.clone(), contract.price_per_call)
        };

        let call_ref = format!("contract-call:{id}:{}", ids::mint("call"));
        self.ledger.hold(&client, price_per_call, &call_ref)?;
        self.ledger.confirm_hold(&client, price_per_call, &call_ref)?;
        self.ledger.deposit(&provider, price_per_call)?;

        let breached = {
            let mut contracts = self.contracts.lock().unwrap();
            let contract = contracts.get_mut(id).ok_or(CoreError::NotFound)?;
            contract.total_charged = contract.total_charged.checked_add(price_per_call).unwrap();
            contract.last_call_at = Utc::now();
            contract.calls.push_back(success);
            while contract.calls.len() > contract.window_size {
                contract.calls.pop_front();
            }
            let breached = contract.success_rate().is_some_and(|rate| rate < contract.sla_target);
            if breached {
                contract.breaches += 1;
            }
            breached
        };

        if !breached {
            return Ok((price_per_call, None));
        }

        let penalty_target = {
            let contracts = self.contracts.lock().unwrap();
            contracts.get(id).ok_or(CoreError::NotFound)?.penalty_per_breach
        };
        let provider_balance = self.ledger.account(&provider).available;
        let penalty = penalty_target.min(provider_balance);
        let collected = if penalty.is_zero() {
            None
        } else {
            self.ledger.spend(&provider, penalty, &format!("sla-penalty:{id}"))?;
            self.ledger.deposit(&client, penalty)?;
            Some(penalty)
        };
        let mut contracts = self.contracts.lock().unwrap();
        if let Some(contract) = contracts.get_mut(id) {
            contract.status = ContractStatus::Terminated;
        }
        Ok((price_per_call, collected))
    }

    /// Terminates any `Active` contract that hasn't had a call charged
    /// against it in over `IDLE_EXPIRY` -- an abandoned agreement, not a
    /// breached one, so no penalty applies. Returns the ids terminated.
    pub fn expire_idle(&self, now: DateTime<Utc>) -> Vec<String> {
        let idle: Vec<String> = {
            let contracts = self.contracts.lock().unwrap();
            contracts
                .values()
                .filter(|c| c.status == ContractStatus::Active && now - c.last_call_at > IDLE_EXPIRY)
                .map(|c| c.id.clone())
                .collect()
        };
        let mut contracts = self.contracts.lock().unwrap();
        for id in &idle {
            if let Some(contract) = contracts.get_mut(id) {
                contract.status = ContractStatus::Terminated;
            }
        }
        idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active_contract(engine: &ContractEngine, sla_target: f64, penalty: Micros) -> Contract {
        let proposed = engine.propose("provider", "client", "inference", Micros::parse("1").unwrap(), Micros::parse("1000").unwrap(), sla_target, penalty);
        engine.accept(&proposed.id).unwrap()
    }

    #[test]
    fn below_min_sample_no_penalty() {
        let ledger = Arc::new(Ledger::new());
        ledger.deposit("provider", Micros::parse("100").unwrap()).unwrap();
        ledger.deposit("client", Micros::parse("100").unwrap()).unwrap();
        let engine = ContractEngine::new(ledger);
        let contract = active_contract(&engine, 0.99, Micros::parse("1").unwrap());
        for _ in 0..5 {
            assert_eq!(engine.record_call(&contract.id, false).unwrap().1, None);
        }
    }

    #[test]
    fn sustained_failures_trigger_penalty_and_terminate() {
        let ledger = Arc::new(Ledger::new());
        ledger.deposit("provider", Micros::parse("100").unwrap()).unwrap();
        ledger.deposit("client", Micros::parse("100").unwrap()).unwrap();
        let engine = ContractEngine::new(ledger.clone());
        let contract = active_contract(&engine, 0.95, Micros::parse("2").unwrap());
        let mut last = (Micros::ZERO, None);
        for i in 0..20 {
            match engine.record_call(&contract.id, false) {
                Ok(r) => last = r,
                Err(CoreError::PolicyViolation) => {
                    assert!(i > 0, "should terminate only after a breach");
                    break;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(last.1, Some(Micros::parse("2").unwrap()));
        let stored = engine.get(&contract.id).unwrap();
        assert_eq!(stored.status, ContractStatus::Terminated);
    }

    #[test]
    fn healthy_contract_never_penalized() {
        let ledger = Arc::new(Ledger::new());
        ledger.deposit("provider", Micros::parse("100").unwrap()).unwrap();
        ledger.deposit("client", Micros::parse("100").unwrap()).unwrap();
        let engine = ContractEngine::new(ledger);
        let contract = active_contract(&engine, 0.90, Micros::parse("1").unwrap());
        for _ in 0..50 {
            assert_eq!(engine.record_call(&contract.id, true).unwrap().1, None);
        }
        let stored = engine.get(&contract.id).unwrap();
        assert_eq!(stored.status, ContractStatus::Active);
    }

    #[test]
    fn window_is_bounded() {
        let ledger = Arc::new(Ledger::new());
        ledger.deposit("provider", Micros::parse("1000").unwrap()).unwrap();
        ledger.deposit("client", Micros::parse("1000").unwrap()).unwrap();
        let engine = ContractEngine::new(ledger);
        let contract = active_contract(&engine, 0.5, Micros::parse("1").unwrap());
        for _ in 0..150 {
            let _ = engine.record_call(&contract.id, true);
        }
        let stored = engine.get(&contract.id).unwrap();
        assert_eq!(stored.calls.len(), DEFAULT_WINDOW_SIZE);
    }

    #[test]
    fn call_rejected_once_budget_exhausted() {
        let ledger = Arc::new(Ledger::new());
        ledger.deposit("provider", Micros::parse("100").unwrap()).unwrap();
        ledger.deposit("client", Micros::parse("100").unwrap()).unwrap();
        let engine = ContractEngine::new(ledger);
        let proposed = engine.propose("provider", "client", "inference", Micros::parse("1").unwrap(), Micros::parse("3").unwrap(), 0.5, Micros::parse("1").unwrap());
        let contract = engine.accept(&proposed.id).unwrap();
        for _ in 0..3 {
            engine.record_call(&contract.id, true).unwrap();
        }
        assert_eq!(engine.record_call(&contract.id, true).unwrap_err(), CoreError::PolicyViolation);
    }

    #[test]
    fn penalty_is_capped_at_providers_available_balance() {
        let ledger = Arc::new(Ledger::new());
        ledger.deposit("provider", Micros::parse("1").unwrap()).unwrap();
        ledger.deposit("client", Micros::parse("100").unwrap()).unwrap();
        let engine = ContractEngine::new(ledger.clone());
        // price_per_call 0 keeps the provider's balance from growing across
        // calls so the eventual penalty is forced to partially apply.
        let proposed = engine.propose("provider", "client", "inference", Micros::ZERO, Micros::parse("1000").unwrap(), 0.95, Micros::parse("5").unwrap());
        let contract = engine.accept(&proposed.id).unwrap();
        let mut last = (Micros::ZERO, None);
        for _ in 0..20 {
            match engine.record_call(&contract.id, false) {
                Ok(r) => last = r,
                Err(CoreError::PolicyViolation) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(last.1, Some(Micros::parse("1").unwrap()));
    }

    #[test]
    fn idle_active_contract_is_expired_without_penalty() {
        let ledger = Arc::new(Ledger::new());
        ledger.deposit("provider", Micros::parse("100").unwrap()).unwrap();
        ledger.deposit("client", Micros::parse("100").unwrap()).unwrap();
        let engine = ContractEngine::new(ledger.clone());
        let contract = active_contract(&engine, 0.9, Micros::parse("1").unwrap());

        let expired = engine.expire_idle(Utc::now() + ChronoDuration::hours(1));
        assert!(expired.is_empty(), "fresh contract should not expire yet");

        let far_future = contract.created_at + ChronoDuration::hours(25);
        let expired = engine.expire_idle(far_future);
        assert_eq!(expired, vec![contract.id.clone()]);
        let stored = engine.get(&contract.id).unwrap();
        assert_eq!(stored.status, ContractStatus::Terminated);
        let provider = ledger.account("provider");
        assert_eq!(provider.available, Micros::parse("100").unwrap());
    }

    #[test]
    fn record_call_on_proposed_contract_is_rejected() {
        let ledger = Arc::new(Ledger::new());
        let engine = ContractEngine::new(ledger);
        let proposed = engine.propose("provider", "client", "inference", Micros::parse("1").unwrap(), Micros::parse("10").unwrap(), 0.9, Micros::parse("1").unwrap());
        assert_eq!(engine.record_call(&proposed.id, true).unwrap_err(), CoreError::PolicyViolation);
    }
}
