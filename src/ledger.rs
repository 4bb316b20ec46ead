//! The double-entry account ledger.
//!
//! Each account tracks `available` (spendable), `held` (reserved against a
//! pending payment), `escrowed` (locked in a buyer-protected hold) and a
//! credit sub-ledger (`credit_used`/`credit_limit`). Every mutation appends
//! an immutable event to the ledger's event log -- mirroring the teacher's
//! insert-a-row-per-observed-chain-event pattern in `db/mod.rs` -- before
//! returning, so the event log and the live balances can never drift apart
//! within a single call.
//!
//! Per-`ref` sequencing (spec invariant): at most one hold or escrow lock may
//! be open for a given reference at a time; `confirm`/`release`/`refund` are
//! terminal and the reference cannot be reused for a new hold afterwards.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::money::Micros;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Account {
    pub address: String,
    pub available: Micros,
    pub held: Micros,
    pub escrowed: Micros,
    pub credit_used: Micros,
    pub credit_limit: Micros,
}

impl Account {
    fn new(address: &str) -> Self {
        Account {
            address: address.to_string(),
            ..Default::default()
        }
    }

    /// Headroom available to spend, counting unused credit.
    pub fn spendable(&self) -> Micros {
        let credit_headroom = self.credit_limit.checked_sub(self.credit_used).unwrap_or(Micros::ZERO);
        self.available.checked_add(credit_headroom).unwrap_or(self.available)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefState {
    HoldOpen,
    EscrowOpen,
    Terminal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LedgerEventKind {
    Deposit,
    Withdraw,
    Spend,
    Refund,
    Hold,
    ConfirmHold,
    ReleaseHold,
    EscrowLock,
    ReleaseEscrow,
    RefundEscrow,
    SetCreditLimit,
    RepayCredit,
    CreditBorrow,
    TickSettle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub seq: u64,
    pub kind: LedgerEventKind,
    pub account: String,
    pub counterparty: Option<String>,
    pub amount: Micros,
    pub reference: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Default)]
struct LedgerState {
    accounts: HashMap<String, Account>,
    refs: HashMap<String, (RefState, Micros)>,
    events: Vec<LedgerEvent>,
    next_seq: u64,
}

pub struct Ledger {
    state: Mutex<LedgerState>,
}

impl Ledger {
    pub fn new() -> Self {
        Ledger {
            state: Mutex::new(LedgerState::default()),
        }
    }

    pub fn account(&self, address: &str) -> Account {
        let state = self.state.lock().unwrap();
        state.accounts.get(address).cloned().unwrap_or_else(|| Account::new(address))
    }

    fn push_event(state: &mut LedgerState, kind: LedgerEventKind, account: &str, counterparty: Option<&str>, amount: Micros, reference: Option<&str>) {
        let seq = state.next_seq;
        state.next_seq += 1;
        state.events.push(LedgerEvent {
            seq,
            kind,
            account: account.to_string(),
            counterparty: counterparty.map(|s| s.to_string()),
            amount,
            reference: reference.map(|s| s.to_string()),
            at: Utc::now(),
        });
    }

    pub fn events(&self) -> Vec<LedgerEvent> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn deposit(&self, address: &str, amount: Micros) -> CoreResult<Account> {
        let mut state = self.state.lock().unwrap();
        let acct = state.accounts.entry(address.to_string()).or_insert_with(|| Account::new(address));
        acct.available = acct.available.checked_add(amount).ok_or(CoreError::Internal("overflow".into()))?;
        let snapshot = acct.clone();
        Self::push_event(&mut state, LedgerEventKind::Deposit, address, None, amount, None);
        Ok(snapshot)
    }

    /// Spends `amount` from `available`, drawing down unused credit headroom
    /// for whatever `available` can't cover. Fails only if `available` plus
    /// remaining credit headroom together are insufficient.
    pub fn spend(&self, address: &str, amount: Micros, reference: &str) -> CoreResult<Account> {
        let mut state = self.state.lock().unwrap();
        let acct = state.accounts.entry(address.to_string()).or_insert_with(|| Account::new(address));
        let from_available = acct.available.min(amount);
        let from_credit = amount.checked_sub(from_available).unwrap_or(Micros::ZERO);
        if !from_credit.is_zero() {
            let headroom = acct.credit_limit.checked_sub(acct.credit_used).unwrap_or(Micros::ZERO);
            if from_credit > headroom {
                return Err(CoreError::InsufficientBalance);
            }
        }
        acct.available = acct.available.checked_sub(from_available).unwrap();
        if !from_credit.is_zero() {
            acct.credit_used = acct.credit_used.checked_add(from_credit).unwrap();
        }
        let snapshot = acct.clone();
        Self::push_event(&mut state, LedgerEventKind::Spend, address, None, amount, Some(reference));
        if !from_credit.is_zero() {
            Self::push_event(&mut state, LedgerEventKind::CreditBorrow, address, None, from_credit, Some(reference));
        }
        Ok(snapshot)
    }

    /// Withdraws `amount` out of `available` entirely, with no counterparty
    /// credit -- the off-ramp side of `deposit`.
    pub fn withdraw(&self, address: &str, amount: Micros) -> CoreResult<Account> {
        let mut state = self.state.lock().unwrap();
        let acct = state.accounts.entry(address.to_string()).or_insert_with(|| Account::new(address));
        if acct.available < amount {
            return Err(CoreError::InsufficientBalance);
        }
        acct.available = acct.available.checked_sub(amount).unwrap();
        let snapshot = acct.clone();
        Self::push_event(&mut state, LedgerEventKind::Withdraw, address, None, amount, None);
        Ok(snapshot)
    }

    pub fn refund(&self, address: &str, amount: Micros, reference: &str) -> CoreResult<Account> {
        let mut state = self.state.lock().unwrap();
        let acct = state.accounts.entry(address.to_string()).or_insert_with(|| Account::new(address));
        acct.available = acct.available.checked_add(amount).ok_or(CoreError::Internal("overflow".into()))?;
        let snapshot = acct.clone();
        Self::push_event(&mut state, LedgerEventKind::Refund, address, None, amount, Some(reference));
        Ok(snapshot)
    }

    fn check_ref_free(state: &LedgerState, reference: &str) -> CoreResult<()> {
        match state.refs.get(reference) {
            Some((RefState::HoldOpen, _)) | Some((RefState::EscrowOpen, _)) => Err(CoreError::ConflictingHold),
            _ => Ok(()),
        }
    }

    pub fn hold(&self, address: &str, amount: Micros, reference: &str) -> CoreResult<Account> {
        let mut state = self.state.lock().unwrap();
        Self::check_ref_free(&state, reference)?;
        let acct = state.accounts.entry(address.to_string()).or_insert_with(|| Account::new(address));
        if acct.available < amount {
            return Err(CoreError::InsufficientBalance);
        }
        acct.available = acct.available.checked_sub(amount).unwrap();
        acct.held = acct.held.checked_add(amount).unwrap();
        let snapshot = acct.clone();
        state.refs.insert(reference.to_string(), (RefState::HoldOpen, amount));
        Self::push_event(&mut state, LedgerEventKind::Hold, address, None, amount, Some(reference));
        Ok(snapshot)
    }

    /// Settle an open hold for `actual` micros (<= the reserved amount); the
    /// unused remainder returns to `available`. Terminal: the reference
    /// cannot be held again afterwards.
    pub fn confirm_hold(&self, address: &str, actual: Micros, reference: &str) -> CoreResult<Account> {
        let mut state = self.state.lock().unwrap();
        let reserved = match state.refs.get(reference) {
            Some((RefState::HoldOpen, reserved)) => *reserved,
            _ => return Err(CoreError::NotFound),
        };
        if actual > reserved {
            return Err(CoreError::Internal("confirmed amount exceeds reserved hold".into()));
        }
        let acct = state.accounts.entry(address.to_string()).or_insert_with(|| Account::new(address));
        acct.held = acct.held.checked_sub(reserved).ok_or(CoreError::Internal("held underflow".into()))?;
        let unused = reserved.checked_sub(actual).unwrap();
        if !unused.is_zero() {
            acct.available = acct.available.checked_add(unused).unwrap();
        }
        let snapshot = acct.clone();
        state.refs.insert(reference.to_string(), (RefState::Terminal, Micros::ZERO));
        Self::push_event(&mut state, LedgerEventKind::ConfirmHold, address, None, actual, Some(reference));
        Ok(snapshot)
    }

    pub fn release_hold(&self, address: &str, reference: &str) -> CoreResult<Account> {
        let mut state = self.state.lock().unwrap();
        let reserved = match state.refs.get(reference) {
            Some((RefState::HoldOpen, reserved)) => *reserved,
            _ => return Err(CoreError::NotFound),
        };
        let acct = state.accounts.entry(address.to_string()).or_insert_with(|| Account::new(address));
        acct.held = acct.held.checked_sub(reserved).ok_or(CoreError::Internal("held underflow".into()))?;
        acct.available = acct.available.checked_add(reserved).unwrap();
        let snapshot = acct.clone();
        state.refs.insert(reference.to_string(), (RefState::Terminal, Micros::ZERO));
        Self::push_event(&mut state, LedgerEventKind::ReleaseHold, address, None, reserved, Some(reference));
        Ok(snapshot)
    }

    /// Moves `amount` directly from `payer`'s held reserve to `payee`'s
    /// available balance against an open hold, without closing the hold --
    /// the streaming micropayment engine's tick settlement. The hold's
    /// remaining reserve shrinks by `amount` each call; it stays `HoldOpen`
    /// until the caller explicitly closes it via `confirm_hold`/
    /// `release_hold` once the stream ends.
    pub fn tick_settle(&self, payer: &str, payee: &str, amount: Micros, reference: &str) -> CoreResult<Micros> {
        let mut state = self.state.lock().unwrap();
        let remaining = match state.refs.get(reference) {
            Some((RefState::HoldOpen, remaining)) => *remaining,
            _ => return Err(CoreError::NotFound),
        };
        if amount > remaining {
            return Err(CoreError::InsufficientHeadroom);
        }
        {
            let payer_acct = state.accounts.entry(payer.to_string()).or_insert_with(|| Account::new(payer));
            payer_acct.held = payer_acct.held.checked_sub(amount).ok_or(CoreError::Internal("held underflow".into()))?;
        }
        {
            let payee_acct = state.accounts.entry(payee.to_string()).or_insert_with(|| Account::new(payee));
            payee_acct.available = payee_acct.available.checked_add(amount).unwrap();
        }
        let new_remaining = remaining.checked_sub(amount).unwrap();
        state.refs.insert(reference.to_string(), (RefState::HoldOpen, new_remaining));
        Self::push_event(&mut state, LedgerEventKind::TickSettle, payer, Some(payee), amount, Some(reference));
        Ok(new_remaining)
    }

    pub fn escrow_lock(&self, buyer: &str, amount: Micros, reference: &str) -> CoreResult<Account> {
        let mut state = self.state.lock().unwrap();
        Self::check_ref_free(&state, reference)?;
        let acct = state.accounts.entry(buyer.to_string()).or_insert_with(|| Account::new(buyer));
        if acct.available < amount {
            return Err(CoreError::InsufficientBalance);
        }
        acct.available = acct.available.checked_sub(amount).unwrap();
        acct.escrowed = acct.escrowed.checked_add(amount).unwrap();
        let snapshot = acct.clone();
        state.refs.insert(reference.to_string(), (RefState::EscrowOpen, amount));
        Self::push_event(&mut state, LedgerEventKind::EscrowLock, buyer, None, amount, Some(reference));
        Ok(snapshot)
    }

    /// Releases an escrow lock to the seller's `available` balance.
    pub fn release_escrow(&self, buyer: &str, seller: &str, reference: &str) -> CoreResult<(Account, Account)> {
        let mut state = self.state.lock().unwrap();
        let reserved = match state.refs.get(reference) {
            Some((RefState::EscrowOpen, reserved)) => *reserved,
            _ => return Err(CoreError::NotFound),
        };
        {
            let buyer_acct = state.accounts.entry(buyer.to_string()).or_insert_with(|| Account::new(buyer));
            buyer_acct.escrowed = buyer_acct.escrowed.checked_sub(reserved).ok_or(CoreError::Internal("escrow underflow".into()))?;
        }
        {
            let seller_acct = state.accounts.entry(seller.to_string()).or_insert_with(|| Account::new(seller));
            seller_acct.available = seller_acct.available.checked_add(reserved).unwrap();
        }
        state.refs.insert(reference.to_string(), (RefState::Terminal, Micros::ZERO));
        Self::push_event(&mut state, LedgerEventKind::ReleaseEscrow, buyer, Some(seller), reserved, Some(reference));
        let buyer_snapshot = state.accounts.get(buyer).cloned().unwrap();
        let seller_snapshot = state.accounts.get(seller).cloned().unwrap();
        Ok((buyer_snapshot, seller_snapshot))
    }

    pub fn refund_escrow(&self, buyer: &str, reference: &str) -> CoreResult<Account> {
        let mut state = self.state.lock().unwrap();
        let reserved = match state.refs.get(reference) {
            Some((RefState::EscrowOpen, reserved)) => *reserved,
            _ => return Err(CoreError::NotFound),
        };
        let acct = state.accounts.entry(buyer.to_string()).or_insert_with(|| Account::new(buyer));
        acct.escrowed = acct.escrowed.checked_sub(reserved).ok_or(CoreError::Internal("escrow underflow".into()))?;
        acct.available = acct.available.checked_add(reserved).unwrap();
        let snapshot = acct.clone();
        state.refs.insert(reference.to_string(), (RefState::Terminal, Micros::ZERO));
        Self::push_event(&mut state, LedgerEventKind::RefundEscrow, buyer, None, reserved, Some(reference));
        Ok(snapshot)
    }

    pub fn set_credit_limit(&self, address: &str, limit: Micros) -> CoreResult<Account> {
        let mut state = self.state.lock().unwrap();
        let acct = state.accounts.entry(address.to_string()).or_insert_with(|| Account::new(address));
        acct.credit_limit = limit;
        let snapshot = acct.clone();
        Self::push_event(&mut state, LedgerEventKind::SetCreditLimit, address, None, limit, None);
        Ok(snapshot)
    }

    pub fn repay_credit(&self, address: &str, amount: Micros) -> CoreResult<Account> {
        let mut state = self.state.lock().unwrap();
        let acct = state.accounts.entry(address.to_string()).or_insert_with(|| Account::new(address));
        acct.credit_used = acct.credit_used.checked_sub(amount).unwrap_or(Micros::ZERO);
        let snapshot = acct.clone();
        Self::push_event(&mut state, LedgerEventKind::RepayCredit, address, None, amount, None);
        Ok(snapshot)
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}
