//! Buyer-protected escrow: funds are locked against a reference, released to
//! the seller on confirmation or after a timed auto-release window, or
//! refunded to the buyer if disputed and resolved in their favor. Built on
//! top of `Ledger::escrow_lock`/`release_escrow`/`refund_escrow`; this
//! module owns only the escrow's own lifecycle state, not the money.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::info;

use crate::error::{CoreError, CoreResult};
use crate::ids::{self, PREFIX_ESCROW};
use crate::ledger::Ledger;
use crate::money::Micros;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscrowStatus {
    Open,
    Disputed,
    Released,
    Refunded,
}

#[derive(Debug, Clone)]
pub struct Escrow {
    pub id: String,
    pub buyer: String,
    pub seller: String,
    pub amount: Micros,
    pub status: EscrowStatus,
    pub created_at: DateTime<Utc>,
    pub auto_release_at: DateTime<Utc>,
    pub dispute_reason: Option<String>,
}

pub struct EscrowEngine {
    ledger: Arc<Ledger>,
    escrows: Mutex<HashMap<String, Escrow>>,
}

impl EscrowEngine {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        EscrowEngine {
            ledger,
            escrows: Mutex::new(HashMap::new()),
        }
    }

    pub fn create(&self, buyer: &str, seller: &str, amount: Micros, auto_release_after: ChronoDuration) -> CoreResult<Escrow> {
        let id = ids::mint(PREFIX_ESCROW);
        self.ledger.escrow_lock(buyer, amount, &id)?;
        let now = Utc::now();
        let escrow = Escrow {
            id: id.clone(),
            buyer: buyer.to_string(),
            seller: seller.to_string(),
            amount,
            status: EscrowStatus::Open,
            created_at: now,
            auto_release_at: now + auto_release_after,
            dispute_reason: None,
        };
        self.escrows.lock().unwrap().insert(id, escrow.clone());
        Ok(escrow)
    }

    pub fn get(&self, id: &str) -> CoreResult<Escrow> {
        self.escrows.lock().unwrap().get(id).cloned().ok_or(CoreError::NotFound)
    }

    pub fn dispute(&self, id: &str, reason: &str) -> CoreResult<Escrow> {
        let mut escrows = self.escrows.lock().unwrap();
        let escrow = escrows.get_mut(id).ok_or(CoreError::NotFound)?;
        if escrow.status != EscrowStatus::Open {
            return Err(CoreError::ConflictingHold);
        }
        escrow.status = EscrowStatus::Disputed;
        escrow.dispute_reason = Some(reason.to_string());
        Ok(escrow.clone())
    }

    pub fn release(&self, id: &str) -> CoreResult<Escrow> {
        let (buyer, seller) = {
            let escrows = self.escrows.lock().unwrap();
            let escrow = escrows.get(id).ok_or(CoreError::NotFound)?;
            if escrow.status != EscrowStatus::Open && escrow.status != EscrowStatus::Disputed {
                return Err(CoreError::ConflictingHold);
            }
            (escrow.buyer.clone(), escrow.seller.clone())
        };
        self.ledger.release_escrow(&buyer, &seller, id)?;
        let mut escrows = self.escrows.lock().unwrap();
        let escrow = escrows.get_mut(id).ok_or(CoreError::NotFound)?;
        escrow.status = EscrowStatus::Released;
        Ok(escrow.clone())
    }

    pub fn refund(&self, id: &str) -> CoreResult<Escrow> {
        let buyer = {
            let escrows = self.escrows.lock().unwrap();
            let escrow = escrows.get(id).ok_or(CoreError::NotFound)?;
            if escrow.status != EscrowStatus::Open && escrow.status != EscrowStatus::Disputed {
                return Err(CoreError::ConflictingHold);
            }
            escrow.buyer.clone()
        };
        self.ledger.refund_escrow(&buyer, id)?;
        let mut escrows = self.escrows.lock().unwrap();
        let escrow = escrows.get_mut(id).ok_or(CoreError::NotFound)?;
        escrow.status = EscrowStatus::Refunded;
        Ok(escrow.clone())
    }

    /// Releases every `Open` escrow whose auto-release deadline has passed.
    /// Disputed escrows are excluded -- a dispute halts the timer until a
    /// human or arbitration process calls `release`/`refund` explicitly.
    pub fn process_auto_releases(&self, now: DateTime<Utc>) -> Vec<String> {
        let due: Vec<String> = {
            let escrows = self.escrows.lock().unwrap();
            escrows
                .values()
                .filter(|e| e.status == EscrowStatus::Open && e.auto_release_at <= now)
                .map(|e| e.id.clone())
                .collect()
        };
        let mut released = Vec::new();
        for id in due {
            match self.release(&id) {
                Ok(_) => {
                    info!(escrow_id = %id, "auto-released escrow");
                    released.push(id);
                }
                Err(e) => {
                    tracing::warn!(escrow_id = %id, error = %e, "auto-release failed");
                }
            }
        }
        released
    }
}
