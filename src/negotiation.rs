//! RFP-based negotiation: a requester posts an RFP with a deadline and a
//! required bid bond; bidders lock that bond and submit a sealed bid (price,
//! reputation, and an optional delivery-time estimate); once the deadline
//! passes the engine scores every bid on a weighted blend of those signals
//! rather than price alone, refunds every loser's bond, and leaves the
//! winner's bond locked pending fulfillment -- forfeited to the platform
//! guarantee fund if the winner doesn't deliver, refunded back to the
//! winner otherwise.
//!
//! Bonds are modeled as ordinary ledger holds against the bidder's own
//! account, the same primitive the gateway and contract engines use to
//! reserve funds ahead of a side effect -- a refund is `release_hold`, a
//! forfeiture is `confirm_hold` (which empties the hold) followed by a
//! `deposit` crediting the guarantee fund.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::error::{CoreError, CoreResult};
use crate::ids::{self, PREFIX_COMMITMENT};
use crate::ledger::Ledger;
use crate::money::Micros;

const WEIGHT_PRICE: f64 = 0.5;
const WEIGHT_REPUTATION: f64 = 0.3;
const WEIGHT_DELIVERY: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RfpStatus {
    Open,
    Awarded,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct Rfp {
    pub id: String,
    pub requester: String,
    pub description: String,
    pub deadline: DateTime<Utc>,
    pub bond_required: Micros,
    pub status: RfpStatus,
    pub winner: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Bid {
    pub id: String,
    pub rfp_id: String,
    pub bidder: String,
    pub price: Micros,
    /// The bidder's standing reputation score in `[0, 1]`, supplied by the
    /// caller (the tenancy/reputation layer owns computing it).
    pub bidder_reputation: f64,
    /// Self-declared delivery estimate; omitted bids fall back to
    /// price+reputation-only scoring for the whole RFP.
    pub delivery_estimate: Option<chrono::Duration>,
    pub submitted_at: DateTime<Utc>,
}

pub struct NegotiationEngine {
    ledger: Arc<Ledger>,
    rfps: Mutex<HashMap<String, Rfp>>,
    bids: Mutex<HashMap<String, Vec<Bid>>>,
    guarantee_fund_address: String,
}

impl NegotiationEngine {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        NegotiationEngine {
            ledger,
            rfps: Mutex::new(HashMap::new()),
            bids: Mutex::new(HashMap::new()),
            guarantee_fund_address: "platform:guarantee-fund".to_string(),
        }
    }

    /// Overrides the default guarantee fund address, e.g. with one sourced
    /// from configuration instead of the built-in literal.
    pub fn with_guarantee_fund_address(mut self, address: String) -> Self {
        self.guarantee_fund_address = address;
        self
    }

    pub fn create_rfp(&self, requester: &str, description: &str, deadline: DateTime<Utc>, bond_required: Micros) -> Rfp {
        let id = ids::mint("rfp");
        let rfp = Rfp {
            id: id.clone(),
            requester: requester.to_string(),
            description: description.to_string(),
            deadline,
            bond_required,
            status: RfpStatus::Open,
            winner: None,
        };
        self.rfps.lock().unwrap().insert(id.clone(), rfp.clone());
        self.bids.lock().unwrap().insert(id, Vec::new());
        rfp
    }

    pub fn get_rfp(&self, rfp_id: &str) -> CoreResult<Rfp> {
        self.rfps.lock().unwrap().get(rfp_id).cloned().ok_or(CoreError::NotFound)
    }

    /// Submits a sealed bid: the price and scoring signals are recorded but
    /// not exposed back to other bidders until the RFP closes. Locks the
    /// bidder's bond.
    pub fn submit_bid(
        &self,
        rfp_id: &str,
        bidder: &str,
        price: Micros,
        bidder_reputation: f64,
        delivery_estimate: Option<chrono::Duration>,
        now: DateTime<Utc>,
    ) -> CoreResult<Bid> {
        let rfp = self.get_rfp(rfp_id)?;
        if rfp.status != RfpStatus::Open {
            return Err(CoreError::PolicyViolation);
        }
        if now >= rfp.deadline {
            return Err(CoreError::PolicyViolation);
        }
        let bid_id = ids::mint(PREFIX_COMMITMENT);
        self.ledger.hold(bidder, rfp.bond_required, &bid_id)?;
        let bid = Bid {
            id: bid_id,
            rfp_id: rfp_id.to_string(),
            bidder: bidder.to_string(),
            price,
            bidder_reputation: bidder_reputation.clamp(0.0, 1.0),
            delivery_estimate,
            submitted_at: now,
        };
        self.bids.lock().unwrap().get_mut(rfp_id).ok_or(CoreError::NotFound)?.push(bid.clone());
        Ok(bid)
    }

    /// Closes the RFP after its deadline: the highest-scoring bid wins
    /// (normalized price, reputation, and optionally delivery time, ties
    /// broken by earliest submission), every other bidder's bond is
    /// refunded, and the winner's bond stays locked pending
    /// `settle_winner_success`/`forfeit_winner_bond`.
    pub fn close_and_select_winner(&self, rfp_id: &str, now: DateTime<Utc>) -> CoreResult<Option<Bid>> {
        let mut rfps = self.rfps.lock().unwrap();
        let rfp = rfps.get_mut(rfp_id).ok_or(CoreError::NotFound)?;
        if rfp.status != RfpStatus::Open {
            return Err(CoreError::PolicyViolation);
        }
        if now < rfp.deadline {
            return Err(CoreError::PolicyViolation);
        }
        let bids = self.bids.lock().unwrap().get(rfp_id).cloned().unwrap_or_default();
        let winner = select_winner(&bids);
        for bid in &bids {
            if Some(bid.id.clone()) != winner.as_ref().map(|w| w.id.clone()) {
                self.ledger.release_hold(&bid.bidder, &bid.id)?;
            }
        }
        rfp.status = RfpStatus::Awarded;
        rfp.winner = winner.as_ref().map(|b| b.id.clone());
        Ok(winner)
    }

    /// The winner delivered: refund their bond.
    pub fn settle_winner_success(&self, bid: &Bid) -> CoreResult<()> {
        self.ledger.release_hold(&bid.bidder, &bid.id)?;
        Ok(())
    }

    /// The winner failed to deliver: forfeit their bond to the platform
    /// guarantee fund rather than the requester, who never put up the
    /// bond and shouldn't be made whole from someone else's forfeiture.
    pub fn forfeit_winner_bond(&self, bid: &Bid) -> CoreResult<()> {
        let rfp = self.get_rfp(&bid.rfp_id)?;
        self.ledger.confirm_hold(&bid.bidder, rfp.bond_required, &bid.id)?;
        self.ledger.deposit(&self.guarantee_fund_address, rfp.bond_required)?;
        Ok(())
    }

    /// Closes every RFP that's still `Open` past its deadline -- a requester
    /// who never manually calls `close_and_select_winner` shouldn't leave
    /// bidders' bonds locked indefinitely. Returns the id of each RFP swept,
    /// regardless of whether it actually drew a winning bid.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Vec<String> {
        let due: Vec<String> = {
            let rfps = self.rfps.lock().unwrap();
            rfps.values().filter(|r| r.status == RfpStatus::Open && now >= r.deadline).map(|r| r.id.clone()).collect()
        };
        let mut swept = Vec::new();
        for id in due {
            match self.close_and_select_winner(&id, now) {
                Ok(_) => swept.push(id),
                Err(e) => warn!(rfp_id = %id, error = %e, "failed to sweep expired rfp"),
            }
        }
        swept
    }
}

/// Scores a "lower is better" metric as the ratio of the best value seen to
/// this one, so the cheapest/fastest bid scores 1.0 and the rest scale down
/// proportionally to how much worse they are -- unlike min-max normalization,
/// a near-tie stays a near-tie instead of being stretched to the extremes.
fn ratio_score(best: f64, value: f64) -> f64 {
    if value <= 0.0 {
        1.0
    } else {
        (best / value).min(1.0)
    }
}

fn select_winner(bids: &[Bid]) -> Option<Bid> {
    if bids.is_empty() {
        return None;
    }
    let best_price = bids.iter().map(|b| b.price.0 as f64).fold(f64::INFINITY, f64::min);
    let price_scores: Vec<f64> = bids.iter().map(|b| ratio_score(best_price, b.price.0 as f64)).collect();
    let all_have_delivery = bids.iter().all(|b| b.delivery_estimate.is_some());
    let delivery_scores = if all_have_delivery {
        let best_delivery = bids
            .iter()
            .map(|b| b.delivery_estimate.unwrap().num_seconds() as f64)
            .fold(f64::INFINITY, f64::min);
        bids.iter()
            .map(|b| ratio_score(best_delivery, b.delivery_estimate.unwrap().num_seconds() as f64))
            .collect()
    } else {
        vec![0.0; bids.len()]
    };
    let (w_price, w_rep, w_delivery) = if all_have_delivery {
        (WEIGHT_PRICE, WEIGHT_REPUTATION, WEIGHT_DELIVERY)
    } else {
        let total = WEIGHT_PRICE + WEIGHT_REPUTATION;
        (WEIGHT_PRICE / total, WEIGHT_REPUTATION / total, 0.0)
    };
    let scores: Vec<f64> = (0..bids.len())
        .map(|i| w_price * price_scores[i] + w_rep * bids[i].bidder_reputation + w_delivery * delivery_scores[i])
        .collect();
    (0..bids.len())
        .max_by(|&i, &j| {
            scores[i]
                .partial_cmp(&scores[j])
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| bids[j].submitted_at.cmp(&bids[i].submitted_at))
        })
        .map(|i| bids[i].clone())
}
