//! Streaming micropayments: a payer reserves a budget once, then a tick
//! loop settles small increments to the payee as the underlying service is
//! consumed, closing the stream (returning any unspent reserve) either when
//! the client ends it, when it goes stale (no tick for too long), or when
//! the scheduler reconciles a stream stuck mid-settlement.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{info, warn};

use crate::error::{CoreError, CoreResult};
use crate::ids::{self, PREFIX_STREAM};
use crate::ledger::Ledger;
use crate::money::Micros;

const DEFAULT_STALE_AFTER: ChronoDuration = ChronoDuration::seconds(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Active,
    Closed,
    /// A tick's ledger settlement failed (e.g. the payer's hold was
    /// released out from under the stream). Terminal, same as `Closed`,
    /// but flagged distinctly so operators can tell a clean close from a
    /// settlement that needs investigation.
    SettlementFailed,
}

#[derive(Debug, Clone)]
pub struct Stream {
    pub id: String,
    pub payer: String,
    pub payee: String,
    pub rate_per_tick: Micros,
    pub budget: Micros,
    pub settled_total: Micros,
    pub status: StreamStatus,
    pub started_at: DateTime<Utc>,
    pub last_tick_at: DateTime<Utc>,
}

pub struct StreamEngine {
    ledger: Arc<Ledger>,
    streams: Mutex<HashMap<String, Stream>>,
    stale_after: ChronoDuration,
}

impl StreamEngine {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        StreamEngine {
            ledger,
            streams: Mutex::new(HashMap::new()),
            stale_after: DEFAULT_STALE_AFTER,
        }
    }

    pub fn open(&self, payer: &str, payee: &str, budget: Micros, rate_per_tick: Micros) -> CoreResult<Stream> {
        let id = ids::mint(PREFIX_STREAM);
        self.ledger.hold(payer, budget, &id)?;
        let now = Utc::now();
        let stream = Stream {
            id: id.clone(),
            payer: payer.to_string(),
            payee: payee.to_string(),
            rate_per_tick,
            budget,
            settled_total: Micros::ZERO,
            status: StreamStatus::Active,
            started_at: now,
            last_tick_at: now,
        };
        self.streams.lock().unwrap().insert(id, stream.clone());
        Ok(stream)
    }

    pub fn get(&self, id: &str) -> CoreResult<Stream> {
        self.streams.lock().unwrap().get(id).cloned().ok_or(CoreError::NotFound)
    }

    /// Settles one tick's worth of payment, clamped to whatever remains of
    /// the budget. Closes the stream automatically once the budget is
    /// exhausted.
    pub fn tick(&self, id: &str, now: DateTime<Utc>) -> CoreResult<Micros> {
        let (payer, payee, amount) = {
            let mut streams = self.streams.lock().unwrap();
            let stream = streams.get_mut(id).ok_or(CoreError::NotFound)?;
            if stream.status != StreamStatus::Active {
                return Err(CoreError::ConflictingHold);
            }
            let remaining = stream.budget.checked_sub(stream.settled_total).unwrap_or(Micros::ZERO);
            let amount = stream.rate_per_tick.min(remaining);
            if amount.is_zero() {
                return Ok(Micros::ZERO);
            }
            stream.settled_total = stream.settled_total.checked_add(amount).unwrap();
            stream.last_tick_at = now;
            (stream.payer.clone(), stream.payee.clone(), amount)
        };
        if let Err(e) = self.ledger.tick_settle(&payer, &payee, amount, id) {
            let mut streams = self.streams.lock().unwrap();
            if let Some(stream) = streams.get_mut(id) {
                stream.status = StreamStatus::SettlementFailed;
            }
            warn!(stream_id = %id, error = %e, "stream settlement failed, marking terminal");
            return Err(e);
        }
        if self.is_exhausted(id) {
            self.close(id)?;
        }
        Ok(amount)
    }

    fn is_exhausted(&self, id: &str) -> bool {
        self.streams
            .lock()
            .unwrap()
            .get(id)
            .is_some_and(|s| s.settled_total >= s.budget)
    }

    /// Closes the stream. `tick_settle` keeps the ledger's tracked "reserved"
    /// amount in lockstep with the payer's unconsumed `held` balance, so
    /// confirming the hold for zero additional spend both closes the
    /// reference and refunds exactly the unticked remainder to the payer --
    /// whether the stream is being closed early or was already exhausted.
    pub fn close(&self, id: &str) -> CoreResult<Stream> {
        let payer = {
            let streams = self.streams.lock().unwrap();
            let stream = streams.get(id).ok_or(CoreError::NotFound)?;
            if stream.status != StreamStatus::Active {
                return Ok(stream.clone());
            }
            stream.payer.clone()
        };
        self.ledger.confirm_hold(&payer, Micros::ZERO, id)?;
        let mut streams = self.streams.lock().unwrap();
        let stream = streams.get_mut(id).ok_or(CoreError::NotFound)?;
        stream.status = StreamStatus::Closed;
        info!(stream_id = %id, settled = %stream.settled_total, "stream closed");
        Ok(stream.clone())
    }

    /// Closes every stream that hasn't ticked in longer than the stale
    /// threshold, returning their ids.
    pub fn close_stale(&self, now: DateTime<Utc>) -> Vec<String> {
        let stale: Vec<String> = {
            let streams = self.streams.lock().unwrap();
            streams
                .values()
                .filter(|s| s.status == StreamStatus::Active && now - s.last_tick_at > self.stale_after)
                .map(|s| s.id.clone())
                .collect()
        };
        let mut closed = Vec::new();
        for id in stale {
            match self.close(&id) {
                Ok(_) => closed.push(id),
                Err(e) => warn!(stream_id = %id, error = %e, "failed to close stale stream"),
            }
        }
        closed
    }

    /// Reconciliation pass: finds streams whose ledger reference is no
    /// longer `HoldOpen` (e.g. closed in the ledger by an out-of-band
    /// operation) but whose in-memory status is still `Active`, and marks
    /// them `Closed` so the scheduler doesn't keep ticking a dead stream.
    pub fn reconcile_stuck(&self) -> Vec<String> {
        let mut reconciled = Vec::new();
        let mut streams = self.streams.lock().unwrap();
        for stream in streams.values_mut() {
            if stream.status == StreamStatus::Active {
                let acct = self.ledger.account(&stream.payer);
                if acct.held.is_zero() && stream.settled_total < stream.budget {
                    stream.status = StreamStatus::Closed;
                    reconciled.push(stream.id.clone());
                }
            }
        }
        reconciled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_settles_and_close_refunds_unspent() {
        let ledger = Arc::new(Ledger::new());
        ledger.deposit("payer", Micros::parse("10").unwrap()).unwrap();
        let engine = StreamEngine::new(ledger.clone());
        let stream = engine.open("payer", "payee", Micros::parse("10").unwrap(), Micros::parse("1").unwrap()).unwrap();
        engine.tick(&stream.id, Utc::now()).unwrap();
        engine.tick(&stream.id, Utc::now()).unwrap();
        engine.close(&stream.id).unwrap();
        let payer = ledger.account("payer");
        let payee = ledger.account("payee");
        assert_eq!(payee.available, Micros::parse("2").unwrap());
        assert_eq!(payer.available, Micros::parse("8").unwrap());
        assert_eq!(payer.held, Micros::ZERO);
    }

    #[test]
    fn budget_exhaustion_auto_closes() {
        let ledger = Arc::new(Ledger::new());
        ledger.deposit("payer", Micros::parse("3").unwrap()).unwrap();
        let engine = StreamEngine::new(ledger.clone());
        let stream = engine.open("payer", "payee", Micros::parse("3").unwrap(), Micros::parse("1").unwrap()).unwrap();
        engine.tick(&stream.id, Utc::now()).unwrap();
        engine.tick(&stream.id, Utc::now()).unwrap();
        engine.tick(&stream.id, Utc::now()).unwrap();
        let closed = engine.get(&stream.id).unwrap();
        assert_eq!(closed.status, StreamStatus::Closed);
        let payee = ledger.account("payee");
        assert_eq!(payee.available, Micros::parse("3").unwrap());
    }

    #[test]
    fn stale_stream_is_closed_by_reaper() {
        let ledger = Arc::new(Ledger::new());
        ledger.deposit("payer", Micros::parse("10").unwrap()).unwrap();
        let engine = StreamEngine::new(ledger);
        let stream = engine.open("payer", "payee", Micros::parse("10").unwrap(), Micros::parse("1").unwrap()).unwrap();
        let far_future = stream.started_at + ChronoDuration::hours(1);
        let closed = engine.close_stale(far_future);
        assert_eq!(closed, vec![stream.id]);
    }

    #[test]
    fn ticking_after_hold_closed_out_of_band_marks_settlement_failed() {
        let ledger = Arc::new(Ledger::new());
        ledger.deposit("payer", Micros::parse("2").unwrap()).unwrap();
        let engine = StreamEngine::new(ledger.clone());
        let stream = engine.open("payer", "payee", Micros::parse("2").unwrap(), Micros::parse("1").unwrap()).unwrap();
        ledger.confirm_hold("payer", Micros::ZERO, &stream.id).unwrap();
        assert!(engine.tick(&stream.id, Utc::now()).is_err());
        let after = engine.get(&stream.id).unwrap();
        assert_eq!(after.status, StreamStatus::SettlementFailed);
    }

    #[test]
    fn ticking_closed_stream_conflicts() {
        let ledger = Arc::new(Ledger::new());
        ledger.deposit("payer", Micros::parse("2").unwrap()).unwrap();
        let engine = StreamEngine::new(ledger);
        let stream = engine.open("payer", "payee", Micros::parse("2").unwrap(), Micros::parse("1").unwrap()).unwrap();
        engine.close(&stream.id).unwrap();
        assert_eq!(engine.tick(&stream.id, Utc::now()).unwrap_err(), CoreError::ConflictingHold);
    }
}
