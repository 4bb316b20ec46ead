//! Real-time risk scoring: a pure function of a sliding window of recent
//! transaction history plus the transaction under consideration. No network
//! or database access -- the decision must be computable in well under
//! 10ms, so every factor here is arithmetic over an in-memory window; the
//! window itself is capped at 1000 entries and pruned to the trailing 24h
//! on every append (`RiskWindow::record`).
//!
//! Four weighted factors, summing to a score in `[0, 1]`:
//! - velocity (0.35): last-5-minute spend (incl. this tx) vs. the 24h
//!   average per-5-minute rate, `log10(ratio)/2`
//! - novelty (0.25): how many times this recipient has been paid before
//! - time_of_day (0.20): is this hour under-represented in the history
//! - burn_rate (0.20): hours left until a configured budget runs dry at the
//!   last-hour spend rate
//!
//! `score < 0.5` allows, `0.5 <= score < 0.8` warns, `score >= 0.8` blocks.

use chrono::{DateTime, Timelike, Utc};

use crate::money::Micros;

pub const WEIGHT_VELOCITY: f64 = 0.35;
pub const WEIGHT_NOVELTY: f64 = 0.25;
pub const WEIGHT_TIME_OF_DAY: f64 = 0.20;
pub const WEIGHT_BURN_RATE: f64 = 0.20;

pub const THRESHOLD_WARN: f64 = 0.5;
pub const THRESHOLD_BLOCK: f64 = 0.8;

const MAX_WINDOW_ENTRIES: usize = 1000;
const HISTORY_RETENTION_SECS: i64 = 86_400;
const VELOCITY_WINDOW_SECS: i64 = 300;
const VELOCITY_WINDOWS_PER_HISTORY: f64 = (HISTORY_RETENTION_SECS / VELOCITY_WINDOW_SECS) as f64;
const TIME_OF_DAY_MIN_ENTRIES: usize = 10;
const TIME_OF_DAY_RARE_HOUR_SHARE: f64 = 0.02;

#[derive(Debug, Clone)]
pub struct TxRecord {
    pub at: DateTime<Utc>,
    pub amount: Micros,
    pub recipient: String,
}

#[derive(Debug, Clone, Default)]
pub struct RiskWindow {
    pub history: Vec<TxRecord>,
}

impl RiskWindow {
    /// Appends an entry, then prunes anything older than 24h and trims back
    /// to the 1000-entry cap (oldest first).
    pub fn record(&mut self, entry: TxRecord, now: DateTime<Utc>) {
        self.history.push(entry);
        self.history.retain(|r| (now - r.at).num_seconds() <= HISTORY_RETENTION_SECS);
        if self.history.len() > MAX_WINDOW_ENTRIES {
            let excess = self.history.len() - MAX_WINDOW_ENTRIES;
            self.history.drain(0..excess);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskDecision {
    Allow,
    Warn,
    Block,
}

#[derive(Debug, Clone, Copy)]
pub struct RiskFactors {
    pub velocity: f64,
    pub novelty: f64,
    pub time_of_day: f64,
    pub burn_rate: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct RiskAssessment {
    pub score: f64,
    pub decision: RiskDecision,
    pub factors: RiskFactors,
}

fn velocity_factor(window: &RiskWindow, now: DateTime<Utc>, amount: Micros) -> f64 {
    let last_5min: u128 = window
        .history
        .iter()
        .filter(|r| (now - r.at).num_seconds() <= VELOCITY_WINDOW_SECS)
        .map(|r| r.amount.0)
        .sum();
    let last_5min_incl_current = last_5min + amount.0;
    let total_24h: u128 = window.history.iter().map(|r| r.amount.0).sum();
    let baseline = (total_24h as f64 / VELOCITY_WINDOWS_PER_HISTORY).max(1.0);
    let ratio = last_5min_incl_current as f64 / baseline;
    if ratio <= 1.0 {
        0.0
    } else {
        (ratio.log10() / 2.0).clamp(0.0, 1.0)
    }
}

fn novelty_factor(window: &RiskWindow, recipient: &str) -> f64 {
    if window.history.is_empty() {
        return 0.0;
    }
    let seen = window.history.iter().filter(|r| r.recipient == recipient).count();
    match seen {
        0 => 0.6,
        1 | 2 => 0.3,
        _ => 0.0,
    }
}

fn time_of_day_factor(window: &RiskWindow, now: DateTime<Utc>) -> f64 {
    if window.history.len() < TIME_OF_DAY_MIN_ENTRIES {
        return 0.0;
    }
    let hour = now.hour();
    let at_hour = window.history.iter().filter(|r| r.at.hour() == hour).count() as f64;
    let share = at_hour / window.history.len() as f64;
    if share < TIME_OF_DAY_RARE_HOUR_SHARE {
        0.8
    } else {
        0.0
    }
}

fn burn_rate_factor(window: &RiskWindow, now: DateTime<Utc>, remaining_budget: Option<Micros>) -> f64 {
    let Some(remaining) = remaining_budget else {
        return 0.0;
    };
    if remaining.is_zero() {
        return 1.0;
    }
    let last_hour_spend: u128 = window
        .history
        .iter()
        .filter(|r| (now - r.at).num_seconds() <= 3600)
        .map(|r| r.amount.0)
        .sum();
    if last_hour_spend == 0 {
        return 0.0;
    }
    let hours_remaining = remaining.0 as f64 / last_hour_spend as f64;
    if hours_remaining < 1.0 {
        (1.0 - hours_remaining).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Pure scoring function: same `window`, candidate tx, and `remaining_budget`
/// always yield the same assessment. `remaining_budget` is the session
/// key's (or account's) `max_total` headroom, if one is configured.
pub fn assess(window: &RiskWindow, now: DateTime<Utc>, recipient: &str, amount: Micros, remaining_budget: Option<Micros>) -> RiskAssessment {
    let factors = RiskFactors {
        velocity: velocity_factor(window, now, amount),
        novelty: novelty_factor(window, recipient),
        time_of_day: time_of_day_factor(window, now),
        burn_rate: burn_rate_factor(window, now, remaining_budget),
    };
    let score = (factors.velocity * WEIGHT_VELOCITY
        + factors.novelty * WEIGHT_NOVELTY
        + factors.time_of_day * WEIGHT_TIME_OF_DAY
        + factors.burn_rate * WEIGHT_BURN_RATE)
        .clamp(0.0, 1.0);
    let decision = if score >= THRESHOLD_BLOCK {
        RiskDecision::Block
    } else if score >= THRESHOLD_WARN {
        RiskDecision::Warn
    } else {
        RiskDecision::Allow
    };
    RiskAssessment { score, decision, factors }
}
