//! Optional Postgres persistence. Following the teacher's `db/mod.rs`:
//! hand-written `sqlx::query`/`query_as` (no compile-time macros, no ORM),
//! a `create_pool`/`run_migrations` pair, one function per write/read. When
//! `DATABASE_URL` is unset, `Db::disabled()` is used instead and every
//! method is a no-op `Ok(())` -- the in-memory engines in `ledger.rs` and
//! friends remain the source of truth either way; Postgres here is a
//! durable mirror, not an alternate store.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::ledger::{LedgerEvent, LedgerEventKind};
use crate::money::Micros;

pub struct Db {
    pool: Option<PgPool>,
}

pub async fn create_pool(database_url: &str, max_connections: u32, min_connections: u32) -> eyre::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .min_connections(min_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> eyre::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

impl Db {
    pub fn connected(pool: PgPool) -> Self {
        Db { pool: Some(pool) }
    }

    pub fn disabled() -> Self {
        warn!("DATABASE_URL not set; running with in-memory state only, no durable mirror");
        Db { pool: None }
    }

    pub fn is_connected(&self) -> bool {
        self.pool.is_some()
    }

    pub async fn record_ledger_event(&self, event: &LedgerEvent) -> eyre::Result<()> {
        let Some(pool) = &self.pool else { return Ok(()) };
        sqlx::query(
            "INSERT INTO ledger_events (seq, kind, account, counterparty, amount_micros, reference, at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (seq) DO NOTHING",
        )
        .bind(event.seq as i64)
        .bind(event_kind_str(&event.kind))
        .bind(&event.account)
        .bind(&event.counterparty)
        .bind(event.amount.0.to_string())
        .bind(&event.reference)
        .bind(event.at)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_account(&self, address: &str, available: Micros, held: Micros, escrowed: Micros, credit_used: Micros, credit_limit: Micros) -> eyre::Result<()> {
        let Some(pool) = &self.pool else { return Ok(()) };
        sqlx::query(
            "INSERT INTO accounts (address, available_micros, held_micros, escrowed_micros, credit_used_micros, credit_limit_micros)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (address) DO UPDATE SET
               available_micros = EXCLUDED.available_micros,
               held_micros = EXCLUDED.held_micros,
               escrowed_micros = EXCLUDED.escrowed_micros,
               credit_used_micros = EXCLUDED.credit_used_micros,
               credit_limit_micros = EXCLUDED.credit_limit_micros",
        )
        .bind(address)
        .bind(available.0.to_string())
        .bind(held.0.to_string())
        .bind(escrowed.0.to_string())
        .bind(credit_used.0.to_string())
        .bind(credit_limit.0.to_string())
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn insert_api_key(&self, id: &str, tenant_id: &str, owner_agent_id: &str, hash: &str) -> eyre::Result<()> {
        let Some(pool) = &self.pool else { return Ok(()) };
        sqlx::query(
            "INSERT INTO api_keys (id, tenant_id, owner_agent_id, hash, revoked, created_at)
             VALUES ($1, $2, $3, $4, false, now())
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(id)
        .bind(tenant_id)
        .bind(owner_agent_id)
        .bind(hash)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn revoke_api_key(&self, id: &str) -> eyre::Result<()> {
        let Some(pool) = &self.pool else { return Ok(()) };
        sqlx::query("UPDATE api_keys SET revoked = true WHERE id = $1").bind(id).execute(pool).await?;
        Ok(())
    }

    pub async fn record_risk_assessment(&self, id: &str, account: &str, score: f64, decision: &str) -> eyre::Result<()> {
        let Some(pool) = &self.pool else { return Ok(()) };
        sqlx::query(
            "INSERT INTO risk_assessments (id, account, score, decision, at) VALUES ($1, $2, $3, $4, now())",
        )
        .bind(id)
        .bind(account)
        .bind(score)
        .bind(decision)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn insert_tenant(&self, id: &str, name: &str, plan_name: &str) -> eyre::Result<()> {
        let Some(pool) = &self.pool else { return Ok(()) };
        sqlx::query("INSERT INTO tenants (id, name, plan_name, created_at) VALUES ($1, $2, $3, now()) ON CONFLICT (id) DO NOTHING")
            .bind(id)
            .bind(name)
            .bind(plan_name)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn ping(&self) -> eyre::Result<bool> {
        let Some(pool) = &self.pool else { return Ok(false) };
        sqlx::query("SELECT 1").execute(pool).await?;
        info!("db ping succeeded");
        Ok(true)
    }
}

fn event_kind_str(kind: &LedgerEventKind) -> &'static str {
    match kind {
        LedgerEventKind::Deposit => "deposit",
        LedgerEventKind::Spend => "spend",
        LedgerEventKind::Refund => "refund",
        LedgerEventKind::Hold => "hold",
        LedgerEventKind::ConfirmHold => "confirm_hold",
        LedgerEventKind::ReleaseHold => "release_hold",
        LedgerEventKind::EscrowLock => "escrow_lock",
        LedgerEventKind::ReleaseEscrow => "release_escrow",
        LedgerEventKind::RefundEscrow => "refund_escrow",
        LedgerEventKind::SetCreditLimit => "set_credit_limit",
        LedgerEventKind::RepayCredit => "repay_credit",
        LedgerEventKind::TickSettle => "tick_settle",
    }
}
