//! Multi-tenancy: each tenant has a plan bounding how many agents it may
//! register, a unique URL-safe slug, a lifecycle status, and a set of
//! operational settings (agent cap, request rate limit, per-session-key
//! spend cap, platform take rate). Credit-worthiness scoring beyond a flat
//! configured limit is explicitly out of scope (see `CreditPolicy` below) --
//! this module enforces plan limits, it does not decide who deserves more
//! credit.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{CoreError, CoreResult};
use crate::ids::{self, PREFIX_TENANT};
use crate::money::Micros;

#[derive(Debug, Clone)]
pub struct TenantPlan {
    pub name: String,
    pub max_agents: u32,
    pub rate_limit_rps: u32,
    pub default_credit_limit: Micros,
}

impl TenantPlan {
    pub fn free() -> Self {
        TenantPlan {
            name: "free".to_string(),
            max_agents: 3,
            rate_limit_rps: 5,
            default_credit_limit: Micros::ZERO,
        }
    }

    pub fn pro() -> Self {
        TenantPlan {
            name: "pro".to_string(),
            max_agents: 50,
            rate_limit_rps: 50,
            default_credit_limit: Micros::parse("500").unwrap(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TenantStatus {
    Active,
    Suspended,
}

/// Operational knobs enforced elsewhere (rate limiter, gateway, session-key
/// authorization) that a tenant admin configures directly, separate from
/// the coarser plan tier.
#[derive(Debug, Clone)]
pub struct TenantSettings {
    pub max_agents: u32,
    pub rate_limit_rpm: u32,
    pub max_session_budget: Micros,
    pub take_rate_bps: u32,
}

impl TenantSettings {
    fn from_plan(plan: &TenantPlan) -> Self {
        TenantSettings {
            max_agents: plan.max_agents,
            rate_limit_rpm: plan.rate_limit_rps * 60,
            max_session_budget: plan.default_credit_limit,
            take_rate_bps: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Tenant {
    pub id: String,
    pub slug: String,
    pub name: String,
    pub plan: TenantPlan,
    pub status: TenantStatus,
    pub settings: TenantSettings,
    pub agent_ids: Vec<String>,
}

pub struct TenancyManager {
    tenants: Mutex<HashMap<String, Tenant>>,
}

impl Default for TenancyManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TenancyManager {
    pub fn new() -> Self {
        TenancyManager {
            tenants: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a tenant under `slug`, rejecting a slug already in use by
    /// another tenant.
    pub fn create_tenant(&self, slug: &str, name: &str, plan: TenantPlan) -> CoreResult<Tenant> {
        let mut tenants = self.tenants.lock().unwrap();
        if tenants.values().any(|t| t.slug == slug) {
            return Err(CoreError::SlugTaken);
        }
        let id = ids::mint(PREFIX_TENANT);
        let settings = TenantSettings::from_plan(&plan);
        let tenant = Tenant {
            id: id.clone(),
            slug: slug.to_string(),
            name: name.to_string(),
            plan,
            status: TenantStatus::Active,
            settings,
            agent_ids: Vec::new(),
        };
        tenants.insert(id, tenant.clone());
        Ok(tenant)
    }

    pub fn get(&self, tenant_id: &str) -> CoreResult<Tenant> {
        self.tenants.lock().unwrap().get(tenant_id).cloned().ok_or(CoreError::NotFound)
    }

    pub fn get_by_slug(&self, slug: &str) -> CoreResult<Tenant> {
        self.tenants
            .lock()
            .unwrap()
            .values()
            .find(|t| t.slug == slug)
            .cloned()
            .ok_or(CoreError::NotFound)
    }

    pub fn suspend(&self, tenant_id: &str) -> CoreResult<Tenant> {
        let mut tenants = self.tenants.lock().unwrap();
        let tenant = tenants.get_mut(tenant_id).ok_or(CoreError::NotFound)?;
        tenant.status = TenantStatus::Suspended;
        Ok(tenant.clone())
    }

    pub fn reactivate(&self, tenant_id: &str) -> CoreResult<Tenant> {
        let mut tenants = self.tenants.lock().unwrap();
        let tenant = tenants.get_mut(tenant_id).ok_or(CoreError::NotFound)?;
        tenant.status = TenantStatus::Active;
        Ok(tenant.clone())
    }

    pub fn update_settings(&self, tenant_id: &str, settings: TenantSettings) -> CoreResult<Tenant> {
        let mut tenants = self.tenants.lock().unwrap();
        let tenant = tenants.get_mut(tenant_id).ok_or(CoreError::NotFound)?;
        tenant.settings = settings;
        Ok(tenant.clone())
    }

    /// Registers an agent under a tenant, enforcing `settings.max_agents`
    /// and that the tenant is not suspended.
    pub fn register_agent(&self, tenant_id: &str, agent_id: &str) -> CoreResult<Tenant> {
        let mut tenants = self.tenants.lock().unwrap();
        let tenant = tenants.get_mut(tenant_id).ok_or(CoreError::NotFound)?;
        if tenant.status != TenantStatus::Active {
            return Err(CoreError::PolicyViolation);
        }
        if tenant.agent_ids.iter().any(|a| a == agent_id) {
            return Err(CoreError::AlreadyExists);
        }
        if tenant.agent_ids.len() as u32 >= tenant.settings.max_agents {
            return Err(CoreError::MaxAgents);
        }
        tenant.agent_ids.push(agent_id.to_string());
        Ok(tenant.clone())
    }
}

/// Decides a tenant's credit limit. Tenants carry no standing credit
/// balance in their own right -- the spec's data model has no field for
/// one -- so the default policy always returns zero; a verified-agent-status
/// or credit-worthiness scorer is an external collaborator this crate
/// doesn't implement (Open Question). Callers may supply their own
/// `CreditPolicy` that consults one.
pub trait CreditPolicy: Send + Sync {
    fn credit_limit_for(&self, tenant: &Tenant) -> Micros;
}

pub struct FixedCreditPolicy;

impl CreditPolicy for FixedCreditPolicy {
    fn credit_limit_for(&self, _tenant: &Tenant) -> Micros {
        Micros::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_agents_up_to_plan_limit() {
        let mgr = TenancyManager::new();
        let mut plan = TenantPlan::free();
        plan.max_agents = 2;
        let tenant = mgr.create_tenant("acme", "Acme Corp", plan).unwrap();
        mgr.register_agent(&tenant.id, "agent_1").unwrap();
        mgr.register_agent(&tenant.id, "agent_2").unwrap();
        let err = mgr.register_agent(&tenant.id, "agent_3").unwrap_err();
        assert_eq!(err, CoreError::MaxAgents);
    }

    #[test]
    fn duplicate_agent_registration_rejected() {
        let mgr = TenancyManager::new();
        let tenant = mgr.create_tenant("acme", "Acme Corp", TenantPlan::free()).unwrap();
        mgr.register_agent(&tenant.id, "agent_1").unwrap();
        assert_eq!(mgr.register_agent(&tenant.id, "agent_1").unwrap_err(), CoreError::AlreadyExists);
    }

    #[test]
    fn duplicate_slug_rejected() {
        let mgr = TenancyManager::new();
        mgr.create_tenant("acme", "Acme Corp", TenantPlan::free()).unwrap();
        let err = mgr.create_tenant("acme", "Acme Corp 2", TenantPlan::pro()).unwrap_err();
        assert_eq!(err, CoreError::SlugTaken);
    }

    #[test]
    fn suspended_tenant_cannot_register_agents() {
        let mgr = TenancyManager::new();
        let tenant = mgr.create_tenant("acme", "Acme Corp", TenantPlan::free()).unwrap();
        mgr.suspend(&tenant.id).unwrap();
        assert_eq!(
            mgr.register_agent(&tenant.id, "agent_1").unwrap_err(),
            CoreError::PolicyViolation
        );
    }

    #[test]
    fn fixed_credit_policy_always_returns_zero() {
        let mgr = TenancyManager::new();
        let tenant = mgr.create_tenant("acme", "Acme Corp", TenantPlan::pro()).unwrap();
        let policy = FixedCreditPolicy;
        assert_eq!(policy.credit_limit_for(&tenant), Micros::ZERO);
    }

    #[test]
    fn get_by_slug_finds_tenant() {
        let mgr = TenancyManager::new();
        let tenant = mgr.create_tenant("acme", "Acme Corp", TenantPlan::free()).unwrap();
        let found = mgr.get_by_slug("acme").unwrap();
        assert_eq!(found.id, tenant.id);
    }
}
