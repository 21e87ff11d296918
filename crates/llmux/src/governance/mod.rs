pub mod policy;
pub mod store;

use chrono::Utc;

use crate::config::GovernanceConfig;
use crate::errors::ErrorKind;
use crate::ratelimit::{RateLimiter, burst_for};
use crate::types::{AuthContext, UsageLog};
use crate::*;

pub use self::policy::PolicyEngine;
pub use self::store::{
	AuditRecord, AuditSink, EndUserRecord, KeyRecord, MemoryTenantStore, OrgRecord, SpendScope,
	StoreError, TeamRecord, TenantStore, UserRecord,
};

#[derive(Debug, thiserror::Error)]
pub enum GovernanceError {
	#[error("permission denied: {0}")]
	Permission(String),
	#[error("budget exceeded for {scope}: spent {spent:.4} + projected {projected:.4} > max {max:.4}")]
	Quota {
		scope: Strng,
		spent: f64,
		projected: f64,
		max: f64,
	},
	#[error("rate limit exceeded for {scope}")]
	RateLimit {
		scope: Strng,
		retry_after: Option<Duration>,
	},
	#[error("tenant store failure: {0}")]
	Store(#[from] StoreError),
}

impl GovernanceError {
	pub fn kind(&self) -> ErrorKind {
		match self {
			GovernanceError::Permission(_) => ErrorKind::Permission,
			GovernanceError::Quota { .. } => ErrorKind::Quota,
			GovernanceError::RateLimit { .. } => ErrorKind::RateLimit,
			GovernanceError::Store(_) => ErrorKind::Internal,
		}
	}
}

/// Pre-check input: what the request wants to do and what it will plausibly
/// cost.
#[derive(Debug, Clone)]
pub struct EvalInput {
	pub model: Strng,
	pub projected_cost: f64,
	pub end_user_id: Option<Strng>,
	/// Rate-limit key for callers without an api key (anonymous clients).
	pub client_key: Option<Strng>,
}

/// Gates each call on tenant budget, quota, rate limit, and model access,
/// then accounts for it afterwards. Holds references to the store, limiter,
/// and audit sink; owns none of them.
pub struct Governance {
	store: Arc<dyn TenantStore>,
	limiter: Arc<RateLimiter>,
	policy: Option<Arc<PolicyEngine>>,
	audit: Option<Arc<dyn AuditSink>>,
	cfg: GovernanceConfig,
}

impl Governance {
	pub fn new(
		store: Arc<dyn TenantStore>,
		limiter: Arc<RateLimiter>,
		policy: Option<Arc<PolicyEngine>>,
		audit: Option<Arc<dyn AuditSink>>,
		cfg: GovernanceConfig,
	) -> Self {
		Governance {
			store,
			limiter,
			policy,
			audit,
			cfg,
		}
	}

	/// Pre-request gate: model access, budgets across every scope, then rate
	/// limits. The first denial wins.
	pub async fn evaluate(
		&self,
		auth: &AuthContext,
		input: &EvalInput,
	) -> Result<(), GovernanceError> {
		// Resolve entities once for the whole evaluation.
		let key = self.store.get_key(&auth.api_key_id).await?;
		let team = match &auth.team_id {
			Some(id) => self.store.get_team(id).await?,
			None => None,
		};
		let user = match &auth.user_id {
			Some(id) => self.store.get_user(id).await?,
			None => None,
		};
		let org = match &auth.org_id {
			Some(id) => self.store.get_org(id).await?,
			None => None,
		};
		let end_user = match input.end_user_id.as_ref().or(auth.end_user_id.as_ref()) {
			Some(id) => self.store.get_end_user(id).await?,
			None => None,
		};

		self.check_model_access(auth, key.as_ref(), &input.model)?;
		self
			.check_budgets(auth, input, key.as_ref(), team.as_ref(), user.as_ref(), org.as_ref(), end_user.as_ref())
			.await?;
		self.check_rate_limits(auth, input, key.as_ref(), team.as_ref()).await
	}

	fn check_model_access(
		&self,
		auth: &AuthContext,
		key: Option<&KeyRecord>,
		model: &Strng,
	) -> Result<(), GovernanceError> {
		let allowed_models = key
			.and_then(|k| k.allowed_models.clone())
			.or_else(|| auth.allowed_models.clone());
		if let Some(engine) = &self.policy {
			let subject = policy::key_subject(&auth.api_key_id);
			// Legacy allow-lists are materialized as policies; the engine is
			// authoritative afterwards, so revoking an allow-listed model means
			// removing the materialized policy.
			if let Some(models) = &allowed_models {
				for m in models {
					let object = if m.as_str() == "*" {
						strng::literal!("*")
					} else {
						policy::model_object(m)
					};
					engine.add_policy(subject.clone(), object, strng::new(policy::ACTION_USE));
				}
			}
			if !engine.enforce(&subject, &policy::model_object(model), policy::ACTION_USE) {
				return Err(GovernanceError::Permission(format!(
					"key is not allowed to use model {model}"
				)));
			}
			return Ok(());
		}
		// No policy evaluator: legacy semantics. A missing list or a `*` entry
		// allows everything.
		match &allowed_models {
			None => Ok(()),
			Some(models) if models.iter().any(|m| m.as_str() == "*" || m == model) => Ok(()),
			Some(_) => Err(GovernanceError::Permission(format!(
				"key is not allowed to use model {model}"
			))),
		}
	}

	#[allow(clippy::too_many_arguments)]
	async fn check_budgets(
		&self,
		auth: &AuthContext,
		input: &EvalInput,
		key: Option<&KeyRecord>,
		team: Option<&TeamRecord>,
		user: Option<&UserRecord>,
		org: Option<&OrgRecord>,
		end_user: Option<&EndUserRecord>,
	) -> Result<(), GovernanceError> {
		let projected = input.projected_cost;
		let over = |spent: f64, max: Option<f64>| -> Option<f64> {
			max.filter(|m| spent + projected > *m)
		};

		if let Some(k) = key {
			if k.blocked {
				return Err(GovernanceError::Permission("api key is blocked".to_string()));
			}
			let scope = SpendScope::Key(k.id.clone());
			if let Some(max) = over(k.spend, k.max_budget.or(auth.max_budget)) {
				return self.budget_denial(auth, input, scope, k.spend, max).await;
			}
			if let Some(max) = k.model_max_budget.get(&input.model) {
				let spent = k.model_spend.get(&input.model).copied().unwrap_or_default();
				if spent >= *max {
					let scope = SpendScope::KeyModel(k.id.clone(), input.model.clone());
					return self.budget_denial(auth, input, scope, spent, *max).await;
				}
			}
		}

		if let Some(t) = team {
			if t.blocked {
				return Err(GovernanceError::Permission("team is blocked".to_string()));
			}
			if let Some(max) = over(t.spend, t.max_budget) {
				let scope = SpendScope::Team(t.id.clone());
				return self.budget_denial(auth, input, scope, t.spend, max).await;
			}
			if let Some(max) = t.model_max_budget.get(&input.model) {
				let spent = t.model_spend.get(&input.model).copied().unwrap_or_default();
				if spent >= *max {
					let scope = SpendScope::TeamModel(t.id.clone(), input.model.clone());
					return self.budget_denial(auth, input, scope, spent, *max).await;
				}
			}
		}

		if let Some(u) = user {
			if u.blocked {
				return Err(GovernanceError::Permission("user is blocked".to_string()));
			}
			if let Some(max) = over(u.spend, u.max_budget) {
				let scope = SpendScope::User(u.id.clone());
				return self.budget_denial(auth, input, scope, u.spend, max).await;
			}
		}

		if let Some(o) = org {
			if o.blocked {
				return Err(GovernanceError::Permission("organization is blocked".to_string()));
			}
			if let Some(max) = over(o.spend, o.max_budget) {
				let scope = SpendScope::Org(o.id.clone());
				return self.budget_denial(auth, input, scope, o.spend, max).await;
			}
		}

		if let Some(e) = end_user {
			if e.blocked {
				return Err(GovernanceError::Permission("end user is blocked".to_string()));
			}
			if let Some(max) = over(e.spend, e.max_budget) {
				let scope = SpendScope::EndUser(e.id.clone());
				return self.budget_denial(auth, input, scope, e.spend, max).await;
			}
		}

		Ok(())
	}

	async fn budget_denial(
		&self,
		auth: &AuthContext,
		input: &EvalInput,
		scope: SpendScope,
		spent: f64,
		max: f64,
	) -> Result<(), GovernanceError> {
		let scope_name = strng::new(scope.to_string());
		if let Some(audit) = &self.audit {
			audit
				.record(AuditRecord {
					at: Utc::now(),
					api_key_id: auth.api_key_id.clone(),
					model: input.model.clone(),
					scope: scope_name.clone(),
					reason: strng::literal!("budget_exceeded"),
				})
				.await;
		}
		Err(GovernanceError::Quota {
			scope: scope_name,
			spent,
			projected: input.projected_cost,
			max,
		})
	}

	async fn check_rate_limits(
		&self,
		auth: &AuthContext,
		input: &EvalInput,
		key: Option<&KeyRecord>,
		team: Option<&TeamRecord>,
	) -> Result<(), GovernanceError> {
		// Team bucket first, so a hot team saturates before individual keys
		// burn their own allowance.
		if let Some(t) = team {
			if let Some(rpm) = t.rpm_limit {
				let bucket = strng::format!("team:{}", t.id);
				let decision = self
					.limiter
					.check(&bucket, rpm, burst_for(rpm, t.burst))
					.await;
				if !decision.allowed {
					return Err(GovernanceError::RateLimit {
						scope: bucket,
						retry_after: decision.retry_after,
					});
				}
			}
		}

		let (bucket, rpm, burst) = if !auth.api_key_id.is_empty() {
			let rpm = key
				.and_then(|k| k.rpm_limit)
				.or(auth.rpm_limit)
				.unwrap_or_default();
			let burst = key.and_then(|k| k.burst).or(auth.burst);
			(strng::format!("key:{}", auth.api_key_id), rpm, burst)
		} else if let Some(user) = &auth.user_id {
			(strng::format!("user:{user}"), auth.rpm_limit.unwrap_or_default(), auth.burst)
		} else if let Some(client) = &input.client_key {
			(client.clone(), auth.rpm_limit.unwrap_or_default(), auth.burst)
		} else {
			return Ok(());
		};
		if rpm == 0 {
			return Ok(());
		}
		let decision = self.limiter.check(&bucket, rpm, burst_for(rpm, burst)).await;
		if !decision.allowed {
			return Err(GovernanceError::RateLimit {
				scope: bucket,
				retry_after: decision.retry_after,
			});
		}
		Ok(())
	}

	/// Post-request accounting. Exactly one UsageLog per (call_type,
	/// request_id) within the idempotency window; spend updates are
	/// best-effort and logged on failure.
	pub async fn account(&self, auth: &AuthContext, usage: UsageLog) -> Result<(), GovernanceError> {
		let idem_key = format!("usage:{}:{}", usage.call_type.as_str(), usage.request_id);
		if !self
			.store
			.put_if_absent(&idem_key, self.cfg.idempotency_window)
			.await?
		{
			debug!(request_id = %usage.request_id, "duplicate accounting dropped");
			return Ok(());
		}

		let cost = usage.cost;
		let model = usage.model.clone();
		let mut scopes: Vec<SpendScope> = Vec::with_capacity(8);
		if !auth.api_key_id.is_empty() {
			scopes.push(SpendScope::Key(auth.api_key_id.clone()));
			scopes.push(SpendScope::KeyModel(auth.api_key_id.clone(), model.clone()));
		}
		if let Some(team) = &auth.team_id {
			scopes.push(SpendScope::Team(team.clone()));
			scopes.push(SpendScope::TeamModel(team.clone(), model.clone()));
		}
		if let Some(user) = &auth.user_id {
			scopes.push(SpendScope::User(user.clone()));
			if let Some(team) = &auth.team_id {
				scopes.push(SpendScope::TeamMembership {
					user: user.clone(),
					team: team.clone(),
				});
			}
		}
		if let Some(org) = &auth.org_id {
			scopes.push(SpendScope::Org(org.clone()));
			if let Some(user) = &auth.user_id {
				scopes.push(SpendScope::OrgMembership {
					user: user.clone(),
					org: org.clone(),
				});
			}
		}
		if let Some(end_user) = usage.end_user_id.as_ref().or(auth.end_user_id.as_ref()) {
			scopes.push(SpendScope::EndUser(end_user.clone()));
		}
		for scope in &scopes {
			if let Err(e) = self.store.update_spend(scope, cost).await {
				warn!(scope = %scope, err = %e, "spend update failed");
			}
		}

		self.store.log_usage(usage).await?;
		Ok(())
	}

	pub fn async_accounting(&self) -> bool {
		self.cfg.async_accounting
	}
}
