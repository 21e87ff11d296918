pub mod strategy;

use arc_swap::ArcSwap;
use chrono::Utc;
use parking_lot::Mutex;
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::errors::ErrorKind;
use crate::registry::Registry;
use crate::stats::{DeploymentStats, StatsStore};
use crate::types::{Deployment, DeploymentConfig, RequestContext, ResponseMetrics};
use crate::*;

pub use self::strategy::{RouteStrategy, strategy_for};

pub const DEFAULT_TAG: &str = "default";

/// One deployment as seen by a selection pass: identity, routing config, and
/// a stats snapshot taken before selection started.
#[derive(Debug, Clone)]
pub struct Candidate {
	pub deployment: Arc<Deployment>,
	pub config: DeploymentConfig,
	pub stats: DeploymentStats,
}

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
	#[error("no available deployment for model {0}")]
	NoAvailableDeployment(Strng),
	#[error("no deployments matching request tags for model {0}")]
	NoDeploymentsWithTag(Strng),
	#[error("unknown routing strategy {0}")]
	UnknownStrategy(Strng),
}

impl RouteError {
	pub fn kind(&self) -> ErrorKind {
		match self {
			RouteError::NoAvailableDeployment(_) => ErrorKind::ServiceUnavailable,
			RouteError::NoDeploymentsWithTag(_) => ErrorKind::ServiceUnavailable,
			RouteError::UnknownStrategy(_) => ErrorKind::Internal,
		}
	}
}

/// Selection must be safe under concurrent picks: the generator sits behind
/// its own small mutex and is acquired once per selection step, never shared
/// unguarded.
pub struct SharedRng(Mutex<StdRng>);

impl SharedRng {
	pub fn new() -> Self {
		SharedRng(Mutex::new(StdRng::from_os_rng()))
	}

	pub fn seeded(seed: u64) -> Self {
		SharedRng(Mutex::new(StdRng::seed_from_u64(seed)))
	}

	pub fn with<R>(&self, f: impl FnOnce(&mut StdRng) -> R) -> R {
		let mut rng = self.0.lock();
		f(&mut rng)
	}
}

impl Default for SharedRng {
	fn default() -> Self {
		Self::new()
	}
}

#[derive(Debug, Clone)]
pub struct RouterOptions {
	pub cooldown_period: Duration,
	pub default_estimated_tokens: u64,
	pub tag_filtering: bool,
}

impl Default for RouterOptions {
	fn default() -> Self {
		RouterOptions {
			cooldown_period: Duration::from_secs(60),
			default_estimated_tokens: types::DEFAULT_ESTIMATED_TOKENS,
			tag_filtering: true,
		}
	}
}

/// Strategy-based deployment selection. The router owns neither deployments
/// nor stats: it reads deployments through the registry and statistics
/// through the stats store, and composes healthy-set, tag, and TPM/RPM
/// filtering in front of the active strategy.
pub struct Router {
	registry: Arc<Registry>,
	stats: Arc<dyn StatsStore>,
	strategy: ArcSwap<Box<dyn RouteStrategy>>,
	options: RouterOptions,
	rng: SharedRng,
}

impl Router {
	pub fn new(
		registry: Arc<Registry>,
		stats: Arc<dyn StatsStore>,
		strategy: Box<dyn RouteStrategy>,
		options: RouterOptions,
	) -> Self {
		Router {
			registry,
			stats,
			strategy: ArcSwap::from_pointee(strategy),
			options,
			rng: SharedRng::new(),
		}
	}

	#[cfg(test)]
	pub fn with_seeded_rng(mut self, seed: u64) -> Self {
		self.rng = SharedRng::seeded(seed);
		self
	}

	/// Swap the selection strategy. In-flight picks finish on the strategy
	/// they loaded.
	pub fn set_strategy(&self, strategy: Box<dyn RouteStrategy>) {
		self.strategy.store(Arc::new(strategy));
	}

	pub fn strategy_name(&self) -> Strng {
		self.strategy.load().name()
	}

	pub async fn pick(&self, model: &str) -> Result<Candidate, RouteError> {
		let ctx = RequestContext::new(strng::new(model), types::CallType::Chat);
		self.pick_with_context(&ctx).await
	}

	pub async fn pick_with_context(&self, ctx: &RequestContext) -> Result<Candidate, RouteError> {
		let strategy = self.strategy.load_full();
		let candidates = self.healthy_candidates(ctx).await?;
		let candidates = self.filter_tags(ctx, candidates, strategy.requires_tags())?;
		let candidates = self.filter_tpm_rpm(ctx, candidates)?;
		strategy.select(ctx, candidates, &self.rng)
	}

	/// The healthy set: every registered deployment for the model that is not
	/// in cooldown, with a stats snapshot attached.
	async fn healthy_candidates(&self, ctx: &RequestContext) -> Result<Vec<Candidate>, RouteError> {
		let entries = self.registry.list(&ctx.model);
		if entries.is_empty() {
			return Err(RouteError::NoAvailableDeployment(ctx.model.clone()));
		}
		let now = Utc::now();
		let mut candidates = Vec::with_capacity(entries.len());
		for entry in entries {
			let stats = match self.stats.get_stats(&entry.deployment.id).await {
				Ok(s) => s,
				Err(stats::StatsError::NotFound(_)) => DeploymentStats::new(entry.deployment.id.clone()),
				Err(e) => {
					// Stats failures never fail a request; treat as untested.
					warn!(deployment = %entry.deployment.id, err = %e, "stats read failed");
					DeploymentStats::new(entry.deployment.id.clone())
				},
			};
			if stats.in_cooldown(now) {
				continue;
			}
			candidates.push(Candidate {
				deployment: entry.deployment,
				config: entry.config,
				stats,
			});
		}
		if candidates.is_empty() {
			return Err(RouteError::NoAvailableDeployment(ctx.model.clone()));
		}
		Ok(candidates)
	}

	fn filter_tags(
		&self,
		ctx: &RequestContext,
		candidates: Vec<Candidate>,
		mandatory: bool,
	) -> Result<Vec<Candidate>, RouteError> {
		if ctx.tags.is_empty() || !(self.options.tag_filtering || mandatory) {
			return Ok(candidates);
		}
		let matching: Vec<Candidate> = candidates
			.iter()
			.filter(|c| c.config.tags.iter().any(|t| ctx.tags.contains(t)))
			.cloned()
			.collect();
		if !matching.is_empty() {
			return Ok(matching);
		}
		let defaults: Vec<Candidate> = candidates
			.iter()
			.filter(|c| c.config.tags.iter().any(|t| t.as_str() == DEFAULT_TAG))
			.cloned()
			.collect();
		if !defaults.is_empty() {
			return Ok(defaults);
		}
		if mandatory {
			return Err(RouteError::NoDeploymentsWithTag(ctx.model.clone()));
		}
		// Tag filtering is advisory for the other strategies.
		Ok(candidates)
	}

	fn filter_tpm_rpm(
		&self,
		ctx: &RequestContext,
		candidates: Vec<Candidate>,
	) -> Result<Vec<Candidate>, RouteError> {
		let now = Utc::now();
		let estimated = if ctx.estimated_input_tokens > 0 {
			ctx.estimated_input_tokens
		} else {
			self.options.default_estimated_tokens
		};
		let model = ctx.model.clone();
		let remaining: Vec<Candidate> = candidates
			.into_iter()
			.filter(|c| {
				// Limits of zero mean unlimited. TPM is a strict greater-than
				// check; RPM must leave one slot free.
				let tpm_ok =
					c.config.tpm_limit == 0 || c.stats.current_tpm(now) + estimated <= c.config.tpm_limit;
				let rpm_ok = c.config.rpm_limit == 0 || c.stats.current_rpm(now) + 1 < c.config.rpm_limit;
				tpm_ok && rpm_ok
			})
			.collect();
		if remaining.is_empty() {
			return Err(RouteError::NoAvailableDeployment(model));
		}
		Ok(remaining)
	}

	pub async fn report_request_start(&self, id: &str) {
		if let Err(e) = self.stats.increment_active(id).await {
			warn!(deployment = id, err = %e, "failed to increment active count");
		}
	}

	pub async fn report_request_end(&self, id: &str) {
		if let Err(e) = self.stats.decrement_active(id).await {
			warn!(deployment = id, err = %e, "failed to decrement active count");
		}
	}

	pub async fn report_success(&self, id: &str, metrics: &ResponseMetrics) {
		if let Err(e) = self.stats.record_success(id, metrics).await {
			warn!(deployment = id, err = %e, "failed to record success");
		}
	}

	/// Record a failure; cooldown-worthy kinds exclude the deployment from
	/// routing for the configured period.
	pub async fn report_failure(&self, id: &str, kind: ErrorKind) {
		if let Err(e) = self.stats.record_failure(id, kind).await {
			warn!(deployment = id, err = %e, "failed to record failure");
		}
		if kind.cooldown_worthy() {
			let until = Utc::now()
				+ chrono::Duration::from_std(self.options.cooldown_period)
					.unwrap_or_else(|_| chrono::Duration::seconds(60));
			if let Err(e) = self.stats.set_cooldown(id, until).await {
				warn!(deployment = id, err = %e, "failed to set cooldown");
			}
		}
	}

	pub async fn is_circuit_open(&self, id: &str) -> bool {
		match self.stats.cooldown_until(id).await {
			Ok(Some(until)) => until > Utc::now(),
			Ok(None) => false,
			Err(e) => {
				warn!(deployment = id, err = %e, "failed to read cooldown");
				false
			},
		}
	}

	pub async fn cooldown_remaining(&self, id: &str) -> Option<Duration> {
		match self.stats.cooldown_until(id).await {
			Ok(Some(until)) => (until - Utc::now()).to_std().ok(),
			_ => None,
		}
	}
}

#[cfg(test)]
mod tests;
