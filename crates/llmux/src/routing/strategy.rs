use chrono::Utc;
use rand::Rng;
use rand::seq::{IndexedRandom, SliceRandom};

use super::{Candidate, RouteError, SharedRng};
use crate::config::RoutingConfig;
use crate::types::RequestContext;
use crate::*;

/// One routing strategy. Strategies are pure selection over a pre-filtered,
/// pre-snapshotted candidate list; the router base owns filtering and stats
/// access. Hot-swapping happens by atomic pointer replace on the router.
pub trait RouteStrategy: Send + Sync {
	fn name(&self) -> Strng;

	/// Whether the tag filter is mandatory for this strategy.
	fn requires_tags(&self) -> bool {
		false
	}

	fn select(
		&self,
		ctx: &RequestContext,
		candidates: Vec<Candidate>,
		rng: &SharedRng,
	) -> Result<Candidate, RouteError>;
}

/// Build a strategy from its config name.
pub fn strategy_for(cfg: &RoutingConfig) -> Result<Box<dyn RouteStrategy>, RouteError> {
	let strategy: Box<dyn RouteStrategy> = match cfg.strategy.as_str() {
		"simple-shuffle" => Box::new(SimpleShuffle),
		"lowest-latency" => Box::new(LowestLatency {
			buffer: cfg.latency_buffer,
		}),
		"least-busy" => Box::new(LeastBusy),
		"lowest-usage" => Box::new(LowestUsage),
		"lowest-cost" => Box::new(LowestCost),
		"tag-based" => Box::new(TagBased),
		other => return Err(RouteError::UnknownStrategy(strng::new(other))),
	};
	Ok(strategy)
}

fn uniform(candidates: Vec<Candidate>, rng: &SharedRng) -> Result<Candidate, RouteError> {
	rng
		.with(|r| candidates.choose(r).cloned())
		.ok_or_else(|| RouteError::NoAvailableDeployment(strng::EMPTY))
}

/// Weighted random draw. Weight priority: explicit weights, then RPM limits,
/// then TPM limits, then uniform.
pub struct SimpleShuffle;

impl RouteStrategy for SimpleShuffle {
	fn name(&self) -> Strng {
		strng::literal!("simple-shuffle")
	}

	fn select(
		&self,
		_ctx: &RequestContext,
		candidates: Vec<Candidate>,
		rng: &SharedRng,
	) -> Result<Candidate, RouteError> {
		let weighted = |f: &dyn Fn(&Candidate) -> f64| -> Option<Candidate> {
			if candidates.iter().any(|c| f(c) > 0.0) {
				rng
					.with(|r| candidates.choose_weighted(r, |c| f(c)).cloned())
					.ok()
			} else {
				None
			}
		};
		if let Some(c) = weighted(&|c| c.config.weight) {
			return Ok(c);
		}
		if let Some(c) = weighted(&|c| c.config.rpm_limit as f64) {
			return Ok(c);
		}
		if let Some(c) = weighted(&|c| c.config.tpm_limit as f64) {
			return Ok(c);
		}
		uniform(candidates, rng)
	}
}

/// Prefer the deployment with the lowest observed latency; for streaming
/// requests the TTFT window is used when it has history. Candidates within
/// `buffer` of the lowest are treated as ties and drawn uniformly.
pub struct LowestLatency {
	pub buffer: f64,
}

impl LowestLatency {
	fn latency_of(ctx: &RequestContext, c: &Candidate) -> f64 {
		if ctx.streaming && !c.stats.ttft_window.is_empty() {
			c.stats.avg_ttft_ms
		} else {
			// Empty history yields 0, deliberately prioritizing untested
			// deployments so they accumulate a window.
			c.stats.avg_latency_ms
		}
	}
}

impl RouteStrategy for LowestLatency {
	fn name(&self) -> Strng {
		strng::literal!("lowest-latency")
	}

	fn select(
		&self,
		ctx: &RequestContext,
		mut candidates: Vec<Candidate>,
		rng: &SharedRng,
	) -> Result<Candidate, RouteError> {
		// Shuffle first so the stable sort breaks exact ties randomly.
		rng.with(|r| candidates.shuffle(r));
		candidates.sort_by(|a, b| {
			Self::latency_of(ctx, a).total_cmp(&Self::latency_of(ctx, b))
		});
		let lowest = match candidates.first() {
			Some(c) => Self::latency_of(ctx, c),
			None => return Err(RouteError::NoAvailableDeployment(ctx.model.clone())),
		};
		if lowest == 0.0 {
			return uniform(candidates, rng);
		}
		let threshold = lowest * (1.0 + self.buffer);
		let pool: Vec<Candidate> = candidates
			.into_iter()
			.filter(|c| Self::latency_of(ctx, c) <= threshold)
			.collect();
		uniform(pool, rng)
	}
}

/// Pick the deployment with the fewest in-flight requests.
pub struct LeastBusy;

impl RouteStrategy for LeastBusy {
	fn name(&self) -> Strng {
		strng::literal!("least-busy")
	}

	fn select(
		&self,
		ctx: &RequestContext,
		mut candidates: Vec<Candidate>,
		rng: &SharedRng,
	) -> Result<Candidate, RouteError> {
		rng.with(|r| candidates.shuffle(r));
		candidates
			.into_iter()
			.min_by_key(|c| c.stats.active_requests)
			.ok_or_else(|| RouteError::NoAvailableDeployment(ctx.model.clone()))
	}
}

/// Pick the deployment with the lowest current-minute token usage.
pub struct LowestUsage;

impl RouteStrategy for LowestUsage {
	fn name(&self) -> Strng {
		strng::literal!("lowest-usage")
	}

	fn select(
		&self,
		ctx: &RequestContext,
		mut candidates: Vec<Candidate>,
		rng: &SharedRng,
	) -> Result<Candidate, RouteError> {
		let now = Utc::now();
		rng.with(|r| candidates.shuffle(r));
		candidates
			.into_iter()
			.min_by_key(|c| c.stats.current_tpm(now))
			.ok_or_else(|| RouteError::NoAvailableDeployment(ctx.model.clone()))
	}
}

/// Pick the cheapest deployment by combined per-token price. Deployments
/// with no configured price sort last.
pub struct LowestCost;

const UNPRICED_SENTINEL: f64 = f64::MAX;

impl RouteStrategy for LowestCost {
	fn name(&self) -> Strng {
		strng::literal!("lowest-cost")
	}

	fn select(
		&self,
		ctx: &RequestContext,
		mut candidates: Vec<Candidate>,
		rng: &SharedRng,
	) -> Result<Candidate, RouteError> {
		let cost = |c: &Candidate| -> f64 {
			let total = c.config.input_cost_per_token + c.config.output_cost_per_token;
			if total == 0.0 { UNPRICED_SENTINEL } else { total }
		};
		rng.with(|r| candidates.shuffle(r));
		candidates.sort_by(|a, b| cost(a).total_cmp(&cost(b)));
		candidates
			.into_iter()
			.next()
			.ok_or_else(|| RouteError::NoAvailableDeployment(ctx.model.clone()))
	}
}

/// Uniform selection among tag-matched deployments; the tag filter is
/// mandatory for this strategy.
pub struct TagBased;

impl RouteStrategy for TagBased {
	fn name(&self) -> Strng {
		strng::literal!("tag-based")
	}

	fn requires_tags(&self) -> bool {
		true
	}

	fn select(
		&self,
		_ctx: &RequestContext,
		candidates: Vec<Candidate>,
		rng: &SharedRng,
	) -> Result<Candidate, RouteError> {
		uniform(candidates, rng)
	}
}

/// Uniform random pick used by tests needing a fixed distribution.
#[allow(dead_code)]
pub(crate) fn pick_index(rng: &SharedRng, n: usize) -> usize {
	rng.with(|r| r.random_range(0..n))
}
