use chrono::Utc;

use super::strategy::*;
use super::*;
use crate::config::RoutingConfig;
use crate::errors::ErrorKind;
use crate::stats::MemoryStatsStore;
use crate::types::{CallType, Deployment, DeploymentConfig, TokenSource};

fn deployment(id: &str, model: &str) -> Deployment {
	Deployment {
		id: strng::new(id),
		provider: strng::literal!("openai"),
		model: strng::new(model),
		model_alias: None,
		base_url: None,
		token_source: TokenSource::None,
		max_concurrent: 0,
		timeout: Duration::from_secs(30),
		priority: 0,
		metadata: HashMap::new(),
	}
}

fn metrics(latency_ms: u64, ttft_ms: Option<u64>, tokens: u64) -> types::ResponseMetrics {
	types::ResponseMetrics {
		latency: Duration::from_millis(latency_ms),
		ttft: ttft_ms.map(Duration::from_millis),
		input_tokens: 0,
		output_tokens: tokens,
		total_tokens: tokens,
		cost: 0.0,
	}
}

struct Setup {
	registry: Arc<Registry>,
	stats: Arc<MemoryStatsStore>,
}

impl Setup {
	fn new() -> Self {
		Setup {
			registry: Arc::new(Registry::new()),
			stats: Arc::new(MemoryStatsStore::default()),
		}
	}

	fn add(&self, id: &str, model: &str, config: DeploymentConfig) {
		self.registry.add(deployment(id, model), config);
	}

	fn router(&self, strategy: &str) -> Router {
		let cfg = RoutingConfig {
			strategy: strng::new(strategy),
			..Default::default()
		};
		Router::new(
			self.registry.clone(),
			self.stats.clone(),
			strategy_for(&cfg).unwrap(),
			RouterOptions::default(),
		)
	}
}

#[tokio::test]
async fn unknown_model_has_no_deployment() {
	let setup = Setup::new();
	let router = setup.router("simple-shuffle");
	let err = router.pick("missing").await.unwrap_err();
	assert!(matches!(err, RouteError::NoAvailableDeployment(_)));
	assert_eq!(err.kind(), ErrorKind::ServiceUnavailable);
}

#[tokio::test]
async fn cooldown_excludes_deployment() {
	let setup = Setup::new();
	setup.add("a", "m", DeploymentConfig::default());
	setup.add("b", "m", DeploymentConfig::default());
	let router = setup.router("simple-shuffle");

	router.report_failure("a", ErrorKind::RateLimit).await;

	assert!(router.is_circuit_open("a").await);
	assert!(!router.is_circuit_open("b").await);
	let remaining = router.cooldown_remaining("a").await.unwrap();
	assert!(remaining > Duration::from_secs(50) && remaining <= Duration::from_secs(60));

	// Until expiry, every pick lands on b.
	for _ in 0..20 {
		let pick = router.pick("m").await.unwrap();
		assert_eq!(pick.deployment.id, "b");
	}
}

#[tokio::test]
async fn non_cooldown_worthy_failure_keeps_deployment() {
	let setup = Setup::new();
	setup.add("a", "m", DeploymentConfig::default());
	let router = setup.router("simple-shuffle");
	router.report_failure("a", ErrorKind::InvalidRequest).await;
	assert!(!router.is_circuit_open("a").await);
	assert!(router.pick("m").await.is_ok());
}

#[tokio::test]
async fn all_cooled_down_is_no_available() {
	let setup = Setup::new();
	setup.add("a", "m", DeploymentConfig::default());
	let router = setup.router("simple-shuffle");
	router.report_failure("a", ErrorKind::ServiceUnavailable).await;
	assert!(matches!(
		router.pick("m").await,
		Err(RouteError::NoAvailableDeployment(_))
	));
}

#[tokio::test]
async fn weighted_shuffle_distribution() {
	let setup = Setup::new();
	setup.add(
		"a",
		"m",
		DeploymentConfig {
			weight: 0.9,
			..Default::default()
		},
	);
	setup.add(
		"b",
		"m",
		DeploymentConfig {
			weight: 0.1,
			..Default::default()
		},
	);
	let router = setup.router("simple-shuffle").with_seeded_rng(7);

	let mut a_count = 0u32;
	for _ in 0..10_000 {
		if router.pick("m").await.unwrap().deployment.id == "a" {
			a_count += 1;
		}
	}
	assert!(
		(8_500..=9_500).contains(&a_count),
		"a picked {a_count} times"
	);
}

#[tokio::test]
async fn shuffle_falls_back_to_rpm_weights() {
	let setup = Setup::new();
	setup.add(
		"a",
		"m",
		DeploymentConfig {
			rpm_limit: 900,
			..Default::default()
		},
	);
	setup.add(
		"b",
		"m",
		DeploymentConfig {
			rpm_limit: 100,
			..Default::default()
		},
	);
	let router = setup.router("simple-shuffle").with_seeded_rng(11);
	let mut a_count = 0u32;
	for _ in 0..2_000 {
		if router.pick("m").await.unwrap().deployment.id == "a" {
			a_count += 1;
		}
	}
	// RPM limits act as draw weights when no explicit weight is set.
	assert!(a_count > 1_500, "a picked {a_count} times");
}

#[tokio::test]
async fn ttft_drives_streaming_latency_routing() {
	let setup = Setup::new();
	setup.add("a", "m", DeploymentConfig::default());
	setup.add("b", "m", DeploymentConfig::default());
	// a: slow overall but fast to first token. b: the reverse.
	for _ in 0..5 {
		setup
			.stats
			.record_success("a", &metrics(500, Some(50), 10))
			.await
			.unwrap();
		setup
			.stats
			.record_success("b", &metrics(100, Some(200), 10))
			.await
			.unwrap();
	}
	let router = setup.router("lowest-latency").with_seeded_rng(3);

	let mut ctx = types::RequestContext::new(strng::literal!("m"), CallType::Chat);
	ctx.streaming = true;
	let mut streaming_a = 0u32;
	for _ in 0..100 {
		if router.pick_with_context(&ctx).await.unwrap().deployment.id == "a" {
			streaming_a += 1;
		}
	}
	assert!(streaming_a > 50, "streaming picked a {streaming_a} times");

	ctx.streaming = false;
	let mut blocking_b = 0u32;
	for _ in 0..100 {
		if router.pick_with_context(&ctx).await.unwrap().deployment.id == "b" {
			blocking_b += 1;
		}
	}
	assert!(blocking_b > 50, "blocking picked b {blocking_b} times");
}

#[tokio::test]
async fn latency_ties_within_buffer_spread_uniformly() {
	let setup = Setup::new();
	setup.add("a", "m", DeploymentConfig::default());
	setup.add("b", "m", DeploymentConfig::default());
	// 100ms vs 105ms: within the 10% buffer, so both are eligible.
	for _ in 0..5 {
		setup
			.stats
			.record_success("a", &metrics(100, None, 1))
			.await
			.unwrap();
		setup
			.stats
			.record_success("b", &metrics(105, None, 1))
			.await
			.unwrap();
	}
	let router = setup.router("lowest-latency").with_seeded_rng(5);
	let mut counts = HashMap::new();
	for _ in 0..64 {
		let pick = router.pick("m").await.unwrap();
		*counts.entry(pick.deployment.id.clone()).or_insert(0u32) += 1;
	}
	assert!(counts.len() == 2, "both deployments picked: {counts:?}");
	assert!(counts.values().all(|&n| n >= 8), "skewed spread: {counts:?}");
}

#[tokio::test]
async fn latency_untested_deployment_prioritized() {
	let setup = Setup::new();
	setup.add("tested", "m", DeploymentConfig::default());
	setup.add("fresh", "m", DeploymentConfig::default());
	for _ in 0..5 {
		setup
			.stats
			.record_success("tested", &metrics(100, None, 1))
			.await
			.unwrap();
	}
	let router = setup.router("lowest-latency").with_seeded_rng(9);
	// fresh has no history, so its latency reads 0 and the pick is a uniform
	// draw over all candidates rather than locking onto "tested".
	let mut fresh = 0u32;
	for _ in 0..100 {
		if router.pick("m").await.unwrap().deployment.id == "fresh" {
			fresh += 1;
		}
	}
	assert!(fresh > 20, "fresh picked {fresh} times");
}

#[tokio::test]
async fn least_busy_picks_minimum_active() {
	let setup = Setup::new();
	setup.add("busy", "m", DeploymentConfig::default());
	setup.add("idle", "m", DeploymentConfig::default());
	setup.stats.increment_active("busy").await.unwrap();
	setup.stats.increment_active("busy").await.unwrap();
	let router = setup.router("least-busy");
	for _ in 0..10 {
		assert_eq!(router.pick("m").await.unwrap().deployment.id, "idle");
	}
}

#[tokio::test]
async fn tpm_filter_boundaries() {
	let setup = Setup::new();
	setup.add(
		"a",
		"m",
		DeploymentConfig {
			tpm_limit: 1_000,
			..Default::default()
		},
	);
	let router = setup.router("lowest-usage");
	let mut ctx = types::RequestContext::new(strng::literal!("m"), CallType::Chat);

	// current_tpm = 500 after this.
	setup
		.stats
		.record_success("a", &metrics(10, None, 500))
		.await
		.unwrap();

	ctx.estimated_input_tokens = 499; // 500 + 499 = 999 < limit
	assert!(router.pick_with_context(&ctx).await.is_ok());
	ctx.estimated_input_tokens = 500; // equals limit: strict greater-than, passes
	assert!(router.pick_with_context(&ctx).await.is_ok());
	ctx.estimated_input_tokens = 501; // exceeds limit
	assert!(matches!(
		router.pick_with_context(&ctx).await,
		Err(RouteError::NoAvailableDeployment(_))
	));
}

#[tokio::test]
async fn rpm_filter_leaves_one_slot() {
	let setup = Setup::new();
	setup.add(
		"a",
		"m",
		DeploymentConfig {
			rpm_limit: 3,
			..Default::default()
		},
	);
	let router = setup.router("lowest-usage");
	assert!(router.pick("m").await.is_ok());
	setup.stats.record_success("a", &metrics(10, None, 1)).await.unwrap();
	assert!(router.pick("m").await.is_ok());
	setup.stats.record_success("a", &metrics(10, None, 1)).await.unwrap();
	// current_rpm = 2: 2 + 1 >= 3 drops the deployment.
	assert!(router.pick("m").await.is_err());
}

#[tokio::test]
async fn lowest_usage_picks_lowest_tpm() {
	let setup = Setup::new();
	setup.add("hot", "m", DeploymentConfig::default());
	setup.add("cold", "m", DeploymentConfig::default());
	setup
		.stats
		.record_success("hot", &metrics(10, None, 10_000))
		.await
		.unwrap();
	setup
		.stats
		.record_success("cold", &metrics(10, None, 10))
		.await
		.unwrap();
	let router = setup.router("lowest-usage");
	for _ in 0..10 {
		assert_eq!(router.pick("m").await.unwrap().deployment.id, "cold");
	}
}

#[tokio::test]
async fn lowest_cost_prefers_priced_deployments() {
	let setup = Setup::new();
	setup.add(
		"cheap",
		"m",
		DeploymentConfig {
			input_cost_per_token: 0.000_001,
			output_cost_per_token: 0.000_002,
			..Default::default()
		},
	);
	setup.add(
		"pricey",
		"m",
		DeploymentConfig {
			input_cost_per_token: 0.000_01,
			output_cost_per_token: 0.000_03,
			..Default::default()
		},
	);
	// Unpriced deployments sort behind configured ones.
	setup.add("unpriced", "m", DeploymentConfig::default());
	let router = setup.router("lowest-cost");
	for _ in 0..10 {
		assert_eq!(router.pick("m").await.unwrap().deployment.id, "cheap");
	}
}

#[tokio::test]
async fn tag_filter_intersects_and_falls_back() {
	let setup = Setup::new();
	setup.add(
		"tagged",
		"m",
		DeploymentConfig {
			tags: vec![strng::literal!("gpu")],
			..Default::default()
		},
	);
	setup.add(
		"fallback",
		"m",
		DeploymentConfig {
			tags: vec![strng::literal!("default")],
			..Default::default()
		},
	);
	let router = setup.router("tag-based");

	let mut ctx = types::RequestContext::new(strng::literal!("m"), CallType::Chat);
	ctx.tags = vec![strng::literal!("gpu")];
	assert_eq!(
		router.pick_with_context(&ctx).await.unwrap().deployment.id,
		"tagged"
	);

	// No intersection: the "default"-tagged deployment catches the request.
	ctx.tags = vec![strng::literal!("tpu")];
	assert_eq!(
		router.pick_with_context(&ctx).await.unwrap().deployment.id,
		"fallback"
	);
}

#[tokio::test]
async fn tag_based_requires_a_match() {
	let setup = Setup::new();
	setup.add(
		"a",
		"m",
		DeploymentConfig {
			tags: vec![strng::literal!("gpu")],
			..Default::default()
		},
	);
	let router = setup.router("tag-based");
	let mut ctx = types::RequestContext::new(strng::literal!("m"), CallType::Chat);
	ctx.tags = vec![strng::literal!("tpu")];
	assert!(matches!(
		router.pick_with_context(&ctx).await,
		Err(RouteError::NoDeploymentsWithTag(_))
	));
}

#[tokio::test]
async fn non_tag_strategy_ignores_unmatched_tags() {
	let setup = Setup::new();
	setup.add(
		"a",
		"m",
		DeploymentConfig {
			tags: vec![strng::literal!("gpu")],
			..Default::default()
		},
	);
	let router = setup.router("simple-shuffle");
	let mut ctx = types::RequestContext::new(strng::literal!("m"), CallType::Chat);
	ctx.tags = vec![strng::literal!("tpu")];
	// No intersection and no default tag: the healthy set is used as-is.
	assert!(router.pick_with_context(&ctx).await.is_ok());
}

#[tokio::test]
async fn strategy_hot_swap() {
	let setup = Setup::new();
	setup.add("a", "m", DeploymentConfig::default());
	let router = setup.router("simple-shuffle");
	assert_eq!(router.strategy_name(), "simple-shuffle");
	let cfg = RoutingConfig {
		strategy: strng::literal!("least-busy"),
		..Default::default()
	};
	router.set_strategy(strategy_for(&cfg).unwrap());
	assert_eq!(router.strategy_name(), "least-busy");
	assert!(router.pick("m").await.is_ok());
}

#[test]
fn unknown_strategy_rejected() {
	let cfg = RoutingConfig {
		strategy: strng::literal!("wat"),
		..Default::default()
	};
	assert!(matches!(
		strategy_for(&cfg),
		Err(RouteError::UnknownStrategy(_))
	));
}
