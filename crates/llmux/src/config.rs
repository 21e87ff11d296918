use std::net::SocketAddr;

use arc_swap::ArcSwap;
use ipnet::IpNet;

use crate::types::{Deployment, DeploymentConfig};
use crate::*;

/// Top-level gateway configuration, parsed from YAML after environment
/// expansion. Unknown fields are rejected so typos surface at load time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
	#[serde(default = "default_listen")]
	pub listen: SocketAddr,
	#[serde(default)]
	pub routing: RoutingConfig,
	#[serde(default)]
	pub retry: RetryConfig,
	#[serde(default)]
	pub stream: StreamConfig,
	#[serde(default)]
	pub rate_limit: RateLimitConfig,
	#[serde(default)]
	pub governance: GovernanceConfig,
	#[serde(default)]
	pub stats: StatsConfig,
	#[serde(default)]
	pub deployments: Vec<DeploymentSpec>,
}

fn default_listen() -> SocketAddr {
	"0.0.0.0:4000".parse().expect("static address")
}

impl Default for Config {
	fn default() -> Self {
		Config {
			listen: default_listen(),
			routing: Default::default(),
			retry: Default::default(),
			stream: Default::default(),
			rate_limit: Default::default(),
			governance: Default::default(),
			stats: Default::default(),
			deployments: Vec::new(),
		}
	}
}

/// One deployment entry in config: the immutable identity plus the mutable
/// routing parameters, flattened into a single YAML object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSpec {
	#[serde(flatten)]
	pub deployment: Deployment,
	#[serde(flatten)]
	pub config: DeploymentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RoutingConfig {
	#[serde(default = "default_strategy")]
	pub strategy: Strng,
	#[serde(default = "default_cooldown", with = "serdes::serde_dur")]
	pub cooldown_period: Duration,
	#[serde(default = "default_latency_buffer")]
	pub latency_buffer: f64,
	#[serde(default = "default_estimated_tokens")]
	pub default_estimated_tokens: u64,
	/// Whether request tags filter the candidate set.
	#[serde(default = "default_true")]
	pub tag_filtering: bool,
	/// Deployment id to fall back to when routing yields nothing.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub fallback_deployment: Option<Strng>,
}

fn default_strategy() -> Strng {
	strng::literal!("simple-shuffle")
}
fn default_cooldown() -> Duration {
	Duration::from_secs(60)
}
fn default_latency_buffer() -> f64 {
	0.1
}
fn default_estimated_tokens() -> u64 {
	types::DEFAULT_ESTIMATED_TOKENS
}
fn default_true() -> bool {
	true
}

impl Default for RoutingConfig {
	fn default() -> Self {
		RoutingConfig {
			strategy: default_strategy(),
			cooldown_period: default_cooldown(),
			latency_buffer: default_latency_buffer(),
			default_estimated_tokens: default_estimated_tokens(),
			tag_filtering: true,
			fallback_deployment: None,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RetryConfig {
	#[serde(default = "default_retries")]
	pub attempts: u32,
	#[serde(default = "default_backoff", with = "serdes::serde_dur")]
	pub backoff: Duration,
	#[serde(default = "default_max_backoff", with = "serdes::serde_dur")]
	pub max_backoff: Duration,
	/// Fractional jitter applied to each backoff, in [0, 1].
	#[serde(default = "default_jitter")]
	pub jitter: f64,
}

fn default_retries() -> u32 {
	2
}
fn default_backoff() -> Duration {
	Duration::from_millis(500)
}
fn default_max_backoff() -> Duration {
	Duration::from_secs(10)
}
fn default_jitter() -> f64 {
	0.2
}

impl Default for RetryConfig {
	fn default() -> Self {
		RetryConfig {
			attempts: default_retries(),
			backoff: default_backoff(),
			max_backoff: default_max_backoff(),
			jitter: default_jitter(),
		}
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StreamConfig {
	#[serde(default)]
	pub recovery: RecoveryMode,
	/// Bound on buffered output bytes tracked for stream recovery.
	#[serde(default = "default_stream_cap")]
	pub buffer_cap: usize,
}

fn default_stream_cap() -> usize {
	1_048_576
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecoveryMode {
	#[default]
	Off,
	/// Re-enter the routing loop if nothing has been sent to the client yet.
	Retry,
	/// Reserved: continue against a fresh deployment and concatenate output.
	/// Currently behaves as `retry` before the first emitted byte.
	Append,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RateLimitConfig {
	#[serde(default = "default_cleanup_ttl", with = "serdes::serde_dur")]
	pub cleanup_ttl: Duration,
	/// Default per-key rate when the key record carries none. 0 disables.
	#[serde(default)]
	pub default_rpm: u64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub distributed: Option<DistributedRateLimitConfig>,
	/// CIDRs whose forwarded-for headers are trusted for anonymous keying.
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub trusted_proxies: Vec<IpNet>,
}

fn default_cleanup_ttl() -> Duration {
	Duration::from_secs(600)
}

impl Default for RateLimitConfig {
	fn default() -> Self {
		RateLimitConfig {
			cleanup_ttl: default_cleanup_ttl(),
			default_rpm: 0,
			distributed: None,
			trusted_proxies: Vec::new(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DistributedRateLimitConfig {
	pub url: String,
	/// When the backend errors: true allows the request, false denies it.
	/// A backend *denial* is always honored regardless of this flag.
	#[serde(default = "default_true")]
	pub fail_open: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GovernanceConfig {
	#[serde(default)]
	pub async_accounting: bool,
	#[serde(default = "default_idempotency_window", with = "serdes::serde_dur")]
	pub idempotency_window: Duration,
}

fn default_idempotency_window() -> Duration {
	Duration::from_secs(300)
}

impl Default for GovernanceConfig {
	fn default() -> Self {
		GovernanceConfig {
			async_accounting: false,
			idempotency_window: default_idempotency_window(),
		}
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StatsConfig {
	#[serde(default)]
	pub backend: StatsBackend,
	#[serde(default = "default_window")]
	pub window_size: usize,
}

fn default_window() -> usize {
	stats::DEFAULT_WINDOW_SIZE
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StatsBackend {
	#[default]
	Memory,
	Redis {
		url: String,
	},
}

/// Parse config from YAML contents, expanding `${VAR}` references first.
pub fn parse_config(contents: &str) -> anyhow::Result<Config> {
	let expanded = shellexpand::env(contents)?;
	let cfg: Config = serde_yaml::from_str(&expanded)?;
	if cfg.retry.jitter < 0.0 || cfg.retry.jitter > 1.0 {
		anyhow::bail!("retry.jitter must be within [0, 1]");
	}
	for d in &cfg.deployments {
		if d.deployment.id.is_empty() {
			anyhow::bail!("deployment id must not be empty");
		}
	}
	Ok(cfg)
}

/// The live config snapshot. Reload swaps the pointer; in-flight requests
/// keep the snapshot they started with.
pub struct ConfigHandle {
	current: ArcSwap<Config>,
}

impl ConfigHandle {
	pub fn new(cfg: Config) -> Self {
		ConfigHandle {
			current: ArcSwap::from_pointee(cfg),
		}
	}

	pub fn load(&self) -> Arc<Config> {
		self.current.load_full()
	}

	pub fn swap(&self, cfg: Config) -> Arc<Config> {
		self.current.swap(Arc::new(cfg))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const SAMPLE: &str = r#"
listen: "127.0.0.1:4000"
routing:
  strategy: lowest-latency
  cooldownPeriod: 30s
deployments:
  - id: openai-gpt4o
    provider: openai
    model: gpt-4o
    tokenSource:
      env: OPENAI_API_KEY
    weight: 0.9
    tags: [prod]
  - id: azure-gpt4o
    provider: openai
    model: gpt-4o-deploy
    modelAlias: gpt-4o
    baseUrl: https://example.azure.com/v1
    weight: 0.1
"#;

	#[test]
	fn parses_sample() {
		let cfg = parse_config(SAMPLE).unwrap();
		assert_eq!(cfg.routing.strategy, "lowest-latency");
		assert_eq!(cfg.routing.cooldown_period, Duration::from_secs(30));
		assert_eq!(cfg.deployments.len(), 2);
		assert_eq!(cfg.deployments[0].config.weight, 0.9);
		assert_eq!(
			cfg.deployments[1].deployment.logical_model(),
			"gpt-4o"
		);
	}

	#[test]
	fn env_expansion() {
		// Expansion happens before YAML parse, so values can come from the
		// environment without quoting games.
		unsafe { std::env::set_var("LLMUX_TEST_LISTEN", "127.0.0.1:9999") };
		let cfg = parse_config("listen: \"${LLMUX_TEST_LISTEN}\"\n").unwrap();
		assert_eq!(cfg.listen, "127.0.0.1:9999".parse().unwrap());
	}

	#[test]
	fn defaults_are_sane() {
		let cfg = parse_config("{}").unwrap();
		assert_eq!(cfg.routing.strategy, "simple-shuffle");
		assert_eq!(cfg.routing.cooldown_period, Duration::from_secs(60));
		assert_eq!(cfg.routing.latency_buffer, 0.1);
		assert_eq!(cfg.retry.attempts, 2);
		assert!(!cfg.governance.async_accounting);
	}

	#[test]
	fn rejects_unknown_fields() {
		assert!(parse_config("bogus: true\n").is_err());
	}

	#[test]
	fn snapshot_swap_keeps_old_readers() {
		let handle = ConfigHandle::new(Config::default());
		let before = handle.load();
		let mut next = Config::default();
		next.routing.strategy = strng::literal!("lowest-cost");
		handle.swap(next);
		// The old snapshot is untouched; new loads see the swap.
		assert_eq!(before.routing.strategy, "simple-shuffle");
		assert_eq!(handle.load().routing.strategy, "lowest-cost");
	}
}
