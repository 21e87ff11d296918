pub mod memory;
pub mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::ErrorKind;
use crate::types::ResponseMetrics;
use crate::*;

pub use self::memory::MemoryStatsStore;
pub use self::redis::RedisStatsStore;

pub const DEFAULT_WINDOW_SIZE: usize = 10;

/// Latency recorded for timeout-class failures so latency-based strategies
/// steer away from the deployment.
pub const FAILURE_LATENCY_SENTINEL_MS: f64 = 1_000_000.0;

/// Snapshot of one deployment's statistics. Always a copy: mutating a
/// returned value never affects store state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStats {
	pub deployment_id: Strng,
	pub total_requests: u64,
	pub success_count: u64,
	pub failure_count: u64,
	pub active_requests: u64,
	/// Rolling window of recent request latencies, milliseconds.
	pub latency_window: Vec<f64>,
	/// Rolling window of recent time-to-first-token values, milliseconds.
	pub ttft_window: Vec<f64>,
	pub avg_latency_ms: f64,
	pub avg_ttft_ms: f64,
	/// Tokens consumed in the minute identified by `minute_key`.
	pub minute_tokens: u64,
	/// Requests made in the minute identified by `minute_key`.
	pub minute_requests: u64,
	pub minute_key: Strng,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub last_request: Option<DateTime<Utc>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub cooldown_until: Option<DateTime<Utc>>,
}

impl DeploymentStats {
	pub fn new(deployment_id: Strng) -> Self {
		DeploymentStats {
			deployment_id,
			..Default::default()
		}
	}

	/// Token usage for the current minute; zero if the bucket has rolled.
	pub fn current_tpm(&self, now: DateTime<Utc>) -> u64 {
		if self.minute_key == minute_key(now) {
			self.minute_tokens
		} else {
			0
		}
	}

	pub fn current_rpm(&self, now: DateTime<Utc>) -> u64 {
		if self.minute_key == minute_key(now) {
			self.minute_requests
		} else {
			0
		}
	}

	pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
		self.cooldown_until.is_some_and(|until| until > now)
	}
}

/// Bucket key for per-minute usage counters.
pub fn minute_key(at: DateTime<Utc>) -> Strng {
	strng::new(at.format("%Y-%m-%d-%H-%M").to_string())
}

#[derive(Debug, thiserror::Error)]
pub enum StatsError {
	#[error("no stats for deployment {0}")]
	NotFound(Strng),
	#[error("stats backend error: {0}")]
	Backend(String),
}

/// Uniform statistics interface; the router is oblivious to the backend.
/// Operations are cancel-safe (dropping the future abandons the call) and
/// may fail; callers must treat failures as non-fatal for the request.
#[async_trait]
pub trait StatsStore: Send + Sync {
	/// Snapshot copy of the deployment's stats.
	async fn get_stats(&self, id: &str) -> Result<DeploymentStats, StatsError>;

	async fn increment_active(&self, id: &str) -> Result<u64, StatsError>;

	/// Clamped at zero; a decrement on an idle deployment is a no-op.
	async fn decrement_active(&self, id: &str) -> Result<u64, StatsError>;

	/// Record a completed request: counters, latency/ttft windows, and the
	/// current-minute token and request buckets, atomically.
	async fn record_success(&self, id: &str, metrics: &ResponseMetrics) -> Result<(), StatsError>;

	/// Record a failed request. Timeout-class errors append
	/// [`FAILURE_LATENCY_SENTINEL_MS`] to the latency window.
	async fn record_failure(&self, id: &str, kind: ErrorKind) -> Result<(), StatsError>;

	async fn set_cooldown(&self, id: &str, until: DateTime<Utc>) -> Result<(), StatsError>;

	async fn cooldown_until(&self, id: &str) -> Result<Option<DateTime<Utc>>, StatsError>;

	async fn list_deployments(&self) -> Result<Vec<Strng>, StatsError>;

	/// Remove every key and entry associated with the deployment.
	async fn delete_stats(&self, id: &str) -> Result<(), StatsError>;
}

pub(crate) fn push_bounded(window: &mut Vec<f64>, value: f64, max: usize) {
	if max == 0 {
		return;
	}
	if window.len() >= max {
		window.remove(0);
	}
	window.push(value);
}

pub(crate) fn mean(window: &[f64]) -> f64 {
	if window.is_empty() {
		return 0.0;
	}
	window.iter().sum::<f64>() / window.len() as f64
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn minute_key_format() {
		let at = DateTime::parse_from_rfc3339("2025-03-07T09:05:30Z")
			.unwrap()
			.with_timezone(&Utc);
		assert_eq!(minute_key(at), "2025-03-07-09-05");
	}

	#[test]
	fn bounded_window_rotates() {
		let mut w = Vec::new();
		for i in 0..15 {
			push_bounded(&mut w, i as f64, 10);
		}
		assert_eq!(w.len(), 10);
		assert_eq!(w[0], 5.0);
		assert_eq!(*w.last().unwrap(), 14.0);
	}

	#[test]
	fn mean_of_empty_is_zero() {
		assert_eq!(mean(&[]), 0.0);
		assert_eq!(mean(&[2.0, 4.0]), 3.0);
	}

	#[test]
	fn tpm_resets_on_minute_roll() {
		let mut s = DeploymentStats::new(strng::literal!("d"));
		let t0 = DateTime::parse_from_rfc3339("2025-03-07T09:05:00Z")
			.unwrap()
			.with_timezone(&Utc);
		s.minute_key = minute_key(t0);
		s.minute_tokens = 500;
		assert_eq!(s.current_tpm(t0), 500);
		let t1 = t0 + chrono::Duration::minutes(1);
		assert_eq!(s.current_tpm(t1), 0);
	}
}
