use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use super::{
	DeploymentStats, FAILURE_LATENCY_SENTINEL_MS, StatsError, StatsStore, mean, minute_key,
	push_bounded,
};
use crate::errors::ErrorKind;
use crate::types::ResponseMetrics;
use crate::*;

/// In-process stats backend. One struct per deployment behind its own mutex;
/// the outer map lock is held only long enough to find or create the entry,
/// so writers on different deployments never contend.
pub struct MemoryStatsStore {
	window_size: usize,
	inner: RwLock<HashMap<Strng, Arc<Mutex<DeploymentStats>>>>,
}

impl MemoryStatsStore {
	pub fn new(window_size: usize) -> Self {
		MemoryStatsStore {
			window_size,
			inner: RwLock::new(HashMap::new()),
		}
	}

	fn entry(&self, id: &str) -> Arc<Mutex<DeploymentStats>> {
		if let Some(e) = self.inner.read().get(id) {
			return e.clone();
		}
		let mut map = self.inner.write();
		map
			.entry(strng::new(id))
			.or_insert_with(|| Arc::new(Mutex::new(DeploymentStats::new(strng::new(id)))))
			.clone()
	}

	fn roll_minute(stats: &mut DeploymentStats, now: DateTime<Utc>) {
		let key = minute_key(now);
		if stats.minute_key != key {
			stats.minute_key = key;
			stats.minute_tokens = 0;
			stats.minute_requests = 0;
		}
	}
}

impl Default for MemoryStatsStore {
	fn default() -> Self {
		Self::new(super::DEFAULT_WINDOW_SIZE)
	}
}

#[async_trait]
impl StatsStore for MemoryStatsStore {
	async fn get_stats(&self, id: &str) -> Result<DeploymentStats, StatsError> {
		let entry = {
			let map = self.inner.read();
			map.get(id).cloned()
		};
		match entry {
			// Clone is a deep copy: windows and timestamps detach from the store.
			Some(e) => Ok(e.lock().clone()),
			None => Err(StatsError::NotFound(strng::new(id))),
		}
	}

	async fn increment_active(&self, id: &str) -> Result<u64, StatsError> {
		let entry = self.entry(id);
		let mut stats = entry.lock();
		stats.active_requests += 1;
		Ok(stats.active_requests)
	}

	async fn decrement_active(&self, id: &str) -> Result<u64, StatsError> {
		let entry = self.entry(id);
		let mut stats = entry.lock();
		stats.active_requests = stats.active_requests.saturating_sub(1);
		Ok(stats.active_requests)
	}

	async fn record_success(&self, id: &str, metrics: &ResponseMetrics) -> Result<(), StatsError> {
		let entry = self.entry(id);
		let now = Utc::now();
		let mut stats = entry.lock();
		stats.total_requests += 1;
		stats.success_count += 1;
		push_bounded(
			&mut stats.latency_window,
			metrics.latency.as_secs_f64() * 1000.0,
			self.window_size,
		);
		if let Some(ttft) = metrics.ttft {
			if !ttft.is_zero() {
				push_bounded(
					&mut stats.ttft_window,
					ttft.as_secs_f64() * 1000.0,
					self.window_size,
				);
			}
		}
		stats.avg_latency_ms = mean(&stats.latency_window);
		stats.avg_ttft_ms = mean(&stats.ttft_window);
		Self::roll_minute(&mut stats, now);
		stats.minute_tokens += metrics.total_tokens;
		stats.minute_requests += 1;
		stats.last_request = Some(now);
		Ok(())
	}

	async fn record_failure(&self, id: &str, kind: ErrorKind) -> Result<(), StatsError> {
		let entry = self.entry(id);
		let mut stats = entry.lock();
		stats.total_requests += 1;
		stats.failure_count += 1;
		if kind.latency_penalizing() {
			push_bounded(
				&mut stats.latency_window,
				FAILURE_LATENCY_SENTINEL_MS,
				self.window_size,
			);
			stats.avg_latency_ms = mean(&stats.latency_window);
		}
		stats.last_request = Some(Utc::now());
		Ok(())
	}

	async fn set_cooldown(&self, id: &str, until: DateTime<Utc>) -> Result<(), StatsError> {
		let entry = self.entry(id);
		entry.lock().cooldown_until = Some(until);
		Ok(())
	}

	async fn cooldown_until(&self, id: &str) -> Result<Option<DateTime<Utc>>, StatsError> {
		let map = self.inner.read();
		Ok(map.get(id).and_then(|e| e.lock().cooldown_until))
	}

	async fn list_deployments(&self) -> Result<Vec<Strng>, StatsError> {
		Ok(self.inner.read().keys().cloned().collect())
	}

	async fn delete_stats(&self, id: &str) -> Result<(), StatsError> {
		self.inner.write().remove(id);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn metrics(latency_ms: u64, ttft_ms: Option<u64>, tokens: u64) -> ResponseMetrics {
		ResponseMetrics {
			latency: Duration::from_millis(latency_ms),
			ttft: ttft_ms.map(Duration::from_millis),
			input_tokens: tokens / 2,
			output_tokens: tokens - tokens / 2,
			total_tokens: tokens,
			cost: 0.0,
		}
	}

	#[tokio::test]
	async fn active_never_negative() {
		let store = MemoryStatsStore::default();
		assert_eq!(store.decrement_active("d").await.unwrap(), 0);
		store.increment_active("d").await.unwrap();
		store.increment_active("d").await.unwrap();
		store.decrement_active("d").await.unwrap();
		store.decrement_active("d").await.unwrap();
		// Balanced sequence lands back on zero, extra decrements clamp.
		assert_eq!(store.decrement_active("d").await.unwrap(), 0);
		assert_eq!(store.get_stats("d").await.unwrap().active_requests, 0);
	}

	#[tokio::test]
	async fn window_bounded_and_avg_matches() {
		let store = MemoryStatsStore::new(3);
		for ms in [100, 200, 300, 400] {
			store.record_success("d", &metrics(ms, None, 10)).await.unwrap();
		}
		let stats = store.get_stats("d").await.unwrap();
		assert_eq!(stats.latency_window, vec![200.0, 300.0, 400.0]);
		assert_eq!(stats.avg_latency_ms, 300.0);
		assert_eq!(stats.success_count, 4);
		assert_eq!(stats.minute_requests, 4);
		assert_eq!(stats.minute_tokens, 40);
	}

	#[tokio::test]
	async fn ttft_only_recorded_when_present() {
		let store = MemoryStatsStore::default();
		store.record_success("d", &metrics(100, None, 1)).await.unwrap();
		store.record_success("d", &metrics(100, Some(25), 1)).await.unwrap();
		let stats = store.get_stats("d").await.unwrap();
		assert_eq!(stats.ttft_window.len(), 1);
		assert_eq!(stats.avg_ttft_ms, 25.0);
	}

	#[tokio::test]
	async fn timeout_failure_poisons_latency() {
		let store = MemoryStatsStore::default();
		store.record_success("d", &metrics(100, None, 1)).await.unwrap();
		store.record_failure("d", ErrorKind::Timeout).await.unwrap();
		let stats = store.get_stats("d").await.unwrap();
		assert_eq!(stats.failure_count, 1);
		assert!(stats.avg_latency_ms > 100_000.0);
		// Non-timeout failures do not touch the window.
		store.record_failure("d", ErrorKind::RateLimit).await.unwrap();
		assert_eq!(store.get_stats("d").await.unwrap().latency_window.len(), 2);
	}

	#[tokio::test]
	async fn snapshot_is_detached() {
		let store = MemoryStatsStore::default();
		store.record_success("d", &metrics(100, None, 1)).await.unwrap();
		let mut snap = store.get_stats("d").await.unwrap();
		snap.latency_window.clear();
		snap.success_count = 99;
		let fresh = store.get_stats("d").await.unwrap();
		assert_eq!(fresh.latency_window.len(), 1);
		assert_eq!(fresh.success_count, 1);
	}

	#[tokio::test]
	async fn delete_then_get_is_not_found() {
		let store = MemoryStatsStore::default();
		store.record_success("d", &metrics(100, None, 1)).await.unwrap();
		store.delete_stats("d").await.unwrap();
		assert!(matches!(
			store.get_stats("d").await,
			Err(StatsError::NotFound(_))
		));
	}

	#[tokio::test]
	async fn cooldown_round_trip() {
		let store = MemoryStatsStore::default();
		let until = Utc::now() + chrono::Duration::seconds(60);
		store.set_cooldown("d", until).await.unwrap();
		assert_eq!(store.cooldown_until("d").await.unwrap(), Some(until));
		assert_eq!(store.cooldown_until("other").await.unwrap(), None);
	}

	#[tokio::test]
	async fn record_success_commutative_on_counters() {
		// Identical multisets of metrics produce identical counters and minute
		// buckets regardless of arrival order; only window contents differ.
		let a = MemoryStatsStore::new(2);
		let b = MemoryStatsStore::new(2);
		let m1 = metrics(100, Some(10), 5);
		let m2 = metrics(300, Some(30), 7);
		let m3 = metrics(500, Some(50), 9);
		for m in [&m1, &m2, &m3] {
			a.record_success("d", m).await.unwrap();
		}
		for m in [&m3, &m1, &m2] {
			b.record_success("d", m).await.unwrap();
		}
		let sa = a.get_stats("d").await.unwrap();
		let sb = b.get_stats("d").await.unwrap();
		assert_eq!(sa.success_count, sb.success_count);
		assert_eq!(sa.minute_tokens, sb.minute_tokens);
		assert_eq!(sa.minute_requests, sb.minute_requests);
	}
}
