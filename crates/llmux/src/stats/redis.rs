use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::Script;
use redis::aio::ConnectionManager;

use super::{DeploymentStats, FAILURE_LATENCY_SENTINEL_MS, StatsError, StatsStore, mean, minute_key};
use crate::errors::ErrorKind;
use crate::types::ResponseMetrics;
use crate::*;

/// TTL for per-minute usage buckets. Must exceed one minute so the bucket
/// covering "now" cannot be evicted mid-read.
const USAGE_TTL_SECS: i64 = 120;
/// TTL for latency/ttft windows and counters, refreshed on every write.
const WINDOW_TTL_SECS: i64 = 3600;

const KEY_PREFIX: &str = "llmux:stats";
const INDEX_KEY: &str = "llmux:stats:deployments";

/// Distributed stats backend. Every compound update is a single server-side
/// script, so concurrent writers across gateway instances stay linearizable
/// per deployment without client-side locking.
pub struct RedisStatsStore {
	conn: ConnectionManager,
	window_size: usize,
	record_success: Script,
	record_failure: Script,
	increment_active: Script,
	decrement_active: Script,
}

fn backend(e: redis::RedisError) -> StatsError {
	StatsError::Backend(e.to_string())
}

fn counters_key(id: &str) -> String {
	format!("{KEY_PREFIX}:{id}:counters")
}
fn latency_key(id: &str) -> String {
	format!("{KEY_PREFIX}:{id}:latency")
}
fn ttft_key(id: &str) -> String {
	format!("{KEY_PREFIX}:{id}:ttft")
}
fn usage_key(id: &str, minute: &str) -> String {
	format!("{KEY_PREFIX}:{id}:usage:{minute}")
}
fn cooldown_key(id: &str) -> String {
	format!("{KEY_PREFIX}:{id}:cooldown")
}

const RECORD_SUCCESS_LUA: &str = r#"
redis.call('HINCRBY', KEYS[1], 'total', 1)
redis.call('HINCRBY', KEYS[1], 'success', 1)
redis.call('HSET', KEYS[1], 'last', ARGV[7])
redis.call('RPUSH', KEYS[2], ARGV[1])
redis.call('LTRIM', KEYS[2], -tonumber(ARGV[4]), -1)
if tonumber(ARGV[2]) > 0 then
  redis.call('RPUSH', KEYS[3], ARGV[2])
  redis.call('LTRIM', KEYS[3], -tonumber(ARGV[4]), -1)
end
redis.call('HINCRBY', KEYS[4], 'tokens', ARGV[3])
redis.call('HINCRBY', KEYS[4], 'requests', 1)
redis.call('EXPIRE', KEYS[4], ARGV[6])
redis.call('EXPIRE', KEYS[1], ARGV[5])
redis.call('EXPIRE', KEYS[2], ARGV[5])
redis.call('EXPIRE', KEYS[3], ARGV[5])
redis.call('SADD', KEYS[5], ARGV[8])
return 1
"#;

const RECORD_FAILURE_LUA: &str = r#"
redis.call('HINCRBY', KEYS[1], 'total', 1)
redis.call('HINCRBY', KEYS[1], 'failure', 1)
redis.call('HSET', KEYS[1], 'last', ARGV[3])
if tonumber(ARGV[1]) > 0 then
  redis.call('RPUSH', KEYS[2], ARGV[1])
  redis.call('LTRIM', KEYS[2], -tonumber(ARGV[2]), -1)
  redis.call('EXPIRE', KEYS[2], ARGV[4])
end
redis.call('EXPIRE', KEYS[1], ARGV[4])
redis.call('SADD', KEYS[3], ARGV[5])
return 1
"#;

const INCREMENT_ACTIVE_LUA: &str = r#"
local cur = redis.call('HINCRBY', KEYS[1], 'active', 1)
redis.call('EXPIRE', KEYS[1], ARGV[1])
redis.call('SADD', KEYS[2], ARGV[2])
return cur
"#;

// Reads current value and only decrements when positive, in one round-trip.
const DECREMENT_ACTIVE_LUA: &str = r#"
local cur = tonumber(redis.call('HGET', KEYS[1], 'active') or '0')
if cur > 0 then
  return redis.call('HINCRBY', KEYS[1], 'active', -1)
end
redis.call('HSET', KEYS[1], 'active', 0)
return 0
"#;

impl RedisStatsStore {
	pub async fn connect(url: &str, window_size: usize) -> Result<Self, StatsError> {
		let client = redis::Client::open(url).map_err(backend)?;
		let conn = ConnectionManager::new(client).await.map_err(backend)?;
		Ok(Self::with_connection(conn, window_size))
	}

	pub fn with_connection(conn: ConnectionManager, window_size: usize) -> Self {
		RedisStatsStore {
			conn,
			window_size,
			record_success: Script::new(RECORD_SUCCESS_LUA),
			record_failure: Script::new(RECORD_FAILURE_LUA),
			increment_active: Script::new(INCREMENT_ACTIVE_LUA),
			decrement_active: Script::new(DECREMENT_ACTIVE_LUA),
		}
	}

	fn conn(&self) -> ConnectionManager {
		self.conn.clone()
	}
}

#[async_trait]
impl StatsStore for RedisStatsStore {
	async fn get_stats(&self, id: &str) -> Result<DeploymentStats, StatsError> {
		let mut conn = self.conn();
		let now = Utc::now();
		let minute = minute_key(now);
		let (counters, latency_window, ttft_window, usage, cooldown): (
			HashMap<String, String>,
			Vec<f64>,
			Vec<f64>,
			Vec<Option<u64>>,
			Option<i64>,
		) = redis::pipe()
			.hgetall(counters_key(id))
			.lrange(latency_key(id), 0, -1)
			.lrange(ttft_key(id), 0, -1)
			.cmd("HMGET")
			.arg(usage_key(id, &minute))
			.arg("tokens")
			.arg("requests")
			.get(cooldown_key(id))
			.query_async(&mut conn)
			.await
			.map_err(backend)?;

		if counters.is_empty() && latency_window.is_empty() {
			return Err(StatsError::NotFound(strng::new(id)));
		}

		let get = |field: &str| -> u64 {
			counters
				.get(field)
				.and_then(|v| v.parse().ok())
				.unwrap_or_default()
		};
		let avg_latency_ms = mean(&latency_window);
		let avg_ttft_ms = mean(&ttft_window);
		Ok(DeploymentStats {
			deployment_id: strng::new(id),
			total_requests: get("total"),
			success_count: get("success"),
			failure_count: get("failure"),
			active_requests: get("active"),
			latency_window,
			ttft_window,
			avg_latency_ms,
			avg_ttft_ms,
			minute_tokens: usage.first().copied().flatten().unwrap_or_default(),
			minute_requests: usage.get(1).copied().flatten().unwrap_or_default(),
			minute_key: minute,
			last_request: counters
				.get("last")
				.and_then(|v| v.parse::<i64>().ok())
				.and_then(|ts| DateTime::from_timestamp(ts, 0)),
			cooldown_until: cooldown.and_then(|ts| DateTime::from_timestamp(ts, 0)),
		})
	}

	async fn increment_active(&self, id: &str) -> Result<u64, StatsError> {
		let mut conn = self.conn();
		let n: u64 = self
			.increment_active
			.key(counters_key(id))
			.key(INDEX_KEY)
			.arg(WINDOW_TTL_SECS)
			.arg(id)
			.invoke_async(&mut conn)
			.await
			.map_err(backend)?;
		Ok(n)
	}

	async fn decrement_active(&self, id: &str) -> Result<u64, StatsError> {
		let mut conn = self.conn();
		let n: u64 = self
			.decrement_active
			.key(counters_key(id))
			.invoke_async(&mut conn)
			.await
			.map_err(backend)?;
		Ok(n)
	}

	async fn record_success(&self, id: &str, metrics: &ResponseMetrics) -> Result<(), StatsError> {
		let mut conn = self.conn();
		let now = Utc::now();
		let minute = minute_key(now);
		let latency_ms = metrics.latency.as_secs_f64() * 1000.0;
		let ttft_ms = metrics
			.ttft
			.map(|d| d.as_secs_f64() * 1000.0)
			.unwrap_or(0.0);
		let _: i64 = self
			.record_success
			.key(counters_key(id))
			.key(latency_key(id))
			.key(ttft_key(id))
			.key(usage_key(id, &minute))
			.key(INDEX_KEY)
			.arg(latency_ms)
			.arg(ttft_ms)
			.arg(metrics.total_tokens)
			.arg(self.window_size)
			.arg(WINDOW_TTL_SECS)
			.arg(USAGE_TTL_SECS)
			.arg(now.timestamp())
			.arg(id)
			.invoke_async(&mut conn)
			.await
			.map_err(backend)?;
		Ok(())
	}

	async fn record_failure(&self, id: &str, kind: ErrorKind) -> Result<(), StatsError> {
		let mut conn = self.conn();
		let sentinel = if kind.latency_penalizing() {
			FAILURE_LATENCY_SENTINEL_MS
		} else {
			0.0
		};
		let _: i64 = self
			.record_failure
			.key(counters_key(id))
			.key(latency_key(id))
			.key(INDEX_KEY)
			.arg(sentinel)
			.arg(self.window_size)
			.arg(Utc::now().timestamp())
			.arg(WINDOW_TTL_SECS)
			.arg(id)
			.invoke_async(&mut conn)
			.await
			.map_err(backend)?;
		Ok(())
	}

	async fn set_cooldown(&self, id: &str, until: DateTime<Utc>) -> Result<(), StatsError> {
		let mut conn = self.conn();
		let ttl = (until - Utc::now()).num_seconds().max(1);
		let _: () = redis::cmd("SET")
			.arg(cooldown_key(id))
			.arg(until.timestamp())
			.arg("EX")
			.arg(ttl)
			.query_async(&mut conn)
			.await
			.map_err(backend)?;
		Ok(())
	}

	async fn cooldown_until(&self, id: &str) -> Result<Option<DateTime<Utc>>, StatsError> {
		let mut conn = self.conn();
		let ts: Option<i64> = redis::cmd("GET")
			.arg(cooldown_key(id))
			.query_async(&mut conn)
			.await
			.map_err(backend)?;
		Ok(ts.and_then(|ts| DateTime::from_timestamp(ts, 0)))
	}

	async fn list_deployments(&self) -> Result<Vec<Strng>, StatsError> {
		let mut conn = self.conn();
		let ids: Vec<String> = redis::cmd("SMEMBERS")
			.arg(INDEX_KEY)
			.query_async(&mut conn)
			.await
			.map_err(backend)?;
		Ok(ids.into_iter().map(strng::new).collect())
	}

	async fn delete_stats(&self, id: &str) -> Result<(), StatsError> {
		let mut conn = self.conn();
		let _: () = redis::pipe()
			.del(counters_key(id))
			.ignore()
			.del(latency_key(id))
			.ignore()
			.del(ttft_key(id))
			.ignore()
			.del(cooldown_key(id))
			.ignore()
			.srem(INDEX_KEY, id)
			.ignore()
			.query_async(&mut conn)
			.await
			.map_err(backend)?;

		// Per-minute buckets carry the minute in the key; sweep them by pattern.
		let pattern = format!("{KEY_PREFIX}:{id}:usage:*");
		let mut cursor: u64 = 0;
		loop {
			let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
				.arg(cursor)
				.arg("MATCH")
				.arg(&pattern)
				.arg("COUNT")
				.arg(100)
				.query_async(&mut conn)
				.await
				.map_err(backend)?;
			if !keys.is_empty() {
				let _: () = redis::cmd("DEL")
					.arg(keys)
					.query_async(&mut conn)
					.await
					.map_err(backend)?;
			}
			cursor = next;
			if cursor == 0 {
				break;
			}
		}
		Ok(())
	}
}
