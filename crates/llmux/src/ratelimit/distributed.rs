use async_trait::async_trait;
use redis::Script;
use redis::aio::ConnectionManager;

use super::Decision;
use crate::*;

const BUCKET_TTL_SECS: i64 = 600;

// Token bucket shared across gateway instances. One script invocation per
// check: refill from elapsed time, take a token if available, report the
// wait otherwise.
const BUCKET_LUA: &str = r#"
local data = redis.call('HMGET', KEYS[1], 'tokens', 'ts')
local burst = tonumber(ARGV[2])
local rate = tonumber(ARGV[1]) / 60000.0
local now = tonumber(ARGV[3])
local tokens = tonumber(data[1])
local ts = tonumber(data[2])
if tokens == nil then
  tokens = burst
  ts = now
end
local elapsed = now - ts
if elapsed < 0 then elapsed = 0 end
tokens = math.min(burst, tokens + elapsed * rate)
local allowed = 0
if tokens >= 1 then
  tokens = tokens - 1
  allowed = 1
end
redis.call('HSET', KEYS[1], 'tokens', tokens, 'ts', now)
redis.call('EXPIRE', KEYS[1], ARGV[4])
local wait_ms = 0
if allowed == 0 then
  wait_ms = math.ceil((1 - tokens) / rate)
end
return {allowed, wait_ms}
"#;

#[async_trait]
trait Backend: Send + Sync {
	/// Returns (allowed, wait_ms) from the shared bucket.
	async fn take(&self, key: &str, rpm: u64, burst: u64) -> Result<(i64, i64), String>;
}

struct RedisBackend {
	conn: ConnectionManager,
	script: Script,
}

#[async_trait]
impl Backend for RedisBackend {
	async fn take(&self, key: &str, rpm: u64, burst: u64) -> Result<(i64, i64), String> {
		let mut conn = self.conn.clone();
		let now_ms = chrono::Utc::now().timestamp_millis();
		self
			.script
			.key(format!("llmux:ratelimit:{key}"))
			.arg(rpm)
			.arg(burst)
			.arg(now_ms)
			.arg(BUCKET_TTL_SECS)
			.invoke_async(&mut conn)
			.await
			.map_err(|e| e.to_string())
	}
}

/// Distributed rate limiter over a shared Redis bucket. A backend *denial*
/// is always honored; a backend *error* is resolved by the `fail_open` flag.
pub struct DistributedRateLimiter {
	backend: Box<dyn Backend>,
	fail_open: bool,
}

impl DistributedRateLimiter {
	pub async fn connect(url: &str, fail_open: bool) -> anyhow::Result<Self> {
		let client = redis::Client::open(url)?;
		let conn = ConnectionManager::new(client).await?;
		Ok(DistributedRateLimiter {
			backend: Box::new(RedisBackend {
				conn,
				script: Script::new(BUCKET_LUA),
			}),
			fail_open,
		})
	}

	pub async fn check(&self, key: &Strng, rpm: u64, burst: u64) -> Decision {
		if rpm == 0 {
			return Decision::allow();
		}
		match self.backend.take(key, rpm, burst).await {
			Ok((allowed, _)) if allowed == 1 => Decision::allow(),
			Ok((_, wait_ms)) => Decision::deny(
				key.clone(),
				Some(Duration::from_millis(wait_ms.max(0) as u64)),
			),
			Err(e) => {
				if self.fail_open {
					warn!(key = %key, err = %e, "rate limit backend unreachable, failing open");
					Decision::allow()
				} else {
					warn!(key = %key, err = %e, "rate limit backend unreachable, failing closed");
					Decision::deny(key.clone(), None)
				}
			},
		}
	}
}
