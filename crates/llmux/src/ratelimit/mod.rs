pub mod distributed;

use std::net::IpAddr;

use ipnet::IpNet;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::*;

pub use self::distributed::DistributedRateLimiter;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
	pub allowed: bool,
	pub retry_after: Option<Duration>,
	pub reason: Strng,
}

impl Decision {
	pub fn allow() -> Self {
		Decision {
			allowed: true,
			retry_after: None,
			reason: strng::EMPTY,
		}
	}

	pub fn deny(reason: Strng, retry_after: Option<Duration>) -> Self {
		Decision {
			allowed: false,
			retry_after,
			reason,
		}
	}
}

/// Default burst when none is configured: a sixth of the per-minute rate,
/// at least one.
pub fn burst_for(rpm: u64, explicit: Option<u64>) -> u64 {
	match explicit {
		Some(b) if b > 0 => b,
		_ => (rpm / 6).max(1),
	}
}

struct Bucket {
	tokens: f64,
	rpm: u64,
	burst: u64,
	last_refill: Instant,
	last_used: Instant,
}

impl Bucket {
	fn new(rpm: u64, burst: u64, now: Instant) -> Self {
		Bucket {
			tokens: burst as f64,
			rpm,
			burst,
			last_refill: now,
			last_used: now,
		}
	}

	fn refill(&mut self, now: Instant) {
		let elapsed = now.duration_since(self.last_refill).as_secs_f64();
		self.tokens = (self.tokens + elapsed * self.rpm as f64 / 60.0).min(self.burst as f64);
		self.last_refill = now;
	}

	fn try_take(&mut self, now: Instant) -> Result<(), Duration> {
		self.refill(now);
		self.last_used = now;
		if self.tokens >= 1.0 {
			self.tokens -= 1.0;
			Ok(())
		} else {
			let deficit = 1.0 - self.tokens;
			let secs = deficit * 60.0 / self.rpm.max(1) as f64;
			Err(Duration::from_secs_f64(secs))
		}
	}
}

/// In-process token buckets keyed by tenant. Buckets are created lazily and
/// a background sweeper evicts entries untouched for `cleanup_ttl`.
pub struct LocalRateLimiter {
	buckets: Mutex<HashMap<Strng, Bucket>>,
	cleanup_ttl: Duration,
}

impl LocalRateLimiter {
	pub fn new(cleanup_ttl: Duration) -> Self {
		LocalRateLimiter {
			buckets: Mutex::new(HashMap::new()),
			cleanup_ttl,
		}
	}

	pub fn check(&self, key: &Strng, rpm: u64, burst: u64) -> Decision {
		if rpm == 0 {
			return Decision::allow();
		}
		let now = Instant::now();
		let mut buckets = self.buckets.lock();
		let bucket = buckets
			.entry(key.clone())
			.or_insert_with(|| Bucket::new(rpm, burst, now));
		// Limits can change between requests (key config edits); refresh them.
		bucket.rpm = rpm;
		bucket.burst = burst;
		match bucket.try_take(now) {
			Ok(()) => Decision::allow(),
			Err(retry_after) => Decision::deny(key.clone(), Some(retry_after)),
		}
	}

	pub fn sweep(&self) {
		let now = Instant::now();
		let ttl = self.cleanup_ttl;
		self
			.buckets
			.lock()
			.retain(|_, b| now.duration_since(b.last_used) < ttl);
	}

	pub fn len(&self) -> usize {
		self.buckets.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.buckets.lock().is_empty()
	}

	/// Periodically evict idle buckets until the token is cancelled.
	pub fn spawn_sweeper(self: &Arc<Self>, ct: CancellationToken) {
		let limiter = self.clone();
		let interval = limiter.cleanup_ttl.min(Duration::from_secs(60));
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(interval);
			loop {
				tokio::select! {
					_ = ct.cancelled() => return,
					_ = ticker.tick() => limiter.sweep(),
				}
			}
		});
	}
}

/// The composed limiter the governance engine consults: the in-process
/// limiter always runs; when a distributed backend is configured both must
/// allow.
pub struct RateLimiter {
	local: Arc<LocalRateLimiter>,
	distributed: Option<DistributedRateLimiter>,
}

impl RateLimiter {
	pub fn new(local: Arc<LocalRateLimiter>, distributed: Option<DistributedRateLimiter>) -> Self {
		RateLimiter { local, distributed }
	}

	pub async fn check(&self, key: &Strng, rpm: u64, burst: u64) -> Decision {
		let local = self.local.check(key, rpm, burst);
		if !local.allowed {
			return local;
		}
		match &self.distributed {
			Some(d) => d.check(key, rpm, burst).await,
			None => local,
		}
	}
}

/// Rate-limit key for unauthenticated callers. The first forwarded-for entry
/// is honored only when the immediate peer is inside a trusted proxy range;
/// otherwise the direct peer address keys the bucket.
pub fn anonymous_key(peer: IpAddr, forwarded_for: Option<&str>, trusted: &[IpNet]) -> Strng {
	let peer_trusted = trusted.iter().any(|net| net.contains(&peer));
	if peer_trusted {
		if let Some(client) = forwarded_for
			.and_then(|h| h.split(',').next())
			.map(str::trim)
			.and_then(|s| s.parse::<IpAddr>().ok())
		{
			return strng::format!("anon:{client}");
		}
	}
	strng::format!("anon:{peer}")
}
