use prometheus_client::encoding::{EncodeLabelSet, text::encode};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;

use crate::*;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
	pub provider: String,
	pub model: String,
	pub status: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TokenLabels {
	pub provider: String,
	pub model: String,
	pub direction: String,
}

/// The process-wide metrics registry: request counts, token throughput, and
/// upstream latency, labeled by provider/model.
pub struct Metrics {
	registry: Registry,
	requests: Family<RequestLabels, Counter>,
	tokens: Family<TokenLabels, Counter>,
	upstream_latency: Family<RequestLabels, Histogram>,
}

impl Metrics {
	pub fn new() -> Self {
		let mut registry = Registry::with_prefix("llmux");
		let requests = Family::<RequestLabels, Counter>::default();
		registry.register(
			"requests",
			"Completed upstream requests",
			requests.clone(),
		);
		let tokens = Family::<TokenLabels, Counter>::default();
		registry.register("tokens", "Tokens processed", tokens.clone());
		let upstream_latency =
			Family::<RequestLabels, Histogram>::new_with_constructor(|| {
				Histogram::new(exponential_buckets(0.025, 2.0, 14))
			});
		registry.register(
			"upstream_latency_seconds",
			"Upstream request latency",
			upstream_latency.clone(),
		);
		Metrics {
			registry,
			requests,
			tokens,
			upstream_latency,
		}
	}

	pub fn record_request(
		&self,
		provider: &str,
		model: &str,
		status: u16,
		latency: Duration,
		input_tokens: u64,
		output_tokens: u64,
	) {
		let labels = RequestLabels {
			provider: provider.to_string(),
			model: model.to_string(),
			status: status.to_string(),
		};
		self.requests.get_or_create(&labels).inc();
		self
			.upstream_latency
			.get_or_create(&labels)
			.observe(latency.as_secs_f64());
		for (direction, count) in [("input", input_tokens), ("output", output_tokens)] {
			if count > 0 {
				self
					.tokens
					.get_or_create(&TokenLabels {
						provider: provider.to_string(),
						model: model.to_string(),
						direction: direction.to_string(),
					})
					.inc_by(count);
			}
		}
	}

	/// Text exposition for the metrics endpoint.
	pub fn encode(&self) -> Result<String, std::fmt::Error> {
		let mut buffer = String::new();
		encode(&mut buffer, &self.registry)?;
		Ok(buffer)
	}
}

impl Default for Metrics {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn records_and_encodes() {
		let metrics = Metrics::new();
		metrics.record_request("openai", "gpt-4o", 200, Duration::from_millis(120), 10, 20);
		metrics.record_request("openai", "gpt-4o", 429, Duration::from_millis(5), 0, 0);
		let out = metrics.encode().unwrap();
		assert!(out.contains("llmux_requests_total"));
		assert!(out.contains("status=\"429\""));
		assert!(out.contains("llmux_tokens_total"));
		assert!(out.contains("direction=\"output\""));
	}
}
