use chrono::{DateTime, Utc};
use secrecy::SecretString;

use crate::serdes::ser_redact;
use crate::*;

/// One (provider, model) target the gateway can route to. Immutable after
/// registration; routing parameters live in [`DeploymentConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
	pub id: Strng,
	pub provider: Strng,
	/// The model name sent upstream.
	pub model: Strng,
	/// The logical name clients address. Falls back to `model` when unset.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub model_alias: Option<Strng>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub base_url: Option<Strng>,
	/// Credential reference; opaque to routing, resolved at request-build time.
	#[serde(default)]
	pub token_source: TokenSource,
	/// Maximum in-flight requests against this deployment. 0 means unlimited.
	#[serde(default)]
	pub max_concurrent: usize,
	#[serde(default = "default_timeout", with = "serdes::serde_dur")]
	pub timeout: Duration,
	#[serde(default)]
	pub priority: i32,
	#[serde(default, skip_serializing_if = "HashMap::is_empty")]
	pub metadata: HashMap<String, String>,
}

fn default_timeout() -> Duration {
	Duration::from_secs(600)
}

impl Deployment {
	/// The name clients use to address this deployment.
	pub fn logical_model(&self) -> Strng {
		self.model_alias.clone().unwrap_or_else(|| self.model.clone())
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TokenSource {
	/// Key material inline in config. Redacted on serialization.
	Inline(#[serde(serialize_with = "ser_redact")] String),
	/// Name of an environment variable holding the key.
	Env(String),
	/// Path to a file holding the key.
	File(std::path::PathBuf),
	#[default]
	None,
}

impl TokenSource {
	pub fn resolve(&self) -> anyhow::Result<Option<SecretString>> {
		let token = match self {
			TokenSource::Inline(s) => Some(s.clone()),
			TokenSource::Env(name) => Some(
				std::env::var(name).map_err(|_| anyhow::anyhow!("environment variable {name} not set"))?,
			),
			TokenSource::File(path) => Some(std::fs::read_to_string(path)?.trim().to_string()),
			TokenSource::None => None,
		};
		Ok(token.map(SecretString::from))
	}
}

/// Mutable routing parameters attached to a deployment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentConfig {
	/// Weight for weighted shuffle. 0 means unweighted.
	#[serde(default)]
	pub weight: f64,
	/// Tokens-per-minute cap. 0 means unlimited.
	#[serde(default)]
	pub tpm_limit: u64,
	/// Requests-per-minute cap. 0 means unlimited.
	#[serde(default)]
	pub rpm_limit: u64,
	#[serde(default)]
	pub input_cost_per_token: f64,
	#[serde(default)]
	pub output_cost_per_token: f64,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub tags: Vec<Strng>,
}

impl DeploymentConfig {
	pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
		input_tokens as f64 * self.input_cost_per_token
			+ output_tokens as f64 * self.output_cost_per_token
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
	Chat,
	Completion,
	Embedding,
}

impl CallType {
	pub fn as_str(&self) -> &'static str {
		match self {
			CallType::Chat => "chat",
			CallType::Completion => "completion",
			CallType::Embedding => "embedding",
		}
	}
}

/// Per-request routing input.
#[derive(Debug, Clone)]
pub struct RequestContext {
	pub request_id: Strng,
	pub model: Strng,
	pub call_type: CallType,
	pub streaming: bool,
	pub tags: Vec<Strng>,
	/// Rough input size used by the TPM filter before real counts exist.
	pub estimated_input_tokens: u64,
	pub metadata: HashMap<String, String>,
}

pub const DEFAULT_ESTIMATED_TOKENS: u64 = 100;

impl RequestContext {
	pub fn new(model: Strng, call_type: CallType) -> Self {
		RequestContext {
			request_id: strng::new(uuid::Uuid::new_v4().to_string()),
			model,
			call_type,
			streaming: false,
			tags: Vec::new(),
			estimated_input_tokens: DEFAULT_ESTIMATED_TOKENS,
			metadata: HashMap::new(),
		}
	}
}

/// What one completed request cost us, in time and tokens.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseMetrics {
	pub latency: Duration,
	/// Time to first token; streaming requests only.
	pub ttft: Option<Duration>,
	pub input_tokens: u64,
	pub output_tokens: u64,
	pub total_tokens: u64,
	pub cost: f64,
}

/// Who is calling. Opaque to routing; consumed by governance.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
	pub api_key_id: Strng,
	pub team_id: Option<Strng>,
	pub user_id: Option<Strng>,
	pub org_id: Option<Strng>,
	pub end_user_id: Option<Strng>,
	pub role: Role,
	/// Per-key request rate; None defers to config defaults.
	pub rpm_limit: Option<u64>,
	pub burst: Option<u64>,
	pub max_budget: Option<f64>,
	/// Legacy per-key model allow-list. None or `*` entry means allow-all.
	pub allowed_models: Option<Vec<Strng>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
	#[default]
	Member,
	Admin,
	Service,
}

/// One record per completed request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageLog {
	pub request_id: Strng,
	pub model: Strng,
	pub provider: Strng,
	pub call_type: CallType,
	pub input_tokens: u64,
	pub output_tokens: u64,
	pub total_tokens: u64,
	pub cost: f64,
	pub start_time: DateTime<Utc>,
	pub end_time: DateTime<Utc>,
	pub latency_ms: u64,
	pub status_code: u16,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub tags: Vec<Strng>,
	pub api_key_id: Strng,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub team_id: Option<Strng>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub user_id: Option<Strng>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub org_id: Option<Strng>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub end_user_id: Option<Strng>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn logical_model_prefers_alias() {
		let mut d = Deployment {
			id: strng::literal!("d1"),
			provider: strng::literal!("openai"),
			model: strng::literal!("gpt-4o-2024-08-06"),
			model_alias: Some(strng::literal!("gpt-4o")),
			base_url: None,
			token_source: TokenSource::None,
			max_concurrent: 0,
			timeout: Duration::from_secs(30),
			priority: 0,
			metadata: HashMap::new(),
		};
		assert_eq!(d.logical_model(), "gpt-4o");
		d.model_alias = None;
		assert_eq!(d.logical_model(), "gpt-4o-2024-08-06");
	}

	#[test]
	fn cost_uses_both_sides() {
		let cfg = DeploymentConfig {
			input_cost_per_token: 0.000_01,
			output_cost_per_token: 0.000_03,
			..Default::default()
		};
		let cost = cfg.cost(1000, 500);
		assert!((cost - 0.025).abs() < 1e-9);
	}

	#[test]
	fn inline_token_redacted() {
		let ts = TokenSource::Inline("sk-secret".to_string());
		let out = serde_json::to_string(&ts).unwrap();
		assert!(!out.contains("sk-secret"));
	}
}
