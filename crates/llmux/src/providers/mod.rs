pub mod anthropic;
pub mod bedrock;
pub mod cohere;
pub mod gemini;
pub mod openai;
pub mod universal;

use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};

use crate::errors::ErrorKind;
use crate::types::Deployment;
use crate::*;

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
	#[error("unknown provider {0}")]
	UnknownProvider(Strng),
	#[error("missing credential: {0}")]
	Credential(String),
	#[error("failed to parse request: {0}")]
	RequestParsing(serde_json::Error),
	#[error("failed to marshal request: {0}")]
	RequestMarshal(serde_json::Error),
	#[error("failed to parse response: {0}")]
	ResponseParsing(serde_json::Error),
	#[error("invalid upstream target: {0}")]
	Target(String),
	#[error("streaming is not supported for this provider")]
	StreamingUnsupported,
	#[error("embeddings are not supported for this provider")]
	EmbeddingsUnsupported,
}

/// A fully-built upstream HTTP call, ready for the forwarder to execute.
#[derive(Debug)]
pub struct UpstreamRequest {
	pub method: Method,
	pub url: String,
	pub headers: HeaderMap,
	pub body: Bytes,
}

impl UpstreamRequest {
	pub fn post_json(url: String, body: Vec<u8>) -> Self {
		let mut headers = HeaderMap::new();
		headers.insert(
			http::header::CONTENT_TYPE,
			HeaderValue::from_static("application/json"),
		);
		UpstreamRequest {
			method: Method::POST,
			url,
			headers,
			body: Bytes::from(body),
		}
	}
}

/// One wire-format translator. Instances are stateless: every method is a
/// pure function of its inputs, so a single adapter can serve concurrent
/// requests and repeated `parse_stream_chunk` calls are idempotent.
pub trait ProviderAdapter: Send + Sync {
	fn name(&self) -> Strng;

	/// Whether this adapter recognizes the model name (exact match or known
	/// prefix). Advisory; routing is driven by the registry.
	fn supports(&self, model: &str) -> bool;

	/// Serialize the unified request into the provider's body/URL/headers,
	/// embedding the credential resolved from the deployment's token source.
	fn build_request(
		&self,
		deployment: &Deployment,
		req: &universal::ChatRequest,
	) -> Result<UpstreamRequest, AdapterError>;

	/// Deserialize a non-streaming success body into the unified shape.
	fn parse_response(&self, body: &Bytes) -> Result<universal::ChatResponse, AdapterError>;

	/// Translate one SSE data payload. `None` means a keep-alive or
	/// non-content frame; zero-length data always yields `None`.
	fn parse_stream_chunk(&self, data: &Bytes) -> Result<Option<universal::StreamChunk>, AdapterError>;

	/// Classify an upstream failure into the error taxonomy.
	fn map_error(&self, status: StatusCode, body: &Bytes) -> (ErrorKind, String);

	fn build_embedding_request(
		&self,
		_deployment: &Deployment,
		_req: &universal::EmbeddingRequest,
	) -> Result<UpstreamRequest, AdapterError> {
		Err(AdapterError::EmbeddingsUnsupported)
	}

	fn parse_embedding_response(
		&self,
		_body: &Bytes,
	) -> Result<universal::EmbeddingResponse, AdapterError> {
		Err(AdapterError::EmbeddingsUnsupported)
	}
}

/// Resolve the adapter for a provider name.
pub fn adapter_for(provider: &str) -> Result<Arc<dyn ProviderAdapter>, AdapterError> {
	match provider {
		"openai" | "azure" | "openai-compatible" => Ok(Arc::new(openai::OpenAILike)),
		"anthropic" => Ok(Arc::new(anthropic::Anthropic)),
		"gemini" => Ok(Arc::new(gemini::Gemini)),
		"bedrock" => Ok(Arc::new(bedrock::Bedrock)),
		"cohere" => Ok(Arc::new(cohere::Cohere)),
		other => Err(AdapterError::UnknownProvider(strng::new(other))),
	}
}

pub(crate) fn resolve_token(deployment: &Deployment) -> Result<Option<SecretString>, AdapterError> {
	deployment
		.token_source
		.resolve()
		.map_err(|e| AdapterError::Credential(e.to_string()))
}

pub(crate) fn require_token(deployment: &Deployment) -> Result<SecretString, AdapterError> {
	resolve_token(deployment)?.ok_or_else(|| {
		AdapterError::Credential(format!("deployment {} has no credential", deployment.id))
	})
}

/// Bearer auth by default; deployments can override the header name and
/// value prefix through metadata (`auth_header`, `auth_prefix`) for
/// OpenAI-compatible backends with nonstandard auth.
pub(crate) fn apply_auth(
	headers: &mut HeaderMap,
	deployment: &Deployment,
	token: &SecretString,
) -> Result<(), AdapterError> {
	let header_name = deployment
		.metadata
		.get("auth_header")
		.map(String::as_str)
		.unwrap_or("authorization");
	let prefix = deployment
		.metadata
		.get("auth_prefix")
		.map(String::as_str)
		.unwrap_or("Bearer ");
	let name = HeaderName::from_bytes(header_name.as_bytes())
		.map_err(|e| AdapterError::Target(e.to_string()))?;
	let mut value = HeaderValue::from_str(&format!("{prefix}{}", token.expose_secret()))
		.map_err(|e| AdapterError::Target(e.to_string()))?;
	value.set_sensitive(true);
	headers.insert(name, value);
	Ok(())
}

pub(crate) fn base_url(deployment: &Deployment, default: &str) -> String {
	deployment
		.base_url
		.as_deref()
		.unwrap_or(default)
		.trim_end_matches('/')
		.to_string()
}

/// Upstream model name: deployments address providers by their own model id.
pub(crate) fn upstream_model(deployment: &Deployment) -> String {
	deployment.model.to_string()
}

#[cfg(test)]
mod tests;
