use http::StatusCode;

use super::universal;
use super::{AdapterError, ProviderAdapter, UpstreamRequest, apply_auth, base_url, require_token};
use crate::errors::{ErrorKind, ErrorResponse};
use crate::types::Deployment;
use crate::*;

pub const DEFAULT_BASE: &str = "https://api.openai.com/v1";

/// The base adapter: the unified format *is* this provider's wire format, so
/// requests and responses pass through verbatim apart from the upstream
/// model name and credentials. Azure and self-hosted OpenAI-compatible
/// backends ride on the same behavior with a different base URL.
pub struct OpenAILike;

impl ProviderAdapter for OpenAILike {
	fn name(&self) -> Strng {
		strng::literal!("openai")
	}

	fn supports(&self, model: &str) -> bool {
		model.starts_with("gpt-")
			|| model.starts_with("o1")
			|| model.starts_with("o3")
			|| model.starts_with("chatgpt-")
			|| model.starts_with("text-embedding-")
	}

	fn build_request(
		&self,
		deployment: &Deployment,
		req: &universal::ChatRequest,
	) -> Result<UpstreamRequest, AdapterError> {
		let mut req = req.clone();
		req.model = super::upstream_model(deployment);
		let body = serde_json::to_vec(&req).map_err(AdapterError::RequestMarshal)?;
		let url = format!("{}/chat/completions", base_url(deployment, DEFAULT_BASE));
		let mut upstream = UpstreamRequest::post_json(url, body);
		let token = require_token(deployment)?;
		apply_auth(&mut upstream.headers, deployment, &token)?;
		Ok(upstream)
	}

	fn parse_response(&self, body: &Bytes) -> Result<universal::ChatResponse, AdapterError> {
		serde_json::from_slice(body).map_err(AdapterError::ResponseParsing)
	}

	fn parse_stream_chunk(
		&self,
		data: &Bytes,
	) -> Result<Option<universal::StreamChunk>, AdapterError> {
		if data.is_empty() {
			return Ok(None);
		}
		let chunk = serde_json::from_slice(data).map_err(AdapterError::ResponseParsing)?;
		Ok(Some(chunk))
	}

	fn map_error(&self, status: StatusCode, body: &Bytes) -> (ErrorKind, String) {
		map_openai_error(status, body)
	}

	fn build_embedding_request(
		&self,
		deployment: &Deployment,
		req: &universal::EmbeddingRequest,
	) -> Result<UpstreamRequest, AdapterError> {
		let mut req = req.clone();
		req.model = super::upstream_model(deployment);
		let body = serde_json::to_vec(&req).map_err(AdapterError::RequestMarshal)?;
		let url = format!("{}/embeddings", base_url(deployment, DEFAULT_BASE));
		let mut upstream = UpstreamRequest::post_json(url, body);
		let token = require_token(deployment)?;
		apply_auth(&mut upstream.headers, deployment, &token)?;
		Ok(upstream)
	}

	fn parse_embedding_response(
		&self,
		body: &Bytes,
	) -> Result<universal::EmbeddingResponse, AdapterError> {
		serde_json::from_slice(body).map_err(AdapterError::ResponseParsing)
	}
}

/// Shared by every adapter whose upstream emits OpenAI-shaped errors.
pub(super) fn map_openai_error(status: StatusCode, body: &Bytes) -> (ErrorKind, String) {
	let message = serde_json::from_slice::<ErrorResponse>(body)
		.map(|e| e.error.message)
		.unwrap_or_else(|_| String::from_utf8_lossy(body).into_owned());
	(ErrorKind::from_status(status), message)
}
