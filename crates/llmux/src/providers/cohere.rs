use http::StatusCode;
use serde_json::Value;

use super::universal;
use super::{AdapterError, ProviderAdapter, UpstreamRequest, apply_auth, base_url, require_token};
use crate::errors::ErrorKind;
use crate::types::Deployment;
use crate::*;

pub const DEFAULT_BASE: &str = "https://api.cohere.com";

pub struct Cohere;

impl ProviderAdapter for Cohere {
	fn name(&self) -> Strng {
		strng::literal!("cohere")
	}

	fn supports(&self, model: &str) -> bool {
		model.starts_with("command") || model.starts_with("embed-")
	}

	fn build_request(
		&self,
		deployment: &Deployment,
		req: &universal::ChatRequest,
	) -> Result<UpstreamRequest, AdapterError> {
		let translated = translate_request(deployment, req);
		let body = serde_json::to_vec(&translated).map_err(AdapterError::RequestMarshal)?;
		let url = format!("{}/v2/chat", base_url(deployment, DEFAULT_BASE));
		let mut upstream = UpstreamRequest::post_json(url, body);
		let token = require_token(deployment)?;
		apply_auth(&mut upstream.headers, deployment, &token)?;
		Ok(upstream)
	}

	fn parse_response(&self, body: &Bytes) -> Result<universal::ChatResponse, AdapterError> {
		let resp =
			serde_json::from_slice::<types::ChatResponse>(body).map_err(AdapterError::ResponseParsing)?;
		Ok(translate_response(resp))
	}

	fn parse_stream_chunk(
		&self,
		data: &Bytes,
	) -> Result<Option<universal::StreamChunk>, AdapterError> {
		if data.is_empty() {
			return Ok(None);
		}
		let event =
			serde_json::from_slice::<types::StreamEvent>(data).map_err(AdapterError::ResponseParsing)?;
		Ok(translate_stream_event(event))
	}

	fn map_error(&self, status: StatusCode, body: &Bytes) -> (ErrorKind, String) {
		let message = serde_json::from_slice::<types::CohereError>(body)
			.map(|e| e.message)
			.unwrap_or_else(|_| String::from_utf8_lossy(body).into_owned());
		(ErrorKind::from_status(status), message)
	}

	fn build_embedding_request(
		&self,
		deployment: &Deployment,
		req: &universal::EmbeddingRequest,
	) -> Result<UpstreamRequest, AdapterError> {
		let texts = match &req.input {
			Value::String(s) => vec![s.clone()],
			Value::Array(arr) => arr
				.iter()
				.filter_map(|v| v.as_str().map(str::to_string))
				.collect(),
			other => vec![other.to_string()],
		};
		let body = serde_json::to_vec(&types::EmbedRequest {
			model: super::upstream_model(deployment),
			texts,
			input_type: "search_document".to_string(),
			embedding_types: vec!["float".to_string()],
		})
		.map_err(AdapterError::RequestMarshal)?;
		let url = format!("{}/v2/embed", base_url(deployment, DEFAULT_BASE));
		let mut upstream = UpstreamRequest::post_json(url, body);
		let token = require_token(deployment)?;
		apply_auth(&mut upstream.headers, deployment, &token)?;
		Ok(upstream)
	}

	fn parse_embedding_response(
		&self,
		body: &Bytes,
	) -> Result<universal::EmbeddingResponse, AdapterError> {
		let resp =
			serde_json::from_slice::<types::EmbedResponse>(body).map_err(AdapterError::ResponseParsing)?;
		let data = resp
			.embeddings
			.float
			.into_iter()
			.enumerate()
			.map(|(i, embedding)| universal::EmbeddingData {
				object: "embedding".to_string(),
				index: i as u32,
				embedding,
			})
			.collect();
		let tokens = resp
			.meta
			.and_then(|m| m.billed_units)
			.map(|b| b.input_tokens)
			.unwrap_or_default();
		Ok(universal::EmbeddingResponse {
			object: "list".to_string(),
			data,
			model: String::new(),
			usage: Some(universal::Usage {
				prompt_tokens: tokens,
				completion_tokens: 0,
				total_tokens: tokens,
			}),
		})
	}
}

fn translate_request(deployment: &Deployment, req: &universal::ChatRequest) -> types::ChatRequest {
	let messages = req
		.messages
		.iter()
		.map(|m| types::Message {
			role: match m.role {
				universal::MessageRole::System | universal::MessageRole::Developer => "system",
				universal::MessageRole::Assistant => "assistant",
				universal::MessageRole::Tool | universal::MessageRole::Function => "tool",
				universal::MessageRole::User => "user",
			}
			.to_string(),
			content: m.content.as_ref().map(|c| c.flat_text()).unwrap_or_default(),
		})
		.collect();
	types::ChatRequest {
		model: super::upstream_model(deployment),
		messages,
		max_tokens: universal::max_tokens(req),
		temperature: req.temperature,
		p: req.top_p,
		stop_sequences: universal::stop_sequences(req),
		stream: req.stream.unwrap_or(false),
	}
}

fn finish_reason(reason: &str) -> universal::FinishReason {
	match reason {
		"MAX_TOKENS" => universal::FinishReason::Length,
		"TOOL_CALL" => universal::FinishReason::ToolCalls,
		_ => universal::FinishReason::Stop,
	}
}

fn usage(u: &types::Usage) -> universal::Usage {
	let (input, output) = u
		.tokens
		.as_ref()
		.or(u.billed_units.as_ref())
		.map(|t| (t.input_tokens, t.output_tokens))
		.unwrap_or_default();
	universal::Usage {
		prompt_tokens: input,
		completion_tokens: output,
		total_tokens: input + output,
	}
}

fn translate_response(resp: types::ChatResponse) -> universal::ChatResponse {
	let content = resp
		.message
		.content
		.iter()
		.filter_map(|c| c.text.as_deref())
		.collect::<Vec<_>>()
		.join("");
	universal::ChatResponse {
		id: Some(resp.id),
		object: universal::COMPLETION_OBJECT.to_string(),
		created: chrono::Utc::now().timestamp(),
		model: String::new(),
		choices: vec![universal::Choice {
			index: 0,
			message: universal::ResponseMessage {
				role: universal::MessageRole::Assistant,
				content: if content.is_empty() { None } else { Some(content) },
				tool_calls: None,
			},
			finish_reason: resp.finish_reason.as_deref().map(finish_reason),
		}],
		usage: resp.usage.as_ref().map(usage),
		system_fingerprint: None,
	}
}

fn translate_stream_event(event: types::StreamEvent) -> Option<universal::StreamChunk> {
	match event.r#type.as_str() {
		"message-start" => Some(universal::StreamChunk::new(
			String::new(),
			vec![universal::StreamChoice {
				index: 0,
				delta: universal::Delta {
					role: Some(universal::MessageRole::Assistant),
					content: None,
					tool_calls: None,
				},
				finish_reason: None,
			}],
			None,
		)),
		"content-delta" => {
			let text = event
				.delta
				.as_ref()?
				.message
				.as_ref()?
				.content
				.as_ref()?
				.text
				.clone()?;
			Some(universal::StreamChunk::new(
				String::new(),
				vec![universal::StreamChoice {
					index: 0,
					delta: universal::Delta {
						role: None,
						content: Some(text),
						tool_calls: None,
					},
					finish_reason: None,
				}],
				None,
			))
		},
		"message-end" => {
			let delta = event.delta.as_ref();
			Some(universal::StreamChunk::new(
				String::new(),
				vec![universal::StreamChoice {
					index: 0,
					delta: universal::Delta::default(),
					finish_reason: delta
						.and_then(|d| d.finish_reason.as_deref())
						.map(finish_reason),
				}],
				delta.and_then(|d| d.usage.as_ref()).map(|u| usage(u)),
			))
		},
		// content-start, content-end, tool plumbing, and unknown events carry
		// nothing the unified stream needs.
		_ => None,
	}
}

pub(super) mod types {
	use serde::{Deserialize, Serialize};

	#[derive(Clone, Serialize, Debug)]
	pub struct ChatRequest {
		pub model: String,
		pub messages: Vec<Message>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub max_tokens: Option<u64>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub temperature: Option<f64>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub p: Option<f64>,
		#[serde(skip_serializing_if = "Vec::is_empty")]
		pub stop_sequences: Vec<String>,
		#[serde(skip_serializing_if = "std::ops::Not::not")]
		pub stream: bool,
	}

	#[derive(Clone, Serialize, Deserialize, Debug)]
	pub struct Message {
		pub role: String,
		pub content: String,
	}

	#[derive(Clone, Deserialize, Debug)]
	pub struct ChatResponse {
		pub id: String,
		pub message: ResponseMessage,
		#[serde(default)]
		pub finish_reason: Option<String>,
		#[serde(default)]
		pub usage: Option<Usage>,
	}

	#[derive(Clone, Deserialize, Debug)]
	pub struct ResponseMessage {
		#[serde(default)]
		pub content: Vec<ContentItem>,
	}

	#[derive(Clone, Deserialize, Debug)]
	pub struct ContentItem {
		#[serde(default)]
		pub text: Option<String>,
	}

	#[derive(Clone, Deserialize, Debug)]
	pub struct Usage {
		#[serde(default)]
		pub billed_units: Option<TokenCounts>,
		#[serde(default)]
		pub tokens: Option<TokenCounts>,
	}

	#[derive(Clone, Copy, Deserialize, Debug, Default)]
	pub struct TokenCounts {
		#[serde(default)]
		pub input_tokens: u64,
		#[serde(default)]
		pub output_tokens: u64,
	}

	#[derive(Deserialize, Debug)]
	pub struct CohereError {
		pub message: String,
	}

	#[derive(Clone, Deserialize, Debug)]
	pub struct StreamEvent {
		pub r#type: String,
		#[serde(default)]
		pub delta: Option<StreamDelta>,
	}

	#[derive(Clone, Deserialize, Debug)]
	pub struct StreamDelta {
		#[serde(default)]
		pub message: Option<DeltaMessage>,
		#[serde(default)]
		pub finish_reason: Option<String>,
		#[serde(default)]
		pub usage: Option<Usage>,
	}

	#[derive(Clone, Deserialize, Debug)]
	pub struct DeltaMessage {
		#[serde(default)]
		pub content: Option<DeltaContent>,
	}

	#[derive(Clone, Deserialize, Debug)]
	pub struct DeltaContent {
		#[serde(default)]
		pub text: Option<String>,
	}

	#[derive(Clone, Serialize, Debug)]
	pub struct EmbedRequest {
		pub model: String,
		pub texts: Vec<String>,
		pub input_type: String,
		pub embedding_types: Vec<String>,
	}

	#[derive(Clone, Deserialize, Debug)]
	pub struct EmbedResponse {
		pub embeddings: Embeddings,
		#[serde(default)]
		pub meta: Option<Meta>,
	}

	#[derive(Clone, Deserialize, Debug)]
	pub struct Embeddings {
		#[serde(default)]
		pub float: Vec<Vec<f32>>,
	}

	#[derive(Clone, Deserialize, Debug)]
	pub struct Meta {
		#[serde(default)]
		pub billed_units: Option<BilledUnits>,
	}

	#[derive(Clone, Copy, Deserialize, Debug)]
	pub struct BilledUnits {
		#[serde(default)]
		pub input_tokens: u64,
	}
}
