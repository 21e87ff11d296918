use http::{HeaderValue, StatusCode};
use secrecy::ExposeSecret;
use serde_json::Value;

use super::universal;
use super::{AdapterError, ProviderAdapter, UpstreamRequest, base_url, require_token};
use crate::errors::ErrorKind;
use crate::types::Deployment;
use crate::*;

pub const DEFAULT_BASE: &str = "https://generativelanguage.googleapis.com";

pub struct Gemini;

impl ProviderAdapter for Gemini {
	fn name(&self) -> Strng {
		strng::literal!("gemini")
	}

	fn supports(&self, model: &str) -> bool {
		model.starts_with("gemini-")
	}

	fn build_request(
		&self,
		deployment: &Deployment,
		req: &universal::ChatRequest,
	) -> Result<UpstreamRequest, AdapterError> {
		let translated = translate_request(req);
		let body = serde_json::to_vec(&translated).map_err(AdapterError::RequestMarshal)?;
		let model = super::upstream_model(deployment);
		let method = if req.stream.unwrap_or(false) {
			// SSE framing comes from alt=sse; the default is chunked JSON.
			format!("{model}:streamGenerateContent?alt=sse")
		} else {
			format!("{model}:generateContent")
		};
		let url = format!(
			"{}/v1beta/models/{method}",
			base_url(deployment, DEFAULT_BASE)
		);
		let mut upstream = UpstreamRequest::post_json(url, body);
		let token = require_token(deployment)?;
		let mut key = HeaderValue::from_str(token.expose_secret())
			.map_err(|e| AdapterError::Target(e.to_string()))?;
		key.set_sensitive(true);
		upstream.headers.insert("x-goog-api-key", key);
		Ok(upstream)
	}

	fn parse_response(&self, body: &Bytes) -> Result<universal::ChatResponse, AdapterError> {
		let resp = serde_json::from_slice::<types::GenerateContentResponse>(body)
			.map_err(AdapterError::ResponseParsing)?;
		Ok(translate_response(resp))
	}

	fn parse_stream_chunk(
		&self,
		data: &Bytes,
	) -> Result<Option<universal::StreamChunk>, AdapterError> {
		if data.is_empty() {
			return Ok(None);
		}
		// Streaming chunks reuse the response shape with partial candidates.
		let resp = serde_json::from_slice::<types::GenerateContentResponse>(data)
			.map_err(AdapterError::ResponseParsing)?;
		Ok(Some(translate_stream_chunk(resp)))
	}

	fn map_error(&self, status: StatusCode, body: &Bytes) -> (ErrorKind, String) {
		let message = serde_json::from_slice::<types::ErrorResponse>(body)
			.map(|e| e.error.message)
			.unwrap_or_else(|_| String::from_utf8_lossy(body).into_owned());
		(ErrorKind::from_status(status), message)
	}
}

fn translate_request(req: &universal::ChatRequest) -> types::GenerateContentRequest {
	let system = universal::system_text(req);
	let system_instruction = if system.is_empty() {
		None
	} else {
		Some(types::Content {
			role: None,
			parts: vec![types::Part::text(system)],
		})
	};

	let mut contents: Vec<types::Content> = Vec::with_capacity(req.messages.len());
	for msg in &req.messages {
		match msg.role {
			universal::MessageRole::System | universal::MessageRole::Developer => continue,
			universal::MessageRole::User => contents.push(types::Content {
				role: Some("user".to_string()),
				parts: vec![types::Part::text(
					msg.content.as_ref().map(|c| c.flat_text()).unwrap_or_default(),
				)],
			}),
			universal::MessageRole::Assistant => {
				let mut parts = Vec::new();
				if let Some(c) = &msg.content {
					let text = c.flat_text();
					if !text.is_empty() {
						parts.push(types::Part::text(text));
					}
				}
				for tc in msg.tool_calls.iter().flatten() {
					parts.push(types::Part {
						text: None,
						function_call: Some(types::FunctionCall {
							name: tc.function.name.clone().unwrap_or_default(),
							args: tc
								.function
								.arguments
								.as_deref()
								.and_then(|a| serde_json::from_str(a).ok())
								.unwrap_or(Value::Object(Default::default())),
						}),
						function_response: None,
					});
				}
				if !parts.is_empty() {
					contents.push(types::Content {
						role: Some("model".to_string()),
						parts,
					});
				}
			},
			universal::MessageRole::Tool | universal::MessageRole::Function => {
				// Tool output rides back as a functionResponse part. The name is
				// the best cross-format key available since the unified shape
				// correlates by call id.
				let response = msg
					.content
					.as_ref()
					.map(|c| c.flat_text())
					.unwrap_or_default();
				contents.push(types::Content {
					role: Some("user".to_string()),
					parts: vec![types::Part {
						text: None,
						function_call: None,
						function_response: Some(types::FunctionResponse {
							name: msg.name.clone().or(msg.tool_call_id.clone()).unwrap_or_default(),
							response: serde_json::json!({ "result": response }),
						}),
					}],
				});
			},
		}
	}

	let tools = req.tools.as_ref().map(|tools| {
		vec![types::Tool {
			function_declarations: tools
				.iter()
				.map(|t| types::FunctionDeclaration {
					name: t.function.name.clone(),
					description: t.function.description.clone(),
					parameters: t.function.parameters.clone(),
				})
				.collect(),
		}]
	});

	types::GenerateContentRequest {
		contents,
		system_instruction,
		generation_config: Some(types::GenerationConfig {
			temperature: req.temperature,
			top_p: req.top_p,
			max_output_tokens: universal::max_tokens(req),
			stop_sequences: universal::stop_sequences(req),
			candidate_count: req.n,
		}),
		tools,
	}
}

fn translate_candidate(candidate: &types::Candidate) -> universal::ResponseMessage {
	let mut content: Option<String> = None;
	let mut tool_calls = Vec::new();
	for part in candidate.content.iter().flat_map(|c| c.parts.iter()) {
		if let Some(text) = &part.text {
			content.get_or_insert_with(String::new).push_str(text);
		}
		if let Some(fc) = &part.function_call {
			tool_calls.push(universal::ToolCall {
				index: None,
				id: Some(format!("call-{}", tool_calls.len())),
				r#type: Some("function".to_string()),
				function: universal::FunctionCall {
					name: Some(fc.name.clone()),
					arguments: Some(fc.args.to_string()),
				},
			});
		}
	}
	universal::ResponseMessage {
		role: universal::MessageRole::Assistant,
		content,
		tool_calls: if tool_calls.is_empty() {
			None
		} else {
			Some(tool_calls)
		},
	}
}

fn finish_reason(reason: &str) -> universal::FinishReason {
	match reason {
		"STOP" => universal::FinishReason::Stop,
		"MAX_TOKENS" => universal::FinishReason::Length,
		"SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" => {
			universal::FinishReason::ContentFilter
		},
		_ => universal::FinishReason::Stop,
	}
}

fn usage(meta: &Option<types::UsageMetadata>) -> Option<universal::Usage> {
	meta.as_ref().map(|u| universal::Usage {
		prompt_tokens: u.prompt_token_count,
		completion_tokens: u.candidates_token_count,
		total_tokens: u.total_token_count,
	})
}

fn translate_response(resp: types::GenerateContentResponse) -> universal::ChatResponse {
	let choices = resp
		.candidates
		.iter()
		.enumerate()
		.map(|(i, c)| universal::Choice {
			index: i as u32,
			message: translate_candidate(c),
			finish_reason: c.finish_reason.as_deref().map(finish_reason),
		})
		.collect();
	universal::ChatResponse {
		id: None,
		object: universal::COMPLETION_OBJECT.to_string(),
		created: chrono::Utc::now().timestamp(),
		model: resp.model_version.unwrap_or_default(),
		choices,
		usage: usage(&resp.usage_metadata),
		system_fingerprint: None,
	}
}

fn translate_stream_chunk(resp: types::GenerateContentResponse) -> universal::StreamChunk {
	let choices = resp
		.candidates
		.iter()
		.enumerate()
		.map(|(i, c)| {
			let msg = translate_candidate(c);
			universal::StreamChoice {
				index: i as u32,
				delta: universal::Delta {
					role: None,
					content: msg.content,
					tool_calls: msg.tool_calls,
				},
				finish_reason: c.finish_reason.as_deref().map(finish_reason),
			}
		})
		.collect();
	universal::StreamChunk::new(
		resp.model_version.unwrap_or_default(),
		choices,
		usage(&resp.usage_metadata),
	)
}

pub(super) mod types {
	use serde::{Deserialize, Serialize};
	use serde_json::Value;

	#[derive(Clone, Serialize, Debug)]
	#[serde(rename_all = "camelCase")]
	pub struct GenerateContentRequest {
		pub contents: Vec<Content>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub system_instruction: Option<Content>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub generation_config: Option<GenerationConfig>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub tools: Option<Vec<Tool>>,
	}

	#[derive(Clone, Serialize, Deserialize, Debug)]
	pub struct Content {
		#[serde(skip_serializing_if = "Option::is_none")]
		pub role: Option<String>,
		#[serde(default)]
		pub parts: Vec<Part>,
	}

	#[derive(Clone, Serialize, Deserialize, Debug)]
	#[serde(rename_all = "camelCase")]
	pub struct Part {
		#[serde(default, skip_serializing_if = "Option::is_none")]
		pub text: Option<String>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		pub function_call: Option<FunctionCall>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		pub function_response: Option<FunctionResponse>,
	}

	impl Part {
		pub fn text(text: String) -> Self {
			Part {
				text: Some(text),
				function_call: None,
				function_response: None,
			}
		}
	}

	#[derive(Clone, Serialize, Deserialize, Debug)]
	pub struct FunctionCall {
		pub name: String,
		#[serde(default)]
		pub args: Value,
	}

	#[derive(Clone, Serialize, Deserialize, Debug)]
	pub struct FunctionResponse {
		pub name: String,
		pub response: Value,
	}

	#[derive(Clone, Serialize, Debug)]
	#[serde(rename_all = "camelCase")]
	pub struct GenerationConfig {
		#[serde(skip_serializing_if = "Option::is_none")]
		pub temperature: Option<f64>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub top_p: Option<f64>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub max_output_tokens: Option<u64>,
		#[serde(skip_serializing_if = "Vec::is_empty")]
		pub stop_sequences: Vec<String>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub candidate_count: Option<u32>,
	}

	#[derive(Clone, Serialize, Debug)]
	#[serde(rename_all = "camelCase")]
	pub struct Tool {
		pub function_declarations: Vec<FunctionDeclaration>,
	}

	#[derive(Clone, Serialize, Debug)]
	pub struct FunctionDeclaration {
		pub name: String,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub description: Option<String>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub parameters: Option<Value>,
	}

	#[derive(Clone, Deserialize, Debug)]
	#[serde(rename_all = "camelCase")]
	pub struct GenerateContentResponse {
		#[serde(default)]
		pub candidates: Vec<Candidate>,
		#[serde(default)]
		pub usage_metadata: Option<UsageMetadata>,
		#[serde(default)]
		pub model_version: Option<String>,
	}

	#[derive(Clone, Deserialize, Debug)]
	#[serde(rename_all = "camelCase")]
	pub struct Candidate {
		#[serde(default)]
		pub content: Option<Content>,
		#[serde(default)]
		pub finish_reason: Option<String>,
	}

	#[derive(Clone, Deserialize, Debug)]
	#[serde(rename_all = "camelCase")]
	pub struct UsageMetadata {
		#[serde(default)]
		pub prompt_token_count: u64,
		#[serde(default)]
		pub candidates_token_count: u64,
		#[serde(default)]
		pub total_token_count: u64,
	}

	#[derive(Deserialize, Debug)]
	pub struct ErrorResponse {
		pub error: ErrorDetail,
	}

	#[derive(Deserialize, Debug)]
	pub struct ErrorDetail {
		#[serde(default)]
		pub code: i32,
		pub message: String,
		#[serde(default)]
		pub status: String,
	}
}
