use http::StatusCode;

use super::universal;
use super::{AdapterError, ProviderAdapter, UpstreamRequest, apply_auth, require_token};
use crate::errors::ErrorKind;
use crate::types::Deployment;
use crate::*;

const DEFAULT_REGION: &str = "us-east-1";

/// Bedrock via the Converse API with bearer API keys. Request signing
/// (SigV4) is a credential-resolution concern outside this adapter;
/// streaming uses the AWS binary event-stream framing, which this adapter
/// does not speak.
pub struct Bedrock;

impl Bedrock {
	fn endpoint(deployment: &Deployment, model: &str) -> String {
		match deployment.base_url.as_deref() {
			Some(base) => format!("{}/model/{model}/converse", base.trim_end_matches('/')),
			None => {
				let region = deployment
					.metadata
					.get("region")
					.map(String::as_str)
					.unwrap_or(DEFAULT_REGION);
				format!("https://bedrock-runtime.{region}.amazonaws.com/model/{model}/converse")
			},
		}
	}
}

impl ProviderAdapter for Bedrock {
	fn name(&self) -> Strng {
		strng::literal!("bedrock")
	}

	fn supports(&self, model: &str) -> bool {
		model.starts_with("anthropic.")
			|| model.starts_with("amazon.")
			|| model.starts_with("meta.")
			|| model.starts_with("mistral.")
			|| model.starts_with("us.")
	}

	fn build_request(
		&self,
		deployment: &Deployment,
		req: &universal::ChatRequest,
	) -> Result<UpstreamRequest, AdapterError> {
		if req.stream.unwrap_or(false) {
			return Err(AdapterError::StreamingUnsupported);
		}
		let translated = translate_request(req);
		let body = serde_json::to_vec(&translated).map_err(AdapterError::RequestMarshal)?;
		let model = super::upstream_model(deployment);
		let url = Self::endpoint(deployment, &model);
		let mut upstream = UpstreamRequest::post_json(url, body);
		let token = require_token(deployment)?;
		apply_auth(&mut upstream.headers, deployment, &token)?;
		Ok(upstream)
	}

	fn parse_response(&self, body: &Bytes) -> Result<universal::ChatResponse, AdapterError> {
		let resp = serde_json::from_slice::<types::ConverseResponse>(body)
			.map_err(AdapterError::ResponseParsing)?;
		Ok(translate_response(resp))
	}

	fn parse_stream_chunk(
		&self,
		_data: &Bytes,
	) -> Result<Option<universal::StreamChunk>, AdapterError> {
		Err(AdapterError::StreamingUnsupported)
	}

	fn map_error(&self, status: StatusCode, body: &Bytes) -> (ErrorKind, String) {
		let message = serde_json::from_slice::<types::BedrockError>(body)
			.map(|e| e.message)
			.unwrap_or_else(|_| String::from_utf8_lossy(body).into_owned());
		// Bedrock reports throttling as a 400-class ThrottlingException.
		let kind = if message.contains("ThrottlingException") || message.contains("Too many requests") {
			ErrorKind::RateLimit
		} else {
			ErrorKind::from_status(status)
		};
		(kind, message)
	}
}

fn translate_request(req: &universal::ChatRequest) -> types::ConverseRequest {
	let system = universal::system_text(req);
	let mut messages: Vec<types::Message> = Vec::with_capacity(req.messages.len());
	for msg in &req.messages {
		match msg.role {
			universal::MessageRole::System | universal::MessageRole::Developer => continue,
			universal::MessageRole::User => messages.push(types::Message {
				role: "user".to_string(),
				content: vec![types::ContentBlock::text(
					msg.content.as_ref().map(|c| c.flat_text()).unwrap_or_default(),
				)],
			}),
			universal::MessageRole::Assistant => {
				let mut content = Vec::new();
				if let Some(c) = &msg.content {
					let text = c.flat_text();
					if !text.is_empty() {
						content.push(types::ContentBlock::text(text));
					}
				}
				for tc in msg.tool_calls.iter().flatten() {
					content.push(types::ContentBlock {
						tool_use: Some(types::ToolUse {
							tool_use_id: tc.id.clone().unwrap_or_default(),
							name: tc.function.name.clone().unwrap_or_default(),
							input: tc
								.function
								.arguments
								.as_deref()
								.and_then(|a| serde_json::from_str(a).ok())
								.unwrap_or_default(),
						}),
						..Default::default()
					});
				}
				if !content.is_empty() {
					messages.push(types::Message {
						role: "assistant".to_string(),
						content,
					});
				}
			},
			universal::MessageRole::Tool | universal::MessageRole::Function => {
				messages.push(types::Message {
					role: "user".to_string(),
					content: vec![types::ContentBlock {
						tool_result: Some(types::ToolResult {
							tool_use_id: msg.tool_call_id.clone().unwrap_or_default(),
							content: vec![types::ToolResultContent {
								text: msg.content.as_ref().map(|c| c.flat_text()).unwrap_or_default(),
							}],
						}),
						..Default::default()
					}],
				});
			},
		}
	}

	types::ConverseRequest {
		messages,
		system: if system.is_empty() {
			Vec::new()
		} else {
			vec![types::SystemBlock { text: system }]
		},
		inference_config: types::InferenceConfig {
			max_tokens: universal::max_tokens(req),
			temperature: req.temperature,
			top_p: req.top_p,
			stop_sequences: universal::stop_sequences(req),
		},
	}
}

fn translate_response(resp: types::ConverseResponse) -> universal::ChatResponse {
	let mut content: Option<String> = None;
	let mut tool_calls = Vec::new();
	for block in resp.output.message.content {
		if let Some(text) = block.text {
			content.get_or_insert_with(String::new).push_str(&text);
		}
		if let Some(tool_use) = block.tool_use {
			tool_calls.push(universal::ToolCall {
				index: None,
				id: Some(tool_use.tool_use_id),
				r#type: Some("function".to_string()),
				function: universal::FunctionCall {
					name: Some(tool_use.name),
					arguments: Some(tool_use.input.to_string()),
				},
			});
		}
	}
	let finish_reason = resp.stop_reason.as_deref().map(|r| match r {
		"max_tokens" => universal::FinishReason::Length,
		"tool_use" => universal::FinishReason::ToolCalls,
		"content_filtered" => universal::FinishReason::ContentFilter,
		_ => universal::FinishReason::Stop,
	});
	universal::ChatResponse {
		id: None,
		object: universal::COMPLETION_OBJECT.to_string(),
		created: chrono::Utc::now().timestamp(),
		model: String::new(),
		choices: vec![universal::Choice {
			index: 0,
			message: universal::ResponseMessage {
				role: universal::MessageRole::Assistant,
				content,
				tool_calls: if tool_calls.is_empty() {
					None
				} else {
					Some(tool_calls)
				},
			},
			finish_reason,
		}],
		usage: resp.usage.map(|u| universal::Usage {
			prompt_tokens: u.input_tokens,
			completion_tokens: u.output_tokens,
			total_tokens: u.total_tokens,
		}),
		system_fingerprint: None,
	}
}

pub(super) mod types {
	use serde::{Deserialize, Serialize};
	use serde_json::Value;

	#[derive(Clone, Serialize, Debug)]
	#[serde(rename_all = "camelCase")]
	pub struct ConverseRequest {
		pub messages: Vec<Message>,
		#[serde(skip_serializing_if = "Vec::is_empty")]
		pub system: Vec<SystemBlock>,
		pub inference_config: InferenceConfig,
	}

	#[derive(Clone, Serialize, Deserialize, Debug)]
	pub struct SystemBlock {
		pub text: String,
	}

	#[derive(Clone, Serialize, Deserialize, Debug)]
	pub struct Message {
		pub role: String,
		pub content: Vec<ContentBlock>,
	}

	/// One Converse content block: a single-key map, so every field is
	/// optional and exactly one is set.
	#[derive(Clone, Serialize, Deserialize, Debug, Default)]
	#[serde(rename_all = "camelCase")]
	pub struct ContentBlock {
		#[serde(default, skip_serializing_if = "Option::is_none")]
		pub text: Option<String>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		pub tool_use: Option<ToolUse>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		pub tool_result: Option<ToolResult>,
	}

	impl ContentBlock {
		pub fn text(text: String) -> Self {
			ContentBlock {
				text: Some(text),
				..Default::default()
			}
		}
	}

	#[derive(Clone, Serialize, Deserialize, Debug)]
	#[serde(rename_all = "camelCase")]
	pub struct ToolUse {
		pub tool_use_id: String,
		pub name: String,
		#[serde(default)]
		pub input: Value,
	}

	#[derive(Clone, Serialize, Deserialize, Debug)]
	#[serde(rename_all = "camelCase")]
	pub struct ToolResult {
		pub tool_use_id: String,
		pub content: Vec<ToolResultContent>,
	}

	#[derive(Clone, Serialize, Deserialize, Debug)]
	pub struct ToolResultContent {
		pub text: String,
	}

	#[derive(Clone, Serialize, Debug)]
	#[serde(rename_all = "camelCase")]
	pub struct InferenceConfig {
		#[serde(skip_serializing_if = "Option::is_none")]
		pub max_tokens: Option<u64>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub temperature: Option<f64>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub top_p: Option<f64>,
		#[serde(skip_serializing_if = "Vec::is_empty")]
		pub stop_sequences: Vec<String>,
	}

	#[derive(Clone, Deserialize, Debug)]
	#[serde(rename_all = "camelCase")]
	pub struct ConverseResponse {
		pub output: ConverseOutput,
		#[serde(default)]
		pub stop_reason: Option<String>,
		#[serde(default)]
		pub usage: Option<TokenUsage>,
	}

	#[derive(Clone, Deserialize, Debug)]
	pub struct ConverseOutput {
		pub message: Message,
	}

	#[derive(Clone, Deserialize, Debug)]
	#[serde(rename_all = "camelCase")]
	pub struct TokenUsage {
		#[serde(default)]
		pub input_tokens: u64,
		#[serde(default)]
		pub output_tokens: u64,
		#[serde(default)]
		pub total_tokens: u64,
	}

	#[derive(Deserialize, Debug)]
	pub struct BedrockError {
		pub message: String,
	}
}
