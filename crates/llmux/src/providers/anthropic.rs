use http::{HeaderValue, StatusCode};
use secrecy::ExposeSecret;
use serde_json::Value;

use super::universal;
use super::{AdapterError, ProviderAdapter, UpstreamRequest, base_url, require_token};
use crate::errors::ErrorKind;
use crate::types::Deployment;
use crate::*;

pub const DEFAULT_BASE: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u64 = 4096;

pub struct Anthropic;

impl ProviderAdapter for Anthropic {
	fn name(&self) -> Strng {
		strng::literal!("anthropic")
	}

	fn supports(&self, model: &str) -> bool {
		model.starts_with("claude-")
	}

	fn build_request(
		&self,
		deployment: &Deployment,
		req: &universal::ChatRequest,
	) -> Result<UpstreamRequest, AdapterError> {
		let translated = translate_request(deployment, req);
		let body = serde_json::to_vec(&translated).map_err(AdapterError::RequestMarshal)?;
		let url = format!("{}/v1/messages", base_url(deployment, DEFAULT_BASE));
		let mut upstream = UpstreamRequest::post_json(url, body);
		// Anthropic wants the key in x-api-key, not a bearer header.
		let token = require_token(deployment)?;
		let mut api_key = HeaderValue::from_str(token.expose_secret())
			.map_err(|e| AdapterError::Target(e.to_string()))?;
		api_key.set_sensitive(true);
		upstream.headers.insert("x-api-key", api_key);
		upstream
			.headers
			.insert("anthropic-version", HeaderValue::from_static(API_VERSION));
		Ok(upstream)
	}

	fn parse_response(&self, body: &Bytes) -> Result<universal::ChatResponse, AdapterError> {
		let resp = serde_json::from_slice::<types::MessagesResponse>(body)
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
		let event = serde_json::from_slice::<types::MessagesStreamEvent>(data)
			.map_err(AdapterError::ResponseParsing)?;
		Ok(translate_stream_event(event))
	}

	fn map_error(&self, status: StatusCode, body: &Bytes) -> (ErrorKind, String) {
		let message = serde_json::from_slice::<types::MessagesErrorResponse>(body)
			.map(|e| e.error.message)
			.unwrap_or_else(|_| String::from_utf8_lossy(body).into_owned());
		// Anthropic signals overload with 529 alongside the standard 429.
		let kind = if status.as_u16() == 529 {
			ErrorKind::ServiceUnavailable
		} else {
			ErrorKind::from_status(status)
		};
		(kind, message)
	}
}

fn translate_request(deployment: &Deployment, req: &universal::ChatRequest) -> types::MessagesRequest {
	let system = universal::system_text(req);
	let mut messages: Vec<types::Message> = Vec::with_capacity(req.messages.len());
	for msg in &req.messages {
		match msg.role {
			universal::MessageRole::System | universal::MessageRole::Developer => continue,
			universal::MessageRole::Tool | universal::MessageRole::Function => {
				// Tool results become user-side tool_result blocks.
				let block = types::ContentBlock::ToolResult {
					tool_use_id: msg.tool_call_id.clone().unwrap_or_default(),
					content: msg
						.content
						.as_ref()
						.map(|c| c.flat_text())
						.unwrap_or_default(),
				};
				// Consecutive tool results share one user message.
				match messages.last_mut() {
					Some(types::Message {
						role: types::Role::User,
						content,
					}) if content
						.iter()
						.all(|b| matches!(b, types::ContentBlock::ToolResult { .. })) =>
					{
						content.push(block);
					},
					_ => messages.push(types::Message {
						role: types::Role::User,
						content: vec![block],
					}),
				}
			},
			universal::MessageRole::Assistant => {
				let mut content = Vec::new();
				if let Some(c) = &msg.content {
					let text = c.flat_text();
					if !text.is_empty() {
						content.push(types::ContentBlock::Text { text });
					}
				}
				for tc in msg.tool_calls.iter().flatten() {
					content.push(types::ContentBlock::ToolUse {
						id: tc.id.clone().unwrap_or_default(),
						name: tc.function.name.clone().unwrap_or_default(),
						input: tc
							.function
							.arguments
							.as_deref()
							.and_then(|a| serde_json::from_str(a).ok())
							.unwrap_or(Value::Object(Default::default())),
					});
				}
				if !content.is_empty() {
					messages.push(types::Message {
						role: types::Role::Assistant,
						content,
					});
				}
			},
			universal::MessageRole::User => {
				let text = msg
					.content
					.as_ref()
					.map(|c| c.flat_text())
					.unwrap_or_default();
				messages.push(types::Message {
					role: types::Role::User,
					content: vec![types::ContentBlock::Text { text }],
				});
			},
		}
	}

	let tools = req.tools.as_ref().map(|tools| {
		tools
			.iter()
			.map(|t| types::ToolDefinition {
				name: t.function.name.clone(),
				description: t.function.description.clone(),
				input_schema: t
					.function
					.parameters
					.clone()
					.unwrap_or(Value::Object(Default::default())),
			})
			.collect()
	});

	types::MessagesRequest {
		model: super::upstream_model(deployment),
		messages,
		system,
		max_tokens: universal::max_tokens(req).unwrap_or(DEFAULT_MAX_TOKENS),
		stop_sequences: universal::stop_sequences(req),
		stream: req.stream.unwrap_or(false),
		temperature: req.temperature,
		top_p: req.top_p,
		tools,
	}
}

fn translate_response(resp: types::MessagesResponse) -> universal::ChatResponse {
	let mut content: Option<String> = None;
	let mut tool_calls: Vec<universal::ToolCall> = Vec::new();
	for block in &resp.content {
		match block {
			types::ContentBlock::Text { text } => {
				content.get_or_insert_with(String::new).push_str(text);
			},
			types::ContentBlock::ToolUse { id, name, input } => {
				tool_calls.push(universal::ToolCall {
					index: None,
					id: Some(id.clone()),
					r#type: Some("function".to_string()),
					function: universal::FunctionCall {
						name: Some(name.clone()),
						arguments: Some(input.to_string()),
					},
				});
			},
			types::ContentBlock::ToolResult { .. } => {},
		}
	}
	let choice = universal::Choice {
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
		finish_reason: resp.stop_reason.map(finish_reason),
	};
	universal::ChatResponse {
		id: Some(resp.id),
		object: universal::COMPLETION_OBJECT.to_string(),
		// No timestamp in the upstream response; stamp it now.
		created: chrono::Utc::now().timestamp(),
		model: resp.model,
		choices: vec![choice],
		usage: Some(universal::Usage {
			prompt_tokens: resp.usage.input_tokens,
			completion_tokens: resp.usage.output_tokens,
			total_tokens: resp.usage.input_tokens + resp.usage.output_tokens,
		}),
		system_fingerprint: None,
	}
}

fn finish_reason(reason: types::StopReason) -> universal::FinishReason {
	match reason {
		types::StopReason::EndTurn => universal::FinishReason::Stop,
		types::StopReason::MaxTokens => universal::FinishReason::Length,
		types::StopReason::StopSequence => universal::FinishReason::Stop,
		types::StopReason::ToolUse => universal::FinishReason::ToolCalls,
	}
}

// Each event translates on its own; suspension points keep no adapter state.
// Chunks carry an empty model when the upstream event has none.
fn translate_stream_event(event: types::MessagesStreamEvent) -> Option<universal::StreamChunk> {
	match event {
		types::MessagesStreamEvent::MessageStart { message } => {
			let mut chunk = universal::StreamChunk::new(
				message.model,
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
			);
			chunk.id = Some(message.id);
			Some(chunk)
		},
		types::MessagesStreamEvent::ContentBlockStart {
			index,
			content_block,
		} => match content_block {
			types::ContentBlock::ToolUse { id, name, .. } => Some(universal::StreamChunk::new(
				String::new(),
				vec![universal::StreamChoice {
					index: 0,
					delta: universal::Delta {
						role: None,
						content: None,
						tool_calls: Some(vec![universal::ToolCall {
							index: Some(index),
							id: Some(id),
							r#type: Some("function".to_string()),
							function: universal::FunctionCall {
								name: Some(name),
								arguments: None,
							},
						}]),
					},
					finish_reason: None,
				}],
				None,
			)),
			_ => None,
		},
		types::MessagesStreamEvent::ContentBlockDelta { index, delta } => match delta {
			types::ContentBlockDelta::TextDelta { text } => Some(universal::StreamChunk::new(
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
			)),
			types::ContentBlockDelta::InputJsonDelta { partial_json } => {
				Some(universal::StreamChunk::new(
					String::new(),
					vec![universal::StreamChoice {
						index: 0,
						delta: universal::Delta {
							role: None,
							content: None,
							tool_calls: Some(vec![universal::ToolCall {
								index: Some(index),
								id: None,
								r#type: None,
								function: universal::FunctionCall {
									name: None,
									arguments: Some(partial_json),
								},
							}]),
						},
						finish_reason: None,
					}],
					None,
				))
			},
		},
		types::MessagesStreamEvent::MessageDelta { delta, usage } => {
			Some(universal::StreamChunk::new(
				String::new(),
				vec![universal::StreamChoice {
					index: 0,
					delta: universal::Delta::default(),
					finish_reason: delta.stop_reason.map(finish_reason),
				}],
				Some(universal::Usage {
					prompt_tokens: 0,
					completion_tokens: usage.output_tokens,
					total_tokens: usage.output_tokens,
				}),
			))
		},
		types::MessagesStreamEvent::ContentBlockStop { .. } => None,
		types::MessagesStreamEvent::MessageStop => None,
		types::MessagesStreamEvent::Ping => None,
	}
}

pub(super) mod types {
	use serde::{Deserialize, Serialize};
	use serde_json::Value;

	#[derive(Copy, Clone, Deserialize, Serialize, Debug, PartialEq, Eq, Default)]
	#[serde(rename_all = "snake_case")]
	pub enum Role {
		#[default]
		User,
		Assistant,
	}

	#[derive(Clone, Deserialize, Serialize, Debug, PartialEq)]
	#[serde(rename_all = "snake_case", tag = "type")]
	pub enum ContentBlock {
		Text {
			text: String,
		},
		ToolUse {
			id: String,
			name: String,
			input: Value,
		},
		ToolResult {
			tool_use_id: String,
			content: String,
		},
	}

	#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
	pub struct Message {
		pub role: Role,
		pub content: Vec<ContentBlock>,
	}

	#[derive(Clone, Serialize, Debug, PartialEq)]
	pub struct ToolDefinition {
		pub name: String,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub description: Option<String>,
		pub input_schema: Value,
	}

	#[derive(Clone, Serialize, Debug, PartialEq)]
	pub struct MessagesRequest {
		pub model: String,
		pub messages: Vec<Message>,
		/// All system prompts, joined into the single system slot.
		#[serde(skip_serializing_if = "String::is_empty")]
		pub system: String,
		pub max_tokens: u64,
		#[serde(skip_serializing_if = "Vec::is_empty")]
		pub stop_sequences: Vec<String>,
		#[serde(skip_serializing_if = "std::ops::Not::not")]
		pub stream: bool,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub temperature: Option<f64>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub top_p: Option<f64>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub tools: Option<Vec<ToolDefinition>>,
	}

	#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
	pub struct MessagesResponse {
		pub id: String,
		pub r#type: String,
		pub role: Role,
		pub content: Vec<ContentBlock>,
		pub model: String,
		pub stop_reason: Option<StopReason>,
		pub stop_sequence: Option<String>,
		pub usage: Usage,
	}

	#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
	#[serde(rename_all = "snake_case", tag = "type")]
	pub enum MessagesStreamEvent {
		MessageStart {
			message: MessagesResponse,
		},
		ContentBlockStart {
			index: u32,
			content_block: ContentBlock,
		},
		ContentBlockDelta {
			index: u32,
			delta: ContentBlockDelta,
		},
		ContentBlockStop {
			index: u32,
		},
		MessageDelta {
			delta: MessageDelta,
			usage: MessageDeltaUsage,
		},
		MessageStop,
		Ping,
	}

	#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
	#[serde(rename_all = "snake_case", tag = "type")]
	pub enum ContentBlockDelta {
		TextDelta { text: String },
		InputJsonDelta { partial_json: String },
	}

	#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
	pub struct MessageDeltaUsage {
		pub output_tokens: u64,
	}

	#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
	pub struct MessageDelta {
		pub stop_reason: Option<StopReason>,
		pub stop_sequence: Option<String>,
	}

	#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
	pub struct MessagesErrorResponse {
		pub r#type: String,
		pub error: MessagesError,
	}

	#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
	pub struct MessagesError {
		pub r#type: String,
		pub message: String,
	}

	#[derive(Copy, Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
	#[serde(rename_all = "snake_case")]
	pub enum StopReason {
		EndTurn,
		MaxTokens,
		StopSequence,
		ToolUse,
	}

	#[derive(Copy, Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
	pub struct Usage {
		#[serde(default)]
		pub input_tokens: u64,
		#[serde(default)]
		pub output_tokens: u64,
	}
}
