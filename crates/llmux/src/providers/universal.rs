//! The unified wire format: OpenAI chat-completion shapes, which clients
//! speak and every adapter translates to and from. Unknown request fields
//! ride along in `extra` so pass-through providers see them verbatim.

use serde_json::Value;

use crate::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
	System,
	Developer,
	User,
	Assistant,
	Tool,
	Function,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
	pub model: String,
	pub messages: Vec<Message>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub temperature: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub top_p: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub n: Option<u32>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub stream: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub stream_options: Option<StreamOptions>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub stop: Option<Stop>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub max_tokens: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub max_completion_tokens: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub presence_penalty: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub frequency_penalty: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub seed: Option<i64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub user: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tools: Option<Vec<Tool>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tool_choice: Option<Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub response_format: Option<Value>,
	#[serde(flatten)]
	pub extra: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamOptions {
	pub include_usage: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Stop {
	One(String),
	Many(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
	pub role: MessageRole,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub content: Option<Content>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tool_calls: Option<Vec<ToolCall>>,
	/// Set on `tool` role messages: which call this result answers.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tool_call_id: Option<String>,
}

impl Message {
	pub fn text(role: MessageRole, content: impl Into<String>) -> Self {
		Message {
			role,
			content: Some(Content::Text(content.into())),
			name: None,
			tool_calls: None,
			tool_call_id: None,
		}
	}

	pub fn content_text(&self) -> Option<&str> {
		match &self.content {
			Some(Content::Text(t)) => Some(t.as_str()),
			_ => None,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
	Text(String),
	Parts(Vec<ContentPart>),
}

impl Content {
	/// Flatten to plain text, joining text parts and dropping the rest.
	pub fn flat_text(&self) -> String {
		match self {
			Content::Text(t) => t.clone(),
			Content::Parts(parts) => parts
				.iter()
				.filter_map(|p| p.text.as_deref())
				.collect::<Vec<_>>()
				.join(""),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentPart {
	pub r#type: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub text: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub image_url: Option<ImageUrl>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
	pub url: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
	pub r#type: String,
	pub function: FunctionDef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDef {
	pub name: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub description: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub parameters: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub index: Option<u32>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub r#type: Option<String>,
	pub function: FunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub arguments: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
	Stop,
	Length,
	ToolCalls,
	ContentFilter,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
	pub prompt_tokens: u64,
	pub completion_tokens: u64,
	pub total_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub id: Option<String>,
	pub object: String,
	pub created: i64,
	pub model: String,
	pub choices: Vec<Choice>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub usage: Option<Usage>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub system_fingerprint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
	pub index: u32,
	pub message: ResponseMessage,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub finish_reason: Option<FinishReason>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMessage {
	pub role: MessageRole,
	#[serde(default)]
	pub content: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub id: Option<String>,
	pub object: String,
	pub created: i64,
	pub model: String,
	pub choices: Vec<StreamChoice>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub usage: Option<Usage>,
}

pub const CHUNK_OBJECT: &str = "chat.completion.chunk";
pub const COMPLETION_OBJECT: &str = "chat.completion";

impl StreamChunk {
	pub fn new(model: impl Into<String>, choices: Vec<StreamChoice>, usage: Option<Usage>) -> Self {
		StreamChunk {
			id: None,
			object: CHUNK_OBJECT.to_string(),
			created: chrono::Utc::now().timestamp(),
			model: model.into(),
			choices,
			usage,
		}
	}

	pub fn first_content(&self) -> Option<&str> {
		self
			.choices
			.first()
			.and_then(|c| c.delta.content.as_deref())
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChoice {
	pub index: u32,
	pub delta: Delta,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub finish_reason: Option<FinishReason>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Delta {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub role: Option<MessageRole>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub content: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRequest {
	pub model: String,
	pub input: Value,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub encoding_format: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub user: Option<String>,
	#[serde(flatten)]
	pub extra: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingResponse {
	pub object: String,
	pub data: Vec<EmbeddingData>,
	pub model: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingData {
	pub object: String,
	pub index: u32,
	pub embedding: Vec<f32>,
}

/// Legacy `/v1/completions` request, accepted for wire compatibility and
/// translated into the chat shape before routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
	pub model: String,
	pub prompt: Value,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub max_tokens: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub temperature: Option<f64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub top_p: Option<f64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub stream: Option<bool>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub stop: Option<Stop>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub user: Option<String>,
	#[serde(flatten)]
	pub extra: HashMap<String, Value>,
}

pub fn completion_to_chat(req: CompletionRequest) -> ChatRequest {
	let prompt = match &req.prompt {
		Value::String(s) => s.clone(),
		Value::Array(parts) => parts
			.iter()
			.filter_map(|v| v.as_str())
			.collect::<Vec<_>>()
			.join("\n"),
		other => other.to_string(),
	};
	ChatRequest {
		model: req.model,
		messages: vec![Message::text(MessageRole::User, prompt)],
		temperature: req.temperature,
		top_p: req.top_p,
		n: None,
		stream: req.stream,
		stream_options: None,
		stop: req.stop,
		max_tokens: req.max_tokens,
		max_completion_tokens: None,
		presence_penalty: None,
		frequency_penalty: None,
		seed: None,
		user: req.user,
		tools: None,
		tool_choice: None,
		response_format: None,
		extra: HashMap::new(),
	}
}

/// Effective output cap: the newer field wins when both are set.
pub fn max_tokens(req: &ChatRequest) -> Option<u64> {
	req.max_completion_tokens.or(req.max_tokens)
}

pub fn stop_sequences(req: &ChatRequest) -> Vec<String> {
	match &req.stop {
		Some(Stop::One(s)) => vec![s.clone()],
		Some(Stop::Many(s)) => s.clone(),
		None => Vec::new(),
	}
}

/// Providers with a dedicated system slot get every system prompt joined
/// into one block.
pub fn system_text(req: &ChatRequest) -> String {
	req
		.messages
		.iter()
		.filter(|m| matches!(m.role, MessageRole::System | MessageRole::Developer))
		.filter_map(|m| m.content.as_ref())
		.map(|c| c.flat_text())
		.collect::<Vec<_>>()
		.join("\n")
}

/// Model list entry for `GET /v1/models`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
	pub id: String,
	pub object: String,
	pub created: i64,
	pub owned_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelList {
	pub object: String,
	pub data: Vec<ModelInfo>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn unknown_fields_round_trip_through_extra() {
		let raw = r#"{"model":"gpt-4o","messages":[{"role":"user","content":"hi"}],"logprobs":true}"#;
		let req: ChatRequest = serde_json::from_str(raw).unwrap();
		assert!(req.extra.contains_key("logprobs"));
		let out = serde_json::to_string(&req).unwrap();
		assert!(out.contains("logprobs"));
	}

	#[test]
	fn content_parts_flatten() {
		let raw = r#"{"role":"user","content":[{"type":"text","text":"a"},{"type":"image_url","image_url":{"url":"http://x"}},{"type":"text","text":"b"}]}"#;
		let msg: Message = serde_json::from_str(raw).unwrap();
		assert_eq!(msg.content.unwrap().flat_text(), "ab");
	}

	#[test]
	fn system_prompts_joined() {
		let req = ChatRequest {
			model: "m".to_string(),
			messages: vec![
				Message::text(MessageRole::System, "one"),
				Message::text(MessageRole::User, "hi"),
				Message::text(MessageRole::System, "two"),
			],
			temperature: None,
			top_p: None,
			n: None,
			stream: None,
			stream_options: None,
			stop: None,
			max_tokens: None,
			max_completion_tokens: None,
			presence_penalty: None,
			frequency_penalty: None,
			seed: None,
			user: None,
			tools: None,
			tool_choice: None,
			response_format: None,
			extra: HashMap::new(),
		};
		assert_eq!(system_text(&req), "one\ntwo");
	}

	#[test]
	fn legacy_completion_translates() {
		let raw = r#"{"model":"m","prompt":["a","b"],"max_tokens":5}"#;
		let req: CompletionRequest = serde_json::from_str(raw).unwrap();
		let chat = completion_to_chat(req);
		assert_eq!(chat.messages.len(), 1);
		assert_eq!(chat.messages[0].content_text(), Some("a\nb"));
		assert_eq!(max_tokens(&chat), Some(5));
	}

	#[test]
	fn stop_forms() {
		let one: ChatRequest =
			serde_json::from_str(r#"{"model":"m","messages":[],"stop":"end"}"#).unwrap();
		assert_eq!(stop_sequences(&one), vec!["end"]);
		let many: ChatRequest =
			serde_json::from_str(r#"{"model":"m","messages":[],"stop":["a","b"]}"#).unwrap();
		assert_eq!(stop_sequences(&many), vec!["a", "b"]);
	}
}
