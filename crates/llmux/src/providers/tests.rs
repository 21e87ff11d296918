use http::StatusCode;

use super::*;
use crate::types::TokenSource;

fn deployment(provider: &str, model: &str) -> Deployment {
	Deployment {
		id: strng::literal!("d1"),
		provider: strng::new(provider),
		model: strng::new(model),
		model_alias: None,
		base_url: None,
		token_source: TokenSource::Inline("test-key".to_string()),
		max_concurrent: 0,
		timeout: Duration::from_secs(30),
		priority: 0,
		metadata: HashMap::new(),
	}
}

fn chat_request(model: &str, stream: bool) -> universal::ChatRequest {
	serde_json::from_value(serde_json::json!({
		"model": model,
		"messages": [
			{"role": "system", "content": "be brief"},
			{"role": "user", "content": "hello"}
		],
		"temperature": 0.5,
		"max_tokens": 128,
		"stream": stream,
	}))
	.unwrap()
}

#[test]
fn factory_resolves_known_providers() {
	for p in ["openai", "anthropic", "gemini", "bedrock", "cohere"] {
		assert_eq!(adapter_for(p).unwrap().name(), if p == "openai" { "openai" } else { p });
	}
	assert!(matches!(
		adapter_for("wat"),
		Err(AdapterError::UnknownProvider(_))
	));
}

#[test]
fn supports_known_prefixes() {
	assert!(adapter_for("openai").unwrap().supports("gpt-4o"));
	assert!(adapter_for("anthropic").unwrap().supports("claude-3-opus"));
	assert!(adapter_for("gemini").unwrap().supports("gemini-2.0-flash"));
	assert!(adapter_for("bedrock").unwrap().supports("anthropic.claude-3"));
	assert!(adapter_for("cohere").unwrap().supports("command-r"));
	assert!(!adapter_for("anthropic").unwrap().supports("gpt-4o"));
}

#[test]
fn openai_passes_request_through_with_auth() {
	let adapter = adapter_for("openai").unwrap();
	let req = chat_request("gpt-4o", false);
	let d = deployment("openai", "gpt-4o-2024-08-06");
	let upstream = adapter.build_request(&d, &req).unwrap();
	assert_eq!(upstream.url, "https://api.openai.com/v1/chat/completions");
	assert_eq!(
		upstream.headers.get("authorization").unwrap(),
		"Bearer test-key"
	);
	let body: serde_json::Value = serde_json::from_slice(&upstream.body).unwrap();
	// The upstream model name replaces the logical one; the rest passes through.
	assert_eq!(body["model"], "gpt-4o-2024-08-06");
	assert_eq!(body["messages"][1]["content"], "hello");
	assert_eq!(body["temperature"], 0.5);
}

#[test]
fn openai_custom_auth_header() {
	let adapter = adapter_for("openai").unwrap();
	let req = chat_request("m", false);
	let mut d = deployment("openai", "m");
	d.base_url = Some(strng::literal!("https://azure.example.com/v1/"));
	d.metadata
		.insert("auth_header".to_string(), "api-key".to_string());
	d.metadata.insert("auth_prefix".to_string(), "".to_string());
	let upstream = adapter.build_request(&d, &req).unwrap();
	assert_eq!(upstream.url, "https://azure.example.com/v1/chat/completions");
	assert_eq!(upstream.headers.get("api-key").unwrap(), "test-key");
	assert!(upstream.headers.get("authorization").is_none());
}

#[test]
fn missing_credential_is_an_error() {
	let adapter = adapter_for("openai").unwrap();
	let req = chat_request("m", false);
	let mut d = deployment("openai", "m");
	d.token_source = TokenSource::None;
	assert!(matches!(
		adapter.build_request(&d, &req),
		Err(AdapterError::Credential(_))
	));
}

#[test]
fn openai_stream_chunk_round_trip() {
	let adapter = adapter_for("openai").unwrap();
	let data = Bytes::from_static(
		br#"{"id":"c1","object":"chat.completion.chunk","created":1,"model":"gpt-4o","choices":[{"index":0,"delta":{"content":"hi"},"finish_reason":null}]}"#,
	);
	let chunk = adapter.parse_stream_chunk(&data).unwrap().unwrap();
	assert_eq!(chunk.first_content(), Some("hi"));
	// Empty frames are keep-alives.
	assert!(adapter.parse_stream_chunk(&Bytes::new()).unwrap().is_none());
}

#[test]
fn anthropic_request_translation() {
	let adapter = adapter_for("anthropic").unwrap();
	let req = chat_request("claude-3-opus", false);
	let d = deployment("anthropic", "claude-3-opus-20240229");
	let upstream = adapter.build_request(&d, &req).unwrap();
	assert_eq!(upstream.url, "https://api.anthropic.com/v1/messages");
	assert_eq!(upstream.headers.get("x-api-key").unwrap(), "test-key");
	assert_eq!(upstream.headers.get("anthropic-version").unwrap(), "2023-06-01");
	assert!(upstream.headers.get("authorization").is_none());
	let body: serde_json::Value = serde_json::from_slice(&upstream.body).unwrap();
	// System prompts leave the message list for the dedicated slot.
	assert_eq!(body["system"], "be brief");
	assert_eq!(body["messages"].as_array().unwrap().len(), 1);
	assert_eq!(body["messages"][0]["content"][0]["text"], "hello");
	assert_eq!(body["max_tokens"], 128);
}

#[test]
fn anthropic_tool_round_trip() {
	let adapter = adapter_for("anthropic").unwrap();
	let req: universal::ChatRequest = serde_json::from_value(serde_json::json!({
		"model": "claude-3",
		"messages": [
			{"role": "user", "content": "weather?"},
			{"role": "assistant", "tool_calls": [
				{"id": "t1", "type": "function", "function": {"name": "get_weather", "arguments": "{\"city\":\"SF\"}"}}
			]},
			{"role": "tool", "tool_call_id": "t1", "content": "sunny"}
		],
		"tools": [{"type": "function", "function": {"name": "get_weather", "parameters": {"type": "object"}}}]
	}))
	.unwrap();
	let d = deployment("anthropic", "claude-3");
	let upstream = adapter.build_request(&d, &req).unwrap();
	let body: serde_json::Value = serde_json::from_slice(&upstream.body).unwrap();
	assert_eq!(body["messages"][1]["content"][0]["type"], "tool_use");
	assert_eq!(body["messages"][1]["content"][0]["input"]["city"], "SF");
	assert_eq!(body["messages"][2]["content"][0]["type"], "tool_result");
	assert_eq!(body["messages"][2]["content"][0]["tool_use_id"], "t1");
	assert_eq!(body["tools"][0]["name"], "get_weather");

	// And back: a tool_use response surfaces as an OpenAI tool call.
	let resp = Bytes::from_static(
		br#"{"id":"m1","type":"message","role":"assistant","model":"claude-3","content":[{"type":"tool_use","id":"t2","name":"get_weather","input":{"city":"NY"}}],"stop_reason":"tool_use","stop_sequence":null,"usage":{"input_tokens":10,"output_tokens":5}}"#,
	);
	let unified = adapter.parse_response(&resp).unwrap();
	let tc = unified.choices[0].message.tool_calls.as_ref().unwrap();
	assert_eq!(tc[0].function.name.as_deref(), Some("get_weather"));
	assert_eq!(
		unified.choices[0].finish_reason,
		Some(universal::FinishReason::ToolCalls)
	);
	assert_eq!(unified.usage.unwrap().total_tokens, 15);
}

#[test]
fn anthropic_stream_events() {
	let adapter = adapter_for("anthropic").unwrap();
	let start = Bytes::from_static(
		br#"{"type":"message_start","message":{"id":"m1","type":"message","role":"assistant","model":"claude-3","content":[],"stop_reason":null,"stop_sequence":null,"usage":{"input_tokens":7,"output_tokens":0}}}"#,
	);
	let chunk = adapter.parse_stream_chunk(&start).unwrap().unwrap();
	assert_eq!(chunk.model, "claude-3");
	assert_eq!(chunk.id.as_deref(), Some("m1"));

	let delta = Bytes::from_static(
		br#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#,
	);
	let chunk = adapter.parse_stream_chunk(&delta).unwrap().unwrap();
	assert_eq!(chunk.first_content(), Some("Hi"));

	let done = Bytes::from_static(
		br#"{"type":"message_delta","delta":{"stop_reason":"end_turn","stop_sequence":null},"usage":{"output_tokens":12}}"#,
	);
	let chunk = adapter.parse_stream_chunk(&done).unwrap().unwrap();
	assert_eq!(
		chunk.choices[0].finish_reason,
		Some(universal::FinishReason::Stop)
	);
	assert_eq!(chunk.usage.unwrap().completion_tokens, 12);

	let ping = Bytes::from_static(br#"{"type":"ping"}"#);
	assert!(adapter.parse_stream_chunk(&ping).unwrap().is_none());
	// Repeated calls with the same frame give the same answer: no state.
	assert!(adapter.parse_stream_chunk(&ping).unwrap().is_none());
}

#[test]
fn anthropic_529_maps_to_service_unavailable() {
	let adapter = adapter_for("anthropic").unwrap();
	let body = Bytes::from_static(
		br#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
	);
	let (kind, message) = adapter.map_error(StatusCode::from_u16(529).unwrap(), &body);
	assert_eq!(kind, crate::errors::ErrorKind::ServiceUnavailable);
	assert_eq!(message, "Overloaded");
}

#[test]
fn gemini_request_translation() {
	let adapter = adapter_for("gemini").unwrap();
	let req = chat_request("gemini-2.0-flash", false);
	let d = deployment("gemini", "gemini-2.0-flash");
	let upstream = adapter.build_request(&d, &req).unwrap();
	assert_eq!(
		upstream.url,
		"https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent"
	);
	assert_eq!(upstream.headers.get("x-goog-api-key").unwrap(), "test-key");
	let body: serde_json::Value = serde_json::from_slice(&upstream.body).unwrap();
	assert_eq!(body["systemInstruction"]["parts"][0]["text"], "be brief");
	assert_eq!(body["contents"][0]["role"], "user");
	assert_eq!(body["generationConfig"]["maxOutputTokens"], 128);
}

#[test]
fn gemini_streaming_url_uses_sse() {
	let adapter = adapter_for("gemini").unwrap();
	let req = chat_request("gemini-2.0-flash", true);
	let d = deployment("gemini", "gemini-2.0-flash");
	let upstream = adapter.build_request(&d, &req).unwrap();
	assert!(upstream.url.ends_with(":streamGenerateContent?alt=sse"));
}

#[test]
fn gemini_response_translation() {
	let adapter = adapter_for("gemini").unwrap();
	let body = Bytes::from_static(
		br#"{"candidates":[{"content":{"role":"model","parts":[{"text":"hello"}]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":4,"candidatesTokenCount":2,"totalTokenCount":6},"modelVersion":"gemini-2.0-flash"}"#,
	);
	let resp = adapter.parse_response(&body).unwrap();
	assert_eq!(resp.choices[0].message.content.as_deref(), Some("hello"));
	assert_eq!(
		resp.choices[0].finish_reason,
		Some(universal::FinishReason::Stop)
	);
	assert_eq!(resp.usage.unwrap().total_tokens, 6);
	assert_eq!(resp.model, "gemini-2.0-flash");
}

#[test]
fn bedrock_request_translation() {
	let adapter = adapter_for("bedrock").unwrap();
	let req = chat_request("anthropic.claude-3", false);
	let mut d = deployment("bedrock", "anthropic.claude-3-sonnet");
	d.metadata
		.insert("region".to_string(), "eu-west-1".to_string());
	let upstream = adapter.build_request(&d, &req).unwrap();
	assert_eq!(
		upstream.url,
		"https://bedrock-runtime.eu-west-1.amazonaws.com/model/anthropic.claude-3-sonnet/converse"
	);
	let body: serde_json::Value = serde_json::from_slice(&upstream.body).unwrap();
	assert_eq!(body["system"][0]["text"], "be brief");
	assert_eq!(body["inferenceConfig"]["maxTokens"], 128);
	assert_eq!(body["messages"][0]["content"][0]["text"], "hello");
}

#[test]
fn bedrock_streaming_unsupported() {
	let adapter = adapter_for("bedrock").unwrap();
	let req = chat_request("anthropic.claude-3", true);
	let d = deployment("bedrock", "anthropic.claude-3");
	assert!(matches!(
		adapter.build_request(&d, &req),
		Err(AdapterError::StreamingUnsupported)
	));
}

#[test]
fn bedrock_response_translation() {
	let adapter = adapter_for("bedrock").unwrap();
	let body = Bytes::from_static(
		br#"{"output":{"message":{"role":"assistant","content":[{"text":"hi"}]}},"stopReason":"max_tokens","usage":{"inputTokens":3,"outputTokens":9,"totalTokens":12}}"#,
	);
	let resp = adapter.parse_response(&body).unwrap();
	assert_eq!(resp.choices[0].message.content.as_deref(), Some("hi"));
	assert_eq!(
		resp.choices[0].finish_reason,
		Some(universal::FinishReason::Length)
	);
	assert_eq!(resp.usage.unwrap().completion_tokens, 9);
}

#[test]
fn bedrock_throttling_maps_to_rate_limit() {
	let adapter = adapter_for("bedrock").unwrap();
	let body = Bytes::from_static(br#"{"message":"ThrottlingException: slow down"}"#);
	let (kind, _) = adapter.map_error(StatusCode::BAD_REQUEST, &body);
	assert_eq!(kind, crate::errors::ErrorKind::RateLimit);
}

#[test]
fn cohere_request_translation() {
	let adapter = adapter_for("cohere").unwrap();
	let req = chat_request("command-r", false);
	let d = deployment("cohere", "command-r-plus");
	let upstream = adapter.build_request(&d, &req).unwrap();
	assert_eq!(upstream.url, "https://api.cohere.com/v2/chat");
	let body: serde_json::Value = serde_json::from_slice(&upstream.body).unwrap();
	assert_eq!(body["model"], "command-r-plus");
	assert_eq!(body["messages"][0]["role"], "system");
	assert_eq!(body["messages"][1]["content"], "hello");
}

#[test]
fn cohere_stream_events() {
	let adapter = adapter_for("cohere").unwrap();
	let delta = Bytes::from_static(
		br#"{"type":"content-delta","index":0,"delta":{"message":{"content":{"text":"Hey"}}}}"#,
	);
	let chunk = adapter.parse_stream_chunk(&delta).unwrap().unwrap();
	assert_eq!(chunk.first_content(), Some("Hey"));

	let end = Bytes::from_static(
		br#"{"type":"message-end","delta":{"finish_reason":"COMPLETE","usage":{"billed_units":{"input_tokens":4,"output_tokens":8}}}}"#,
	);
	let chunk = adapter.parse_stream_chunk(&end).unwrap().unwrap();
	assert_eq!(
		chunk.choices[0].finish_reason,
		Some(universal::FinishReason::Stop)
	);
	assert_eq!(chunk.usage.unwrap().completion_tokens, 8);

	let start = Bytes::from_static(br#"{"type":"content-start","index":0}"#);
	assert!(adapter.parse_stream_chunk(&start).unwrap().is_none());
}

#[test]
fn cohere_embeddings() {
	let adapter = adapter_for("cohere").unwrap();
	let req: universal::EmbeddingRequest = serde_json::from_value(serde_json::json!({
		"model": "embed-english-v3.0",
		"input": ["one", "two"],
	}))
	.unwrap();
	let d = deployment("cohere", "embed-english-v3.0");
	let upstream = adapter.build_embedding_request(&d, &req).unwrap();
	assert_eq!(upstream.url, "https://api.cohere.com/v2/embed");
	let body: serde_json::Value = serde_json::from_slice(&upstream.body).unwrap();
	assert_eq!(body["texts"].as_array().unwrap().len(), 2);

	let resp_body = Bytes::from_static(
		br#"{"id":"e1","embeddings":{"float":[[0.1,0.2],[0.3,0.4]]},"meta":{"billed_units":{"input_tokens":2}}}"#,
	);
	let resp = adapter.parse_embedding_response(&resp_body).unwrap();
	assert_eq!(resp.data.len(), 2);
	assert_eq!(resp.data[1].index, 1);
	assert_eq!(resp.usage.unwrap().prompt_tokens, 2);
}

#[test]
fn openai_embeddings_pass_through() {
	let adapter = adapter_for("openai").unwrap();
	let req: universal::EmbeddingRequest = serde_json::from_value(serde_json::json!({
		"model": "text-embedding-3-small",
		"input": "hello",
	}))
	.unwrap();
	let d = deployment("openai", "text-embedding-3-small");
	let upstream = adapter.build_embedding_request(&d, &req).unwrap();
	assert_eq!(upstream.url, "https://api.openai.com/v1/embeddings");
}

#[test]
fn anthropic_embeddings_unsupported() {
	let adapter = adapter_for("anthropic").unwrap();
	let req: universal::EmbeddingRequest =
		serde_json::from_value(serde_json::json!({"model": "m", "input": "x"})).unwrap();
	let d = deployment("anthropic", "m");
	assert!(matches!(
		adapter.build_embedding_request(&d, &req),
		Err(AdapterError::EmbeddingsUnsupported)
	));
}

#[test]
fn openai_error_mapping() {
	let adapter = adapter_for("openai").unwrap();
	let body = Bytes::from_static(
		br#"{"error":{"message":"Rate limit reached","type":"rate_limit_error"}}"#,
	);
	let (kind, message) = adapter.map_error(StatusCode::TOO_MANY_REQUESTS, &body);
	assert_eq!(kind, crate::errors::ErrorKind::RateLimit);
	assert_eq!(message, "Rate limit reached");

	// Unparseable bodies degrade to the raw text.
	let garbage = Bytes::from_static(b"upstream exploded");
	let (kind, message) = adapter.map_error(StatusCode::BAD_GATEWAY, &garbage);
	assert_eq!(kind, crate::errors::ErrorKind::ServiceUnavailable);
	assert_eq!(message, "upstream exploded");
}
