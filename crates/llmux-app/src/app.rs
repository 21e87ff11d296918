use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use llmux::config::{Config, StatsBackend};
use llmux::errors::{ErrorKind, ErrorResponse};
use llmux::forward::{ForwardError, ForwardOptions, ForwardResponse, ForwardSummary, Forwarder};
use llmux::governance::{EvalInput, Governance, MemoryTenantStore, PolicyEngine, TenantStore};
use llmux::providers::universal;
use llmux::ratelimit::{
	DistributedRateLimiter, LocalRateLimiter, RateLimiter, anonymous_key,
};
use llmux::registry::{Registry, sync_deployments};
use llmux::routing::{Router as ModelRouter, RouterOptions, strategy_for};
use llmux::stats::{MemoryStatsStore, RedisStatsStore, StatsStore};
use llmux::strng;
use llmux::strng::Strng;
use llmux::telemetry::metrics::Metrics;
use llmux::types::{AuthContext, CallType, RequestContext, UsageLog};
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tracing::warn;

pub struct AppState {
	pub config: Arc<Config>,
	pub registry: Arc<Registry>,
	pub router: Arc<ModelRouter>,
	pub forwarder: Arc<Forwarder>,
	pub governance: Arc<Governance>,
	pub store: Arc<MemoryTenantStore>,
	pub metrics: Arc<Metrics>,
	pub shutdown: CancellationToken,
}

pub async fn build(config: Config) -> anyhow::Result<(Router, Arc<AppState>)> {
	let config = Arc::new(config);
	let shutdown = CancellationToken::new();

	let stats: Arc<dyn StatsStore> = match &config.stats.backend {
		StatsBackend::Memory => Arc::new(MemoryStatsStore::new(config.stats.window_size)),
		StatsBackend::Redis { url } => {
			Arc::new(RedisStatsStore::connect(url, config.stats.window_size).await?)
		},
	};

	let registry = Arc::new(Registry::new());
	sync_deployments(&registry, stats.as_ref(), &config.deployments).await;

	let strategy = strategy_for(&config.routing).map_err(|e| anyhow::anyhow!(e.to_string()))?;
	let router = Arc::new(ModelRouter::new(
		registry.clone(),
		stats.clone(),
		strategy,
		RouterOptions {
			cooldown_period: config.routing.cooldown_period,
			default_estimated_tokens: config.routing.default_estimated_tokens,
			tag_filtering: config.routing.tag_filtering,
		},
	));

	let local_limiter = Arc::new(LocalRateLimiter::new(config.rate_limit.cleanup_ttl));
	local_limiter.spawn_sweeper(shutdown.clone());
	let distributed = match &config.rate_limit.distributed {
		Some(d) => Some(DistributedRateLimiter::connect(&d.url, d.fail_open).await?),
		None => None,
	};
	let limiter = Arc::new(RateLimiter::new(local_limiter, distributed));

	let store = Arc::new(MemoryTenantStore::new());
	let governance = Arc::new(Governance::new(
		store.clone() as Arc<dyn TenantStore>,
		limiter,
		Some(Arc::new(PolicyEngine::new())),
		None,
		config.governance.clone(),
	));

	let metrics = Arc::new(Metrics::new());
	let client = reqwest::Client::builder().build()?;
	let forwarder = Arc::new(Forwarder::new(
		router.clone(),
		registry.clone(),
		client,
		ForwardOptions {
			retry: config.retry.clone(),
			stream: config.stream.clone(),
			fallback_deployment: config.routing.fallback_deployment.clone(),
		},
		Some(metrics.clone()),
	));

	let state = Arc::new(AppState {
		config,
		registry,
		router,
		forwarder,
		governance,
		store,
		metrics,
		shutdown,
	});

	let router = Router::new()
		.route("/v1/chat/completions", post(chat_completions))
		.route("/v1/responses", post(chat_completions))
		.route("/v1/completions", post(completions))
		.route("/v1/embeddings", post(embeddings))
		.route("/embeddings", post(embeddings))
		.route("/v1/models", get(models))
		.route("/v1/audio/{*rest}", post(not_implemented))
		.route("/v1/batches", post(not_implemented))
		.route("/health/live", get(health))
		.route("/health/ready", get(health))
		.route("/metrics", get(metrics_handler))
		.layer(CatchPanicLayer::custom(handle_panic))
		.layer(CorsLayer::permissive())
		.with_state(state.clone());

	Ok((router, state))
}

fn handle_panic(err: Box<dyn std::any::Any + Send + 'static>) -> Response {
	let detail = err
		.downcast_ref::<&str>()
		.map(|s| s.to_string())
		.or_else(|| err.downcast_ref::<String>().cloned())
		.unwrap_or_else(|| "panic".to_string());
	tracing::error!(detail = %detail, "handler panicked");
	error_response(ErrorKind::Internal, "internal server error", None)
}

fn error_response(kind: ErrorKind, message: &str, retry_after: Option<std::time::Duration>) -> Response {
	let body = serde_json::to_vec(&ErrorResponse::new(kind, message)).unwrap_or_default();
	let mut resp = Response::builder()
		.status(kind.status())
		.header(header::CONTENT_TYPE, "application/json");
	if let Some(after) = retry_after {
		resp = resp.header(header::RETRY_AFTER, after.as_secs().max(1));
	}
	resp
		.body(Body::from(body))
		.unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Resolve the caller from the bearer token. Anonymous callers are admitted
/// with an empty key id; governance rate-limits them by client address.
async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<AuthContext, Response> {
	let token = headers
		.get(header::AUTHORIZATION)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.strip_prefix("Bearer "));
	let Some(token) = token else {
		return Ok(AuthContext::default());
	};
	match state.store.get_key(token).await {
		Ok(Some(key)) => Ok(AuthContext {
			api_key_id: key.id.clone(),
			team_id: key.team_id.clone(),
			user_id: key.user_id.clone(),
			org_id: key.org_id.clone(),
			end_user_id: None,
			role: key.role,
			rpm_limit: key.rpm_limit,
			burst: key.burst,
			max_budget: key.max_budget,
			allowed_models: key.allowed_models.clone(),
		}),
		Ok(None) => Err(error_response(
			ErrorKind::Authentication,
			"invalid api key",
			None,
		)),
		Err(e) => {
			warn!(err = %e, "key lookup failed");
			Err(error_response(ErrorKind::Internal, "auth backend failure", None))
		},
	}
}

fn request_id(headers: &HeaderMap) -> Strng {
	headers
		.get("x-request-id")
		.and_then(|v| v.to_str().ok())
		.map(strng::new)
		.unwrap_or_else(|| strng::new(uuid::Uuid::new_v4().to_string()))
}

fn request_tags(headers: &HeaderMap) -> Vec<Strng> {
	headers
		.get("x-llmux-tags")
		.and_then(|v| v.to_str().ok())
		.map(|v| v.split(',').map(str::trim).filter(|t| !t.is_empty()).map(strng::new).collect())
		.unwrap_or_default()
}

/// Rough size of the prompt, for TPM filtering ahead of real token counts.
fn estimate_input_tokens(req: &universal::ChatRequest) -> u64 {
	let chars: usize = req
		.messages
		.iter()
		.filter_map(|m| m.content.as_ref())
		.map(|c| c.flat_text().len())
		.sum();
	((chars / 4) as u64).max(1)
}

/// Worst-case cost across the deployments serving this model, used for the
/// budget pre-check.
fn projected_cost(state: &AppState, model: &str, estimated_tokens: u64) -> f64 {
	state
		.registry
		.list(model)
		.iter()
		.map(|e| e.config.cost(estimated_tokens, estimated_tokens))
		.fold(0.0, f64::max)
}

fn accounting_hook(
	state: &Arc<AppState>,
	auth: &AuthContext,
	ctx: &RequestContext,
) -> llmux::forward::CompletionHook {
	let governance = state.governance.clone();
	let async_accounting = state.config.governance.async_accounting;
	let auth = auth.clone();
	let ctx = ctx.clone();
	let start_time = chrono::Utc::now();
	Box::new(move |summary: ForwardSummary| {
		let end_time = chrono::Utc::now();
		let usage = UsageLog {
			request_id: ctx.request_id.clone(),
			model: ctx.model.clone(),
			provider: summary.provider.clone(),
			call_type: ctx.call_type,
			input_tokens: summary.metrics.input_tokens,
			output_tokens: summary.metrics.output_tokens,
			total_tokens: summary.metrics.total_tokens,
			cost: summary.metrics.cost,
			start_time,
			end_time,
			latency_ms: summary.metrics.latency.as_millis() as u64,
			status_code: summary.status,
			tags: ctx.tags.clone(),
			api_key_id: auth.api_key_id.clone(),
			team_id: auth.team_id.clone(),
			user_id: auth.user_id.clone(),
			org_id: auth.org_id.clone(),
			end_user_id: auth.end_user_id.clone(),
		};
		let fut = async move {
			if let Err(e) = governance.account(&auth, usage).await {
				warn!(err = %e, "accounting failed");
			}
		};
		if async_accounting {
			// Idempotency suppresses duplicates if a retry lands after the
			// detached task is accepted.
			tokio::spawn(fut);
			Box::pin(async {}) as futures::future::BoxFuture<'static, ()>
		} else {
			Box::pin(fut)
		}
	})
}

fn forward_error_response(err: ForwardError, headers: &HeaderMap) -> Response {
	let kind = err.kind();
	let locale = headers
		.get(header::ACCEPT_LANGUAGE)
		.and_then(|v| v.to_str().ok())
		.map(llmux::errors::Locale::from_accept_language)
		.unwrap_or_default();
	let message = llmux::errors::localize(kind, locale)
		.map(str::to_string)
		.unwrap_or_else(|| err.to_string());
	error_response(kind, &message, err.retry_after())
}

async fn evaluate(
	state: &AppState,
	auth: &AuthContext,
	headers: &HeaderMap,
	peer: SocketAddr,
	model: &str,
	estimated_tokens: u64,
	end_user_id: Option<Strng>,
) -> Result<(), Response> {
	let client_key = if auth.api_key_id.is_empty() {
		let forwarded = headers
			.get("x-forwarded-for")
			.and_then(|v| v.to_str().ok());
		Some(anonymous_key(
			peer.ip(),
			forwarded,
			&state.config.rate_limit.trusted_proxies,
		))
	} else {
		None
	};
	let mut auth = auth.clone();
	if auth.api_key_id.is_empty() && auth.rpm_limit.is_none() && state.config.rate_limit.default_rpm > 0 {
		auth.rpm_limit = Some(state.config.rate_limit.default_rpm);
	}
	let input = EvalInput {
		model: strng::new(model),
		projected_cost: projected_cost(state, model, estimated_tokens),
		end_user_id,
		client_key,
	};
	state
		.governance
		.evaluate(&auth, &input)
		.await
		.map_err(|e| {
			let kind = e.kind();
			let retry_after = match &e {
				llmux::governance::GovernanceError::RateLimit { retry_after, .. } => *retry_after,
				_ => None,
			};
			error_response(kind, &e.to_string(), retry_after)
		})
}

async fn chat_completions(
	State(state): State<Arc<AppState>>,
	ConnectInfo(peer): ConnectInfo<SocketAddr>,
	headers: HeaderMap,
	body: axum::body::Bytes,
) -> Response {
	let auth = match authenticate(&state, &headers).await {
		Ok(a) => a,
		Err(resp) => return resp,
	};
	let req: universal::ChatRequest = match serde_json::from_slice(&body) {
		Ok(r) => r,
		Err(e) => {
			return error_response(ErrorKind::InvalidRequest, &format!("invalid request body: {e}"), None);
		},
	};

	let rid = request_id(&headers);
	let mut ctx = RequestContext::new(strng::new(&req.model), CallType::Chat);
	ctx.request_id = rid.clone();
	ctx.streaming = req.stream.unwrap_or(false);
	ctx.tags = request_tags(&headers);
	ctx.estimated_input_tokens = estimate_input_tokens(&req);

	let end_user = req.user.as_deref().map(strng::new);
	if let Err(resp) = evaluate(
		&state,
		&auth,
		&headers,
		peer,
		&req.model,
		ctx.estimated_input_tokens,
		end_user,
	)
	.await
	{
		return with_request_id(resp, &rid);
	}

	let hook = accounting_hook(&state, &auth, &ctx);
	let result = state
		.forwarder
		.forward_chat(&state.shutdown, &ctx, &req, hook)
		.await;
	let resp = match result {
		Ok(ForwardResponse::Full(resp)) => json_response(&resp),
		Ok(ForwardResponse::Stream(stream)) => {
			let mut resp = Response::builder()
				.status(StatusCode::OK)
				.header(header::CONTENT_TYPE, "text/event-stream")
				.header(header::CACHE_CONTROL, "no-cache")
				.body(Body::from_stream(stream))
				.unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
			resp
				.headers_mut()
				.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
			resp
		},
		Err(e) => forward_error_response(e, &headers),
	};
	with_request_id(resp, &rid)
}

async fn completions(
	State(state): State<Arc<AppState>>,
	ConnectInfo(peer): ConnectInfo<SocketAddr>,
	headers: HeaderMap,
	body: axum::body::Bytes,
) -> Response {
	let auth = match authenticate(&state, &headers).await {
		Ok(a) => a,
		Err(resp) => return resp,
	};
	let legacy: universal::CompletionRequest = match serde_json::from_slice(&body) {
		Ok(r) => r,
		Err(e) => {
			return error_response(ErrorKind::InvalidRequest, &format!("invalid request body: {e}"), None);
		},
	};
	let req = universal::completion_to_chat(legacy);

	let rid = request_id(&headers);
	let mut ctx = RequestContext::new(strng::new(&req.model), CallType::Completion);
	ctx.request_id = rid.clone();
	ctx.streaming = req.stream.unwrap_or(false);
	ctx.tags = request_tags(&headers);
	ctx.estimated_input_tokens = estimate_input_tokens(&req);

	let end_user = req.user.as_deref().map(strng::new);
	if let Err(resp) = evaluate(
		&state,
		&auth,
		&headers,
		peer,
		&req.model,
		ctx.estimated_input_tokens,
		end_user,
	)
	.await
	{
		return with_request_id(resp, &rid);
	}

	let hook = accounting_hook(&state, &auth, &ctx);
	let result = state
		.forwarder
		.forward_chat(&state.shutdown, &ctx, &req, hook)
		.await;
	let resp = match result {
		Ok(ForwardResponse::Full(resp)) => json_response(&chat_to_completion(resp)),
		Ok(ForwardResponse::Stream(stream)) => Response::builder()
			.status(StatusCode::OK)
			.header(header::CONTENT_TYPE, "text/event-stream")
			.body(Body::from_stream(stream))
			.unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
		Err(e) => forward_error_response(e, &headers),
	};
	with_request_id(resp, &rid)
}

/// Legacy completion wire shape, produced from the chat response.
fn chat_to_completion(resp: universal::ChatResponse) -> serde_json::Value {
	serde_json::json!({
		"id": resp.id,
		"object": "text_completion",
		"created": resp.created,
		"model": resp.model,
		"choices": resp.choices.iter().map(|c| serde_json::json!({
			"index": c.index,
			"text": c.message.content.clone().unwrap_or_default(),
			"finish_reason": c.finish_reason,
			"logprobs": serde_json::Value::Null,
		})).collect::<Vec<_>>(),
		"usage": resp.usage,
	})
}

async fn embeddings(
	State(state): State<Arc<AppState>>,
	ConnectInfo(peer): ConnectInfo<SocketAddr>,
	headers: HeaderMap,
	body: axum::body::Bytes,
) -> Response {
	let auth = match authenticate(&state, &headers).await {
		Ok(a) => a,
		Err(resp) => return resp,
	};
	let req: universal::EmbeddingRequest = match serde_json::from_slice(&body) {
		Ok(r) => r,
		Err(e) => {
			return error_response(ErrorKind::InvalidRequest, &format!("invalid request body: {e}"), None);
		},
	};

	let rid = request_id(&headers);
	let mut ctx = RequestContext::new(strng::new(&req.model), CallType::Embedding);
	ctx.request_id = rid.clone();
	ctx.tags = request_tags(&headers);

	let end_user = req.user.as_deref().map(strng::new);
	if let Err(resp) = evaluate(
		&state,
		&auth,
		&headers,
		peer,
		&req.model,
		ctx.estimated_input_tokens,
		end_user,
	)
	.await
	{
		return with_request_id(resp, &rid);
	}

	let hook = accounting_hook(&state, &auth, &ctx);
	let result = state
		.forwarder
		.forward_embedding(&state.shutdown, &ctx, &req, hook)
		.await;
	let resp = match result {
		Ok(resp) => json_response(&resp),
		Err(e) => forward_error_response(e, &headers),
	};
	with_request_id(resp, &rid)
}

async fn models(State(state): State<Arc<AppState>>) -> Response {
	let data = state
		.registry
		.models()
		.into_iter()
		.map(|id| universal::ModelInfo {
			id: id.to_string(),
			object: "model".to_string(),
			created: 0,
			owned_by: "llmux".to_string(),
		})
		.collect();
	json_response(&universal::ModelList {
		object: "list".to_string(),
		data,
	})
}

async fn health() -> Response {
	json_response(&serde_json::json!({"status": "ok"}))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
	match state.metrics.encode() {
		Ok(body) => Response::builder()
			.status(StatusCode::OK)
			.header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
			.body(Body::from(body))
			.unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
		Err(e) => {
			tracing::error!("error encoding metrics: {e:?}");
			StatusCode::INTERNAL_SERVER_ERROR.into_response()
		},
	}
}

async fn not_implemented() -> Response {
	error_response(
		ErrorKind::InvalidRequest,
		"this endpoint is not supported by this gateway build",
		None,
	)
}

fn json_response<T: serde::Serialize>(value: &T) -> Response {
	match serde_json::to_vec(value) {
		Ok(body) => Response::builder()
			.status(StatusCode::OK)
			.header(header::CONTENT_TYPE, "application/json")
			.body(Body::from(body))
			.unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
		Err(e) => error_response(ErrorKind::Internal, &format!("serialization failure: {e}"), None),
	}
}

fn with_request_id(mut resp: Response, rid: &Strng) -> Response {
	if let Ok(value) = HeaderValue::from_str(rid) {
		resp.headers_mut().insert("x-request-id", value);
	}
	resp
}
