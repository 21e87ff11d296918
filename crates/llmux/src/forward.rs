use std::pin::Pin;

use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::config::{RecoveryMode, RetryConfig, StreamConfig};
use crate::errors::{ErrorKind, UpstreamError};
use crate::parse::sse::{Frame, FrameParser, data_frame, done_frame};
use crate::providers::{ProviderAdapter, UpstreamRequest, adapter_for, universal};
use crate::registry::Registry;
use crate::routing::{Candidate, RouteError, Router};
use crate::stats::DeploymentStats;
use crate::telemetry::metrics::Metrics;
use crate::types::{Deployment, RequestContext, ResponseMetrics};
use crate::*;

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
	#[error(transparent)]
	Route(#[from] RouteError),
	#[error(transparent)]
	Adapter(#[from] providers::AdapterError),
	#[error(transparent)]
	Upstream(#[from] UpstreamError),
	#[error("request cancelled")]
	Cancelled,
}

impl ForwardError {
	pub fn kind(&self) -> ErrorKind {
		match self {
			ForwardError::Route(e) => e.kind(),
			ForwardError::Adapter(e) => match e {
				providers::AdapterError::Credential(_) => ErrorKind::Authentication,
				providers::AdapterError::RequestParsing(_)
				| providers::AdapterError::StreamingUnsupported
				| providers::AdapterError::EmbeddingsUnsupported => ErrorKind::InvalidRequest,
				providers::AdapterError::UnknownProvider(_) => ErrorKind::NotFound,
				_ => ErrorKind::Internal,
			},
			ForwardError::Upstream(e) => e.kind,
			ForwardError::Cancelled => ErrorKind::Timeout,
		}
	}

	pub fn retry_after(&self) -> Option<Duration> {
		match self {
			ForwardError::Upstream(e) => e.retry_after,
			_ => None,
		}
	}
}

/// Final disposition of one forwarded request, delivered to the completion
/// hook for accounting. For streams this fires when the stream finishes, not
/// when the response headers go out.
#[derive(Debug, Clone)]
pub struct ForwardSummary {
	pub deployment_id: Strng,
	pub provider: Strng,
	pub model: Strng,
	pub status: u16,
	pub metrics: ResponseMetrics,
}

/// Invoked exactly once per forwarded request with its final disposition.
/// The forwarder awaits the returned future, so synchronous accounting can
/// finish before the response is released; hooks wanting fire-and-forget
/// spawn internally and resolve immediately.
pub type CompletionHook =
	Box<dyn FnOnce(ForwardSummary) -> futures::future::BoxFuture<'static, ()> + Send + 'static>;

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Bytes, ForwardError>> + Send>>;

pub enum ForwardResponse {
	Full(universal::ChatResponse),
	Stream(ChunkStream),
}

impl std::fmt::Debug for ForwardResponse {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			ForwardResponse::Full(resp) => f.debug_tuple("Full").field(resp).finish(),
			ForwardResponse::Stream(_) => f.debug_tuple("Stream").finish(),
		}
	}
}

#[derive(Debug, Clone)]
pub struct ForwardOptions {
	pub retry: RetryConfig,
	pub stream: StreamConfig,
	/// Deployment id used when routing yields nothing.
	pub fallback_deployment: Option<Strng>,
}

impl Default for ForwardOptions {
	fn default() -> Self {
		ForwardOptions {
			retry: RetryConfig::default(),
			stream: StreamConfig::default(),
			fallback_deployment: None,
		}
	}
}

/// Executes the end-to-end request lifecycle: route, build the upstream call
/// through the deployment's adapter, execute with retry and fallback, stream
/// or buffer the response, and report stats on every exit path.
pub struct Forwarder {
	router: Arc<Router>,
	registry: Arc<Registry>,
	client: reqwest::Client,
	options: ForwardOptions,
	semaphores: Mutex<HashMap<Strng, Arc<Semaphore>>>,
	metrics: Option<Arc<Metrics>>,
}

enum AttemptOutcome {
	Full(universal::ChatResponse, ResponseMetrics),
	Stream(StreamHandoff),
	Failed(UpstreamError),
}

struct StreamHandoff {
	body: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
	parser: FrameParser,
	/// Frames already translated during pre-read, to emit before the live
	/// tail.
	initial: Vec<Bytes>,
	ttft: Option<Duration>,
	usage: Option<universal::Usage>,
}

impl Forwarder {
	pub fn new(
		router: Arc<Router>,
		registry: Arc<Registry>,
		client: reqwest::Client,
		options: ForwardOptions,
		metrics: Option<Arc<Metrics>>,
	) -> Self {
		Forwarder {
			router,
			registry,
			client,
			options,
			semaphores: Mutex::new(HashMap::new()),
			metrics,
		}
	}

	/// Forward one chat request. The child context is cancelled on every exit
	/// path: when the caller's token fires, when a buffered request returns,
	/// or when the stream driver finishes.
	pub async fn forward_chat(
		&self,
		parent: &CancellationToken,
		ctx: &RequestContext,
		req: &universal::ChatRequest,
		on_complete: CompletionHook,
	) -> Result<ForwardResponse, ForwardError> {
		let ct = parent.child_token();
		let guard = ct.clone().drop_guard();
		self.run_attempts(ct, guard, ctx, req, on_complete).await
	}

	pub async fn forward_embedding(
		&self,
		parent: &CancellationToken,
		ctx: &RequestContext,
		req: &universal::EmbeddingRequest,
		on_complete: CompletionHook,
	) -> Result<universal::EmbeddingResponse, ForwardError> {
		let ct = parent.child_token();
		let _guard = ct.clone().drop_guard();
		let mut attempt = 0u32;
		loop {
			let pick = self.pick(ctx).await?;
			let deployment = pick.deployment.clone();
			let adapter = adapter_for(&deployment.provider)?;
			let upstream = adapter.build_embedding_request(&deployment, req)?;
			let permit = self.acquire_permit(&deployment).await;
			self.router.report_request_start(&deployment.id).await;
			let start = Instant::now();
			let result = self.send_buffered(&ct, &deployment, upstream).await;
			drop(permit);
			match result {
				Ok((status, body)) if status.is_success() => {
					let resp = match adapter.parse_embedding_response(&body) {
						Ok(r) => r,
						Err(e) => {
							self
								.finish_failure(&deployment, start, ErrorKind::Internal)
								.await;
							return Err(e.into());
						},
					};
					let usage = resp.usage.unwrap_or_default();
					let metrics = self.metrics_from_usage(&pick, start.elapsed(), None, Some(usage));
					self.finish_success(&deployment, &metrics).await;
					on_complete(summary(&deployment, 200, metrics)).await;
					return Ok(resp);
				},
				Ok((status, body)) => {
					let (kind, message) = adapter.map_error(status, &body);
					let err = upstream_error(&deployment, kind, message);
					self.finish_failure(&deployment, start, kind).await;
					if self.should_retry(kind, attempt) {
						attempt += 1;
						self.sleep_backoff(&ct, attempt - 1).await?;
						continue;
					}
					on_complete(summary(&deployment, kind.status().as_u16(), ResponseMetrics::default())).await;
					return Err(err.into());
				},
				Err(err) => {
					self.finish_failure(&deployment, start, err.kind).await;
					if self.should_retry(err.kind, attempt) {
						attempt += 1;
						self.sleep_backoff(&ct, attempt - 1).await?;
						continue;
					}
					on_complete(summary(&deployment, err.kind.status().as_u16(), ResponseMetrics::default())).await;
					return Err(err.into());
				},
			}
		}
	}

	async fn run_attempts(
		&self,
		ct: CancellationToken,
		guard: DropGuard,
		ctx: &RequestContext,
		req: &universal::ChatRequest,
		on_complete: CompletionHook,
	) -> Result<ForwardResponse, ForwardError> {
		let mut attempt = 0u32;
		let mut guard = Some(guard);
		let mut on_complete = Some(on_complete);
		loop {
			let pick = self.pick(ctx).await?;
			let deployment = pick.deployment.clone();
			let adapter = adapter_for(&deployment.provider)?;
			let upstream = adapter.build_request(&deployment, req)?;

			let permit = self.acquire_permit(&deployment).await;
			self.router.report_request_start(&deployment.id).await;
			let start = Instant::now();

			let outcome = self
				.execute_attempt(&ct, &pick, adapter.clone(), upstream, ctx.streaming, start)
				.await;
			match outcome {
				AttemptOutcome::Full(resp, metrics) => {
					drop(permit);
					self.finish_success(&deployment, &metrics).await;
					if let Some(hook) = on_complete.take() {
						hook(summary(&deployment, 200, metrics)).await;
					}
					return Ok(ForwardResponse::Full(resp));
				},
				AttemptOutcome::Stream(handoff) => {
					return Ok(self.spawn_stream_driver(
						ct,
						guard.take(),
						permit,
						pick,
						adapter,
						handoff,
						on_complete.take(),
						start,
					));
				},
				AttemptOutcome::Failed(err) => {
					drop(permit);
					self.finish_failure(&deployment, start, err.kind).await;
					if self.should_retry(err.kind, attempt) {
						attempt += 1;
						self.sleep_backoff(&ct, attempt - 1).await?;
						continue;
					}
					if let Some(hook) = on_complete.take() {
						hook(summary(
							&deployment,
							err.kind.status().as_u16(),
							ResponseMetrics::default(),
						))
						.await;
					}
					return Err(err.into());
				},
			}
		}
	}

	async fn pick(&self, ctx: &RequestContext) -> Result<Candidate, ForwardError> {
		match self.router.pick_with_context(ctx).await {
			Ok(pick) => Ok(pick),
			Err(e) => {
				// Fall back to the configured default deployment, if any.
				if let Some(fallback) = &self.options.fallback_deployment {
					if let Some(entry) = self.registry.get(fallback) {
						debug!(model = %ctx.model, fallback = %fallback, "using fallback deployment");
						return Ok(Candidate {
							stats: DeploymentStats::new(entry.deployment.id.clone()),
							deployment: entry.deployment,
							config: entry.config,
						});
					}
				}
				Err(e.into())
			},
		}
	}

	async fn acquire_permit(&self, deployment: &Deployment) -> Option<OwnedSemaphorePermit> {
		if deployment.max_concurrent == 0 {
			return None;
		}
		let semaphore = {
			let mut map = self.semaphores.lock();
			map
				.entry(deployment.id.clone())
				.or_insert_with(|| Arc::new(Semaphore::new(deployment.max_concurrent)))
				.clone()
		};
		// A closed semaphore cannot happen; we never close them.
		semaphore.acquire_owned().await.ok()
	}

	fn should_retry(&self, kind: ErrorKind, attempt: u32) -> bool {
		kind.retryable() && attempt < self.options.retry.attempts
	}

	/// `backoff(k) = min(base * 2^k, cap) * (1 +/- jitter)`
	fn backoff(&self, attempt: u32) -> Duration {
		let retry = &self.options.retry;
		let base = retry.backoff.as_secs_f64() * 2f64.powi(attempt as i32);
		let capped = base.min(retry.max_backoff.as_secs_f64());
		let factor = if retry.jitter > 0.0 {
			1.0 + rand::rng().random_range(-retry.jitter..retry.jitter)
		} else {
			1.0
		};
		Duration::from_secs_f64((capped * factor).max(0.0))
	}

	async fn sleep_backoff(&self, ct: &CancellationToken, attempt: u32) -> Result<(), ForwardError> {
		let delay = self.backoff(attempt);
		tokio::select! {
			_ = ct.cancelled() => Err(ForwardError::Cancelled),
			_ = tokio::time::sleep(delay) => Ok(()),
		}
	}

	/// Send and buffer a non-streaming call, bounded by the deployment
	/// timeout and the request context.
	async fn send_buffered(
		&self,
		ct: &CancellationToken,
		deployment: &Deployment,
		upstream: UpstreamRequest,
	) -> Result<(http::StatusCode, Bytes), UpstreamError> {
		let request = self
			.client
			.request(upstream.method, &upstream.url)
			.headers(upstream.headers)
			.body(upstream.body);
		let fut = async {
			let resp = request.send().await?;
			let status = resp.status();
			let body = resp.bytes().await?;
			Ok::<_, reqwest::Error>((status, body))
		};
		let bounded = tokio::time::timeout(deployment.timeout, fut);
		tokio::select! {
			_ = ct.cancelled() => Err(upstream_error(
				deployment,
				ErrorKind::Timeout,
				"request context cancelled",
			)),
			r = bounded => match r {
				Err(_) => Err(upstream_error(
					deployment,
					ErrorKind::Timeout,
					format!("upstream timed out after {:?}", deployment.timeout),
				)),
				Ok(Err(e)) => Err(transport_error(deployment, e)),
				Ok(Ok(out)) => Ok(out),
			},
		}
	}

	async fn execute_attempt(
		&self,
		ct: &CancellationToken,
		pick: &Candidate,
		adapter: Arc<dyn ProviderAdapter>,
		upstream: UpstreamRequest,
		streaming: bool,
		start: Instant,
	) -> AttemptOutcome {
		let deployment = &pick.deployment;
		if !streaming {
			return match self.send_buffered(ct, deployment, upstream).await {
				Ok((status, body)) if status.is_success() => match adapter.parse_response(&body) {
					Ok(resp) => {
						let usage = resp.usage;
						let metrics = self.metrics_from_usage(pick, start.elapsed(), None, usage);
						AttemptOutcome::Full(resp, metrics)
					},
					Err(e) => AttemptOutcome::Failed(upstream_error(
						deployment,
						ErrorKind::Internal,
						format!("failed to parse upstream response: {e}"),
					)),
				},
				Ok((status, body)) => {
					let (kind, message) = adapter.map_error(status, &body);
					AttemptOutcome::Failed(upstream_error(deployment, kind, message))
				},
				Err(err) => AttemptOutcome::Failed(err),
			};
		}

		// Streaming: establish the response, then optionally pre-read to the
		// first content frame so a dead upstream can still be retried.
		let request = self
			.client
			.request(upstream.method, &upstream.url)
			.headers(upstream.headers)
			.body(upstream.body);
		let established = tokio::select! {
			_ = ct.cancelled() => {
				return AttemptOutcome::Failed(upstream_error(
					deployment,
					ErrorKind::Timeout,
					"request context cancelled",
				));
			},
			r = tokio::time::timeout(deployment.timeout, request.send()) => r,
		};
		let resp = match established {
			Err(_) => {
				return AttemptOutcome::Failed(upstream_error(
					deployment,
					ErrorKind::Timeout,
					format!("upstream timed out after {:?}", deployment.timeout),
				));
			},
			Ok(Err(e)) => return AttemptOutcome::Failed(transport_error(deployment, e)),
			Ok(Ok(resp)) => resp,
		};
		if !resp.status().is_success() {
			let status = resp.status();
			let body = resp.bytes().await.unwrap_or_default();
			let (kind, message) = adapter.map_error(status, &body);
			return AttemptOutcome::Failed(upstream_error(deployment, kind, message));
		}

		let mut handoff = StreamHandoff {
			body: Box::pin(resp.bytes_stream()),
			parser: FrameParser::new(),
			initial: Vec::new(),
			ttft: None,
			usage: None,
		};
		if self.options.stream.recovery == RecoveryMode::Off {
			return AttemptOutcome::Stream(handoff);
		}
		// Recovery enabled: nothing has reached the client yet, so a failure
		// before the first content frame re-enters the routing loop.
		match tokio::time::timeout(
			deployment.timeout,
			pre_read_first_chunk(&mut handoff, adapter.as_ref(), start),
		)
		.await
		{
			Ok(Ok(())) => AttemptOutcome::Stream(handoff),
			Ok(Err(err)) => AttemptOutcome::Failed(upstream_error(deployment, err.0, err.1)),
			Err(_) => AttemptOutcome::Failed(upstream_error(
				deployment,
				ErrorKind::Timeout,
				"no streamed content before timeout",
			)),
		}
	}

	#[allow(clippy::too_many_arguments)]
	fn spawn_stream_driver(
		&self,
		ct: CancellationToken,
		guard: Option<DropGuard>,
		permit: Option<OwnedSemaphorePermit>,
		pick: Candidate,
		adapter: Arc<dyn ProviderAdapter>,
		handoff: StreamHandoff,
		on_complete: Option<CompletionHook>,
		start: Instant,
	) -> ForwardResponse {
		let (tx, rx) = mpsc::channel::<Result<Bytes, ForwardError>>(16);
		let router = self.router.clone();
		let metrics_sink = self.metrics.clone();
		let buffer_cap = self.options.stream.buffer_cap;
		let config = pick.config.clone();
		let deployment = pick.deployment.clone();

		tokio::spawn(async move {
			// Dropping the guard at task exit cancels the child context: the
			// one place streaming cancellation is owned.
			let _guard = guard;
			let _permit = permit;
			let StreamHandoff {
				mut body,
				mut parser,
				initial,
				mut ttft,
				mut usage,
			} = handoff;

			let mut sent_bytes: usize = 0;
			let mut done_sent = false;
			let mut client_gone = false;
			let mut failure: Option<UpstreamError> = None;

			for frame in initial {
				sent_bytes = sent_bytes.saturating_add(frame.len()).min(buffer_cap);
				if tx.send(Ok(frame)).await.is_err() {
					client_gone = true;
				}
			}

			while !client_gone && !done_sent && failure.is_none() {
				let next = tokio::select! {
					_ = ct.cancelled() => {
						failure = Some(upstream_error(&deployment, ErrorKind::Timeout, "request context cancelled"));
						break;
					},
					next = body.next() => next,
				};
				match next {
					Some(Ok(bytes)) => {
						parser.push(&bytes);
						while let Some(frame) = parser.next_frame() {
							match frame {
								Frame::Done => {
									let _ = tx.send(Ok(done_frame())).await;
									done_sent = true;
								},
								Frame::Data(data) => {
									if ttft.is_none() && !data.is_empty() {
										ttft = Some(start.elapsed());
									}
									match adapter.parse_stream_chunk(&data) {
										Ok(Some(chunk)) => {
											if let Some(u) = chunk.usage {
												usage = Some(u);
											}
											let Ok(json) = serde_json::to_vec(&chunk) else {
												continue;
											};
											let frame = data_frame(&json);
											sent_bytes = sent_bytes.saturating_add(frame.len()).min(buffer_cap);
											if tx.send(Ok(frame)).await.is_err() {
												client_gone = true;
												break;
											}
										},
										Ok(None) => {},
										Err(e) => {
											debug!(deployment = %deployment.id, "failed to parse streaming frame: {e}");
										},
									}
								},
							}
						}
					},
					Some(Err(e)) => {
						failure = Some(transport_error(&deployment, e));
					},
					None => break,
				}
			}

			// Clients always see a terminal frame on a healthy stream.
			if !done_sent && failure.is_none() && !client_gone {
				let _ = tx.send(Ok(done_frame())).await;
			}

			let latency = start.elapsed();
			let (status, metrics) = match &failure {
				Some(err) => {
					router.report_failure(&deployment.id, err.kind).await;
					if !client_gone {
						let _ = tx.send(Err(ForwardError::Upstream(err.clone()))).await;
					}
					(err.kind.status().as_u16(), ResponseMetrics {
						latency,
						ttft,
						..Default::default()
					})
				},
				None => {
					let usage = usage.unwrap_or_default();
					let metrics = ResponseMetrics {
						latency,
						ttft,
						input_tokens: usage.prompt_tokens,
						output_tokens: usage.completion_tokens,
						total_tokens: usage.total_tokens,
						cost: config.cost(usage.prompt_tokens, usage.completion_tokens),
					};
					router.report_success(&deployment.id, &metrics).await;
					(200, metrics)
				},
			};
			router.report_request_end(&deployment.id).await;
			if let Some(m) = &metrics_sink {
				m.record_request(
					&deployment.provider,
					&deployment.model,
					status,
					metrics.latency,
					metrics.input_tokens,
					metrics.output_tokens,
				);
			}
			if let Some(hook) = on_complete {
				hook(summary(&deployment, status, metrics)).await;
			}
		});

		ForwardResponse::Stream(Box::pin(ReceiverStream::new(rx)))
	}

	fn metrics_from_usage(
		&self,
		pick: &Candidate,
		latency: Duration,
		ttft: Option<Duration>,
		usage: Option<universal::Usage>,
	) -> ResponseMetrics {
		let usage = usage.unwrap_or_default();
		ResponseMetrics {
			latency,
			ttft,
			input_tokens: usage.prompt_tokens,
			output_tokens: usage.completion_tokens,
			total_tokens: usage.total_tokens,
			cost: pick.config.cost(usage.prompt_tokens, usage.completion_tokens),
		}
	}

	async fn finish_success(&self, deployment: &Deployment, metrics: &ResponseMetrics) {
		self.router.report_success(&deployment.id, metrics).await;
		self.router.report_request_end(&deployment.id).await;
		if let Some(m) = &self.metrics {
			m.record_request(
				&deployment.provider,
				&deployment.model,
				200,
				metrics.latency,
				metrics.input_tokens,
				metrics.output_tokens,
			);
		}
	}

	async fn finish_failure(&self, deployment: &Deployment, start: Instant, kind: ErrorKind) {
		self.router.report_failure(&deployment.id, kind).await;
		self.router.report_request_end(&deployment.id).await;
		if let Some(m) = &self.metrics {
			m.record_request(
				&deployment.provider,
				&deployment.model,
				kind.status().as_u16(),
				start.elapsed(),
				0,
				0,
			);
		}
	}
}

/// Drive the upstream until the first content-bearing frame, translating as
/// we go. Frames translated here are queued on the handoff.
async fn pre_read_first_chunk(
	handoff: &mut StreamHandoff,
	adapter: &dyn ProviderAdapter,
	start: Instant,
) -> Result<(), (ErrorKind, String)> {
	loop {
		let Some(next) = handoff.body.next().await else {
			return Err((
				ErrorKind::ServiceUnavailable,
				"upstream closed the stream before any content".to_string(),
			));
		};
		let bytes = next.map_err(|e| {
			(
				classify_transport(&e),
				format!("upstream stream failed before any content: {e}"),
			)
		})?;
		handoff.parser.push(&bytes);
		while let Some(frame) = handoff.parser.next_frame() {
			match frame {
				Frame::Done => {
					handoff.initial.push(done_frame());
					return Ok(());
				},
				Frame::Data(data) => {
					if handoff.ttft.is_none() && !data.is_empty() {
						handoff.ttft = Some(start.elapsed());
					}
					match adapter.parse_stream_chunk(&data) {
						Ok(Some(chunk)) => {
							if let Some(u) = chunk.usage {
								handoff.usage = Some(u);
							}
							if let Ok(json) = serde_json::to_vec(&chunk) {
								handoff.initial.push(data_frame(&json));
							}
							return Ok(());
						},
						Ok(None) => {},
						Err(e) => {
							debug!("failed to parse streaming frame during pre-read: {e}");
						},
					}
				},
			}
		}
	}
}

fn summary(deployment: &Deployment, status: u16, metrics: ResponseMetrics) -> ForwardSummary {
	ForwardSummary {
		deployment_id: deployment.id.clone(),
		provider: deployment.provider.clone(),
		model: deployment.model.clone(),
		status,
		metrics,
	}
}

fn upstream_error(
	deployment: &Deployment,
	kind: ErrorKind,
	message: impl Into<String>,
) -> UpstreamError {
	UpstreamError::new(
		kind,
		deployment.provider.clone(),
		deployment.model.clone(),
		message,
	)
}

fn classify_transport(e: &reqwest::Error) -> ErrorKind {
	if e.is_timeout() {
		ErrorKind::Timeout
	} else {
		// Connect failures and broken transports read as an unavailable
		// backend: retryable and cooldown-worthy.
		ErrorKind::ServiceUnavailable
	}
}

fn transport_error(deployment: &Deployment, e: reqwest::Error) -> UpstreamError {
	upstream_error(deployment, classify_transport(&e), e.to_string())
}
