use http::StatusCode;

use crate::*;

/// Classification of a failed call. The kind, not the concrete error type,
/// drives retry and cooldown decisions in the forwarder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
	Authentication,
	Permission,
	InvalidRequest,
	NotFound,
	RateLimit,
	Timeout,
	ServiceUnavailable,
	Internal,
	Quota,
}

impl ErrorKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			ErrorKind::Authentication => "authentication_error",
			ErrorKind::Permission => "permission_error",
			ErrorKind::InvalidRequest => "invalid_request_error",
			ErrorKind::NotFound => "not_found_error",
			ErrorKind::RateLimit => "rate_limit_error",
			ErrorKind::Timeout => "timeout_error",
			ErrorKind::ServiceUnavailable => "service_unavailable_error",
			ErrorKind::Internal => "internal_error",
			ErrorKind::Quota => "quota_error",
		}
	}

	pub fn retryable(&self) -> bool {
		matches!(
			self,
			ErrorKind::RateLimit | ErrorKind::Timeout | ErrorKind::ServiceUnavailable | ErrorKind::Internal
		)
	}

	/// Whether a failure of this kind should place the deployment in cooldown.
	pub fn cooldown_worthy(&self) -> bool {
		matches!(
			self,
			ErrorKind::Authentication
				| ErrorKind::NotFound
				| ErrorKind::RateLimit
				| ErrorKind::Timeout
				| ErrorKind::ServiceUnavailable
				| ErrorKind::Internal
		)
	}

	/// Timeouts poison the latency window with a sentinel so latency-based
	/// strategies deprioritize the deployment.
	pub fn latency_penalizing(&self) -> bool {
		matches!(self, ErrorKind::Timeout)
	}

	pub fn status(&self) -> StatusCode {
		match self {
			ErrorKind::Authentication => StatusCode::UNAUTHORIZED,
			ErrorKind::Permission => StatusCode::FORBIDDEN,
			ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
			ErrorKind::NotFound => StatusCode::NOT_FOUND,
			ErrorKind::RateLimit => StatusCode::TOO_MANY_REQUESTS,
			ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
			ErrorKind::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
			ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
			ErrorKind::Quota => StatusCode::PAYMENT_REQUIRED,
		}
	}

	pub fn from_status(status: StatusCode) -> ErrorKind {
		match status {
			StatusCode::UNAUTHORIZED => ErrorKind::Authentication,
			StatusCode::FORBIDDEN => ErrorKind::Permission,
			StatusCode::BAD_REQUEST => ErrorKind::InvalidRequest,
			StatusCode::NOT_FOUND => ErrorKind::NotFound,
			StatusCode::TOO_MANY_REQUESTS => ErrorKind::RateLimit,
			StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ErrorKind::Timeout,
			StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE => ErrorKind::ServiceUnavailable,
			s if s.is_client_error() => ErrorKind::InvalidRequest,
			_ => ErrorKind::Internal,
		}
	}
}

impl std::fmt::Display for ErrorKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// A classified upstream failure, carrying enough context to attribute it.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{provider}/{model}: {kind}: {message}")]
pub struct UpstreamError {
	pub kind: ErrorKind,
	pub provider: Strng,
	pub model: Strng,
	pub message: String,
	pub retry_after: Option<Duration>,
}

impl UpstreamError {
	pub fn new(kind: ErrorKind, provider: Strng, model: Strng, message: impl Into<String>) -> Self {
		Self {
			kind,
			provider,
			model,
			message: message.into(),
			retry_after: None,
		}
	}
}

/// Wire shape for user-facing errors: `{"error":{"message":...,"type":...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
	pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
	pub message: String,
	pub r#type: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub param: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub code: Option<String>,
}

impl ErrorResponse {
	pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
		ErrorResponse {
			error: ErrorBody {
				message: message.into(),
				r#type: kind.as_str().to_string(),
				param: None,
				code: None,
			},
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Locale {
	#[default]
	En,
	ZhHans,
}

impl Locale {
	pub fn from_accept_language(header: &str) -> Locale {
		let primary = header.split(',').next().unwrap_or("").trim();
		if primary.starts_with("zh") {
			Locale::ZhHans
		} else {
			Locale::En
		}
	}
}

/// Fixed catalog of translated denial messages. Anything outside the catalog
/// falls back to the original message.
pub fn localize(kind: ErrorKind, locale: Locale) -> Option<&'static str> {
	let msg = match (kind, locale) {
		(ErrorKind::RateLimit, Locale::En) => "rate limit exceeded, please retry later",
		(ErrorKind::RateLimit, Locale::ZhHans) => "请求频率超限，请稍后重试",
		(ErrorKind::Quota, Locale::En) => "budget exhausted for this key or tenant",
		(ErrorKind::Quota, Locale::ZhHans) => "当前密钥或租户预算已用尽",
		(ErrorKind::ServiceUnavailable, Locale::En) => "no available deployment for this model",
		(ErrorKind::ServiceUnavailable, Locale::ZhHans) => "该模型暂无可用部署",
		(ErrorKind::Permission, Locale::En) => "access to this model is not permitted",
		(ErrorKind::Permission, Locale::ZhHans) => "没有访问该模型的权限",
		_ => return None,
	};
	Some(msg)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn retryable_and_cooldown_bits() {
		// 429 is both retryable and cooldown-worthy; 403 is neither.
		assert!(ErrorKind::RateLimit.retryable());
		assert!(ErrorKind::RateLimit.cooldown_worthy());
		assert!(!ErrorKind::Permission.retryable());
		assert!(!ErrorKind::Permission.cooldown_worthy());
		// Auth failures cool down (bad credentials will not heal per-request) but
		// must not be retried on the same deployment.
		assert!(!ErrorKind::Authentication.retryable());
		assert!(ErrorKind::Authentication.cooldown_worthy());
		assert!(!ErrorKind::Quota.retryable());
		assert!(!ErrorKind::Quota.cooldown_worthy());
	}

	#[test]
	fn status_round_trip() {
		for kind in [
			ErrorKind::Authentication,
			ErrorKind::Permission,
			ErrorKind::InvalidRequest,
			ErrorKind::NotFound,
			ErrorKind::RateLimit,
			ErrorKind::Timeout,
			ErrorKind::ServiceUnavailable,
		] {
			assert_eq!(ErrorKind::from_status(kind.status()), kind);
		}
	}

	#[test]
	fn locale_selection() {
		assert_eq!(Locale::from_accept_language("zh-CN,zh;q=0.9"), Locale::ZhHans);
		assert_eq!(Locale::from_accept_language("en-US,en;q=0.5"), Locale::En);
		assert_eq!(Locale::from_accept_language(""), Locale::En);
	}
}
