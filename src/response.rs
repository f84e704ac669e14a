use axum::{
    response::{IntoResponse, Response},
    Json,
};
use http::{
    header::{HeaderName, RETRY_AFTER},
    HeaderMap, HeaderValue, StatusCode,
};
use serde::{Deserialize, Serialize};

use crate::{
    limiter::{AdmissionDecision, LimitType},
    utils::{calculate_reset, format_iso8601, retry_after},
};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// JSON body of a rejection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectionBody {
    pub error: String,
    pub message: String,
    pub details: RejectionDetails,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectionDetails {
    pub limit: u64,
    pub current: u64,
    pub window: String,
    pub reset_at: String,
    pub limit_type: String,
}

impl RejectionBody {
    pub fn new(limit_type: LimitType, limit: u64, current: u64, now: i64) -> Self {
        Self {
            error: "Rate limit exceeded".to_string(),
            message: format!(
                "Too many requests. Try again in {} seconds.",
                retry_after(now)
            ),
            details: RejectionDetails {
                limit,
                current,
                window: "1 minute".to_string(),
                reset_at: format_iso8601(calculate_reset(now)),
                limit_type: limit_type.to_string(),
            },
        }
    }
}

/// Set `X-RateLimit-Limit`, `X-RateLimit-Remaining` and `X-RateLimit-Reset`.
pub fn apply_rate_limit_headers(headers: &mut HeaderMap, limit: u64, remaining: u64, now: i64) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(calculate_reset(now)));
}

/// Annotate an admitted response with the most restrictive tier's numbers
pub fn annotate(response: &mut Response, decision: &AdmissionDecision, now: i64) {
    apply_rate_limit_headers(
        response.headers_mut(),
        decision.limit,
        decision.remaining,
        now,
    );
}

/// Build the terminal response for a rejected request
pub fn rejection_response(decision: &AdmissionDecision, status: StatusCode, now: i64) -> Response {
    let limit_type = decision.violated.unwrap_or(LimitType::GlobalServer);
    let body = RejectionBody::new(limit_type, decision.limit, decision.current_count, now);

    let mut headers = HeaderMap::new();
    apply_rate_limit_headers(&mut headers, decision.limit, 0, now);
    headers.insert(RETRY_AFTER, HeaderValue::from(retry_after(now)));

    (status, headers, Json(body)).into_response()
}
