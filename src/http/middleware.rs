//! Axum middleware applying a limiter's decision to each request.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::{trace, warn};

use crate::ratelimit::{Decision, KeyedLimiter, Limiter};

const FORWARDED_FOR: &str = "x-forwarded-for";
const UNKNOWN_CLIENT: &str = "unknown";

/// Shared state for the rate limiting middleware.
pub struct RateLimitState<L: ?Sized> {
    limiter: Arc<L>,
    exempt_paths: Arc<[String]>,
}

impl<L: ?Sized> Clone for RateLimitState<L> {
    fn clone(&self) -> Self {
        Self {
            limiter: Arc::clone(&self.limiter),
            exempt_paths: Arc::clone(&self.exempt_paths),
        }
    }
}

impl<L: ?Sized> RateLimitState<L> {
    pub fn new(limiter: Arc<L>) -> Self {
        Self {
            limiter,
            exempt_paths: Arc::from(Vec::new()),
        }
    }

    /// Let requests whose path starts with any of `prefixes` through unchecked.
    pub fn with_exempt_paths<I, P>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.exempt_paths = prefixes.into_iter().map(Into::into).collect();
        self
    }

    fn is_exempt(&self, path: &str) -> bool {
        self.exempt_paths.iter().any(|prefix| path.starts_with(prefix.as_str()))
    }
}

/// Resolve the caller's identity.
///
/// Prefers the first entry of `X-Forwarded-For`, then the peer address
/// without its port.
pub fn client_key(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get(FORWARDED_FOR)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

/// Middleware checking one limiter shared by every caller.
pub async fn global_rate_limit<L>(
    State(state): State<RateLimitState<L>>,
    req: Request,
    next: Next,
) -> Response
where
    L: Limiter + ?Sized + 'static,
{
    if state.is_exempt(req.uri().path()) {
        return next.run(req).await;
    }

    if state.limiter.allow() {
        next.run(req).await
    } else {
        warn!(path = %req.uri().path(), "Global rate limit exceeded");
        RateLimitRejection::new(None).into_response()
    }
}

/// Middleware checking a per-client limiter keyed by [`client_key`].
pub async fn keyed_rate_limit<L>(
    State(state): State<RateLimitState<L>>,
    req: Request,
    next: Next,
) -> Response
where
    L: KeyedLimiter + ?Sized + 'static,
{
    if state.is_exempt(req.uri().path()) {
        return next.run(req).await;
    }

    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let key = client_key(req.headers(), peer);

    match state.limiter.decide(&key) {
        Decision::Admit => {
            trace!(client = %key, "Request admitted");
            next.run(req).await
        }
        Decision::Reject { retry_after } => {
            warn!(
                client = %key,
                path = %req.uri().path(),
                retry_after_ms = retry_after.map(|d| d.as_millis() as u64),
                "Rate limit exceeded"
            );
            RateLimitRejection::new(retry_after).into_response()
        }
    }
}

/// A `429 Too Many Requests` response.
#[derive(Debug, Clone)]
pub struct RateLimitRejection {
    retry_after: Option<Duration>,
}

impl RateLimitRejection {
    pub fn new(retry_after: Option<Duration>) -> Self {
        Self { retry_after }
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    errors: Vec<ErrorBody>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    status: u16,
    title: &'static str,
    detail: String,
}

/// Whole seconds to wait, rounded up and never zero.
fn retry_after_secs(wait: Duration) -> u64 {
    let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
    secs.max(1)
}

impl IntoResponse for RateLimitRejection {
    fn into_response(self) -> Response {
        let status = StatusCode::TOO_MANY_REQUESTS;
        let detail = match self.retry_after {
            Some(wait) => format!("Retry after {} seconds.", retry_after_secs(wait)),
            None => String::new(),
        };

        let body = Json(ErrorResponse {
            errors: vec![ErrorBody {
                status: status.as_u16(),
                title: "Too Many Requests",
                detail,
            }],
        });

        let mut response = (status, body).into_response();
        if let Some(wait) = self.retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs(wait)));
        }
        response
    }
}
