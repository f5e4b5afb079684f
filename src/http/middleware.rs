//! Rate limiting stage for the request pipeline.
//!
//! Runs before any handler: identifies the client, checks the limiter and
//! either short-circuits with a 429 or lets the request through with quota
//! headers attached to the downstream response.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use tracing::{debug, error, info, instrument, warn, Level, Span};

use super::response::{apply_rate_limit_headers, ApiError};
use crate::ratelimit::{RateLimiter, UNKNOWN_CLIENT};

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";

/// State for the [`rate_limit`] middleware.
#[derive(Debug, Clone)]
pub struct RateLimitState {
    pub limiter: Arc<RateLimiter>,
    /// Peers allowed to name the client through proxy headers
    pub trusted_proxies: Arc<[IpAddr]>,
}

impl RateLimitState {
    pub fn new(limiter: Arc<RateLimiter>, trusted_proxies: impl Into<Arc<[IpAddr]>>) -> Self {
        Self {
            limiter,
            trusted_proxies: trusted_proxies.into(),
        }
    }
}

/// Identify the client behind a request.
///
/// When the peer is a trusted proxy: first `X-Forwarded-For` entry, then
/// `X-Real-IP`. Otherwise, and as a last resort, the peer address.
pub fn client_identifier(headers: &HeaderMap, peer: Option<IpAddr>, trusted_proxies: &[IpAddr]) -> String {
    let via_trusted_proxy = peer.is_some_and(|ip| trusted_proxies.contains(&ip));

    if via_trusted_proxy {
        let forwarded = headers
            .get(X_FORWARDED_FOR)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(client) = forwarded {
            return client.to_string();
        }

        let real_ip = headers
            .get(X_REAL_IP)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(client) = real_ip {
            return client.to_string();
        }
    }

    peer.map(|ip| ip.to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

/// Gate a request on the limiter.
#[instrument(
    name = "request",
    skip_all,
    fields(
        method = %request.method(),
        path = %request.uri().path(),
        client = tracing::field::Empty,
    )
)]
pub async fn rate_limit(State(state): State<RateLimitState>, request: Request, next: Next) -> Response {
    let started = Instant::now();
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip());
    let client = client_identifier(request.headers(), peer, &state.trusted_proxies);
    Span::current().record("client", client.as_str());

    let method = request.method().clone();
    let path = request.uri().path().to_owned();

    let response = match state.limiter.check_request(&path, &client, Utc::now()).await {
        Err(e) => {
            error!(error = %e, path = %path, "Rate limit check failed");
            ApiError::Internal(e.to_string()).into_response()
        }
        Ok(decision) if !decision.allowed => ApiError::RateLimited(decision).into_response(),
        Ok(decision) => {
            debug!(
                classification = %decision.classification,
                remaining = decision.remaining,
                "Request admitted"
            );

            let mut response = next.run(request).await;
            apply_rate_limit_headers(response.headers_mut(), &decision);
            response
        }
    };

    log_completion(&client, &method, &path, response.status(), started.elapsed());
    response
}

/// Failed requests are logged at `WARN`, everything else at `INFO`.
fn completion_level(status: StatusCode) -> Level {
    if status.is_client_error() || status.is_server_error() {
        Level::WARN
    } else {
        Level::INFO
    }
}

fn log_completion(client: &str, method: &Method, path: &str, status: StatusCode, elapsed: Duration) {
    let elapsed_ms = elapsed.as_secs_f64() * 1000.0;

    if completion_level(status) == Level::WARN {
        warn!(
            client = %client,
            method = %method,
            path = %path,
            status = status.as_u16(),
            elapsed_ms,
            "Request completed"
        );
    } else {
        info!(
            client = %client,
            method = %method,
            path = %path,
            status = status.as_u16(),
            elapsed_ms,
            "Request completed"
        );
    }
}
