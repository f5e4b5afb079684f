//! HTTP server wiring the rate limiting stage in front of the proxy.

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::middleware::{rate_limit, RateLimitState};
use super::proxy::{forward, Upstream};
use crate::error::{RateGateError, Result};
use crate::ratelimit::{RateLimiter, StoreMode};

/// Health check path. Never rate limited.
pub const HEALTH_PATH: &str = "/health";

/// Router-level switches.
#[derive(Debug, Clone)]
pub struct GateSettings {
    /// Run the rate limiting stage at all
    pub enabled: bool,
    /// Peers whose `X-Forwarded-For`/`X-Real-IP` headers are believed
    pub trusted_proxies: Vec<IpAddr>,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            trusted_proxies: vec![IpAddr::V4(Ipv4Addr::LOCALHOST), IpAddr::V6(Ipv6Addr::LOCALHOST)],
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub store_mode: StoreMode,
    pub fallback_buckets: usize,
    pub version: &'static str,
}

async fn health(State(limiter): State<Arc<RateLimiter>>) -> Json<HealthReport> {
    let store_mode = limiter.mode();
    Json(HealthReport {
        status: match store_mode {
            StoreMode::Degraded => "degraded",
            StoreMode::Shared | StoreMode::Local => "ok",
        },
        store_mode,
        fallback_buckets: limiter.fallback().bucket_count(),
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Build the gateway router.
///
/// `/health` is answered directly; every other request goes through the
/// rate limiting stage and then upstream.
pub fn router(limiter: Arc<RateLimiter>, upstream: Arc<Upstream>, settings: GateSettings) -> Router {
    let mut gated = Router::new().fallback(forward).with_state(upstream);
    if settings.enabled {
        gated = gated.layer(axum::middleware::from_fn_with_state(
            RateLimitState::new(limiter.clone(), settings.trusted_proxies),
            rate_limit,
        ));
    }

    Router::new()
        .route(HEALTH_PATH, get(health))
        .with_state(limiter)
        .merge(gated)
}

/// HTTP server for the gateway.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    router: Router,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, router: Router) -> Self {
        Self { addr, router }
    }

    /// Start the server with graceful shutdown.
    ///
    /// In-flight requests finish once `signal` resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            RateGateError::Io(e)
        })?;

        info!(addr = %self.addr, "Starting HTTP server with graceful shutdown");

        axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            RateGateError::Io(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::response::X_RATELIMIT_LIMIT;
    use crate::ratelimit::{Classification, Classifier, RateLimitRule, RuleTable};
    use axum::body::{to_bytes, Body};
    use axum::extract::ConnectInfo;
    use axum::http::{Request, StatusCode};
    use std::time::Duration;
    use tower::ServiceExt;

    fn limiter(auth_limit: u64) -> Arc<RateLimiter> {
        let mut rules = RuleTable::default();
        rules.insert(Classification::Auth, RateLimitRule::new(auth_limit, 300));
        Arc::new(RateLimiter::local(rules, Classifier::default()).unwrap())
    }

    fn unreachable_upstream() -> Arc<Upstream> {
        Arc::new(Upstream::new("http://127.0.0.1:1", Duration::from_millis(500), 1024).unwrap())
    }

    fn get_request(path: &str) -> Request<Body> {
        Request::get(path)
            .header("x-forwarded-for", "203.0.113.5")
            .extension(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40_000))))
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_mode() {
        let app = router(limiter(5), unreachable_upstream(), GateSettings::default());

        let response = app.oneshot(get_request(HEALTH_PATH)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(X_RATELIMIT_LIMIT).is_none());

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["store_mode"], "local");
    }

    #[tokio::test]
    async fn test_health_is_not_counted() {
        let limiter = limiter(5);
        let app = router(limiter.clone(), unreachable_upstream(), GateSettings::default());

        for _ in 0..10 {
            let response = app.clone().oneshot(get_request(HEALTH_PATH)).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        assert_eq!(limiter.fallback().bucket_count(), 0);
    }

    #[tokio::test]
    async fn test_rejected_requests_never_reach_upstream() {
        let app = router(limiter(1), unreachable_upstream(), GateSettings::default());

        // Admitted, then fails upstream with quota headers still attached.
        let response = app.clone().oneshot(get_request("/api/v1/auth/me")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers()[X_RATELIMIT_LIMIT], "1");

        let response = app.clone().oneshot(get_request("/api/v1/auth/me")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_untrusted_proxy_forwarded_for_ignored() {
        let limiter = limiter(5);
        let settings = GateSettings {
            trusted_proxies: vec!["10.0.0.1".parse().unwrap()],
            ..GateSettings::default()
        };
        let app = router(limiter.clone(), unreachable_upstream(), settings);

        app.oneshot(get_request("/api/v1/auth/me")).await.unwrap();

        // Loopback is not in the list, so the socket peer names the bucket.
        let decision = limiter
            .check_request("/api/v1/auth/me", "127.0.0.1", chrono::Utc::now())
            .await
            .unwrap();
        assert_eq!(decision.remaining, 3);
    }

    #[tokio::test]
    async fn test_disabled_gate_passes_through() {
        let settings = GateSettings {
            enabled: false,
            ..GateSettings::default()
        };
        let app = router(limiter(1), unreachable_upstream(), settings);

        for _ in 0..3 {
            let response = app.clone().oneshot(get_request("/api/v1/auth/me")).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
            assert!(response.headers().get(X_RATELIMIT_LIMIT).is_none());
        }
    }

    #[tokio::test]
    async fn test_serve_with_shutdown() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let app = router(limiter(5), unreachable_upstream(), GateSettings::default());
        let server = HttpServer::new(addr, app);

        let result = server.serve_with_shutdown(async {}).await;
        assert!(result.is_ok());
    }
}
