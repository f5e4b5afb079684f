//! Forwarding of admitted requests to the platform backend.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::header::{self, HeaderMap, HeaderName};
use axum::response::{IntoResponse, Response};
use reqwest::Client;
use tracing::{debug, warn};
use url::Url;

use super::response::ApiError;
use crate::config::ServerConfig;
use crate::error::{RateGateError, Result};

/// Headers that describe a single connection and must not be forwarded.
const HOP_BY_HOP: [HeaderName; 9] = [
    header::CONNECTION,
    header::HOST,
    header::CONTENT_LENGTH,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// The backend admitted requests are forwarded to.
#[derive(Debug, Clone)]
pub struct Upstream {
    client: Client,
    base_url: String,
    max_body_bytes: usize,
}

impl Upstream {
    pub fn new(base_url: &str, timeout: Duration, max_body_bytes: usize) -> Result<Self> {
        let parsed = Url::parse(base_url)
            .map_err(|e| RateGateError::Config(format!("Invalid upstream url {base_url}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(RateGateError::Config(format!(
                "Upstream url must be http or https, got {}",
                parsed.scheme()
            )));
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RateGateError::Http(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_body_bytes,
        })
    }

    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        Self::new(
            &config.upstream_url,
            Duration::from_secs(config.upstream_timeout_secs),
            config.max_request_bytes(),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Send `request` upstream and relay the reply.
    pub async fn forward(&self, request: Request) -> std::result::Result<Response, ApiError> {
        let (parts, body) = request.into_parts();

        let declared = parts
            .headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());
        if declared.is_some_and(|len| len > self.max_body_bytes) {
            return Err(ApiError::PayloadTooLarge {
                limit_bytes: self.max_body_bytes,
            });
        }

        let body = to_bytes(body, self.max_body_bytes)
            .await
            .map_err(|_| ApiError::PayloadTooLarge {
                limit_bytes: self.max_body_bytes,
            })?;

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let target = format!("{}{}", self.base_url, path_and_query);

        debug!(method = %parts.method, target = %target, "Forwarding request");

        let reply = self
            .client
            .request(parts.method, &target)
            .headers(strip_hop_by_hop(parts.headers))
            .body(body)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, target = %target, "Upstream request failed");
                ApiError::Upstream(e.to_string())
            })?;

        let status = reply.status();
        let headers = strip_hop_by_hop(reply.headers().clone());
        let bytes = reply.bytes().await.map_err(|e| {
            warn!(error = %e, target = %target, "Upstream response body failed");
            ApiError::Upstream(e.to_string())
        })?;

        let mut response = Response::new(Body::from(bytes));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

fn strip_hop_by_hop(mut headers: HeaderMap) -> HeaderMap {
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove("keep-alive");
    headers
}

/// Fallback handler relaying everything the router does not serve itself.
pub async fn forward(State(upstream): State<Arc<Upstream>>, request: Request) -> Response {
    match upstream.forward(request).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{StatusCode, Uri};
    use axum::routing::{get, post};
    use axum::Router;
    use tower::ServiceExt;

    async fn spawn_backend() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let app = Router::new()
            .route(
                "/api/v1/athletes",
                post(|body: String| async move { (StatusCode::CREATED, body) }),
            )
            .route(
                "/api/v1/search",
                get(|uri: Uri| async move { uri.query().unwrap_or_default().to_string() }),
            );

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn gateway(upstream: Upstream) -> Router {
        Router::new().fallback(forward).with_state(Arc::new(upstream))
    }

    #[test]
    fn test_rejects_bad_upstream_url() {
        assert!(Upstream::new("not a url", Duration::from_secs(1), 1024).is_err());
        assert!(Upstream::new("ftp://files.local", Duration::from_secs(1), 1024).is_err());

        let upstream = Upstream::new("http://backend:8000/", Duration::from_secs(1), 1024).unwrap();
        assert_eq!(upstream.base_url(), "http://backend:8000");
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, "keep-alive".parse().unwrap());
        headers.insert("keep-alive", "timeout=5".parse().unwrap());
        headers.insert(header::AUTHORIZATION, "Bearer abc".parse().unwrap());

        let headers = strip_hop_by_hop(headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key(header::AUTHORIZATION));
    }

    #[tokio::test]
    async fn test_forwards_method_body_and_status() {
        let base = spawn_backend().await;
        let app = gateway(Upstream::new(&base, Duration::from_secs(5), 1024).unwrap());

        let request = axum::http::Request::post("/api/v1/athletes")
            .body(Body::from("sprinter"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"sprinter");
    }

    #[tokio::test]
    async fn test_forwards_query_string() {
        let base = spawn_backend().await;
        let app = gateway(Upstream::new(&base, Duration::from_secs(5), 1024).unwrap());

        let request = axum::http::Request::get("/api/v1/search?q=sprint&page=2")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"q=sprint&page=2");
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let app = gateway(Upstream::new("http://127.0.0.1:1", Duration::from_secs(1), 4).unwrap());

        let request = axum::http::Request::post("/api/v1/athletes")
            .body(Body::from("far too long"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_bad_gateway() {
        let app = gateway(Upstream::new("http://127.0.0.1:1", Duration::from_secs(1), 1024).unwrap());

        let request = axum::http::Request::get("/api/v1/athletes")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"]["code"], "UPSTREAM_UNAVAILABLE");
    }
}
