//! HTTP surface: the rate limiting stage, the upstream proxy and the server.

mod middleware;
mod proxy;
mod response;
mod server;

pub use middleware::{client_identifier, rate_limit, RateLimitState};
pub use proxy::{forward, Upstream};
pub use response::{
    apply_rate_limit_headers, ApiError, ErrorBody, ErrorEnvelope, X_RATELIMIT_LIMIT,
    X_RATELIMIT_REMAINING, X_RATELIMIT_RESET,
};
pub use server::{router, GateSettings, HealthReport, HttpServer, HEALTH_PATH};
