//! Configuration management for Rategate.
//!
//! Sources, lowest precedence first: built-in defaults, an optional YAML
//! file, `RATEGATE__SECTION__KEY` environment variables, and the platform's
//! legacy `REDIS_*` variables.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::error::{RateGateError, Result};
use crate::ratelimit::{Classification, Classifier, LimiterOptions, RateLimitRule, RuleTable};

/// Prefix for environment overrides, e.g. `RATEGATE__STORE__HOST`.
pub const ENV_PREFIX: &str = "RATEGATE";

/// Main configuration for the Rategate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateGateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limits: RateLimitingConfig,

    /// Shared store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Base URL of the platform backend admitted requests are forwarded to
    #[serde(default = "default_upstream_url")]
    pub upstream_url: String,

    /// Upstream request timeout in seconds
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout_secs: u64,

    /// Largest request body forwarded upstream, in megabytes
    #[serde(default = "default_max_request_size")]
    pub max_request_size_mb: u64,

    /// Peers whose `X-Forwarded-For`/`X-Real-IP` headers identify the client.
    /// Requests from anyone else are keyed by their socket address.
    #[serde(default = "default_trusted_proxies")]
    pub trusted_proxies: Vec<IpAddr>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            upstream_url: default_upstream_url(),
            upstream_timeout_secs: default_upstream_timeout(),
            max_request_size_mb: default_max_request_size(),
            trusted_proxies: default_trusted_proxies(),
        }
    }
}

impl ServerConfig {
    pub fn max_request_bytes(&self) -> usize {
        usize::try_from(self.max_request_size_mb.saturating_mul(1024 * 1024)).unwrap_or(usize::MAX)
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_upstream_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_upstream_timeout() -> u64 {
    30
}

fn default_max_request_size() -> u64 {
    10
}

fn default_trusted_proxies() -> Vec<IpAddr> {
    vec![IpAddr::V4(Ipv4Addr::LOCALHOST), IpAddr::V6(Ipv6Addr::LOCALHOST)]
}

fn default_true() -> bool {
    true
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Disable to pass every request straight through
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Classification for paths that match no pattern
    #[serde(default = "default_classification")]
    pub default_classification: Classification,

    /// Classification name to rule
    #[serde(default = "default_rules")]
    pub rules: BTreeMap<String, RateLimitRule>,

    /// Bound on one shared store call in the request path
    #[serde(default = "default_store_timeout")]
    pub store_timeout_ms: u64,

    /// While degraded, probe the shared store at most this often
    #[serde(default = "default_reprobe_interval")]
    pub reprobe_interval_ms: u64,

    /// Fallback store sweep interval in seconds
    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_classification: default_classification(),
            rules: default_rules(),
            store_timeout_ms: default_store_timeout(),
            reprobe_interval_ms: default_reprobe_interval(),
            purge_interval_secs: default_purge_interval(),
        }
    }
}

fn default_classification() -> Classification {
    Classification::Api
}

fn default_rules() -> BTreeMap<String, RateLimitRule> {
    RuleTable::default()
        .iter()
        .map(|(classification, rule)| (classification.to_string(), *rule))
        .collect()
}

fn default_store_timeout() -> u64 {
    100
}

fn default_reprobe_interval() -> u64 {
    1000
}

fn default_purge_interval() -> u64 {
    60
}

/// Shared store connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Count in the shared store; when false the limiter is process-local
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_store_host")]
    pub host: String,

    #[serde(default = "default_store_port")]
    pub port: u16,

    #[serde(default)]
    pub db: i64,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Connect with TLS (`rediss://`)
    #[serde(default)]
    pub tls: bool,

    /// Connect and probe timeout in milliseconds
    #[serde(default = "default_store_connect_timeout")]
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_store_host(),
            port: default_store_port(),
            db: 0,
            username: None,
            password: None,
            tls: false,
            timeout_ms: default_store_connect_timeout(),
        }
    }
}

fn default_store_host() -> String {
    "localhost".to_string()
}

fn default_store_port() -> u16 {
    6379
}

fn default_store_connect_timeout() -> u64 {
    5000
}

impl StoreConfig {
    /// Connection URL including credentials.
    pub fn url(&self) -> Result<Url> {
        let scheme = if self.tls { "rediss" } else { "redis" };
        let mut url = Url::parse(&format!("{}://{}:{}/{}", scheme, self.host, self.port, self.db))
            .map_err(|e| RateGateError::Config(format!("invalid store address: {}", e)))?;

        if let Some(username) = &self.username {
            url.set_username(username)
                .map_err(|_| RateGateError::Config("store username not accepted".to_string()))?;
        }
        if let Some(password) = &self.password {
            url.set_password(Some(password))
                .map_err(|_| RateGateError::Config("store password not accepted".to_string()))?;
        }

        Ok(url)
    }

    /// Connection URL safe to log.
    pub fn redacted_url(&self) -> String {
        match self.url() {
            Ok(mut url) => {
                if url.password().is_some() {
                    let _ = url.set_password(Some("***"));
                }
                url.to_string()
            }
            Err(_) => "invalid_url".to_string(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl RateGateConfig {
    /// Load layered configuration from defaults, `path` and the process
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, std::env::vars().collect())
    }

    /// Load layered configuration with an explicit environment.
    pub fn load_with_env(path: Option<&Path>, env: HashMap<String, String>) -> Result<Self> {
        let defaults = serde_yaml::to_string(&RateGateConfig::default())
            .map_err(|e| RateGateError::Config(e.to_string()))?;

        let mut builder = config::Config::builder()
            .add_source(config::File::from_str(&defaults, config::FileFormat::Yaml));

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }

        builder = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("server.trusted_proxies")
                    .source(Some(env.clone())),
            )
            .set_override_option("store.host", env.get("REDIS_HOST").cloned())?
            .set_override_option("store.port", legacy_parse::<i64>(&env, "REDIS_PORT")?)?
            .set_override_option("store.db", legacy_parse::<i64>(&env, "REDIS_DB")?)?
            .set_override_option("store.password", env.get("REDIS_PASSWORD").cloned())?
            .set_override_option("store.tls", legacy_parse::<bool>(&env, "REDIS_SSL")?)?;

        let config: RateGateConfig = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Build the rule table, rejecting unknown classification names.
    pub fn rule_table(&self) -> Result<RuleTable> {
        let mut table = RuleTable::new();
        for (name, rule) in &self.rate_limits.rules {
            table.insert(name.parse()?, *rule);
        }
        Ok(table)
    }

    pub fn classifier(&self) -> Classifier {
        Classifier::new(self.rate_limits.default_classification)
    }

    pub fn limiter_options(&self) -> LimiterOptions {
        LimiterOptions {
            store_timeout: Duration::from_millis(self.rate_limits.store_timeout_ms),
            reprobe_interval: Duration::from_millis(self.rate_limits.reprobe_interval_ms),
            probe_timeout: Duration::from_millis(self.store.timeout_ms),
        }
    }

    /// Check everything that must hold before serving traffic.
    pub fn validate(&self) -> Result<()> {
        self.rule_table()?.validate(&self.classifier())?;

        if self.rate_limits.store_timeout_ms == 0 {
            return Err(RateGateError::Config(
                "rate_limits.store_timeout_ms must be positive".to_string(),
            ));
        }
        if self.rate_limits.purge_interval_secs == 0 {
            return Err(RateGateError::Config(
                "rate_limits.purge_interval_secs must be positive".to_string(),
            ));
        }
        Url::parse(&self.server.upstream_url)
            .map_err(|e| RateGateError::Config(format!("invalid upstream_url: {}", e)))?;
        if self.store.enabled {
            self.store.url()?;
        }
        Ok(())
    }
}

/// Parse a legacy variable; present but malformed is an error.
fn legacy_parse<T: std::str::FromStr>(env: &HashMap<String, String>, key: &str) -> Result<Option<T>> {
    match env.get(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .to_ascii_lowercase()
            .parse()
            .map(Some)
            .map_err(|_| RateGateError::Config(format!("invalid value for {}: '{}'", key, raw))),
    }
}
