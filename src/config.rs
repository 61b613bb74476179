//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration files (config/default.toml, config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::{net::IpAddr, path::PathBuf, time::Duration};

use crate::federation::EntityKind;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub federation: FederationConfig,
    #[serde(default)]
    pub signature: SignatureConfig,
    pub delivery: DeliveryConfig,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "blog.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://blog.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }
}

/// Activity queue database (SQLite)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// A content subtype exposed under a path segment, e.g. `posts` → `post`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SubtypeRouteConfig {
    /// Path segment right after the base URL (no slashes)
    pub segment: String,
    /// Host-side subtype name
    pub subtype: String,
    /// Whether entities under this segment are actors or objects
    #[serde(default = "default_route_kind")]
    pub kind: EntityKind,
}

fn default_route_kind() -> EntityKind {
    EntityKind::Object
}

/// Federation behaviour and local identity
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Preferred username of the instance actor served at `/actor`
    pub instance_actor_username: String,
    /// PEM file holding the instance actor's RSA private key.
    /// Generated on first start when missing.
    pub private_key_path: PathBuf,
    /// RSA modulus size used when generating a key
    pub key_bits: usize,
    /// Path segment of the dedicated activity-object template
    pub activity_path: String,
    /// Subtypes flagged as searchable by the host (matched first)
    #[serde(default)]
    pub searchable: Vec<SubtypeRouteConfig>,
    /// Admin-configured slug list (matched after `searchable`)
    #[serde(default)]
    pub slugs: Vec<SubtypeRouteConfig>,
    /// Allow fetching/delivering to loopback and private addresses
    pub allow_private_hosts: bool,
    /// Accept inbound activities first and verify them inside the workers
    pub defer_inbound_verification: bool,
    /// Sign outgoing actor fetches with the instance key
    pub authorized_fetch: bool,
}

impl FederationConfig {
    /// Searchable subtypes followed by the admin slug list, in match order.
    pub fn subtype_routes(&self) -> Vec<SubtypeRouteConfig> {
        self.searchable
            .iter()
            .chain(self.slugs.iter())
            .cloned()
            .collect()
    }
}

/// HTTP signature parameters
#[derive(Debug, Clone, Deserialize)]
pub struct SignatureConfig {
    /// Header list assumed when a Signature omits `headers`
    #[serde(default = "default_signature_headers")]
    pub default_headers: Vec<String>,
    /// Allowed distance between the Date header and local time
    #[serde(default = "default_max_clock_skew_secs")]
    pub max_clock_skew_secs: u64,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            default_headers: default_signature_headers(),
            max_clock_skew_secs: default_max_clock_skew_secs(),
        }
    }
}

fn default_signature_headers() -> Vec<String> {
    vec!["date".to_string()]
}

fn default_max_clock_skew_secs() -> u64 {
    300
}

/// Delivery pipeline tuning
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Number of concurrent delivery workers
    pub workers: usize,
    /// Attempts per (activity, target) before abandoning
    pub max_attempts: u32,
    /// Backoff after the first failed attempt
    pub base_backoff_ms: u64,
    /// Upper bound for the backoff delay (before jitter)
    pub max_backoff_secs: u64,
    /// Per-request timeout for outbound HTTP
    pub request_timeout_secs: u64,
    /// Idle worker poll interval
    pub poll_interval_ms: u64,
}

impl DeliveryConfig {
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Remote actor cache TTLs
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// TTL for actors with a usable public key (default: 3600)
    pub actor_ttl_secs: u64,
    /// TTL for actors fetched without a usable key (default: 300)
    pub keyless_ttl_secs: u64,
    /// TTL for failed fetches (default: 60)
    pub negative_ttl_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (FEDIBRIDGE__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.protocol", "http")?
            .set_default("database.path", "data/fedibridge.db")?
            .set_default("federation.instance_actor_username", "instance")?
            .set_default("federation.private_key_path", "data/instance-key.pem")?
            .set_default("federation.key_bits", 4096)?
            .set_default("federation.activity_path", "activities")?
            .set_default("federation.allow_private_hosts", false)?
            .set_default("federation.defer_inbound_verification", false)?
            .set_default("federation.authorized_fetch", true)?
            .set_default("delivery.workers", 10)?
            .set_default("delivery.max_attempts", 8)?
            .set_default("delivery.base_backoff_ms", 30_000)?
            .set_default("delivery.max_backoff_secs", 6 * 3600)?
            .set_default("delivery.request_timeout_secs", 30)?
            .set_default("delivery.poll_interval_ms", 1_000)?
            .set_default("cache.actor_ttl_secs", 3600)?
            .set_default("cache.keyless_ttl_secs", 300)?
            .set_default("cache.negative_ttl_secs", 60)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("FEDIBRIDGE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    pub(crate) fn validate(&self) -> Result<(), crate::error::AppError> {
        use crate::error::AppError;

        if !self.server.protocol.eq_ignore_ascii_case("https")
            && !is_local_server_domain(&self.server.domain)
        {
            return Err(AppError::Config(
                "server.protocol must be https for non-local server domains".to_string(),
            ));
        }

        if self.delivery.workers == 0 {
            return Err(AppError::Config(
                "delivery.workers must be greater than 0".to_string(),
            ));
        }

        if self.delivery.max_attempts == 0 {
            return Err(AppError::Config(
                "delivery.max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.federation.activity_path.trim_matches('/').is_empty() {
            return Err(AppError::Config(
                "federation.activity_path must not be empty".to_string(),
            ));
        }

        for route in self.federation.subtype_routes() {
            if route.segment.trim_matches('/').is_empty() || route.subtype.is_empty() {
                return Err(AppError::Config(format!(
                    "invalid subtype route: segment={:?} subtype={:?}",
                    route.segment, route.subtype
                )));
            }
        }

        if self.signature.default_headers.is_empty() {
            return Err(AppError::Config(
                "signature.default_headers must name at least one header".to_string(),
            ));
        }

        if self.federation.allow_private_hosts {
            tracing::warn!("Private and loopback federation targets are allowed");
        }

        Ok(())
    }
}

fn normalized_server_host(domain: &str) -> String {
    let trimmed = domain.trim();
    let parsed_host = url::Url::parse(&format!("http://{trimmed}"))
        .ok()
        .and_then(|url| url.host_str().map(|host| host.to_string()));
    let host = parsed_host.unwrap_or_else(|| trimmed.to_string());
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn is_local_server_domain(domain: &str) -> bool {
    let host = normalized_server_host(domain);
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }

    if let Ok(ip) = host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
        return ip.is_loopback() || ip.is_unspecified();
    }

    false
}
