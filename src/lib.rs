//! fedibridge - ActivityPub federation for a local content host
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - Inboxes, content negotiation, instance actor             │
//! │  - WebFinger, health, metrics                               │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Federation Layer                          │
//! │  - Identity, signatures, discovery, actor cache             │
//! │  - Delivery pipeline and workers                            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │               Host + Activity Store                          │
//! │  - EntityDirectory / ActivityHandler (host side)            │
//! │  - SQLite queue (sqlx)                                      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers
//! - `federation`: ActivityPub federation handling
//! - `host`: Traits the host application implements
//! - `config`: Configuration management
//! - `error`: Error types
//! - `metrics`: Prometheus metrics

pub mod api;
pub mod config;
pub mod error;
pub mod federation;
pub mod host;
pub mod metrics;

use std::path::Path;
use std::sync::Arc;

use federation::{
    ActivityStore, ActorCache, CacheTtls, DeliveryPipeline, DiscoveryClient, HttpClient,
    IdentityResolver, LocalKey, MentionAddresser, PipelineParts, ProtocolRouter, ReqwestClient,
    SignatureCodec, local_key_id,
};
use host::{EntityDirectory, HandlerRegistry};

/// Path of the instance actor below the base URL
pub const INSTANCE_ACTOR_PATH: &str = "/actor";

/// Application state shared across all handlers
///
/// Cloned for each request; everything heavy sits behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<config::AppConfig>,
    pub identity: IdentityResolver,
    /// Host-side lookup of local entities
    pub directory: Arc<dyn EntityDirectory>,
    pub pipeline: Arc<DeliveryPipeline>,
    pub discovery: DiscoveryClient,
    pub addresser: Arc<MentionAddresser>,
    pub actors: Arc<ActorCache>,
    /// Instance keypair, shared by all local actors
    pub key: Arc<LocalKey>,
    pub router: ProtocolRouter,
}

impl AppState {
    /// Initialize application state with the production HTTP client.
    ///
    /// # Errors
    /// Returns error if the key cannot be loaded, the store cannot be
    /// opened or the configuration is inconsistent
    pub async fn new(
        config: config::AppConfig,
        directory: Arc<dyn EntityDirectory>,
        handlers: HandlerRegistry,
    ) -> Result<Self, error::AppError> {
        let http = Arc::new(ReqwestClient::new(
            config.delivery.request_timeout(),
            config.federation.allow_private_hosts,
        )?);
        Self::with_http_client(config, directory, handlers, http).await
    }

    /// Initialize application state over any [`HttpClient`].
    pub async fn with_http_client(
        config: config::AppConfig,
        directory: Arc<dyn EntityDirectory>,
        handlers: HandlerRegistry,
        http: Arc<dyn HttpClient>,
    ) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        let identity = IdentityResolver::from_config(&config)?;
        let instance_actor_url = instance_actor_url(&config);

        // 1. Instance key
        let pem = load_or_generate_key(
            &config.federation.private_key_path,
            config.federation.key_bits,
        )
        .await?;
        let key = Arc::new(LocalKey::from_pem(local_key_id(&instance_actor_url), &pem)?);
        tracing::info!(key_id = %key.key_id(), "Instance key loaded");

        // 2. Remote actor cache
        let codec = SignatureCodec::from_config(&config.signature);
        let mut actors = ActorCache::new(http.clone(), CacheTtls::from(&config.cache));
        if config.federation.authorized_fetch {
            actors = actors.with_signer(codec.clone(), key.clone());
        }
        let actors = Arc::new(actors);

        // 3. Activity store and delivery pipeline
        let store = ActivityStore::connect(&config.database.path).await?;
        let pipeline = DeliveryPipeline::new(
            PipelineParts {
                store,
                http: http.clone(),
                actors: actors.clone(),
                codec,
                instance_key: key.clone(),
                instance_actor_url,
                identity: identity.clone(),
                handlers,
                defer_verification: config.federation.defer_inbound_verification,
            },
            &config.delivery,
        );

        // 4. Discovery
        let discovery = DiscoveryClient::new(http, config.server.protocol.clone());
        let addresser = MentionAddresser::new(
            discovery.clone(),
            identity.clone(),
            config.server.domain.clone(),
        );

        tracing::info!("Application state initialized successfully");

        Ok(Self {
            config: Arc::new(config),
            identity,
            directory,
            pipeline: Arc::new(pipeline),
            discovery,
            addresser: Arc::new(addresser),
            actors,
            key,
            router: ProtocolRouter,
        })
    }

    pub fn instance_actor_url(&self) -> String {
        instance_actor_url(&self.config)
    }
}

fn instance_actor_url(config: &config::AppConfig) -> String {
    format!("{}{}", config.server.base_url(), INSTANCE_ACTOR_PATH)
}

/// Read the instance private key, generating and saving one when the file
/// does not exist yet.
pub async fn load_or_generate_key(path: &Path, bits: usize) -> Result<String, error::AppError> {
    match tokio::fs::read_to_string(path).await {
        Ok(pem) => return Ok(pem),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(error::AppError::Config(format!(
                "Cannot read private key {}: {}",
                path.display(),
                e
            )));
        }
    }

    tracing::info!(path = %path.display(), bits, "Generating instance key");
    let pem = LocalKey::generate_pem(bits)?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| error::AppError::Internal(e.into()))?;
    }
    tokio::fs::write(path, &pem)
        .await
        .map_err(|e| error::AppError::Internal(e.into()))?;

    Ok(pem)
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::trace::TraceLayer;

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::wellknown_router())
        .merge(api::activitypub_router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
        .merge(api::metrics_router())
}

async fn health_check() -> &'static str {
    "OK"
}
