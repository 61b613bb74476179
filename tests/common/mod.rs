//! Common test utilities for E2E tests

use std::sync::Arc;
use std::time::Duration;

use fedibridge::config::{self, SubtypeRouteConfig};
use fedibridge::federation::{EntityKind, LocalEntityRef};
use fedibridge::host::{HandlerRegistry, LoggingHandler, MemoryDirectory};
use fedibridge::AppState;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Test server instance with its own key, queue database and workers.
pub struct TestServer {
    pub addr: String,
    /// `host:port`, which is also the server's federation domain
    pub domain: String,
    pub state: AppState,
    pub received: Arc<LoggingHandler>,
    pub client: reqwest::Client,
    shutdown: watch::Sender<bool>,
    _temp_dir: TempDir,
}

impl TestServer {
    /// Start a server on a random local port.
    ///
    /// Each server hosts the actor `/authors/alice` and the object
    /// `/posts/1`.
    pub async fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();

        // Bind first: the port is part of the server's identity
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = listener.local_addr().unwrap();
        let domain = local_addr.to_string();

        let config = test_config(&temp_dir, &domain, local_addr.port());

        let directory = Arc::new(MemoryDirectory::new());
        directory
            .insert_actor(
                "alice",
                LocalEntityRef::actor("author", "alice"),
                serde_json::json!({
                    "type": "Person",
                    "preferredUsername": "alice",
                    "name": "Alice",
                }),
            )
            .await;
        directory
            .insert(
                LocalEntityRef::object("post", "1"),
                serde_json::json!({
                    "type": "Note",
                    "content": "First post",
                    "attributedTo": format!("http://{}/authors/alice", domain),
                }),
            )
            .await;

        let received = Arc::new(LoggingHandler::new());
        let handlers = HandlerRegistry::new().with_fallback(received.clone());

        let state = AppState::new(config, directory, handlers).await.unwrap();

        let (shutdown, shutdown_rx) = watch::channel(false);
        state.pipeline.spawn_workers(shutdown_rx);

        let app = fedibridge::build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap();

        Self {
            addr: format!("http://{}", domain),
            domain,
            state,
            received,
            client,
            shutdown,
            _temp_dir: temp_dir,
        }
    }

    /// Get absolute URL for a path
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// Wait until at least `count` activities reached the host handler.
    pub async fn wait_for_received(&self, count: usize) -> bool {
        for _ in 0..250 {
            if self.received.recent().len() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

fn test_config(temp_dir: &TempDir, domain: &str, port: u16) -> config::AppConfig {
    config::AppConfig {
        server: config::ServerConfig {
            host: "127.0.0.1".to_string(),
            port,
            domain: domain.to_string(),
            protocol: "http".to_string(),
        },
        database: config::DatabaseConfig {
            path: temp_dir.path().join("queue.db"),
        },
        federation: config::FederationConfig {
            instance_actor_username: "instance".to_string(),
            private_key_path: temp_dir.path().join("instance-key.pem"),
            key_bits: 1024,
            activity_path: "activities".to_string(),
            searchable: vec![SubtypeRouteConfig {
                segment: "posts".to_string(),
                subtype: "post".to_string(),
                kind: EntityKind::Object,
            }],
            slugs: vec![SubtypeRouteConfig {
                segment: "authors".to_string(),
                subtype: "author".to_string(),
                kind: EntityKind::Actor,
            }],
            allow_private_hosts: true,
            defer_inbound_verification: false,
            authorized_fetch: true,
        },
        signature: config::SignatureConfig::default(),
        delivery: config::DeliveryConfig {
            workers: 2,
            max_attempts: 3,
            base_backoff_ms: 50,
            max_backoff_secs: 1,
            request_timeout_secs: 5,
            poll_interval_ms: 20,
        },
        cache: config::CacheConfig {
            actor_ttl_secs: 3600,
            keyless_ttl_secs: 300,
            negative_ttl_secs: 1,
        },
        logging: config::LoggingConfig {
            level: "info".to_string(),
            format: "pretty".to_string(),
        },
    }
}
