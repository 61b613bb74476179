//! Remote actor caching
//!
//! Caches fetched actor documents (inbox, public key) to reduce remote
//! requests. Entries carry their own expiry; failed fetches are cached
//! briefly so a dead server is not hammered.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use http::{HeaderMap, HeaderValue};
use tokio::sync::{Mutex, RwLock};

use super::http::HttpClient;
use super::identity::CanonicalUrl;
use super::signature::{LocalKey, SignatureCodec, is_usable_public_key};
use crate::config::CacheConfig;
use crate::error::AppError;
use crate::metrics::{CACHE_HITS_TOTAL, CACHE_MISSES_TOTAL, CACHE_SIZE};

const CACHE_NAME: &str = "actor";

pub const ACTOR_ACCEPT: &str = "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

/// A remote actor as far as federation needs to know it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteActor {
    pub canonical_url: CanonicalUrl,
    pub public_key_id: Option<String>,
    pub public_key_pem: Option<String>,
    pub inbox_url: CanonicalUrl,
    pub shared_inbox_url: Option<CanonicalUrl>,
    pub outbox_url: Option<CanonicalUrl>,
    pub fetched_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl RemoteActor {
    /// Whether the actor publishes a key we can verify with.
    pub fn is_keyed(&self) -> bool {
        self.public_key_pem.is_some()
    }
}

/// TTLs for the three kinds of entries
#[derive(Debug, Clone, Copy)]
pub struct CacheTtls {
    pub keyed: Duration,
    pub keyless: Duration,
    pub negative: Duration,
}

impl From<&CacheConfig> for CacheTtls {
    fn from(config: &CacheConfig) -> Self {
        Self {
            keyed: Duration::from_secs(config.actor_ttl_secs),
            keyless: Duration::from_secs(config.keyless_ttl_secs),
            negative: Duration::from_secs(config.negative_ttl_secs),
        }
    }
}

#[derive(Debug, Clone)]
enum EntryValue {
    Actor(Arc<RemoteActor>),
    Failed(String),
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: EntryValue,
    expires: Instant,
}

impl CacheEntry {
    fn is_valid(&self) -> bool {
        Instant::now() < self.expires
    }

    fn to_result(&self) -> Result<Arc<RemoteActor>, AppError> {
        match &self.value {
            EntryValue::Actor(actor) => Ok(actor.clone()),
            EntryValue::Failed(reason) => Err(AppError::ActorFetch(reason.clone())),
        }
    }
}

/// Signs outgoing actor fetches with the local key
#[derive(Debug, Clone)]
struct FetchSigner {
    codec: SignatureCodec,
    key: Arc<LocalKey>,
}

/// Remote actor cache
///
/// Reads of fresh entries take only the read lock. Misses for the same
/// URL are funnelled through a per-URL gate so concurrent callers share a
/// single fetch.
pub struct ActorCache {
    entries: RwLock<HashMap<CanonicalUrl, CacheEntry>>,
    in_flight: Mutex<HashMap<CanonicalUrl, Arc<Mutex<()>>>>,
    http: Arc<dyn HttpClient>,
    ttls: CacheTtls,
    signer: Option<FetchSigner>,
}

impl ActorCache {
    pub fn new(http: Arc<dyn HttpClient>, ttls: CacheTtls) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            http,
            ttls,
            signer: None,
        }
    }

    /// Sign every actor fetch ("authorized fetch" servers require it).
    pub fn with_signer(mut self, codec: SignatureCodec, key: Arc<LocalKey>) -> Self {
        self.signer = Some(FetchSigner { codec, key });
        self
    }

    /// Get an actor, fetching it when missing or expired.
    ///
    /// # Errors
    /// `ActorFetch` when the document cannot be fetched or is invalid,
    /// including negatively cached failures.
    pub async fn get(&self, url: &CanonicalUrl) -> Result<Arc<RemoteActor>, AppError> {
        if let Some(entry) = self.lookup(url).await {
            CACHE_HITS_TOTAL.with_label_values(&[CACHE_NAME]).inc();
            return entry.to_result();
        }

        let gate = {
            let mut in_flight = self.in_flight.lock().await;
            in_flight.entry(url.clone()).or_default().clone()
        };
        let _guard = gate.lock().await;

        // Another caller may have filled the entry while we waited.
        if let Some(entry) = self.lookup(url).await {
            CACHE_HITS_TOTAL.with_label_values(&[CACHE_NAME]).inc();
            return entry.to_result();
        }

        CACHE_MISSES_TOTAL.with_label_values(&[CACHE_NAME]).inc();
        tracing::debug!(actor = %url, "Actor cache miss, fetching");

        let entry = match self.fetch(url).await {
            Ok(actor) => {
                let ttl = if actor.is_keyed() {
                    self.ttls.keyed
                } else {
                    self.ttls.keyless
                };
                CacheEntry {
                    value: EntryValue::Actor(Arc::new(actor)),
                    expires: Instant::now() + ttl,
                }
            }
            Err(e) => {
                tracing::warn!(actor = %url, error = %e, "Actor fetch failed");
                CacheEntry {
                    value: EntryValue::Failed(e.to_string()),
                    expires: Instant::now() + self.ttls.negative,
                }
            }
        };

        let result = entry.to_result();
        {
            let mut entries = self.entries.write().await;
            entries.insert(url.clone(), entry);
            CACHE_SIZE
                .with_label_values(&[CACHE_NAME])
                .set(entries.len() as i64);
        }
        self.in_flight.lock().await.remove(url);

        result
    }

    /// Get the actor owning a signature `keyId` (`actor#fragment`).
    pub async fn get_for_key_id(&self, key_id: &str) -> Result<Arc<RemoteActor>, AppError> {
        let actor_url = key_id.split('#').next().unwrap_or(key_id);
        let actor_url = CanonicalUrl::parse(actor_url)
            .map_err(|e| AppError::ActorFetch(format!("Invalid keyId {:?}: {}", key_id, e)))?;
        self.get(&actor_url).await
    }

    /// Drop an entry so the next `get` refetches it.
    pub async fn evict(&self, url: &CanonicalUrl) {
        let mut entries = self.entries.write().await;
        if entries.remove(url).is_some() {
            tracing::debug!(actor = %url, "Evicted actor cache entry");
        }
        CACHE_SIZE
            .with_label_values(&[CACHE_NAME])
            .set(entries.len() as i64);
    }

    /// Prune expired entries
    ///
    /// Should be called periodically to clean up expired entries.
    pub async fn prune_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.is_valid());
        let removed = before - entries.len();
        CACHE_SIZE
            .with_label_values(&[CACHE_NAME])
            .set(entries.len() as i64);

        if removed > 0 {
            tracing::info!("Pruned {} expired actor cache entries", removed);
        }
        removed
    }

    /// Get cache statistics
    pub async fn stats(&self) -> CacheStats {
        let entries = self.entries.read().await;
        let total = entries.len();
        let valid = entries.values().filter(|entry| entry.is_valid()).count();
        let negative = entries
            .values()
            .filter(|entry| matches!(entry.value, EntryValue::Failed(_)))
            .count();

        CacheStats {
            total_entries: total,
            valid_entries: valid,
            expired_entries: total - valid,
            negative_entries: negative,
        }
    }

    async fn lookup(&self, url: &CanonicalUrl) -> Option<CacheEntry> {
        let entries = self.entries.read().await;
        entries.get(url).filter(|entry| entry.is_valid()).cloned()
    }

    async fn fetch(&self, url: &CanonicalUrl) -> Result<RemoteActor, AppError> {
        let mut headers = match &self.signer {
            Some(signer) => signer
                .codec
                .sign_outgoing("GET", url.as_str(), None, &signer.key)?,
            None => HeaderMap::new(),
        };
        headers.insert(http::header::ACCEPT, HeaderValue::from_static(ACTOR_ACCEPT));

        let response = self
            .http
            .get(url.as_str(), headers)
            .await
            .map_err(|e| AppError::ActorFetch(format!("Failed to fetch actor {}: {}", url, e)))?;

        if !response.status.is_success() {
            return Err(AppError::ActorFetch(format!(
                "Failed to fetch actor {}: HTTP {}",
                url, response.status
            )));
        }

        let document: serde_json::Value = serde_json::from_slice(&response.body)
            .map_err(|e| AppError::ActorFetch(format!("Failed to parse actor {}: {}", url, e)))?;

        let ttls = self.ttls;
        parse_actor_document(url, &document, Utc::now(), |keyed| {
            if keyed { ttls.keyed } else { ttls.keyless }
        })
    }
}

/// Validate an actor document fetched from `requested` and extract the
/// federation-relevant fields.
fn parse_actor_document(
    requested: &CanonicalUrl,
    document: &serde_json::Value,
    now: DateTime<Utc>,
    ttl_for: impl Fn(bool) -> Duration,
) -> Result<RemoteActor, AppError> {
    let invalid = |reason: &str| AppError::ActorFetch(format!("Invalid actor {}: {}", requested, reason));

    let id = document
        .get("id")
        .and_then(|id| id.as_str())
        .ok_or_else(|| invalid("missing id"))?;
    let canonical_url = CanonicalUrl::parse(id).map_err(|_| invalid("unparseable id"))?;
    if canonical_url.authority() != requested.authority() {
        return Err(invalid("id is hosted on a different server"));
    }

    let inbox_url = document
        .get("inbox")
        .and_then(|inbox| inbox.as_str())
        .ok_or_else(|| invalid("missing inbox"))
        .and_then(|inbox| CanonicalUrl::parse(inbox).map_err(|_| invalid("unparseable inbox")))?;

    let optional_url = |value: Option<&serde_json::Value>| {
        value
            .and_then(|value| value.as_str())
            .and_then(|value| CanonicalUrl::parse(value).ok())
    };
    let shared_inbox_url = optional_url(
        document
            .get("endpoints")
            .and_then(|endpoints| endpoints.get("sharedInbox")),
    );
    let outbox_url = optional_url(document.get("outbox"));

    let (public_key_id, public_key_pem) = match select_public_key(document) {
        Some((key_id, pem)) => (Some(key_id), Some(pem)),
        None => (None, None),
    };

    let ttl = ttl_for(public_key_pem.is_some());
    let expires_at = now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());

    Ok(RemoteActor {
        canonical_url,
        public_key_id,
        public_key_pem,
        inbox_url,
        shared_inbox_url,
        outbox_url,
        fetched_at: now,
        expires_at,
    })
}

/// First `publicKey` entry with a usable RSA PEM. `publicKey` may be a
/// single object or an array of them.
fn select_public_key(document: &serde_json::Value) -> Option<(String, String)> {
    let candidates: Vec<&serde_json::Value> = match document.get("publicKey")? {
        serde_json::Value::Array(keys) => keys.iter().collect(),
        key @ serde_json::Value::Object(_) => vec![key],
        _ => return None,
    };

    candidates.into_iter().find_map(|key| {
        let key_id = key.get("id")?.as_str()?;
        let pem = key.get("publicKeyPem")?.as_str()?;
        is_usable_public_key(pem).then(|| (key_id.to_string(), pem.to_string()))
    })
}

/// Cache statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    /// Total number of entries
    pub total_entries: usize,
    /// Number of valid (non-expired) entries
    pub valid_entries: usize,
    /// Number of expired entries
    pub expired_entries: usize,
    /// Entries recording a failed fetch
    pub negative_entries: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::signature::tests::test_key;
    use crate::federation::test_support::{FakeHttp, actor_document};
    use http::{Method, StatusCode};

    const BOB: &str = "https://remote.example/users/bob";

    fn ttls() -> CacheTtls {
        CacheTtls {
            keyed: Duration::from_secs(3600),
            keyless: Duration::from_secs(300),
            negative: Duration::from_secs(60),
        }
    }

    fn bob() -> CanonicalUrl {
        CanonicalUrl::parse(BOB).expect("valid url")
    }

    fn public_pem() -> String {
        test_key("k").public_key_pem().to_string()
    }

    #[tokio::test]
    async fn keyed_actor_is_cached_after_first_fetch() {
        let http = Arc::new(FakeHttp::new());
        http.on_get_json(BOB, actor_document(BOB, Some(&public_pem())));
        let cache = ActorCache::new(http.clone(), ttls());

        let first = cache.get(&bob()).await.expect("fetched");
        let second = cache.get(&bob()).await.expect("cached");

        assert!(first.is_keyed());
        assert_eq!(first.public_key_id.as_deref(), Some("https://remote.example/users/bob#main-key"));
        assert_eq!(first.inbox_url.as_str(), "https://remote.example/users/bob/inbox");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(http.calls(Method::GET, BOB), 1);

        let accept = &http.requests()[0].headers["accept"];
        assert_eq!(accept, ACTOR_ACCEPT);
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_fetch() {
        let http = Arc::new(FakeHttp::new().with_delay(Duration::from_millis(50)));
        http.on_get_json(BOB, actor_document(BOB, Some(&public_pem())));
        let cache = Arc::new(ActorCache::new(http.clone(), ttls()));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get(&bob()).await })
            })
            .collect();
        for task in tasks {
            assert!(task.await.expect("joined").is_ok());
        }

        assert_eq!(http.calls(Method::GET, BOB), 1);
    }

    #[tokio::test]
    async fn failed_fetch_is_negatively_cached() {
        let http = Arc::new(FakeHttp::new());
        http.on(Method::GET, BOB, |_| {
            Ok(crate::federation::http::HttpResponse::new(
                StatusCode::GONE,
                "",
            ))
        });
        let cache = ActorCache::new(http.clone(), ttls());

        assert!(matches!(cache.get(&bob()).await, Err(AppError::ActorFetch(_))));
        assert!(matches!(cache.get(&bob()).await, Err(AppError::ActorFetch(_))));
        assert_eq!(http.calls(Method::GET, BOB), 1);
        assert_eq!(cache.stats().await.negative_entries, 1);
    }

    #[tokio::test]
    async fn actor_without_usable_key_gets_short_lived_entry() {
        let http = Arc::new(FakeHttp::new());
        let mut document = actor_document(BOB, Some("-----BEGIN PUBLIC KEY-----\ngarbage\n-----END PUBLIC KEY-----"));
        document["endpoints"] = serde_json::json!({"sharedInbox": "https://remote.example/inbox"});
        http.on_get_json(BOB, document);

        let cache = ActorCache::new(
            http.clone(),
            CacheTtls {
                keyless: Duration::ZERO,
                ..ttls()
            },
        );

        let actor = cache.get(&bob()).await.expect("fetched");
        assert!(!actor.is_keyed());
        assert_eq!(
            actor.shared_inbox_url.as_ref().map(CanonicalUrl::as_str),
            Some("https://remote.example/inbox")
        );

        cache.get(&bob()).await.expect("refetched");
        assert_eq!(http.calls(Method::GET, BOB), 2);
    }

    #[tokio::test]
    async fn public_key_array_is_accepted() {
        let http = Arc::new(FakeHttp::new());
        let mut document = actor_document(BOB, None);
        document["publicKey"] = serde_json::json!([
            {"id": format!("{}#broken", BOB), "publicKeyPem": "nope"},
            {"id": format!("{}#main-key", BOB), "publicKeyPem": public_pem()},
        ]);
        http.on_get_json(BOB, document);
        let cache = ActorCache::new(http, ttls());

        let actor = cache.get(&bob()).await.expect("fetched");
        assert_eq!(actor.public_key_id.as_deref(), Some("https://remote.example/users/bob#main-key"));
    }

    #[tokio::test]
    async fn cross_host_id_and_missing_inbox_are_rejected() {
        let http = Arc::new(FakeHttp::new());
        http.on_get_json(BOB, actor_document("https://evil.example/users/bob", Some(&public_pem())));
        let cache = ActorCache::new(http, ttls());
        assert!(matches!(cache.get(&bob()).await, Err(AppError::ActorFetch(_))));

        let http = Arc::new(FakeHttp::new());
        let mut document = actor_document(BOB, Some(&public_pem()));
        document.as_object_mut().expect("object").remove("inbox");
        http.on_get_json(BOB, document);
        let cache = ActorCache::new(http, ttls());
        assert!(matches!(cache.get(&bob()).await, Err(AppError::ActorFetch(_))));
    }

    #[tokio::test]
    async fn evict_forces_refetch_and_key_id_lookup_strips_fragment() {
        let http = Arc::new(FakeHttp::new());
        http.on_get_json(BOB, actor_document(BOB, Some(&public_pem())));
        let cache = ActorCache::new(http.clone(), ttls());

        cache
            .get_for_key_id("https://remote.example/users/bob#main-key")
            .await
            .expect("fetched");
        cache.evict(&bob()).await;
        cache.get(&bob()).await.expect("refetched");

        assert_eq!(http.calls(Method::GET, BOB), 2);
    }

    #[tokio::test]
    async fn prune_removes_only_expired_entries() {
        let http = Arc::new(FakeHttp::new());
        http.on_get_json(BOB, actor_document(BOB, None));
        let alice = "https://remote.example/users/alice";
        http.on_get_json(alice, actor_document(alice, Some(&public_pem())));
        let cache = ActorCache::new(
            http,
            CacheTtls {
                keyless: Duration::ZERO,
                ..ttls()
            },
        );

        cache.get(&bob()).await.expect("keyless");
        cache
            .get(&CanonicalUrl::parse(alice).expect("url"))
            .await
            .expect("keyed");

        let stats = cache.stats().await;
        assert_eq!(stats.total_entries, 2);
        assert_eq!(stats.expired_entries, 1);
        assert_eq!(cache.prune_expired().await, 1);
        assert_eq!(cache.stats().await.total_entries, 1);
    }

    #[tokio::test]
    async fn signed_fetch_carries_signature_header() {
        let http = Arc::new(FakeHttp::new());
        http.on_get_json(BOB, actor_document(BOB, Some(&public_pem())));
        let key = Arc::new(test_key("https://local.example/actor#main-key"));
        let cache = ActorCache::new(http.clone(), ttls()).with_signer(SignatureCodec::default(), key);

        cache.get(&bob()).await.expect("fetched");
        let request = &http.requests()[0];
        assert!(request.headers.contains_key("signature"));
        assert_eq!(request.headers["host"], "remote.example");
    }
}
