//! Inbound request authentication
//!
//! Combines [`SignatureCodec`] with the [`ActorCache`]: a request is
//! authentic when its signature verifies against the key published by
//! the activity's own actor.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use http::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

use super::actor_cache::{ActorCache, RemoteActor};
use super::signature::{
    REQUEST_TARGET, SignableRequest, SignatureCodec, check_digest, key_id_matches_actor,
    signature_header_name,
};
use crate::error::AppError;

/// Headers an inbound signature must cover regardless of what it advertises.
const REQUIRED_SIGNED_HEADERS: [&str; 3] = [REQUEST_TARGET, "host", "date"];

/// A raw inbound HTTP request, as received or as persisted for deferred
/// verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundRequest {
    pub method: String,
    /// Path and query
    pub target: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

/// Serializable form of the request metadata (body is stored separately).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredRequestMeta {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
}

impl InboundRequest {
    pub fn new(method: &str, target: &str, headers: HeaderMap, body: Vec<u8>) -> Self {
        Self {
            method: method.to_string(),
            target: target.to_string(),
            headers,
            body,
        }
    }

    pub fn signable(&self) -> SignableRequest<'_> {
        SignableRequest {
            method: &self.method,
            target: &self.target,
            headers: &self.headers,
        }
    }

    pub(crate) fn meta(&self) -> StoredRequestMeta {
        StoredRequestMeta {
            method: self.method.clone(),
            target: self.target.clone(),
            headers: self
                .headers
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|value| (name.as_str().to_string(), value.to_string()))
                })
                .collect(),
        }
    }

    pub(crate) fn from_meta(meta: StoredRequestMeta, body: Vec<u8>) -> Result<Self, AppError> {
        let mut headers = HeaderMap::new();
        for (name, value) in meta.headers {
            let name = HeaderName::try_from(name.as_str())
                .map_err(|_| AppError::Validation(format!("Invalid stored header {}", name)))?;
            let value = HeaderValue::from_str(&value)
                .map_err(|_| AppError::Validation(format!("Invalid stored value for {}", name)))?;
            headers.append(name, value);
        }
        Ok(Self {
            method: meta.method,
            target: meta.target,
            headers,
            body,
        })
    }
}

/// `actor` of an activity, as a plain id or an embedded object.
pub fn activity_actor(activity: &serde_json::Value) -> Option<&str> {
    match activity.get("actor")? {
        serde_json::Value::String(id) => Some(id),
        serde_json::Value::Object(actor) => actor.get("id")?.as_str(),
        _ => None,
    }
}

/// Authenticates inbound federation requests.
#[derive(Clone)]
pub struct RequestVerifier {
    codec: SignatureCodec,
    actors: Arc<ActorCache>,
}

impl RequestVerifier {
    pub fn new(codec: SignatureCodec, actors: Arc<ActorCache>) -> Self {
        Self { codec, actors }
    }

    /// Verify a signed activity delivery.
    ///
    /// `received_at` is when the request reached us; the `Date` header is
    /// held to the clock skew window around it, so a request verified
    /// later from the queue is judged by its arrival time.
    ///
    /// Returns the signing actor. Fails with `SignatureInvalid` for any
    /// signature problem and with `ActorFetch` when the signer's actor
    /// document cannot be retrieved.
    pub async fn authenticate(
        &self,
        request: &InboundRequest,
        activity: &serde_json::Value,
        received_at: DateTime<Utc>,
    ) -> Result<Arc<RemoteActor>, AppError> {
        let signature_header = request
            .headers
            .get(signature_header_name())
            .ok_or_else(|| AppError::SignatureInvalid("Missing Signature header".to_string()))?
            .to_str()
            .map_err(|_| AppError::SignatureInvalid("Invalid Signature header".to_string()))?;

        let context = self.codec.parse(signature_header)?;

        for required in REQUIRED_SIGNED_HEADERS {
            if !context.signed_headers.iter().any(|name| name == required) {
                return Err(AppError::SignatureInvalid(format!(
                    "Signature does not cover {}",
                    required
                )));
            }
        }

        self.codec.check_date(&request.headers, received_at)?;

        if !request.body.is_empty() {
            if !context.signed_headers.iter().any(|name| name == "digest") {
                return Err(AppError::SignatureInvalid(
                    "Signature does not cover digest".to_string(),
                ));
            }
            check_digest(&request.headers, &request.body)?;
        }

        let actor_id = activity_actor(activity)
            .ok_or_else(|| AppError::SignatureInvalid("Activity has no actor".to_string()))?;
        if !key_id_matches_actor(&context.key_id, actor_id) {
            return Err(AppError::SignatureInvalid(
                "Signature keyId does not belong to activity actor".to_string(),
            ));
        }

        let actor = self.actors.get_for_key_id(&context.key_id).await?;
        match self.check_with(request, signature_header, &context.key_id, &actor) {
            Ok(()) => Ok(actor),
            Err(first_error) => {
                // The actor may have rotated its key since we cached it.
                tracing::debug!(
                    key_id = %context.key_id,
                    error = %first_error,
                    "Signature check failed, refetching actor"
                );
                self.actors.evict(&actor.canonical_url).await;
                let refreshed = self.actors.get_for_key_id(&context.key_id).await?;

                match self.check_with(request, signature_header, &context.key_id, &refreshed) {
                    Ok(()) => Ok(refreshed),
                    Err(e) => {
                        self.actors.evict(&refreshed.canonical_url).await;
                        tracing::warn!(key_id = %context.key_id, error = %e, "Rejected inbound signature");
                        Err(e)
                    }
                }
            }
        }
    }

    fn check_with(
        &self,
        request: &InboundRequest,
        signature_header: &str,
        key_id: &str,
        actor: &RemoteActor,
    ) -> Result<(), AppError> {
        let pem = actor.public_key_pem.as_deref().ok_or_else(|| {
            AppError::SignatureInvalid("Actor publishes no usable public key".to_string())
        })?;

        if key_id.contains('#') && actor.public_key_id.as_deref() != Some(key_id) {
            return Err(AppError::SignatureInvalid(
                "Signature keyId does not match actor public key id".to_string(),
            ));
        }

        self.codec
            .check(&request.signable(), signature_header, pem)
            .map(|_| ())
    }

}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::federation::actor_cache::CacheTtls;
    use crate::federation::signature::tests::{test_key, test_key_pem};
    use crate::federation::signature::{LocalKey, http_date};
    use crate::federation::test_support::{FakeHttp, actor_document};
    use http::Method;
    use std::time::Duration;

    const BOB: &str = "https://remote.example/users/bob";

    fn ttls() -> CacheTtls {
        CacheTtls {
            keyed: Duration::from_secs(3600),
            keyless: Duration::from_secs(300),
            negative: Duration::from_secs(60),
        }
    }

    /// Sign `activity` as `actor_url` for `POST {url}`.
    pub(crate) fn signed_request(
        key: &LocalKey,
        url: &str,
        activity: &serde_json::Value,
    ) -> InboundRequest {
        signed_request_at(key, url, activity, Utc::now())
    }

    /// [`signed_request`] carrying a `Date` of `date`.
    pub(crate) fn signed_request_at(
        key: &LocalKey,
        url: &str,
        activity: &serde_json::Value,
        date: DateTime<Utc>,
    ) -> InboundRequest {
        let body = serde_json::to_vec(activity).expect("serializable");
        let headers = SignatureCodec::default()
            .sign_outgoing_at("POST", url, Some(&body), key, date)
            .expect("signed");
        let parsed = url::Url::parse(url).expect("url");
        InboundRequest::new("POST", parsed.path(), headers, body)
    }

    fn follow() -> serde_json::Value {
        serde_json::json!({
            "id": "https://remote.example/activities/1",
            "type": "Follow",
            "actor": BOB,
            "object": "https://local.example/authors/alice",
        })
    }

    fn verifier_with(http: Arc<FakeHttp>) -> RequestVerifier {
        RequestVerifier::new(
            SignatureCodec::default(),
            Arc::new(ActorCache::new(http, ttls())),
        )
    }

    fn bob_key() -> LocalKey {
        test_key(&format!("{}#main-key", BOB))
    }

    fn bob_http() -> Arc<FakeHttp> {
        let http = Arc::new(FakeHttp::new());
        http.on_get_json(BOB, actor_document(BOB, Some(bob_key().public_key_pem())));
        http
    }

    #[tokio::test]
    async fn valid_signature_yields_signing_actor() {
        let verifier = verifier_with(bob_http());
        let request = signed_request(&bob_key(), "https://local.example/inbox", &follow());

        let actor = verifier
            .authenticate(&request, &follow(), Utc::now())
            .await
            .expect("authentic");
        assert_eq!(actor.canonical_url.as_str(), BOB);
    }

    #[tokio::test]
    async fn tampered_body_is_rejected() {
        let verifier = verifier_with(bob_http());
        let mut request = signed_request(&bob_key(), "https://local.example/inbox", &follow());
        request.body = br#"{"type":"Delete"}"#.to_vec();

        assert!(matches!(
            verifier.authenticate(&request, &follow(), Utc::now()).await,
            Err(AppError::SignatureInvalid(_))
        ));
    }

    #[tokio::test]
    async fn missing_signature_is_rejected_without_fetching() {
        let http = bob_http();
        let verifier = verifier_with(http.clone());
        let mut request = signed_request(&bob_key(), "https://local.example/inbox", &follow());
        request.headers.remove("signature");

        assert!(matches!(
            verifier.authenticate(&request, &follow(), Utc::now()).await,
            Err(AppError::SignatureInvalid(_))
        ));
        assert!(http.requests().is_empty());
    }

    #[tokio::test]
    async fn key_of_another_actor_is_rejected() {
        let verifier = verifier_with(bob_http());
        let mallory = test_key("https://remote.example/users/mallory#main-key");
        let request = signed_request(&mallory, "https://local.example/inbox", &follow());

        match verifier.authenticate(&request, &follow(), Utc::now()).await {
            Err(AppError::SignatureInvalid(msg)) => assert!(msg.contains("keyId")),
            other => panic!("expected keyId mismatch, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn stale_cached_key_is_refetched_once() {
        let http = Arc::new(FakeHttp::new());
        let rotated = LocalKey::from_pem(
            format!("{}#main-key", BOB),
            &LocalKey::generate_pem(1024).expect("key"),
        )
        .expect("key");
        http.on_get_json(BOB, actor_document(BOB, Some(rotated.public_key_pem())));
        let verifier = verifier_with(http.clone());

        // Prime the cache with the old key.
        let request = signed_request(&rotated, "https://local.example/inbox", &follow());
        verifier.authenticate(&request, &follow(), Utc::now()).await.expect("authentic");

        // The actor now publishes the shared test key.
        http.on_get_json(BOB, actor_document(BOB, Some(bob_key().public_key_pem())));
        let request = signed_request(&bob_key(), "https://local.example/inbox", &follow());
        verifier.authenticate(&request, &follow(), Utc::now()).await.expect("authentic after refetch");

        assert_eq!(http.calls(Method::GET, BOB), 2);
    }

    #[tokio::test]
    async fn date_is_checked_against_arrival_time() {
        let verifier = verifier_with(bob_http());
        let arrived = Utc::now() - chrono::Duration::minutes(6);
        let request =
            signed_request_at(&bob_key(), "https://local.example/inbox", &follow(), arrived);

        verifier
            .authenticate(&request, &follow(), arrived)
            .await
            .expect("authentic at arrival");
        assert!(matches!(
            verifier.authenticate(&request, &follow(), Utc::now()).await,
            Err(AppError::SignatureInvalid(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_actor_is_an_actor_fetch_error() {
        let verifier = verifier_with(Arc::new(FakeHttp::new()));
        let request = signed_request(&bob_key(), "https://local.example/inbox", &follow());

        assert!(matches!(
            verifier.authenticate(&request, &follow(), Utc::now()).await,
            Err(AppError::ActorFetch(_))
        ));
    }

    #[tokio::test]
    async fn signature_without_digest_coverage_is_rejected() {
        let verifier = verifier_with(bob_http());
        let body = serde_json::to_vec(&follow()).expect("json");
        let key = bob_key();
        let codec = SignatureCodec::default();

        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("local.example"));
        headers.insert(
            "date",
            HeaderValue::from_str(&http_date(Utc::now())).expect("date"),
        );
        let context = codec
            .sign(
                &SignableRequest {
                    method: "POST",
                    target: "/inbox",
                    headers: &headers,
                },
                &key,
                &["(request-target)", "host", "date"],
            )
            .expect("signed");
        headers.insert(
            "signature",
            HeaderValue::from_str(&codec.render(&context)).expect("header"),
        );

        let request = InboundRequest::new("POST", "/inbox", headers, body);
        match verifier.authenticate(&request, &follow(), Utc::now()).await {
            Err(AppError::SignatureInvalid(msg)) => assert!(msg.contains("digest")),
            other => panic!("expected digest coverage error, got: {other:?}"),
        }
    }

    #[test]
    fn stored_meta_restores_headers() {
        let request = signed_request(
            &LocalKey::from_pem("https://a.example/actor#k", test_key_pem()).expect("key"),
            "https://local.example/inbox",
            &follow(),
        );
        let meta = serde_json::to_string(&request.meta()).expect("meta");
        let restored = InboundRequest::from_meta(
            serde_json::from_str(&meta).expect("meta"),
            request.body.clone(),
        )
        .expect("restored");
        assert_eq!(restored, request);
    }

    #[test]
    fn activity_actor_accepts_embedded_object() {
        let activity = serde_json::json!({"actor": {"id": BOB, "type": "Person"}});
        assert_eq!(activity_actor(&activity), Some(BOB));
        assert_eq!(activity_actor(&serde_json::json!({"actor": 7})), None);
    }
}
