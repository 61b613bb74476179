//! In-process fakes for federation unit tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use http::{HeaderMap, Method, StatusCode};

use super::http::{HttpClient, HttpResponse};
use crate::error::AppError;

/// A request seen by [`FakeHttp`].
#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

type Responder = Box<dyn Fn(&RecordedRequest) -> Result<HttpResponse, AppError> + Send + Sync>;

/// Scriptable [`HttpClient`]: responses keyed by method and exact URL.
///
/// Unscripted URLs answer 404.
#[derive(Default)]
pub(crate) struct FakeHttp {
    responders: Mutex<HashMap<(Method, String), Responder>>,
    requests: Mutex<Vec<RecordedRequest>>,
    delay: Option<Duration>,
}

impl FakeHttp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn on(
        &self,
        method: Method,
        url: &str,
        responder: impl Fn(&RecordedRequest) -> Result<HttpResponse, AppError> + Send + Sync + 'static,
    ) {
        self.responders
            .lock()
            .expect("responders lock")
            .insert((method, url.to_string()), Box::new(responder));
    }

    pub fn on_get_json(&self, url: &str, document: serde_json::Value) {
        let body = document.to_string();
        self.on(Method::GET, url, move |_| {
            Ok(HttpResponse::new(StatusCode::OK, body.clone()))
        });
    }

    pub fn on_post_status(&self, url: &str, status: StatusCode) {
        self.on(Method::POST, url, move |_| Ok(HttpResponse::new(status, "")));
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn calls(&self, method: Method, url: &str) -> usize {
        self.requests
            .lock()
            .expect("requests lock")
            .iter()
            .filter(|request| request.method == method && request.url == url)
            .count()
    }

    async fn respond(&self, request: RecordedRequest) -> Result<HttpResponse, AppError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());

        let responders = self.responders.lock().expect("responders lock");
        match responders.get(&(request.method.clone(), request.url.clone())) {
            Some(responder) => responder(&request),
            None => Ok(HttpResponse::new(StatusCode::NOT_FOUND, "")),
        }
    }
}

#[async_trait]
impl HttpClient for FakeHttp {
    async fn get(&self, url: &str, headers: HeaderMap) -> Result<HttpResponse, AppError> {
        self.respond(RecordedRequest {
            method: Method::GET,
            url: url.to_string(),
            headers,
            body: Vec::new(),
        })
        .await
    }

    async fn post(
        &self,
        url: &str,
        headers: HeaderMap,
        body: Vec<u8>,
    ) -> Result<HttpResponse, AppError> {
        self.respond(RecordedRequest {
            method: Method::POST,
            url: url.to_string(),
            headers,
            body,
        })
        .await
    }
}

/// Minimal actor document in the shape Mastodon serves.
pub(crate) fn actor_document(actor_url: &str, public_key_pem: Option<&str>) -> serde_json::Value {
    let mut document = serde_json::json!({
        "@context": ["https://www.w3.org/ns/activitystreams", "https://w3id.org/security/v1"],
        "id": actor_url,
        "type": "Person",
        "inbox": format!("{}/inbox", actor_url),
        "outbox": format!("{}/outbox", actor_url),
    });
    if let Some(pem) = public_key_pem {
        document["publicKey"] = serde_json::json!({
            "id": format!("{}#main-key", actor_url),
            "owner": actor_url,
            "publicKeyPem": pem,
        });
    }
    document
}
