//! WebFinger protocol implementation
//!
//! Used to discover ActivityPub actor URIs from `user@domain` handles,
//! and to answer the same question for local actors.

use std::sync::Arc;

use http::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};

use super::http::HttpClient;
use super::identity::CanonicalUrl;
use crate::error::AppError;

pub const JRD_ACCEPT: &str = "application/jrd+json, application/json";
pub const ACTIVITY_JSON: &str = "application/activity+json";
pub const LD_JSON_ACTIVITYSTREAMS: &str =
    "application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

/// Parsed `user@domain` handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handle {
    pub user: String,
    pub domain: String,
}

impl Handle {
    /// Accepts `user@domain`, `@user@domain` and `acct:user@domain`.
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        let malformed = || AppError::Discovery(format!("Malformed handle: {:?}", raw));

        let trimmed = raw.trim();
        let stripped = trimmed
            .strip_prefix("acct:")
            .or_else(|| trimmed.strip_prefix('@'))
            .unwrap_or(trimmed);

        let (user, domain) = stripped.split_once('@').ok_or_else(malformed)?;
        if user.is_empty()
            || domain.is_empty()
            || domain.contains('@')
            || domain.contains('/')
            || user.chars().any(char::is_whitespace)
            || domain.chars().any(char::is_whitespace)
        {
            return Err(malformed());
        }

        Ok(Self {
            user: user.to_string(),
            domain: domain.to_ascii_lowercase(),
        })
    }

    /// `acct:` resource URI
    pub fn resource(&self) -> String {
        format!("acct:{}@{}", self.user, self.domain)
    }
}

/// WebFinger JRD response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerResponse {
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,
    pub links: Vec<WebFingerLink>,
}

/// WebFinger link
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerLink {
    pub rel: String,
    #[serde(rename = "type")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

impl WebFingerLink {
    fn is_activitypub_self(&self) -> bool {
        self.rel == "self"
            && self
                .link_type
                .as_deref()
                .is_some_and(|link_type| is_activitypub_type(link_type))
    }
}

fn is_activitypub_type(link_type: &str) -> bool {
    let normalized: String = link_type
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase();
    normalized == ACTIVITY_JSON
        || normalized == LD_JSON_ACTIVITYSTREAMS.replace(' ', "").to_ascii_lowercase()
}

/// Some servers answer with the link array alone.
#[derive(Deserialize)]
#[serde(untagged)]
enum JrdBody {
    Document { links: Vec<serde_json::Value> },
    Links(Vec<serde_json::Value>),
}

/// Pick the ActivityPub actor URL out of a WebFinger body.
pub fn select_actor_link(body: &[u8]) -> Result<CanonicalUrl, AppError> {
    let parsed: JrdBody = serde_json::from_slice(body)
        .map_err(|e| AppError::Discovery(format!("Invalid WebFinger response: {}", e)))?;
    let links = match parsed {
        JrdBody::Document { links } | JrdBody::Links(links) => links,
    };

    // Links that fail to deserialize are skipped rather than failing the lookup.
    let href = links
        .into_iter()
        .filter_map(|value| serde_json::from_value::<WebFingerLink>(value).ok())
        .find(WebFingerLink::is_activitypub_self)
        .and_then(|link| link.href)
        .ok_or_else(|| AppError::Discovery("No ActivityPub self link".to_string()))?;

    CanonicalUrl::parse(&href)
        .map_err(|e| AppError::Discovery(format!("Invalid actor link {:?}: {}", href, e)))
}

/// Resolves handles to actor URLs over WebFinger.
#[derive(Clone)]
pub struct DiscoveryClient {
    http: Arc<dyn HttpClient>,
    /// `https` in production; `http` only for local test networks
    scheme: String,
}

impl DiscoveryClient {
    pub fn new(http: Arc<dyn HttpClient>, scheme: impl Into<String>) -> Self {
        Self {
            http,
            scheme: scheme.into(),
        }
    }

    /// Resolve a handle to the actor's canonical URL.
    ///
    /// # Errors
    /// `Discovery` for a malformed handle, transport failure, non-2xx
    /// status, non-JSON body or a body without an ActivityPub self link.
    /// Failures are not retried here.
    pub async fn resolve_handle(&self, handle: &str) -> Result<CanonicalUrl, AppError> {
        let handle = Handle::parse(handle)?;
        let url = format!(
            "{}://{}/.well-known/webfinger?resource={}",
            self.scheme,
            handle.domain,
            urlencoding::encode(&handle.resource())
        );

        let mut headers = HeaderMap::new();
        headers.insert(http::header::ACCEPT, HeaderValue::from_static(JRD_ACCEPT));

        let response = self
            .http
            .get(&url, headers)
            .await
            .map_err(|e| AppError::Discovery(format!("WebFinger request failed: {}", e)))?;

        if !response.status.is_success() {
            return Err(AppError::Discovery(format!(
                "WebFinger for {} returned HTTP {}",
                handle.resource(),
                response.status
            )));
        }

        let actor = select_actor_link(&response.body)?;
        tracing::debug!(handle = %handle.resource(), actor = %actor, "Resolved handle");
        Ok(actor)
    }
}

/// Generate WebFinger response for a local actor.
///
/// # Arguments
/// * `username` - Local username
/// * `domain` - Instance domain
/// * `actor_url` - Canonical URL of the actor document
///
/// # Returns
/// JRD response for the account
pub fn generate_webfinger_response(
    username: &str,
    domain: &str,
    actor_url: &str,
) -> WebFingerResponse {
    let subject = format!("acct:{}@{}", username, domain);

    WebFingerResponse {
        subject,
        aliases: Some(vec![actor_url.to_string()]),
        links: vec![WebFingerLink {
            rel: "self".to_string(),
            link_type: Some(ACTIVITY_JSON.to_string()),
            href: Some(actor_url.to_string()),
            template: None,
        }],
    }
}
