//! Outbound HTTP transport
//!
//! Every federation request (WebFinger, actor fetch, inbox POST) goes
//! through [`HttpClient`] so tests can swap the network out.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use http::{HeaderMap, Method, StatusCode};

use crate::error::AppError;
use crate::metrics::{FEDERATION_REQUEST_DURATION_SECONDS, FEDERATION_REQUESTS_TOTAL};

pub const USER_AGENT: &str = concat!("fedibridge/", env!("CARGO_PKG_VERSION"));

const MAX_REDIRECTS: usize = 3;

/// Status and body of a completed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: StatusCode, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// Minimal async HTTP client used by federation code.
///
/// Non-2xx statuses are returned as responses; only transport-level
/// failures (DNS, connect, timeout, blocked host) are errors.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn get(&self, url: &str, headers: HeaderMap) -> Result<HttpResponse, AppError>;

    async fn post(
        &self,
        url: &str,
        headers: HeaderMap,
        body: Vec<u8>,
    ) -> Result<HttpResponse, AppError>;
}

/// reqwest-backed client with an optional private-address guard.
///
/// Redirects are followed here rather than by reqwest, for GET only, so
/// every hop passes the same guard as the first URL.
#[derive(Clone)]
pub struct ReqwestClient {
    inner: reqwest::Client,
    allow_private_hosts: bool,
}

impl ReqwestClient {
    pub fn new(timeout: Duration, allow_private_hosts: bool) -> Result<Self, AppError> {
        let inner = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(AppError::HttpClient)?;

        Ok(Self {
            inner,
            allow_private_hosts,
        })
    }

    async fn execute(
        &self,
        direction: &'static str,
        method: Method,
        url: &str,
        mut headers: HeaderMap,
        body: Option<Vec<u8>>,
    ) -> Result<HttpResponse, AppError> {
        let mut current = url::Url::parse(url)
            .map_err(|e| AppError::Validation(format!("Invalid URL {}: {}", url, e)))?;
        let mut hops = 0;

        loop {
            if !self.allow_private_hosts {
                validate_remote_url(&current).await?;
            }

            let mut request = self
                .inner
                .request(method.clone(), current.clone())
                .headers(headers.clone());
            if let Some(body) = &body {
                request = request.body(body.clone());
            }

            let started = Instant::now();
            let result = request.send().await;
            FEDERATION_REQUEST_DURATION_SECONDS
                .with_label_values(&[direction])
                .observe(started.elapsed().as_secs_f64());

            let response = match result {
                Ok(response) => response,
                Err(e) => {
                    FEDERATION_REQUESTS_TOTAL
                        .with_label_values(&[direction, "error"])
                        .inc();
                    return Err(AppError::Transport(format!(
                        "Request to {} failed: {}",
                        current, e
                    )));
                }
            };

            let status = response.status();
            FEDERATION_REQUESTS_TOTAL
                .with_label_values(&[direction, status.as_str()])
                .inc();

            let location = response
                .headers()
                .get(http::header::LOCATION)
                .and_then(|value| value.to_str().ok());
            if method == Method::GET && status.is_redirection() {
                if let Some(location) = location {
                    hops += 1;
                    let next = redirect_target(&current, location, hops, self.allow_private_hosts)?;
                    tracing::debug!(from = %current, to = %next, "Following redirect");
                    if next.host_str() != current.host_str() || next.port() != current.port() {
                        headers.remove(http::header::HOST);
                    }
                    current = next;
                    continue;
                }
            }

            let body = response.bytes().await.map_err(|e| {
                AppError::Transport(format!("Failed to read body from {}: {}", current, e))
            })?;

            return Ok(HttpResponse::new(status, body.to_vec()));
        }
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn get(&self, url: &str, headers: HeaderMap) -> Result<HttpResponse, AppError> {
        self.execute("fetch", Method::GET, url, headers, None).await
    }

    async fn post(
        &self,
        url: &str,
        headers: HeaderMap,
        body: Vec<u8>,
    ) -> Result<HttpResponse, AppError> {
        self.execute("outbound", Method::POST, url, headers, Some(body))
            .await
    }
}

/// Resolve a `Location` header against the current URL and check the hop.
fn redirect_target(
    current: &url::Url,
    location: &str,
    hops: usize,
    allow_private_hosts: bool,
) -> Result<url::Url, AppError> {
    if hops > MAX_REDIRECTS {
        return Err(AppError::Transport(format!(
            "Too many redirects from {}",
            current
        )));
    }
    let next = current
        .join(location)
        .map_err(|e| AppError::Transport(format!("Invalid redirect location {}: {}", location, e)))?;
    if allow_private_hosts {
        if next.scheme() != "http" && next.scheme() != "https" {
            return Err(AppError::Validation(
                "Remote URL must use http or https".to_string(),
            ));
        }
    } else {
        check_remote_host(&next)?;
    }
    Ok(next)
}

fn is_blocked_ip_address(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_multicast()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_unspecified()
                || v6.is_multicast()
                || v6.to_ipv4_mapped().is_some_and(|v4| is_blocked_ip_address(IpAddr::V4(v4)))
        }
    }
}

/// Host-level checks that need no DNS.
fn check_remote_host(url: &url::Url) -> Result<String, AppError> {
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(AppError::Validation(
            "Remote URL must use http or https".to_string(),
        ));
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(AppError::Validation(
            "Remote URL must not include user info".to_string(),
        ));
    }

    let host = url
        .host_str()
        .ok_or_else(|| AppError::Validation("Remote URL must include a host".to_string()))?
        .trim_end_matches('.')
        .to_ascii_lowercase();

    if host == "localhost" || host.ends_with(".localhost") {
        return Err(AppError::Validation(
            "Remote URL host is not allowed".to_string(),
        ));
    }

    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        if is_blocked_ip_address(ip) {
            return Err(AppError::Validation(
                "Remote URL host is not allowed".to_string(),
            ));
        }
    }

    Ok(host)
}

async fn validate_remote_url(url: &url::Url) -> Result<(), AppError> {
    let host = check_remote_host(url)?;

    let port = url.port_or_known_default().ok_or_else(|| {
        AppError::Validation("Remote URL must include a known default port".to_string())
    })?;
    let mut resolved_any = false;
    let resolved = tokio::net::lookup_host((host.as_str(), port))
        .await
        .map_err(|error| {
            AppError::Transport(format!("Failed to resolve remote host {}: {}", host, error))
        })?;
    for address in resolved {
        resolved_any = true;
        if is_blocked_ip_address(address.ip()) {
            return Err(AppError::Validation(
                "Remote URL host is not allowed".to_string(),
            ));
        }
    }
    if !resolved_any {
        return Err(AppError::Transport(format!(
            "Remote host did not resolve to any IP addresses: {}",
            host
        )));
    }

    Ok(())
}
