//! Well-known endpoints
//!
//! - /.well-known/webfinger
//! - /.well-known/host-meta

use axum::{
    Router,
    extract::{Query, State},
    http::header,
    response::IntoResponse,
    routing::get,
};
use serde::Deserialize;

use crate::AppState;
use crate::error::AppError;
use crate::federation::{Handle, generate_webfinger_response};

const JRD_CONTENT_TYPE: &str = "application/jrd+json";

/// Create well-known router
///
/// Routes:
/// - GET /.well-known/webfinger
/// - GET /.well-known/host-meta
pub fn wellknown_router() -> Router<AppState> {
    Router::new()
        .route("/.well-known/webfinger", get(webfinger))
        .route("/.well-known/host-meta", get(host_meta))
}

/// WebFinger query parameters
#[derive(Debug, Deserialize)]
struct WebFingerQuery {
    resource: String,
}

/// GET /.well-known/webfinger
///
/// Responds to WebFinger queries for the instance actor and the local
/// actors the host directory knows by username.
///
/// Query: ?resource=acct:user@domain
async fn webfinger(
    State(state): State<AppState>,
    Query(query): Query<WebFingerQuery>,
) -> Result<impl IntoResponse, AppError> {
    let handle = Handle::parse(&query.resource)
        .map_err(|_| AppError::Validation("Resource must be acct:user@domain".to_string()))?;

    // Verify domain matches local domain
    if !handle.domain.eq_ignore_ascii_case(&state.config.server.domain) {
        return Err(AppError::NotFound);
    }

    let actor_url = if handle.user == state.config.federation.instance_actor_username {
        state.instance_actor_url()
    } else {
        let entity = state
            .directory
            .actor_by_username(&handle.user)
            .await?
            .ok_or(AppError::NotFound)?;
        state.identity.to_canonical_url(&entity).to_string()
    };

    let response = generate_webfinger_response(&handle.user, &handle.domain, &actor_url);
    let body = serde_json::to_string(&response)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to encode JRD: {}", e)))?;

    Ok(([(header::CONTENT_TYPE, JRD_CONTENT_TYPE)], body))
}

/// GET /.well-known/host-meta
///
/// Returns host-meta XML for WebFinger discovery.
async fn host_meta(State(state): State<AppState>) -> impl IntoResponse {
    let base_url = state.config.server.base_url();
    let xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<XRD xmlns="http://docs.oasis-open.org/ns/xri/xrd-1.0">
  <Link rel="lrdd" template="{}/.well-known/webfinger?resource={{uri}}"/>
</XRD>"#,
        base_url
    );

    ([(header::CONTENT_TYPE, "application/xrd+xml")], xml)
}
