//! ActivityPub endpoints
//!
//! - Instance actor
//! - Inboxes (activity receiving)
//! - Federation documents of local entities (content negotiation)

use axum::body::Bytes;
use axum::{
    Router,
    extract::{Path, State},
    http::{StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use http::HeaderMap;
use serde_json::{Value, json};

use crate::AppState;
use crate::error::AppError;
use crate::federation::{
    ACTIVITY_CONTENT_TYPE, HandlerKind, InboundRequest, LocalEntityRef, ReceiveOutcome,
    TargetDescriptor, UrlClass, local_key_id,
};
use crate::metrics::{FEDERATION_REQUEST_DURATION_SECONDS, FEDERATION_REQUESTS_TOTAL, HTTP_REQUESTS_TOTAL};

const AS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";
const SECURITY_CONTEXT: &str = "https://w3id.org/security/v1";

/// Create ActivityPub router
///
/// Routes:
/// - GET /actor - Instance actor
/// - POST /inbox - Shared inbox
/// - POST /{actor path}/inbox - Personal inbox of a local actor
/// - GET /{path} - Federation document when the client asks for one
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/actor", get(instance_actor))
        .route("/inbox", post(shared_inbox))
        .route("/*path", get(document).post(actor_inbox))
}

/// Wrap a document in an `application/activity+json` response.
fn activity_json(document: Value) -> Response {
    (
        [(header::CONTENT_TYPE, ACTIVITY_CONTENT_TYPE)],
        document.to_string(),
    )
        .into_response()
}

fn request_target(uri: &Uri) -> String {
    uri.path_and_query()
        .map(|target| target.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string())
}

/// GET /actor
///
/// The instance actor owns the keypair outbound requests are signed with.
async fn instance_actor(State(state): State<AppState>) -> Response {
    let actor_url = state.instance_actor_url();
    let base_url = state.identity.base_url();

    HTTP_REQUESTS_TOTAL
        .with_label_values(&["GET", "/actor", "200"])
        .inc();

    activity_json(json!({
        "@context": [AS_CONTEXT, SECURITY_CONTEXT],
        "id": actor_url,
        "type": "Application",
        "preferredUsername": state.config.federation.instance_actor_username,
        "inbox": format!("{}/inbox", base_url),
        "endpoints": {"sharedInbox": format!("{}/inbox", base_url)},
        "manuallyApprovesFollowers": true,
        "publicKey": {
            "id": state.key.key_id(),
            "owner": actor_url,
            "publicKeyPem": state.key.public_key_pem(),
        },
    }))
}

/// POST /inbox
async fn shared_inbox(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    receive(&state, "/inbox", &uri, headers, body).await
}

/// POST /{actor path}/inbox
///
/// Only inboxes of local actors exist; anything else is 404.
async fn actor_inbox(
    State(state): State<AppState>,
    Path(path): Path<String>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let actor_path = path.strip_suffix("/inbox").ok_or(AppError::NotFound)?;
    let actor_url = format!("{}/{}", state.identity.base_url(), actor_path);
    if actor_url != state.instance_actor_url()
        && !matches!(state.identity.classify(&actor_url), UrlClass::LocalActor(_))
    {
        return Err(AppError::NotFound);
    }

    receive(&state, "/:actor/inbox", &uri, headers, body).await
}

/// Hand a signed delivery to the pipeline.
///
/// # Steps
/// 1. Reject unsigned requests immediately
/// 2. Verify signature and record the activity (pipeline)
/// 3. Answer 202; handling happens in the workers
async fn receive(
    state: &AppState,
    endpoint: &str,
    uri: &Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let _timer = FEDERATION_REQUEST_DURATION_SECONDS
        .with_label_values(&["inbound"])
        .start_timer();

    if !headers.contains_key("signature") {
        FEDERATION_REQUESTS_TOTAL
            .with_label_values(&["inbound", "unauthorized"])
            .inc();
        HTTP_REQUESTS_TOTAL
            .with_label_values(&["POST", endpoint, "401"])
            .inc();
        return Err(AppError::SignatureInvalid(
            "Missing Signature header".to_string(),
        ));
    }

    let request = InboundRequest::new("POST", &request_target(uri), headers, body.to_vec());
    match state.pipeline.receive(request).await {
        Ok(outcome) => {
            let status = match outcome {
                ReceiveOutcome::Accepted => "accepted",
                ReceiveOutcome::Duplicate => "duplicate",
            };
            FEDERATION_REQUESTS_TOTAL
                .with_label_values(&["inbound", status])
                .inc();
            HTTP_REQUESTS_TOTAL
                .with_label_values(&["POST", endpoint, "202"])
                .inc();
            Ok(StatusCode::ACCEPTED)
        }
        Err(e) => {
            tracing::info!(endpoint, error = %e, "Rejected inbound activity");
            FEDERATION_REQUESTS_TOTAL
                .with_label_values(&["inbound", "rejected"])
                .inc();
            Err(e)
        }
    }
}

/// GET /{path}
///
/// Serves the federation document of a local entity when `Accept` asks for
/// ActivityPub; every other request is left to the host (404 here).
async fn document(
    State(state): State<AppState>,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let accept = headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");

    let url = format!("{}/{}", state.identity.base_url(), path);
    let entity = state.identity.to_local_ref(&url).ok_or(AppError::NotFound)?;
    let handler = state
        .router
        .select(accept, &TargetDescriptor::from(&entity))
        .ok_or(AppError::NotFound)?;

    let document = state
        .directory
        .document(&entity)
        .await?
        .ok_or(AppError::NotFound)?;

    let document = match handler {
        HandlerKind::ActorHandler => actor_document(&state, &entity, document),
        HandlerKind::ActivityHandler | HandlerKind::ObjectHandler => {
            object_document(&state, &entity, document)
        }
    };

    HTTP_REQUESTS_TOTAL
        .with_label_values(&["GET", "/:path", "200"])
        .inc();
    Ok(activity_json(document))
}

/// Fill the fields every federated document needs, keeping host values.
fn object_document(state: &AppState, entity: &LocalEntityRef, document: Value) -> Value {
    let mut document = match document {
        Value::Object(map) => map,
        other => return other,
    };
    let id = state.identity.to_canonical_url(entity).to_string();

    document
        .entry("@context")
        .or_insert_with(|| json!(AS_CONTEXT));
    document.insert("id".to_string(), Value::String(id));
    Value::Object(document)
}

/// Actor documents additionally get an inbox and the public key.
fn actor_document(state: &AppState, entity: &LocalEntityRef, document: Value) -> Value {
    let mut document = object_document(state, entity, document);
    let Some(map) = document.as_object_mut() else {
        return document;
    };
    let id = state.identity.to_canonical_url(entity).to_string();

    map.insert("@context".to_string(), json!([AS_CONTEXT, SECURITY_CONTEXT]));
    map.entry("type").or_insert_with(|| json!("Person"));
    map.entry("inbox")
        .or_insert_with(|| json!(format!("{}/inbox", id)));
    map.entry("endpoints").or_insert_with(
        || json!({"sharedInbox": format!("{}/inbox", state.identity.base_url())}),
    );
    map.insert(
        "publicKey".to_string(),
        json!({
            "id": local_key_id(&id),
            "owner": id,
            "publicKeyPem": state.key.public_key_pem(),
        }),
    );
    document
}
