//! ActivityPub federation module
//!
//! Handles:
//! - Local identity and canonical URLs
//! - HTTP Signatures
//! - WebFinger discovery and mention addressing
//! - Remote actor caching
//! - Persistent delivery and inbound queues
//! - Content negotiation

mod actor_cache;
mod addressing;
mod delivery;
mod http;
mod identity;
pub mod mention;
mod router;
mod signature;
mod store;
mod verifier;
mod webfinger;

#[cfg(test)]
mod test_support;

pub use actor_cache::{ActorCache, CacheStats, CacheTtls, RemoteActor};
pub use addressing::MentionAddresser;
pub use delivery::{
    ACTIVITY_CONTENT_TYPE, DeliveryPipeline, PipelineParts, ReceiveOutcome, RetryPolicy,
};
pub use self::http::{HttpClient, HttpResponse, ReqwestClient};
pub use identity::{
    ACTIVITY_SUBTYPE, CanonicalUrl, EntityKind, IdentityResolver, LocalEntityRef, TargetKind,
    UrlClass,
};
pub use mention::MentionToken;
pub use router::{HandlerKind, ProtocolRouter, TargetDescriptor, is_federation_request};
pub use signature::{
    LocalKey, SignableRequest, SignatureCodec, SignatureContext, check_digest, generate_digest,
    http_date, key_id_matches_actor,
};
pub use store::{ActivityStatus, ActivityStore, Delivery, Direction, FederatedActivity};
pub use verifier::{InboundRequest, RequestVerifier, activity_actor};
pub use webfinger::{
    ACTIVITY_JSON, DiscoveryClient, Handle, WebFingerLink, WebFingerResponse,
    generate_webfinger_response,
};

/// Key id under which a local actor publishes its public key.
pub fn local_key_id(actor_url: &str) -> String {
    format!("{}#main-key", actor_url)
}
