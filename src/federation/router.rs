//! Content negotiation
//!
//! Decides whether a GET for a local URL should be answered with a
//! federation document, and by which handler.

use super::identity::{LocalEntityRef, TargetKind};

const FEDERATION_MEDIA_TYPES: [&str; 2] = ["application/activity+json", "application/ld+json"];

/// Which federation document handler answers the request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    ActorHandler,
    ActivityHandler,
    ObjectHandler,
}

/// What the request targets, as decided by the identity resolver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDescriptor {
    pub kind: TargetKind,
    pub subtype: String,
}

impl From<&LocalEntityRef> for TargetDescriptor {
    fn from(entity: &LocalEntityRef) -> Self {
        Self {
            kind: entity.target_kind(),
            subtype: entity.subtype.clone(),
        }
    }
}

/// Whether an `Accept` header asks for a federation representation.
///
/// Only the leading media type counts; browsers listing JSON-LD late in
/// their preferences still get HTML.
pub fn is_federation_request(accept: &str) -> bool {
    let accept = accept.trim().to_ascii_lowercase();
    FEDERATION_MEDIA_TYPES
        .iter()
        .any(|media_type| accept.starts_with(media_type))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProtocolRouter;

impl ProtocolRouter {
    /// `None` means the host's default (HTML) handling applies.
    pub fn select(&self, accept: &str, target: &TargetDescriptor) -> Option<HandlerKind> {
        if !is_federation_request(accept) {
            return None;
        }

        Some(match target.kind {
            TargetKind::Actor => HandlerKind::ActorHandler,
            TargetKind::Activity => HandlerKind::ActivityHandler,
            TargetKind::Object => HandlerKind::ObjectHandler,
        })
    }
}
