//! Mention-based addressing of outbound activities
//!
//! Resolves `@user@domain` mentions in post text through WebFinger and
//! adds the resolved actors as recipients and `Mention` tags.

use std::collections::HashMap;

use serde_json::{Value, json};

use super::identity::{CanonicalUrl, IdentityResolver};
use super::mention::{self, MentionToken};
use super::webfinger::DiscoveryClient;

pub struct MentionAddresser {
    discovery: DiscoveryClient,
    identity: IdentityResolver,
    local_domain: String,
}

impl MentionAddresser {
    pub fn new(
        discovery: DiscoveryClient,
        identity: IdentityResolver,
        local_domain: impl Into<String>,
    ) -> Self {
        Self {
            discovery,
            identity,
            local_domain: local_domain.into(),
        }
    }

    /// Extract and resolve remote mentions in `text`.
    ///
    /// Resolution is best effort: mentions without a domain, of the local
    /// domain, or failing discovery stay unresolved.
    pub async fn resolve_mentions(&self, text: &str) -> Vec<MentionToken> {
        let mut mentions = mention::extract(text);
        // One lookup per handle, however often it is mentioned.
        let mut resolved: HashMap<String, Option<CanonicalUrl>> = HashMap::new();

        for token in &mut mentions {
            let Some(domain) = token.domain() else {
                continue;
            };
            if domain.eq_ignore_ascii_case(&self.local_domain) {
                continue;
            }

            let key = token.handle().to_ascii_lowercase();
            if let Some(actor) = resolved.get(&key) {
                token.resolved_actor_url = actor.clone();
                continue;
            }

            let actor = match self.discovery.resolve_handle(token.handle()).await {
                Ok(actor) if !self.identity.is_local(actor.as_str()) => Some(actor),
                Ok(_) => None,
                Err(e) => {
                    tracing::debug!(mention = %token.raw_text, error = %e, "Mention not resolved");
                    None
                }
            };
            token.resolved_actor_url = actor.clone();
            resolved.insert(key, actor);
        }
        mentions
    }

    /// Address `activity` to the actors mentioned in `text`.
    ///
    /// Resolved actors are appended to `cc` and as `Mention` tags on the
    /// activity's embedded object (or the activity itself). Returns the
    /// recipients to deliver to, without duplicates.
    pub async fn address(&self, activity: &mut Value, text: &str) -> Vec<CanonicalUrl> {
        let mut recipients: Vec<CanonicalUrl> = Vec::new();
        let mut tags = Vec::new();

        for token in self.resolve_mentions(text).await {
            let Some(actor) = token.resolved_actor_url else {
                continue;
            };
            if recipients.contains(&actor) {
                continue;
            }
            tags.push(json!({
                "type": "Mention",
                "href": actor.as_str(),
                "name": token.raw_text,
            }));
            recipients.push(actor);
        }

        if recipients.is_empty() {
            return recipients;
        }

        append_unique(activity, "cc", recipients.iter().map(|r| json!(r.as_str())));
        match activity.get_mut("object").filter(|object| object.is_object()) {
            Some(object) => {
                append_unique(object, "cc", recipients.iter().map(|r| json!(r.as_str())));
                append_unique(object, "tag", tags.into_iter());
            }
            None => append_unique(activity, "tag", tags.into_iter()),
        }

        recipients
    }
}

/// Append values to an array property, promoting a scalar to an array.
fn append_unique(target: &mut Value, key: &str, values: impl Iterator<Item = Value>) {
    let Some(object) = target.as_object_mut() else {
        return;
    };

    let entry = object
        .entry(key.to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    if !entry.is_array() {
        let existing = entry.take();
        *entry = Value::Array(vec![existing]);
    }

    if let Value::Array(items) = entry {
        for value in values {
            if !items.contains(&value) {
                items.push(value);
            }
        }
    }
}
