//! Local identity resolution
//!
//! Maps between federation URLs and the host's opaque identifiers.
//! Everything here is pure: the same URL and configuration always
//! classify the same way.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::SubtypeRouteConfig;
use crate::error::AppError;

/// Subtype given to references resolved through the activity path template.
pub const ACTIVITY_SUBTYPE: &str = "activity";

/// Kind of a local entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Actor,
    Object,
}

/// Handler-facing classification of a local entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKind {
    Actor,
    Activity,
    Object,
}

/// Reference to a locally hosted actor or object
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocalEntityRef {
    pub kind: EntityKind,
    pub subtype: String,
    pub id: String,
}

impl LocalEntityRef {
    pub fn actor(subtype: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: EntityKind::Actor,
            subtype: subtype.into(),
            id: id.into(),
        }
    }

    pub fn object(subtype: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: EntityKind::Object,
            subtype: subtype.into(),
            id: id.into(),
        }
    }

    pub fn target_kind(&self) -> TargetKind {
        match self.kind {
            EntityKind::Actor => TargetKind::Actor,
            EntityKind::Object if self.subtype == ACTIVITY_SUBTYPE => TargetKind::Activity,
            EntityKind::Object => TargetKind::Object,
        }
    }
}

/// Normalized absolute http(s) URL used as the addressing key everywhere.
///
/// Host is lowercased, default ports and fragments are dropped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CanonicalUrl(String);

impl CanonicalUrl {
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        let url = url::Url::parse(raw.trim())
            .map_err(|e| AppError::Validation(format!("Invalid URL {:?}: {}", raw, e)))?;

        match url.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(AppError::Validation(format!(
                    "Unsupported URL scheme: {}",
                    scheme
                )));
            }
        }

        if url.host_str().is_none() {
            return Err(AppError::Validation(format!("Missing host in URL {:?}", raw)));
        }

        Ok(Self::from_url(url))
    }

    pub(crate) fn from_url(mut url: url::Url) -> Self {
        url.set_fragment(None);
        Self(url.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `host[:port]` of the URL, lowercased.
    pub fn authority(&self) -> String {
        url::Url::parse(&self.0)
            .ok()
            .and_then(|url| {
                let host = url.host_str()?.to_string();
                Some(match url.port() {
                    Some(port) => format!("{}:{}", host, port),
                    None => host,
                })
            })
            .unwrap_or_default()
    }
}

impl fmt::Display for CanonicalUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CanonicalUrl {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for CanonicalUrl {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<CanonicalUrl> for String {
    fn from(value: CanonicalUrl) -> Self {
        value.0
    }
}

/// Result of classifying a URL against the local site
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlClass {
    LocalActor(LocalEntityRef),
    LocalObject(LocalEntityRef),
    Remote,
}

#[derive(Debug, Clone)]
struct SubtypeRoute {
    segment: String,
    subtype: String,
    kind: EntityKind,
}

/// Bidirectional mapping between local references and canonical URLs.
///
/// Subtype routes are tried in configuration order and the first route
/// whose segment prefixes the path wins, even when a later route would
/// match more specifically (`blog` shadows `blog/news`).
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    base: url::Url,
    /// Base URL without trailing slash
    base_str: String,
    activity_path: String,
    routes: Vec<SubtypeRoute>,
}

impl IdentityResolver {
    pub fn new(
        base_url: &str,
        activity_path: &str,
        routes: Vec<SubtypeRouteConfig>,
    ) -> Result<Self, AppError> {
        let base = url::Url::parse(base_url)
            .map_err(|e| AppError::Config(format!("Invalid base URL {:?}: {}", base_url, e)))?;
        if base.host_str().is_none() || !matches!(base.scheme(), "http" | "https") {
            return Err(AppError::Config(format!(
                "Base URL must be an absolute http(s) URL: {}",
                base_url
            )));
        }

        let base_str = base.as_str().trim_end_matches('/').to_string();
        let routes = routes
            .into_iter()
            .map(|route| SubtypeRoute {
                segment: route.segment.trim_matches('/').to_string(),
                subtype: route.subtype,
                kind: route.kind,
            })
            .collect();

        Ok(Self {
            base,
            base_str,
            activity_path: activity_path.trim_matches('/').to_string(),
            routes,
        })
    }

    pub fn from_config(config: &crate::config::AppConfig) -> Result<Self, AppError> {
        Self::new(
            &config.server.base_url(),
            &config.federation.activity_path,
            config.federation.subtype_routes(),
        )
    }

    /// Site base URL without trailing slash
    pub fn base_url(&self) -> &str {
        &self.base_str
    }

    /// Resolve a URL to a local reference, or `None` when it is not a
    /// locally federatable entity.
    pub fn to_local_ref(&self, url: &str) -> Option<LocalEntityRef> {
        let path = self.local_path(url)?;

        if let Some(rest) = strip_segment(&path, &self.activity_path) {
            return first_segment(rest).map(|id| LocalEntityRef::object(ACTIVITY_SUBTYPE, id));
        }

        let route = self
            .routes
            .iter()
            .find(|route| strip_segment(&path, &route.segment).is_some())?;
        let rest = strip_segment(&path, &route.segment)?;

        first_segment(rest).map(|id| LocalEntityRef {
            kind: route.kind,
            subtype: route.subtype.clone(),
            id: id.to_string(),
        })
    }

    /// Canonical URL of a local reference.
    pub fn to_canonical_url(&self, entity: &LocalEntityRef) -> CanonicalUrl {
        let segment = if entity.kind == EntityKind::Object && entity.subtype == ACTIVITY_SUBTYPE {
            self.activity_path.as_str()
        } else {
            self.routes
                .iter()
                .find(|route| route.subtype == entity.subtype)
                .map(|route| route.segment.as_str())
                .unwrap_or(entity.subtype.as_str())
        };

        let raw = format!("{}/{}/{}", self.base_str, segment, entity.id);
        match url::Url::parse(&raw) {
            Ok(url) => CanonicalUrl::from_url(url),
            Err(_) => {
                // Identifier is not URL-safe as-is; let the url crate escape it.
                let mut url = self.base.clone();
                if let Ok(mut segments) = url.path_segments_mut() {
                    segments.pop_if_empty();
                    segments.extend(segment.split('/'));
                    segments.push(&entity.id);
                }
                CanonicalUrl::from_url(url)
            }
        }
    }

    pub fn classify(&self, url: &str) -> UrlClass {
        match self.to_local_ref(url) {
            Some(entity) if entity.kind == EntityKind::Actor => UrlClass::LocalActor(entity),
            Some(entity) => UrlClass::LocalObject(entity),
            None => UrlClass::Remote,
        }
    }

    /// Whether a URL lives on this site at all, federatable or not.
    pub fn is_local(&self, url: &str) -> bool {
        self.local_path(url).is_some()
    }

    /// Path below the base URL without leading slash.
    fn local_path(&self, url: &str) -> Option<String> {
        let parsed = url::Url::parse(url.trim()).ok()?;

        if !parsed.scheme().eq_ignore_ascii_case(self.base.scheme())
            || parsed.host_str() != self.base.host_str()
            || parsed.port_or_known_default() != self.base.port_or_known_default()
        {
            return None;
        }

        let base_path = self.base.path().trim_end_matches('/');
        let rest = parsed.path().strip_prefix(base_path)?;
        if !rest.is_empty() && !rest.starts_with('/') {
            return None;
        }

        Some(rest.trim_start_matches('/').to_string())
    }
}

fn strip_segment<'a>(path: &'a str, segment: &str) -> Option<&'a str> {
    path.strip_prefix(segment)?.strip_prefix('/')
}

fn first_segment(rest: &str) -> Option<&str> {
    rest.split('/').next().filter(|segment| !segment.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(segment: &str, subtype: &str, kind: EntityKind) -> SubtypeRouteConfig {
        SubtypeRouteConfig {
            segment: segment.to_string(),
            subtype: subtype.to_string(),
            kind,
        }
    }

    fn resolver() -> IdentityResolver {
        IdentityResolver::new(
            "https://blog.example",
            "activities",
            vec![
                route("posts", "post", EntityKind::Object),
                route("pages", "page", EntityKind::Object),
                route("authors", "author", EntityKind::Actor),
            ],
        )
        .expect("valid resolver")
    }

    #[test]
    fn activity_template_yields_activity_object() {
        let entity = resolver()
            .to_local_ref("https://blog.example/activities/abc123/extra")
            .expect("activity ref");
        assert_eq!(entity, LocalEntityRef::object(ACTIVITY_SUBTYPE, "abc123"));
        assert_eq!(entity.target_kind(), TargetKind::Activity);
    }

    #[test]
    fn subtype_segment_yields_reference_of_route_kind() {
        let resolver = resolver();

        let post = resolver
            .to_local_ref("https://blog.example/posts/42?preview=true")
            .expect("post ref");
        assert_eq!(post, LocalEntityRef::object("post", "42"));
        assert_eq!(post.target_kind(), TargetKind::Object);

        let author = resolver
            .to_local_ref("https://blog.example/authors/alice/")
            .expect("author ref");
        assert_eq!(author, LocalEntityRef::actor("author", "alice"));
        assert_eq!(author.target_kind(), TargetKind::Actor);
    }

    #[test]
    fn unknown_paths_and_remote_urls_resolve_to_none() {
        let resolver = resolver();
        assert_eq!(resolver.to_local_ref("https://blog.example/about"), None);
        assert_eq!(resolver.to_local_ref("https://blog.example/posts/"), None);
        assert_eq!(resolver.to_local_ref("https://other.example/posts/1"), None);
        assert_eq!(resolver.to_local_ref("http://blog.example/posts/1"), None);
        assert_eq!(resolver.to_local_ref("https://blog.example:8443/posts/1"), None);
        assert_eq!(resolver.to_local_ref("not a url"), None);
    }

    #[test]
    fn first_matching_subtype_wins_over_longer_prefix() {
        let resolver = IdentityResolver::new(
            "https://blog.example",
            "activities",
            vec![
                route("blog", "entry", EntityKind::Object),
                route("blog/news", "news", EntityKind::Object),
            ],
        )
        .expect("valid resolver");

        // `blog/news/7` is shadowed by the earlier `blog` route.
        assert_eq!(
            resolver.to_local_ref("https://blog.example/blog/news/7"),
            Some(LocalEntityRef::object("entry", "news"))
        );
    }

    #[test]
    fn base_url_with_path_is_stripped() {
        let resolver = IdentityResolver::new(
            "https://example.com/site/",
            "activities",
            vec![route("posts", "post", EntityKind::Object)],
        )
        .expect("valid resolver");

        assert_eq!(
            resolver.to_local_ref("https://example.com/site/posts/9"),
            Some(LocalEntityRef::object("post", "9"))
        );
        assert_eq!(resolver.to_local_ref("https://example.com/sitemap/posts/9"), None);
        assert_eq!(
            resolver
                .to_canonical_url(&LocalEntityRef::object("post", "9"))
                .as_str(),
            "https://example.com/site/posts/9"
        );
    }

    #[test]
    fn canonical_url_round_trip_is_idempotent() {
        let resolver = resolver();
        for path in [
            "https://blog.example/posts/42",
            "https://blog.example/pages/about-us/",
            "https://blog.example/authors/alice",
            "https://blog.example/activities/01HXYZ",
            "https://BLOG.example/posts/7#comments",
        ] {
            let first = resolver.to_local_ref(path).expect("local path");
            let url = resolver.to_canonical_url(&first);
            let second = resolver.to_local_ref(url.as_str()).expect("round trip");
            assert_eq!(first, second, "round trip changed {}", path);
            assert_eq!(resolver.to_canonical_url(&second), url);
        }
    }

    #[test]
    fn classify_splits_actors_objects_and_remote() {
        let resolver = resolver();
        assert!(matches!(
            resolver.classify("https://blog.example/authors/alice"),
            UrlClass::LocalActor(_)
        ));
        assert!(matches!(
            resolver.classify("https://blog.example/posts/1"),
            UrlClass::LocalObject(_)
        ));
        assert_eq!(
            resolver.classify("https://mastodon.example/users/bob"),
            UrlClass::Remote
        );
    }

    #[test]
    fn canonical_url_normalizes_host_port_and_fragment() {
        let url = CanonicalUrl::parse("HTTPS://Remote.Example:443/users/Bob#main-key")
            .expect("valid url");
        assert_eq!(url.as_str(), "https://remote.example/users/Bob");
        assert_eq!(url.authority(), "remote.example");

        let with_port = CanonicalUrl::parse("http://remote.example:8080/u").expect("valid url");
        assert_eq!(with_port.authority(), "remote.example:8080");

        assert!(CanonicalUrl::parse("ftp://remote.example/x").is_err());
        assert!(CanonicalUrl::parse("/relative").is_err());
    }
}
