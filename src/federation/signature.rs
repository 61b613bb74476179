//! HTTP Signatures
//!
//! Signing and verification of federation requests following
//! draft-cavage-http-signatures as deployed across the fediverse:
//! https://docs.joinmastodon.org/spec/security/

use std::fmt;
use std::time::Duration;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use http::{HeaderMap, HeaderName, HeaderValue};
use rsa::pkcs1v15::{Signature as Pkcs1v15Signature, SigningKey, VerifyingKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::config::SignatureConfig;
use crate::error::AppError;

pub const ALGORITHM_RSA_SHA256: &str = "rsa-sha256";
pub const ALGORITHM_HS2019: &str = "hs2019";

/// Pseudo header covering method and path
pub const REQUEST_TARGET: &str = "(request-target)";

/// Headers signed on requests that carry a body
pub const BODY_SIGNED_HEADERS: [&str; 4] = [REQUEST_TARGET, "host", "date", "digest"];

/// Headers signed on body-less requests (GET)
pub const FETCH_SIGNED_HEADERS: [&str; 3] = [REQUEST_TARGET, "host", "date"];

/// The parts of an HTTP request that take part in a signature.
#[derive(Debug, Clone, Copy)]
pub struct SignableRequest<'a> {
    /// HTTP method, any case
    pub method: &'a str,
    /// Path and query, e.g. `/inbox?x=1`
    pub target: &'a str,
    pub headers: &'a HeaderMap,
}

/// A signature either just produced or parsed from a `Signature` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureContext {
    pub key_id: String,
    pub algorithm: String,
    /// Lowercased header names in signing order
    pub signed_headers: Vec<String>,
    pub signature: Vec<u8>,
}

impl SignatureContext {
    /// Actor URL owning the key (key id without fragment)
    pub fn actor_url(&self) -> &str {
        self.key_id.split('#').next().unwrap_or(&self.key_id)
    }
}

/// The local actor's private key and its published key id.
#[derive(Clone)]
pub struct LocalKey {
    key_id: String,
    private_key: RsaPrivateKey,
    public_key_pem: String,
}

impl fmt::Debug for LocalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalKey")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl LocalKey {
    /// Load a PKCS#8 (or legacy PKCS#1) PEM private key.
    pub fn from_pem(key_id: impl Into<String>, private_key_pem: &str) -> Result<Self, AppError> {
        use rsa::pkcs1::DecodeRsaPrivateKey;
        use rsa::pkcs8::{DecodePrivateKey, EncodePublicKey, LineEnding};

        let private_key = RsaPrivateKey::from_pkcs8_pem(private_key_pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(private_key_pem))
            .map_err(|e| AppError::Config(format!("Invalid private key: {}", e)))?;

        let public_key_pem = RsaPublicKey::from(&private_key)
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to encode public key: {}", e)))?;

        Ok(Self {
            key_id: key_id.into(),
            private_key,
            public_key_pem,
        })
    }

    /// Generate a fresh RSA key and return it as PKCS#8 PEM.
    pub fn generate_pem(bits: usize) -> Result<String, AppError> {
        use rsa::pkcs8::{EncodePrivateKey, LineEnding};

        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, bits)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Key generation failed: {}", e)))?;

        Ok(private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to encode private key: {}", e)))?
            .to_string())
    }

    /// The same keypair published under another key id.
    pub fn with_key_id(&self, key_id: impl Into<String>) -> Self {
        Self {
            key_id: key_id.into(),
            ..self.clone()
        }
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn public_key_pem(&self) -> &str {
        &self.public_key_pem
    }
}

/// Builds and checks `Signature` headers.
#[derive(Debug, Clone)]
pub struct SignatureCodec {
    default_headers: Vec<String>,
    max_clock_skew: Duration,
}

impl Default for SignatureCodec {
    fn default() -> Self {
        Self::from_config(&SignatureConfig::default())
    }
}

impl SignatureCodec {
    pub fn new(default_headers: Vec<String>, max_clock_skew: Duration) -> Self {
        Self {
            default_headers: default_headers
                .into_iter()
                .map(|name| name.to_ascii_lowercase())
                .collect(),
            max_clock_skew,
        }
    }

    pub fn from_config(config: &SignatureConfig) -> Self {
        Self::new(
            config.default_headers.clone(),
            Duration::from_secs(config.max_clock_skew_secs),
        )
    }

    /// Header list assumed when a signature omits `headers`
    pub fn default_headers(&self) -> &[String] {
        &self.default_headers
    }

    /// Canonical string covered by the signature, in the given order.
    pub fn signing_string(
        &self,
        request: &SignableRequest<'_>,
        header_names: &[String],
    ) -> Result<String, AppError> {
        let mut lines = Vec::with_capacity(header_names.len());

        for name in header_names {
            let name = name.to_ascii_lowercase();
            let value = if name == REQUEST_TARGET {
                format!("{} {}", request.method.to_ascii_lowercase(), request.target)
            } else {
                let values = request
                    .headers
                    .get_all(name.as_str())
                    .iter()
                    .map(|value| value.to_str().map(str::trim))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|_| {
                        AppError::SignatureInvalid(format!("Non-ASCII value in {} header", name))
                    })?;

                if values.is_empty() {
                    return Err(AppError::SignatureInvalid(format!(
                        "Signed header missing from request: {}",
                        name
                    )));
                }
                values.join(", ")
            };

            lines.push(format!("{}: {}", name, value));
        }

        Ok(lines.join("\n"))
    }

    /// Sign a request with RSA-SHA256 over `header_names`, in that order.
    pub fn sign(
        &self,
        request: &SignableRequest<'_>,
        key: &LocalKey,
        header_names: &[&str],
    ) -> Result<SignatureContext, AppError> {
        let signed_headers: Vec<String> = header_names
            .iter()
            .map(|name| name.to_ascii_lowercase())
            .collect();
        let signing_string = self
            .signing_string(request, &signed_headers)
            .map_err(|e| AppError::Validation(format!("Cannot sign request: {}", e)))?;

        let signing_key = SigningKey::<Sha256>::new(key.private_key.clone());
        let mut rng = rand::thread_rng();
        let signature = signing_key.sign_with_rng(&mut rng, signing_string.as_bytes());

        Ok(SignatureContext {
            key_id: key.key_id.clone(),
            algorithm: ALGORITHM_RSA_SHA256.to_string(),
            signed_headers,
            signature: signature.to_bytes().into_vec(),
        })
    }

    /// Render the `Signature` header value.
    ///
    /// `headers` is left out when it equals the default set.
    pub fn render(&self, context: &SignatureContext) -> String {
        let signature = BASE64.encode(&context.signature);
        if context.signed_headers == self.default_headers {
            format!(
                "keyId=\"{}\",algorithm=\"{}\",signature=\"{}\"",
                context.key_id, context.algorithm, signature
            )
        } else {
            format!(
                "keyId=\"{}\",algorithm=\"{}\",headers=\"{}\",signature=\"{}\"",
                context.key_id,
                context.algorithm,
                context.signed_headers.join(" "),
                signature
            )
        }
    }

    /// Parse a `Signature` header value.
    ///
    /// A missing `headers` parameter means the default header set. A
    /// missing `algorithm` is read as `hs2019` (derive from the key).
    pub fn parse(&self, header: &str) -> Result<SignatureContext, AppError> {
        let mut key_id = None;
        let mut algorithm = None;
        let mut headers = None;
        let mut signature = None;

        for (name, value) in parse_parameters(header)? {
            let slot = match name.as_str() {
                "keyId" => &mut key_id,
                "algorithm" => &mut algorithm,
                "headers" => &mut headers,
                "signature" => &mut signature,
                _ => continue,
            };
            if slot.replace(value).is_some() {
                return Err(AppError::SignatureInvalid(format!(
                    "Duplicate signature parameter: {}",
                    name
                )));
            }
        }

        let key_id = key_id
            .filter(|value| !value.is_empty())
            .ok_or_else(|| AppError::SignatureInvalid("Missing keyId".to_string()))?;

        let signed_headers = match headers {
            Some(list) => {
                let names: Vec<String> = list
                    .split_whitespace()
                    .map(|name| name.to_ascii_lowercase())
                    .collect();
                if names.is_empty() {
                    return Err(AppError::SignatureInvalid(
                        "Empty headers parameter".to_string(),
                    ));
                }
                names
            }
            None => self.default_headers.clone(),
        };

        let signature = signature
            .ok_or_else(|| AppError::SignatureInvalid("Missing signature".to_string()))?;
        let signature = BASE64
            .decode(signature.as_bytes())
            .map_err(|_| AppError::SignatureInvalid("Invalid signature encoding".to_string()))?;

        Ok(SignatureContext {
            key_id,
            algorithm: algorithm
                .map(|value| value.to_ascii_lowercase())
                .unwrap_or_else(|| ALGORITHM_HS2019.to_string()),
            signed_headers,
            signature,
        })
    }

    /// Verify `signature_header` against the request and a PEM public key.
    ///
    /// Returns the parsed signature on success, `SignatureInvalid` with a
    /// reason otherwise.
    pub fn check(
        &self,
        request: &SignableRequest<'_>,
        signature_header: &str,
        public_key_pem: &str,
    ) -> Result<SignatureContext, AppError> {
        let context = self.parse(signature_header)?;

        if context.algorithm != ALGORITHM_RSA_SHA256 && context.algorithm != ALGORITHM_HS2019 {
            return Err(AppError::SignatureInvalid(format!(
                "Unsupported signature algorithm: {}",
                context.algorithm
            )));
        }

        let signing_string = self.signing_string(request, &context.signed_headers)?;
        let public_key = parse_public_key(public_key_pem)?;
        let verifier = VerifyingKey::<Sha256>::new(public_key);

        let signature = Pkcs1v15Signature::try_from(context.signature.as_slice())
            .map_err(|e| AppError::SignatureInvalid(format!("Invalid signature format: {}", e)))?;

        verifier
            .verify(signing_string.as_bytes(), &signature)
            .map_err(|_| AppError::SignatureInvalid("Signature verification failed".to_string()))?;

        Ok(context)
    }

    pub fn verify(
        &self,
        request: &SignableRequest<'_>,
        signature_header: &str,
        public_key_pem: &str,
    ) -> bool {
        self.check(request, signature_header, public_key_pem).is_ok()
    }

    /// Reject requests whose `Date` is missing or outside the allowed skew.
    pub fn check_date(&self, headers: &HeaderMap, now: DateTime<Utc>) -> Result<(), AppError> {
        let date = headers
            .get(http::header::DATE)
            .ok_or_else(|| AppError::SignatureInvalid("Missing Date header".to_string()))?
            .to_str()
            .map_err(|_| AppError::SignatureInvalid("Invalid Date header".to_string()))?;

        let date = DateTime::parse_from_rfc2822(date)
            .map_err(|_| AppError::SignatureInvalid("Invalid Date format".to_string()))?;

        let skew = (now.timestamp() - date.timestamp()).unsigned_abs();
        if skew > self.max_clock_skew.as_secs() {
            return Err(AppError::SignatureInvalid(
                "Date header too old or in future".to_string(),
            ));
        }

        Ok(())
    }

    /// Produce the headers for an outgoing signed request.
    ///
    /// Returns `Host`, `Date`, `Digest` (when a body is present) and
    /// `Signature`, ready to be merged into the request.
    pub fn sign_outgoing(
        &self,
        method: &str,
        url: &str,
        body: Option<&[u8]>,
        key: &LocalKey,
    ) -> Result<HeaderMap, AppError> {
        self.sign_outgoing_at(method, url, body, key, Utc::now())
    }

    /// [`Self::sign_outgoing`] with an explicit `Date`.
    pub fn sign_outgoing_at(
        &self,
        method: &str,
        url: &str,
        body: Option<&[u8]>,
        key: &LocalKey,
        date: DateTime<Utc>,
    ) -> Result<HeaderMap, AppError> {
        let parsed =
            url::Url::parse(url).map_err(|e| AppError::Validation(format!("Invalid URL: {}", e)))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| AppError::Validation("Missing host in URL".to_string()))?;
        let authority = match parsed.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        let target = match parsed.query() {
            Some(query) => format!("{}?{}", parsed.path(), query),
            None => parsed.path().to_string(),
        };

        let mut headers = HeaderMap::new();
        insert_header(&mut headers, http::header::HOST, &authority)?;
        insert_header(&mut headers, http::header::DATE, &http_date(date))?;

        let header_names: &[&str] = match body {
            Some(body) => {
                insert_header(&mut headers, digest_header_name(), &generate_digest(body))?;
                &BODY_SIGNED_HEADERS
            }
            None => &FETCH_SIGNED_HEADERS,
        };

        let request = SignableRequest {
            method,
            target: &target,
            headers: &headers,
        };
        let context = self.sign(&request, key, header_names)?;
        let rendered = self.render(&context);
        insert_header(&mut headers, signature_header_name(), &rendered)?;

        Ok(headers)
    }
}

fn insert_header(headers: &mut HeaderMap, name: HeaderName, value: &str) -> Result<(), AppError> {
    let value = HeaderValue::from_str(value)
        .map_err(|_| AppError::Validation(format!("Invalid value for {} header", name)))?;
    headers.insert(name, value);
    Ok(())
}

pub(crate) fn digest_header_name() -> HeaderName {
    HeaderName::from_static("digest")
}

pub(crate) fn signature_header_name() -> HeaderName {
    HeaderName::from_static("signature")
}

fn parse_public_key(pem: &str) -> Result<RsaPublicKey, AppError> {
    use rsa::pkcs1::DecodeRsaPublicKey;
    use rsa::pkcs8::DecodePublicKey;

    RsaPublicKey::from_public_key_pem(pem.trim())
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem.trim()))
        .map_err(|e| AppError::SignatureInvalid(format!("Unusable public key: {}", e)))
}

/// Whether a PEM string holds an RSA public key we can verify with.
pub fn is_usable_public_key(pem: &str) -> bool {
    parse_public_key(pem).is_ok()
}

/// Split `k1="v1",k2="v2"` into pairs. Quoted values may contain commas.
fn parse_parameters(header: &str) -> Result<Vec<(String, String)>, AppError> {
    let malformed = || AppError::SignatureInvalid("Malformed Signature header".to_string());
    let mut params = Vec::new();
    let mut chars = header.trim().chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace() || *c == ',') {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut name = String::new();
        loop {
            match chars.next() {
                Some('=') => break,
                Some(',') | None => return Err(malformed()),
                Some(c) => name.push(c),
            }
        }
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(malformed());
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            loop {
                match chars.next() {
                    Some('"') => break,
                    Some('\\') => value.push(chars.next().ok_or_else(malformed)?),
                    Some(c) => value.push(c),
                    None => return Err(malformed()),
                }
            }
            while chars.peek().is_some_and(|c| c.is_whitespace()) {
                chars.next();
            }
            if chars.peek().is_some_and(|c| *c != ',') {
                return Err(malformed());
            }
        } else {
            while let Some(c) = chars.peek() {
                if *c == ',' {
                    break;
                }
                value.push(*c);
                chars.next();
            }
            value = value.trim().to_string();
        }

        params.push((name, value));
    }

    if params.is_empty() {
        return Err(malformed());
    }
    Ok(params)
}

/// Generate SHA-256 digest for body
///
/// # Returns
/// `SHA-256=base64(hash)`
pub fn generate_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    format!("SHA-256={}", BASE64.encode(hasher.finalize()))
}

/// Check a `Digest` header against the body. Only SHA-256 is accepted.
pub fn check_digest(headers: &HeaderMap, body: &[u8]) -> Result<(), AppError> {
    let header = headers
        .get("digest")
        .ok_or_else(|| AppError::SignatureInvalid("Missing Digest header".to_string()))?
        .to_str()
        .map_err(|_| AppError::SignatureInvalid("Invalid Digest header".to_string()))?;

    let mut hasher = Sha256::new();
    hasher.update(body);
    let expected = BASE64.encode(hasher.finalize());

    let matches = header.split(',').map(str::trim).any(|candidate| {
        candidate.split_once('=').is_some_and(|(algorithm, value)| {
            algorithm.trim().eq_ignore_ascii_case("sha-256") && value.trim() == expected
        })
    });

    if matches {
        Ok(())
    } else {
        Err(AppError::SignatureInvalid("Digest mismatch".to_string()))
    }
}

/// IMF-fixdate as used in the `Date` header
pub fn http_date(now: DateTime<Utc>) -> String {
    now.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Validate that signature keyId points to the same actor as the activity actor.
pub fn key_id_matches_actor(key_id: &str, actor_id: &str) -> bool {
    let key_actor = key_id.split('#').next().unwrap_or(key_id);
    let actor = actor_id.split('#').next().unwrap_or(actor_id);
    match (
        super::CanonicalUrl::parse(key_actor),
        super::CanonicalUrl::parse(actor),
    ) {
        (Ok(key_actor), Ok(actor)) => key_actor == actor,
        _ => false,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::OnceLock;

    /// One 1024-bit keypair shared by every test in the crate.
    pub(crate) fn test_key_pem() -> &'static str {
        static PEM: OnceLock<String> = OnceLock::new();
        PEM.get_or_init(|| LocalKey::generate_pem(1024).expect("key generation should work"))
    }

    pub(crate) fn test_key(key_id: &str) -> LocalKey {
        LocalKey::from_pem(key_id, test_key_pem()).expect("valid test key")
    }

    fn other_public_key_pem() -> &'static str {
        static PEM: OnceLock<String> = OnceLock::new();
        PEM.get_or_init(|| {
            let pem = LocalKey::generate_pem(1024).expect("key generation should work");
            LocalKey::from_pem("other", &pem)
                .expect("valid key")
                .public_key_pem()
                .to_string()
        })
    }

    const KEY_ID: &str = "https://local.example/actor#main-key";

    fn codec() -> SignatureCodec {
        SignatureCodec::default()
    }

    fn request_headers(body: &[u8]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("remote.example"));
        headers.insert(
            "date",
            HeaderValue::from_str(&http_date(Utc::now())).expect("date"),
        );
        headers.insert(
            "digest",
            HeaderValue::from_str(&generate_digest(body)).expect("digest"),
        );
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/activity+json"),
        );
        headers
    }

    fn signed(headers: &mut HeaderMap, names: &[&str]) -> String {
        let key = test_key(KEY_ID);
        let context = {
            let request = SignableRequest {
                method: "POST",
                target: "/inbox",
                headers,
            };
            codec().sign(&request, &key, names).expect("signed")
        };
        codec().render(&context)
    }

    fn request(headers: &HeaderMap) -> SignableRequest<'_> {
        SignableRequest {
            method: "POST",
            target: "/inbox",
            headers,
        }
    }

    #[test]
    fn sign_then_verify_round_trip() {
        let mut headers = request_headers(br#"{"type":"Follow"}"#);
        let rendered = signed(&mut headers, &BODY_SIGNED_HEADERS);
        let key = test_key(KEY_ID);

        assert!(codec().verify(&request(&headers), &rendered, key.public_key_pem()));
        let context = codec()
            .check(&request(&headers), &rendered, key.public_key_pem())
            .expect("valid");
        assert_eq!(context.key_id, KEY_ID);
        assert_eq!(context.actor_url(), "https://local.example/actor");
        assert_eq!(
            context.signed_headers,
            vec!["(request-target)", "host", "date", "digest"]
        );
    }

    #[test]
    fn signing_string_follows_advertised_order() {
        let headers = request_headers(b"{}");
        let date = headers["date"].to_str().expect("date").to_string();

        let forward = codec()
            .signing_string(
                &request(&headers),
                &["host".to_string(), "date".to_string()],
            )
            .expect("signing string");
        assert_eq!(forward, format!("host: remote.example\ndate: {}", date));

        let reversed = codec()
            .signing_string(
                &request(&headers),
                &["date".to_string(), "(request-target)".to_string()],
            )
            .expect("signing string");
        assert_eq!(reversed, format!("date: {}\n(request-target): post /inbox", date));
    }

    #[test]
    fn reordering_advertised_headers_breaks_verification() {
        let mut headers = request_headers(b"{}");
        let rendered = signed(&mut headers, &["host", "date"]);
        let reordered = rendered.replace("headers=\"host date\"", "headers=\"date host\"");
        assert_ne!(rendered, reordered);

        let key = test_key(KEY_ID);
        assert!(codec().verify(&request(&headers), &rendered, key.public_key_pem()));
        assert!(!codec().verify(&request(&headers), &reordered, key.public_key_pem()));
    }

    #[test]
    fn tampering_with_any_signed_header_fails() {
        let key = test_key(KEY_ID);
        for name in ["host", "date", "digest"] {
            let mut headers = request_headers(b"{}");
            let rendered = signed(&mut headers, &BODY_SIGNED_HEADERS);
            headers.insert(name, HeaderValue::from_static("tampered"));
            assert!(
                !codec().verify(&request(&headers), &rendered, key.public_key_pem()),
                "tampered {} still verified",
                name
            );
        }

        let mut headers = request_headers(b"{}");
        let rendered = signed(&mut headers, &BODY_SIGNED_HEADERS);
        let other_target = SignableRequest {
            method: "POST",
            target: "/users/alice/inbox",
            headers: &headers,
        };
        assert!(!codec().verify(&other_target, &rendered, key.public_key_pem()));
    }

    #[test]
    fn unsigned_headers_may_change() {
        let key = test_key(KEY_ID);
        let mut headers = request_headers(b"{}");
        let rendered = signed(&mut headers, &BODY_SIGNED_HEADERS);
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        assert!(codec().verify(&request(&headers), &rendered, key.public_key_pem()));
    }

    #[test]
    fn default_header_set_is_omitted_and_restored() {
        let key = test_key(KEY_ID);
        let mut headers = request_headers(b"{}");
        let rendered = signed(&mut headers, &["date"]);

        assert!(!rendered.contains("headers="));
        let parsed = codec().parse(&rendered).expect("parsed");
        assert_eq!(parsed.signed_headers, vec!["date"]);
        assert!(codec().verify(&request(&headers), &rendered, key.public_key_pem()));

        // Omitted headers never means "nothing signed": a changed date fails.
        headers.insert("date", HeaderValue::from_static("Mon, 01 Jan 2001 00:00:00 GMT"));
        assert!(!codec().verify(&request(&headers), &rendered, key.public_key_pem()));
    }

    #[test]
    fn non_default_header_list_is_rendered() {
        let mut headers = request_headers(b"{}");
        let rendered = signed(&mut headers, &BODY_SIGNED_HEADERS);
        assert!(rendered.contains("headers=\"(request-target) host date digest\""));
        assert!(rendered.starts_with("keyId=\"https://local.example/actor#main-key\",algorithm=\"rsa-sha256\","));
    }

    #[test]
    fn wrong_key_fails_verification() {
        let mut headers = request_headers(b"{}");
        let rendered = signed(&mut headers, &BODY_SIGNED_HEADERS);
        assert!(!codec().verify(&request(&headers), &rendered, other_public_key_pem()));
        assert!(!codec().verify(&request(&headers), &rendered, "not a pem"));
    }

    #[test]
    fn hs2019_is_accepted_and_unknown_algorithms_are_not() {
        let key = test_key(KEY_ID);
        let mut headers = request_headers(b"{}");
        let rendered = signed(&mut headers, &BODY_SIGNED_HEADERS);

        let hs2019 = rendered.replace("algorithm=\"rsa-sha256\"", "algorithm=\"hs2019\"");
        assert!(codec().verify(&request(&headers), &hs2019, key.public_key_pem()));

        let ed25519 = rendered.replace("algorithm=\"rsa-sha256\"", "algorithm=\"ed25519\"");
        match codec().check(&request(&headers), &ed25519, key.public_key_pem()) {
            Err(AppError::SignatureInvalid(msg)) => assert!(msg.contains("Unsupported")),
            other => panic!("expected unsupported algorithm, got: {other:?}"),
        }
    }

    #[test]
    fn missing_signed_header_fails_closed() {
        let key = test_key(KEY_ID);
        let mut headers = request_headers(b"{}");
        let rendered = signed(&mut headers, &BODY_SIGNED_HEADERS);
        headers.remove("digest");

        match codec().check(&request(&headers), &rendered, key.public_key_pem()) {
            Err(AppError::SignatureInvalid(msg)) => assert!(msg.contains("digest")),
            other => panic!("expected missing header error, got: {other:?}"),
        }
    }

    #[test]
    fn parse_rejects_malformed_parameter_strings() {
        let codec = codec();
        for header in [
            "",
            "garbage",
            "keyId=\"a\",signature=\"unterminated",
            "algorithm=\"rsa-sha256\",signature=\"ZmFrZQ==\"",
            "keyId=\"https://a/actor\",algorithm=\"rsa-sha256\"",
            "keyId=\"https://a/actor\",signature=\"***\"",
            "keyId=\"a\",keyId=\"b\",signature=\"ZmFrZQ==\"",
            "keyId=\"a\",headers=\"\",signature=\"ZmFrZQ==\"",
        ] {
            assert!(
                matches!(codec.parse(header), Err(AppError::SignatureInvalid(_))),
                "accepted {:?}",
                header
            );
        }
    }

    #[test]
    fn parse_handles_quoted_commas_and_missing_algorithm() {
        let parsed = codec()
            .parse("keyId=\"https://a.example/actor?x=1,2#key\", headers=\"(request-target) Host\", signature=\"ZmFrZQ==\"")
            .expect("parsed");
        assert_eq!(parsed.key_id, "https://a.example/actor?x=1,2#key");
        assert_eq!(parsed.algorithm, ALGORITHM_HS2019);
        assert_eq!(parsed.signed_headers, vec!["(request-target)", "host"]);
        assert_eq!(parsed.signature, b"fake".to_vec());
    }

    #[test]
    fn sign_outgoing_produces_verifiable_headers() {
        let key = test_key(KEY_ID);
        let body = br#"{"type":"Create"}"#;
        let headers = codec()
            .sign_outgoing("POST", "http://127.0.0.1:3000/inbox?shared=1", Some(body), &key)
            .expect("signed");

        assert_eq!(headers["host"], "127.0.0.1:3000");
        assert_eq!(headers["digest"].to_str().expect("digest"), generate_digest(body));
        assert!(check_digest(&headers, body).is_ok());
        assert!(codec().check_date(&headers, Utc::now()).is_ok());

        let signature = headers["signature"].to_str().expect("signature");
        let request = SignableRequest {
            method: "POST",
            target: "/inbox?shared=1",
            headers: &headers,
        };
        assert!(codec().verify(&request, signature, key.public_key_pem()));
    }

    #[test]
    fn sign_outgoing_without_body_skips_digest() {
        let key = test_key(KEY_ID);
        let headers = codec()
            .sign_outgoing("GET", "https://remote.example/users/bob", None, &key)
            .expect("signed");
        assert!(headers.get("digest").is_none());
        assert!(
            headers["signature"]
                .to_str()
                .expect("signature")
                .contains("headers=\"(request-target) host date\"")
        );
    }

    #[test]
    fn check_date_rejects_skewed_dates() {
        let mut headers = HeaderMap::new();
        let now = Utc::now();
        headers.insert(
            "date",
            HeaderValue::from_str(&http_date(now - chrono::Duration::minutes(10))).expect("date"),
        );
        assert!(codec().check_date(&headers, now).is_err());

        headers.insert(
            "date",
            HeaderValue::from_str(&http_date(now - chrono::Duration::minutes(2))).expect("date"),
        );
        assert!(codec().check_date(&headers, now).is_ok());

        headers.remove("date");
        assert!(codec().check_date(&headers, now).is_err());
    }

    #[test]
    fn digest_matches_known_sha256() {
        assert_eq!(
            generate_digest(b""),
            "SHA-256=47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU="
        );

        let mut headers = HeaderMap::new();
        headers.insert(
            "digest",
            HeaderValue::from_static("SHA-256=47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU="),
        );
        assert!(check_digest(&headers, b"").is_ok());
        assert!(check_digest(&headers, b"x").is_err());
    }

    #[test]
    fn key_id_matches_actor_accepts_same_actor() {
        assert!(key_id_matches_actor(
            "https://remote.example/users/alice#main-key",
            "https://remote.example/users/alice",
        ));
        assert!(key_id_matches_actor(
            "https://Remote.Example:443/users/alice#main-key",
            "https://remote.example/users/alice",
        ));
    }

    #[test]
    fn key_id_matches_actor_rejects_different_actor() {
        assert!(!key_id_matches_actor(
            "https://remote.example/users/bob#main-key",
            "https://remote.example/users/alice",
        ));
    }
}
