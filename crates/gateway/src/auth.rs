//! OIDC token validation with a bounded, TTL'd verdict cache.
//!
//! Raw tokens are never stored: the cache key is a SHA-256 digest. The cache
//! holds at most [`TOKEN_CACHE_CAPACITY`] entries with LRU eviction so a
//! flood of distinct tokens cannot grow memory without bound. Expired
//! entries are evicted eagerly on access and by a periodic sweeper.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use openidconnect::core::{CoreClient, CoreIdToken, CoreProviderMetadata};
use openidconnect::reqwest::async_http_client;
use openidconnect::{ClientId, IssuerUrl, Nonce};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

/// How long a verified token's claims stay cached.
pub const TOKEN_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Maximum number of cached verdicts.
pub const TOKEN_CACHE_CAPACITY: usize = 10_000;

/// Verified identity extracted from an OIDC token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    /// Raw OIDC subject identifier.
    pub sub: String,
    /// Email from the token claims.
    pub email: String,
    /// Kubernetes-safe name derived from the subject (DNS label format).
    pub user_id: String,
}

#[derive(Debug, Error)]
pub enum AuthError {
    /// The identity provider could not be reached at startup.
    #[error("OIDC provider discovery failed: {0}")]
    DiscoveryFailed(String),
    /// The token failed signature, issuer, audience, or expiry checks.
    #[error("invalid token: {0}")]
    InvalidToken(String),
    /// The token body is not a parseable ID token.
    #[error("extract claims: {0}")]
    ClaimsExtraction(String),
}

/// Converts an OIDC subject into a Kubernetes DNS-label-safe string.
///
/// `"auth0|12345"` becomes `"auth0-12345"`. Subjects that start with a digit
/// (Keycloak UUIDs) get a `u-` prefix so the result also satisfies RFC 1035.
/// The output is truncated to the user-id length budget.
pub fn sanitize_user_id(sub: &str) -> String {
    let mut out = String::with_capacity(sub.len());
    let mut last_was_hyphen = false;
    for c in sub.to_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            out.push(c);
            last_was_hyphen = false;
        } else if !last_was_hyphen {
            // Any run of non-alphanumerics collapses to a single hyphen.
            out.push('-');
            last_was_hyphen = true;
        }
    }
    let mut out = out.trim_matches('-').to_string();
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert_str(0, "u-");
    }
    if out.len() > devplane_api::names::MAX_USER_ID_LEN {
        out.truncate(devplane_api::names::MAX_USER_ID_LEN);
        out = out.trim_end_matches('-').to_string();
    }
    out
}

fn hash_token(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

struct CacheEntry {
    claims: Claims,
    expires_at: Instant,
    last_used: u64,
}

/// Bounded LRU with per-entry TTL. One lock guards both the key index and
/// the recency order; it is never held across I/O.
struct TokenCache {
    capacity: usize,
    ttl: Duration,
    entries: HashMap<String, CacheEntry>,
    /// use-sequence → key; the first entry is the least recently used.
    recency: BTreeMap<u64, String>,
    counter: u64,
}

impl TokenCache {
    fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity,
            ttl,
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            counter: 0,
        }
    }

    /// Returns unexpired cached claims, marking the entry most recently
    /// used. An expired entry is evicted eagerly.
    fn get(&mut self, key: &str, now: Instant) -> Option<Claims> {
        let (expired, seq) = {
            let entry = self.entries.get(key)?;
            (entry.expires_at <= now, entry.last_used)
        };
        if expired {
            self.entries.remove(key);
            self.recency.remove(&seq);
            return None;
        }
        self.counter += 1;
        let counter = self.counter;
        self.recency.remove(&seq);
        self.recency.insert(counter, key.to_string());
        let entry = self.entries.get_mut(key)?;
        entry.last_used = counter;
        Some(entry.claims.clone())
    }

    /// Inserts a fresh verdict, evicting the least-recently-used entry when
    /// at capacity.
    fn insert(&mut self, key: String, claims: Claims, now: Instant) {
        if let Some(old) = self.entries.remove(&key) {
            self.recency.remove(&old.last_used);
        }
        while self.entries.len() >= self.capacity {
            let Some((&oldest, _)) = self.recency.iter().next() else {
                break;
            };
            if let Some(evicted_key) = self.recency.remove(&oldest) {
                self.entries.remove(&evicted_key);
            }
        }
        self.counter += 1;
        self.recency.insert(self.counter, key.clone());
        self.entries.insert(
            key,
            CacheEntry {
                claims,
                expires_at: now + self.ttl,
                last_used: self.counter,
            },
        );
    }

    /// Drops every expired entry.
    fn sweep(&mut self, now: Instant) {
        let expired: Vec<(String, u64)> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, entry)| (key.clone(), entry.last_used))
            .collect();
        for (key, seq) in expired {
            self.entries.remove(&key);
            self.recency.remove(&seq);
        }
    }

    #[cfg(test)]
    fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Capability seam for bearer-token verification, so handlers can run
/// against a double.
#[async_trait::async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, raw_token: &str) -> Result<Claims, AuthError>;
}

/// Verifies OIDC bearer tokens against the identity provider and caches
/// verdicts.
pub struct Validator {
    client: CoreClient,
    cache: Arc<Mutex<TokenCache>>,
}

impl Validator {
    /// Performs OIDC discovery (fetching the provider's signing keys) and
    /// starts the periodic cache sweeper. The sweeper stops when the
    /// validator is dropped.
    pub async fn new(issuer_url: &str, client_id: &str) -> Result<Self, AuthError> {
        let issuer = IssuerUrl::new(issuer_url.to_string())
            .map_err(|e| AuthError::DiscoveryFailed(e.to_string()))?;
        let metadata = CoreProviderMetadata::discover_async(issuer, async_http_client)
            .await
            .map_err(|e| AuthError::DiscoveryFailed(e.to_string()))?;
        let client = CoreClient::from_provider_metadata(
            metadata,
            ClientId::new(client_id.to_string()),
            None,
        );

        let cache = Arc::new(Mutex::new(TokenCache::new(
            TOKEN_CACHE_CAPACITY,
            TOKEN_CACHE_TTL,
        )));

        let weak = Arc::downgrade(&cache);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TOKEN_CACHE_TTL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else { return };
                cache.lock().sweep(Instant::now());
                debug!("Swept expired token cache entries");
            }
        });

        Ok(Self { client, cache })
    }
}

#[async_trait::async_trait]
impl TokenValidator for Validator {
    /// Verifies `raw_token` and returns its claims, consulting the cache
    /// first. The verification checks signature, issuer, audience, and
    /// expiry against the discovered provider metadata.
    async fn validate(&self, raw_token: &str) -> Result<Claims, AuthError> {
        let key = hash_token(raw_token);
        if let Some(claims) = self.cache.lock().get(&key, Instant::now()) {
            return Ok(claims);
        }

        let id_token = CoreIdToken::from_str(raw_token)
            .map_err(|e| AuthError::ClaimsExtraction(e.to_string()))?;
        let verifier = self.client.id_token_verifier();
        // The nonce was already consumed by the login flow; bearer-style
        // verification accepts any.
        let token_claims = id_token
            .claims(&verifier, |_: Option<&Nonce>| Ok(()))
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;

        let sub = token_claims.subject().to_string();
        let email = token_claims
            .email()
            .map(|email| email.to_string())
            .unwrap_or_default();
        let claims = Claims {
            user_id: sanitize_user_id(&sub),
            sub,
            email,
        };

        self.cache
            .lock()
            .insert(key, claims.clone(), Instant::now());
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(name: &str) -> Claims {
        Claims {
            sub: name.to_string(),
            email: format!("{name}@example.com"),
            user_id: sanitize_user_id(name),
        }
    }

    #[test]
    fn test_sanitize_auth0_subject() {
        assert_eq!(sanitize_user_id("auth0|12345"), "auth0-12345");
    }

    #[test]
    fn test_sanitize_uuid_subject_gets_prefix() {
        assert_eq!(
            sanitize_user_id("12345678-abcd-efef-1234-abcdefabcdef"),
            "u-12345678-abcd-efef-1234-abcdefabcdef"
        );
    }

    #[test]
    fn test_sanitize_collapses_runs_and_trims() {
        assert_eq!(sanitize_user_id("John..Doe@Example.com"), "john-doe-example-com");
        assert_eq!(sanitize_user_id("||x||"), "x");
    }

    #[test]
    fn test_sanitize_unprintable_subject_is_empty() {
        let sub: String = std::iter::repeat('\u{1}').take(100).collect();
        assert_eq!(sanitize_user_id(&sub), "");
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        for sub in ["auth0|12345", "UPPER case", "123abc", &"x".repeat(100)] {
            let once = sanitize_user_id(sub);
            assert_eq!(sanitize_user_id(&once), once);
        }
    }

    #[test]
    fn test_sanitize_truncates_to_budget_without_trailing_hyphen() {
        let sub = format!("{}-{}", "a".repeat(48), "b".repeat(20));
        let out = sanitize_user_id(&sub);
        assert!(out.len() <= devplane_api::names::MAX_USER_ID_LEN);
        assert!(!out.ends_with('-'));
    }

    #[test]
    fn test_hash_token_is_stable_and_opaque() {
        let token = "header.payload.signature";
        assert_eq!(hash_token(token), hash_token(token));
        assert_ne!(hash_token(token), hash_token("other"));
        assert!(!hash_token(token).contains("payload"));
    }

    #[test]
    fn test_cache_hit_returns_same_claims() {
        let mut cache = TokenCache::new(10, Duration::from_secs(300));
        let now = Instant::now();
        cache.insert("a".to_string(), claims("alice"), now);
        assert_eq!(cache.get("a", now), Some(claims("alice")));
        assert_eq!(cache.get("missing", now), None);
    }

    #[test]
    fn test_cache_expired_entry_evicted_on_access() {
        let mut cache = TokenCache::new(10, Duration::from_secs(1));
        let now = Instant::now();
        cache.insert("a".to_string(), claims("alice"), now);
        let later = now + Duration::from_secs(2);
        assert_eq!(cache.get("a", later), None);
        assert!(!cache.contains("a"));
    }

    #[test]
    fn test_cache_lru_eviction_order() {
        // Capacity 3: insert A, B, C, touch A, insert D. B was least
        // recently used, so the cache ends up holding {A, C, D}.
        let mut cache = TokenCache::new(3, Duration::from_secs(300));
        let now = Instant::now();
        cache.insert("a".to_string(), claims("alice"), now);
        cache.insert("b".to_string(), claims("bob"), now);
        cache.insert("c".to_string(), claims("carol"), now);
        assert!(cache.get("a", now).is_some());
        cache.insert("d".to_string(), claims("dave"), now);

        assert_eq!(cache.len(), 3);
        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
        assert!(cache.contains("d"));
    }

    #[test]
    fn test_cache_reinsert_same_key_does_not_grow() {
        let mut cache = TokenCache::new(3, Duration::from_secs(300));
        let now = Instant::now();
        cache.insert("a".to_string(), claims("alice"), now);
        cache.insert("a".to_string(), claims("alice"), now);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_cache_sweep_drops_only_expired() {
        let mut cache = TokenCache::new(10, Duration::from_secs(10));
        let start = Instant::now();
        cache.insert("old".to_string(), claims("old"), start);
        let later = start + Duration::from_secs(8);
        cache.insert("new".to_string(), claims("new"), later);

        cache.sweep(start + Duration::from_secs(11));
        assert!(!cache.contains("old"));
        assert!(cache.contains("new"));
    }
}
