//! HTTP authentication manager.
//!
//! Credential records are scoped to (host, port, realm); at most one live
//! entry exists per scope and entries persist for the session. A challenge
//! observed on the wire updates the scope's record; generating a response
//! header reads it (Digest when the server supplied a nonce, Basic
//! otherwise). Callers own the prompting: a missing record surfaces as
//! [`AuthError::MissingCredentials`] so the front end can ask and retry.

mod digest;

pub use digest::NonceCountMode;

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use thiserror::Error;
use tracing::debug;

/// Errors from authentication handling.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No credentials recorded for the requested scope; prompt and retry.
    #[error("no credentials for the requested scope")]
    MissingCredentials,

    /// The server rejected a computed response.
    #[error("server rejected authentication response")]
    Rejected,

    /// Malformed challenge text.
    #[error("malformed authentication challenge: {0}")]
    MalformedChallenge(String),

    /// A scheme other than Basic or Digest.
    #[error("unsupported authentication scheme {0:?}")]
    UnsupportedScheme(String),
}

/// Scope key for credential records.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AuthScope {
    pub host: String,
    pub port: u16,
    pub realm: String,
}

impl AuthScope {
    pub fn new(host: &str, port: u16, realm: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            realm: realm.to_string(),
        }
    }
}

/// Authentication scheme named by a challenge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthScheme {
    Basic,
    Digest,
}

/// A parsed `WWW-Authenticate` (or `Proxy-Authenticate`) challenge.
#[derive(Clone, Debug)]
pub struct Challenge {
    pub scheme: AuthScheme,
    pub realm: String,
    pub nonce: Option<String>,
    pub opaque: Option<String>,
    pub qop: Vec<String>,
}

/// One credential record.
///
/// Challenge observations mutate it; response generation reads it apart
/// from the nonce-use counter.
#[derive(Clone, Debug)]
pub struct AuthEntry {
    pub realm: String,
    user: Option<String>,
    password: Option<String>,
    nonce: Option<String>,
    opaque: Option<String>,
    /// Requests made against the current server nonce.
    nonce_count: u32,
}

impl AuthEntry {
    fn new(realm: &str) -> Self {
        Self {
            realm: realm.to_string(),
            user: None,
            password: None,
            nonce: None,
            opaque: None,
            nonce_count: 0,
        }
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn nonce(&self) -> Option<&str> {
        self.nonce.as_deref()
    }

    pub fn has_credentials(&self) -> bool {
        self.user.is_some() && self.password.is_some()
    }

    fn credentials(&self) -> Result<(&str, &str), AuthError> {
        match (self.user.as_deref(), self.password.as_deref()) {
            (Some(u), Some(p)) => Ok((u, p)),
            _ => Err(AuthError::MissingCredentials),
        }
    }
}

/// Session-lifetime store of credential records.
#[derive(Debug)]
pub struct AuthManager {
    entries: HashMap<AuthScope, AuthEntry>,
    nc_mode: NonceCountMode,
}

impl AuthManager {
    pub fn new(nc_mode: NonceCountMode) -> Self {
        Self {
            entries: HashMap::new(),
            nc_mode,
        }
    }

    /// Stores or updates the record for a scope from an observed challenge.
    ///
    /// A changed server nonce resets the nonce-use counter; recorded
    /// credentials survive the update.
    pub fn record_challenge(&mut self, scope: &AuthScope, challenge: &Challenge) {
        let entry = self
            .entries
            .entry(scope.clone())
            .or_insert_with(|| AuthEntry::new(&scope.realm));
        entry.realm = challenge.realm.clone();
        if entry.nonce != challenge.nonce {
            entry.nonce = challenge.nonce.clone();
            entry.nonce_count = 0;
        }
        entry.opaque = challenge.opaque.clone();
        debug!(host = %scope.host, realm = %scope.realm, scheme = ?challenge.scheme, "auth challenge recorded");
    }

    /// Records user/password for a scope, creating the record if needed.
    pub fn set_credentials(&mut self, scope: &AuthScope, user: &str, password: &str) {
        let entry = self
            .entries
            .entry(scope.clone())
            .or_insert_with(|| AuthEntry::new(&scope.realm));
        entry.user = Some(user.to_string());
        entry.password = Some(password.to_string());
    }

    pub fn entry(&self, scope: &AuthScope) -> Option<&AuthEntry> {
        self.entries.get(scope)
    }

    /// True when a response header can be generated for the scope.
    pub fn has_credentials(&self, scope: &AuthScope) -> bool {
        self.entries
            .get(scope)
            .map(AuthEntry::has_credentials)
            .unwrap_or(false)
    }

    /// Builds an `Authorization` header value for the scope.
    ///
    /// Uses Digest when the record carries a server nonce, Basic otherwise.
    pub fn response_header(
        &mut self,
        scope: &AuthScope,
        method: &str,
        path: &str,
    ) -> Result<String, AuthError> {
        let nc_mode = self.nc_mode;
        let entry = self
            .entries
            .get_mut(scope)
            .ok_or(AuthError::MissingCredentials)?;
        if entry.nonce.is_some() {
            digest::digest_authorization(entry, method, path, nc_mode)
        } else {
            basic_authorization(entry)
        }
    }
}

impl Default for AuthManager {
    fn default() -> Self {
        Self::new(NonceCountMode::default())
    }
}

/// `Basic` credential pair, base64 over `user:password`.
fn basic_authorization(entry: &AuthEntry) -> Result<String, AuthError> {
    let (user, password) = entry.credentials()?;
    Ok(format!(
        "Basic {}",
        BASE64.encode(format!("{user}:{password}"))
    ))
}

/// Parses a `WWW-Authenticate` header value.
pub fn parse_challenge(text: &str) -> Result<Challenge, AuthError> {
    let text = text.trim();
    let (scheme_token, rest) = match text.split_once(char::is_whitespace) {
        Some((s, r)) => (s, r),
        None => (text, ""),
    };
    let scheme = match scheme_token.to_ascii_lowercase().as_str() {
        "basic" => AuthScheme::Basic,
        "digest" => AuthScheme::Digest,
        other => return Err(AuthError::UnsupportedScheme(other.to_string())),
    };

    let mut realm = None;
    let mut nonce = None;
    let mut opaque = None;
    let mut qop = Vec::new();
    for (key, value) in parse_params(rest)? {
        match key.as_str() {
            "realm" => realm = Some(value),
            "nonce" => nonce = Some(value),
            "opaque" => opaque = Some(value),
            "qop" => {
                qop = value
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            }
            // stale, algorithm, domain: recognized but unused here.
            _ => {}
        }
    }

    let realm = realm.ok_or_else(|| AuthError::MalformedChallenge("missing realm".into()))?;
    if scheme == AuthScheme::Digest && nonce.is_none() {
        return Err(AuthError::MalformedChallenge(
            "digest challenge without nonce".into(),
        ));
    }

    Ok(Challenge {
        scheme,
        realm,
        nonce,
        opaque,
        qop,
    })
}

/// Splits `k1="v1", k2=v2, ...` respecting quoted commas.
fn parse_params(s: &str) -> Result<Vec<(String, String)>, AuthError> {
    let mut params = Vec::new();
    let mut rest = s.trim();
    while !rest.is_empty() {
        let eq = rest
            .find('=')
            .ok_or_else(|| AuthError::MalformedChallenge(format!("expected k=v near {rest:?}")))?;
        let key = rest[..eq].trim().to_ascii_lowercase();
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(AuthError::MalformedChallenge(format!(
                "bad parameter name near {rest:?}"
            )));
        }
        rest = rest[eq + 1..].trim_start();

        let value = if let Some(stripped) = rest.strip_prefix('"') {
            let close = stripped
                .find('"')
                .ok_or_else(|| AuthError::MalformedChallenge("unterminated quote".into()))?;
            let value = stripped[..close].to_string();
            rest = stripped[close + 1..].trim_start();
            value
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            let value = rest[..end].trim().to_string();
            rest = &rest[end..];
            value
        };

        rest = rest.trim_start();
        if let Some(after) = rest.strip_prefix(',') {
            rest = after.trim_start();
        }
        params.push((key, value));
    }
    Ok(params)
}
