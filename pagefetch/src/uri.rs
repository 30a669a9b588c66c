//! Normalized resource identifiers.
//!
//! Cache identity, authentication scope, and per-host connection accounting
//! all key off the same normalized form, so two spellings of the same
//! resource (`HTTP://Host:80/a` vs `http://host/a`) share one cache entry.
//!
//! Normalization: scheme and host are lowercased, an explicit default port
//! is stripped, the fragment is dropped, an empty path becomes `/`. Path and
//! query bytes are otherwise preserved exactly - percent-decoding is a
//! rendering concern, not a cache-identity concern.

use std::fmt;

use thiserror::Error;

/// Errors from resource-identifier parsing.
#[derive(Debug, Error)]
pub enum UriError {
    /// Missing `scheme://` separator.
    #[error("missing scheme in {0:?}")]
    MissingScheme(String),

    /// Nothing between `://` and the path.
    #[error("empty host in {0:?}")]
    EmptyHost(String),

    /// Malformed host, e.g. an unclosed IPv6 bracket.
    #[error("invalid host in {0:?}")]
    InvalidHost(String),

    /// Port present but not a number in 1..=65535.
    #[error("invalid port in {0:?}")]
    InvalidPort(String),
}

/// A normalized resource identifier.
///
/// Construction via [`ResourceId::parse`] is the only way to obtain one, so
/// every `ResourceId` in the system is already in canonical form and string
/// equality is identity equality.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId {
    normalized: String,
    scheme_end: usize,
    host_start: usize,
    host_end: usize,
    port: u16,
    path_start: usize,
}

impl ResourceId {
    /// Parses and normalizes an identifier.
    pub fn parse(input: &str) -> Result<Self, UriError> {
        let input = input.trim();
        let (scheme, rest) = input
            .split_once("://")
            .ok_or_else(|| UriError::MissingScheme(input.to_string()))?;
        if scheme.is_empty() {
            return Err(UriError::MissingScheme(input.to_string()));
        }
        let scheme = scheme.to_ascii_lowercase();

        // Authority runs to the first '/', '?' or '#'.
        let authority_end = rest
            .find(|c| c == '/' || c == '?' || c == '#')
            .unwrap_or(rest.len());
        let (authority, tail) = rest.split_at(authority_end);

        let (host, explicit_port) = split_authority(authority, input)?;
        if host.is_empty() {
            return Err(UriError::EmptyHost(input.to_string()));
        }
        let host = host.to_ascii_lowercase();

        let default_port = default_port(&scheme);
        let port = explicit_port.unwrap_or(default_port);

        // Drop the fragment; keep path and query byte-exact.
        let tail = tail.split('#').next().unwrap_or("");
        let path_and_query = if tail.is_empty() || tail.starts_with('?') {
            format!("/{tail}")
        } else {
            tail.to_string()
        };

        let mut normalized = String::with_capacity(input.len());
        normalized.push_str(&scheme);
        normalized.push_str("://");
        let host_start = normalized.len();
        normalized.push_str(&host);
        let host_end = normalized.len();
        if port != default_port {
            normalized.push(':');
            normalized.push_str(&port.to_string());
        }
        let path_start = normalized.len();
        normalized.push_str(&path_and_query);

        Ok(Self {
            normalized,
            scheme_end: scheme.len(),
            host_start,
            host_end,
            port,
            path_start,
        })
    }

    /// The full normalized identifier.
    pub fn as_str(&self) -> &str {
        &self.normalized
    }

    pub fn scheme(&self) -> &str {
        &self.normalized[..self.scheme_end]
    }

    pub fn host(&self) -> &str {
        &self.normalized[self.host_start..self.host_end]
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Path plus query, always starting with `/`.
    ///
    /// This is the `uri` value that goes into a Digest Authorization header.
    pub fn path(&self) -> &str {
        &self.normalized[self.path_start..]
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.normalized)
    }
}

impl fmt::Debug for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResourceId({})", self.normalized)
    }
}

/// Splits `host[:port]`, keeping bracketed IPv6 literals (`[::1]`) intact.
///
/// The colons inside an IPv6 literal must not be mistaken for a port
/// separator, so the bracketed form is carved off before looking for one.
fn split_authority<'a>(
    authority: &'a str,
    input: &str,
) -> Result<(&'a str, Option<u16>), UriError> {
    let (host, port_text) = if let Some(inside) = authority.strip_prefix('[') {
        let close = inside
            .find(']')
            .ok_or_else(|| UriError::InvalidHost(input.to_string()))?;
        let host = &authority[..close + 2];
        match &inside[close + 1..] {
            "" => (host, None),
            rest => match rest.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None => return Err(UriError::InvalidHost(input.to_string())),
            },
        }
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };
    let explicit_port = match port_text {
        // A trailing bare colon is tolerated as "no port".
        None | Some("") => None,
        Some(port) => {
            let port: u16 = port
                .parse()
                .map_err(|_| UriError::InvalidPort(input.to_string()))?;
            if port == 0 {
                return Err(UriError::InvalidPort(input.to_string()));
            }
            Some(port)
        }
    };
    Ok((host, explicit_port))
}

fn default_port(scheme: &str) -> u16 {
    match scheme {
        "https" => 443,
        "ftp" => 21,
        _ => 80,
    }
}
