//! RFC 2617 Digest response computation.
//!
//! Hash chains per the RFC, all rendered as 32 lowercase hex characters:
//!
//! ```text
//! H(A1)    = MD5(user ":" realm ":" password)
//! H(A2)    = MD5(method ":" path)
//! response = MD5(H(A1) ":" nonce ":" nc ":" cnonce ":" "auth" ":" H(A2))
//! ```
//!
//! The cnonce comes from a CSPRNG on every response. The nonce count is a
//! configuration point: incrementing per reuse of a server nonce (proper
//! replay protection), or pinned to `00000001` for servers only ever seen
//! to be exercised that way.

use std::fmt::Write as _;

use md5::{Digest, Md5};
use rand::RngCore;

use super::{AuthEntry, AuthError};

/// Policy for the `nc` (nonce count) parameter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NonceCountMode {
    /// 8-hex-digit counter that increases per request reusing a nonce.
    #[default]
    Increment,
    /// Always `00000001`, matching single-request use.
    Fixed,
}

/// Builds a `Digest` Authorization header value, advancing the entry's
/// nonce-use counter according to `mode`.
pub(super) fn digest_authorization(
    entry: &mut AuthEntry,
    method: &str,
    path: &str,
    mode: NonceCountMode,
) -> Result<String, AuthError> {
    let nc = match mode {
        NonceCountMode::Fixed => 1,
        NonceCountMode::Increment => {
            entry.nonce_count += 1;
            entry.nonce_count
        }
    };
    let cnonce = fresh_cnonce();
    assemble(entry, method, path, &cnonce, nc)
}

/// Deterministic assembly with caller-supplied cnonce and nc.
///
/// `digest_authorization` is the only production caller (with a random
/// cnonce); tests use this directly against the RFC 2617 example vector.
pub(super) fn assemble(
    entry: &AuthEntry,
    method: &str,
    path: &str,
    cnonce: &str,
    nc: u32,
) -> Result<String, AuthError> {
    let (user, password) = entry.credentials()?;
    let nonce = entry.nonce.as_deref().ok_or(AuthError::MissingCredentials)?;
    let nc = format!("{nc:08x}");

    let ha1 = md5_hex(&[user.as_bytes(), b":", entry.realm.as_bytes(), b":", password.as_bytes()]);
    let ha2 = md5_hex(&[method.as_bytes(), b":", path.as_bytes()]);
    let response = md5_hex(&[
        ha1.as_bytes(),
        b":",
        nonce.as_bytes(),
        b":",
        nc.as_bytes(),
        b":",
        cnonce.as_bytes(),
        b":auth:",
        ha2.as_bytes(),
    ]);

    // Field order is fixed; servers are known to be picky about it.
    let mut header = String::from("Digest ");
    let _ = write!(
        header,
        "username=\"{user}\", realm=\"{realm}\", nonce=\"{nonce}\", uri=\"{path}\", \
         qop=auth, nc={nc}, cnonce=\"{cnonce}\", response=\"{response}\"",
        realm = entry.realm,
    );
    if let Some(opaque) = &entry.opaque {
        let _ = write!(header, ", opaque=\"{opaque}\"");
    }
    Ok(header)
}

/// Fresh unpredictable client nonce: hex MD5 of 16 CSPRNG bytes.
fn fresh_cnonce() -> String {
    let mut seed = [0u8; 16];
    rand::rng().fill_bytes(&mut seed);
    md5_hex(&[&seed])
}

fn md5_hex(parts: &[&[u8]]) -> String {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part);
    }
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(32);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn rfc_entry() -> AuthEntry {
        AuthEntry {
            realm: "testrealm@host.com".to_string(),
            user: Some("Mufasa".to_string()),
            password: Some("Circle Of Life".to_string()),
            nonce: Some("dcd98b7102dd2f0e8b11d0f600bfb0c093".to_string()),
            opaque: Some("5ccc069c403ebaf9f0171e9517f40e41".to_string()),
            nonce_count: 0,
        }
    }

    #[test]
    fn test_md5_hex_known_value() {
        // MD5("") from RFC 1321's test suite.
        assert_eq!(md5_hex(&[b""]), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(md5_hex(&[b"abc"]), "900150983cd24fb0d6963f7d28e17f72");
        // Split input hashes the same as whole input.
        assert_eq!(md5_hex(&[b"a", b"b", b"c"]), md5_hex(&[b"abc"]));
    }

    #[test]
    fn test_rfc2617_example_vector() {
        let header = assemble(&rfc_entry(), "GET", "/dir/index.html", "0a4f113b", 1).unwrap();
        assert!(
            header.contains("response=\"6629fae49393a05397450978507c4ef1\""),
            "wrong digest: {header}"
        );
    }

    #[test]
    fn test_header_field_order_and_quoting() {
        let header = assemble(&rfc_entry(), "GET", "/dir/index.html", "0a4f113b", 1).unwrap();
        assert_eq!(
            header,
            "Digest username=\"Mufasa\", realm=\"testrealm@host.com\", \
             nonce=\"dcd98b7102dd2f0e8b11d0f600bfb0c093\", uri=\"/dir/index.html\", \
             qop=auth, nc=00000001, cnonce=\"0a4f113b\", \
             response=\"6629fae49393a05397450978507c4ef1\", \
             opaque=\"5ccc069c403ebaf9f0171e9517f40e41\""
        );
    }

    #[test]
    fn test_opaque_omitted_when_absent() {
        let mut entry = rfc_entry();
        entry.opaque = None;
        let header = assemble(&entry, "GET", "/", "0a4f113b", 1).unwrap();
        assert!(header.ends_with('"'));
        assert!(!header.contains("opaque"));
    }

    #[test]
    fn test_nc_increments_per_request() {
        let mut entry = rfc_entry();
        let h1 = digest_authorization(&mut entry, "GET", "/a", NonceCountMode::Increment).unwrap();
        let h2 = digest_authorization(&mut entry, "GET", "/a", NonceCountMode::Increment).unwrap();
        assert!(h1.contains("nc=00000001"));
        assert!(h2.contains("nc=00000002"));
    }

    #[test]
    fn test_nc_fixed_mode_matches_reference() {
        let mut entry = rfc_entry();
        let h1 = digest_authorization(&mut entry, "GET", "/a", NonceCountMode::Fixed).unwrap();
        let h2 = digest_authorization(&mut entry, "GET", "/a", NonceCountMode::Fixed).unwrap();
        assert!(h1.contains("nc=00000001"));
        assert!(h2.contains("nc=00000001"));
    }

    #[test]
    fn test_method_is_not_hardcoded() {
        let e = rfc_entry();
        let get = assemble(&e, "GET", "/x", "c", 1).unwrap();
        let post = assemble(&e, "POST", "/x", "c", 1).unwrap();
        assert_ne!(get, post);
    }

    #[test]
    fn test_cnonce_values_are_pairwise_distinct() {
        let seen: HashSet<String> = (0..512).map(|_| fresh_cnonce()).collect();
        assert_eq!(seen.len(), 512, "cnonce collision across 512 draws");
        for c in &seen {
            assert_eq!(c.len(), 32);
            assert!(c.chars().all(|ch| ch.is_ascii_hexdigit() && !ch.is_ascii_uppercase()));
        }
    }

    #[test]
    fn test_missing_nonce_or_credentials() {
        let mut entry = rfc_entry();
        entry.nonce = None;
        assert!(assemble(&entry, "GET", "/", "c", 1).is_err());

        let mut entry = rfc_entry();
        entry.password = None;
        assert!(matches!(
            assemble(&entry, "GET", "/", "c", 1),
            Err(AuthError::MissingCredentials)
        ));
    }
}
