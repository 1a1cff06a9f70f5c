//! Digest authentication primitives (RFC 2617 MD5 scheme)

use std::fmt;
use std::str::FromStr;

use md5::{Digest as _, Md5};

use crate::error::Error;

/// A server challenge carried in WWW-Authenticate / Proxy-Authenticate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub qop: Option<String>,
    pub opaque: Option<String>,
    pub stale: bool,
}

impl DigestChallenge {
    pub fn new(realm: impl Into<String>, nonce: impl Into<String>) -> Self {
        DigestChallenge {
            realm: realm.into(),
            nonce: nonce.into(),
            qop: Some("auth".into()),
            opaque: None,
            stale: false,
        }
    }

    pub fn stale(mut self) -> Self {
        self.stale = true;
        self
    }
}

impl fmt::Display for DigestChallenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Digest realm=\"{}\", nonce=\"{}\", algorithm=MD5",
            self.realm, self.nonce
        )?;
        if let Some(qop) = &self.qop {
            write!(f, ", qop=\"{qop}\"")?;
        }
        if let Some(opaque) = &self.opaque {
            write!(f, ", opaque=\"{opaque}\"")?;
        }
        if self.stale {
            write!(f, ", stale=true")?;
        }
        Ok(())
    }
}

/// Client credentials carried in Authorization / Proxy-Authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestCredentials {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
    pub qop: Option<String>,
    pub nc: Option<String>,
    pub cnonce: Option<String>,
    pub opaque: Option<String>,
}

impl FromStr for DigestCredentials {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .trim()
            .strip_prefix("Digest")
            .ok_or_else(|| Error::InvalidCredentials("not a Digest scheme".into()))?;

        let mut username = None;
        let mut realm = None;
        let mut nonce = None;
        let mut uri = None;
        let mut response = None;
        let mut qop = None;
        let mut nc = None;
        let mut cnonce = None;
        let mut opaque = None;

        for (key, value) in split_auth_params(rest) {
            let value = value.trim_matches('"').to_string();
            match key.to_ascii_lowercase().as_str() {
                "username" => username = Some(value),
                "realm" => realm = Some(value),
                "nonce" => nonce = Some(value),
                "uri" => uri = Some(value),
                "response" => response = Some(value),
                "qop" => qop = Some(value),
                "nc" => nc = Some(value),
                "cnonce" => cnonce = Some(value),
                "opaque" => opaque = Some(value),
                _ => {}
            }
        }

        let missing = |field: &str| Error::InvalidCredentials(format!("missing {field}"));
        Ok(DigestCredentials {
            username: username.ok_or_else(|| missing("username"))?,
            realm: realm.ok_or_else(|| missing("realm"))?,
            nonce: nonce.ok_or_else(|| missing("nonce"))?,
            uri: uri.ok_or_else(|| missing("uri"))?,
            response: response.ok_or_else(|| missing("response"))?,
            qop,
            nc,
            cnonce,
            opaque,
        })
    }
}

impl fmt::Display for DigestCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm=MD5",
            self.username, self.realm, self.nonce, self.uri, self.response
        )?;
        if let Some(qop) = &self.qop {
            write!(f, ", qop={qop}")?;
        }
        if let Some(nc) = &self.nc {
            write!(f, ", nc={nc}")?;
        }
        if let Some(cnonce) = &self.cnonce {
            write!(f, ", cnonce=\"{cnonce}\"")?;
        }
        if let Some(opaque) = &self.opaque {
            write!(f, ", opaque=\"{opaque}\"")?;
        }
        Ok(())
    }
}

/// Split `key=value, key="value, with comma"` pairs, respecting quotes.
fn split_auth_params(s: &str) -> Vec<(&str, &str)> {
    let mut out = Vec::new();
    let mut quoted = false;
    let mut start = 0;
    let bytes = s.as_bytes();
    for i in 0..=bytes.len() {
        let at_end = i == bytes.len();
        if !at_end && bytes[i] == b'"' {
            quoted = !quoted;
            continue;
        }
        if at_end || (bytes[i] == b',' && !quoted) {
            let part = s[start..i].trim();
            if let Some((k, v)) = part.split_once('=') {
                out.push((k.trim(), v.trim()));
            }
            start = i + 1;
        }
    }
    out
}

fn md5_hex(input: &str) -> String {
    use std::fmt::Write;

    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(32);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

/// HA1 = MD5(username:realm:password). This is the only password-derived
/// value the PBX stores for an extension.
pub fn ha1(username: &str, realm: &str, password: &str) -> String {
    md5_hex(&format!("{username}:{realm}:{password}"))
}

/// Compute the expected digest response for a request.
///
/// With `qop=auth` the full `nc`/`cnonce` form is used; without qop the
/// RFC 2069 compatibility form applies.
pub fn digest_response(
    ha1: &str,
    method: &str,
    uri: &str,
    nonce: &str,
    qop: Option<&str>,
    nc: Option<&str>,
    cnonce: Option<&str>,
) -> String {
    let ha2 = md5_hex(&format!("{method}:{uri}"));
    match (qop, nc, cnonce) {
        (Some(qop), Some(nc), Some(cnonce)) => {
            md5_hex(&format!("{ha1}:{nonce}:{nc}:{cnonce}:{qop}:{ha2}"))
        }
        _ => md5_hex(&format!("{ha1}:{nonce}:{ha2}")),
    }
}

/// Compare two digest strings without leaking the mismatch position.
pub fn digest_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_formats() {
        let ch = DigestChallenge::new("flowpbx", "abc123").stale();
        let text = ch.to_string();
        assert!(text.contains("realm=\"flowpbx\""));
        assert!(text.contains("nonce=\"abc123\""));
        assert!(text.contains("qop=\"auth\""));
        assert!(text.contains("stale=true"));
    }

    #[test]
    fn credentials_parse_with_quoted_commas() {
        let creds: DigestCredentials =
            "Digest username=\"201\", realm=\"flowpbx\", nonce=\"n1\", uri=\"sip:pbx\", response=\"feed\", qop=auth, nc=00000001, cnonce=\"xyz\""
                .parse()
                .unwrap();
        assert_eq!(creds.username, "201");
        assert_eq!(creds.nc.as_deref(), Some("00000001"));
    }

    #[test]
    fn rfc2617_example_digest() {
        // Worked example from RFC 2617 section 3.5.
        let ha1 = ha1("Mufasa", "testrealm@host.com", "Circle Of Life");
        let response = digest_response(
            &ha1,
            "GET",
            "/dir/index.html",
            "dcd98b7102dd2f0e8b11d0f600bfb0c093",
            Some("auth"),
            Some("00000001"),
            Some("0a4f113b"),
        );
        assert_eq!(response, "6629fae49393a05397450978507c4ef1");
    }

    #[test]
    fn digest_eq_rejects_length_mismatch() {
        assert!(digest_eq("abcd", "abcd"));
        assert!(!digest_eq("abcd", "abce"));
        assert!(!digest_eq("abcd", "abc"));
    }
}
