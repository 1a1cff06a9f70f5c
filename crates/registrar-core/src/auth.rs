//! Digest authentication against the nonce store

use std::sync::Arc;

use tracing::debug;

use flowpbx_sip_core::types::auth::{digest_eq, digest_response, DigestChallenge, DigestCredentials};
use flowpbx_sip_core::{HeaderName, Request};

use crate::nonce::{NonceCheck, NonceStore};

/// Result of authenticating a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Credentials verified; the authenticated username.
    Authorized(String),
    /// No (usable) credentials were presented: issue this challenge.
    Challenge(DigestChallenge),
    /// Credentials named a user the directory does not know.
    UnknownUser(String),
    /// Credentials were present but wrong.
    BadCredentials(String),
}

/// Verifies digest credentials on inbound requests.
///
/// The stored verifier is HA1 (`MD5(user:realm:password)`), so the realm is
/// fixed for the lifetime of the install.
pub struct Authenticator {
    realm: String,
    nonces: Arc<NonceStore>,
}

impl Authenticator {
    pub fn new(realm: impl Into<String>, nonces: Arc<NonceStore>) -> Self {
        Authenticator {
            realm: realm.into(),
            nonces,
        }
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// A fresh challenge, optionally flagged stale for nonce reuse/expiry.
    pub fn challenge(&self, stale: bool) -> DigestChallenge {
        let challenge = DigestChallenge::new(self.realm.clone(), self.nonces.issue());
        if stale {
            challenge.stale()
        } else {
            challenge
        }
    }

    /// Authenticate `request` using the credential header `header`
    /// (Authorization for REGISTER, Proxy-Authorization for INVITE).
    ///
    /// `ha1_lookup` maps a username to its stored HA1 verifier.
    pub fn verify<F>(&self, request: &Request, header: HeaderName, ha1_lookup: F) -> AuthOutcome
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw = match request.headers.get(&header) {
            Some(raw) => raw,
            None => return AuthOutcome::Challenge(self.challenge(false)),
        };

        let creds: DigestCredentials = match raw.parse() {
            Ok(creds) => creds,
            Err(err) => {
                debug!(%err, "unparseable credentials, re-challenging");
                return AuthOutcome::Challenge(self.challenge(false));
            }
        };

        if creds.realm != self.realm {
            return AuthOutcome::BadCredentials(creds.username);
        }

        let ha1 = match ha1_lookup(&creds.username) {
            Some(ha1) => ha1,
            None => return AuthOutcome::UnknownUser(creds.username),
        };

        // The nonce must be ours, fresh, and unused; consuming it here means
        // a replayed header can only ever produce a stale re-challenge.
        if self.nonces.check_and_consume(&creds.nonce) == NonceCheck::Stale {
            debug!(user = %creds.username, "stale nonce, re-challenging");
            return AuthOutcome::Challenge(self.challenge(true));
        }

        let expected = digest_response(
            &ha1,
            request.method.as_str(),
            &creds.uri,
            &creds.nonce,
            creds.qop.as_deref(),
            creds.nc.as_deref(),
            creds.cnonce.as_deref(),
        );

        if digest_eq(&expected, &creds.response) {
            AuthOutcome::Authorized(creds.username)
        } else {
            AuthOutcome::BadCredentials(creds.username)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowpbx_sip_core::types::auth::ha1;
    use flowpbx_sip_core::{Method, Uri};

    fn request_with_auth(auth: Option<String>) -> Request {
        let mut req = Request::new(Method::Register, "sip:pbx.local".parse::<Uri>().unwrap());
        req.headers.push(HeaderName::CallId, "c1");
        req.headers.push(HeaderName::CSeq, "1 REGISTER");
        if let Some(auth) = auth {
            req.headers.push(HeaderName::Authorization, auth);
        }
        req
    }

    fn authenticator() -> Authenticator {
        Authenticator::new("flowpbx", Arc::new(NonceStore::new()))
    }

    fn lookup(user: &str) -> Option<String> {
        (user == "201").then(|| ha1("201", "flowpbx", "pass201"))
    }

    #[test]
    fn missing_credentials_challenge() {
        let auth = authenticator();
        let outcome = auth.verify(&request_with_auth(None), HeaderName::Authorization, lookup);
        assert!(matches!(outcome, AuthOutcome::Challenge(c) if !c.stale));
    }

    #[test]
    fn full_round_trip_authorizes() {
        let auth = authenticator();
        let challenge = auth.challenge(false);

        let user_ha1 = ha1("201", "flowpbx", "pass201");
        let response = digest_response(
            &user_ha1,
            "REGISTER",
            "sip:pbx.local",
            &challenge.nonce,
            Some("auth"),
            Some("00000001"),
            Some("abc"),
        );
        let header = format!(
            "Digest username=\"201\", realm=\"flowpbx\", nonce=\"{}\", uri=\"sip:pbx.local\", response=\"{response}\", qop=auth, nc=00000001, cnonce=\"abc\"",
            challenge.nonce
        );

        let outcome = auth.verify(
            &request_with_auth(Some(header.clone())),
            HeaderName::Authorization,
            lookup,
        );
        assert_eq!(outcome, AuthOutcome::Authorized("201".into()));

        // Same header again: the nonce is consumed, so this is a replay.
        let outcome = auth.verify(&request_with_auth(Some(header)), HeaderName::Authorization, lookup);
        assert!(matches!(outcome, AuthOutcome::Challenge(c) if c.stale));
    }

    #[test]
    fn wrong_password_rejected() {
        let auth = authenticator();
        let challenge = auth.challenge(false);
        let wrong_ha1 = ha1("201", "flowpbx", "not-the-password");
        let response = digest_response(
            &wrong_ha1,
            "REGISTER",
            "sip:pbx.local",
            &challenge.nonce,
            None,
            None,
            None,
        );
        let header = format!(
            "Digest username=\"201\", realm=\"flowpbx\", nonce=\"{}\", uri=\"sip:pbx.local\", response=\"{response}\"",
            challenge.nonce
        );
        let outcome = auth.verify(&request_with_auth(Some(header)), HeaderName::Authorization, lookup);
        assert_eq!(outcome, AuthOutcome::BadCredentials("201".into()));
    }

    #[test]
    fn unknown_user_distinct_from_bad_password() {
        let auth = authenticator();
        let challenge = auth.challenge(false);
        let header = format!(
            "Digest username=\"999\", realm=\"flowpbx\", nonce=\"{}\", uri=\"sip:pbx.local\", response=\"00\"",
            challenge.nonce
        );
        let outcome = auth.verify(&request_with_auth(Some(header)), HeaderName::Authorization, lookup);
        assert_eq!(outcome, AuthOutcome::UnknownUser("999".into()));
    }
}
