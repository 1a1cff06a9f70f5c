//! REGISTER request processing

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};

use flowpbx_sip_core::{HeaderName, Request, Response, StatusCode};
use flowpbx_sip_transport::TransportKind;

use crate::auth::{AuthOutcome, Authenticator};
use crate::bindings::{Binding, BindingStore};
use crate::error::Error;

/// Expiry policy for the registrar.
#[derive(Debug, Clone)]
pub struct RegistrarConfig {
    pub realm: String,
    pub min_expires: u32,
    pub max_expires: u32,
    /// Applied when neither the Contact nor the Expires header asks for a
    /// specific interval.
    pub default_expires: u32,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        RegistrarConfig {
            realm: "flowpbx".into(),
            min_expires: 60,
            max_expires: 7200,
            default_expires: 3600,
        }
    }
}

/// Directory facts the registrar needs about an extension. Implemented by
/// the engine on top of the entity repository.
#[async_trait::async_trait]
pub trait RegistrarDirectory: Send + Sync {
    /// Stored HA1 verifier, or `None` for an unknown extension.
    async fn ha1(&self, username: &str) -> Option<String>;
    /// Registration cap for the extension.
    async fn max_contacts(&self, username: &str) -> usize;
}

/// Authenticates REGISTER requests and maintains the binding table.
pub struct Registrar {
    config: RegistrarConfig,
    store: Arc<BindingStore>,
    auth: Arc<Authenticator>,
    directory: Arc<dyn RegistrarDirectory>,
}

impl Registrar {
    pub fn new(
        config: RegistrarConfig,
        store: Arc<BindingStore>,
        auth: Arc<Authenticator>,
        directory: Arc<dyn RegistrarDirectory>,
    ) -> Self {
        Registrar {
            config,
            store,
            auth,
            directory,
        }
    }

    pub fn bindings(&self) -> &Arc<BindingStore> {
        &self.store
    }

    /// Process a REGISTER and produce the response to send.
    pub async fn handle_register(
        &self,
        request: &Request,
        peer: SocketAddr,
        transport: TransportKind,
    ) -> Response {
        // Pre-fetch the claimed user's verifier so the digest check itself
        // stays synchronous.
        let claimed = request
            .headers
            .get(&HeaderName::Authorization)
            .and_then(|raw| {
                raw.parse::<flowpbx_sip_core::DigestCredentials>()
                    .ok()
                    .map(|c| c.username)
            });
        let fetched_ha1 = match &claimed {
            Some(user) => self.directory.ha1(user).await.map(|ha1| (user.clone(), ha1)),
            None => None,
        };

        let username = match self.auth.verify(request, HeaderName::Authorization, |u| {
            fetched_ha1
                .as_ref()
                .filter(|(user, _)| user == u)
                .map(|(_, ha1)| ha1.clone())
        }) {
            AuthOutcome::Authorized(username) => username,
            AuthOutcome::Challenge(challenge) => {
                let mut resp = request.response(StatusCode::UNAUTHORIZED);
                resp.headers
                    .push(HeaderName::WwwAuthenticate, challenge.to_string());
                return resp;
            }
            AuthOutcome::UnknownUser(user) => {
                warn!(%user, %peer, "REGISTER for unknown user");
                return request.response(StatusCode::FORBIDDEN);
            }
            AuthOutcome::BadCredentials(user) => {
                warn!(%user, %peer, "REGISTER with bad credentials");
                return request.response(StatusCode::FORBIDDEN);
            }
        };

        // The registered address-of-record is the To user; it must be the
        // account that authenticated.
        let aor = match request.headers.to_addr() {
            Ok(to) => to.uri.user.unwrap_or_default(),
            Err(_) => return request.response(StatusCode::BAD_REQUEST),
        };
        if aor != username {
            warn!(%username, %aor, "REGISTER for a different address-of-record");
            return request.response(StatusCode::FORBIDDEN);
        }

        let header_expires = request.headers.expires();

        // Wildcard un-register: `Contact: *` with `Expires: 0`.
        if request.headers.contact_is_wildcard() {
            if header_expires == Some(0) {
                self.store.remove_all(&username);
                let mut resp = request.response(StatusCode::OK);
                resp.ensure_to_tag();
                resp.headers.push(HeaderName::Expires, "0");
                return resp;
            }
            return request.response(StatusCode::BAD_REQUEST);
        }

        let contacts = match request.headers.contacts() {
            Ok(contacts) => contacts,
            Err(err) => {
                debug!(%err, "unparseable Contact header");
                return request.response(StatusCode::BAD_REQUEST);
            }
        };

        let max_contacts = self.directory.max_contacts(&username).await;
        let mut accepted: Vec<(flowpbx_sip_core::Address, u32)> = Vec::new();

        for contact in contacts {
            let requested = contact
                .expires()
                .or(header_expires)
                .unwrap_or(self.config.default_expires);

            if requested == 0 {
                self.store.remove(&username, &contact.uri);
                info!(user = %username, contact = %contact.uri, "un-registered");
                accepted.push((contact, 0));
                continue;
            }
            if requested < self.config.min_expires {
                let mut resp = request.response(StatusCode::INTERVAL_TOO_BRIEF);
                resp.headers
                    .push(HeaderName::MinExpires, self.config.min_expires.to_string());
                return resp;
            }
            let granted = requested.min(self.config.max_expires);

            let binding = Binding {
                contact_uri: contact.uri.clone(),
                source: peer,
                transport,
                expires_at: Instant::now() + Duration::from_secs(granted as u64),
                expires_wall: Utc::now() + chrono::Duration::seconds(granted as i64),
                user_agent: request
                    .headers
                    .get(&HeaderName::UserAgent)
                    .map(str::to_string),
                push_token: contact.push_token().map(str::to_string),
                push_platform: contact.push_platform().map(str::to_string),
                device_id: contact.device_id().map(str::to_string),
            };

            match self.store.upsert(&username, binding, max_contacts) {
                Ok(()) => {
                    info!(
                        user = %username,
                        contact = %contact.uri,
                        granted,
                        %transport,
                        "registered"
                    );
                    accepted.push((contact, granted));
                }
                Err(Error::MaxRegistrations { limit, .. }) => {
                    warn!(user = %username, limit, "registration cap exceeded");
                    return request.response(StatusCode::FORBIDDEN);
                }
                Err(err) => {
                    warn!(%err, "binding upsert failed");
                    return request.response(StatusCode::SERVICE_UNAVAILABLE);
                }
            }
        }

        let mut resp = request.response(StatusCode::OK);
        resp.ensure_to_tag();
        for (mut contact, granted) in accepted {
            contact.set_param("expires", Some(granted.to_string()));
            resp.headers.push(HeaderName::Contact, contact.to_string());
        }
        resp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nonce::NonceStore;
    use flowpbx_sip_core::types::auth::{digest_response, ha1, DigestChallenge};
    use flowpbx_sip_core::{Method, Uri};

    struct TestDirectory;

    #[async_trait::async_trait]
    impl RegistrarDirectory for TestDirectory {
        async fn ha1(&self, username: &str) -> Option<String> {
            (username == "201").then(|| ha1("201", "flowpbx", "secret"))
        }
        async fn max_contacts(&self, _username: &str) -> usize {
            2
        }
    }

    fn registrar() -> Registrar {
        let nonces = Arc::new(NonceStore::new());
        Registrar::new(
            RegistrarConfig::default(),
            Arc::new(BindingStore::new()),
            Arc::new(Authenticator::new("flowpbx", nonces)),
            Arc::new(TestDirectory),
        )
    }

    fn register_request(contact: &str, expires: Option<u32>, auth: Option<&str>) -> Request {
        let mut req = Request::new(Method::Register, "sip:pbx.local".parse::<Uri>().unwrap());
        req.headers.push(HeaderName::Via, "SIP/2.0/UDP 192.168.1.20:5060;branch=z9hG4bK1");
        req.headers.push(HeaderName::From, "<sip:201@pbx.local>;tag=f1");
        req.headers.push(HeaderName::To, "<sip:201@pbx.local>");
        req.headers.push(HeaderName::CallId, "reg-1");
        req.headers.push(HeaderName::CSeq, "1 REGISTER");
        req.headers.push(HeaderName::Contact, contact);
        if let Some(expires) = expires {
            req.headers.push(HeaderName::Expires, expires.to_string());
        }
        if let Some(auth) = auth {
            req.headers.push(HeaderName::Authorization, auth.to_string());
        }
        req
    }

    fn peer() -> SocketAddr {
        "192.168.1.20:5060".parse().unwrap()
    }

    fn authorized_header(challenge: &DigestChallenge) -> String {
        let user_ha1 = ha1("201", "flowpbx", "secret");
        let response = digest_response(
            &user_ha1,
            "REGISTER",
            "sip:pbx.local",
            &challenge.nonce,
            None,
            None,
            None,
        );
        format!(
            "Digest username=\"201\", realm=\"flowpbx\", nonce=\"{}\", uri=\"sip:pbx.local\", response=\"{response}\"",
            challenge.nonce
        )
    }

    #[tokio::test]
    async fn first_register_is_challenged() {
        let reg = registrar();
        let resp = reg.handle_register(
            &register_request("<sip:201@192.168.1.20>", Some(600), None),
            peer(),
            TransportKind::Udp,
        ).await;
        assert_eq!(resp.status, StatusCode::UNAUTHORIZED);
        assert!(resp.headers.get(&HeaderName::WwwAuthenticate).is_some());
    }

    #[tokio::test]
    async fn authorized_register_binds_and_reports_expiry() {
        let reg = registrar();
        let challenge = reg.auth.challenge(false);
        let resp = reg.handle_register(
            &register_request(
                "<sip:201@192.168.1.20>",
                Some(600),
                Some(&authorized_header(&challenge)),
            ),
            peer(),
            TransportKind::Udp,
        ).await;
        assert_eq!(resp.status, StatusCode::OK);
        let contact = resp.headers.contacts().unwrap().remove(0);
        assert_eq!(contact.expires(), Some(600));
        assert_eq!(reg.bindings().lookup("201").len(), 1);
    }

    #[tokio::test]
    async fn too_brief_expiry_rejected_with_minimum() {
        let reg = registrar();
        let challenge = reg.auth.challenge(false);
        let resp = reg.handle_register(
            &register_request(
                "<sip:201@192.168.1.20>",
                Some(10),
                Some(&authorized_header(&challenge)),
            ),
            peer(),
            TransportKind::Udp,
        ).await;
        assert_eq!(resp.status, StatusCode::INTERVAL_TOO_BRIEF);
        assert_eq!(resp.headers.get(&HeaderName::MinExpires), Some("60"));
    }

    #[tokio::test]
    async fn expiry_clamped_to_maximum() {
        let reg = registrar();
        let challenge = reg.auth.challenge(false);
        let resp = reg.handle_register(
            &register_request(
                "<sip:201@192.168.1.20>",
                Some(999_999),
                Some(&authorized_header(&challenge)),
            ),
            peer(),
            TransportKind::Udp,
        ).await;
        assert_eq!(resp.status, StatusCode::OK);
        let contact = resp.headers.contacts().unwrap().remove(0);
        assert_eq!(contact.expires(), Some(7200));
    }

    #[tokio::test]
    async fn zero_expires_unregisters() {
        let reg = registrar();
        let challenge = reg.auth.challenge(false);
        reg.handle_register(
            &register_request(
                "<sip:201@192.168.1.20>",
                Some(600),
                Some(&authorized_header(&challenge)),
            ),
            peer(),
            TransportKind::Udp,
        ).await;
        assert_eq!(reg.bindings().lookup("201").len(), 1);

        let challenge = reg.auth.challenge(false);
        let resp = reg.handle_register(
            &register_request(
                "<sip:201@192.168.1.20>",
                Some(0),
                Some(&authorized_header(&challenge)),
            ),
            peer(),
            TransportKind::Udp,
        ).await;
        assert_eq!(resp.status, StatusCode::OK);
        assert!(reg.bindings().lookup("201").is_empty());
    }

    #[tokio::test]
    async fn unknown_user_forbidden() {
        let reg = registrar();
        let challenge = reg.auth.challenge(false);
        let header = format!(
            "Digest username=\"999\", realm=\"flowpbx\", nonce=\"{}\", uri=\"sip:pbx.local\", response=\"00\"",
            challenge.nonce
        );
        let mut req = register_request("<sip:999@192.168.1.20>", Some(600), Some(&header));
        req.headers.set(HeaderName::From, "<sip:999@pbx.local>;tag=f1");
        req.headers.set(HeaderName::To, "<sip:999@pbx.local>");
        let resp = reg.handle_register(&req, peer(), TransportKind::Udp).await;
        assert_eq!(resp.status, StatusCode::FORBIDDEN);
    }
}
