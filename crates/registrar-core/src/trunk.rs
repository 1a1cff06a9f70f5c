//! Upstream trunk lifecycle
//!
//! Register-type trunks keep a registration alive against the provider's
//! registrar: re-register at half the granted expiry, exponential backoff
//! from 2 s to 120 s on failure, reset on success. IP-auth trunks never
//! register; inbound traffic is matched against their CIDR allow-list.
//! Both kinds enforce a concurrent-channel cap at INVITE admission.

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use flowpbx_sip_core::types::auth::{digest_response, ha1, DigestChallenge};
use flowpbx_sip_core::{
    random_token, Address, HeaderName, Message, Method, Request, Response, StatusCode, Uri,
};

use crate::error::{Error, Result};

/// Initial failure backoff.
pub const BACKOFF_START: Duration = Duration::from_secs(2);
/// Backoff ceiling.
pub const BACKOFF_CAP: Duration = Duration::from_secs(120);
/// How long to wait for a response to our own REGISTER/OPTIONS.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(32);

/// Double the backoff up to the ceiling.
pub fn advance_backoff(current: Duration) -> Duration {
    (current * 2).min(BACKOFF_CAP)
}

/// An IPv4/IPv6 network in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    net: IpAddr,
    prefix: u8,
}

impl Cidr {
    pub fn contains(&self, ip: IpAddr) -> bool {
        fn to_bits(ip: IpAddr) -> Option<(u128, u32)> {
            match ip {
                IpAddr::V4(v4) => Some((u32::from(v4) as u128, 32)),
                IpAddr::V6(v6) => Some((u128::from(v6), 128)),
            }
        }
        let (Some((net, width)), Some((addr, addr_width))) = (to_bits(self.net), to_bits(ip))
        else {
            return false;
        };
        if width != addr_width || u32::from(self.prefix) > width {
            return false;
        }
        let shift = width - u32::from(self.prefix);
        (net >> shift) == (addr >> shift)
    }
}

impl FromStr for Cidr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, prefix),
            None => (s, ""),
        };
        let net: IpAddr = addr
            .parse()
            .map_err(|_| Error::Transport(format!("bad CIDR {s:?}")))?;
        let max = if net.is_ipv4() { 32 } else { 128 };
        let prefix = if prefix.is_empty() {
            max
        } else {
            prefix
                .parse::<u8>()
                .ok()
                .filter(|p| *p <= max)
                .ok_or_else(|| Error::Transport(format!("bad CIDR prefix in {s:?}")))?
        };
        Ok(Cidr { net, prefix })
    }
}

/// Authentication mode for a trunk.
#[derive(Debug, Clone)]
pub enum TrunkKind {
    /// Maintain an outbound registration with digest credentials.
    Register {
        registrar: Uri,
        username: String,
        password: String,
        /// Username for the digest exchange when it differs from the
        /// registration user.
        auth_username: Option<String>,
        /// Requested registration interval in seconds.
        expiry: u32,
    },
    /// Static peer authenticated by source address.
    IpAuth { networks: Vec<Cidr> },
}

#[derive(Debug, Clone)]
pub struct TrunkConfig {
    pub id: u64,
    pub name: String,
    pub kind: TrunkKind,
    pub max_channels: u32,
    pub enabled: bool,
    /// Record calls arriving on this trunk.
    pub record_calls: bool,
    /// Cadence of OPTIONS health probes.
    pub options_interval: Duration,
}

/// Trunk lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrunkStatus {
    Idle,
    Registering,
    Registered,
    Failed,
    Disabled,
}

/// Outbound message path, implemented by the server over its transports.
#[async_trait]
pub trait SipSender: Send + Sync {
    async fn send(&self, message: Message, destination: SocketAddr) -> Result<()>;
}

struct TrunkRuntime {
    config: TrunkConfig,
    status: Mutex<TrunkStatus>,
    last_error: Mutex<Option<String>>,
    next_retry: Mutex<Option<Instant>>,
    /// Last resolved upstream address; inbound INVITEs from it are accepted.
    upstream_addr: Mutex<Option<SocketAddr>>,
    channels: AtomicU32,
}

impl TrunkRuntime {
    fn set_status(&self, status: TrunkStatus) {
        let mut current = self.status.lock();
        if *current != status {
            info!(trunk = %self.config.name, ?status, "trunk state change");
            *current = status;
        }
    }

    fn record_failure(&self, error: String, retry_in: Duration) {
        warn!(trunk = %self.config.name, %error, ?retry_in, "trunk failure");
        *self.last_error.lock() = Some(error);
        *self.next_retry.lock() = Some(Instant::now() + retry_in);
        self.set_status(TrunkStatus::Failed);
    }
}

/// Releases a trunk channel slot on drop.
pub struct ChannelGuard {
    runtime: Arc<TrunkRuntime>,
}

impl ChannelGuard {
    pub fn trunk_id(&self) -> u64 {
        self.runtime.config.id
    }
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        self.runtime.channels.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Owns every configured trunk's runtime state.
pub struct TrunkManager {
    trunks: DashMap<u64, Arc<TrunkRuntime>>,
    /// Call-ID → response channel for in-flight trunk transactions.
    response_routes: Arc<DashMap<String, mpsc::Sender<Response>>>,
}

impl Default for TrunkManager {
    fn default() -> Self {
        TrunkManager::new()
    }
}

impl TrunkManager {
    pub fn new() -> Self {
        TrunkManager {
            trunks: DashMap::new(),
            response_routes: Arc::new(DashMap::new()),
        }
    }

    /// Register a trunk with the manager. Disabled trunks are tracked but
    /// never admitted or registered.
    pub fn add_trunk(&self, config: TrunkConfig) {
        let status = if config.enabled {
            TrunkStatus::Idle
        } else {
            TrunkStatus::Disabled
        };
        self.trunks.insert(
            config.id,
            Arc::new(TrunkRuntime {
                config,
                status: Mutex::new(status),
                last_error: Mutex::new(None),
                next_retry: Mutex::new(None),
                upstream_addr: Mutex::new(None),
                channels: AtomicU32::new(0),
            }),
        );
    }

    pub fn status(&self, id: u64) -> Option<TrunkStatus> {
        self.trunks.get(&id).map(|t| *t.status.lock())
    }

    pub fn last_error(&self, id: u64) -> Option<String> {
        self.trunks.get(&id).and_then(|t| t.last_error.lock().clone())
    }

    pub fn next_retry(&self, id: u64) -> Option<Instant> {
        self.trunks.get(&id).and_then(|t| *t.next_retry.lock())
    }

    pub fn record_calls(&self, id: u64) -> bool {
        self.trunks
            .get(&id)
            .map(|t| t.config.record_calls)
            .unwrap_or(false)
    }

    pub fn active_channels(&self, id: u64) -> u32 {
        self.trunks
            .get(&id)
            .map(|t| t.channels.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Admit a call onto a trunk, holding a channel slot until the guard
    /// drops. Compare-and-increment keeps the counter under the cap even
    /// with racing INVITEs.
    pub fn try_admit(&self, id: u64) -> Result<ChannelGuard> {
        let runtime = self
            .trunks
            .get(&id)
            .map(|t| t.clone())
            .ok_or(Error::UnknownTrunk(id))?;
        if *runtime.status.lock() == TrunkStatus::Disabled {
            return Err(Error::TrunkDisabled(id));
        }
        let limit = runtime.config.max_channels;
        let mut current = runtime.channels.load(Ordering::Acquire);
        loop {
            if current >= limit {
                return Err(Error::ChannelsExhausted { trunk: id, limit });
            }
            match runtime.channels.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(ChannelGuard { runtime }),
                Err(seen) => current = seen,
            }
        }
    }

    /// Find the enabled trunk that accepts inbound traffic from `source`:
    /// an IP-auth trunk whose allow-list matches, or a register trunk whose
    /// resolved upstream it is.
    pub fn match_inbound(&self, source: IpAddr) -> Option<u64> {
        for entry in self.trunks.iter() {
            let runtime = entry.value();
            if *runtime.status.lock() == TrunkStatus::Disabled {
                continue;
            }
            match &runtime.config.kind {
                TrunkKind::IpAuth { networks } => {
                    if networks.iter().any(|n| n.contains(source)) {
                        return Some(runtime.config.id);
                    }
                }
                TrunkKind::Register { .. } => {
                    if runtime.upstream_addr.lock().map(|a| a.ip()) == Some(source) {
                        return Some(runtime.config.id);
                    }
                }
            }
        }
        None
    }

    /// Deliver a response belonging to one of our own client transactions.
    /// Returns false when no trunk task is waiting on this Call-ID.
    pub fn route_response(&self, call_id: &str, response: Response) -> bool {
        if let Some(route) = self.response_routes.get(call_id) {
            route.try_send(response).is_ok()
        } else {
            false
        }
    }

    /// Start the registration task for a register-type trunk and the
    /// OPTIONS health probe for any enabled trunk.
    pub fn spawn_trunk_tasks(
        &self,
        id: u64,
        sender: Arc<dyn SipSender>,
        local_contact: Address,
    ) -> Result<()> {
        let runtime = self
            .trunks
            .get(&id)
            .map(|t| t.clone())
            .ok_or(Error::UnknownTrunk(id))?;
        if !runtime.config.enabled {
            return Ok(());
        }
        if matches!(runtime.config.kind, TrunkKind::Register { .. }) {
            tokio::spawn(registration_task(
                runtime.clone(),
                sender.clone(),
                self.response_routes.clone(),
                local_contact.clone(),
            ));
        }
        tokio::spawn(options_probe_task(
            runtime,
            sender,
            self.response_routes.clone(),
            local_contact,
        ));
        Ok(())
    }
}

async fn resolve(uri: &Uri) -> Result<SocketAddr> {
    let target = uri.host_port();
    tokio::net::lookup_host(target.clone())
        .await
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or(Error::RegistrarUnresolvable(target))
}

fn base_request(method: Method, uri: Uri, call_id: &str, cseq: u32, contact: &Address) -> Request {
    let method_name = method.as_str().to_string();
    let mut req = Request::new(method, uri.clone());
    let host = uri.host.clone();
    req.headers.push(
        HeaderName::Via,
        format!(
            "SIP/2.0/UDP {};branch={}{}",
            contact.uri.host_port(),
            flowpbx_sip_core::types::headers::Via::BRANCH_COOKIE,
            random_token(12)
        ),
    );
    req.headers.push(HeaderName::MaxForwards, "70");
    let mut from = Address::new(Uri::sip(uri.user.clone().unwrap_or_default(), host.clone()));
    from.set_tag(random_token(8));
    req.headers.push(HeaderName::From, from.to_string());
    req.headers.push(
        HeaderName::To,
        Address::new(Uri::sip(uri.user.clone().unwrap_or_default(), host)).to_string(),
    );
    req.headers.push(HeaderName::CallId, call_id.to_string());
    req.headers
        .push(HeaderName::CSeq, format!("{cseq} {method_name}"));
    req.headers.push(HeaderName::Contact, contact.to_string());
    req
}

/// Compute digest credentials for a trunk challenge.
fn trunk_credentials(
    challenge: &DigestChallenge,
    username: &str,
    password: &str,
    method: &Method,
    uri: &Uri,
) -> String {
    let user_ha1 = ha1(username, &challenge.realm, password);
    let cnonce = random_token(8);
    let (qop, nc) = match challenge.qop.as_deref() {
        Some(_) => (Some("auth"), Some("00000001")),
        None => (None, None),
    };
    let response = digest_response(
        &user_ha1,
        method.as_str(),
        &uri.to_string(),
        &challenge.nonce,
        qop,
        nc,
        qop.map(|_| cnonce.as_str()),
    );
    let mut header = format!(
        "Digest username=\"{username}\", realm=\"{}\", nonce=\"{}\", uri=\"{uri}\", response=\"{response}\", algorithm=MD5",
        challenge.realm, challenge.nonce
    );
    if qop.is_some() {
        header.push_str(&format!(", qop=auth, nc=00000001, cnonce=\"{cnonce}\""));
    }
    header
}

fn parse_challenge(response: &Response) -> Option<DigestChallenge> {
    let raw = response
        .headers
        .get(&HeaderName::WwwAuthenticate)
        .or_else(|| response.headers.get(&HeaderName::ProxyAuthenticate))?;
    let rest = raw.trim().strip_prefix("Digest")?;
    let mut realm = None;
    let mut nonce = None;
    let mut qop = None;
    for part in rest.split(',') {
        let (key, value) = part.split_once('=')?;
        let value = value.trim().trim_matches('"');
        match key.trim().to_ascii_lowercase().as_str() {
            "realm" => realm = Some(value.to_string()),
            "nonce" => nonce = Some(value.to_string()),
            "qop" => qop = Some(value.to_string()),
            _ => {}
        }
    }
    Some(DigestChallenge {
        realm: realm?,
        nonce: nonce?,
        qop,
        opaque: None,
        stale: false,
    })
}

/// Granted registration interval from a 200 OK.
fn granted_expiry(response: &Response, requested: u32) -> u32 {
    if let Some(expires) = response.headers.expires() {
        return expires;
    }
    if let Ok(contacts) = response.headers.contacts() {
        if let Some(expires) = contacts.iter().find_map(|c| c.expires()) {
            return expires;
        }
    }
    requested
}

/// Long-running registration loop for one register-type trunk.
async fn registration_task(
    runtime: Arc<TrunkRuntime>,
    sender: Arc<dyn SipSender>,
    routes: Arc<DashMap<String, mpsc::Sender<Response>>>,
    local_contact: Address,
) {
    let TrunkKind::Register {
        registrar,
        username,
        password,
        auth_username,
        expiry,
    } = runtime.config.kind.clone()
    else {
        return;
    };
    let auth_user = auth_username.unwrap_or_else(|| username.clone());
    let register_uri = Uri::sip(username.clone(), registrar.host.clone());

    let call_id = format!("trunk-{}-{}", runtime.config.id, random_token(12));
    let (resp_tx, mut resp_rx) = mpsc::channel(4);
    routes.insert(call_id.clone(), resp_tx);

    let mut backoff = BACKOFF_START;
    let mut cseq: u32 = 0;

    loop {
        if *runtime.status.lock() == TrunkStatus::Disabled {
            break;
        }
        runtime.set_status(TrunkStatus::Registering);

        let outcome = register_once(
            &runtime,
            sender.as_ref(),
            &mut resp_rx,
            &registrar,
            &register_uri,
            &call_id,
            &mut cseq,
            &local_contact,
            &auth_user,
            &password,
            expiry,
        )
        .await;

        match outcome {
            Ok(granted) => {
                runtime.set_status(TrunkStatus::Registered);
                *runtime.last_error.lock() = None;
                *runtime.next_retry.lock() = None;
                backoff = BACKOFF_START;
                // Refresh at half the granted interval.
                let refresh = Duration::from_secs(u64::from(granted.max(2)) / 2);
                debug!(trunk = %runtime.config.name, granted, "registered; refresh in {refresh:?}");
                tokio::time::sleep(refresh).await;
            }
            Err(err) => {
                runtime.record_failure(err.to_string(), backoff);
                tokio::time::sleep(backoff).await;
                backoff = advance_backoff(backoff);
            }
        }
    }
    routes.remove(&call_id);
}

/// One REGISTER exchange, following a single digest challenge.
#[allow(clippy::too_many_arguments)]
async fn register_once(
    runtime: &TrunkRuntime,
    sender: &dyn SipSender,
    resp_rx: &mut mpsc::Receiver<Response>,
    registrar: &Uri,
    register_uri: &Uri,
    call_id: &str,
    cseq: &mut u32,
    local_contact: &Address,
    auth_user: &str,
    password: &str,
    expiry: u32,
) -> Result<u32> {
    let dest = resolve(registrar).await?;
    *runtime.upstream_addr.lock() = Some(dest);

    // Drain responses from a previous attempt.
    while resp_rx.try_recv().is_ok() {}

    *cseq += 1;
    let mut request = base_request(
        Method::Register,
        register_uri.clone(),
        call_id,
        *cseq,
        local_contact,
    );
    request
        .headers
        .push(HeaderName::Expires, expiry.to_string());
    sender.send(Message::Request(request), dest).await?;

    let mut authenticated = false;
    loop {
        let response = tokio::time::timeout(RESPONSE_TIMEOUT, resp_rx.recv())
            .await
            .map_err(|_| Error::Transport("timeout waiting for registrar response".into()))?
            .ok_or_else(|| Error::Transport("response channel closed".into()))?;

        match response.status {
            status if status.is_provisional() => continue,
            StatusCode::OK => return Ok(granted_expiry(&response, expiry)),
            StatusCode::UNAUTHORIZED | StatusCode::PROXY_AUTHENTICATION_REQUIRED
                if !authenticated =>
            {
                let challenge = parse_challenge(&response).ok_or_else(|| {
                    Error::Transport("challenge without usable digest parameters".into())
                })?;
                authenticated = true;
                *cseq += 1;
                let mut request = base_request(
                    Method::Register,
                    register_uri.clone(),
                    call_id,
                    *cseq,
                    local_contact,
                );
                request
                    .headers
                    .push(HeaderName::Expires, expiry.to_string());
                request.headers.push(
                    HeaderName::Authorization,
                    trunk_credentials(
                        &challenge,
                        auth_user,
                        password,
                        &Method::Register,
                        register_uri,
                    ),
                );
                sender.send(Message::Request(request), dest).await?;
            }
            status => {
                return Err(Error::Transport(format!(
                    "registrar answered {}",
                    status.as_u16()
                )))
            }
        }
    }
}

/// Periodic OPTIONS health probe for one trunk.
async fn options_probe_task(
    runtime: Arc<TrunkRuntime>,
    sender: Arc<dyn SipSender>,
    routes: Arc<DashMap<String, mpsc::Sender<Response>>>,
    local_contact: Address,
) {
    let target = match &runtime.config.kind {
        TrunkKind::Register { registrar, .. } => registrar.clone(),
        // IP trunks are probed at their first configured network address
        // only when it names a single host.
        TrunkKind::IpAuth { networks } => match networks.first() {
            Some(cidr) if cidr.prefix == if cidr.net.is_ipv4() { 32 } else { 128 } => {
                Uri::sip("ping", cidr.net.to_string())
            }
            _ => return,
        },
    };

    let mut tick = tokio::time::interval(runtime.config.options_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut cseq = 0u32;

    loop {
        tick.tick().await;
        if *runtime.status.lock() == TrunkStatus::Disabled {
            break;
        }
        let call_id = format!("ping-{}-{}", runtime.config.id, random_token(12));
        let (resp_tx, mut resp_rx) = mpsc::channel(1);
        routes.insert(call_id.clone(), resp_tx);

        cseq += 1;
        let probe = async {
            let dest = resolve(&target).await?;
            let request = base_request(
                Method::Options,
                target.clone(),
                &call_id,
                cseq,
                &local_contact,
            );
            sender.send(Message::Request(request), dest).await?;
            tokio::time::timeout(Duration::from_secs(5), resp_rx.recv())
                .await
                .map_err(|_| Error::Transport("OPTIONS probe timed out".into()))?
                .ok_or_else(|| Error::Transport("response channel closed".into()))
        };

        match probe.await {
            Ok(response) => {
                debug!(
                    trunk = %runtime.config.name,
                    status = response.status.as_u16(),
                    "OPTIONS probe answered"
                );
            }
            Err(err) => {
                runtime.record_failure(format!("health probe: {err}"), runtime.config.options_interval);
            }
        }
        routes.remove(&call_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip_trunk(id: u64, cidrs: &[&str], max_channels: u32) -> TrunkConfig {
        TrunkConfig {
            id,
            name: format!("trunk-{id}"),
            kind: TrunkKind::IpAuth {
                networks: cidrs.iter().map(|c| c.parse().unwrap()).collect(),
            },
            max_channels,
            enabled: true,
            record_calls: false,
            options_interval: Duration::from_secs(60),
        }
    }

    #[test]
    fn cidr_matching() {
        let cidr: Cidr = "203.0.113.0/24".parse().unwrap();
        assert!(cidr.contains("203.0.113.77".parse().unwrap()));
        assert!(!cidr.contains("203.0.114.1".parse().unwrap()));

        let host: Cidr = "198.51.100.9".parse().unwrap();
        assert!(host.contains("198.51.100.9".parse().unwrap()));
        assert!(!host.contains("198.51.100.10".parse().unwrap()));

        assert!("10.0.0.0/33".parse::<Cidr>().is_err());
    }

    #[test]
    fn channel_admission_caps() {
        let mgr = TrunkManager::new();
        mgr.add_trunk(ip_trunk(1, &["0.0.0.0/0"], 2));

        let a = mgr.try_admit(1).unwrap();
        let _b = mgr.try_admit(1).unwrap();
        assert!(matches!(
            mgr.try_admit(1),
            Err(Error::ChannelsExhausted { trunk: 1, limit: 2 })
        ));
        assert_eq!(mgr.active_channels(1), 2);

        drop(a);
        assert_eq!(mgr.active_channels(1), 1);
        let _c = mgr.try_admit(1).unwrap();
    }

    #[test]
    fn disabled_trunk_never_admits() {
        let mgr = TrunkManager::new();
        let mut config = ip_trunk(7, &["0.0.0.0/0"], 10);
        config.enabled = false;
        mgr.add_trunk(config);
        assert!(matches!(mgr.try_admit(7), Err(Error::TrunkDisabled(7))));
        assert_eq!(mgr.status(7), Some(TrunkStatus::Disabled));
    }

    #[test]
    fn inbound_matching_by_cidr() {
        let mgr = TrunkManager::new();
        mgr.add_trunk(ip_trunk(1, &["203.0.113.0/24"], 4));
        mgr.add_trunk(ip_trunk(2, &["198.51.100.9"], 4));

        assert_eq!(mgr.match_inbound("203.0.113.5".parse().unwrap()), Some(1));
        assert_eq!(mgr.match_inbound("198.51.100.9".parse().unwrap()), Some(2));
        assert_eq!(mgr.match_inbound("192.0.2.1".parse().unwrap()), None);
    }

    #[test]
    fn backoff_doubles_to_ceiling() {
        let mut backoff = BACKOFF_START;
        let mut seen = Vec::new();
        for _ in 0..8 {
            seen.push(backoff.as_secs());
            backoff = advance_backoff(backoff);
        }
        assert_eq!(seen, vec![2, 4, 8, 16, 32, 64, 120, 120]);
    }

    #[test]
    fn challenge_parsing() {
        let mut resp = Response {
            status: StatusCode::UNAUTHORIZED,
            reason: "Unauthorized".into(),
            headers: Default::default(),
            body: Default::default(),
        };
        resp.headers.push(
            HeaderName::WwwAuthenticate,
            "Digest realm=\"provider\", nonce=\"n123\", qop=\"auth\", algorithm=MD5",
        );
        let challenge = parse_challenge(&resp).unwrap();
        assert_eq!(challenge.realm, "provider");
        assert_eq!(challenge.nonce, "n123");
        assert_eq!(challenge.qop.as_deref(), Some("auth"));
    }

    #[test]
    fn granted_expiry_prefers_expires_header() {
        let mut resp = Response {
            status: StatusCode::OK,
            reason: "OK".into(),
            headers: Default::default(),
            body: Default::default(),
        };
        resp.headers.push(HeaderName::Expires, "1800");
        assert_eq!(granted_expiry(&resp, 3600), 1800);

        let mut resp2 = Response {
            status: StatusCode::OK,
            reason: "OK".into(),
            headers: Default::default(),
            body: Default::default(),
        };
        resp2
            .headers
            .push(HeaderName::Contact, "<sip:t@1.2.3.4>;expires=900");
        assert_eq!(granted_expiry(&resp2, 3600), 900);
        assert_eq!(
            granted_expiry(
                &Response {
                    status: StatusCode::OK,
                    reason: "OK".into(),
                    headers: Default::default(),
                    body: Default::default(),
                },
                3600
            ),
            3600
        );
    }
}
