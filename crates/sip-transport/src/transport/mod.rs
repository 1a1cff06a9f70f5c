//! Listener management and inbound dispatch

mod framing;
mod stream;
mod tcp;
#[cfg(feature = "tls")]
mod tls;
mod udp;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use flowpbx_sip_core::{Message, SIP_VERSION};

use crate::error::Result;
use crate::events::{TransportEvent, TransportHandle};

const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Address for the shared UDP/TCP SIP port.
    pub udp_addr: SocketAddr,
    pub tcp_addr: SocketAddr,
    /// Optional TLS listener on its own port.
    pub tls_addr: Option<SocketAddr>,
    /// PEM certificate chain and key paths, required when `tls_addr` is set.
    pub tls_cert_path: Option<std::path::PathBuf>,
    pub tls_key_path: Option<std::path::PathBuf>,
    pub event_capacity: usize,
}

impl TransportConfig {
    pub fn new(udp_addr: SocketAddr, tcp_addr: SocketAddr) -> Self {
        TransportConfig {
            udp_addr,
            tcp_addr,
            tls_addr: None,
            tls_cert_path: None,
            tls_key_path: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// Counters shared by every receive loop.
#[derive(Debug, Default)]
pub struct TransportStats {
    /// Requests answered with a stateless 400.
    pub bad_requests: AtomicU64,
    /// Unparseable input dropped without a reply.
    pub dropped: AtomicU64,
}

/// Owns the bound listeners and the shared outbound UDP socket.
pub struct TransportManager {
    udp: Arc<UdpSocket>,
    udp_local: SocketAddr,
    closed: Arc<AtomicBool>,
    stats: Arc<TransportStats>,
}

impl TransportManager {
    /// Bind every configured listener and start their receive loops.
    pub async fn bind(config: TransportConfig) -> Result<(Self, mpsc::Receiver<TransportEvent>)> {
        let (events_tx, events_rx) = mpsc::channel(config.event_capacity);
        let closed = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(TransportStats::default());

        let udp = udp::bind(config.udp_addr).await?;
        let udp_local = udp.local_addr()?;
        info!("SIP UDP listener bound to {udp_local}");
        udp::spawn_receive_loop(
            udp.clone(),
            udp_local,
            events_tx.clone(),
            closed.clone(),
            stats.clone(),
        );

        let tcp_local = tcp::spawn_listener(
            config.tcp_addr,
            events_tx.clone(),
            closed.clone(),
            stats.clone(),
        )
        .await?;
        info!("SIP TCP listener bound to {tcp_local}");

        #[cfg(feature = "tls")]
        if let Some(tls_addr) = config.tls_addr {
            let tls_local = tls::spawn_listener(
                tls_addr,
                config.tls_cert_path.as_deref(),
                config.tls_key_path.as_deref(),
                events_tx.clone(),
                closed.clone(),
                stats.clone(),
            )
            .await?;
            info!("SIP TLS listener bound to {tls_local}");
        }
        #[cfg(not(feature = "tls"))]
        if config.tls_addr.is_some() {
            warn!("TLS listener configured but the tls feature is disabled");
        }

        Ok((
            TransportManager {
                udp,
                udp_local,
                closed,
                stats,
            },
            events_rx,
        ))
    }

    pub fn local_udp_addr(&self) -> SocketAddr {
        self.udp_local
    }

    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }

    /// A handle that sends datagrams from the shared UDP socket to `peer`.
    /// Used for client transactions the PBX originates (trunk REGISTER,
    /// forked INVITEs, NOTIFY).
    pub fn udp_handle(&self, peer: SocketAddr) -> TransportHandle {
        TransportHandle::udp(self.udp.clone(), peer, self.udp_local)
    }

    /// Fire a message at `peer` over UDP.
    pub async fn send_udp(&self, message: &Message, peer: SocketAddr) -> Result<()> {
        self.udp_handle(peer).send(message).await
    }

    /// Stop all receive loops. Existing handles keep working until their
    /// sockets drop.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

/// Parse one wire frame and either dispatch it or deal with the failure:
/// requests get a stateless 400 when the mandatory headers survived,
/// responses are dropped silently.
pub(crate) async fn process_frame(
    data: Bytes,
    handle: TransportHandle,
    events_tx: &mpsc::Sender<TransportEvent>,
    stats: &TransportStats,
) {
    match flowpbx_sip_core::parse_message(&data) {
        Ok(message) => {
            debug!(
                peer = %handle.peer(),
                transport = %handle.kind(),
                "received {}",
                describe(&message)
            );
            if events_tx
                .send(TransportEvent::MessageReceived { message, handle })
                .await
                .is_err()
            {
                warn!("transport event channel closed; dropping message");
            }
        }
        Err(err) => {
            if let Some(reply) = stateless_bad_request(&data) {
                stats.bad_requests.fetch_add(1, Ordering::Relaxed);
                warn!(peer = %handle.peer(), %err, "malformed request, replying 400");
                let _ = handle.send_bytes(reply).await;
            } else {
                stats.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(peer = %handle.peer(), %err, "dropping unparseable input");
            }
        }
    }
}

fn describe(message: &Message) -> String {
    match message {
        Message::Request(r) => format!("{} request", r.method),
        Message::Response(r) => format!("{} response", r.status.as_u16()),
    }
}

/// Build a 400 reply for an unparseable request by mirroring its mandatory
/// headers verbatim. Returns `None` when the input is a response or the
/// headers cannot be recovered, in which case the input is dropped.
fn stateless_bad_request(data: &[u8]) -> Option<Bytes> {
    let text = std::str::from_utf8(data).ok()?;
    if text.starts_with(SIP_VERSION) {
        return None;
    }
    let head = text.split("\r\n\r\n").next()?;

    let mut via = Vec::new();
    let mut from = None;
    let mut to = None;
    let mut call_id = None;
    let mut cseq = None;
    for line in head.split("\r\n").skip(1) {
        let (name, value) = match line.split_once(':') {
            Some(pair) => pair,
            None => continue,
        };
        let value = value.trim();
        match name.trim().to_ascii_lowercase().as_str() {
            "via" | "v" => via.push(value),
            "from" | "f" => from = Some(value),
            "to" | "t" => to = Some(value),
            "call-id" | "i" => call_id = Some(value),
            "cseq" => cseq = Some(value),
            _ => {}
        }
    }
    let (from, to, call_id, cseq) = (from?, to?, call_id?, cseq?);
    if via.is_empty() {
        return None;
    }

    let mut reply = format!("{SIP_VERSION} 400 Bad Request\r\n");
    for v in via {
        reply.push_str("Via: ");
        reply.push_str(v);
        reply.push_str("\r\n");
    }
    reply.push_str(&format!(
        "From: {from}\r\nTo: {to}\r\nCall-ID: {call_id}\r\nCSeq: {cseq}\r\nContent-Length: 0\r\n\r\n"
    ));
    Some(Bytes::from(reply))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_request_mirrors_headers() {
        let wire = b"INVITE not-a-uri SIP/2.0\r\n\
            Via: SIP/2.0/UDP 1.2.3.4:5060;branch=z9hG4bK9\r\n\
            From: <sip:a@x>;tag=1\r\n\
            To: <sip:b@y>\r\n\
            Call-ID: bad-1\r\n\
            CSeq: 7 INVITE\r\n\r\n";
        let reply = stateless_bad_request(wire).unwrap();
        let text = std::str::from_utf8(&reply).unwrap();
        assert!(text.starts_with("SIP/2.0 400 Bad Request\r\n"));
        assert!(text.contains("Call-ID: bad-1\r\n"));
        assert!(text.contains("CSeq: 7 INVITE\r\n"));
    }

    #[test]
    fn responses_are_never_answered() {
        assert!(stateless_bad_request(b"SIP/2.0 200 OK\r\nbroken\r\n\r\n").is_none());
    }

    #[test]
    fn header_loss_means_drop() {
        assert!(stateless_bad_request(b"INVITE sip:x SIP/2.0\r\nVia: v\r\n\r\n").is_none());
    }
}
