//! Transport events and the reply path

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::debug;

use flowpbx_sip_core::Message;

use crate::error::{Error, Result};

/// Which listener a message arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Udp,
    Tcp,
    Tls,
}

impl TransportKind {
    /// Via transport token for this listener.
    pub fn via_token(self) -> &'static str {
        match self {
            TransportKind::Udp => "UDP",
            TransportKind::Tcp => "TCP",
            TransportKind::Tls => "TLS",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.via_token())
    }
}

#[derive(Clone)]
enum ReplySink {
    /// Shared UDP socket; replies are addressed to the peer.
    Udp(Arc<UdpSocket>),
    /// Write half of an accepted stream connection.
    Stream(mpsc::Sender<Bytes>),
}

/// Routes bytes back toward a message's source.
///
/// Handles are cheap to clone and remain valid for the lifetime of the
/// underlying socket/connection; sending on a dead stream connection yields
/// [`Error::ConnectionGone`].
#[derive(Clone)]
pub struct TransportHandle {
    kind: TransportKind,
    peer: SocketAddr,
    local: SocketAddr,
    sink: ReplySink,
}

impl TransportHandle {
    pub(crate) fn udp(socket: Arc<UdpSocket>, peer: SocketAddr, local: SocketAddr) -> Self {
        TransportHandle {
            kind: TransportKind::Udp,
            peer,
            local,
            sink: ReplySink::Udp(socket),
        }
    }

    pub(crate) fn stream(
        kind: TransportKind,
        writer: mpsc::Sender<Bytes>,
        peer: SocketAddr,
        local: SocketAddr,
    ) -> Self {
        TransportHandle {
            kind,
            peer,
            local,
            sink: ReplySink::Stream(writer),
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// The remote address the message came from.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// The local listener address.
    pub fn local(&self) -> SocketAddr {
        self.local
    }

    /// Send a serialised SIP message back to the peer.
    pub async fn send(&self, message: &Message) -> Result<()> {
        self.send_bytes(message.to_bytes()).await
    }

    /// Send raw bytes back to the peer. Used for stateless replies built
    /// from unparseable input.
    pub async fn send_bytes(&self, bytes: Bytes) -> Result<()> {
        match &self.sink {
            ReplySink::Udp(socket) => {
                socket.send_to(&bytes, self.peer).await?;
                Ok(())
            }
            ReplySink::Stream(writer) => writer
                .send(bytes)
                .await
                .map_err(|_| Error::ConnectionGone(self.peer)),
        }
    }

    /// Redirect this handle to a different peer. Only meaningful for UDP,
    /// where the socket is unconnected; stream handles keep their
    /// connection.
    pub fn to_peer(&self, peer: SocketAddr) -> Self {
        let mut handle = self.clone();
        if matches!(handle.sink, ReplySink::Udp(_)) {
            handle.peer = peer;
        } else {
            debug!("ignoring peer redirect on {} handle", self.kind);
        }
        handle
    }
}

impl fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransportHandle({} {} -> {})", self.kind, self.local, self.peer)
    }
}

/// Events emitted by the transport layer.
#[derive(Debug)]
pub enum TransportEvent {
    /// A well-formed SIP message arrived.
    MessageReceived {
        message: Message,
        handle: TransportHandle,
    },
    /// A listener failed in a way that did not produce a message.
    Error { kind: TransportKind, error: String },
    /// All listeners have shut down.
    Closed,
}
