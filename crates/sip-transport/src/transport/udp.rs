//! UDP listener and receive loop

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::error::Result;
use crate::events::{TransportEvent, TransportHandle, TransportKind};
use crate::transport::{process_frame, TransportStats};

/// Largest datagram we accept; standard SIP-over-UDP stays under this.
const MAX_DATAGRAM: usize = 65_535;

pub(crate) async fn bind(addr: SocketAddr) -> Result<Arc<UdpSocket>> {
    Ok(Arc::new(UdpSocket::bind(addr).await?))
}

/// Spawn the datagram receive loop. One task per bound UDP socket.
pub(crate) fn spawn_receive_loop(
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    events_tx: mpsc::Sender<TransportEvent>,
    closed: Arc<AtomicBool>,
    stats: Arc<TransportStats>,
) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        while !closed.load(Ordering::Relaxed) {
            match socket.recv_from(&mut buf).await {
                Ok((len, peer)) => {
                    // Keep-alive pings are bare CRLFs; ignore them.
                    if buf[..len].iter().all(|b| *b == b'\r' || *b == b'\n') {
                        continue;
                    }
                    let data = Bytes::copy_from_slice(&buf[..len]);
                    let handle = TransportHandle::udp(socket.clone(), peer, local);
                    process_frame(data, handle, &events_tx, &stats).await;
                }
                Err(err) => {
                    if closed.load(Ordering::Relaxed) {
                        break;
                    }
                    error!("UDP receive failed: {err}");
                    let _ = events_tx
                        .send(TransportEvent::Error {
                            kind: TransportKind::Udp,
                            error: err.to_string(),
                        })
                        .await;
                }
            }
        }
        info!("UDP receive loop on {local} terminated");
        let _ = events_tx.send(TransportEvent::Closed).await;
    });
}
