//! TCP listener

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::events::{TransportEvent, TransportKind};
use crate::transport::{stream, TransportStats};

/// Bind the TCP listener and spawn its accept loop.
pub(crate) async fn spawn_listener(
    addr: SocketAddr,
    events_tx: mpsc::Sender<TransportEvent>,
    closed: Arc<AtomicBool>,
    stats: Arc<TransportStats>,
) -> Result<SocketAddr> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;

    tokio::spawn(async move {
        while !closed.load(Ordering::Relaxed) {
            match listener.accept().await {
                Ok((socket, peer)) => {
                    debug!("accepted TCP connection from {peer}");
                    let _ = socket.set_nodelay(true);
                    tokio::spawn(stream::run_connection(
                        socket,
                        TransportKind::Tcp,
                        peer,
                        local,
                        events_tx.clone(),
                        closed.clone(),
                        stats.clone(),
                    ));
                }
                Err(err) => {
                    if closed.load(Ordering::Relaxed) {
                        break;
                    }
                    error!("TCP accept failed: {err}");
                    let _ = events_tx
                        .send(TransportEvent::Error {
                            kind: TransportKind::Tcp,
                            error: err.to_string(),
                        })
                        .await;
                }
            }
        }
        info!("TCP accept loop on {local} terminated");
    });

    Ok(local)
}
