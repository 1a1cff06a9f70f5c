//! Shared per-connection loop for stream transports (TCP and TLS)

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::events::{TransportEvent, TransportHandle, TransportKind};
use crate::transport::framing::extract_frame;
use crate::transport::{process_frame, TransportStats};

const WRITE_QUEUE_CAPACITY: usize = 32;
const READ_CHUNK: usize = 8 * 1024;

/// Drive one accepted connection: a writer task draining a bounded queue
/// and an inline read/frame/dispatch loop. Returns when the peer closes,
/// a framing violation occurs, or the manager shuts down.
pub(crate) async fn run_connection<S>(
    stream: S,
    kind: TransportKind,
    peer: SocketAddr,
    local: SocketAddr,
    events_tx: mpsc::Sender<TransportEvent>,
    closed: Arc<AtomicBool>,
    stats: Arc<TransportStats>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (write_tx, mut write_rx) = mpsc::channel::<Bytes>(WRITE_QUEUE_CAPACITY);

    let writer_task = tokio::spawn(async move {
        while let Some(bytes) = write_rx.recv().await {
            if let Err(err) = writer.write_all(&bytes).await {
                warn!("stream write to {peer} failed: {err}");
                break;
            }
        }
    });

    let handle = TransportHandle::stream(kind, write_tx, peer, local);
    let mut buf = BytesMut::with_capacity(READ_CHUNK);

    loop {
        if closed.load(Ordering::Relaxed) {
            break;
        }
        match extract_frame(&mut buf) {
            Ok(Some(frame)) => {
                process_frame(frame, handle.clone(), &events_tx, &stats).await;
                continue;
            }
            Ok(None) => {}
            Err(err) => {
                warn!("closing {kind} connection from {peer}: {err}");
                break;
            }
        }
        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                debug!("{kind} connection from {peer} closed by peer");
                break;
            }
            Ok(_) => {}
            Err(err) => {
                debug!("{kind} read from {peer} failed: {err}");
                break;
            }
        }
    }

    writer_task.abort();
}
