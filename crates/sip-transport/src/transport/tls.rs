//! TLS listener (rustls)

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rustls::{Certificate, PrivateKey, ServerConfig};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::events::{TransportEvent, TransportKind};
use crate::transport::{stream, TransportStats};

/// Bind the TLS listener and spawn its accept loop. Handshakes run inside
/// the per-connection task so a stalled client cannot block the acceptor.
pub(crate) async fn spawn_listener(
    addr: SocketAddr,
    cert_path: Option<&Path>,
    key_path: Option<&Path>,
    events_tx: mpsc::Sender<TransportEvent>,
    closed: Arc<AtomicBool>,
    stats: Arc<TransportStats>,
) -> Result<SocketAddr> {
    let (cert_path, key_path) = match (cert_path, key_path) {
        (Some(c), Some(k)) => (c, k),
        _ => {
            return Err(Error::Tls(
                "tls listener requires certificate and key paths".into(),
            ))
        }
    };
    let acceptor = TlsAcceptor::from(Arc::new(load_server_config(cert_path, key_path)?));

    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;

    tokio::spawn(async move {
        while !closed.load(Ordering::Relaxed) {
            match listener.accept().await {
                Ok((socket, peer)) => {
                    debug!("accepted TLS connection from {peer}");
                    let acceptor = acceptor.clone();
                    let events_tx = events_tx.clone();
                    let closed = closed.clone();
                    let stats = stats.clone();
                    tokio::spawn(async move {
                        match acceptor.accept(socket).await {
                            Ok(tls_stream) => {
                                stream::run_connection(
                                    tls_stream,
                                    TransportKind::Tls,
                                    peer,
                                    local,
                                    events_tx,
                                    closed,
                                    stats,
                                )
                                .await;
                            }
                            Err(err) => {
                                warn!("TLS handshake with {peer} failed: {err}");
                            }
                        }
                    });
                }
                Err(err) => {
                    if closed.load(Ordering::Relaxed) {
                        break;
                    }
                    error!("TLS accept failed: {err}");
                    let _ = events_tx
                        .send(TransportEvent::Error {
                            kind: TransportKind::Tls,
                            error: err.to_string(),
                        })
                        .await;
                }
            }
        }
        info!("TLS accept loop on {local} terminated");
    });

    Ok(local)
}

fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<ServerConfig> {
    let certs = read_certs(cert_path)?;
    let key = read_key(key_path)?;
    ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Tls(e.to_string()))
}

fn read_certs(path: &Path) -> Result<Vec<Certificate>> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader)?;
    if certs.is_empty() {
        return Err(Error::Tls(format!("no certificates found in {}", path.display())));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

fn read_key(path: &Path) -> Result<PrivateKey> {
    let mut reader = BufReader::new(File::open(path)?);
    for item in rustls_pemfile::read_all(&mut reader)? {
        match item {
            rustls_pemfile::Item::PKCS8Key(key)
            | rustls_pemfile::Item::RSAKey(key)
            | rustls_pemfile::Item::ECKey(key) => return Ok(PrivateKey(key)),
            _ => continue,
        }
    }
    Err(Error::Tls(format!("no private key found in {}", path.display())))
}
