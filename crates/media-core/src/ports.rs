//! Bounded RTP/RTCP port pool
//!
//! Free ports are a LIFO stack of even numbers; an allocation binds the
//! (rtp, rtp+1) UDP socket pair. Releasing returns only the port numbers,
//! the sockets close with the token. A pair already taken by another
//! process is skipped and retried at the back of the stack.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Default media port range.
pub const DEFAULT_PORT_MIN: u16 = 10_000;
pub const DEFAULT_PORT_MAX: u16 = 20_000;

struct PoolInner {
    free: Mutex<Vec<u16>>,
    bind_ip: IpAddr,
}

/// Shared pool of RTP port pairs.
#[derive(Clone)]
pub struct PortPool {
    inner: Arc<PoolInner>,
}

impl PortPool {
    /// Build a pool over `[min, max]`, binding on `bind_ip`. The stack is
    /// seeded high-to-low so the first allocation takes the lowest pair.
    pub fn new(bind_ip: IpAddr, min: u16, max: u16) -> Self {
        let min = min + (min & 1); // first even port in range
        let mut free: Vec<u16> = (min..=max.saturating_sub(1))
            .step_by(2)
            .collect();
        free.reverse();
        PortPool {
            inner: Arc::new(PoolInner {
                free: Mutex::new(free),
                bind_ip,
            }),
        }
    }

    /// Number of pairs currently available.
    pub fn available(&self) -> usize {
        self.inner.free.lock().len()
    }

    /// Allocate and bind an (rtp, rtcp) socket pair.
    ///
    /// Exhaustion is a typed error the signaling layer answers with 503.
    pub async fn allocate(&self) -> Result<PortPair> {
        let mut skipped = Vec::new();
        let result = loop {
            let port = match self.inner.free.lock().pop() {
                Some(port) => port,
                None => break Err(Error::PortPoolExhausted),
            };
            match self.try_bind(port).await {
                Ok((rtp, rtcp)) => {
                    debug!("allocated media ports {port}/{}", port + 1);
                    break Ok(PortPair {
                        rtp_port: port,
                        rtp: Arc::new(rtp),
                        rtcp: Arc::new(rtcp),
                        pool: self.inner.clone(),
                        released: false,
                    });
                }
                Err(err) => {
                    // Something else owns this pair right now; keep it out
                    // of the stack until the allocations settle.
                    warn!("media port {port} unusable: {err}");
                    skipped.push(port);
                }
            }
        };
        let mut free = self.inner.free.lock();
        for port in skipped {
            free.insert(0, port);
        }
        result
    }

    async fn try_bind(&self, port: u16) -> std::io::Result<(UdpSocket, UdpSocket)> {
        let rtp = UdpSocket::bind(SocketAddr::new(self.inner.bind_ip, port)).await?;
        let rtcp = UdpSocket::bind(SocketAddr::new(self.inner.bind_ip, port + 1)).await?;
        Ok((rtp, rtcp))
    }
}

/// A bound RTP/RTCP socket pair. The port numbers go back to the pool when
/// the pair is released or dropped; each pair returns exactly once.
pub struct PortPair {
    rtp_port: u16,
    rtp: Arc<UdpSocket>,
    rtcp: Arc<UdpSocket>,
    pool: Arc<PoolInner>,
    released: bool,
}

impl PortPair {
    pub fn rtp_port(&self) -> u16 {
        self.rtp_port
    }

    pub fn rtcp_port(&self) -> u16 {
        self.rtp_port + 1
    }

    pub fn rtp_socket(&self) -> Arc<UdpSocket> {
        self.rtp.clone()
    }

    pub fn rtcp_socket(&self) -> Arc<UdpSocket> {
        self.rtcp.clone()
    }

    /// Return the ports to the pool explicitly.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.pool.free.lock().push(self.rtp_port);
            debug!("released media ports {}/{}", self.rtp_port, self.rtp_port + 1);
        }
    }
}

impl Drop for PortPair {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_pool(min: u16, max: u16) -> PortPool {
        PortPool::new("127.0.0.1".parse().unwrap(), min, max)
    }

    #[tokio::test]
    async fn allocates_lifo_pairs() {
        let pool = local_pool(40_000, 40_007);
        assert_eq!(pool.available(), 4);

        let a = pool.allocate().await.unwrap();
        assert_eq!(a.rtp_port(), 40_000);
        assert_eq!(a.rtcp_port(), 40_001);

        let b = pool.allocate().await.unwrap();
        assert_eq!(b.rtp_port(), 40_002);

        // Release out of order; the freed pair is handed out next.
        a.release();
        let c = pool.allocate().await.unwrap();
        assert_eq!(c.rtp_port(), 40_000);
        drop(b);
        drop(c);
        assert_eq!(pool.available(), 4);
    }

    #[tokio::test]
    async fn exhaustion_is_an_error() {
        let pool = local_pool(40_010, 40_013);
        let _a = pool.allocate().await.unwrap();
        let _b = pool.allocate().await.unwrap();
        assert!(matches!(
            pool.allocate().await,
            Err(Error::PortPoolExhausted)
        ));
    }

    #[tokio::test]
    async fn drop_returns_pair_exactly_once() {
        let pool = local_pool(40_020, 40_023);
        let a = pool.allocate().await.unwrap();
        drop(a);
        assert_eq!(pool.available(), 2);
        // Double release cannot happen: release consumes, drop guards.
        let b = pool.allocate().await.unwrap();
        b.release();
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn occupied_pair_is_skipped() {
        let pool = local_pool(40_030, 40_035);
        // Occupy the first pair's RTCP port outside the pool.
        let _squatter = UdpSocket::bind("127.0.0.1:40031").await.unwrap();
        let a = pool.allocate().await.unwrap();
        assert_eq!(a.rtp_port(), 40_032);
    }
}
