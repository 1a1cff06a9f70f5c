//! Transport error types

use std::net::SocketAddr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport is closed")]
    Closed,

    #[error("event channel closed")]
    ChannelClosed,

    #[error("no route to {0}: connection gone")]
    ConnectionGone(SocketAddr),

    #[error("message of {size} bytes exceeds the {limit} byte frame limit")]
    FrameTooLarge { size: usize, limit: usize },

    #[cfg(feature = "tls")]
    #[error("TLS setup failed: {0}")]
    Tls(String),
}

pub type Result<T> = std::result::Result<T, Error>;
