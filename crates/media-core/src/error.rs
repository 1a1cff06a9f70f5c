//! Media engine error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("RTP port pool exhausted")]
    PortPoolExhausted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed RTP packet: {0}")]
    BadRtp(String),

    #[error("no codec available for payload type {0}")]
    UnsupportedPayload(u8),

    #[error("opus support not compiled in")]
    OpusUnavailable,

    #[error("codec failure: {0}")]
    Codec(String),

    #[error("unsupported WAV file: {0}")]
    WavFormat(String),

    #[error("media session is closed")]
    SessionClosed,

    #[error("conference room is full ({limit} members)")]
    RoomFull { limit: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
