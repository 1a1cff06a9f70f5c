//! Error types for the SIP core crate

use thiserror::Error;

/// Errors produced while parsing or handling SIP messages.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// The input does not form a well-formed SIP message.
    #[error("malformed SIP message: {0}")]
    Parse(String),

    /// A header required by the operation is absent.
    #[error("missing required header: {0}")]
    MissingHeader(&'static str),

    /// A header is present but its value cannot be interpreted.
    #[error("invalid {name} header: {reason}")]
    InvalidHeader { name: &'static str, reason: String },

    /// A URI could not be parsed.
    #[error("invalid URI: {0}")]
    InvalidUri(String),

    /// An SDP body could not be parsed or is missing a mandatory line.
    #[error("invalid SDP: {0}")]
    InvalidSdp(String),

    /// Authorization header is missing or not a digest scheme.
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),
}

pub type Result<T> = std::result::Result<T, Error>;
