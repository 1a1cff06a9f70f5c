//! SIP protocol core for FlowPBX
//!
//! This crate owns the wire-level SIP model used by every other part of the
//! stack: request/response types, the message parser and serializer, URIs,
//! typed header access, digest authentication primitives and the SDP
//! offer/answer model with the proxy rewrite used by the media relay.
//!
//! Parsing fails closed: anything that does not form a complete, well-formed
//! SIP message is rejected with [`Error::Parse`] and never partially
//! interpreted.

pub mod error;
pub mod parser;
pub mod sdp;
pub mod types;

pub use error::{Error, Result};
pub use parser::parse_message;
pub use types::address::Address;
pub use types::auth::{DigestChallenge, DigestCredentials};
pub use types::headers::{HeaderName, Headers};
pub use types::message::{Message, Request, Response};
pub use types::method::Method;
pub use types::status::StatusCode;
pub use types::uri::Uri;

/// SIP version string used on every start line.
pub const SIP_VERSION: &str = "SIP/2.0";

/// Generate a random token suitable for tags and branch parameters.
///
/// Branch values are prefixed with the RFC 3261 magic cookie by the caller.
pub fn random_token(len: usize) -> String {
    use rand::Rng;
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}
