//! SIP transport layer for FlowPBX
//!
//! Binds the configured UDP, TCP and (optionally) TLS listeners, frames and
//! parses inbound traffic, and hands well-formed messages to the signaling
//! core as [`TransportEvent`]s. Each event carries a [`TransportHandle`]
//! that routes replies back the way the request came: directly addressed
//! datagrams for UDP, the originating connection for stream transports.
//!
//! Parse failures on requests are answered with a stateless 400 when enough
//! of the message survives to mirror the mandatory headers; everything else
//! is dropped and counted.

pub mod error;
pub mod events;
pub mod transport;

pub use error::{Error, Result};
pub use events::{TransportEvent, TransportHandle, TransportKind};
pub use transport::{TransportConfig, TransportManager};
