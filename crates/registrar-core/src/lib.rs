//! Registration and trunk management for FlowPBX
//!
//! Three responsibilities live here:
//!
//! - the registrar: digest-authenticating REGISTER requests and maintaining
//!   the runtime binding table (extension → device contacts),
//! - the nonce store backing digest challenges for both REGISTER and INVITE,
//! - trunk lifecycle: outbound registration to upstream providers with
//!   exponential backoff, OPTIONS health probing, source-IP authentication
//!   for static trunks, and per-trunk concurrent-channel admission.
//!
//! Bindings are ephemeral by design: the table starts empty on process start
//! and is rebuilt by re-REGISTERs from the phones.

pub mod auth;
pub mod bindings;
pub mod error;
pub mod nonce;
pub mod register;
pub mod trunk;

pub use auth::{AuthOutcome, Authenticator};
pub use bindings::{Binding, BindingStore};
pub use error::{Error, Result};
pub use nonce::NonceStore;
pub use register::{Registrar, RegistrarConfig, RegistrarDirectory};
pub use trunk::{
    ChannelGuard, SipSender, TrunkConfig, TrunkKind, TrunkManager, TrunkStatus,
};
