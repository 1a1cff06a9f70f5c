//! SIP dialog layer for FlowPBX
//!
//! Owns per-call dialog state machines on both sides of the proxy: the
//! caller-facing UAS leg ([`ServerCall`]) with its per-call mailbox, and
//! the forked UAC legs ([`ClientInvite`]) raced first-winner by
//! [`ring_race`]. The [`DialogManager`] routes in-dialog requests to call
//! mailboxes and responses to client transactions by Call-ID.

pub mod client;
pub mod dialog;
pub mod error;
pub mod fork;
pub mod manager;
pub mod server;

pub use client::{build_leg_invite, ClientDialog, ClientInvite};
pub use dialog::{DialogId, TerminationCause, UasState};
pub use error::{Error, Result};
pub use fork::{ring_race, RaceResult, RingOutcome, RingState, RingStrategy};
pub use manager::{ClientRouteGuard, DialogManager, Dispatch, LegGuard};
pub use server::{CallSignal, ServerCall};
