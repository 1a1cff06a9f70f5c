//! FlowPBX call engine
//!
//! The business half of the PBX: entity resolution, the call-flow graph
//! and its execution engine, node handlers, call detail records, voicemail
//! delivery (MWI and email), push wake-up, retention cleanup, and the
//! server that wires the SIP, dialog, registrar and media layers together.

pub mod call;
pub mod cdr;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod flow;
pub mod nodes;
pub mod push;
pub mod resolver;
pub mod server;
pub mod voicemail;

pub use call::{CallContext, CallEnv};
pub use cdr::{CallRecord, CdrSink, Direction, Disposition, JsonlCdrSink};
pub use config::{Config, RecordingPolicy};
pub use error::{Error, Result};
pub use flow::{FlowContext, FlowGraph, NodeKind};
pub use resolver::{Entity, EntityResolver, StaticResolver};
pub use server::PbxServer;
pub use voicemail::{JsonlVoicemailSink, VoicemailSink};
