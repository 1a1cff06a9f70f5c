//! Engine error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("entity {entity_type} {id} not found")]
    EntityNotFound { entity_type: String, id: String },

    #[error("entity {id} is a {actual}, expected {expected}")]
    TypeMismatch {
        id: String,
        expected: String,
        actual: String,
    },

    #[error("no route from node {node} port {port:?}")]
    NoRoute { node: String, port: String },

    #[error("flow has no entry node")]
    NoEntryNode,

    #[error("flow exceeded the step limit of {0}")]
    StepLimit(usize),

    #[error("node {node} timed out after {seconds}s")]
    NodeTimeout { node: String, seconds: u64 },

    #[error("call was cancelled")]
    Cancelled,

    #[error("invalid node configuration: {0}")]
    NodeConfig(String),

    #[error("voicemail box {0} is full")]
    MailboxFull(u64),

    #[error(transparent)]
    Media(#[from] flowpbx_media_core::Error),

    #[error(transparent)]
    Dialog(#[from] flowpbx_dialog_core::Error),

    #[error(transparent)]
    Registrar(#[from] flowpbx_registrar_core::Error),

    #[error(transparent)]
    Sip(#[from] flowpbx_sip_core::Error),

    #[error(transparent)]
    Transport(#[from] flowpbx_sip_transport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
