//! Dialog layer error types

use thiserror::Error;

use flowpbx_sip_core::StatusCode;

#[derive(Debug, Error)]
pub enum Error {
    #[error("dialog is in state {state}, operation needs {needed}")]
    InvalidState {
        state: &'static str,
        needed: &'static str,
    },

    #[error("no dialog matches this request")]
    NoMatchingDialog,

    #[error("call was rejected with {0:?}")]
    Rejected(StatusCode),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error(transparent)]
    Sip(#[from] flowpbx_sip_core::Error),
}

impl From<flowpbx_sip_transport::Error> for Error {
    fn from(err: flowpbx_sip_transport::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
