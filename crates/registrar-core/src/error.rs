//! Error types for registration and trunk handling

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown user {0}")]
    UnknownUser(String),

    #[error("extension {user} already has {limit} registrations")]
    MaxRegistrations { user: String, limit: usize },

    #[error("requested expiry {requested}s is below the minimum of {min}s")]
    IntervalTooBrief { requested: u32, min: u32 },

    #[error("unknown trunk {0}")]
    UnknownTrunk(u64),

    #[error("trunk {trunk} is at its channel limit of {limit}")]
    ChannelsExhausted { trunk: u64, limit: u32 },

    #[error("trunk {0} is disabled")]
    TrunkDisabled(u64),

    #[error("could not resolve registrar host {0}")]
    RegistrarUnresolvable(String),

    #[error(transparent)]
    Sip(#[from] flowpbx_sip_core::Error),

    #[error("transport failure: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, Error>;
