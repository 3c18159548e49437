use fabric_transport::TransportError;
use thiserror::Error;

use crate::backend::BackendError;
use crate::nvme::{StatusCode, WireError};

pub type Result<T> = std::result::Result<T, DemError>;

#[derive(Error, Debug)]
pub enum DemError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Malformed message: {0}")]
    Wire(#[from] WireError),

    #[error("{command} failed: {status}")]
    Status { command: String, status: StatusCode },

    #[error("Discovery log changed while fetching (numrec {numrec} -> {new_numrec}, genctr {genctr} -> {new_genctr})")]
    InconsistentLog {
        numrec: u64,
        new_numrec: u64,
        genctr: u64,
        new_genctr: u64,
    },

    #[error("No response to {0}")]
    NoResponse(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DemError {
    /// Errors after which the connection cannot be used again
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_terminal(),
            Self::NotConnected | Self::NoResponse(_) => true,
            _ => false,
        }
    }
}
