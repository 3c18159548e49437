//! Fabric transport layer for the NVMe-oF endpoint manager
//!
//! Production: RDMA-CM + verbs (feature `rdma-transport`)
//! Development and tests: in-process loopback fabric
//!
//! Protocol code only ever sees the traits in [`transport`], so the same
//! dispatcher and discovery client run unchanged on either fabric.

use thiserror::Error;

pub mod buffer;
pub mod shutdown;
pub mod transport;

#[cfg(feature = "rdma-transport")]
pub mod rdma;

pub use buffer::{AlignedBuf, MemoryRegion, RegisteredBuffer, RemoteBuffer};
pub use shutdown::ShutdownToken;
pub use transport::loopback::{LoopbackFabric, RegistrationStats};
pub use transport::{
    create_transport, AddressFamily, ConnRequest, Endpoint, FabricAddr, Listener, QueueEntryId,
    Received, Transport, TransportType,
};

/// Registered buffer granularity; command and data buffers are one page
pub const PAGE_SIZE: usize = 4096;

/// Bounded wait used by listeners and idle polls (ms)
pub const IDLE_TIMEOUT_MS: u64 = 100;

/// Bounded wait for a single connection-manager event (ms)
pub const EVENT_TIMEOUT_MS: u64 = 200;

/// Address and route resolution timeout (ms)
pub const RESOLVE_TIMEOUT_MS: u64 = 5000;

/// Deadline for a send or RMA completion before it is reported as a timeout (ms)
pub const COMPLETION_TIMEOUT_MS: u64 = 5000;

/// Pending connection requests a listener may queue
pub const LISTEN_BACKLOG: usize = 16;

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Memory registration failed: {0}")]
    Registration(String),

    #[error("Connection reset by peer")]
    PeerReset,

    #[error("Timeout waiting for {0}")]
    Timeout(&'static str),

    #[error("Shutdown in progress")]
    Shutdown,

    #[error("Connection rejected by peer ({} bytes private data)", .0.len())]
    Rejected(Vec<u8>),

    #[error("Connection refused: no listener on {0}")]
    ConnectionRefused(String),

    #[error("Remote access violation: key=0x{key:x} addr=0x{addr:x} len={len}")]
    RemoteAccess { key: u32, addr: u64, len: usize },

    #[error("Queue entry {0} is not outstanding")]
    InvalidQueueEntry(usize),

    #[error("Endpoint is not connected")]
    NotConnected,

    #[error("Invalid address: {0}")]
    Address(String),

    #[error("RDMA operation failed: {0}")]
    Rdma(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Errors after which the connection must be torn down
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::PeerReset | Self::Shutdown | Self::NotConnected | Self::Rdma(_)
        )
    }
}
