//! Transport capability abstraction
//!
//! Supports multiple fabric backends:
//! - RDMA: RDMA-CM + verbs, requires InfiniBand/RoCE/iWARP NICs
//! - Loopback: in-process fabric for tests and single-host setups
//!
//! Everything above this module (command dispatch, host queue, discovery
//! client) is written against these traits only.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::buffer::{RegisteredBuffer, RemoteBuffer};
use crate::shutdown::ShutdownToken;
use crate::{Result, TransportError};

pub mod loopback;

/// NVMe-oF transport type (discovery log `trtype`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    Rdma,
    #[serde(alias = "loop")]
    Loopback,
}

impl TransportType {
    pub fn trtype(&self) -> u8 {
        match self {
            Self::Rdma => 1,
            Self::Loopback => 254,
        }
    }

    pub fn from_trtype(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Rdma),
            254 => Some(Self::Loopback),
            _ => None,
        }
    }

    /// Name used by the kernel nvme-fabrics interface
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rdma => "rdma",
            Self::Loopback => "loop",
        }
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// NVMe-oF address family (discovery log `adrfam`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
    Ib,
    Fc,
    #[serde(alias = "loop")]
    Loopback,
}

impl AddressFamily {
    pub fn adrfam(&self) -> u8 {
        match self {
            Self::Ipv4 => 1,
            Self::Ipv6 => 2,
            Self::Ib => 3,
            Self::Fc => 4,
            Self::Loopback => 254,
        }
    }

    pub fn from_adrfam(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Ipv4),
            2 => Some(Self::Ipv6),
            3 => Some(Self::Ib),
            4 => Some(Self::Fc),
            254 => Some(Self::Loopback),
            _ => None,
        }
    }
}

/// Transport address of a listener or a remote controller
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FabricAddr {
    pub trtype: TransportType,
    pub adrfam: AddressFamily,
    pub traddr: String,
    pub trsvcid: String,
}

impl FabricAddr {
    pub fn new(
        trtype: TransportType,
        adrfam: AddressFamily,
        traddr: impl Into<String>,
        trsvcid: impl Into<String>,
    ) -> Self {
        Self {
            trtype,
            adrfam,
            traddr: traddr.into(),
            trsvcid: trsvcid.into(),
        }
    }

    /// Convenience constructor for loopback fabric addresses
    pub fn loopback(traddr: impl Into<String>, trsvcid: impl Into<String>) -> Self {
        Self::new(
            TransportType::Loopback,
            AddressFamily::Loopback,
            traddr,
            trsvcid,
        )
    }

    /// Resolve an IP family address into a socket address
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .traddr
            .parse()
            .map_err(|_| TransportError::Address(format!("bad traddr '{}'", self.traddr)))?;

        let family_ok = match (self.adrfam, ip) {
            (AddressFamily::Ipv4, IpAddr::V4(_)) => true,
            (AddressFamily::Ipv6, IpAddr::V6(_)) => true,
            _ => false,
        };
        if !family_ok {
            return Err(TransportError::Address(format!(
                "traddr '{}' does not match family {:?}",
                self.traddr, self.adrfam
            )));
        }

        let port: u16 = self
            .trsvcid
            .parse()
            .map_err(|_| TransportError::Address(format!("bad trsvcid '{}'", self.trsvcid)))?;

        Ok(SocketAddr::new(ip, port))
    }
}

impl fmt::Display for FabricAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}:{}", self.trtype, self.traddr, self.trsvcid)
    }
}

/// Index of a receive slot in an endpoint's receive ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueEntryId(pub usize);

/// A completed receive; the slot stays consumed until reposted
#[derive(Debug)]
pub struct Received {
    pub entry: QueueEntryId,
    pub data: Vec<u8>,
}

/// Fabric transport capability set
///
/// Implementations handle the fabric-specific details of connection
/// management. Endpoints and listeners are owned values; dropping them
/// destroys the underlying transport resources.
pub trait Transport: Send + Sync {
    fn transport_type(&self) -> TransportType;

    /// Bind a passive endpoint to a service address
    fn init_listener(&self, addr: &FabricAddr) -> Result<Box<dyn Listener>>;

    /// Connect to a remote controller
    ///
    /// # Arguments
    /// * `dest` - Remote transport address
    /// * `private_data` - Connection-manager private data (RDMA CM request)
    /// * `depth` - Receive queue depth for the new endpoint
    /// * `shutdown` - Checked between every connection-manager step
    fn client_connect(
        &self,
        dest: &FabricAddr,
        private_data: &[u8],
        depth: usize,
        shutdown: &ShutdownToken,
    ) -> Result<Box<dyn Endpoint>>;
}

/// Passive endpoint
pub trait Listener: Send {
    fn local_addr(&self) -> &FabricAddr;

    /// Poll for an incoming connection request
    ///
    /// Returns `Ok(None)` after a bounded wait with nothing pending, and
    /// `Err(Shutdown)` once the token is triggered.
    fn wait_for_connection(
        &mut self,
        shutdown: &ShutdownToken,
    ) -> Result<Option<Box<dyn ConnRequest>>>;
}

/// Connection request waiting for accept or reject
pub trait ConnRequest: Send {
    /// Private data supplied by the connecting host
    fn private_data(&self) -> &[u8];

    /// Peer description for logging
    fn peer(&self) -> String;

    /// Complete the association; gives up once `shutdown` triggers
    fn accept(self: Box<Self>, depth: usize, shutdown: &ShutdownToken) -> Result<Box<dyn Endpoint>>;

    fn reject(self: Box<Self>, data: &[u8]) -> Result<()>;
}

/// One connected fabric association
pub trait Endpoint: Send {
    fn peer(&self) -> String;

    /// Allocate and register a page-aligned buffer on this endpoint
    fn alloc_key(&self, len: usize) -> Result<RegisteredBuffer>;

    /// Post a send of the first `len` bytes of `buf`
    fn post_msg(&mut self, buf: &RegisteredBuffer, len: usize) -> Result<()>;

    /// Post a send and wait for its completion
    fn send_msg(
        &mut self,
        buf: &RegisteredBuffer,
        len: usize,
        shutdown: &ShutdownToken,
    ) -> Result<()>;

    /// Non-blocking receive poll; `Ok(None)` means would-block
    fn poll_for_msg(&mut self) -> Result<Option<Received>>;

    /// Hand a consumed receive slot back to the receive ring
    fn repost_recv(&mut self, entry: QueueEntryId) -> Result<()>;

    /// Pull `remote.len` bytes of peer memory into the start of `local`
    fn rma_read(
        &mut self,
        local: &mut RegisteredBuffer,
        remote: RemoteBuffer,
        shutdown: &ShutdownToken,
    ) -> Result<()>;

    /// Push the first `remote.len` bytes of `local` into peer memory
    fn rma_write(
        &mut self,
        local: &RegisteredBuffer,
        remote: RemoteBuffer,
        shutdown: &ShutdownToken,
    ) -> Result<()>;
}

/// Create the transport for a configured fabric type
pub fn create_transport(trtype: TransportType) -> Result<Arc<dyn Transport>> {
    match trtype {
        TransportType::Loopback => {
            log::info!("Using loopback fabric (in-process)");
            Ok(Arc::new(loopback::LoopbackFabric::shared()))
        }
        #[cfg(feature = "rdma-transport")]
        TransportType::Rdma => {
            log::info!("Using RDMA-CM transport");
            Ok(Arc::new(crate::rdma::RdmaTransport::new()))
        }
        #[cfg(not(feature = "rdma-transport"))]
        TransportType::Rdma => Err(TransportError::Rdma(
            "RDMA support not compiled in, enable the rdma-transport feature".into(),
        )),
    }
}
