//! RDMA-CM transport
//!
//! Connection management through the RDMA connection manager (address and
//! route resolution, listen/accept/reject) and data movement through verbs
//! on the CM-created queue pair.

pub mod cm;
pub mod connection;
pub mod device;

pub use cm::{RdmaListener, RdmaRequest};
pub use connection::RdmaEndpoint;
pub use device::{ProtectionDomain, RdmaMemoryRegion};

use crate::shutdown::ShutdownToken;
use crate::transport::{Endpoint, FabricAddr, Listener, Transport, TransportType};
use crate::Result;

pub(crate) mod ffi {
    #![allow(non_upper_case_globals)]
    #![allow(non_camel_case_types)]
    #![allow(non_snake_case)]
    #![allow(dead_code)]
    #![allow(clippy::all)]
    include!(concat!(env!("OUT_DIR"), "/rdma_bindings.rs"));
}

/// RDMA fabric; every listener and endpoint owns its own event channel
#[derive(Debug, Default)]
pub struct RdmaTransport;

impl RdmaTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Transport for RdmaTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Rdma
    }

    fn init_listener(&self, addr: &FabricAddr) -> Result<Box<dyn Listener>> {
        Ok(Box::new(RdmaListener::bind(addr)?))
    }

    fn client_connect(
        &self,
        dest: &FabricAddr,
        private_data: &[u8],
        depth: usize,
        shutdown: &ShutdownToken,
    ) -> Result<Box<dyn Endpoint>> {
        Ok(Box::new(cm::connect(dest, private_data, depth, shutdown)?))
    }
}
