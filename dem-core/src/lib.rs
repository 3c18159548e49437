//! NVMe-oF distributed endpoint manager core
//!
//! Controller side: [`Interface`] accepts host admin queues on one fabric
//! address, parks them in a bounded [`HostQueue`] and services them with a
//! [`Dispatcher`] that answers discovery (and, on supervisory interfaces,
//! resource-config) commands from the shared [`TargetRegistry`].
//!
//! Host side: [`DiscoveryClient`] follows one discovery controller and
//! reconciles its log into a [`LogPageCache`]; [`TargetRefresher`] does the
//! same for every configured target on behalf of the daemon.

pub mod backend;
pub mod client;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod host_queue;
pub mod logpage;
pub mod nvme;
pub mod registry;
pub mod service;

#[cfg(test)]
mod testutil;

pub use backend::{ConfigBackend, MemoryBackend};
pub use client::ControllerClient;
pub use config::{AutoConnectConfig, DemConfig};
pub use connection::Connection;
pub use discovery::{ClientState, DiscoveryClient, HostConnector, SysfsConnector, TargetRefresher};
pub use dispatch::{DispatchMode, Dispatcher};
pub use error::{DemError, Result};
pub use host_queue::HostQueue;
pub use logpage::LogPageCache;
pub use registry::{SubsystemAccess, TargetRegistry};
pub use service::{Interface, InterfaceHandle, ServiceOptions};
