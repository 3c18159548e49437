//! Configuration backend behind the supervisory resource-config commands
//!
//! The daemon never touches a target's configfs or SPDK state directly; it
//! hands each decoded request to a `ConfigBackend`. `MemoryBackend` keeps
//! the configuration in maps and enforces the same referential rules a
//! real target would.

use log::{debug, info};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

use crate::nvme::{
    ConfigRequest, HostConfig, HostLink, NsConfig, NsDevice, PortConfig, PortLink, SubsysConfig,
    TransportEntry,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} '{name}' still in use")]
    InUse { kind: &'static str, name: String },

    #[error("device {0} does not exist")]
    NoDevice(u32),
}

fn not_found(kind: &'static str, name: impl ToString) -> BackendError {
    BackendError::NotFound {
        kind,
        name: name.to_string(),
    }
}

pub trait ConfigBackend: Send + Sync {
    fn set_port(&self, port: &PortConfig) -> Result<(), BackendError>;
    fn del_port(&self, portid: u16) -> Result<(), BackendError>;
    fn link_port(&self, link: &PortLink) -> Result<(), BackendError>;
    fn unlink_port(&self, link: &PortLink) -> Result<(), BackendError>;
    fn set_subsys(&self, subsys: &SubsysConfig) -> Result<(), BackendError>;
    fn del_subsys(&self, subnqn: &str) -> Result<(), BackendError>;
    fn set_ns(&self, ns: &NsConfig) -> Result<(), BackendError>;
    fn del_ns(&self, subnqn: &str, nsid: u32) -> Result<(), BackendError>;
    fn set_host(&self, host: &HostConfig) -> Result<(), BackendError>;
    fn del_host(&self, hostnqn: &str) -> Result<(), BackendError>;
    fn link_host(&self, link: &HostLink) -> Result<(), BackendError>;
    fn unlink_host(&self, link: &HostLink) -> Result<(), BackendError>;

    /// Drop every subsystem, host and port
    fn reset(&self);

    fn ns_devices(&self) -> Vec<NsDevice>;
    fn transports(&self) -> Vec<TransportEntry>;

    /// Apply one decoded resource-config set request
    fn apply(&self, request: &ConfigRequest) -> Result<(), BackendError> {
        match request {
            ConfigRequest::SetPort(port) => self.set_port(port),
            ConfigRequest::DelPort(portid) => self.del_port(*portid),
            ConfigRequest::LinkPort(link) => self.link_port(link),
            ConfigRequest::UnlinkPort(link) => self.unlink_port(link),
            ConfigRequest::SetSubsys(subsys) => self.set_subsys(subsys),
            ConfigRequest::DelSubsys(subnqn) => self.del_subsys(subnqn),
            ConfigRequest::SetNs(ns) => self.set_ns(ns),
            ConfigRequest::DelNs { subnqn, nsid } => self.del_ns(subnqn, *nsid),
            ConfigRequest::SetHost(host) => self.set_host(host),
            ConfigRequest::DelHost(hostnqn) => self.del_host(hostnqn),
            ConfigRequest::LinkHost(link) => self.link_host(link),
            ConfigRequest::UnlinkHost(link) => self.unlink_host(link),
        }
    }
}

#[derive(Debug, Default, Clone)]
struct Subsystem {
    allow_any: bool,
    namespaces: BTreeMap<u32, NsConfig>,
    hosts: BTreeSet<String>,
    ports: BTreeSet<u16>,
}

#[derive(Debug, Default)]
struct State {
    ports: BTreeMap<u16, PortConfig>,
    subsystems: BTreeMap<String, Subsystem>,
    hosts: BTreeSet<String>,
}

/// In-memory backend
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
    devices: Vec<NsDevice>,
    transports: Vec<TransportEntry>,
}

impl MemoryBackend {
    pub fn new(devices: Vec<NsDevice>, transports: Vec<TransportEntry>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            devices,
            transports,
        }
    }

    pub fn subsystems(&self) -> Vec<String> {
        self.state.lock().subsystems.keys().cloned().collect()
    }

    pub fn hosts(&self) -> Vec<String> {
        self.state.lock().hosts.iter().cloned().collect()
    }

    pub fn ports(&self) -> Vec<u16> {
        self.state.lock().ports.keys().copied().collect()
    }

    /// Hosts allowed on a subsystem, and whether it allows any host
    pub fn access(&self, subnqn: &str) -> Option<(bool, Vec<String>)> {
        let state = self.state.lock();
        let subsys = state.subsystems.get(subnqn)?;
        Some((subsys.allow_any, subsys.hosts.iter().cloned().collect()))
    }

    pub fn namespaces(&self, subnqn: &str) -> Vec<u32> {
        self.state
            .lock()
            .subsystems
            .get(subnqn)
            .map(|s| s.namespaces.keys().copied().collect())
            .unwrap_or_default()
    }
}

impl ConfigBackend for MemoryBackend {
    fn set_port(&self, port: &PortConfig) -> Result<(), BackendError> {
        debug!("set port {} {}:{}", port.portid, port.traddr, port.trsvcid);
        self.state.lock().ports.insert(port.portid, port.clone());
        Ok(())
    }

    fn del_port(&self, portid: u16) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        if state.subsystems.values().any(|s| s.ports.contains(&portid)) {
            return Err(BackendError::InUse {
                kind: "port",
                name: portid.to_string(),
            });
        }
        state
            .ports
            .remove(&portid)
            .map(|_| ())
            .ok_or_else(|| not_found("port", portid))
    }

    fn link_port(&self, link: &PortLink) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        if !state.ports.contains_key(&link.portid) {
            return Err(not_found("port", link.portid));
        }
        let subsys = state
            .subsystems
            .get_mut(&link.subnqn)
            .ok_or_else(|| not_found("subsystem", &link.subnqn))?;
        subsys.ports.insert(link.portid);
        Ok(())
    }

    fn unlink_port(&self, link: &PortLink) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        let subsys = state
            .subsystems
            .get_mut(&link.subnqn)
            .ok_or_else(|| not_found("subsystem", &link.subnqn))?;
        if !subsys.ports.remove(&link.portid) {
            return Err(not_found("port link", link.portid));
        }
        Ok(())
    }

    fn set_subsys(&self, subsys: &SubsysConfig) -> Result<(), BackendError> {
        info!(
            "set subsystem {} (allow any: {})",
            subsys.subnqn, subsys.allow_any
        );
        let mut state = self.state.lock();
        state
            .subsystems
            .entry(subsys.subnqn.clone())
            .or_default()
            .allow_any = subsys.allow_any;
        Ok(())
    }

    fn del_subsys(&self, subnqn: &str) -> Result<(), BackendError> {
        self.state
            .lock()
            .subsystems
            .remove(subnqn)
            .map(|_| ())
            .ok_or_else(|| not_found("subsystem", subnqn))
    }

    fn set_ns(&self, ns: &NsConfig) -> Result<(), BackendError> {
        let known = ns.deviceid == NsDevice::NULLB_DEVID as u32
            || self.devices.iter().any(|d| d.devid as u32 == ns.deviceid);
        if !known {
            return Err(BackendError::NoDevice(ns.deviceid));
        }

        let mut state = self.state.lock();
        let subsys = state
            .subsystems
            .get_mut(&ns.subnqn)
            .ok_or_else(|| not_found("subsystem", &ns.subnqn))?;
        subsys.namespaces.insert(ns.nsid, ns.clone());
        Ok(())
    }

    fn del_ns(&self, subnqn: &str, nsid: u32) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        let subsys = state
            .subsystems
            .get_mut(subnqn)
            .ok_or_else(|| not_found("subsystem", subnqn))?;
        subsys
            .namespaces
            .remove(&nsid)
            .map(|_| ())
            .ok_or_else(|| not_found("namespace", nsid))
    }

    fn set_host(&self, host: &HostConfig) -> Result<(), BackendError> {
        self.state.lock().hosts.insert(host.hostnqn.clone());
        Ok(())
    }

    fn del_host(&self, hostnqn: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        if !state.hosts.remove(hostnqn) {
            return Err(not_found("host", hostnqn));
        }
        // Deleting a host revokes it everywhere
        for subsys in state.subsystems.values_mut() {
            subsys.hosts.remove(hostnqn);
        }
        Ok(())
    }

    fn link_host(&self, link: &HostLink) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        if !state.hosts.contains(&link.hostnqn) {
            return Err(not_found("host", &link.hostnqn));
        }
        let subsys = state
            .subsystems
            .get_mut(&link.subnqn)
            .ok_or_else(|| not_found("subsystem", &link.subnqn))?;
        subsys.hosts.insert(link.hostnqn.clone());
        Ok(())
    }

    fn unlink_host(&self, link: &HostLink) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        let subsys = state
            .subsystems
            .get_mut(&link.subnqn)
            .ok_or_else(|| not_found("subsystem", &link.subnqn))?;
        if !subsys.hosts.remove(&link.hostnqn) {
            return Err(not_found("host link", &link.hostnqn));
        }
        Ok(())
    }

    fn reset(&self) {
        info!("resetting target configuration");
        *self.state.lock() = State::default();
    }

    fn ns_devices(&self) -> Vec<NsDevice> {
        self.devices.clone()
    }

    fn transports(&self) -> Vec<TransportEntry> {
        self.transports.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> MemoryBackend {
        MemoryBackend::new(vec![NsDevice { devid: 0, nsid: 1 }], Vec::new())
    }

    fn link(subnqn: &str, hostnqn: &str) -> HostLink {
        HostLink {
            subnqn: subnqn.into(),
            hostnqn: hostnqn.into(),
        }
    }

    #[test]
    fn test_host_link_requires_both_ends() {
        let backend = backend();
        backend
            .set_subsys(&SubsysConfig {
                subnqn: "nqn.sub".into(),
                allow_any: false,
            })
            .unwrap();

        assert!(matches!(
            backend.link_host(&link("nqn.sub", "nqn.host")),
            Err(BackendError::NotFound { kind: "host", .. })
        ));

        backend
            .set_host(&HostConfig {
                hostnqn: "nqn.host".into(),
            })
            .unwrap();
        backend.link_host(&link("nqn.sub", "nqn.host")).unwrap();
        assert_eq!(
            backend.access("nqn.sub"),
            Some((false, vec!["nqn.host".to_string()]))
        );

        backend.del_host("nqn.host").unwrap();
        assert_eq!(backend.access("nqn.sub"), Some((false, vec![])));
    }

    #[test]
    fn test_delete_missing_is_error() {
        let backend = backend();
        assert!(backend.del_subsys("nqn.none").is_err());
        assert!(backend.del_port(9).is_err());
        assert!(backend.apply(&ConfigRequest::DelHost("nqn.none".into())).is_err());
    }

    #[test]
    fn test_port_in_use() {
        let backend = backend();
        backend
            .set_port(&PortConfig {
                portid: 1,
                trtype: 1,
                adrfam: 1,
                treq: 0,
                traddr: "10.0.0.1".into(),
                trsvcid: "4420".into(),
            })
            .unwrap();
        backend
            .set_subsys(&SubsysConfig {
                subnqn: "nqn.sub".into(),
                allow_any: true,
            })
            .unwrap();
        let port_link = PortLink {
            subnqn: "nqn.sub".into(),
            portid: 1,
        };
        backend.link_port(&port_link).unwrap();

        assert!(matches!(
            backend.del_port(1),
            Err(BackendError::InUse { .. })
        ));
        backend.unlink_port(&port_link).unwrap();
        backend.del_port(1).unwrap();
    }

    #[test]
    fn test_namespace_device_checked_and_reset() {
        let backend = backend();
        backend
            .set_subsys(&SubsysConfig {
                subnqn: "nqn.sub".into(),
                allow_any: true,
            })
            .unwrap();

        let mut ns = NsConfig {
            subnqn: "nqn.sub".into(),
            nsid: 1,
            deviceid: 7,
            devicensid: 1,
        };
        assert_eq!(backend.set_ns(&ns), Err(BackendError::NoDevice(7)));

        ns.deviceid = 0;
        backend.set_ns(&ns).unwrap();
        assert_eq!(backend.namespaces("nqn.sub"), vec![1]);

        backend.reset();
        assert!(backend.subsystems().is_empty());
    }
}
