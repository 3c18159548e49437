//! Host OS side of auto-connect
//!
//! The kernel lists fabrics controllers under
//! `/sys/class/nvme-fabrics/ctl/nvme*` and creates new ones when an option
//! string is written to `/dev/nvme-fabrics`.

use log::debug;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use fabric_transport::TransportType;

use crate::nvme::DiscoveryLogEntry;
use crate::{DemError, Result};

pub const SYSFS_CTL_DIR: &str = "/sys/class/nvme-fabrics/ctl";
pub const FABRICS_DEV: &str = "/dev/nvme-fabrics";

/// A fabrics controller the host OS already has
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsController {
    pub transport: String,
    pub traddr: String,
    pub trsvcid: String,
    pub subnqn: String,
}

impl OsController {
    pub fn from_entry(entry: &DiscoveryLogEntry) -> Self {
        Self {
            transport: transport_name(entry.trtype).unwrap_or_default().to_string(),
            traddr: entry.traddr.clone(),
            trsvcid: entry.trsvcid.clone(),
            subnqn: entry.subnqn.clone(),
        }
    }

    /// Whether this controller serves a log entry
    pub fn matches(&self, entry: &DiscoveryLogEntry) -> bool {
        self.subnqn == entry.subnqn
            && self.traddr == entry.traddr
            && self.trsvcid == entry.trsvcid
            && transport_name(entry.trtype) == Some(self.transport.as_str())
    }
}

fn transport_name(trtype: u8) -> Option<&'static str> {
    TransportType::from_trtype(trtype).map(|t| t.as_str())
}

pub trait HostConnector: Send + Sync {
    /// Controllers the host is currently connected to
    fn connected(&self) -> Result<Vec<OsController>>;

    /// Ask the host to connect one subsystem
    fn connect(&self, entry: &DiscoveryLogEntry, host_nqn: &str) -> Result<()>;
}

/// Linux nvme-fabrics connector
#[derive(Debug, Clone)]
pub struct SysfsConnector {
    ctl_dir: PathBuf,
    fabrics_dev: PathBuf,
}

impl Default for SysfsConnector {
    fn default() -> Self {
        Self::new(SYSFS_CTL_DIR, FABRICS_DEV)
    }
}

fn read_attr(dir: &Path, name: &str) -> Result<String> {
    Ok(fs::read_to_string(dir.join(name))?.trim().to_string())
}

/// Split `traddr=..,trsvcid=..` into its two values
fn parse_address(address: &str) -> (String, String) {
    let mut traddr = String::new();
    let mut trsvcid = String::new();

    for field in address.split(',') {
        match field.trim().split_once('=') {
            Some(("traddr", value)) => traddr = value.to_string(),
            Some(("trsvcid", value)) => trsvcid = value.to_string(),
            _ => {}
        }
    }
    (traddr, trsvcid)
}

impl SysfsConnector {
    pub fn new(ctl_dir: impl Into<PathBuf>, fabrics_dev: impl Into<PathBuf>) -> Self {
        Self {
            ctl_dir: ctl_dir.into(),
            fabrics_dev: fabrics_dev.into(),
        }
    }

    /// Option string understood by `/dev/nvme-fabrics`
    pub fn options(entry: &DiscoveryLogEntry, host_nqn: &str) -> Result<String> {
        let transport = transport_name(entry.trtype).ok_or_else(|| {
            DemError::Config(format!("unsupported transport type {}", entry.trtype))
        })?;

        Ok(format!(
            "transport={},traddr={},trsvcid={},nqn={},hostnqn={}",
            transport, entry.traddr, entry.trsvcid, entry.subnqn, host_nqn
        ))
    }
}

impl HostConnector for SysfsConnector {
    fn connected(&self) -> Result<Vec<OsController>> {
        let dir = match fs::read_dir(&self.ctl_dir) {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut controllers = Vec::new();
        for ctl in dir {
            let ctl = ctl?;
            if !ctl.file_name().to_string_lossy().starts_with("nvme") {
                continue;
            }

            let path = ctl.path();
            let (traddr, trsvcid) = parse_address(&read_attr(&path, "address")?);
            controllers.push(OsController {
                transport: read_attr(&path, "transport")?,
                traddr,
                trsvcid,
                subnqn: read_attr(&path, "subsysnqn")?,
            });
        }
        Ok(controllers)
    }

    fn connect(&self, entry: &DiscoveryLogEntry, host_nqn: &str) -> Result<()> {
        let options = Self::options(entry, host_nqn)?;
        debug!("Writing '{}' to {}", options, self.fabrics_dev.display());

        let mut dev = OpenOptions::new().write(true).open(&self.fabrics_dev)?;
        dev.write_all(options.as_bytes())?;
        Ok(())
    }
}
