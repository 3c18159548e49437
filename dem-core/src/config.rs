//! Daemon configuration files
//!
//! Each daemon reads one JSON document. Omitted fields take the defaults
//! below, so an empty object is a valid configuration.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::Path;

use fabric_transport::{AddressFamily, FabricAddr, TransportType};

use crate::discovery::DELAY_MS;
use crate::nvme::{HOST_NQN_PREFIX, NQN_FIELD_LEN};
use crate::registry::{SubsystemAccess, TargetRegistry};
use crate::service::DELAY_TIMEOUT_MS;
use crate::{DemError, Result};

/// Service id the daemons listen on and connect to by default
pub const DEFAULT_PORT: &str = "4422";

/// Default log refresh interval for targets (minutes)
pub const DEFAULT_REFRESH_MINUTES: u32 = 5;

/// `nqn.2014-08.org.nvmexpress:NVMf:uuid:<random v4 uuid>`
pub fn generate_host_nqn() -> String {
    let mut b: [u8; 16] = rand::random();
    b[6] = (b[6] & 0x0f) | 0x40;
    b[8] = (b[8] & 0x3f) | 0x80;

    let hex: String = b.iter().map(|byte| format!("{:02x}", byte)).collect();
    format!(
        "{}{}-{}-{}-{}-{}",
        HOST_NQN_PREFIX,
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

fn check_nqn(what: &str, nqn: &str) -> Result<()> {
    if nqn.is_empty() || nqn.len() > NQN_FIELD_LEN {
        return Err(DemError::Config(format!(
            "{} must be 1..={} bytes, got {}",
            what,
            NQN_FIELD_LEN,
            nqn.len()
        )));
    }
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path)?;
    serde_json::from_str(&text).map_err(|e| DemError::Config(format!("{}: {}", path.display(), e)))
}

/// Listening interface of `demd`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceConfig {
    #[serde(flatten)]
    pub addr: FabricAddr,
    /// Serve resource-config commands on this interface
    #[serde(default)]
    pub supervisory: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubsystemConfig {
    pub nqn: String,
    #[serde(default)]
    pub allow_any: bool,
    #[serde(default)]
    pub hosts: Vec<String>,
}

/// Remote target whose discovery log `demd` serves
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    pub alias: String,
    #[serde(flatten)]
    pub addr: FabricAddr,
    /// Log refresh interval (minutes)
    #[serde(default = "default_refresh")]
    pub refresh: u32,
    #[serde(default)]
    pub subsystems: Vec<SubsystemConfig>,
}

fn default_refresh() -> u32 {
    DEFAULT_REFRESH_MINUTES
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemConfig {
    pub host_nqn: String,
    pub service_delay_ms: u64,
    pub interfaces: Vec<InterfaceConfig>,
    pub targets: Vec<TargetConfig>,
}

impl Default for DemConfig {
    fn default() -> Self {
        Self {
            host_nqn: generate_host_nqn(),
            service_delay_ms: DELAY_TIMEOUT_MS,
            interfaces: vec![InterfaceConfig {
                addr: FabricAddr::new(
                    TransportType::Rdma,
                    AddressFamily::Ipv4,
                    "0.0.0.0",
                    DEFAULT_PORT,
                ),
                supervisory: false,
            }],
            targets: Vec::new(),
        }
    }
}

impl DemConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = read_json(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        check_nqn("host_nqn", &self.host_nqn)?;

        if self.interfaces.is_empty() {
            return Err(DemError::Config("no interfaces configured".into()));
        }

        let mut aliases = HashSet::new();
        for target in &self.targets {
            if !aliases.insert(target.alias.as_str()) {
                return Err(DemError::Config(format!(
                    "duplicate target alias '{}'",
                    target.alias
                )));
            }
            for subsys in &target.subsystems {
                check_nqn("subsystem nqn", &subsys.nqn)?;
                for host in &subsys.hosts {
                    check_nqn("host nqn", host)?;
                }
            }
        }
        Ok(())
    }

    /// Load every configured target and its access rules into `registry`
    pub fn populate(&self, registry: &TargetRegistry) {
        for target in &self.targets {
            registry.add_target(&target.alias, target.addr.clone());
            for subsys in &target.subsystems {
                registry.set_subsystem(
                    &target.alias,
                    &subsys.nqn,
                    SubsystemAccess {
                        allow_any: subsys.allow_any,
                        hosts: subsys.hosts.iter().cloned().collect::<BTreeSet<_>>(),
                    },
                );
            }
        }
    }
}

/// Configuration of `dem-autoconnect`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoConnectConfig {
    /// Discovery controller to follow
    pub discovery: FabricAddr,
    pub host_nqn: String,
    /// Tick period (ms)
    pub tick_ms: u64,
}

impl Default for AutoConnectConfig {
    fn default() -> Self {
        Self {
            discovery: FabricAddr::new(
                TransportType::Rdma,
                AddressFamily::Ipv4,
                "127.0.0.1",
                DEFAULT_PORT,
            ),
            host_nqn: generate_host_nqn(),
            tick_ms: DELAY_MS,
        }
    }
}

impl AutoConnectConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = read_json(path)?;
        check_nqn("host_nqn", &config.host_nqn)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_nqn_format() {
        let nqn = generate_host_nqn();
        let uuid = nqn.strip_prefix(HOST_NQN_PREFIX).unwrap();
        assert_eq!(uuid.len(), 36);
        assert_eq!(uuid.as_bytes()[14], b'4');
        assert_ne!(generate_host_nqn(), nqn);
    }

    #[test]
    fn test_dem_config_default() {
        let config = DemConfig::default();
        assert_eq!(config.service_delay_ms, 100);
        assert_eq!(config.interfaces.len(), 1);
        assert_eq!(config.interfaces[0].addr.trsvcid, "4422");
        assert!(config.targets.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_dem_config_parse() {
        let json = r#"{
            "host_nqn": "nqn.2014-08.org.nvmexpress:NVMf:uuid:dem",
            "interfaces": [
                {"trtype": "loop", "adrfam": "loop", "traddr": "127.0.0.1", "trsvcid": "4422"},
                {"trtype": "rdma", "adrfam": "ipv4", "traddr": "10.0.0.1", "trsvcid": "4423", "supervisory": true}
            ],
            "targets": [{
                "alias": "array1",
                "trtype": "rdma", "adrfam": "ipv4", "traddr": "10.0.0.5", "trsvcid": "4420",
                "subsystems": [
                    {"nqn": "nqn.open", "allow_any": true},
                    {"nqn": "nqn.restricted", "hosts": ["nqn.host-x"]}
                ]
            }]
        }"#;

        let config: DemConfig = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.service_delay_ms, DELAY_TIMEOUT_MS);
        assert!(config.interfaces[1].supervisory);
        assert_eq!(config.interfaces[0].addr.trtype, TransportType::Loopback);
        assert_eq!(config.targets[0].refresh, DEFAULT_REFRESH_MINUTES);

        let registry = TargetRegistry::new();
        config.populate(&registry);
        let target = registry.target("array1").unwrap();
        assert_eq!(target.subsystems.len(), 2);
        assert!(target.subsystems["nqn.restricted"].allows("nqn.host-x"));
        assert!(!target.subsystems["nqn.restricted"].allows("nqn.host-y"));
    }

    #[test]
    fn test_dem_config_rejects_duplicates() {
        let mut config = DemConfig::default();
        let target = TargetConfig {
            alias: "a".into(),
            addr: FabricAddr::loopback("127.0.0.1", "4420"),
            refresh: 1,
            subsystems: Vec::new(),
        };
        config.targets = vec![target.clone(), target];
        assert!(matches!(config.validate(), Err(DemError::Config(_))));

        config.targets.clear();
        config.interfaces.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = DemConfig::load(Path::new("/nonexistent/demd.json")).unwrap_err();
        assert!(matches!(err, DemError::Io(_)));
    }

    #[test]
    fn test_autoconnect_config() {
        let json = r#"{"discovery": {"trtype": "rdma", "adrfam": "ipv4", "traddr": "10.0.0.9", "trsvcid": "4422"}}"#;
        let config: AutoConnectConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.discovery.traddr, "10.0.0.9");
        assert_eq!(config.tick_ms, 480);
        assert!(config.host_nqn.starts_with(HOST_NQN_PREFIX));
    }
}
