//! Target registry shared by the discovery clients and the dispatchers
//!
//! Discovery clients write each target's freshly fetched log pages; the
//! dispatchers read the entries a given host is allowed to see. The
//! generation counter moves on every change that can alter what a host
//! sees, and is reported as the discovery log `genctr`.

use log::info;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use fabric_transport::FabricAddr;

use crate::logpage::{Freshness, LogPageCache, Reconciled};
use crate::nvme::DiscoveryLogEntry;

/// Host access rule of one subsystem
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubsystemAccess {
    pub allow_any: bool,
    pub hosts: BTreeSet<String>,
}

impl SubsystemAccess {
    pub fn allows(&self, host_nqn: &str) -> bool {
        self.allow_any || self.hosts.contains(host_nqn)
    }
}

#[derive(Debug, Clone)]
pub struct TargetRecord {
    pub alias: String,
    pub addr: FabricAddr,
    pub subsystems: BTreeMap<String, SubsystemAccess>,
    pub log_pages: LogPageCache,
    pub connected: bool,
}

#[derive(Debug)]
struct Inner {
    targets: BTreeMap<String, TargetRecord>,
    generation: u64,
}

impl Inner {
    fn bump(&mut self) {
        self.generation = self.generation.wrapping_add(1).max(1);
    }
}

#[derive(Debug, Clone)]
pub struct TargetRegistry {
    inner: Arc<RwLock<Inner>>,
}

impl Default for TargetRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                targets: BTreeMap::new(),
                generation: 1,
            })),
        }
    }

    pub fn generation(&self) -> u64 {
        self.inner.read().generation
    }

    pub fn add_target(&self, alias: &str, addr: FabricAddr) {
        let mut inner = self.inner.write();
        inner.targets.insert(
            alias.to_string(),
            TargetRecord {
                alias: alias.to_string(),
                addr,
                subsystems: BTreeMap::new(),
                log_pages: LogPageCache::new(),
                connected: false,
            },
        );
        inner.bump();
    }

    pub fn remove_target(&self, alias: &str) -> bool {
        let mut inner = self.inner.write();
        let removed = inner.targets.remove(alias).is_some();
        if removed {
            inner.bump();
        }
        removed
    }

    pub fn target(&self, alias: &str) -> Option<TargetRecord> {
        self.inner.read().targets.get(alias).cloned()
    }

    pub fn aliases(&self) -> Vec<String> {
        self.inner.read().targets.keys().cloned().collect()
    }

    /// Create or replace a subsystem's access rule
    pub fn set_subsystem(&self, alias: &str, subnqn: &str, access: SubsystemAccess) -> bool {
        let mut inner = self.inner.write();
        let Some(target) = inner.targets.get_mut(alias) else {
            return false;
        };
        target.subsystems.insert(subnqn.to_string(), access);
        inner.bump();
        true
    }

    pub fn allow_host(&self, alias: &str, subnqn: &str, host_nqn: &str) -> bool {
        let mut inner = self.inner.write();
        let Some(subsys) = inner
            .targets
            .get_mut(alias)
            .and_then(|t| t.subsystems.get_mut(subnqn))
        else {
            return false;
        };
        subsys.hosts.insert(host_nqn.to_string());
        inner.bump();
        true
    }

    pub fn set_connected(&self, alias: &str, connected: bool) {
        if let Some(target) = self.inner.write().targets.get_mut(alias) {
            target.connected = connected;
        }
    }

    /// Reconcile a target's cache with a fetched log
    pub fn update_log_pages(
        &self,
        alias: &str,
        fetched: Vec<DiscoveryLogEntry>,
    ) -> Option<Reconciled> {
        let mut inner = self.inner.write();
        let target = inner.targets.get_mut(alias)?;

        let result = target.log_pages.reconcile(fetched);
        target.log_pages.settle();

        if result.changed() {
            info!(
                "Target {}: {} log pages added, {} removed",
                alias,
                result.added.len(),
                result.removed.len()
            );
            inner.bump();
        }
        Some(result)
    }

    /// Generation and visible entries read under one lock
    pub fn visible_log(&self, host_nqn: &str) -> (u64, Vec<DiscoveryLogEntry>) {
        let inner = self.inner.read();
        (inner.generation, Self::collect_visible(&inner, host_nqn))
    }

    /// Every live entry `host_nqn` may see, in target then key order
    pub fn visible_entries(&self, host_nqn: &str) -> Vec<DiscoveryLogEntry> {
        Self::collect_visible(&self.inner.read(), host_nqn)
    }

    fn collect_visible(inner: &Inner, host_nqn: &str) -> Vec<DiscoveryLogEntry> {
        inner
            .targets
            .values()
            .flat_map(|target| {
                target.log_pages.iter().filter_map(move |(key, page)| {
                    let allowed = target
                        .subsystems
                        .get(&key.subnqn)
                        .is_some_and(|access| access.allows(host_nqn));
                    (allowed && page.freshness != Freshness::Deleted).then(|| page.entry.clone())
                })
            })
            .collect()
    }

    pub fn visible_count(&self, host_nqn: &str) -> usize {
        self.visible_entries(host_nqn).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nvme::{RdmaTsas, SubsystemType};

    const HOST_X: &str = "nqn.2014-08.org.nvmexpress:NVMf:uuid:host-x";
    const HOST_Y: &str = "nqn.2014-08.org.nvmexpress:NVMf:uuid:host-y";

    fn entry(subnqn: &str) -> DiscoveryLogEntry {
        DiscoveryLogEntry {
            trtype: 1,
            adrfam: 1,
            subtype: SubsystemType::Nvme,
            treq: 0,
            portid: 1,
            cntlid: 0xffff,
            asqsz: 32,
            trsvcid: "4420".into(),
            subnqn: subnqn.into(),
            traddr: "10.0.0.5".into(),
            tsas: RdmaTsas::default(),
        }
    }

    fn registry() -> TargetRegistry {
        let registry = TargetRegistry::new();
        registry.add_target("t1", FabricAddr::loopback("10.0.0.5", "4420"));
        registry.set_subsystem(
            "t1",
            "nqn.open",
            SubsystemAccess {
                allow_any: true,
                hosts: BTreeSet::new(),
            },
        );
        registry.set_subsystem(
            "t1",
            "nqn.restricted",
            SubsystemAccess {
                allow_any: false,
                hosts: [HOST_X.to_string()].into(),
            },
        );
        registry.update_log_pages("t1", vec![entry("nqn.open"), entry("nqn.restricted")]);
        registry
    }

    #[test]
    fn test_visibility_by_acl() {
        let registry = registry();
        assert_eq!(registry.visible_count(HOST_X), 2);
        assert_eq!(registry.visible_count(HOST_Y), 1);
        assert_eq!(registry.visible_entries(HOST_Y)[0].subnqn, "nqn.open");
    }

    #[test]
    fn test_visibility_monotonic() {
        let registry = registry();
        let hosts = [HOST_X, HOST_Y, "nqn.other"];
        let before: Vec<usize> = hosts.iter().map(|h| registry.visible_count(h)).collect();

        registry.allow_host("t1", "nqn.restricted", HOST_Y);
        let after_acl: Vec<usize> = hosts.iter().map(|h| registry.visible_count(h)).collect();
        assert!(before.iter().zip(&after_acl).all(|(b, a)| a >= b));
        assert_eq!(registry.visible_count(HOST_Y), 2);

        registry.set_subsystem(
            "t1",
            "nqn.restricted",
            SubsystemAccess {
                allow_any: true,
                hosts: BTreeSet::new(),
            },
        );
        let after_any: Vec<usize> = hosts.iter().map(|h| registry.visible_count(h)).collect();
        assert!(after_acl.iter().zip(&after_any).all(|(b, a)| a >= b));
        assert_eq!(after_any, vec![2, 2, 2]);
    }

    #[test]
    fn test_unconfigured_subsystem_hidden() {
        let registry = registry();
        registry.update_log_pages(
            "t1",
            vec![entry("nqn.open"), entry("nqn.restricted"), entry("nqn.unknown")],
        );
        assert_eq!(registry.visible_count(HOST_X), 2);
    }

    #[test]
    fn test_generation_moves_on_change_only() {
        let registry = registry();
        let gen = registry.generation();

        registry.update_log_pages("t1", vec![entry("nqn.open"), entry("nqn.restricted")]);
        assert_eq!(registry.generation(), gen);

        registry.update_log_pages("t1", vec![entry("nqn.open")]);
        assert!(registry.generation() > gen);
        assert!(registry.update_log_pages("missing", Vec::new()).is_none());
    }
}
