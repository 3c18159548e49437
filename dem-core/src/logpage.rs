//! Per-target discovery log cache
//!
//! Each fetch replaces the cache wholesale, but entries are matched against
//! the previous contents so callers can act only on what changed: entries
//! seen before stay VALID, new ones arrive as NEW, and entries the target
//! stopped reporting are pruned.

use log::info;
use std::collections::BTreeMap;

use crate::nvme::{DiscoveryLogEntry, SubsystemType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Valid,
    Deleted,
    New,
}

/// Identity of a log page entry within one target
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogPageKey {
    pub subnqn: String,
    pub trtype: u8,
    pub adrfam: u8,
    pub traddr: String,
    pub trsvcid: String,
}

impl From<&DiscoveryLogEntry> for LogPageKey {
    fn from(entry: &DiscoveryLogEntry) -> Self {
        Self {
            subnqn: entry.subnqn.clone(),
            trtype: entry.trtype,
            adrfam: entry.adrfam,
            traddr: entry.traddr.clone(),
            trsvcid: entry.trsvcid.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPage {
    pub entry: DiscoveryLogEntry,
    pub freshness: Freshness,
    /// Host OS already has a controller for this entry
    pub os_connected: bool,
}

/// Outcome of one reconciliation
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Reconciled {
    pub added: Vec<LogPageKey>,
    pub removed: Vec<LogPageKey>,
    pub kept: usize,
}

impl Reconciled {
    pub fn changed(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }
}

#[derive(Debug, Default, Clone)]
pub struct LogPageCache {
    pages: BTreeMap<LogPageKey, LogPage>,
}

impl LogPageCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn get(&self, key: &LogPageKey) -> Option<&LogPage> {
        self.pages.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&LogPageKey, &LogPage)> {
        self.pages.iter()
    }

    pub fn entries(&self) -> impl Iterator<Item = &DiscoveryLogEntry> {
        self.pages.values().map(|page| &page.entry)
    }

    /// Mark every entry DELETED ahead of a fetch
    pub fn invalidate(&mut self) {
        for page in self.pages.values_mut() {
            page.freshness = Freshness::Deleted;
        }
    }

    /// Match one fetched record against the cache
    pub fn save(&mut self, entry: DiscoveryLogEntry) {
        let key = LogPageKey::from(&entry);
        match self.pages.get_mut(&key) {
            Some(page) => {
                page.entry = entry;
                if page.freshness == Freshness::Deleted {
                    page.freshness = Freshness::Valid;
                }
            }
            None => {
                self.pages.insert(
                    key,
                    LogPage {
                        entry,
                        freshness: Freshness::New,
                        os_connected: false,
                    },
                );
            }
        }
    }

    /// Drop every entry still DELETED
    pub fn prune(&mut self) -> Vec<LogPageKey> {
        let removed: Vec<LogPageKey> = self
            .pages
            .iter()
            .filter(|(_, page)| page.freshness == Freshness::Deleted)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &removed {
            self.pages.remove(key);
            info!("Log page removed: {} at {}:{}", key.subnqn, key.traddr, key.trsvcid);
        }
        removed
    }

    /// Replace the cache contents with a freshly fetched log
    pub fn reconcile(&mut self, fetched: Vec<DiscoveryLogEntry>) -> Reconciled {
        self.invalidate();
        for entry in fetched {
            self.save(entry);
        }

        let added = self
            .pages
            .iter()
            .filter(|(_, page)| page.freshness == Freshness::New)
            .map(|(key, _)| key.clone())
            .collect();
        let removed = self.prune();

        Reconciled {
            added,
            removed,
            kept: self
                .pages
                .values()
                .filter(|page| page.freshness == Freshness::Valid)
                .count(),
        }
    }

    /// Settle NEW entries to VALID once the caller has acted on them
    pub fn settle(&mut self) {
        for page in self.pages.values_mut() {
            if page.freshness == Freshness::New {
                page.freshness = Freshness::Valid;
            }
        }
    }

    /// Update OS-connected flags from a predicate over entries
    pub fn mark_connected<F>(&mut self, mut connected: F)
    where
        F: FnMut(&DiscoveryLogEntry) -> bool,
    {
        for page in self.pages.values_mut() {
            page.os_connected = connected(&page.entry);
        }
    }

    pub fn set_connected(&mut self, key: &LogPageKey, connected: bool) {
        if let Some(page) = self.pages.get_mut(key) {
            page.os_connected = connected;
        }
    }

    /// First NVM subsystem entry the host has no controller for
    pub fn next_unconnected(&self) -> Option<(&LogPageKey, &LogPage)> {
        self.pages.iter().find(|(_, page)| {
            !page.os_connected
                && page.freshness != Freshness::Deleted
                && page.entry.subtype == SubsystemType::Nvme
        })
    }

    /// Subsystem view: entries grouped by NQN; empty subsystems do not exist
    pub fn subsystems(&self) -> BTreeMap<&str, Vec<&LogPage>> {
        let mut view: BTreeMap<&str, Vec<&LogPage>> = BTreeMap::new();
        for (key, page) in &self.pages {
            view.entry(key.subnqn.as_str()).or_default().push(page);
        }
        view
    }
}
