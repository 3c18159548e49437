//! Daemon-side refresh of configured targets
//!
//! Each configured target gets a discovery queue that is kept alive with a
//! keep-alive every minute and re-fetched every `refresh` minutes, or as
//! soon as the target reports a log change. Fetched logs land in the
//! shared [`TargetRegistry`], which is what hosts are served from.

use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;

use fabric_transport::{FabricAddr, ShutdownToken, Transport};

use super::{fetch_log_pages, CONNECT_RETRY_COUNTER, DELAY_MS};
use crate::client::{ControllerClient, DEFAULT_KATO_MS};
use crate::nvme::{AEN_DISC_LOG_CHANGE, DISCOVERY_NQN, FEAT_ASYNC_EVENT};
use crate::registry::TargetRegistry;
use crate::{DemError, Result};

/// Idle ticks between keep-alives: one minute
pub const KATO_TICKS: u32 = (60_000 / DELAY_MS) as u32;

struct Shared {
    registry: TargetRegistry,
    transport: Arc<dyn Transport>,
    host_nqn: String,
}

struct TargetLink {
    alias: String,
    addr: FabricAddr,
    refresh_ticks: u32,
    client: Option<ControllerClient>,
    kato_countdown: u32,
    refresh_countdown: u32,
    retry_countdown: u32,
}

impl TargetLink {
    fn disconnect(&mut self, shared: &Shared, graceful: bool) {
        if let Some(mut client) = self.client.take() {
            client.disconnect(graceful);
            info!("Target {} disconnected", self.alias);
        }
        shared.registry.set_connected(&self.alias, false);
        self.retry_countdown = CONNECT_RETRY_COUNTER;
    }

    fn fail(&mut self, shared: &Shared, what: &str, e: &DemError) {
        warn!("{} on target {} failed: {}", what, self.alias, e);
        self.disconnect(shared, false);
    }

    fn connect(&mut self, shared: &Shared, shutdown: &ShutdownToken) -> Result<()> {
        let mut client = ControllerClient::connect(
            shared.transport.as_ref(),
            &self.addr,
            DISCOVERY_NQN,
            &shared.host_nqn,
            DEFAULT_KATO_MS,
            shutdown,
        )?;

        // Targets that cannot report changes are still refreshed on a timer
        let supported = client.get_features(FEAT_ASYNC_EVENT, shutdown)? as u32;
        if supported & AEN_DISC_LOG_CHANGE != 0 {
            client.set_features(FEAT_ASYNC_EVENT, AEN_DISC_LOG_CHANGE, shutdown)?;
            client.arm_async_event(shutdown)?;
        }

        self.client = Some(client);
        shared.registry.set_connected(&self.alias, true);
        info!("Target {} connected at {}", self.alias, self.addr);
        Ok(())
    }

    fn refresh(&mut self, shared: &Shared, shutdown: &ShutdownToken) -> Result<()> {
        let client = self.client.as_mut().ok_or(DemError::NotConnected)?;
        let entries = fetch_log_pages(client, shutdown)?;
        if client.is_connected() && !client.aer_outstanding() {
            client.arm_async_event(shutdown)?;
        }

        shared.registry.update_log_pages(&self.alias, entries);
        self.refresh_countdown = self.refresh_ticks;
        Ok(())
    }

    fn tick(&mut self, shared: &Shared, shutdown: &ShutdownToken) {
        let Some(client) = self.client.as_mut() else {
            if self.retry_countdown > 0 {
                self.retry_countdown -= 1;
                return;
            }
            if let Err(e) = self.connect(shared, shutdown) {
                warn!("Connect to target {} failed: {}", self.alias, e);
                self.retry_countdown = CONNECT_RETRY_COUNTER;
                return;
            }
            self.kato_countdown = KATO_TICKS;
            if let Err(e) = self.refresh(shared, shutdown) {
                self.fail(shared, "Log page fetch", &e);
            }
            return;
        };

        let changed = match client.poll_events() {
            Ok(()) => client.take_aen(),
            Err(e) => {
                self.fail(shared, "Polling", &e);
                return;
            }
        };

        self.refresh_countdown = self.refresh_countdown.saturating_sub(1);
        if changed || self.refresh_countdown == 0 {
            match self.refresh(shared, shutdown) {
                Ok(()) => self.kato_countdown = KATO_TICKS,
                Err(e @ DemError::InconsistentLog { .. }) => {
                    warn!("Target {}: {}, retrying", self.alias, e);
                    self.refresh_countdown = 1;
                }
                Err(e) if e.is_fatal() => {
                    self.fail(shared, "Log page refresh", &e);
                    return;
                }
                Err(e) => warn!("Log page refresh on target {} failed: {}", self.alias, e),
            }
        }

        self.kato_countdown = self.kato_countdown.saturating_sub(1);
        if self.kato_countdown == 0 {
            let sent = self
                .client
                .as_mut()
                .ok_or(DemError::NotConnected)
                .and_then(|client| client.keep_alive(shutdown));
            match sent {
                Ok(()) => self.kato_countdown = KATO_TICKS,
                Err(e) => self.fail(shared, "Keep alive", &e),
            }
        }
    }
}

/// Keeps every configured target's discovery queue alive
pub struct TargetRefresher {
    shared: Shared,
    targets: Vec<TargetLink>,
    tick: Duration,
}

impl TargetRefresher {
    pub fn new(registry: TargetRegistry, transport: Arc<dyn Transport>, host_nqn: &str) -> Self {
        Self {
            shared: Shared {
                registry,
                transport,
                host_nqn: host_nqn.to_string(),
            },
            targets: Vec::new(),
            tick: Duration::from_millis(DELAY_MS),
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Track a target already present in the registry
    ///
    /// # Arguments
    /// * `alias` - Registry key of the target
    /// * `addr` - Discovery controller address of the target
    /// * `refresh_minutes` - Periodic re-fetch interval (0 means every tick)
    pub fn add_target(&mut self, alias: &str, addr: FabricAddr, refresh_minutes: u32) {
        let refresh_ticks = (refresh_minutes as u64 * 60_000 / DELAY_MS).max(1) as u32;
        self.targets.push(TargetLink {
            alias: alias.to_string(),
            addr,
            refresh_ticks,
            client: None,
            kato_countdown: KATO_TICKS,
            refresh_countdown: refresh_ticks,
            retry_countdown: 0,
        });
    }

    pub fn connected(&self) -> usize {
        self.targets.iter().filter(|t| t.client.is_some()).count()
    }

    /// Advance every target by one tick
    pub fn tick(&mut self, shutdown: &ShutdownToken) {
        for target in &mut self.targets {
            if shutdown.is_triggered() {
                break;
            }
            target.tick(&self.shared, shutdown);
        }
    }

    /// Tick until shutdown, then drop every target connection
    pub fn run(mut self, shutdown: &ShutdownToken) {
        info!("Refreshing {} targets", self.targets.len());

        while !shutdown.is_triggered() {
            self.tick(shutdown);
            std::thread::sleep(self.tick);
        }

        for target in &mut self.targets {
            target.disconnect(&self.shared, true);
        }
        info!("Target refresh stopped");
    }
}
