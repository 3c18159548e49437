//! Client side of a discovery controller
//!
//! [`DiscoveryClient`] keeps one admin queue to a discovery controller
//! alive: it fetches and reconciles the discovery log, arms async event
//! notifications, sends keep-alives when idle and reconnects on a fixed
//! cadence after any failure. Newly reported subsystems are handed to a
//! [`HostConnector`], at most one per tick.

use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;

use fabric_transport::{FabricAddr, ShutdownToken, Transport};

use crate::client::{ControllerClient, DEFAULT_KATO_MS};
use crate::logpage::{LogPageCache, Reconciled};
use crate::nvme::discovery::{decode_log, log_size};
use crate::nvme::{
    DiscoveryLogEntry, DiscoveryLogHeader, AEN_DISC_LOG_CHANGE, DISCOVERY_NQN, FEAT_ASYNC_EVENT,
    LOG_COUNT_LEN, LOG_ENTRY_SIZE, LOG_HEADER_SIZE,
};
use crate::{DemError, Result};

pub mod connector;
pub mod refresh;

pub use connector::{HostConnector, OsController, SysfsConnector};
pub use refresh::TargetRefresher;

/// Tick period (ms)
pub const DELAY_MS: u64 = 480;

/// Idle ticks between keep-alives
pub const KEEP_ALIVE_COUNTER: u32 = 4;

/// Ticks to wait before reconnecting: one minute
pub const CONNECT_RETRY_COUNTER: u32 = (60_000 / DELAY_MS) as u32;

/// Read the discovery log: counters first, then the whole log
///
/// Fails with `InconsistentLog` when the log changed between the two reads.
pub fn fetch_log_pages(
    client: &mut ControllerClient,
    shutdown: &ShutdownToken,
) -> Result<Vec<DiscoveryLogEntry>> {
    let counts = DiscoveryLogHeader::decode(&client.get_log_page(LOG_COUNT_LEN, shutdown)?)?;
    if counts.numrec == 0 {
        return Ok(Vec::new());
    }

    let len = log_size(counts.numrec)?;
    let raw = client.get_log_page(len, shutdown)?;

    let full = DiscoveryLogHeader::decode(&raw)?;
    if full.numrec != counts.numrec || full.genctr != counts.genctr {
        return Err(DemError::InconsistentLog {
            numrec: counts.numrec,
            new_numrec: full.numrec,
            genctr: counts.genctr,
            new_genctr: full.genctr,
        });
    }

    let (_, entries) = decode_log(&raw)?;
    debug!("Fetched {} log entries, genctr {}", entries.len(), full.genctr);
    Ok(entries)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    KeepAlive,
    Fetching,
}

pub struct DiscoveryClient {
    transport: Arc<dyn Transport>,
    addr: FabricAddr,
    host_nqn: String,
    kato: u32,
    tick: Duration,
    client: Option<ControllerClient>,
    state: ClientState,
    cache: LogPageCache,
    keep_alive_countdown: u32,
    connect_countdown: u32,
}

impl DiscoveryClient {
    /// # Arguments
    /// * `transport` - Fabric the discovery controller is reached on
    /// * `addr` - Discovery controller address
    /// * `host_nqn` - Identity used to connect and to connect subsystems
    pub fn new(transport: Arc<dyn Transport>, addr: FabricAddr, host_nqn: &str) -> Self {
        Self {
            transport,
            addr,
            host_nqn: host_nqn.to_string(),
            kato: DEFAULT_KATO_MS,
            tick: Duration::from_millis(DELAY_MS),
            client: None,
            state: ClientState::Disconnected,
            cache: LogPageCache::new(),
            keep_alive_countdown: KEEP_ALIVE_COUNTER,
            connect_countdown: 0,
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    pub fn cache(&self) -> &LogPageCache {
        &self.cache
    }

    pub fn connect(&mut self, shutdown: &ShutdownToken) -> Result<()> {
        self.state = ClientState::Connecting;

        match ControllerClient::connect(
            self.transport.as_ref(),
            &self.addr,
            DISCOVERY_NQN,
            &self.host_nqn,
            self.kato,
            shutdown,
        ) {
            Ok(client) => {
                self.client = Some(client);
                self.state = ClientState::Connected;
                self.keep_alive_countdown = KEEP_ALIVE_COUNTER;
                Ok(())
            }
            Err(e) => {
                self.state = ClientState::Disconnected;
                Err(e)
            }
        }
    }

    fn client(&mut self) -> Result<&mut ControllerClient> {
        self.client.as_mut().ok_or(DemError::NotConnected)
    }

    /// Fetch and reconcile; an inconsistent log leaves the cache untouched
    pub fn fetch(&mut self, shutdown: &ShutdownToken) -> Result<Reconciled> {
        self.state = ClientState::Fetching;
        let fetched = fetch_log_pages(self.client()?, shutdown);
        self.state = ClientState::Connected;

        let result = self.cache.reconcile(fetched?);
        for key in &result.added {
            info!("New log page: {} at {}:{}", key.subnqn, key.traddr, key.trsvcid);
        }
        Ok(result)
    }

    /// Fetch, refresh OS connection flags, then (re)arm async events
    pub fn process_updates(
        &mut self,
        connector: &dyn HostConnector,
        shutdown: &ShutdownToken,
    ) -> Result<Reconciled> {
        let result = self.fetch(shutdown)?;

        match connector.connected() {
            Ok(controllers) => self
                .cache
                .mark_connected(|entry| controllers.iter().any(|c| c.matches(entry))),
            Err(e) => warn!("Listing OS controllers failed: {}", e),
        }
        self.cache.settle();

        self.enable_async_events(shutdown)?;
        Ok(result)
    }

    fn enable_async_events(&mut self, shutdown: &ShutdownToken) -> Result<()> {
        let client = self.client()?;

        let supported = client.get_features(FEAT_ASYNC_EVENT, shutdown)? as u32;
        if supported & AEN_DISC_LOG_CHANGE == 0 {
            debug!("{} does not report discovery log changes", client.addr());
            return Ok(());
        }

        client.set_features(FEAT_ASYNC_EVENT, AEN_DISC_LOG_CHANGE, shutdown)?;
        client.arm_async_event(shutdown)
    }

    /// Drop the association and start the reconnect countdown
    pub fn disconnect(&mut self, graceful: bool) {
        if let Some(mut client) = self.client.take() {
            client.disconnect(graceful);
            info!("Disconnected from discovery controller {}", self.addr);
        }
        self.state = ClientState::Disconnected;
        self.connect_countdown = CONNECT_RETRY_COUNTER;
    }

    fn fail(&mut self, what: &str, e: &DemError) {
        warn!("{} on {} failed: {}", what, self.addr, e);
        self.disconnect(false);
    }

    /// Advance the state machine by one tick; true when the log changed
    pub fn tick(&mut self, connector: &dyn HostConnector, shutdown: &ShutdownToken) -> bool {
        let changed = if self.client.is_none() {
            self.tick_disconnected(connector, shutdown)
        } else {
            self.tick_connected(connector, shutdown)
        };

        self.connect_next(connector);
        changed
    }

    fn tick_disconnected(&mut self, connector: &dyn HostConnector, shutdown: &ShutdownToken) -> bool {
        if self.connect_countdown > 0 {
            self.connect_countdown -= 1;
            return false;
        }

        if let Err(e) = self.connect(shutdown) {
            warn!("Connect to {} failed: {}", self.addr, e);
            self.connect_countdown = CONNECT_RETRY_COUNTER;
            return false;
        }
        info!("Connected to discovery controller {}", self.addr);

        match self.process_updates(connector, shutdown) {
            Ok(result) => result.changed(),
            Err(e) => {
                self.fail("Log page fetch", &e);
                false
            }
        }
    }

    fn tick_connected(&mut self, connector: &dyn HostConnector, shutdown: &ShutdownToken) -> bool {
        let events = self.client().and_then(|client| {
            client.poll_events()?;
            Ok(client.take_aen())
        });

        match events {
            Ok(true) => {
                self.keep_alive_countdown = KEEP_ALIVE_COUNTER;
                return match self.process_updates(connector, shutdown) {
                    Ok(result) => result.changed(),
                    Err(e) => {
                        self.fail("Log page refresh", &e);
                        false
                    }
                };
            }
            Ok(false) => {}
            Err(e) => {
                self.fail("Polling", &e);
                return false;
            }
        }

        self.keep_alive_countdown = self.keep_alive_countdown.saturating_sub(1);
        if self.keep_alive_countdown == 0 {
            self.state = ClientState::KeepAlive;
            let sent = self.client().and_then(|client| client.keep_alive(shutdown));
            self.state = ClientState::Connected;

            if let Err(e) = sent {
                self.fail("Keep alive", &e);
                return false;
            }
            self.keep_alive_countdown = KEEP_ALIVE_COUNTER;
        }
        false
    }

    /// Connect the first subsystem the host does not have yet
    fn connect_next(&mut self, connector: &dyn HostConnector) {
        let Some((key, page)) = self.cache.next_unconnected() else {
            return;
        };
        let key = key.clone();

        match connector.connect(&page.entry, &self.host_nqn) {
            Ok(()) => info!("Connected subsystem {} at {}:{}", key.subnqn, key.traddr, key.trsvcid),
            Err(e) => warn!("Connecting subsystem {} failed: {}", key.subnqn, e),
        }
        // A failed attempt is retried once the next fetch refreshes the flags
        self.cache.set_connected(&key, true);
    }

    /// Tick until shutdown, then disconnect
    pub fn run(&mut self, connector: &dyn HostConnector, shutdown: &ShutdownToken) {
        info!("Discovery client for {} started", self.addr);

        while !shutdown.is_triggered() {
            self.tick(connector, shutdown);
            std::thread::sleep(self.tick);
        }

        self.disconnect(true);
        info!("Discovery client for {} stopped", self.addr);
    }
}
