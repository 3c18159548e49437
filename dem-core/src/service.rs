//! Accept and service loops of one listening interface
//!
//! The accept thread blocks on the listener and hands each new connection
//! to the service thread through a [`HostQueue`]. The service thread owns
//! every live connection, polls each of them once per pass and drops the
//! ones that stay silent for too many passes.

use log::{debug, error, info, warn};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use fabric_transport::{FabricAddr, Listener, ShutdownToken, Transport, TransportError};

use crate::connection::{is_disconnect_notice, Connection, NVMF_DQ_DEPTH};
use crate::dispatch::{DispatchMode, Dispatcher, Outcome};
use crate::host_queue::{HostQueue, HOST_QUEUE_SLOTS};
use crate::nvme::{CmRequest, Command};
use crate::{DemError, Result};

/// Service pass period (ms)
pub const DELAY_TIMEOUT_MS: u64 = 100;

/// Wait before retrying a full host queue (µs)
const QUEUE_FULL_BACKOFF_US: u64 = 100;

pub type ConnectionQueue = HostQueue<Connection>;

#[derive(Debug, Clone, Copy)]
pub struct ServiceOptions {
    /// Minimum time between two service passes
    pub delay: Duration,
    /// Silent passes before a connection without a keep-alive timeout
    /// is dropped
    pub retry_count: u32,
}

impl ServiceOptions {
    pub fn for_mode(mode: DispatchMode) -> Self {
        Self {
            delay: Duration::from_millis(DELAY_TIMEOUT_MS),
            retry_count: mode.retry_count(),
        }
    }
}

/// Accept connections until shutdown, queueing each one for service
///
/// # Arguments
/// * `listener` - Bound passive endpoint
/// * `queue` - Hand-off to the service loop
/// * `shutdown` - Stops the loop; a connection waiting for queue space is dropped
pub fn accept_loop(listener: &mut dyn Listener, queue: &ConnectionQueue, shutdown: &ShutdownToken) {
    let addr = listener.local_addr().clone();
    info!("Accepting hosts on {}", addr);

    loop {
        let request = match listener.wait_for_connection(shutdown) {
            Ok(Some(request)) => request,
            Ok(None) => continue,
            Err(TransportError::Shutdown) => break,
            Err(e) if e.is_terminal() => {
                error!("Listener on {} failed: {}", addr, e);
                break;
            }
            Err(e) => {
                warn!("Waiting for connection on {}: {}", addr, e);
                continue;
            }
        };

        let peer = request.peer();
        match CmRequest::decode(request.private_data()) {
            Ok(cm) if cm.qid != 0 => {
                warn!("Rejecting I/O queue {} from {}", cm.qid, peer);
                if let Err(e) = request.reject(&[]) {
                    warn!("Reject to {} failed: {}", peer, e);
                }
                continue;
            }
            Ok(cm) => debug!(
                "Admin queue request from {}: hrqsize {} hsqsize {}",
                peer, cm.hrqsize, cm.hsqsize
            ),
            Err(e) => debug!("No connect request data from {}: {}", peer, e),
        }

        let conn = match request
            .accept(NVMF_DQ_DEPTH, shutdown)
            .map_err(DemError::from)
            .and_then(Connection::new)
        {
            Ok(conn) => conn,
            Err(DemError::Transport(TransportError::Shutdown)) => break,
            Err(e) => {
                error!("Accepting {} failed: {}", peer, e);
                continue;
            }
        };
        info!("Accepted connection from {}", peer);

        let mut pending = conn;
        while let Err(back) = queue.add(pending) {
            if shutdown.is_triggered() {
                info!("Dropping connection from {} on shutdown", peer);
                break;
            }
            pending = back;
            thread::sleep(Duration::from_micros(QUEUE_FULL_BACKOFF_US));
        }
    }

    info!("Accept loop on {} stopped", addr);
}

struct HostEntry {
    conn: Connection,
    countdown: u32,
    last_activity: Instant,
}

pub struct ServiceLoop {
    dispatcher: Arc<Dispatcher>,
    queue: Arc<ConnectionQueue>,
    options: ServiceOptions,
    working: Vec<HostEntry>,
}

impl ServiceLoop {
    pub fn new(dispatcher: Arc<Dispatcher>, queue: Arc<ConnectionQueue>, options: ServiceOptions) -> Self {
        Self {
            dispatcher,
            queue,
            options,
            working: Vec::new(),
        }
    }

    /// Connections currently being serviced
    pub fn active(&self) -> usize {
        self.working.len()
    }

    /// One pass: adopt queued connections, then poll each one
    pub fn run_once(&mut self, shutdown: &ShutdownToken) {
        while let Some(conn) = self.queue.take() {
            let countdown = self.idle_passes(&conn);
            self.working.push(HostEntry {
                conn,
                countdown,
                last_activity: Instant::now(),
            });
        }

        let mut working = std::mem::take(&mut self.working);
        working.retain_mut(|host| self.service_host(host, shutdown));
        self.working = working;
    }

    /// Silent passes allowed before `conn` is dropped
    ///
    /// A host that negotiated a keep-alive timeout gets that long, rounded
    /// up to whole passes.
    fn idle_passes(&self, conn: &Connection) -> u32 {
        let kato = conn.ctrl.kato;
        if kato == 0 {
            return self.options.retry_count;
        }

        let delay_ms = self.options.delay.as_millis().max(1);
        let passes = u128::from(kato).div_ceil(delay_ms);
        u32::try_from(passes).unwrap_or(u32::MAX).max(1)
    }

    /// Poll one connection until it has no more work; false drops it
    fn service_host(&self, host: &mut HostEntry, shutdown: &ShutdownToken) -> bool {
        let mut received = false;

        loop {
            let msg = match host.conn.poll() {
                Ok(Some(msg)) => msg,
                Ok(None) => break,
                Err(e) if e.is_fatal() => {
                    info!("Host {} gone: {}", host.conn.peer(), e);
                    host.conn.disconnect(false);
                    return false;
                }
                Err(e) => {
                    warn!("Polling {}: {}", host.conn.peer(), e);
                    break;
                }
            };
            received = true;

            let closing = is_disconnect_notice(&msg.data);
            match Command::decode(&msg.data) {
                Ok(cmd) => {
                    if let Outcome::Complete(cpl) = self.dispatcher.dispatch(&mut host.conn, &cmd, shutdown) {
                        if let Err(e) = host.conn.send_completion(&cpl, shutdown) {
                            if closing || e.is_fatal() {
                                debug!("Completion to {} not sent: {}", host.conn.peer(), e);
                                host.conn.disconnect(false);
                                return false;
                            }
                            warn!("Completion to {} not sent: {}", host.conn.peer(), e);
                        }
                    }
                }
                Err(e) => warn!("Malformed command from {}: {}", host.conn.peer(), e),
            }

            if closing {
                info!("Host {} disconnected", host.conn.peer());
                host.conn.disconnect(false);
                return false;
            }
            if let Err(e) = host.conn.repost(msg.entry) {
                error!("Repost on {} failed: {}", host.conn.peer(), e);
                host.conn.disconnect(false);
                return false;
            }

            host.countdown = self.idle_passes(&host.conn);
            host.last_activity = Instant::now();
        }

        if let Some(event) = self.dispatcher.pending_event(&mut host.conn) {
            if let Err(e) = host.conn.send_completion(&event, shutdown) {
                warn!("Async event to {} not sent: {}", host.conn.peer(), e);
                if e.is_fatal() {
                    host.conn.disconnect(false);
                    return false;
                }
            }
        }

        if !received {
            host.countdown = host.countdown.saturating_sub(1);
            if host.countdown == 0 {
                info!(
                    "Keep-alive timeout on {} after {:?} idle",
                    host.conn.peer(),
                    host.last_activity.elapsed()
                );
                host.conn.disconnect(!shutdown.is_triggered());
                return false;
            }
        }
        true
    }

    /// Service until shutdown, then drop every connection
    pub fn run(mut self, shutdown: &ShutdownToken) {
        info!("Service loop started ({:?})", self.dispatcher.mode());

        while !shutdown.is_triggered() {
            let started = Instant::now();
            self.run_once(shutdown);
            if let Some(rest) = self.options.delay.checked_sub(started.elapsed()) {
                thread::sleep(rest);
            }
        }

        self.stop();
    }

    fn stop(&mut self) {
        let mut closed = 0;
        for mut host in self.working.drain(..) {
            host.conn.disconnect(false);
            closed += 1;
        }
        for mut conn in self.queue.drain() {
            conn.disconnect(false);
            closed += 1;
        }
        info!("Service loop stopped, {} connections closed", closed);
    }
}

/// One listening address with its accept and service threads
pub struct Interface {
    addr: FabricAddr,
    transport: Arc<dyn Transport>,
    dispatcher: Arc<Dispatcher>,
    options: ServiceOptions,
}

impl Interface {
    pub fn new(addr: FabricAddr, transport: Arc<dyn Transport>, dispatcher: Dispatcher) -> Self {
        let options = ServiceOptions::for_mode(dispatcher.mode());
        Self {
            addr,
            transport,
            dispatcher: Arc::new(dispatcher),
            options,
        }
    }

    pub fn with_options(mut self, options: ServiceOptions) -> Self {
        self.options = options;
        self
    }

    /// Bind the listener and spawn both threads
    pub fn start(self, shutdown: &ShutdownToken) -> Result<InterfaceHandle> {
        let mut listener = self.transport.init_listener(&self.addr)?;
        let queue = Arc::new(ConnectionQueue::new(HOST_QUEUE_SLOTS));
        let tag = format!("{}:{}", self.addr.traddr, self.addr.trsvcid);

        let accept_queue = Arc::clone(&queue);
        let accept_token = shutdown.clone();
        let accept = thread::Builder::new()
            .name(format!("dem-accept-{}", tag))
            .spawn(move || accept_loop(listener.as_mut(), &accept_queue, &accept_token))?;

        let service_loop = ServiceLoop::new(self.dispatcher, queue, self.options);
        let service_token = shutdown.clone();
        let service = thread::Builder::new()
            .name(format!("dem-service-{}", tag))
            .spawn(move || service_loop.run(&service_token))?;

        Ok(InterfaceHandle {
            addr: self.addr,
            accept,
            service,
        })
    }
}

pub struct InterfaceHandle {
    pub addr: FabricAddr,
    accept: JoinHandle<()>,
    service: JoinHandle<()>,
}

impl InterfaceHandle {
    /// Wait for both threads; call after triggering shutdown
    pub fn join(self) {
        if self.accept.join().is_err() {
            error!("Accept thread for {} panicked", self.addr);
        }
        if self.service.join().is_err() {
            error!("Service thread for {} panicked", self.addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ControllerClient;
    use crate::nvme::{CSTS_READY, DISCOVERY_NQN, FEAT_KATO, REG_CSTS};
    use crate::registry::{SubsystemAccess, TargetRegistry};
    use crate::testutil::{connected_pair, nvme_entry};
    use fabric_transport::LoopbackFabric;

    const HOST_X: &str = "nqn.2014-08.org.nvmexpress:NVMf:uuid:host-x";

    fn registry() -> TargetRegistry {
        let registry = TargetRegistry::new();
        registry.add_target("t1", FabricAddr::loopback("10.0.0.5", "4420"));
        registry.set_subsystem(
            "t1",
            "nqn.open",
            SubsystemAccess {
                allow_any: true,
                ..Default::default()
            },
        );
        registry.update_log_pages("t1", vec![nvme_entry("nqn.open", "10.0.0.5")]);
        registry
    }

    fn fast(retry_count: u32) -> ServiceOptions {
        ServiceOptions {
            delay: Duration::from_millis(5),
            retry_count,
        }
    }

    fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_run_once_dispatches_and_counts_down() {
        let fabric = LoopbackFabric::new();
        let queue = Arc::new(ConnectionQueue::default());
        let mut service = ServiceLoop::new(
            Arc::new(Dispatcher::discovery(registry())),
            queue.clone(),
            fast(2),
        );
        let shutdown = ShutdownToken::new();

        let (mut host, ctrl) = connected_pair(&fabric, "7001");
        assert!(queue.add(ctrl).is_ok());

        host.send_command(&Command::keep_alive(42), &shutdown).unwrap();
        service.run_once(&shutdown);
        assert_eq!(service.active(), 1);

        let msg = host.poll().unwrap().unwrap();
        let cpl = crate::nvme::Completion::decode(&msg.data).unwrap();
        assert_eq!(cpl.command_id, 42);
        assert!(cpl.status_code().is_success());

        service.run_once(&shutdown);
        assert_eq!(service.active(), 1);
        service.run_once(&shutdown);
        assert_eq!(service.active(), 0);
    }

    #[test]
    fn test_short_kato_drops_host_early() {
        let fabric = LoopbackFabric::new();
        let queue = Arc::new(ConnectionQueue::default());
        let mut service = ServiceLoop::new(
            Arc::new(Dispatcher::discovery(registry())),
            queue.clone(),
            fast(1000),
        );
        let shutdown = ShutdownToken::new();

        let (mut host, ctrl) = connected_pair(&fabric, "7005");
        assert!(queue.add(ctrl).is_ok());

        // 10 ms at 5 ms per pass
        host.send_command(&Command::set_features(7, FEAT_KATO, 10), &shutdown)
            .unwrap();
        service.run_once(&shutdown);
        let msg = host.poll().unwrap().unwrap();
        assert!(crate::nvme::Completion::decode(&msg.data)
            .unwrap()
            .status_code()
            .is_success());
        host.repost(msg.entry).unwrap();

        service.run_once(&shutdown);
        assert_eq!(service.active(), 1);
        service.run_once(&shutdown);
        assert_eq!(service.active(), 0);
    }

    #[test]
    fn test_end_to_end_discovery() {
        let fabric = LoopbackFabric::new();
        let shutdown = ShutdownToken::new();
        let addr = FabricAddr::loopback("127.0.0.1", "7002");

        let handle = Interface::new(
            addr.clone(),
            Arc::new(fabric.clone()),
            Dispatcher::discovery(registry()),
        )
        .with_options(fast(200))
        .start(&shutdown)
        .unwrap();

        let mut client =
            ControllerClient::connect(&fabric, &addr, DISCOVERY_NQN, HOST_X, 120_000, &shutdown)
                .unwrap();
        assert_eq!(client.property_get(REG_CSTS, &shutdown).unwrap(), CSTS_READY as u64);
        assert_eq!(client.identify(&shutdown).unwrap().subnqn, DISCOVERY_NQN);
        client.keep_alive(&shutdown).unwrap();

        let raw = client.get_log_page(16, &shutdown).unwrap();
        let header = crate::nvme::DiscoveryLogHeader::decode(&raw).unwrap();
        assert_eq!(header.numrec, 1);

        client.disconnect(true);
        drop(client);

        shutdown.trigger();
        handle.join();
        assert_eq!(fabric.stats().live(), 0);
    }

    #[test]
    fn test_keep_alive_timeout_teardown() {
        let fabric = LoopbackFabric::new();
        let shutdown = ShutdownToken::new();
        let addr = FabricAddr::loopback("127.0.0.1", "7003");

        let handle = Interface::new(
            addr.clone(),
            Arc::new(fabric.clone()),
            Dispatcher::discovery(registry()),
        )
        .with_options(fast(3))
        .start(&shutdown)
        .unwrap();

        // No keep-alive timeout, so the pass count applies
        let mut client =
            ControllerClient::connect(&fabric, &addr, DISCOVERY_NQN, HOST_X, 0, &shutdown).unwrap();

        // Stay silent until the controller gives up on us
        wait_until("controller teardown", || match client.poll_events() {
            Ok(()) => false,
            Err(e) => e.is_fatal(),
        });
        assert!(!client.is_connected());
        drop(client);

        wait_until("registrations released", || fabric.stats().live() == 0);

        shutdown.trigger();
        handle.join();
    }

    #[test]
    fn test_io_queue_rejected() {
        let fabric = LoopbackFabric::new();
        let shutdown = ShutdownToken::new();
        let addr = FabricAddr::loopback("127.0.0.1", "7004");

        let handle = Interface::new(
            addr.clone(),
            Arc::new(fabric.clone()),
            Dispatcher::discovery(registry()),
        )
        .with_options(fast(200))
        .start(&shutdown)
        .unwrap();

        let io_queue = CmRequest {
            qid: 1,
            ..CmRequest::admin(32)
        };
        let result = fabric.client_connect(&addr, &io_queue.encode(), 1, &shutdown);
        assert!(matches!(result, Err(TransportError::Rejected(_))));

        shutdown.trigger();
        handle.join();
    }
}
