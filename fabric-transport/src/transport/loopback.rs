//! In-process loopback fabric
//!
//! Listeners are keyed by `traddr:trsvcid`. Each association is a pair of
//! crossbeam channels carrying whole messages; RMA resolves the peer's
//! remote key in a fabric-wide registration table and copies with bounds
//! checks, the way an RNIC would validate a keyed SGL.

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use log::{debug, info};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use super::{
    ConnRequest, Endpoint, FabricAddr, Listener, QueueEntryId, Received, Transport, TransportType,
};
use crate::buffer::{MemoryRegion, RegisteredBuffer, RemoteBuffer};
use crate::shutdown::ShutdownToken;
use crate::{
    Result, TransportError, EVENT_TIMEOUT_MS, IDLE_TIMEOUT_MS, LISTEN_BACKLOG, PAGE_SIZE,
    RESOLVE_TIMEOUT_MS,
};

/// Registration counters, for leak checks
#[derive(Debug, Clone, Default)]
pub struct RegistrationStats {
    registered: Arc<AtomicUsize>,
    released: Arc<AtomicUsize>,
}

impl RegistrationStats {
    pub fn registered(&self) -> usize {
        self.registered.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Registrations not yet released
    pub fn live(&self) -> usize {
        self.registered().saturating_sub(self.released())
    }
}

struct RegionEntry {
    addr: usize,
    len: usize,
}

struct Fabric {
    listeners: Mutex<HashMap<String, Sender<PendingConnect>>>,
    regions: Mutex<HashMap<u32, RegionEntry>>,
    next_key: AtomicU32,
    stats: RegistrationStats,
}

impl Fabric {
    fn register(self: &Arc<Self>, addr: *mut u8, len: usize) -> Result<Box<dyn MemoryRegion>> {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        self.regions.lock().insert(
            key,
            RegionEntry {
                addr: addr as usize,
                len,
            },
        );
        self.stats.registered.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(LoopbackRegion {
            key,
            addr,
            len,
            fabric: Arc::clone(self),
        }))
    }

    /// Run `f` on the registered peer memory named by `remote`
    ///
    /// The table lock is held for the duration of `f`, so the region cannot
    /// be deregistered (and its memory freed) mid-copy.
    fn with_remote<F>(&self, remote: RemoteBuffer, f: F) -> Result<()>
    where
        F: FnOnce(*mut u8),
    {
        let violation = || TransportError::RemoteAccess {
            key: remote.key,
            addr: remote.addr,
            len: remote.len,
        };

        let regions = self.regions.lock();
        let entry = regions.get(&remote.key).ok_or_else(violation)?;
        let start = entry.addr as u64;
        let end = start + entry.len as u64;

        match remote.addr.checked_add(remote.len as u64) {
            Some(req_end) if remote.addr >= start && req_end <= end => {
                f(remote.addr as usize as *mut u8);
                Ok(())
            }
            _ => Err(violation()),
        }
    }
}

struct LoopbackRegion {
    key: u32,
    addr: *mut u8,
    len: usize,
    fabric: Arc<Fabric>,
}

// addr is only handed out, never dereferenced through this handle
unsafe impl Send for LoopbackRegion {}

impl MemoryRegion for LoopbackRegion {
    fn lkey(&self) -> u32 {
        self.key
    }

    fn rkey(&self) -> u32 {
        self.key
    }

    fn addr(&self) -> *mut u8 {
        self.addr
    }

    fn length(&self) -> usize {
        self.len
    }
}

impl Drop for LoopbackRegion {
    fn drop(&mut self) {
        self.fabric.regions.lock().remove(&self.key);
        self.fabric.stats.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// One direction pair of an association
struct Link {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
}

fn link_pair() -> (Link, Link) {
    let (a_tx, a_rx) = unbounded();
    let (b_tx, b_rx) = unbounded();
    (Link { tx: a_tx, rx: b_rx }, Link { tx: b_tx, rx: a_rx })
}

enum Reply {
    Accepted,
    Rejected(Vec<u8>),
}

struct PendingConnect {
    private_data: Vec<u8>,
    peer: String,
    link: Link,
    reply: Sender<Reply>,
}

/// In-process fabric; clones share listeners and registrations
#[derive(Clone)]
pub struct LoopbackFabric {
    fabric: Arc<Fabric>,
}

impl Default for LoopbackFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackFabric {
    pub fn new() -> Self {
        // Random key base so keys from unrelated fabrics rarely collide in logs
        let base = (rand::random::<u16>() as u32) << 12 | 1;

        Self {
            fabric: Arc::new(Fabric {
                listeners: Mutex::new(HashMap::new()),
                regions: Mutex::new(HashMap::new()),
                next_key: AtomicU32::new(base),
                stats: RegistrationStats::default(),
            }),
        }
    }

    /// Process-wide fabric used by `create_transport`
    pub fn shared() -> Self {
        static SHARED: OnceLock<LoopbackFabric> = OnceLock::new();
        SHARED.get_or_init(LoopbackFabric::new).clone()
    }

    pub fn stats(&self) -> RegistrationStats {
        self.fabric.stats.clone()
    }
}

fn service_key(addr: &FabricAddr) -> String {
    format!("{}:{}", addr.traddr, addr.trsvcid)
}

impl Transport for LoopbackFabric {
    fn transport_type(&self) -> TransportType {
        TransportType::Loopback
    }

    fn init_listener(&self, addr: &FabricAddr) -> Result<Box<dyn Listener>> {
        let key = service_key(addr);
        let mut listeners = self.fabric.listeners.lock();

        if listeners.contains_key(&key) {
            return Err(TransportError::Address(format!("{} already in use", key)));
        }

        let (tx, rx) = bounded(LISTEN_BACKLOG);
        listeners.insert(key.clone(), tx);

        info!("Loopback listener bound on {}", key);

        Ok(Box::new(LoopbackListener {
            addr: addr.clone(),
            key,
            rx,
            fabric: Arc::clone(&self.fabric),
        }))
    }

    fn client_connect(
        &self,
        dest: &FabricAddr,
        private_data: &[u8],
        depth: usize,
        shutdown: &ShutdownToken,
    ) -> Result<Box<dyn Endpoint>> {
        shutdown.check()?;

        let key = service_key(dest);
        let listener = self
            .fabric
            .listeners
            .lock()
            .get(&key)
            .cloned()
            .ok_or_else(|| TransportError::ConnectionRefused(key.clone()))?;

        let (client, server) = link_pair();
        let (reply_tx, reply_rx) = bounded(1);

        listener
            .try_send(PendingConnect {
                private_data: private_data.to_vec(),
                peer: format!("loopback-host@{}", key),
                link: server,
                reply: reply_tx,
            })
            .map_err(|e| {
                if e.is_full() {
                    TransportError::ResourceExhausted(format!("listener backlog full on {}", key))
                } else {
                    TransportError::ConnectionRefused(key.clone())
                }
            })?;

        let deadline = Instant::now() + Duration::from_millis(RESOLVE_TIMEOUT_MS);
        loop {
            shutdown.check()?;

            match reply_rx.recv_timeout(Duration::from_millis(EVENT_TIMEOUT_MS)) {
                Ok(Reply::Accepted) => break,
                Ok(Reply::Rejected(data)) => return Err(TransportError::Rejected(data)),
                Err(RecvTimeoutError::Timeout) => {
                    if Instant::now() > deadline {
                        return Err(TransportError::Timeout("connection accept"));
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(TransportError::ConnectionRefused(key))
                }
            }
        }

        debug!("Loopback association established to {}", key);

        let endpoint = LoopbackEndpoint::new(Arc::clone(&self.fabric), client, depth, key)?;
        Ok(Box::new(endpoint))
    }
}

struct LoopbackListener {
    addr: FabricAddr,
    key: String,
    rx: Receiver<PendingConnect>,
    fabric: Arc<Fabric>,
}

impl Listener for LoopbackListener {
    fn local_addr(&self) -> &FabricAddr {
        &self.addr
    }

    fn wait_for_connection(
        &mut self,
        shutdown: &ShutdownToken,
    ) -> Result<Option<Box<dyn ConnRequest>>> {
        shutdown.check()?;

        match self
            .rx
            .recv_timeout(Duration::from_millis(IDLE_TIMEOUT_MS))
        {
            Ok(pending) => Ok(Some(Box::new(LoopbackRequest {
                pending,
                fabric: Arc::clone(&self.fabric),
            }))),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::NotConnected),
        }
    }
}

impl Drop for LoopbackListener {
    fn drop(&mut self) {
        self.fabric.listeners.lock().remove(&self.key);
        debug!("Loopback listener on {} closed", self.key);
    }
}

struct LoopbackRequest {
    pending: PendingConnect,
    fabric: Arc<Fabric>,
}

impl ConnRequest for LoopbackRequest {
    fn private_data(&self) -> &[u8] {
        &self.pending.private_data
    }

    fn peer(&self) -> String {
        self.pending.peer.clone()
    }

    fn accept(self: Box<Self>, depth: usize, shutdown: &ShutdownToken) -> Result<Box<dyn Endpoint>> {
        shutdown.check()?;

        let PendingConnect {
            peer, link, reply, ..
        } = self.pending;

        let endpoint = LoopbackEndpoint::new(self.fabric, link, depth, peer)?;

        reply
            .send(Reply::Accepted)
            .map_err(|_| TransportError::PeerReset)?;

        Ok(Box::new(endpoint))
    }

    fn reject(self: Box<Self>, data: &[u8]) -> Result<()> {
        // A host that already gave up is not an error for the listener
        let _ = self.pending.reply.send(Reply::Rejected(data.to_vec()));
        Ok(())
    }
}

struct RecvSlot {
    buf: RegisteredBuffer,
    posted: bool,
}

/// Loopback association endpoint
pub struct LoopbackEndpoint {
    // Declaration order is teardown order: receive ring, then the link.
    recv_ring: Vec<RecvSlot>,
    link: Link,
    fabric: Arc<Fabric>,
    peer: String,
    connected: bool,
}

impl LoopbackEndpoint {
    fn new(fabric: Arc<Fabric>, link: Link, depth: usize, peer: String) -> Result<Self> {
        let depth = depth.max(1);
        let mut recv_ring = Vec::with_capacity(depth);

        for _ in 0..depth {
            let buf = RegisteredBuffer::allocate(PAGE_SIZE, |addr, len| fabric.register(addr, len))?;
            recv_ring.push(RecvSlot { buf, posted: true });
        }

        Ok(Self {
            recv_ring,
            link,
            fabric,
            peer,
            connected: true,
        })
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }
}

impl Endpoint for LoopbackEndpoint {
    fn peer(&self) -> String {
        self.peer.clone()
    }

    fn alloc_key(&self, len: usize) -> Result<RegisteredBuffer> {
        RegisteredBuffer::allocate(len, |addr, len| self.fabric.register(addr, len))
    }

    fn post_msg(&mut self, buf: &RegisteredBuffer, len: usize) -> Result<()> {
        self.ensure_connected()?;

        let payload = buf.as_slice().get(..len).ok_or_else(|| {
            TransportError::ResourceExhausted(format!(
                "send of {} bytes from {} byte buffer",
                len,
                buf.len()
            ))
        })?;

        self.link.tx.send(payload.to_vec()).map_err(|_| {
            self.connected = false;
            TransportError::PeerReset
        })
    }

    fn send_msg(
        &mut self,
        buf: &RegisteredBuffer,
        len: usize,
        shutdown: &ShutdownToken,
    ) -> Result<()> {
        shutdown.check()?;
        // Channel sends complete as soon as they are queued
        self.post_msg(buf, len)
    }

    fn poll_for_msg(&mut self) -> Result<Option<Received>> {
        self.ensure_connected()?;

        let Some(slot) = self.recv_ring.iter().position(|s| s.posted) else {
            return Ok(None);
        };

        match self.link.rx.try_recv() {
            Ok(data) => {
                let recv = &mut self.recv_ring[slot];
                if data.len() > recv.buf.len() {
                    return Err(TransportError::ResourceExhausted(format!(
                        "{} byte message exceeds receive buffer",
                        data.len()
                    )));
                }
                recv.buf.as_mut_slice()[..data.len()].copy_from_slice(&data);
                recv.posted = false;

                Ok(Some(Received {
                    entry: QueueEntryId(slot),
                    data,
                }))
            }
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => {
                self.connected = false;
                Err(TransportError::PeerReset)
            }
        }
    }

    fn repost_recv(&mut self, entry: QueueEntryId) -> Result<()> {
        match self.recv_ring.get_mut(entry.0) {
            Some(slot) if !slot.posted => {
                slot.posted = true;
                Ok(())
            }
            _ => Err(TransportError::InvalidQueueEntry(entry.0)),
        }
    }

    fn rma_read(
        &mut self,
        local: &mut RegisteredBuffer,
        remote: RemoteBuffer,
        shutdown: &ShutdownToken,
    ) -> Result<()> {
        shutdown.check()?;
        self.ensure_connected()?;

        let dst = local.as_mut_slice().get_mut(..remote.len).ok_or_else(|| {
            TransportError::ResourceExhausted("RMA read larger than local buffer".into())
        })?;

        self.fabric.with_remote(remote, |src| {
            // SAFETY: the source range was bounds-checked against a live
            // registration and the owning peer does not touch its buffer
            // while a command naming it is outstanding.
            unsafe { std::ptr::copy(src as *const u8, dst.as_mut_ptr(), dst.len()) };
        })
    }

    fn rma_write(
        &mut self,
        local: &RegisteredBuffer,
        remote: RemoteBuffer,
        shutdown: &ShutdownToken,
    ) -> Result<()> {
        shutdown.check()?;
        self.ensure_connected()?;

        let src = local.as_slice().get(..remote.len).ok_or_else(|| {
            TransportError::ResourceExhausted("RMA write larger than local buffer".into())
        })?;

        self.fabric.with_remote(remote, |dst| {
            // SAFETY: see rma_read
            unsafe { std::ptr::copy(src.as_ptr(), dst, src.len()) };
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect_pair(
        fabric: &LoopbackFabric,
        depth: usize,
    ) -> (Box<dyn Endpoint>, Box<dyn Endpoint>) {
        let addr = FabricAddr::loopback("127.0.0.1", "4420");
        let mut listener = fabric.init_listener(&addr).unwrap();
        let shutdown = ShutdownToken::new();

        let client_fabric = fabric.clone();
        let client = std::thread::spawn(move || {
            client_fabric
                .client_connect(&addr, b"hello", depth, &ShutdownToken::new())
                .unwrap()
        });

        let request = loop {
            if let Some(req) = listener.wait_for_connection(&shutdown).unwrap() {
                break req;
            }
        };
        assert_eq!(request.private_data(), b"hello");
        let server = request.accept(depth, &shutdown).unwrap();

        (client.join().unwrap(), server)
    }

    fn recv_blocking(ep: &mut Box<dyn Endpoint>) -> Received {
        loop {
            if let Some(msg) = ep.poll_for_msg().unwrap() {
                return msg;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_send_and_receive() {
        let fabric = LoopbackFabric::new();
        let (mut client, mut server) = connect_pair(&fabric, 1);
        let shutdown = ShutdownToken::new();

        let mut cmd = client.alloc_key(PAGE_SIZE).unwrap();
        cmd.as_mut_slice()[..4].copy_from_slice(&[1, 2, 3, 4]);
        client.send_msg(&cmd, 4, &shutdown).unwrap();

        let msg = recv_blocking(&mut server);
        assert_eq!(msg.data, vec![1, 2, 3, 4]);
        server.repost_recv(msg.entry).unwrap();
        assert!(matches!(
            server.repost_recv(msg.entry),
            Err(TransportError::InvalidQueueEntry(0))
        ));
    }

    #[test]
    fn test_receive_waits_for_repost() {
        let fabric = LoopbackFabric::new();
        let (mut client, mut server) = connect_pair(&fabric, 1);
        let shutdown = ShutdownToken::new();

        let cmd = client.alloc_key(PAGE_SIZE).unwrap();
        client.send_msg(&cmd, 8, &shutdown).unwrap();
        client.send_msg(&cmd, 8, &shutdown).unwrap();

        let first = recv_blocking(&mut server);
        // Only slot is consumed: the second message stays queued
        assert!(server.poll_for_msg().unwrap().is_none());

        server.repost_recv(first.entry).unwrap();
        assert!(server.poll_for_msg().unwrap().is_some());
    }

    #[test]
    fn test_rma_read_write_with_bounds() {
        let fabric = LoopbackFabric::new();
        let (mut client, mut server) = connect_pair(&fabric, 1);
        let shutdown = ShutdownToken::new();

        let mut host_buf = client.alloc_key(PAGE_SIZE).unwrap();
        host_buf.as_mut_slice()[..5].copy_from_slice(b"nqn.x");
        let remote = host_buf.remote(5).unwrap();

        let mut local = server.alloc_key(PAGE_SIZE).unwrap();
        server.rma_read(&mut local, remote, &shutdown).unwrap();
        assert_eq!(&local.as_slice()[..5], b"nqn.x");

        local.as_mut_slice()[..5].copy_from_slice(b"hello");
        server.rma_write(&local, remote, &shutdown).unwrap();
        assert_eq!(&host_buf.as_slice()[..5], b"hello");

        let past_end = RemoteBuffer {
            addr: remote.addr + PAGE_SIZE as u64 - 2,
            len: 4,
            key: remote.key,
        };
        assert!(matches!(
            server.rma_write(&local, past_end, &shutdown),
            Err(TransportError::RemoteAccess { .. })
        ));

        let bad_key = RemoteBuffer {
            key: remote.key.wrapping_add(1000),
            ..remote
        };
        assert!(server.rma_read(&mut local, bad_key, &shutdown).is_err());
    }

    #[test]
    fn test_peer_drop_is_reset() {
        let fabric = LoopbackFabric::new();
        let (client, mut server) = connect_pair(&fabric, 1);

        drop(client);
        assert!(matches!(
            server.poll_for_msg(),
            Err(TransportError::PeerReset)
        ));
        assert!(matches!(
            server.poll_for_msg(),
            Err(TransportError::NotConnected)
        ));
    }

    #[test]
    fn test_registrations_released_on_drop() {
        let fabric = LoopbackFabric::new();
        let stats = fabric.stats();
        {
            let (client, server) = connect_pair(&fabric, 2);
            let _data = server.alloc_key(PAGE_SIZE).unwrap();
            assert_eq!(stats.live(), 5);
            drop(client);
        }
        assert_eq!(stats.live(), 0);
        assert_eq!(stats.registered(), stats.released());
    }

    #[test]
    fn test_connect_without_listener_refused() {
        let fabric = LoopbackFabric::new();
        let addr = FabricAddr::loopback("127.0.0.1", "9999");
        let res = fabric.client_connect(&addr, &[], 1, &ShutdownToken::new());
        assert!(matches!(res, Err(TransportError::ConnectionRefused(_))));
    }

    #[test]
    fn test_reject_reaches_host() {
        let fabric = LoopbackFabric::new();
        let addr = FabricAddr::loopback("127.0.0.1", "4421");
        let mut listener = fabric.init_listener(&addr).unwrap();

        let client_fabric = fabric.clone();
        let client_addr = addr.clone();
        let client = std::thread::spawn(move || {
            client_fabric.client_connect(&client_addr, &[], 1, &ShutdownToken::new())
        });

        let shutdown = ShutdownToken::new();
        let request = loop {
            if let Some(req) = listener.wait_for_connection(&shutdown).unwrap() {
                break req;
            }
        };
        request.reject(&[0x82, 0x01]).unwrap();

        match client.join().unwrap() {
            Err(TransportError::Rejected(data)) => assert_eq!(data, vec![0x82, 0x01]),
            other => panic!("expected reject, got {:?}", other.map(|_| ())),
        }
        assert!(fabric.init_listener(&addr).is_err());
    }

    #[test]
    fn test_accept_observes_shutdown() {
        let fabric = LoopbackFabric::new();
        let addr = FabricAddr::loopback("127.0.0.1", "4431");
        let mut listener = fabric.init_listener(&addr).unwrap();

        let client_fabric = fabric.clone();
        let client = std::thread::spawn(move || {
            client_fabric.client_connect(&addr, &[], 1, &ShutdownToken::new())
        });

        let shutdown = ShutdownToken::new();
        let request = loop {
            if let Some(req) = listener.wait_for_connection(&shutdown).unwrap() {
                break req;
            }
        };
        shutdown.trigger();
        assert!(matches!(
            request.accept(1, &shutdown),
            Err(TransportError::Shutdown)
        ));

        // The abandoned request reads as refused on the host side
        assert!(matches!(
            client.join().unwrap(),
            Err(TransportError::ConnectionRefused(_))
        ));
    }

    #[test]
    fn test_listener_observes_shutdown() {
        let fabric = LoopbackFabric::new();
        let mut listener = fabric
            .init_listener(&FabricAddr::loopback("127.0.0.1", "4430"))
            .unwrap();
        let shutdown = ShutdownToken::new();

        assert!(listener.wait_for_connection(&shutdown).unwrap().is_none());
        shutdown.trigger();
        assert!(matches!(
            listener.wait_for_connection(&shutdown),
            Err(TransportError::Shutdown)
        ));
    }
}
