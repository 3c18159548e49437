//! RDMA connection manager plumbing
//!
//! Event channels are polled with a bounded timeout so callers can observe
//! the shutdown token between events.

use log::{debug, info, warn};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{SockaddrLike, SockaddrStorage};
use std::os::fd::BorrowedFd;
use std::ptr;
use std::time::{Duration, Instant};

use super::connection::RdmaEndpoint;
use super::ffi::*;
use crate::shutdown::ShutdownToken;
use crate::transport::{ConnRequest, Endpoint, FabricAddr, Listener};
use crate::{
    Result, TransportError, EVENT_TIMEOUT_MS, IDLE_TIMEOUT_MS, LISTEN_BACKLOG, RESOLVE_TIMEOUT_MS,
};

fn last_os_error(what: &str) -> TransportError {
    TransportError::Rdma(format!("{} failed: {}", what, std::io::Error::last_os_error()))
}

/// Owned RDMA-CM event channel
pub(crate) struct EventChannel {
    ch: *mut rdma_event_channel,
}

unsafe impl Send for EventChannel {}

impl EventChannel {
    pub(crate) fn new() -> Result<Self> {
        let ch = unsafe { rdma_create_event_channel() };
        if ch.is_null() {
            return Err(last_os_error("rdma_create_event_channel"));
        }
        Ok(Self { ch })
    }

    pub(crate) fn as_ptr(&self) -> *mut rdma_event_channel {
        self.ch
    }

    /// Wait up to `timeout_ms` for the next event
    pub(crate) fn next_event(&self, timeout_ms: u16) -> Result<Option<CmEvent>> {
        // SAFETY: the channel fd stays open for the lifetime of self
        let fd = unsafe { BorrowedFd::borrow_raw((*self.ch).fd) };
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];

        match poll(&mut fds, PollTimeout::from(timeout_ms)) {
            Ok(0) => return Ok(None),
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => return Ok(None),
            Err(e) => return Err(TransportError::Rdma(format!("poll on cm channel: {}", e))),
        }

        let mut event: *mut rdma_cm_event = ptr::null_mut();
        if unsafe { rdma_get_cm_event(self.ch, &mut event) } != 0 {
            return Err(last_os_error("rdma_get_cm_event"));
        }

        Ok(Some(CmEvent::new(event)))
    }
}

impl Drop for EventChannel {
    fn drop(&mut self) {
        if !self.ch.is_null() {
            unsafe { rdma_destroy_event_channel(self.ch) };
        }
    }
}

/// Connection manager event, acknowledged on drop
pub(crate) struct CmEvent {
    ev: *mut rdma_cm_event,
    kind: rdma_cm_event_type,
    id: *mut rdma_cm_id,
    status: i32,
    private_data: Vec<u8>,
}

impl CmEvent {
    fn new(ev: *mut rdma_cm_event) -> Self {
        // Private data lives in the event and is freed by the ack, so copy it
        let (kind, id, status, private_data) = unsafe {
            let conn = (*ev).param.conn;
            let data = if conn.private_data.is_null() || conn.private_data_len == 0 {
                Vec::new()
            } else {
                std::slice::from_raw_parts(
                    conn.private_data as *const u8,
                    conn.private_data_len as usize,
                )
                .to_vec()
            };
            ((*ev).event, (*ev).id, (*ev).status, data)
        };

        Self {
            ev,
            kind,
            id,
            status,
            private_data,
        }
    }

    pub(crate) fn kind(&self) -> rdma_cm_event_type {
        self.kind
    }
}

impl Drop for CmEvent {
    fn drop(&mut self) {
        unsafe { rdma_ack_cm_event(self.ev) };
    }
}

/// Connection manager id with its event channel; destroyed on drop
pub(crate) struct CmId {
    id: *mut rdma_cm_id,
    channel: EventChannel,
}

unsafe impl Send for CmId {}

impl CmId {
    fn create(channel: EventChannel) -> Result<Self> {
        let mut id: *mut rdma_cm_id = ptr::null_mut();
        let ret = unsafe {
            rdma_create_id(
                channel.as_ptr(),
                &mut id,
                ptr::null_mut(),
                rdma_port_space::RDMA_PS_TCP,
            )
        };
        if ret != 0 {
            return Err(last_os_error("rdma_create_id"));
        }
        Ok(Self { id, channel })
    }

    /// Adopt an id delivered by a connect request onto a private channel
    ///
    /// Takes ownership of `id`: it is destroyed if adoption fails.
    fn adopt(id: *mut rdma_cm_id) -> Result<Self> {
        let channel = match EventChannel::new() {
            Ok(channel) => channel,
            Err(e) => {
                unsafe { rdma_destroy_id(id) };
                return Err(e);
            }
        };
        if unsafe { rdma_migrate_id(id, channel.as_ptr()) } != 0 {
            let err = last_os_error("rdma_migrate_id");
            unsafe { rdma_destroy_id(id) };
            return Err(err);
        }
        Ok(Self { id, channel })
    }

    pub(crate) fn as_ptr(&self) -> *mut rdma_cm_id {
        self.id
    }

    pub(crate) fn channel(&self) -> &EventChannel {
        &self.channel
    }

    /// Wait for `expected`, failing on error events, the deadline, or shutdown
    pub(crate) fn wait_event(
        &self,
        expected: rdma_cm_event_type,
        deadline: Duration,
        shutdown: &ShutdownToken,
    ) -> Result<()> {
        let limit = Instant::now() + deadline;

        loop {
            shutdown.check()?;

            if let Some(event) = self.channel.next_event(EVENT_TIMEOUT_MS as u16)? {
                let kind = event.kind();
                if kind == expected {
                    return Ok(());
                }

                match kind {
                    rdma_cm_event_type::RDMA_CM_EVENT_REJECTED => {
                        return Err(TransportError::Rejected(event.private_data.clone()))
                    }
                    rdma_cm_event_type::RDMA_CM_EVENT_ADDR_ERROR
                    | rdma_cm_event_type::RDMA_CM_EVENT_ROUTE_ERROR => {
                        return Err(TransportError::Address(format!(
                            "{:?} (status {})",
                            kind, event.status
                        )))
                    }
                    rdma_cm_event_type::RDMA_CM_EVENT_UNREACHABLE
                    | rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_ERROR => {
                        return Err(TransportError::Rdma(format!(
                            "{:?} (status {})",
                            kind, event.status
                        )))
                    }
                    rdma_cm_event_type::RDMA_CM_EVENT_DISCONNECTED
                    | rdma_cm_event_type::RDMA_CM_EVENT_DEVICE_REMOVAL => {
                        return Err(TransportError::PeerReset)
                    }
                    other => debug!("Ignoring cm event {:?} while waiting for {:?}", other, expected),
                }
            }

            if Instant::now() > limit {
                return Err(TransportError::Timeout("connection manager event"));
            }
        }
    }
}

impl Drop for CmId {
    fn drop(&mut self) {
        if !self.id.is_null() {
            unsafe { rdma_destroy_id(self.id) };
        }
    }
}

fn to_sockaddr(addr: &FabricAddr) -> Result<SockaddrStorage> {
    Ok(SockaddrStorage::from(addr.socket_addr()?))
}

/// Passive RDMA-CM endpoint
pub struct RdmaListener {
    addr: FabricAddr,
    cm: CmId,
}

impl RdmaListener {
    pub fn bind(addr: &FabricAddr) -> Result<Self> {
        let sockaddr = to_sockaddr(addr)?;
        let cm = CmId::create(EventChannel::new()?)?;

        if unsafe { rdma_bind_addr(cm.as_ptr(), sockaddr.as_ptr() as *mut sockaddr) } != 0 {
            return Err(last_os_error("rdma_bind_addr"));
        }

        if unsafe { rdma_listen(cm.as_ptr(), LISTEN_BACKLOG as i32) } != 0 {
            return Err(last_os_error("rdma_listen"));
        }

        info!("RDMA listener bound on {}", addr);

        Ok(Self {
            addr: addr.clone(),
            cm,
        })
    }
}

impl Listener for RdmaListener {
    fn local_addr(&self) -> &FabricAddr {
        &self.addr
    }

    fn wait_for_connection(
        &mut self,
        shutdown: &ShutdownToken,
    ) -> Result<Option<Box<dyn ConnRequest>>> {
        shutdown.check()?;

        let Some(event) = self.cm.channel().next_event(IDLE_TIMEOUT_MS as u16)? else {
            return Ok(None);
        };

        if event.kind() != rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_REQUEST {
            debug!("Listener on {} ignoring {:?}", self.addr, event.kind());
            return Ok(None);
        }

        Ok(Some(Box::new(RdmaRequest {
            id: Some(event.id),
            private_data: event.private_data.clone(),
            peer: format!("rdma host via {}", self.addr),
        })))
    }
}

/// Pending connect request; the child id is destroyed if neither accepted nor rejected
pub struct RdmaRequest {
    id: Option<*mut rdma_cm_id>,
    private_data: Vec<u8>,
    peer: String,
}

unsafe impl Send for RdmaRequest {}

impl ConnRequest for RdmaRequest {
    fn private_data(&self) -> &[u8] {
        &self.private_data
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }

    fn accept(mut self: Box<Self>, depth: usize, shutdown: &ShutdownToken) -> Result<Box<dyn Endpoint>> {
        shutdown.check()?;

        let id = self.id.take().ok_or(TransportError::NotConnected)?;
        let cm = CmId::adopt(id)?;

        let mut endpoint = RdmaEndpoint::create(cm, depth, self.peer.clone())?;

        let mut param: rdma_conn_param = unsafe { std::mem::zeroed() };
        param.responder_resources = 1;
        param.initiator_depth = 1;
        param.retry_count = 7;
        param.rnr_retry_count = 7;

        if unsafe { rdma_accept(endpoint.cm().as_ptr(), &mut param) } != 0 {
            return Err(last_os_error("rdma_accept"));
        }

        endpoint.cm().wait_event(
            rdma_cm_event_type::RDMA_CM_EVENT_ESTABLISHED,
            Duration::from_millis(RESOLVE_TIMEOUT_MS),
            shutdown,
        )?;
        endpoint.mark_connected();

        info!("Accepted RDMA connection from {}", self.peer);
        Ok(Box::new(endpoint))
    }

    fn reject(mut self: Box<Self>, data: &[u8]) -> Result<()> {
        let Some(id) = self.id.take() else {
            return Ok(());
        };

        let len = data.len().min(u8::MAX as usize) as u8;
        let ret = unsafe { rdma_reject(id, data.as_ptr() as *const libc::c_void, len) };
        unsafe { rdma_destroy_id(id) };

        if ret != 0 {
            return Err(last_os_error("rdma_reject"));
        }
        Ok(())
    }
}

impl Drop for RdmaRequest {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            warn!("Dropping unanswered connect request from {}", self.peer);
            unsafe { rdma_destroy_id(id) };
        }
    }
}

/// Drive an outbound connection through resolve-address, resolve-route, connect
pub fn connect(
    dest: &FabricAddr,
    private_data: &[u8],
    depth: usize,
    shutdown: &ShutdownToken,
) -> Result<RdmaEndpoint> {
    let sockaddr = to_sockaddr(dest)?;
    let cm = CmId::create(EventChannel::new()?)?;
    let resolve = Duration::from_millis(RESOLVE_TIMEOUT_MS);

    let ret = unsafe {
        rdma_resolve_addr(
            cm.as_ptr(),
            ptr::null_mut(),
            sockaddr.as_ptr() as *mut sockaddr,
            RESOLVE_TIMEOUT_MS as i32,
        )
    };
    if ret != 0 {
        return Err(last_os_error("rdma_resolve_addr"));
    }
    cm.wait_event(
        rdma_cm_event_type::RDMA_CM_EVENT_ADDR_RESOLVED,
        resolve,
        shutdown,
    )?;

    if unsafe { rdma_resolve_route(cm.as_ptr(), RESOLVE_TIMEOUT_MS as i32) } != 0 {
        return Err(last_os_error("rdma_resolve_route"));
    }
    cm.wait_event(
        rdma_cm_event_type::RDMA_CM_EVENT_ROUTE_RESOLVED,
        resolve,
        shutdown,
    )?;

    let mut endpoint = RdmaEndpoint::create(cm, depth, dest.to_string())?;

    let mut param: rdma_conn_param = unsafe { std::mem::zeroed() };
    param.private_data = private_data.as_ptr() as *const libc::c_void;
    param.private_data_len = private_data.len().min(u8::MAX as usize) as u8;
    param.responder_resources = 1;
    param.initiator_depth = 1;
    param.retry_count = 7;
    param.rnr_retry_count = 7;

    if unsafe { rdma_connect(endpoint.cm().as_ptr(), &mut param) } != 0 {
        return Err(last_os_error("rdma_connect"));
    }
    endpoint.cm().wait_event(
        rdma_cm_event_type::RDMA_CM_EVENT_ESTABLISHED,
        resolve,
        shutdown,
    )?;
    endpoint.mark_connected();

    info!("RDMA connection established to {}", dest);
    Ok(endpoint)
}
