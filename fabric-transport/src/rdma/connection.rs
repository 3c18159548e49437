//! RDMA endpoint on a CM-created reliable-connected queue pair
//!
//! Receives land in a ring of page-sized registered buffers whose work
//! request id is the slot index. Sends and RMA operations are signaled on a
//! separate completion queue and polled to completion.

use log::{debug, info, warn};
use std::ptr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::cm::CmId;
use super::device::ProtectionDomain;
use super::ffi::*;
use crate::buffer::{MemoryRegion, RegisteredBuffer, RemoteBuffer};
use crate::shutdown::ShutdownToken;
use crate::transport::{Endpoint, QueueEntryId, Received};
use crate::{Result, TransportError, COMPLETION_TIMEOUT_MS, PAGE_SIZE};

/// Outstanding send-side work requests per endpoint
const SEND_DEPTH: u32 = 8;

/// Receive ring work request ids are slot indices; send ids start above them
const SEND_WR_BASE: u64 = 1 << 32;

struct RecvSlot {
    buf: RegisteredBuffer,
    posted: bool,
}

/// Connected RDMA endpoint
pub struct RdmaEndpoint {
    recv_ring: Vec<RecvSlot>,
    pd: Arc<ProtectionDomain>,
    cm: CmId,
    context: *mut ibv_context,
    send_cq: *mut ibv_cq,
    recv_cq: *mut ibv_cq,
    qp: *mut ibv_qp,
    peer: String,
    connected: bool,
    next_wr_id: u64,
}

unsafe impl Send for RdmaEndpoint {}

impl RdmaEndpoint {
    /// Build the queue pair and receive ring on a resolved (or accepted) cm id
    ///
    /// # Arguments
    /// * `cm` - Connection manager id, already bound to a device
    /// * `depth` - Number of receive slots
    /// * `peer` - Peer description for logging
    pub(crate) fn create(cm: CmId, depth: usize, peer: String) -> Result<Self> {
        let depth = depth.max(1);
        let context = unsafe { (*cm.as_ptr()).verbs };
        let pd = ProtectionDomain::alloc(context)?;

        let send_cq = unsafe {
            ibv_create_cq(context, SEND_DEPTH as i32, ptr::null_mut(), ptr::null_mut(), 0)
        };
        if send_cq.is_null() {
            return Err(TransportError::ResourceExhausted("send CQ".into()));
        }

        let recv_cq =
            unsafe { ibv_create_cq(context, depth as i32, ptr::null_mut(), ptr::null_mut(), 0) };
        if recv_cq.is_null() {
            unsafe { ibv_destroy_cq(send_cq) };
            return Err(TransportError::ResourceExhausted("recv CQ".into()));
        }

        let mut qp_init_attr: ibv_qp_init_attr = unsafe { std::mem::zeroed() };
        qp_init_attr.send_cq = send_cq;
        qp_init_attr.recv_cq = recv_cq;
        qp_init_attr.qp_type = ibv_qp_type::IBV_QPT_RC;
        qp_init_attr.cap.max_send_wr = SEND_DEPTH;
        qp_init_attr.cap.max_recv_wr = depth as u32;
        qp_init_attr.cap.max_send_sge = 1;
        qp_init_attr.cap.max_recv_sge = 1;

        if unsafe { rdma_create_qp(cm.as_ptr(), pd.as_ptr(), &mut qp_init_attr) } != 0 {
            unsafe {
                ibv_destroy_cq(send_cq);
                ibv_destroy_cq(recv_cq);
            }
            return Err(TransportError::ResourceExhausted(format!(
                "rdma_create_qp: {}",
                std::io::Error::last_os_error()
            )));
        }
        let qp = unsafe { (*cm.as_ptr()).qp };

        debug!(
            "Created QP {} for {} (recv depth {})",
            unsafe { (*qp).qp_num },
            peer,
            depth
        );

        let mut endpoint = Self {
            recv_ring: Vec::with_capacity(depth),
            pd,
            cm,
            context,
            send_cq,
            recv_cq,
            qp,
            peer,
            connected: false,
            next_wr_id: SEND_WR_BASE,
        };

        for slot in 0..depth {
            let buf = endpoint.alloc_key(PAGE_SIZE)?;
            endpoint.recv_ring.push(RecvSlot { buf, posted: false });
            endpoint.post_recv(slot)?;
        }

        Ok(endpoint)
    }

    pub(crate) fn cm(&self) -> &CmId {
        &self.cm
    }

    pub(crate) fn mark_connected(&mut self) {
        self.connected = true;
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }

    fn post_recv(&mut self, slot: usize) -> Result<()> {
        let recv = self
            .recv_ring
            .get_mut(slot)
            .ok_or(TransportError::InvalidQueueEntry(slot))?;

        let mut sge = ibv_sge {
            addr: recv.buf.addr(),
            length: recv.buf.len() as u32,
            lkey: recv.buf.lkey(),
        };

        let mut wr: ibv_recv_wr = unsafe { std::mem::zeroed() };
        wr.wr_id = slot as u64;
        wr.sg_list = &mut sge;
        wr.num_sge = 1;

        let mut bad_wr: *mut ibv_recv_wr = ptr::null_mut();
        let ret = unsafe {
            let ops = &mut (*self.context).ops;
            let post_recv = ops
                .post_recv
                .ok_or_else(|| TransportError::Rdma("device has no post_recv".into()))?;
            post_recv(self.qp, &mut wr, &mut bad_wr)
        };

        if ret != 0 {
            return Err(TransportError::Rdma(format!("post_recv failed: {}", ret)));
        }

        recv.posted = true;
        Ok(())
    }

    fn post_send(
        &mut self,
        opcode: ibv_wr_opcode,
        local: &RegisteredBuffer,
        len: usize,
        remote: Option<RemoteBuffer>,
        signaled: bool,
    ) -> Result<u64> {
        if len > local.len() {
            return Err(TransportError::ResourceExhausted(format!(
                "{} byte transfer from {} byte buffer",
                len,
                local.len()
            )));
        }

        let wr_id = self.next_wr_id;
        self.next_wr_id += 1;

        let mut sge = ibv_sge {
            addr: local.addr(),
            length: len as u32,
            lkey: local.lkey(),
        };

        let mut wr: ibv_send_wr = unsafe { std::mem::zeroed() };
        wr.wr_id = wr_id;
        wr.sg_list = &mut sge;
        wr.num_sge = 1;
        wr.opcode = opcode;
        if signaled {
            wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
        }
        if let Some(remote) = remote {
            wr.wr.rdma.remote_addr = remote.addr;
            wr.wr.rdma.rkey = remote.key;
        }

        let mut bad_wr: *mut ibv_send_wr = ptr::null_mut();
        let ret = unsafe {
            let ops = &mut (*self.context).ops;
            let post_send = ops
                .post_send
                .ok_or_else(|| TransportError::Rdma("device has no post_send".into()))?;
            post_send(self.qp, &mut wr, &mut bad_wr)
        };

        if ret != 0 {
            return Err(TransportError::Rdma(format!("post_send failed: {}", ret)));
        }

        Ok(wr_id)
    }

    fn poll_cq(&self, cq: *mut ibv_cq, wc: &mut ibv_wc) -> Result<bool> {
        let n = unsafe {
            let ops = &mut (*self.context).ops;
            let poll_cq = ops
                .poll_cq
                .ok_or_else(|| TransportError::Rdma("device has no poll_cq".into()))?;
            poll_cq(cq, 1, wc)
        };

        if n < 0 {
            return Err(TransportError::Rdma("CQ polling failed".into()));
        }
        Ok(n > 0)
    }

    fn wait_send_completion(&mut self, expected: u64, shutdown: &ShutdownToken) -> Result<()> {
        let mut wc: ibv_wc = unsafe { std::mem::zeroed() };
        let deadline = Instant::now() + Duration::from_millis(COMPLETION_TIMEOUT_MS);

        loop {
            if self.poll_cq(self.send_cq, &mut wc)? {
                if wc.status != ibv_wc_status::IBV_WC_SUCCESS {
                    self.connected = false;
                    return Err(TransportError::Rdma(format!(
                        "send completion failed: status={:?}",
                        wc.status
                    )));
                }
                if wc.wr_id == expected {
                    return Ok(());
                }
            }

            shutdown.check()?;
            if Instant::now() > deadline {
                return Err(TransportError::Timeout("send completion"));
            }

            std::thread::sleep(Duration::from_micros(1));
        }
    }

    fn check_disconnect(&mut self) -> Result<()> {
        if let Some(event) = self.cm.channel().next_event(0)? {
            if event.kind() == rdma_cm_event_type::RDMA_CM_EVENT_DISCONNECTED {
                info!("Peer {} disconnected", self.peer);
                self.connected = false;
                return Err(TransportError::PeerReset);
            }
            debug!("Endpoint {} ignoring cm event {:?}", self.peer, event.kind());
        }
        Ok(())
    }
}

impl Endpoint for RdmaEndpoint {
    fn peer(&self) -> String {
        self.peer.clone()
    }

    fn alloc_key(&self, len: usize) -> Result<RegisteredBuffer> {
        RegisteredBuffer::allocate(len, |addr, len| {
            let mr = self.pd.register(addr, len)?;
            Ok(Box::new(mr) as Box<dyn MemoryRegion>)
        })
    }

    fn post_msg(&mut self, buf: &RegisteredBuffer, len: usize) -> Result<()> {
        self.ensure_connected()?;
        self.post_send(ibv_wr_opcode::IBV_WR_SEND, buf, len, None, false)?;
        Ok(())
    }

    fn send_msg(
        &mut self,
        buf: &RegisteredBuffer,
        len: usize,
        shutdown: &ShutdownToken,
    ) -> Result<()> {
        self.ensure_connected()?;
        let wr_id = self.post_send(ibv_wr_opcode::IBV_WR_SEND, buf, len, None, true)?;
        self.wait_send_completion(wr_id, shutdown)
    }

    fn poll_for_msg(&mut self) -> Result<Option<Received>> {
        self.ensure_connected()?;
        self.check_disconnect()?;

        let mut wc: ibv_wc = unsafe { std::mem::zeroed() };
        if !self.poll_cq(self.recv_cq, &mut wc)? {
            return Ok(None);
        }

        if wc.status != ibv_wc_status::IBV_WC_SUCCESS {
            self.connected = false;
            if wc.status == ibv_wc_status::IBV_WC_WR_FLUSH_ERR {
                return Err(TransportError::PeerReset);
            }
            return Err(TransportError::Rdma(format!(
                "receive completion failed: status={:?}",
                wc.status
            )));
        }

        let slot = wc.wr_id as usize;
        let recv = self
            .recv_ring
            .get_mut(slot)
            .ok_or(TransportError::InvalidQueueEntry(slot))?;
        recv.posted = false;

        let len = (wc.byte_len as usize).min(recv.buf.len());
        Ok(Some(Received {
            entry: QueueEntryId(slot),
            data: recv.buf.as_slice()[..len].to_vec(),
        }))
    }

    fn repost_recv(&mut self, entry: QueueEntryId) -> Result<()> {
        match self.recv_ring.get(entry.0) {
            Some(slot) if !slot.posted => self.post_recv(entry.0),
            _ => Err(TransportError::InvalidQueueEntry(entry.0)),
        }
    }

    fn rma_read(
        &mut self,
        local: &mut RegisteredBuffer,
        remote: RemoteBuffer,
        shutdown: &ShutdownToken,
    ) -> Result<()> {
        self.ensure_connected()?;
        let wr_id = self.post_send(
            ibv_wr_opcode::IBV_WR_RDMA_READ,
            local,
            remote.len,
            Some(remote),
            true,
        )?;
        self.wait_send_completion(wr_id, shutdown)
    }

    fn rma_write(
        &mut self,
        local: &RegisteredBuffer,
        remote: RemoteBuffer,
        shutdown: &ShutdownToken,
    ) -> Result<()> {
        self.ensure_connected()?;
        let wr_id = self.post_send(
            ibv_wr_opcode::IBV_WR_RDMA_WRITE,
            local,
            remote.len,
            Some(remote),
            true,
        )?;
        self.wait_send_completion(wr_id, shutdown)
    }
}

impl Drop for RdmaEndpoint {
    fn drop(&mut self) {
        if self.connected {
            if unsafe { rdma_disconnect(self.cm.as_ptr()) } != 0 {
                warn!("rdma_disconnect failed for {}", self.peer);
            }
        }

        // Deregister receive buffers before the QP and CQs go away
        self.recv_ring.clear();

        unsafe {
            if !self.qp.is_null() {
                rdma_destroy_qp(self.cm.as_ptr());
            }
            ibv_destroy_cq(self.send_cq);
            ibv_destroy_cq(self.recv_cq);
        }

        debug!("Released RDMA endpoint for {}", self.peer);
        // pd, then cm id and its channel, drop in field order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{FabricAddr, Transport};
    use crate::rdma::RdmaTransport;

    #[test]
    #[ignore] // Requires RDMA hardware
    fn test_rdma_connect_refused() {
        let transport = RdmaTransport::new();
        let dest = FabricAddr::new(
            crate::TransportType::Rdma,
            crate::AddressFamily::Ipv4,
            "127.0.0.1",
            "4420",
        );
        let res = transport.client_connect(&dest, &[], 1, &ShutdownToken::new());
        assert!(res.is_err());
    }
}
