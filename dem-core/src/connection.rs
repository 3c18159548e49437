//! One fabric association with its registered buffers
//!
//! Used by both sides: the host side issues commands from the command
//! buffer and lends the data buffer to the controller through keyed SGLs;
//! the controller side sends completions from the command buffer and pulls
//! or pushes payloads through the data buffer.

use log::{debug, info};

use fabric_transport::{
    Endpoint, QueueEntryId, Received, RegisteredBuffer, RemoteBuffer, ShutdownToken, PAGE_SIZE,
};

use crate::nvme::command::FABRICS_OPCODE;
use crate::nvme::{
    Command, Completion, FabricsType, KeyedSgl, CC_DISABLE, COMMAND_SIZE, REG_CC,
};
use crate::{DemError, Result};

/// Receive slots per admin queue
pub const NVMF_DQ_DEPTH: usize = 1;

/// Longest host NQN kept for a connection
pub const MAX_NQN_LEN: usize = 256;

/// Command id used for the disconnect notice
const DISCONNECT_CID: u16 = 0xfffe;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connected,
}

/// Emulated controller state of a host connection
#[derive(Debug, Clone, Default)]
pub struct ControllerState {
    pub csts: u32,
    pub host_nqn: Option<String>,
    pub kato: u32,
    pub aen_config: u32,
    /// Command id of an async event request held for the host
    pub held_aer: Option<u16>,
    /// Registry generation the host last saw
    pub seen_generation: u64,
}

/// Connection over a transport endpoint
pub struct Connection {
    // Buffers are registered after the endpoint exists, so they are
    // declared first and released before it.
    data: RegisteredBuffer,
    cmd: RegisteredBuffer,
    ep: Box<dyn Endpoint>,
    state: ConnState,
    pub ctrl: ControllerState,
}

impl Connection {
    /// Wrap a connected endpoint, registering command and data buffers
    pub fn new(ep: Box<dyn Endpoint>) -> Result<Self> {
        let cmd = ep.alloc_key(PAGE_SIZE)?;
        let data = ep.alloc_key(PAGE_SIZE)?;

        Ok(Self {
            data,
            cmd,
            ep,
            state: ConnState::Connected,
            ctrl: ControllerState::default(),
        })
    }

    pub fn peer(&self) -> String {
        self.ep.peer()
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnState::Connected
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(DemError::NotConnected)
        }
    }

    /// Record a host NQN, bounded to the wire field width
    pub fn set_host_nqn(&mut self, nqn: &str) {
        let mut end = nqn.len().min(MAX_NQN_LEN);
        while !nqn.is_char_boundary(end) {
            end -= 1;
        }
        self.ctrl.host_nqn = Some(nqn[..end].to_string());
    }

    pub fn host_nqn(&self) -> Option<&str> {
        self.ctrl.host_nqn.as_deref()
    }

    /// Keyed SGL lending the first `len` bytes of the data buffer
    pub fn data_sgl(&self, len: usize) -> Result<KeyedSgl> {
        Ok(KeyedSgl::from_remote(self.data.remote(len)?)?)
    }

    pub fn data(&self) -> &[u8] {
        self.data.as_slice()
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.data.as_mut_slice()
    }

    /// Register an extra buffer on this connection's endpoint
    pub fn alloc_buffer(&self, len: usize) -> Result<RegisteredBuffer> {
        Ok(self.ep.alloc_key(len)?)
    }

    fn stage(&mut self, msg: &[u8]) {
        let buf = self.cmd.as_mut_slice();
        buf[..msg.len()].copy_from_slice(msg);
    }

    /// Send a command and wait for the send to complete
    pub fn send_command(&mut self, cmd: &Command, shutdown: &ShutdownToken) -> Result<()> {
        self.ensure_connected()?;
        debug!("-> {} cid {}", cmd.describe(), cmd.command_id);
        self.stage(&cmd.encode());
        self.ep.send_msg(&self.cmd, COMMAND_SIZE, shutdown)?;
        Ok(())
    }

    pub fn send_completion(&mut self, cpl: &Completion, shutdown: &ShutdownToken) -> Result<()> {
        self.ensure_connected()?;
        let raw = cpl.encode();
        self.stage(&raw);
        self.ep.send_msg(&self.cmd, raw.len(), shutdown)?;
        Ok(())
    }

    /// Non-blocking receive; the caller reposts the entry when done
    pub fn poll(&mut self) -> Result<Option<Received>> {
        self.ensure_connected()?;
        match self.ep.poll_for_msg() {
            Ok(msg) => Ok(msg),
            Err(e) => {
                if e.is_terminal() {
                    self.state = ConnState::Disconnected;
                }
                Err(e.into())
            }
        }
    }

    pub fn repost(&mut self, entry: QueueEntryId) -> Result<()> {
        self.ep.repost_recv(entry)?;
        Ok(())
    }

    /// Pull peer memory into the start of the data buffer
    pub fn rma_read(&mut self, remote: RemoteBuffer, shutdown: &ShutdownToken) -> Result<()> {
        self.ensure_connected()?;
        self.ep.rma_read(&mut self.data, remote, shutdown)?;
        Ok(())
    }

    /// Push the start of the data buffer into peer memory
    pub fn rma_write(&mut self, remote: RemoteBuffer, shutdown: &ShutdownToken) -> Result<()> {
        self.ensure_connected()?;
        self.ep.rma_write(&self.data, remote, shutdown)?;
        Ok(())
    }

    /// Push the start of a separately registered buffer into peer memory
    pub fn rma_write_from(
        &mut self,
        buf: &RegisteredBuffer,
        remote: RemoteBuffer,
        shutdown: &ShutdownToken,
    ) -> Result<()> {
        self.ensure_connected()?;
        self.ep.rma_write(buf, remote, shutdown)?;
        Ok(())
    }

    /// Leave the connected state; resources go when the connection drops
    ///
    /// A graceful disconnect first posts a CC shutdown notice to the peer.
    pub fn disconnect(&mut self, graceful: bool) {
        if graceful && self.is_connected() {
            let notice = Command::property_set(DISCONNECT_CID, REG_CC, CC_DISABLE).encode();
            self.stage(&notice);
            if let Err(e) = self.ep.post_msg(&self.cmd, COMMAND_SIZE) {
                debug!("Disconnect notice to {} not sent: {}", self.ep.peer(), e);
            }
        }

        if self.is_connected() {
            info!("Disconnected {}", self.ep.peer());
        }
        self.state = ConnState::Disconnected;
    }
}

/// Whether a received message is a peer's disconnect notice
///
/// Only the graceful-shutdown property set counts; an ordinary host
/// write of the same CC value does not.
pub fn is_disconnect_notice(msg: &[u8]) -> bool {
    Command::decode(msg).is_ok_and(|cmd| {
        cmd.command_id == DISCONNECT_CID
            && cmd.opcode == FABRICS_OPCODE
            && cmd.fabrics_type() == Some(FabricsType::PropertySet)
            && cmd.property_offset() == REG_CC
            && cmd.property_value() == CC_DISABLE
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::connected_pair;
    use fabric_transport::LoopbackFabric;

    fn recv(conn: &mut Connection) -> Received {
        loop {
            if let Some(msg) = conn.poll().unwrap() {
                return msg;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }

    #[test]
    fn test_command_round_trip_and_rma() {
        let fabric = LoopbackFabric::new();
        let (mut host, mut ctrl) = connected_pair(&fabric, "5001");
        let shutdown = ShutdownToken::new();

        host.data_mut()[..4].copy_from_slice(b"ping");
        let sgl = host.data_sgl(4).unwrap();
        host.send_command(&Command::identify(1, 1, sgl), &shutdown)
            .unwrap();

        let msg = recv(&mut ctrl);
        let cmd = Command::decode(&msg.data).unwrap();
        ctrl.repost(msg.entry).unwrap();
        assert_eq!(cmd.sgl, sgl);

        ctrl.rma_read(cmd.sgl.remote(), &shutdown).unwrap();
        assert_eq!(&ctrl.data()[..4], b"ping");
    }

    #[test]
    fn test_disconnect_notice() {
        let fabric = LoopbackFabric::new();
        let (mut host, mut ctrl) = connected_pair(&fabric, "5002");

        ctrl.disconnect(true);
        assert!(!ctrl.is_connected());
        assert!(matches!(
            ctrl.send_completion(&Completion::default(), &ShutdownToken::new()),
            Err(DemError::NotConnected)
        ));

        let msg = recv(&mut host);
        assert!(is_disconnect_notice(&msg.data));
    }

    #[test]
    fn test_host_cc_disable_is_not_disconnect() {
        let disable = Command::property_set(5, REG_CC, CC_DISABLE).encode();
        assert!(!is_disconnect_notice(&disable));

        let enable = Command::property_set(DISCONNECT_CID, REG_CC, crate::nvme::CC_ENABLE).encode();
        assert!(!is_disconnect_notice(&enable));

        let notice = Command::property_set(DISCONNECT_CID, REG_CC, CC_DISABLE).encode();
        assert!(is_disconnect_notice(&notice));
    }

    #[test]
    fn test_host_nqn_bounded() {
        let fabric = LoopbackFabric::new();
        let (_host, mut ctrl) = connected_pair(&fabric, "5003");
        ctrl.set_host_nqn(&"n".repeat(400));
        assert_eq!(ctrl.host_nqn().unwrap().len(), MAX_NQN_LEN);
    }
}
