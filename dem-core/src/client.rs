//! Host side of an admin queue to a discovery controller
//!
//! One command is outstanding at a time, plus at most one async event
//! request. A completion for the held async event request can arrive while
//! waiting for any other response; it is recorded and reported through
//! [`ControllerClient::take_aen`].

use log::{debug, info, warn};
use std::time::{Duration, Instant};

use fabric_transport::{FabricAddr, RegisteredBuffer, ShutdownToken, Transport, PAGE_SIZE};

use crate::connection::{is_disconnect_notice, Connection, NVMF_DQ_DEPTH};
use crate::nvme::{
    CmRequest, Command, Completion, ConfigId, ConfigRequest, ConnectData, FabricsType,
    IdentifyController, KeyedSgl, WireError, AEN_NOTICE_DISC_CHANGE, CC_ENABLE, CNS_CTRL,
    LID_DISCOVERY, MAX_SGL_LEN, REG_CC,
};
use crate::{DemError, Result};

/// Poll interval while waiting for a response (ms)
pub const MSG_TIMEOUT_MS: u64 = 100;

/// Give up on a response after this long (ms)
pub const RESPONSE_TIMEOUT_MS: u64 = 5000;

/// Keep-alive timeout requested at connect (ms)
pub const DEFAULT_KATO_MS: u32 = 120_000;

/// Submission queue size reported in connect, 0's based
const ADMIN_SQSIZE: u16 = 31;

// Command ids below this are resource-config sub-operations
const FIRST_CID: u16 = 0x100;
const LAST_CID: u16 = 0xfff0;

pub struct ControllerClient {
    conn: Connection,
    addr: FabricAddr,
    next_cid: u16,
    aer_cid: Option<u16>,
    aen_pending: bool,
    response_timeout: Duration,
}

impl ControllerClient {
    /// Connect an admin queue and enable the controller
    ///
    /// # Arguments
    /// * `transport` - Fabric to connect over
    /// * `addr` - Controller address
    /// * `subsys_nqn` - Subsystem to connect to (discovery or domain NQN)
    /// * `host_nqn` - Identity presented to the controller
    /// * `kato` - Keep-alive timeout to negotiate (ms)
    pub fn connect(
        transport: &dyn Transport,
        addr: &FabricAddr,
        subsys_nqn: &str,
        host_nqn: &str,
        kato: u32,
        shutdown: &ShutdownToken,
    ) -> Result<Self> {
        let private_data = CmRequest::admin(NVMF_DQ_DEPTH as u16).encode();
        let ep = transport.client_connect(addr, &private_data, NVMF_DQ_DEPTH, shutdown)?;

        let mut client = Self {
            conn: Connection::new(ep)?,
            addr: addr.clone(),
            next_cid: FIRST_CID,
            aer_cid: None,
            aen_pending: false,
            response_timeout: Duration::from_millis(RESPONSE_TIMEOUT_MS),
        };

        client.fabrics_connect(subsys_nqn, host_nqn, kato, shutdown)?;
        client.property_set(REG_CC, CC_ENABLE, shutdown)?;

        info!("Connected to {} ({})", addr, subsys_nqn);
        Ok(client)
    }

    pub fn addr(&self) -> &FabricAddr {
        &self.addr
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    pub fn set_response_timeout(&mut self, timeout: Duration) {
        self.response_timeout = timeout;
    }

    fn alloc_cid(&mut self) -> u16 {
        let cid = self.next_cid;
        self.next_cid = if cid >= LAST_CID { FIRST_CID } else { cid + 1 };
        cid
    }

    fn handle_aer_completion(&mut self, cpl: &Completion) {
        self.aer_cid = None;
        if !cpl.status_code().is_success() {
            warn!("Async event request to {} failed: {}", self.addr, cpl.status_code());
        } else if cpl.result & 0xffff == AEN_NOTICE_DISC_CHANGE {
            info!("Discovery log change reported by {}", self.addr);
            self.aen_pending = true;
        } else {
            debug!("Ignoring async event {:#x} from {}", cpl.result, self.addr);
        }
    }

    /// Take one received message: `Some` is a completion for a regular command
    fn receive(&mut self) -> Result<Option<Completion>> {
        let Some(msg) = self.conn.poll()? else {
            return Ok(None);
        };
        self.conn.repost(msg.entry)?;

        if is_disconnect_notice(&msg.data) {
            info!("Controller {} is shutting the connection down", self.addr);
            self.conn.disconnect(false);
            return Err(DemError::NotConnected);
        }

        let cpl = Completion::decode(&msg.data)?;
        if Some(cpl.command_id) == self.aer_cid {
            self.handle_aer_completion(&cpl);
            return Ok(None);
        }
        Ok(Some(cpl))
    }

    fn wait_response(&mut self, cmd: &Command, shutdown: &ShutdownToken) -> Result<Completion> {
        let deadline = Instant::now() + self.response_timeout;

        loop {
            shutdown.check().map_err(DemError::from)?;

            match self.receive()? {
                Some(cpl) if cpl.command_id == cmd.command_id => return Ok(cpl),
                Some(cpl) => warn!(
                    "Stray completion cid {} from {} while waiting for {}",
                    cpl.command_id, self.addr, cmd.command_id
                ),
                None => {
                    if Instant::now() > deadline {
                        return Err(DemError::NoResponse(cmd.describe()));
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        }
    }

    /// Send a command and wait for its successful completion
    pub fn execute(&mut self, cmd: &Command, shutdown: &ShutdownToken) -> Result<Completion> {
        self.conn.send_command(cmd, shutdown)?;
        let cpl = self.wait_response(cmd, shutdown)?;

        let status = cpl.status_code();
        if !status.is_success() {
            return Err(DemError::Status {
                command: cmd.describe(),
                status,
            });
        }
        Ok(cpl)
    }

    fn fabrics_connect(
        &mut self,
        subsys_nqn: &str,
        host_nqn: &str,
        kato: u32,
        shutdown: &ShutdownToken,
    ) -> Result<()> {
        let payload = ConnectData {
            hostid: rand::random(),
            cntlid: ConnectData::CNTLID_DYNAMIC,
            subsysnqn: subsys_nqn.to_string(),
            hostnqn: host_nqn.to_string(),
        }
        .encode()?;

        self.conn.data_mut()[..payload.len()].copy_from_slice(&payload);
        let sgl = self.conn.data_sgl(payload.len())?;
        let cid = self.alloc_cid();
        self.execute(&Command::connect(cid, ADMIN_SQSIZE, kato, sgl), shutdown)?;
        Ok(())
    }

    pub fn property_set(&mut self, offset: u32, value: u64, shutdown: &ShutdownToken) -> Result<()> {
        let cid = self.alloc_cid();
        self.execute(&Command::property_set(cid, offset, value), shutdown)?;
        Ok(())
    }

    pub fn property_get(&mut self, offset: u32, shutdown: &ShutdownToken) -> Result<u64> {
        let cid = self.alloc_cid();
        Ok(self
            .execute(&Command::property_get(cid, offset), shutdown)?
            .result)
    }

    pub fn identify(&mut self, shutdown: &ShutdownToken) -> Result<IdentifyController> {
        let sgl = self.conn.data_sgl(IdentifyController::SIZE)?;
        let cid = self.alloc_cid();
        self.execute(&Command::identify(cid, CNS_CTRL, sgl), shutdown)?;
        Ok(IdentifyController::decode(
            &self.conn.data()[..IdentifyController::SIZE],
        )?)
    }

    /// Read `len` bytes of the discovery log
    pub fn get_log_page(&mut self, len: usize, shutdown: &ShutdownToken) -> Result<Vec<u8>> {
        let cid = self.alloc_cid();

        if len <= PAGE_SIZE {
            let sgl = self.conn.data_sgl(len)?;
            self.execute(&Command::get_log_page(cid, LID_DISCOVERY, sgl), shutdown)?;
            return Ok(self.conn.data()[..len].to_vec());
        }

        if len > MAX_SGL_LEN {
            return Err(WireError::FieldTooLong {
                field: "log page length",
                max: MAX_SGL_LEN,
                len,
            }
            .into());
        }

        // Larger logs land in a buffer registered for this request only
        let buf: RegisteredBuffer = self.conn.alloc_buffer(len)?;
        let sgl = KeyedSgl::from_remote(buf.remote(len)?)?;
        self.execute(&Command::get_log_page(cid, LID_DISCOVERY, sgl), shutdown)?;
        Ok(buf.as_slice()[..len].to_vec())
    }

    pub fn keep_alive(&mut self, shutdown: &ShutdownToken) -> Result<()> {
        let cid = self.alloc_cid();
        self.execute(&Command::keep_alive(cid), shutdown)?;
        Ok(())
    }

    pub fn set_features(&mut self, fid: u8, value: u32, shutdown: &ShutdownToken) -> Result<u64> {
        let cid = self.alloc_cid();
        Ok(self
            .execute(&Command::set_features(cid, fid, value), shutdown)?
            .result)
    }

    pub fn get_features(&mut self, fid: u8, shutdown: &ShutdownToken) -> Result<u64> {
        let cid = self.alloc_cid();
        Ok(self
            .execute(&Command::get_features(cid, fid), shutdown)?
            .result)
    }

    /// Post an async event request unless one is already outstanding
    pub fn arm_async_event(&mut self, shutdown: &ShutdownToken) -> Result<()> {
        if self.aer_cid.is_some() {
            return Ok(());
        }
        let cid = self.alloc_cid();
        self.conn
            .send_command(&Command::async_event_request(cid), shutdown)?;
        self.aer_cid = Some(cid);
        Ok(())
    }

    pub fn aer_outstanding(&self) -> bool {
        self.aer_cid.is_some()
    }

    /// Drain received messages without blocking
    pub fn poll_events(&mut self) -> Result<()> {
        while let Some(cpl) = self.receive()? {
            warn!(
                "Unexpected completion cid {} from {}",
                cpl.command_id, self.addr
            );
        }
        Ok(())
    }

    /// Whether a discovery log change was reported since the last call
    pub fn take_aen(&mut self) -> bool {
        std::mem::take(&mut self.aen_pending)
    }

    pub fn resource_get(&mut self, id: ConfigId, shutdown: &ShutdownToken) -> Result<Vec<u8>> {
        let sgl = self.conn.data_sgl(PAGE_SIZE)?;
        let cmd = Command::resource_config(FabricsType::ResourceConfigGet, id as u16, sgl);
        self.execute(&cmd, shutdown)?;
        Ok(self.conn.data().to_vec())
    }

    pub fn resource_set(&mut self, request: &ConfigRequest, shutdown: &ShutdownToken) -> Result<()> {
        let payload = request.encode()?;
        self.conn.data_mut()[..payload.len()].copy_from_slice(&payload);
        let sgl = self.conn.data_sgl(payload.len())?;
        let cmd = Command::resource_config(FabricsType::ResourceConfigSet, request.id() as u16, sgl);
        self.execute(&cmd, shutdown)?;
        Ok(())
    }

    pub fn resource_reset(&mut self, shutdown: &ShutdownToken) -> Result<()> {
        let cmd = Command::resource_config(
            FabricsType::ResourceConfigReset,
            ConfigId::Reset as u16,
            KeyedSgl::default(),
        );
        self.execute(&cmd, shutdown)?;
        Ok(())
    }

    /// Tear the association down; graceful sends the CC shutdown notice
    pub fn disconnect(&mut self, graceful: bool) {
        self.conn.disconnect(graceful);
    }
}
