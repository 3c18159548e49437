//! Emulated discovery controller
//!
//! Turns one decoded command plus the owning connection's controller state
//! into a completion. Protocol errors become status codes and the
//! connection stays usable; only the service loop decides teardown.
//!
//! The same dispatcher serves hosts (discovery mode) and the management
//! plane (supervisory mode, which also accepts the resource-config
//! fabrics commands and forwards them to a [`ConfigBackend`]).

use log::{debug, error, info, warn};
use std::sync::Arc;

use fabric_transport::{ShutdownToken, PAGE_SIZE};

use crate::backend::ConfigBackend;
use crate::connection::Connection;
use crate::nvme::discovery::encode_log;
use crate::nvme::{
    AdminOpcode, Command, Completion, ConfigId, ConfigRequest, ConnectData, FabricsType,
    IdentifyController, KeyedSgl, NsDevice, StatusCode, TransportEntry, AEN_DISC_LOG_CHANGE,
    AEN_DISC_LOG_RESULT, CAP_VALUE, CC_ENABLE, CNS_CTRL, CSTS_READY, CSTS_SHUTDOWN_COMPLETE,
    DISCOVERY_NQN, DOMAIN_NQN, FEAT_ASYNC_EVENT, FEAT_KATO, LID_DISCOVERY, REG_CAP, REG_CC,
    REG_CSTS, REG_VS, VS_VALUE,
};
use crate::registry::TargetRegistry;

/// Idle service passes before a discovery host is dropped
pub const DISCOVERY_RETRY_COUNT: u32 = 200;

/// Idle service passes before a supervisory connection is dropped
pub const SUPERVISORY_RETRY_COUNT: u32 = 1200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Host-facing discovery controller
    Discovery,
    /// Management connection; adds resource-config commands
    Supervisory,
}

impl DispatchMode {
    /// Idle passes a connection survives without a command
    pub fn retry_count(&self) -> u32 {
        match self {
            Self::Discovery => DISCOVERY_RETRY_COUNT,
            Self::Supervisory => SUPERVISORY_RETRY_COUNT,
        }
    }

    /// NQN reported by identify controller
    pub fn subsystem_nqn(&self) -> &'static str {
        match self {
            Self::Discovery => DISCOVERY_NQN,
            Self::Supervisory => DOMAIN_NQN,
        }
    }
}

/// What the service loop does after a dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Complete(Completion),
    /// Async event request parked until the discovery log changes
    Held,
}

type Handled = std::result::Result<u64, StatusCode>;

pub struct Dispatcher {
    mode: DispatchMode,
    registry: TargetRegistry,
    backend: Option<Arc<dyn ConfigBackend>>,
}

impl Dispatcher {
    pub fn discovery(registry: TargetRegistry) -> Self {
        Self {
            mode: DispatchMode::Discovery,
            registry,
            backend: None,
        }
    }

    pub fn supervisory(registry: TargetRegistry, backend: Arc<dyn ConfigBackend>) -> Self {
        Self {
            mode: DispatchMode::Supervisory,
            registry,
            backend: Some(backend),
        }
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    /// Execute one command against a connection
    ///
    /// # Arguments
    /// * `conn` - Controller side of the association the command arrived on
    /// * `cmd` - Decoded submission queue entry
    /// * `shutdown` - Aborts any RMA the command needs
    pub fn dispatch(&self, conn: &mut Connection, cmd: &Command, shutdown: &ShutdownToken) -> Outcome {
        debug!("<- {} cid {} from {}", cmd.describe(), cmd.command_id, conn.peer());

        let handled = match AdminOpcode::from_raw(cmd.opcode) {
            Some(AdminOpcode::Fabrics) => self.fabrics(conn, cmd, shutdown),
            Some(AdminOpcode::GetLogPage) => self.get_log_page(conn, cmd, shutdown),
            Some(AdminOpcode::Identify) => self.identify(conn, cmd, shutdown),
            Some(AdminOpcode::SetFeatures) => set_features(conn, cmd),
            Some(AdminOpcode::GetFeatures) => get_features(conn, cmd),
            Some(AdminOpcode::KeepAlive) => Ok(0),
            Some(AdminOpcode::AsyncEventRequest) => {
                if let Some(previous) = conn.ctrl.held_aer.replace(cmd.command_id) {
                    warn!("{} replaced held async event request {}", conn.peer(), previous);
                }
                return Outcome::Held;
            }
            None => Err(StatusCode::InvalidOpcode),
        };

        let completion = match handled {
            Ok(result) => Completion::new(cmd.command_id, StatusCode::Success, result),
            Err(status) => {
                debug!("{} cid {} -> {}", cmd.describe(), cmd.command_id, status);
                Completion::new(cmd.command_id, status, 0)
            }
        };
        Outcome::Complete(completion)
    }

    /// Completion for a held async event request once the host's log is stale
    pub fn pending_event(&self, conn: &mut Connection) -> Option<Completion> {
        let cid = conn.ctrl.held_aer?;
        if conn.ctrl.aen_config & AEN_DISC_LOG_CHANGE == 0 {
            return None;
        }

        let generation = self.registry.generation();
        if generation == conn.ctrl.seen_generation {
            return None;
        }

        conn.ctrl.held_aer = None;
        conn.ctrl.seen_generation = generation;
        debug!("Discovery log change event to {}", conn.peer());
        Some(Completion::new(cid, StatusCode::Success, AEN_DISC_LOG_RESULT))
    }

    fn fabrics(&self, conn: &mut Connection, cmd: &Command, shutdown: &ShutdownToken) -> Handled {
        match cmd.fabrics_type() {
            Some(FabricsType::PropertySet) => property_set(conn, cmd),
            Some(FabricsType::PropertyGet) => property_get(conn, cmd),
            Some(FabricsType::Connect) => self.connect(conn, cmd, shutdown),
            Some(
                fctype @ (FabricsType::ResourceConfigGet
                | FabricsType::ResourceConfigSet
                | FabricsType::ResourceConfigReset),
            ) => self.resource_config(fctype, conn, cmd, shutdown),
            None => Err(StatusCode::InvalidOpcode),
        }
    }

    fn connect(&self, conn: &mut Connection, cmd: &Command, shutdown: &ShutdownToken) -> Handled {
        if (cmd.sgl.len as usize) < ConnectData::SIZE {
            return Err(StatusCode::ConnectInvalidParam);
        }

        let remote = KeyedSgl {
            len: ConnectData::SIZE as u32,
            ..cmd.sgl
        }
        .remote();
        conn.rma_read(remote, shutdown).map_err(|e| {
            error!("Reading connect data from {} failed: {}", conn.peer(), e);
            StatusCode::WriteFault
        })?;

        let data = ConnectData::decode(&conn.data()[..ConnectData::SIZE])
            .map_err(|_| StatusCode::ConnectInvalidParam)?;

        if data.cntlid != ConnectData::CNTLID_DYNAMIC {
            warn!("{} asked for static controller {:#06x}", conn.peer(), data.cntlid);
            return Err(StatusCode::ConnectInvalidParam);
        }
        if data.subsysnqn != DISCOVERY_NQN && data.subsysnqn != DOMAIN_NQN {
            warn!("{} asked for unknown subsystem {}", conn.peer(), data.subsysnqn);
            return Err(StatusCode::ConnectInvalidHost);
        }

        conn.set_host_nqn(&data.hostnqn);
        conn.ctrl.kato = cmd.kato();
        conn.ctrl.seen_generation = self.registry.generation();

        info!(
            "Host {} connected from {} (kato {} ms)",
            data.hostnqn,
            conn.peer(),
            conn.ctrl.kato
        );
        Ok(0)
    }

    fn identify(&self, conn: &mut Connection, cmd: &Command, shutdown: &ShutdownToken) -> Handled {
        if cmd.cns() != CNS_CTRL {
            return Err(StatusCode::BadAttributes);
        }

        let page = IdentifyController::discovery(self.mode.subsystem_nqn())
            .encode()
            .map_err(|_| StatusCode::Internal)?;
        push_to_host(conn, &page, cmd.sgl, shutdown)
    }

    fn get_log_page(&self, conn: &mut Connection, cmd: &Command, shutdown: &ShutdownToken) -> Handled {
        if cmd.lid() != LID_DISCOVERY {
            return Err(StatusCode::InvalidLogPage);
        }

        let host = conn.host_nqn().unwrap_or_default().to_string();
        let (genctr, entries) = self.registry.visible_log(&host);
        let len = (cmd.sgl.len as usize).min(cmd.log_len());

        let log = encode_log(genctr, &entries, len).map_err(|e| {
            error!("Encoding discovery log for {} failed: {}", host, e);
            StatusCode::Internal
        })?;
        conn.ctrl.seen_generation = genctr;

        debug!(
            "Log page for {}: {} of {} entries, genctr {}",
            host,
            log.len().saturating_sub(crate::nvme::LOG_HEADER_SIZE) / crate::nvme::LOG_ENTRY_SIZE,
            entries.len(),
            genctr
        );
        push_to_host(conn, &log, KeyedSgl { len: len as u32, ..cmd.sgl }, shutdown)
    }

    fn resource_config(
        &self,
        fctype: FabricsType,
        conn: &mut Connection,
        cmd: &Command,
        shutdown: &ShutdownToken,
    ) -> Handled {
        let backend = match (&self.backend, self.mode) {
            (Some(backend), DispatchMode::Supervisory) => Arc::clone(backend),
            _ => return Err(StatusCode::InvalidOpcode),
        };

        let id = ConfigId::from_raw(cmd.command_id).ok_or(StatusCode::InvalidField)?;

        if fctype == FabricsType::ResourceConfigReset {
            if id != ConfigId::Reset {
                return Err(StatusCode::InvalidField);
            }
            backend.reset();
            info!("Configuration reset by {}", conn.peer());
            return Ok(0);
        }

        if fctype == FabricsType::ResourceConfigGet {
            let list = match id {
                ConfigId::GetNsDevices => NsDevice::encode_list(&backend.ns_devices()),
                ConfigId::GetTransports => TransportEntry::encode_list(&backend.transports()),
                _ => return Err(StatusCode::InvalidField),
            }
            .map_err(|_| StatusCode::Internal)?;
            return push_to_host(conn, &list, cmd.sgl, shutdown);
        }

        let len = (cmd.sgl.len as usize).min(PAGE_SIZE);
        let remote = KeyedSgl {
            len: len as u32,
            ..cmd.sgl
        }
        .remote();
        conn.rma_read(remote, shutdown).map_err(|e| {
            error!("Reading config payload from {} failed: {}", conn.peer(), e);
            StatusCode::WriteFault
        })?;

        let request = match ConfigRequest::decode(id, &conn.data()[..len]) {
            Ok(Some(request)) => request,
            Ok(None) => return Err(StatusCode::InvalidField),
            Err(e) => {
                warn!("Bad {:?} payload from {}: {}", id, conn.peer(), e);
                return Err(StatusCode::InvalidField);
            }
        };

        backend.apply(&request).map_err(|e| {
            warn!("{:?} rejected: {}", id, e);
            StatusCode::AccessDenied
        })?;
        info!("Applied {:?} from {}", id, conn.peer());
        Ok(0)
    }
}

fn property_set(conn: &mut Connection, cmd: &Command) -> Handled {
    if cmd.property_offset() != REG_CC {
        return Err(StatusCode::InvalidField);
    }

    conn.ctrl.csts = if cmd.property_value() == CC_ENABLE {
        CSTS_READY
    } else {
        CSTS_SHUTDOWN_COMPLETE
    };
    Ok(0)
}

fn property_get(conn: &Connection, cmd: &Command) -> Handled {
    match cmd.property_offset() {
        REG_CSTS => Ok(conn.ctrl.csts as u64),
        REG_CAP => Ok(CAP_VALUE),
        REG_VS => Ok(VS_VALUE),
        _ => Err(StatusCode::InvalidField),
    }
}

fn set_features(conn: &mut Connection, cmd: &Command) -> Handled {
    match cmd.fid() {
        FEAT_KATO => {
            conn.ctrl.kato = cmd.feature_value();
            Ok(0)
        }
        FEAT_ASYNC_EVENT => {
            conn.ctrl.aen_config = cmd.feature_value();
            Ok(0)
        }
        _ => Err(StatusCode::FeatureNotChangeable),
    }
}

fn get_features(conn: &Connection, cmd: &Command) -> Handled {
    match cmd.fid() {
        FEAT_ASYNC_EVENT => Ok(AEN_DISC_LOG_CHANGE as u64),
        FEAT_KATO => Ok(conn.ctrl.kato as u64),
        _ => Err(StatusCode::InvalidField),
    }
}

/// RMA-write `payload`, truncated to the host's buffer
///
/// Payloads larger than the connection's data page go through a buffer
/// registered for this transfer only.
fn push_to_host(
    conn: &mut Connection,
    payload: &[u8],
    sgl: KeyedSgl,
    shutdown: &ShutdownToken,
) -> Handled {
    let len = payload.len().min(sgl.len as usize);
    if len == 0 {
        return Ok(0);
    }
    let remote = KeyedSgl {
        len: len as u32,
        ..sgl
    }
    .remote();

    let written = if len <= PAGE_SIZE {
        conn.data_mut()[..len].copy_from_slice(&payload[..len]);
        conn.rma_write(remote, shutdown)
    } else {
        let mut buf = conn.alloc_buffer(len).map_err(|e| {
            error!("No buffer for {} byte transfer: {}", len, e);
            StatusCode::Internal
        })?;
        buf.as_mut_slice()[..len].copy_from_slice(&payload[..len]);
        conn.rma_write_from(&buf, remote, shutdown)
    };

    written.map_err(|e| {
        error!("RMA write to {} failed: {}", conn.peer(), e);
        StatusCode::WriteFault
    })?;
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::nvme::discovery::decode_log;
    use crate::nvme::{DiscoveryLogHeader, SubsysConfig, LOG_COUNT_LEN};
    use crate::registry::SubsystemAccess;
    use crate::testutil::{connected_pair, nvme_entry};
    use fabric_transport::{FabricAddr, LoopbackFabric};
    use std::collections::BTreeSet;

    const HOST_X: &str = "nqn.2014-08.org.nvmexpress:NVMf:uuid:host-x";
    const HOST_Y: &str = "nqn.2014-08.org.nvmexpress:NVMf:uuid:host-y";

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
        registry.update_log_pages(
            "t1",
            vec![
                nvme_entry("nqn.open", "10.0.0.5"),
                nvme_entry("nqn.restricted", "10.0.0.5"),
            ],
        );
        registry
    }

    fn complete(outcome: Outcome) -> Completion {
        match outcome {
            Outcome::Complete(cpl) => cpl,
            Outcome::Held => panic!("command unexpectedly held"),
        }
    }

    fn connect_cmd(host: &mut Connection, cntlid: u16, subnqn: &str, hostnqn: &str) -> Command {
        let payload = ConnectData {
            hostid: [7; 16],
            cntlid,
            subsysnqn: subnqn.into(),
            hostnqn: hostnqn.into(),
        }
        .encode()
        .unwrap();
        host.data_mut()[..payload.len()].copy_from_slice(&payload);
        Command::connect(1, 31, 120_000, host.data_sgl(payload.len()).unwrap())
    }

    fn connected(
        dispatcher: &Dispatcher,
        fabric: &LoopbackFabric,
        port: &str,
        hostnqn: &str,
    ) -> (Connection, Connection) {
        let (mut host, mut ctrl) = connected_pair(fabric, port);
        let cmd = connect_cmd(&mut host, 0xffff, DISCOVERY_NQN, hostnqn);
        let cpl = complete(dispatcher.dispatch(&mut ctrl, &cmd, &ShutdownToken::new()));
        assert!(cpl.status_code().is_success());
        (host, ctrl)
    }

    #[test]
    fn test_connect_handshake() {
        let fabric = LoopbackFabric::new();
        let dispatcher = Dispatcher::discovery(registry());
        let shutdown = ShutdownToken::new();
        let (mut host, mut ctrl) = connected_pair(&fabric, "6001");

        let cmd = connect_cmd(&mut host, 0xffff, DISCOVERY_NQN, HOST_X);
        let cpl = complete(dispatcher.dispatch(&mut ctrl, &cmd, &shutdown));
        assert_eq!(cpl.status, 0);
        assert_eq!(ctrl.host_nqn(), Some(HOST_X));
        assert_eq!(ctrl.ctrl.kato, 120_000);
    }

    #[test]
    fn test_connect_static_cntlid_rejected() {
        let fabric = LoopbackFabric::new();
        let dispatcher = Dispatcher::discovery(registry());
        let (mut host, mut ctrl) = connected_pair(&fabric, "6002");

        let cmd = connect_cmd(&mut host, 0x1234, DISCOVERY_NQN, HOST_X);
        let cpl = complete(dispatcher.dispatch(&mut ctrl, &cmd, &ShutdownToken::new()));
        assert_eq!(cpl.status_code(), StatusCode::ConnectInvalidParam);
        assert!(ctrl.is_connected());
        assert_eq!(ctrl.host_nqn(), None);

        let cmd = connect_cmd(&mut host, 0xffff, "nqn.not-a-discovery-subsystem", HOST_X);
        let cpl = complete(dispatcher.dispatch(&mut ctrl, &cmd, &ShutdownToken::new()));
        assert_eq!(cpl.status_code(), StatusCode::ConnectInvalidHost);
    }

    fn log_count(dispatcher: &Dispatcher, host: &mut Connection, ctrl: &mut Connection) -> DiscoveryLogHeader {
        let cmd = Command::get_log_page(2, LID_DISCOVERY, host.data_sgl(LOG_COUNT_LEN).unwrap());
        let cpl = complete(dispatcher.dispatch(ctrl, &cmd, &ShutdownToken::new()));
        assert!(cpl.status_code().is_success());
        DiscoveryLogHeader::decode(&host.data()[..LOG_COUNT_LEN]).unwrap()
    }

    #[test]
    fn test_log_page_count_per_host() {
        let fabric = LoopbackFabric::new();
        let registry = registry();
        let dispatcher = Dispatcher::discovery(registry.clone());

        let (mut host_x, mut ctrl_x) = connected(&dispatcher, &fabric, "6003", HOST_X);
        let header = log_count(&dispatcher, &mut host_x, &mut ctrl_x);
        assert_eq!(header.numrec, 2);
        assert_eq!(header.genctr, registry.generation());

        let (mut host_y, mut ctrl_y) = connected(&dispatcher, &fabric, "6004", HOST_Y);
        assert_eq!(log_count(&dispatcher, &mut host_y, &mut ctrl_y).numrec, 1);
    }

    #[test]
    fn test_full_log_page() {
        let fabric = LoopbackFabric::new();
        let dispatcher = Dispatcher::discovery(registry());
        let (mut host, mut ctrl) = connected(&dispatcher, &fabric, "6005", HOST_X);

        let len = crate::nvme::LOG_HEADER_SIZE + 2 * crate::nvme::LOG_ENTRY_SIZE;
        let cmd = Command::get_log_page(3, LID_DISCOVERY, host.data_sgl(len).unwrap());
        let cpl = complete(dispatcher.dispatch(&mut ctrl, &cmd, &ShutdownToken::new()));
        assert!(cpl.status_code().is_success());

        let (header, entries) = decode_log(&host.data()[..len]).unwrap();
        assert_eq!(header.numrec, 2);
        let nqns: Vec<&str> = entries.iter().map(|e| e.subnqn.as_str()).collect();
        assert_eq!(nqns, ["nqn.open", "nqn.restricted"]);

        let bad = Command::get_log_page(4, 0x02, host.data_sgl(len).unwrap());
        let cpl = complete(dispatcher.dispatch(&mut ctrl, &bad, &ShutdownToken::new()));
        assert_eq!(cpl.status_code(), StatusCode::InvalidLogPage);
    }

    #[test]
    fn test_properties() {
        let fabric = LoopbackFabric::new();
        let dispatcher = Dispatcher::discovery(registry());
        let shutdown = ShutdownToken::new();
        let (_host, mut ctrl) = connected(&dispatcher, &fabric, "6006", HOST_X);

        let set = Command::property_set(5, REG_CC, CC_ENABLE);
        assert!(complete(dispatcher.dispatch(&mut ctrl, &set, &shutdown))
            .status_code()
            .is_success());

        let csts = complete(dispatcher.dispatch(&mut ctrl, &Command::property_get(6, REG_CSTS), &shutdown));
        assert_eq!(csts.result, CSTS_READY as u64);
        let cap = complete(dispatcher.dispatch(&mut ctrl, &Command::property_get(7, REG_CAP), &shutdown));
        assert_eq!(cap.result, CAP_VALUE);

        let disable = Command::property_set(8, REG_CC, crate::nvme::CC_DISABLE);
        complete(dispatcher.dispatch(&mut ctrl, &disable, &shutdown));
        assert_eq!(ctrl.ctrl.csts, CSTS_SHUTDOWN_COMPLETE);

        let bogus = Command::property_get(9, 0x30);
        assert_eq!(
            complete(dispatcher.dispatch(&mut ctrl, &bogus, &shutdown)).status_code(),
            StatusCode::InvalidField
        );
    }

    #[test]
    fn test_identify() {
        let fabric = LoopbackFabric::new();
        let dispatcher = Dispatcher::discovery(registry());
        let shutdown = ShutdownToken::new();
        let (mut host, mut ctrl) = connected(&dispatcher, &fabric, "6007", HOST_X);

        let cmd = Command::identify(10, CNS_CTRL, host.data_sgl(IdentifyController::SIZE).unwrap());
        assert!(complete(dispatcher.dispatch(&mut ctrl, &cmd, &shutdown))
            .status_code()
            .is_success());
        let id = IdentifyController::decode(host.data()).unwrap();
        assert_eq!(id.subnqn, DISCOVERY_NQN);

        let ns = Command::identify(11, 0, host.data_sgl(IdentifyController::SIZE).unwrap());
        assert_eq!(
            complete(dispatcher.dispatch(&mut ctrl, &ns, &shutdown)).status_code(),
            StatusCode::BadAttributes
        );
    }

    #[test]
    fn test_features_and_async_event() {
        let fabric = LoopbackFabric::new();
        let registry = registry();
        let dispatcher = Dispatcher::discovery(registry.clone());
        let shutdown = ShutdownToken::new();
        let (_host, mut ctrl) = connected(&dispatcher, &fabric, "6008", HOST_X);

        let get = Command::get_features(12, FEAT_ASYNC_EVENT);
        assert_eq!(
            complete(dispatcher.dispatch(&mut ctrl, &get, &shutdown)).result,
            AEN_DISC_LOG_CHANGE as u64
        );

        let kato = Command::set_features(13, FEAT_KATO, 30_000);
        complete(dispatcher.dispatch(&mut ctrl, &kato, &shutdown));
        assert_eq!(ctrl.ctrl.kato, 30_000);

        let fixed = Command::set_features(14, 0x07, 1);
        assert_eq!(
            complete(dispatcher.dispatch(&mut ctrl, &fixed, &shutdown)).status_code(),
            StatusCode::FeatureNotChangeable
        );

        let aer = Command::async_event_request(15);
        assert_eq!(dispatcher.dispatch(&mut ctrl, &aer, &shutdown), Outcome::Held);
        assert!(dispatcher.pending_event(&mut ctrl).is_none());

        let enable = Command::set_features(16, FEAT_ASYNC_EVENT, AEN_DISC_LOG_CHANGE);
        complete(dispatcher.dispatch(&mut ctrl, &enable, &shutdown));
        assert!(dispatcher.pending_event(&mut ctrl).is_none());

        registry.update_log_pages("t1", vec![nvme_entry("nqn.open", "10.0.0.5")]);
        let event = dispatcher.pending_event(&mut ctrl).unwrap();
        assert_eq!(event.command_id, 15);
        assert_eq!(event.result, AEN_DISC_LOG_RESULT);
        assert!(dispatcher.pending_event(&mut ctrl).is_none());
    }

    #[test]
    fn test_resource_config_needs_supervisory_mode() {
        let fabric = LoopbackFabric::new();
        let dispatcher = Dispatcher::discovery(registry());
        let (_host, mut ctrl) = connected(&dispatcher, &fabric, "6009", HOST_X);

        let cmd = Command::resource_config(
            FabricsType::ResourceConfigReset,
            ConfigId::Reset as u16,
            KeyedSgl::default(),
        );
        assert_eq!(
            complete(dispatcher.dispatch(&mut ctrl, &cmd, &ShutdownToken::new())).status_code(),
            StatusCode::InvalidOpcode
        );
    }

    #[test]
    fn test_resource_config_supervisory() {
        let fabric = LoopbackFabric::new();
        let backend = Arc::new(MemoryBackend::new(
            vec![NsDevice { devid: 0, nsid: 1 }],
            Vec::new(),
        ));
        let dispatcher = Dispatcher::supervisory(registry(), backend.clone());
        let shutdown = ShutdownToken::new();
        let (mut host, mut ctrl) = connected(&dispatcher, &fabric, "6010", HOST_X);

        let request = ConfigRequest::SetSubsys(SubsysConfig {
            subnqn: "nqn.new".into(),
            allow_any: true,
        });
        let payload = request.encode().unwrap();
        host.data_mut()[..payload.len()].copy_from_slice(&payload);
        let set = Command::resource_config(
            FabricsType::ResourceConfigSet,
            request.id() as u16,
            host.data_sgl(payload.len()).unwrap(),
        );
        assert!(complete(dispatcher.dispatch(&mut ctrl, &set, &shutdown))
            .status_code()
            .is_success());
        assert_eq!(backend.subsystems(), vec!["nqn.new".to_string()]);

        let get = Command::resource_config(
            FabricsType::ResourceConfigGet,
            ConfigId::GetNsDevices as u16,
            host.data_sgl(PAGE_SIZE).unwrap(),
        );
        assert!(complete(dispatcher.dispatch(&mut ctrl, &get, &shutdown))
            .status_code()
            .is_success());
        assert_eq!(
            NsDevice::decode_list(host.data()).unwrap(),
            vec![NsDevice { devid: 0, nsid: 1 }]
        );

        let unknown = Command::resource_config(FabricsType::ResourceConfigGet, 0x20, host.data_sgl(16).unwrap());
        assert_eq!(
            complete(dispatcher.dispatch(&mut ctrl, &unknown, &shutdown)).status_code(),
            StatusCode::InvalidField
        );

        let missing = ConfigRequest::DelHost("nqn.nobody".into());
        let payload = missing.encode().unwrap();
        host.data_mut()[..payload.len()].copy_from_slice(&payload);
        let del = Command::resource_config(
            FabricsType::ResourceConfigSet,
            missing.id() as u16,
            host.data_sgl(payload.len()).unwrap(),
        );
        assert_eq!(
            complete(dispatcher.dispatch(&mut ctrl, &del, &shutdown)).status_code(),
            StatusCode::AccessDenied
        );

        let reset = Command::resource_config(
            FabricsType::ResourceConfigReset,
            ConfigId::Reset as u16,
            KeyedSgl::default(),
        );
        complete(dispatcher.dispatch(&mut ctrl, &reset, &shutdown));
        assert!(backend.subsystems().is_empty());
    }

    #[test]
    fn test_reset_needs_reset_id() {
        let fabric = LoopbackFabric::new();
        let backend = Arc::new(MemoryBackend::new(Vec::new(), Vec::new()));
        backend
            .set_subsys(&SubsysConfig {
                subnqn: "nqn.kept".into(),
                allow_any: false,
            })
            .unwrap();
        let dispatcher = Dispatcher::supervisory(registry(), backend.clone());
        let shutdown = ShutdownToken::new();
        let (_host, mut ctrl) = connected(&dispatcher, &fabric, "6012", HOST_X);

        for id in [ConfigId::GetNsDevices as u16, 0x20] {
            let cmd = Command::resource_config(FabricsType::ResourceConfigReset, id, KeyedSgl::default());
            assert_eq!(
                complete(dispatcher.dispatch(&mut ctrl, &cmd, &shutdown)).status_code(),
                StatusCode::InvalidField
            );
        }
        assert_eq!(backend.subsystems(), vec!["nqn.kept".to_string()]);

        let reset = Command::resource_config(
            FabricsType::ResourceConfigReset,
            ConfigId::Reset as u16,
            KeyedSgl::default(),
        );
        assert!(complete(dispatcher.dispatch(&mut ctrl, &reset, &shutdown))
            .status_code()
            .is_success());
        assert!(backend.subsystems().is_empty());
    }

    #[test]
    fn test_unknown_opcode() {
        let fabric = LoopbackFabric::new();
        let dispatcher = Dispatcher::discovery(registry());
        let (_host, mut ctrl) = connected(&dispatcher, &fabric, "6011", HOST_X);

        let cmd = Command {
            opcode: 0x01,
            command_id: 20,
            ..Default::default()
        };
        assert_eq!(
            complete(dispatcher.dispatch(&mut ctrl, &cmd, &ShutdownToken::new())).status_code(),
            StatusCode::InvalidOpcode
        );
    }
}
