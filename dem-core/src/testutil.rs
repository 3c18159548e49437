//! Loopback fixtures shared by the unit tests

use fabric_transport::{FabricAddr, LoopbackFabric, ShutdownToken, Transport};

use crate::connection::{Connection, NVMF_DQ_DEPTH};
use crate::nvme::{DiscoveryLogEntry, RdmaTsas, SubsystemType};

/// Host and controller ends of one loopback association
pub(crate) fn connected_pair(fabric: &LoopbackFabric, port: &str) -> (Connection, Connection) {
    let addr = FabricAddr::loopback("127.0.0.1", port);
    let mut listener = fabric.init_listener(&addr).unwrap();

    let client_fabric = fabric.clone();
    let host = std::thread::spawn(move || {
        let ep = client_fabric
            .client_connect(&addr, &[], NVMF_DQ_DEPTH, &ShutdownToken::new())
            .unwrap();
        Connection::new(ep).unwrap()
    });

    let shutdown = ShutdownToken::new();
    let request = loop {
        if let Some(req) = listener.wait_for_connection(&shutdown).unwrap() {
            break req;
        }
    };
    let ctrl = Connection::new(request.accept(NVMF_DQ_DEPTH, &shutdown).unwrap()).unwrap();
    (host.join().unwrap(), ctrl)
}

pub(crate) fn nvme_entry(subnqn: &str, traddr: &str) -> DiscoveryLogEntry {
    DiscoveryLogEntry {
        trtype: 1,
        adrfam: 1,
        subtype: SubsystemType::Nvme,
        treq: 0,
        portid: 1,
        cntlid: 0xffff,
        asqsz: 32,
        trsvcid: "4420".into(),
        subnqn: subnqn.into(),
        traddr: traddr.into(),
        tsas: RdmaTsas::default(),
    }
}
