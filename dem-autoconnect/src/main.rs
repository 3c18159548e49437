//! Host auto-connect daemon
//!
//! Follows one discovery controller and asks the kernel to connect every
//! subsystem it reports that the host is not yet connected to.
//!
//! Usage: dem-autoconnect [-d|--debug] [config.json]

use anyhow::{bail, Context, Result};
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dem_core::config::AutoConnectConfig;
use dem_core::{DiscoveryClient, HostConnector, SysfsConnector};
use fabric_transport::{create_transport, ShutdownToken, Transport};

#[derive(Debug, Default, PartialEq, Eq)]
struct Args {
    config: Option<PathBuf>,
    debug: bool,
}

fn parse_args(args: &[String]) -> Result<Args> {
    let mut parsed = Args::default();

    for arg in args.iter().skip(1) {
        match arg.as_str() {
            "-d" | "--debug" => parsed.debug = true,
            flag if flag.starts_with('-') => bail!("unknown option '{}'", flag),
            path => {
                if parsed.config.is_some() {
                    bail!("more than one config file given");
                }
                parsed.config = Some(PathBuf::from(path));
            }
        }
    }
    Ok(parsed)
}

/// Run the discovery client until shutdown
fn follow(
    config: &AutoConnectConfig,
    transport: Arc<dyn Transport>,
    connector: &dyn HostConnector,
    shutdown: &ShutdownToken,
) -> DiscoveryClient {
    let mut client = DiscoveryClient::new(transport, config.discovery.clone(), &config.host_nqn)
        .with_tick(Duration::from_millis(config.tick_ms));
    client.run(connector, shutdown);
    client
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let args = match parse_args(&args) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}", e);
            eprintln!("Usage: dem-autoconnect [-d|--debug] [config.json]");
            std::process::exit(1);
        }
    };

    env_logger::Builder::from_default_env()
        .filter_level(if args.debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    let config = match &args.config {
        Some(path) => AutoConnectConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => {
            warn!("No config file given, using defaults");
            AutoConnectConfig::default()
        }
    };
    if args.debug {
        let json = serde_json::to_string_pretty(&config).context("Failed to render config")?;
        log::debug!("Effective config:\n{}", json);
    }

    info!(
        "dem-autoconnect starting: discovery controller {}, host {}",
        config.discovery, config.host_nqn
    );

    let transport = create_transport(config.discovery.trtype)
        .with_context(|| format!("Failed to create {} transport", config.discovery.trtype))?;

    let shutdown = ShutdownToken::new();
    let token = shutdown.clone();
    ctrlc::set_handler(move || token.trigger()).context("Failed to set Ctrl+C handler")?;

    let connector = SysfsConnector::default();
    let client = follow(&config, transport, &connector, &shutdown);

    info!(
        "dem-autoconnect stopped, {} log entries cached",
        client.cache().len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dem_core::discovery::OsController;
    use dem_core::nvme::{DiscoveryLogEntry, RdmaTsas, SubsystemType};
    use dem_core::{Dispatcher, Interface, SubsystemAccess, TargetRegistry};
    use fabric_transport::{FabricAddr, LoopbackFabric, TransportType};
    use std::sync::Mutex;
    use std::thread;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    /// Records connect requests instead of touching the kernel
    #[derive(Default)]
    struct Recorder {
        connected: Mutex<Vec<DiscoveryLogEntry>>,
    }

    impl HostConnector for Recorder {
        fn connected(&self) -> dem_core::Result<Vec<OsController>> {
            Ok(Vec::new())
        }

        fn connect(&self, entry: &DiscoveryLogEntry, _host_nqn: &str) -> dem_core::Result<()> {
            self.connected.lock().unwrap().push(entry.clone());
            Ok(())
        }
    }

    #[test]
    fn test_autoconnect_config_default() {
        let config = AutoConnectConfig::default();
        assert_eq!(config.discovery.trtype, TransportType::Rdma);
        assert_eq!(config.discovery.trsvcid, "4422");
        assert_eq!(config.tick_ms, 480);
    }

    #[test]
    fn test_parse_args() {
        let parsed = parse_args(&args(&["dem-autoconnect", "--debug"])).unwrap();
        assert!(parsed.debug);
        assert!(parsed.config.is_none());
        assert!(parse_args(&args(&["dem-autoconnect", "-x"])).is_err());
    }

    #[test]
    fn test_follow_connects_reported_subsystem() {
        let fabric = LoopbackFabric::new();
        let addr = FabricAddr::loopback("127.0.0.1", "4911");

        let registry = TargetRegistry::new();
        registry.add_target("array1", FabricAddr::loopback("127.0.0.1", "4420"));
        registry.set_subsystem(
            "array1",
            "nqn.a",
            SubsystemAccess {
                allow_any: true,
                ..Default::default()
            },
        );
        registry.update_log_pages(
            "array1",
            vec![DiscoveryLogEntry {
                trtype: TransportType::Rdma.trtype(),
                adrfam: 1,
                subtype: SubsystemType::Nvme,
                treq: 0,
                portid: 1,
                cntlid: 0xffff,
                asqsz: 32,
                trsvcid: "4420".into(),
                subnqn: "nqn.a".into(),
                traddr: "10.0.0.5".into(),
                tsas: RdmaTsas::default(),
            }],
        );

        let server_shutdown = ShutdownToken::new();
        let server = Interface::new(
            addr.clone(),
            Arc::new(fabric.clone()),
            Dispatcher::discovery(registry),
        )
        .start(&server_shutdown)
        .unwrap();

        let config = AutoConnectConfig {
            discovery: addr,
            tick_ms: 10,
            ..Default::default()
        };
        let recorder = Arc::new(Recorder::default());
        let shutdown = ShutdownToken::new();

        let client_recorder = Arc::clone(&recorder);
        let client_token = shutdown.clone();
        let transport: Arc<dyn Transport> = Arc::new(fabric.clone());
        let client = thread::spawn(move || {
            follow(&config, transport, client_recorder.as_ref(), &client_token)
        });

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while recorder.connected.lock().unwrap().is_empty() {
            assert!(std::time::Instant::now() < deadline, "subsystem never connected");
            thread::sleep(Duration::from_millis(10));
        }

        shutdown.trigger();
        let client = client.join().unwrap();
        assert_eq!(client.cache().len(), 1);
        assert_eq!(recorder.connected.lock().unwrap()[0].subnqn, "nqn.a");

        server_shutdown.trigger();
        server.join();
    }
}
