//! Discovery controller daemon
//!
//! Serves the discovery log to hosts on every configured interface and
//! keeps each configured target's discovery queue alive so the log stays
//! current.
//!
//! Usage: demd [-d|--debug] [config.json]

use anyhow::{bail, Context, Result};
use log::{info, warn};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use dem_core::config::DemConfig;
use dem_core::nvme::{NsDevice, TransportEntry};
use dem_core::service::ServiceOptions;
use dem_core::{
    ConfigBackend, Dispatcher, Interface, InterfaceHandle, MemoryBackend, TargetRefresher,
    TargetRegistry,
};
use fabric_transport::{create_transport, ShutdownToken, Transport, TransportType};

/// Poll period of the main thread while waiting for shutdown
const SHUTDOWN_POLL_MS: u64 = 200;

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

/// One transport instance per fabric type, shared by listeners and targets
#[derive(Default)]
struct Transports {
    by_type: BTreeMap<TransportType, Arc<dyn Transport>>,
}

impl Transports {
    fn get(&mut self, trtype: TransportType) -> Result<Arc<dyn Transport>> {
        if let Some(transport) = self.by_type.get(&trtype) {
            return Ok(Arc::clone(transport));
        }
        let transport = create_transport(trtype)
            .with_context(|| format!("Failed to create {} transport", trtype))?;
        self.by_type.insert(trtype, Arc::clone(&transport));
        Ok(transport)
    }
}

/// Backend served on supervisory interfaces
fn supervisory_backend(config: &DemConfig) -> Arc<dyn ConfigBackend> {
    let devices = vec![NsDevice {
        devid: NsDevice::NULLB_DEVID,
        nsid: 0,
    }];
    let transports = config
        .interfaces
        .iter()
        .map(|iface| TransportEntry {
            trtype: iface.addr.trtype.trtype(),
            adrfam: iface.addr.adrfam.adrfam(),
            traddr: iface.addr.traddr.clone(),
        })
        .collect();
    Arc::new(MemoryBackend::new(devices, transports))
}

struct Demd {
    config: DemConfig,
    registry: TargetRegistry,
    transports: Transports,
}

impl Demd {
    fn new(config: DemConfig) -> Self {
        let registry = TargetRegistry::new();
        config.populate(&registry);

        info!(
            "Config: {} interfaces, {} targets, host {}",
            config.interfaces.len(),
            config.targets.len(),
            config.host_nqn
        );

        Self {
            config,
            registry,
            transports: Transports::default(),
        }
    }

    fn start_interfaces(&mut self, shutdown: &ShutdownToken) -> Result<Vec<InterfaceHandle>> {
        let backend = supervisory_backend(&self.config);
        let mut handles = Vec::new();

        for iface in &self.config.interfaces {
            let transport = self.transports.get(iface.addr.trtype)?;
            let dispatcher = if iface.supervisory {
                Dispatcher::supervisory(self.registry.clone(), Arc::clone(&backend))
            } else {
                Dispatcher::discovery(self.registry.clone())
            };
            let options = ServiceOptions {
                delay: Duration::from_millis(self.config.service_delay_ms),
                retry_count: dispatcher.mode().retry_count(),
            };

            let handle = Interface::new(iface.addr.clone(), transport, dispatcher)
                .with_options(options)
                .start(shutdown)
                .with_context(|| format!("Failed to start interface {}", iface.addr))?;
            info!(
                "Interface {} up ({})",
                handle.addr,
                if iface.supervisory { "supervisory" } else { "discovery" }
            );
            handles.push(handle);
        }
        Ok(handles)
    }

    /// One refresher thread per transport type in use by targets
    fn start_refreshers(&mut self, shutdown: &ShutdownToken) -> Result<Vec<JoinHandle<()>>> {
        let mut refreshers: BTreeMap<TransportType, TargetRefresher> = BTreeMap::new();

        for target in &self.config.targets {
            let refresher = match refreshers.entry(target.addr.trtype) {
                Entry::Occupied(slot) => slot.into_mut(),
                Entry::Vacant(slot) => {
                    let transport = self.transports.get(target.addr.trtype)?;
                    slot.insert(TargetRefresher::new(
                        self.registry.clone(),
                        transport,
                        &self.config.host_nqn,
                    ))
                }
            };
            refresher.add_target(&target.alias, target.addr.clone(), target.refresh);
        }

        let mut handles = Vec::new();
        for (trtype, refresher) in refreshers {
            let token = shutdown.clone();
            let handle = thread::Builder::new()
                .name(format!("dem-refresh-{}", trtype))
                .spawn(move || refresher.run(&token))
                .context("Failed to spawn refresh thread")?;
            handles.push(handle);
        }
        Ok(handles)
    }

    fn run(&mut self, shutdown: &ShutdownToken) -> Result<()> {
        let interfaces = match self.start_interfaces(shutdown) {
            Ok(interfaces) => interfaces,
            Err(e) => {
                shutdown.trigger();
                return Err(e);
            }
        };
        let refreshers = match self.start_refreshers(shutdown) {
            Ok(refreshers) => refreshers,
            Err(e) => {
                shutdown.trigger();
                interfaces.into_iter().for_each(InterfaceHandle::join);
                return Err(e);
            }
        };

        info!("demd running, press Ctrl+C to exit");
        while !shutdown.is_triggered() {
            thread::sleep(Duration::from_millis(SHUTDOWN_POLL_MS));
        }

        info!("Shutting down");
        for handle in refreshers {
            if handle.join().is_err() {
                warn!("Refresh thread panicked");
            }
        }
        for handle in interfaces {
            handle.join();
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let args = match parse_args(&args) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}", e);
            eprintln!("Usage: demd [-d|--debug] [config.json]");
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

    info!("demd starting");

    let config = match &args.config {
        Some(path) => DemConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => {
            warn!("No config file given, serving defaults with no targets");
            DemConfig::default()
        }
    };
    if args.debug {
        let json = serde_json::to_string_pretty(&config).context("Failed to render config")?;
        log::debug!("Effective config:\n{}", json);
    }

    let shutdown = ShutdownToken::new();
    let token = shutdown.clone();
    ctrlc::set_handler(move || token.trigger()).context("Failed to set Ctrl+C handler")?;

    let mut demd = Demd::new(config);
    demd.run(&shutdown)?;

    info!("demd stopped");
    Ok(())
}
