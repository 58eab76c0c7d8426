//! Fleet supervisor
//!
//! Turns the merged settings into running device servers and tears them down
//! again. Startup runs in three steps:
//!
//! 1. every device is resolved, built and given its record concurrently
//! 2. ports are assigned one server at a time, servers with a recorded port first
//! 3. certificates are provisioned and servers started concurrently
//!
//! A failure in any step drops that one server. Shutdown runs exactly once no
//! matter how many callers ask for it.

use chrono::Utc;
use labfleet_core::{
    CertificateError, CertificateManager, DeviceDescriptor, DeviceError, DeviceHandler,
    PortAllocator, PortConflictError, RecordError, RecordStore, ServerIdentity, ServerPhase,
    ServerRecord,
};
use labfleet_core::{CetoniSection, Device};
use labfleet_handlers::cetoni::{CetoniBus, CetoniConfiguration, CetoniError};
use labfleet_registry::{scan_devices, CapabilityRegistry, UnknownDeviceType};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{oneshot, OnceCell};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::api::{self, DeviceApi};
use crate::config::Settings;
use crate::server::{DeviceServer, ServerError};
use crate::state::{FleetState, RunningServer};
use crate::traffic::ActivityTracker;
use crate::watchdog::{Trigger, Watchdog, WatchdogLimits};

/// Fleet-wide startup failure
#[derive(Error, Debug)]
pub enum RunError {
    #[error("No device server could be started and the configuration does not declare an empty fleet")]
    NoDevices,
    #[error("CETONI device configuration {path} could not be initialised: {source}")]
    Cetoni {
        path: PathBuf,
        #[source]
        source: CetoniError,
    },
}

/// Why a single server was removed from the fleet during startup
#[derive(Error, Debug)]
pub enum StartupError {
    #[error(transparent)]
    UnknownDeviceType(#[from] UnknownDeviceType),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error(transparent)]
    Certificate(#[from] CertificateError),
    #[error(transparent)]
    PortConflict(#[from] PortConflictError),
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error("Record {0} has no server UUID")]
    MissingUuid(PathBuf),
    #[error("Startup task failed: {0}")]
    Task(#[from] JoinError),
}

/// Failure while releasing part of the fleet
#[derive(Error, Debug)]
pub enum ShutdownError {
    #[error("Failed to stop device {server}: {source}")]
    Device {
        server: String,
        #[source]
        source: DeviceError,
    },
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error("Failed to close record {path}: {source}")]
    Record {
        path: PathBuf,
        #[source]
        source: RecordError,
    },
    #[error("Failed to remove readiness marker {path}: {source}")]
    Marker {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Outcome of a successful startup
#[derive(Debug)]
pub struct StartReport {
    pub running: Vec<ServerIdentity>,
    pub failed: Vec<String>,
    /// Fires when the watchdog decides the host has to go down
    pub watchdog: Option<oneshot::Receiver<Trigger>>,
}

#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Servers in the order they were stopped
    pub stopped: Vec<String>,
    pub errors: Vec<ShutdownError>,
}

/// A server that has a device and a record but no network identity yet
struct Prepared {
    index: usize,
    descriptor: DeviceDescriptor,
    device: Arc<dyn Device>,
    record: Arc<ServerRecord>,
}

impl Prepared {
    fn name(&self) -> &str {
        &self.descriptor.name
    }
}

/// Shared pieces each concurrent startup task needs
#[derive(Clone)]
struct LaunchContext {
    certificates: Arc<CertificateManager>,
    server_ip: std::net::IpAddr,
    base_port: u16,
    workers: usize,
    discoverable: bool,
}

pub struct Supervisor {
    settings: Settings,
    registry: Arc<CapabilityRegistry>,
    store: Arc<RecordStore>,
    ports: PortAllocator,
    certificates: Arc<CertificateManager>,
    fleet: FleetState,
    bus: Mutex<Option<Arc<CetoniBus>>>,
    watchdog: Mutex<Option<Watchdog>>,
    shutdown: OnceCell<ShutdownReport>,
}

impl Supervisor {
    pub fn new(settings: Settings, registry: Arc<CapabilityRegistry>) -> Self {
        let store = Arc::new(RecordStore::new(settings.record_dir.clone()));
        let certificates = Arc::new(CertificateManager::new(
            settings.inventory.options.regenerate_certificates,
        ));
        Self {
            settings,
            registry,
            store,
            ports: PortAllocator::new(),
            certificates,
            fleet: FleetState::new(),
            bus: Mutex::new(None),
            watchdog: Mutex::new(None),
            shutdown: OnceCell::new(),
        }
    }

    /// Bring up every server the settings describe
    ///
    /// Servers that fail are logged and left out. An error is returned when the
    /// fleet as a whole is unusable; servers that did start stay up until
    /// [`Supervisor::shutdown`] is called.
    pub async fn start(&self) -> Result<StartReport, RunError> {
        if let Some(e) = self.remove_marker() {
            warn!(error = %e, "Cannot remove stale readiness marker");
        }
        let inventory = &self.settings.inventory;

        let mut cetoni_failure = None;
        let cetoni_devices = match &inventory.cetoni {
            Some(section) => match self.open_cetoni(section).await {
                Ok(devices) => devices,
                Err(e) => {
                    error!(error = %e, "CETONI device configuration unavailable");
                    cetoni_failure = Some(e);
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        let mut plan = merge_sources([cetoni_devices, inventory.sorted_devices()]);
        if inventory.options.scan_devices {
            let existing: Vec<String> = plan.iter().map(|d| d.name.clone()).collect();
            plan.extend(scan_devices(&self.registry, &existing).await);
        }
        info!(devices = plan.len(), "Starting fleet");

        let mut failed = Vec::new();
        let prepared = self.prepare_all(plan, &mut failed).await;
        let assigned = self.assign_ports(prepared, &mut failed);

        let bus = self.bus.lock().clone();
        if let Some(bus) = bus {
            if let Err(source) = bus.start() {
                error!(error = %source, "Cannot start CETONI bus");
                if let Some(section) = &inventory.cetoni {
                    cetoni_failure.get_or_insert(RunError::Cetoni {
                        path: section.device_config_path.clone(),
                        source,
                    });
                }
            }
        }

        self.launch_all(assigned, &mut failed).await;

        if let Some(e) = cetoni_failure {
            return Err(e);
        }
        if self.fleet.is_empty() && !inventory.is_explicitly_empty() {
            return Err(RunError::NoDevices);
        }

        let watchdog = self.spawn_watchdog();
        let running = self.fleet.identities();
        if !failed.is_empty() {
            warn!(
                failed = failed.len(),
                "Not every server started, readiness marker not created"
            );
        } else if !running.is_empty() {
            self.create_marker();
        }
        info!(
            running = running.len(),
            failed = failed.len(),
            "Fleet started"
        );
        Ok(StartReport {
            running,
            failed,
            watchdog,
        })
    }

    async fn open_cetoni(&self, section: &CetoniSection) -> Result<Vec<DeviceDescriptor>, RunError> {
        let path = section.device_config_path.clone();
        let load_path = path.clone();
        let loaded = tokio::task::spawn_blocking(move || {
            let config = CetoniConfiguration::load(&load_path)?;
            let bus = CetoniBus::open(&config)?;
            Ok::<_, CetoniError>((config, bus))
        })
        .await;

        match loaded {
            Ok(Ok((config, bus))) => {
                info!(
                    config = %config.name,
                    devices = config.devices.len(),
                    battery_powered = config.battery_powered,
                    "Loaded CETONI device configuration"
                );
                *self.bus.lock() = Some(Arc::new(bus));
                Ok(config.devices)
            }
            Ok(Err(source)) => Err(RunError::Cetoni { path, source }),
            Err(e) => Err(RunError::Cetoni {
                path,
                source: CetoniError::Bus(e.to_string()),
            }),
        }
    }

    async fn prepare_all(
        &self,
        plan: Vec<DeviceDescriptor>,
        failed: &mut Vec<String>,
    ) -> Vec<Prepared> {
        let simulate_missing = self.settings.inventory.options.simulate_missing;
        let mut tasks = JoinSet::new();
        let mut pending = HashSet::new();
        for (index, descriptor) in plan.into_iter().enumerate() {
            let registry = self.registry.clone();
            let store = self.store.clone();
            let name = descriptor.name.clone();
            pending.insert(name.clone());
            tasks.spawn(async move {
                let result = prepare(index, descriptor, &registry, store, simulate_missing).await;
                (name, result)
            });
        }

        let mut prepared = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, Ok(p))) => {
                    pending.remove(&name);
                    prepared.push(p);
                }
                Ok((name, Err(e))) => {
                    pending.remove(&name);
                    error!(server = %name, error = %e, "Removing server from fleet");
                    failed.push(name);
                }
                Err(e) => error!(error = %e, "Startup task failed"),
            }
        }
        // whatever is left belonged to a task that panicked or was cancelled
        for name in pending {
            error!(server = %name, "Removing server from fleet after failed startup task");
            failed.push(name);
        }
        prepared.sort_by_key(|p| p.index);
        prepared
    }

    /// Port recorded by an earlier run, unless the base port moved on the command line
    fn previous_port(&self, server: &str, record: &ServerRecord) -> Option<u16> {
        let port = record.port()?;
        let options = &self.settings.inventory.options;
        if options.base_port_overridden && record.base_port() != Some(options.server_base_port) {
            info!(
                server,
                recorded = port,
                base_port = options.server_base_port,
                "Base port changed, ignoring recorded port"
            );
            return None;
        }
        Some(port)
    }

    fn assign_ports(
        &self,
        prepared: Vec<Prepared>,
        failed: &mut Vec<String>,
    ) -> Vec<(Prepared, u16)> {
        let base_port = self.settings.inventory.options.server_base_port;
        let (mut ordered, fresh): (Vec<_>, Vec<_>) = prepared
            .into_iter()
            .map(|p| {
                let previous = self.previous_port(p.name(), &p.record);
                (p, previous)
            })
            .partition(|(_, previous)| previous.is_some());
        ordered.extend(fresh);

        let mut assigned = Vec::new();
        for (p, previous) in ordered {
            match self.ports.assign(p.name(), p.index, base_port, previous) {
                Ok(port) => {
                    debug!(server = %p.name(), port, phase = %ServerPhase::PortAssigned, "Phase change");
                    assigned.push((p, port));
                }
                Err(e) => {
                    error!(server = %p.name(), error = %e, "Removing server from fleet");
                    failed.push(p.descriptor.name.clone());
                }
            }
        }
        debug!(ports = ?self.ports.claimed(), "Ports assigned");
        assigned.sort_by_key(|(p, _)| p.index);
        assigned
    }

    async fn launch_all(&self, assigned: Vec<(Prepared, u16)>, failed: &mut Vec<String>) {
        let options = &self.settings.inventory.options;
        let ctx = LaunchContext {
            certificates: self.certificates.clone(),
            server_ip: self.settings.server_ip,
            base_port: options.server_base_port,
            workers: self.settings.workers,
            discoverable: options.enable_discovery,
        };

        let mut tasks = JoinSet::new();
        let mut pending = HashMap::new();
        for (prepared, port) in assigned {
            let ctx = ctx.clone();
            pending.insert(prepared.descriptor.name.clone(), port);
            tasks.spawn(async move {
                let name = prepared.descriptor.name.clone();
                (name, port, launch(ctx, prepared, port).await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, _, Ok(running))) => {
                    pending.remove(&name);
                    self.fleet.publish(running);
                }
                Ok((name, port, Err(e))) => {
                    pending.remove(&name);
                    error!(server = %name, port, error = %e, "Removing server from fleet");
                    self.ports.release(port);
                    failed.push(name);
                }
                Err(e) => error!(error = %e, "Startup task failed"),
            }
        }
        for (name, port) in pending {
            error!(server = %name, port, "Removing server from fleet after failed startup task");
            self.ports.release(port);
            failed.push(name);
        }
    }

    fn spawn_watchdog(&self) -> Option<oneshot::Receiver<Trigger>> {
        let monitored = self.fleet.monitored();
        if monitored.is_empty() {
            return None;
        }
        let limits = self
            .settings
            .inventory
            .cetoni
            .as_ref()
            .map(WatchdogLimits::from)
            .unwrap_or_default();
        let (fired, trigger) = oneshot::channel();
        *self.watchdog.lock() = Some(Watchdog::spawn(monitored, limits, fired));
        Some(trigger)
    }

    fn create_marker(&self) {
        if let Some(path) = &self.settings.started_marker {
            match std::fs::write(path, b"") {
                Ok(()) => info!(marker = %path.display(), "Readiness marker created"),
                Err(e) => warn!(marker = %path.display(), error = %e, "Cannot create readiness marker"),
            }
        }
    }

    fn remove_marker(&self) -> Option<ShutdownError> {
        let path = self.settings.started_marker.as_ref()?;
        match std::fs::remove_file(path) {
            Ok(()) => {
                debug!(marker = %path.display(), "Readiness marker removed");
                None
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(source) => Some(ShutdownError::Marker {
                path: path.clone(),
                source,
            }),
        }
    }

    /// Stop the whole fleet
    ///
    /// The first caller performs the shutdown; concurrent and later callers wait
    /// for it and get the same report.
    pub async fn shutdown(&self) -> &ShutdownReport {
        self.shutdown.get_or_init(|| self.shutdown_fleet()).await
    }

    async fn shutdown_fleet(&self) -> ShutdownReport {
        info!("Shutting down fleet");
        let mut report = ShutdownReport::default();

        let watchdog = self.watchdog.lock().take();
        if let Some(watchdog) = watchdog {
            watchdog.cancel().await;
        }

        for running in self.fleet.drain_reverse() {
            let name = running.identity.name.clone();
            running.set_phase(ServerPhase::Stopping);
            debug!(server = %name, requests = running.activity.request_count(), "Stopping server");

            if let Err(source) = running.device.stop() {
                error!(server = %name, error = %source, "Failed to stop device");
                report.errors.push(ShutdownError::Device {
                    server: name.clone(),
                    source,
                });
            }
            if let Err(e) = running.server.stop().await {
                error!(server = %name, error = %e, "Failed to stop server");
                report.errors.push(e.into());
            }
            if let Err(source) = running.record.close() {
                error!(server = %name, error = %source, "Failed to close record");
                report.errors.push(ShutdownError::Record {
                    path: running.record.path().to_path_buf(),
                    source,
                });
            }
            self.ports.release(running.identity.port);
            running.set_phase(ServerPhase::Stopped);
            report.stopped.push(name);
        }

        debug!(records = self.store.len(), "Closing records");
        for (path, source) in self.store.close_all() {
            error!(record = %path.display(), error = %source, "Failed to close record");
            report.errors.push(ShutdownError::Record { path, source });
        }

        let bus = self.bus.lock().take();
        if let Some(bus) = bus {
            bus.stop();
            bus.close();
        }

        if let Some(e) = self.remove_marker() {
            error!(error = %e, "Failed to remove readiness marker");
            report.errors.push(e);
        }

        info!(
            stopped = report.stopped.len(),
            errors = report.errors.len(),
            "Fleet shut down"
        );
        report
    }
}

/// Concatenate device sources, keeping the first descriptor for each name
fn merge_sources<I>(sources: I) -> Vec<DeviceDescriptor>
where
    I: IntoIterator<Item = Vec<DeviceDescriptor>>,
{
    let mut seen = HashSet::new();
    let mut merged = Vec::new();
    for descriptor in sources.into_iter().flatten() {
        if seen.insert(descriptor.name.clone()) {
            merged.push(descriptor);
        } else {
            warn!(server = %descriptor.name, "Duplicate device name, keeping the first entry");
        }
    }
    merged
}

async fn prepare(
    index: usize,
    descriptor: DeviceDescriptor,
    registry: &CapabilityRegistry,
    store: Arc<RecordStore>,
    simulate_missing: bool,
) -> Result<Prepared, StartupError> {
    let handler = registry.resolve(&descriptor)?;
    debug!(server = %descriptor.name, handler = handler.name(), phase = %ServerPhase::Resolved, "Phase change");

    let (descriptor, device) = build_device(handler, descriptor, simulate_missing).await?;

    let name = descriptor.name.clone();
    let record = tokio::task::spawn_blocking(move || store.open(&name)).await??;
    device.restore(&record);

    Ok(Prepared {
        index,
        descriptor,
        device,
        record,
    })
}

/// Build the device, falling back to a simulated one when allowed
async fn build_device(
    handler: Arc<dyn DeviceHandler>,
    descriptor: DeviceDescriptor,
    simulate_missing: bool,
) -> Result<(DeviceDescriptor, Arc<dyn Device>), StartupError> {
    let first = {
        let handler = handler.clone();
        let descriptor = descriptor.clone();
        tokio::task::spawn_blocking(move || handler.build(&descriptor)).await?
    };

    match first {
        Ok(device) => Ok((descriptor, device)),
        Err(e) if e.is_connection() && simulate_missing && !descriptor.simulated => {
            warn!(server = %descriptor.name, error = %e, "Device unreachable, simulating it");
            let simulated = descriptor.simulated(true);
            let build_from = simulated.clone();
            let device = tokio::task::spawn_blocking(move || handler.build(&build_from)).await??;
            Ok((simulated, device))
        }
        Err(e) => Err(e.into()),
    }
}

/// Provision the certificate, start the device and serve it
async fn launch(
    ctx: LaunchContext,
    prepared: Prepared,
    port: u16,
) -> Result<RunningServer, StartupError> {
    let Prepared {
        descriptor,
        device,
        record,
        ..
    } = prepared;

    let uuid = record
        .uuid()
        .ok_or_else(|| StartupError::MissingUuid(record.path().to_path_buf()))?;
    let identity = ServerIdentity {
        name: descriptor.name.clone(),
        uuid,
        host: ctx.server_ip,
        port,
    };

    let certificate = {
        let certificates = ctx.certificates.clone();
        let record = record.clone();
        let identity = identity.clone();
        tokio::task::spawn_blocking(move || certificates.ensure_valid(&record, &identity)).await??
    };
    debug!(server = %identity.name, phase = %ServerPhase::CertificateReady, "Phase change");

    {
        let device = device.clone();
        tokio::task::spawn_blocking(move || device.start()).await??;
    }

    let activity = Arc::new(ActivityTracker::new());
    let app = api::router(
        Arc::new(DeviceApi {
            identity: identity.clone(),
            device: device.clone(),
            discoverable: ctx.discoverable,
            started_at: Utc::now(),
        }),
        activity.clone(),
    );

    let server = match DeviceServer::start(&identity, app, &certificate, ctx.workers).await {
        Ok(server) => server,
        Err(e) => {
            stop_device(&identity.name, device.as_ref());
            return Err(e.into());
        }
    };
    debug!(server = %identity.name, phase = %ServerPhase::Started, "Phase change");

    if let Err(e) = persist_start(&record, port, ctx.base_port) {
        stop_device(&identity.name, device.as_ref());
        if let Err(stop) = server.stop().await {
            warn!(server = %identity.name, error = %stop, "Failed to stop server");
        }
        return Err(e.into());
    }

    let hook_device = device.clone();
    let hook_name = identity.name.clone();
    record.on_close(move |record| {
        if let Err(e) = hook_device.persist(record) {
            warn!(server = %hook_name, error = %e, "Failed to persist device state");
        }
    });

    info!(server = %identity.name, uuid = %identity.uuid, address = %server.addr(), "Server running");
    Ok(RunningServer::new(identity, device, record, server, activity))
}

fn persist_start(record: &ServerRecord, port: u16, base_port: u16) -> Result<(), RecordError> {
    record.set_port(port, base_port)?;
    record.flush()
}

fn stop_device(server: &str, device: &dyn Device) {
    if let Err(e) = device.stop() {
        warn!(server, error = %e, "Failed to stop device");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labfleet_core::{device_fragment, DeviceKind, FeatureInfo, FleetOptions, Inventory};
    use serde_json::{json, Value};
    use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
    use tempfile::TempDir;

    /// Devices stopped so far, and whether their server still accepted connections then
    #[derive(Default)]
    struct StopLog {
        ports: Mutex<HashMap<String, u16>>,
        stopped: Mutex<Vec<(String, bool)>>,
    }

    impl StopLog {
        fn watch(&self, running: &[ServerIdentity]) {
            let mut ports = self.ports.lock();
            for identity in running {
                ports.insert(identity.name.clone(), identity.port);
            }
        }

        fn count(&self) -> usize {
            self.stopped.lock().len()
        }
    }

    /// Balance that only exists when simulated or named `present*`
    struct TestDevice {
        descriptor: DeviceDescriptor,
        log: Arc<StopLog>,
    }

    impl Device for TestDevice {
        fn descriptor(&self) -> &DeviceDescriptor {
            &self.descriptor
        }

        fn features(&self) -> Vec<FeatureInfo> {
            vec![FeatureInfo::new("WeighingService").property("Weight")]
        }

        fn start(&self) -> Result<(), DeviceError> {
            Ok(())
        }

        fn stop(&self) -> Result<(), DeviceError> {
            let name = self.descriptor.name.clone();
            let serving = self.log.ports.lock().get(&name).is_some_and(|port| {
                TcpStream::connect(SocketAddr::from((Ipv4Addr::LOCALHOST, *port))).is_ok()
            });
            self.log.stopped.lock().push((name, serving));
            Ok(())
        }

        fn get_property(&self, _feature: &str, _property: &str) -> Result<Value, DeviceError> {
            Ok(json!(0.0))
        }

        fn execute(&self, _feature: &str, _command: &str, _params: Value) -> Result<Value, DeviceError> {
            Ok(Value::Null)
        }

        fn restore(&self, _record: &ServerRecord) {
            if self.descriptor.name.starts_with("present_broken") {
                panic!("corrupt device state");
            }
        }

        fn persist(&self, record: &ServerRecord) -> Result<(), RecordError> {
            record.write("state", "tared", true)
        }
    }

    struct TestHandler {
        log: Arc<StopLog>,
    }

    impl TestHandler {
        fn kinds() -> Vec<DeviceKind> {
            vec![DeviceKind::new("balance", "Sartorius")]
        }
    }

    impl DeviceHandler for TestHandler {
        fn name(&self) -> &'static str {
            "test-balance"
        }

        fn supported_types(&self) -> Vec<DeviceKind> {
            Self::kinds()
        }

        fn schema_fragment(&self) -> Value {
            device_fragment(
                "TestBalanceDevice",
                &Self::kinds(),
                json!({ "port": { "type": "string" } }),
                &[],
            )
        }

        fn build(&self, descriptor: &DeviceDescriptor) -> Result<Arc<dyn Device>, DeviceError> {
            if !descriptor.simulated && !descriptor.name.starts_with("present") {
                return Err(DeviceError::connection(&descriptor.name, "no such port"));
            }
            Ok(Arc::new(TestDevice {
                descriptor: descriptor.clone(),
                log: self.log.clone(),
            }))
        }
    }

    struct Fixture {
        dir: TempDir,
        log: Arc<StopLog>,
        base_port: u16,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: TempDir::new().unwrap(),
                log: Arc::new(StopLog::default()),
                base_port: free_port(),
            }
        }

        fn settings(&self, devices: Vec<DeviceDescriptor>, options: FleetOptions) -> Settings {
            Settings {
                inventory: Inventory {
                    name: "bench".into(),
                    path: None,
                    options,
                    cetoni: None,
                    devices: Some(devices),
                },
                server_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
                record_dir: self.dir.path().join("records"),
                workers: 1,
                started_marker: Some(self.dir.path().join("started")),
            }
        }

        fn options(&self) -> FleetOptions {
            FleetOptions {
                server_base_port: self.base_port,
                ..Default::default()
            }
        }

        fn supervisor(&self, settings: Settings) -> Supervisor {
            let registry = CapabilityRegistry::from_handlers(vec![Arc::new(TestHandler {
                log: self.log.clone(),
            })]);
            Supervisor::new(settings, Arc::new(registry))
        }

        fn record(&self, server: &str) -> String {
            let path = RecordStore::new(self.dir.path().join("records")).path_for(server);
            std::fs::read_to_string(path).unwrap_or_default()
        }
    }

    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn balance(name: &str) -> DeviceDescriptor {
        DeviceDescriptor::new(name, DeviceKind::new("balance", "Sartorius")).with_extra("port", "COM3")
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fresh_fleet_starts_on_base_port() {
        let fx = Fixture::new();
        let supervisor = fx.supervisor(fx.settings(vec![balance("present_bal1")], fx.options()));

        let report = supervisor.start().await.unwrap();
        assert_eq!(report.running.len(), 1);
        assert_eq!(report.running[0].port, fx.base_port);
        assert!(report.watchdog.is_none());
        assert!(fx.dir.path().join("started").exists());

        let record = fx.record("present_bal1");
        assert!(record.contains(&format!("port = {}", fx.base_port)));

        supervisor.shutdown().await;
        assert!(!fx.dir.path().join("started").exists());
        assert!(fx.record("present_bal1").contains("tared = true"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_recorded_port_is_reused() {
        let fx = Fixture::new();
        let recorded = free_port();
        {
            let store = RecordStore::new(fx.dir.path().join("records"));
            let record = store.open("present_bal1").unwrap();
            record.set_port(recorded, fx.base_port).unwrap();
            record.flush().unwrap();
            record.close().unwrap();
        }

        let supervisor = fx.supervisor(fx.settings(vec![balance("present_bal1")], fx.options()));
        let report = supervisor.start().await.unwrap();
        assert_eq!(report.running[0].port, recorded);
        supervisor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_overridden_base_port_migrates() {
        let fx = Fixture::new();
        {
            let store = RecordStore::new(fx.dir.path().join("records"));
            let record = store.open("present_bal1").unwrap();
            record.set_port(free_port(), 40000).unwrap();
            record.flush().unwrap();
            record.close().unwrap();
        }

        let options = FleetOptions {
            base_port_overridden: true,
            ..fx.options()
        };
        let supervisor = fx.supervisor(fx.settings(vec![balance("present_bal1")], options));
        let report = supervisor.start().await.unwrap();
        assert_eq!(report.running[0].port, fx.base_port);
        supervisor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unknown_type_is_skipped() {
        let fx = Fixture::new();
        let centrifuge = DeviceDescriptor::new("aaa_spin", DeviceKind::new("centrifuge", "Acme"));
        let supervisor = fx.supervisor(fx.settings(
            vec![centrifuge, balance("present_bal1")],
            fx.options(),
        ));

        let report = supervisor.start().await.unwrap();
        assert_eq!(report.failed, vec!["aaa_spin".to_string()]);
        assert_eq!(report.running.len(), 1);
        // index 1 in the fleet order
        assert_eq!(report.running[0].port, fx.base_port + 1);
        supervisor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_no_usable_device_fails_the_run() {
        let fx = Fixture::new();
        let centrifuge = DeviceDescriptor::new("spin", DeviceKind::new("centrifuge", "Acme"));
        let supervisor = fx.supervisor(fx.settings(vec![centrifuge], fx.options()));

        assert!(matches!(supervisor.start().await, Err(RunError::NoDevices)));
        assert!(!fx.dir.path().join("started").exists());
        supervisor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_explicit_empty_fleet_is_fine() {
        let fx = Fixture::new();
        let supervisor = fx.supervisor(fx.settings(Vec::new(), fx.options()));

        let report = supervisor.start().await.unwrap();
        assert!(report.running.is_empty());
        assert!(!fx.dir.path().join("started").exists());
        supervisor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_missing_device_is_skipped_or_simulated() {
        let fx = Fixture::new();
        let supervisor = fx.supervisor(fx.settings(
            vec![balance("gone"), balance("present_bal1")],
            fx.options(),
        ));
        let report = supervisor.start().await.unwrap();
        assert_eq!(report.failed, vec!["gone".to_string()]);
        supervisor.shutdown().await;
        assert!(fx.record("gone").is_empty());

        let options = FleetOptions {
            simulate_missing: true,
            ..fx.options()
        };
        let supervisor = fx.supervisor(fx.settings(vec![balance("gone")], options));
        let report = supervisor.start().await.unwrap();
        assert_eq!(report.running.len(), 1);
        assert!(report.failed.is_empty());
        supervisor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_runs_once() {
        let fx = Fixture::new();
        let supervisor = fx.supervisor(fx.settings(
            vec![balance("present_a"), balance("present_b")],
            fx.options(),
        ));
        supervisor.start().await.unwrap();

        let (first, second) = tokio::join!(supervisor.shutdown(), supervisor.shutdown());
        assert_eq!(first.stopped.len(), 2);
        assert!(std::ptr::eq(first, second));
        assert_eq!(fx.log.count(), 2);

        supervisor.shutdown().await;
        assert_eq!(fx.log.count(), 2);
        assert!(supervisor.fleet.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_reverses_start_order() {
        let fx = Fixture::new();
        let supervisor = fx.supervisor(fx.settings(
            vec![balance("present_a"), balance("present_b"), balance("present_c")],
            fx.options(),
        ));
        let report = supervisor.start().await.unwrap();
        fx.log.watch(&report.running);

        let shutdown = supervisor.shutdown().await;
        let mut expected: Vec<String> = report.running.iter().map(|s| s.name.clone()).collect();
        expected.reverse();
        assert_eq!(shutdown.stopped, expected);
        assert!(shutdown.errors.is_empty());

        // each device is stopped while its server is still listening
        let stopped = fx.log.stopped.lock().clone();
        let names: Vec<String> = stopped.iter().map(|(name, _)| name.clone()).collect();
        assert_eq!(names, expected);
        assert!(stopped.iter().all(|(_, serving)| *serving));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_panicking_startup_task_is_reported() {
        let fx = Fixture::new();
        let supervisor = fx.supervisor(fx.settings(
            vec![balance("present_a"), balance("present_broken")],
            fx.options(),
        ));
        let report = supervisor.start().await.unwrap();
        assert_eq!(report.failed, vec!["present_broken".to_string()]);
        assert_eq!(report.running.len(), 1);
        supervisor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_recorded_port_in_use_drops_only_that_server() {
        let fx = Fixture::new();
        let squatter = TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = squatter.local_addr().unwrap().port();
        {
            let store = RecordStore::new(fx.dir.path().join("records"));
            let record = store.open("present_b").unwrap();
            record.set_port(taken, fx.base_port).unwrap();
            record.flush().unwrap();
            record.close().unwrap();
        }

        let supervisor = fx.supervisor(fx.settings(
            vec![balance("present_a"), balance("present_b")],
            fx.options(),
        ));
        let report = supervisor.start().await.unwrap();
        assert_eq!(report.failed, vec!["present_b".to_string()]);
        assert_eq!(report.running.len(), 1);
        assert_eq!(report.running[0].name, "present_a");
        assert_eq!(report.running[0].port, fx.base_port);
        assert!(!fx.dir.path().join("started").exists());

        supervisor.shutdown().await;
        drop(squatter);
    }

    #[test]
    fn test_merge_sources_keeps_first_name() {
        let merged = merge_sources([
            vec![balance("pump_1")],
            vec![balance("bal"), balance("pump_1")],
        ]);
        let names: Vec<_> = merged.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["pump_1", "bal"]);
    }
}
