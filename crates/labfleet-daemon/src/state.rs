//! Fleet state: the servers that are currently running

use labfleet_core::{Device, ServerIdentity, ServerPhase, ServerRecord};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::debug;

use crate::server::DeviceServer;
use crate::traffic::ActivityTracker;
use crate::watchdog::MonitoredDevice;

/// One started server together with the device it fronts
pub struct RunningServer {
    pub identity: ServerIdentity,
    pub device: Arc<dyn Device>,
    pub record: Arc<ServerRecord>,
    pub server: DeviceServer,
    pub activity: Arc<ActivityTracker>,
    phase: Mutex<ServerPhase>,
}

impl RunningServer {
    pub fn new(
        identity: ServerIdentity,
        device: Arc<dyn Device>,
        record: Arc<ServerRecord>,
        server: DeviceServer,
        activity: Arc<ActivityTracker>,
    ) -> Self {
        Self {
            identity,
            device,
            record,
            server,
            activity,
            phase: Mutex::new(ServerPhase::Running),
        }
    }

    pub fn set_phase(&self, phase: ServerPhase) {
        debug!(server = %self.identity.name, %phase, "Phase change");
        *self.phase.lock() = phase;
    }
}

/// Running servers in the order they were started
#[derive(Default)]
pub struct FleetState {
    servers: RwLock<Vec<Arc<RunningServer>>>,
}

impl FleetState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, server: RunningServer) -> Arc<RunningServer> {
        let server = Arc::new(server);
        self.servers.write().push(server.clone());
        server
    }

    pub fn identities(&self) -> Vec<ServerIdentity> {
        self.servers
            .read()
            .iter()
            .map(|s| s.identity.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.servers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Battery-capable devices the watchdog has to supervise
    pub fn monitored(&self) -> Vec<MonitoredDevice> {
        self.servers
            .read()
            .iter()
            .filter(|s| s.device.battery_capable())
            .map(|s| MonitoredDevice {
                server: s.identity.name.clone(),
                device: s.device.clone(),
                activity: s.activity.clone(),
            })
            .collect()
    }

    /// Remove every server, most recently started first
    pub fn drain_reverse(&self) -> Vec<Arc<RunningServer>> {
        let mut servers = std::mem::take(&mut *self.servers.write());
        servers.reverse();
        servers
    }
}
