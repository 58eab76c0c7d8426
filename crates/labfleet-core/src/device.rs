//! Device descriptors and server identities

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::net::IpAddr;
use uuid::Uuid;

/// The `(type, manufacturer)` pair a handler declares support for
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceKind {
    #[serde(rename = "type")]
    pub device_type: String,
    pub manufacturer: String,
}

impl DeviceKind {
    pub fn new(device_type: impl Into<String>, manufacturer: impl Into<String>) -> Self {
        Self {
            device_type: device_type.into(),
            manufacturer: manufacturer.into(),
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device_type, self.manufacturer)
    }
}

/// Declarative entry naming a device's type, manufacturer, and configuration
///
/// Immutable after the inventory has been loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Unique key of the device in the inventory
    pub name: String,
    #[serde(flatten)]
    pub kind: DeviceKind,
    /// Whether the handler should construct a simulated instance
    #[serde(default)]
    pub simulated: bool,
    /// Handler-specific fields (e.g. `port`, `server_url`)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DeviceDescriptor {
    pub fn new(name: impl Into<String>, kind: DeviceKind) -> Self {
        Self {
            name: name.into(),
            kind,
            simulated: false,
            extra: Map::new(),
        }
    }

    pub fn with_extra(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }

    pub fn simulated(mut self, simulated: bool) -> Self {
        self.simulated = simulated;
        self
    }

    /// Handler-specific string field, e.g. the serial `port` of a balance
    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }

    pub fn extra_bool(&self, key: &str) -> Option<bool> {
        self.extra.get(key).and_then(Value::as_bool)
    }

    pub fn extra_u64(&self, key: &str) -> Option<u64> {
        self.extra.get(key).and_then(Value::as_u64)
    }
}

/// Network identity of one device server
///
/// The UUID is durable across restarts and host changes; the port may change between runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerIdentity {
    pub name: String,
    pub uuid: Uuid,
    pub host: IpAddr,
    pub port: u16,
}

impl fmt::Display for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}) at {}:{}", self.name, self.uuid, self.host, self.port)
    }
}

/// Lifecycle of a single server inside the fleet
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerPhase {
    Unconfigured,
    Resolved,
    CertificateReady,
    PortAssigned,
    Started,
    Running,
    Stopping,
    Stopped,
}

impl Default for ServerPhase {
    fn default() -> Self {
        Self::Unconfigured
    }
}

impl fmt::Display for ServerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unconfigured => "unconfigured",
            Self::Resolved => "resolved",
            Self::CertificateReady => "certificate_ready",
            Self::PortAssigned => "port_assigned",
            Self::Started => "started",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}
