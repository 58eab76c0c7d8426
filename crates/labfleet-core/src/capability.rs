//! Capability interfaces implemented by device-type handlers
//!
//! A handler declares the `(type, manufacturer)` pairs it supports, contributes a
//! schema fragment for its inventory entries and builds device objects. The
//! orchestrator only talks to devices through the [`Device`] trait, so shutdown
//! and supervision work the same way for every concrete instrument.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::device::{DeviceDescriptor, DeviceKind};
use crate::record::{RecordError, ServerRecord};

#[derive(Error, Debug)]
pub enum DeviceError {
    /// The handler could not reach the hardware behind the descriptor
    #[error("Cannot connect to device '{device}': {reason}")]
    Connection { device: String, reason: String },
    #[error("Handler does not support {0}")]
    UnsupportedKind(DeviceKind),
    #[error("Invalid configuration for device '{device}': {reason}")]
    InvalidDescriptor { device: String, reason: String },
    #[error("Unknown feature: {0}")]
    UnknownFeature(String),
    #[error("Feature {feature} has no property {property}")]
    UnknownProperty { feature: String, property: String },
    #[error("Feature {feature} has no command {command}")]
    UnknownCommand { feature: String, command: String },
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("Device is not running")]
    NotRunning,
    #[error("Hardware error: {0}")]
    Hardware(String),
    #[error("Record error: {0}")]
    Record(#[from] RecordError),
}

impl DeviceError {
    pub fn connection(device: &str, reason: impl Into<String>) -> Self {
        Self::Connection {
            device: device.to_string(),
            reason: reason.into(),
        }
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }
}

/// Description of one feature a device exposes over its server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureInfo {
    pub identifier: String,
    #[serde(default)]
    pub properties: Vec<String>,
    #[serde(default)]
    pub commands: Vec<String>,
}

impl FeatureInfo {
    pub fn new(identifier: &str) -> Self {
        Self {
            identifier: identifier.to_string(),
            properties: Vec::new(),
            commands: Vec::new(),
        }
    }

    pub fn property(mut self, name: &str) -> Self {
        self.properties.push(name.to_string());
        self
    }

    pub fn command(mut self, name: &str) -> Self {
        self.commands.push(name.to_string());
        self
    }
}

/// Power signals reported by battery-capable mobile units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerState {
    /// External power supply connected
    pub on_mains: bool,
    /// Battery pack inserted
    pub battery_present: bool,
}

impl PowerState {
    /// Whether the unit has any source of power besides the remaining charge
    pub fn is_powered(&self) -> bool {
        self.on_mains || self.battery_present
    }
}

/// A constructed device object fronted by one server
pub trait Device: Send + Sync {
    fn descriptor(&self) -> &DeviceDescriptor;

    /// Features exposed by the device's server
    fn features(&self) -> Vec<FeatureInfo>;

    /// Bring the hardware session up
    fn start(&self) -> Result<(), DeviceError>;

    /// Release physical resources (I/O channels, serial ports, bus handles)
    fn stop(&self) -> Result<(), DeviceError>;

    fn get_property(&self, feature: &str, property: &str) -> Result<Value, DeviceError>;

    fn execute(&self, feature: &str, command: &str, params: Value) -> Result<Value, DeviceError>;

    /// Battery-capable mobile units are supervised by the inactivity/power watchdog
    fn battery_capable(&self) -> bool {
        false
    }

    fn power_state(&self) -> Option<PowerState> {
        None
    }

    /// Restore handler state from the server record before the device starts
    fn restore(&self, _record: &ServerRecord) {}

    /// Stage handler state into the server record
    fn persist(&self, _record: &ServerRecord) -> Result<(), RecordError> {
        Ok(())
    }
}

/// A device-type handler registered once at process start
pub trait DeviceHandler: Send + Sync {
    /// Handler package name, used in logs
    fn name(&self) -> &'static str;

    fn supported_types(&self) -> Vec<DeviceKind>;

    /// Schema fragment describing the inventory entries this handler accepts
    ///
    /// The fragment is a document with `definitions` and a top-level `$ref`
    /// naming the definition that constrains a device entry.
    fn schema_fragment(&self) -> Value;

    fn build(&self, descriptor: &DeviceDescriptor) -> Result<Arc<dyn Device>, DeviceError>;

    /// Auto-detect attached instruments (only used when scanning is enabled)
    fn scan(&self) -> Vec<DeviceDescriptor> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_builder() {
        let feature = FeatureInfo::new("BalanceService")
            .property("Weight")
            .command("Tare");
        assert_eq!(feature.properties, vec!["Weight"]);
        assert_eq!(feature.commands, vec!["Tare"]);
    }

    #[test]
    fn test_power_state() {
        let state = PowerState {
            on_mains: false,
            battery_present: false,
        };
        assert!(!state.is_powered());
        assert!(PowerState {
            on_mains: true,
            battery_present: false
        }
        .is_powered());
    }

    #[test]
    fn test_connection_error_kind() {
        assert!(DeviceError::connection("bal1", "no such port").is_connection());
        assert!(!DeviceError::NotRunning.is_connection());
    }
}
