//! Table-driven instrument device
//!
//! Every built-in handler produces an [`Instrument`]: a device whose features,
//! properties and commands are described by [`FeatureSpec`]s. Property values
//! live in memory; properties marked persistent are written to the server
//! record so they survive restarts.

use labfleet_core::record::ServerRecord;
use labfleet_core::{Device, DeviceDescriptor, DeviceError, FeatureInfo, PowerState, RecordError};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::transport::Endpoint;

/// Record section holding persisted property values
pub const STATE_SECTION: &str = "state";

pub const BATTERY_FEATURE: &str = "BatteryService";
pub const ON_MAINS: &str = "IsOnMains";
pub const BATTERY_PRESENT: &str = "IsBatteryPresent";

#[derive(Debug, Clone)]
pub struct PropertySpec {
    pub name: &'static str,
    pub initial: Value,
    pub persistent: bool,
}

/// What a command does to the instrument state
#[derive(Debug, Clone)]
pub enum CommandEffect {
    /// Store the `param` field of the request body into `property`
    Set {
        property: &'static str,
        param: &'static str,
    },
    /// Overwrite `property` with a fixed value
    Assign { property: &'static str, value: Value },
    /// Acknowledge without changing state
    Acknowledge,
}

#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub name: &'static str,
    pub effect: CommandEffect,
}

#[derive(Debug, Clone)]
pub struct FeatureSpec {
    pub identifier: &'static str,
    pub properties: Vec<PropertySpec>,
    pub commands: Vec<CommandSpec>,
}

impl FeatureSpec {
    pub fn new(identifier: &'static str) -> Self {
        Self {
            identifier,
            properties: Vec::new(),
            commands: Vec::new(),
        }
    }

    pub fn property(mut self, name: &'static str, initial: Value) -> Self {
        self.properties.push(PropertySpec {
            name,
            initial,
            persistent: false,
        });
        self
    }

    /// A property whose value is kept in the server record
    pub fn persistent(mut self, name: &'static str, initial: Value) -> Self {
        self.properties.push(PropertySpec {
            name,
            initial,
            persistent: true,
        });
        self
    }

    pub fn command(mut self, name: &'static str, effect: CommandEffect) -> Self {
        self.commands.push(CommandSpec { name, effect });
        self
    }

    fn info(&self) -> FeatureInfo {
        let mut info = FeatureInfo::new(self.identifier);
        for p in &self.properties {
            info = info.property(p.name);
        }
        for c in &self.commands {
            info = info.command(c.name);
        }
        info
    }
}

/// Power feature of battery-capable mobile units
pub fn battery_feature() -> FeatureSpec {
    FeatureSpec::new(BATTERY_FEATURE)
        .property(ON_MAINS, Value::Bool(true))
        .property(BATTERY_PRESENT, Value::Bool(true))
        .property("StateOfCharge", Value::from(100))
        .command(
            "SetOnMains",
            CommandEffect::Set {
                property: ON_MAINS,
                param: "value",
            },
        )
        .command(
            "SetBatteryPresent",
            CommandEffect::Set {
                property: BATTERY_PRESENT,
                param: "value",
            },
        )
}

struct InstrumentState {
    running: bool,
    values: BTreeMap<(String, String), Value>,
}

fn state_key(feature: &str, property: &str) -> String {
    format!("{}.{}", feature, property)
}

pub struct Instrument {
    descriptor: DeviceDescriptor,
    features: Vec<FeatureSpec>,
    endpoint: Option<Endpoint>,
    battery_capable: bool,
    state: Mutex<InstrumentState>,
}

impl Instrument {
    pub fn new(
        descriptor: DeviceDescriptor,
        mut features: Vec<FeatureSpec>,
        endpoint: Option<Endpoint>,
        battery_capable: bool,
    ) -> Self {
        if battery_capable && !features.iter().any(|f| f.identifier == BATTERY_FEATURE) {
            features.push(battery_feature());
        }

        let values = features
            .iter()
            .flat_map(|f| {
                f.properties
                    .iter()
                    .map(move |p| ((f.identifier.to_string(), p.name.to_string()), p.initial.clone()))
            })
            .collect();

        Self {
            descriptor,
            features,
            endpoint,
            battery_capable,
            state: Mutex::new(InstrumentState {
                running: false,
                values,
            }),
        }
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    fn feature(&self, identifier: &str) -> Result<&FeatureSpec, DeviceError> {
        self.features
            .iter()
            .find(|f| f.identifier == identifier)
            .ok_or_else(|| DeviceError::UnknownFeature(identifier.to_string()))
    }

    fn read_bool(&self, feature: &str, property: &str) -> Option<bool> {
        self.state
            .lock()
            .values
            .get(&(feature.to_string(), property.to_string()))
            .and_then(Value::as_bool)
    }
}

impl Device for Instrument {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn features(&self) -> Vec<FeatureInfo> {
        self.features.iter().map(FeatureSpec::info).collect()
    }

    fn start(&self) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        if state.running {
            return Ok(());
        }
        state.running = true;
        match (&self.endpoint, self.descriptor.simulated) {
            (_, true) => info!("Started {} (simulated)", self.descriptor.name),
            (Some(endpoint), false) => info!("Started {} on {}", self.descriptor.name, endpoint),
            (None, false) => info!("Started {}", self.descriptor.name),
        }
        Ok(())
    }

    fn stop(&self) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        if state.running {
            state.running = false;
            debug!("Stopped {}", self.descriptor.name);
        }
        Ok(())
    }

    fn get_property(&self, feature: &str, property: &str) -> Result<Value, DeviceError> {
        let spec = self.feature(feature)?;
        if !spec.properties.iter().any(|p| p.name == property) {
            return Err(DeviceError::UnknownProperty {
                feature: feature.to_string(),
                property: property.to_string(),
            });
        }
        let state = self.state.lock();
        if !state.running {
            return Err(DeviceError::NotRunning);
        }
        Ok(state
            .values
            .get(&(feature.to_string(), property.to_string()))
            .cloned()
            .unwrap_or(Value::Null))
    }

    fn execute(&self, feature: &str, command: &str, params: Value) -> Result<Value, DeviceError> {
        let spec = self.feature(feature)?;
        let command_spec = spec
            .commands
            .iter()
            .find(|c| c.name == command)
            .ok_or_else(|| DeviceError::UnknownCommand {
                feature: feature.to_string(),
                command: command.to_string(),
            })?;

        let mut state = self.state.lock();
        if !state.running {
            return Err(DeviceError::NotRunning);
        }

        match &command_spec.effect {
            CommandEffect::Set { property, param } => {
                let value = params.get(*param).cloned().ok_or_else(|| {
                    DeviceError::InvalidParameters(format!("missing parameter '{}'", param))
                })?;
                state
                    .values
                    .insert((feature.to_string(), property.to_string()), value.clone());
                Ok(value)
            }
            CommandEffect::Assign { property, value } => {
                state
                    .values
                    .insert((feature.to_string(), property.to_string()), value.clone());
                Ok(value.clone())
            }
            CommandEffect::Acknowledge => Ok(Value::Null),
        }
    }

    fn battery_capable(&self) -> bool {
        self.battery_capable
    }

    fn power_state(&self) -> Option<PowerState> {
        if !self.battery_capable {
            return None;
        }
        Some(PowerState {
            on_mains: self.read_bool(BATTERY_FEATURE, ON_MAINS).unwrap_or(false),
            battery_present: self.read_bool(BATTERY_FEATURE, BATTERY_PRESENT).unwrap_or(false),
        })
    }

    fn restore(&self, record: &ServerRecord) {
        let mut state = self.state.lock();
        for feature in &self.features {
            for property in feature.properties.iter().filter(|p| p.persistent) {
                let key = state_key(feature.identifier, property.name);
                if let Some(value) = record.read::<Value>(STATE_SECTION, &key) {
                    debug!("Restored {} = {} for {}", key, value, self.descriptor.name);
                    state
                        .values
                        .insert((feature.identifier.to_string(), property.name.to_string()), value);
                }
            }
        }
    }

    fn persist(&self, record: &ServerRecord) -> Result<(), RecordError> {
        let state = self.state.lock();
        for feature in &self.features {
            for property in feature.properties.iter().filter(|p| p.persistent) {
                let value = state
                    .values
                    .get(&(feature.identifier.to_string(), property.name.to_string()));
                match value {
                    Some(Value::Null) | None => {}
                    Some(value) => {
                        let key = state_key(feature.identifier, property.name);
                        if let Err(e) = record.write(STATE_SECTION, &key, value) {
                            warn!("Cannot persist {} for {}: {}", key, self.descriptor.name, e);
                            return Err(e);
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
