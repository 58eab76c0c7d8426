//! CETONI device configuration folders and bus devices
//!
//! A configuration folder holds `device_properties.xml` (plugin list and the
//! battery flag of mobile dosing units) and one XML file per plugin listing the
//! devices on the bus. Plugin files may contain several root elements.

use labfleet_core::{device_fragment, Device, DeviceDescriptor, DeviceError, DeviceHandler, DeviceKind};
use parking_lot::Mutex;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::instrument::{CommandEffect, FeatureSpec, Instrument};

pub const MANUFACTURER: &str = "CETONI";
pub const DEVICE_PROPERTIES: &str = "device_properties.xml";

/// Plugins that carry no bus devices
const SKIPPED_PLUGINS: &[&str] = &[
    "qmixelements",
    "scriptingsystem",
    "labbcanservice",
    "canopentools",
    "qmixdevices",
    "datalogger",
];

const DEVICE_TYPES: &[&str] = &[
    "pump",
    "contiflow_pump",
    "peristaltic_pump",
    "axis_system",
    "valve",
    "controller",
    "io",
];

#[derive(Error, Debug)]
pub enum CetoniError {
    #[error("Cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Cannot parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
    #[error("Bus error: {0}")]
    Bus(String),
}

#[derive(Debug, Deserialize)]
struct DeviceProperties {
    #[serde(rename = "SiLA", default)]
    sila: Option<SilaProperties>,
    #[serde(rename = "Core")]
    core: CoreProperties,
}

#[derive(Debug, Deserialize)]
struct SilaProperties {
    #[serde(rename = "BatteryPowered", default)]
    battery_powered: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CoreProperties {
    #[serde(rename = "PluginList")]
    plugin_list: PluginList,
}

#[derive(Debug, Deserialize)]
struct PluginList {
    #[serde(rename = "Plugin", default)]
    plugins: Vec<String>,
}

/// Device type served by a plugin, inferred from its name
pub fn device_type_for_plugin(plugin: &str) -> Option<&'static str> {
    let p = plugin.to_lowercase();
    if p.contains("rotaxys") || p.contains("axis") || p.contains("motion") {
        Some("axis_system")
    } else if p.contains("tubingpump") {
        Some("peristaltic_pump")
    } else if p.contains("contiflow") {
        Some("contiflow_pump")
    } else if p.contains("pump") || p.contains("nemesys") {
        Some("pump")
    } else if p.contains("valve") {
        Some("valve")
    } else if p.contains("controller") {
        Some("controller")
    } else if p.ends_with("io") || p.contains("analog") || p.contains("digital") {
        Some("io")
    } else {
        None
    }
}

/// A parsed CETONI device configuration folder
#[derive(Debug, Clone)]
pub struct CetoniConfiguration {
    pub path: PathBuf,
    pub name: String,
    pub battery_powered: bool,
    pub plugins: Vec<String>,
    /// Bus devices in plugin-list order
    pub devices: Vec<DeviceDescriptor>,
}

fn read(path: &Path) -> Result<String, CetoniError> {
    let content = std::fs::read_to_string(path).map_err(|source| CetoniError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(content.trim_start_matches('\u{feff}').to_string())
}

struct PluginDevice {
    name: String,
    jib_length: Option<i64>,
}

/// Collect every `<Device Name="…">` in a plugin file
fn parse_plugin(path: &Path) -> Result<Vec<PluginDevice>, CetoniError> {
    let content = read(path)?;
    let parse_error = |reason: String| CetoniError::Parse {
        path: path.to_path_buf(),
        reason,
    };

    let mut reader = Reader::from_str(&content);
    reader.config_mut().trim_text(true);

    let mut devices: Vec<PluginDevice> = Vec::new();
    let mut depth_in_device = 0usize;
    let mut in_jib_length = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                if depth_in_device > 0 {
                    depth_in_device += 1;
                    in_jib_length = e.name().as_ref() == b"JibLength";
                } else if e.name().as_ref() == b"Device" {
                    if let Some(attr) = e
                        .try_get_attribute("Name")
                        .map_err(|e| parse_error(e.to_string()))?
                    {
                        let name = attr
                            .unescape_value()
                            .map_err(|e| parse_error(e.to_string()))?
                            .to_string();
                        devices.push(PluginDevice {
                            name,
                            jib_length: None,
                        });
                        depth_in_device = 1;
                    }
                }
            }
            Ok(Event::Empty(e)) => {
                if depth_in_device == 0 && e.name().as_ref() == b"Device" {
                    if let Some(attr) = e
                        .try_get_attribute("Name")
                        .map_err(|e| parse_error(e.to_string()))?
                    {
                        let name = attr
                            .unescape_value()
                            .map_err(|e| parse_error(e.to_string()))?
                            .to_string();
                        devices.push(PluginDevice {
                            name,
                            jib_length: None,
                        });
                    }
                }
            }
            Ok(Event::Text(t)) if in_jib_length => {
                let text = t.unescape().map_err(|e| parse_error(e.to_string()))?;
                if let (Some(device), Ok(v)) = (devices.last_mut(), text.trim().parse::<i64>()) {
                    device.jib_length = Some(v.abs());
                }
            }
            Ok(Event::End(_)) => {
                in_jib_length = false;
                depth_in_device = depth_in_device.saturating_sub(1);
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(parse_error(e.to_string())),
        }
    }

    Ok(devices)
}

impl CetoniConfiguration {
    pub fn load(path: &Path) -> Result<Self, CetoniError> {
        debug!("Parsing CETONI device configuration {}", path.display());
        let properties_path = path.join(DEVICE_PROPERTIES);
        let content = read(&properties_path)?;
        let properties: DeviceProperties =
            quick_xml::de::from_str(&content).map_err(|e| CetoniError::Parse {
                path: properties_path.clone(),
                reason: e.to_string(),
            })?;

        let battery_powered = properties
            .sila
            .and_then(|s| s.battery_powered)
            .map(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes"))
            .unwrap_or(false);

        let plugins: Vec<String> = properties
            .core
            .plugin_list
            .plugins
            .into_iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();

        let mut devices = Vec::new();
        for plugin in &plugins {
            if SKIPPED_PLUGINS.contains(&plugin.as_str()) {
                continue;
            }
            let Some(device_type) = device_type_for_plugin(plugin) else {
                debug!("Plugin {} carries no supported devices", plugin);
                continue;
            };
            let plugin_path = path.join(format!("{}.xml", plugin));
            if !plugin_path.exists() {
                debug!("No configuration file for plugin {}", plugin);
                continue;
            }
            for device in parse_plugin(&plugin_path)? {
                if devices.iter().any(|d: &DeviceDescriptor| d.name == device.name) {
                    continue;
                }
                let mut descriptor =
                    DeviceDescriptor::new(device.name, DeviceKind::new(device_type, MANUFACTURER))
                        .with_extra("plugin", plugin.clone())
                        .with_extra("battery_powered", battery_powered);
                if let Some(jib_length) = device.jib_length {
                    descriptor = descriptor.with_extra("jib_length", jib_length);
                }
                devices.push(descriptor);
            }
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "cetoni".to_string());

        info!(
            "CETONI configuration {} has {} device(s){}",
            name,
            devices.len(),
            if battery_powered { ", battery powered" } else { "" }
        );

        Ok(Self {
            path: path.to_path_buf(),
            name,
            battery_powered,
            plugins,
            devices,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    Open,
    Running,
    Stopped,
    Closed,
}

impl fmt::Display for BusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Open => "open",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Session on the CETONI device bus
///
/// Opened before any device is built and closed after every server stopped.
pub struct CetoniBus {
    config_path: PathBuf,
    state: Mutex<BusState>,
}

impl CetoniBus {
    pub fn open(config: &CetoniConfiguration) -> Result<Self, CetoniError> {
        info!("Opening bus for {}", config.path.display());
        if !config.path.is_dir() {
            return Err(CetoniError::Bus(format!(
                "configuration folder {} is missing",
                config.path.display()
            )));
        }
        Ok(Self {
            config_path: config.path.clone(),
            state: Mutex::new(BusState::Open),
        })
    }

    pub fn state(&self) -> BusState {
        *self.state.lock()
    }

    pub fn start(&self) -> Result<(), CetoniError> {
        let mut state = self.state.lock();
        match *state {
            BusState::Open | BusState::Stopped => {
                info!("Starting bus and enabling devices");
                *state = BusState::Running;
                Ok(())
            }
            BusState::Running => Ok(()),
            BusState::Closed => Err(CetoniError::Bus("bus is closed".into())),
        }
    }

    pub fn stop(&self) {
        let mut state = self.state.lock();
        if *state == BusState::Running {
            *state = BusState::Stopped;
        }
    }

    pub fn close(&self) {
        let mut state = self.state.lock();
        if *state != BusState::Closed {
            debug!("Closing bus for {}", self.config_path.display());
            *state = BusState::Closed;
        }
    }
}

fn features_for(device_type: &str) -> Vec<FeatureSpec> {
    let set = |property| CommandEffect::Set {
        property,
        param: "value",
    };
    match device_type {
        "pump" => vec![FeatureSpec::new("PumpFluidDosingService")
            .persistent("SyringeFillLevel", json!(0.0))
            .property("FlowRate", json!(0.0))
            .command("SetFillLevel", set("SyringeFillLevel"))
            .command("SetFlowRate", set("FlowRate"))
            .command(
                "StopDosage",
                CommandEffect::Assign {
                    property: "FlowRate",
                    value: json!(0.0),
                },
            )],
        "contiflow_pump" | "peristaltic_pump" => vec![FeatureSpec::new("ContinuousFlowDosingService")
            .property("FlowRate", json!(0.0))
            .command("SetFlowRate", set("FlowRate"))
            .command(
                "StopDosage",
                CommandEffect::Assign {
                    property: "FlowRate",
                    value: json!(0.0),
                },
            )],
        "axis_system" => vec![FeatureSpec::new("AxisSystemPositionController")
            .persistent("Position", json!({ "x": 0.0, "y": 0.0 }))
            .command(
                "MoveToPosition",
                CommandEffect::Set {
                    property: "Position",
                    param: "position",
                },
            )
            .command("StopMoving", CommandEffect::Acknowledge)],
        "valve" => vec![FeatureSpec::new("ValvePositionController")
            .persistent("Position", json!(0))
            .command("SwitchToPosition", set("Position"))],
        "controller" => vec![FeatureSpec::new("ControlLoopService")
            .persistent("Setpoint", json!(0.0))
            .property("ControlLoopRunning", json!(false))
            .command("WriteSetpoint", set("Setpoint"))
            .command(
                "RunControlLoop",
                CommandEffect::Assign {
                    property: "ControlLoopRunning",
                    value: json!(true),
                },
            )
            .command(
                "StopControlLoop",
                CommandEffect::Assign {
                    property: "ControlLoopRunning",
                    value: json!(false),
                },
            )],
        _ => vec![
            FeatureSpec::new("AnalogInChannelProvider").property("Value", json!(0.0)),
            FeatureSpec::new("DigitalOutChannelController")
                .persistent("State", json!(false))
                .command("SetState", set("State")),
        ],
    }
}

/// Handler for devices on the CETONI bus
pub struct CetoniHandler;

impl CetoniHandler {
    fn kinds() -> Vec<DeviceKind> {
        DEVICE_TYPES
            .iter()
            .map(|t| DeviceKind::new(*t, MANUFACTURER))
            .collect()
    }
}

impl DeviceHandler for CetoniHandler {
    fn name(&self) -> &'static str {
        "cetoni"
    }

    fn supported_types(&self) -> Vec<DeviceKind> {
        Self::kinds()
    }

    fn schema_fragment(&self) -> Value {
        device_fragment(
            "CetoniBusDevice",
            &Self::kinds(),
            json!({
                "plugin": { "type": "string" },
                "battery_powered": { "type": "boolean" },
                "jib_length": { "type": "integer" }
            }),
            &[],
        )
    }

    fn build(&self, descriptor: &DeviceDescriptor) -> Result<Arc<dyn Device>, DeviceError> {
        if descriptor.kind.manufacturer != MANUFACTURER
            || !DEVICE_TYPES.contains(&descriptor.kind.device_type.as_str())
        {
            return Err(DeviceError::UnsupportedKind(descriptor.kind.clone()));
        }
        let battery = descriptor.extra_bool("battery_powered").unwrap_or(false);
        Ok(Arc::new(Instrument::new(
            descriptor.clone(),
            features_for(&descriptor.kind.device_type),
            None,
            battery,
        )))
    }
}
