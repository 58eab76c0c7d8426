//! Built-in handlers for third-party instruments
//!
//! Each handler is an [`InstrumentHandler`] configured with the device kinds
//! it accepts, the descriptor field naming its endpoint, and the features its
//! devices expose.

use labfleet_core::{device_fragment, Device, DeviceDescriptor, DeviceError, DeviceHandler, DeviceKind};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::instrument::{CommandEffect, FeatureSpec, Instrument};
use crate::transport::{Endpoint, PROBE_TIMEOUT};

type FeatureTable = fn(&DeviceKind) -> Vec<FeatureSpec>;

/// Directory scanned for serial instruments
const SERIAL_BY_ID: &str = "/dev/serial/by-id";

pub struct InstrumentHandler {
    name: &'static str,
    definition: &'static str,
    kinds: Vec<DeviceKind>,
    /// Descriptor field holding the endpoint (`port` or `server_url`)
    endpoint_key: &'static str,
    features: FeatureTable,
}

impl InstrumentHandler {
    pub fn new(
        name: &'static str,
        definition: &'static str,
        kinds: Vec<DeviceKind>,
        endpoint_key: &'static str,
        features: FeatureTable,
    ) -> Self {
        Self {
            name,
            definition,
            kinds,
            endpoint_key,
            features,
        }
    }

    fn supports(&self, kind: &DeviceKind) -> bool {
        self.kinds.contains(kind)
    }

    /// Serial instruments whose by-id link mentions the manufacturer
    fn scan_serial(&self, dir: &Path) -> Vec<DeviceDescriptor> {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return Vec::new();
        };
        let mut links: Vec<_> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .collect();
        links.sort();

        let mut found = Vec::new();
        for kind in &self.kinds {
            let needle = kind.manufacturer.to_lowercase();
            for link in &links {
                let Some(file_name) = link.file_name().map(|n| n.to_string_lossy().to_lowercase())
                else {
                    continue;
                };
                if !file_name.contains(&needle) {
                    continue;
                }
                let name = format!("{}_{}", kind.device_type, found.len() + 1);
                debug!("Scan found {} at {}", kind, link.display());
                found.push(
                    DeviceDescriptor::new(name, kind.clone())
                        .with_extra("port", link.to_string_lossy().to_string()),
                );
            }
        }
        found
    }
}

impl DeviceHandler for InstrumentHandler {
    fn name(&self) -> &'static str {
        self.name
    }

    fn supported_types(&self) -> Vec<DeviceKind> {
        self.kinds.clone()
    }

    fn schema_fragment(&self) -> Value {
        let mut properties = serde_json::Map::new();
        properties.insert(self.endpoint_key.to_string(), json!({ "type": "string" }));
        device_fragment(self.definition, &self.kinds, Value::Object(properties), &[])
    }

    fn build(&self, descriptor: &DeviceDescriptor) -> Result<Arc<dyn Device>, DeviceError> {
        if !self.supports(&descriptor.kind) {
            return Err(DeviceError::UnsupportedKind(descriptor.kind.clone()));
        }

        let endpoint = if descriptor.simulated {
            None
        } else {
            let endpoint = Endpoint::from_descriptor(descriptor, self.endpoint_key)?;
            endpoint
                .probe(PROBE_TIMEOUT)
                .map_err(|reason| DeviceError::connection(&descriptor.name, reason))?;
            Some(endpoint)
        };

        let features = (self.features)(&descriptor.kind);
        Ok(Arc::new(Instrument::new(
            descriptor.clone(),
            features,
            endpoint,
            false,
        )))
    }

    fn scan(&self) -> Vec<DeviceDescriptor> {
        if self.endpoint_key != "port" {
            return Vec::new();
        }
        self.scan_serial(Path::new(SERIAL_BY_ID))
    }
}

fn set(property: &'static str) -> CommandEffect {
    CommandEffect::Set {
        property,
        param: "value",
    }
}

#[cfg(feature = "balance")]
pub fn balance() -> InstrumentHandler {
    InstrumentHandler::new(
        "balance",
        "SartoriusBalanceDevice",
        vec![DeviceKind::new("balance", "Sartorius")],
        "port",
        |_| {
            vec![FeatureSpec::new("BalanceService")
                .property("Weight", json!(0.0))
                .property("Unit", json!("g"))
                .property("IsStable", json!(true))
                .command(
                    "Tare",
                    CommandEffect::Assign {
                        property: "Weight",
                        value: json!(0.0),
                    },
                )
                .command(
                    "Zero",
                    CommandEffect::Assign {
                        property: "Weight",
                        value: json!(0.0),
                    },
                )]
        },
    )
}

#[cfg(feature = "heating-cooling")]
pub fn heating_cooling() -> InstrumentHandler {
    InstrumentHandler::new(
        "heating_cooling",
        "HuberThermostatDevice",
        vec![DeviceKind::new("heating_cooling", "Huber")],
        "port",
        |_| {
            vec![FeatureSpec::new("TemperatureControlService")
                .property("CurrentTemperature", json!(20.0))
                .persistent("TargetTemperature", json!(20.0))
                .property("ControlEnabled", json!(false))
                .command("SetTargetTemperature", set("TargetTemperature"))
                .command(
                    "StartControlLoop",
                    CommandEffect::Assign {
                        property: "ControlEnabled",
                        value: json!(true),
                    },
                )
                .command(
                    "StopControlLoop",
                    CommandEffect::Assign {
                        property: "ControlEnabled",
                        value: json!(false),
                    },
                )]
        },
    )
}

#[cfg(feature = "stirring")]
pub fn stirring() -> InstrumentHandler {
    InstrumentHandler::new(
        "stirring",
        "TwoMagStirringDevice",
        vec![DeviceKind::new("stirring", "2mag")],
        "port",
        |_| {
            vec![FeatureSpec::new("StirringService")
                .persistent("Speed", json!(0))
                .property("IsRunning", json!(false))
                .command("SetSpeed", set("Speed"))
                .command(
                    "Start",
                    CommandEffect::Assign {
                        property: "IsRunning",
                        value: json!(true),
                    },
                )
                .command(
                    "Stop",
                    CommandEffect::Assign {
                        property: "IsRunning",
                        value: json!(false),
                    },
                )]
        },
    )
}

#[cfg(feature = "purification")]
pub fn purification() -> InstrumentHandler {
    InstrumentHandler::new(
        "purification",
        "SartoriusPurificationDevice",
        vec![DeviceKind::new("purification", "Sartorius")],
        "server_url",
        |_| {
            vec![FeatureSpec::new("PurificationService")
                .property("RunState", json!("idle"))
                .persistent("Method", Value::Null)
                .command("LoadMethod", set("Method"))
                .command(
                    "StartRun",
                    CommandEffect::Assign {
                        property: "RunState",
                        value: json!("running"),
                    },
                )
                .command(
                    "AbortRun",
                    CommandEffect::Assign {
                        property: "RunState",
                        value: json!("idle"),
                    },
                )]
        },
    )
}

#[cfg(feature = "lcms")]
pub fn lcms() -> InstrumentHandler {
    InstrumentHandler::new(
        "lcms",
        "ShimadzuLcmsDevice",
        vec![DeviceKind::new("lcms", "Shimadzu")],
        "server_url",
        |_| {
            vec![FeatureSpec::new("LcmsService")
                .property("Status", json!("ready"))
                .property("LastSample", Value::Null)
                .command("Measure", set("LastSample"))
                .command("Shutdown", CommandEffect::Acknowledge)]
        },
    )
}
