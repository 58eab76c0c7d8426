//! Capability registry mapping `(type, manufacturer)` pairs to handlers

use labfleet_core::{DeviceDescriptor, DeviceHandler, DeviceKind, Schema, SchemaError};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("No installed handler supports device '{device}' ({kind})")]
pub struct UnknownDeviceType {
    pub device: String,
    pub kind: DeviceKind,
}

/// Installed handlers, indexed by the device kinds they declare
///
/// Built once at startup and read-only afterwards.
pub struct CapabilityRegistry {
    handlers: Vec<Arc<dyn DeviceHandler>>,
    by_kind: BTreeMap<DeviceKind, usize>,
}

impl CapabilityRegistry {
    /// Registry of every handler compiled into this build
    pub fn discover() -> Self {
        Self::from_handlers(labfleet_handlers::installed())
    }

    pub fn from_handlers(handlers: Vec<Arc<dyn DeviceHandler>>) -> Self {
        let mut by_kind = BTreeMap::new();
        for (index, handler) in handlers.iter().enumerate() {
            for kind in handler.supported_types() {
                match by_kind.get(&kind) {
                    Some(&first) => {
                        let first: &Arc<dyn DeviceHandler> = &handlers[first];
                        warn!(
                            "{} is claimed by both {} and {}, keeping {}",
                            kind,
                            first.name(),
                            handler.name(),
                            first.name()
                        );
                    }
                    None => {
                        debug!("{} handles {}", handler.name(), kind);
                        by_kind.insert(kind, index);
                    }
                }
            }
        }

        info!(
            "Registered {} handler(s) covering {} device kind(s)",
            handlers.len(),
            by_kind.len()
        );
        Self { handlers, by_kind }
    }

    pub fn handlers(&self) -> &[Arc<dyn DeviceHandler>] {
        &self.handlers
    }

    pub fn supported_types(&self) -> Vec<DeviceKind> {
        self.by_kind.keys().cloned().collect()
    }

    pub fn resolve(
        &self,
        descriptor: &DeviceDescriptor,
    ) -> Result<Arc<dyn DeviceHandler>, UnknownDeviceType> {
        self.by_kind
            .get(&descriptor.kind)
            .map(|&index| self.handlers[index].clone())
            .ok_or_else(|| UnknownDeviceType {
                device: descriptor.name.clone(),
                kind: descriptor.kind.clone(),
            })
    }

    /// Schema fragments of all handlers, in registration order
    pub fn schema_fragments(&self) -> Vec<(&'static str, Value)> {
        self.handlers
            .iter()
            .map(|h| (h.name(), h.schema_fragment()))
            .collect()
    }

    /// Base inventory schema composed with every handler fragment
    pub fn schema(&self) -> Result<Schema, SchemaError> {
        Schema::compose(self.schema_fragments())
    }
}
