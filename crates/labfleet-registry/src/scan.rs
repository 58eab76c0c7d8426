//! Auto-detection of attached instruments across all handlers

use labfleet_core::DeviceDescriptor;
use std::collections::HashSet;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::registry::CapabilityRegistry;

/// Ask every handler to scan, concurrently
///
/// Results are ordered by handler registration order, then by name. Devices
/// whose name is already taken (by `existing` or an earlier scan result) are
/// dropped.
pub async fn scan_devices(registry: &CapabilityRegistry, existing: &[String]) -> Vec<DeviceDescriptor> {
    let mut tasks = JoinSet::new();

    for (index, handler) in registry.handlers().iter().enumerate() {
        let handler = handler.clone();
        tasks.spawn_blocking(move || (index, handler.name(), handler.scan()));
    }

    let mut per_handler = Vec::new();
    while let Some(result) = tasks.join_next().await {
        match result {
            Ok((index, name, mut found)) => {
                debug!(handler = name, found = found.len(), "Handler scan finished");
                found.sort_by(|a, b| a.name.cmp(&b.name));
                per_handler.push((index, found));
            }
            Err(e) => warn!(error = %e, "Handler scan failed"),
        }
    }
    per_handler.sort_by_key(|(index, _)| *index);

    let mut taken: HashSet<String> = existing.iter().cloned().collect();
    let mut devices = Vec::new();
    for (_, found) in per_handler {
        for descriptor in found {
            if taken.insert(descriptor.name.clone()) {
                devices.push(descriptor);
            } else {
                debug!("Ignoring scanned device {}: name already in use", descriptor.name);
            }
        }
    }

    info!("Scan found {} device(s)", devices.len());
    devices
}

#[cfg(test)]
mod tests {
    use super::*;
    use labfleet_core::{Device, DeviceError, DeviceHandler, DeviceKind};
    use serde_json::{json, Value};
    use std::sync::Arc;

    struct ScanningHandler {
        name: &'static str,
        found: Vec<&'static str>,
    }

    impl DeviceHandler for ScanningHandler {
        fn name(&self) -> &'static str {
            self.name
        }

        fn supported_types(&self) -> Vec<DeviceKind> {
            vec![DeviceKind::new(self.name, "Acme")]
        }

        fn schema_fragment(&self) -> Value {
            json!({ "$ref": "#/definitions/DeviceBase" })
        }

        fn build(&self, descriptor: &DeviceDescriptor) -> Result<Arc<dyn Device>, DeviceError> {
            Err(DeviceError::connection(&descriptor.name, "not attached"))
        }

        fn scan(&self) -> Vec<DeviceDescriptor> {
            self.found
                .iter()
                .map(|n| DeviceDescriptor::new(*n, DeviceKind::new(self.name, "Acme")))
                .collect()
        }
    }

    #[tokio::test]
    async fn test_scan_order_and_collisions() {
        let registry = CapabilityRegistry::from_handlers(vec![
            Arc::new(ScanningHandler {
                name: "balance",
                found: vec!["scale_b", "scale_a"],
            }),
            Arc::new(ScanningHandler {
                name: "stirring",
                found: vec!["scale_a", "stirrer"],
            }),
        ]);

        let devices = scan_devices(&registry, &["stirrer".to_string()]).await;
        let names: Vec<_> = devices.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["scale_a", "scale_b"]);
    }
}
