//! Labfleet Handlers - Built-in device-type handlers
//!
//! Handlers for balances, thermostats, stirrers, purification systems,
//! LC/MS instruments and CETONI bus devices. Each handler is enabled by a
//! cargo feature of the same name.

pub mod builtin;
pub mod cetoni;
pub mod instrument;
pub mod transport;

use labfleet_core::DeviceHandler;
use std::sync::Arc;

pub use builtin::InstrumentHandler;
pub use instrument::{CommandEffect, FeatureSpec, Instrument};
pub use transport::Endpoint;

/// Every handler compiled into this build, in registration order
pub fn installed() -> Vec<Arc<dyn DeviceHandler>> {
    #[allow(unused_mut)]
    let mut handlers: Vec<Arc<dyn DeviceHandler>> = Vec::new();
    #[cfg(feature = "cetoni")]
    handlers.push(Arc::new(cetoni::CetoniHandler));
    #[cfg(feature = "balance")]
    handlers.push(Arc::new(builtin::balance()));
    #[cfg(feature = "heating-cooling")]
    handlers.push(Arc::new(builtin::heating_cooling()));
    #[cfg(feature = "stirring")]
    handlers.push(Arc::new(builtin::stirring()));
    #[cfg(feature = "purification")]
    handlers.push(Arc::new(builtin::purification()));
    #[cfg(feature = "lcms")]
    handlers.push(Arc::new(builtin::lcms()));
    handlers
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_installed_kinds_are_unique() {
        let mut seen = HashSet::new();
        for handler in installed() {
            for kind in handler.supported_types() {
                assert!(seen.insert(kind.clone()), "{} registered twice", kind);
            }
        }
    }
}
