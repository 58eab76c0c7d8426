//! Labfleet Registry - Device-type handler lookup
//!
//! This crate provides:
//! - The capability registry, built once from the installed handlers
//! - Handler-driven scanning for attached instruments

pub mod registry;
pub mod scan;

pub use registry::{CapabilityRegistry, UnknownDeviceType};
pub use scan::scan_devices;
