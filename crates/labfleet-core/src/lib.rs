//! Labfleet Core - Inventory, capability interfaces, and server identity
//!
//! This crate provides the foundational types for the Labfleet orchestrator:
//! - Inventory loading and schema composition
//! - Capability interfaces implemented by device-type handlers
//! - Persistent per-server records
//! - Self-signed TLS certificates and port assignment

pub mod capability;
pub mod certificate;
pub mod device;
pub mod duration;
pub mod inventory;
pub mod ports;
pub mod record;
pub mod schema;

pub use capability::{Device, DeviceError, DeviceHandler, FeatureInfo, PowerState};
pub use certificate::{Certificate, CertificateError, CertificateManager, RenewalReason};
pub use device::{DeviceDescriptor, DeviceKind, ServerIdentity, ServerPhase};
pub use duration::{format_iso8601, parse_iso8601, DurationError};
pub use inventory::{
    CetoniSection, ConfigError, FleetOptions, Inventory, LogLevel, OptionOverrides,
};
pub use ports::{PortAllocator, PortConflictError};
pub use record::{RecordError, RecordStore, ServerRecord};
pub use schema::{device_fragment, Schema, SchemaError};
