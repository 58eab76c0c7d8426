//! Fleet inventory loading
//!
//! An inventory file is JSON with `//` line comments. It is validated against
//! the composed [`Schema`] and then turned into typed options, an optional
//! CETONI section and the list of device descriptors.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::device::DeviceDescriptor;
use crate::duration::{parse_iso8601, DurationError};
use crate::schema::{Schema, SchemaError};

/// The only inventory format version this build understands
pub const INVENTORY_VERSION: u64 = 1;
pub const DEFAULT_BASE_PORT: u16 = 50051;
pub const DEFAULT_MAX_TIME_WITHOUT_BATTERY: Duration = Duration::from_secs(20);
pub const DEFAULT_MAX_TIME_WITHOUT_TRAFFIC: Duration = Duration::from_secs(600);

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Configuration file {path} is not valid JSON: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("Unsupported configuration version {found}, expected {expected}")]
    UnsupportedVersion { found: u64, expected: u64 },
    #[error("Invalid value for '{field}': {reason}")]
    Invalid { field: String, reason: String },
    #[error(transparent)]
    Duration(#[from] DurationError),
}

/// Log verbosity accepted in inventories and on the command line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    /// Filter directive understood by `tracing_subscriber::EnvFilter`
    ///
    /// `critical` has no tracing counterpart and maps onto `error`.
    pub fn as_filter(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warn",
            Self::Error | Self::Critical => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warning" | "warn" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

/// Global fleet options, after defaults and overrides
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetOptions {
    pub server_ip: Option<IpAddr>,
    pub server_base_port: u16,
    /// Set when the base port came from the command line
    pub base_port_overridden: bool,
    pub enable_discovery: bool,
    pub regenerate_certificates: bool,
    pub log_level: LogLevel,
    pub log_file_dir: Option<PathBuf>,
    pub scan_devices: bool,
    pub simulate_missing: bool,
}

impl Default for FleetOptions {
    fn default() -> Self {
        Self {
            server_ip: None,
            server_base_port: DEFAULT_BASE_PORT,
            base_port_overridden: false,
            enable_discovery: true,
            regenerate_certificates: false,
            log_level: LogLevel::Info,
            log_file_dir: None,
            scan_devices: false,
            simulate_missing: false,
        }
    }
}

/// Values supplied on the command line; `None` leaves the file value in place
#[derive(Debug, Clone, Default)]
pub struct OptionOverrides {
    pub server_ip: Option<IpAddr>,
    pub server_base_port: Option<u16>,
    pub enable_discovery: Option<bool>,
    pub regenerate_certificates: Option<bool>,
    pub log_level: Option<LogLevel>,
    pub log_file_dir: Option<PathBuf>,
    pub scan_devices: Option<bool>,
    pub simulate_missing: Option<bool>,
    pub device_config_path: Option<PathBuf>,
}

impl FleetOptions {
    pub fn apply(&mut self, overrides: &OptionOverrides) {
        if let Some(ip) = overrides.server_ip {
            self.server_ip = Some(ip);
        }
        if let Some(port) = overrides.server_base_port {
            self.server_base_port = port;
            self.base_port_overridden = true;
        }
        if let Some(v) = overrides.enable_discovery {
            self.enable_discovery = v;
        }
        if let Some(v) = overrides.regenerate_certificates {
            self.regenerate_certificates = v;
        }
        if let Some(level) = overrides.log_level {
            self.log_level = level;
        }
        if let Some(dir) = &overrides.log_file_dir {
            self.log_file_dir = Some(dir.clone());
        }
        if let Some(v) = overrides.scan_devices {
            self.scan_devices = v;
        }
        if let Some(v) = overrides.simulate_missing {
            self.simulate_missing = v;
        }
    }
}

/// Configuration of the CETONI device bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CetoniSection {
    pub device_config_path: PathBuf,
    pub max_time_without_battery: Duration,
    pub max_time_without_traffic: Duration,
}

impl CetoniSection {
    pub fn new(device_config_path: PathBuf) -> Self {
        Self {
            device_config_path,
            max_time_without_battery: DEFAULT_MAX_TIME_WITHOUT_BATTERY,
            max_time_without_traffic: DEFAULT_MAX_TIME_WITHOUT_TRAFFIC,
        }
    }
}

/// A loaded fleet inventory
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    /// Configuration name, used to place server records
    pub name: String,
    pub path: Option<PathBuf>,
    pub options: FleetOptions,
    pub cetoni: Option<CetoniSection>,
    /// `None` when the file has no `devices` key, `Some(vec![])` for an explicit empty fleet
    pub devices: Option<Vec<DeviceDescriptor>>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawInventory {
    #[serde(rename = "$schema", default)]
    _schema: Option<String>,
    version: u64,
    server_ip: Option<String>,
    server_base_port: Option<u16>,
    enable_discovery: Option<bool>,
    regenerate_certificates: Option<bool>,
    log_level: Option<LogLevel>,
    log_file_dir: Option<PathBuf>,
    scan_devices: Option<bool>,
    simulate_missing: Option<bool>,
    cetoni_devices: Option<RawCetoni>,
    devices: Option<Map<String, Value>>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCetoni {
    device_config_path: PathBuf,
    max_time_without_battery: Option<String>,
    max_time_without_traffic: Option<String>,
}

/// Drop `//` comment lines so the rest parses as plain JSON
pub fn strip_comments(content: &str) -> String {
    content
        .lines()
        .filter(|line| !line.trim_start().starts_with("//"))
        .collect::<Vec<_>>()
        .join("\n")
}

impl Inventory {
    /// An inventory without a file, driven entirely by overrides
    pub fn empty(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Load and validate an inventory file
    pub fn load(path: &Path, schema: &Schema) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let value: Value =
            serde_json::from_str(&strip_comments(&content)).map_err(|source| ConfigError::Json {
                path: path.to_path_buf(),
                source,
            })?;

        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "default".to_string());

        let mut inventory = Self::from_value(&name, value, schema)?;
        inventory.path = Some(path.to_path_buf());
        Ok(inventory)
    }

    pub fn from_value(name: &str, value: Value, schema: &Schema) -> Result<Self, ConfigError> {
        schema.validate(&value)?;

        let raw: RawInventory = serde_json::from_value(value).map_err(|e| ConfigError::Invalid {
            field: "<root>".into(),
            reason: e.to_string(),
        })?;

        if raw.version != INVENTORY_VERSION {
            return Err(ConfigError::UnsupportedVersion {
                found: raw.version,
                expected: INVENTORY_VERSION,
            });
        }

        let defaults = FleetOptions::default();
        let server_ip = raw
            .server_ip
            .as_deref()
            .map(|ip| {
                ip.parse::<IpAddr>().map_err(|e| ConfigError::Invalid {
                    field: "server_ip".into(),
                    reason: e.to_string(),
                })
            })
            .transpose()?;

        let options = FleetOptions {
            server_ip,
            server_base_port: raw.server_base_port.unwrap_or(defaults.server_base_port),
            base_port_overridden: false,
            enable_discovery: raw.enable_discovery.unwrap_or(defaults.enable_discovery),
            regenerate_certificates: raw
                .regenerate_certificates
                .unwrap_or(defaults.regenerate_certificates),
            log_level: raw.log_level.unwrap_or(defaults.log_level),
            log_file_dir: raw.log_file_dir,
            scan_devices: raw.scan_devices.unwrap_or(defaults.scan_devices),
            simulate_missing: raw.simulate_missing.unwrap_or(defaults.simulate_missing),
        };

        let cetoni = raw
            .cetoni_devices
            .map(|c| -> Result<CetoniSection, ConfigError> {
                let mut section = CetoniSection::new(c.device_config_path);
                if let Some(d) = c.max_time_without_battery {
                    section.max_time_without_battery = parse_iso8601(&d)?;
                }
                if let Some(d) = c.max_time_without_traffic {
                    section.max_time_without_traffic = parse_iso8601(&d)?;
                }
                Ok(section)
            })
            .transpose()?;

        let devices = raw
            .devices
            .map(|entries| {
                entries
                    .into_iter()
                    .map(|(name, entry)| descriptor_from_entry(name, entry))
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?;

        Ok(Self {
            name: name.to_string(),
            path: None,
            options,
            cetoni,
            devices,
        })
    }

    /// Apply command-line overrides on top of the file values
    pub fn apply(&mut self, overrides: &OptionOverrides) {
        self.options.apply(overrides);
        if let Some(path) = &overrides.device_config_path {
            match &mut self.cetoni {
                Some(section) => section.device_config_path = path.clone(),
                None => self.cetoni = Some(CetoniSection::new(path.clone())),
            }
        }
    }

    /// True when the file declares `devices` with no entries
    pub fn is_explicitly_empty(&self) -> bool {
        matches!(&self.devices, Some(d) if d.is_empty()) && self.cetoni.is_none()
    }

    /// Descriptors sorted by name for stable port assignment
    pub fn sorted_devices(&self) -> Vec<DeviceDescriptor> {
        let mut devices = self.devices.clone().unwrap_or_default();
        devices.sort_by(|a, b| a.name.cmp(&b.name));
        devices
    }
}

fn descriptor_from_entry(name: String, entry: Value) -> Result<DeviceDescriptor, ConfigError> {
    let Value::Object(mut fields) = entry else {
        return Err(ConfigError::Invalid {
            field: format!("devices.{}", name),
            reason: "entry is not an object".into(),
        });
    };
    fields.insert("name".into(), Value::String(name.clone()));
    serde_json::from_value(Value::Object(fields)).map_err(|e| ConfigError::Invalid {
        field: format!("devices.{}", name),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceKind;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn test_load_with_comments_and_defaults() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        writeln!(
            file,
            r#"{{
    // bench in lab 2
    "version": 1,
    "devices": {{
        "bal1": {{ "type": "balance", "manufacturer": "Sartorius", "port": "COM3" }}
    }}
}}"#
        )
        .unwrap();

        let inventory = Inventory::load(file.path(), &Schema::base()).unwrap();
        assert_eq!(inventory.options, FleetOptions::default());
        assert!(inventory.cetoni.is_none());

        let devices = inventory.devices.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "bal1");
        assert_eq!(devices[0].kind, DeviceKind::new("balance", "Sartorius"));
        assert_eq!(devices[0].extra_str("port"), Some("COM3"));
    }

    #[test]
    fn test_cetoni_durations() {
        let doc = json!({
            "version": 1,
            "cetoni_devices": {
                "device_config_path": "/opt/cetoni/config",
                "max_time_without_traffic": "PT1M"
            }
        });
        let inventory = Inventory::from_value("lab", doc, &Schema::base()).unwrap();
        let cetoni = inventory.cetoni.unwrap();
        assert_eq!(cetoni.max_time_without_battery, Duration::from_secs(20));
        assert_eq!(cetoni.max_time_without_traffic, Duration::from_secs(60));
        assert!(inventory.devices.is_none());
    }

    #[test]
    fn test_oversized_duration_is_config_error() {
        let doc = json!({
            "version": 1,
            "cetoni_devices": {
                "device_config_path": "/opt/cetoni/config",
                "max_time_without_traffic": "P99999999999999W"
            }
        });
        assert!(matches!(
            Inventory::from_value("lab", doc, &Schema::base()),
            Err(ConfigError::Duration(_))
        ));
    }

    #[test]
    fn test_version_mismatch() {
        let doc = json!({ "version": 2, "devices": {} });
        assert!(matches!(
            Inventory::from_value("lab", doc, &Schema::base()),
            Err(ConfigError::UnsupportedVersion { found: 2, .. })
        ));
    }

    #[test]
    fn test_schema_violation_is_config_error() {
        let doc = json!({ "version": 1, "devices": {}, "server_base_port": "high" });
        assert!(matches!(
            Inventory::from_value("lab", doc, &Schema::base()),
            Err(ConfigError::Schema(_))
        ));
    }

    #[test]
    fn test_explicit_empty_fleet() {
        let doc = json!({ "version": 1, "devices": {} });
        let inventory = Inventory::from_value("lab", doc, &Schema::base()).unwrap();
        assert!(inventory.is_explicitly_empty());
    }

    #[test]
    fn test_overrides_take_precedence() {
        let doc = json!({
            "version": 1,
            "server_base_port": 6000,
            "log_level": "debug",
            "devices": {}
        });
        let mut inventory = Inventory::from_value("lab", doc, &Schema::base()).unwrap();
        inventory.apply(&OptionOverrides {
            server_base_port: Some(7000),
            device_config_path: Some(PathBuf::from("/cfg")),
            ..Default::default()
        });

        assert_eq!(inventory.options.server_base_port, 7000);
        assert!(inventory.options.base_port_overridden);
        assert_eq!(inventory.options.log_level, LogLevel::Debug);
        assert_eq!(
            inventory.cetoni.unwrap().device_config_path,
            PathBuf::from("/cfg")
        );
    }

    #[test]
    fn test_sorted_devices() {
        let doc = json!({
            "version": 1,
            "devices": {
                "zeta": { "type": "balance", "manufacturer": "Sartorius" },
                "alpha": { "type": "balance", "manufacturer": "Sartorius" }
            }
        });
        let inventory = Inventory::from_value("lab", doc, &Schema::base()).unwrap();
        let names: Vec<_> = inventory.sorted_devices().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_log_level_parse() {
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warning);
        assert_eq!(LogLevel::Critical.as_filter(), "error");
        assert!("loud".parse::<LogLevel>().is_err());
    }
}
