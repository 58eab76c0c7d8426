//! Settings: inventory file merged with command-line overrides

use anyhow::{Context, Result};
use labfleet_core::{Inventory, OptionOverrides, Schema};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use tracing::info;

/// Environment variable naming the readiness marker file
pub const STARTED_MARKER_ENV: &str = "LABFLEET_STARTED_MARKER";

/// Worker threads per device server runtime
pub const DEFAULT_WORKERS: usize = 2;

const DEFAULT_CONFIG_NAME: &str = "default";

/// Everything the supervisor needs to run a fleet
#[derive(Debug, Clone)]
pub struct Settings {
    pub inventory: Inventory,
    /// Address every device server binds to
    pub server_ip: IpAddr,
    /// Directory holding one record per server
    pub record_dir: PathBuf,
    pub workers: usize,
    pub started_marker: Option<PathBuf>,
}

/// Values that only exist on the command line
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub config_file: Option<PathBuf>,
    pub record_dir: Option<PathBuf>,
    pub workers: Option<usize>,
}

impl Settings {
    /// Load the inventory (if any) and apply overrides on top of it
    pub fn load(
        launch: &LaunchOptions,
        overrides: &OptionOverrides,
        schema: &Schema,
    ) -> Result<Self> {
        let mut inventory = match &launch.config_file {
            Some(path) => Inventory::load(path, schema)
                .with_context(|| format!("Failed to load configuration {}", path.display()))?,
            None => Inventory::empty(DEFAULT_CONFIG_NAME),
        };
        inventory.apply(overrides);

        let server_ip = inventory.options.server_ip.unwrap_or_else(default_server_ip);
        let record_dir = match &launch.record_dir {
            Some(dir) => dir.clone(),
            None => default_record_dir(&inventory.name)?,
        };
        let workers = launch.workers.unwrap_or(DEFAULT_WORKERS).max(1);
        let started_marker = std::env::var_os(STARTED_MARKER_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        info!(
            config = %inventory.name,
            server_ip = %server_ip,
            base_port = inventory.options.server_base_port,
            records = %record_dir.display(),
            "Settings loaded"
        );

        Ok(Self {
            inventory,
            server_ip,
            record_dir,
            workers,
            started_marker,
        })
    }
}

/// First non-loopback IPv4 address of this host, or localhost
pub fn default_server_ip() -> IpAddr {
    use network_interface::{Addr, NetworkInterface, NetworkInterfaceConfig};

    NetworkInterface::show()
        .unwrap_or_default()
        .into_iter()
        .flat_map(|iface| iface.addr)
        .find_map(|addr| match addr {
            Addr::V4(v4) if !v4.ip.is_loopback() => Some(IpAddr::V4(v4.ip)),
            _ => None,
        })
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// `<user config dir>/labfleet/<configuration name>`
pub fn default_record_dir(config_name: &str) -> Result<PathBuf> {
    let base = dirs::config_dir().context("Cannot determine the user configuration directory")?;
    Ok(record_dir_under(&base, config_name))
}

fn record_dir_under(base: &Path, config_name: &str) -> PathBuf {
    base.join("labfleet").join(config_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn inventory_file(content: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_cli_overrides_file_values() {
        let file = inventory_file(
            r#"// lab bench
{
  "version": 1,
  "server_ip": "10.0.0.5",
  "server_base_port": 50100,
  "devices": {}
}"#,
        );
        let launch = LaunchOptions {
            config_file: Some(file.path().to_path_buf()),
            record_dir: Some(PathBuf::from("/tmp/records")),
            workers: Some(4),
        };
        let overrides = OptionOverrides {
            server_base_port: Some(50200),
            ..Default::default()
        };

        let settings = Settings::load(&launch, &overrides, &Schema::base()).unwrap();
        assert_eq!(settings.server_ip, "10.0.0.5".parse::<IpAddr>().unwrap());
        assert_eq!(settings.inventory.options.server_base_port, 50200);
        assert!(settings.inventory.options.base_port_overridden);
        assert_eq!(settings.workers, 4);
        assert_eq!(settings.record_dir, PathBuf::from("/tmp/records"));
    }

    #[test]
    fn test_without_config_file() {
        let launch = LaunchOptions {
            record_dir: Some(PathBuf::from("/tmp/records")),
            ..Default::default()
        };
        let overrides = OptionOverrides {
            device_config_path: Some(PathBuf::from("/opt/cetoni/config")),
            ..Default::default()
        };

        let settings = Settings::load(&launch, &overrides, &Schema::base()).unwrap();
        assert_eq!(settings.inventory.name, DEFAULT_CONFIG_NAME);
        assert!(settings.inventory.cetoni.is_some());
        assert_eq!(settings.workers, DEFAULT_WORKERS);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let file = inventory_file(r#"{ "version": 2, "devices": {} }"#);
        let launch = LaunchOptions {
            config_file: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        assert!(Settings::load(&launch, &OptionOverrides::default(), &Schema::base()).is_err());
    }

    #[test]
    fn test_record_dir_layout() {
        let dir = record_dir_under(Path::new("/home/lab/.config"), "bench");
        assert_eq!(dir, PathBuf::from("/home/lab/.config/labfleet/bench"));
    }
}
