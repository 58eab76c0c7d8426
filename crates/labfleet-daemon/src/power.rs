//! Host power control

use std::future::Future;
use std::io;
use tokio::process::Command;
use tracing::{info, warn};

/// Something that can switch the host off
pub trait PowerControl: Send + Sync + 'static {
    fn power_off(&self) -> impl Future<Output = io::Result<()>> + Send;
}

/// Runs `shutdown now`, through `sudo` unless already root
#[derive(Debug, Default, Clone, Copy)]
pub struct ShutdownCommand;

impl ShutdownCommand {
    fn command() -> Command {
        if is_root() {
            let mut cmd = Command::new("shutdown");
            cmd.arg("now");
            cmd
        } else {
            let mut cmd = Command::new("sudo");
            cmd.args(["shutdown", "now"]);
            cmd
        }
    }
}

impl PowerControl for ShutdownCommand {
    async fn power_off(&self) -> io::Result<()> {
        info!("Powering off host");
        let status = Self::command().status().await?;
        if status.success() {
            Ok(())
        } else {
            warn!(%status, "Host shutdown command failed");
            Err(io::Error::other(format!("shutdown exited with {}", status)))
        }
    }
}

/// `/proc/self` is owned by the effective user of this process
#[cfg(target_os = "linux")]
fn is_root() -> bool {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata("/proc/self")
        .map(|m| m.uid() == 0)
        .unwrap_or(false)
}

#[cfg(not(target_os = "linux"))]
fn is_root() -> bool {
    false
}
