//! Inactivity and power watchdog for battery-powered units
//!
//! The watchdog wakes once per [`POLL_INTERVAL`] and checks two timers per
//! monitored device: time since the last device RPC and time since the device
//! last reported mains power or a battery. Crossing either limit reports a
//! [`Trigger`] once and ends the task. The fleet shutdown and host power-off
//! that follow are driven by the receiver of the trigger.

use labfleet_core::inventory::{DEFAULT_MAX_TIME_WITHOUT_BATTERY, DEFAULT_MAX_TIME_WITHOUT_TRAFFIC};
use labfleet_core::{format_iso8601, CetoniSection, Device};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::traffic::ActivityTracker;

pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogLimits {
    pub max_time_without_traffic: Duration,
    pub max_time_without_battery: Duration,
}

impl Default for WatchdogLimits {
    fn default() -> Self {
        Self {
            max_time_without_traffic: DEFAULT_MAX_TIME_WITHOUT_TRAFFIC,
            max_time_without_battery: DEFAULT_MAX_TIME_WITHOUT_BATTERY,
        }
    }
}

impl From<&CetoniSection> for WatchdogLimits {
    fn from(section: &CetoniSection) -> Self {
        Self {
            max_time_without_traffic: section.max_time_without_traffic,
            max_time_without_battery: section.max_time_without_battery,
        }
    }
}

/// A battery-capable device under supervision
#[derive(Clone)]
pub struct MonitoredDevice {
    pub server: String,
    pub device: Arc<dyn Device>,
    pub activity: Arc<ActivityTracker>,
}

/// Why the watchdog fired
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    NoTraffic { server: String, idle: Duration },
    NoPower { server: String, unpowered: Duration },
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoTraffic { server, idle } => {
                write!(f, "{} saw no traffic for {}", server, format_iso8601(*idle))
            }
            Self::NoPower { server, unpowered } => write!(
                f,
                "{} reported neither mains nor battery for {}",
                server,
                format_iso8601(*unpowered)
            ),
        }
    }
}

struct PowerTimer {
    monitored: MonitoredDevice,
    last_powered: Instant,
}

impl PowerTimer {
    fn check(&mut self, now: Instant, limits: &WatchdogLimits) -> Option<Trigger> {
        let powered = self
            .monitored
            .device
            .power_state()
            .is_some_and(|p| p.is_powered());
        if powered {
            self.last_powered = now;
        }

        let idle = self.monitored.activity.idle_for(now);
        if idle > limits.max_time_without_traffic {
            return Some(Trigger::NoTraffic {
                server: self.monitored.server.clone(),
                idle,
            });
        }

        let unpowered = now.saturating_duration_since(self.last_powered);
        if unpowered > limits.max_time_without_battery {
            return Some(Trigger::NoPower {
                server: self.monitored.server.clone(),
                unpowered,
            });
        }
        None
    }
}

/// Handle to the running watchdog task
pub struct Watchdog {
    cancel: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Watchdog {
    /// Start polling `devices`; the first trigger is sent on `fired`
    pub fn spawn(
        devices: Vec<MonitoredDevice>,
        limits: WatchdogLimits,
        fired: oneshot::Sender<Trigger>,
    ) -> Self {
        let (cancel, cancelled) = watch::channel(false);
        info!(
            devices = devices.len(),
            max_time_without_traffic = %format_iso8601(limits.max_time_without_traffic),
            max_time_without_battery = %format_iso8601(limits.max_time_without_battery),
            "Starting watchdog"
        );
        let task = tokio::spawn(run(devices, limits, fired, cancelled));
        Self {
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    /// Stop the task and wait for it to finish
    pub async fn cancel(&self) {
        let _ = self.cancel.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Watchdog task ended abnormally");
            }
            debug!("Watchdog stopped");
        }
    }
}

async fn run(
    devices: Vec<MonitoredDevice>,
    limits: WatchdogLimits,
    fired: oneshot::Sender<Trigger>,
    mut cancelled: watch::Receiver<bool>,
) {
    let start = Instant::now();
    let mut timers: Vec<PowerTimer> = devices
        .into_iter()
        .map(|monitored| PowerTimer {
            monitored,
            last_powered: start,
        })
        .collect();

    let mut interval = tokio::time::interval(POLL_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = cancelled.changed() => {
                if changed.is_err() || *cancelled.borrow() {
                    return;
                }
            }
            now = interval.tick() => {
                if let Some(trigger) = timers.iter_mut().find_map(|t| t.check(now, &limits)) {
                    warn!(trigger = %trigger, "Watchdog limit reached, shutting down host");
                    let _ = fired.send(trigger);
                    return;
                }
            }
        }
    }
}
