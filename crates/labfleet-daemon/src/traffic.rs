//! RPC activity tracking for the watchdog
//!
//! Every request to a feature route passes through [`track_traffic`]. Requests
//! to device features refresh the server's [`ActivityTracker`]; the standard
//! server information feature does not count as activity.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Feature every server exposes regardless of device type
pub const STANDARD_FEATURE: &str = "ServerInfo";

/// Last observed RPC activity of one server
#[derive(Debug)]
pub struct ActivityTracker {
    last: Mutex<Instant>,
    requests: AtomicU64,
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityTracker {
    /// A tracker whose idle time starts counting now
    pub fn new() -> Self {
        Self {
            last: Mutex::new(Instant::now()),
            requests: AtomicU64::new(0),
        }
    }

    pub fn touch(&self) {
        *self.last.lock() = Instant::now();
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> Instant {
        *self.last.lock()
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity())
    }

    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }
}

/// Feature segment of a `/features/{feature}/...` path
fn feature_of(path: &str) -> Option<&str> {
    let mut segments = path.trim_start_matches('/').split('/');
    match (segments.next(), segments.next()) {
        (Some("features"), Some(feature)) if !feature.is_empty() => Some(feature),
        _ => None,
    }
}

/// Count requests to non-standard features
pub async fn track_traffic(
    State(tracker): State<Arc<ActivityTracker>>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(feature) = feature_of(request.uri().path()) {
        if feature != STANDARD_FEATURE {
            trace!(feature, "Device traffic");
            tracker.touch();
        }
    }
    next.run(request).await
}
