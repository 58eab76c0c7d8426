//! RPC routes served by every device server

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use labfleet_core::{Device, DeviceError, FeatureInfo, ServerIdentity};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::traffic::{track_traffic, ActivityTracker, STANDARD_FEATURE};

/// API error response
#[derive(Serialize)]
struct ApiError {
    error: String,
}

impl ApiError {
    fn new(msg: impl Into<String>) -> Self {
        Self { error: msg.into() }
    }
}

fn error_response(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(ApiError::new(msg))).into_response()
}

/// Device and identity behind one server
pub struct DeviceApi {
    pub identity: ServerIdentity,
    pub device: Arc<dyn Device>,
    pub discoverable: bool,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ServerInfo {
    pub name: String,
    pub uuid: Uuid,
    #[serde(rename = "type")]
    pub device_type: String,
    pub manufacturer: String,
    pub version: &'static str,
    pub host: String,
    pub port: u16,
    pub simulated: bool,
    pub discoverable: bool,
    pub started_at: DateTime<Utc>,
}

impl DeviceApi {
    pub fn info(&self) -> ServerInfo {
        let descriptor = self.device.descriptor();
        ServerInfo {
            name: self.identity.name.clone(),
            uuid: self.identity.uuid,
            device_type: descriptor.kind.device_type.clone(),
            manufacturer: descriptor.kind.manufacturer.clone(),
            version: env!("CARGO_PKG_VERSION"),
            host: self.identity.host.to_string(),
            port: self.identity.port,
            simulated: descriptor.simulated,
            discoverable: self.discoverable,
            started_at: self.started_at,
        }
    }

    fn standard_feature() -> FeatureInfo {
        FeatureInfo::new(STANDARD_FEATURE)
            .property("ServerName")
            .property("ServerUUID")
            .property("ServerType")
            .property("ServerVendor")
            .property("ServerVersion")
    }

    fn standard_property(&self, property: &str) -> Option<Value> {
        let info = self.info();
        let value = match property {
            "ServerName" => json!(info.name),
            "ServerUUID" => json!(info.uuid),
            "ServerType" => json!(info.device_type),
            "ServerVendor" => json!(info.manufacturer),
            "ServerVersion" => json!(info.version),
            _ => return None,
        };
        Some(value)
    }
}

/// Build the router for one device server
pub fn router(api: Arc<DeviceApi>, activity: Arc<ActivityTracker>) -> Router {
    let features = Router::new()
        .route(
            "/features/{feature}/{name}",
            get(get_property).post(execute_command),
        )
        .route_layer(middleware::from_fn_with_state(activity, track_traffic));

    Router::new()
        .route("/", get(server_info))
        .route("/features", get(list_features))
        .merge(features)
        .layer(TraceLayer::new_for_http())
        .with_state(api)
}

fn status_for(error: &DeviceError) -> StatusCode {
    match error {
        DeviceError::UnknownFeature(_)
        | DeviceError::UnknownProperty { .. }
        | DeviceError::UnknownCommand { .. } => StatusCode::NOT_FOUND,
        DeviceError::InvalidParameters(_) => StatusCode::BAD_REQUEST,
        DeviceError::NotRunning => StatusCode::SERVICE_UNAVAILABLE,
        DeviceError::Connection { .. } | DeviceError::Hardware(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Run a device call on the blocking pool and turn the result into a response
async fn call_device<F>(api: &DeviceApi, call: F) -> Response
where
    F: FnOnce(&dyn Device) -> Result<Value, DeviceError> + Send + 'static,
{
    let device = api.device.clone();
    match tokio::task::spawn_blocking(move || call(device.as_ref())).await {
        Ok(Ok(value)) => Json(json!({ "value": value })).into_response(),
        Ok(Err(e)) => {
            debug!(server = %api.identity.name, error = %e, "Device call rejected");
            error_response(status_for(&e), e.to_string())
        }
        Err(e) => {
            warn!(server = %api.identity.name, error = %e, "Device call panicked");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Device call failed")
        }
    }
}

/// Server information
pub async fn server_info(State(api): State<Arc<DeviceApi>>) -> impl IntoResponse {
    Json(api.info())
}

/// Standard feature followed by the device features
pub async fn list_features(State(api): State<Arc<DeviceApi>>) -> impl IntoResponse {
    let mut features = vec![DeviceApi::standard_feature()];
    features.extend(api.device.features());
    Json(features)
}

/// Read one property
pub async fn get_property(
    State(api): State<Arc<DeviceApi>>,
    Path((feature, property)): Path<(String, String)>,
) -> Response {
    if feature == STANDARD_FEATURE {
        return match api.standard_property(&property) {
            Some(value) => Json(json!({ "value": value })).into_response(),
            None => error_response(
                StatusCode::NOT_FOUND,
                format!("Feature {} has no property {}", feature, property),
            ),
        };
    }
    call_device(&api, move |device| device.get_property(&feature, &property)).await
}

/// Execute one command; the body is a JSON object of parameters and may be empty
pub async fn execute_command(
    State(api): State<Arc<DeviceApi>>,
    Path((feature, command)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    if feature == STANDARD_FEATURE {
        return error_response(
            StatusCode::NOT_FOUND,
            format!("Feature {} has no command {}", feature, command),
        );
    }

    let params = if body.is_empty() {
        Value::Null
    } else {
        match serde_json::from_slice::<Value>(&body) {
            Ok(v) => v,
            Err(e) => {
                return error_response(StatusCode::BAD_REQUEST, format!("Invalid JSON body: {}", e))
            }
        }
    };

    call_device(&api, move |device| device.execute(&feature, &command, params)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use labfleet_core::{DeviceDescriptor, DeviceKind};
    use labfleet_handlers::{CommandEffect, FeatureSpec, Instrument};
    use std::net::{IpAddr, Ipv4Addr};
    use tower::ServiceExt;

    fn setup() -> (Router, Arc<ActivityTracker>) {
        let descriptor = DeviceDescriptor::new("bal1", DeviceKind::new("balance", "Sartorius"))
            .simulated(true);
        let device = Instrument::new(
            descriptor,
            vec![FeatureSpec::new("WeighingService")
                .property("Weight", json!(0.0))
                .command(
                    "Tare",
                    CommandEffect::Assign {
                        property: "Weight",
                        value: json!(0.0),
                    },
                )
                .command(
                    "SetWeight",
                    CommandEffect::Set {
                        property: "Weight",
                        param: "value",
                    },
                )],
            None,
            false,
        );
        device.start().unwrap();

        let api = Arc::new(DeviceApi {
            identity: ServerIdentity {
                name: "bal1".into(),
                uuid: Uuid::new_v4(),
                host: IpAddr::V4(Ipv4Addr::LOCALHOST),
                port: 50051,
            },
            device: Arc::new(device),
            discoverable: true,
            started_at: Utc::now(),
        });
        let activity = Arc::new(ActivityTracker::new());
        (router(api, activity.clone()), activity)
    }

    async fn send(app: &Router, method: Method, uri: &str, body: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_server_info() {
        let (app, _) = setup();
        let (status, body) = send(&app, Method::GET, "/", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "bal1");
        assert_eq!(body["type"], "balance");
        assert_eq!(body["port"], 50051);
        assert_eq!(body["discoverable"], true);
    }

    #[tokio::test]
    async fn test_feature_list_starts_with_standard_feature() {
        let (app, _) = setup();
        let (_, body) = send(&app, Method::GET, "/features", "").await;
        assert_eq!(body[0]["identifier"], STANDARD_FEATURE);
        assert_eq!(body[1]["identifier"], "WeighingService");
    }

    #[tokio::test]
    async fn test_property_and_command() {
        let (app, _) = setup();
        let (status, _) = send(&app, Method::POST, "/features/WeighingService/SetWeight", r#"{"value": 12.5}"#).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&app, Method::GET, "/features/WeighingService/Weight", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["value"], 12.5);

        let (status, _) = send(&app, Method::POST, "/features/WeighingService/Tare", "").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_errors_map_to_status_codes() {
        let (app, _) = setup();
        let (status, _) = send(&app, Method::GET, "/features/Nope/Weight", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app, Method::POST, "/features/WeighingService/SetWeight", "{}").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, Method::POST, "/features/WeighingService/SetWeight", "not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_only_device_features_count_as_traffic() {
        let (app, activity) = setup();
        send(&app, Method::GET, "/", "").await;
        send(&app, Method::GET, "/features/ServerInfo/ServerName", "").await;
        assert_eq!(activity.request_count(), 0);

        send(&app, Method::GET, "/features/WeighingService/Weight", "").await;
        assert_eq!(activity.request_count(), 1);
    }
}
