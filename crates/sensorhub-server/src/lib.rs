//! Read-only HTTP view of the sensor cache and processor snapshots.
//!
//! Serves an HTML overview page plus per-device and per-processor JSON
//! endpoints, backed by the [`sensorhub_core::snapshot::SharedState`] the
//! service loop publishes once per second. The device/processor objects
//! themselves are `?Send` and confined to the service's own
//! `tokio::task::LocalSet`; this server never touches them directly.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Json, Response},
    routing::get,
    Router,
};
use log::info;
use serde::Serialize;
use serde_json::{Map, Value};

use sensorhub_core::snapshot::{DeviceSnapshot, ProcessorSnapshot, SharedState};

#[derive(Clone)]
struct AppState {
    shared: SharedState,
}

#[derive(Serialize)]
struct QuantityEntry {
    time: f64,
    value: f64,
}

#[derive(Serialize)]
struct DeviceResponse {
    name: String,
    id: String,
    connected: bool,
    time: f64,
    data: Map<String, Value>,
}

impl From<&DeviceSnapshot> for DeviceResponse {
    fn from(snapshot: &DeviceSnapshot) -> Self {
        let mut data = Map::new();
        for (name, sample) in &snapshot.data {
            let entry = QuantityEntry { time: sample.time, value: sample.value };
            data.insert(name.clone(), serde_json::to_value(entry).unwrap_or(Value::Null));
        }
        DeviceResponse {
            name: snapshot.name.clone(),
            id: snapshot.id.clone(),
            connected: snapshot.connected,
            time: snapshot.time,
            data,
        }
    }
}

fn find_device<'a>(devices: &'a [DeviceSnapshot], key: &str) -> Option<&'a DeviceSnapshot> {
    if let Ok(index) = key.parse::<usize>() {
        if let Some(device) = devices.get(index) {
            return Some(device);
        }
    }
    devices.iter().find(|d| d.id == key || d.name == key)
}

fn find_processor<'a>(processors: &'a [ProcessorSnapshot], key: &str) -> Option<&'a ProcessorSnapshot> {
    if let Ok(index) = key.parse::<usize>() {
        if let Some(processor) = processors.get(index) {
            return Some(processor);
        }
    }
    processors.iter().find(|p| p.name == key)
}

fn not_found(message: impl Into<String>) -> Response {
    (StatusCode::NOT_FOUND, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

async fn handle_device(State(state): State<Arc<AppState>>, Path(key): Path<String>) -> Response {
    let snapshot = state.shared.lock().unwrap();
    match find_device(&snapshot.devices, &key) {
        Some(device) => {
            let body = DeviceResponse::from(device);
            match serde_json::to_string_pretty(&body) {
                Ok(text) => ([(header::CONTENT_TYPE, "application/json")], text).into_response(),
                Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
            }
        }
        None => not_found(format!("no device matching \"{key}\"")),
    }
}

async fn handle_processor(State(state): State<Arc<AppState>>, Path(key): Path<String>) -> Response {
    let snapshot = state.shared.lock().unwrap();
    match find_processor(&snapshot.processors, &key) {
        Some(processor) => ([(header::CONTENT_TYPE, "application/json")], processor.json.clone()).into_response(),
        None => not_found(format!("no processor matching \"{key}\"")),
    }
}

async fn handle_index(State(state): State<Arc<AppState>>) -> Html<String> {
    let snapshot = state.shared.lock().unwrap();
    let mut devices = String::new();
    for (i, device) in snapshot.devices.iter().enumerate() {
        let status = if device.connected { "connected" } else { "disconnected" };
        devices.push_str(&format!(
            "<li><a href=\"/devices/{i}\">{}</a> ({}) — {status}</li>\n",
            html_escape(&device.name),
            html_escape(&device.id),
        ));
    }
    let mut processors = String::new();
    for (i, processor) in snapshot.processors.iter().enumerate() {
        processors.push_str(&format!(
            "<li><a href=\"/processors/{i}\">{}</a></li>\n",
            html_escape(&processor.name)
        ));
    }
    Html(format!(
        r#"<!DOCTYPE html>
<html>
<head>
<title>sensor hub</title>
<link rel="icon" href="data:;base64,iVBORw0KGgo=" type="image/x-icon">
<style>
body {{ font-family: sans-serif; margin: 2em; }}
h1, h2 {{ color: #333; }}
li {{ margin: 0.25em 0; }}
</style>
</head>
<body>
<h1>sensor hub</h1>
<h2>devices</h2>
<ul>
{devices}
</ul>
<h2>processors</h2>
<ul>
{processors}
</ul>
</body>
</html>
"#
    ))
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

async fn handle_not_found() -> Response {
    not_found("unknown path")
}

/// Build the axum router, with CORS wide open for every route per the
/// read-only view's `Access-Control-Allow-Origin: *` contract.
fn build_router(shared: SharedState) -> Router {
    let state = Arc::new(AppState { shared });

    Router::new()
        .route("/", get(handle_index))
        .route("/devices/{key}", get(handle_device))
        .route("/processors/{key}", get(handle_processor))
        .fallback(handle_not_found)
        .layer(axum::middleware::map_response(add_cors_header))
        .with_state(state)
}

async fn add_cors_header(mut response: Response) -> Response {
    response
        .headers_mut()
        .insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    response
}

/// Run the HTTP view server, serving until the process is terminated.
pub async fn run_server(shared: SharedState, address: &str, port: u16) {
    let app = build_router(shared);
    let addr = format!("{address}:{port}");
    info!("HTTP view listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await.expect("failed to bind HTTP listener");
    axum::serve(listener, app).await.expect("HTTP server exited unexpectedly");
}

#[cfg(test)]
mod tests {
    use super::*;
    use sensorhub_core::snapshot::{new_shared_state, QuantitySample, StateSnapshot};
    use std::collections::BTreeMap;

    fn sample_state() -> SharedState {
        let shared = new_shared_state();
        let mut data = BTreeMap::new();
        data.insert("ax".to_string(), QuantitySample { time: 1.0, value: 0.5 });
        let mut state = StateSnapshot::default();
        state.devices.push(DeviceSnapshot {
            id: "device0_id".to_string(),
            name: "MTi-G-710".to_string(),
            connected: true,
            time: 1.0,
            data,
        });
        state.processors.push(ProcessorSnapshot {
            name: "stats0".to_string(),
            json: "{\"count\":1}".to_string(),
            registers: vec![1, 2, 3],
        });
        *shared.lock().unwrap() = state;
        shared
    }

    #[test]
    fn find_device_matches_by_index_id_or_name() {
        let shared = sample_state();
        let snapshot = shared.lock().unwrap();
        assert!(find_device(&snapshot.devices, "0").is_some());
        assert!(find_device(&snapshot.devices, "device0_id").is_some());
        assert!(find_device(&snapshot.devices, "MTi-G-710").is_some());
        assert!(find_device(&snapshot.devices, "missing").is_none());
    }

    #[test]
    fn find_processor_matches_by_index_or_name() {
        let shared = sample_state();
        let snapshot = shared.lock().unwrap();
        assert!(find_processor(&snapshot.processors, "0").is_some());
        assert!(find_processor(&snapshot.processors, "stats0").is_some());
        assert!(find_processor(&snapshot.processors, "missing").is_none());
    }

    #[test]
    fn device_response_carries_quantity_samples() {
        let shared = sample_state();
        let snapshot = shared.lock().unwrap();
        let response = DeviceResponse::from(&snapshot.devices[0]);
        assert!(response.data.contains_key("ax"));
    }
}
