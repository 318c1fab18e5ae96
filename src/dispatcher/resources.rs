//! Built-in resources the device exposes to the server.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::{json, Value};

use crate::message::{RequestMessage, ResponseMessage};

use super::request::{FnRequestHandler, RequestDispatcher, RequestHandler};
use super::DispatcherCore;

const DISPATCHER_CAPABILITY: &str =
    "deviceModels/urn:oracle:iot:dcd:capability:message_dispatcher";
const DIAGNOSTICS_CAPABILITY: &str = "deviceModels/urn:oracle:iot:dcd:capability:diagnostics";

pub(super) fn register_builtin_resources(
    dispatcher: &Arc<RequestDispatcher>,
    core: &Arc<DispatcherCore>,
) {
    let start_time = Utc::now().timestamp_millis();

    // counters (GET)
    register(
        dispatcher,
        &format!("{DISPATCHER_CAPABILITY}/counters"),
        "GET",
        {
            let core = core.clone();
            move |request: &RequestMessage| {
                let snapshot = core.counters.snapshot(core.queue.len());
                match serde_json::to_vec(&snapshot) {
                    Ok(body) => ResponseMessage::new(request, 200, &body),
                    Err(_) => ResponseMessage::new(request, 500, b""),
                }
            }
        },
    );

    // reset (PUT)
    register(
        dispatcher,
        &format!("{DISPATCHER_CAPABILITY}/counters/reset"),
        "PUT",
        {
            let core = core.clone();
            move |request: &RequestMessage| {
                core.counters.reset();
                ResponseMessage::new(request, 200, b"")
            }
        },
    );

    // pollingInterval (GET/PUT)
    register(
        dispatcher,
        &format!("{DISPATCHER_CAPABILITY}/pollingInterval"),
        "GET",
        {
            let core = core.clone();
            move |request: &RequestMessage| {
                let value = core.polling_interval_ms.load(Ordering::Relaxed);
                let body = json!({ "value": value }).to_string();
                ResponseMessage::new(request, 200, body.as_bytes())
            }
        },
    );
    register(
        dispatcher,
        &format!("{DISPATCHER_CAPABILITY}/pollingInterval"),
        "PUT",
        {
            let core = core.clone();
            move |request: &RequestMessage| match parse_value(&request.body_bytes()) {
                Some(value) if value >= 0 => {
                    core.polling_interval_ms.store(value as u64, Ordering::Relaxed);
                    log::info!("Polling interval was changed to {value} ms");
                    ResponseMessage::new(request, 200, b"")
                }
                _ => ResponseMessage::new(request, 400, b"polling interval must be >= 0"),
            }
        },
    );

    // diagnostics info (GET)
    register(
        dispatcher,
        &format!("{DIAGNOSTICS_CAPABILITY}/info"),
        "GET",
        {
            let core = core.clone();
            move |request: &RequestMessage| {
                let body = json!({
                    "osName": std::env::consts::OS,
                    "osArch": std::env::consts::ARCH,
                    "version": env!("CARGO_PKG_VERSION"),
                    "startTime": start_time,
                    "endpointId": core.endpoint_id,
                })
                .to_string();
                ResponseMessage::new(request, 200, body.as_bytes())
            }
        },
    );

    // testConnectivity (GET/PUT)
    let connectivity = Arc::new(Mutex::new(TestConnectivity::default()));
    register(
        dispatcher,
        &format!("{DIAGNOSTICS_CAPABILITY}/testConnectivity"),
        "GET",
        {
            let connectivity = connectivity.clone();
            move |request: &RequestMessage| {
                let state = connectivity.lock().expect("test connectivity lock");
                let body = json!({
                    "active": state.active,
                    "count": state.count,
                    "interval": state.interval_ms,
                    "size": state.size,
                })
                .to_string();
                ResponseMessage::new(request, 200, body.as_bytes())
            }
        },
    );
    register(
        dispatcher,
        &format!("{DIAGNOSTICS_CAPABILITY}/testConnectivity"),
        "PUT",
        {
            move |request: &RequestMessage| {
                let Ok(body) = serde_json::from_slice::<Value>(&request.body_bytes()) else {
                    return ResponseMessage::new(request, 400, b"body must be JSON");
                };
                let mut state = connectivity.lock().expect("test connectivity lock");
                if let Some(active) = body.get("active").and_then(Value::as_bool) {
                    state.active = active;
                }
                if let Some(count) = body.get("count").and_then(Value::as_u64) {
                    state.count = count;
                }
                if let Some(interval) = body.get("interval").and_then(Value::as_u64) {
                    state.interval_ms = interval;
                }
                if let Some(size) = body.get("size").and_then(Value::as_u64) {
                    state.size = size;
                }
                ResponseMessage::new(request, 200, b"")
            }
        },
    );
}

#[derive(Debug, Default)]
struct TestConnectivity {
    active: bool,
    count: u64,
    interval_ms: u64,
    size: u64,
}

fn register<F>(dispatcher: &Arc<RequestDispatcher>, path: &str, method: &str, handler: F)
where
    F: Fn(&RequestMessage) -> ResponseMessage + Send + Sync + 'static,
{
    let handler: Arc<dyn RequestHandler> = Arc::new(FnRequestHandler(handler));
    dispatcher.register("", path, method, handler);
}

/// Accepts `{"value": n}` or a bare number.
fn parse_value(body: &[u8]) -> Option<i64> {
    let value: Value = serde_json::from_slice(body).ok()?;
    match value {
        Value::Number(n) => n.as_i64(),
        Value::Object(map) => map.get("value").and_then(Value::as_i64),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dispatcher::testutil::test_core;
    use std::collections::HashMap;

    fn dispatcher_with_resources() -> Arc<RequestDispatcher> {
        let core = test_core();
        let dispatcher = Arc::new(RequestDispatcher::start(core.clone()));
        register_builtin_resources(&dispatcher, &core);
        dispatcher
    }

    fn request(path: &str, method: &str, body: &[u8]) -> RequestMessage {
        use base64::Engine as _;
        RequestMessage {
            id: Some("1".into()),
            client_id: None,
            source: None,
            destination: None,
            method: method.into(),
            path: path.into(),
            headers: HashMap::new(),
            body: base64::engine::general_purpose::STANDARD.encode(body),
        }
    }

    #[test]
    fn counters_resource_serves_json() {
        let dispatcher = dispatcher_with_resources();
        let response = dispatcher.dispatch(&request(
            "deviceModels/urn:oracle:iot:dcd:capability:message_dispatcher/counters",
            "GET",
            b"",
        ));
        assert_eq!(response.status_code, 200);
        let body: Value = serde_json::from_slice(&response.body_bytes()).unwrap();
        assert_eq!(body["totalMessagesSent"], 0);
        assert_eq!(body["load"], 0);
    }

    #[test]
    fn reset_requires_put() {
        let dispatcher = dispatcher_with_resources();
        let response = dispatcher.dispatch(&request(
            "deviceModels/urn:oracle:iot:dcd:capability:message_dispatcher/counters/reset",
            "GET",
            b"",
        ));
        assert_eq!(response.status_code, 405);

        let response = dispatcher.dispatch(&request(
            "deviceModels/urn:oracle:iot:dcd:capability:message_dispatcher/counters/reset",
            "PUT",
            b"",
        ));
        assert_eq!(response.status_code, 200);
    }

    #[test]
    fn polling_interval_round_trips_and_validates() {
        let dispatcher = dispatcher_with_resources();
        let path = "deviceModels/urn:oracle:iot:dcd:capability:message_dispatcher/pollingInterval";

        let response = dispatcher.dispatch(&request(path, "PUT", br#"{"value": 5000}"#));
        assert_eq!(response.status_code, 200);

        let response = dispatcher.dispatch(&request(path, "GET", b""));
        let body: Value = serde_json::from_slice(&response.body_bytes()).unwrap();
        assert_eq!(body["value"], 5000);

        let response = dispatcher.dispatch(&request(path, "PUT", br#"{"value": -1}"#));
        assert_eq!(response.status_code, 400);
    }

    #[test]
    fn diagnostics_info_reports_environment() {
        let dispatcher = dispatcher_with_resources();
        let response = dispatcher.dispatch(&request(
            "deviceModels/urn:oracle:iot:dcd:capability:diagnostics/info",
            "GET",
            b"",
        ));
        assert_eq!(response.status_code, 200);
        let body: Value = serde_json::from_slice(&response.body_bytes()).unwrap();
        assert_eq!(body["osName"], std::env::consts::OS);
        assert!(body["startTime"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_connectivity_toggles() {
        let dispatcher = dispatcher_with_resources();
        let path = "deviceModels/urn:oracle:iot:dcd:capability:diagnostics/testConnectivity";

        let response =
            dispatcher.dispatch(&request(path, "PUT", br#"{"active": true, "count": 5}"#));
        assert_eq!(response.status_code, 200);

        let response = dispatcher.dispatch(&request(path, "GET", b""));
        let body: Value = serde_json::from_slice(&response.body_bytes()).unwrap();
        assert_eq!(body["active"], true);
        assert_eq!(body["count"], 5);
    }
}
