//! Device-policy retrieval and distribution through the public API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use iotcs_device::{
    ClientError, DevicePolicy, DevicePolicyManager, FormulaEvaluator, PolicyChangeListener,
    Response, SimpleFormulaEvaluator, Transport,
};
use serde_json::{json, Map};

struct ScriptedTransport {
    gets: Mutex<Vec<String>>,
    response: Response,
}

impl Transport for ScriptedTransport {
    fn get(&self, rest_api: &str) -> Result<Response, ClientError> {
        self.gets.lock().unwrap().push(rest_api.to_owned());
        Ok(self.response.clone())
    }

    fn post(
        &self,
        _rest_api: &str,
        _payload: &[u8],
        _timeout: Option<Duration>,
    ) -> Result<Response, ClientError> {
        Ok(Response::new(202, Vec::new()))
    }
}

#[derive(Default)]
struct CountingListener {
    assigned: AtomicUsize,
}

impl PolicyChangeListener for CountingListener {
    fn policy_assigned(&self, _policy: &DevicePolicy) {
        self.assigned.fetch_add(1, Ordering::Relaxed);
    }

    fn policy_unassigned(&self, _policy: &DevicePolicy) {}
}

#[test]
fn policies_are_fetched_once_and_distributed() {
    let transport = ScriptedTransport {
        gets: Mutex::new(Vec::new()),
        response: Response::new(
            200,
            br#"{"items":[{"id":"p1","deviceModelUrn":"urn:test:m","enabled":true,
                 "pipelines":{"t":[{"id":"filter","parameters":{"condition":"t > 0"}}]}}]}"#
                .to_vec(),
        ),
    };

    let manager = DevicePolicyManager::new();
    let listener = Arc::new(CountingListener::default());
    manager.add_listener(listener.clone());

    let policy = manager
        .policy_for(&transport, "urn:test:m")
        .unwrap()
        .expect("the scripted policy must be found");
    assert_eq!(policy.id, "p1");
    assert_eq!(listener.assigned.load(Ordering::Relaxed), 1);

    // Served from the cache afterwards.
    manager.policy_for(&transport, "urn:test:m").unwrap().unwrap();
    let gets = transport.gets.lock().unwrap();
    assert_eq!(gets.len(), 1);
    assert_eq!(gets[0], "/deviceModels/urn:test:m/devicePolicies");
}

#[test]
fn model_without_policy_is_remembered_as_a_miss() {
    let transport = ScriptedTransport {
        gets: Mutex::new(Vec::new()),
        response: Response::new(404, Vec::new()),
    };

    let manager = DevicePolicyManager::new();
    assert!(manager.policy_for(&transport, "urn:test:none").unwrap().is_none());
    assert!(manager.policy_for(&transport, "urn:test:none").unwrap().is_none());
    assert_eq!(transport.gets.lock().unwrap().len(), 1);
}

#[test]
fn formula_evaluator_covers_policy_conditions() {
    let mut attributes = Map::new();
    attributes.insert("t".into(), json!(3));

    let evaluator = SimpleFormulaEvaluator;
    assert_eq!(evaluator.evaluate("t > 0", &attributes), Some(json!(true)));
    assert_eq!(evaluator.evaluate("2*t", &attributes), Some(json!(6.0)));
    assert_eq!(evaluator.evaluate("pressure > 0", &attributes), None);
}
