//! Server-published device policies: retrieval, caching and distribution.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::ClientError;
use crate::transport::Transport;

pub(crate) mod engine;
pub(crate) mod functions;
pub mod formula;

pub use formula::SimpleFormulaEvaluator;

/// Evaluates policy formulas over the attributes of a message.
///
/// The full formula language ships as a separate library; anything that
/// implements this trait can be plugged into the client builder.
pub trait FormulaEvaluator: Send + Sync {
    /// `None` means the formula does not apply (unknown attribute, parse
    /// failure); policy functions treat that as "condition not met".
    fn evaluate(&self, formula: &str, attributes: &Map<String, Value>) -> Option<Value>;
}

/// One step of a pipeline: a function id plus its parameters.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PolicyFunction {
    pub id: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

/// A per-model policy. Pipelines are keyed by attribute name; the `"*"`
/// entry runs once over the whole message. Policies are immutable once
/// loaded and replaced wholesale when the server pushes a change.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DevicePolicy {
    pub id: String,
    pub device_model_urn: String,
    #[serde(default)]
    pub pipelines: HashMap<String, Vec<PolicyFunction>>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub last_modified: i64,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl DevicePolicy {
    /// Pipeline applied to one attribute. The `"*"` pipeline is not a
    /// fallback for attributes; it runs separately over the message.
    pub fn attribute_pipeline(&self, attribute: &str) -> Option<&[PolicyFunction]> {
        self.pipelines.get(attribute).map(Vec::as_slice)
    }

    pub fn model_pipeline(&self) -> Option<&[PolicyFunction]> {
        self.pipelines.get("*").map(Vec::as_slice)
    }
}

#[derive(Debug, Deserialize)]
struct PolicyList {
    #[serde(default)]
    items: Vec<DevicePolicy>,
}

/// Observes policy assignment changes.
pub trait PolicyChangeListener: Send + Sync {
    fn policy_assigned(&self, policy: &DevicePolicy);
    fn policy_unassigned(&self, policy: &DevicePolicy);
}

/// Fetches, caches and distributes policies per device model.
pub struct DevicePolicyManager {
    policies: Mutex<HashMap<String, Arc<DevicePolicy>>>,
    /// URNs known to have no policy, so they are not re-fetched per message.
    misses: Mutex<HashMap<String, ()>>,
    listeners: Mutex<Vec<Arc<dyn PolicyChangeListener>>>,
}

impl DevicePolicyManager {
    pub fn new() -> DevicePolicyManager {
        DevicePolicyManager {
            policies: Mutex::new(HashMap::new()),
            misses: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn PolicyChangeListener>) {
        self.listeners.lock().expect("listener lock").push(listener);
    }

    /// The currently effective policy for a model, fetching it on first
    /// use. A model without a policy is remembered as a miss.
    pub fn policy_for(
        &self,
        connection: &dyn Transport,
        device_model_urn: &str,
    ) -> Result<Option<Arc<DevicePolicy>>, ClientError> {
        if let Some(policy) = self
            .policies
            .lock()
            .expect("policy lock")
            .get(device_model_urn)
        {
            return Ok(Some(policy.clone()));
        }
        if self
            .misses
            .lock()
            .expect("policy miss lock")
            .contains_key(device_model_urn)
        {
            return Ok(None);
        }

        log::debug!("Retrieving device policies for model {device_model_urn}");
        let response =
            connection.get(&format!("/deviceModels/{device_model_urn}/devicePolicies"))?;
        if response.status == 404 {
            self.misses
                .lock()
                .expect("policy miss lock")
                .insert(device_model_urn.to_owned(), ());
            return Ok(None);
        }
        if !response.is_success() {
            return Err(response.into_error());
        }

        let list: PolicyList = response.json()?;
        let policy = list.items.into_iter().find(|p| p.enabled);

        match policy {
            Some(policy) => {
                let policy = Arc::new(policy);
                self.install(policy.clone());
                Ok(Some(policy))
            }
            None => {
                self.misses
                    .lock()
                    .expect("policy miss lock")
                    .insert(device_model_urn.to_owned(), ());
                Ok(None)
            }
        }
    }

    pub fn cached(&self, device_model_urn: &str) -> Option<Arc<DevicePolicy>> {
        self.policies
            .lock()
            .expect("policy lock")
            .get(device_model_urn)
            .cloned()
    }

    /// Replaces the cache entries named by a server push. Disabled
    /// policies remove the assignment.
    pub fn apply_push(&self, policies: Vec<DevicePolicy>) {
        for policy in policies {
            if policy.enabled {
                self.install(Arc::new(policy));
            } else {
                self.remove(&policy.device_model_urn);
            }
        }
    }

    /// Handles the body of a `policyChanged` request from the server.
    pub fn process_policy_change(&self, body: &[u8]) -> Result<(), ClientError> {
        #[derive(Deserialize)]
        struct PolicyChange {
            #[serde(default)]
            items: Vec<DevicePolicy>,
        }

        let change: PolicyChange = serde_json::from_slice(body).map_err(|e| {
            ClientError::Other(anyhow::anyhow!("unable to parse policy change body: {e}"))
        })?;
        self.apply_push(change.items);
        Ok(())
    }

    fn install(&self, policy: Arc<DevicePolicy>) {
        let urn = policy.device_model_urn.clone();
        let previous = {
            let mut policies = self.policies.lock().expect("policy lock");
            self.misses.lock().expect("policy miss lock").remove(&urn);
            policies.insert(urn.clone(), policy.clone())
        };

        log::info!("Device policy {} is now assigned to {urn}", policy.id);

        // Listeners run without any manager lock held.
        let listeners = self.listeners.lock().expect("listener lock").clone();
        for listener in &listeners {
            if let Some(previous) = &previous {
                listener.policy_unassigned(previous);
            }
            listener.policy_assigned(&policy);
        }
    }

    fn remove(&self, device_model_urn: &str) {
        let previous = self
            .policies
            .lock()
            .expect("policy lock")
            .remove(device_model_urn);

        if let Some(previous) = previous {
            log::info!(
                "Device policy {} was unassigned from {device_model_urn}",
                previous.id
            );
            let listeners = self.listeners.lock().expect("listener lock").clone();
            for listener in &listeners {
                listener.policy_unassigned(&previous);
            }
        }
    }
}

impl Default for DevicePolicyManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn policy(id: &str, urn: &str, enabled: bool) -> DevicePolicy {
        DevicePolicy {
            id: id.to_owned(),
            device_model_urn: urn.to_owned(),
            pipelines: HashMap::new(),
            enabled,
            last_modified: 0,
            description: None,
        }
    }

    #[derive(Default)]
    struct CountingListener {
        assigned: AtomicUsize,
        unassigned: AtomicUsize,
    }

    impl PolicyChangeListener for CountingListener {
        fn policy_assigned(&self, _policy: &DevicePolicy) {
            self.assigned.fetch_add(1, Ordering::Relaxed);
        }

        fn policy_unassigned(&self, _policy: &DevicePolicy) {
            self.unassigned.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn push_replaces_wholesale_and_notifies() {
        let manager = DevicePolicyManager::new();
        let listener = Arc::new(CountingListener::default());
        manager.add_listener(listener.clone());

        manager.apply_push(vec![policy("p1", "urn:m", true)]);
        assert_eq!(manager.cached("urn:m").unwrap().id, "p1");
        assert_eq!(listener.assigned.load(Ordering::Relaxed), 1);

        manager.apply_push(vec![policy("p2", "urn:m", true)]);
        assert_eq!(manager.cached("urn:m").unwrap().id, "p2");
        assert_eq!(listener.assigned.load(Ordering::Relaxed), 2);
        assert_eq!(listener.unassigned.load(Ordering::Relaxed), 1);

        manager.apply_push(vec![policy("p2", "urn:m", false)]);
        assert!(manager.cached("urn:m").is_none());
        assert_eq!(listener.unassigned.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn policy_change_body_parses() {
        let manager = DevicePolicyManager::new();
        let body = br#"{"items":[{"id":"p1","deviceModelUrn":"urn:m","pipelines":{"t":[{"id":"filter","parameters":{"condition":"t > 0"}}]}}]}"#;
        manager.process_policy_change(body).unwrap();

        let cached = manager.cached("urn:m").unwrap();
        let pipeline = cached.attribute_pipeline("t").unwrap();
        assert_eq!(pipeline[0].id, "filter");
        assert_eq!(pipeline[0].parameters["condition"], "t > 0");
    }
}
