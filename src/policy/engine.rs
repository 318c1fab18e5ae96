//! Applies the active device policy to outbound messages.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::{json, Map, Value};

use crate::error::ClientError;
use crate::message::{AlertSeverity, Message, MessageType, Payload};
use crate::persistence::MessagePersistence;
use crate::transport::Transport;

use super::functions::{
    self, DeviceFunctionRegistry, FunctionContext, ALERT_TRIGGERED_KEY, WINDOW_START_KEY,
};
use super::{formula, DevicePolicy, DevicePolicyManager, FormulaEvaluator, PolicyFunction};

/// Scratch owner: (device model URN, attribute or `*`, pipeline step).
type ScratchKey = (String, String, String);

pub(crate) struct MessagingPolicyEngine {
    manager: Arc<DevicePolicyManager>,
    registry: DeviceFunctionRegistry,
    evaluator: Arc<dyn FormulaEvaluator>,
    persistence: Option<Arc<MessagePersistence>>,
    scratch: Mutex<HashMap<ScratchKey, Map<String, Value>>>,
}

/// Outcome of one pipeline step.
enum StepOutcome {
    Value(Value),
    Dropped,
}

impl MessagingPolicyEngine {
    pub fn new(
        manager: Arc<DevicePolicyManager>,
        evaluator: Arc<dyn FormulaEvaluator>,
        persistence: Option<Arc<MessagePersistence>>,
    ) -> MessagingPolicyEngine {
        MessagingPolicyEngine {
            manager,
            registry: DeviceFunctionRegistry::with_builtins(),
            evaluator,
            persistence,
            scratch: Mutex::new(HashMap::new()),
        }
    }

    /// Runs the message through the model's policy. The result may be
    /// empty (everything filtered or buffered), the transformed message,
    /// or several messages (batch flush, synthesized alerts).
    pub fn apply_policies(
        &self,
        connection: &dyn Transport,
        endpoint_id: &str,
        device_model_urn: &str,
        message: Message,
    ) -> Result<Vec<Message>, ClientError> {
        if message.kind() != MessageType::Data {
            return Ok(vec![message]);
        }

        let policy = match self.manager.policy_for(connection, device_model_urn)? {
            Some(policy) => policy,
            None => return Ok(vec![message]),
        };

        let now = Utc::now().timestamp_millis();
        let mut alerts = Vec::new();
        let message = self.apply_attribute_pipelines(
            &policy,
            device_model_urn,
            endpoint_id,
            message,
            now,
            &mut alerts,
        );

        let mut out = Vec::new();
        if let Some(message) = message {
            out.extend(self.apply_model_pipeline(
                &policy,
                device_model_urn,
                endpoint_id,
                message,
                now,
            )?);
        }
        out.extend(alerts);
        Ok(out)
    }

    fn apply_attribute_pipelines(
        &self,
        policy: &DevicePolicy,
        device_model_urn: &str,
        endpoint_id: &str,
        mut message: Message,
        now: i64,
        alerts: &mut Vec<Message>,
    ) -> Option<Message> {
        let data = match message.payload().data() {
            Some(data) => data.clone(),
            None => return Some(message),
        };

        let mut result = data.clone();

        for (attribute, value) in &data {
            let Some(pipeline) = policy.attribute_pipeline(attribute) else {
                continue;
            };

            let mut current = value.clone();
            let mut survived = true;

            for (index, step) in pipeline.iter().enumerate() {
                // The condition context sees the pipeline's current value.
                let mut attributes = result.clone();
                attributes.insert(attribute.clone(), current.clone());

                match self.run_step(
                    device_model_urn,
                    Some(attribute),
                    &attributes,
                    index,
                    step,
                    &current,
                    now,
                    alerts,
                    endpoint_id,
                ) {
                    StepOutcome::Value(next) => current = next,
                    StepOutcome::Dropped => {
                        survived = false;
                        break;
                    }
                }
            }

            if survived {
                result.insert(attribute.clone(), current);
            } else {
                result.remove(attribute);
            }
        }

        self.add_computed_metrics(policy, &data, &mut result);

        if result.is_empty() {
            log::trace!(
                "Every data item of message {} was filtered out",
                message.client_id()
            );
            return None;
        }

        if let Payload::Data { data, .. } = message.payload_mut() {
            *data = result;
        }
        Some(message)
    }

    /// Evaluates computed metrics whose trigger attributes all arrived in
    /// this message, adding them as additional data items.
    fn add_computed_metrics(
        &self,
        policy: &DevicePolicy,
        original: &Map<String, Value>,
        result: &mut Map<String, Value>,
    ) {
        for (attribute, pipeline) in &policy.pipelines {
            if attribute == "*" || original.contains_key(attribute) {
                continue;
            }
            let Some(formula_text) = pipeline.iter().find_map(|step| {
                if step.id == "computedMetric" {
                    step.parameters.get("formula").and_then(Value::as_str)
                } else {
                    None
                }
            }) else {
                continue;
            };

            let triggers = formula::referenced_attributes(formula_text);
            if triggers.is_empty() || !triggers.iter().all(|t| original.contains_key(t)) {
                continue;
            }

            if let Some(value) = self.evaluator.evaluate(formula_text, result) {
                result.insert(attribute.clone(), value);
            }
        }
    }

    fn apply_model_pipeline(
        &self,
        policy: &DevicePolicy,
        device_model_urn: &str,
        endpoint_id: &str,
        message: Message,
        now: i64,
    ) -> Result<Vec<Message>, ClientError> {
        let Some(pipeline) = policy.model_pipeline() else {
            return Ok(vec![message]);
        };

        let mut messages = vec![message];

        for (index, step) in pipeline.iter().enumerate() {
            if step.id == "batchBy" {
                messages =
                    self.run_batch_by(device_model_urn, endpoint_id, index, step, messages, now)?;
                continue;
            }

            let mut survivors = Vec::with_capacity(messages.len());
            let mut alerts = Vec::new();
            for mut message in messages {
                let data = match message.payload().data() {
                    Some(data) => data.clone(),
                    None => {
                        survivors.push(message);
                        continue;
                    }
                };

                let outcome = self.run_step(
                    device_model_urn,
                    None,
                    &data,
                    index,
                    step,
                    &Value::Object(data.clone()),
                    now,
                    &mut alerts,
                    endpoint_id,
                );
                match outcome {
                    StepOutcome::Value(Value::Object(new_data)) => {
                        if let Payload::Data { data, .. } = message.payload_mut() {
                            *data = new_data;
                        }
                        survivors.push(message);
                    }
                    StepOutcome::Value(_) => survivors.push(message),
                    StepOutcome::Dropped => {}
                }
            }
            survivors.extend(alerts);
            messages = survivors;
        }

        Ok(messages)
    }

    fn run_batch_by(
        &self,
        device_model_urn: &str,
        endpoint_id: &str,
        index: usize,
        step: &PolicyFunction,
        messages: Vec<Message>,
        now: i64,
    ) -> Result<Vec<Message>, ClientError> {
        let Some(function) = self.registry.get("batchBy") else {
            return Ok(messages);
        };

        let mut out = Vec::new();
        for message in messages {
            let wire = serde_json::to_value(&message)
                .map_err(|e| ClientError::Other(anyhow::anyhow!("batch serialization: {e}")))?;

            if let Some(persistence) = &self.persistence {
                if let Err(e) = persistence.save_batch_by(endpoint_id, &message) {
                    log::warn!("Unable to persist a batched message: {e:?}");
                }
            }

            let empty = Map::new();
            let ctx = FunctionContext {
                device_model_urn,
                attribute: None,
                attributes: &empty,
                evaluator: self.evaluator.as_ref(),
                now_ms: now,
            };
            let flushed = self.with_scratch(
                device_model_urn,
                "*",
                index,
                &step.id,
                now,
                &step.parameters,
                |scratch, expired| {
                    let ready = function.apply(&ctx, &step.parameters, scratch, &wire);
                    if ready || expired {
                        function.get(&ctx, &step.parameters, scratch)
                    } else {
                        None
                    }
                },
            );

            if let Some(Value::Array(batch)) = flushed {
                log::debug!(
                    "Batching policy flushed {} messages for {device_model_urn}",
                    batch.len()
                );
                for wire_message in batch {
                    // Through the wire form so the restored message gets
                    // a fresh ordinal.
                    let restored = serde_json::to_vec(&wire_message)
                        .map_err(anyhow::Error::from)
                        .and_then(|bytes| {
                            Message::from_wire_json(&bytes).map_err(anyhow::Error::from)
                        });
                    match restored {
                        Ok(message) => out.push(message),
                        Err(e) => log::warn!("Dropping a batched message that no longer parses: {e}"),
                    }
                }
                if let Some(persistence) = &self.persistence {
                    if let Err(e) = persistence.clear_batch_by(endpoint_id) {
                        log::warn!("Unable to clear persisted batch state: {e:?}");
                    }
                }
            }
        }
        Ok(out)
    }

    #[allow(clippy::too_many_arguments)]
    fn run_step(
        &self,
        device_model_urn: &str,
        attribute: Option<&str>,
        attributes: &Map<String, Value>,
        index: usize,
        step: &PolicyFunction,
        value: &Value,
        now: i64,
        alerts: &mut Vec<Message>,
        endpoint_id: &str,
    ) -> StepOutcome {
        let Some(function) = self.registry.get(&step.id) else {
            log::warn!("Unknown policy function '{}', passing value through", step.id);
            return StepOutcome::Value(value.clone());
        };

        let scope = attribute.unwrap_or("*");
        let ctx = FunctionContext {
            device_model_urn,
            attribute,
            attributes,
            evaluator: self.evaluator.as_ref(),
            now_ms: now,
        };
        let outcome = self.with_scratch(
            device_model_urn,
            scope,
            index,
            &step.id,
            now,
            &step.parameters,
            |scratch, expired| {
                let ready = function.apply(&ctx, &step.parameters, scratch, value);

                if scratch.remove(ALERT_TRIGGERED_KEY).is_some() {
                    alerts.push(build_alert(
                        endpoint_id,
                        device_model_urn,
                        attribute,
                        value,
                        &step.parameters,
                    ));
                }

                if ready || expired {
                    Some(function.get(&ctx, &step.parameters, scratch))
                } else {
                    None
                }
            },
        );

        match outcome {
            Some(Some(next)) => StepOutcome::Value(next),
            // Ready but no value (e.g. an expired window that never saw
            // data) ends the attribute for this message.
            Some(None) | None => StepOutcome::Dropped,
        }
    }

    /// Runs `body` with the step's scratch checked out, handling window
    /// bookkeeping around it. Functions that slide their own window leave
    /// `windowStart` updated; for the rest an expired window restarts at
    /// now.
    #[allow(clippy::too_many_arguments)]
    fn with_scratch<R>(
        &self,
        device_model_urn: &str,
        scope: &str,
        index: usize,
        function_id: &str,
        now: i64,
        params: &Map<String, Value>,
        body: impl FnOnce(&mut Map<String, Value>, bool) -> R,
    ) -> R {
        let key = (
            device_model_urn.to_owned(),
            scope.to_owned(),
            format!("{index}:{function_id}"),
        );

        let mut scratch_map = self.scratch.lock().expect("policy scratch lock");
        let mut scratch = scratch_map.remove(&key).unwrap_or_default();

        let window = functions::window_millis(params);
        if window.is_some() && !scratch.contains_key(WINDOW_START_KEY) {
            scratch.insert(WINDOW_START_KEY.to_owned(), json!(now));
        }
        let window_start_before = scratch.get(WINDOW_START_KEY).and_then(Value::as_i64);
        let expired = matches!(
            (window, window_start_before),
            (Some(w), Some(ws)) if now >= ws + w
        );

        let result = body(&mut scratch, expired);

        if expired && scratch.get(WINDOW_START_KEY).and_then(Value::as_i64) == window_start_before
        {
            scratch.insert(WINDOW_START_KEY.to_owned(), json!(now));
        }

        scratch_map.insert(key, scratch);
        result
    }
}

fn build_alert(
    endpoint_id: &str,
    device_model_urn: &str,
    attribute: Option<&str>,
    value: &Value,
    params: &Map<String, Value>,
) -> Message {
    let format = params
        .get("urn")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .unwrap_or_else(|| format!("{device_model_urn}:alert"));

    let severity = params
        .get("severity")
        .cloned()
        .and_then(|v| serde_json::from_value::<AlertSeverity>(v).ok())
        .unwrap_or_default();

    let mut builder = Message::builder()
        .source(endpoint_id)
        .format(format)
        .severity(severity);

    if let Some(description) = params.get("description").and_then(Value::as_str) {
        builder = builder.description(description);
    }
    if let Some(attribute) = attribute {
        builder = builder.data_item(attribute, value.clone());
    }

    builder
        .build_alert()
        .expect("alert synthesis uses a non-empty format")
}
