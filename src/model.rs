//! Server-published device models.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Deserialize;

use crate::error::ClientError;
use crate::transport::Transport;

/// Value type of a device model attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttributeType {
    Boolean,
    Number,
    Integer,
    String,
    Datetime,
    Uri,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attribute {
    pub name: String,
    #[serde(rename = "type")]
    pub attr_type: AttributeType,
    #[serde(default)]
    pub description: Option<String>,
    /// Inclusive bounds in the form `"low,high"`.
    #[serde(default)]
    pub range: Option<String>,
    #[serde(default)]
    pub writable: bool,
}

impl Attribute {
    /// Parsed numeric bounds, if the model declares any.
    pub fn bounds(&self) -> Option<(f64, f64)> {
        let range = self.range.as_deref()?;
        let (low, high) = range.split_once(',')?;
        Some((low.trim().parse().ok()?, high.trim().parse().ok()?))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub arg_type: Option<AttributeType>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Format {
    pub urn: String,
    pub name: String,
    #[serde(rename = "type", default)]
    pub format_type: Option<String>,
}

/// Schema of one device kind, keyed by URN.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceModel {
    pub urn: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    attributes: Vec<Attribute>,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub formats: Vec<Format>,
}

impl DeviceModel {
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }
}

/// Cache of retrieved device models. Models never change under a URN, so
/// one successful retrieval is enough for the process lifetime.
pub struct DeviceModelRegistry {
    allow_draft: bool,
    models: Mutex<HashMap<String, Arc<DeviceModel>>>,
}

impl DeviceModelRegistry {
    pub fn new(allow_draft: bool) -> DeviceModelRegistry {
        DeviceModelRegistry {
            allow_draft,
            models: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(
        &self,
        connection: &dyn Transport,
        urn: &str,
    ) -> Result<Arc<DeviceModel>, ClientError> {
        if let Some(model) = self.models.lock().expect("model cache lock").get(urn) {
            return Ok(model.clone());
        }

        log::debug!("Retrieving device model {urn}");
        let response = connection.get(&format!("/deviceModels/{urn}"))?;
        if !response.is_success() {
            return Err(response.into_error());
        }

        let model: DeviceModel = response.json()?;
        if model.draft && !self.allow_draft {
            return Err(ClientError::Config(format!(
                "device model '{urn}' is a draft and draft models are not allowed"
            )));
        }

        let model = Arc::new(model);
        self.models
            .lock()
            .expect("model cache lock")
            .insert(urn.to_owned(), model.clone());
        Ok(model)
    }

    pub fn cached(&self, urn: &str) -> Option<Arc<DeviceModel>> {
        self.models.lock().expect("model cache lock").get(urn).cloned()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const MODEL_JSON: &str = r#"{
        "urn": "urn:test:thermometer",
        "name": "thermometer",
        "attributes": [
            {"name": "temperature", "type": "NUMBER", "range": "-40,125"},
            {"name": "unit", "type": "STRING", "writable": true}
        ],
        "actions": [{"name": "reset"}],
        "formats": [{"urn": "urn:test:thermometer:alert", "name": "overheat", "type": "ALERT"}]
    }"#;

    #[test]
    fn model_parses_and_indexes_attributes() {
        let model: DeviceModel = serde_json::from_str(MODEL_JSON).unwrap();
        assert_eq!(model.urn, "urn:test:thermometer");
        assert!(!model.draft);

        let temperature = model.attribute("temperature").unwrap();
        assert_eq!(temperature.attr_type, AttributeType::Number);
        assert_eq!(temperature.bounds(), Some((-40.0, 125.0)));

        let unit = model.attribute("unit").unwrap();
        assert!(unit.writable);
        assert_eq!(unit.bounds(), None);

        assert!(model.attribute("missing").is_none());
        assert_eq!(model.actions.len(), 1);
        assert_eq!(model.formats.len(), 1);
    }

    #[test]
    fn draft_models_are_gated() {
        let json = r#"{"urn": "urn:test:x", "name": "x", "draft": true}"#;
        let model: DeviceModel = serde_json::from_str(json).unwrap();
        assert!(model.draft);
    }
}
