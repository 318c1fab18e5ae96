//! Request and response envelopes exchanged with the server.
//!
//! Bodies travel base64-encoded; the accessors below hide the encoding so
//! handlers work with plain bytes.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// A server-to-device request delivered through the receive channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: HashMap<String, Vec<String>>,
    /// Base64 of the request body.
    #[serde(default)]
    pub body: String,
}

impl RequestMessage {
    /// Decoded request body. Invalid base64 is treated as an empty body;
    /// the handler answers based on path and method anyway.
    pub fn body_bytes(&self) -> Vec<u8> {
        BASE64.decode(&self.body).unwrap_or_default()
    }

    /// Request ID used to correlate the response; falls back to the
    /// message client ID.
    pub fn request_id(&self) -> Option<&str> {
        self.id.as_deref().or(self.client_id.as_deref())
    }
}

/// The device's answer to a [`RequestMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMessage {
    pub status_code: u16,
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, Vec<String>>,
    /// Base64 of the response body.
    #[serde(default)]
    pub body: String,
}

impl ResponseMessage {
    pub fn new(request: &RequestMessage, status_code: u16, body: &[u8]) -> ResponseMessage {
        ResponseMessage {
            status_code,
            url: request.path.clone(),
            request_id: request.request_id().map(str::to_owned),
            headers: HashMap::new(),
            body: BASE64.encode(body),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.entry(name.into()).or_default().push(value.into());
        self
    }

    pub fn body_bytes(&self) -> Vec<u8> {
        BASE64.decode(&self.body).unwrap_or_default()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn request() -> RequestMessage {
        RequestMessage {
            id: Some("42".into()),
            client_id: Some("b8e2cd1a-9d13-4b6b-9f1e-0a77d27f4bfa".into()),
            source: Some("0-SERVER".into()),
            destination: Some("0-DEVICE".into()),
            method: "GET".into(),
            path: "deviceModels/urn:test/attributes".into(),
            headers: HashMap::new(),
            body: BASE64.encode(b"{}"),
        }
    }

    #[test]
    fn request_round_trip() {
        let message = request();
        let json = serde_json::to_string(&message).unwrap();
        let parsed: RequestMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, message);
        assert_eq!(parsed.body_bytes(), b"{}");
    }

    #[test]
    fn request_wire_names_are_camel_case() {
        let json = serde_json::to_value(request()).unwrap();
        assert!(json.get("clientId").is_some());
        assert!(json.get("method").is_some());
        assert!(json.get("path").is_some());
    }

    #[test]
    fn response_correlates_with_request() {
        let request = request();
        let response = ResponseMessage::new(&request, 200, b"ok");

        assert_eq!(response.request_id.as_deref(), Some("42"));
        assert_eq!(response.url, request.path);
        assert_eq!(response.body_bytes(), b"ok");

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["statusCode"], 200);
        assert!(json.get("requestId").is_some());
    }

    #[test]
    fn missing_id_falls_back_to_client_id() {
        let mut message = request();
        message.id = None;
        assert_eq!(
            message.request_id(),
            Some("b8e2cd1a-9d13-4b6b-9f1e-0a77d27f4bfa")
        );
    }
}
