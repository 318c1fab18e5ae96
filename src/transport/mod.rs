//! REST-over-transport abstraction.
//!
//! Callers speak a small REST surface (`get`, `post`) regardless of whether
//! the bytes travel over HTTP or MQTT. The device-side surface has no PUT,
//! DELETE or PATCH; those fail uniformly.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use crate::config::Config;
use crate::error::ClientError;
use crate::trust::{SignAlgorithm, TrustedAssetsStore};

mod http;
mod mqtt;
pub(crate) mod topics;

pub use self::http::HttpConnection;
pub use self::mqtt::MqttConnection;

/// Outcome of a REST call, independent of the carrying transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub data: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl Response {
    pub fn new(status: u16, data: Vec<u8>) -> Response {
        Response {
            status,
            data,
            headers: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, ClientError> {
        serde_json::from_slice(&self.data).map_err(|e| {
            ClientError::Other(anyhow::anyhow!(
                "unable to parse response body as JSON: {e}"
            ))
        })
    }

    /// Converts a non-success response into the boundary error, using the
    /// error envelope title when the body carries one.
    pub fn into_error(self) -> ClientError {
        let title = ErrorEnvelope::parse(&self.data)
            .and_then(|envelope| envelope.title)
            .unwrap_or_default();
        ClientError::status_error(self.status, title)
    }
}

/// Error body used by HTTP error responses and the MQTT `/error` topics.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorEnvelope {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub title: Option<String>,
    pub status: Option<u16>,
    pub detail: Option<String>,
    #[serde(rename = "o:errorCode")]
    pub error_code: Option<i64>,
}

impl ErrorEnvelope {
    pub fn parse(data: &[u8]) -> Option<ErrorEnvelope> {
        serde_json::from_slice(data).ok()
    }
}

/// Uniform REST contract over a secure transport.
pub trait Transport: Send + Sync {
    fn get(&self, rest_api: &str) -> Result<Response, ClientError>;

    fn post(
        &self,
        rest_api: &str,
        payload: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Response, ClientError>;

    fn put(&self, _rest_api: &str, _payload: &[u8]) -> Result<Response, ClientError> {
        Err(ClientError::Unsupported("PUT"))
    }

    fn delete(&self, _rest_api: &str) -> Result<Response, ClientError> {
        Err(ClientError::Unsupported("DELETE"))
    }

    fn patch(&self, _rest_api: &str, _payload: &[u8]) -> Result<Response, ClientError> {
        Err(ClientError::Unsupported("PATCH"))
    }

    /// Whether the receive worker may long poll over this transport.
    fn supports_long_polling(&self) -> bool {
        false
    }

    /// Server-to-device request payloads that arrived out of band
    /// (subscription-based transports only).
    fn take_inbound(&self, _max: usize) -> Vec<Vec<u8>> {
        Vec::new()
    }

    /// Throws away cached credentials and whatever session was built on
    /// them, so the next request authenticates afresh. Called after the
    /// server rejects a send with a credential error.
    fn refresh_credentials(&self) {}

    /// True while the transport believes its link is down. The receive
    /// worker uses this to hold off until the next successful send.
    fn is_connection_lost(&self) -> bool {
        false
    }

    fn close(&self) {}
}

/// The two device-side transports as one owned value.
pub enum SecureConnection {
    Http(HttpConnection),
    Mqtt(MqttConnection),
}

impl SecureConnection {
    /// Picks the variant from the provisioned server scheme. The plain
    /// `mqtt` and websocket schemes are intentionally not recognized; the
    /// device only talks TLS.
    pub fn from_store(
        store: Arc<dyn TrustedAssetsStore>,
        config: &Config,
    ) -> Result<SecureConnection, ClientError> {
        let scheme = store.server_scheme();
        match scheme.as_str() {
            "https" => Ok(SecureConnection::Http(HttpConnection::new(store))),
            "mqtts" | "ssl" => Ok(SecureConnection::Mqtt(MqttConnection::new(store, config))),
            other => Err(ClientError::Config(format!(
                "unsupported server scheme '{other}' (expected 'https', 'mqtts' or 'ssl')"
            ))),
        }
    }

    fn inner(&self) -> &dyn Transport {
        match self {
            SecureConnection::Http(http) => http,
            SecureConnection::Mqtt(mqtt) => mqtt,
        }
    }
}

impl Transport for SecureConnection {
    fn get(&self, rest_api: &str) -> Result<Response, ClientError> {
        self.inner().get(rest_api)
    }

    fn post(
        &self,
        rest_api: &str,
        payload: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Response, ClientError> {
        self.inner().post(rest_api, payload, timeout)
    }

    fn supports_long_polling(&self) -> bool {
        self.inner().supports_long_polling()
    }

    fn take_inbound(&self, max: usize) -> Vec<Vec<u8>> {
        self.inner().take_inbound(max)
    }

    fn refresh_credentials(&self) {
        self.inner().refresh_credentials()
    }

    fn is_connection_lost(&self) -> bool {
        self.inner().is_connection_lost()
    }

    fn close(&self) {
        self.inner().close()
    }
}

/// Builds the bearer assertion used to authenticate the transport link.
///
/// Before activation the assertion is HMAC-signed with the shared secret;
/// once a key pair exists it is signed with the private key, which is also
/// the fallback used to recover a partially activated device.
pub(crate) fn client_assertion(
    store: &dyn TrustedAssetsStore,
    use_private_key: bool,
) -> Result<String, ClientError> {
    let id = store.endpoint_id().unwrap_or_else(|| store.client_id());
    let (alg_label, algorithm) = if use_private_key {
        ("RS256", SignAlgorithm::Sha256WithRsa)
    } else {
        ("HS256", SignAlgorithm::HmacSha256)
    };

    let header = json!({ "typ": "JWT", "alg": alg_label });
    let now = Utc::now().timestamp();
    let claims = json!({
        "iss": id,
        "sub": id,
        "aud": "oauth2/token",
        "iat": now,
        "exp": now + 15 * 60,
    });

    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(header.to_string()),
        URL_SAFE_NO_PAD.encode(claims.to_string()),
    );

    let signature = if use_private_key {
        store.sign_with_private_key(signing_input.as_bytes(), algorithm)?
    } else {
        store
            .sign_with_shared_secret(signing_input.as_bytes(), algorithm, None)?
            .ok_or_else(|| ClientError::Security("no shared secret is provisioned".into()))?
    };

    Ok(format!(
        "{}.{}",
        signing_input,
        URL_SAFE_NO_PAD.encode(signature)
    ))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::trust::MemoryTrustedAssetsStore;

    struct MinimalTransport;

    impl Transport for MinimalTransport {
        fn get(&self, _rest_api: &str) -> Result<Response, ClientError> {
            Ok(Response::new(200, Vec::new()))
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

    #[test]
    fn mutating_verbs_are_unsupported() {
        let transport = MinimalTransport;
        assert!(matches!(
            transport.put("/x", b"{}"),
            Err(ClientError::Unsupported("PUT"))
        ));
        assert!(matches!(
            transport.delete("/x"),
            Err(ClientError::Unsupported("DELETE"))
        ));
        assert!(matches!(
            transport.patch("/x", b"{}"),
            Err(ClientError::Unsupported("PATCH"))
        ));
    }

    #[test]
    fn error_envelope_parses_server_shape() {
        let body = br#"{"type":"about:blank","title":"Bad Request","status":400,"detail":"boom","o:errorCode":42}"#;
        let envelope = ErrorEnvelope::parse(body).unwrap();
        assert_eq!(envelope.title.as_deref(), Some("Bad Request"));
        assert_eq!(envelope.status, Some(400));
        assert_eq!(envelope.error_code, Some(42));
    }

    #[test]
    fn response_error_uses_envelope_title() {
        let response = Response::new(
            400,
            br#"{"title":"Bad Request","status":400}"#.to_vec(),
        );
        match response.into_error() {
            ClientError::Status { status, title } => {
                assert_eq!(status, 400);
                assert_eq!(title, "Bad Request");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn assertion_has_three_segments() {
        let store =
            MemoryTrustedAssetsStore::new("https", "iot.example.com", 443, "client-1", b"s".to_vec());
        let assertion = client_assertion(&store, false).unwrap();
        assert_eq!(assertion.split('.').count(), 3);
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        let store = Arc::new(MemoryTrustedAssetsStore::new(
            "mqtt-ws",
            "iot.example.com",
            8883,
            "client-1",
            b"s".to_vec(),
        ));
        let result = SecureConnection::from_store(store, &Config::default());
        assert!(matches!(result, Err(ClientError::Config(_))));
    }
}
