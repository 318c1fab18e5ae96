//! Activation handshake against the cloud service.
//!
//! A freshly provisioned device knows only its client ID and shared
//! secret. Activation asks the server for its key policy, generates a key
//! pair of the requested size, proves possession of the shared secret and
//! the new private key in one signed payload, and receives the endpoint ID
//! under which the device lives from then on.

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::json;

use crate::error::ClientError;
use crate::transport::Transport;
use crate::trust::{SignAlgorithm, TrustedAssetsStore};

const CSR_FORMAT: &str = "X.509";
const KEY_ALGORITHM: &str = "RSA";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ActivationPolicy {
    pub key_type: String,
    pub key_size: u32,
    pub hash_algorithm: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DirectActivationResponse {
    endpoint_state: String,
    endpoint_id: String,
    #[serde(default)]
    certificate: Option<String>,
}

pub(crate) struct ActivationManager {
    store: Arc<dyn TrustedAssetsStore>,
    allow_draft_models: bool,
    os_name: String,
    os_version: String,
    /// Device attributes (serial number, manufacturer, ...) carried in the
    /// certification request and covered by its signature.
    attributes: BTreeMap<String, String>,
}

impl ActivationManager {
    pub fn new(store: Arc<dyn TrustedAssetsStore>, allow_draft_models: bool) -> ActivationManager {
        ActivationManager {
            store,
            allow_draft_models,
            os_name: std::env::consts::OS.to_owned(),
            os_version: std::env::consts::ARCH.to_owned(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attributes(mut self, attributes: BTreeMap<String, String>) -> ActivationManager {
        self.attributes = attributes;
        self
    }

    /// Runs the two device-side steps of the handshake. Indirect
    /// activation of children is a separate, gateway-only operation.
    pub fn activate(
        &self,
        connection: &dyn Transport,
        device_models: &[String],
    ) -> Result<String, ClientError> {
        if self.store.is_activated() {
            return Err(ClientError::AlreadyActivated);
        }

        log::info!("Starting activation of client {}", self.store.client_id());

        let policy = self.fetch_policy(connection)?;
        log::debug!(
            "Activation policy: {} {} bits, hash {}",
            policy.key_type,
            policy.key_size,
            policy.hash_algorithm
        );

        if policy.key_type != KEY_ALGORITHM {
            return Err(ClientError::Security(format!(
                "the activation policy requests unsupported key type '{}'",
                policy.key_type
            )));
        }

        self.store.generate_key_pair(policy.key_size)?;

        let response = self.activate_direct(connection, &policy, device_models)?;
        if response.endpoint_state != "ACTIVATED" {
            return Err(ClientError::Security(format!(
                "activation ended in state '{}'",
                response.endpoint_state
            )));
        }

        let certificate = match &response.certificate {
            Some(pem) => Some(
                BASE64
                    .decode(pem)
                    .map_err(|e| ClientError::Security(format!("invalid certificate: {e}")))?,
            ),
            None => None,
        };
        self.store
            .set_endpoint_credentials(&response.endpoint_id, certificate)?;

        log::info!("Activated as endpoint {}", response.endpoint_id);
        Ok(response.endpoint_id)
    }

    fn fetch_policy(&self, connection: &dyn Transport) -> Result<ActivationPolicy, ClientError> {
        let rest_api = format!(
            "/activation/policy?OSName={}&OSVersion={}",
            urlencoding::encode(&self.os_name),
            urlencoding::encode(&self.os_version),
        );

        let response = connection.get(&rest_api)?;
        // The server refuses the policy to an endpoint that already
        // activated; that is a state error, not an auth problem.
        if response.status == 401 {
            return Err(ClientError::AlreadyActivated);
        }
        if !response.is_success() {
            return Err(response.into_error());
        }
        response.json()
    }

    fn activate_direct(
        &self,
        connection: &dyn Transport,
        policy: &ActivationPolicy,
        device_models: &[String],
    ) -> Result<DirectActivationResponse, ClientError> {
        let client_id = self.store.client_id();
        let hash_algorithm = SignAlgorithm::parse(&policy.hash_algorithm)?;
        let signature_algorithm = rsa_counterpart(hash_algorithm)?;

        let client_secret = self
            .store
            .sign_with_shared_secret(client_id.as_bytes(), hash_algorithm, None)?
            .ok_or_else(|| ClientError::Security("no shared secret is provisioned".into()))?;
        let client_secret = BASE64.encode(client_secret);

        let public_key = self.store.public_key()?;

        let attributes = attributes_string(&self.attributes);
        let payload = signature_payload(
            &client_id,
            KEY_ALGORITHM,
            CSR_FORMAT,
            &policy.hash_algorithm,
            &attributes,
            &client_secret,
            &public_key,
        );
        let signature = self
            .store
            .sign_with_private_key(&payload, signature_algorithm)?;

        let body = json!({
            "certificationRequestInfo": {
                "subject": client_id,
                "subjectPublicKeyInfo": {
                    "algorithm": KEY_ALGORITHM,
                    "publicKey": BASE64.encode(&public_key),
                    "format": CSR_FORMAT,
                    "secretHashAlgorithm": policy.hash_algorithm,
                },
                "attributes": &self.attributes,
            },
            "signatureAlgorithm": signature_algorithm.name(),
            "signature": BASE64.encode(&signature),
            "deviceModels": device_models,
        });

        let rest_api = if self.allow_draft_models {
            "/activation/direct?createDraft=true"
        } else {
            "/activation/direct"
        };

        let response = connection.post(rest_api, body.to_string().as_bytes(), None)?;
        if !response.is_success() {
            return Err(response.into_error());
        }
        response.json()
    }
}

/// Layout the server verifies: subject, algorithm, format and hash joined
/// by newlines, then the attribute string, the client secret and the raw
/// public key, without further separators.
fn signature_payload(
    subject: &str,
    algorithm: &str,
    format: &str,
    hash_algorithm: &str,
    attributes: &str,
    client_secret: &str,
    public_key: &[u8],
) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(subject.as_bytes());
    payload.push(b'\n');
    payload.extend_from_slice(algorithm.as_bytes());
    payload.push(b'\n');
    payload.extend_from_slice(format.as_bytes());
    payload.push(b'\n');
    payload.extend_from_slice(hash_algorithm.as_bytes());
    payload.push(b'\n');
    payload.extend_from_slice(attributes.as_bytes());
    payload.extend_from_slice(client_secret.as_bytes());
    payload.extend_from_slice(public_key);
    payload
}

/// Canonical attribute encoding signed by the device and rebuilt by the
/// server: `key=value` pairs joined by commas, in key order (the map is
/// ordered). An empty map contributes nothing.
fn attributes_string(attributes: &BTreeMap<String, String>) -> String {
    attributes
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn rsa_counterpart(hash: SignAlgorithm) -> Result<SignAlgorithm, ClientError> {
    match hash {
        SignAlgorithm::HmacSha256 => Ok(SignAlgorithm::Sha256WithRsa),
        SignAlgorithm::HmacSha384 => Ok(SignAlgorithm::Sha384WithRsa),
        SignAlgorithm::HmacSha512 => Ok(SignAlgorithm::Sha512WithRsa),
        other => Err(ClientError::Security(format!(
            "the activation policy names '{}' which is not an HMAC algorithm",
            other.name()
        ))),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transport::Response;
    use crate::trust::MemoryTrustedAssetsStore;
    use std::sync::Mutex;
    use std::time::Duration;

    struct ScriptedTransport {
        requests: Mutex<Vec<(String, String)>>,
        bodies: Mutex<Vec<serde_json::Value>>,
        responses: Mutex<Vec<Response>>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<Response>) -> Self {
            ScriptedTransport {
                requests: Mutex::new(Vec::new()),
                bodies: Mutex::new(Vec::new()),
                responses: Mutex::new(responses),
            }
        }

        fn next(&self, method: &str, rest_api: &str) -> Result<Response, ClientError> {
            self.requests
                .lock()
                .unwrap()
                .push((method.to_owned(), rest_api.to_owned()));
            Ok(self.responses.lock().unwrap().remove(0))
        }
    }

    impl Transport for ScriptedTransport {
        fn get(&self, rest_api: &str) -> Result<Response, ClientError> {
            self.next("GET", rest_api)
        }

        fn post(
            &self,
            rest_api: &str,
            payload: &[u8],
            _timeout: Option<Duration>,
        ) -> Result<Response, ClientError> {
            self.bodies
                .lock()
                .unwrap()
                .push(serde_json::from_slice(payload).unwrap());
            self.next("POST", rest_api)
        }
    }

    fn policy_response() -> Response {
        Response::new(
            200,
            br#"{"keyType":"RSA","keySize":2048,"hashAlgorithm":"HmacSHA256"}"#.to_vec(),
        )
    }

    fn store() -> Arc<MemoryTrustedAssetsStore> {
        Arc::new(MemoryTrustedAssetsStore::new(
            "https",
            "iot.example.com",
            443,
            "client-1",
            b"secret".to_vec(),
        ))
    }

    #[test]
    fn happy_path_stores_endpoint_id() {
        let store = store();
        let transport = ScriptedTransport::new(vec![
            policy_response(),
            Response::new(
                200,
                br#"{"endpointState":"ACTIVATED","endpointId":"0-EP"}"#.to_vec(),
            ),
        ]);

        let manager = ActivationManager::new(store.clone(), false);
        let endpoint_id = manager
            .activate(&transport, &["urn:test:model".to_owned()])
            .unwrap();

        assert_eq!(endpoint_id, "0-EP");
        assert!(store.is_activated());

        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].0, "GET");
        assert!(requests[0].1.starts_with("/activation/policy?OSName="));
        assert_eq!(requests[1].0, "POST");
        assert_eq!(requests[1].1, "/activation/direct");
    }

    #[test]
    fn unauthorized_policy_means_already_activated() {
        let transport = ScriptedTransport::new(vec![Response::new(401, Vec::new())]);
        let manager = ActivationManager::new(store(), false);
        let result = manager.activate(&transport, &[]);
        assert!(matches!(result, Err(ClientError::AlreadyActivated)));
    }

    #[test]
    fn activated_store_refuses_second_activation() {
        let store = store();
        store.set_endpoint_credentials("0-EP", None).unwrap();
        let transport = ScriptedTransport::new(vec![]);
        let manager = ActivationManager::new(store, false);
        assert!(matches!(
            manager.activate(&transport, &[]),
            Err(ClientError::AlreadyActivated)
        ));
    }

    #[test]
    fn draft_flag_changes_the_direct_path() {
        let store = store();
        let transport = ScriptedTransport::new(vec![
            policy_response(),
            Response::new(
                200,
                br#"{"endpointState":"ACTIVATED","endpointId":"0-EP"}"#.to_vec(),
            ),
        ]);

        let manager = ActivationManager::new(store, true);
        manager.activate(&transport, &[]).unwrap();
        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests[1].1, "/activation/direct?createDraft=true");
    }

    #[test]
    fn non_success_status_is_surfaced() {
        let transport = ScriptedTransport::new(vec![
            policy_response(),
            Response::new(409, br#"{"title":"Conflict","status":409}"#.to_vec()),
        ]);
        let manager = ActivationManager::new(store(), false);
        match manager.activate(&transport, &[]) {
            Err(ClientError::Status { status, .. }) => assert_eq!(status, 409),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn signature_payload_layout() {
        let payload = signature_payload(
            "id",
            "RSA",
            "X.509",
            "HmacSHA256",
            "serialNumber=SN-1",
            "c2VjcmV0",
            b"\x01\x02",
        );
        let expected = b"id\nRSA\nX.509\nHmacSHA256\nserialNumber=SN-1c2VjcmV0\x01\x02";
        assert_eq!(payload, expected);

        // Without attributes the slot contributes no bytes.
        let payload = signature_payload("id", "RSA", "X.509", "HmacSHA256", "", "c2VjcmV0", b"\x01\x02");
        assert_eq!(payload, b"id\nRSA\nX.509\nHmacSHA256\nc2VjcmV0\x01\x02");
    }

    #[test]
    fn attribute_encoding_is_ordered() {
        let mut attributes = BTreeMap::new();
        attributes.insert("serialNumber".to_owned(), "SN-1".to_owned());
        attributes.insert("manufacturer".to_owned(), "Acme".to_owned());
        assert_eq!(
            attributes_string(&attributes),
            "manufacturer=Acme,serialNumber=SN-1"
        );
        assert_eq!(attributes_string(&BTreeMap::new()), "");
    }

    #[test]
    fn attributes_travel_in_the_activation_request() {
        let store = store();
        let transport = ScriptedTransport::new(vec![
            policy_response(),
            Response::new(
                200,
                br#"{"endpointState":"ACTIVATED","endpointId":"0-EP"}"#.to_vec(),
            ),
        ]);

        let mut attributes = BTreeMap::new();
        attributes.insert("serialNumber".to_owned(), "SN-1".to_owned());

        let manager = ActivationManager::new(store, false).with_attributes(attributes);
        manager.activate(&transport, &[]).unwrap();

        let bodies = transport.bodies.lock().unwrap();
        let info = &bodies[0]["certificationRequestInfo"];
        assert_eq!(info["attributes"]["serialNumber"], "SN-1");
        assert_eq!(info["subject"], "client-1");
    }
}
