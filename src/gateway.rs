//! Registration of indirectly connected devices through a gateway.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::error::ClientError;
use crate::transport::Transport;
use crate::trust::{SignAlgorithm, TrustedAssetsStore};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndirectActivationResponse {
    endpoint_state: String,
    endpoint_id: String,
}

/// Registers a child device under the gateway's endpoint.
///
/// The registration is signed with the child's shared secret when one was
/// provisioned for its hardware id. Without one, a `restricted` child is
/// signed with the gateway's private key instead, which locks it to this
/// gateway; an unrestricted child goes unsigned.
pub(crate) fn register_indirect_device(
    store: &dyn TrustedAssetsStore,
    connection: &dyn Transport,
    hardware_id: &str,
    metadata: Map<String, Value>,
    device_models: &[String],
    restricted: bool,
) -> Result<String, ClientError> {
    let gateway_endpoint_id = store.endpoint_id().ok_or(ClientError::NotActivated)?;

    let mut body = json!({
        "hardwareId": hardware_id,
        "metadata": metadata,
        "deviceModels": device_models,
    });

    let child_signature = store.sign_with_shared_secret(
        gateway_endpoint_id.as_bytes(),
        SignAlgorithm::HmacSha256,
        Some(hardware_id),
    )?;

    match child_signature {
        Some(signature) => {
            body["signature"] = json!(BASE64.encode(signature));
            body["signatureAlgorithm"] = json!(SignAlgorithm::HmacSha256.name());
        }
        None if restricted => {
            log::debug!(
                "No shared secret is provisioned for {hardware_id}, signing with the gateway key"
            );
            let signature = store.sign_with_private_key(
                gateway_endpoint_id.as_bytes(),
                SignAlgorithm::Sha256WithRsa,
            )?;
            body["signature"] = json!(BASE64.encode(signature));
            body["signatureAlgorithm"] = json!(SignAlgorithm::Sha256WithRsa.name());
        }
        None => {}
    }

    let response = connection.post(
        "/activation/indirect/device",
        body.to_string().as_bytes(),
        None,
    )?;
    if !response.is_success() {
        return Err(response.into_error());
    }

    let parsed: IndirectActivationResponse = response.json()?;
    if parsed.endpoint_state != "ACTIVATED" {
        return Err(ClientError::Security(format!(
            "indirect activation of {hardware_id} ended in state '{}'",
            parsed.endpoint_state
        )));
    }

    log::info!(
        "Indirectly connected device {hardware_id} was activated as endpoint {}",
        parsed.endpoint_id
    );
    Ok(parsed.endpoint_id)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transport::Response;
    use crate::trust::MemoryTrustedAssetsStore;
    use std::sync::Mutex;
    use std::time::Duration;

    struct RecordingTransport {
        bodies: Mutex<Vec<Value>>,
        response: Response,
    }

    impl RecordingTransport {
        fn new(response: Response) -> Self {
            RecordingTransport {
                bodies: Mutex::new(Vec::new()),
                response,
            }
        }
    }

    impl Transport for RecordingTransport {
        fn get(&self, _rest_api: &str) -> Result<Response, ClientError> {
            unreachable!("indirect activation only posts")
        }

        fn post(
            &self,
            _rest_api: &str,
            payload: &[u8],
            _timeout: Option<Duration>,
        ) -> Result<Response, ClientError> {
            self.bodies
                .lock()
                .unwrap()
                .push(serde_json::from_slice(payload).unwrap());
            Ok(self.response.clone())
        }
    }

    fn activated_store() -> MemoryTrustedAssetsStore {
        let store = MemoryTrustedAssetsStore::new(
            "https",
            "iot.example.com",
            443,
            "gateway-1",
            b"secret".to_vec(),
        )
        .with_child_secret("hw-1", b"child-secret".to_vec());
        store.generate_key_pair(2048).unwrap();
        store.set_endpoint_credentials("0-GW", None).unwrap();
        store
    }

    fn activated_response() -> Response {
        Response::new(
            200,
            br#"{"endpointState":"ACTIVATED","endpointId":"0-CHILD"}"#.to_vec(),
        )
    }

    #[test]
    fn provisioned_child_is_hmac_signed() {
        let store = activated_store();
        let transport = RecordingTransport::new(activated_response());

        let endpoint_id = register_indirect_device(
            &store,
            &transport,
            "hw-1",
            Map::new(),
            &["urn:test:child".to_owned()],
            false,
        )
        .unwrap();

        assert_eq!(endpoint_id, "0-CHILD");
        let bodies = transport.bodies.lock().unwrap();
        assert_eq!(bodies[0]["hardwareId"], "hw-1");
        assert_eq!(bodies[0]["signatureAlgorithm"], "HmacSHA256");
        assert!(bodies[0]["signature"].is_string());
    }

    #[test]
    fn restricted_child_falls_back_to_gateway_key() {
        let store = activated_store();
        let transport = RecordingTransport::new(activated_response());

        register_indirect_device(&store, &transport, "hw-unknown", Map::new(), &[], true).unwrap();

        let bodies = transport.bodies.lock().unwrap();
        assert_eq!(bodies[0]["signatureAlgorithm"], "SHA256withRSA");
    }

    #[test]
    fn unrestricted_unknown_child_goes_unsigned() {
        let store = activated_store();
        let transport = RecordingTransport::new(activated_response());

        register_indirect_device(&store, &transport, "hw-unknown", Map::new(), &[], false).unwrap();

        let bodies = transport.bodies.lock().unwrap();
        assert!(bodies[0].get("signature").is_none());
    }

    #[test]
    fn inactive_gateway_cannot_register_children() {
        let store = MemoryTrustedAssetsStore::new(
            "https",
            "iot.example.com",
            443,
            "gateway-1",
            b"secret".to_vec(),
        );
        let transport = RecordingTransport::new(activated_response());
        let result =
            register_indirect_device(&store, &transport, "hw-1", Map::new(), &[], false);
        assert!(matches!(result, Err(ClientError::NotActivated)));
    }
}
