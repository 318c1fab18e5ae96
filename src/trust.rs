//! Read/sign interface to the provisioned trusted assets.
//!
//! The file format of the underlying store is owned by an external
//! component; the runtime only consumes the capability set below. An
//! in-memory implementation is provided for embedders that manage
//! provisioning themselves and for tests.

use std::collections::HashMap;
use std::sync::Mutex;

use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::sign::Signer;

use crate::error::ClientError;

/// Signature and digest algorithms used during activation. The server
/// names them in the activation policy; unknown names are a security
/// error, not something to guess around.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignAlgorithm {
    Sha256WithRsa,
    Sha384WithRsa,
    Sha512WithRsa,
    HmacSha256,
    HmacSha384,
    HmacSha512,
}

impl SignAlgorithm {
    pub fn parse(name: &str) -> Result<SignAlgorithm, ClientError> {
        match name {
            "SHA256withRSA" => Ok(SignAlgorithm::Sha256WithRsa),
            "SHA384withRSA" => Ok(SignAlgorithm::Sha384WithRsa),
            "SHA512withRSA" => Ok(SignAlgorithm::Sha512WithRsa),
            "HmacSHA256" => Ok(SignAlgorithm::HmacSha256),
            "HmacSHA384" => Ok(SignAlgorithm::HmacSha384),
            "HmacSHA512" => Ok(SignAlgorithm::HmacSha512),
            other => Err(ClientError::Security(format!(
                "unsupported signature algorithm '{other}'"
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SignAlgorithm::Sha256WithRsa => "SHA256withRSA",
            SignAlgorithm::Sha384WithRsa => "SHA384withRSA",
            SignAlgorithm::Sha512WithRsa => "SHA512withRSA",
            SignAlgorithm::HmacSha256 => "HmacSHA256",
            SignAlgorithm::HmacSha384 => "HmacSHA384",
            SignAlgorithm::HmacSha512 => "HmacSHA512",
        }
    }

    fn digest(&self) -> MessageDigest {
        match self {
            SignAlgorithm::Sha256WithRsa | SignAlgorithm::HmacSha256 => MessageDigest::sha256(),
            SignAlgorithm::Sha384WithRsa | SignAlgorithm::HmacSha384 => MessageDigest::sha384(),
            SignAlgorithm::Sha512WithRsa | SignAlgorithm::HmacSha512 => MessageDigest::sha512(),
        }
    }

    fn is_hmac(&self) -> bool {
        matches!(
            self,
            SignAlgorithm::HmacSha256 | SignAlgorithm::HmacSha384 | SignAlgorithm::HmacSha512
        )
    }
}

/// Capabilities the runtime needs from the provisioned asset store.
///
/// Private keys and shared secrets never cross this boundary; only
/// signatures do.
pub trait TrustedAssetsStore: Send + Sync {
    /// `https` for the HTTP transport, `mqtts` (or `ssl`) for MQTT.
    fn server_scheme(&self) -> String;
    fn server_host(&self) -> String;
    fn server_port(&self) -> u16;

    /// Provisioned identity used before activation.
    fn client_id(&self) -> String;

    /// Server-assigned identity, present once activated.
    fn endpoint_id(&self) -> Option<String>;

    /// Generates and stores an RSA key pair for activation.
    fn generate_key_pair(&self, key_size: u32) -> Result<(), ClientError>;

    /// DER-encoded public key of the generated pair.
    fn public_key(&self) -> Result<Vec<u8>, ClientError>;

    /// Signs with the generated private key. `algorithm` must be one of
    /// the RSA variants.
    fn sign_with_private_key(
        &self,
        data: &[u8],
        algorithm: SignAlgorithm,
    ) -> Result<Vec<u8>, ClientError>;

    /// HMAC with the provisioned shared secret. With a `hardware_id` the
    /// secret of that indirectly connected device is used instead, if it
    /// was provisioned; absence of a child secret is reported as `Ok(None)`
    /// so the caller can fall back to a gateway signature.
    fn sign_with_shared_secret(
        &self,
        data: &[u8],
        algorithm: SignAlgorithm,
        hardware_id: Option<&str>,
    ) -> Result<Option<Vec<u8>>, ClientError>;

    /// Stores the activation outcome.
    fn set_endpoint_credentials(
        &self,
        endpoint_id: &str,
        certificate: Option<Vec<u8>>,
    ) -> Result<(), ClientError>;

    fn is_activated(&self) -> bool {
        self.endpoint_id().is_some()
    }

    /// Drops the endpoint credentials and the key pair, returning the
    /// store to its provisioned state.
    fn reset(&self) -> Result<(), ClientError>;
}

#[derive(Default)]
struct MemoryState {
    endpoint_id: Option<String>,
    key_pair: Option<PKey<Private>>,
    certificate: Option<Vec<u8>>,
}

/// In-memory [`TrustedAssetsStore`].
pub struct MemoryTrustedAssetsStore {
    scheme: String,
    host: String,
    port: u16,
    client_id: String,
    shared_secret: Vec<u8>,
    child_secrets: HashMap<String, Vec<u8>>,
    state: Mutex<MemoryState>,
}

impl MemoryTrustedAssetsStore {
    pub fn new(
        scheme: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        client_id: impl Into<String>,
        shared_secret: impl Into<Vec<u8>>,
    ) -> Self {
        MemoryTrustedAssetsStore {
            scheme: scheme.into(),
            host: host.into(),
            port,
            client_id: client_id.into(),
            shared_secret: shared_secret.into(),
            child_secrets: HashMap::new(),
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Registers the shared secret of an indirectly connected device so a
    /// gateway can sign its registration.
    pub fn with_child_secret(
        mut self,
        hardware_id: impl Into<String>,
        secret: impl Into<Vec<u8>>,
    ) -> Self {
        self.child_secrets.insert(hardware_id.into(), secret.into());
        self
    }
}

impl TrustedAssetsStore for MemoryTrustedAssetsStore {
    fn server_scheme(&self) -> String {
        self.scheme.clone()
    }

    fn server_host(&self) -> String {
        self.host.clone()
    }

    fn server_port(&self) -> u16 {
        self.port
    }

    fn client_id(&self) -> String {
        self.client_id.clone()
    }

    fn endpoint_id(&self) -> Option<String> {
        self.state.lock().expect("trust store lock").endpoint_id.clone()
    }

    fn generate_key_pair(&self, key_size: u32) -> Result<(), ClientError> {
        let rsa = Rsa::generate(key_size)
            .map_err(|e| ClientError::Security(format!("RSA key generation failed: {e}")))?;
        let key = PKey::from_rsa(rsa)
            .map_err(|e| ClientError::Security(format!("RSA key wrapping failed: {e}")))?;
        self.state.lock().expect("trust store lock").key_pair = Some(key);
        Ok(())
    }

    fn public_key(&self) -> Result<Vec<u8>, ClientError> {
        let state = self.state.lock().expect("trust store lock");
        let key = state
            .key_pair
            .as_ref()
            .ok_or_else(|| ClientError::Security("no key pair has been generated".into()))?;
        key.public_key_to_der()
            .map_err(|e| ClientError::Security(format!("public key export failed: {e}")))
    }

    fn sign_with_private_key(
        &self,
        data: &[u8],
        algorithm: SignAlgorithm,
    ) -> Result<Vec<u8>, ClientError> {
        if algorithm.is_hmac() {
            return Err(ClientError::Security(format!(
                "{} is not a private key algorithm",
                algorithm.name()
            )));
        }
        let state = self.state.lock().expect("trust store lock");
        let key = state
            .key_pair
            .as_ref()
            .ok_or_else(|| ClientError::Security("no key pair has been generated".into()))?;
        sign(algorithm.digest(), key, data)
    }

    fn sign_with_shared_secret(
        &self,
        data: &[u8],
        algorithm: SignAlgorithm,
        hardware_id: Option<&str>,
    ) -> Result<Option<Vec<u8>>, ClientError> {
        if !algorithm.is_hmac() {
            return Err(ClientError::Security(format!(
                "{} is not a shared secret algorithm",
                algorithm.name()
            )));
        }
        let secret = match hardware_id {
            None => &self.shared_secret,
            Some(id) => match self.child_secrets.get(id) {
                Some(secret) => secret,
                None => return Ok(None),
            },
        };
        let key = PKey::hmac(secret)
            .map_err(|e| ClientError::Security(format!("HMAC key setup failed: {e}")))?;
        sign(algorithm.digest(), &key, data).map(Some)
    }

    fn set_endpoint_credentials(
        &self,
        endpoint_id: &str,
        certificate: Option<Vec<u8>>,
    ) -> Result<(), ClientError> {
        let mut state = self.state.lock().expect("trust store lock");
        state.endpoint_id = Some(endpoint_id.to_owned());
        state.certificate = certificate;
        Ok(())
    }

    fn reset(&self) -> Result<(), ClientError> {
        let mut state = self.state.lock().expect("trust store lock");
        state.endpoint_id = None;
        state.key_pair = None;
        state.certificate = None;
        Ok(())
    }
}

fn sign(
    digest: MessageDigest,
    key: &PKey<Private>,
    data: &[u8],
) -> Result<Vec<u8>, ClientError> {
    let mut signer = Signer::new(digest, key)
        .map_err(|e| ClientError::Security(format!("signer setup failed: {e}")))?;
    signer
        .update(data)
        .map_err(|e| ClientError::Security(format!("signing failed: {e}")))?;
    signer
        .sign_to_vec()
        .map_err(|e| ClientError::Security(format!("signing failed: {e}")))
}

#[cfg(test)]
mod test {
    use super::*;

    fn store() -> MemoryTrustedAssetsStore {
        MemoryTrustedAssetsStore::new("https", "iot.example.com", 443, "client-1", b"secret".to_vec())
    }

    #[test]
    fn endpoint_lifecycle() {
        let store = store();
        assert!(!store.is_activated());
        store.set_endpoint_credentials("0-EP", None).unwrap();
        assert!(store.is_activated());
        assert_eq!(store.endpoint_id().as_deref(), Some("0-EP"));
        store.reset().unwrap();
        assert!(!store.is_activated());
    }

    #[test]
    fn key_pair_signs_and_exports() {
        let store = store();
        store.generate_key_pair(2048).unwrap();
        let public_key = store.public_key().unwrap();
        assert!(!public_key.is_empty());

        let signature = store
            .sign_with_private_key(b"payload", SignAlgorithm::Sha256WithRsa)
            .unwrap();
        assert_eq!(signature.len(), 256);
    }

    #[test]
    fn hmac_is_deterministic() {
        let store = store();
        let first = store
            .sign_with_shared_secret(b"payload", SignAlgorithm::HmacSha256, None)
            .unwrap()
            .unwrap();
        let second = store
            .sign_with_shared_secret(b"payload", SignAlgorithm::HmacSha256, None)
            .unwrap()
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 32);
    }

    #[test]
    fn unknown_child_secret_is_none() {
        let store = store();
        let signature = store
            .sign_with_shared_secret(b"payload", SignAlgorithm::HmacSha256, Some("missing"))
            .unwrap();
        assert!(signature.is_none());
    }

    #[test]
    fn algorithm_names_round_trip() {
        for name in [
            "SHA256withRSA",
            "SHA384withRSA",
            "SHA512withRSA",
            "HmacSHA256",
            "HmacSHA384",
            "HmacSHA512",
        ] {
            assert_eq!(SignAlgorithm::parse(name).unwrap().name(), name);
        }
        assert!(SignAlgorithm::parse("MD5withRSA").is_err());
    }
}
