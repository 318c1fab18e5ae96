//! Top-level client handles.
//!
//! A [`DeviceClient`] owns the secure connection, the message dispatcher,
//! the trusted-assets handle and the policy machinery; dropping it drains
//! and stops the workers. A [`GatewayClient`] adds registration of
//! indirectly connected children.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde_json::{json, Map, Value};

use crate::config::Config;
use crate::dispatcher::{
    DeliveryCallback, DispatcherCounters, ErrorCallback, MessageDispatcher, RequestHandler,
    StorageBackend, StorageObject, StorageProgressCallback,
};
use crate::error::ClientError;
use crate::gateway;
use crate::message::Message;
use crate::model::{DeviceModel, DeviceModelRegistry};
use crate::persistence::MessagePersistence;
use crate::policy::engine::MessagingPolicyEngine;
use crate::policy::{DevicePolicyManager, FormulaEvaluator, SimpleFormulaEvaluator};
use crate::transport::SecureConnection;
use crate::trust::TrustedAssetsStore;
use crate::ActivationManager;

const POLICY_CHANGED_RESOURCE: &str =
    "deviceModels/urn:oracle:iot:dcd:capability:device_policy/policyChanged";
const RESOURCES_REPORT_FORMAT: &str = "urn:oracle:iot:dcd:capability:resources_report";

/// Configures and activates a [`DeviceClient`] or [`GatewayClient`].
pub struct DeviceClientBuilder {
    store: Arc<dyn TrustedAssetsStore>,
    config: Config,
    device_models: Vec<String>,
    persistence_file: Option<PathBuf>,
    formula_evaluator: Arc<dyn FormulaEvaluator>,
    activation_attributes: BTreeMap<String, String>,
}

impl DeviceClientBuilder {
    /// Creates a builder around a provisioned trusted-assets store.
    ///
    /// * `store`: the provisioned assets (identity, shared secret, server
    ///   address). If the device was never activated, [`DeviceClientBuilder::build`]
    ///   runs the activation handshake first.
    /// * `device_models`: URNs of the device models this device implements.
    pub fn new(store: Arc<dyn TrustedAssetsStore>, device_models: Vec<String>) -> Self {
        DeviceClientBuilder {
            store,
            config: Config::default(),
            device_models,
            persistence_file: None,
            formula_evaluator: Arc::new(SimpleFormulaEvaluator),
            activation_attributes: BTreeMap::new(),
        }
    }

    /// Adds a device attribute (serial number, manufacturer, ...) that is
    /// included in the signed activation request.
    pub fn with_activation_attribute(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.activation_attributes.insert(name.into(), value.into());
        self
    }

    /// Overrides the runtime options.
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Enables guaranteed-delivery persistence in the given local
    /// database file. Without it, GUARANTEED_DELIVERY degrades to
    /// best-effort across restarts.
    pub fn with_persistence_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.persistence_file = Some(path.into());
        self
    }

    /// Replaces the built-in formula evaluator used by device policies.
    pub fn with_formula_evaluator(mut self, evaluator: Arc<dyn FormulaEvaluator>) -> Self {
        self.formula_evaluator = evaluator;
        self
    }

    /// Builds the client, running the activation handshake if the store
    /// holds no endpoint credentials yet.
    pub fn build(self) -> Result<DeviceClient, ClientError> {
        self.config.validate()?;

        let connection = Arc::new(SecureConnection::from_store(
            self.store.clone(),
            &self.config,
        )?);

        if !self.store.is_activated() {
            let activation =
                ActivationManager::new(self.store.clone(), self.config.allow_draft_device_models)
                    .with_attributes(self.activation_attributes.clone());
            activation.activate(connection.as_ref(), &self.device_models)?;
        }
        let endpoint_id = self.store.endpoint_id().ok_or(ClientError::NotActivated)?;

        let persistence = match &self.persistence_file {
            Some(path) => Some(Arc::new(MessagePersistence::open(path).map_err(|e| {
                ClientError::Other(e.context("unable to open the local database file"))
            })?)),
            None => None,
        };

        let dispatcher = MessageDispatcher::start(
            connection.clone(),
            endpoint_id.clone(),
            self.config.clone(),
            persistence.clone(),
        )?;

        let policy_manager = Arc::new(DevicePolicyManager::new());
        let engine = Arc::new(MessagingPolicyEngine::new(
            policy_manager.clone(),
            self.formula_evaluator.clone(),
            persistence.clone(),
        ));

        // Server-pushed policy changes arrive as requests on the policy
        // capability resource.
        {
            let policy_manager = policy_manager.clone();
            dispatcher.request_dispatcher().register(
                "",
                POLICY_CHANGED_RESOURCE,
                "POST",
                Arc::new(crate::dispatcher::FnRequestHandler(
                    move |request: &crate::message::RequestMessage| {
                        match policy_manager.process_policy_change(&request.body_bytes()) {
                            Ok(()) => crate::message::ResponseMessage::new(request, 200, b""),
                            Err(e) => {
                                log::warn!("Rejected a policy change request: {e}");
                                crate::message::ResponseMessage::new(request, 400, b"")
                            }
                        }
                    },
                )),
            );
        }

        let client = DeviceClient {
            store: self.store,
            connection,
            dispatcher,
            engine,
            policy_manager,
            models: DeviceModelRegistry::new(self.config.allow_draft_device_models),
            endpoint_id,
            device_models: self.device_models,
            resources: Mutex::new(Vec::new()),
        };

        // Messages a batching policy buffered in a previous run are sent
        // out directly; batching restarts empty.
        if let Some(persistence) = &persistence {
            match persistence.load_batch_by(&client.endpoint_id) {
                Ok(messages) if !messages.is_empty() => {
                    log::info!(
                        "Restoring {} messages buffered by a batching policy",
                        messages.len()
                    );
                    if let Err(e) = persistence.clear_batch_by(&client.endpoint_id) {
                        log::warn!("Unable to clear restored batch state: {e:?}");
                    }
                    if let Err(e) = client.dispatcher.queue(messages) {
                        log::warn!("Unable to queue restored batched messages: {e}");
                    }
                }
                Ok(_) => {}
                Err(e) => log::warn!("Unable to load batched messages: {e:?}"),
            }
        }

        Ok(client)
    }

    /// Builds a gateway handle instead; same activation flow.
    pub fn build_gateway(self) -> Result<GatewayClient, ClientError> {
        Ok(GatewayClient {
            inner: self.build()?,
        })
    }
}

/// A directly connected device talking to one cloud endpoint.
pub struct DeviceClient {
    store: Arc<dyn TrustedAssetsStore>,
    connection: Arc<SecureConnection>,
    dispatcher: MessageDispatcher,
    engine: Arc<MessagingPolicyEngine>,
    policy_manager: Arc<DevicePolicyManager>,
    models: DeviceModelRegistry,
    endpoint_id: String,
    device_models: Vec<String>,
    resources: Mutex<Vec<(String, String)>>,
}

impl DeviceClient {
    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    pub fn is_activated(&self) -> bool {
        self.store.is_activated()
    }

    pub fn device_models(&self) -> &[String] {
        &self.device_models
    }

    /// Sends a message through the device policy pipeline of the given
    /// model, then queues whatever the pipeline emits.
    pub fn send(&self, device_model_urn: &str, message: Message) -> Result<(), ClientError> {
        let messages = self.engine.apply_policies(
            self.connection.as_ref(),
            &self.endpoint_id,
            device_model_urn,
            message,
        )?;
        if messages.is_empty() {
            return Ok(());
        }
        self.dispatcher.queue(messages)
    }

    /// Queues messages directly, bypassing device policies.
    pub fn queue(&self, messages: Vec<Message>) -> Result<(), ClientError> {
        self.dispatcher.queue(messages)
    }

    /// Queues a message that depends on a storage object still uploading.
    pub fn queue_with_storage(
        &self,
        message: Message,
        object: &StorageObject,
    ) -> Result<(), ClientError> {
        self.dispatcher.queue_with_storage(message, object)
    }

    /// Retrieves (and caches) a device model by URN.
    pub fn device_model(&self, urn: &str) -> Result<Arc<DeviceModel>, ClientError> {
        self.models.get(self.connection.as_ref(), urn)
    }

    pub fn policies(&self) -> &Arc<DevicePolicyManager> {
        &self.policy_manager
    }

    pub fn counters(&self) -> DispatcherCounters {
        self.dispatcher.counters()
    }

    pub fn set_delivery_callback(&self, callback: Option<DeliveryCallback>) {
        self.dispatcher.set_delivery_callback(callback);
    }

    pub fn set_error_callback(&self, callback: Option<ErrorCallback>) {
        self.dispatcher.set_error_callback(callback);
    }

    /// Registers a handler for a device resource and announces the
    /// updated resource set to the server.
    pub fn register_request_handler(
        &self,
        path: &str,
        method: &str,
        handler: Arc<dyn RequestHandler>,
    ) {
        self.dispatcher
            .request_dispatcher()
            .register(&self.endpoint_id, path, method, handler);
        self.resources
            .lock()
            .expect("resource list lock")
            .push((path.to_owned(), method.to_uppercase()));
        self.report_resources();
    }

    pub fn deregister_request_handler(&self, path: &str, method: &str) {
        self.dispatcher
            .request_dispatcher()
            .deregister(&self.endpoint_id, path, method);
        let method = method.to_uppercase();
        self.resources
            .lock()
            .expect("resource list lock")
            .retain(|(p, m)| !(p == path && *m == method));
        self.report_resources();
    }

    fn report_resources(&self) {
        let resources: Vec<Value> = self
            .resources
            .lock()
            .expect("resource list lock")
            .iter()
            .map(|(path, method)| json!({ "path": path, "method": method }))
            .collect();

        let report = Message::builder()
            .source(self.endpoint_id.clone())
            .format(RESOURCES_REPORT_FORMAT)
            .data_item("endpointId", self.endpoint_id.clone())
            .data_item("resources", Value::Array(resources))
            .build_resources_report();

        match report {
            Ok(report) => {
                if let Err(e) = self.dispatcher.queue(vec![report]) {
                    log::warn!("Unable to queue the resources report: {e}");
                }
            }
            Err(e) => log::warn!("Unable to build the resources report: {e}"),
        }
    }

    pub fn set_storage_backend(&self, backend: Arc<dyn StorageBackend>) {
        self.dispatcher.storage().set_backend(backend);
    }

    pub fn queue_storage_upload(
        &self,
        object: StorageObject,
        callback: Option<StorageProgressCallback>,
    ) -> Result<(), ClientError> {
        self.dispatcher.storage().queue_upload(object, callback)
    }

    pub fn queue_storage_download(
        &self,
        object: StorageObject,
        callback: Option<StorageProgressCallback>,
    ) -> Result<(), ClientError> {
        self.dispatcher.storage().queue_download(object, callback)
    }

    /// Drains the outbound queue and stops the workers.
    pub fn close(&mut self) {
        self.dispatcher.close();
    }
}

/// A gateway device proxying indirectly connected children.
pub struct GatewayClient {
    inner: DeviceClient,
}

impl GatewayClient {
    /// Registers an indirectly connected device and returns its endpoint
    /// ID. Messages on behalf of the child carry that endpoint ID as
    /// their source.
    pub fn register_device(
        &self,
        hardware_id: &str,
        metadata: Map<String, Value>,
        device_models: &[String],
        restricted: bool,
    ) -> Result<String, ClientError> {
        gateway::register_indirect_device(
            self.inner.store.as_ref(),
            self.inner.connection.as_ref(),
            hardware_id,
            metadata,
            device_models,
            restricted,
        )
    }

    pub fn client(&self) -> &DeviceClient {
        &self.inner
    }

    pub fn close(&mut self) {
        self.inner.close();
    }
}

impl std::ops::Deref for GatewayClient {
    type Target = DeviceClient;

    fn deref(&self) -> &DeviceClient {
        &self.inner
    }
}
