//! Device-side messaging runtime for the IoT cloud service.
//!
//! The crate connects a single device (or a gateway with indirectly
//! connected children) to one cloud endpoint. It activates the device,
//! applies server-published device policies to outgoing data, and moves
//! messages through a bounded priority queue with retry, backoff and
//! optional guaranteed-delivery persistence. The same REST surface runs
//! over HTTP or MQTT depending on how the device was provisioned.
//!
//! The entry point is [`DeviceClientBuilder`]:
//!
//! ```no_run
//! use std::sync::Arc;
//! use iotcs_device::{DeviceClientBuilder, Message, MemoryTrustedAssetsStore};
//!
//! # fn main() -> Result<(), iotcs_device::ClientError> {
//! let store = Arc::new(MemoryTrustedAssetsStore::new(
//!     "https", "iot.example.com", 443, "my-client-id", b"shared-secret".to_vec(),
//! ));
//! let client = DeviceClientBuilder::new(store, vec!["urn:example:thermometer".into()])
//!     .with_persistence_file("device.db")
//!     .build()?;
//!
//! let message = Message::builder()
//!     .source(client.endpoint_id())
//!     .format("urn:example:thermometer:data")
//!     .data_item("temperature", 21.5)
//!     .build_data()?;
//! client.send("urn:example:thermometer", message)?;
//! # Ok(())
//! # }
//! ```

mod activation;
mod client;
mod config;
mod dispatcher;
mod error;
mod gateway;
mod message;
mod model;
mod persistence;
mod policy;
mod transport;
mod trust;

pub(crate) mod utils;

pub(crate) use activation::ActivationManager;

pub use client::{DeviceClient, DeviceClientBuilder, GatewayClient};
pub use config::Config;
pub use dispatcher::{
    DeliveryCallback, DispatcherCounters, ErrorCallback, FnRequestHandler, MessageDispatcher,
    ProgressState, RequestDispatcher, RequestHandler, StorageBackend, StorageObject,
    StorageProgressCallback,
};
pub use error::ClientError;
pub use message::{
    AlertSeverity, Message, MessageBuilder, MessageType, Payload, Priority, Reliability,
    RequestMessage, ResponseMessage,
};
pub use model::{Attribute, AttributeType, DeviceModel};
pub use persistence::MessagePersistence;
pub use policy::{
    DevicePolicy, DevicePolicyManager, FormulaEvaluator, PolicyChangeListener, PolicyFunction,
    SimpleFormulaEvaluator,
};
pub use transport::{Response, SecureConnection, Transport};
pub use trust::{MemoryTrustedAssetsStore, SignAlgorithm, TrustedAssetsStore};
