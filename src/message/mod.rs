//! Outbound and inbound message model plus its wire representation.
//!
//! Messages are immutable after they are built; the only field the
//! dispatcher touches afterwards is the remaining retry budget.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::ClientError;

pub mod envelope;

pub use envelope::{RequestMessage, ResponseMessage};

/// Maximum UTF-8 length of a data item key.
const MAX_KEY_LENGTH: usize = 2_048;
/// Maximum UTF-8 length of a string data item value.
const MAX_STRING_VALUE_LENGTH: usize = 65_536;
/// Tolerated clock difference between the device and the server.
const MAX_CLOCK_SKEW_MS: i64 = 120_000;

/// Default and minimum send attempts per message.
pub const DEFAULT_RETRIES: u32 = 3;

static NEXT_ORDINAL: AtomicU64 = AtomicU64::new(0);

/// Delivery priority. Higher priorities leave the outbound queue first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Lowest,
    #[default]
    Low,
    Medium,
    High,
    Highest,
}

/// Delivery guarantee class. Guaranteed-delivery messages are persisted
/// until the server acknowledges them and survive process restarts.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reliability {
    NoGuarantee,
    #[default]
    BestEffort,
    GuaranteedDelivery,
}

/// Kind of a message, mirrored in the wire `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Data,
    Alert,
    Request,
    Response,
    ResourcesReport,
}

/// Severity carried by alert messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertSeverity {
    Low,
    #[default]
    Normal,
    Significant,
    Critical,
}

/// Message body. The variant must agree with [`MessageType`]; the builder
/// and the envelope constructors keep the two in sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Response(ResponseMessage),
    Request(RequestMessage),
    Alert {
        format: String,
        severity: AlertSeverity,
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        data: Map<String, Value>,
    },
    Data {
        format: String,
        data: Map<String, Value>,
    },
}

impl Payload {
    /// Format URN for data-bearing payloads, `None` for envelopes.
    pub fn format(&self) -> Option<&str> {
        match self {
            Payload::Data { format, .. } | Payload::Alert { format, .. } => Some(format),
            _ => None,
        }
    }

    /// Data items for data-bearing payloads.
    pub fn data(&self) -> Option<&Map<String, Value>> {
        match self {
            Payload::Data { data, .. } | Payload::Alert { data, .. } => Some(data),
            _ => None,
        }
    }
}

/// A single unit of outbound or inbound traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "clientId")]
    client_id: String,
    #[serde(default)]
    source: String,
    #[serde(default)]
    destination: String,
    #[serde(default)]
    sender: String,
    #[serde(default)]
    priority: Priority,
    #[serde(default)]
    reliability: Reliability,
    #[serde(rename = "eventTime")]
    event_time: i64,
    #[serde(rename = "type")]
    kind: MessageType,
    payload: Payload,
    // Local bookkeeping, never on the wire.
    #[serde(skip)]
    ordinal: u64,
    #[serde(skip, default = "default_retries")]
    remaining_retries: u32,
}

fn default_retries() -> u32 {
    DEFAULT_RETRIES
}

impl Message {
    pub fn builder() -> MessageBuilder {
        MessageBuilder::new()
    }

    /// Wraps a response envelope so it can travel back through the
    /// outbound queue.
    pub(crate) fn from_response(source: String, response: ResponseMessage) -> Message {
        Message {
            client_id: Uuid::new_v4().to_string(),
            source,
            destination: String::new(),
            sender: String::new(),
            priority: Priority::Highest,
            reliability: Reliability::BestEffort,
            event_time: Utc::now().timestamp_millis(),
            kind: MessageType::Response,
            payload: Payload::Response(response),
            ordinal: NEXT_ORDINAL.fetch_add(1, Ordering::Relaxed),
            remaining_retries: DEFAULT_RETRIES,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn reliability(&self) -> Reliability {
        self.reliability
    }

    pub fn event_time(&self) -> i64 {
        self.event_time
    }

    pub fn kind(&self) -> MessageType {
        self.kind
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub(crate) fn payload_mut(&mut self) -> &mut Payload {
        &mut self.payload
    }

    pub fn ordinal(&self) -> u64 {
        self.ordinal
    }

    pub fn remaining_retries(&self) -> u32 {
        self.remaining_retries
    }

    pub(crate) fn set_remaining_retries(&mut self, retries: u32) {
        self.remaining_retries = retries;
    }

    /// Takes one retry from the budget. False means the budget was
    /// already empty and the message fails terminally.
    pub(crate) fn consume_retry(&mut self) -> bool {
        if self.remaining_retries == 0 {
            return false;
        }
        self.remaining_retries -= 1;
        true
    }

    /// Canonical wire form, used both for posting and persistence.
    pub fn to_wire_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_wire_json(bytes: &[u8]) -> serde_json::Result<Message> {
        let mut message: Message = serde_json::from_slice(bytes)?;
        message.ordinal = NEXT_ORDINAL.fetch_add(1, Ordering::Relaxed);
        Ok(message)
    }

    /// Serializes a batch into the JSON array the server expects.
    pub fn batch_to_wire_json(messages: &[Message]) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(messages)
    }
}

/// Builds [`Message`] values, rejecting anything that would be refused by
/// the server once on the wire.
#[derive(Debug, Default)]
pub struct MessageBuilder {
    source: String,
    destination: String,
    sender: String,
    priority: Priority,
    reliability: Reliability,
    event_time: Option<i64>,
    kind: Option<MessageType>,
    format: Option<String>,
    severity: AlertSeverity,
    description: Option<String>,
    data: Map<String, Value>,
    retries: u32,
}

impl MessageBuilder {
    pub fn new() -> Self {
        MessageBuilder {
            retries: DEFAULT_RETRIES,
            ..Default::default()
        }
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = destination.into();
        self
    }

    pub fn sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = sender.into();
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn reliability(mut self, reliability: Reliability) -> Self {
        self.reliability = reliability;
        self
    }

    pub fn event_time(mut self, epoch_millis: i64) -> Self {
        self.event_time = Some(epoch_millis);
        self
    }

    /// Retry budget; values below the minimum are raised to it.
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries.max(DEFAULT_RETRIES);
        self
    }

    pub fn format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub fn severity(mut self, severity: AlertSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn data_item(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn data(mut self, data: Map<String, Value>) -> Self {
        self.data = data;
        self
    }

    /// Builds a DATA message.
    pub fn build_data(self) -> Result<Message, ClientError> {
        self.build(MessageType::Data)
    }

    /// Builds an ALERT message.
    pub fn build_alert(self) -> Result<Message, ClientError> {
        self.build(MessageType::Alert)
    }

    /// Builds a RESOURCES_REPORT message.
    pub fn build_resources_report(self) -> Result<Message, ClientError> {
        self.build(MessageType::ResourcesReport)
    }

    fn build(mut self, kind: MessageType) -> Result<Message, ClientError> {
        self.kind = Some(kind);

        let now = Utc::now().timestamp_millis();
        let event_time = self.event_time.unwrap_or(now);
        if event_time > now + MAX_CLOCK_SKEW_MS {
            return Err(ClientError::InvalidMessage(format!(
                "event time {event_time} lies further than {MAX_CLOCK_SKEW_MS} ms in the future"
            )));
        }

        validate_data(&self.data)?;

        let payload = match kind {
            MessageType::Data | MessageType::ResourcesReport => {
                let format = self.require_format(kind)?;
                Payload::Data {
                    format,
                    data: self.data,
                }
            }
            MessageType::Alert => {
                let format = self.require_format(kind)?;
                Payload::Alert {
                    format,
                    severity: self.severity,
                    description: self.description,
                    data: self.data,
                }
            }
            MessageType::Request | MessageType::Response => {
                return Err(ClientError::InvalidMessage(
                    "request and response messages are created from envelopes".into(),
                ));
            }
        };

        Ok(Message {
            client_id: Uuid::new_v4().to_string(),
            source: self.source,
            destination: self.destination,
            sender: self.sender,
            priority: self.priority,
            reliability: self.reliability,
            event_time,
            kind,
            payload,
            ordinal: NEXT_ORDINAL.fetch_add(1, Ordering::Relaxed),
            remaining_retries: self.retries,
        })
    }

    fn require_format(&mut self, kind: MessageType) -> Result<String, ClientError> {
        match self.format.take() {
            Some(format) if !format.is_empty() => Ok(format),
            _ => Err(ClientError::InvalidMessage(format!(
                "{kind:?} messages need a non-empty payload format"
            ))),
        }
    }
}

fn validate_data(data: &Map<String, Value>) -> Result<(), ClientError> {
    for (key, value) in data {
        if key.len() > MAX_KEY_LENGTH {
            return Err(ClientError::InvalidMessage(format!(
                "data item key exceeds {MAX_KEY_LENGTH} bytes"
            )));
        }
        if let Value::String(s) = value {
            if s.len() > MAX_STRING_VALUE_LENGTH {
                return Err(ClientError::InvalidMessage(format!(
                    "value of data item '{}' exceeds {MAX_STRING_VALUE_LENGTH} bytes",
                    truncate_for_log(key)
                )));
            }
        }
    }
    Ok(())
}

fn truncate_for_log(key: &str) -> &str {
    let mut end = key.len().min(64);
    while !key.is_char_boundary(end) {
        end -= 1;
    }
    &key[..end]
}

#[cfg(test)]
mod test {
    use super::*;

    fn data_message() -> Message {
        Message::builder()
            .source("0-AB")
            .priority(Priority::High)
            .reliability(Reliability::GuaranteedDelivery)
            .format("urn:test:sensor")
            .data_item("temperature", 21.5)
            .data_item("unit", "celsius")
            .build_data()
            .unwrap()
    }

    #[test]
    fn ordinals_are_monotonic() {
        let first = data_message();
        let second = data_message();
        assert!(second.ordinal() > first.ordinal());
    }

    #[test]
    fn client_ids_are_unique() {
        assert_ne!(data_message().client_id(), data_message().client_id());
    }

    #[test]
    fn priority_orders_as_expected() {
        assert!(Priority::Highest > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
        assert!(Priority::Low > Priority::Lowest);
        assert!(Reliability::GuaranteedDelivery > Reliability::BestEffort);
        assert!(Reliability::BestEffort > Reliability::NoGuarantee);
    }

    #[test]
    fn wire_round_trip_preserves_data_message() {
        let message = data_message();
        let bytes = message.to_wire_json().unwrap();
        let parsed = Message::from_wire_json(&bytes).unwrap();

        assert_eq!(parsed.client_id(), message.client_id());
        assert_eq!(parsed.priority(), message.priority());
        assert_eq!(parsed.reliability(), message.reliability());
        assert_eq!(parsed.event_time(), message.event_time());
        assert_eq!(parsed.kind(), message.kind());
        assert_eq!(parsed.payload(), message.payload());
    }

    #[test]
    fn wire_round_trip_preserves_alert() {
        let message = Message::builder()
            .source("0-AB")
            .format("urn:test:alert")
            .severity(AlertSeverity::Critical)
            .description("too hot")
            .data_item("temperature", 99)
            .build_alert()
            .unwrap();

        let bytes = message.to_wire_json().unwrap();
        let parsed = Message::from_wire_json(&bytes).unwrap();
        assert_eq!(parsed.payload(), message.payload());
        assert_eq!(parsed.kind(), MessageType::Alert);
    }

    #[test]
    fn wire_format_uses_server_field_names() {
        let message = data_message();
        let value: Value = serde_json::from_slice(&message.to_wire_json().unwrap()).unwrap();
        assert!(value.get("clientId").is_some());
        assert!(value.get("eventTime").is_some());
        assert_eq!(value["type"], "DATA");
        assert_eq!(value["priority"], "HIGH");
        assert_eq!(value["reliability"], "GUARANTEED_DELIVERY");
        assert_eq!(value["payload"]["format"], "urn:test:sensor");
        // Local bookkeeping must not leak onto the wire.
        assert!(value.get("ordinal").is_none());
        assert!(value.get("remainingRetries").is_none());
    }

    #[test]
    fn rejects_missing_format() {
        let result = Message::builder().data_item("a", 1).build_data();
        assert!(matches!(result, Err(ClientError::InvalidMessage(_))));
    }

    #[test]
    fn rejects_oversized_key() {
        let result = Message::builder()
            .format("urn:test")
            .data_item("k".repeat(MAX_KEY_LENGTH + 1), 1)
            .build_data();
        assert!(matches!(result, Err(ClientError::InvalidMessage(_))));
    }

    #[test]
    fn rejects_oversized_string_value() {
        let result = Message::builder()
            .format("urn:test")
            .data_item("k", "v".repeat(MAX_STRING_VALUE_LENGTH + 1))
            .build_data();
        assert!(matches!(result, Err(ClientError::InvalidMessage(_))));
    }

    #[test]
    fn rejects_event_time_beyond_clock_skew() {
        let result = Message::builder()
            .format("urn:test")
            .event_time(Utc::now().timestamp_millis() + MAX_CLOCK_SKEW_MS + 10_000)
            .build_data();
        assert!(matches!(result, Err(ClientError::InvalidMessage(_))));
    }

    #[test]
    fn retry_budget_has_a_floor() {
        let message = Message::builder()
            .format("urn:test")
            .retries(1)
            .build_data()
            .unwrap();
        assert_eq!(message.remaining_retries(), DEFAULT_RETRIES);
    }
}
