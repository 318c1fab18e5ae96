use std::time::Duration;

use crate::error::ClientError;

/// Runtime options of the messaging stack.
///
/// Every field has a production default; the builder only overrides what the
/// embedder asks for. Durations configured in seconds on the wire side
/// (keep-alive, connect timeout) are kept as [`Duration`] here.
#[derive(Debug, Clone)]
pub struct Config {
    /// MQTT connect timeout.
    pub mqtt_connection_timeout: Duration,
    /// MQTT keep-alive interval.
    pub mqtt_keep_alive_interval: Duration,
    /// QoS used for publishing data messages (0, 1 or 2).
    pub send_message_qos: u8,
    /// How long a publish waits for its expected reply before the
    /// connection is torn down.
    pub mqtt_time_to_wait: Duration,
    /// Maximum number of messages the outbound queue holds.
    pub dispatcher_max_queue_size: usize,
    /// Maximum number of messages posted in one request.
    pub dispatcher_max_messages_per_connection: usize,
    /// Receive poll period when long polling is not in effect.
    pub dispatcher_polling_interval: Duration,
    /// Startup window during which unresolvable requests are retried
    /// instead of answered with 404.
    pub dispatcher_settle_time: Duration,
    /// Base delay multiplied by the Fibonacci sequence during backoff.
    pub message_dispatcher_backoff: Duration,
    /// Force interval polling even on transports that can long poll.
    pub disable_long_polling: bool,
    /// Number of worker threads running request handlers.
    pub request_dispatcher_thread_pool_size: usize,
    /// Accept device models still in draft state.
    pub allow_draft_device_models: bool,
    /// Send attempts per message before it is surfaced as failed.
    pub dispatcher_basic_number_of_retries: u32,
    /// Byte budget of the buffer holding received, not yet dispatched
    /// requests.
    pub request_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            mqtt_connection_timeout: Duration::from_secs(30),
            mqtt_keep_alive_interval: Duration::from_secs(60),
            send_message_qos: 1,
            mqtt_time_to_wait: Duration::from_millis(1_000),
            dispatcher_max_queue_size: 10_000,
            dispatcher_max_messages_per_connection: 1_000,
            dispatcher_polling_interval: Duration::from_millis(3_000),
            dispatcher_settle_time: Duration::from_millis(10_000),
            message_dispatcher_backoff: Duration::from_millis(1_000),
            disable_long_polling: false,
            request_dispatcher_thread_pool_size: 1,
            allow_draft_device_models: false,
            dispatcher_basic_number_of_retries: 3,
            request_buffer_size: 4_192,
        }
    }
}

impl Config {
    /// Rejects combinations that would wedge the dispatcher before any
    /// worker is started.
    pub(crate) fn validate(&self) -> Result<(), ClientError> {
        if self.send_message_qos > 2 {
            return Err(ClientError::Config(format!(
                "send_message_qos must be 0, 1 or 2, got {}",
                self.send_message_qos
            )));
        }
        if self.dispatcher_max_queue_size == 0 {
            return Err(ClientError::Config(
                "dispatcher_max_queue_size must be positive".into(),
            ));
        }
        if self.dispatcher_max_messages_per_connection == 0 {
            return Err(ClientError::Config(
                "dispatcher_max_messages_per_connection must be positive".into(),
            ));
        }
        if self.request_dispatcher_thread_pool_size == 0 {
            return Err(ClientError::Config(
                "request_dispatcher_thread_pool_size must be positive".into(),
            ));
        }
        if self.dispatcher_basic_number_of_retries < 3 {
            return Err(ClientError::Config(format!(
                "dispatcher_basic_number_of_retries must be at least 3, got {}",
                self.dispatcher_basic_number_of_retries
            )));
        }
        Ok(())
    }
}
