//! Outbound message dispatcher: bounded priority queue, transmit and
//! receive workers, request handling and storage-upload coordination.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use serde::Serialize;

use crate::config::Config;
use crate::error::ClientError;
use crate::message::Message;
use crate::persistence::MessagePersistence;
use crate::transport::Transport;

pub(crate) mod queue;
mod receiver;
mod request;
mod resources;
pub mod storage;
mod transmitter;

pub use request::{FnRequestHandler, RequestDispatcher, RequestHandler};
pub use storage::{ProgressState, StorageBackend, StorageObject, StorageProgressCallback};

use queue::OutgoingQueue;
use storage::StorageDispatcher;

/// Snapshot of the dispatcher counters, also served by the capability
/// resource.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatcherCounters {
    pub load: usize,
    pub total_messages_sent: u64,
    pub total_messages_received: u64,
    pub total_messages_retried: u64,
    pub total_bytes_sent: u64,
    pub total_bytes_received: u64,
    pub total_protocol_errors: u64,
}

#[derive(Default)]
pub(crate) struct Counters {
    pub sent: AtomicU64,
    pub received: AtomicU64,
    pub retried: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub protocol_errors: AtomicU64,
}

impl Counters {
    fn snapshot(&self, load: usize) -> DispatcherCounters {
        DispatcherCounters {
            load,
            total_messages_sent: self.sent.load(Ordering::Relaxed),
            total_messages_received: self.received.load(Ordering::Relaxed),
            total_messages_retried: self.retried.load(Ordering::Relaxed),
            total_bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            total_bytes_received: self.bytes_received.load(Ordering::Relaxed),
            total_protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.sent.store(0, Ordering::Relaxed);
        self.received.store(0, Ordering::Relaxed);
        self.retried.store(0, Ordering::Relaxed);
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
        self.protocol_errors.store(0, Ordering::Relaxed);
    }
}

/// Invoked once per successfully delivered batch.
pub type DeliveryCallback = Box<dyn Fn(&[Message]) + Send + Sync>;
/// Invoked exactly once per terminally failed message batch.
pub type ErrorCallback = Box<dyn Fn(&[Message], &ClientError) + Send + Sync>;

#[derive(Default)]
pub(crate) struct Callbacks {
    pub delivery: Mutex<Option<DeliveryCallback>>,
    pub error: Mutex<Option<ErrorCallback>>,
}

impl Callbacks {
    pub fn notify_delivered(&self, messages: &[Message]) {
        // User code runs without any dispatcher lock held.
        let guard = self.delivery.lock().expect("delivery callback lock");
        if let Some(callback) = guard.as_ref() {
            callback(messages);
        }
    }

    pub fn notify_failed(&self, messages: &[Message], error: &ClientError) {
        let guard = self.error.lock().expect("error callback lock");
        if let Some(callback) = guard.as_ref() {
            callback(messages, error);
        }
    }
}

/// Storage-upload gating: which messages wait on which object, and which
/// uploads already failed.
#[derive(Default)]
pub(crate) struct ContentState {
    /// Storage object id -> client ids of messages waiting for it.
    content_map: HashMap<String, HashSet<String>>,
    /// Client ids whose upload failed terminally.
    failed_content_ids: HashSet<String>,
}

#[derive(Default)]
pub(crate) struct ContentTracker {
    state: Mutex<ContentState>,
}

impl ContentTracker {
    pub fn register(&self, storage_id: &str, message_client_id: &str) {
        self.state
            .lock()
            .expect("content lock")
            .content_map
            .entry(storage_id.to_owned())
            .or_default()
            .insert(message_client_id.to_owned());
    }

    /// Upload finished: success frees the messages, failure marks them.
    pub fn settle(&self, storage_id: &str, success: bool) {
        let mut state = self.state.lock().expect("content lock");
        if let Some(client_ids) = state.content_map.remove(storage_id) {
            if !success {
                state.failed_content_ids.extend(client_ids);
            }
        }
    }

    pub fn is_gated(&self, message_client_id: &str) -> bool {
        self.state
            .lock()
            .expect("content lock")
            .content_map
            .values()
            .any(|ids| ids.contains(message_client_id))
    }

    pub fn take_failed(&self, message_client_id: &str) -> bool {
        self.state
            .lock()
            .expect("content lock")
            .failed_content_ids
            .remove(message_client_id)
    }
}

/// Signal from the transmitter to the receiver: bumped after every
/// successful send, also used to pace interval polling.
#[derive(Default)]
pub(crate) struct SendSignal {
    sends: Mutex<u64>,
    changed: Condvar,
}

impl SendSignal {
    pub fn notify_sent(&self) {
        let mut sends = self.sends.lock().expect("send signal lock");
        *sends += 1;
        drop(sends);
        self.changed.notify_all();
    }

    /// Waits until a send happens or the timeout passes; returns the new
    /// generation either way.
    pub fn wait(&self, seen: u64, timeout: std::time::Duration) -> u64 {
        let sends = self.sends.lock().expect("send signal lock");
        if *sends != seen {
            return *sends;
        }
        let (guard, _) = self
            .changed
            .wait_timeout(sends, timeout)
            .expect("send signal lock");
        *guard
    }

    pub fn generation(&self) -> u64 {
        *self.sends.lock().expect("send signal lock")
    }
}

pub(crate) struct DispatcherCore {
    pub config: Config,
    pub endpoint_id: String,
    pub connection: Arc<dyn Transport>,
    pub queue: OutgoingQueue,
    pub counters: Counters,
    pub callbacks: Callbacks,
    pub content: ContentTracker,
    pub send_signal: SendSignal,
    pub persistence: Option<Arc<MessagePersistence>>,
    pub request_close: AtomicBool,
    /// Poll period in ms; mutable at runtime through the capability
    /// resource.
    pub polling_interval_ms: AtomicU64,
}

impl DispatcherCore {
    pub fn closing(&self) -> bool {
        self.request_close.load(Ordering::Relaxed)
    }
}

/// The device-side message dispatcher. One per client; owns the transmit
/// and receive workers and tears them down on [`MessageDispatcher::close`]
/// or drop.
pub struct MessageDispatcher {
    core: Arc<DispatcherCore>,
    request_dispatcher: Arc<RequestDispatcher>,
    storage: StorageDispatcher,
    transmitter: Option<JoinHandle<()>>,
    receiver: Option<JoinHandle<()>>,
}

impl MessageDispatcher {
    /// Starts the dispatcher: restores persisted guaranteed-delivery
    /// messages, registers the built-in resources and spawns the workers.
    pub fn start(
        connection: Arc<dyn Transport>,
        endpoint_id: String,
        config: Config,
        persistence: Option<Arc<MessagePersistence>>,
    ) -> Result<MessageDispatcher, ClientError> {
        config.validate()?;

        let core = Arc::new(DispatcherCore {
            queue: OutgoingQueue::new(config.dispatcher_max_queue_size),
            counters: Counters::default(),
            callbacks: Callbacks::default(),
            content: ContentTracker::default(),
            send_signal: SendSignal::default(),
            persistence,
            request_close: AtomicBool::new(false),
            polling_interval_ms: AtomicU64::new(
                config.dispatcher_polling_interval.as_millis() as u64
            ),
            endpoint_id,
            connection,
            config,
        });

        // Guaranteed-delivery messages from a previous run go first.
        if let Some(persistence) = &core.persistence {
            match persistence.load_all(&core.endpoint_id) {
                Ok(messages) if !messages.is_empty() => {
                    log::info!(
                        "Restoring {} guaranteed-delivery messages from the local database",
                        messages.len()
                    );
                    if let Err(e) = core.queue.queue(messages) {
                        log::error!("Unable to restore persisted messages: {e}");
                    }
                }
                Ok(_) => {}
                Err(e) => log::warn!("Unable to load persisted messages: {e:?}"),
            }
        }

        let request_dispatcher = Arc::new(RequestDispatcher::start(core.clone()));
        request_dispatcher.spawn_workers();
        resources::register_builtin_resources(&request_dispatcher, &core);

        let storage = StorageDispatcher::start(core.clone());

        let transmitter = transmitter::spawn(core.clone());
        let receiver = receiver::spawn(core.clone(), request_dispatcher.clone());

        Ok(MessageDispatcher {
            core,
            request_dispatcher,
            storage,
            transmitter: Some(transmitter),
            receiver: Some(receiver),
        })
    }

    /// Reserves queue slots for all messages or rejects the whole batch.
    pub fn queue(&self, mut messages: Vec<Message>) -> Result<(), ClientError> {
        // The configured retry budget is the floor for every message.
        let retries = self.core.config.dispatcher_basic_number_of_retries;
        for message in &mut messages {
            if message.remaining_retries() < retries {
                message.set_remaining_retries(retries);
            }
        }
        self.core.queue.queue(messages)
    }

    /// Queues a message whose URI data item points at a storage object
    /// that is still uploading. The message stays gated until the upload
    /// settles.
    pub fn queue_with_storage(
        &self,
        message: Message,
        object: &StorageObject,
    ) -> Result<(), ClientError> {
        self.core.content.register(object.id(), message.client_id());
        self.core.queue.queue(vec![message])
    }

    pub fn storage(&self) -> &StorageDispatcher {
        &self.storage
    }

    pub fn request_dispatcher(&self) -> &Arc<RequestDispatcher> {
        &self.request_dispatcher
    }

    pub fn set_delivery_callback(&self, callback: Option<DeliveryCallback>) {
        *self.core.callbacks.delivery.lock().expect("delivery callback lock") = callback;
    }

    pub fn set_error_callback(&self, callback: Option<ErrorCallback>) {
        *self.core.callbacks.error.lock().expect("error callback lock") = callback;
    }

    pub fn counters(&self) -> DispatcherCounters {
        self.core.counters.snapshot(self.core.queue.len())
    }

    /// Drains the queue, then stops the workers.
    pub fn close(&mut self) {
        if self.core.request_close.swap(true, Ordering::Relaxed) {
            return;
        }
        log::debug!("Message dispatcher is closing");

        self.core.queue.close();
        self.core.send_signal.notify_sent();

        crate::utils::thread::join(&mut self.transmitter);
        crate::utils::thread::join(&mut self.receiver);
        self.request_dispatcher.close();
        self.storage.close();
        self.core.connection.close();

        log::debug!("Message dispatcher is closed");
    }
}

impl Drop for MessageDispatcher {
    fn drop(&mut self) {
        self.close();
    }
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn content_tracker_gates_and_settles() {
        let tracker = ContentTracker::default();
        tracker.register("object-1", "message-1");
        assert!(tracker.is_gated("message-1"));
        assert!(!tracker.is_gated("message-2"));

        tracker.settle("object-1", true);
        assert!(!tracker.is_gated("message-1"));
        assert!(!tracker.take_failed("message-1"));

        tracker.register("object-2", "message-2");
        tracker.settle("object-2", false);
        assert!(!tracker.is_gated("message-2"));
        assert!(tracker.take_failed("message-2"));
        // A failure is consumed exactly once.
        assert!(!tracker.take_failed("message-2"));
    }

    #[test]
    fn counters_snapshot_and_reset() {
        let counters = Counters::default();
        counters.sent.fetch_add(3, Ordering::Relaxed);
        counters.protocol_errors.fetch_add(1, Ordering::Relaxed);

        let snapshot = counters.snapshot(7);
        assert_eq!(snapshot.load, 7);
        assert_eq!(snapshot.total_messages_sent, 3);
        assert_eq!(snapshot.total_protocol_errors, 1);

        counters.reset();
        assert_eq!(counters.snapshot(0).total_messages_sent, 0);
    }

    #[test]
    fn send_signal_wakes_waiters() {
        let signal = SendSignal::default();
        let seen = signal.generation();
        // Timeout path returns the unchanged generation.
        assert_eq!(signal.wait(seen, std::time::Duration::from_millis(5)), seen);

        signal.notify_sent();
        assert_eq!(signal.wait(seen, std::time::Duration::from_millis(5)), seen + 1);
    }
}
