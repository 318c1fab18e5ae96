//! Server-to-device request handling.
//!
//! Handlers are looked up by (endpoint, path, method) and run on a small
//! pool of worker threads; their responses travel back through the
//! outbound queue. During the settle window after startup, requests that
//! resolve to 404 are parked and retried, because the embedder may simply
//! not have registered its handlers yet.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, RecvTimeoutError, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::ClientError;
use crate::message::{Message, RequestMessage, ResponseMessage};

use super::DispatcherCore;

/// Buffered requests per dispatcher before submissions are dropped.
const SUBMISSION_BUFFER: usize = 50;
/// How long workers sleep between checks of the pending list.
const WORKER_TICK: Duration = Duration::from_millis(100);
/// Floor for the settle retry pause.
const MIN_RETRY_PAUSE: Duration = Duration::from_millis(100);

/// Handles one request addressed to a device resource.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, request: &RequestMessage) -> ResponseMessage;
}

/// Adapter for closure handlers.
pub struct FnRequestHandler<F>(pub F);

impl<F> RequestHandler for FnRequestHandler<F>
where
    F: Fn(&RequestMessage) -> ResponseMessage + Send + Sync,
{
    fn handle(&self, request: &RequestMessage) -> ResponseMessage {
        (self.0)(request)
    }
}

/// (endpoint, path, method); the empty endpoint matches any destination.
type HandlerKey = (String, String, String);

struct PendingRequest {
    request: RequestMessage,
    not_before: Instant,
}

pub struct RequestDispatcher {
    core: Arc<DispatcherCore>,
    handlers: Mutex<HashMap<HandlerKey, Arc<dyn RequestHandler>>>,
    pending: Arc<Mutex<Vec<PendingRequest>>>,
    sender: Mutex<Option<mpsc::SyncSender<RequestMessage>>>,
    receiver_slot: Mutex<Option<Arc<Mutex<mpsc::Receiver<RequestMessage>>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: Instant,
}

impl RequestDispatcher {
    pub(super) fn start(core: Arc<DispatcherCore>) -> RequestDispatcher {
        let (sender, receiver) = mpsc::sync_channel::<RequestMessage>(SUBMISSION_BUFFER);

        RequestDispatcher {
            core,
            handlers: Mutex::new(HashMap::new()),
            pending: Arc::new(Mutex::new(Vec::new())),
            sender: Mutex::new(Some(sender)),
            receiver_slot: Mutex::new(Some(Arc::new(Mutex::new(receiver)))),
            workers: Mutex::new(Vec::new()),
            started: Instant::now(),
        }
    }

    /// Spawns the worker pool. Done separately from construction so the
    /// shared `Arc<RequestDispatcher>` can be cloned into the workers.
    pub(super) fn spawn_workers(self: &Arc<Self>) {
        let Some(receiver) = self.receiver_slot.lock().expect("receiver slot lock").take()
        else {
            return;
        };
        let pool_size = self.core.config.request_dispatcher_thread_pool_size;
        let mut workers = self.workers.lock().expect("worker list lock");
        for index in 0..pool_size {
            let dispatcher = self.clone();
            let receiver = receiver.clone();
            let worker = std::thread::Builder::new()
                .name(format!("Request dispatcher {index}"))
                .spawn(move || dispatcher.worker_loop(receiver))
                .expect("Unable to spawn thread");
            workers.push(worker);
        }
    }

    /// Registers a handler. The empty endpoint id makes the handler
    /// answer regardless of the request destination.
    pub fn register(
        &self,
        endpoint_id: &str,
        path: &str,
        method: &str,
        handler: Arc<dyn RequestHandler>,
    ) {
        let key = handler_key(endpoint_id, path, method);
        log::debug!("Registering request handler for {} {}", key.2, key.1);
        self.handlers
            .lock()
            .expect("handler table lock")
            .insert(key, handler);
    }

    pub fn deregister(&self, endpoint_id: &str, path: &str, method: &str) {
        let key = handler_key(endpoint_id, path, method);
        self.handlers.lock().expect("handler table lock").remove(&key);
    }

    /// Resolves and runs the handler synchronously.
    pub fn dispatch(&self, request: &RequestMessage) -> ResponseMessage {
        let destination = request.destination.clone().unwrap_or_default();
        let path = normalize_path(&request.path);
        let method = request.method.to_uppercase();

        let handler = {
            let handlers = self.handlers.lock().expect("handler table lock");
            handlers
                .get(&(destination.clone(), path.clone(), method.clone()))
                .or_else(|| handlers.get(&(String::new(), path.clone(), method.clone())))
                .cloned()
        };

        let Some(handler) = handler else {
            // Distinguish an unknown resource from a known one addressed
            // with the wrong method.
            let path_known = {
                let handlers = self.handlers.lock().expect("handler table lock");
                handlers
                    .keys()
                    .any(|(e, p, _)| *p == path && (*e == destination || e.is_empty()))
            };
            let status = if path_known { 405 } else { 404 };
            return ResponseMessage::new(request, status, b"");
        };

        match catch_unwind(AssertUnwindSafe(|| handler.handle(request))) {
            Ok(response) => response,
            Err(cause) => {
                let reason = cause
                    .downcast_ref::<&'static str>()
                    .map(|s| (*s).to_owned())
                    .or_else(|| cause.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_owned());
                log::error!(
                    "Request handler for {} {} panicked: {reason}",
                    request.method,
                    request.path
                );
                self.core.callbacks.notify_failed(
                    &[],
                    &ClientError::Other(anyhow::anyhow!("request handler panicked: {reason}")),
                );
                ResponseMessage::new(request, 500, b"")
            }
        }
    }

    /// Hands a request to the worker pool.
    pub fn submit(&self, request: RequestMessage) {
        let guard = self.sender.lock().expect("submission sender lock");
        let Some(sender) = guard.as_ref() else {
            log::warn!("Request received after the dispatcher shut down, ignoring it");
            return;
        };
        match sender.try_send(request) {
            Ok(()) => {}
            Err(TrySendError::Full(request)) => {
                log::warn!(
                    "Request buffer is full, dropping request {} {}",
                    request.method,
                    request.path
                );
            }
            Err(TrySendError::Disconnected(request)) => {
                log::warn!(
                    "Request workers are gone, dropping request {} {}",
                    request.method,
                    request.path
                );
            }
        }
    }

    fn worker_loop(self: Arc<Self>, receiver: Arc<Mutex<mpsc::Receiver<RequestMessage>>>) {
        loop {
            let received = {
                let receiver = receiver.lock().expect("submission receiver lock");
                receiver.recv_timeout(WORKER_TICK)
            };

            match received {
                Ok(request) => self.process(request),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            self.process_due_pending();

            if self.core.closing() {
                break;
            }
        }
        log::debug!("Request worker is stopping");
    }

    fn process(&self, request: RequestMessage) {
        let response = self.dispatch(&request);

        if response.status_code == 404 && self.in_settle_window() {
            log::debug!(
                "No handler yet for {} {}, parking the request until the settle window closes",
                request.method,
                request.path
            );
            self.pending.lock().expect("pending request lock").push(PendingRequest {
                request,
                not_before: Instant::now() + self.retry_pause(),
            });
            return;
        }

        self.respond(response);
    }

    fn process_due_pending(&self) {
        let now = Instant::now();
        let due: Vec<RequestMessage> = {
            let mut pending = self.pending.lock().expect("pending request lock");
            let mut due = Vec::new();
            let mut index = 0;
            while index < pending.len() {
                if pending[index].not_before <= now {
                    due.push(pending.swap_remove(index).request);
                } else {
                    index += 1;
                }
            }
            due
        };

        for request in due {
            self.process(request);
        }
    }

    fn in_settle_window(&self) -> bool {
        self.started.elapsed() < self.core.config.dispatcher_settle_time
    }

    /// At least one average wait between settle retries; the average wait
    /// is the current polling interval.
    fn retry_pause(&self) -> Duration {
        Duration::from_millis(self.core.polling_interval_ms.load(Ordering::Relaxed))
            .max(MIN_RETRY_PAUSE)
    }

    fn respond(&self, response: ResponseMessage) {
        let message = Message::from_response(self.core.endpoint_id.clone(), response);
        if let Err(e) = self.core.queue.queue(vec![message]) {
            log::warn!("Unable to queue a response message: {e}");
        }
    }

    pub(super) fn close(&self) {
        // Dropping the sender lets the workers drain and stop.
        drop(self.sender.lock().expect("submission sender lock").take());
        let mut workers = self.workers.lock().expect("worker list lock");
        for mut worker in workers.drain(..).map(Some) {
            crate::utils::thread::join(&mut worker);
        }
    }
}

fn handler_key(endpoint_id: &str, path: &str, method: &str) -> HandlerKey {
    (
        endpoint_id.to_owned(),
        normalize_path(path),
        method.to_uppercase(),
    )
}

fn normalize_path(path: &str) -> String {
    path.trim_start_matches('/').to_owned()
}
