//! Receive worker: long polls, interval polls or drains the MQTT inbound
//! queue, then hands requests to the request dispatcher.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::message::RequestMessage;
use crate::transport::Transport;

use super::request::RequestDispatcher;
use super::DispatcherCore;

/// Server-side wait used for long polls, in seconds.
const LONG_POLL_TIMEOUT_SECS: u64 = 20;
/// At most this many buffered MQTT requests are drained per turn.
const MQTT_DRAIN_LIMIT: usize = 16;

enum ReceiveMode {
    LongPolling,
    IntervalPolling,
    MqttQueue,
}

pub(super) fn spawn(
    core: Arc<DispatcherCore>,
    request_dispatcher: Arc<RequestDispatcher>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("Message dispatcher receiver".into())
        .spawn(move || {
            log::debug!("Receiver is starting");
            run(core, request_dispatcher);
            log::debug!("Receiver has finished");
        })
        .expect("Unable to spawn thread")
}

fn run(core: Arc<DispatcherCore>, request_dispatcher: Arc<RequestDispatcher>) {
    let mode = if !core.connection.supports_long_polling() {
        ReceiveMode::MqttQueue
    } else if core.config.disable_long_polling {
        ReceiveMode::IntervalPolling
    } else {
        ReceiveMode::LongPolling
    };

    let mut send_generation = core.send_signal.generation();

    while !core.closing() {
        // After a connection loss the receiver holds off until the
        // transmitter gets a message through again.
        if core.connection.is_connection_lost() {
            let next = core
                .send_signal
                .wait(send_generation, Duration::from_millis(1_000));
            if next == send_generation {
                continue;
            }
            send_generation = next;
        }

        match mode {
            ReceiveMode::LongPolling => {
                let rest_api = format!(
                    "/messages?acceptBytes={}&iot.sync&iot.timeout={}",
                    core.config.request_buffer_size, LONG_POLL_TIMEOUT_SECS
                );
                let started = std::time::Instant::now();
                poll(&core, &request_dispatcher, &rest_api);
                // A server that closes the poll right away must not turn
                // this loop into a busy wait.
                if started.elapsed() < Duration::from_millis(100) {
                    thread::sleep(Duration::from_millis(50));
                }
            }
            ReceiveMode::IntervalPolling => {
                send_generation = wait_polling_interval(&core, send_generation);
                if core.closing() {
                    break;
                }
                let rest_api =
                    format!("/messages?acceptBytes={}", core.config.request_buffer_size);
                poll(&core, &request_dispatcher, &rest_api);
            }
            ReceiveMode::MqttQueue => {
                let payloads = core.connection.take_inbound(MQTT_DRAIN_LIMIT);
                if payloads.is_empty() {
                    send_generation = wait_polling_interval(&core, send_generation);
                    continue;
                }
                for payload in payloads {
                    accept_payload(&core, &request_dispatcher, &payload);
                }
            }
        }
    }
}

fn wait_polling_interval(core: &DispatcherCore, seen: u64) -> u64 {
    let interval = Duration::from_millis(core.polling_interval_ms.load(Ordering::Relaxed));
    core.send_signal.wait(seen, interval)
}

/// One receive request. The post carries an empty batch; the interesting
/// part is the response body.
fn poll(core: &DispatcherCore, request_dispatcher: &RequestDispatcher, rest_api: &str) {
    match core.connection.post(rest_api, b"[]", None) {
        Ok(response) if response.is_success() => {
            if !response.data.is_empty() {
                accept_payload(core, request_dispatcher, &response.data);
            }
        }
        Ok(response) => {
            log::debug!("Receive poll was answered with status {}", response.status);
            core.counters.protocol_errors.fetch_add(1, Ordering::Relaxed);
            thread::sleep(Duration::from_millis(
                core.polling_interval_ms.load(Ordering::Relaxed),
            ));
        }
        Err(e) => {
            log::debug!("Receive poll failed: {e}");
            // Back off for one polling interval so connectivity trouble
            // does not spin the loop.
            thread::sleep(Duration::from_millis(
                core.polling_interval_ms.load(Ordering::Relaxed),
            ));
        }
    }
}

/// Parses a payload as one request or an array of them and submits each.
fn accept_payload(core: &DispatcherCore, request_dispatcher: &RequestDispatcher, payload: &[u8]) {
    let requests: Vec<RequestMessage> =
        match serde_json::from_slice::<Vec<RequestMessage>>(payload) {
            Ok(requests) => requests,
            Err(_) => match serde_json::from_slice::<RequestMessage>(payload) {
                Ok(request) => vec![request],
                Err(e) => {
                    log::warn!("Unable to parse an inbound request payload: {e}");
                    core.counters.protocol_errors.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            },
        };

    if requests.is_empty() {
        return;
    }

    core.counters
        .bytes_received
        .fetch_add(payload.len() as u64, Ordering::Relaxed);
    core.counters
        .received
        .fetch_add(requests.len() as u64, Ordering::Relaxed);

    for request in requests {
        log::debug!("Received request {} {}", request.method, request.path);
        request_dispatcher.submit(request);
    }
}
