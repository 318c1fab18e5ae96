//! MQTT transport variant.
//!
//! Each REST verb becomes a publish, optionally paired with a
//! subscribe-and-wait on the matching reply topic. A dedicated thread
//! drives the `rumqttc` connection; replies land in a shared table and are
//! handed over under a condition variable.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rumqttc::{
    Client, ConnectReturnCode, Connection, ConnectionError, Event, MqttOptions, Outgoing, Packet,
    Publish, QoS, TlsConfiguration, Transport as MqttTransport,
};
use serde_json::{json, Map, Value};

use crate::config::Config;
use crate::error::ClientError;
use crate::trust::TrustedAssetsStore;

use super::{client_assertion, topics, ErrorEnvelope, Response, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkPhase {
    Disconnected,
    Connecting,
    Connected,
    /// The broker refused the credentials; reconnecting with the same
    /// password is pointless.
    Refused(ConnectReturnCode),
}

struct SharedState {
    phase: Mutex<LinkPhase>,
    phase_changed: Condvar,
    replies: Mutex<HashMap<String, Option<Response>>>,
    reply_arrived: Condvar,
    inbound: Mutex<InboundQueue>,
    connection_lost: AtomicBool,
    stop: AtomicBool,
    inbound_topic: Mutex<String>,
}

struct InboundQueue {
    payloads: VecDeque<Vec<u8>>,
    bytes: usize,
    capacity: usize,
}

struct Link {
    client: Client,
    thread: Option<JoinHandle<()>>,
}

pub struct MqttConnection {
    store: Arc<dyn TrustedAssetsStore>,
    keep_alive: Duration,
    connection_timeout: Duration,
    time_to_wait: Duration,
    send_qos: QoS,
    state: Arc<SharedState>,
    link: Mutex<Option<Link>>,
}

impl MqttConnection {
    pub fn new(store: Arc<dyn TrustedAssetsStore>, config: &Config) -> MqttConnection {
        let state = Arc::new(SharedState {
            phase: Mutex::new(LinkPhase::Disconnected),
            phase_changed: Condvar::new(),
            replies: Mutex::new(HashMap::new()),
            reply_arrived: Condvar::new(),
            inbound: Mutex::new(InboundQueue {
                payloads: VecDeque::new(),
                bytes: 0,
                capacity: config.request_buffer_size,
            }),
            connection_lost: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            inbound_topic: Mutex::new(String::new()),
        });

        MqttConnection {
            store,
            keep_alive: config.mqtt_keep_alive_interval,
            connection_timeout: config.mqtt_connection_timeout,
            time_to_wait: config.mqtt_time_to_wait,
            send_qos: qos_from(config.send_message_qos),
            state,
            link: Mutex::new(None),
        }
    }

    fn id(&self) -> String {
        self.store
            .endpoint_id()
            .unwrap_or_else(|| self.store.client_id())
    }

    /// Drains up to `max` buffered server-to-device request payloads.
    pub fn take_inbound(&self, max: usize) -> Vec<Vec<u8>> {
        let mut inbound = self.state.inbound.lock().expect("inbound lock");
        let mut taken = Vec::new();
        while taken.len() < max {
            match inbound.payloads.pop_front() {
                Some(payload) => {
                    inbound.bytes -= payload.len();
                    taken.push(payload);
                }
                None => break,
            }
        }
        taken
    }

    // Connection management
    // ----------------------------------------------------------------

    fn phase(&self) -> LinkPhase {
        *self.state.phase.lock().expect("phase lock")
    }

    /// Reconnect is lazy: every publish path funnels through here.
    fn ensure_connected(&self) -> Result<(), ClientError> {
        {
            let link = self.link.lock().expect("link lock");
            if link.is_some() && self.phase() == LinkPhase::Connected {
                return Ok(());
            }
        }

        let first_attempt = self.connect_once(false);
        if self.phase() == LinkPhase::Connected {
            return Ok(());
        }

        // A device that generated its key pair but never learned its
        // endpoint ID can still authenticate by client assertion signed
        // with the private key. If that works, the endpoint ID equals the
        // provisioned client ID.
        let refused = matches!(self.phase(), LinkPhase::Refused(_));
        if refused && self.store.endpoint_id().is_none() && self.store.public_key().is_ok() {
            log::info!("Authentication was refused, retrying with client assertion credentials");
            self.connect_once(true)?;
            if self.phase() == LinkPhase::Connected {
                let client_id = self.store.client_id();
                self.store.set_endpoint_credentials(&client_id, None)?;
                return Ok(());
            }
        }

        first_attempt?;
        self.state.connection_lost.store(true, Ordering::Relaxed);
        Err(ClientError::Network(
            "unable to establish the MQTT connection".into(),
        ))
    }

    fn connect_once(&self, use_private_key: bool) -> Result<(), ClientError> {
        let mut link = self.link.lock().expect("link lock");

        // Tear down whatever is left of the previous session.
        if let Some(mut old) = link.take() {
            _ = old.client.disconnect();
            crate::utils::thread::join(&mut old.thread);
        }

        let id = self.id();
        let password = client_assertion(self.store.as_ref(), use_private_key)?;

        let mut options = MqttOptions::new(&id, self.store.server_host(), self.store.server_port());
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);
        options.set_credentials(&id, password);
        options.set_transport(MqttTransport::Tls(TlsConfiguration::Native));

        *self.state.phase.lock().expect("phase lock") = LinkPhase::Connecting;
        *self.state.inbound_topic.lock().expect("inbound topic lock") =
            topics::inbound_messages_topic(&id);

        let (client, connection) = Client::new(options, 10);

        let thread = thread::Builder::new()
            .name("MQTT event loop".into())
            .spawn({
                let state = self.state.clone();
                move || run_event_loop(connection, state)
            })
            .expect("Unable to spawn thread");

        // Inbound requests flow on the subscribed topic as soon as the
        // session is up.
        if let Err(e) = client.subscribe(topics::inbound_messages_topic(&id), QoS::AtLeastOnce) {
            log::warn!("Unable to request the inbound subscription: {e}");
        }

        *link = Some(Link {
            client,
            thread: Some(thread),
        });
        drop(link);

        self.wait_for_phase(self.connection_timeout);
        Ok(())
    }

    fn wait_for_phase(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let mut phase = self.state.phase.lock().expect("phase lock");
        while *phase == LinkPhase::Connecting {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = self
                .state
                .phase_changed
                .wait_timeout(phase, deadline - now)
                .expect("phase lock");
            phase = guard;
        }
    }

    fn force_disconnect(&self) {
        let mut link = self.link.lock().expect("link lock");
        if let Some(mut old) = link.take() {
            self.state.stop.store(true, Ordering::Relaxed);
            _ = old.client.disconnect();
            crate::utils::thread::join(&mut old.thread);
            self.state.stop.store(false, Ordering::Relaxed);
        }
        *self.state.phase.lock().expect("phase lock") = LinkPhase::Disconnected;
        self.state.connection_lost.store(true, Ordering::Relaxed);
    }

    // Publish plumbing
    // ----------------------------------------------------------------

    fn request_with_reply(&self, rest_api: &str, payload: Vec<u8>) -> Result<Response, ClientError> {
        let id = self.id();
        let publish_topic = topics::publish_topic(&id, rest_api);
        let expected = topics::expected_topic(&id, rest_api);
        let error = topics::error_topic(&expected);

        self.ensure_connected()?;

        {
            let link = self.link.lock().expect("link lock");
            let client = &link
                .as_ref()
                .ok_or_else(|| ClientError::Network("the MQTT link is down".into()))?
                .client;

            for topic in [&expected, &error] {
                client
                    .subscribe(topic.clone(), QoS::AtLeastOnce)
                    .map_err(|e| ClientError::Network(format!("subscribe failed: {e}")))?;
            }

            self.state
                .replies
                .lock()
                .expect("replies lock")
                .insert(expected.clone(), None);

            log::trace!("Publishing request on {publish_topic}");
            client
                .publish(publish_topic, QoS::AtLeastOnce, false, payload)
                .map_err(|e| ClientError::Network(format!("publish failed: {e}")))?;
        }

        match self.wait_for_reply(&expected) {
            Some(response) => Ok(response),
            None => {
                log::warn!("No reply arrived on {expected} in time, dropping the connection");
                self.force_disconnect();
                Err(ClientError::Timeout)
            }
        }
    }

    fn wait_for_reply(&self, expected: &str) -> Option<Response> {
        let deadline = Instant::now() + self.time_to_wait;
        let mut replies = self.state.replies.lock().expect("replies lock");
        loop {
            if let Some(Some(_)) = replies.get(expected) {
                return replies.remove(expected).flatten();
            }
            let now = Instant::now();
            if now >= deadline {
                replies.remove(expected);
                return None;
            }
            let (guard, _) = self
                .state
                .reply_arrived
                .wait_timeout(replies, deadline - now)
                .expect("replies lock");
            replies = guard;
        }
    }

    fn publish_fire_and_forget(&self, rest_api: &str, payload: &[u8]) -> Result<Response, ClientError> {
        self.ensure_connected()?;

        let topic = topics::publish_topic(&self.id(), rest_api);
        let link = self.link.lock().expect("link lock");
        let client = &link
            .as_ref()
            .ok_or_else(|| ClientError::Network("the MQTT link is down".into()))?
            .client;
        client
            .publish(topic, self.send_qos, false, payload.to_vec())
            .map_err(|e| {
                self.state.connection_lost.store(true, Ordering::Relaxed);
                ClientError::Network(format!("publish failed: {e}"))
            })?;

        // The broker does not answer message publishes; accepted is all
        // the caller can learn here.
        Ok(Response::new(202, Vec::new()))
    }
}

impl Transport for MqttConnection {
    fn get(&self, rest_api: &str) -> Result<Response, ClientError> {
        // GETs carry their parameters in the publish body.
        let (topic_api, body) = match rest_api.split_once("/deviceModels/") {
            Some((prefix, urn)) if prefix.is_empty() => {
                ("/deviceModels".to_owned(), json!({ "urn": urn }))
            }
            _ => (
                strip_query_owned(rest_api),
                Value::Object(query_to_object(rest_api)),
            ),
        };

        self.request_with_reply(&topic_api, body.to_string().into_bytes())
    }

    fn post(
        &self,
        rest_api: &str,
        payload: &[u8],
        _timeout: Option<Duration>,
    ) -> Result<Response, ClientError> {
        if strip_query(rest_api) == "/messages" {
            self.publish_fire_and_forget(rest_api, payload)
        } else {
            self.request_with_reply(rest_api, payload.to_vec())
        }
    }

    fn take_inbound(&self, max: usize) -> Vec<Vec<u8>> {
        MqttConnection::take_inbound(self, max)
    }

    fn refresh_credentials(&self) {
        // The broker judged the password at CONNECT time; dropping the
        // session makes the next publish reconnect with a freshly signed
        // assertion.
        self.force_disconnect();
    }

    fn is_connection_lost(&self) -> bool {
        self.state.connection_lost.load(Ordering::Relaxed)
    }

    fn close(&self) {
        self.state.stop.store(true, Ordering::Relaxed);
        let mut link = self.link.lock().expect("link lock");
        if let Some(mut old) = link.take() {
            _ = old.client.disconnect();
            crate::utils::thread::join(&mut old.thread);
        }
    }
}

fn run_event_loop(mut connection: Connection, state: Arc<SharedState>) {
    log::debug!("MQTT event loop is starting");
    for notification in connection.iter() {
        if state.stop.load(Ordering::Relaxed) {
            break;
        }
        match notification {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    log::debug!("MQTT connection is up");
                    state.connection_lost.store(false, Ordering::Relaxed);
                    set_phase(&state, LinkPhase::Connected);
                } else {
                    log::warn!("MQTT connection was refused: {:?}", ack.code);
                    set_phase(&state, LinkPhase::Refused(ack.code));
                    break;
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => route_publish(&state, publish),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                log::debug!("MQTT event loop stops after the disconnect packet");
                set_phase(&state, LinkPhase::Disconnected);
                break;
            }
            Ok(_) => {}
            Err(ConnectionError::ConnectionRefused(code)) => {
                log::warn!("MQTT connection was refused: {code:?}");
                set_phase(&state, LinkPhase::Refused(code));
                break;
            }
            Err(e) => {
                log::debug!("Error in MQTT: {e:?}");
                state.connection_lost.store(true, Ordering::Relaxed);
                set_phase(&state, LinkPhase::Disconnected);
                if state.stop.load(Ordering::Relaxed) {
                    break;
                }
                // Let the iterator attempt the reconnect at a calm pace.
                thread::sleep(Duration::from_secs(1));
                set_phase(&state, LinkPhase::Connecting);
            }
        }
    }
    log::debug!("MQTT event loop has finished");
}

fn route_publish(state: &Arc<SharedState>, publish: Publish) {
    let topic = publish.topic.clone();
    log::trace!("Received publish on {topic}");

    let inbound_topic = state.inbound_topic.lock().expect("inbound topic lock").clone();
    if topic == inbound_topic {
        let mut inbound = state.inbound.lock().expect("inbound lock");
        if inbound.bytes + publish.payload.len() > inbound.capacity {
            log::warn!(
                "Inbound request buffer is full ({} bytes), dropping a request",
                inbound.bytes
            );
            return;
        }
        inbound.bytes += publish.payload.len();
        inbound.payloads.push_back(publish.payload.to_vec());
        return;
    }

    let (key, response) = match topic.strip_suffix(topics::ERROR_SUFFIX) {
        Some(expected) => {
            let status = ErrorEnvelope::parse(&publish.payload)
                .and_then(|envelope| envelope.status)
                .unwrap_or(500);
            (expected.to_owned(), Response::new(status, publish.payload.to_vec()))
        }
        None => (topic.clone(), Response::new(200, publish.payload.to_vec())),
    };

    let mut replies = state.replies.lock().expect("replies lock");
    match replies.get_mut(&key) {
        Some(slot) => {
            *slot = Some(response);
            state.reply_arrived.notify_all();
        }
        None => log::warn!("Ignoring reply received on unexpected topic {topic:?}"),
    }
}

fn set_phase(state: &Arc<SharedState>, phase: LinkPhase) {
    *state.phase.lock().expect("phase lock") = phase;
    state.phase_changed.notify_all();
}

fn qos_from(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

fn strip_query(rest_api: &str) -> &str {
    match rest_api.split_once('?') {
        Some((path, _)) => path,
        None => rest_api,
    }
}

fn strip_query_owned(rest_api: &str) -> String {
    strip_query(rest_api).to_owned()
}

fn query_to_object(rest_api: &str) -> Map<String, Value> {
    let mut object = Map::new();
    if let Some((_, query)) = rest_api.split_once('?') {
        for pair in query.split('&') {
            match pair.split_once('=') {
                Some((key, value)) => {
                    object.insert(
                        key.to_owned(),
                        Value::String(
                            urlencoding::decode(value)
                                .map(|v| v.into_owned())
                                .unwrap_or_else(|_| value.to_owned()),
                        ),
                    );
                }
                None if !pair.is_empty() => {
                    object.insert(pair.to_owned(), Value::Bool(true));
                }
                None => {}
            }
        }
    }
    object
}
