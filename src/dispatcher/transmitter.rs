//! Transmit worker: drains the queue, respects storage gating and
//! backoff, posts chunks and settles delivery or failure per message.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::ClientError;
use crate::message::{Message, MessageType, Reliability};
use crate::transport::Transport;

use super::queue::sort_for_dispatch;
use super::DispatcherCore;

const FIB: [u64; 13] = [0, 1, 1, 2, 3, 5, 8, 13, 21, 34, 55, 89, 144];
const MAX_BACKOFF_ATTEMPT: usize = 12;
/// Idle wait between queue checks when nothing is pending.
const IDLE_WAIT: Duration = Duration::from_millis(500);

#[derive(Default)]
struct Backoff {
    attempt: usize,
    until: Option<Instant>,
}

impl Backoff {
    fn active(&self) -> bool {
        self.until.map(|u| Instant::now() < u).unwrap_or(false)
    }

    fn remaining(&self) -> Duration {
        self.until
            .map(|u| u.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }

    fn clear(&mut self) {
        self.attempt = 0;
        self.until = None;
    }

    /// Exponential step for rate limiting; one bump per transmit
    /// iteration no matter how many chunks hit it.
    fn bump_exponential(&mut self, base: Duration, already_bumped: bool) {
        if !already_bumped {
            self.attempt = (self.attempt + 1).min(MAX_BACKOFF_ATTEMPT);
        }
        self.until = Some(Instant::now() + base * FIB[self.attempt] as u32);
    }

    /// Constant step for connectivity trouble.
    fn bump_constant(&mut self, base: Duration) {
        self.attempt = 1;
        self.until = Some(Instant::now() + base);
    }
}

/// How a failed post should be treated.
enum SendFailure {
    RateLimited,
    /// The server rejected the credentials. Handled outside the message
    /// retry budget: refresh, retry once, then surface.
    Credential(ClientError),
    Transient(ClientError),
    Protocol(ClientError),
    Fatal(ClientError),
}

pub(super) fn spawn(core: Arc<DispatcherCore>) -> JoinHandle<()> {
    thread::Builder::new()
        .name("Message dispatcher transmitter".into())
        .spawn(move || {
            log::debug!("Transmitter is starting");
            run(core);
            log::debug!("Transmitter has finished");
        })
        .expect("Unable to spawn thread")
}

fn run(core: Arc<DispatcherCore>) {
    let mut pending: Vec<Message> = Vec::new();
    let mut backoff = Backoff::default();
    // One automatic retry per credential incident, cleared by the next
    // successful send; the message retry budget is not touched for it.
    let mut credential_retried = false;

    loop {
        if core.closing() && pending.is_empty() && core.queue.len() == 0 {
            break;
        }

        let wait = if core.closing() {
            Duration::ZERO
        } else if backoff.until.is_some() {
            backoff.remaining()
        } else if pending.is_empty() {
            IDLE_WAIT
        } else {
            Duration::ZERO
        };

        let drained = core.queue.drain_wait(wait);
        let new_alert = drained.iter().any(|m| m.kind() == MessageType::Alert);
        pending.extend(drained);
        sort_for_dispatch(&mut pending);

        if pending.is_empty() {
            continue;
        }

        // Pull the prefix that is not gated by an in-flight upload.
        let (message_list, error_list, gated) = filter_sendable(&core, std::mem::take(&mut pending));
        pending = gated;

        if !error_list.is_empty() {
            settle_terminal(
                &core,
                error_list,
                &ClientError::Other(anyhow::anyhow!("the storage object upload failed")),
            );
        }

        if message_list.is_empty() {
            continue;
        }

        // An alert punches through backoff; anything else waits it out.
        if backoff.active() && !new_alert && !core.closing() {
            pending.extend(message_list);
            sort_for_dispatch(&mut pending);
            continue;
        }

        let chunk_size = if backoff.attempt > 0 {
            let grown = (FIB[backoff.attempt] as usize).saturating_mul(10).max(1);
            grown.min(core.config.dispatcher_max_messages_per_connection)
        } else {
            core.config.dispatcher_max_messages_per_connection
        };

        send_all(
            &core,
            message_list,
            chunk_size,
            &mut backoff,
            &mut pending,
            &mut credential_retried,
        );
    }

    // Whatever could not be drained is surfaced, not silently dropped.
    if !pending.is_empty() {
        log::warn!(
            "{} messages were still unsent when the dispatcher closed",
            pending.len()
        );
        settle_terminal(
            &core,
            pending,
            &ClientError::Other(anyhow::anyhow!("the dispatcher closed before delivery")),
        );
    }
}

/// Walks the ordered pending list: failed-upload messages go to the error
/// list, the walk stops at the first message still waiting for an upload.
fn filter_sendable(
    core: &DispatcherCore,
    pending: Vec<Message>,
) -> (Vec<Message>, Vec<Message>, Vec<Message>) {
    let mut message_list = Vec::with_capacity(pending.len());
    let mut error_list = Vec::new();
    let mut gated = Vec::new();

    let mut iter = pending.into_iter();
    while let Some(message) = iter.next() {
        if core.content.take_failed(message.client_id()) {
            error_list.push(message);
            continue;
        }
        if core.content.is_gated(message.client_id()) {
            gated.push(message);
            gated.extend(iter);
            break;
        }
        message_list.push(message);
    }

    (message_list, error_list, gated)
}

fn send_all(
    core: &DispatcherCore,
    mut message_list: Vec<Message>,
    chunk_size: usize,
    backoff: &mut Backoff,
    pending: &mut Vec<Message>,
    credential_retried: &mut bool,
) {
    let mut bumped_exponential = false;

    while !message_list.is_empty() {
        let take = chunk_size.min(message_list.len());
        let batch: Vec<Message> = message_list.drain(..take).collect();

        match send_batch(core, &batch) {
            Ok(bytes_sent) => {
                backoff.clear();
                *credential_retried = false;
                settle_delivered(core, batch, bytes_sent);
            }
            Err(failure) => {
                let unsent: Vec<Message> = batch.into_iter().chain(message_list.drain(..)).collect();
                match failure {
                    SendFailure::RateLimited => {
                        core.counters
                            .protocol_errors
                            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        backoff.bump_exponential(
                            core.config.message_dispatcher_backoff,
                            bumped_exponential,
                        );
                        bumped_exponential = true;
                        requeue_for_retry(core, unsent, pending);
                    }
                    SendFailure::Credential(cause) => {
                        if *credential_retried {
                            log::error!(
                                "Send was rejected again after refreshing credentials: {cause}"
                            );
                            settle_terminal(core, unsent, &cause);
                        } else {
                            log::warn!(
                                "Send was rejected with stale credentials, reconnecting and \
                                retrying once: {cause}"
                            );
                            *credential_retried = true;
                            core.connection.refresh_credentials();
                            pending.extend(unsent);
                            sort_for_dispatch(pending);
                        }
                    }
                    SendFailure::Transient(cause) => {
                        log::debug!("Send failed with transient error: {cause}");
                        backoff.bump_constant(core.config.message_dispatcher_backoff);
                        requeue_for_retry(core, unsent, pending);
                    }
                    SendFailure::Protocol(cause) => {
                        core.counters
                            .protocol_errors
                            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        log::warn!("Send failed with protocol error: {cause}");
                        settle_terminal(core, unsent, &cause);
                    }
                    SendFailure::Fatal(cause) => {
                        log::error!("Send failed with security error: {cause}");
                        settle_terminal(core, unsent, &cause);
                    }
                }
                return;
            }
        }
    }
}

fn send_batch(core: &DispatcherCore, batch: &[Message]) -> Result<usize, SendFailure> {
    let body = Message::batch_to_wire_json(batch)
        .map_err(|e| SendFailure::Protocol(ClientError::Other(anyhow::anyhow!(e))))?;

    let rest_api = format!("/messages?acceptBytes={}", core.config.request_buffer_size);
    log::trace!("Posting {} messages", batch.len());

    let response = core
        .connection
        .post(&rest_api, &body, None)
        .map_err(|e| match e {
            ClientError::Network(_) | ClientError::Timeout => SendFailure::Transient(e),
            ClientError::Security(_) => SendFailure::Fatal(e),
            other => SendFailure::Protocol(other),
        })?;

    if response.is_success() {
        return Ok(body.len());
    }
    match response.status {
        503 => Err(SendFailure::RateLimited),
        status if status >= 500 => Err(SendFailure::Transient(response.into_error())),
        401 | 403 => Err(SendFailure::Credential(response.into_error())),
        _ => Err(SendFailure::Protocol(response.into_error())),
    }
}

fn settle_delivered(core: &DispatcherCore, batch: Vec<Message>, bytes_sent: usize) {
    use std::sync::atomic::Ordering;

    core.counters
        .sent
        .fetch_add(batch.len() as u64, Ordering::Relaxed);
    core.counters
        .bytes_sent
        .fetch_add(bytes_sent as u64, Ordering::Relaxed);
    core.queue.release(batch.len());

    if let Some(persistence) = &core.persistence {
        let delivered_guaranteed: Vec<String> = batch
            .iter()
            .filter(|m| m.reliability() == Reliability::GuaranteedDelivery)
            .map(|m| m.client_id().to_owned())
            .collect();
        if !delivered_guaranteed.is_empty() {
            if let Err(e) = persistence.delete(&delivered_guaranteed) {
                log::warn!("Unable to delete acknowledged persisted messages: {e:?}");
            }
        }
    }

    core.callbacks.notify_delivered(&batch);
    core.send_signal.notify_sent();
}

/// Burns one retry per message; exhausted messages fail terminally, the
/// rest go back to the pending list (guaranteed-delivery ones persisted
/// first).
fn requeue_for_retry(core: &DispatcherCore, unsent: Vec<Message>, pending: &mut Vec<Message>) {
    use std::sync::atomic::Ordering;

    let mut exhausted = Vec::new();
    for mut message in unsent {
        if message.consume_retry() {
            core.counters.retried.fetch_add(1, Ordering::Relaxed);
            if message.reliability() == Reliability::GuaranteedDelivery {
                if let Some(persistence) = &core.persistence {
                    if let Err(e) = persistence.save(&core.endpoint_id, &message) {
                        log::warn!("Unable to persist a message before retry: {e:?}");
                    }
                }
            }
            pending.push(message);
        } else {
            exhausted.push(message);
        }
    }
    sort_for_dispatch(pending);

    if !exhausted.is_empty() {
        log::warn!("{} messages ran out of retries", exhausted.len());
        settle_terminal(
            core,
            exhausted,
            &ClientError::Other(anyhow::anyhow!("the retry budget is exhausted")),
        );
    }
}

/// Exactly one error notification per failed message.
fn settle_terminal(core: &DispatcherCore, messages: Vec<Message>, cause: &ClientError) {
    if messages.is_empty() {
        return;
    }
    core.queue.release(messages.len());
    if let Some(persistence) = &core.persistence {
        let ids: Vec<String> = messages
            .iter()
            .filter(|m| m.reliability() == Reliability::GuaranteedDelivery)
            .map(|m| m.client_id().to_owned())
            .collect();
        if !ids.is_empty() {
            if let Err(e) = persistence.delete(&ids) {
                log::warn!("Unable to drop persisted copies of failed messages: {e:?}");
            }
        }
    }
    core.callbacks.notify_failed(&messages, cause);
}
