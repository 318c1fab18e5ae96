//! Bounded outbound priority queue.
//!
//! Capacity accounting follows the message lifetime, not queue residency:
//! a slot is reserved when `queue` accepts a message and released only
//! after delivery or terminal failure, so draining the queue into the
//! transmit worker does not free room.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::error::ClientError;
use crate::message::Message;

/// Dispatch precedence: priority first, then earlier event time, then
/// higher reliability, then submission order. `Less` dispatches first.
pub(crate) fn dispatch_order(a: &Message, b: &Message) -> Ordering {
    b.priority()
        .cmp(&a.priority())
        .then_with(|| a.event_time().cmp(&b.event_time()))
        .then_with(|| b.reliability().cmp(&a.reliability()))
        .then_with(|| a.ordinal().cmp(&b.ordinal()))
}

/// Orders a slice of messages the way the queue would dequeue them.
pub(crate) fn sort_for_dispatch(messages: &mut [Message]) {
    messages.sort_by(dispatch_order);
}

struct QueuedMessage(Message);

impl PartialEq for QueuedMessage {
    fn eq(&self, other: &Self) -> bool {
        self.0.ordinal() == other.0.ordinal()
    }
}

impl Eq for QueuedMessage {}

impl PartialOrd for QueuedMessage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedMessage {
    /// The heap pops its greatest element, so "greater" means
    /// "dispatches first".
    fn cmp(&self, other: &Self) -> Ordering {
        dispatch_order(&other.0, &self.0)
    }
}

struct QueueState {
    heap: BinaryHeap<QueuedMessage>,
    remaining: usize,
    closed: bool,
}

pub(crate) struct OutgoingQueue {
    state: Mutex<QueueState>,
    message_queued: Condvar,
    capacity: usize,
}

impl OutgoingQueue {
    pub fn new(capacity: usize) -> OutgoingQueue {
        OutgoingQueue {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                remaining: capacity,
                closed: false,
            }),
            message_queued: Condvar::new(),
            capacity,
        }
    }

    /// Accepts all messages or none, reserving their slots atomically.
    pub fn queue(&self, messages: Vec<Message>) -> Result<(), ClientError> {
        if messages.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock().expect("queue lock");
        if state.closed {
            return Err(ClientError::Other(anyhow::anyhow!(
                "the dispatcher is closed"
            )));
        }
        if state.remaining < messages.len() {
            return Err(ClientError::QueueFull {
                requested: messages.len(),
                available: state.remaining,
            });
        }
        state.remaining -= messages.len();
        for message in messages {
            state.heap.push(QueuedMessage(message));
        }
        drop(state);
        self.message_queued.notify_all();
        Ok(())
    }

    /// Puts already-reserved messages back, after a retry decision.
    pub fn requeue(&self, messages: Vec<Message>) {
        let mut state = self.state.lock().expect("queue lock");
        for message in messages {
            state.heap.push(QueuedMessage(message));
        }
        drop(state);
        self.message_queued.notify_all();
    }

    /// Blocks until at least one message is queued, the queue closes, or
    /// the timeout passes; then drains everything in dispatch order.
    pub fn drain_wait(&self, timeout: Duration) -> Vec<Message> {
        let mut state = self.state.lock().expect("queue lock");
        if state.heap.is_empty() && !state.closed {
            let (guard, _) = self
                .message_queued
                .wait_timeout(state, timeout)
                .expect("queue lock");
            state = guard;
        }

        let mut drained = Vec::with_capacity(state.heap.len());
        while let Some(QueuedMessage(message)) = state.heap.pop() {
            drained.push(message);
        }
        drained
    }

    /// Releases slots after delivery or terminal failure.
    pub fn release(&self, count: usize) {
        let mut state = self.state.lock().expect("queue lock");
        state.remaining = (state.remaining + count).min(self.capacity);
    }

    #[allow(dead_code)] // Kept so the capacity accounting stays observable
    pub fn remaining_capacity(&self) -> usize {
        self.state.lock().expect("queue lock").remaining
    }

    /// Messages currently waiting in the queue (not in-flight ones).
    pub fn len(&self) -> usize {
        self.state.lock().expect("queue lock").heap.len()
    }

    pub fn close(&self) {
        self.state.lock().expect("queue lock").closed = true;
        self.message_queued.notify_all();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::{Priority, Reliability};

    fn message(priority: Priority, event_time: i64) -> Message {
        Message::builder()
            .priority(priority)
            .event_time(event_time)
            .format("urn:test")
            .data_item("n", 1)
            .build_data()
            .unwrap()
    }

    #[test]
    fn dequeues_by_priority_then_event_time() {
        let queue = OutgoingQueue::new(10);
        queue
            .queue(vec![
                message(Priority::Low, 100),
                message(Priority::Highest, 100),
                message(Priority::Medium, 100),
                message(Priority::Highest, 50),
            ])
            .unwrap();

        let drained = queue.drain_wait(Duration::from_millis(1));
        let priorities: Vec<_> = drained.iter().map(|m| m.priority()).collect();
        assert_eq!(
            priorities,
            [
                Priority::Highest,
                Priority::Highest,
                Priority::Medium,
                Priority::Low
            ]
        );
        // Equal priority resolves by the earlier event time.
        assert_eq!(drained[0].event_time(), 50);
    }

    #[test]
    fn reliability_breaks_full_ties() {
        let queue = OutgoingQueue::new(10);
        let best_effort = Message::builder()
            .priority(Priority::Medium)
            .event_time(100)
            .reliability(Reliability::BestEffort)
            .format("urn:test")
            .build_data()
            .unwrap();
        let guaranteed = Message::builder()
            .priority(Priority::Medium)
            .event_time(100)
            .reliability(Reliability::GuaranteedDelivery)
            .format("urn:test")
            .build_data()
            .unwrap();

        queue.queue(vec![best_effort, guaranteed]).unwrap();
        let drained = queue.drain_wait(Duration::from_millis(1));
        assert_eq!(drained[0].reliability(), Reliability::GuaranteedDelivery);
    }

    #[test]
    fn same_thread_order_is_preserved() {
        let queue = OutgoingQueue::new(10);
        let first = message(Priority::Medium, 100);
        let second = message(Priority::Medium, 100);
        let first_id = first.client_id().to_owned();
        queue.queue(vec![first]).unwrap();
        queue.queue(vec![second]).unwrap();

        let drained = queue.drain_wait(Duration::from_millis(1));
        assert_eq!(drained[0].client_id(), first_id);
    }

    #[test]
    fn capacity_is_reserved_and_released() {
        let queue = OutgoingQueue::new(3);
        queue
            .queue(vec![message(Priority::Low, 1), message(Priority::Low, 2)])
            .unwrap();
        assert_eq!(queue.remaining_capacity(), 1);

        // A batch larger than the remaining room is rejected whole.
        let result = queue.queue(vec![message(Priority::Low, 3), message(Priority::Low, 4)]);
        assert!(matches!(
            result,
            Err(ClientError::QueueFull {
                requested: 2,
                available: 1
            })
        ));
        assert_eq!(queue.remaining_capacity(), 1);

        // Draining does not free slots; release does.
        let drained = queue.drain_wait(Duration::from_millis(1));
        assert_eq!(drained.len(), 2);
        assert_eq!(queue.remaining_capacity(), 1);
        queue.release(drained.len());
        assert_eq!(queue.remaining_capacity(), 3);
    }

    #[test]
    fn closed_queue_rejects_new_messages() {
        let queue = OutgoingQueue::new(3);
        queue.close();
        assert!(queue.queue(vec![message(Priority::Low, 1)]).is_err());
        // Drain returns immediately once closed.
        assert!(queue.drain_wait(Duration::from_secs(5)).is_empty());
    }
}
