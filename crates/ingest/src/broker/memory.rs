use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use common::MessageId;
use uuid::Uuid;

use super::{Delivery, QueueClient};
use crate::error::TransportError;

#[derive(Debug, Clone)]
struct StoredMessage {
    id: MessageId,
    body: String,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct InMemoryQueueState {
    ready: VecDeque<StoredMessage>,
    leased: HashMap<MessageId, (Uuid, StoredMessage)>,
    completed: Vec<MessageId>,
    dead_letters: Vec<(MessageId, String, String)>,
    next_id: i64,
    closed: bool,
    close_calls: usize,
    fail_next_receives: usize,
    fail_on_complete: bool,
}

/// In-memory queue for testing.
///
/// Behaves like a peek-lock broker: received messages stay leased until they
/// are completed, abandoned or dead-lettered. Receive and complete failures
/// can be injected.
#[derive(Debug, Clone)]
pub struct InMemoryQueue {
    name: String,
    state: Arc<Mutex<InMemoryQueueState>>,
}

impl InMemoryQueue {
    /// Creates a new empty queue.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, InMemoryQueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueues a message body and returns its id.
    pub fn send(&self, body: impl Into<String>) -> MessageId {
        let mut state = self.lock();
        state.next_id += 1;
        let id = MessageId::new(state.next_id);
        state.ready.push_back(StoredMessage {
            id,
            body: body.into(),
            delivery_count: 0,
        });
        id
    }

    /// Makes the next `count` receive calls fail.
    pub fn fail_next_receives(&self, count: usize) {
        self.lock().fail_next_receives = count;
    }

    /// Makes every complete call fail.
    pub fn set_fail_on_complete(&self, fail: bool) {
        self.lock().fail_on_complete = fail;
    }

    /// Messages waiting to be received.
    pub fn ready_count(&self) -> usize {
        self.lock().ready.len()
    }

    /// Messages received but not settled yet.
    pub fn leased_count(&self) -> usize {
        self.lock().leased.len()
    }

    /// Ids of completed messages, in completion order.
    pub fn completed(&self) -> Vec<MessageId> {
        self.lock().completed.clone()
    }

    /// Dead-lettered messages as `(id, body, reason)`.
    pub fn dead_letters(&self) -> Vec<(MessageId, String, String)> {
        self.lock().dead_letters.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of times `close` was called.
    pub fn close_calls(&self) -> usize {
        self.lock().close_calls
    }

    fn take_lease(&self, delivery: &Delivery) -> Result<StoredMessage, TransportError> {
        let mut state = self.lock();
        match state.leased.remove(&delivery.message_id) {
            Some((token, message)) if token == delivery.lock_token => Ok(message),
            Some(other) => {
                state.leased.insert(delivery.message_id, other);
                Err(TransportError::LockLost(delivery.message_id))
            }
            None => Err(TransportError::LockLost(delivery.message_id)),
        }
    }
}

#[async_trait]
impl QueueClient for InMemoryQueue {
    fn queue_name(&self) -> &str {
        &self.name
    }

    async fn receive(&self) -> Result<Option<Delivery>, TransportError> {
        let mut state = self.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        if state.fail_next_receives > 0 {
            state.fail_next_receives -= 1;
            return Err(TransportError::Broker("receive failed".to_string()));
        }

        let Some(mut message) = state.ready.pop_front() else {
            return Ok(None);
        };
        message.delivery_count += 1;
        let lock_token = Uuid::new_v4();
        let delivery = Delivery {
            message_id: message.id,
            body: message.body.clone(),
            delivery_count: message.delivery_count,
            lock_token,
        };
        state.leased.insert(message.id, (lock_token, message));
        Ok(Some(delivery))
    }

    async fn complete(&self, delivery: &Delivery) -> Result<(), TransportError> {
        if self.lock().fail_on_complete {
            return Err(TransportError::Broker("complete failed".to_string()));
        }
        let message = self.take_lease(delivery)?;
        self.lock().completed.push(message.id);
        Ok(())
    }

    async fn abandon(&self, delivery: &Delivery) -> Result<(), TransportError> {
        let message = self.take_lease(delivery)?;
        self.lock().ready.push_back(message);
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), TransportError> {
        let message = self.take_lease(delivery)?;
        self.lock()
            .dead_letters
            .push((message.id, message.body, reason.to_string()));
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.close_calls += 1;
        state.closed = true;
        Ok(())
    }
}
