//! In-process queue implementation.

use std::collections::VecDeque;
use std::pin::pin;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::config::QueueConfig;
use crate::error::{QueueError, QueueResult};
use crate::queue::{Delivery, MessageId, MessageQueue, QueueDepth, ReceiptHandle};

#[derive(Debug)]
struct StoredMessage<M> {
    id: MessageId,
    body: M,
    sent_at: Instant,
    visible_at: Instant,
    receive_count: u32,
    receipt: Option<ReceiptHandle>,
}

#[derive(Debug)]
struct State<M> {
    /// Send order.
    messages: VecDeque<StoredMessage<M>>,
    dead_letters: Vec<StoredMessage<M>>,
    closed: bool,
}

impl<M> Default for State<M> {
    fn default() -> Self {
        Self {
            messages: VecDeque::new(),
            dead_letters: Vec::new(),
            closed: false,
        }
    }
}

/// Queue held in process memory.
///
/// Messages are handed out in send order. Time is measured with
/// [`tokio::time::Instant`], so paused-clock tests can drive visibility
/// timeouts and retention deterministically.
#[derive(Debug)]
pub struct InMemoryQueue<M> {
    config: QueueConfig,
    state: Mutex<State<M>>,
    notify: Notify,
}

impl<M> InMemoryQueue<M>
where
    M: Clone + Send + Sync + 'static,
{
    /// Creates an empty queue.
    #[must_use]
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::default()),
            notify: Notify::new(),
        }
    }

    /// Returns the queue configuration.
    #[must_use]
    pub const fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Returns the bodies of messages moved aside after exceeding the
    /// receive limit.
    #[must_use]
    pub fn dead_letters(&self) -> Vec<M> {
        self.state
            .lock()
            .dead_letters
            .iter()
            .map(|message| message.body.clone())
            .collect()
    }

    /// Stops the queue. Pending and future calls fail with
    /// [`QueueError::Closed`].
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// Returns true once [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn purge_expired(&self, state: &mut State<M>, now: Instant) {
        let retention = self.config.retention;
        let before = state.messages.len();
        state
            .messages
            .retain(|message| now.saturating_duration_since(message.sent_at) < retention);
        let dropped = before - state.messages.len();
        if dropped > 0 {
            warn!(dropped, "dropped messages past the retention window");
        }
    }

    /// Hands out up to `max` visible messages. Returns the batch and the
    /// earliest instant a hidden message becomes visible again.
    fn take_visible(
        &self,
        state: &mut State<M>,
        max: usize,
        now: Instant,
    ) -> (Vec<Delivery<M>>, Option<Instant>) {
        self.purge_expired(state, now);

        let mut batch = Vec::new();
        let mut next_visible: Option<Instant> = None;
        let mut index = 0;
        while index < state.messages.len() {
            let message = &mut state.messages[index];
            if message.visible_at > now {
                next_visible = Some(next_visible.map_or(message.visible_at, |t| t.min(message.visible_at)));
                index += 1;
                continue;
            }
            if batch.len() == max {
                break;
            }
            if self
                .config
                .max_receive_count
                .is_some_and(|limit| message.receive_count >= limit)
            {
                if let Some(expired) = state.messages.remove(index) {
                    warn!(
                        message_id = %expired.id,
                        receive_count = expired.receive_count,
                        "message exceeded receive limit, moved to dead letters"
                    );
                    state.dead_letters.push(expired);
                }
                continue;
            }

            let receipt = ReceiptHandle::generate();
            message.receive_count += 1;
            message.visible_at = now + self.config.visibility_timeout;
            message.receipt = Some(receipt.clone());
            batch.push(Delivery {
                message_id: message.id,
                body: message.body.clone(),
                receipt,
                receive_count: message.receive_count,
            });
            index += 1;
        }
        (batch, next_visible)
    }

    fn position_of(state: &State<M>, receipt: &ReceiptHandle) -> QueueResult<usize> {
        state
            .messages
            .iter()
            .position(|message| message.receipt.as_ref() == Some(receipt))
            .ok_or_else(|| QueueError::ReceiptNotFound {
                receipt: receipt.to_string(),
            })
    }
}

#[async_trait]
impl<M> MessageQueue<M> for InMemoryQueue<M>
where
    M: Clone + Send + Sync + 'static,
{
    async fn send(&self, message: M) -> QueueResult<MessageId> {
        let id = MessageId::generate();
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(QueueError::Closed);
            }
            let now = Instant::now();
            self.purge_expired(&mut state, now);
            if let Some(capacity) = self.config.capacity {
                if state.messages.len() >= capacity {
                    return Err(QueueError::Full { capacity });
                }
            }
            state.messages.push_back(StoredMessage {
                id,
                body: message,
                sent_at: now,
                visible_at: now,
                receive_count: 0,
                receipt: None,
            });
        }
        debug!(message_id = %id, "message enqueued");
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn receive(&self, max: usize, wait: Duration) -> QueueResult<Vec<Delivery<M>>> {
        let max = max.clamp(1, self.config.max_batch.max(1));
        let deadline = Instant::now() + wait;

        loop {
            // Register interest before inspecting state so a send between
            // the check and the wait is not missed.
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();

            let now = Instant::now();
            let next_visible = {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(QueueError::Closed);
                }
                let (batch, next_visible) = self.take_visible(&mut state, max, now);
                if !batch.is_empty() {
                    return Ok(batch);
                }
                next_visible
            };

            if now >= deadline {
                return Ok(Vec::new());
            }
            let wake_at = next_visible.map_or(deadline, |t| t.min(deadline));
            tokio::select! {
                () = notified => {}
                () = sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&self, receipt: &ReceiptHandle) -> QueueResult<()> {
        let mut state = self.state.lock();
        let index = Self::position_of(&state, receipt)?;
        if let Some(message) = state.messages.remove(index) {
            debug!(message_id = %message.id, "message acknowledged");
        }
        Ok(())
    }

    async fn release(&self, receipt: &ReceiptHandle) -> QueueResult<()> {
        {
            let mut state = self.state.lock();
            let index = Self::position_of(&state, receipt)?;
            let message = &mut state.messages[index];
            message.visible_at = Instant::now();
            message.receipt = None;
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn depth(&self) -> QueueResult<QueueDepth> {
        let now = Instant::now();
        let mut state = self.state.lock();
        self.purge_expired(&mut state, now);
        let visible = state
            .messages
            .iter()
            .filter(|message| message.visible_at <= now)
            .count();
        Ok(QueueDepth {
            visible,
            in_flight: state.messages.len() - visible,
            dead_lettered: state.dead_letters.len(),
        })
    }
}
