//! Broadcast bus for engine events.
//!
//! Delivery is fire-and-forget over a tokio broadcast channel: publishing
//! never blocks and never fails, and subscribers that fall behind lose the
//! oldest events. A bounded history lets an observer that attaches late
//! catch up on what a task has already published.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use uuid::Uuid;

use crate::types::{Event, EventEnvelope};

const CHANNEL_CAPACITY: usize = 1024;
const HISTORY_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
    history: Arc<Mutex<History>>,
}

struct History {
    limit: usize,
    published: usize,
    recent: VecDeque<EventEnvelope>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY, HISTORY_CAPACITY)
    }

    /// `channel` bounds how far a subscriber may lag; `history` bounds the
    /// replay buffer (zero disables replay).
    pub fn with_capacity(channel: usize, history: usize) -> Self {
        let (sender, _) = broadcast::channel(channel.max(1));
        Self {
            sender,
            history: Arc::new(Mutex::new(History {
                limit: history,
                published: 0,
                recent: VecDeque::with_capacity(history.min(HISTORY_CAPACITY)),
            })),
        }
    }

    /// Wrap and publish an event. Returns how many live subscribers got it.
    pub fn emit(&self, event: Event) -> usize {
        self.publish(EventEnvelope::new(event))
    }

    pub fn publish(&self, envelope: EventEnvelope) -> usize {
        if let Ok(mut history) = self.history.lock() {
            history.published += 1;
            if history.limit > 0 {
                if history.recent.len() == history.limit {
                    history.recent.pop_front();
                }
                history.recent.push_back(envelope.clone());
            }
        }
        self.sender.send(envelope).unwrap_or(0)
    }

    /// Live events from now on. Earlier events are only available through
    /// [`EventBus::replay`].
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    /// Live events as a stream; events lost to lagging are skipped.
    pub fn stream(&self) -> impl Stream<Item = EventEnvelope> + Send + 'static {
        BroadcastStream::new(self.sender.subscribe()).filter_map(|item| item.ok())
    }

    pub fn task_stream(&self, task_id: Uuid) -> impl Stream<Item = EventEnvelope> + Send + 'static {
        self.stream()
            .filter(move |envelope| envelope.event.task_id() == Some(task_id))
    }

    /// Buffered events of one task, oldest first.
    pub fn replay(&self, task_id: Uuid) -> Vec<EventEnvelope> {
        self.history
            .lock()
            .map(|history| {
                history
                    .recent
                    .iter()
                    .filter(|envelope| envelope.event.task_id() == Some(task_id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Total events published since the bus was created.
    pub fn event_count(&self) -> usize {
        self.history.lock().map(|h| h.published).unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .field("published", &self.event_count())
            .finish()
    }
}
