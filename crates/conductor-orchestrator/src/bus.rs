use conductor_core::ProgressEvent;
use futures_util::Stream;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// What travels on a workflow channel.
#[derive(Debug, Clone, PartialEq)]
pub enum BusMessage {
    /// A progress update.
    Event(ProgressEvent),
    /// Terminal sentinel. Sent exactly once, when the channel closes.
    End,
}

struct Channel {
    tx: broadcast::Sender<BusMessage>,
    cancel: CancellationToken,
}

/// Per-workflow broadcast channels plus cancellation signals.
///
/// A channel exists only while its workflow has a local runner. Subscribers
/// see events published after they joined, in publish order, followed by a
/// single [`BusMessage::End`]. There is no replay; late joiners read the
/// store for the current state first.
pub struct ProgressBus {
    capacity: usize,
    channels: Mutex<HashMap<Uuid, Channel>>,
}

impl ProgressBus {
    /// A bus whose channels buffer `capacity` undelivered messages per subscriber.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Open the channel for `workflow_id` and return its cancellation token.
    ///
    /// Opening an already open channel returns the existing token.
    pub fn open(&self, workflow_id: Uuid) -> CancellationToken {
        let mut channels = self.channels.lock();
        let channel = channels.entry(workflow_id).or_insert_with(|| {
            let (tx, _) = broadcast::channel(self.capacity);
            Channel {
                tx,
                cancel: CancellationToken::new(),
            }
        });
        channel.cancel.clone()
    }

    /// Publish an event to every current subscriber.
    ///
    /// Events for closed channels and events nobody is listening to are dropped.
    pub fn publish(&self, event: ProgressEvent) {
        let channels = self.channels.lock();
        if let Some(channel) = channels.get(&event.workflow_id) {
            // Err only means there are no receivers right now.
            let _ = channel.tx.send(BusMessage::Event(event));
        }
    }

    /// Attach a new subscriber. `None` when the workflow has no open channel.
    pub fn subscribe(&self, workflow_id: Uuid) -> Option<ProgressSubscription> {
        let channels = self.channels.lock();
        channels.get(&workflow_id).map(|channel| ProgressSubscription {
            workflow_id,
            rx: channel.tx.subscribe(),
            finished: false,
        })
    }

    /// The cancellation token of an open channel.
    pub fn cancel_token(&self, workflow_id: Uuid) -> Option<CancellationToken> {
        self.channels
            .lock()
            .get(&workflow_id)
            .map(|channel| channel.cancel.clone())
    }

    /// Signal cancellation. Returns `false` when no channel is open.
    pub fn cancel(&self, workflow_id: Uuid) -> bool {
        match self.cancel_token(workflow_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether a channel is open for `workflow_id`.
    pub fn is_active(&self, workflow_id: Uuid) -> bool {
        self.channels.lock().contains_key(&workflow_id)
    }

    /// Send the terminal sentinel and drop the channel.
    ///
    /// Only the first call for an open channel sends anything, so the
    /// sentinel goes out exactly once however many paths race to close.
    pub fn close(&self, workflow_id: Uuid) {
        let removed = self.channels.lock().remove(&workflow_id);
        if let Some(channel) = removed {
            let _ = channel.tx.send(BusMessage::End);
            debug!(workflow_id = %workflow_id, "progress channel closed");
        }
    }
}

/// One consumer of a workflow's progress stream.
pub struct ProgressSubscription {
    workflow_id: Uuid,
    rx: broadcast::Receiver<BusMessage>,
    finished: bool,
}

impl ProgressSubscription {
    /// The workflow this subscription follows.
    pub fn workflow_id(&self) -> Uuid {
        self.workflow_id
    }

    /// The next event, or `None` once the sentinel has been received.
    ///
    /// A subscriber that falls behind skips the overwritten events and
    /// carries on from the oldest one still buffered.
    pub async fn next(&mut self) -> Option<ProgressEvent> {
        if self.finished {
            return None;
        }
        loop {
            match self.rx.recv().await {
                Ok(BusMessage::Event(event)) => return Some(event),
                Ok(BusMessage::End) | Err(broadcast::error::RecvError::Closed) => {
                    self.finished = true;
                    return None;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(workflow_id = %self.workflow_id, skipped = n, "progress subscriber lagged");
                }
            }
        }
    }

    /// Consume the subscription as an async stream ending at the sentinel.
    pub fn into_stream(self) -> impl Stream<Item = ProgressEvent> + Send {
        let workflow_id = self.workflow_id;
        let finished = self.finished;
        BroadcastStream::new(self.rx)
            .take_while(move |_| !finished)
            .filter_map(move |msg| match msg {
                Ok(msg) => Some(msg),
                Err(BroadcastStreamRecvError::Lagged(n)) => {
                    warn!(workflow_id = %workflow_id, skipped = n, "progress subscriber lagged");
                    None
                }
            })
            .take_while(|msg| matches!(msg, BusMessage::Event(_)))
            .filter_map(|msg| match msg {
                BusMessage::Event(event) => Some(event),
                BusMessage::End => None,
            })
    }
}
