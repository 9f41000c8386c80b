use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cd_common::model::EventRecord;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 256;

/// A live subscriber registered for a single resource (spec §4.5). Each
/// subscriber owns a bounded in-memory queue; a full queue times out rather
/// than blocking the producer.
pub struct Subscriber {
    pub id: Uuid,
    pub(crate) sender: mpsc::Sender<EventRecord>,
    pub(crate) dropped: Arc<AtomicU64>,
}

impl Subscriber {
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// The receiving half handed back to the caller (e.g. an SSE handler).
pub struct SubscriberHandle {
    pub id: Uuid,
    pub receiver: mpsc::Receiver<EventRecord>,
    pub dropped: Arc<AtomicU64>,
}

impl SubscriberHandle {
    pub fn into_stream(self) -> ReceiverStream<EventRecord> {
        ReceiverStream::new(self.receiver)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub(crate) fn new_subscriber_pair() -> (Subscriber, SubscriberHandle) {
    let (sender, receiver) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
    let id = Uuid::new_v4();
    let dropped = Arc::new(AtomicU64::new(0));
    (
        Subscriber {
            id,
            sender,
            dropped: dropped.clone(),
        },
        SubscriberHandle {
            id,
            receiver,
            dropped,
        },
    )
}
