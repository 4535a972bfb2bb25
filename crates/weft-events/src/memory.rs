//! In-process implementation of [`EventBus`] on a tokio broadcast channel.
//!
//! Late subscribers do not see earlier events. A subscriber that falls more
//! than the channel capacity behind loses the overflow and logs a warning.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use futures::StreamExt as _;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::bus::{EventBus, MessageStream, RawMessage};
use crate::error::BusError;

/// Default broadcast capacity.
const DEFAULT_CAPACITY: usize = 4096;

/// Event bus confined to one process.
#[derive(Debug)]
pub struct InMemoryBus {
    sender: Mutex<Option<broadcast::Sender<RawMessage>>>,
    fail_next: AtomicU32,
    published: AtomicU64,
}

impl InMemoryBus {
    /// A bus with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// A bus whose subscribers may lag at most `capacity` messages.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Mutex::new(Some(sender)),
            fail_next: AtomicU32::new(0),
            published: AtomicU64::new(0),
        }
    }

    /// Make the next `count` publishes fail with a transient error.
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Number of messages accepted so far.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    /// Drop the sender; every open subscription stream ends after draining.
    pub fn close(&self) {
        if let Ok(mut guard) = self.sender.lock() {
            guard.take();
        }
    }

    fn sender(&self) -> Result<broadcast::Sender<RawMessage>, BusError> {
        self.sender
            .lock()
            .map_err(|e| BusError::Unavailable(format!("sender lock poisoned: {e}")))?
            .clone()
            .ok_or(BusError::Closed)
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn publish_raw(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let tripped = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            return Err(BusError::Unavailable("injected fault".to_owned()));
        }
        let sender = self.sender()?;
        // No receivers is not an error: nobody is listening yet.
        let _ = sender.send(RawMessage {
            subject: subject.to_owned(),
            payload,
        });
        self.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, topics: &[&str]) -> Result<MessageStream, BusError> {
        let receiver = self.sender()?.subscribe();
        let topics: Vec<String> = topics.iter().map(|t| (*t).to_owned()).collect();
        let stream = futures::stream::unfold((receiver, topics), |(mut receiver, topics)| async move {
            loop {
                match receiver.recv().await {
                    Ok(message) if topics.contains(&message.subject) => {
                        return Some((message, (receiver, topics)));
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "in-memory subscriber lagged; messages dropped");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use futures::StreamExt as _;

    use super::*;

    #[tokio::test]
    async fn subscribers_only_see_their_topics() {
        let bus = InMemoryBus::new();
        let mut stream = bus.subscribe(&["a.v1"]).await.unwrap();
        bus.publish_raw("b.v1", b"skip".to_vec()).await.unwrap();
        bus.publish_raw("a.v1", b"keep".to_vec()).await.unwrap();
        let message = stream.next().await.unwrap();
        assert_eq!(message.subject, "a.v1");
        assert_eq!(message.payload, b"keep");
    }

    #[tokio::test]
    async fn close_ends_streams() {
        let bus = InMemoryBus::new();
        let mut stream = bus.subscribe(&["a.v1"]).await.unwrap();
        bus.publish_raw("a.v1", b"last".to_vec()).await.unwrap();
        bus.close();
        assert!(stream.next().await.is_some());
        assert!(stream.next().await.is_none());
        assert!(matches!(
            bus.publish_raw("a.v1", Vec::new()).await,
            Err(BusError::Closed)
        ));
    }
}
