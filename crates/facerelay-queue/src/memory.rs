//! In-process queue with the same delivery semantics as the SQLite queue.

use crate::queue::{Delivery, Queue, QueueError, Receipt, Sink};
use async_trait::async_trait;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

struct Stored {
    id: i64,
    body: String,
    visible_at: Instant,
    receive_count: u32,
    token: Option<String>,
}

#[derive(Default)]
struct Inner {
    next_id: i64,
    messages: Vec<Stored>,
    fail_sends: usize,
}

/// Named in-memory queue.
pub struct MemoryQueue {
    name: String,
    inner: Mutex<Inner>,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reject the next `count` sends with [`QueueError::Rejected`].
    pub fn inject_send_failures(&self, count: usize) {
        self.lock().fail_sends = count;
    }

    /// Bodies of all stored messages in enqueue order, visible or not.
    pub fn bodies(&self) -> Vec<String> {
        self.lock().messages.iter().map(|m| m.body.clone()).collect()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Sink for MemoryQueue {
    async fn send(&self, body: &str) -> Result<(), QueueError> {
        let mut inner = self.lock();
        if inner.fail_sends > 0 {
            inner.fail_sends -= 1;
            return Err(QueueError::Rejected {
                queue: self.name.clone(),
                reason: "injected failure".into(),
            });
        }
        inner.next_id += 1;
        let id = inner.next_id;
        inner.messages.push(Stored {
            id,
            body: body.to_string(),
            visible_at: Instant::now(),
            receive_count: 0,
            token: None,
        });
        Ok(())
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn receive(&self, max: usize, visibility: Duration) -> Result<Vec<Delivery>, QueueError> {
        let now = Instant::now();
        let mut inner = self.lock();
        let deliveries = inner
            .messages
            .iter_mut()
            .filter(|m| m.visible_at <= now)
            .take(max)
            .map(|m| {
                let token = uuid::Uuid::new_v4().to_string();
                m.visible_at = now + visibility;
                m.receive_count += 1;
                m.token = Some(token.clone());
                Delivery {
                    body: m.body.clone(),
                    receipt: Receipt { message_id: m.id, token },
                    receive_count: m.receive_count,
                }
            })
            .collect();
        Ok(deliveries)
    }

    async fn ack(&self, receipt: &Receipt) -> Result<bool, QueueError> {
        let mut inner = self.lock();
        let before = inner.messages.len();
        inner
            .messages
            .retain(|m| !(m.id == receipt.message_id && m.token.as_deref() == Some(receipt.token.as_str())));
        Ok(inner.messages.len() < before)
    }

    async fn depth(&self) -> Result<usize, QueueError> {
        Ok(self.lock().messages.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HIDE: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_fifo_receive_and_ack() {
        let q = MemoryQueue::new("work");
        q.send("a").await.unwrap();
        q.send("b").await.unwrap();
        q.send("c").await.unwrap();

        let batch = q.receive(2, HIDE).await.unwrap();
        let bodies: Vec<&str> = batch.iter().map(|d| d.body.as_str()).collect();
        assert_eq!(bodies, vec!["a", "b"]);
        assert!(batch.iter().all(|d| d.receive_count == 1));

        assert!(q.ack(&batch[0].receipt).await.unwrap());
        assert_eq!(q.depth().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_in_flight_messages_are_hidden() {
        let q = MemoryQueue::new("work");
        q.send("a").await.unwrap();
        assert_eq!(q.receive(10, HIDE).await.unwrap().len(), 1);
        assert!(q.receive(10, HIDE).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unacked_message_is_redelivered() {
        let q = MemoryQueue::new("work");
        q.send("a").await.unwrap();
        let first = q.receive(1, Duration::ZERO).await.unwrap();
        let second = q.receive(1, HIDE).await.unwrap();
        assert_eq!(second[0].body, "a");
        assert_eq!(second[0].receive_count, 2);

        // The first receipt is stale once the message was redelivered.
        assert!(!q.ack(&first[0].receipt).await.unwrap());
        assert!(q.ack(&second[0].receipt).await.unwrap());
        assert_eq!(q.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_injected_send_failures() {
        let q = MemoryQueue::new("responses");
        q.inject_send_failures(1);
        assert!(matches!(q.send("a").await, Err(QueueError::Rejected { .. })));
        q.send("b").await.unwrap();
        assert_eq!(q.bodies(), vec!["b".to_string()]);
    }
}
