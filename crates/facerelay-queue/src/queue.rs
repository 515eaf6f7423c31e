//! At-least-once queue abstraction.
//!
//! A received message stays invisible for a visibility timeout and is only
//! removed once acknowledged; an unacknowledged message is delivered again
//! after the timeout expires.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue storage: {0}")]
    Storage(#[from] tokio_rusqlite::Error),
    #[error("queue directory {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("queue `{queue}` rejected message: {reason}")]
    Rejected { queue: String, reason: String },
}

/// Proof of a single receive, required to acknowledge it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub message_id: i64,
    pub token: String,
}

/// A received message.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub body: String,
    pub receipt: Receipt,
    /// 1 on first delivery, incremented on every redelivery.
    pub receive_count: u32,
}

/// Write side of a channel.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Durably enqueue `body`. Returns only once the message is stored.
    async fn send(&self, body: &str) -> Result<(), QueueError>;
}

/// Consumable queue with visibility-timeout redelivery.
#[async_trait]
pub trait Queue: Sink {
    /// Up to `max` visible messages, oldest first, hidden for `visibility`.
    async fn receive(&self, max: usize, visibility: Duration) -> Result<Vec<Delivery>, QueueError>;

    /// Remove an in-flight message. `false` if the receipt is stale
    /// (message already acknowledged or redelivered under a newer receipt).
    async fn ack(&self, receipt: &Receipt) -> Result<bool, QueueError>;

    /// Messages currently stored, visible or in flight.
    async fn depth(&self) -> Result<usize, QueueError>;
}

#[async_trait]
impl<T: Sink + ?Sized> Sink for std::sync::Arc<T> {
    async fn send(&self, body: &str) -> Result<(), QueueError> {
        (**self).send(body).await
    }
}

#[async_trait]
impl<T: Queue + ?Sized> Queue for std::sync::Arc<T> {
    async fn receive(&self, max: usize, visibility: Duration) -> Result<Vec<Delivery>, QueueError> {
        (**self).receive(max, visibility).await
    }

    async fn ack(&self, receipt: &Receipt) -> Result<bool, QueueError> {
        (**self).ack(receipt).await
    }

    async fn depth(&self) -> Result<usize, QueueError> {
        (**self).depth().await
    }
}
