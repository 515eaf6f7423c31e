//! SQLite-backed named queues.
//!
//! Several named queues share one database file so the detection and
//! recognition daemons can exchange messages through it. WAL mode lets
//! both processes read and write concurrently.

use crate::queue::{Delivery, Queue, QueueError, Receipt, Sink};
use async_trait::async_trait;
use rusqlite::{params, TransactionBehavior};
use std::path::Path;
use std::time::Duration;
use tokio_rusqlite::Connection;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    queue         TEXT    NOT NULL,
    body          TEXT    NOT NULL,
    enqueued_at   INTEGER NOT NULL,
    visible_at    INTEGER NOT NULL,
    receive_count INTEGER NOT NULL DEFAULT 0,
    receipt       TEXT
);
CREATE INDEX IF NOT EXISTS idx_messages_queue_visible ON messages(queue, visible_at, id);
"#;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// One named queue inside a SQLite database.
#[derive(Clone)]
pub struct SqliteQueue {
    conn: Connection,
    name: String,
}

impl SqliteQueue {
    /// Open (creating if needed) the database at `path` and bind to queue `name`.
    pub async fn open(path: impl AsRef<Path>, name: &str) -> Result<Self, QueueError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| QueueError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }

        let conn = Connection::open(path).await?;
        conn.call(|c| {
            c.busy_timeout(BUSY_TIMEOUT)?;
            let mode: String = c.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
            c.execute_batch(SCHEMA)?;
            Ok(mode)
        })
        .await
        .map(|mode| tracing::debug!(path = %path.display(), journal_mode = %mode, "queue database ready"))?;

        Ok(Self { conn, name: name.to_string() })
    }

    /// Private in-memory database, mainly for tests.
    pub async fn open_in_memory(name: &str) -> Result<Self, QueueError> {
        let conn = Connection::open_in_memory().await?;
        conn.call(|c| {
            c.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn, name: name.to_string() })
    }

    /// Another named queue on the same connection.
    pub fn sibling(&self, name: &str) -> Self {
        Self {
            conn: self.conn.clone(),
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Sink for SqliteQueue {
    async fn send(&self, body: &str) -> Result<(), QueueError> {
        let queue = self.name.clone();
        let body = body.to_string();
        self.conn
            .call(move |c| {
                let now = now_millis();
                c.execute(
                    "INSERT INTO messages (queue, body, enqueued_at, visible_at) VALUES (?1, ?2, ?3, ?3)",
                    params![queue, body, now],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Queue for SqliteQueue {
    async fn receive(&self, max: usize, visibility: Duration) -> Result<Vec<Delivery>, QueueError> {
        let queue = self.name.clone();
        let hide_ms = i64::try_from(visibility.as_millis()).unwrap_or(i64::MAX);
        let deliveries = self
            .conn
            .call(move |c| {
                let now = now_millis();
                let tx = c.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let candidates: Vec<(i64, String, u32)> = {
                    let mut stmt = tx.prepare(
                        "SELECT id, body, receive_count FROM messages
                         WHERE queue = ?1 AND visible_at <= ?2
                         ORDER BY id LIMIT ?3",
                    )?;
                    let rows = stmt.query_map(params![queue, now, max as i64], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                    })?;
                    rows.collect::<Result<_, _>>()?
                };

                let mut out = Vec::with_capacity(candidates.len());
                for (id, body, count) in candidates {
                    let token = uuid::Uuid::new_v4().to_string();
                    tx.execute(
                        "UPDATE messages SET visible_at = ?1, receipt = ?2, receive_count = receive_count + 1
                         WHERE id = ?3",
                        params![now.saturating_add(hide_ms), token, id],
                    )?;
                    out.push(Delivery {
                        body,
                        receipt: Receipt { message_id: id, token },
                        receive_count: count + 1,
                    });
                }
                tx.commit()?;
                Ok(out)
            })
            .await?;
        Ok(deliveries)
    }

    async fn ack(&self, receipt: &Receipt) -> Result<bool, QueueError> {
        let Receipt { message_id, token } = receipt.clone();
        let removed = self
            .conn
            .call(move |c| {
                Ok(c.execute(
                    "DELETE FROM messages WHERE id = ?1 AND receipt = ?2",
                    params![message_id, token],
                )?)
            })
            .await?;
        Ok(removed > 0)
    }

    async fn depth(&self) -> Result<usize, QueueError> {
        let queue = self.name.clone();
        let count: i64 = self
            .conn
            .call(move |c| {
                Ok(c.query_row(
                    "SELECT COUNT(*) FROM messages WHERE queue = ?1",
                    params![queue],
                    |row| row.get(0),
                )?)
            })
            .await?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HIDE: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_send_receive_ack() {
        let q = SqliteQueue::open_in_memory("work").await.unwrap();
        q.send("one").await.unwrap();
        q.send("two").await.unwrap();

        let batch = q.receive(10, HIDE).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].body, "one");
        assert_eq!(batch[1].body, "two");
        assert_eq!(batch[0].receive_count, 1);

        assert!(q.ack(&batch[0].receipt).await.unwrap());
        assert!(!q.ack(&batch[0].receipt).await.unwrap());
        assert_eq!(q.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_queues_are_isolated_by_name() {
        let work = SqliteQueue::open_in_memory("work").await.unwrap();
        let responses = work.sibling("responses");
        work.send("item").await.unwrap();
        responses.send("result").await.unwrap();

        let got = responses.receive(10, HIDE).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].body, "result");
        assert_eq!(work.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_redelivery_after_visibility_timeout() {
        let q = SqliteQueue::open_in_memory("work").await.unwrap();
        q.send("again").await.unwrap();

        let first = q.receive(1, Duration::ZERO).await.unwrap();
        let second = q.receive(1, HIDE).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].receive_count, 2);
        assert!(q.receive(1, HIDE).await.unwrap().is_empty());

        assert!(!q.ack(&first[0].receipt).await.unwrap());
        assert!(q.ack(&second[0].receipt).await.unwrap());
    }

    #[tokio::test]
    async fn test_file_database_shared_between_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/queues.db");

        let producer = SqliteQueue::open(&path, "face-requests").await.unwrap();
        producer.send("{\"request_id\":\"r1\"}").await.unwrap();

        let consumer = SqliteQueue::open(&path, "face-requests").await.unwrap();
        let batch = consumer.receive(5, HIDE).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert!(consumer.ack(&batch[0].receipt).await.unwrap());
        assert_eq!(producer.depth().await.unwrap(), 0);
    }
}
