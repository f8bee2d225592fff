//! Durable work queue with visibility-timeout semantics.
//!
//! Two named queues (`repo_analysis` and `webhook_events`) share one
//! table. A read pops at most one message in FIFO order and hides it
//! from other consumers until the visibility timeout elapses; deletion
//! is an explicit, idempotent acknowledgement. Every delivery
//! increments `read_ct`, which consumers inspect to bound retries.
//! Delivery is at-least-once; consumers must tolerate duplicates.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

pub const QUEUE_REPO_ANALYSIS: &str = "repo_analysis";
pub const QUEUE_WEBHOOK_EVENTS: &str = "webhook_events";

/// Visibility timeout for analysis jobs.
pub const ANALYSIS_VISIBILITY: Duration = Duration::from_secs(60);
/// Visibility timeout for webhook review jobs.
pub const REVIEW_VISIBILITY: Duration = Duration::from_secs(300);

/// Deliveries after which the scheduler gives up on a message.
pub const MAX_READ_COUNT: i64 = 3;

/// A leased message. The lease expires after the visibility timeout
/// unless the consumer deletes the message first.
#[derive(Debug, Clone)]
pub struct QueueMessage<T> {
    pub msg_id: String,
    /// Number of times the message has been delivered, this delivery
    /// included.
    pub read_ct: i64,
    pub enqueued_at: DateTime<Utc>,
    pub body: T,
}

#[derive(Clone)]
pub struct Queue {
    conn: Arc<Mutex<Connection>>,
}

impl Queue {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("Failed to open queue database at {:?}", path.as_ref()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory queue database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 5000;

            CREATE TABLE IF NOT EXISTS queue_messages (
                msg_id TEXT PRIMARY KEY,
                queue TEXT NOT NULL,
                read_ct INTEGER NOT NULL DEFAULT 0,
                enqueued_at INTEGER NOT NULL,
                visible_at INTEGER NOT NULL,
                body TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_queue_pop
                ON queue_messages(queue, visible_at, enqueued_at);
            "#,
        )
        .context("Failed to initialize queue schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("queue mutex poisoned");
            f(&conn)
        })
        .await
        .context("queue task panicked")?
    }

    /// Enqueue a message. Never blocks on consumers; a backend error
    /// surfaces synchronously to the producer.
    pub async fn enqueue<T: Serialize>(&self, queue: &str, body: &T) -> Result<String> {
        let queue = queue.to_string();
        let msg_id = Uuid::new_v4().to_string();
        let body = serde_json::to_string(body).context("Failed to serialize queue message")?;
        let now = Utc::now().timestamp_millis();

        let id = msg_id.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO queue_messages (msg_id, queue, read_ct, enqueued_at, visible_at, body)
                 VALUES (?1, ?2, 0, ?3, ?3, ?4)",
                params![id, queue, now, body],
            )
            .context("queue unavailable")?;
            Ok(())
        })
        .await?;
        Ok(msg_id)
    }

    /// Pop at most one visible message, hiding it for
    /// `visibility_timeout`. Returns `None` immediately when the queue
    /// is empty. The returned `read_ct` includes this delivery.
    pub async fn read<T: DeserializeOwned + Send + 'static>(
        &self,
        queue: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<QueueMessage<T>>> {
        let queue = queue.to_string();
        let now = Utc::now().timestamp_millis();
        let hidden_until = now + visibility_timeout.as_millis() as i64;

        self.with_conn(move |conn| {
            // Single-writer SQLite keeps pop-and-lease atomic within
            // the transaction: no other consumer can pop the same row.
            let tx = conn.unchecked_transaction().context("queue unavailable")?;

            let row = tx
                .query_row(
                    "SELECT msg_id, read_ct, enqueued_at, body FROM queue_messages
                     WHERE queue = ?1 AND visible_at <= ?2
                     ORDER BY enqueued_at, rowid LIMIT 1",
                    params![queue, now],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    },
                )
                .optional()
                .context("queue unavailable")?;

            let Some((msg_id, read_ct, enqueued_at, body)) = row else {
                return Ok(None);
            };

            tx.execute(
                "UPDATE queue_messages SET visible_at = ?2, read_ct = read_ct + 1
                 WHERE msg_id = ?1",
                params![msg_id, hidden_until],
            )
            .context("queue unavailable")?;
            tx.commit().context("queue unavailable")?;

            let body: T = serde_json::from_str(&body)
                .context("Failed to deserialize queue message body")?;
            Ok(Some(QueueMessage {
                msg_id,
                read_ct: read_ct + 1,
                enqueued_at: Utc
                    .timestamp_millis_opt(enqueued_at)
                    .single()
                    .unwrap_or_else(Utc::now),
                body,
            }))
        })
        .await
    }

    /// Acknowledge a message. Deleting an already-deleted message is a
    /// no-op.
    pub async fn delete(&self, queue: &str, msg_id: &str) -> Result<()> {
        let queue = queue.to_string();
        let msg_id = msg_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM queue_messages WHERE queue = ?1 AND msg_id = ?2",
                params![queue, msg_id],
            )
            .context("queue unavailable")?;
            Ok(())
        })
        .await
    }

    /// Number of messages in a queue, visible or not. For tests and
    /// operator introspection.
    pub async fn len(&self, queue: &str) -> Result<u64> {
        let queue = queue.to_string();
        self.with_conn(move |conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM queue_messages WHERE queue = ?1",
                    params![queue],
                    |row| row.get(0),
                )
                .context("queue unavailable")?;
            Ok(count as u64)
        })
        .await
    }

    pub async fn is_empty(&self, queue: &str) -> Result<bool> {
        Ok(self.len(queue).await? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Job {
        n: u32,
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = Queue::open_in_memory().unwrap();
        for n in 1..=3 {
            queue.enqueue("q", &Job { n }).await.unwrap();
        }

        for expected in 1..=3 {
            let msg = queue
                .read::<Job>("q", Duration::from_secs(60))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(msg.body.n, expected);
            queue.delete("q", &msg.msg_id).await.unwrap();
        }
        assert!(queue.is_empty("q").await.unwrap());
    }

    #[tokio::test]
    async fn test_read_hides_message_until_timeout() {
        let queue = Queue::open_in_memory().unwrap();
        queue.enqueue("q", &Job { n: 1 }).await.unwrap();

        let first = queue
            .read::<Job>("q", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(first.is_some());

        // Leased: a second read sees nothing.
        let second = queue
            .read::<Job>("q", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_redelivery_increments_read_ct() {
        let queue = Queue::open_in_memory().unwrap();
        queue.enqueue("q", &Job { n: 1 }).await.unwrap();

        let first = queue
            .read::<Job>("q", Duration::from_millis(0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.read_ct, 1);

        // Zero visibility: immediately redeliverable.
        let second = queue
            .read::<Job>("q", Duration::from_millis(0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.read_ct, 2);
        assert_eq!(second.msg_id, first.msg_id);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let queue = Queue::open_in_memory().unwrap();
        let id = queue.enqueue("q", &Job { n: 1 }).await.unwrap();

        queue.delete("q", &id).await.unwrap();
        queue.delete("q", &id).await.unwrap();
        assert!(queue.is_empty("q").await.unwrap());
    }

    #[tokio::test]
    async fn test_read_empty_queue_returns_none() {
        let queue = Queue::open_in_memory().unwrap();
        let msg = queue
            .read::<Job>("missing", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(msg.is_none());
    }

    #[tokio::test]
    async fn test_queues_are_isolated() {
        let queue = Queue::open_in_memory().unwrap();
        queue.enqueue(QUEUE_REPO_ANALYSIS, &Job { n: 1 }).await.unwrap();

        let msg = queue
            .read::<Job>(QUEUE_WEBHOOK_EVENTS, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(msg.is_none());
        assert_eq!(queue.len(QUEUE_REPO_ANALYSIS).await.unwrap(), 1);
    }
}
