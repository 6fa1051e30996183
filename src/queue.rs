//! Leased job queue built on Redis Streams.
//!
//! Queues are stream keys read through a consumer group. A delivered entry
//! sits in the group's pending list until it is acknowledged; an entry that
//! has been idle there for longer than the visibility timeout is treated as
//! an expired lease and may be claimed by any consumer. This gives the same
//! receive / delete / send contract as a hosted queue with visibility
//! timeouts, and it is the only mutual exclusion between workers.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use redis::streams::{StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadReply};
use tracing::{debug, info, warn};

use crate::error::{QueueError, QueueResult};

/// Stream entry field that carries the message body.
const BODY_FIELD: &str = "body";

/// Acknowledges and deletes an entry only while it is still pending for this
/// consumer at the expected delivery count.
///
/// KEYS[1] = stream, ARGV = group, entry id, consumer, delivery count.
const DELETE_OWNED: &str = r#"
local pending = redis.call('XPENDING', KEYS[1], ARGV[1], ARGV[2], ARGV[2], 1, ARGV[3])
if #pending == 0 or tonumber(pending[1][4]) ~= tonumber(ARGV[4]) then
    return 0
end
redis.call('XACK', KEYS[1], ARGV[1], ARGV[2])
redis.call('XDEL', KEYS[1], ARGV[2])
return 1
"#;

/// Token tied to one delivery of a message. Only meaningful for deletion.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryHandle {
    /// Queue-assigned message id.
    pub id: String,
    /// The delivery this handle was issued for. A later redelivery of the
    /// same message makes it stale.
    pub delivery: u32,
}

impl DeliveryHandle {
    pub fn new(id: impl Into<String>, delivery: u32) -> Self {
        Self {
            id: id.into(),
            delivery,
        }
    }
}

impl fmt::Display for DeliveryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.id, self.delivery)
    }
}

/// One delivery of a queue message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub body: String,
    pub handle: DeliveryHandle,
    /// How many times this message has been handed to a consumer,
    /// including this delivery.
    pub receive_count: u32,
}

/// Receive, delete and send against named queues.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Receives at most one message and hides it from other consumers for
    /// `visibility_timeout`. Returns `Ok(None)` when the queue is empty.
    async fn receive_one(
        &self,
        queue: &str,
        visibility_timeout: Duration,
    ) -> QueueResult<Option<QueueMessage>>;

    /// Permanently removes a delivered message.
    ///
    /// Fails with [`QueueError::LeaseLost`] when `handle` is no longer the
    /// current delivery: the lease expired and the message was handed out
    /// again, or it is already gone.
    async fn delete(&self, queue: &str, handle: &DeliveryHandle) -> QueueResult<()>;

    /// Enqueues a new message.
    async fn send(&self, queue: &str, body: &str) -> QueueResult<()>;
}

/// Redis Streams implementation of [`QueueClient`].
pub struct RedisStreamQueue {
    conn: ConnectionManager,
    group: String,
    consumer: String,
    receive_wait: Duration,
}

impl RedisStreamQueue {
    /// Creates a queue client reading as `consumer` within `group`.
    ///
    /// `receive_wait` bounds how long a receive blocks on an empty stream.
    pub fn new(
        conn: ConnectionManager,
        group: impl Into<String>,
        consumer: impl Into<String>,
        receive_wait: Duration,
    ) -> Self {
        Self {
            conn,
            group: group.into(),
            consumer: consumer.into(),
            receive_wait,
        }
    }

    /// Creates the consumer group for `queue` if it does not exist yet.
    ///
    /// Called once at startup; failure here means the queue is unreachable.
    pub async fn ensure_group(&self, queue: &str) -> QueueResult<()> {
        let mut conn = self.conn.clone();

        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(queue)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => info!("Created consumer group {} on {}", self.group, queue),
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!("Consumer group {} already exists on {}", self.group, queue);
            }
            Err(e) => return Err(QueueError::Redis(e)),
        }

        Ok(())
    }

    /// Claims one entry whose lease has expired, if any.
    async fn claim_expired(
        &self,
        queue: &str,
        visibility_timeout: Duration,
    ) -> QueueResult<Option<QueueMessage>> {
        let mut conn = self.conn.clone();
        let min_idle_ms = visibility_timeout.as_millis() as u64;

        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(queue)
            .arg(&self.group)
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(1)
            .query_async(&mut conn)
            .await?;

        let Some(expired) = pending.ids.into_iter().next() else {
            return Ok(None);
        };

        let claimed: StreamClaimReply = redis::cmd("XCLAIM")
            .arg(queue)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(min_idle_ms)
            .arg(&expired.id)
            .query_async(&mut conn)
            .await?;

        // Another consumer may have claimed it between XPENDING and XCLAIM.
        let Some(entry) = claimed.ids.into_iter().next() else {
            return Ok(None);
        };

        let receive_count = expired.times_delivered as u32 + 1;
        info!(
            "Reclaimed expired lease: queue={}, id={}, receive_count={}",
            queue, entry.id, receive_count
        );
        Ok(Some(to_message(entry, receive_count)))
    }

    /// Reads one entry never delivered to this group before.
    async fn read_new(&self, queue: &str) -> QueueResult<Option<QueueMessage>> {
        let mut conn = self.conn.clone();

        let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            // BLOCK 0 waits forever.
            .arg((self.receive_wait.as_millis() as u64).max(1))
            .arg("STREAMS")
            .arg(queue)
            .arg(">")
            .query_async(&mut conn)
            .await?;

        let entry = reply
            .into_iter()
            .flat_map(|reply| reply.keys)
            .flat_map(|key| key.ids)
            .next();

        Ok(entry.map(|entry| to_message(entry, 1)))
    }
}

/// Builds a message from a stream entry. An entry without a readable body
/// is still delivered, with an empty body, so the pipeline can fail it and
/// apply its redelivery policy instead of it sitting unseen in the stream.
fn to_message(entry: StreamId, receive_count: u32) -> QueueMessage {
    let body = entry.get::<String>(BODY_FIELD).unwrap_or_else(|| {
        warn!("Stream entry {} has no {} field", entry.id, BODY_FIELD);
        String::new()
    });

    QueueMessage {
        body,
        handle: DeliveryHandle::new(entry.id, receive_count),
        receive_count,
    }
}

#[async_trait]
impl QueueClient for RedisStreamQueue {
    async fn receive_one(
        &self,
        queue: &str,
        visibility_timeout: Duration,
    ) -> QueueResult<Option<QueueMessage>> {
        if let Some(message) = self.claim_expired(queue, visibility_timeout).await? {
            return Ok(Some(message));
        }

        let message = self.read_new(queue).await?;
        if let Some(ref message) = message {
            debug!("Received message: queue={}, id={}", queue, message.handle);
        }
        Ok(message)
    }

    async fn delete(&self, queue: &str, handle: &DeliveryHandle) -> QueueResult<()> {
        let mut conn = self.conn.clone();

        let deleted: i32 = Script::new(DELETE_OWNED)
            .key(queue)
            .arg(&self.group)
            .arg(&handle.id)
            .arg(&self.consumer)
            .arg(handle.delivery)
            .invoke_async(&mut conn)
            .await?;

        if deleted == 0 {
            warn!("Not deleting {} from {}: delivery is no longer current", handle, queue);
            return Err(QueueError::LeaseLost(handle.to_string()));
        }

        debug!("Deleted message: queue={}, id={}", queue, handle);
        Ok(())
    }

    async fn send(&self, queue: &str, body: &str) -> QueueResult<()> {
        let mut conn = self.conn.clone();

        let id: String = redis::cmd("XADD")
            .arg(queue)
            .arg("*")
            .arg(BODY_FIELD)
            .arg(body)
            .query_async(&mut conn)
            .await?;

        debug!("Sent message: queue={}, id={}", queue, id);
        Ok(())
    }
}
