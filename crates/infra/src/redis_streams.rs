//! Redis Streams job queue (durable, at-least-once delivery).
//!
//! ## Layout
//!
//! - **Stream** (`backfill:jobs`): one entry per pending job, fields `body` and `attempt`
//! - **Consumer group**: shared by every worker; each entry goes to one consumer
//! - **Delayed set** (`<stream>:delayed`): sorted set scored by due time (epoch ms);
//!   due members are moved back onto the stream by whichever consumer polls first,
//!   in one Lua script so a member is never removed without being re-added
//! - **Dead-letter stream** (`<stream>:dlq`): body, reason, attempt and failure time
//!
//! Deliveries that stay unacknowledged longer than the visibility timeout are
//! claimed by the next consumer to poll (`XAUTOCLAIM`). Settled entries are
//! acknowledged and deleted from the stream.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::Value;
use redis::aio::MultiplexedConnection;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use backfill_queue::{Delivery, JobMessage, JobQueue, JobSource, QueueError};

const FIELD_BODY: &str = "body";
const FIELD_ATTEMPT: &str = "attempt";

/// Atomic delayed-set to stream move: the XADD happens only if this ZREM won.
const PROMOTE_SCRIPT: &str = r"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 1 then
  redis.call('XADD', KEYS[2], '*', ARGV[2], ARGV[3], ARGV[4], ARGV[5])
  return 1
end
return 0
";

#[derive(Debug, Clone)]
pub struct RedisStreamsConfig {
    pub stream: String,
    pub group: String,
    pub consumer: String,
    pub visibility_timeout: Duration,
    /// How long `XREADGROUP` blocks waiting for new entries.
    pub block: Duration,
}

impl RedisStreamsConfig {
    pub fn new(
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Self {
        Self {
            stream: stream.into(),
            group: group.into(),
            consumer: consumer.into(),
            visibility_timeout: Duration::from_secs(900),
            block: Duration::from_secs(2),
        }
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    fn delayed_key(&self) -> String {
        format!("{}:delayed", self.stream)
    }

    fn dlq_key(&self) -> String {
        format!("{}:dlq", self.stream)
    }
}

/// Member of the delayed set. The nonce keeps identical bodies distinct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct DelayedEntry {
    body: String,
    attempt: u32,
    nonce: Uuid,
}

#[derive(Clone)]
pub struct RedisJobQueue {
    conn: MultiplexedConnection,
    config: RedisStreamsConfig,
}

fn command_error(command: &str, err: redis::RedisError) -> QueueError {
    QueueError::Command(format!("{command} failed: {err}"))
}

impl RedisJobQueue {
    /// Connect and make sure the consumer group exists.
    pub async fn connect(
        redis_url: impl AsRef<str>,
        config: RedisStreamsConfig,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        let queue = Self { conn, config };
        queue.ensure_consumer_group().await?;
        Ok(queue)
    }

    /// `XGROUP CREATE ... MKSTREAM`; an existing group is fine.
    pub async fn ensure_consumer_group(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.config.stream)
            .arg(&self.config.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(command_error("XGROUP CREATE", e)),
        }
    }

    async fn add(&self, body: &str, attempt: u32) -> Result<String, QueueError> {
        let mut conn = self.conn.clone();
        redis::cmd("XADD")
            .arg(&self.config.stream)
            .arg("*")
            .arg(FIELD_BODY)
            .arg(body)
            .arg(FIELD_ATTEMPT)
            .arg(attempt)
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("XADD", e))
    }

    /// Move due delayed entries back onto the stream. Returns how many moved.
    pub async fn promote_due(&self, max: usize) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let now_ms = Utc::now().timestamp_millis();
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.config.delayed_key())
            .arg("-inf")
            .arg(now_ms)
            .arg("LIMIT")
            .arg(0)
            .arg(max)
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("ZRANGEBYSCORE", e))?;

        let mut moved = 0;
        for member in due {
            let entry = match serde_json::from_str::<DelayedEntry>(&member) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "dropping unreadable delayed entry");
                    let _: i64 = redis::cmd("ZREM")
                        .arg(self.config.delayed_key())
                        .arg(&member)
                        .query_async(&mut conn)
                        .await
                        .map_err(|e| command_error("ZREM", e))?;
                    continue;
                }
            };
            // Only the consumer whose ZREM wins re-adds the entry.
            let promoted: i64 = redis::Script::new(PROMOTE_SCRIPT)
                .key(self.config.delayed_key())
                .key(&self.config.stream)
                .arg(&member)
                .arg(FIELD_BODY)
                .arg(&entry.body)
                .arg(FIELD_ATTEMPT)
                .arg(entry.attempt)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| command_error("EVALSHA promote", e))?;
            moved += promoted as usize;
        }
        if moved > 0 {
            debug!(moved, "promoted delayed jobs");
        }
        Ok(moved)
    }

    async fn claim_idle(&self, max: usize) -> Result<Vec<Delivery>, QueueError> {
        let mut conn = self.conn.clone();
        let reply: Value = redis::cmd("XAUTOCLAIM")
            .arg(&self.config.stream)
            .arg(&self.config.group)
            .arg(&self.config.consumer)
            .arg(self.config.visibility_timeout.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(max)
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("XAUTOCLAIM", e))?;
        let claimed = parse_autoclaim(reply)?;
        if !claimed.is_empty() {
            warn!(count = claimed.len(), "reclaimed deliveries past their visibility timeout");
        }
        Ok(claimed)
    }

    async fn read_new(&self, max: usize) -> Result<Vec<Delivery>, QueueError> {
        let mut conn = self.conn.clone();
        let reply: Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.config.group)
            .arg(&self.config.consumer)
            .arg("COUNT")
            .arg(max)
            .arg("BLOCK")
            .arg(self.config.block.as_millis() as u64)
            .arg("STREAMS")
            .arg(&self.config.stream)
            .arg(">")
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("XREADGROUP", e))?;
        parse_read_reply(reply)
    }

    /// `XACK` + `XDEL` plus whatever `extra` adds, in one MULTI.
    async fn settle(
        &self,
        delivery: &Delivery,
        operation: &str,
        extra: impl FnOnce(&mut redis::Pipeline),
    ) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        extra(&mut pipe);
        pipe.cmd("XACK")
            .arg(&self.config.stream)
            .arg(&self.config.group)
            .arg(&delivery.receipt)
            .cmd("XDEL")
            .arg(&self.config.stream)
            .arg(&delivery.receipt)
            .ignore();
        let replies: Vec<Value> = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error(operation, e))?;
        if matches!(replies.last(), Some(Value::Int(0))) {
            warn!(receipt = %delivery.receipt, operation, "delivery was no longer pending");
        }
        Ok(())
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    #[instrument(skip_all, fields(stream = %self.config.stream, job_id = %message.job_id), err)]
    async fn send(&self, message: &JobMessage) -> Result<(), QueueError> {
        let body =
            serde_json::to_string(message).map_err(|e| QueueError::Serialization(e.to_string()))?;
        self.add(&body, 0).await.map(|_| ())
    }
}

#[async_trait]
impl JobSource for RedisJobQueue {
    async fn receive(&self, max: usize) -> Result<Vec<Delivery>, QueueError> {
        if max == 0 {
            return Ok(Vec::new());
        }
        self.promote_due(max).await?;

        let mut deliveries = self.claim_idle(max).await?;
        if deliveries.len() < max {
            deliveries.extend(self.read_new(max - deliveries.len()).await?);
        }
        Ok(deliveries)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.settle(delivery, "ack", |_| {}).await
    }

    async fn defer(
        &self,
        delivery: &Delivery,
        delay: Duration,
        attempt: u32,
    ) -> Result<(), QueueError> {
        let member = serde_json::to_string(&DelayedEntry {
            body: delivery.body.clone(),
            attempt,
            nonce: Uuid::now_v7(),
        })
        .map_err(|e| QueueError::Serialization(e.to_string()))?;
        let due_ms = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        let key = self.config.delayed_key();

        self.settle(delivery, "defer", |pipe| {
            pipe.cmd("ZADD").arg(&key).arg(due_ms).arg(&member).ignore();
        })
        .await
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError> {
        let key = self.config.dlq_key();
        let failed_at = Utc::now().to_rfc3339();
        self.settle(delivery, "dead_letter", |pipe| {
            pipe.cmd("XADD")
                .arg(&key)
                .arg("*")
                .arg("original_message_id")
                .arg(&delivery.receipt)
                .arg("reason")
                .arg(reason)
                .arg(FIELD_ATTEMPT)
                .arg(delivery.attempt)
                .arg("failed_at")
                .arg(&failed_at)
                .arg(FIELD_BODY)
                .arg(&delivery.body)
                .ignore();
        })
        .await?;
        warn!(receipt = %delivery.receipt, reason, "job sent to dead-letter stream");
        Ok(())
    }
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::Data(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::Status(s) => Some(s.clone()),
        _ => None,
    }
}

/// One stream entry: `[id, [field, value, ...]]`. Deleted entries come back as nil.
fn parse_entry(entry: &Value) -> Option<Delivery> {
    let Value::Bulk(parts) = entry else {
        return None;
    };
    let receipt = text(parts.first()?)?;
    let Value::Bulk(raw) = parts.get(1)? else {
        return None;
    };

    let fields: HashMap<String, String> = raw
        .chunks(2)
        .filter_map(|kv| match kv {
            [k, v] => Some((text(k)?, text(v)?)),
            _ => None,
        })
        .collect();

    Some(Delivery {
        receipt,
        attempt: fields
            .get(FIELD_ATTEMPT)
            .and_then(|a| a.parse().ok())
            .unwrap_or(0),
        body: fields.get(FIELD_BODY).cloned().unwrap_or_default(),
    })
}

fn parse_entries(entries: &Value) -> Vec<Delivery> {
    match entries {
        Value::Bulk(items) => items.iter().filter_map(parse_entry).collect(),
        _ => Vec::new(),
    }
}

/// `XREADGROUP` reply: nil on timeout, else `[[stream, [entries]]]`.
fn parse_read_reply(reply: Value) -> Result<Vec<Delivery>, QueueError> {
    match reply {
        Value::Nil => Ok(Vec::new()),
        Value::Bulk(streams) => Ok(streams
            .iter()
            .filter_map(|s| match s {
                Value::Bulk(pair) => pair.get(1).map(parse_entries),
                _ => None,
            })
            .flatten()
            .collect()),
        other => Err(QueueError::Deserialization(format!(
            "unexpected XREADGROUP reply: {other:?}"
        ))),
    }
}

/// `XAUTOCLAIM` reply: `[next-cursor, [entries], [deleted-ids]]`.
fn parse_autoclaim(reply: Value) -> Result<Vec<Delivery>, QueueError> {
    match reply {
        Value::Bulk(parts) => Ok(parts.get(1).map(parse_entries).unwrap_or_default()),
        other => Err(QueueError::Deserialization(format!(
            "unexpected XAUTOCLAIM reply: {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(s: &str) -> Value {
        Value::Data(s.as_bytes().to_vec())
    }

    fn entry(id: &str, body: &str, attempt: &str) -> Value {
        Value::Bulk(vec![
            data(id),
            Value::Bulk(vec![
                data(FIELD_BODY),
                data(body),
                data(FIELD_ATTEMPT),
                data(attempt),
            ]),
        ])
    }

    #[test]
    fn read_reply_yields_deliveries() {
        let reply = Value::Bulk(vec![Value::Bulk(vec![
            data("backfill:jobs"),
            Value::Bulk(vec![entry("1-0", "{}", "0"), entry("2-0", "{\"a\":1}", "3")]),
        ])]);
        let deliveries = parse_read_reply(reply).unwrap();
        assert_eq!(deliveries.len(), 2);
        assert_eq!(deliveries[1].receipt, "2-0");
        assert_eq!(deliveries[1].attempt, 3);
        assert_eq!(deliveries[1].body, "{\"a\":1}");

        assert!(parse_read_reply(Value::Nil).unwrap().is_empty());
    }

    #[test]
    fn autoclaim_skips_deleted_entries() {
        let reply = Value::Bulk(vec![
            data("0-0"),
            Value::Bulk(vec![entry("5-0", "x", "1"), Value::Nil]),
            Value::Bulk(vec![data("4-0")]),
        ]);
        let deliveries = parse_autoclaim(reply).unwrap();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].receipt, "5-0");
        assert!(parse_autoclaim(Value::Int(1)).is_err());
    }

    #[test]
    fn missing_attempt_field_defaults_to_first_delivery() {
        let raw = Value::Bulk(vec![
            data("9-0"),
            Value::Bulk(vec![data(FIELD_BODY), data("b")]),
        ]);
        assert_eq!(parse_entry(&raw).unwrap().attempt, 0);
    }

    #[test]
    fn delayed_members_stay_distinct_for_equal_bodies() {
        let a = DelayedEntry {
            body: "same".into(),
            attempt: 1,
            nonce: Uuid::now_v7(),
        };
        let b = DelayedEntry {
            nonce: Uuid::now_v7(),
            ..a.clone()
        };
        assert_ne!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn keys_derive_from_stream() {
        let cfg = RedisStreamsConfig::new("jobs", "g", "c");
        assert_eq!(cfg.delayed_key(), "jobs:delayed");
        assert_eq!(cfg.dlq_key(), "jobs:dlq");
    }
}
