//! Redis-backed priority task queues.
//!
//! Each queue is a sorted set scored so that higher task priority pops
//! first and equal priorities pop FIFO. Delayed tasks park in a companion
//! scheduled set scored by their due time and are promoted atomically.

use std::time::Duration;

use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use serde::de::Error as _;

use crate::state::{StateError, StateResult, StateStore};

use super::{QueueName, QueuedTask};

const QUEUE_PREFIX: &str = "queue:";
const SCHEDULED_PREFIX: &str = "queue:scheduled:";
const SEQ_KEY: &str = "queue:seq";

/// Members carry their priority in a fixed three-digit prefix so the
/// promotion script can rescore without parsing JSON.
fn encode_member(task: &QueuedTask) -> StateResult<String> {
    Ok(format!("{:03}|{}", task.priority, serde_json::to_string(task)?))
}

fn decode_member(member: &str) -> StateResult<QueuedTask> {
    let payload = member.splitn(2, '|').nth(1).unwrap_or(member);
    Ok(serde_json::from_str(payload)?)
}

/// Score ordering: lower pops first. Priority dominates; the sequence
/// number breaks ties FIFO.
fn score_for(priority: u8, seq: u64) -> f64 {
    (255 - priority) as f64 * 1e12 + seq as f64
}

#[derive(Clone)]
pub struct TaskQueue {
    conn: ConnectionManager,
}

impl TaskQueue {
    pub fn new(store: &StateStore) -> Self {
        Self {
            conn: store.connection(),
        }
    }

    fn queue_key(queue: QueueName) -> String {
        format!("{}{}", QUEUE_PREFIX, queue.as_str())
    }

    fn scheduled_key(queue: QueueName) -> String {
        format!("{}{}", SCHEDULED_PREFIX, queue.as_str())
    }

    /// Enqueue a task for immediate consumption.
    pub async fn push(&self, queue: QueueName, task: &QueuedTask) -> StateResult<()> {
        let mut conn = self.conn.clone();
        let member = encode_member(task)?;

        let seq: u64 = conn.incr(SEQ_KEY, 1).await?;
        let _: () = conn
            .zadd(Self::queue_key(queue), member, score_for(task.priority, seq))
            .await?;

        Ok(())
    }

    /// Park a task until `delay` has elapsed.
    pub async fn push_delayed(
        &self,
        queue: QueueName,
        task: &QueuedTask,
        delay: Duration,
    ) -> StateResult<()> {
        let mut conn = self.conn.clone();
        let member = encode_member(task)?;
        let run_at_ms = Utc::now().timestamp_millis() + delay.as_millis() as i64;

        let _: () = conn
            .zadd(Self::scheduled_key(queue), member, run_at_ms as f64)
            .await?;

        Ok(())
    }

    /// Atomically move due scheduled tasks into the live queue.
    pub async fn promote_due(&self, queue: QueueName) -> StateResult<u64> {
        let mut conn = self.conn.clone();

        let script = Script::new(
            r#"
            local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 100)
            for i, member in ipairs(due) do
                local priority = tonumber(string.sub(member, 1, 3)) or 0
                local seq = redis.call('INCR', KEYS[3])
                local score = (255 - priority) * 1e12 + seq
                redis.call('ZADD', KEYS[2], score, member)
                redis.call('ZREM', KEYS[1], member)
            end
            return #due
        "#,
        );

        let moved: i64 = script
            .key(Self::scheduled_key(queue))
            .key(Self::queue_key(queue))
            .key(SEQ_KEY)
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await?;

        Ok(moved.max(0) as u64)
    }

    /// Blocking pop across queues, in the order given. Returns `None` on
    /// timeout.
    pub async fn pop(
        &self,
        queues: &[QueueName],
        timeout: Duration,
    ) -> StateResult<Option<(QueueName, QueuedTask)>> {
        let mut conn = self.conn.clone();

        let mut cmd = redis::cmd("BZPOPMIN");
        for queue in queues {
            cmd.arg(Self::queue_key(*queue));
        }
        cmd.arg(timeout.as_secs_f64());

        let popped: Option<(String, String, f64)> = cmd.query_async(&mut conn).await?;

        match popped {
            None => Ok(None),
            Some((key, member, _score)) => {
                let name = key.strip_prefix(QUEUE_PREFIX).unwrap_or(&key);
                let queue = QueueName::from_str(name).ok_or_else(|| {
                    StateError::Serialization(serde_json::Error::custom(format!(
                        "unknown queue key: {}",
                        key
                    )))
                })?;
                Ok(Some((queue, decode_member(&member)?)))
            }
        }
    }

    /// Live depth of a queue (excluding parked tasks).
    pub async fn depth(&self, queue: QueueName) -> StateResult<u64> {
        let mut conn = self.conn.clone();
        let count: u64 = conn.zcard(Self::queue_key(queue)).await?;
        Ok(count)
    }

    /// Parked tasks awaiting promotion.
    pub async fn scheduled_depth(&self, queue: QueueName) -> StateResult<u64> {
        let mut conn = self.conn.clone();
        let count: u64 = conn.zcard(Self::scheduled_key(queue)).await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::TaskKind;
    use uuid::Uuid;

    fn task(priority: u8) -> QueuedTask {
        QueuedTask {
            task_id: Uuid::new_v4(),
            document_uuid: Uuid::new_v4(),
            kind: TaskKind::OcrSubmit,
            priority,
            retry_count: 0,
            max_retries: 3,
            batch_id: None,
            entity_resolution: true,
        }
    }

    #[test]
    fn test_member_roundtrip() {
        let t = task(10);
        let member = encode_member(&t).unwrap();
        assert!(member.starts_with("010|"));

        let decoded = decode_member(&member).unwrap();
        assert_eq!(decoded.task_id, t.task_id);
        assert_eq!(decoded.priority, 10);
        assert_eq!(decoded.kind, TaskKind::OcrSubmit);
    }

    #[test]
    fn test_priority_dominates_sequence() {
        // A high-priority task enqueued later still pops first.
        let high_late = score_for(10, 1000);
        let normal_early = score_for(5, 1);
        assert!(high_late < normal_early);

        // FIFO within a priority.
        assert!(score_for(5, 1) < score_for(5, 2));
    }
}
