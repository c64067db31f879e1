//! Redis-backed state store.
//!
//! Holds document state hashes, stage result caches, scoped locks, batch
//! bookkeeping, and metrics streams. All non-trivial mutations go through
//! single-key atomic operations or Lua scripts; the document state hash is
//! guarded by a compare-and-set on a monotonically increasing version
//! field so concurrent writers cannot lose updates.

pub mod keys;
mod lock;
mod metrics;

pub use lock::StageLock;
pub use metrics::{ErrorSummary, MetricsCollector, StageCounts};

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Batch, BatchProgress, Chunk, OcrJobStatus, Stage};

/// Errors from the state store.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("state store error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StateResult<T> = Result<T, StateError>;

impl From<StateError> for crate::error::StageError {
    fn from(e: StateError) -> Self {
        crate::error::StageError::transient(e.to_string())
    }
}

/// Snapshot of a document's state hash (`doc:state:{uuid}`).
#[derive(Debug, Clone, Default)]
pub struct DocState {
    pub stage: Option<Stage>,
    pub status: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Monotonically increasing; 0 means the hash does not exist yet.
    pub version: u64,
    pub cancel_requested: bool,
}

/// Snapshot of `doc:status:{uuid}`, the coarse view batch monitoring scans.
#[derive(Debug, Clone, Default)]
pub struct DocStatusSummary {
    pub overall_status: String,
    pub current_stage: Option<String>,
    pub stages_completed: Vec<String>,
}

/// Shared handle to the Redis state store.
#[derive(Clone)]
pub struct StateStore {
    conn: ConnectionManager,
}

impl StateStore {
    pub async fn connect(redis_url: &str) -> StateResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    pub(crate) fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }

    // ========================================================================
    // Document state hash (coordinator-owned, version CAS)
    // ========================================================================

    pub async fn read_doc_state(&self, document_uuid: Uuid) -> StateResult<DocState> {
        let mut conn = self.conn.clone();
        let key = keys::doc_state(document_uuid);

        let fields: HashMap<String, String> = conn.hgetall(&key).await?;
        if fields.is_empty() {
            return Ok(DocState::default());
        }

        Ok(DocState {
            stage: fields.get("stage").and_then(|s| Stage::from_str(s)),
            status: fields.get("status").cloned(),
            started_at: fields.get("started_at").and_then(|s| {
                DateTime::parse_from_rfc3339(s)
                    .map(|dt| dt.with_timezone(&Utc))
                    .ok()
            }),
            error: fields.get("error").cloned().filter(|e| !e.is_empty()),
            version: fields
                .get("version")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            cancel_requested: fields.get("cancel_requested").map(|v| v == "1").unwrap_or(false),
        })
    }

    /// Compare-and-set update of the document state hash.
    ///
    /// Applies the field updates only when the stored version still equals
    /// `expected_version`, then bumps the version. Returns the new version,
    /// or `None` when another writer got there first.
    pub async fn update_doc_state(
        &self,
        document_uuid: Uuid,
        expected_version: u64,
        fields: &[(&str, String)],
    ) -> StateResult<Option<u64>> {
        let mut conn = self.conn.clone();
        let key = keys::doc_state(document_uuid);

        let script = Script::new(
            r#"
            local key = KEYS[1]
            local expected = tonumber(ARGV[1])
            local current = tonumber(redis.call('HGET', key, 'version')) or 0
            if current ~= expected then
                return -1
            end
            for i = 2, #ARGV, 2 do
                redis.call('HSET', key, ARGV[i], ARGV[i + 1])
            end
            redis.call('HSET', key, 'version', current + 1)
            return current + 1
        "#,
        );

        let mut invocation = script.key(&key);
        invocation.arg(expected_version);
        for (field, value) in fields {
            invocation.arg(*field).arg(value);
        }

        let new_version: i64 = invocation.invoke_async(&mut conn).await?;
        if new_version < 0 {
            Ok(None)
        } else {
            Ok(Some(new_version as u64))
        }
    }

    /// Convenience CAS write of the per-stage fields the coordinator
    /// records on every transition. Retries the CAS on contention since
    /// the coordinator is the only writer and conflicts are rare races.
    pub async fn record_stage_state(
        &self,
        document_uuid: Uuid,
        stage: Stage,
        status: &str,
        error: Option<&str>,
    ) -> StateResult<u64> {
        loop {
            let current = self.read_doc_state(document_uuid).await?;
            let fields = vec![
                ("stage", stage.as_str().to_string()),
                ("status", status.to_string()),
                ("started_at", Utc::now().to_rfc3339()),
                ("error", error.unwrap_or_default().to_string()),
            ];
            if let Some(version) = self
                .update_doc_state(document_uuid, current.version, &fields)
                .await?
            {
                return Ok(version);
            }
            tracing::debug!(document = %document_uuid, "doc state CAS conflict, retrying");
        }
    }

    /// Flag a document for cooperative cancellation.
    pub async fn request_cancel(&self, document_uuid: Uuid) -> StateResult<()> {
        let mut conn = self.conn.clone();
        let key = keys::doc_state(document_uuid);
        let _: () = conn.hset(&key, "cancel_requested", "1").await?;
        Ok(())
    }

    /// Clear a previous cancellation so a re-submitted document can run.
    pub async fn clear_cancel(&self, document_uuid: Uuid) -> StateResult<()> {
        let mut conn = self.conn.clone();
        let key = keys::doc_state(document_uuid);
        let _: () = conn.hdel(&key, "cancel_requested").await?;
        Ok(())
    }

    pub async fn is_cancel_requested(&self, document_uuid: Uuid) -> StateResult<bool> {
        let mut conn = self.conn.clone();
        let key = keys::doc_state(document_uuid);
        let flag: Option<String> = conn.hget(&key, "cancel_requested").await?;
        Ok(flag.as_deref() == Some("1"))
    }

    // ========================================================================
    // Document status summary
    // ========================================================================

    pub async fn set_doc_status(
        &self,
        document_uuid: Uuid,
        overall_status: &str,
        current_stage: Option<Stage>,
        stages_completed: &[Stage],
    ) -> StateResult<()> {
        let mut conn = self.conn.clone();
        let key = keys::doc_status(document_uuid);

        let completed: Vec<&str> = stages_completed.iter().map(|s| s.as_str()).collect();

        redis::pipe()
            .hset(&key, "overall_status", overall_status)
            .hset(
                &key,
                "current_stage",
                current_stage.map(|s| s.as_str()).unwrap_or_default(),
            )
            .hset(&key, "stages_completed", completed.join(","))
            .query_async::<()>(&mut conn)
            .await?;

        Ok(())
    }

    pub async fn get_doc_status(
        &self,
        document_uuid: Uuid,
    ) -> StateResult<Option<DocStatusSummary>> {
        let mut conn = self.conn.clone();
        let key = keys::doc_status(document_uuid);

        let fields: HashMap<String, String> = conn.hgetall(&key).await?;
        if fields.is_empty() {
            return Ok(None);
        }

        Ok(Some(DocStatusSummary {
            overall_status: fields.get("overall_status").cloned().unwrap_or_default(),
            current_stage: fields
                .get("current_stage")
                .cloned()
                .filter(|s| !s.is_empty()),
            stages_completed: fields
                .get("stages_completed")
                .map(|s| {
                    s.split(',')
                        .filter(|p| !p.is_empty())
                        .map(|p| p.to_string())
                        .collect()
                })
                .unwrap_or_default(),
        }))
    }

    // ========================================================================
    // Stage result caches
    // ========================================================================

    pub async fn cache_ocr_text(&self, document_uuid: Uuid, text: &str) -> StateResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(keys::doc_ocr(document_uuid), text, keys::TTL_DAY_SECS)
            .await?;
        Ok(())
    }

    /// Warm-cache variant: same key, the shorter warm-entry TTL.
    pub async fn warm_ocr_text(&self, document_uuid: Uuid, text: &str) -> StateResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(keys::doc_ocr(document_uuid), text, keys::TTL_HOUR_SECS)
            .await?;
        Ok(())
    }

    pub async fn cached_ocr_text(&self, document_uuid: Uuid) -> StateResult<Option<String>> {
        let mut conn = self.conn.clone();
        let text: Option<String> = conn.get(keys::doc_ocr(document_uuid)).await?;
        Ok(text)
    }

    pub async fn cache_chunks(&self, document_uuid: Uuid, chunks: &[Chunk]) -> StateResult<()> {
        self.put_json(&keys::doc_chunks(document_uuid), &chunks, keys::TTL_HOUR_SECS)
            .await
    }

    pub async fn cached_chunks(&self, document_uuid: Uuid) -> StateResult<Option<Vec<Chunk>>> {
        self.get_json(&keys::doc_chunks(document_uuid)).await
    }

    /// Store a JSON value under an arbitrary cache key with a TTL.
    pub async fn put_json<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl_secs: u64,
    ) -> StateResult<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(value)?;
        let _: () = conn.set_ex(key, payload, ttl_secs).await?;
        Ok(())
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> StateResult<Option<T>> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn.get(key).await?;
        match payload {
            Some(p) => Ok(Some(serde_json::from_str(&p)?)),
            None => Ok(None),
        }
    }

    // ========================================================================
    // OCR job mirror
    // ========================================================================

    pub async fn put_ocr_job(
        &self,
        job_id: &str,
        document_uuid: Uuid,
        handle_json: &str,
    ) -> StateResult<()> {
        let mut conn = self.conn.clone();
        let key = keys::ocr_job(job_id);

        redis::pipe()
            .hset(&key, "status", OcrJobStatus::InProgress.as_str())
            .hset(&key, "doc_uuid", document_uuid.to_string())
            .hset(&key, "attempts", 0)
            .hset(&key, "handle", handle_json)
            .expire(&key, keys::TTL_DAY_SECS as i64)
            .query_async::<()>(&mut conn)
            .await?;

        Ok(())
    }

    /// The serialized job handle recorded at submit time.
    pub async fn get_ocr_job_handle(&self, job_id: &str) -> StateResult<Option<String>> {
        let mut conn = self.conn.clone();
        let handle: Option<String> = conn.hget(keys::ocr_job(job_id), "handle").await?;
        Ok(handle)
    }

    /// Bump and return the poll attempt counter for a job.
    pub async fn incr_ocr_attempts(&self, job_id: &str) -> StateResult<u64> {
        let mut conn = self.conn.clone();
        let key = keys::ocr_job(job_id);
        let attempts: i64 = conn.hincr(&key, "attempts", 1).await?;
        Ok(attempts.max(0) as u64)
    }

    pub async fn set_ocr_job_status(&self, job_id: &str, status: OcrJobStatus) -> StateResult<()> {
        let mut conn = self.conn.clone();
        let key = keys::ocr_job(job_id);
        let _: () = conn.hset(&key, "status", status.as_str()).await?;
        Ok(())
    }

    // ========================================================================
    // Batch bookkeeping
    // ========================================================================

    pub async fn put_batch_manifest(&self, batch: &Batch) -> StateResult<()> {
        self.put_json(&keys::batch_manifest(batch.batch_id), batch, keys::TTL_DAY_SECS)
            .await
    }

    pub async fn get_batch_manifest(&self, batch_id: Uuid) -> StateResult<Option<Batch>> {
        self.get_json(&keys::batch_manifest(batch_id)).await
    }

    pub async fn put_batch_tasks(&self, batch_id: Uuid, task_ids: &[Uuid]) -> StateResult<()> {
        self.put_json(&keys::batch_job(batch_id), task_ids, keys::TTL_DAY_SECS)
            .await
    }

    pub async fn put_batch_progress(&self, progress: &BatchProgress) -> StateResult<()> {
        self.put_json(
            &keys::batch_progress(progress.batch_id),
            progress,
            keys::TTL_HOUR_SECS,
        )
        .await
    }

    pub async fn get_batch_progress(&self, batch_id: Uuid) -> StateResult<Option<BatchProgress>> {
        self.get_json(&keys::batch_progress(batch_id)).await
    }

    pub async fn incr_batch_retry(&self, batch_id: Uuid) -> StateResult<u64> {
        let mut conn = self.conn.clone();
        let key = keys::batch_retry_count(batch_id);
        let count: i64 = conn.incr(&key, 1).await?;
        let _: () = conn.expire(&key, keys::TTL_DAY_SECS as i64).await?;
        Ok(count.max(0) as u64)
    }

    pub async fn get_batch_retry(&self, batch_id: Uuid) -> StateResult<u64> {
        let mut conn = self.conn.clone();
        let count: Option<i64> = conn.get(keys::batch_retry_count(batch_id)).await?;
        Ok(count.unwrap_or(0).max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let doc = Uuid::nil();
        assert_eq!(
            keys::doc_state(doc),
            "doc:state:00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(
            keys::stage_lock(doc, Stage::Ocr),
            "lock:doc:00000000-0000-0000-0000-000000000000:ocr"
        );
        assert_eq!(keys::ocr_job("j1"), "job:ocr:j1");
        assert_eq!(keys::metrics_counter(491000, "ocr", "completed"), "metrics:491000:ocr:completed");
    }

    #[test]
    fn test_hour_bucket() {
        assert_eq!(keys::hour_bucket(0), 0);
        assert_eq!(keys::hour_bucket(3_600_000), 1);
        assert_eq!(keys::hour_bucket(3_599_999), 0);
    }
}
