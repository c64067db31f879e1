//! State store key layout and TTLs.
//!
//! ```text
//! doc:state:{uuid}            hash: stage, status, started_at, error, version
//! doc:status:{uuid}           hash: overall_status, current_stage, stages_completed
//! doc:ocr:{uuid}              string: cached OCR text            ttl=24h
//! doc:chunks:{uuid}           json list of chunks                ttl=1h
//! doc:resolution:{uuid}       json mention -> canonical map      ttl=1h (warmed)
//! proj:entities:{uuid}        json frequent canonical entities   ttl=1h (warmed)
//! proj:meta:{uuid}            json project metadata              ttl=1h (warmed)
//! lock:doc:{uuid}:{stage}     string owner                       ttl=stage-specific
//! job:ocr:{job_id}            hash: status, doc_uuid, attempts   ttl=24h
//! batch:manifest:{id}         json                               ttl=24h
//! batch:job:{id}              json task ids                      ttl=24h
//! batch:progress:{id}         json                               ttl=1h
//! batch:retry_count:{id}      int                                ttl=24h
//! metrics:{hour}:{stage}:{st} counter                            ttl=7d
//! metrics:errors:{hour}       sorted set                         ttl=7d
//! ```

use uuid::Uuid;

use crate::models::Stage;

pub const TTL_DAY_SECS: u64 = 24 * 60 * 60;
pub const TTL_HOUR_SECS: u64 = 60 * 60;
pub const TTL_WEEK_SECS: u64 = 7 * 24 * 60 * 60;

pub fn doc_state(uuid: Uuid) -> String {
    format!("doc:state:{}", uuid)
}

pub fn doc_status(uuid: Uuid) -> String {
    format!("doc:status:{}", uuid)
}

pub fn doc_ocr(uuid: Uuid) -> String {
    format!("doc:ocr:{}", uuid)
}

pub fn doc_chunks(uuid: Uuid) -> String {
    format!("doc:chunks:{}", uuid)
}

pub fn doc_resolution(uuid: Uuid) -> String {
    format!("doc:resolution:{}", uuid)
}

pub fn proj_entities(uuid: Uuid) -> String {
    format!("proj:entities:{}", uuid)
}

pub fn proj_meta(uuid: Uuid) -> String {
    format!("proj:meta:{}", uuid)
}

pub fn stage_lock(uuid: Uuid, stage: Stage) -> String {
    format!("lock:doc:{}:{}", uuid, stage.as_str())
}

pub fn ocr_job(job_id: &str) -> String {
    format!("job:ocr:{}", job_id)
}

pub fn batch_manifest(id: Uuid) -> String {
    format!("batch:manifest:{}", id)
}

pub fn batch_job(id: Uuid) -> String {
    format!("batch:job:{}", id)
}

pub fn batch_progress(id: Uuid) -> String {
    format!("batch:progress:{}", id)
}

pub fn batch_retry_count(id: Uuid) -> String {
    format!("batch:retry_count:{}", id)
}

pub fn metrics_counter(hour_bucket: i64, stage: &str, status: &str) -> String {
    format!("metrics:{}:{}:{}", hour_bucket, stage, status)
}

pub fn metrics_errors(hour_bucket: i64) -> String {
    format!("metrics:errors:{}", hour_bucket)
}

/// Epoch-hour bucket for a millisecond timestamp.
pub fn hour_bucket(now_ms: i64) -> i64 {
    now_ms / 1000 / 3600
}
