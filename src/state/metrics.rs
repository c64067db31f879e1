//! Metrics collector: time-bucketed counters and a rolling error log.
//!
//! Counters live under `metrics:{hour}:{stage}:{status}` with a seven-day
//! TTL; classified errors go into a sorted set per hour bucket scored by
//! timestamp.

use std::collections::BTreeMap;

use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::models::Stage;

use super::{keys, StateResult, StateStore};

/// Counter snapshot for one hour bucket.
#[derive(Debug, Clone, Default)]
pub struct StageCounts {
    pub hour_bucket: i64,
    /// Counts keyed by `{stage}:{status}`.
    pub counts: BTreeMap<String, u64>,
}

/// Classified error counts over a window of hour buckets.
#[derive(Debug, Clone, Default)]
pub struct ErrorSummary {
    pub window_hours: u32,
    pub total: u64,
    pub by_kind: BTreeMap<String, u64>,
}

#[derive(Clone)]
pub struct MetricsCollector {
    conn: ConnectionManager,
}

impl MetricsCollector {
    pub fn new(store: &StateStore) -> Self {
        Self {
            conn: store.connection(),
        }
    }

    /// Record one stage transition or task outcome.
    pub async fn record(&self, stage: Stage, status: &str) -> StateResult<()> {
        let mut conn = self.conn.clone();
        let bucket = keys::hour_bucket(Utc::now().timestamp_millis());
        let key = keys::metrics_counter(bucket, stage.as_str(), status);

        redis::pipe()
            .incr(&key, 1)
            .expire(&key, keys::TTL_WEEK_SECS as i64)
            .query_async::<()>(&mut conn)
            .await?;

        Ok(())
    }

    /// Record a classified error for the rolling error log.
    pub async fn record_error(
        &self,
        kind: ErrorKind,
        stage: Stage,
        document_uuid: Uuid,
    ) -> StateResult<()> {
        let mut conn = self.conn.clone();
        let now_ms = Utc::now().timestamp_millis();
        let key = keys::metrics_errors(keys::hour_bucket(now_ms));
        let member = format!("{}:{}:{}:{}", now_ms, kind.as_str(), stage.as_str(), document_uuid);

        redis::pipe()
            .zadd(&key, member, now_ms as f64)
            .expire(&key, keys::TTL_WEEK_SECS as i64)
            .query_async::<()>(&mut conn)
            .await?;

        Ok(())
    }

    /// Counter snapshot for one hour bucket.
    pub async fn stage_counts(&self, hour_bucket: i64) -> StateResult<StageCounts> {
        let mut conn = self.conn.clone();
        let mut counts = BTreeMap::new();

        for stage in Stage::ALL {
            for status in ["completed", "failed", "cancelled", "retried", "lock_contention"] {
                let key = keys::metrics_counter(hour_bucket, stage.as_str(), status);
                let value: Option<u64> = conn.get(&key).await?;
                if let Some(v) = value {
                    counts.insert(format!("{}:{}", stage.as_str(), status), v);
                }
            }
        }

        Ok(StageCounts { hour_bucket, counts })
    }

    /// Documents finalized per hour over the trailing window, most recent
    /// bucket first.
    pub async fn throughput_per_hour(&self, window_hours: u32) -> StateResult<Vec<(i64, u64)>> {
        let mut conn = self.conn.clone();
        let current = keys::hour_bucket(Utc::now().timestamp_millis());
        let mut series = Vec::with_capacity(window_hours as usize);

        for offset in 0..window_hours as i64 {
            let bucket = current - offset;
            let key = keys::metrics_counter(bucket, Stage::Finalization.as_str(), "completed");
            let value: Option<u64> = conn.get(&key).await?;
            series.push((bucket, value.unwrap_or(0)));
        }

        Ok(series)
    }

    /// Classified error counts over the trailing window.
    pub async fn error_summary(&self, window_hours: u32) -> StateResult<ErrorSummary> {
        let mut conn = self.conn.clone();
        let current = keys::hour_bucket(Utc::now().timestamp_millis());
        let mut summary = ErrorSummary {
            window_hours,
            ..Default::default()
        };

        for offset in 0..window_hours as i64 {
            let key = keys::metrics_errors(current - offset);
            let members: Vec<String> = conn.zrangebyscore(&key, "-inf", "+inf").await?;
            for member in members {
                // Member layout: {ts}:{kind}:{stage}:{doc}
                let kind = member.splitn(3, ':').nth(1).unwrap_or("unknown").to_string();
                *summary.by_kind.entry(kind).or_insert(0) += 1;
                summary.total += 1;
            }
        }

        Ok(summary)
    }
}
