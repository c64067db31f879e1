//! Scoped stage locks.
//!
//! A lock is an SS key with a TTL whose presence guarantees exclusivity
//! for one (document, stage). Acquisition uses SET NX PX; release compares
//! the owner token so an expired-and-reacquired lock is never deleted by
//! the previous holder.

use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::Script;
use uuid::Uuid;

use crate::models::Stage;

use super::{keys, StateResult, StateStore};

/// A held stage lock. Must be released on every exit path; the TTL is the
/// safety net if a worker dies while holding it.
pub struct StageLock {
    conn: ConnectionManager,
    key: String,
    owner: String,
    released: bool,
}

impl StageLock {
    /// Release the lock if this handle still owns it.
    pub async fn release(mut self) -> StateResult<()> {
        self.released = true;

        let script = Script::new(
            r#"
            if redis.call('GET', KEYS[1]) == ARGV[1] then
                return redis.call('DEL', KEYS[1])
            end
            return 0
        "#,
        );

        let mut conn = self.conn.clone();
        let _: i64 = script
            .key(&self.key)
            .arg(&self.owner)
            .invoke_async(&mut conn)
            .await?;

        Ok(())
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }
}

impl Drop for StageLock {
    fn drop(&mut self) {
        if !self.released {
            tracing::warn!(
                key = %self.key,
                "stage lock dropped without release; TTL will reclaim it"
            );
        }
    }
}

impl StateStore {
    /// Try to acquire the scoped lock for (document, stage).
    ///
    /// Returns `None` when another worker holds it; callers must treat
    /// that as "someone else is doing this work" and exit with no side
    /// effects.
    pub async fn acquire_stage_lock(
        &self,
        document_uuid: Uuid,
        stage: Stage,
        owner: &str,
        ttl: Duration,
    ) -> StateResult<Option<StageLock>> {
        let mut conn = self.connection();
        let key = keys::stage_lock(document_uuid, stage);

        let acquired: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(owner)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;

        if acquired.is_none() {
            return Ok(None);
        }

        Ok(Some(StageLock {
            conn: self.connection(),
            key,
            owner: owner.to_string(),
            released: false,
        }))
    }
}
