use altec_common::ids::WorkerId;
use altec_common::model::TaskKey;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::Script;

use super::traits::{AcquireOutcome, ExtendOutcome, Lock};

/// Secondary index of lease deadlines, since Redis key TTL eviction alone can't answer
/// "which locks are currently expired" — the natural generalization of the teacher's
/// `XPENDING`/`XCLAIM` idiom (periodic scan for stale ownership) to a lease-keyed
/// structure instead of a stream.
const LOCK_INDEX_KEY: &str = "altec:lock_index";

/// CAS-extend: only refresh the TTL if the caller still owns the key. Mirrors the
/// teacher's `heartbeat`/`check_heartbeat` pair of TTL'd keys, generalized to an
/// atomic compare-then-extend via a Lua script (no separate read-then-write race).
const EXTEND_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    redis.call("SET", KEYS[1], ARGV[1], "PX", ARGV[2])
    return 1
else
    return 0
end
"#;

/// CAS-release: only delete the key if the caller still owns it.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Redis-backed half of the State Store: ephemeral single-holder locks with lease
/// semantics (`lock:{kind}:{resource_id}` per §6's wire shape).
pub struct RedisLockStore {
    conn: MultiplexedConnection,
}

impl RedisLockStore {
    pub async fn connect(redis_url: &str) -> Result<Self, LockStoreError> {
        tracing::info!("Connecting to Redis");
        let client =
            redis::Client::open(redis_url).map_err(|e| LockStoreError::Connection(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| LockStoreError::Connection(e.to_string()))?;
        let store = Self { conn };
        store.health_check().await?;
        tracing::info!("Redis connection established");
        Ok(store)
    }

    pub async fn health_check(&self) -> Result<(), LockStoreError> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| LockStoreError::Command(e.to_string()))?;
        if pong != "PONG" {
            return Err(LockStoreError::Command(format!("unexpected PING reply: {pong}")));
        }
        Ok(())
    }

    fn key_for(task_key: &TaskKey) -> String {
        task_key.lock_key()
    }

    pub async fn try_acquire_lock(
        &self,
        task_key: &TaskKey,
        worker_id: &WorkerId,
        lease: chrono::Duration,
    ) -> Result<AcquireOutcome, LockStoreError> {
        let mut conn = self.conn.clone();
        let key = Self::key_for(task_key);
        let lease_ms = lease.num_milliseconds().max(1);
        let now = Utc::now();
        let deadline = now + lease;

        let set: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(&worker_id.0)
            .arg("NX")
            .arg("PX")
            .arg(lease_ms)
            .query_async(&mut conn)
            .await
            .map_err(|e| LockStoreError::Command(e.to_string()))?;

        if set.is_some() {
            self.index_set(&mut conn, task_key, deadline).await?;
            return Ok(AcquireOutcome::Acquired(Lock {
                task_key: task_key.clone(),
                owner_worker: worker_id.clone(),
                acquired_at: now,
                lease_deadline: deadline,
            }));
        }

        let current_owner: Option<String> = redis::cmd("GET")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(|e| LockStoreError::Command(e.to_string()))?;
        let ttl_ms: i64 = redis::cmd("PTTL")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(|e| LockStoreError::Command(e.to_string()))?;

        Ok(AcquireOutcome::HeldByOther {
            owner_worker: WorkerId::new(current_owner.unwrap_or_default()),
            remaining: chrono::Duration::milliseconds(ttl_ms.max(0)),
        })
    }

    pub async fn extend_lock(
        &self,
        task_key: &TaskKey,
        worker_id: &WorkerId,
        lease: chrono::Duration,
    ) -> Result<ExtendOutcome, LockStoreError> {
        let mut conn = self.conn.clone();
        let key = Self::key_for(task_key);
        let lease_ms = lease.num_milliseconds().max(1);

        let extended: i32 = Script::new(EXTEND_SCRIPT)
            .key(&key)
            .arg(&worker_id.0)
            .arg(lease_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| LockStoreError::Command(e.to_string()))?;

        if extended == 1 {
            self.index_set(&mut conn, task_key, Utc::now() + lease).await?;
            Ok(ExtendOutcome::Ok)
        } else {
            Ok(ExtendOutcome::Lost)
        }
    }

    pub async fn release_lock(
        &self,
        task_key: &TaskKey,
        worker_id: &WorkerId,
    ) -> Result<(), LockStoreError> {
        let mut conn = self.conn.clone();
        let key = Self::key_for(task_key);

        let _: i32 = Script::new(RELEASE_SCRIPT)
            .key(&key)
            .arg(&worker_id.0)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| LockStoreError::Command(e.to_string()))?;

        let _: i64 = redis::cmd("ZREM")
            .arg(LOCK_INDEX_KEY)
            .arg(Self::index_member(task_key))
            .query_async(&mut conn)
            .await
            .map_err(|e| LockStoreError::Command(e.to_string()))?;
        Ok(())
    }

    pub async fn list_expired_locks(&self, now: DateTime<Utc>) -> Result<Vec<TaskKey>, LockStoreError> {
        let mut conn = self.conn.clone();
        let now_millis = now.timestamp_millis();

        let members: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(LOCK_INDEX_KEY)
            .arg("-inf")
            .arg(now_millis)
            .query_async(&mut conn)
            .await
            .map_err(|e| LockStoreError::Command(e.to_string()))?;

        let mut keys = Vec::with_capacity(members.len());
        for member in members {
            if let Some(task_key) = decode_index_member(&member) {
                keys.push(task_key);
            }
        }
        Ok(keys)
    }

    fn index_member(task_key: &TaskKey) -> String {
        format!("{}\u{1}{}", task_key.kind, task_key.resource_id)
    }

    async fn index_set(
        &self,
        conn: &mut MultiplexedConnection,
        task_key: &TaskKey,
        deadline: DateTime<Utc>,
    ) -> Result<(), LockStoreError> {
        let _: i64 = redis::cmd("ZADD")
            .arg(LOCK_INDEX_KEY)
            .arg(deadline.timestamp_millis())
            .arg(Self::index_member(task_key))
            .query_async(conn)
            .await
            .map_err(|e| LockStoreError::Command(e.to_string()))?;
        Ok(())
    }
}

fn decode_index_member(member: &str) -> Option<TaskKey> {
    let (kind_str, resource_id) = member.split_once('\u{1}')?;
    let kind = altec_common::model::TaskKind::parse(kind_str)?;
    Some(TaskKey::new(kind, resource_id))
}

#[derive(Debug, thiserror::Error)]
pub enum LockStoreError {
    #[error("Redis connection error: {0}")]
    Connection(String),
    #[error("Redis command error: {0}")]
    Command(String),
}

impl From<LockStoreError> for altec_common::AltecError {
    fn from(e: LockStoreError) -> Self {
        altec_common::AltecError::Redis(e.to_string())
    }
}
