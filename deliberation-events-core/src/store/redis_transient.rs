use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deliberation_events_contracts::TransientStore;
use deliberation_events_model::{Envelope, EventsError, EventsResult, FailedEventRecord, Sequence, SessionId};
use redis::AsyncCommands;

/// Atomically claims every member of the retry sorted set scored at or
/// before `now`, up to `limit` members, removing them from the set in the
/// same script invocation so concurrent scanners never double-claim a
/// record.
const CLAIM_DUE_SCRIPT: &str = r#"
local key = KEYS[1]
local now = ARGV[1]
local limit = tonumber(ARGV[2])
local items = redis.call('ZRANGEBYSCORE', key, '-inf', now, 'LIMIT', 0, limit)
for _, member in ipairs(items) do
    redis.call('ZREM', key, member)
end
return items
"#;

fn history_key(session_id: &SessionId) -> String {
    format!("events_history:{session_id}")
}

const RETRY_QUEUE_KEY: &str = "events:retry_queue";
const DLQ_KEY: &str = "events:dlq";

fn to_internal(err: redis::RedisError) -> EventsError {
    EventsError::Internal(format!("redis error: {err}"))
}

/// [`TransientStore`] backed by Redis: an ordered list with TTL for
/// per-session replay history, and two sorted sets (scored by
/// `next_retry_at`/`moved_to_dlq_at` epoch seconds) for the retry queue and
/// dead letter queue.
#[derive(Clone)]
pub struct RedisTransientStore {
    conn: redis::aio::ConnectionManager,
}

impl std::fmt::Debug for RedisTransientStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisTransientStore").finish_non_exhaustive()
    }
}

impl RedisTransientStore {
    pub async fn new(redis_url: &str) -> EventsResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|err| EventsError::Internal(format!("invalid redis url: {err}")))?;
        let conn = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(to_internal)?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl TransientStore for RedisTransientStore {
    async fn append(&self, envelope: &Envelope, ttl_seconds: u64) -> EventsResult<()> {
        let mut conn = self.conn.clone();
        let key = history_key(&envelope.session_id);
        let payload = serde_json::to_string(envelope)?;
        let _: () = conn.rpush(&key, payload).await.map_err(to_internal)?;
        let _: () = conn.expire(&key, ttl_seconds as i64).await.map_err(to_internal)?;
        Ok(())
    }

    async fn history_since(&self, session_id: &SessionId, since: Sequence) -> EventsResult<Vec<Envelope>> {
        let mut conn = self.conn.clone();
        let key = history_key(session_id);
        let raw: Vec<String> = conn.lrange(&key, 0, -1).await.map_err(to_internal)?;
        let mut events = Vec::with_capacity(raw.len());
        for item in raw {
            let envelope: Envelope = serde_json::from_str(&item)?;
            if envelope.sequence.value() > since.value() {
                events.push(envelope);
            }
        }
        Ok(events)
    }

    async fn enqueue_retry(&self, record: &FailedEventRecord) -> EventsResult<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(record)?;
        let score = record.next_retry_at.timestamp() as f64;
        let _: () = conn.zadd(RETRY_QUEUE_KEY, payload, score).await.map_err(to_internal)?;
        Ok(())
    }

    async fn claim_due_retries(&self, now: DateTime<Utc>, limit: usize) -> EventsResult<Vec<FailedEventRecord>> {
        let mut conn = self.conn.clone();
        let claimed: Vec<String> = redis::Script::new(CLAIM_DUE_SCRIPT)
            .key(RETRY_QUEUE_KEY)
            .arg(now.timestamp())
            .arg(limit)
            .invoke_async(&mut conn)
            .await
            .map_err(to_internal)?;

        claimed
            .into_iter()
            .map(|raw| serde_json::from_str(&raw).map_err(EventsError::from))
            .collect()
    }

    async fn reschedule_retry(&self, record: &FailedEventRecord) -> EventsResult<()> {
        self.enqueue_retry(record).await
    }

    async fn move_to_dlq(&self, record: &FailedEventRecord) -> EventsResult<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(record)?;
        let score = record
            .moved_to_dlq_at
            .unwrap_or(record.first_failed_at)
            .timestamp() as f64;
        let _: () = conn.zadd(DLQ_KEY, payload, score).await.map_err(to_internal)?;
        Ok(())
    }

    async fn retry_depth(&self) -> EventsResult<u64> {
        let mut conn = self.conn.clone();
        conn.zcard(RETRY_QUEUE_KEY).await.map_err(to_internal)
    }

    async fn dlq_depth(&self) -> EventsResult<u64> {
        let mut conn = self.conn.clone();
        conn.zcard(DLQ_KEY).await.map_err(to_internal)
    }
}
