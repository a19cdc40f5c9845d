use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deliberation_events_contracts::PermanentStore;
use deliberation_events_model::{Envelope, EventsError, EventsResult, Sequence, SessionId};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};

fn to_internal(err: sqlx::Error) -> EventsError {
    EventsError::Internal(format!("postgres error: {err}"))
}

/// [`PermanentStore`] backed by a `sqlx` Postgres pool.
///
/// Expects a table created by this crate's own migration:
/// `events(session_id text, sequence bigint, event_type text, ts timestamptz,
/// request_id text, data jsonb, primary key (session_id, sequence))`.
pub struct PostgresPermanentStore {
    pool: PgPool,
}

impl std::fmt::Debug for PostgresPermanentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresPermanentStore")
            .field("pool_size", &self.pool.size())
            .field("pool_idle", &self.pool.num_idle())
            .finish()
    }
}

impl PostgresPermanentStore {
    pub async fn new(connection_string: &str) -> EventsResult<Self> {
        let max_connections = std::env::var("DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);
        let min_connections = std::env::var("DB_MIN_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .max_lifetime(std::time::Duration::from_secs(1800))
            .idle_timeout(std::time::Duration::from_secs(600))
            .test_before_acquire(true)
            .connect(connection_string)
            .await
            .map_err(to_internal)?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the `events` table if it does not already exist. Called by
    /// the config/bootstrap layer on startup rather than on every query.
    pub async fn ensure_schema(&self) -> EventsResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                session_id TEXT NOT NULL,
                sequence BIGINT NOT NULL,
                event_type TEXT NOT NULL,
                ts TIMESTAMPTZ NOT NULL,
                request_id TEXT,
                data JSONB NOT NULL,
                PRIMARY KEY (session_id, sequence)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(to_internal)?;
        Ok(())
    }
}

fn row_to_envelope(row: PgRow) -> EventsResult<Envelope> {
    let session_id: String = row.try_get("session_id").map_err(to_internal)?;
    let sequence: i64 = row.try_get("sequence").map_err(to_internal)?;
    let event_type: String = row.try_get("event_type").map_err(to_internal)?;
    let timestamp: DateTime<Utc> = row.try_get("ts").map_err(to_internal)?;
    let request_id: Option<String> = row.try_get("request_id").map_err(to_internal)?;
    let data: serde_json::Value = row.try_get("data").map_err(to_internal)?;

    Ok(Envelope::new(
        SessionId::new(session_id),
        Sequence(sequence as u64),
        event_type,
        timestamp,
        request_id,
        data,
    ))
}

#[async_trait]
impl PermanentStore for PostgresPermanentStore {
    async fn save_event(&self, envelope: &Envelope) -> EventsResult<()> {
        sqlx::query(
            r#"
            INSERT INTO events (session_id, sequence, event_type, ts, request_id, data)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (session_id, sequence) DO NOTHING
            "#,
        )
        .bind(envelope.session_id.as_str())
        .bind(envelope.sequence.value() as i64)
        .bind(&envelope.event_type)
        .bind(envelope.timestamp)
        .bind(&envelope.request_id)
        .bind(&envelope.data)
        .execute(&self.pool)
        .await
        .map_err(to_internal)?;
        Ok(())
    }

    async fn save_events_batch(&self, envelopes: &[Envelope]) -> EventsResult<()> {
        if envelopes.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.map_err(to_internal)?;

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO events (session_id, sequence, event_type, ts, request_id, data) ",
        );
        builder.push_values(envelopes, |mut row, envelope| {
            row.push_bind(envelope.session_id.as_str())
                .push_bind(envelope.sequence.value() as i64)
                .push_bind(&envelope.event_type)
                .push_bind(envelope.timestamp)
                .push_bind(&envelope.request_id)
                .push_bind(&envelope.data);
        });
        builder.push(" ON CONFLICT (session_id, sequence) DO NOTHING");

        builder.build().execute(&mut *tx).await.map_err(to_internal)?;
        tx.commit().await.map_err(to_internal)?;
        Ok(())
    }

    async fn get_events(&self, session_id: &SessionId, since: Sequence) -> EventsResult<Vec<Envelope>> {
        let rows = sqlx::query(
            "SELECT session_id, sequence, event_type, ts, request_id, data FROM events \
             WHERE session_id = $1 AND sequence > $2 ORDER BY sequence ASC",
        )
        .bind(session_id.as_str())
        .bind(since.value() as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(to_internal)?;

        rows.into_iter().map(row_to_envelope).collect()
    }

    async fn max_sequence(&self, session_id: &SessionId) -> EventsResult<Option<Sequence>> {
        let row = sqlx::query("SELECT MAX(sequence) AS max_seq FROM events WHERE session_id = $1")
            .bind(session_id.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(to_internal)?;

        let max_seq: Option<i64> = row.try_get("max_seq").map_err(to_internal)?;
        Ok(max_seq.map(|v| Sequence(v as u64)))
    }
}
