//! `cd_broker::LogSink` backed by the `events` table, plus the historical
//! paginated read path `GET /api/deployments/{id}/logs` needs -- the sink
//! trait is write-only (spec §4.5), so the read side lives here instead of
//! behind that trait.

use async_trait::async_trait;
use cd_broker::LogSink;
use cd_common::model::{EventKind, EventRecord, ResourceType, Severity};
use cd_common::{Error, ErrorKind, Result};
use sqlx::{PgPool, Row};

#[derive(Clone)]
pub struct PgLogSink {
    pool: PgPool,
}

impl PgLogSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn store_err<E: std::error::Error + Send + Sync + 'static>(err: E) -> Error {
    Error::source(ErrorKind::StoreUnavailable, err)
}

#[async_trait]
impl LogSink for PgLogSink {
    async fn append(&self, record: EventRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO events (resource_type, resource_ref, sequence, kind, severity, payload, occurred_at)
             VALUES ($1,$2,$3,$4,$5,$6,$7)
             ON CONFLICT DO NOTHING",
        )
        .bind(record.resource_type)
        .bind(record.resource_ref.to_string())
        .bind(record.sequence as i64)
        .bind(record.kind)
        .bind(record.severity)
        .bind(record.payload)
        .bind(record.occurred_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }
}

/// Paginated historical fetch for `GET /api/deployments/{id}/logs` (spec
/// §6: "historical event fetch, paginated by sequence").
pub async fn list_events(
    pool: &PgPool,
    resource_type: ResourceType,
    resource_ref: ulid::Ulid,
    after_sequence: u64,
    limit: u32,
) -> Result<Vec<EventRecord>> {
    let rows = sqlx::query(
        "SELECT * FROM events
         WHERE resource_type = $1 AND resource_ref = $2 AND sequence > $3
         ORDER BY sequence ASC
         LIMIT $4",
    )
    .bind(resource_type)
    .bind(resource_ref.to_string())
    .bind(after_sequence as i64)
    .bind(limit as i64)
    .fetch_all(&pool.clone())
    .await
    .map_err(store_err)?;

    rows.into_iter()
        .map(|row| {
            let kind: EventKind = row.try_get("kind").map_err(store_err)?;
            let severity: Severity = row.try_get("severity").map_err(store_err)?;
            let resource_type: ResourceType = row.try_get("resource_type").map_err(store_err)?;
            let resource_ref_raw: String = row.try_get("resource_ref").map_err(store_err)?;
            let resource_ref = resource_ref_raw
                .parse()
                .map_err(|e: ulid::DecodeError| Error::source(ErrorKind::Internal, e))?;
            Ok(EventRecord {
                sequence: row.try_get::<i64, _>("sequence").map_err(store_err)? as u64,
                resource_type,
                resource_ref,
                kind,
                severity,
                payload: row.try_get("payload").map_err(store_err)?,
                occurred_at: row.try_get("occurred_at").map_err(store_err)?,
            })
        })
        .collect()
}
