use pricewise_core::{
    EventId, EventKind, EventLog, EventWindow, ExperimentEvent, ExperimentId, StoreError,
};
use sqlx::{sqlite::SqliteRow, Row};

use super::{format_timestamp, parse_decimal, parse_timestamp, RepositoryError};
use crate::DbPool;

/// Append-only event log. Rows are never updated or deleted.
pub struct SqlEventRepository {
    pool: DbPool,
}

impl SqlEventRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn insert(&self, event: &ExperimentEvent) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO experiment_event (
                id,
                experiment_id,
                user_id,
                variant_name,
                kind,
                revenue,
                occurred_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.id.0)
        .bind(&event.experiment_id.0)
        .bind(&event.user_id)
        .bind(&event.variant_name)
        .bind(event.kind.as_str())
        .bind(event.revenue.map(|revenue| revenue.to_string()))
        .bind(format_timestamp(&event.occurred_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn scan(
        &self,
        experiment_id: &ExperimentId,
        window: EventWindow,
    ) -> Result<Vec<ExperimentEvent>, RepositoryError> {
        let since = window.since.as_ref().map(format_timestamp);
        let rows = sqlx::query(
            "SELECT id, experiment_id, user_id, variant_name, kind, revenue, occurred_at
             FROM experiment_event
             WHERE experiment_id = ?1 AND (?2 IS NULL OR occurred_at >= ?2)
             ORDER BY occurred_at DESC, id DESC
             LIMIT ?3",
        )
        .bind(&experiment_id.0)
        .bind(since)
        .bind(i64::from(window.limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(event_from_row).collect()
    }
}

#[async_trait::async_trait]
impl EventLog for SqlEventRepository {
    async fn append(&self, event: ExperimentEvent) -> Result<(), StoreError> {
        Ok(self.insert(&event).await?)
    }

    async fn list_for_experiment(
        &self,
        experiment_id: &ExperimentId,
        window: EventWindow,
    ) -> Result<Vec<ExperimentEvent>, StoreError> {
        Ok(self.scan(experiment_id, window).await?)
    }
}

fn event_from_row(row: SqliteRow) -> Result<ExperimentEvent, RepositoryError> {
    let kind_raw: String = row.try_get("kind")?;
    let kind = EventKind::parse(&kind_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown event kind `{kind_raw}`")))?;
    let revenue = row
        .try_get::<Option<String>, _>("revenue")?
        .map(|value| parse_decimal("revenue", &value))
        .transpose()?;

    Ok(ExperimentEvent {
        id: EventId(row.try_get("id")?),
        experiment_id: ExperimentId(row.try_get("experiment_id")?),
        user_id: row.try_get("user_id")?,
        variant_name: row.try_get("variant_name")?,
        kind,
        revenue,
        occurred_at: parse_timestamp("occurred_at", row.try_get("occurred_at")?)?,
    })
}
