use pricewise_core::{Assignment, AssignmentStore, ExperimentId, StoreError};
use sqlx::{sqlite::SqliteRow, Row};

use super::{format_timestamp, parse_timestamp, RepositoryError};
use crate::DbPool;

pub struct SqlAssignmentRepository {
    pool: DbPool,
}

impl SqlAssignmentRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn fetch(
        &self,
        experiment_id: &ExperimentId,
        user_id: &str,
    ) -> Result<Option<Assignment>, RepositoryError> {
        let row = sqlx::query(
            "SELECT experiment_id, user_id, variant_name, assigned_at
             FROM experiment_assignment
             WHERE experiment_id = ? AND user_id = ?",
        )
        .bind(&experiment_id.0)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(assignment_from_row).transpose()
    }

    /// Single conditional write on the `(experiment_id, user_id)` key, then a
    /// read of whichever row won.
    async fn insert_or_read(
        &self,
        assignment: Assignment,
    ) -> Result<(Assignment, bool), RepositoryError> {
        let result = sqlx::query(
            "INSERT INTO experiment_assignment (experiment_id, user_id, variant_name, assigned_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(experiment_id, user_id) DO NOTHING",
        )
        .bind(&assignment.experiment_id.0)
        .bind(&assignment.user_id)
        .bind(&assignment.variant_name)
        .bind(format_timestamp(&assignment.assigned_at))
        .execute(&self.pool)
        .await?;
        let created = result.rows_affected() == 1;

        let persisted =
            self.fetch(&assignment.experiment_id, &assignment.user_id).await?.ok_or_else(|| {
                RepositoryError::Decode(format!(
                    "assignment {}/{} vanished after insert",
                    assignment.experiment_id, assignment.user_id
                ))
            })?;

        Ok((persisted, created))
    }
}

#[async_trait::async_trait]
impl AssignmentStore for SqlAssignmentRepository {
    async fn get(
        &self,
        experiment_id: &ExperimentId,
        user_id: &str,
    ) -> Result<Option<Assignment>, StoreError> {
        Ok(self.fetch(experiment_id, user_id).await?)
    }

    async fn insert_if_absent(
        &self,
        assignment: Assignment,
    ) -> Result<(Assignment, bool), StoreError> {
        Ok(self.insert_or_read(assignment).await?)
    }

    async fn list_for_experiment(
        &self,
        experiment_id: &ExperimentId,
        limit: u32,
    ) -> Result<Vec<Assignment>, StoreError> {
        let rows = sqlx::query(
            "SELECT experiment_id, user_id, variant_name, assigned_at
             FROM experiment_assignment
             WHERE experiment_id = ?
             ORDER BY assigned_at ASC, user_id ASC
             LIMIT ?",
        )
        .bind(&experiment_id.0)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(rows.into_iter().map(assignment_from_row).collect::<Result<Vec<_>, _>>()?)
    }
}

fn assignment_from_row(row: SqliteRow) -> Result<Assignment, RepositoryError> {
    Ok(Assignment {
        experiment_id: ExperimentId(row.try_get("experiment_id")?),
        user_id: row.try_get("user_id")?,
        variant_name: row.try_get("variant_name")?,
        assigned_at: parse_timestamp("assigned_at", row.try_get("assigned_at")?)?,
    })
}
