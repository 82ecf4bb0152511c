use std::collections::BTreeMap;

use pricewise_core::chrono::Utc;
use pricewise_core::{
    CatalogUpdate, Experiment, ExperimentCatalog, ExperimentId, ExperimentStatus, StoreError,
    Tenant, TenantId, Variant,
};
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection};

use super::{
    format_timestamp, parse_decimal, parse_optional_timestamp, parse_timestamp, parse_u32,
    RepositoryError,
};
use crate::DbPool;

const EXPERIMENT_COLUMNS: &str = "id,
                tenant_id,
                experiment_key,
                name,
                description,
                status,
                target_sample_size,
                starts_at,
                ends_at,
                created_at,
                updated_at,
                revision";

pub struct SqlExperimentRepository {
    pool: DbPool,
}

impl SqlExperimentRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn save_tenant(&self, tenant: &Tenant) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO tenant (id, name, plan, max_active_experiments, created_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                plan = excluded.plan,
                max_active_experiments = excluded.max_active_experiments",
        )
        .bind(&tenant.id.0)
        .bind(&tenant.name)
        .bind(&tenant.plan)
        .bind(tenant.max_active_experiments.map(i64::from))
        .bind(format_timestamp(&Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn load_tenant(&self, id: &TenantId) -> Result<Option<Tenant>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, name, plan, max_active_experiments FROM tenant WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(tenant_from_row).transpose()
    }

    pub async fn load_by_id(
        &self,
        id: &ExperimentId,
    ) -> Result<Option<Experiment>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {EXPERIMENT_COLUMNS} FROM experiment WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(self.hydrate(row).await?)),
            None => Ok(None),
        }
    }

    pub async fn load_by_key(
        &self,
        tenant_id: &TenantId,
        key: &str,
    ) -> Result<Option<Experiment>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {EXPERIMENT_COLUMNS} FROM experiment WHERE tenant_id = ? AND experiment_key = ?"
        ))
        .bind(&tenant_id.0)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.hydrate(row).await?)),
            None => Ok(None),
        }
    }

    /// Upserts the experiment row and replaces its variant set in one
    /// transaction.
    pub async fn store(&self, experiment: &Experiment) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO experiment (
                id,
                tenant_id,
                experiment_key,
                name,
                description,
                status,
                target_sample_size,
                starts_at,
                ends_at,
                created_at,
                updated_at,
                revision
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                experiment_key = excluded.experiment_key,
                name = excluded.name,
                description = excluded.description,
                status = excluded.status,
                target_sample_size = excluded.target_sample_size,
                starts_at = excluded.starts_at,
                ends_at = excluded.ends_at,
                updated_at = excluded.updated_at,
                revision = excluded.revision",
        )
        .bind(&experiment.id.0)
        .bind(&experiment.tenant_id.0)
        .bind(&experiment.key)
        .bind(&experiment.name)
        .bind(experiment.description.as_deref())
        .bind(experiment.status.as_str())
        .bind(experiment.target_sample_size.map(i64::from))
        .bind(experiment.starts_at.as_ref().map(format_timestamp))
        .bind(experiment.ends_at.as_ref().map(format_timestamp))
        .bind(format_timestamp(&experiment.created_at))
        .bind(format_timestamp(&experiment.updated_at))
        .bind(revision_to_i64(experiment.revision)?)
        .execute(&mut *tx)
        .await?;

        replace_variants(&mut *tx, experiment).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Guarded write. The first statement is the conditional UPDATE, so the
    /// transaction holds SQLite's write lock from the moment the revision and
    /// quota are checked until the variant set is replaced.
    pub async fn update_guarded(
        &self,
        experiment: &Experiment,
        enforce_active_quota: bool,
    ) -> Result<CatalogUpdate, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let expected_revision = revision_to_i64(experiment.revision)?;

        let applied = sqlx::query(
            "UPDATE experiment SET
                experiment_key = ?1,
                name = ?2,
                description = ?3,
                status = ?4,
                target_sample_size = ?5,
                starts_at = ?6,
                ends_at = ?7,
                updated_at = ?8,
                revision = revision + 1
             WHERE id = ?9
               AND revision = ?10
               AND (
                    ?11 = 0
                    OR ?4 != 'active'
                    OR (SELECT max_active_experiments FROM tenant WHERE id = experiment.tenant_id)
                        IS NULL
                    OR (SELECT COUNT(1) FROM experiment other
                        WHERE other.tenant_id = experiment.tenant_id
                          AND other.status = 'active'
                          AND other.id != experiment.id)
                        < (SELECT max_active_experiments FROM tenant
                           WHERE id = experiment.tenant_id)
               )",
        )
        .bind(&experiment.key)
        .bind(&experiment.name)
        .bind(experiment.description.as_deref())
        .bind(experiment.status.as_str())
        .bind(experiment.target_sample_size.map(i64::from))
        .bind(experiment.starts_at.as_ref().map(format_timestamp))
        .bind(experiment.ends_at.as_ref().map(format_timestamp))
        .bind(format_timestamp(&experiment.updated_at))
        .bind(&experiment.id.0)
        .bind(expected_revision)
        .bind(i64::from(enforce_active_quota))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if applied == 0 {
            let stored: Option<i64> =
                sqlx::query_scalar("SELECT revision FROM experiment WHERE id = ?")
                    .bind(&experiment.id.0)
                    .fetch_optional(&mut *tx)
                    .await?;
            tx.rollback().await?;
            return Ok(match stored {
                None => CatalogUpdate::Missing,
                Some(revision) if revision != expected_revision => CatalogUpdate::Stale,
                Some(_) => CatalogUpdate::QuotaExceeded,
            });
        }

        replace_variants(&mut *tx, experiment).await?;
        tx.commit().await?;
        Ok(CatalogUpdate::Applied { revision: experiment.revision + 1 })
    }

    async fn hydrate(&self, row: SqliteRow) -> Result<Experiment, RepositoryError> {
        let id: String = row.try_get("id")?;
        let variant_rows = sqlx::query(
            "SELECT name, price, weight, metadata_json
             FROM experiment_variant
             WHERE experiment_id = ?
             ORDER BY position ASC",
        )
        .bind(&id)
        .fetch_all(&self.pool)
        .await?;

        let variants =
            variant_rows.into_iter().map(variant_from_row).collect::<Result<Vec<_>, _>>()?;
        experiment_from_row(row, variants)
    }
}

#[async_trait::async_trait]
impl ExperimentCatalog for SqlExperimentRepository {
    async fn find_by_id(&self, id: &ExperimentId) -> Result<Option<Experiment>, StoreError> {
        Ok(self.load_by_id(id).await?)
    }

    async fn find_by_key(
        &self,
        tenant_id: &TenantId,
        key: &str,
    ) -> Result<Option<Experiment>, StoreError> {
        Ok(self.load_by_key(tenant_id, key).await?)
    }

    async fn save(&self, experiment: Experiment) -> Result<(), StoreError> {
        Ok(self.store(&experiment).await?)
    }

    async fn update(
        &self,
        experiment: &Experiment,
        enforce_active_quota: bool,
    ) -> Result<CatalogUpdate, StoreError> {
        Ok(self.update_guarded(experiment, enforce_active_quota).await?)
    }

    async fn find_tenant(&self, id: &TenantId) -> Result<Option<Tenant>, StoreError> {
        Ok(self.load_tenant(id).await?)
    }

    async fn count_active_for_tenant(&self, tenant_id: &TenantId) -> Result<u32, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(1) FROM experiment WHERE tenant_id = ? AND status = 'active'",
        )
        .bind(&tenant_id.0)
        .fetch_one(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(parse_u32("active_count", count)?)
    }
}

async fn replace_variants(
    connection: &mut SqliteConnection,
    experiment: &Experiment,
) -> Result<(), RepositoryError> {
    sqlx::query("DELETE FROM experiment_variant WHERE experiment_id = ?")
        .bind(&experiment.id.0)
        .execute(&mut *connection)
        .await?;

    for (position, variant) in experiment.variants.iter().enumerate() {
        let metadata_json = serde_json::to_string(&variant.metadata)
            .map_err(|error| RepositoryError::Encode(error.to_string()))?;
        sqlx::query(
            "INSERT INTO experiment_variant (
                experiment_id,
                position,
                name,
                price,
                weight,
                metadata_json
             ) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&experiment.id.0)
        .bind(position as i64)
        .bind(&variant.name)
        .bind(variant.price.to_string())
        .bind(variant.weight)
        .bind(metadata_json)
        .execute(&mut *connection)
        .await?;
    }

    Ok(())
}

fn revision_to_i64(revision: u64) -> Result<i64, RepositoryError> {
    i64::try_from(revision)
        .map_err(|_| RepositoryError::Encode(format!("revision {revision} exceeds i64")))
}

fn experiment_from_row(
    row: SqliteRow,
    variants: Vec<Variant>,
) -> Result<Experiment, RepositoryError> {
    let status_raw: String = row.try_get("status")?;
    let status = ExperimentStatus::parse(&status_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown experiment status `{status_raw}`"))
    })?;
    let target_sample_size = row
        .try_get::<Option<i64>, _>("target_sample_size")?
        .map(|value| parse_u32("target_sample_size", value))
        .transpose()?;
    let revision: i64 = row.try_get("revision")?;

    Ok(Experiment {
        id: ExperimentId(row.try_get("id")?),
        tenant_id: TenantId(row.try_get("tenant_id")?),
        key: row.try_get("experiment_key")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        status,
        variants,
        target_sample_size,
        starts_at: parse_optional_timestamp("starts_at", row.try_get("starts_at")?)?,
        ends_at: parse_optional_timestamp("ends_at", row.try_get("ends_at")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
        revision: u64::try_from(revision).map_err(|_| {
            RepositoryError::Decode(format!("negative experiment revision `{revision}`"))
        })?,
    })
}

fn variant_from_row(row: SqliteRow) -> Result<Variant, RepositoryError> {
    let price_raw: String = row.try_get("price")?;
    let metadata_json: String = row.try_get("metadata_json")?;
    let metadata: BTreeMap<String, String> = serde_json::from_str(&metadata_json)
        .map_err(|error| RepositoryError::Decode(error.to_string()))?;

    Ok(Variant {
        name: row.try_get("name")?,
        price: parse_decimal("price", &price_raw)?,
        weight: row.try_get("weight")?,
        metadata,
    })
}

fn tenant_from_row(row: SqliteRow) -> Result<Tenant, RepositoryError> {
    let max_active_experiments = row
        .try_get::<Option<i64>, _>("max_active_experiments")?
        .map(|value| parse_u32("max_active_experiments", value))
        .transpose()?;

    Ok(Tenant {
        id: TenantId(row.try_get("id")?),
        name: row.try_get("name")?,
        plan: row.try_get("plan")?,
        max_active_experiments,
    })
}
