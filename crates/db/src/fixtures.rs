use pricewise_core::chrono::{DateTime, Duration, TimeZone, Utc};
use pricewise_core::experiments::assign_variant;
use pricewise_core::{
    Assignment, AssignmentStore, Experiment, ExperimentId, ExperimentStatus, Tenant, TenantId,
    Variant,
};
use rust_decimal::Decimal;

use crate::connection::DbPool;
use crate::repositories::{
    format_timestamp, RepositoryError, SqlAssignmentRepository, SqlExperimentRepository,
};

const SEED_TENANT_ID: &str = "tenant-demo";
const ACTIVE_EXPERIMENT_ID: &str = "exp-demo-annual";
const ACTIVE_EXPERIMENT_KEY: &str = "annual-plan-price";
const DRAFT_EXPERIMENT_ID: &str = "exp-demo-monthly";
const DRAFT_EXPERIMENT_KEY: &str = "monthly-plan-price";
const SEED_USER_COUNT: usize = 24;
/// Every n-th seeded user converts at the listed price.
const CONVERSION_STRIDE: usize = 4;

/// Deterministic demo dataset: one tenant, an active two-variant experiment
/// with assignments and events, and a draft experiment with no traffic.
///
/// Loading twice leaves the database unchanged.
pub struct DemoSeedDataset;

impl DemoSeedDataset {
    pub async fn load(pool: &DbPool) -> Result<SeedResult, RepositoryError> {
        let experiments = SqlExperimentRepository::new(pool.clone());
        let assignments = SqlAssignmentRepository::new(pool.clone());

        experiments.save_tenant(&seed_tenant()).await?;
        let active = active_experiment();
        experiments.store(&active).await?;
        experiments.store(&draft_experiment()).await?;

        let mut conversions = 0;
        for index in 0..SEED_USER_COUNT {
            let user_id = seed_user(index);
            let variant_name = assign_variant(&active.id, &user_id, &active.variants)
                .map_err(|error| RepositoryError::Encode(error.to_string()))?;
            let assigned_at = seed_epoch() + Duration::minutes(index as i64);

            assignments
                .insert_if_absent(Assignment {
                    experiment_id: active.id.clone(),
                    user_id: user_id.clone(),
                    variant_name: variant_name.clone(),
                    assigned_at,
                })
                .await
                .map_err(|error| RepositoryError::Encode(error.to_string()))?;

            insert_seed_event(pool, &active.id, &user_id, &variant_name, "view", None, assigned_at)
                .await?;

            if index % CONVERSION_STRIDE == 0 {
                let price = active
                    .variants
                    .iter()
                    .find(|variant| variant.name == variant_name)
                    .map(|variant| variant.price)
                    .unwrap_or(Decimal::ZERO);
                insert_seed_event(
                    pool,
                    &active.id,
                    &user_id,
                    &variant_name,
                    "conversion",
                    Some(price),
                    assigned_at + Duration::seconds(30),
                )
                .await?;
                conversions += 1;
            }
        }

        Ok(SeedResult {
            tenant_id: TenantId(SEED_TENANT_ID.to_string()),
            experiment_id: active.id,
            experiment_key: ACTIVE_EXPERIMENT_KEY,
            draft_experiment_id: ExperimentId(DRAFT_EXPERIMENT_ID.to_string()),
            users_seeded: SEED_USER_COUNT,
            conversions_seeded: conversions,
        })
    }

    /// Verify that seed data exists and matches the contract.
    pub async fn verify(pool: &DbPool) -> Result<VerificationResult, RepositoryError> {
        let mut checks = Vec::new();

        let tenant_exists: i64 =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM tenant WHERE id = ?1)")
                .bind(SEED_TENANT_ID)
                .fetch_one(pool)
                .await?;
        checks.push(("tenant", tenant_exists == 1));

        let active_exists: i64 = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM experiment WHERE id = ?1 AND status = 'active')",
        )
        .bind(ACTIVE_EXPERIMENT_ID)
        .fetch_one(pool)
        .await?;
        checks.push(("active-experiment", active_exists == 1));

        let draft_exists: i64 = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM experiment WHERE id = ?1 AND status = 'draft')",
        )
        .bind(DRAFT_EXPERIMENT_ID)
        .fetch_one(pool)
        .await?;
        checks.push(("draft-experiment", draft_exists == 1));

        let variant_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(1) FROM experiment_variant WHERE experiment_id = ?1",
        )
        .bind(ACTIVE_EXPERIMENT_ID)
        .fetch_one(pool)
        .await?;
        checks.push(("active-variants", variant_count == 2));

        let assignment_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(1) FROM experiment_assignment WHERE experiment_id = ?1",
        )
        .bind(ACTIVE_EXPERIMENT_ID)
        .fetch_one(pool)
        .await?;
        checks.push(("assignments", assignment_count == SEED_USER_COUNT as i64));

        let view_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(1) FROM experiment_event WHERE experiment_id = ?1 AND kind = 'view'",
        )
        .bind(ACTIVE_EXPERIMENT_ID)
        .fetch_one(pool)
        .await?;
        checks.push(("view-events", view_count == SEED_USER_COUNT as i64));

        let conversion_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(1) FROM experiment_event
             WHERE experiment_id = ?1 AND kind = 'conversion' AND revenue IS NOT NULL",
        )
        .bind(ACTIVE_EXPERIMENT_ID)
        .fetch_one(pool)
        .await?;
        let expected_conversions = SEED_USER_COUNT.div_ceil(CONVERSION_STRIDE) as i64;
        checks.push(("conversion-events", conversion_count == expected_conversions));

        let draft_events: i64 =
            sqlx::query_scalar("SELECT COUNT(1) FROM experiment_event WHERE experiment_id = ?1")
                .bind(DRAFT_EXPERIMENT_ID)
                .fetch_one(pool)
                .await?;
        checks.push(("draft-has-no-events", draft_events == 0));

        let all_present = checks.iter().all(|(_, ok)| *ok);
        Ok(VerificationResult { all_present, checks })
    }
}

async fn insert_seed_event(
    pool: &DbPool,
    experiment_id: &ExperimentId,
    user_id: &str,
    variant_name: &str,
    kind: &str,
    revenue: Option<Decimal>,
    occurred_at: DateTime<Utc>,
) -> Result<(), RepositoryError> {
    sqlx::query(
        "INSERT OR IGNORE INTO experiment_event (
            id,
            experiment_id,
            user_id,
            variant_name,
            kind,
            revenue,
            occurred_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(format!("evt-seed-{kind}-{user_id}"))
    .bind(&experiment_id.0)
    .bind(user_id)
    .bind(variant_name)
    .bind(kind)
    .bind(revenue.map(|value| value.to_string()))
    .bind(format_timestamp(&occurred_at))
    .execute(pool)
    .await?;

    Ok(())
}

fn seed_epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).single().unwrap_or_else(Utc::now)
}

fn seed_user(index: usize) -> String {
    format!("demo-user-{index:03}")
}

fn seed_tenant() -> Tenant {
    Tenant {
        id: TenantId(SEED_TENANT_ID.to_string()),
        name: "Demo Storefront".to_string(),
        plan: "growth".to_string(),
        max_active_experiments: Some(5),
    }
}

fn active_experiment() -> Experiment {
    let created_at = seed_epoch() - Duration::days(1);
    Experiment {
        id: ExperimentId(ACTIVE_EXPERIMENT_ID.to_string()),
        tenant_id: TenantId(SEED_TENANT_ID.to_string()),
        key: ACTIVE_EXPERIMENT_KEY.to_string(),
        name: "Annual plan price".to_string(),
        description: Some("Control at 29.99 against a 39.99 annual price".to_string()),
        status: ExperimentStatus::Active,
        variants: vec![
            Variant::new("control", Decimal::new(2999, 2), 1.0),
            Variant::new("higher", Decimal::new(3999, 2), 1.0),
        ],
        target_sample_size: Some(1_000),
        starts_at: Some(seed_epoch()),
        ends_at: None,
        created_at,
        updated_at: created_at,
        revision: 0,
    }
}

fn draft_experiment() -> Experiment {
    let created_at = seed_epoch();
    Experiment {
        id: ExperimentId(DRAFT_EXPERIMENT_ID.to_string()),
        tenant_id: TenantId(SEED_TENANT_ID.to_string()),
        key: DRAFT_EXPERIMENT_KEY.to_string(),
        name: "Monthly plan price".to_string(),
        description: None,
        status: ExperimentStatus::Draft,
        variants: vec![
            Variant::new("control", Decimal::new(399, 2), 1.0),
            Variant::new("lower", Decimal::new(299, 2), 1.0),
        ],
        target_sample_size: None,
        starts_at: None,
        ends_at: None,
        created_at,
        updated_at: created_at,
        revision: 0,
    }
}

#[derive(Debug)]
pub struct SeedResult {
    pub tenant_id: TenantId,
    pub experiment_id: ExperimentId,
    pub experiment_key: &'static str,
    pub draft_experiment_id: ExperimentId,
    pub users_seeded: usize,
    pub conversions_seeded: usize,
}

#[derive(Debug)]
pub struct VerificationResult {
    pub all_present: bool,
    pub checks: Vec<(&'static str, bool)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{connect_with_settings, migrations};

    #[tokio::test]
    async fn verify_seed_contract_and_idempotency() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30)
            .await
            .expect("connect to test database");

        migrations::run_pending(&pool).await.expect("run migrations");

        let first = DemoSeedDataset::load(&pool).await.expect("load seed fixtures");
        let first_verification =
            DemoSeedDataset::verify(&pool).await.expect("verify seed fixtures");
        assert!(first_verification.all_present, "{:?}", first_verification.checks);
        assert_eq!(first.users_seeded, SEED_USER_COUNT);
        assert_eq!(first.conversions_seeded, 6);

        DemoSeedDataset::load(&pool).await.expect("reload seed fixtures");
        let second_verification =
            DemoSeedDataset::verify(&pool).await.expect("re-verify seed fixtures");
        assert!(second_verification.all_present);
        assert_eq!(first_verification.checks, second_verification.checks);
    }

    #[tokio::test]
    async fn seeded_conversions_record_the_listed_price() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30)
            .await
            .expect("connect to test database");
        migrations::run_pending(&pool).await.expect("run migrations");
        DemoSeedDataset::load(&pool).await.expect("load seed fixtures");

        let revenues: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT revenue FROM experiment_event WHERE kind = 'conversion' ORDER BY revenue",
        )
        .fetch_all(&pool)
        .await
        .expect("query revenues");
        assert!(!revenues.is_empty());
        assert!(revenues.iter().all(|revenue| revenue == "29.99" || revenue == "39.99"));
    }
}
