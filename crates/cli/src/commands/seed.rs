use serde::Serialize;

use crate::commands::{build_runtime, load_config, CommandResult, EXIT_DATABASE, EXIT_MIGRATION};
use pricewise_db::{connect, migrations, DemoSeedDataset};

const EXIT_SEED: u8 = 6;

#[derive(Debug, Serialize)]
struct SeedSummary {
    tenant_id: String,
    experiment_id: String,
    experiment_key: &'static str,
    draft_experiment_id: String,
    users_seeded: usize,
    conversions_seeded: usize,
}

pub fn run() -> CommandResult {
    let config = match load_config("seed") {
        Ok(config) => config,
        Err(result) => return result,
    };
    let runtime = match build_runtime("seed") {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };

    let result = runtime.block_on(async {
        let pool = connect(&config.database)
            .await
            .map_err(|error| ("db_connectivity", error.to_string(), EXIT_DATABASE))?;

        migrations::run_pending(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), EXIT_MIGRATION))?;

        let seeded = DemoSeedDataset::load(&pool)
            .await
            .map_err(|error| ("seed_execution", error.to_string(), EXIT_SEED))?;

        let verification = DemoSeedDataset::verify(&pool)
            .await
            .map_err(|error| ("seed_verification", error.to_string(), EXIT_SEED))?;

        let run_result = if verification.all_present {
            Ok(SeedSummary {
                tenant_id: seeded.tenant_id.0,
                experiment_id: seeded.experiment_id.0,
                experiment_key: seeded.experiment_key,
                draft_experiment_id: seeded.draft_experiment_id.0,
                users_seeded: seeded.users_seeded,
                conversions_seeded: seeded.conversions_seeded,
            })
        } else {
            Err(("seed_verification", failed_checks_message(&verification.checks), EXIT_SEED))
        };

        pool.close().await;
        run_result
    });

    match result {
        Ok(summary) => CommandResult::success_with_data(
            "seed",
            format!(
                "demo dataset loaded: experiment {} with {} users",
                summary.experiment_id, summary.users_seeded
            ),
            summary,
        ),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("seed", error_class, message, exit_code)
        }
    }
}

fn failed_checks_message(checks: &[(&'static str, bool)]) -> String {
    let failed_checks = checks
        .iter()
        .filter_map(|(check, passed)| (!passed).then_some(*check))
        .collect::<Vec<_>>();
    if failed_checks.is_empty() {
        "Some seed data failed to load".to_string()
    } else {
        format!("Seed verification failed for checks: {}", failed_checks.join(", "))
    }
}
