pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

use commands::recommend::RecommendArgs;
use commands::results::ResultsArgs;
use commands::{CommandResult, ExperimentTarget};

#[derive(Debug, Parser)]
#[command(
    name = "pricewise",
    about = "Pricewise operator CLI",
    long_about = "Run pricing experiments against the configured database: migrations, demo data, variant assignment, conversions, results and price recommendations.",
    after_help = "Examples:\n  pricewise seed\n  pricewise assign --experiment exp-demo-annual --user user-42\n  pricewise recommend --experiment annual-plan-price --tenant tenant-demo --objective conversion"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Load the deterministic demo tenant, experiments and traffic")]
    Seed,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, signal readiness, DB connectivity and schema")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Get or create the user's variant and record a view")]
    Assign {
        #[command(flatten)]
        target: ExperimentTarget,
        #[arg(long, help = "User identifier")]
        user: String,
    },
    #[command(about = "Record a conversion for an assigned user")]
    Convert {
        #[command(flatten)]
        target: ExperimentTarget,
        #[arg(long, help = "User identifier")]
        user: String,
        #[arg(long, help = "Revenue amount; defaults to the variant's listed price")]
        revenue: Option<f64>,
    },
    #[command(about = "Aggregate per-variant metrics for an experiment")]
    Results {
        #[command(flatten)]
        target: ExperimentTarget,
        #[command(flatten)]
        args: ResultsArgs,
    },
    #[command(about = "Simulate candidate prices and recommend one")]
    Recommend {
        #[command(flatten)]
        target: ExperimentTarget,
        #[command(flatten)]
        args: RecommendArgs,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Seed => commands::seed::run(),
        Command::Config => CommandResult { exit_code: 0, output: commands::config::run() },
        Command::Doctor { json } => {
            CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::Assign { target, user } => commands::assign::run(&target, &user),
        Command::Convert { target, user, revenue } => {
            commands::convert::run(&target, &user, revenue)
        }
        Command::Results { target, args } => commands::results::run(&target, &args),
        Command::Recommend { target, args } => commands::recommend::run(&target, &args),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}

#[cfg(test)]
mod tests {
    use clap::{CommandFactory, Parser};

    use super::{Cli, Command};

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn recommend_parses_comma_separated_candidates() {
        let cli = Cli::parse_from([
            "pricewise",
            "recommend",
            "--experiment",
            "exp-1",
            "--candidates",
            "19.99,24.5",
            "--objective",
            "conversion",
        ]);

        match cli.command {
            Command::Recommend { target, args } => {
                assert_eq!(target.experiment, "exp-1");
                assert_eq!(args.candidates, vec![19.99, 24.5]);
                assert_eq!(args.objective, "conversion");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn zero_scan_limits_are_rejected_at_parse_time() {
        for command in ["results", "recommend"] {
            let error = Cli::try_parse_from([
                "pricewise",
                command,
                "--experiment",
                "exp-1",
                "--limit",
                "0",
            ])
            .expect_err("a zero limit would scan nothing");
            assert_eq!(error.kind(), clap::error::ErrorKind::ValueValidation, "{command}");
        }

        let cli =
            Cli::parse_from(["pricewise", "results", "--experiment", "exp-1", "--limit", "1"]);
        match cli.command {
            Command::Results { args, .. } => assert_eq!(args.limit, Some(1)),
            other => panic!("unexpected command {other:?}"),
        }
    }
}
