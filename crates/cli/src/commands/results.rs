use clap::Args;
use pricewise_core::chrono::{DateTime, Utc};
use pricewise_core::{EventWindow, ResultsQuery};

use crate::commands::{run_operation, CommandResult, ExperimentTarget, EXIT_CONFIG};

#[derive(Debug, Clone, Default, Args)]
pub struct ResultsArgs {
    #[arg(
        long,
        value_parser = clap::value_parser!(u32).range(1..),
        help = "Maximum number of most recent events or assignments to scan"
    )]
    pub limit: Option<u32>,
    #[arg(long, help = "Only count events at or after this RFC 3339 timestamp")]
    pub since: Option<String>,
    #[arg(long, help = "Variant used as the comparison baseline")]
    pub control: Option<String>,
    #[arg(long, help = "Variant compared against the control")]
    pub treatment: Option<String>,
    #[arg(long, help = "Return the assignment distribution instead of event metrics")]
    pub debug: bool,
}

pub fn run(target: &ExperimentTarget, args: &ResultsArgs) -> CommandResult {
    let reference = target.reference();

    if args.debug {
        let limit = args.limit;
        return run_operation("results", "assignment distribution", move |service| async move {
            service.debug_results(&reference, limit).await
        });
    }

    let since = match args.since.as_deref().map(parse_since).transpose() {
        Ok(since) => since,
        Err(message) => {
            return CommandResult::failure("results", "invalid_argument", message, EXIT_CONFIG)
        }
    };
    let control = args.control.clone();
    let treatment = args.treatment.clone();
    let limit = args.limit;

    run_operation("results", "experiment results", move |service| async move {
        let mut window =
            limit.map(EventWindow::latest).unwrap_or_else(|| service.settings().default_window());
        window.since = since;
        let query = ResultsQuery { window, control, treatment };
        service.get_results(&reference, &query).await
    })
}

fn parse_since(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|error| format!("--since must be an RFC 3339 timestamp: {error}"))
}

#[cfg(test)]
mod tests {
    use super::parse_since;

    #[test]
    fn since_accepts_offsets_and_rejects_garbage() {
        let parsed = parse_since("2026-01-05T10:00:00+01:00").expect("timestamp");
        assert_eq!(parsed.to_rfc3339(), "2026-01-05T09:00:00+00:00");
        assert!(parse_since("yesterday").is_err());
    }
}
