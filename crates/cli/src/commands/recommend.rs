use clap::Args;
use pricewise_core::{EventWindow, Objective, PriceBasis, RecommendationRequest};

use crate::commands::{run_operation, CommandResult, ExperimentTarget, EXIT_CONFIG};

#[derive(Debug, Clone, Args)]
pub struct RecommendArgs {
    #[arg(long, default_value = "revenue", help = "revenue, conversion or profit")]
    pub objective: String,
    #[arg(
        long,
        value_delimiter = ',',
        allow_negative_numbers = true,
        help = "Candidate prices, comma separated"
    )]
    pub candidates: Vec<f64>,
    #[arg(long, default_value = "realized_arpu", help = "realized_arpu or configured_price")]
    pub basis: String,
    #[arg(
        long,
        value_parser = clap::value_parser!(u32).range(1..),
        help = "Maximum number of most recent events to scan"
    )]
    pub limit: Option<u32>,
}

impl Default for RecommendArgs {
    fn default() -> Self {
        Self {
            objective: Objective::default().as_str().to_string(),
            candidates: Vec::new(),
            basis: PriceBasis::default().as_str().to_string(),
            limit: None,
        }
    }
}

pub fn run(target: &ExperimentTarget, args: &RecommendArgs) -> CommandResult {
    let request = match build_request(args) {
        Ok(request) => request,
        Err(message) => {
            return CommandResult::failure("recommend", "invalid_argument", message, EXIT_CONFIG)
        }
    };
    let limit = args.limit;
    let reference = target.reference();

    run_operation("recommend", "pricing recommendation", move |service| async move {
        let window =
            limit.map(EventWindow::latest).unwrap_or_else(|| service.settings().default_window());
        service.recommend(&reference, &RecommendationRequest { window, ..request }).await
    })
}

fn build_request(args: &RecommendArgs) -> Result<RecommendationRequest, String> {
    let objective = Objective::parse(&args.objective)
        .ok_or_else(|| format!("unknown objective `{}`", args.objective))?;
    let price_basis = PriceBasis::parse(&args.basis)
        .ok_or_else(|| format!("unknown price basis `{}`", args.basis))?;
    let candidates = (!args.candidates.is_empty()).then(|| args.candidates.clone());

    Ok(RecommendationRequest {
        objective,
        candidates,
        price_basis,
        ..RecommendationRequest::default()
    })
}

#[cfg(test)]
mod tests {
    use pricewise_core::{Objective, PriceBasis};

    use super::{build_request, RecommendArgs};

    #[test]
    fn empty_candidate_list_means_use_variant_prices() {
        let request = build_request(&RecommendArgs::default()).expect("request");

        assert_eq!(request.objective, Objective::Revenue);
        assert_eq!(request.price_basis, PriceBasis::RealizedArpu);
        assert!(request.candidates.is_none());
    }

    #[test]
    fn unknown_objective_is_rejected() {
        let args = RecommendArgs { objective: "margin".to_string(), ..RecommendArgs::default() };

        assert_eq!(build_request(&args).unwrap_err(), "unknown objective `margin`");
    }
}
