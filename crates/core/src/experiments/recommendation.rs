use std::cmp::Ordering;

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::domain::event::EventWindow;
use crate::domain::experiment::{Experiment, ExperimentId};
use crate::errors::{ApplicationError, DomainError};
use crate::experiments::simulator::{expected_revenue, ObservedPoint, PriceCurve};
use crate::experiments::stats::{ExperimentResults, ResultsQuery, StatisticsAggregator};

/// Placeholder reported with every recommendation. It is not a statistical
/// confidence.
pub const PLACEHOLDER_CONFIDENCE: f64 = 0.5;

const PRICE_SCALE: u32 = 2;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Objective {
    #[default]
    Revenue,
    Conversion,
    /// Scored as revenue until a cost model exists.
    Profit,
}

impl Objective {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Revenue => "revenue",
            Self::Conversion => "conversion",
            Self::Profit => "profit",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "revenue" => Some(Self::Revenue),
            "conversion" => Some(Self::Conversion),
            "profit" => Some(Self::Profit),
            _ => None,
        }
    }

    fn score(&self, simulation: &PriceSimulation) -> f64 {
        match self {
            Self::Revenue | Self::Profit => simulation.expected_revenue,
            Self::Conversion => simulation.estimated_cv,
        }
    }
}

/// Which price an observed variant contributes to the price curve.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceBasis {
    #[default]
    RealizedArpu,
    ConfiguredPrice,
}

impl PriceBasis {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RealizedArpu => "realized_arpu",
            Self::ConfiguredPrice => "configured_price",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "realized_arpu" | "arpu" => Some(Self::RealizedArpu),
            "configured_price" | "configured" => Some(Self::ConfiguredPrice),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RecommendationRequest {
    pub objective: Objective,
    pub candidates: Option<Vec<f64>>,
    pub window: EventWindow,
    pub price_basis: PriceBasis,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PriceSimulation {
    pub price: Decimal,
    pub estimated_cv: f64,
    pub expected_revenue: f64,
    pub rank: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PricingRecommendation {
    pub experiment_id: ExperimentId,
    pub objective: Objective,
    pub best: PriceSimulation,
    pub simulations: Vec<PriceSimulation>,
    pub confidence: f64,
    pub uses_default_candidates: bool,
    pub uses_baseline_conversion: bool,
    pub assumed_traffic: u64,
    pub observed_points: Vec<ObservedPoint>,
}

pub fn round_price(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(PRICE_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Drops non-finite and negative values and rounds the rest to cents.
pub fn sanitize_candidates(raw: &[f64]) -> Vec<Decimal> {
    raw.iter()
        .filter(|value| value.is_finite() && **value >= 0.0)
        .filter_map(|value| Decimal::from_f64(*value))
        .map(round_price)
        .collect()
}

/// Adds `0.9 × p` and `1.1 × p` for every candidate, then dedups and sorts
/// ascending.
pub fn expand_candidates(candidates: &[Decimal]) -> Vec<Decimal> {
    let lower = Decimal::new(9, 1);
    let upper = Decimal::new(11, 1);

    let mut expanded: Vec<Decimal> = candidates
        .iter()
        .flat_map(|price| {
            [round_price(*price * lower), round_price(*price), round_price(*price * upper)]
        })
        .collect();
    expanded.sort();
    expanded.dedup();
    expanded
}

/// Builds curve inputs from aggregated metrics. Variants with no revenue are
/// skipped; they carry no price-response signal.
pub fn observed_points(
    experiment: &Experiment,
    results: &ExperimentResults,
    basis: PriceBasis,
) -> Vec<ObservedPoint> {
    experiment
        .variants
        .iter()
        .filter_map(|variant| {
            let metrics = results.per_variant.get(&variant.name)?;
            if metrics.revenue <= Decimal::ZERO || metrics.arpu <= Decimal::ZERO {
                return None;
            }
            let price = match basis {
                PriceBasis::RealizedArpu => metrics.arpu,
                PriceBasis::ConfiguredPrice => variant.price,
            };
            Some(ObservedPoint::new(price.to_f64()?, metrics.conversion_rate))
        })
        .collect()
}

/// Simulates every candidate and ranks by the objective score descending.
/// Ties go to the lower price.
pub fn simulate(
    candidates: &[Decimal],
    curve: &PriceCurve,
    assumed_traffic: u64,
    objective: Objective,
) -> Vec<PriceSimulation> {
    let mut simulations: Vec<PriceSimulation> = candidates
        .iter()
        .map(|price| {
            let numeric = price.to_f64().unwrap_or(0.0);
            let estimated_cv = curve.estimate(numeric);
            PriceSimulation {
                price: *price,
                estimated_cv,
                expected_revenue: expected_revenue(numeric, estimated_cv, assumed_traffic),
                rank: 0,
            }
        })
        .collect();

    simulations.sort_by(|left, right| {
        match objective.score(right).total_cmp(&objective.score(left)) {
            Ordering::Equal => left.price.cmp(&right.price),
            other => other,
        }
    });
    for (index, simulation) in simulations.iter_mut().enumerate() {
        simulation.rank = index as u32 + 1;
    }
    simulations
}

/// Pure recommendation over already-aggregated results.
pub fn build_recommendation(
    experiment: &Experiment,
    results: &ExperimentResults,
    request: &RecommendationRequest,
    default_candidates: &[Decimal],
) -> Result<PricingRecommendation, DomainError> {
    let requested = match &request.candidates {
        Some(raw) => sanitize_candidates(raw),
        None => experiment.variants.iter().map(|variant| round_price(variant.price)).collect(),
    };
    let uses_default_candidates = requested.is_empty();
    let base = if uses_default_candidates { default_candidates.to_vec() } else { requested };

    let candidates = expand_candidates(&base);
    if candidates.is_empty() {
        return Err(DomainError::Configuration("no candidate prices available".to_string()));
    }

    let points = observed_points(experiment, results, request.price_basis);
    let curve = PriceCurve::new(&points);
    let assumed_traffic = results.summary.total_views.max(1);
    let simulations = simulate(&candidates, &curve, assumed_traffic, request.objective);
    let best = simulations
        .first()
        .cloned()
        .ok_or_else(|| DomainError::Configuration("simulation produced no results".to_string()))?;

    Ok(PricingRecommendation {
        experiment_id: experiment.id.clone(),
        objective: request.objective,
        best,
        simulations,
        confidence: PLACEHOLDER_CONFIDENCE,
        uses_default_candidates,
        uses_baseline_conversion: curve.is_empty(),
        assumed_traffic,
        observed_points: curve.points().to_vec(),
    })
}

#[derive(Clone)]
pub struct RecommendationEngine {
    aggregator: StatisticsAggregator,
    default_candidates: Vec<Decimal>,
}

impl RecommendationEngine {
    pub fn new(aggregator: StatisticsAggregator, default_candidates: Vec<Decimal>) -> Self {
        Self { aggregator, default_candidates }
    }

    pub async fn recommend(
        &self,
        experiment: &Experiment,
        request: &RecommendationRequest,
    ) -> Result<PricingRecommendation, ApplicationError> {
        let query = ResultsQuery { window: request.window, ..ResultsQuery::default() };
        let results = self.aggregator.aggregate(experiment, &query).await?;
        let recommendation =
            build_recommendation(experiment, &results, request, &self.default_candidates)?;

        info!(
            event_name = "experiment.recommendation.generated",
            experiment_id = %experiment.id,
            objective = request.objective.as_str(),
            best_price = %recommendation.best.price,
            candidates = recommendation.simulations.len(),
            uses_default_candidates = recommendation.uses_default_candidates,
            uses_baseline_conversion = recommendation.uses_baseline_conversion,
            "pricing recommendation generated"
        );
        Ok(recommendation)
    }
}
