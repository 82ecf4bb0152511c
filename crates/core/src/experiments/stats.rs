use std::collections::BTreeMap;
use std::sync::Arc;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::assignment::Assignment;
use crate::domain::event::{EventKind, EventWindow, ExperimentEvent};
use crate::domain::experiment::{Experiment, ExperimentId};
use crate::errors::ApplicationError;
use crate::experiments::store::{AssignmentStore, EventLog};

const ARPU_SCALE: u32 = 4;

/// Derived per-variant figures. Rates are computed from the counts on every
/// aggregation and never persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VariantMetrics {
    pub views: u64,
    pub conversions: u64,
    pub revenue: Decimal,
    pub conversion_rate: f64,
    pub arpu: Decimal,
    pub revenue_per_visitor: Decimal,
}

impl VariantMetrics {
    pub fn from_counts(views: u64, conversions: u64, revenue: Decimal) -> Self {
        let conversion_rate =
            if views == 0 { 0.0 } else { conversions as f64 / views as f64 };
        let arpu = if conversions == 0 {
            Decimal::ZERO
        } else {
            (revenue / Decimal::from(conversions)).round_dp(ARPU_SCALE)
        };
        let revenue_per_visitor = if views == 0 {
            Decimal::ZERO
        } else {
            (revenue / Decimal::from(views)).round_dp(ARPU_SCALE)
        };

        Self { views, conversions, revenue, conversion_rate, arpu, revenue_per_visitor }
    }
}

impl Default for VariantMetrics {
    fn default() -> Self {
        Self::from_counts(0, 0, Decimal::ZERO)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PercentDifference {
    Defined(f64),
    Undefined,
}

impl PercentDifference {
    pub fn value(&self) -> Option<f64> {
        match self {
            Self::Defined(value) => Some(*value),
            Self::Undefined => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VariantComparison {
    pub control: String,
    pub treatment: String,
    pub conversion_rate_diff_pct: PercentDifference,
    pub revenue_per_visitor_diff_pct: PercentDifference,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultsSummary {
    pub total_views: u64,
    pub total_conversions: u64,
    pub total_revenue: Decimal,
    pub overall_conversion_rate: f64,
    pub events_scanned: usize,
    /// True when the scan hit the window limit and older events were skipped.
    /// Conversion rates are capped at 1.0 in that case.
    pub window_truncated: bool,
    pub comparison: Option<VariantComparison>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExperimentResults {
    pub experiment_id: ExperimentId,
    pub per_variant: BTreeMap<String, VariantMetrics>,
    pub summary: ResultsSummary,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultsQuery {
    pub window: EventWindow,
    pub control: Option<String>,
    pub treatment: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VariantDistribution {
    pub index: usize,
    pub variant_name: String,
    pub configured_weight_pct: f64,
    pub count: u64,
    pub percentage: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DebugResults {
    pub experiment_id: ExperimentId,
    pub total_assignments: u64,
    pub distribution: Vec<VariantDistribution>,
    /// Assignments naming a variant the experiment no longer lists.
    pub unmatched: u64,
    pub assignments: Vec<Assignment>,
}

/// Relative difference of `treatment` over `control`, in percent. Undefined
/// when either side has no views or the control value is zero.
pub fn percent_difference(
    control_views: u64,
    control_value: f64,
    treatment_views: u64,
    treatment_value: f64,
) -> PercentDifference {
    if control_views == 0 || treatment_views == 0 || control_value == 0.0 {
        return PercentDifference::Undefined;
    }

    let difference = (treatment_value - control_value) / control_value * 100.0;
    if difference.is_finite() {
        PercentDifference::Defined(difference)
    } else {
        PercentDifference::Undefined
    }
}

/// Folds recorded events into per-variant metrics. Every configured variant is
/// reported, including ones with no events yet.
pub fn aggregate_events(
    experiment: &Experiment,
    events: &[ExperimentEvent],
    query: &ResultsQuery,
) -> ExperimentResults {
    let mut counts: BTreeMap<String, (u64, u64, Decimal)> = experiment
        .variants
        .iter()
        .map(|variant| (variant.name.clone(), (0, 0, Decimal::ZERO)))
        .collect();

    for event in events.iter().filter(|event| event.experiment_id == experiment.id) {
        let entry = counts.entry(event.variant_name.clone()).or_insert((0, 0, Decimal::ZERO));
        match event.kind {
            EventKind::View => entry.0 += 1,
            EventKind::Conversion => {
                entry.1 += 1;
                entry.2 += event.revenue.unwrap_or(Decimal::ZERO);
            }
        }
    }

    // A newest-first window can cut a variant's views while keeping its later
    // conversions, so rates are capped at 1.0 once the limit is hit.
    let window_truncated = events.len() >= query.window.limit as usize;
    let cap_rate = |rate: f64| if window_truncated { rate.min(1.0) } else { rate };

    let per_variant: BTreeMap<String, VariantMetrics> = counts
        .into_iter()
        .map(|(name, (views, conversions, revenue))| {
            let mut metrics = VariantMetrics::from_counts(views, conversions, revenue);
            metrics.conversion_rate = cap_rate(metrics.conversion_rate);
            (name, metrics)
        })
        .collect();

    let total_views = per_variant.values().map(|metrics| metrics.views).sum::<u64>();
    let total_conversions = per_variant.values().map(|metrics| metrics.conversions).sum::<u64>();
    let total_revenue = per_variant.values().map(|metrics| metrics.revenue).sum::<Decimal>();
    let overall_conversion_rate = cap_rate(if total_views == 0 {
        0.0
    } else {
        total_conversions as f64 / total_views as f64
    });

    let comparison = resolve_pair(experiment, query)
        .map(|(control, treatment)| compare_variants(&per_variant, control, treatment));

    ExperimentResults {
        experiment_id: experiment.id.clone(),
        summary: ResultsSummary {
            total_views,
            total_conversions,
            total_revenue,
            overall_conversion_rate,
            events_scanned: events.len(),
            window_truncated,
            comparison,
        },
        per_variant,
    }
}

/// Histogram of persisted assignments by configured variant index.
pub fn assignment_distribution(
    experiment: &Experiment,
    assignments: Vec<Assignment>,
) -> DebugResults {
    let total_weight = experiment.total_weight();
    let mut counts = vec![0_u64; experiment.variants.len()];
    let mut unmatched = 0_u64;

    for assignment in &assignments {
        match experiment
            .variants
            .iter()
            .position(|variant| variant.name == assignment.variant_name)
        {
            Some(index) => counts[index] += 1,
            None => unmatched += 1,
        }
    }

    let total_assignments = assignments.len() as u64;
    let distribution = experiment
        .variants
        .iter()
        .zip(counts)
        .enumerate()
        .map(|(index, (variant, count))| VariantDistribution {
            index,
            variant_name: variant.name.clone(),
            configured_weight_pct: if total_weight > 0.0 {
                variant.weight / total_weight * 100.0
            } else {
                0.0
            },
            count,
            percentage: if total_assignments == 0 {
                0.0
            } else {
                count as f64 / total_assignments as f64 * 100.0
            },
        })
        .collect();

    DebugResults {
        experiment_id: experiment.id.clone(),
        total_assignments,
        distribution,
        unmatched,
        assignments,
    }
}

fn resolve_pair<'a>(
    experiment: &'a Experiment,
    query: &'a ResultsQuery,
) -> Option<(&'a str, &'a str)> {
    let control = match query.control.as_deref() {
        Some(name) => name,
        None => experiment
            .variant("control")
            .or_else(|| experiment.variants.first())
            .map(|variant| variant.name.as_str())?,
    };

    let treatment = match query.treatment.as_deref() {
        Some(name) => name,
        None => experiment
            .variants
            .iter()
            .map(|variant| variant.name.as_str())
            .find(|name| *name != control)?,
    };

    Some((control, treatment))
}

fn compare_variants(
    per_variant: &BTreeMap<String, VariantMetrics>,
    control: &str,
    treatment: &str,
) -> VariantComparison {
    let empty = VariantMetrics::default();
    let control_metrics = per_variant.get(control).unwrap_or(&empty);
    let treatment_metrics = per_variant.get(treatment).unwrap_or(&empty);

    VariantComparison {
        control: control.to_string(),
        treatment: treatment.to_string(),
        conversion_rate_diff_pct: percent_difference(
            control_metrics.views,
            control_metrics.conversion_rate,
            treatment_metrics.views,
            treatment_metrics.conversion_rate,
        ),
        revenue_per_visitor_diff_pct: percent_difference(
            control_metrics.views,
            control_metrics.revenue_per_visitor.to_f64().unwrap_or(0.0),
            treatment_metrics.views,
            treatment_metrics.revenue_per_visitor.to_f64().unwrap_or(0.0),
        ),
    }
}

/// Reads events and assignments for an experiment. Read-only and reentrant;
/// store failures propagate unchanged.
#[derive(Clone)]
pub struct StatisticsAggregator {
    events: Arc<dyn EventLog>,
    assignments: Arc<dyn AssignmentStore>,
}

impl StatisticsAggregator {
    pub fn new(events: Arc<dyn EventLog>, assignments: Arc<dyn AssignmentStore>) -> Self {
        Self { events, assignments }
    }

    pub async fn aggregate(
        &self,
        experiment: &Experiment,
        query: &ResultsQuery,
    ) -> Result<ExperimentResults, ApplicationError> {
        let events = self.events.list_for_experiment(&experiment.id, query.window).await?;
        let results = aggregate_events(experiment, &events, query);

        debug!(
            event_name = "experiment.results.aggregated",
            experiment_id = %experiment.id,
            events_scanned = results.summary.events_scanned,
            window_truncated = results.summary.window_truncated,
            "experiment results aggregated"
        );
        Ok(results)
    }

    pub async fn debug_view(
        &self,
        experiment: &Experiment,
        limit: u32,
    ) -> Result<DebugResults, ApplicationError> {
        let assignments = self.assignments.list_for_experiment(&experiment.id, limit).await?;
        Ok(assignment_distribution(experiment, assignments))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;

    use super::{
        aggregate_events, assignment_distribution, percent_difference, PercentDifference,
        ResultsQuery, VariantMetrics,
    };
    use crate::domain::assignment::Assignment;
    use crate::domain::event::{EventId, EventKind, EventWindow, ExperimentEvent};
    use crate::domain::experiment::{Experiment, ExperimentId, ExperimentStatus, Variant};
    use crate::domain::tenant::TenantId;

    fn experiment() -> Experiment {
        Experiment {
            id: ExperimentId("exp-stats".to_string()),
            tenant_id: TenantId("tenant-1".to_string()),
            key: "stats".to_string(),
            name: "Stats".to_string(),
            description: None,
            status: ExperimentStatus::Active,
            variants: vec![
                Variant::new("control", Decimal::new(2000, 2), 1.0),
                Variant::new("higher", Decimal::new(4000, 2), 1.0),
                Variant::new("proposed", Decimal::new(5000, 2), 0.0),
            ],
            target_sample_size: None,
            starts_at: None,
            ends_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            revision: 0,
        }
    }

    fn event(variant: &str, kind: EventKind, revenue: Option<Decimal>) -> ExperimentEvent {
        ExperimentEvent {
            id: EventId::generate(),
            experiment_id: ExperimentId("exp-stats".to_string()),
            user_id: "u".to_string(),
            variant_name: variant.to_string(),
            kind,
            revenue,
            occurred_at: Utc::now(),
        }
    }

    #[test]
    fn derived_metrics_guard_against_zero_denominators() {
        let empty = VariantMetrics::from_counts(0, 0, Decimal::ZERO);
        assert_eq!(empty.conversion_rate, 0.0);
        assert_eq!(empty.arpu, Decimal::ZERO);

        let metrics = VariantMetrics::from_counts(10, 2, Decimal::new(6000, 2));
        assert!((metrics.conversion_rate - 0.2).abs() < 1e-12);
        assert_eq!(metrics.arpu, Decimal::new(3000, 2));
        assert_eq!(metrics.revenue_per_visitor, Decimal::new(600, 2));
    }

    #[test]
    fn aggregates_counts_revenue_and_comparison() {
        let mut events = Vec::new();
        for _ in 0..10 {
            events.push(event("control", EventKind::View, None));
        }
        for _ in 0..2 {
            events.push(event("control", EventKind::Conversion, Some(Decimal::new(2000, 2))));
        }
        for _ in 0..10 {
            events.push(event("higher", EventKind::View, None));
        }
        events.push(event("higher", EventKind::Conversion, Some(Decimal::new(4000, 2))));

        let results = aggregate_events(&experiment(), &events, &ResultsQuery::default());

        let control = &results.per_variant["control"];
        assert_eq!((control.views, control.conversions), (10, 2));
        assert_eq!(control.revenue, Decimal::new(4000, 2));
        let higher = &results.per_variant["higher"];
        assert_eq!(higher.arpu, Decimal::new(4000, 2));
        assert_eq!(results.per_variant["proposed"], VariantMetrics::default());

        assert_eq!(results.summary.total_views, 20);
        assert_eq!(results.summary.total_conversions, 3);
        assert_eq!(results.summary.total_revenue, Decimal::new(8000, 2));
        assert!(!results.summary.window_truncated);

        let comparison = results.summary.comparison.expect("comparison");
        assert_eq!(comparison.control, "control");
        assert_eq!(comparison.treatment, "higher");
        let cv_diff = comparison.conversion_rate_diff_pct.value().expect("defined");
        assert!((cv_diff - (-50.0)).abs() < 1e-9);
        let rpv_diff = comparison.revenue_per_visitor_diff_pct.value().expect("defined");
        assert!(rpv_diff.abs() < 1e-9);
    }

    #[test]
    fn comparison_is_undefined_when_a_side_has_no_views() {
        let events = vec![event("control", EventKind::View, None)];
        let results = aggregate_events(&experiment(), &events, &ResultsQuery::default());
        let comparison = results.summary.comparison.expect("comparison");

        assert_eq!(comparison.conversion_rate_diff_pct, PercentDifference::Undefined);
        assert_eq!(comparison.revenue_per_visitor_diff_pct, PercentDifference::Undefined);
        assert_eq!(percent_difference(10, 0.0, 10, 0.1), PercentDifference::Undefined);
    }

    #[test]
    fn explicit_pair_and_truncation_flag_are_honoured() {
        let events = vec![
            event("higher", EventKind::View, None),
            event("proposed", EventKind::View, None),
        ];
        let query = ResultsQuery {
            window: EventWindow::latest(2),
            control: Some("higher".to_string()),
            treatment: Some("proposed".to_string()),
        };
        let results = aggregate_events(&experiment(), &events, &query);

        let comparison = results.summary.comparison.expect("comparison");
        assert_eq!(comparison.control, "higher");
        assert_eq!(comparison.treatment, "proposed");
        assert!(results.summary.window_truncated);
    }

    #[test]
    fn truncated_window_caps_conversion_rates() {
        // Newest first: the conversions survive the cut, most of their views do not.
        let events = vec![
            event("control", EventKind::Conversion, Some(Decimal::new(2000, 2))),
            event("control", EventKind::Conversion, Some(Decimal::new(2000, 2))),
            event("control", EventKind::Conversion, Some(Decimal::new(2000, 2))),
            event("control", EventKind::View, None),
        ];
        let query = ResultsQuery { window: EventWindow::latest(4), ..ResultsQuery::default() };

        let results = aggregate_events(&experiment(), &events, &query);

        assert!(results.summary.window_truncated);
        let control = &results.per_variant["control"];
        assert_eq!((control.views, control.conversions), (1, 3));
        assert_eq!(control.conversion_rate, 1.0);
        assert_eq!(results.summary.overall_conversion_rate, 1.0);

        let untruncated = aggregate_events(&experiment(), &events, &ResultsQuery::default());
        assert!(!untruncated.summary.window_truncated);
        assert_eq!(untruncated.per_variant["control"].conversion_rate, 3.0);
    }

    #[test]
    fn distribution_reports_percentages_by_variant_index() {
        let experiment = experiment();
        let assignment = |variant: &str| Assignment {
            experiment_id: experiment.id.clone(),
            user_id: format!("u-{variant}"),
            variant_name: variant.to_string(),
            assigned_at: Utc::now(),
        };
        let debug = assignment_distribution(
            &experiment,
            vec![
                assignment("control"),
                assignment("control"),
                assignment("higher"),
                assignment("retired"),
            ],
        );

        assert_eq!(debug.total_assignments, 4);
        assert_eq!(debug.unmatched, 1);
        assert_eq!(debug.distribution[0].index, 0);
        assert_eq!(debug.distribution[0].count, 2);
        assert!((debug.distribution[0].percentage - 50.0).abs() < 1e-9);
        assert!((debug.distribution[0].configured_weight_pct - 50.0).abs() < 1e-9);
        assert_eq!(debug.distribution[2].count, 0);
        assert_eq!(debug.distribution[2].configured_weight_pct, 0.0);
    }
}
