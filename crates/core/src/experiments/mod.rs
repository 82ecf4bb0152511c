pub mod assignment;
pub mod recommendation;
pub mod recorder;
pub mod service;
pub mod simulator;
pub mod stats;
pub mod store;

pub use assignment::{assign_variant, unit_interval_point};
pub use recommendation::{
    build_recommendation, expand_candidates, Objective, PriceBasis, PriceSimulation,
    PricingRecommendation, RecommendationEngine, RecommendationRequest,
};
pub use recorder::EventRecorder;
pub use service::{AssignedVariant, ConversionReceipt, ExperimentService, ServiceSettings};
pub use simulator::{estimate_conversion_rate, expected_revenue, ObservedPoint, PriceCurve};
pub use stats::{
    DebugResults, ExperimentResults, PercentDifference, ResultsQuery, ResultsSummary,
    StatisticsAggregator, VariantComparison, VariantMetrics,
};
pub use store::{
    get_or_create, AssignmentStore, Bounded, CatalogUpdate, EventLog, ExperimentCatalog,
};
