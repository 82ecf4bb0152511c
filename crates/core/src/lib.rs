pub mod config;
pub mod domain;
pub mod errors;
pub mod experiments;
pub mod signals;

pub use chrono;

pub use domain::assignment::Assignment;
pub use domain::event::{EventId, EventKind, EventWindow, ExperimentEvent};
pub use domain::experiment::{
    Experiment, ExperimentId, ExperimentRef, ExperimentStatus, NewExperiment, Variant,
};
pub use domain::tenant::{Tenant, TenantId};
pub use errors::{ApplicationError, DomainError, InterfaceError, StoreError};
pub use experiments::{
    AssignedVariant, AssignmentStore, CatalogUpdate, ConversionReceipt, EventLog,
    ExperimentCatalog, ExperimentService, Objective, PriceBasis, PricingRecommendation,
    RecommendationRequest, ResultsQuery, ServiceSettings,
};
pub use signals::{
    DispatchStats, DispatcherSettings, Signal, SignalDispatcher, SignalEmitter, SignalKind,
    SignalSink,
};
