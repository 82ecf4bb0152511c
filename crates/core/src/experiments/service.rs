//! The four external experiment operations plus lifecycle management.
//!
//! Every store call goes through [`Bounded`] so a slow backend surfaces as
//! `UpstreamUnavailable` instead of hanging the request. Signals are handed to
//! the dispatcher after the primary write succeeds and can never fail the
//! operation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ExperimentsConfig;
use crate::domain::event::EventWindow;
use crate::domain::experiment::{
    Experiment, ExperimentId, ExperimentRef, ExperimentStatus, NewExperiment,
};
use crate::errors::{ApplicationError, DomainError};
use crate::experiments::assignment::assign_variant;
use crate::experiments::recommendation::{
    sanitize_candidates, PricingRecommendation, RecommendationEngine, RecommendationRequest,
};
use crate::experiments::recorder::{revenue_from_f64, EventRecorder};
use crate::experiments::stats::{
    DebugResults, ExperimentResults, ResultsQuery, StatisticsAggregator,
};
use crate::experiments::store::{
    get_or_create, AssignmentStore, Bounded, CatalogUpdate, EventLog, ExperimentCatalog,
    GetOrCreateError,
};
use crate::signals::{Signal, SignalEmitter, SignalKind};

/// Compare-and-swap rounds before a contended lifecycle edit gives up.
const MAX_UPDATE_ATTEMPTS: u32 = 16;

#[derive(Clone, Debug, PartialEq)]
pub struct ServiceSettings {
    pub store_timeout: Duration,
    pub default_event_limit: u32,
    pub debug_assignment_limit: u32,
    pub default_candidates: Vec<Decimal>,
}

impl ServiceSettings {
    pub fn from_config(config: &ExperimentsConfig) -> Self {
        Self {
            store_timeout: config.store_timeout(),
            default_event_limit: config.default_event_limit,
            debug_assignment_limit: config.debug_assignment_limit,
            default_candidates: sanitize_candidates(&config.default_candidates),
        }
    }

    pub fn default_window(&self) -> EventWindow {
        EventWindow::latest(self.default_event_limit)
    }
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_millis(2_000),
            default_event_limit: EventWindow::DEFAULT_LIMIT,
            debug_assignment_limit: 1_000,
            default_candidates: vec![Decimal::new(1999, 2), Decimal::new(2999, 2)],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignedVariant {
    pub experiment_id: ExperimentId,
    pub variant: String,
    pub price: Decimal,
    pub newly_assigned: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionReceipt {
    pub experiment_id: ExperimentId,
    pub variant: String,
    pub revenue: Decimal,
    /// True when the caller omitted revenue and the variant's listed price was
    /// recorded instead.
    pub revenue_from_list_price: bool,
}

#[derive(Clone)]
pub struct ExperimentService {
    catalog: Arc<dyn ExperimentCatalog>,
    assignments: Arc<dyn AssignmentStore>,
    recorder: EventRecorder,
    aggregator: StatisticsAggregator,
    engine: RecommendationEngine,
    signals: Option<SignalEmitter>,
    settings: ServiceSettings,
}

impl ExperimentService {
    pub fn new(
        catalog: Arc<dyn ExperimentCatalog>,
        assignments: Arc<dyn AssignmentStore>,
        events: Arc<dyn EventLog>,
        settings: ServiceSettings,
    ) -> Self {
        let timeout = settings.store_timeout;
        let catalog: Arc<dyn ExperimentCatalog> = Arc::new(Bounded::new(catalog, timeout));
        let assignments: Arc<dyn AssignmentStore> = Arc::new(Bounded::new(assignments, timeout));
        let events: Arc<dyn EventLog> = Arc::new(Bounded::new(events, timeout));

        let aggregator = StatisticsAggregator::new(events.clone(), assignments.clone());
        let engine =
            RecommendationEngine::new(aggregator.clone(), settings.default_candidates.clone());

        Self {
            catalog,
            assignments,
            recorder: EventRecorder::new(events),
            aggregator,
            engine,
            signals: None,
            settings,
        }
    }

    pub fn with_signals(mut self, emitter: SignalEmitter) -> Self {
        self.signals = Some(emitter);
        self
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    pub async fn find_experiment(
        &self,
        reference: &ExperimentRef,
    ) -> Result<Experiment, ApplicationError> {
        let found = match reference {
            ExperimentRef::Id(id) => self.catalog.find_by_id(id).await?,
            ExperimentRef::Key { tenant_id, key } => {
                self.catalog.find_by_key(tenant_id, key).await?
            }
        };
        found.ok_or_else(|| DomainError::not_found("experiment", reference.to_string()).into())
    }

    /// Returns the user's variant, creating the assignment on first contact,
    /// and records a view event.
    pub async fn get_or_assign_variant(
        &self,
        reference: &ExperimentRef,
        user_id: &str,
    ) -> Result<AssignedVariant, ApplicationError> {
        let user_id = require_user_id(user_id)?;
        let experiment = self.find_experiment(reference).await?;

        if experiment.status != ExperimentStatus::Active {
            warn!(
                event_name = "experiment.assignment.inactive_status",
                experiment_id = %experiment.id,
                status = experiment.status.as_str(),
                "assigning variant for an experiment that is not active"
            );
        }

        let (assignment, created) = get_or_create(
            self.assignments.as_ref(),
            &experiment.id,
            user_id,
            || assign_variant(&experiment.id, user_id, &experiment.variants),
        )
        .await
        .map_err(|error| match error {
            GetOrCreateError::Store(store) => ApplicationError::from(store),
            GetOrCreateError::Compute(domain) => ApplicationError::from(domain),
        })?;

        let variant = experiment.variant(&assignment.variant_name).ok_or_else(|| {
            DomainError::Configuration(format!(
                "assigned variant `{}` is no longer configured on experiment {}",
                assignment.variant_name, experiment.id
            ))
        })?;

        if created {
            info!(
                event_name = "experiment.assignment.created",
                experiment_id = %experiment.id,
                variant = %variant.name,
                "new assignment persisted"
            );
            self.emit(Signal::new(
                SignalKind::AssignmentCreated,
                experiment.tenant_id.clone(),
                experiment.id.clone(),
                user_id,
                variant.name.clone(),
                variant.price,
                None,
            ));
        }

        // The assignment signal never depends on the view append succeeding.
        self.recorder.record_view(&experiment.id, user_id, &variant.name).await?;

        Ok(AssignedVariant {
            experiment_id: experiment.id.clone(),
            variant: variant.name.clone(),
            price: variant.price,
            newly_assigned: created,
        })
    }

    /// Records a conversion for an existing assignment. Omitted revenue falls
    /// back to the assigned variant's current listed price.
    pub async fn record_conversion(
        &self,
        reference: &ExperimentRef,
        user_id: &str,
        revenue: Option<f64>,
    ) -> Result<ConversionReceipt, ApplicationError> {
        let user_id = require_user_id(user_id)?;
        let experiment = self.find_experiment(reference).await?;
        let explicit_revenue = revenue.map(revenue_from_f64).transpose()?;

        let assignment =
            self.assignments.get(&experiment.id, user_id).await?.ok_or_else(|| {
                DomainError::not_found("assignment", format!("{}/{user_id}", experiment.id))
            })?;

        let (revenue, revenue_from_list_price) = match explicit_revenue {
            Some(amount) => (amount, false),
            None => {
                let variant = experiment.variant(&assignment.variant_name).ok_or_else(|| {
                    DomainError::Configuration(format!(
                        "assigned variant `{}` has no listed price",
                        assignment.variant_name
                    ))
                })?;
                (variant.price, true)
            }
        };

        self.recorder
            .record_conversion(&experiment.id, user_id, &assignment.variant_name, revenue)
            .await?;

        info!(
            event_name = "experiment.conversion.recorded",
            experiment_id = %experiment.id,
            variant = %assignment.variant_name,
            revenue = %revenue,
            revenue_from_list_price,
            "conversion recorded"
        );

        let price = experiment
            .variant(&assignment.variant_name)
            .map(|variant| variant.price)
            .unwrap_or(revenue);
        self.emit(Signal::new(
            SignalKind::ConversionRecorded,
            experiment.tenant_id.clone(),
            experiment.id.clone(),
            user_id,
            assignment.variant_name.clone(),
            price,
            Some(revenue),
        ));

        Ok(ConversionReceipt {
            experiment_id: experiment.id,
            variant: assignment.variant_name,
            revenue,
            revenue_from_list_price,
        })
    }

    pub async fn get_results(
        &self,
        reference: &ExperimentRef,
        query: &ResultsQuery,
    ) -> Result<ExperimentResults, ApplicationError> {
        let experiment = self.find_experiment(reference).await?;
        self.aggregator.aggregate(&experiment, query).await
    }

    pub async fn debug_results(
        &self,
        reference: &ExperimentRef,
        limit: Option<u32>,
    ) -> Result<DebugResults, ApplicationError> {
        let experiment = self.find_experiment(reference).await?;
        let limit = limit.unwrap_or(self.settings.debug_assignment_limit);
        self.aggregator.debug_view(&experiment, limit).await
    }

    pub async fn recommend(
        &self,
        reference: &ExperimentRef,
        request: &RecommendationRequest,
    ) -> Result<PricingRecommendation, ApplicationError> {
        let experiment = self.find_experiment(reference).await?;
        self.engine.recommend(&experiment, request).await
    }

    pub async fn create_experiment(
        &self,
        input: NewExperiment,
    ) -> Result<Experiment, ApplicationError> {
        self.catalog
            .find_tenant(&input.tenant_id)
            .await?
            .ok_or_else(|| DomainError::not_found("tenant", input.tenant_id.to_string()))?;

        let experiment = Experiment::create(input, Utc::now())?;
        if self.catalog.find_by_key(&experiment.tenant_id, &experiment.key).await?.is_some() {
            return Err(DomainError::validation(format!(
                "experiment key `{}` already exists for tenant {}",
                experiment.key, experiment.tenant_id
            ))
            .into());
        }

        self.catalog.save(experiment.clone()).await?;
        info!(
            event_name = "experiment.created",
            experiment_id = %experiment.id,
            tenant_id = %experiment.tenant_id,
            variants = experiment.variants.len(),
            "experiment created"
        );
        Ok(experiment)
    }

    pub async fn transition_status(
        &self,
        reference: &ExperimentRef,
        next: ExperimentStatus,
    ) -> Result<Experiment, ApplicationError> {
        let mut previous = None;
        let experiment = self
            .update_experiment(reference, next == ExperimentStatus::Active, |experiment| {
                previous = Some(experiment.status);
                experiment.transition_to(next, Utc::now())
            })
            .await?;

        info!(
            event_name = "experiment.status.changed",
            experiment_id = %experiment.id,
            from = previous.map(|status| status.as_str()).unwrap_or("unknown"),
            to = next.as_str(),
            "experiment status changed"
        );
        Ok(experiment)
    }

    pub async fn propose_variant(
        &self,
        reference: &ExperimentRef,
        name: &str,
        price: Decimal,
        metadata: BTreeMap<String, String>,
    ) -> Result<Experiment, ApplicationError> {
        let experiment = self
            .update_experiment(reference, false, |experiment| {
                experiment.propose_variant(name, price, metadata.clone(), Utc::now()).map(|_| ())
            })
            .await?;

        info!(
            event_name = "experiment.variant.proposed",
            experiment_id = %experiment.id,
            variant = name.trim(),
            price = %price,
            "zero-weight variant proposed"
        );
        Ok(experiment)
    }

    pub async fn set_variant_weight(
        &self,
        reference: &ExperimentRef,
        name: &str,
        weight: f64,
    ) -> Result<Experiment, ApplicationError> {
        let experiment = self
            .update_experiment(reference, false, |experiment| {
                experiment.set_variant_weight(name, weight, Utc::now())
            })
            .await?;

        info!(
            event_name = "experiment.variant.reweighted",
            experiment_id = %experiment.id,
            variant = name,
            weight,
            "variant weight updated"
        );
        Ok(experiment)
    }

    /// Read, change, compare-and-swap. A stale read is re-read and the change
    /// reapplied, so concurrent edits to one experiment never overwrite each
    /// other.
    async fn update_experiment<F>(
        &self,
        reference: &ExperimentRef,
        enforce_active_quota: bool,
        mut change: F,
    ) -> Result<Experiment, ApplicationError>
    where
        F: FnMut(&mut Experiment) -> Result<(), DomainError>,
    {
        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let mut experiment = self.find_experiment(reference).await?;
            change(&mut experiment)?;

            match self.catalog.update(&experiment, enforce_active_quota).await? {
                CatalogUpdate::Applied { revision } => {
                    experiment.revision = revision;
                    return Ok(experiment);
                }
                CatalogUpdate::Stale => {
                    debug!(
                        event_name = "experiment.update.stale",
                        experiment_id = %experiment.id,
                        attempt,
                        "experiment changed concurrently; retrying"
                    );
                }
                CatalogUpdate::QuotaExceeded => {
                    let limit = self
                        .catalog
                        .find_tenant(&experiment.tenant_id)
                        .await?
                        .and_then(|tenant| tenant.max_active_experiments)
                        .unwrap_or_default();
                    return Err(DomainError::validation(format!(
                        "tenant {} has reached its limit of {limit} active experiments",
                        experiment.tenant_id
                    ))
                    .into());
                }
                CatalogUpdate::Missing => {
                    return Err(DomainError::not_found("experiment", reference.to_string()).into());
                }
            }
        }

        warn!(
            event_name = "experiment.update.contended",
            experiment = %reference,
            attempts = MAX_UPDATE_ATTEMPTS,
            "experiment update kept losing to concurrent writers"
        );
        Err(ApplicationError::UpstreamUnavailable(format!(
            "experiment {reference} kept changing concurrently; retry the request"
        )))
    }

    fn emit(&self, signal: Signal) {
        if let Some(emitter) = &self.signals {
            emitter.emit(signal);
        }
    }
}

fn require_user_id(user_id: &str) -> Result<&str, DomainError> {
    let trimmed = user_id.trim();
    if trimmed.is_empty() {
        return Err(DomainError::validation("user id cannot be empty"));
    }
    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rust_decimal::Decimal;

    use super::{require_user_id, ServiceSettings};
    use crate::config::ExperimentsConfig;
    use crate::errors::DomainError;

    #[test]
    fn settings_sanitize_configured_candidates() {
        let settings = ServiceSettings::from_config(&ExperimentsConfig {
            store_timeout_ms: 300,
            default_event_limit: 10,
            debug_assignment_limit: 5,
            default_candidates: vec![9.999, 15.0],
        });

        assert_eq!(settings.store_timeout, Duration::from_millis(300));
        assert_eq!(settings.default_candidates, vec![Decimal::new(1000, 2), Decimal::new(1500, 2)]);
        assert_eq!(settings.default_window().limit, 10);
    }

    #[test]
    fn blank_user_ids_are_rejected() {
        assert!(matches!(require_user_id("   "), Err(DomainError::Validation(_))));
        assert_eq!(require_user_id(" user-1 ").ok(), Some("user-1"));
    }
}
