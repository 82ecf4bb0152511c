use std::sync::Arc;

use chrono::Utc;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use tracing::debug;

use crate::domain::event::{EventId, EventKind, ExperimentEvent};
use crate::domain::experiment::ExperimentId;
use crate::errors::{ApplicationError, DomainError};
use crate::experiments::store::EventLog;

/// Appends view and conversion events. Nothing is written when validation
/// fails.
#[derive(Clone)]
pub struct EventRecorder {
    log: Arc<dyn EventLog>,
}

impl EventRecorder {
    pub fn new(log: Arc<dyn EventLog>) -> Self {
        Self { log }
    }

    pub async fn record_view(
        &self,
        experiment_id: &ExperimentId,
        user_id: &str,
        variant_name: &str,
    ) -> Result<ExperimentEvent, ApplicationError> {
        let event = build_event(experiment_id, user_id, variant_name, EventKind::View, None)?;
        self.log.append(event.clone()).await?;
        debug!(
            event_name = "experiment.event.view_recorded",
            experiment_id = %experiment_id,
            variant = variant_name,
            "view event recorded"
        );
        Ok(event)
    }

    pub async fn record_conversion(
        &self,
        experiment_id: &ExperimentId,
        user_id: &str,
        variant_name: &str,
        revenue: Decimal,
    ) -> Result<ExperimentEvent, ApplicationError> {
        if revenue < Decimal::ZERO {
            return Err(DomainError::validation(format!(
                "conversion revenue must be >= 0, got {revenue}"
            ))
            .into());
        }

        let event = build_event(
            experiment_id,
            user_id,
            variant_name,
            EventKind::Conversion,
            Some(revenue),
        )?;
        self.log.append(event.clone()).await?;
        debug!(
            event_name = "experiment.event.conversion_recorded",
            experiment_id = %experiment_id,
            variant = variant_name,
            revenue = %revenue,
            "conversion event recorded"
        );
        Ok(event)
    }
}

/// Converts a caller-supplied amount into revenue, rejecting NaN, infinities
/// and negative values.
pub fn revenue_from_f64(value: f64) -> Result<Decimal, DomainError> {
    if !value.is_finite() {
        return Err(DomainError::validation(format!("revenue must be finite, got {value}")));
    }
    if value < 0.0 {
        return Err(DomainError::validation(format!("revenue must be >= 0, got {value}")));
    }
    Decimal::from_f64(value)
        .map(|revenue| revenue.normalize())
        .ok_or_else(|| DomainError::validation(format!("revenue {value} is out of range")))
}

fn build_event(
    experiment_id: &ExperimentId,
    user_id: &str,
    variant_name: &str,
    kind: EventKind,
    revenue: Option<Decimal>,
) -> Result<ExperimentEvent, DomainError> {
    if user_id.trim().is_empty() {
        return Err(DomainError::validation("user id cannot be empty"));
    }
    if variant_name.trim().is_empty() {
        return Err(DomainError::validation("variant name cannot be empty"));
    }

    Ok(ExperimentEvent {
        id: EventId::generate(),
        experiment_id: experiment_id.clone(),
        user_id: user_id.to_string(),
        variant_name: variant_name.to_string(),
        kind,
        revenue,
        occurred_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use rust_decimal::Decimal;

    use super::{revenue_from_f64, EventRecorder};
    use crate::domain::event::{EventKind, EventWindow, ExperimentEvent};
    use crate::domain::experiment::ExperimentId;
    use crate::errors::{ApplicationError, DomainError, StoreError};
    use crate::experiments::store::EventLog;

    #[derive(Default)]
    struct RecordingLog {
        events: Mutex<Vec<ExperimentEvent>>,
    }

    #[async_trait]
    impl EventLog for RecordingLog {
        async fn append(&self, event: ExperimentEvent) -> Result<(), StoreError> {
            self.events.lock().expect("lock events").push(event);
            Ok(())
        }

        async fn list_for_experiment(
            &self,
            _experiment_id: &ExperimentId,
            _window: EventWindow,
        ) -> Result<Vec<ExperimentEvent>, StoreError> {
            Ok(self.events.lock().expect("lock events").clone())
        }
    }

    fn experiment_id() -> ExperimentId {
        ExperimentId("exp-1".to_string())
    }

    #[tokio::test]
    async fn records_view_and_conversion_with_copied_variant() {
        let log = Arc::new(RecordingLog::default());
        let recorder = EventRecorder::new(log.clone());

        recorder.record_view(&experiment_id(), "u-1", "control").await.expect("view");
        recorder
            .record_conversion(&experiment_id(), "u-1", "control", Decimal::new(2999, 2))
            .await
            .expect("conversion");

        let events = log.events.lock().expect("lock").clone();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::View);
        assert_eq!(events[0].revenue, None);
        assert_eq!(events[1].kind, EventKind::Conversion);
        assert_eq!(events[1].variant_name, "control");
        assert_eq!(events[1].revenue, Some(Decimal::new(2999, 2)));
    }

    #[tokio::test]
    async fn negative_revenue_is_rejected_and_not_recorded() {
        let log = Arc::new(RecordingLog::default());
        let recorder = EventRecorder::new(log.clone());

        let error = recorder
            .record_conversion(&experiment_id(), "u-1", "control", Decimal::new(-1, 0))
            .await
            .expect_err("negative revenue must fail");

        assert!(matches!(error, ApplicationError::Domain(DomainError::Validation(_))));
        assert!(log.events.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn blank_user_is_rejected() {
        let log = Arc::new(RecordingLog::default());
        let recorder = EventRecorder::new(log.clone());

        assert!(recorder.record_view(&experiment_id(), "  ", "control").await.is_err());
        assert!(log.events.lock().expect("lock").is_empty());
    }

    #[test]
    fn revenue_from_f64_rejects_non_finite_and_negative() {
        assert!(revenue_from_f64(f64::NAN).is_err());
        assert!(revenue_from_f64(f64::INFINITY).is_err());
        assert!(revenue_from_f64(-0.01).is_err());
        assert_eq!(revenue_from_f64(0.0).expect("zero"), Decimal::ZERO);
        assert_eq!(revenue_from_f64(29.99).expect("price"), Decimal::new(2999, 2));
    }
}
