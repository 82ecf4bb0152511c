use std::collections::HashMap;

use tokio::sync::RwLock;

use pricewise_core::{
    Assignment, AssignmentStore, CatalogUpdate, EventLog, EventWindow, Experiment,
    ExperimentCatalog, ExperimentEvent, ExperimentId, ExperimentStatus, StoreError, Tenant,
    TenantId,
};

#[derive(Default)]
pub struct InMemoryExperimentCatalog {
    experiments: RwLock<HashMap<String, Experiment>>,
    tenants: RwLock<HashMap<String, Tenant>>,
}

impl InMemoryExperimentCatalog {
    pub async fn insert_tenant(&self, tenant: Tenant) {
        let mut tenants = self.tenants.write().await;
        tenants.insert(tenant.id.0.clone(), tenant);
    }
}

#[async_trait::async_trait]
impl ExperimentCatalog for InMemoryExperimentCatalog {
    async fn find_by_id(&self, id: &ExperimentId) -> Result<Option<Experiment>, StoreError> {
        let experiments = self.experiments.read().await;
        Ok(experiments.get(&id.0).cloned())
    }

    async fn find_by_key(
        &self,
        tenant_id: &TenantId,
        key: &str,
    ) -> Result<Option<Experiment>, StoreError> {
        let experiments = self.experiments.read().await;
        Ok(experiments
            .values()
            .find(|experiment| experiment.tenant_id == *tenant_id && experiment.key == key)
            .cloned())
    }

    async fn save(&self, experiment: Experiment) -> Result<(), StoreError> {
        let mut experiments = self.experiments.write().await;
        experiments.insert(experiment.id.0.clone(), experiment);
        Ok(())
    }

    /// Revision and quota checks run under the same write guard as the insert.
    async fn update(
        &self,
        experiment: &Experiment,
        enforce_active_quota: bool,
    ) -> Result<CatalogUpdate, StoreError> {
        let mut experiments = self.experiments.write().await;
        let stored_revision = match experiments.get(&experiment.id.0) {
            Some(stored) => stored.revision,
            None => return Ok(CatalogUpdate::Missing),
        };
        if stored_revision != experiment.revision {
            return Ok(CatalogUpdate::Stale);
        }

        if enforce_active_quota && experiment.status == ExperimentStatus::Active {
            let others_active = experiments
                .values()
                .filter(|other| {
                    other.id != experiment.id
                        && other.tenant_id == experiment.tenant_id
                        && other.status == ExperimentStatus::Active
                })
                .count();
            let others_active = u32::try_from(others_active)
                .map_err(|_| StoreError::Corrupt("active count overflow".to_string()))?;
            let tenants = self.tenants.read().await;
            let allowed = tenants
                .get(&experiment.tenant_id.0)
                .map(|tenant| tenant.allows_another_active(others_active))
                .unwrap_or(true);
            if !allowed {
                return Ok(CatalogUpdate::QuotaExceeded);
            }
        }

        let revision = stored_revision + 1;
        experiments.insert(experiment.id.0.clone(), Experiment { revision, ..experiment.clone() });
        Ok(CatalogUpdate::Applied { revision })
    }

    async fn find_tenant(&self, id: &TenantId) -> Result<Option<Tenant>, StoreError> {
        let tenants = self.tenants.read().await;
        Ok(tenants.get(&id.0).cloned())
    }

    async fn count_active_for_tenant(&self, tenant_id: &TenantId) -> Result<u32, StoreError> {
        let experiments = self.experiments.read().await;
        let active = experiments
            .values()
            .filter(|experiment| {
                experiment.tenant_id == *tenant_id && experiment.status == ExperimentStatus::Active
            })
            .count();
        u32::try_from(active).map_err(|_| StoreError::Corrupt("active count overflow".to_string()))
    }
}

/// Check-and-insert happens under one write guard, matching the atomicity of
/// the SQL conditional insert.
#[derive(Default)]
pub struct InMemoryAssignmentStore {
    assignments: RwLock<HashMap<(String, String), Assignment>>,
}

#[async_trait::async_trait]
impl AssignmentStore for InMemoryAssignmentStore {
    async fn get(
        &self,
        experiment_id: &ExperimentId,
        user_id: &str,
    ) -> Result<Option<Assignment>, StoreError> {
        let assignments = self.assignments.read().await;
        Ok(assignments.get(&(experiment_id.0.clone(), user_id.to_string())).cloned())
    }

    async fn insert_if_absent(
        &self,
        assignment: Assignment,
    ) -> Result<(Assignment, bool), StoreError> {
        let mut assignments = self.assignments.write().await;
        let key = (assignment.experiment_id.0.clone(), assignment.user_id.clone());
        if let Some(existing) = assignments.get(&key) {
            return Ok((existing.clone(), false));
        }
        assignments.insert(key, assignment.clone());
        Ok((assignment, true))
    }

    async fn list_for_experiment(
        &self,
        experiment_id: &ExperimentId,
        limit: u32,
    ) -> Result<Vec<Assignment>, StoreError> {
        let assignments = self.assignments.read().await;
        let mut listed: Vec<Assignment> = assignments
            .values()
            .filter(|assignment| assignment.experiment_id == *experiment_id)
            .cloned()
            .collect();
        listed.sort_by(|left, right| {
            left.assigned_at.cmp(&right.assigned_at).then_with(|| left.user_id.cmp(&right.user_id))
        });
        listed.truncate(limit as usize);
        Ok(listed)
    }
}

#[derive(Default)]
pub struct InMemoryEventLog {
    events: RwLock<Vec<ExperimentEvent>>,
}

impl InMemoryEventLog {
    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl EventLog for InMemoryEventLog {
    async fn append(&self, event: ExperimentEvent) -> Result<(), StoreError> {
        let mut events = self.events.write().await;
        events.push(event);
        Ok(())
    }

    async fn list_for_experiment(
        &self,
        experiment_id: &ExperimentId,
        window: EventWindow,
    ) -> Result<Vec<ExperimentEvent>, StoreError> {
        let events = self.events.read().await;
        Ok(events
            .iter()
            .rev()
            .filter(|event| event.experiment_id == *experiment_id)
            .filter(|event| window.since.map(|since| event.occurred_at >= since).unwrap_or(true))
            .take(window.limit as usize)
            .cloned()
            .collect())
    }
}
