//! Storage seams consumed by the experiment engine.
//!
//! Implementations live outside the core (`pricewise-db`). Each method is a
//! single call against the backing store; bounded timeouts are applied by the
//! caller.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::warn;

use crate::domain::assignment::Assignment;
use crate::domain::event::{EventWindow, ExperimentEvent};
use crate::domain::experiment::{Experiment, ExperimentId};
use crate::domain::tenant::{Tenant, TenantId};
use crate::errors::{DomainError, StoreError};

#[async_trait]
pub trait ExperimentCatalog: Send + Sync {
    async fn find_by_id(&self, id: &ExperimentId) -> Result<Option<Experiment>, StoreError>;

    async fn find_by_key(
        &self,
        tenant_id: &TenantId,
        key: &str,
    ) -> Result<Option<Experiment>, StoreError>;

    /// Unconditional upsert, used when an experiment is first created.
    async fn save(&self, experiment: Experiment) -> Result<(), StoreError>;

    /// Compare-and-swap write of an experiment read earlier from the catalog.
    /// Applies only while the stored revision equals `experiment.revision`,
    /// and bumps it. With `enforce_active_quota`, an active write is refused
    /// once the tenant already holds `max_active_experiments` other active
    /// experiments. Both checks and the write are one atomic step.
    async fn update(
        &self,
        experiment: &Experiment,
        enforce_active_quota: bool,
    ) -> Result<CatalogUpdate, StoreError>;

    async fn find_tenant(&self, id: &TenantId) -> Result<Option<Tenant>, StoreError>;

    async fn count_active_for_tenant(&self, tenant_id: &TenantId) -> Result<u32, StoreError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CatalogUpdate {
    /// Written; carries the new stored revision.
    Applied { revision: u64 },
    /// The stored revision moved on since the experiment was read.
    Stale,
    QuotaExceeded,
    Missing,
}

#[async_trait]
pub trait AssignmentStore: Send + Sync {
    async fn get(
        &self,
        experiment_id: &ExperimentId,
        user_id: &str,
    ) -> Result<Option<Assignment>, StoreError>;

    /// Atomic conditional insert keyed by `(experiment_id, user_id)`. Returns
    /// the assignment that ended up persisted and whether this call created it.
    /// When a concurrent writer won, the winner's row is returned unchanged.
    async fn insert_if_absent(
        &self,
        assignment: Assignment,
    ) -> Result<(Assignment, bool), StoreError>;

    async fn list_for_experiment(
        &self,
        experiment_id: &ExperimentId,
        limit: u32,
    ) -> Result<Vec<Assignment>, StoreError>;
}

#[async_trait]
pub trait EventLog: Send + Sync {
    async fn append(&self, event: ExperimentEvent) -> Result<(), StoreError>;

    /// Newest-first scan bounded by `window`.
    async fn list_for_experiment(
        &self,
        experiment_id: &ExperimentId,
        window: EventWindow,
    ) -> Result<Vec<ExperimentEvent>, StoreError>;
}

#[derive(Debug)]
pub enum GetOrCreateError {
    Store(StoreError),
    Compute(DomainError),
}

impl From<StoreError> for GetOrCreateError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

/// Get-or-create built on the store's conditional insert. `compute` only runs
/// when no assignment exists yet; if two callers race, both computations may
/// run but exactly one result is persisted and both callers observe it.
pub async fn get_or_create<F>(
    store: &dyn AssignmentStore,
    experiment_id: &ExperimentId,
    user_id: &str,
    compute: F,
) -> Result<(Assignment, bool), GetOrCreateError>
where
    F: FnOnce() -> Result<String, DomainError> + Send,
{
    if let Some(existing) = store.get(experiment_id, user_id).await? {
        return Ok((existing, false));
    }

    let variant_name = compute().map_err(GetOrCreateError::Compute)?;
    let candidate = Assignment {
        experiment_id: experiment_id.clone(),
        user_id: user_id.to_string(),
        variant_name,
        assigned_at: Utc::now(),
    };

    Ok(store.insert_if_absent(candidate).await?)
}

/// Applies a fixed timeout to every call on the wrapped store. A call that
/// exceeds it fails with [`StoreError::Timeout`]; the in-flight future is
/// dropped.
pub struct Bounded<T: ?Sized> {
    inner: Arc<T>,
    timeout: Duration,
}

impl<T: ?Sized> Bounded<T> {
    pub fn new(inner: Arc<T>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn run<R, Fut>(&self, operation: &'static str, future: Fut) -> Result<R, StoreError>
    where
        Fut: Future<Output = Result<R, StoreError>> + Send,
    {
        match tokio::time::timeout(self.timeout, future).await {
            Ok(result) => result,
            Err(_) => {
                let timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
                warn!(
                    event_name = "experiment.store.timeout",
                    operation,
                    timeout_ms,
                    "store call exceeded its timeout"
                );
                Err(StoreError::Timeout { operation, timeout_ms })
            }
        }
    }
}

#[async_trait]
impl<T: ExperimentCatalog + ?Sized> ExperimentCatalog for Bounded<T> {
    async fn find_by_id(&self, id: &ExperimentId) -> Result<Option<Experiment>, StoreError> {
        self.run("experiment.find_by_id", self.inner.find_by_id(id)).await
    }

    async fn find_by_key(
        &self,
        tenant_id: &TenantId,
        key: &str,
    ) -> Result<Option<Experiment>, StoreError> {
        self.run("experiment.find_by_key", self.inner.find_by_key(tenant_id, key)).await
    }

    async fn save(&self, experiment: Experiment) -> Result<(), StoreError> {
        self.run("experiment.save", self.inner.save(experiment)).await
    }

    async fn update(
        &self,
        experiment: &Experiment,
        enforce_active_quota: bool,
    ) -> Result<CatalogUpdate, StoreError> {
        self.run("experiment.update", self.inner.update(experiment, enforce_active_quota)).await
    }

    async fn find_tenant(&self, id: &TenantId) -> Result<Option<Tenant>, StoreError> {
        self.run("tenant.find", self.inner.find_tenant(id)).await
    }

    async fn count_active_for_tenant(&self, tenant_id: &TenantId) -> Result<u32, StoreError> {
        self.run("experiment.count_active", self.inner.count_active_for_tenant(tenant_id)).await
    }
}

#[async_trait]
impl<T: AssignmentStore + ?Sized> AssignmentStore for Bounded<T> {
    async fn get(
        &self,
        experiment_id: &ExperimentId,
        user_id: &str,
    ) -> Result<Option<Assignment>, StoreError> {
        self.run("assignment.get", self.inner.get(experiment_id, user_id)).await
    }

    async fn insert_if_absent(
        &self,
        assignment: Assignment,
    ) -> Result<(Assignment, bool), StoreError> {
        self.run("assignment.insert_if_absent", self.inner.insert_if_absent(assignment)).await
    }

    async fn list_for_experiment(
        &self,
        experiment_id: &ExperimentId,
        limit: u32,
    ) -> Result<Vec<Assignment>, StoreError> {
        self.run("assignment.list", self.inner.list_for_experiment(experiment_id, limit)).await
    }
}

#[async_trait]
impl<T: EventLog + ?Sized> EventLog for Bounded<T> {
    async fn append(&self, event: ExperimentEvent) -> Result<(), StoreError> {
        self.run("event.append", self.inner.append(event)).await
    }

    async fn list_for_experiment(
        &self,
        experiment_id: &ExperimentId,
        window: EventWindow,
    ) -> Result<Vec<ExperimentEvent>, StoreError> {
        self.run("event.list", self.inner.list_for_experiment(experiment_id, window)).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;

    use super::{get_or_create, AssignmentStore, Bounded, GetOrCreateError};
    use crate::domain::assignment::Assignment;
    use crate::domain::experiment::ExperimentId;
    use crate::errors::{DomainError, StoreError};

    struct SlowStore;

    #[async_trait]
    impl AssignmentStore for SlowStore {
        async fn get(
            &self,
            _experiment_id: &ExperimentId,
            _user_id: &str,
        ) -> Result<Option<Assignment>, StoreError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(None)
        }

        async fn insert_if_absent(
            &self,
            assignment: Assignment,
        ) -> Result<(Assignment, bool), StoreError> {
            Ok((assignment, true))
        }

        async fn list_for_experiment(
            &self,
            _experiment_id: &ExperimentId,
            _limit: u32,
        ) -> Result<Vec<Assignment>, StoreError> {
            Ok(Vec::new())
        }
    }

    struct PreassignedStore;

    #[async_trait]
    impl AssignmentStore for PreassignedStore {
        async fn get(
            &self,
            experiment_id: &ExperimentId,
            user_id: &str,
        ) -> Result<Option<Assignment>, StoreError> {
            Ok(Some(Assignment {
                experiment_id: experiment_id.clone(),
                user_id: user_id.to_string(),
                variant_name: "control".to_string(),
                assigned_at: Utc::now(),
            }))
        }

        async fn insert_if_absent(
            &self,
            _assignment: Assignment,
        ) -> Result<(Assignment, bool), StoreError> {
            Err(StoreError::Unavailable("insert must not be reached".to_string()))
        }

        async fn list_for_experiment(
            &self,
            _experiment_id: &ExperimentId,
            _limit: u32,
        ) -> Result<Vec<Assignment>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn bounded_store_times_out_instead_of_hanging() {
        let store = Bounded::new(Arc::new(SlowStore), Duration::from_millis(20));
        let error = store
            .get(&ExperimentId("exp-1".to_string()), "u-1")
            .await
            .expect_err("slow call must time out");

        assert_eq!(error, StoreError::Timeout { operation: "assignment.get", timeout_ms: 20 });
    }

    #[tokio::test]
    async fn get_or_create_skips_compute_when_assignment_exists() {
        let calls = AtomicUsize::new(0);
        let (assignment, created) = get_or_create(
            &PreassignedStore,
            &ExperimentId("exp-1".to_string()),
            "u-1",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok("treatment".to_string())
            },
        )
        .await
        .expect("existing assignment");

        assert!(!created);
        assert_eq!(assignment.variant_name, "control");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn get_or_create_surfaces_compute_failure() {
        struct EmptyStore;

        #[async_trait]
        impl AssignmentStore for EmptyStore {
            async fn get(
                &self,
                _experiment_id: &ExperimentId,
                _user_id: &str,
            ) -> Result<Option<Assignment>, StoreError> {
                Ok(None)
            }

            async fn insert_if_absent(
                &self,
                _assignment: Assignment,
            ) -> Result<(Assignment, bool), StoreError> {
                Err(StoreError::Unavailable("insert must not be reached".to_string()))
            }

            async fn list_for_experiment(
                &self,
                _experiment_id: &ExperimentId,
                _limit: u32,
            ) -> Result<Vec<Assignment>, StoreError> {
                Ok(Vec::new())
            }
        }

        let result = get_or_create(&EmptyStore, &ExperimentId("exp-1".to_string()), "u-1", || {
            Err(DomainError::Configuration("no variants".to_string()))
        })
        .await;

        assert!(matches!(result, Err(GetOrCreateError::Compute(DomainError::Configuration(_)))));
    }
}
