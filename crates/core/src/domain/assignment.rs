use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::experiment::ExperimentId;

/// Immutable once persisted: one user, one experiment, one variant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub experiment_id: ExperimentId,
    pub user_id: String,
    pub variant_name: String,
    pub assigned_at: DateTime<Utc>,
}
