use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(pub String);

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Plan and quota fields are read, never managed, by the experiment engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    pub plan: String,
    pub max_active_experiments: Option<u32>,
}

impl Tenant {
    pub fn allows_another_active(&self, currently_active: u32) -> bool {
        self.max_active_experiments.map(|limit| currently_active < limit).unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::{Tenant, TenantId};

    #[test]
    fn quota_is_unbounded_when_not_configured() {
        let tenant = Tenant {
            id: TenantId("t-1".to_string()),
            name: "Acme".to_string(),
            plan: "free".to_string(),
            max_active_experiments: None,
        };
        assert!(tenant.allows_another_active(10_000));

        let limited = Tenant { max_active_experiments: Some(2), ..tenant };
        assert!(limited.allows_another_active(1));
        assert!(!limited.allows_another_active(2));
    }
}
