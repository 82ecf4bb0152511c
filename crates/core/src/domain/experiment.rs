use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::tenant::TenantId;
use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExperimentId(pub String);

impl ExperimentId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for ExperimentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies an experiment either globally or by its tenant-scoped key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentRef {
    Id(ExperimentId),
    Key { tenant_id: TenantId, key: String },
}

impl ExperimentRef {
    pub fn id(id: impl Into<String>) -> Self {
        Self::Id(ExperimentId(id.into()))
    }

    pub fn key(tenant_id: impl Into<String>, key: impl Into<String>) -> Self {
        Self::Key { tenant_id: TenantId(tenant_id.into()), key: key.into() }
    }
}

impl fmt::Display for ExperimentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::Key { tenant_id, key } => write!(f, "{tenant_id}/{key}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Draft,
    Active,
    Paused,
    Completed,
}

impl ExperimentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "draft" => Some(Self::Draft),
            "active" => Some(Self::Active),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    pub fn can_transition_to(self, next: ExperimentStatus) -> bool {
        matches!(
            (self, next),
            (Self::Draft, Self::Active)
                | (Self::Active, Self::Paused)
                | (Self::Paused, Self::Active)
                | (Self::Active, Self::Completed)
                | (Self::Paused, Self::Completed)
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub name: String,
    pub price: Decimal,
    /// Relative sampling weight. Zero means observable but never sampled.
    pub weight: f64,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Variant {
    pub fn new(name: impl Into<String>, price: Decimal, weight: f64) -> Self {
        Self { name: name.into(), price, weight, metadata: BTreeMap::new() }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewExperiment {
    pub tenant_id: TenantId,
    pub key: String,
    pub name: String,
    pub description: Option<String>,
    pub variants: Vec<Variant>,
    pub target_sample_size: Option<u32>,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: ExperimentId,
    pub tenant_id: TenantId,
    pub key: String,
    pub name: String,
    pub description: Option<String>,
    pub status: ExperimentStatus,
    pub variants: Vec<Variant>,
    pub target_sample_size: Option<u32>,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Catalog revision this copy was read at. Guarded updates only apply
    /// while the stored revision still matches.
    #[serde(default)]
    pub revision: u64,
}

impl Experiment {
    pub fn create(input: NewExperiment, now: DateTime<Utc>) -> Result<Self, DomainError> {
        let experiment = Self {
            id: ExperimentId::generate(),
            tenant_id: input.tenant_id,
            key: input.key.trim().to_string(),
            name: input.name.trim().to_string(),
            description: input.description,
            status: ExperimentStatus::Draft,
            variants: input
                .variants
                .into_iter()
                .map(|variant| Variant { name: variant.name.trim().to_string(), ..variant })
                .collect(),
            target_sample_size: input.target_sample_size,
            starts_at: input.starts_at,
            ends_at: input.ends_at,
            created_at: now,
            updated_at: now,
            revision: 0,
        };

        if experiment.variants.len() < 2 {
            return Err(DomainError::validation("an experiment needs at least 2 variants"));
        }
        experiment.validate()?;
        Ok(experiment)
    }

    pub fn variant(&self, name: &str) -> Option<&Variant> {
        self.variants.iter().find(|variant| variant.name == name)
    }

    pub fn total_weight(&self) -> f64 {
        self.variants.iter().map(|variant| variant.weight).sum()
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if self.key.is_empty() {
            return Err(DomainError::validation("experiment key cannot be empty"));
        }
        if self.name.is_empty() {
            return Err(DomainError::validation("experiment name cannot be empty"));
        }
        if self.tenant_id.0.trim().is_empty() {
            return Err(DomainError::validation("experiment tenant id cannot be empty"));
        }
        if self.target_sample_size == Some(0) {
            return Err(DomainError::validation("target_sample_size must be greater than zero"));
        }
        if let (Some(starts_at), Some(ends_at)) = (self.starts_at, self.ends_at) {
            if ends_at <= starts_at {
                return Err(DomainError::validation("ends_at must be after starts_at"));
            }
        }

        let mut seen = BTreeSet::new();
        for variant in &self.variants {
            validate_variant(variant)?;
            if !seen.insert(variant.name.as_str()) {
                return Err(DomainError::validation(format!(
                    "duplicate variant name `{}`",
                    variant.name
                )));
            }
        }

        if self.status != ExperimentStatus::Draft && self.variants.len() < 2 {
            return Err(DomainError::validation(
                "a non-draft experiment needs at least 2 variants",
            ));
        }

        Ok(())
    }

    /// Applies a lifecycle transition, stamping `starts_at` on first activation
    /// and `ends_at` on completion when they were not scheduled explicitly.
    pub fn transition_to(
        &mut self,
        next: ExperimentStatus,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::InvalidStatusTransition { from: self.status, to: next });
        }

        if next == ExperimentStatus::Active {
            if self.variants.len() < 2 {
                return Err(DomainError::validation("activation requires at least 2 variants"));
            }
            if self.total_weight() <= 0.0 {
                return Err(DomainError::Configuration(
                    "activation requires a positive total variant weight".to_string(),
                ));
            }
            if self.starts_at.is_none() {
                self.starts_at = Some(now);
            }
        }

        if next == ExperimentStatus::Completed && self.ends_at.is_none() {
            self.ends_at = Some(now);
        }

        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Appends a variant with weight zero. Existing assignments are unaffected
    /// because a zero-width interval never shifts cumulative bucket bounds.
    pub fn propose_variant(
        &mut self,
        name: &str,
        price: Decimal,
        metadata: BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> Result<&Variant, DomainError> {
        if self.status == ExperimentStatus::Completed {
            return Err(DomainError::validation("cannot add variants to a completed experiment"));
        }

        let name = name.trim();
        if self.variant(name).is_some() {
            return Err(DomainError::validation(format!("duplicate variant name `{name}`")));
        }

        let variant = Variant { name: name.to_string(), price, weight: 0.0, metadata };
        validate_variant(&variant)?;
        self.variants.push(variant);
        self.updated_at = now;

        let index = self.variants.len() - 1;
        Ok(&self.variants[index])
    }

    pub fn set_variant_weight(
        &mut self,
        name: &str,
        weight: f64,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        if !weight.is_finite() || weight < 0.0 {
            return Err(DomainError::validation(format!(
                "variant weight must be a finite value >= 0, got {weight}"
            )));
        }

        let variant = self
            .variants
            .iter_mut()
            .find(|variant| variant.name == name)
            .ok_or_else(|| DomainError::not_found("variant", name))?;
        let previous = variant.weight;
        variant.weight = weight;

        if self.status == ExperimentStatus::Active && self.total_weight() <= 0.0 {
            if let Some(variant) = self.variants.iter_mut().find(|variant| variant.name == name) {
                variant.weight = previous;
            }
            return Err(DomainError::Configuration(
                "an active experiment must keep a positive total variant weight".to_string(),
            ));
        }

        self.updated_at = now;
        Ok(())
    }
}

fn validate_variant(variant: &Variant) -> Result<(), DomainError> {
    if variant.name.trim().is_empty() {
        return Err(DomainError::validation("variant name cannot be empty"));
    }
    if variant.price < Decimal::ZERO {
        return Err(DomainError::validation(format!(
            "variant `{}` price must be >= 0",
            variant.name
        )));
    }
    if !variant.weight.is_finite() || variant.weight < 0.0 {
        return Err(DomainError::validation(format!(
            "variant `{}` weight must be a finite value >= 0",
            variant.name
        )));
    }
    Ok(())
}
