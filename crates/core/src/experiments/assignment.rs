//! Deterministic variant bucketing.
//!
//! A user's bucket is derived from a SHA-256 digest of the experiment id and
//! user id, so the same inputs always land in the same variant without
//! consulting storage. Variants are ordered by name before cumulative weight
//! intervals are laid out, which makes the result independent of the order in
//! which the caller lists them.

use sha2::{Digest, Sha256};

use crate::domain::experiment::{ExperimentId, Variant};
use crate::errors::DomainError;

const KEY_SEPARATOR: u8 = b':';

/// Returns the name of the variant whose cumulative weight interval contains
/// the user's hash point. Zero-weight variants take part in ordering but own a
/// zero-width interval and are never chosen.
pub fn assign_variant(
    experiment_id: &ExperimentId,
    user_id: &str,
    variants: &[Variant],
) -> Result<String, DomainError> {
    if variants.is_empty() {
        return Err(DomainError::Configuration(format!(
            "experiment {experiment_id} has no variants to assign"
        )));
    }

    for variant in variants {
        if !variant.weight.is_finite() || variant.weight < 0.0 {
            return Err(DomainError::validation(format!(
                "variant `{}` weight must be a finite value >= 0",
                variant.name
            )));
        }
    }

    let mut ordered: Vec<&Variant> = variants.iter().collect();
    ordered.sort_by(|left, right| left.name.cmp(&right.name));

    let total_weight: f64 = ordered.iter().map(|variant| variant.weight).sum();
    if total_weight <= 0.0 {
        return Err(DomainError::Configuration(format!(
            "experiment {experiment_id} has a zero total variant weight"
        )));
    }

    let point = unit_interval_point(experiment_id, user_id) * total_weight;

    let mut cumulative = 0.0;
    for variant in &ordered {
        cumulative += variant.weight;
        if variant.weight > 0.0 && point < cumulative {
            return Ok(variant.name.clone());
        }
    }

    // Floating-point summation can leave `point` a hair above the final bound.
    ordered
        .iter()
        .rev()
        .find(|variant| variant.weight > 0.0)
        .map(|variant| variant.name.clone())
        .ok_or_else(|| {
            DomainError::Configuration(format!(
                "experiment {experiment_id} has no positively weighted variant"
            ))
        })
}

/// Maps `(experiment_id, user_id)` onto `[0, 1)` using the top 53 bits of the
/// digest so the conversion to `f64` is exact.
pub fn unit_interval_point(experiment_id: &ExperimentId, user_id: &str) -> f64 {
    let mut hasher = Sha256::new();
    hasher.update(experiment_id.0.as_bytes());
    hasher.update([KEY_SEPARATOR]);
    hasher.update(user_id.as_bytes());
    let digest = hasher.finalize();

    let mut prefix = [0_u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let bits = u64::from_be_bytes(prefix) >> 11;

    bits as f64 / (1_u64 << 53) as f64
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use rust_decimal::Decimal;

    use super::{assign_variant, unit_interval_point};
    use crate::domain::experiment::{ExperimentId, Variant};
    use crate::errors::DomainError;

    fn variant(name: &str, weight: f64) -> Variant {
        Variant::new(name, Decimal::new(2999, 2), weight)
    }

    fn experiment_id() -> ExperimentId {
        ExperimentId("exp-pricing-001".to_string())
    }

    #[test]
    fn assignment_is_deterministic_across_repeated_calls() {
        let variants = vec![variant("control", 1.0), variant("higher", 1.0)];
        let first = assign_variant(&experiment_id(), "user-42", &variants).expect("assign");

        for _ in 0..1_000 {
            let again = assign_variant(&experiment_id(), "user-42", &variants).expect("assign");
            assert_eq!(again, first);
        }
    }

    #[test]
    fn fifty_fifty_split_stays_within_tolerance() {
        let variants = vec![variant("control", 50.0), variant("treatment", 50.0)];
        let mut counts: HashMap<String, u32> = HashMap::new();
        let samples = 100_000;

        for index in 0..samples {
            let user_id = format!("synthetic-user-{index}");
            let name = assign_variant(&experiment_id(), &user_id, &variants).expect("assign");
            *counts.entry(name).or_default() += 1;
        }

        for name in ["control", "treatment"] {
            let share = f64::from(counts.get(name).copied().unwrap_or(0)) / f64::from(samples);
            assert!((0.48..=0.52).contains(&share), "{name} share {share} outside 48-52%");
        }
    }

    #[test]
    fn permuting_variant_order_does_not_change_assignment() {
        let forward = vec![variant("a", 1.0), variant("b", 2.0), variant("c", 3.0)];
        let backward = vec![variant("c", 3.0), variant("a", 1.0), variant("b", 2.0)];

        for index in 0..2_000 {
            let user = format!("user-{index}");
            assert_eq!(
                assign_variant(&experiment_id(), &user, &forward).expect("forward"),
                assign_variant(&experiment_id(), &user, &backward).expect("backward"),
            );
        }
    }

    #[test]
    fn zero_weight_variant_is_never_chosen_and_does_not_shift_others() {
        let base = vec![variant("control", 1.0), variant("higher", 1.0)];
        let with_proposal =
            vec![variant("control", 1.0), variant("higher", 1.0), variant("deluxe", 0.0)];

        for index in 0..5_000 {
            let user = format!("user-{index}");
            let before = assign_variant(&experiment_id(), &user, &base).expect("base");
            let after = assign_variant(&experiment_id(), &user, &with_proposal).expect("proposal");
            assert_ne!(after, "deluxe");
            assert_eq!(before, after);
        }
    }

    #[test]
    fn degenerate_weight_sets_are_configuration_errors() {
        assert!(matches!(
            assign_variant(&experiment_id(), "user-1", &[]),
            Err(DomainError::Configuration(_))
        ));
        assert!(matches!(
            assign_variant(&experiment_id(), "user-1", &[variant("a", 0.0), variant("b", 0.0)]),
            Err(DomainError::Configuration(_))
        ));
        assert!(matches!(
            assign_variant(&experiment_id(), "user-1", &[variant("a", -1.0), variant("b", 2.0)]),
            Err(DomainError::Validation(_))
        ));
    }

    #[test]
    fn unit_interval_point_is_in_range_and_keyed_by_both_ids() {
        let id = experiment_id();
        for index in 0..1_000 {
            let point = unit_interval_point(&id, &format!("u{index}"));
            assert!((0.0..1.0).contains(&point));
        }
        assert_ne!(
            unit_interval_point(&id, "user-1"),
            unit_interval_point(&ExperimentId("exp-other".to_string()), "user-1")
        );
    }
}
