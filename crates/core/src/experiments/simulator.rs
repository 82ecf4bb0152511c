//! Elasticity simulation over observed `(price, conversion rate)` pairs.

use serde::{Deserialize, Serialize};

/// Conversion rate assumed when no usable observations exist.
pub const BASELINE_CONVERSION_RATE: f64 = 0.05;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObservedPoint {
    pub price: f64,
    pub conversion_rate: f64,
}

impl ObservedPoint {
    pub fn new(price: f64, conversion_rate: f64) -> Self {
        Self { price, conversion_rate }
    }
}

/// Piecewise-linear price response built from observations.
///
/// Points are sorted by price ascending. When several points share a price the
/// first one supplied wins and later duplicates are discarded. Non-finite
/// points are dropped.
#[derive(Clone, Debug, PartialEq)]
pub struct PriceCurve {
    points: Vec<ObservedPoint>,
}

impl PriceCurve {
    pub fn new(observed: &[ObservedPoint]) -> Self {
        let mut points: Vec<ObservedPoint> = observed
            .iter()
            .copied()
            .filter(|point| point.price.is_finite() && point.conversion_rate.is_finite())
            .collect();
        // stable: equal prices keep input order
        points.sort_by(|left, right| left.price.total_cmp(&right.price));
        points.dedup_by(|later, earlier| later.price == earlier.price);

        Self { points }
    }

    pub fn points(&self) -> &[ObservedPoint] {
        &self.points
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn estimate(&self, candidate_price: f64) -> f64 {
        let (Some(first), Some(last)) = (self.points.first(), self.points.last()) else {
            return BASELINE_CONVERSION_RATE;
        };

        if candidate_price <= first.price {
            return first.conversion_rate;
        }
        if candidate_price >= last.price {
            return last.conversion_rate;
        }

        for pair in self.points.windows(2) {
            let (lower, upper) = (pair[0], pair[1]);
            if candidate_price <= upper.price {
                let span = upper.price - lower.price;
                let ratio = (candidate_price - lower.price) / span;
                return lower.conversion_rate
                    + ratio * (upper.conversion_rate - lower.conversion_rate);
            }
        }

        last.conversion_rate
    }
}

pub fn estimate_conversion_rate(observed: &[ObservedPoint], candidate_price: f64) -> f64 {
    PriceCurve::new(observed).estimate(candidate_price)
}

pub fn expected_revenue(price: f64, conversion_rate: f64, assumed_traffic: u64) -> f64 {
    price * conversion_rate * assumed_traffic as f64
}

#[cfg(test)]
mod tests {
    use super::{
        estimate_conversion_rate, expected_revenue, ObservedPoint, PriceCurve,
        BASELINE_CONVERSION_RATE,
    };

    fn approx(left: f64, right: f64) -> bool {
        (left - right).abs() < 1e-9
    }

    #[test]
    fn interpolates_inside_and_extrapolates_flat_outside() {
        let points = [ObservedPoint::new(20.0, 0.10), ObservedPoint::new(40.0, 0.05)];

        assert!(approx(estimate_conversion_rate(&points, 10.0), 0.10));
        assert!(approx(estimate_conversion_rate(&points, 30.0), 0.075));
        assert!(approx(estimate_conversion_rate(&points, 50.0), 0.05));
        assert!(approx(estimate_conversion_rate(&points, 20.0), 0.10));
        assert!(approx(estimate_conversion_rate(&points, 40.0), 0.05));
    }

    #[test]
    fn empty_observations_return_baseline() {
        assert_eq!(estimate_conversion_rate(&[], 25.0), BASELINE_CONVERSION_RATE);
    }

    #[test]
    fn unsorted_input_is_sorted_before_interpolation() {
        let points = [
            ObservedPoint::new(40.0, 0.05),
            ObservedPoint::new(10.0, 0.20),
            ObservedPoint::new(20.0, 0.10),
        ];
        let curve = PriceCurve::new(&points);

        let prices: Vec<f64> = curve.points().iter().map(|point| point.price).collect();
        assert_eq!(prices, vec![10.0, 20.0, 40.0]);
        assert!(approx(curve.estimate(15.0), 0.15));
    }

    #[test]
    fn duplicate_prices_keep_the_first_observed_pair() {
        let points = [
            ObservedPoint::new(30.0, 0.08),
            ObservedPoint::new(10.0, 0.20),
            ObservedPoint::new(30.0, 0.50),
        ];
        let curve = PriceCurve::new(&points);

        assert_eq!(curve.points().len(), 2);
        assert!(approx(curve.estimate(30.0), 0.08));
        assert!(approx(curve.estimate(99.0), 0.08));
    }

    #[test]
    fn non_finite_points_are_ignored() {
        let points = [ObservedPoint::new(f64::NAN, 0.2), ObservedPoint::new(25.0, f64::INFINITY)];
        let curve = PriceCurve::new(&points);

        assert!(curve.is_empty());
        assert_eq!(curve.estimate(25.0), BASELINE_CONVERSION_RATE);
    }

    #[test]
    fn expected_revenue_multiplies_price_rate_and_traffic() {
        assert!(approx(expected_revenue(30.0, 0.08, 1000), 2400.0));
        assert!(approx(expected_revenue(20.0, 0.15, 1000), 3000.0));
        assert_eq!(expected_revenue(20.0, 0.15, 0), 0.0);
    }
}
