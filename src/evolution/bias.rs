//! The load bias vector: one weight per reviewer role.
//!
//! ## Guarantees
//! - Every constructed vector has four finite, non-negative weights summing to 1
//! - The equal vector is exactly `0.25` per role, so it aggregates identically
//!   to the fallback used when no persisted vector exists
//! - Serialises as the flat `name -> weight` mapping used in the persisted record

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::review::ReviewerRole;

/// A flat weight mapping could not be turned into a vector.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("invalid load bias mapping: {0}")]
pub struct InvalidBias(pub String);

/// Reviewer weights applied during coherence aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, f64>", into = "BTreeMap<String, f64>")]
pub struct LoadBiasVector {
    weights: [f64; 4],
}

impl LoadBiasVector {
    /// `0.25` for every role.
    pub const EQUAL: LoadBiasVector = LoadBiasVector {
        weights: [0.25; 4],
    };

    /// The equal-weight vector.
    pub fn equal() -> Self {
        Self::EQUAL
    }

    /// Build a vector from raw weights in [`ReviewerRole::ALL`] order.
    ///
    /// Negative and non-finite entries count as zero. The result is
    /// renormalised to sum to 1; an all-zero input yields the equal vector.
    pub fn from_weights(raw: [f64; 4]) -> Self {
        let cleaned = raw.map(|w| if w.is_finite() && w > 0.0 { w } else { 0.0 });
        let sum: f64 = cleaned.iter().sum();
        if sum <= f64::EPSILON {
            return Self::EQUAL;
        }
        Self {
            weights: cleaned.map(|w| w / sum),
        }
    }

    /// Squeeze every weight into `[floor, 1 - 3 * floor]` while keeping the sum at 1.
    ///
    /// Each weight becomes `floor + (1 - 4 * floor) * w`. A floor outside
    /// `[0, 0.25]` is clamped into that range.
    pub fn with_floor(self, floor: f64) -> Self {
        let floor = if floor.is_finite() { floor.clamp(0.0, 0.25) } else { 0.0 };
        let span = 1.0 - 4.0 * floor;
        Self {
            weights: self.weights.map(|w| floor + span * w),
        }
    }

    /// Weight for `role`.
    pub fn weight(&self, role: ReviewerRole) -> f64 {
        self.weights[role.index()]
    }

    /// Weights in [`ReviewerRole::ALL`] order.
    pub fn weights(&self) -> [f64; 4] {
        self.weights
    }

    /// Largest absolute per-role difference to `other`.
    pub fn max_difference(&self, other: &LoadBiasVector) -> f64 {
        self.weights
            .iter()
            .zip(other.weights.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max)
    }

    /// Flat `role name -> weight` mapping.
    pub fn to_map(&self) -> BTreeMap<String, f64> {
        ReviewerRole::ALL
            .iter()
            .map(|r| (r.name().to_string(), self.weight(*r)))
            .collect()
    }

    /// Parse a flat mapping. All four role names must be present, no other
    /// names are allowed, and every value must be finite and non-negative
    /// with a positive sum.
    pub fn from_map(map: &BTreeMap<String, f64>) -> Result<Self, InvalidBias> {
        if let Some(unknown) = map.keys().find(|k| ReviewerRole::from_name(k).is_none()) {
            return Err(InvalidBias(format!("unknown weight name '{unknown}'")));
        }
        let mut raw = [0.0; 4];
        for role in ReviewerRole::ALL {
            let value = map
                .get(role.name())
                .copied()
                .ok_or_else(|| InvalidBias(format!("missing weight '{}'", role.name())))?;
            if !value.is_finite() || value < 0.0 {
                return Err(InvalidBias(format!(
                    "weight '{}' must be finite and non-negative, got {value}",
                    role.name()
                )));
            }
            raw[role.index()] = value;
        }
        if raw.iter().sum::<f64>() <= f64::EPSILON {
            return Err(InvalidBias("weights sum to zero".to_string()));
        }
        Ok(Self::from_weights(raw))
    }
}

impl Default for LoadBiasVector {
    fn default() -> Self {
        Self::EQUAL
    }
}

impl TryFrom<BTreeMap<String, f64>> for LoadBiasVector {
    type Error = InvalidBias;

    fn try_from(map: BTreeMap<String, f64>) -> Result<Self, Self::Error> {
        Self::from_map(&map)
    }
}

impl From<LoadBiasVector> for BTreeMap<String, f64> {
    fn from(v: LoadBiasVector) -> Self {
        v.to_map()
    }
}

impl fmt::Display for LoadBiasVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = ReviewerRole::ALL
            .iter()
            .map(|r| format!("{}={:.3}", r.name(), self.weight(*r)))
            .collect();
        write!(f, "[{}]", parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sum(v: &LoadBiasVector) -> f64 {
        v.weights().iter().sum()
    }

    #[test]
    fn test_equal_is_quarter_each() {
        let v = LoadBiasVector::equal();
        for role in ReviewerRole::ALL {
            assert_eq!(v.weight(role), 0.25);
        }
        assert_eq!(LoadBiasVector::default(), v);
    }

    #[test]
    fn test_from_weights_normalises() {
        let v = LoadBiasVector::from_weights([2.0, 1.0, 1.0, 0.0]);
        assert!((v.weight(ReviewerRole::Control) - 0.5).abs() < 1e-12);
        assert!((sum(&v) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_from_weights_equal_input_is_exactly_equal() {
        assert_eq!(LoadBiasVector::from_weights([0.25; 4]), LoadBiasVector::EQUAL);
    }

    #[test]
    fn test_from_weights_all_invalid_falls_back_to_equal() {
        let v = LoadBiasVector::from_weights([f64::NAN, -1.0, 0.0, f64::INFINITY]);
        assert_eq!(v, LoadBiasVector::EQUAL);
    }

    #[test]
    fn test_with_floor_keeps_sum_and_minimum() {
        let v = LoadBiasVector::from_weights([1.0, 0.0, 0.0, 0.0]).with_floor(0.05);
        assert!((sum(&v) - 1.0).abs() < 1e-12);
        assert!(v.weights().iter().all(|w| *w >= 0.05 - 1e-12));
        assert!((v.weight(ReviewerRole::Control) - 0.85).abs() < 1e-12);
    }

    #[test]
    fn test_with_floor_is_identity_on_equal() {
        let v = LoadBiasVector::EQUAL.with_floor(0.1);
        for w in v.weights() {
            assert!((w - 0.25).abs() < 1e-12);
        }
    }

    #[test]
    fn test_map_round_trip_preserves_weights() {
        let v = LoadBiasVector::from_weights([0.4, 0.3, 0.2, 0.1]);
        let back = LoadBiasVector::from_map(&v.to_map()).expect("test: from_map");
        assert!(v.max_difference(&back) < 1e-12);
    }

    #[test]
    fn test_from_map_rejects_missing_unknown_and_negative() {
        let mut map = LoadBiasVector::EQUAL.to_map();
        map.remove("logic");
        assert!(LoadBiasVector::from_map(&map).is_err());

        let mut map = LoadBiasVector::EQUAL.to_map();
        map.insert("temperature".into(), 0.7);
        assert!(LoadBiasVector::from_map(&map).is_err());

        let mut map = LoadBiasVector::EQUAL.to_map();
        map.insert("control".into(), -0.1);
        assert!(LoadBiasVector::from_map(&map).is_err());
    }

    #[test]
    fn test_serde_uses_flat_mapping() {
        let json = serde_json::to_value(LoadBiasVector::EQUAL).expect("test: serialize");
        assert_eq!(json["security_audit"], serde_json::json!(0.25));

        let bad = serde_json::json!({ "control": 1.0 });
        assert!(serde_json::from_value::<LoadBiasVector>(bad).is_err());
    }

    #[test]
    fn test_display_lists_roles() {
        let s = LoadBiasVector::EQUAL.to_string();
        assert!(s.contains("control=0.250"));
        assert!(s.contains("data_integrity=0.250"));
    }
}
